// kernel/src/mem/layout.rs
//
// Compile-time layout constants for the physical-memory core. Centralized
// here rather than threaded through call sites, the way the rest of this
// codebase keeps its boot-time constants in one place.

/// Size of a regular physical frame / virtual page.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Size of a huge (2 MiB) page, mapped directly at the PD level.
pub const HPAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Buddy order of a huge page: 2^9 * PAGE_SIZE == HPAGE_SIZE.
pub const HUGE_ORDER: usize = 9;

/// Number of 64-bit entries in one page table of any level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Highest buddy order plus one. Chunks of order MAX_ORDER - 1 are the
/// largest the allocator ever produces (2^18 frames == 1 GiB here), well
/// above HUGE_ORDER so huge-page requests are always representable.
pub const MAX_ORDER: usize = 19;

/// Per-level address spans, in bytes, matching the "Spans" table in the
/// walker's design: PT = 4 KiB, PD = 2 MiB, PDPT = 1 GiB, PML4 = 512 GiB.
pub const PTE_SPAN: u64 = PAGE_SIZE;
pub const PDE_SPAN: u64 = ENTRIES_PER_TABLE as u64 * PTE_SPAN;
pub const PDPTE_SPAN: u64 = ENTRIES_PER_TABLE as u64 * PDE_SPAN;
pub const PML4E_SPAN: u64 = ENTRIES_PER_TABLE as u64 * PDPTE_SPAN;

/// Boundary below which the frame registry and the initial kernel mappings
/// are bootstrapped using only the first memory-map pass (see mem::init).
pub const BOOT_MAP_LIM: u64 = 8 * 1024 * 1024;

/// Higher-half kernel virtual base, where the kernel image is linked.
pub const KERNEL_VMA: u64 = 0xFFFF_FFFF_8000_0000;

/// Canonical boundary between the user and kernel halves of the address
/// space (bit 47). Addresses at or above this are sign-extended.
pub const USER_LIM: u64 = 0x0000_8000_0000_0000;

/// One past the top of the 64-bit canonical address space — the upper
/// bound `all_pages`/`kernel_pages` walk up to, the way `USER_LIM` bounds
/// `user_pages`. `2^64` wraps to 0 in a `u64`; `KERNEL_LIM.wrapping_sub(1)`
/// recovers the true top address (`u64::MAX`) the same way `USER_LIM - 1`
/// recovers the top of the user half.
pub const KERNEL_LIM: u64 = 0;

/// Kernel virtual base at which the whole of physical memory is mapped
/// 1:1 for the registry, page tables, and any other physical access.
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;
