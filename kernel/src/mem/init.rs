// kernel/src/mem/init.rs
//
// Component E: memory-map initialization. Seeds the frame registry and the
// buddy free lists from the bootloader's memory map in the same two-phase
// order as `mem_init`/`page_init`/`page_init_ext` in init.c: a first pass
// below `BOOT_MAP_LIM` before the kernel's own PML4 is live, then a second,
// "extended" pass once paging has switched over. `bootloader_api` already
// excludes the bootloader, the boot-info frame and the kernel image itself
// from `MemoryRegionKind::Usable`, so the manual reserved-range bookkeeping
// the original performs by hand (address 0, the boot-info frame, the ELF
// header frame, `[KERNEL_LMA, kernel_end)`) is the collaborator's job here,
// not this core's — see DESIGN.md.

use core::mem::size_of;

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};

use super::buddy::{AllocFlags, BuddyAllocator, BUDDY};
use super::cpu;
use super::elf;
use super::error::MemError;
use super::frame::{BumpAlloc, FrameInfo, Registry};
use super::layout::{BOOT_MAP_LIM, KERNEL_VMA, PAGE_SIZE};
use super::mapping::boot_map_region;
use super::pte::{align_down, align_up, PteFlags};

/// Inputs `mem_init` needs from the bootloader handoff. A thin, owned
/// subset of `bootloader_api::BootInfo` so the initialization sequence
/// doesn't need the `'static mut` borrow of the whole struct. `memory_regions`
/// is a plain slice rather than the bootloader's own `MemoryRegions` wrapper
/// so this whole sequence stays testable against a hand-built map.
pub struct BootHandoff<'a> {
    pub memory_regions: &'a [MemoryRegion],
    pub phys_map_base: u64,
    /// The kernel's own ELF image, as handed back to us by the bootloader
    /// (`BootInfo::kernel_addr`/`kernel_len`), readable through
    /// `phys_map_base`.
    pub kernel_elf: &'a [u8],
}

/// Results of `mem_init` that the boot binary needs afterward: the address
/// space it should load and the offset at which all physical memory is
/// mapped (so later code can keep dereferencing frames through it).
pub struct MemInit {
    pub pml4_pa: u64,
    pub phys_map_base: u64,
}

fn region_len(region: &MemoryRegion) -> u64 {
    region.end.saturating_sub(region.start)
}

/// Frees every frame-aligned page of `[start, end)` that lies within
/// `region`, via `buddy.add_region` (spec 4.B's "free as publish" overload —
/// see DESIGN.md for why this core keeps, rather than replaces, that
/// overload).
fn free_clipped(buddy: &mut BuddyAllocator, region_start: u64, region_end: u64, clip_start: u64, clip_end: u64) {
    let start = region_start.max(clip_start);
    let end = region_end.min(clip_end);
    if start < end {
        buddy.add_region(start, end);
    }
}

/// Steps 3-6 of `mem_init`: picks the highest usable address below
/// `BOOT_MAP_LIM`, bump-allocates the frame registry out of the first usable
/// region large enough to hold it, builds the registry and the buddy
/// allocator over it, and runs the first free pass (every usable byte below
/// `BOOT_MAP_LIM`, minus the bytes just consumed for the registry itself).
/// Pulled out of `mem_init` because it is the one part of Component E that
/// needs nothing beyond `memory_regions` and `phys_map_base` to exercise.
fn init_registry_and_first_pass(memory_regions: &[MemoryRegion], phys_map_base: u64) -> Result<(BuddyAllocator, u64), MemError> {
    // Step 3: highest free address, clamped to BOOT_MAP_LIM.
    let highest_free = memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| r.end)
        .max()
        .unwrap_or(0);
    let clamped = highest_free.min(BOOT_MAP_LIM);
    let n_frames = (clamped / PAGE_SIZE) as usize;

    // Step 4: bump-allocate the registry out of the first usable region
    // that's large enough to hold it. Once `bump` goes out of scope at the
    // end of this function it is never touched again, matching the spec's
    // "illegal to call thereafter" rule for `boot_alloc`.
    let registry_bytes = n_frames * size_of::<FrameInfo>();
    let registry_region = memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .find(|r| region_len(r) >= registry_bytes as u64)
        .ok_or(MemError::OutOfMemory)?;
    let mut bump = BumpAlloc::new(registry_region.start, registry_region.end);
    let registry_pa = bump
        .alloc_bytes(registry_bytes as u64, size_of::<FrameInfo>() as u64)
        .ok_or(MemError::OutOfMemory)?;
    let registry_end_pa = registry_pa + registry_bytes as u64;

    // Step 5: construct the registry (clears every descriptor on the way).
    let registry_kva = (phys_map_base + registry_pa) as *mut FrameInfo;
    let frames: &'static mut [FrameInfo] = unsafe { core::slice::from_raw_parts_mut(registry_kva, n_frames) };
    let registry = Registry::from_static_slice(frames, phys_map_base);
    let mut buddy = BuddyAllocator::new(registry);

    // Step 6: first free pass, below BOOT_MAP_LIM, carving out the bytes
    // the bump allocator just consumed for the registry itself.
    for region in memory_regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
        free_clipped(&mut buddy, region.start, region.end.min(BOOT_MAP_LIM), 0, registry_pa);
        free_clipped(&mut buddy, region.start, region.end.min(BOOT_MAP_LIM), registry_end_pa, BOOT_MAP_LIM);
    }

    Ok((buddy, clamped))
}

/// Runs the full Component E + F sequence: parses the memory map, builds
/// the frame registry, performs the first buddy-free pass, stands up the
/// initial kernel PML4 and enables NX, maps the kernel image and identity
/// window, then performs the extended free pass over memory at or above
/// `BOOT_MAP_LIM`.
pub fn mem_init(boot: &BootHandoff<'_>) -> Result<MemInit, MemError> {
    let (mut buddy, clamped) = init_registry_and_first_pass(boot.memory_regions, boot.phys_map_base)?;

    // Step 7: initial kernel PML4. Held by a permanent reference (it is
    // never reached through any PTE, so nothing would otherwise keep its
    // `ref_count` above zero).
    let pml4_idx = buddy.alloc(AllocFlags::ZERO).ok_or(MemError::OutOfMemory)?;
    buddy.inc_ref(pml4_idx);
    let pml4_pa = buddy.registry().index_to_pa(pml4_idx);

    // Identity-map the first BOOT_MAP_LIM bytes of physical memory at the
    // kernel VMA window, RW + NO_EXEC, preferring huge pages (BOOT_MAP_LIM
    // is a multiple of HPAGE_SIZE).
    boot_map_region(
        &mut buddy,
        boot.phys_map_base,
        pml4_pa,
        KERNEL_VMA,
        0,
        align_up(BOOT_MAP_LIM, super::layout::HPAGE_SIZE),
        PteFlags::WRITE | PteFlags::NO_EXEC | PteFlags::HUGE,
    )?;

    // Map the kernel image's own loadable segments (Component F).
    elf::map_kernel_image(&mut buddy, boot.phys_map_base, pml4_pa, boot.kernel_elf)?;

    // Preserve the bootloader's physical-memory offset window across the
    // CR3 switch below: the registry and every page-table frame allocated
    // so far live inside `[0, clamped)`, and both the registry (Component A)
    // and the walker (Component C) keep dereferencing frames through
    // `phys_map_base` afterward. Without this, the switch to our own PML4
    // would immediately fault the first time either is touched.
    boot_map_region(
        &mut buddy,
        boot.phys_map_base,
        pml4_pa,
        boot.phys_map_base,
        0,
        align_up(clamped, PAGE_SIZE),
        PteFlags::WRITE | PteFlags::NO_EXEC,
    )?;

    // Enable NX and load the new PML4.
    unsafe {
        cpu::enable_nx();
        cpu::load_pml4(pml4_pa);
    }

    // Step 8: extended free pass, at or above BOOT_MAP_LIM.
    for region in boot.memory_regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
        free_clipped(&mut buddy, region.start, region.end, BOOT_MAP_LIM, u64::MAX);
    }

    // Step 9: registry re-basing. This core addressed the registry through
    // `phys_map_base` from the moment it was constructed, so there is no
    // stored link value to rewrite (see DESIGN.md, Open Question 3); the
    // call below is the explicit, unconditional re-basing step the spec
    // requires, even though in this implementation it is a no-op until the
    // kernel's own page tables grow a `PHYS_MAP_BASE` window distinct from
    // the bootloader's `phys_map_base`.
    buddy.registry_mut().rebase(boot.phys_map_base);

    *BUDDY.lock() = Some(buddy);

    Ok(MemInit {
        pml4_pa,
        phys_map_base: boot.phys_map_base,
    })
}

const _: () = assert!(align_down(BOOT_MAP_LIM, PAGE_SIZE) == BOOT_MAP_LIM);

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors the scenario an 8 MiB usable pool below `BOOT_MAP_LIM`
    /// produces: every page accounted for except the registry's own
    /// frame-aligned footprint. Starts the region at `PAGE_SIZE` rather than
    /// 0, the way the bootloader's own map reserves the null frame, without
    /// needing `mem_init` to carry separate reserved-frame-0 bookkeeping.
    #[test]
    fn first_pass_frees_every_page_outside_the_registrys_own_footprint() {
        const POOL_BYTES: u64 = BOOT_MAP_LIM;
        let backing: std::boxed::Box<[u8]> = vec![0u8; POOL_BYTES as usize].into_boxed_slice();
        let leaked: &'static mut [u8] = std::boxed::Box::leak(backing);
        let phys_map_base = leaked.as_mut_ptr() as u64;

        let regions = [MemoryRegion {
            start: PAGE_SIZE,
            end: POOL_BYTES,
            kind: MemoryRegionKind::Usable,
        }];

        let (buddy, clamped) = init_registry_and_first_pass(&regions, phys_map_base).unwrap();
        assert_eq!(clamped, POOL_BYTES);

        let registry_bytes = buddy.registry().len() * size_of::<FrameInfo>();
        let registry_pa = align_up(PAGE_SIZE, size_of::<FrameInfo>() as u64);
        let registry_end_pa = registry_pa + registry_bytes as u64;
        let reserved_end = align_up(registry_end_pa, PAGE_SIZE);

        let expected_free = (POOL_BYTES - reserved_end) / PAGE_SIZE;
        assert_eq!(buddy.total_free_pages() as u64, expected_free);
    }

    #[test]
    fn first_pass_fails_closed_with_no_usable_region_big_enough_for_the_registry() {
        let regions: [MemoryRegion; 0] = [];
        let result = init_registry_and_first_pass(&regions, 0);
        assert!(matches!(result, Err(MemError::OutOfMemory)));
    }
}
