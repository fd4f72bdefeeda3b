// kernel/src/mem/mod.rs
//
// Component surface for the physical-memory core: frame registry, buddy
// allocator, page-table walker, mapping primitives, and the boot-time
// initialization sequence that wires them together. Everything a caller
// outside this module needs is re-exported here.

pub mod buddy;
pub mod cpu;
pub mod elf;
pub mod error;
pub mod frame;
pub mod init;
pub mod layout;
pub mod mapping;
pub mod pte;
pub mod walk;

pub use buddy::{count_total_free_pages, page_alloc, page_decref, page_free, show_buddy_info, AllocFlags};
pub use error::MemError;
pub use init::{mem_init, MemInit};
pub use mapping::{boot_map_region, insert, ptbl_alloc, ptbl_free, ptbl_merge, ptbl_split};
pub use pte::PteFlags;
pub use walk::{walk_all_pages, walk_kernel_pages, walk_page_range, walk_user_pages, PageTableVisitor};
