// kernel/src/mem/buddy.rs
//
// Component B: the buddy allocator. Order-indexed free lists over the
// frame registry, split-on-alloc, coalesce-on-free. The global instance is
// a `Mutex<Option<BuddyAllocator>>` behind `lazy_static!`, following this
// codebase's existing convention for process-wide singletons that can't be
// const-initialized (see `FRAME_ALLOCATOR`/`PAGE_TABLE` in the allocator
// module this core replaces).

use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;

use super::frame::Registry;
use super::layout::{HUGE_ORDER, MAX_ORDER, PAGE_SIZE};
use super::pte::{align_down, align_up};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        const ZERO = 1 << 0;
        const HUGE = 1 << 1;
    }
}

/// Diagnostic for the double-free case (spec §7): report, don't corrupt
/// state, don't panic. Routed through the lock-free writer like every other
/// allocator diagnostic; a no-op under `cfg(test)` since the host test
/// binary has no COM1 port to write to.
#[cfg(not(test))]
fn warn_double_free(idx: usize) {
    crate::serial_print_raw!("buddy: double free of frame {}\n", idx);
}

#[cfg(test)]
fn warn_double_free(_idx: usize) {}

pub struct BuddyAllocator {
    registry: Registry,
    heads: [Option<u32>; MAX_ORDER],
}

impl BuddyAllocator {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            heads: [None; MAX_ORDER],
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Introduces every frame-aligned page in `[start_pa, end_pa)` to the
    /// allocator by freeing it. Used once per usable memory-map entry during
    /// `mem::init`; this overloads `free` as "publish", matching the boot
    /// path this core is grounded on (see DESIGN.md).
    pub fn add_region(&mut self, start_pa: u64, end_pa: u64) {
        let start = align_up(start_pa, PAGE_SIZE);
        let end = align_down(end_pa, PAGE_SIZE);
        let mut pa = start;
        while pa < end {
            let idx = self.registry.pa_to_index(pa);
            if idx < self.registry.len() {
                self.free(idx);
            }
            pa += PAGE_SIZE;
        }
    }

    pub fn count_free(&self, order: usize) -> usize {
        if order >= MAX_ORDER {
            return 0;
        }
        let mut n = 0;
        let mut cur = self.heads[order];
        while let Some(i) = cur {
            n += 1;
            cur = self.registry.get(i as usize).next;
        }
        n
    }

    /// Diagnostic total, in frames: `Σ_order count_free(order) * 2^order`.
    /// Sums `2^order` frames per chunk, not `order + 1` — see DESIGN.md for
    /// why the latter (the original's formula) is a bug, not a choice.
    pub fn total_free_pages(&self) -> usize {
        (0..MAX_ORDER)
            .map(|order| self.count_free(order) * (1usize << order))
            .sum()
    }

    pub fn show_buddy_info(&self) {
        crate::serial_print_raw!("Buddy allocator:\n");
        for order in 0..MAX_ORDER {
            let n = self.count_free(order);
            if n > 0 {
                crate::serial_print_raw!("  order #{} pages={}\n", order, n);
            }
        }
        let kib = (self.total_free_pages() as u64 * PAGE_SIZE) / 1024;
        crate::serial_print_raw!("  free: {} KiB\n", kib);
    }

    /// Find algorithm (spec 4.B): first-fit upward scan, then split down.
    fn find(&mut self, req_order: usize) -> Option<usize> {
        let mut order = req_order;
        while order < MAX_ORDER && self.heads[order].is_none() {
            order += 1;
        }
        if order == MAX_ORDER {
            return None;
        }
        let idx = self.registry.list_pop_tail(&mut self.heads[order])?;
        let idx = if order > req_order {
            self.split(idx, order, req_order)
        } else {
            idx
        };
        self.registry.get_mut(idx).free = false;
        Some(idx)
    }

    fn split(&mut self, idx: usize, mut order: usize, req_order: usize) -> usize {
        while order != req_order {
            order -= 1;
            let pa = self.registry.index_to_pa(idx);
            let buddy_pa = pa ^ ((1u64 << order) * PAGE_SIZE);
            let buddy_idx = self.registry.pa_to_index(buddy_pa);
            {
                let b = self.registry.get_mut(buddy_idx);
                b.order = order as u8;
                b.free = true;
            }
            self.registry.get_mut(idx).order = order as u8;
            self.registry.list_push_head(buddy_idx, &mut self.heads[order]);
        }
        idx
    }

    /// Merge algorithm (spec 4.B). Searches for `idx`'s buddy directly by
    /// address (the registry's dense indexing makes this O(1) where the
    /// original had to scan a free list for a matching physical address —
    /// see DESIGN.md).
    fn merge(&mut self, mut idx: usize) -> usize {
        self.registry.get_mut(idx).free = true;
        loop {
            let order = self.registry.get(idx).order as usize;
            if order >= MAX_ORDER - 1 {
                break;
            }
            let pa = self.registry.index_to_pa(idx);
            let buddy_pa = pa ^ ((1u64 << order) * PAGE_SIZE);
            let buddy_idx = self.registry.pa_to_index(buddy_pa);
            if buddy_idx >= self.registry.len() {
                break;
            }
            let buddy = self.registry.get(buddy_idx);
            if !(buddy.free && buddy.order as usize == order) {
                break;
            }
            self.registry.list_unlink(buddy_idx, &mut self.heads[order]);
            // `idx` is never linked into any list mid-merge; only the
            // surviving primary is pushed, once, after the loop.
            self.registry.get_mut(idx).free = false;
            self.registry.get_mut(buddy_idx).free = false;
            let primary = if pa < buddy_pa { idx } else { buddy_idx };
            self.registry.get_mut(primary).order = (order + 1) as u8;
            self.registry.get_mut(primary).free = true;
            idx = primary;
        }
        let order = self.registry.get(idx).order as usize;
        self.registry.list_push_head(idx, &mut self.heads[order]);
        idx
    }

    pub fn alloc(&mut self, flags: AllocFlags) -> Option<usize> {
        let order = if flags.contains(AllocFlags::HUGE) {
            HUGE_ORDER
        } else {
            0
        };
        let idx = self.find(order)?;
        self.registry.get_mut(idx).ref_count = 0;
        if flags.contains(AllocFlags::ZERO) {
            self.zero_frame(idx);
        }
        Some(idx)
    }

    /// Requires `ref_count == 0`; this is the programmer-error assertion
    /// from the error-handling design, not a recoverable condition. A
    /// double-free (the frame is already `free`) is diagnosed and skipped
    /// instead: merging it again would insert a second list entry for the
    /// same chunk and corrupt the free lists (spec §7, "never corrupt
    /// state").
    pub fn free(&mut self, idx: usize) {
        assert_eq!(
            self.registry.get(idx).ref_count,
            0,
            "page_free on a frame with nonzero ref_count"
        );
        if self.registry.get(idx).free {
            warn_double_free(idx);
            return;
        }
        self.merge(idx);
    }

    pub fn dec_ref(&mut self, idx: usize) {
        let f = self.registry.get_mut(idx);
        assert!(f.ref_count > 0, "dec_ref on a frame with ref_count == 0");
        f.ref_count -= 1;
        if f.ref_count == 0 {
            self.free(idx);
        }
    }

    pub fn inc_ref(&mut self, idx: usize) {
        self.registry.get_mut(idx).ref_count += 1;
    }

    #[cfg(not(test))]
    fn zero_frame(&self, idx: usize) {
        unsafe {
            let kva = self.registry.index_to_kva(idx) as *mut u8;
            core::ptr::write_bytes(kva, 0u8, PAGE_SIZE as usize);
        }
    }

    #[cfg(test)]
    fn zero_frame(&self, _idx: usize) {}
}

lazy_static! {
    pub static ref BUDDY: Mutex<Option<BuddyAllocator>> = Mutex::new(None);
}

pub fn page_alloc(flags: AllocFlags) -> Option<usize> {
    BUDDY
        .lock()
        .as_mut()
        .expect("buddy allocator not initialized")
        .alloc(flags)
}

pub fn page_free(idx: usize) {
    BUDDY
        .lock()
        .as_mut()
        .expect("buddy allocator not initialized")
        .free(idx)
}

pub fn page_decref(idx: usize) {
    BUDDY
        .lock()
        .as_mut()
        .expect("buddy allocator not initialized")
        .dec_ref(idx)
}

pub fn show_buddy_info() {
    BUDDY
        .lock()
        .as_ref()
        .expect("buddy allocator not initialized")
        .show_buddy_info()
}

pub fn count_total_free_pages() -> usize {
    BUDDY
        .lock()
        .as_ref()
        .expect("buddy allocator not initialized")
        .total_free_pages()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::frame::Registry;

    fn allocator(n_frames: usize) -> BuddyAllocator {
        let mut a = BuddyAllocator::new(Registry::new_for_test(n_frames));
        a.add_region(0, n_frames as u64 * PAGE_SIZE);
        a
    }

    #[test]
    fn total_free_pages_sums_two_pow_order_not_order_plus_one() {
        // A pool of exactly 4 frames, all free, should report 4 total free
        // pages regardless of how they ended up distributed across orders.
        let a = allocator(4);
        assert_eq!(a.total_free_pages(), 4);
    }

    #[test]
    fn alloc_exhausts_pool_then_returns_none() {
        let mut a = allocator(1024);
        let mut allocated = Vec::new();
        for _ in 0..1024 {
            allocated.push(a.alloc(AllocFlags::empty()).expect("pool not yet exhausted"));
        }
        assert!(a.alloc(AllocFlags::empty()).is_none());
        assert_eq!(a.total_free_pages(), 0);

        for idx in allocated.into_iter().rev() {
            a.free(idx);
        }
        // Freeing everything back in reverse order should fully coalesce.
        assert_eq!(a.total_free_pages(), 1024);
        assert_eq!(a.count_free(10), 1);
    }

    #[test]
    fn no_two_free_chunks_at_an_order_are_buddies() {
        let mut a = allocator(16);
        let d0 = a.alloc(AllocFlags::empty()).unwrap();
        let d1 = a.alloc(AllocFlags::empty()).unwrap();
        a.free(d0);
        a.free(d1);
        for order in 0..MAX_ORDER {
            let mut seen = Vec::new();
            let mut cur = a.heads[order];
            while let Some(i) = cur {
                let pa = a.registry().index_to_pa(i as usize);
                for &other in seen.iter() {
                    let buddy_pa = pa ^ ((1u64 << order) * PAGE_SIZE);
                    assert_ne!(other, buddy_pa, "two buddies left unmerged at order {order}");
                }
                seen.push(pa);
                cur = a.registry().get(i as usize).next;
            }
        }
    }

    #[test]
    fn round_trip_free_alloc_restores_free_list_counts() {
        let mut a = allocator(8);
        let before = (0..MAX_ORDER).map(|o| a.count_free(o)).collect::<Vec<_>>();
        let idx = a.alloc(AllocFlags::empty()).unwrap();
        a.free(idx);
        let after = (0..MAX_ORDER).map(|o| a.count_free(o)).collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn double_free_is_diagnosed_and_skipped_not_corrupting_free_lists() {
        let mut a = allocator(8);
        let idx = a.alloc(AllocFlags::empty()).unwrap();
        a.free(idx);
        let before = (0..MAX_ORDER).map(|o| a.count_free(o)).collect::<Vec<_>>();
        // idx is already free; a second free() must not insert it again.
        a.free(idx);
        let after = (0..MAX_ORDER).map(|o| a.count_free(o)).collect::<Vec<_>>();
        assert_eq!(before, after);
        assert_eq!(a.total_free_pages(), 8);
    }

    #[test]
    fn freeing_three_consecutive_buddies_merges_to_order_three() {
        // A pool of exactly 8 frames: draining it with four order-0 allocs
        // and freeing them in an order that lets each merge step happen
        // (0 with 1, then the resulting pair with 2-3, ...) should produce
        // a single order-3 chunk whose primary is frame 0.
        let mut a = allocator(8);
        let mut ds = Vec::new();
        for _ in 0..8 {
            ds.push(a.alloc(AllocFlags::empty()).unwrap());
        }
        for &idx in &ds {
            a.free(idx);
        }
        assert_eq!(a.count_free(3), 1);
        let head = a.heads[3].unwrap() as usize;
        assert_eq!(a.registry().index_to_pa(head), 0);
    }

    #[test]
    fn huge_alloc_returns_order_nine_chunk() {
        let mut a = allocator(1024);
        let idx = a.alloc(AllocFlags::HUGE).expect("1024 frames is exactly one huge page");
        assert_eq!(a.registry().get(idx).order as usize, HUGE_ORDER);
        assert!(a.alloc(AllocFlags::HUGE).is_none());
    }
}
