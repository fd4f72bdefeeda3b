// kernel/src/mem/walk.rs
//
// The page-table walker. Recurses PML4 -> PDPT -> PD -> PT over a virtual
// address range, invoking callbacks at each level and at each gap. The
// original passed a bag of function pointers plus a `void *udata` down
// through four mutually-recursive functions; here that becomes a single
// trait with default no-op methods, so a caller only overrides the handful
// of entry points it actually needs and carries its own state in `self`.

use super::error::MemError;
use super::layout::{ENTRIES_PER_TABLE, PDE_SPAN, PDPTE_SPAN, PML4E_SPAN, PTE_SPAN};
use super::pte::{is_huge, is_present, level_end, page_addr, pd_index, pdpt_index, pml4_index, pt_index};

/// A table frame viewed as 512 raw 64-bit entries, addressed through the
/// kernel's physical map.
pub type RawTable = [u64; ENTRIES_PER_TABLE];

/// Callbacks the walker invokes while descending. Every method defaults to
/// a no-op so implementors only override what they need. `*_post` methods
/// run after a level's children have been visited, letting a caller (e.g.
/// `ptbl_merge`) act once a subtree is known to be fully processed.
pub trait PageTableVisitor {
    fn pml4e(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    fn pml4e_post(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    fn pdpte(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    fn pdpte_post(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    fn pde(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    fn pde_post(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    fn pte(&mut self, _index: usize, _va: u64, _entry: &mut u64) -> Result<(), MemError> {
        Ok(())
    }
    /// Called instead of the level-specific method whenever an entry along
    /// the path is not present. `span` is the size of the gap at that level.
    fn hole(&mut self, _va: u64, _span: u64) -> Result<(), MemError> {
        Ok(())
    }
}

/// Views the table frame at physical address `pa` as a mutable array of
/// entries, through the identity physical map at `phys_map_base`.
///
/// # Safety
/// `pa` must be the address of a live, `ENTRIES_PER_TABLE`-entry page table
/// frame, and no other live reference to the same frame may exist.
pub unsafe fn table_at_mut(phys_map_base: u64, pa: u64) -> &'static mut RawTable {
    let ptr = (phys_map_base + pa) as *mut RawTable;
    &mut *ptr
}

fn pt_walk_range<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    table_pa: u64,
    start: u64,
    end: u64,
) -> Result<(), MemError> {
    let table = unsafe { table_at_mut(phys_map_base, table_pa) };
    let mut va = start;
    loop {
        let idx = pt_index(va);
        let seg_end = level_end(va, PTE_SPAN).min(end);
        if is_present(table[idx]) {
            v.pte(idx, va, &mut table[idx])?;
        } else {
            v.hole(va, PTE_SPAN)?;
        }
        if seg_end >= end {
            break;
        }
        va = seg_end + 1;
    }
    Ok(())
}

fn pd_walk_range<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    table_pa: u64,
    start: u64,
    end: u64,
) -> Result<(), MemError> {
    let table = unsafe { table_at_mut(phys_map_base, table_pa) };
    let mut va = start;
    loop {
        let idx = pd_index(va);
        let seg_end = level_end(va, PDE_SPAN).min(end);
        if is_present(table[idx]) {
            v.pde(idx, va, &mut table[idx])?;
            if !is_huge(table[idx]) {
                let child_pa = page_addr(table[idx]);
                pt_walk_range(v, phys_map_base, child_pa, va, seg_end)?;
            }
            v.pde_post(idx, va, &mut table[idx])?;
        } else {
            v.hole(va, PDE_SPAN)?;
        }
        if seg_end >= end {
            break;
        }
        va = seg_end + 1;
    }
    Ok(())
}

fn pdpt_walk_range<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    table_pa: u64,
    start: u64,
    end: u64,
) -> Result<(), MemError> {
    let table = unsafe { table_at_mut(phys_map_base, table_pa) };
    let mut va = start;
    loop {
        let idx = pdpt_index(va);
        let seg_end = level_end(va, PDPTE_SPAN).min(end);
        if is_present(table[idx]) {
            v.pdpte(idx, va, &mut table[idx])?;
            let child_pa = page_addr(table[idx]);
            pd_walk_range(v, phys_map_base, child_pa, va, seg_end)?;
            v.pdpte_post(idx, va, &mut table[idx])?;
        } else {
            v.hole(va, PDPTE_SPAN)?;
        }
        if seg_end >= end {
            break;
        }
        va = seg_end + 1;
    }
    Ok(())
}

fn pml4_walk_range<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    table_pa: u64,
    start: u64,
    end: u64,
) -> Result<(), MemError> {
    let table = unsafe { table_at_mut(phys_map_base, table_pa) };
    let mut va = start;
    loop {
        let idx = pml4_index(va);
        let seg_end = level_end(va, PML4E_SPAN).min(end);
        if is_present(table[idx]) {
            v.pml4e(idx, va, &mut table[idx])?;
            let child_pa = page_addr(table[idx]);
            pdpt_walk_range(v, phys_map_base, child_pa, va, seg_end)?;
            v.pml4e_post(idx, va, &mut table[idx])?;
        } else {
            v.hole(va, PML4E_SPAN)?;
        }
        if seg_end >= end {
            break;
        }
        va = seg_end + 1;
    }
    Ok(())
}

/// Walks `[start, end]` (inclusive) of the address space rooted at `pml4_pa`,
/// invoking `v`'s callbacks along the way.
pub fn walk_page_range<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    pml4_pa: u64,
    start: u64,
    end: u64,
) -> Result<(), MemError> {
    pml4_walk_range(v, phys_map_base, pml4_pa, start, end)
}

pub fn walk_all_pages<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    pml4_pa: u64,
) -> Result<(), MemError> {
    walk_page_range(
        v,
        phys_map_base,
        pml4_pa,
        0,
        super::layout::KERNEL_LIM.wrapping_sub(1),
    )
}

pub fn walk_user_pages<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    pml4_pa: u64,
) -> Result<(), MemError> {
    walk_page_range(v, phys_map_base, pml4_pa, 0, super::layout::USER_LIM - 1)
}

pub fn walk_kernel_pages<V: PageTableVisitor>(
    v: &mut V,
    phys_map_base: u64,
    pml4_pa: u64,
) -> Result<(), MemError> {
    walk_page_range(
        v,
        phys_map_base,
        pml4_pa,
        super::layout::KERNEL_VMA,
        super::layout::KERNEL_LIM.wrapping_sub(1),
    )
}
