// kernel/src/mem/mapping.rs
//
// Mapping primitives built on top of the buddy allocator and the raw page
// table layout: installing a single translation, bulk-mapping a contiguous
// physical range during boot, and promoting/demoting between a 2 MiB
// mapping and 512 4 KiB ones. Grounded in insert.c, map.c and ptbl.c, with
// one deliberate departure from all three: wherever the originals walk a
// table's 512 entries, they do it through the registry's phys-to-virt
// mapping rather than treating `entry[i]` itself as a dereferenceable
// physical address (see DESIGN.md).

use super::buddy::{AllocFlags, BuddyAllocator};
use super::cpu::invalidate_tlb;
use super::error::MemError;
use super::layout::{ENTRIES_PER_TABLE, HPAGE_SIZE, PAGE_SIZE};
use super::pte::{is_huge, is_present, make_entry, page_addr, pd_index, pdpt_index, pml4_index, pt_index, PteFlags};
use super::walk::{table_at_mut, RawTable};

/// Allocates and zeroes a single frame for use as an empty page table.
pub fn ptbl_alloc(buddy: &mut BuddyAllocator) -> Result<usize, MemError> {
    buddy.alloc(AllocFlags::ZERO).ok_or(MemError::OutOfMemory)
}

/// Reclaims a now-empty page table. No-op unless every one of its 512
/// entries is absent (spec 4.D: "If all child entries are absent, release
/// the page-table frame and clear `*entry`"). Takes the parent slot that
/// points at the table so it can be cleared once the table frame is
/// released; a table with any present child is left untouched.
pub fn ptbl_free(buddy: &mut BuddyAllocator, phys_map_base: u64, entry: &mut u64) {
    if !is_present(*entry) {
        return;
    }
    let table_pa = page_addr(*entry);
    let all_absent = {
        let table = unsafe { table_at_mut(phys_map_base, table_pa) };
        table.iter().all(|slot| !is_present(*slot))
    };
    if !all_absent {
        return;
    }
    let table_idx = buddy.registry().pa_to_index(table_pa);
    buddy.dec_ref(table_idx);
    *entry = 0;
}

/// Returns the physical address of the child table reached through
/// `table[idx]`, allocating one if absent. Demotes a huge mapping found
/// there via `ptbl_split` first — a present PD entry may already be a huge
/// 2 MiB mapping rather than a page-table pointer, and treating its
/// `page_addr` as a table frame in that case would read/write straight
/// into whatever data the huge page backs.
fn get_or_create_child(
    buddy: &mut BuddyAllocator,
    phys_map_base: u64,
    table: &mut RawTable,
    idx: usize,
    va: u64,
) -> Result<u64, MemError> {
    if is_present(table[idx]) {
        if is_huge(table[idx]) {
            ptbl_split(buddy, phys_map_base, &mut table[idx], va)?;
        }
        return Ok(page_addr(table[idx]));
    }
    let frame_idx = ptbl_alloc(buddy)?;
    let pa = buddy.registry().index_to_pa(frame_idx);
    buddy.inc_ref(frame_idx);
    table[idx] = make_entry(pa, PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER);
    Ok(pa)
}

/// Increments the new frame's reference before decrementing the old one's —
/// not the other way around. Self-remap (re-inserting the same frame at the
/// same address) makes `frame_idx == old_idx`; incrementing first takes its
/// ref_count to 2 before the matching decrement brings it back to 1, so it
/// is never transiently 0 and never transiently appears on the free list.
fn replace_entry(buddy: &mut BuddyAllocator, slot: &mut u64, frame_idx: usize, new_pa: u64, flags: PteFlags, va: u64) {
    buddy.inc_ref(frame_idx);
    if is_present(*slot) {
        let old_pa = page_addr(*slot);
        let old_idx = buddy.registry().pa_to_index(old_pa);
        buddy.dec_ref(old_idx);
        invalidate_tlb(va);
    }
    *slot = make_entry(new_pa, flags);
}

/// Installs a translation for `va`, allocating any missing page tables
/// along the way. `frame_idx` is the frame being mapped; `flags` must not
/// include `PRESENT` (it is added automatically). Set `PteFlags::HUGE` to
/// install a 2 MiB mapping at the PD level instead of a 4 KiB one.
pub fn insert(
    buddy: &mut BuddyAllocator,
    phys_map_base: u64,
    pml4_pa: u64,
    va: u64,
    frame_idx: usize,
    flags: PteFlags,
) -> Result<(), MemError> {
    let huge = flags.contains(PteFlags::HUGE);
    let align = if huge { HPAGE_SIZE } else { PAGE_SIZE };
    if va % align != 0 {
        return Err(MemError::Misaligned);
    }

    let pml4 = unsafe { table_at_mut(phys_map_base, pml4_pa) };
    let pdpt_pa = get_or_create_child(buddy, phys_map_base, pml4, pml4_index(va), va)?;
    let pdpt = unsafe { table_at_mut(phys_map_base, pdpt_pa) };
    let pd_pa = get_or_create_child(buddy, phys_map_base, pdpt, pdpt_index(va), va)?;
    let pd = unsafe { table_at_mut(phys_map_base, pd_pa) };

    let new_pa = buddy.registry().index_to_pa(frame_idx);

    if huge {
        let idx = pd_index(va);
        replace_entry(buddy, &mut pd[idx], frame_idx, new_pa, flags | PteFlags::PRESENT, va);
        return Ok(());
    }

    let pt_pa = get_or_create_child(buddy, phys_map_base, pd, pd_index(va), va)?;
    let pt = unsafe { table_at_mut(phys_map_base, pt_pa) };
    let idx = pt_index(va);
    replace_entry(buddy, &mut pt[idx], frame_idx, new_pa, flags | PteFlags::PRESENT, va);
    Ok(())
}

/// Maps `[pa_start, pa_start + len)` at `[va_start, va_start + len)`,
/// preferring 2 MiB mappings wherever both the virtual and physical
/// addresses fall on a huge-page boundary and enough length remains.
/// `len` need not itself be huge-page aligned.
pub fn boot_map_region(
    buddy: &mut BuddyAllocator,
    phys_map_base: u64,
    pml4_pa: u64,
    va_start: u64,
    pa_start: u64,
    len: u64,
    flags: PteFlags,
) -> Result<(), MemError> {
    let mut off = 0u64;
    while off < len {
        let va = va_start + off;
        let pa = pa_start + off;
        let want_huge = flags.contains(PteFlags::HUGE)
            && va % HPAGE_SIZE == 0
            && pa % HPAGE_SIZE == 0
            && (len - off) >= HPAGE_SIZE;
        let idx = buddy.registry().pa_to_index(pa);
        if want_huge {
            insert(buddy, phys_map_base, pml4_pa, va, idx, flags)?;
            off += HPAGE_SIZE;
        } else {
            insert(buddy, phys_map_base, pml4_pa, va, idx, flags & !PteFlags::HUGE)?;
            off += PAGE_SIZE;
        }
    }
    Ok(())
}

/// Demotes the huge mapping in `*pd_slot` into a table of 512 4 KiB
/// mappings covering the same physical range and flags. Each of the 512
/// underlying frames gets its own descriptor, carrying forward the huge
/// mapping's reference count, rather than continuing to share one.
/// No-op if `*pd_slot` is not a present huge entry.
pub fn ptbl_split(buddy: &mut BuddyAllocator, phys_map_base: u64, pd_slot: &mut u64, va: u64) -> Result<(), MemError> {
    if !is_present(*pd_slot) || !is_huge(*pd_slot) {
        return Ok(());
    }
    let huge_pa = page_addr(*pd_slot);
    let huge_idx = buddy.registry().pa_to_index(huge_pa);
    let flags = PteFlags::from_bits_truncate(*pd_slot) & !PteFlags::HUGE;
    let ref_count = buddy.registry().get(huge_idx).ref_count;

    let pt_idx = ptbl_alloc(buddy)?;
    let pt_pa = buddy.registry().index_to_pa(pt_idx);
    {
        let pt = unsafe { table_at_mut(phys_map_base, pt_pa) };
        for (i, slot) in pt.iter_mut().enumerate() {
            let sub_pa = huge_pa + i as u64 * PAGE_SIZE;
            let sub_idx = buddy.registry().pa_to_index(sub_pa);
            buddy.registry_mut().get_mut(sub_idx).ref_count = ref_count;
            *slot = make_entry(sub_pa, flags);
        }
    }
    buddy.inc_ref(pt_idx);
    *pd_slot = make_entry(pt_pa, flags | PteFlags::PRESENT | PteFlags::WRITE);
    invalidate_tlb(va);
    Ok(())
}

/// Promotes a table of 512 4 KiB mappings back into one huge mapping, if
/// and only if all 512 entries are present, share identical flags, and
/// cover a contiguous, huge-page-aligned physical range. Returns whether
/// the merge happened.
pub fn ptbl_merge(buddy: &mut BuddyAllocator, phys_map_base: u64, pd_slot: &mut u64, va: u64) -> Result<bool, MemError> {
    if !is_present(*pd_slot) || is_huge(*pd_slot) {
        return Ok(false);
    }
    let pt_pa = page_addr(*pd_slot);
    let pt_idx = buddy.registry().pa_to_index(pt_pa);

    let merged = {
        let pt = unsafe { table_at_mut(phys_map_base, pt_pa) };
        if !is_present(pt[0]) {
            None
        } else {
            let base_pa = page_addr(pt[0]);
            let flags0 = PteFlags::from_bits_truncate(pt[0]);
            if base_pa % HPAGE_SIZE != 0 {
                None
            } else {
                let mut all_match = true;
                for (i, slot) in pt.iter().enumerate().take(ENTRIES_PER_TABLE) {
                    let want_pa = base_pa + i as u64 * PAGE_SIZE;
                    if !is_present(*slot) || page_addr(*slot) != want_pa || PteFlags::from_bits_truncate(*slot) != flags0 {
                        all_match = false;
                        break;
                    }
                }
                if all_match {
                    Some((base_pa, flags0))
                } else {
                    None
                }
            }
        }
    };

    let Some((base_pa, flags0)) = merged else {
        return Ok(false);
    };

    // The table frame's own reference (held since it was linked into
    // `*pd_slot`) is dropped; the 512 members' individual reference counts
    // are left untouched; they're meaningless again until the next split,
    // since the huge mapping now carries the single reference that
    // entry 0 already held.
    buddy.dec_ref(pt_idx);
    *pd_slot = make_entry(base_pa, flags0 | PteFlags::HUGE | PteFlags::PRESENT);
    invalidate_tlb(va);
    Ok(true)
}
