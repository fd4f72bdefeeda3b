// kernel/src/mem/elf.rs
//
// Component F: kernel image mapping. Parses the ELF64 program headers the
// bootloader hands us for our own kernel image and installs a mapping for
// every loadable segment at or above KERNEL_VMA, translating the segment's
// read/write/execute flags into PRESENT/WRITE/NO_EXEC. Grounded on
// `kernel/utils/executable/elf.rs`'s use of `xmas_elf`, trimmed to the
// no-alloc subset this core needs: no userspace validation, no segment
// table collected into a `Vec` (there is no heap here), each LOAD header
// mapped as it's visited.

use xmas_elf::program::{ProgramHeader, Type};
use xmas_elf::ElfFile;

use super::buddy::BuddyAllocator;
use super::error::MemError;
use super::layout::{KERNEL_VMA, PAGE_SIZE};
use super::mapping::boot_map_region;
use super::pte::{align_down, align_up, PteFlags};

/// Translates a single `PT_LOAD` header into the page-aligned
/// `(va, pa, len, flags)` `boot_map_region` call it needs, or `None` if the
/// segment lies entirely below `KERNEL_VMA` and should be skipped. Kept
/// separate from the ELF parsing above it so the address and flag
/// arithmetic can be exercised without a real ELF image.
fn load_segment_mapping(virtual_addr: u64, physical_addr: u64, mem_size: u64, is_write: bool, is_execute: bool) -> Option<(u64, u64, u64, PteFlags)> {
    if virtual_addr < KERNEL_VMA {
        return None;
    }

    let va = align_down(virtual_addr, PAGE_SIZE);
    let pa = align_down(physical_addr, PAGE_SIZE);
    let seg_end = virtual_addr.checked_add(mem_size)?;
    let len = align_up(seg_end, PAGE_SIZE) - va;

    let mut ptflags = PteFlags::empty();
    if is_write {
        ptflags |= PteFlags::WRITE;
    }
    if !is_execute {
        ptflags |= PteFlags::NO_EXEC;
    }

    Some((va, pa, len, ptflags))
}

/// Maps every `PT_LOAD` segment of `elf_bytes` whose virtual address lies at
/// or above `KERNEL_VMA`. `elf_bytes` is the raw image as handed to us by the
/// bootloader (`BootInfo::kernel_addr`/`kernel_len`, read through the
/// physical map) — segment `p_paddr` fields are offsets into that same
/// buffer's backing physical range.
pub fn map_kernel_image(
    buddy: &mut BuddyAllocator,
    phys_map_base: u64,
    pml4_pa: u64,
    elf_bytes: &[u8],
) -> Result<(), MemError> {
    let elf = ElfFile::new(elf_bytes).map_err(|_| MemError::InvalidElf)?;

    for ph in elf.program_iter() {
        let ProgramHeader::Ph64(header) = ph else {
            continue;
        };
        if header.get_type().map_err(|_| MemError::InvalidElf)? != Type::Load {
            continue;
        }

        let Some((va, pa, len, ptflags)) = load_segment_mapping(
            header.virtual_addr,
            header.physical_addr,
            header.mem_size,
            header.flags.is_write(),
            header.flags.is_execute(),
        ) else {
            continue;
        };

        boot_map_region(buddy, phys_map_base, pml4_pa, va, pa, len, ptflags)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_below_kernel_vma_is_skipped() {
        assert!(load_segment_mapping(KERNEL_VMA - PAGE_SIZE, 0, PAGE_SIZE, true, false).is_none());
    }

    #[test]
    fn write_and_execute_flags_translate_to_write_and_no_exec() {
        let (_, _, _, flags) = load_segment_mapping(KERNEL_VMA, 0, PAGE_SIZE, true, true).unwrap();
        assert!(flags.contains(PteFlags::WRITE));
        assert!(!flags.contains(PteFlags::NO_EXEC));

        let (_, _, _, flags) = load_segment_mapping(KERNEL_VMA, 0, PAGE_SIZE, false, false).unwrap();
        assert!(!flags.contains(PteFlags::WRITE));
        assert!(flags.contains(PteFlags::NO_EXEC));
    }

    #[test]
    fn unaligned_segment_rounds_address_down_and_length_up() {
        let virtual_addr = KERNEL_VMA + 0x123;
        let physical_addr = 0x2345;
        let mem_size = PAGE_SIZE; // spans into a second page once misaligned
        let (va, pa, len, _) = load_segment_mapping(virtual_addr, physical_addr, mem_size, true, false).unwrap();
        assert_eq!(va, KERNEL_VMA);
        assert_eq!(pa, 0x2000);
        assert_eq!(len, 2 * PAGE_SIZE);
    }

    #[test]
    fn overflowing_segment_end_is_rejected() {
        assert!(load_segment_mapping(KERNEL_VMA, 0, u64::MAX, true, false).is_none());
    }
}
