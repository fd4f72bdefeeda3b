// kernel/src/mem/cpu.rs
//
// Thin wrappers over the low-level CPU control the core treats as an
// external collaborator: EFER/NX, CR3, and single-address TLB invalidation.
// Under `cfg(test)` these become no-ops so the pure logic they're called
// from (mapping primitives, init sequence) stays unit-testable on the host.

#[cfg(not(test))]
mod hw {
    use x86_64::instructions::tlb;
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::registers::model_specific::{Efer, EferFlags};
    use x86_64::structures::paging::{PhysFrame, Size4KiB};
    use x86_64::{PhysAddr, VirtAddr};

    /// Enables the NX (no-execute) bit in EFER. Must happen before any PTE
    /// relies on `NO_EXEC` having an effect.
    pub unsafe fn enable_nx() {
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
    }

    /// Loads a new PML4 physical address into CR3, switching address spaces.
    pub unsafe fn load_pml4(pml4_pa: u64) {
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(pml4_pa));
        Cr3::write(frame, Cr3Flags::empty());
    }

    /// Invalidates the TLB entry for a single virtual address.
    pub fn invalidate_tlb(va: u64) {
        tlb::flush(VirtAddr::new(va));
    }
}

#[cfg(test)]
mod hw {
    pub unsafe fn enable_nx() {}
    pub unsafe fn load_pml4(_pml4_pa: u64) {}
    pub fn invalidate_tlb(_va: u64) {}
}

pub use hw::{enable_nx, invalidate_tlb, load_pml4};
