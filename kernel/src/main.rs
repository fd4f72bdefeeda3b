// kernel/src/main.rs
//
// Boot entry point. Hands the bootloader's memory map and kernel image to
// `kernel::mem::mem_init`, then idles. Everything that used to live in
// `init::boot`'s longer orchestration (framebuffer, interrupts, processes,
// the REPL) belonged to a larger kernel this crate no longer builds; the
// physical-memory core is the whole of this binary's job now.

#![no_std]
#![no_main]

mod panic;

use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};
use kernel::mem::init::{mem_init, BootHandoff};
use kernel::serial_println_raw;

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println_raw!("booting physical-memory core");

    let phys_map_base = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");

    let kernel_elf = unsafe {
        core::slice::from_raw_parts(
            (phys_map_base + boot_info.kernel_addr) as *const u8,
            boot_info.kernel_len as usize,
        )
    };

    let handoff = BootHandoff {
        memory_regions: &*boot_info.memory_regions,
        phys_map_base,
        kernel_elf,
    };

    let init = mem_init(&handoff).expect("mem_init failed");
    serial_println_raw!("pml4 at {:#x}, phys map base {:#x}", init.pml4_pa, init.phys_map_base);

    kernel::mem::show_buddy_info();
    serial_println_raw!("total free pages: {}", kernel::mem::count_total_free_pages());

    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}
