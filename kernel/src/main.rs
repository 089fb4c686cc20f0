#![no_std]
#![no_main]

use core::panic::PanicInfo;

use veridian_kernel::bootstrap;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    #[cfg(target_arch = "x86_64")]
    veridian_kernel::println!("[KERNEL PANIC] {}", info);

    veridian_kernel::arch::halt();
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    veridian_kernel::println!("VeridianOS v{}", env!("CARGO_PKG_VERSION"));
    veridian_kernel::println!("Initializing microkernel...");

    bootstrap::run();
}
