//! Kernel heap (ambient infra): backs the `#[global_allocator]` declared
//! in `lib.rs` for bare-metal targets. The host test target instead uses
//! the system allocator, so nothing here runs under `cargo test`.

use linked_list_allocator::LockedHeap;

pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Arbitrary high address the bootloader is configured to map for us.
#[cfg(target_arch = "x86_64")]
pub const HEAP_START: usize = 0x_4444_4444_0000;
#[cfg(not(target_arch = "x86_64"))]
pub const HEAP_START: usize = 0xFFFF_C000_0000_0000;

static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// # Safety
/// Must be called exactly once, before any heap allocation is attempted.
pub unsafe fn init(allocator: &LockedHeap) {
    // SAFETY: `HEAP_MEMORY` is touched only through this call, which the
    // caller guarantees runs exactly once before the first allocation.
    let region = core::ptr::addr_of_mut!(HEAP_MEMORY);
    unsafe {
        allocator.lock().init(region as *mut u8, HEAP_SIZE);
    }
}
