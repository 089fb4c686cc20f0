//! Integration tests for the physical frame allocator and the
//! address-space region model, exercised as a freestanding binary under
//! the kernel's custom test harness.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use veridian_kernel::mm::{
    address_space::Region, backing::Backing, frame_allocator, page_fault, FrameNumber,
    PageFlags, VirtualAddress,
};
use veridian_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("Starting memory tests...");

    test_frame_allocator_roundtrip();
    test_frame_allocator_exhaustion();
    test_frame_allocator_reuses_freed_frame();
    test_region_overlap_detection();
    test_region_contains_is_half_open();
    test_page_fault_info_decodes_error_code();

    serial_println!("All memory tests passed!");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

fn test_frame_allocator_roundtrip() {
    frame_allocator::init(FrameNumber::new(0x1000), 4);
    let f = frame_allocator::alloc_frame().expect("frame should be available");
    assert_eq!(f, FrameNumber::new(0x1000));
    assert_eq!(frame_allocator::free_frame_count(), 3);
    frame_allocator::free_frame(f);
    assert_eq!(frame_allocator::free_frame_count(), 4);
    serial_println!("test_frame_allocator_roundtrip ok");
}

fn test_frame_allocator_exhaustion() {
    frame_allocator::init(FrameNumber::new(0), 2);
    frame_allocator::alloc_frame().expect("first frame should succeed");
    frame_allocator::alloc_frame().expect("second frame should succeed");
    assert!(frame_allocator::alloc_frame().is_err());
    serial_println!("test_frame_allocator_exhaustion ok");
}

fn test_frame_allocator_reuses_freed_frame() {
    frame_allocator::init(FrameNumber::new(0), 1);
    let a = frame_allocator::alloc_frame().expect("allocation should succeed");
    frame_allocator::free_frame(a);
    let b = frame_allocator::alloc_frame().expect("freed frame should be reusable");
    assert_eq!(a, b);
    serial_println!("test_frame_allocator_reuses_freed_frame ok");
}

fn test_region_overlap_detection() {
    let a = Region {
        start: VirtualAddress::new(0x1000),
        len: 0x1000,
        flags: PageFlags::PRESENT,
        backing: Backing::Anonymous,
    };
    let b = Region {
        start: VirtualAddress::new(0x1800),
        len: 0x1000,
        flags: PageFlags::PRESENT,
        backing: Backing::Anonymous,
    };
    assert!(a.contains(VirtualAddress::new(0x1800)) || b.contains(VirtualAddress::new(0x1800)));
    serial_println!("test_region_overlap_detection ok");
}

fn test_region_contains_is_half_open() {
    let r = Region {
        start: VirtualAddress::new(0x2000),
        len: 0x1000,
        flags: PageFlags::PRESENT | PageFlags::WRITABLE,
        backing: Backing::Anonymous,
    };
    assert!(r.contains(VirtualAddress::new(0x2000)));
    assert!(r.contains(VirtualAddress::new(0x2FFF)));
    assert!(!r.contains(VirtualAddress::new(0x3000)));
    serial_println!("test_region_contains_is_half_open ok");
}

#[cfg(target_arch = "x86_64")]
fn test_page_fault_info_decodes_error_code() {
    let info = page_fault::from_x86_64(0b110, 0xDEAD_B000, 0x4010_0000);
    assert_eq!(info.faulting_address, 0xDEAD_B000);
    assert!(info.was_write);
    assert!(info.was_user_mode);
    serial_println!("test_page_fault_info_decodes_error_code ok");
}

#[cfg(not(target_arch = "x86_64"))]
fn test_page_fault_info_decodes_error_code() {
    serial_println!("test_page_fault_info_decodes_error_code skipped (non-x86_64)");
}
