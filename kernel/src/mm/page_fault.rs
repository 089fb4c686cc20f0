//! Page fault resolution (§4.3): the architecture trap handler's single
//! entry point into the address-space model.

#![allow(dead_code)]

use crate::{
    error::{KernelError, KernelResult},
    sched::cpu,
};

use super::{frame_allocator::FrameNumber, in_kernel_identity_window, ka2pa, VirtualAddress, PAGE_SIZE};

/// Legacy VGA/BIOS memory-mapped I/O window. Tasks granted direct I/O
/// access via their per-task bitmap (§4.5) may fault here with no
/// corresponding region in their address space; the window is mapped in
/// directly from the bitmap permission rather than resolved against the
/// region set.
const LEGACY_IO_WINDOW_START: u64 = 0xA_0000;
const LEGACY_IO_WINDOW_END: u64 = 0x10_0000;

/// Information about a page fault collected by the architecture trap
/// handler.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub faulting_address: u64,
    pub was_write: bool,
    pub was_user_mode: bool,
    pub instruction_pointer: u64,
}

/// Resolve a page fault against the current task's address space.
///
/// Step 1 of §4.3: locate the area containing `va`; if none, a kernel-mode
/// fault inside the kernel identity window installs `va -> KA2PA(va)` on the
/// fly instead of propagating *NotFound*.
#[cfg(feature = "alloc")]
pub fn handle_page_fault(info: PageFaultInfo) -> KernelResult<()> {
    let addr = VirtualAddress::new(info.faulting_address);

    if (LEGACY_IO_WINDOW_START..LEGACY_IO_WINDOW_END).contains(&info.faulting_address) {
        return resolve_legacy_io_fault(addr);
    }

    let cpu = cpu::cpu_current();
    let task_ptr = cpu.current_task().ok_or(KernelError::NotFound {
        what: "current task",
    })?;
    // SAFETY: this CPU holds a reference to its current task for the
    // duration of the fault.
    let address_space = unsafe { task_ptr.as_ref() }.address_space;
    // SAFETY: an address space outlives every task that references it.
    let result = unsafe { address_space.as_ref() }.resolve_fault(addr, info.was_write);

    match result {
        Err(KernelError::NotFound { .. }) if !info.was_user_mode && in_kernel_identity_window(addr) => {
            resolve_kernel_identity_fault(address_space, addr)
        }
        other => other,
    }
}

/// Fill a demand mapping in the kernel identity window: `va -> KA2PA(va)`
/// (§4.3 step 1, Scenario 6). Only reachable for kernel-mode faults already
/// confirmed to lie inside the window.
#[cfg(feature = "alloc")]
fn resolve_kernel_identity_fault(
    address_space: crate::mm::address_space::AddressSpacePtr,
    addr: VirtualAddress,
) -> KernelResult<()> {
    let page = addr.align_down(PAGE_SIZE as u64);
    let phys = ka2pa(page).ok_or(KernelError::NotFound {
        what: "kernel identity window",
    })?;
    let frame = FrameNumber::new(phys.as_u64() >> 12);
    crate::mm::address_space::install_identity(address_space, page, frame)
}

/// The legacy I/O window grants access per-page through the task's I/O
/// bitmap (§4.5) rather than through an address-space region.
#[cfg(feature = "alloc")]
fn resolve_legacy_io_fault(addr: VirtualAddress) -> KernelResult<()> {
    let cpu = cpu::cpu_current();
    let task_ptr = cpu.current_task().ok_or(KernelError::NotFound {
        what: "current task",
    })?;
    // SAFETY: see above.
    let task = unsafe { task_ptr.as_ref() };

    let page_index = ((addr.as_u64() - LEGACY_IO_WINDOW_START) / PAGE_SIZE as u64) as usize;
    let permitted = task.io_bitmap.as_ref().is_some_and(|bitmap| {
        bitmap
            .get(page_index / 8)
            .is_some_and(|byte| byte & (1 << (page_index % 8)) != 0)
    });

    if !permitted {
        return Err(KernelError::Permission {
            operation: "legacy I/O window access",
        });
    }

    let page = addr.align_down(PAGE_SIZE as u64);
    let frame = FrameNumber::new(page.as_u64() >> 12);
    crate::mm::address_space::install_identity(task.address_space, page, frame)
}

// ---------------------------------------------------------------------------
// Architecture-specific entry points
// ---------------------------------------------------------------------------

/// Build a [`PageFaultInfo`] from an x86_64 page fault error code and CR2.
///
/// Error code bits (Intel SDM):
/// - Bit 1 (W/R): 0 = read, 1 = write
/// - Bit 2 (U/S): 0 = supervisor, 1 = user
#[cfg(target_arch = "x86_64")]
pub fn from_x86_64(error_code: u64, cr2: u64, rip: u64) -> PageFaultInfo {
    PageFaultInfo {
        faulting_address: cr2,
        was_write: (error_code & 2) != 0,
        was_user_mode: (error_code & 4) != 0,
        instruction_pointer: rip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_info_roundtrip() {
        let info = from_x86_64(0b110, 0xDEAD_BEEF, 0x4010_0000);
        assert_eq!(info.faulting_address, 0xDEAD_BEEF);
        assert!(info.was_write);
        assert!(info.was_user_mode);
    }

    #[test]
    fn kernel_mode_read_fault() {
        let info = from_x86_64(0b000, 0x1000, 0x2000);
        assert!(!info.was_write);
        assert!(!info.was_user_mode);
    }
}
