//! Task (C5): the owning container of threads and an address space.
//!
//! A task has no scheduling metadata of its own -- only its threads do.
//! What it owns is an address space reference, an optional per-architecture
//! I/O bitmap, and a reference count shared between its threads and any
//! external handles.

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::{boxed::Box, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use spin::Mutex;

use crate::mm::address_space::AddressSpacePtr;

use super::thread::ThreadPtr;

/// Task identifier, unique for the lifetime of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn alloc_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// Number of bytes in the optional per-task I/O permission bitmap. Sized
/// for the x86_64 port range (65536 bits).
pub const IO_BITMAP_BYTES: usize = 8192;

/// Task Control Block.
pub struct Task {
    pub id: TaskId,
    pub address_space: AddressSpacePtr,
    /// Per-architecture I/O bitmap; `None` unless the task has been granted
    /// direct port access.
    #[cfg(feature = "alloc")]
    pub io_bitmap: Option<Box<[u8; IO_BITMAP_BYTES]>>,
    /// Every thread created with this task as owner, used by `task_kill`.
    #[cfg(feature = "alloc")]
    threads: Mutex<Vec<ThreadPtr>>,
    refcount: AtomicU32,
}

// SAFETY: fields are either atomics or set once at construction time and
// read thereafter under the scheduler's existing synchronization.
unsafe impl Send for Task {}
// SAFETY: see above.
unsafe impl Sync for Task {}

impl Task {
    #[cfg(feature = "alloc")]
    pub fn new(address_space: AddressSpacePtr) -> Self {
        Self {
            id: alloc_task_id(),
            address_space,
            io_bitmap: None,
            threads: Mutex::new(Vec::new()),
            refcount: AtomicU32::new(1),
        }
    }

    /// Register `t` as owned by this task. Called by `thread::thread_create`.
    #[cfg(feature = "alloc")]
    pub fn register_thread(&self, t: ThreadPtr) {
        self.threads.lock().push(t);
    }

    /// Drop `t` from this task's thread list. Called once `t` has exited.
    #[cfg(feature = "alloc")]
    pub fn unregister_thread(&self, t: ThreadPtr) {
        let mut threads = self.threads.lock();
        if let Some(pos) = threads.iter().position(|&x| x == t) {
            threads.remove(pos);
        }
    }

    /// `task_kill`: request that every thread owned by this task exit
    /// (§4.5). Each thread observes the request cooperatively at its next
    /// `thread_yield`/`thread_sleep` call -- this kernel has no cross-CPU
    /// preemption IPI, so a thread actively running on another CPU only
    /// terminates at its next voluntary reschedule point.
    #[cfg(feature = "alloc")]
    pub fn task_kill(&self) {
        for t in self.threads.lock().iter() {
            // SAFETY: every thread on this list is kept alive by its
            // registration here until it exits and unregisters.
            unsafe { t.as_ref() }
                .kill_requested
                .store(true, Ordering::Release);
        }
    }

    pub fn hold(ptr: NonNull<Task>) -> TaskPtr {
        // SAFETY: caller guarantees `ptr` is a live task.
        unsafe { ptr.as_ref() }.refcount.fetch_add(1, Ordering::Relaxed);
        TaskPtr(ptr)
    }

    /// Release a reference; frees the task and drops its address-space
    /// reference once the count reaches zero. Holding/releasing the kernel
    /// task is a documented no-op, enforced by callers never constructing
    /// a `TaskPtr` to it through this path.
    ///
    /// # Safety
    /// `ptr` must have been produced by `Box::into_raw` (directly or via
    /// `hold`).
    #[cfg(feature = "alloc")]
    pub unsafe fn release(ptr: NonNull<Task>) {
        // SAFETY: caller guarantees `ptr` is a live, refcounted task.
        let prev = unsafe { ptr.as_ref() }.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // SAFETY: last reference; reconstruct the `Box` leaked at
            // creation and let its address-space reference drop too.
            unsafe {
                let task = Box::from_raw(ptr.as_ptr());
                crate::mm::address_space::AddressSpace::release(task.address_space);
            }
        }
    }
}

/// A `NonNull<Task>` wrapper that is `Send + Sync`.
///
/// # Safety
/// Tasks are only modified under the owning thread's run-queue lock or
/// with interrupts disabled during a scheduler switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

impl TaskPtr {
    pub fn new(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// The pointee must be valid and not concurrently mutably aliased.
    pub unsafe fn as_ref(&self) -> &Task {
        // SAFETY: forwarded to caller.
        unsafe { self.0.as_ref() }
    }

    pub fn as_non_null(&self) -> NonNull<Task> {
        self.0
    }
}

// SAFETY: see the module-level note on `Task`.
unsafe impl Send for TaskPtr {}
// SAFETY: see above.
unsafe impl Sync for TaskPtr {}

impl From<NonNull<Task>> for TaskPtr {
    fn from(ptr: NonNull<Task>) -> Self {
        Self::new(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_allocation_is_monotonic() {
        let a = alloc_task_id();
        let b = alloc_task_id();
        assert!(b.0 > a.0);
    }
}
