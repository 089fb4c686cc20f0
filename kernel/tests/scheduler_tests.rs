//! Integration tests for the execution core's run queues, thread state
//! machine and load balancer, exercised as a freestanding binary under the
//! kernel's custom test harness.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use core::panic::PanicInfo;
use core::ptr::NonNull;

use veridian_kernel::sched::{
    cpu, load_balance::kcpulb_round, queue::ReadyQueue, task::TaskPtr, thread::Thread,
};
use veridian_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode, ThreadPtr, ThreadState};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("Starting scheduler tests...");

    test_ready_queue_fifo_within_priority();
    test_ready_queue_picks_highest_priority_first();
    test_thread_state_transitions();
    test_priority_demotion_clamps_at_lowest();
    test_cpu_activate_and_idle_flags();
    test_load_balancer_skips_wired_threads();
    test_load_balancer_steals_and_retargets();

    serial_println!("All scheduler tests passed!");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

/// A thread needs a task pointer; these tests never dereference `task`, so
/// a dangling-but-unused one is enough (same trick the in-module unit tests
/// use).
fn leak_thread() -> ThreadPtr {
    let task_ptr: NonNull<veridian_kernel::sched::task::Task> = NonNull::dangling();
    let t = Thread::new(TaskPtr::new(task_ptr), 0, 0, 0);
    let boxed = Box::new(t);
    ThreadPtr::new(NonNull::from(Box::leak(boxed)))
}

fn test_ready_queue_fifo_within_priority() {
    let rq = ReadyQueue::new();
    let a = leak_thread();
    let b = leak_thread();
    let c = leak_thread();
    rq.enqueue(a, 7);
    rq.enqueue(b, 7);
    rq.enqueue(c, 7);
    assert_eq!(rq.dequeue_best(), Some((a, 7)));
    assert_eq!(rq.dequeue_best(), Some((b, 7)));
    assert_eq!(rq.dequeue_best(), Some((c, 7)));
    assert_eq!(rq.dequeue_best(), None);
    serial_println!("test_ready_queue_fifo_within_priority ok");
}

fn test_ready_queue_picks_highest_priority_first() {
    let rq = ReadyQueue::new();
    let low = leak_thread();
    let high = leak_thread();
    rq.enqueue(low, 9);
    rq.enqueue(high, 1);
    assert_eq!(rq.dequeue_best(), Some((high, 1)));
    assert_eq!(rq.dequeue_best(), Some((low, 9)));
    serial_println!("test_ready_queue_picks_highest_priority_first ok");
}

fn test_thread_state_transitions() {
    let t = leak_thread();
    // SAFETY: sole owner, nothing else reaches this thread yet.
    let thread = unsafe { t.as_ref() };
    assert_eq!(thread.state(), ThreadState::Entering);
    thread.set_state(ThreadState::Ready);
    assert_eq!(thread.state(), ThreadState::Ready);
    thread.set_state(ThreadState::Running);
    assert_eq!(thread.state(), ThreadState::Running);
    thread.set_state(ThreadState::Sleeping);
    assert_eq!(thread.state(), ThreadState::Sleeping);
    thread.set_state(ThreadState::Exiting);
    assert_eq!(thread.state(), ThreadState::Exiting);
    serial_println!("test_thread_state_transitions ok");
}

fn test_priority_demotion_clamps_at_lowest() {
    let t = leak_thread();
    let thread = unsafe { t.as_ref() };
    thread.set_priority(14);
    thread.demote_priority();
    assert_eq!(thread.priority(), 15);
    // One more demotion must not overflow past the lowest list.
    thread.demote_priority();
    assert_eq!(thread.priority(), 15);
    serial_println!("test_priority_demotion_clamps_at_lowest ok");
}

fn test_cpu_activate_and_idle_flags() {
    let c = cpu::cpu_by_id(20);
    assert!(c.is_idle());
    c.activate();
    assert!(c.is_active());
    c.set_idle(false);
    assert!(!c.is_idle());
    serial_println!("test_cpu_activate_and_idle_flags ok");
}

fn test_load_balancer_skips_wired_threads() {
    let source = cpu::cpu_by_id(21);
    let dest = cpu::cpu_by_id(22);
    source.activate();
    dest.activate();

    let pinned = leak_thread();
    unsafe { pinned.as_ref() }
        .nomigrate
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    source.rq.enqueue(pinned, 5);

    let before = source.rq.nrdy();
    kcpulb_round(dest);
    // A wired thread must never leave its CPU's run queue.
    assert_eq!(source.rq.nrdy(), before);
    serial_println!("test_load_balancer_skips_wired_threads ok");
}

fn test_load_balancer_steals_and_retargets() {
    let source = cpu::cpu_by_id(23);
    let dest = cpu::cpu_by_id(24);
    source.activate();
    dest.activate();

    for _ in 0..4 {
        source.rq.enqueue(leak_thread(), 8);
    }
    assert_eq!(dest.rq.nrdy(), 0);

    kcpulb_round(dest);

    // The round keeps stealing until the two queues are within one of each
    // other's share of the global average; dest should have picked up at
    // least one thread from the overloaded source.
    assert!(dest.rq.nrdy() > 0);
    serial_println!("test_load_balancer_steals_and_retargets ok");
}
