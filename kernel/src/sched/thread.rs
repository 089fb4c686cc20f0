//! Thread (C4): the unit the scheduler actually runs.
//!
//! A thread carries its own saved register context, an optional FPU slot,
//! scheduling metadata and the sleep-state pad used to resolve the
//! sleep/wake race (§4.4). Threads are reference counted; the object is
//! freed once the count reaches zero, which is not necessarily at exit
//! time (the CPU that ran it, and any joiner, may still hold a reference).

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::boxed::Box;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use crate::{
    arch::context::ArchThreadContext,
    config::RQ_COUNT,
    sync::WaitQueue,
};

use super::task::TaskPtr;

/// Thread identifier, unique for the lifetime of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh, never-reused thread id.
pub fn alloc_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Thread state machine (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but never started.
    Entering = 0,
    /// On a run queue, waiting for the scheduler to pick it.
    Ready = 1,
    /// Currently executing on some CPU.
    Running = 2,
    /// Blocked on a wait queue.
    Sleeping = 3,
    /// Exit in progress; will be cleaned up and its reference dropped.
    Exiting = 4,
}

impl ThreadState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Entering,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Sleeping,
            4 => Self::Exiting,
            _ => panic!("invalid thread state"),
        }
    }
}

/// The sleep/wake race pad (§4.4, §4.9, glossary). A one-shot state machine
/// per sleep episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SleepState {
    Initial = 0,
    Asleep = 1,
    Woke = 2,
}

/// Per-thread FPU save area. Architecture-shaped; opaque to the scheduler
/// beyond "exists or not".
pub struct FpuContext {
    #[cfg(target_arch = "x86_64")]
    pub state: crate::arch::x86_64::context::FpuState,
    #[cfg(not(target_arch = "x86_64"))]
    pub state: crate::arch::stub::FpuState,
}

impl FpuContext {
    pub fn new() -> Self {
        Self {
            state: Default::default(),
        }
    }
}

impl Default for FpuContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread Control Block.
pub struct Thread {
    pub id: ThreadId,
    /// Owning task. Never null after construction.
    pub task: TaskPtr,
    /// Saved CPU register context (stack pointer + callee-saved regs).
    pub context: ArchThreadContext,
    /// Lazily-allocated FPU save area.
    pub fpu_context: Option<Box<FpuContext>>,
    pub fpu_context_exists: bool,
    /// CPU this thread last ran on, used by `thread_requeue_sleeping` and
    /// by the load balancer's FPU-affinity check.
    pub last_cpu: Option<u8>,
    state: AtomicU8,
    /// 0 = highest priority, `RQ_COUNT - 1` = lowest.
    priority: AtomicU8,
    pub sleep_state: AtomicU8,
    /// Set by the load balancer when it steals this thread; cleared by
    /// `prepare_to_run_thread`.
    pub stolen: core::sync::atomic::AtomicBool,
    /// Set by `sync::WaitQueue::wake_on_timeout` when a bounded sleep's
    /// deadline wins the race against a real wakeup; read by the sleeper
    /// after it resumes.
    pub timed_out: core::sync::atomic::AtomicBool,
    /// Set by `task::Task::task_kill`. Checked cooperatively at the
    /// voluntary reschedule points (`thread_yield`, `thread_sleep`): there
    /// is no cross-CPU preemption IPI in this kernel, so a thread running
    /// on another CPU only observes its own kill request at its next
    /// voluntary switch.
    pub kill_requested: core::sync::atomic::AtomicBool,
    /// Nonzero pins the thread to `last_cpu`; the load balancer skips it.
    pub nomigrate: AtomicU32,
    pub kcycles: AtomicU64,
    pub ucycles: AtomicU64,
    pub last_cycle: AtomicU64,
    /// Closed and drained on exit, waking every `thread_join` caller.
    pub join_wq: WaitQueue,
    refcount: AtomicU32,
}

// SAFETY: Thread is only mutated through atomics or while the owning CPU
// holds the relevant run-queue/task lock; the scheduler never aliases a
// `&mut Thread` across CPUs.
unsafe impl Send for Thread {}
// SAFETY: see above.
unsafe impl Sync for Thread {}

impl Thread {
    /// Construct a new thread in state `Entering`, not yet linked into any
    /// run queue.
    #[cfg(feature = "alloc")]
    pub fn new(task: TaskPtr, entry: usize, stack_top: usize, kernel_stack: usize) -> Self {
        let mut context = ArchThreadContext::new();
        context.init(entry, stack_top, kernel_stack);
        Self {
            id: alloc_tid(),
            task,
            context,
            fpu_context: None,
            fpu_context_exists: false,
            last_cpu: None,
            state: AtomicU8::new(ThreadState::Entering as u8),
            priority: AtomicU8::new(default_priority()),
            sleep_state: AtomicU8::new(SleepState::Initial as u8),
            stolen: core::sync::atomic::AtomicBool::new(false),
            timed_out: core::sync::atomic::AtomicBool::new(false),
            kill_requested: core::sync::atomic::AtomicBool::new(false),
            nomigrate: AtomicU32::new(0),
            kcycles: AtomicU64::new(0),
            ucycles: AtomicU64::new(0),
            last_cycle: AtomicU64::new(0),
            join_wq: WaitQueue::new(),
            refcount: AtomicU32::new(1),
        }
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, p: u8) {
        debug_assert!((p as usize) < RQ_COUNT);
        self.priority.store(p, Ordering::Release);
    }

    /// Demote one level, clamped at `RQ_COUNT - 1` (invariant: boundary
    /// behavior, §8 -- no overflow past the lowest priority list).
    pub fn demote_priority(&self) {
        let max = (RQ_COUNT - 1) as u8;
        let _ = self
            .priority
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(core::cmp::min(p + 1, max))
            });
    }

    pub fn hold(ptr: NonNull<Thread>) -> ThreadPtr {
        // SAFETY: caller guarantees `ptr` is a live thread.
        unsafe { ptr.as_ref() }.refcount.fetch_add(1, Ordering::Relaxed);
        ThreadPtr(ptr)
    }

    /// Drop a reference; frees the thread when the count reaches zero.
    ///
    /// # Safety
    /// `ptr` must have been produced by `Box::into_raw` (directly or via
    /// `hold`) and must not be used again by the caller after this call if
    /// the count reaches zero.
    #[cfg(feature = "alloc")]
    pub unsafe fn put(ptr: NonNull<Thread>) {
        // SAFETY: caller guarantees `ptr` is a live, uniquely-owned-by-refcount thread.
        let prev = unsafe { ptr.as_ref() }.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // SAFETY: refcount hit zero under AcqRel, so no other holder
            // remains; reconstruct and drop the allocation that was leaked
            // by `Box::into_raw` when the thread was created.
            unsafe {
                drop(Box::from_raw(ptr.as_ptr()));
            }
        }
    }
}

/// Allocate a thread owned by `task`, registering it on the task's thread
/// list so `Task::task_kill` can find it later. Starts in `Entering`;
/// call [`thread_start`] to make it schedulable.
#[cfg(feature = "alloc")]
pub fn thread_create(task: TaskPtr, entry: usize, stack_top: usize, kernel_stack: usize) -> ThreadPtr {
    let boxed = Box::new(Thread::new(task, entry, stack_top, kernel_stack));
    let ptr = ThreadPtr::new(NonNull::from(Box::leak(boxed)));
    // SAFETY: `task` outlives every thread it owns.
    unsafe { task.as_ref() }.register_thread(ptr);
    ptr
}

/// Whether the thread running on this CPU has had `task_kill` called
/// against its owning task.
#[cfg(feature = "alloc")]
fn current_thread_kill_requested() -> bool {
    super::cpu::cpu_current()
        .current_thread()
        // SAFETY: the current thread is kept alive by the CPU's own
        // reference for as long as it is installed.
        .is_some_and(|t| unsafe { t.as_ref() }.kill_requested.load(Ordering::Acquire))
}

/// `thread_start`: transition a freshly-created thread from `Entering` to
/// `Ready` and place it on its home CPU's run queue (§4.4). Called exactly
/// once per thread, before it is ever dispatched.
#[cfg(feature = "alloc")]
pub fn thread_start(t: ThreadPtr) {
    // SAFETY: a thread in `Entering` is not yet reachable from any run
    // queue, so nothing else touches it concurrently.
    let thread = unsafe { t.as_ref() };
    debug_assert_eq!(thread.state(), ThreadState::Entering);
    thread.set_state(ThreadState::Ready);
    let home = thread.last_cpu.unwrap_or_else(|| super::cpu::cpu_current().id);
    super::cpu::cpu_by_id(home).rq.enqueue(t, thread.priority());
}

/// `thread_yield`: voluntarily give up the CPU, requeued at the same
/// priority (unlike involuntary preemption, which demotes it one level).
/// A cooperative reschedule point: if `task_kill` has been called against
/// this thread's task, it exits here instead of yielding.
#[cfg(feature = "alloc")]
pub fn thread_yield() {
    if current_thread_kill_requested() {
        thread_exit();
    }
    super::scheduler::scheduler_enter(ThreadState::Ready);
}

/// `thread_sleep(deadline)`: block the calling thread until `deadline_ms`
/// (an absolute timestamp on the `timer::get_uptime_ms` clock) elapses
/// (§4.4). A deadline already in the past sleeps for one millisecond.
#[cfg(feature = "alloc")]
pub fn thread_sleep(deadline_ms: u64) {
    if current_thread_kill_requested() {
        thread_exit();
    }
    let prev_irq = super::cpu::interrupts_disable();
    let now = crate::timer::get_uptime_ms();
    let timeout_ms = deadline_ms.saturating_sub(now).max(1);
    let cpu = super::cpu::cpu_current();
    let current = cpu
        .current_thread()
        .expect("thread_sleep: no thread installed on this CPU");

    // A private wait queue nobody else ever wakes: the timeout is the only
    // way out, so this reduces to the same sleep-state pad protocol
    // `WaitQueue::sleep` uses, bounded by a timer.
    let wq = crate::sync::WaitQueue::new();
    // SAFETY: interrupts are disabled above and `current` names the thread
    // running on this CPU.
    unsafe {
        wq.sleep_timeout(current, timeout_ms);
    }
    super::cpu::interrupts_restore(prev_irq);
}

/// `thread_exit`: the calling thread's last act (§4.4). Transitions to
/// `Exiting`, at which point `cleanup_after_thread` closes `join_wq` and
/// drops the CPU's reference; never returns.
#[cfg(feature = "alloc")]
pub fn thread_exit() -> ! {
    super::scheduler::scheduler_enter(ThreadState::Exiting);
    unreachable!("thread_exit: scheduler resumed an exited thread")
}

/// `thread_join`: block the calling thread until `t` exits (§4.4). A no-op
/// if `t` has already exited, since its join queue is closed by then.
///
/// The caller must hold its own reference to `t` (e.g. via [`Thread::hold`]
/// taken before this call) -- `thread_join` does not take one itself.
#[cfg(feature = "alloc")]
pub fn thread_join(t: ThreadPtr) {
    let prev_irq = super::cpu::interrupts_disable();
    let cpu = super::cpu::cpu_current();
    let current = cpu
        .current_thread()
        .expect("thread_join: no thread installed on this CPU");
    // SAFETY: interrupts are disabled above, `current` names the thread
    // running on this CPU, and the caller's reference keeps `t` alive for
    // the duration of the join.
    unsafe {
        t.as_ref().join_wq.sleep(current);
    }
    super::cpu::interrupts_restore(prev_irq);
}

const fn default_priority() -> u8 {
    // New threads start in the middle of the priority band, matching
    // HelenOS's default user-thread priority.
    (RQ_COUNT / 2) as u8
}

/// A `NonNull<Thread>` wrapper that is `Send + Sync`.
///
/// # Safety
/// Threads are only accessed with the owning run-queue lock held or with
/// interrupts disabled on the CPU that currently owns the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPtr(NonNull<Thread>);

impl ThreadPtr {
    pub fn new(ptr: NonNull<Thread>) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// The pointee must be valid and not concurrently mutably aliased.
    pub unsafe fn as_ref(&self) -> &Thread {
        // SAFETY: forwarded to caller.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    /// The caller must be the only holder accessing this thread's
    /// non-atomic fields (`context`, `fpu_context`, `last_cpu`) at this
    /// instant -- true while the thread is off every run queue and not
    /// concurrently being stolen, which the scheduler and load balancer
    /// both guarantee by construction.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut(&self) -> &mut Thread {
        // SAFETY: forwarded to caller.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn as_non_null(&self) -> NonNull<Thread> {
        self.0
    }

    pub fn as_raw(&self) -> *mut Thread {
        self.0.as_ptr()
    }
}

// SAFETY: see the module-level note on `Thread`.
unsafe impl Send for ThreadPtr {}
// SAFETY: see above.
unsafe impl Sync for ThreadPtr {}

impl From<NonNull<Thread>> for ThreadPtr {
    fn from(ptr: NonNull<Thread>) -> Self {
        Self::new(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demote_priority_clamps_at_lowest() {
        let p = AtomicU8::new((RQ_COUNT - 1) as u8);
        let max = (RQ_COUNT - 1) as u8;
        let _ = p.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(core::cmp::min(v + 1, max))
        });
        assert_eq!(p.load(Ordering::Acquire), (RQ_COUNT - 1) as u8);
    }

    #[test]
    fn tid_allocation_is_monotonic_and_unique() {
        let a = alloc_tid();
        let b = alloc_tid();
        assert!(b.0 > a.0);
    }
}
