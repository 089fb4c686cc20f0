//! Wait queues: the sleep/wake primitive used by synchronization and I/O.
//!
//! A [`WaitQueue`] holds a list of sleeping threads plus a "missed wakeups"
//! count. Sleep and wake race against each other; the race is resolved by
//! the per-thread sleep-state pad (see [`crate::sched::thread`]) rather than
//! by holding the queue lock across the context switch.

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    sched::{
        self,
        thread::{SleepState, Thread, ThreadPtr},
    },
    timer::{self, TimerId, TimerMode},
};

/// Wake mode for [`WaitQueue::wakeup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    /// Wake exactly one sleeper, if any.
    One,
    /// Wake every sleeper.
    All,
}

struct Inner {
    sleepers: Vec<ThreadPtr>,
    closed: bool,
}

/// A raw `WaitQueue` pointer, `Send + Sync` for the same reason
/// [`ThreadPtr`] is: only ever read back by the timer callback that
/// registered it, while the sleep episode that owns the queue is still
/// in progress.
#[derive(Clone, Copy)]
struct WaitQueuePtr(*const WaitQueue);

// SAFETY: see above.
unsafe impl Send for WaitQueuePtr {}
// SAFETY: see above.
unsafe impl Sync for WaitQueuePtr {}

/// In-flight `wq_sleep_timeout` calls, keyed by the timer registered for
/// each one, so the timer subsystem's plain-fn-pointer callback can find
/// which sleeper to requeue without closure capture.
#[cfg(feature = "alloc")]
static TIMEOUT_REGISTRY: Mutex<Vec<(TimerId, ThreadPtr, WaitQueuePtr)>> = Mutex::new(Vec::new());

/// Timer callback registered by [`WaitQueue::sleep_timeout`]: looks up the
/// sleeper and, if the timeout wins the race against a real wakeup,
/// requeues it.
#[cfg(feature = "alloc")]
fn fire_sleep_timeout(id: TimerId) {
    let entry = {
        let mut registry = TIMEOUT_REGISTRY.lock();
        registry
            .iter()
            .position(|e| e.0 == id)
            .map(|pos| registry.remove(pos))
    };
    if let Some((_, t, wq_ptr)) = entry {
        // SAFETY: the queue this points at is borrowed for the entire
        // synchronous duration of the `sleep_timeout` call that registered
        // it, which has not yet returned if the entry was still here to find.
        let wq = unsafe { &*wq_ptr.0 };
        wq.wake_on_timeout(t);
    }
}

/// A list of threads sleeping on a common condition.
pub struct WaitQueue {
    inner: Mutex<Inner>,
    /// Wakeups that arrived with nobody registered as a sleeper yet.
    missed_wakeups: AtomicU64,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    /// Create an empty wait queue.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sleepers: Vec::new(),
                closed: false,
            }),
            missed_wakeups: AtomicU64::new(0),
        }
    }

    /// Put the calling thread to sleep on this queue.
    ///
    /// Implements the sleep protocol of §4.9: the sleep-state pad is armed
    /// before linking into `sleepers`, so a waker that runs between the link
    /// and the call into the scheduler still observes the thread and wakes
    /// it rather than losing the wakeup.
    ///
    /// # Safety
    /// Must be called with interrupts already disabled by the caller and
    /// with `current` naming the thread actually running on this CPU.
    pub unsafe fn sleep(&self, current: ThreadPtr) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            // SAFETY: `current` is the running thread on this CPU; only it
            // writes its own sleep-state pad before being linked.
            unsafe { current.as_ref() }
                .sleep_state
                .store(SleepState::Initial as u8, Ordering::Release);
            inner.sleepers.push(current);
        }
        sched::scheduler::scheduler_enter(sched::thread::ThreadState::Sleeping);
    }

    /// `wq_sleep_timeout`: sleep on this queue as [`sleep`](Self::sleep)
    /// does, but wake automatically after `timeout_ms` if no [`wakeup`]
    /// arrives first (§4.9). Returns `true` if the timeout fired.
    ///
    /// # Safety
    /// Same contract as [`sleep`](Self::sleep).
    #[cfg(feature = "alloc")]
    pub unsafe fn sleep_timeout(&self, current: ThreadPtr, timeout_ms: u64) -> bool {
        // SAFETY: only the thread running on this CPU writes its own
        // timed-out flag and sleep-state pad before being linked.
        unsafe { current.as_ref() }
            .timed_out
            .store(false, Ordering::Relaxed);

        let timer_id = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            unsafe { current.as_ref() }
                .sleep_state
                .store(SleepState::Initial as u8, Ordering::Release);
            inner.sleepers.push(current);
            timer::create_timer(TimerMode::OneShot, timeout_ms, fire_sleep_timeout)
                .expect("timer subsystem exhausted")
        };
        TIMEOUT_REGISTRY
            .lock()
            .push((timer_id, current, WaitQueuePtr(self as *const WaitQueue)));

        sched::scheduler::scheduler_enter(sched::thread::ThreadState::Sleeping);

        // Resumed: if our timer never fired, it's still in the registry --
        // cancel it and report a real wakeup. If it already fired, the
        // callback removed it for us.
        let still_pending = {
            let mut registry = TIMEOUT_REGISTRY.lock();
            registry
                .iter()
                .position(|e| e.0 == timer_id)
                .map(|pos| registry.remove(pos))
                .is_some()
        };
        if still_pending {
            let _ = timer::cancel_timer(timer_id);
        }

        // SAFETY: `current` is running on this CPU again.
        unsafe { current.as_ref() }.timed_out.load(Ordering::Acquire)
    }

    /// Remove `t` from the sleepers list and run the wake protocol, marking
    /// `t.timed_out` when the timeout is the one that actually wakes it
    /// (i.e. it is still registered as a sleeper here -- a real [`wakeup`]
    /// that already claimed it leaves nothing to do).
    #[cfg(feature = "alloc")]
    fn wake_on_timeout(&self, t: ThreadPtr) {
        {
            let mut inner = self.inner.lock();
            let Some(pos) = inner.sleepers.iter().position(|&s| s == t) else {
                return;
            };
            inner.sleepers.remove(pos);
        }
        // SAFETY: `t` was linked into `sleepers` by `sleep_timeout` and is
        // kept alive by the wait queue's reference on its behalf.
        let thread: &Thread = unsafe { t.as_ref() };
        match thread.sleep_state.compare_exchange(
            SleepState::Initial as u8,
            SleepState::Woke as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                thread.timed_out.store(true, Ordering::Release);
            }
            Err(observed) if observed == SleepState::Asleep as u8 => {
                thread.timed_out.store(true, Ordering::Release);
                sched::scheduler::thread_requeue_sleeping(t);
            }
            Err(_) => {
                // Already woken by a racing real wakeup.
            }
        }
    }

    /// Wake one or all sleepers.
    ///
    /// For each woken thread, CAS the sleep-state pad from `Initial` to
    /// `Woke`. If the CAS instead observes `Asleep` (the scheduler's cleanup
    /// phase already committed the thread to sleep), call
    /// [`sched::scheduler::thread_requeue_sleeping`] to put it back on a run
    /// queue.
    pub fn wakeup(&self, mode: WakeMode) {
        let mut inner = self.inner.lock();
        if inner.sleepers.is_empty() {
            self.missed_wakeups.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let count = match mode {
            WakeMode::One => 1,
            WakeMode::All => inner.sleepers.len(),
        };

        for _ in 0..count {
            let Some(t) = inner.sleepers.pop() else {
                break;
            };
            self.wake_one(t);
        }
    }

    fn wake_one(&self, t: ThreadPtr) {
        // SAFETY: the thread was linked into `sleepers` by `sleep` and is
        // kept alive by the reference the wait queue holds on its behalf.
        let thread: &Thread = unsafe { t.as_ref() };
        match thread.sleep_state.compare_exchange(
            SleepState::Initial as u8,
            SleepState::Woke as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Scheduler cleanup will observe SLEEP_WOKE and requeue.
            }
            Err(observed) if observed == SleepState::Asleep as u8 => {
                sched::scheduler::thread_requeue_sleeping(t);
            }
            Err(_) => {
                // Already woken by a racing waker; nothing to do.
            }
        }
    }

    /// Wake all sleepers and mark the queue closed: further [`sleep`] calls
    /// become no-ops.
    pub fn close(&self) {
        self.wakeup(WakeMode::All);
        self.inner.lock().closed = true;
    }
}

// SAFETY: all access to the sleepers list goes through the internal mutex.
unsafe impl Send for WaitQueue {}
// SAFETY: see above.
unsafe impl Sync for WaitQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_on_empty_queue_counts_as_missed() {
        let wq = WaitQueue::new();
        wq.wakeup(WakeMode::One);
        assert_eq!(wq.missed_wakeups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn close_marks_queue_closed() {
        let wq = WaitQueue::new();
        wq.close();
        assert!(wq.inner.lock().closed);
    }
}
