//! Per-CPU ready queues (C6).
//!
//! `RQ_COUNT` fixed-capacity FIFO lists, one lock per priority level.
//! `rq_dequeue_best` and `rq_relink` never hold more than one list's lock
//! at a time (§4.6).

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::config::{NEEDS_RELINK_MAX, RQ_COUNT};

use super::thread::ThreadPtr;

/// Slots per priority list. Generous enough for test fixtures and small
/// demo workloads; production sizing is a capacity-planning knob, not a
/// correctness one (a full list degrades to a blocking enqueue).
const MAX_THREADS_PER_LIST: usize = 256;

struct PriorityList {
    threads: [Option<ThreadPtr>; MAX_THREADS_PER_LIST],
    head: usize,
    len: usize,
}

impl PriorityList {
    const fn new() -> Self {
        Self {
            threads: [None; MAX_THREADS_PER_LIST],
            head: 0,
            len: 0,
        }
    }

    fn push_back(&mut self, t: ThreadPtr) -> bool {
        if self.len == MAX_THREADS_PER_LIST {
            return false;
        }
        let tail = (self.head + self.len) % MAX_THREADS_PER_LIST;
        self.threads[tail] = Some(t);
        self.len += 1;
        true
    }

    fn pop_front(&mut self) -> Option<ThreadPtr> {
        if self.len == 0 {
            return None;
        }
        let t = self.threads[self.head].take();
        self.head = (self.head + 1) % MAX_THREADS_PER_LIST;
        self.len -= 1;
        t
    }

    /// Drain every entry into `other`, preserving FIFO order, used by
    /// `rq_relink` to concatenate the start+1 list onto `start`.
    fn drain_into(&mut self, other: &mut PriorityList) {
        while let Some(t) = self.pop_front() {
            other.push_back(t);
        }
    }
}

/// A single CPU's set of `RQ_COUNT` priority lists.
pub struct ReadyQueue {
    lists: [Mutex<PriorityList>; RQ_COUNT],
    /// Ready threads owned by this CPU; kept equal to the sum of list
    /// lengths (invariant 1, §8).
    nrdy: AtomicU64,
    pub relink_deadline: AtomicU64,
}

/// Global ready-thread count, summed across active CPUs (invariant 2, §8).
pub static GLOBAL_NRDY: AtomicU64 = AtomicU64::new(0);

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub const fn new() -> Self {
        const EMPTY: Mutex<PriorityList> = Mutex::new(PriorityList::new());
        Self {
            lists: [EMPTY; RQ_COUNT],
            nrdy: AtomicU64::new(0),
            relink_deadline: AtomicU64::new(0),
        }
    }

    pub fn nrdy(&self) -> u64 {
        self.nrdy.load(Ordering::Relaxed)
    }

    /// `rq_enqueue`: push `thread` onto priority list `prio` and bump both
    /// the per-CPU and global ready counters.
    pub fn enqueue(&self, thread: ThreadPtr, prio: u8) {
        debug_assert!((prio as usize) < RQ_COUNT);
        let ok = self.lists[prio as usize].lock().push_back(thread);
        debug_assert!(ok, "ready list overflow at priority {prio}");
        self.nrdy.fetch_add(1, Ordering::Relaxed);
        GLOBAL_NRDY.fetch_add(1, Ordering::Relaxed);
    }

    /// `rq_dequeue_best`: scan priority 0..RQ_COUNT, return the first
    /// thread found along with the priority list it came from -- `relink`
    /// may have moved it since it was last enqueued, so the list index is
    /// the authoritative priority (invariant 4, §8), not whatever the
    /// thread's own field said before this call.
    pub fn dequeue_best(&self) -> Option<(ThreadPtr, u8)> {
        for (prio, list) in self.lists.iter().enumerate() {
            let mut guard = list.lock();
            if let Some(t) = guard.pop_front() {
                drop(guard);
                self.nrdy.fetch_sub(1, Ordering::Relaxed);
                GLOBAL_NRDY.fetch_sub(1, Ordering::Relaxed);
                return Some((t, prio as u8));
            }
        }
        None
    }

    /// Remove the tail-most thread at `prio` without adjusting the ready
    /// counters, used internally to walk the list from the tail inward.
    fn pop_tail_at(&self, prio: u8) -> Option<ThreadPtr> {
        let mut guard = self.lists[prio as usize].lock();
        if guard.len == 0 {
            return None;
        }
        let tail_idx = (guard.head + guard.len - 1) % MAX_THREADS_PER_LIST;
        let t = guard.threads[tail_idx].take();
        if t.is_some() {
            guard.len -= 1;
        }
        t
    }

    /// Reinsert a thread at the tail of `prio` without adjusting the ready
    /// counters, the inverse of [`Self::pop_tail_at`].
    fn push_back_at(&self, prio: u8, t: ThreadPtr) {
        self.lists[prio as usize].lock().push_back(t);
    }

    /// Pop the tail-most thread at `prio` without disturbing ordering of
    /// the rest, used by the load balancer's steal (§4.8).
    pub fn try_steal_at(&self, prio: u8) -> Option<ThreadPtr> {
        let t = self.pop_tail_at(prio)?;
        self.nrdy.fetch_sub(1, Ordering::Relaxed);
        GLOBAL_NRDY.fetch_sub(1, Ordering::Relaxed);
        Some(t)
    }

    /// Walk the list at `prio` from the tail inward, setting aside every
    /// thread for which `is_skip` returns true, and remove the first one
    /// that isn't skipped. The set-aside threads are reinserted at the
    /// tail in their original relative order before returning, so a run
    /// of unstealable threads at the tail never blocks threads further in
    /// and the walk is always bounded by the list's length (§4.8).
    #[cfg(feature = "alloc")]
    pub fn steal_first_at<F>(&self, prio: u8, mut is_skip: F) -> Option<ThreadPtr>
    where
        F: FnMut(ThreadPtr) -> bool,
    {
        extern crate alloc;
        use alloc::vec::Vec;

        let mut skipped: Vec<ThreadPtr> = Vec::new();
        let mut found = None;
        loop {
            match self.pop_tail_at(prio) {
                None => break,
                Some(candidate) => {
                    if is_skip(candidate) {
                        skipped.push(candidate);
                    } else {
                        found = Some(candidate);
                        break;
                    }
                }
            }
        }

        for t in skipped.into_iter().rev() {
            self.push_back_at(prio, t);
        }

        if found.is_some() {
            self.nrdy.fetch_sub(1, Ordering::Relaxed);
            GLOBAL_NRDY.fetch_sub(1, Ordering::Relaxed);
        }
        found
    }

    pub fn push_stolen(&self, thread: ThreadPtr, prio: u8) {
        self.enqueue(thread, prio);
    }

    /// `rq_relink(cpu, start)`: anti-starvation relink. Every list at
    /// priority `> start` is moved up one level, then the old
    /// `start + 1` list is concatenated onto `start`. A no-op when
    /// `start == RQ_COUNT - 1` (boundary behavior, §8).
    pub fn relink(&self, now: u64, start: u8) {
        if now < self.relink_deadline.load(Ordering::Relaxed) {
            return;
        }
        self.relink_deadline
            .store(now + NEEDS_RELINK_MAX, Ordering::Relaxed);

        if start as usize >= RQ_COUNT - 1 {
            return;
        }

        // Move every list at priority > start up one level, highest first
        // so no thread is moved twice in this pass.
        for prio in ((start as usize + 1)..RQ_COUNT).rev() {
            let (lower, upper) = self.lists.split_at(prio);
            let mut dst = lower[prio - 1].lock();
            let mut src = upper[0].lock();
            src.drain_into(&mut dst);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use super::*;
    use crate::sched::{task::TaskPtr, thread::Thread};

    fn leak_thread() -> ThreadPtr {
        extern crate alloc;
        use alloc::boxed::Box;

        // A thread needs a task pointer; fabricate a dangling-but-unused
        // one since these tests never dereference `task`.
        let task_ptr: NonNull<crate::sched::task::Task> = NonNull::dangling();
        let t = Thread::new(TaskPtr::new(task_ptr), 0, 0, 0);
        let boxed = Box::new(t);
        ThreadPtr::new(NonNull::from(Box::leak(boxed)))
    }

    #[test]
    fn fifo_within_priority() {
        let rq = ReadyQueue::new();
        let a = leak_thread();
        let b = leak_thread();
        let c = leak_thread();
        rq.enqueue(a, 3);
        rq.enqueue(b, 3);
        rq.enqueue(c, 3);
        assert_eq!(rq.dequeue_best(), Some((a, 3)));
        assert_eq!(rq.dequeue_best(), Some((b, 3)));
        assert_eq!(rq.dequeue_best(), Some((c, 3)));
        assert_eq!(rq.dequeue_best(), None);
    }

    #[test]
    fn nrdy_tracks_enqueue_dequeue() {
        let rq = ReadyQueue::new();
        let a = leak_thread();
        rq.enqueue(a, 5);
        assert_eq!(rq.nrdy(), 1);
        rq.dequeue_best();
        assert_eq!(rq.nrdy(), 0);
    }

    #[test]
    fn relink_at_highest_priority_is_noop() {
        let rq = ReadyQueue::new();
        rq.relink(1_000_000, (RQ_COUNT - 1) as u8);
        assert_eq!(rq.nrdy(), 0);
    }

    #[test]
    fn relink_moves_starving_work_up() {
        let rq = ReadyQueue::new();
        let a = leak_thread();
        let b = leak_thread();
        let c = leak_thread();
        rq.enqueue(a, 2);
        rq.enqueue(b, 3);
        rq.enqueue(c, 3);
        rq.relink(rq.relink_deadline.load(Ordering::Relaxed), 2);
        assert_eq!(rq.dequeue_best(), Some((a, 2)));
        assert_eq!(rq.dequeue_best(), Some((b, 2)));
        assert_eq!(rq.dequeue_best(), Some((c, 2)));
    }

    #[test]
    fn steal_from_empty_queue_is_noop() {
        let rq = ReadyQueue::new();
        assert_eq!(rq.try_steal_at(0), None);
        assert_eq!(rq.nrdy(), 0);
    }
}
