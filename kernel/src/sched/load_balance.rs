//! Load balancer (C8): `kcpulb`, a pinned kernel thread per CPU that sleeps
//! between rounds and steals ready threads from overloaded CPUs (§4.8).

use core::sync::atomic::Ordering;

use crate::config::RQ_COUNT;

use super::{
    cpu::{self, Cpu},
    queue::GLOBAL_NRDY,
    thread::ThreadPtr,
};

/// One balancing round on the calling CPU. Returns once either the deficit
/// is resolved or a full sweep found nothing left to steal.
///
/// Invoked only from the idle path (there is no separate pinned thread to
/// yield from here), so a round that actually steals work simply loops:
/// the caller's own run-queue scan on the next iteration is the "retry"
/// called for by step 5 of the algorithm.
pub fn kcpulb_round(this: &'static Cpu) {
    loop {
        let active = cpu::active_cpu_count().max(1) as u64;
        let average = GLOBAL_NRDY.load(Ordering::Relaxed) / active + 1;
        let rdy = this.rq.nrdy();

        if rdy >= average {
            return;
        }

        let mut stole_any = false;
        for prio in 0..RQ_COUNT as u8 {
            for other in cpu::all_active_cpus() {
                if other.id == this.id {
                    continue;
                }
                if other.rq.nrdy() <= average {
                    continue;
                }
                if let Some(thread) = steal_thread_from(this, other, prio) {
                    this.rq.push_stolen(thread, prio);
                    stole_any = true;
                }
            }
        }

        if !stole_any {
            return;
        }
    }
}

/// Attempt to steal one thread at `prio` from `source`, walking its
/// run-queue tail-first and skipping threads that are CPU-wired, already
/// `stolen`, or FPU-resident on `source`. Skipped threads are restored to
/// the list rather than abandoning the whole priority, so a single wired
/// tail thread no longer hides stealable threads ahead of it. Locks are
/// taken source-then-destination and never held across a call back into
/// the destination queue (§4.8).
fn steal_thread_from(dest: &Cpu, source: &Cpu, prio: u8) -> Option<ThreadPtr> {
    let candidate = source.rq.steal_first_at(prio, |ptr| {
        // SAFETY: each candidate is off every run queue for the duration of
        // this check; no other CPU can be touching it concurrently.
        let t = unsafe { ptr.as_ref() };
        let wired = t.nomigrate.load(Ordering::Relaxed) > 0;
        let already_stolen = t.stolen.load(Ordering::Relaxed);
        let fpu_resident = source.fpu_owner() == Some(ptr);
        wired || already_stolen || fpu_resident
    })?;

    // SAFETY: the thread was just removed from `source`'s run queue and is
    // not skip-eligible, so exclusive access is safe.
    let t = unsafe { candidate.as_ref() };
    t.stolen.store(true, Ordering::Relaxed);
    unsafe { candidate.as_mut() }.last_cpu = Some(dest.id);
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use super::*;
    use crate::sched::{task::TaskPtr, thread::Thread};

    fn leak_thread() -> ThreadPtr {
        extern crate alloc;
        use alloc::boxed::Box;

        let task_ptr: NonNull<crate::sched::task::Task> = NonNull::dangling();
        let t = Thread::new(TaskPtr::new(task_ptr), 0, 0, 0);
        let boxed = Box::new(t);
        ThreadPtr::new(NonNull::from(Box::leak(boxed)))
    }

    #[test]
    fn wired_thread_is_not_stolen() {
        let source = cpu::cpu_by_id(4);
        let dest = cpu::cpu_by_id(5);
        let t = leak_thread();
        unsafe { t.as_ref() }.nomigrate.fetch_add(1, Ordering::Relaxed);
        source.rq.enqueue(t, 2);

        assert!(steal_thread_from(dest, source, 2).is_none());
        assert_eq!(source.rq.nrdy(), 1);
    }

    #[test]
    fn unwired_thread_is_stolen_and_retargeted() {
        let source = cpu::cpu_by_id(6);
        let dest = cpu::cpu_by_id(7);
        let t = leak_thread();
        source.rq.enqueue(t, 3);

        let stolen = steal_thread_from(dest, source, 3).expect("steal should succeed");
        assert!(unsafe { stolen.as_ref() }.stolen.load(Ordering::Relaxed));
        assert_eq!(unsafe { stolen.as_ref() }.last_cpu, Some(dest.id));
        assert_eq!(source.rq.nrdy(), 0);
    }

    #[test]
    fn wired_tail_does_not_hide_stealable_thread_ahead_of_it() {
        let source = cpu::cpu_by_id(8);
        let dest = cpu::cpu_by_id(9);
        let stealable = leak_thread();
        let wired = leak_thread();
        unsafe { wired.as_ref() }
            .nomigrate
            .fetch_add(1, Ordering::Relaxed);
        source.rq.enqueue(stealable, 1);
        source.rq.enqueue(wired, 1);

        let stolen = steal_thread_from(dest, source, 1).expect("stealable thread ahead of the wired tail should be found");
        assert_eq!(stolen, stealable);
        // The wired thread must still be queued on its own CPU.
        assert_eq!(source.rq.nrdy(), 1);
    }

    #[test]
    fn fpu_resident_tail_does_not_hang_the_walk() {
        let source = cpu::cpu_by_id(10);
        let dest = cpu::cpu_by_id(11);
        let fpu_owner = leak_thread();
        source.set_fpu_owner(Some(fpu_owner));
        source.rq.enqueue(fpu_owner, 6);

        // The only candidate is FPU-resident: the walk must terminate and
        // report nothing stealable rather than looping forever.
        assert!(steal_thread_from(dest, source, 6).is_none());
        assert_eq!(source.rq.nrdy(), 1);
    }
}
