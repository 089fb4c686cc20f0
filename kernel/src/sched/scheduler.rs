//! Scheduler (C7): the two entry points every suspension point and every
//! CPU's idle loop go through.
//!
//! `scheduler_enter` is the voluntary/involuntary switch path; it resumes
//! in place once some later switch lands back on the caller's context,
//! exactly like a one-shot `setjmp`/`longjmp` pair (§4.7, §6). Because of
//! that, cleanup for "the thread we just switched away from" always reads
//! the per-CPU `previous_thread` slot fresh after a swap returns, rather
//! than closing over a local -- whichever call resumes next is the one
//! responsible for cleaning up whoever it just left.

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::boxed::Box;
use core::sync::atomic::Ordering;

use crate::{
    arch,
    config::{CONFIG_FPU_LAZY, CONFIG_SMP, LOAD_BALANCE_INTERVAL_SECS, TIME_SLICE_MS_PER_LEVEL, TIMER_HZ},
};

use super::{
    cpu::{self, Cpu},
    task::{Task, TaskPtr},
    thread::{FpuContext, SleepState, Thread, ThreadPtr, ThreadState},
};

/// Voluntary/involuntary entry point: the calling thread transitions to
/// `new_state` and the scheduler picks a replacement.
///
/// # Panics
/// If no thread is currently installed on this CPU -- always a caller
/// bug, never a recoverable runtime condition.
pub fn scheduler_enter(new_state: ThreadState) {
    let prev_irq = cpu::interrupts_disable();
    let cpu = cpu::cpu_current();
    let current = cpu
        .current_thread()
        .expect("scheduler_enter: no thread installed on this CPU");

    // SAFETY: only the thread running on this CPU writes its own state
    // here.
    unsafe { current.as_ref() }.set_state(new_state);

    let replacement = cpu.rq.dequeue_best();
    if replacement.is_none() && new_state == ThreadState::Running {
        // Nothing else ready and no reason to give up the CPU.
        cpu::interrupts_restore(prev_irq);
        return;
    }

    if CONFIG_FPU_LAZY {
        arch::context::fpu_disable();
    }

    cpu.set_previous_thread(Some(current));

    match replacement {
        Some((next, prio)) => {
            prepare_to_run_thread(cpu, next, prio);
            cpu.set_current_thread(Some(next));
            // SAFETY: `current` is off every run queue for the duration
            // of the swap (it is the thread being switched away from);
            // `next` was just dequeued and is not aliased elsewhere.
            unsafe {
                arch::context::context_swap(&mut current.as_mut().context, &next.as_ref().context);
            }
        }
        None => {
            cpu.set_current_thread(None);
            let sched_ctx = cpu.scheduler_context.lock();
            // SAFETY: see above; the scheduler context is this CPU's own
            // scratch context, touched only with interrupts disabled.
            unsafe {
                arch::context::context_swap(&mut current.as_mut().context, &sched_ctx);
            }
        }
    }

    // We have resumed -- either directly (something swapped back into
    // `current`), or by `scheduler_run` swapping into its own context and
    // finding us again. Clean up whoever we just left.
    if let Some(prev) = cpu.take_previous_thread() {
        cleanup_after_thread(cpu, prev);
    }
    cpu::interrupts_restore(prev_irq);
}

/// Runs forever on the CPU's dedicated scheduler stack, in the CPU's own
/// context (§4.7). Reached once at boot per CPU and never returns.
pub fn scheduler_run() -> ! {
    let cpu = cpu::cpu_current();
    loop {
        let (next, prio) = find_best_thread(cpu);
        prepare_to_run_thread(cpu, next, prio);
        cpu.set_current_thread(Some(next));

        {
            let mut sched_ctx = cpu.scheduler_context.lock();
            // SAFETY: `next` was just dequeued and is not aliased
            // elsewhere; `sched_ctx` belongs solely to this CPU.
            unsafe {
                arch::context::context_swap(&mut sched_ctx, &next.as_ref().context);
            }
        }

        if let Some(prev) = cpu.take_previous_thread() {
            cleanup_after_thread(cpu, prev);
        }
        cpu.set_current_thread(None);
    }
}

/// `find_best_thread`: block-pick a ready thread, parking the CPU between
/// attempts when the run queue is empty (§4.7 step 1).
fn find_best_thread(cpu: &'static Cpu) -> (ThreadPtr, u8) {
    loop {
        if let Some(found) = cpu.rq.dequeue_best() {
            cpu.set_idle(false);
            return found;
        }
        cpu.set_idle(true);
        maybe_run_load_balancer(cpu);
        cpu::cpu_interruptible_sleep();
    }
}

/// Runs `kcpulb`'s round on the idle path once per `LOAD_BALANCE_INTERVAL_SECS`
/// (§4.8). Modeled as a deadline check here rather than a dedicated pinned
/// kernel thread, since this CPU has nothing else to do while idle anyway.
fn maybe_run_load_balancer(cpu: &'static Cpu) {
    if !CONFIG_SMP {
        return;
    }
    let now = cpu.current_clock_tick.load(Ordering::Relaxed);
    if now < cpu.balance_deadline.load(Ordering::Relaxed) {
        return;
    }
    cpu.balance_deadline
        .store(now + LOAD_BALANCE_INTERVAL_SECS * TIMER_HZ, Ordering::Relaxed);
    super::load_balance::kcpulb_round(cpu);
}

/// Prepare `thread`, just dequeued at priority `prio`, to run on `cpu`
/// (§4.7 step 2).
fn prepare_to_run_thread(cpu: &'static Cpu, thread: ThreadPtr, prio: u8) {
    cpu.rq.relink(cpu.current_clock_tick.load(Ordering::Relaxed), 0);

    // SAFETY: `thread` was just dequeued; nothing else reaches it until
    // it is installed as `current_thread` below.
    let task = unsafe { thread.as_ref() }.task;
    switch_task_if_needed(cpu, task);

    let t: &Thread = unsafe { thread.as_ref() };
    t.set_priority(prio);
    t.set_state(ThreadState::Running);
    t.stolen.store(false, Ordering::Release);

    // SAFETY: exclusive access guaranteed -- `thread` is off every run
    // queue until this function returns and installs it as current.
    unsafe { thread.as_mut() }.last_cpu = Some(cpu.id);

    if CONFIG_FPU_LAZY {
        arch::context::fpu_disable();
    } else {
        restore_fpu_eager(cpu, thread);
    }

    let now = cpu.current_clock_tick.load(Ordering::Relaxed);
    let slice = (prio as u64 + 1) * TIME_SLICE_MS_PER_LEVEL;
    cpu.preempt_deadline.store(now + slice, Ordering::Relaxed);
}

/// Install `incoming_task`'s address space if it differs from the one
/// currently installed, holding/releasing task references per §4.5.
fn switch_task_if_needed(cpu: &'static Cpu, incoming_task: TaskPtr) {
    let outgoing_task = cpu.current_task();

    // SAFETY: `incoming_task` is held by the thread being switched to.
    crate::mm::address_space::install(unsafe { incoming_task.as_ref() }.address_space);

    if outgoing_task != Some(incoming_task) {
        if let Some(prev) = outgoing_task {
            // SAFETY: `prev` was the task this CPU held a reference to
            // since the last switch.
            unsafe { Task::release(prev.as_non_null()) };
        }
        let _ = Task::hold(incoming_task.as_non_null());
        cpu.set_current_task(Some(incoming_task));
    }
}

#[cfg(feature = "alloc")]
fn restore_fpu_eager(cpu: &'static Cpu, thread: ThreadPtr) {
    let _guard = cpu.fpu_lock.lock();
    // SAFETY: exclusive access to `thread`'s FPU slot is guaranteed by
    // the FPU lock plus `thread` being off every run queue.
    let t = unsafe { thread.as_mut() };
    if t.fpu_context.is_none() {
        t.fpu_context = Some(Box::new(FpuContext::new()));
        t.fpu_context_exists = true;
        arch::context::fpu_init();
    } else if let Some(ctx) = t.fpu_context.as_deref() {
        arch::context::fpu_context_restore(ctx);
    }
    arch::context::fpu_enable();
    cpu.set_fpu_owner(Some(thread));
}

#[cfg(not(feature = "alloc"))]
fn restore_fpu_eager(_cpu: &'static Cpu, _thread: ThreadPtr) {}

/// Called from the FPU-unavailable trap when `CONFIG_FPU_LAZY` is set:
/// claims FPU ownership for the current thread, spilling the previous
/// owner's state first if it held one (§4.4).
#[cfg(feature = "alloc")]
pub fn scheduler_fpu_lazy_request() {
    let cpu = cpu::cpu_current();
    let current = cpu
        .current_thread()
        .expect("FPU trap with no thread running on this CPU");

    arch::context::fpu_enable();
    let _guard = cpu.fpu_lock.lock();

    if let Some(owner) = cpu.fpu_owner() {
        if owner != current {
            // SAFETY: the FPU lock serializes against the owner's
            // destructor relinquishing ownership; `owner` last ran on
            // this CPU.
            let owner_mut = unsafe { owner.as_mut() };
            if owner_mut.fpu_context.is_none() {
                owner_mut.fpu_context = Some(Box::new(FpuContext::new()));
                owner_mut.fpu_context_exists = true;
            }
            if let Some(ctx) = owner_mut.fpu_context.as_deref() {
                arch::context::fpu_context_save(ctx);
            }
        }
    }

    // SAFETY: only the thread running on this CPU traps into its own
    // lazy FPU request.
    let current_mut = unsafe { current.as_mut() };
    if current_mut.fpu_context.is_none() {
        current_mut.fpu_context = Some(Box::new(FpuContext::new()));
        current_mut.fpu_context_exists = true;
        arch::context::fpu_init();
    } else if let Some(ctx) = current_mut.fpu_context.as_deref() {
        arch::context::fpu_context_restore(ctx);
    }

    cpu.set_fpu_owner(Some(current));
}

/// `cleanup_after_thread`: dispatches on the state `thread` was set to
/// just before it was switched away from (§4.7). Panics on any state that
/// should never reach this point (panic contract, §6).
fn cleanup_after_thread(cpu: &'static Cpu, thread: ThreadPtr) {
    // SAFETY: the thread we just switched away from is not concurrently
    // accessed by any other CPU until this function re-enqueues or frees
    // it.
    let t: &Thread = unsafe { thread.as_ref() };

    let now = cpu::get_cycle();
    let last = t.last_cycle.swap(now, Ordering::Relaxed);
    t.kcycles.fetch_add(now.saturating_sub(last), Ordering::Relaxed);

    match t.state() {
        ThreadState::Running => {
            // Involuntary preemption: demote and requeue.
            t.demote_priority();
            t.set_state(ThreadState::Ready);
            cpu.rq.enqueue(thread, t.priority());
        }
        ThreadState::Ready => {
            // Voluntary yield (`thread_yield`): requeue at the same
            // priority, no demotion.
            cpu.rq.enqueue(thread, t.priority());
        }
        ThreadState::Exiting => {
            t.join_wq.close();
            #[cfg(feature = "alloc")]
            // SAFETY: `t.task` outlives every thread it owns.
            unsafe {
                t.task.as_ref().unregister_thread(thread);
            }
            // SAFETY: releases the reference this CPU held while the
            // thread was running; may free the thread if no other
            // holder (e.g. a joiner) remains.
            #[cfg(feature = "alloc")]
            unsafe {
                Thread::put(thread.as_non_null());
            }
        }
        ThreadState::Sleeping => {
            match t.sleep_state.compare_exchange(
                SleepState::Initial as u8,
                SleepState::Asleep as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // A waker will see SLEEP_ASLEEP and requeue us.
                }
                Err(observed) if observed == SleepState::Woke as u8 => {
                    // A racing waker already fired; go straight back to
                    // Ready instead of sleeping.
                    t.set_state(ThreadState::Ready);
                    cpu.rq.enqueue(thread, t.priority());
                }
                Err(_) => panic!("sleep-state pad observed in an unreachable state"),
            }
        }
        other => panic!("cleanup_after_thread: unreachable prior state {other:?}"),
    }
}

/// Requeue a thread a waker has just woken, after the scheduler's cleanup
/// phase already committed it to `SLEEP_ASLEEP` (§4.9). Runs at priority
/// 0 on its last CPU, falling back to the calling CPU if it never ran.
pub fn thread_requeue_sleeping(t: ThreadPtr) {
    let prev_irq = cpu::interrupts_disable();
    // SAFETY: the thread is reachable via the wait queue's reference and
    // is not concurrently mutated except through its own atomics until
    // re-enqueued here.
    let thread: &Thread = unsafe { t.as_ref() };
    thread.set_priority(0);
    thread.set_state(ThreadState::Ready);

    let target_id = thread.last_cpu.unwrap_or_else(|| cpu::cpu_current().id);
    cpu::cpu_by_id(target_id).rq.enqueue(t, 0);
    cpu::interrupts_restore(prev_irq);
}

/// Called from the architecture timer interrupt. Advances this CPU's
/// clock tick and forces a switch once `preempt_deadline` is reached
/// (§4.7).
pub fn on_timer_tick() {
    let cpu = cpu::cpu_current();
    let tick = cpu.current_clock_tick.fetch_add(1, Ordering::Relaxed) + 1;
    if tick >= cpu.preempt_deadline.load(Ordering::Relaxed) {
        scheduler_enter(ThreadState::Running);
    }
}
