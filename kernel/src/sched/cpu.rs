//! CPU abstraction (C1): the per-CPU singleton every other component hangs
//! off of.
//!
//! Modeled per design note 9 as a fixed-size table of CPU-local cells,
//! indexed by CPU id and accessed only with interrupts disabled. There is
//! no destruction path -- a CPU record is created at boot and lives for
//! the life of the kernel.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::{
    arch::{self, InterruptToken},
    config::MAX_CPUS,
};

use super::{
    queue::ReadyQueue,
    task::TaskPtr,
    thread::ThreadPtr,
};

/// Per-CPU singleton record (§3).
pub struct Cpu {
    pub id: u8,
    active: AtomicBool,
    /// Thread currently executing on this CPU, if any.
    current_thread: Mutex<Option<ThreadPtr>>,
    /// Thread that was running immediately before the last swap, kept only
    /// long enough for `cleanup_after_thread` to run against it.
    previous_thread: Mutex<Option<ThreadPtr>>,
    /// Task installed as the current address space owner.
    current_task: Mutex<Option<TaskPtr>>,
    /// FPU-owner thread, relaxed-atomic per the concurrency model (§5);
    /// coherence comes from `fpu_lock`, not from the ordering on this
    /// pointer.
    fpu_owner: Mutex<Option<ThreadPtr>>,
    pub fpu_lock: Mutex<()>,
    /// This CPU's ready queues.
    pub rq: ReadyQueue,
    /// Scheduler's own saved context, used when there is no replacement
    /// thread and `scheduler_run` must resume its own loop.
    pub scheduler_context: Mutex<crate::arch::context::ArchThreadContext>,
    pub current_clock_tick: AtomicU64,
    pub preempt_deadline: AtomicU64,
    /// Next tick at which this CPU's `kcpulb` round is due (§4.8).
    pub balance_deadline: AtomicU64,
    idle: AtomicBool,
    pub cycle_counter: AtomicU64,
}

// SAFETY: interior fields are either atomics or spinlock-guarded; `Cpu` is
// only ever reached through `with_cpu_local`/`cpu_table`, never moved.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new(id: u8) -> Self {
        Self {
            id,
            active: AtomicBool::new(false),
            current_thread: Mutex::new(None),
            previous_thread: Mutex::new(None),
            current_task: Mutex::new(None),
            fpu_owner: Mutex::new(None),
            fpu_lock: Mutex::new(()),
            rq: ReadyQueue::new(),
            scheduler_context: Mutex::new(crate::arch::context::ArchThreadContext::const_new()),
            current_clock_tick: AtomicU64::new(0),
            preempt_deadline: AtomicU64::new(0),
            balance_deadline: AtomicU64::new(0),
            idle: AtomicBool::new(true),
            cycle_counter: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    pub fn current_thread(&self) -> Option<ThreadPtr> {
        *self.current_thread.lock()
    }

    pub fn set_current_thread(&self, t: Option<ThreadPtr>) {
        *self.current_thread.lock() = t;
    }

    pub fn take_previous_thread(&self) -> Option<ThreadPtr> {
        self.previous_thread.lock().take()
    }

    pub fn set_previous_thread(&self, t: Option<ThreadPtr>) {
        *self.previous_thread.lock() = t;
    }

    pub fn current_task(&self) -> Option<TaskPtr> {
        *self.current_task.lock()
    }

    pub fn set_current_task(&self, t: Option<TaskPtr>) {
        *self.current_task.lock() = t;
    }

    pub fn fpu_owner(&self) -> Option<ThreadPtr> {
        *self.fpu_owner.lock()
    }

    pub fn set_fpu_owner(&self, t: Option<ThreadPtr>) {
        *self.fpu_owner.lock() = t;
    }
}

static CPUS: crate::sync::LazyLock<[Cpu; MAX_CPUS]> =
    crate::sync::LazyLock::new(|| core::array::from_fn(|i| Cpu::new(i as u8)));

/// Number of CPUs actually brought up at boot.
static ACTIVE_CPUS: AtomicU8 = AtomicU8::new(1);

pub fn active_cpu_count() -> u8 {
    ACTIVE_CPUS.load(Ordering::Relaxed)
}

pub fn set_active_cpu_count(n: u8) {
    ACTIVE_CPUS.store(n, Ordering::Relaxed);
    let table: &'static [Cpu; MAX_CPUS] = CPUS.force();
    for cpu in table.iter().take(n as usize) {
        cpu.activate();
    }
}

/// `cpu_local_data()`: the per-CPU record for the CPU index given by the
/// architecture layer. Never fails -- CPU 0 always exists.
pub fn cpu_by_id(id: u8) -> &'static Cpu {
    let table: &'static [Cpu; MAX_CPUS] = CPUS.force();
    &table[id as usize]
}

pub fn all_active_cpus() -> impl Iterator<Item = &'static Cpu> {
    let table: &'static [Cpu; MAX_CPUS] = CPUS.force();
    table.iter().filter(|c| c.is_active())
}

/// `cpu_current()`: the record for the CPU executing this code.
pub fn cpu_current() -> &'static Cpu {
    cpu_by_id(arch::current_cpu_id())
}

/// `interrupts_disable()` -- returns an opaque priority-level token.
/// Idempotent and nestable: disabling twice and restoring twice returns
/// interrupts to their original state (§8 round-trip law).
#[must_use]
pub fn interrupts_disable() -> InterruptToken {
    arch::interrupts_disable()
}

/// `interrupts_restore(prev)` -- restore the token returned by a matching
/// `interrupts_disable`.
pub fn interrupts_restore(prev: InterruptToken) {
    arch::interrupts_restore(prev);
}

/// `cpu_interruptible_sleep()`: halt with interrupts enabled until the next
/// interrupt. The only place the scheduler blocks when no work exists.
pub fn cpu_interruptible_sleep() {
    arch::idle_wait_for_interrupt();
}

/// `get_cycle()`: a monotonic cycle counter used for `kcycles` accounting.
pub fn get_cycle() -> u64 {
    arch::read_cycle_counter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_zero_starts_inactive_and_idle() {
        let cpu = cpu_by_id(0);
        assert!(cpu.is_idle());
    }

    #[test]
    fn activate_sets_active_flag() {
        let cpu = cpu_by_id(1);
        cpu.activate();
        assert!(cpu.is_active());
    }
}
