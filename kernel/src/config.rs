//! Compile-time configuration for the execution core (§6).
//!
//! These are the knobs the scheduler and MMU abstraction are parameterized
//! over. They live here as auditable constants rather than scattered magic
//! numbers through `sched`/`mm`.

/// Number of per-CPU run-queue priority levels. Priority 0 is highest,
/// `RQ_COUNT - 1` lowest.
pub const RQ_COUNT: usize = 16;

/// Ticks between anti-starvation relink passes (§4.6).
pub const NEEDS_RELINK_MAX: u64 = 3;

/// Whether the target architecture has an FPU worth lazily switching.
pub const CONFIG_FPU: bool = true;

/// Whether FPU ownership is claimed lazily (on first trap) rather than
/// eagerly on every switch.
pub const CONFIG_FPU_LAZY: bool = true;

/// Whether the per-CPU load balancer (`kcpulb`, C8) runs at all. Disabled
/// automatically on uniprocessor builds.
pub const CONFIG_SMP: bool = cfg!(feature = "smp");

/// Whether architectures mirror page-table updates into a virtual hash page
/// table cache. The reference x86_64 backend does not implement a VHPT
/// (hardware TLB only); this flag exists so the abstract MMU layer can be
/// exercised uniformly and so a VHPT-capable architecture (ia64-class) has
/// a single switch to flip.
pub const CONFIG_VHPT: bool = false;

/// Milliseconds contributed to `preempt_deadline` per priority level below
/// `RQ_COUNT`, i.e. the default time slice is `(priority + 1) * TIME_SLICE_MS_PER_LEVEL`.
pub const TIME_SLICE_MS_PER_LEVEL: u64 = 10;

/// Maximum number of CPUs this build supports. Per-CPU arrays are sized
/// statically at this bound.
pub const MAX_CPUS: usize = 32;

/// Seconds the load balancer sleeps between rounds on a CPU with no
/// imbalance.
pub const LOAD_BALANCE_INTERVAL_SECS: u64 = 1;

/// Preemption timer frequency; one clock tick fires this many times a
/// second (§4.7, §4.8). `LOAD_BALANCE_INTERVAL_SECS * TIMER_HZ` gives the
/// tick count between `kcpulb` rounds.
pub const TIMER_HZ: u64 = 100;

/// Runtime snapshot of the above, captured once at boot (CPU count is only
/// known after the architecture layer enumerates APICs/cores).
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub cpu_count: usize,
    pub smp_enabled: bool,
}

impl KernelConfig {
    pub const fn new(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            smp_enabled: CONFIG_SMP && cpu_count > 1,
        }
    }
}
