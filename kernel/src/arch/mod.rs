//! Architecture abstraction layer.
//!
//! x86_64 is the reference backend (§1). Every other target shares the
//! `stub` backend, which implements the same interface (context, FPU,
//! interrupt control, cycle counter) with the minimum logic needed to
//! exercise the scheduler on a second architecture -- this crate does not
//! carry a full port per architecture (§1 non-goal).

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(not(target_arch = "x86_64"))]
pub mod stub;

pub mod context;

/// Opaque record of whether interrupts were enabled before
/// `interrupts_disable`, returned to `interrupts_restore` to restore
/// exactly that state rather than unconditionally re-enabling (§4.1).
#[must_use]
pub struct InterruptToken(bool);

/// The calling CPU's index into the per-CPU table (§4.1). Backed by the
/// local APIC id on x86_64; always 0 on the stub architecture, which never
/// runs SMP.
#[cfg(target_arch = "x86_64")]
pub fn current_cpu_id() -> u8 {
    // TODO(smp): read the local APIC id once APIC enumeration lands;
    // single-core boot runs entirely as CPU 0 until then.
    0
}

#[cfg(not(target_arch = "x86_64"))]
pub fn current_cpu_id() -> u8 {
    0
}

/// Disable interrupts on the calling CPU, returning a token recording
/// whether they were enabled beforehand.
#[cfg(target_arch = "x86_64")]
pub fn interrupts_disable() -> InterruptToken {
    let was_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    InterruptToken(was_enabled)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn interrupts_disable() -> InterruptToken {
    InterruptToken(false)
}

/// Restore the interrupt state recorded by a prior `interrupts_disable`.
#[cfg(target_arch = "x86_64")]
pub fn interrupts_restore(prev: InterruptToken) {
    if prev.0 {
        x86_64::instructions::interrupts::enable();
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn interrupts_restore(_prev: InterruptToken) {}

/// Park the CPU until the next interrupt. Used by the idle thread and by
/// `kcpulb`'s no-work sleep (§4.8).
#[cfg(target_arch = "x86_64")]
pub fn idle_wait_for_interrupt() {
    x86_64::instructions::hlt();
}

#[cfg(not(target_arch = "x86_64"))]
pub fn idle_wait_for_interrupt() {}

/// Free-running cycle counter, used for `kcycles`/`ucycles` accounting
/// (§4.4, §4.7) and for `preempt_deadline` comparisons.
#[cfg(target_arch = "x86_64")]
pub fn read_cycle_counter() -> u64 {
    // SAFETY: RDTSC is unprivileged and has no side effects beyond
    // reading the timestamp counter.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn read_cycle_counter() -> u64 {
    0
}
