//! Scheduler bring-up: detect the CPU count, activate the per-CPU records,
//! and arm the preemption timer (§4.7).

use super::cpu;

/// Initialize the execution core after the architecture layer has brought
/// up interrupts and (on x86_64) ACPI/APIC enumeration.
pub fn init() {
    let detected = detected_cpu_count();
    cpu::set_active_cpu_count(detected as u8);
    log::info!("scheduler: {detected} CPU(s) active");

    setup_preemption_timer();
}

#[cfg(target_arch = "x86_64")]
fn detected_cpu_count() -> usize {
    crate::arch::x86_64::acpi::with_acpi_info(|info| info.cpu_count())
        .filter(|&n| n > 0)
        .unwrap_or(1)
        .min(crate::config::MAX_CPUS)
}

#[cfg(not(target_arch = "x86_64"))]
fn detected_cpu_count() -> usize {
    1
}

/// Arm the architecture timer at [`crate::config::TIMER_HZ`] so
/// `scheduler::on_timer_tick` runs often enough to honor time slices and
/// the load balancer's round interval.
fn setup_preemption_timer() {
    let period_ms = 1000 / crate::config::TIMER_HZ;
    #[cfg(target_arch = "x86_64")]
    {
        crate::arch::x86_64::timer::setup_timer(period_ms as u32);
        log::info!("scheduler: x86_64 timer armed at {period_ms}ms");
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = period_ms;
    }
}
