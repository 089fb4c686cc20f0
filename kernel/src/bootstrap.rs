//! Kernel boot sequence: brings up the architecture layer, memory
//! management and the execution core in order, then hands off to the
//! scheduler for good.

#[cfg(target_arch = "x86_64")]
use crate::arch::x86_64::bootstrap as stage;

/// Runs once on the bootstrap CPU. Never returns -- the last step enters
/// [`crate::sched::scheduler_run`], which loops forever.
pub fn run() -> ! {
    #[cfg(target_arch = "x86_64")]
    stage::stage1_start();
    crate::logging::init();
    crate::arch::init();
    crate::irq::init().expect("irq manager double-init");
    crate::timer::init().expect("timer wheel double-init");
    #[cfg(target_arch = "x86_64")]
    stage::stage1_complete();

    #[cfg(target_arch = "x86_64")]
    stage::stage2_start();
    crate::mm::init();
    #[cfg(target_arch = "x86_64")]
    stage::stage2_complete();

    #[cfg(target_arch = "x86_64")]
    stage::stage5_start();
    crate::sched::init::init();
    #[cfg(target_arch = "x86_64")]
    stage::stage5_complete();

    crate::sched::scheduler_run();
}
