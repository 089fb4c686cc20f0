//! Architecture-independent context management interface (§6).
//!
//! Defines the common interface for thread register contexts that every
//! architecture backend implements, plus the free functions the scheduler
//! calls without caring which backend is active.

/// Thread context trait. Implemented once per architecture backend.
#[allow(dead_code)]
pub trait ThreadContext: Sized {
    /// Create an empty context, not yet wired to any thread.
    fn new() -> Self;

    /// Initialize this context to start executing at `entry_point` on
    /// `stack_pointer`, with `kernel_stack` recorded for the next trap into
    /// the kernel (ring transitions, interrupts).
    fn init(&mut self, entry_point: usize, stack_pointer: usize, kernel_stack: usize);

    fn get_instruction_pointer(&self) -> usize;
    fn set_instruction_pointer(&mut self, ip: usize);

    fn get_stack_pointer(&self) -> usize;
    fn set_stack_pointer(&mut self, sp: usize);

    fn get_kernel_stack(&self) -> usize;
    fn set_kernel_stack(&mut self, sp: usize);

    /// Set the value a syscall/fork return sees in the caller's return
    /// register.
    fn set_return_value(&mut self, value: usize);

    fn clone_from(&mut self, other: &Self);
}

/// Architecture-specific thread context type. x86_64 is the reference
/// backend (§1); every other target architecture shares the `stub`
/// backend, which implements the same interface with the minimum state
/// needed to exercise the scheduler (§1 non-goal: one abstract interface,
/// not a back-end per architecture).
#[allow(dead_code)]
#[cfg(target_arch = "x86_64")]
pub type ArchThreadContext = crate::arch::x86_64::context::X86_64Context;

#[allow(dead_code)]
#[cfg(not(target_arch = "x86_64"))]
pub type ArchThreadContext = crate::arch::stub::StubContext;

/// Swap the currently-running context for `to`, saving the caller's live
/// register state into `from` first. Called by `scheduler_run` with
/// interrupts already disabled (§4.7).
///
/// # Safety
/// Must be called with interrupts disabled. `from` and `to` must both be
/// live, correctly-initialized contexts for the architecture.
#[allow(dead_code)]
pub unsafe fn context_swap(from: &mut ArchThreadContext, to: &ArchThreadContext) {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::context::switch_context(from, to);

    #[cfg(not(target_arch = "x86_64"))]
    crate::arch::stub::switch_context(from, to);
}

/// Initialize FPU/SIMD state for the current CPU. Called once per CPU at
/// boot, regardless of `CONFIG_FPU_LAZY` (§6).
#[allow(dead_code)]
pub fn fpu_init() {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::context::init_fpu();

    #[cfg(not(target_arch = "x86_64"))]
    crate::arch::stub::init_fpu();
}

/// Save the current FPU/SIMD state into `state`. Used by the lazy FPU
/// switch when the outgoing thread owned the FPU (§4.7).
#[allow(dead_code)]
pub fn fpu_context_save(state: &mut crate::sched::thread::FpuContext) {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::context::save_fpu_state(&mut state.state);

    #[cfg(not(target_arch = "x86_64"))]
    crate::arch::stub::save_fpu_state(&mut state.state);
}

/// Restore a previously saved FPU/SIMD state. Used when the incoming
/// thread is about to be granted FPU ownership (§4.7).
#[allow(dead_code)]
pub fn fpu_context_restore(state: &crate::sched::thread::FpuContext) {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::context::restore_fpu_state(&state.state);

    #[cfg(not(target_arch = "x86_64"))]
    crate::arch::stub::restore_fpu_state(&state.state);
}

/// Allow FPU/SIMD instructions to execute without trapping. Called once
/// ownership has been granted to the current thread.
#[allow(dead_code)]
pub fn fpu_enable() {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::context::fpu_enable();
}

/// Make the next FPU/SIMD instruction trap, so ownership can be resolved
/// lazily. Called on every scheduler switch when `CONFIG_FPU_LAZY` is set
/// (§4.4, §4.7).
#[allow(dead_code)]
pub fn fpu_disable() {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::context::fpu_disable();
}
