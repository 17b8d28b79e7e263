//! Local interrupt masking used by [`SpinLock::lock_irqsave`](crate::SpinLock::lock_irqsave).
//!
//! A lock that may be taken from interrupt context must be held with local
//! interrupts masked, otherwise a handler running on the same CPU can spin
//! forever on a lock its own CPU already owns. [`InterruptControl`] abstracts
//! the "save, disable, restore" triple so the lock works both on bare metal
//! and in hosted test builds.
//!
//! # Platform
//!
//! [`LocalInterrupts`] resolves to [`X86Interrupts`] on bare-metal `x86_64`
//! (`target_os = "none"`) and to [`HostInterrupts`] everywhere else.

/// Save/disable/restore of the local interrupt state.
pub trait InterruptControl {
    /// Snapshot of the interrupt state taken before disabling.
    type State: Copy;

    /// Disable local interrupts and return the previous state.
    fn save_and_disable() -> Self::State;

    /// Restore a state previously returned by [`save_and_disable`](Self::save_and_disable).
    fn restore(state: Self::State);
}

/// No-op interrupt control for hosted builds (unit tests, tools).
///
/// User space cannot mask interrupts; the lock still provides mutual
/// exclusion, only the interrupt masking is skipped.
#[derive(Debug, Copy, Clone, Default)]
pub struct HostInterrupts;

impl InterruptControl for HostInterrupts {
    type State = ();

    #[inline]
    fn save_and_disable() -> Self::State {}

    #[inline]
    fn restore((): Self::State) {}
}

/// `cli`/`sti` based interrupt control for ring 0 on `x86_64`.
///
/// # Safety & Privilege
///
/// Must only be used where `cli`/`sti` are legal (kernel or a suitable
/// hypervisor context).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[derive(Debug, Copy, Clone, Default)]
pub struct X86Interrupts;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl X86Interrupts {
    /// `IF` bit in `RFLAGS`.
    const IF: u64 = 1 << 9;

    #[inline]
    fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl InterruptControl for X86Interrupts {
    /// Whether `IF` was set.
    type State = bool;

    #[inline]
    fn save_and_disable() -> bool {
        let enabled = Self::rflags() & Self::IF != 0;
        if enabled {
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        enabled
    }

    #[inline]
    fn restore(were_enabled: bool) {
        if were_enabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

/// The interrupt control of the current target.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub type LocalInterrupts = X86Interrupts;

/// The interrupt control of the current target.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub type LocalInterrupts = HostInterrupts;
