//! # Kernel synchronization primitives
//!
//! A single spin lock usable from contexts that must not sleep, with an
//! interrupt-saving acquire for locks shared with interrupt handlers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{HostInterrupts, InterruptControl, LocalInterrupts};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
