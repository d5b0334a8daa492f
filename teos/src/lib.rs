//! # TeOS: a teaching operating system, modeled
//!
//! TeOS is the privileged layer of a small teaching operating system,
//! re-expressed as a deterministic, host-runnable model. It carries the
//! pieces that user-space memory-management code is built against:
//!
//! - typed virtual and physical addresses and the user address-space layout
//!   ([`addressing`]),
//! - a reference-counted physical frame pool with a fixed capacity
//!   ([`mm`]),
//! - a two-level page table with per-entry permission bits
//!   ([`mm::page_table`]),
//! - an environment table with generation-encoded identifiers ([`env`]),
//! - and the system-call surface a user environment drives: context
//!   duplication, page allocation and mapping, status control, and
//!   synchronous page-fault delivery to a registered upcall ([`kernel`]).
//!
//! Everything is ordinary safe Rust operating on owned state, so the exact
//! same permission checks, reference counts, and fault protocols that a
//! real kernel enforces in hardware can be exercised from plain `cargo
//! test`. Nothing here is asynchronous: an access either succeeds, resolves
//! through exactly one upcall invocation, or aborts the owning environment.
//!
//! The crate does not install a logger; diagnostics go through the [`log`]
//! facade and appear only if the embedding test or host wires a logger up.

#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod addressing;
pub mod env;
pub mod kernel;
pub mod mm;

pub use kernel::{CloneReturn, FaultCode, FaultFrame, FaultUpcall, Kernel};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of failure a system call or
/// user-memory access can report. The discriminants are the negative error
/// codes handed back across the system-call boundary, so a raw `isize`
/// return value and a [`KernelError`] convert into each other losslessly.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(isize)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted = -1,
    /// No such environment. (ENOENT)
    NoSuchEntry = -2,
    /// Out of memory: frame pool or environment table exhausted. (ENOMEM)
    NoMemory = -12,
    /// Permission denied. (EACCES)
    InvalidAccess = -13,
    /// Bad address. (EFAULT)
    BadAddress = -14,
    /// Resource busy. (EBUSY)
    Busy = -16,
    /// Invalid argument. (EINVAL)
    InvalidArgument = -22,
}

impl KernelError {
    /// Converts the [`KernelError`] into the raw `usize` form used as a
    /// system-call return value (the negative code reinterpreted).
    pub fn into_usize(self) -> usize {
        isize::from(self) as usize
    }
}

/// System-wide configuration, fixed at kernel construction.
///
/// Mirrors the boot-time configuration step of the system: the sizes chosen
/// here are not mutable at runtime. The setters consume and return `self`
/// so a configuration can be built up in one expression:
///
/// ```
/// use teos::SystemConfiguration;
///
/// let conf = SystemConfiguration::default().with_frames(256);
/// assert_eq!(conf.frames, 256);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SystemConfiguration {
    /// Number of physical frames in the pool.
    pub frames: usize,
    /// Number of environment slots.
    pub env_slots: usize,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            frames: 1024,
            env_slots: 64,
        }
    }
}

impl SystemConfiguration {
    /// Sets the physical frame pool capacity.
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Sets the number of environment slots.
    pub fn with_env_slots(mut self, env_slots: usize) -> Self {
        self.env_slots = env_slots;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::KernelError;

    #[test]
    fn error_codes_round_trip() {
        for err in [
            KernelError::OperationNotPermitted,
            KernelError::NoSuchEntry,
            KernelError::NoMemory,
            KernelError::InvalidAccess,
            KernelError::BadAddress,
            KernelError::Busy,
            KernelError::InvalidArgument,
        ] {
            let raw = isize::from(err);
            assert!(raw < 0);
            assert_eq!(KernelError::try_from(raw).unwrap(), err);
        }
        assert!(KernelError::try_from(0isize).is_err());
        assert!(KernelError::try_from(-3isize).is_err());
    }
}
