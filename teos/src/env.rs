//! Environments: isolated execution contexts.
//!
//! An environment is a process-like unit owning an address space, a status,
//! and an optional registered fault upcall. Environments are identified by
//! [`EnvId`], which encodes a slot number together with a generation, so an
//! identifier that survived its environment is recognizably stale instead
//! of silently naming the slot's next tenant.

use crate::{
    kernel::FaultUpcall,
    mm::page_table::AddressSpace,
};

/// Number of slot bits inside an [`EnvId`]; the generation lives above.
const SLOT_BITS: usize = 12;

/// Maximum number of environment slots an id can address.
pub const MAX_ENV_SLOTS: usize = 1 << SLOT_BITS;

/// An environment identifier.
///
/// The low bits select the slot in the environment table, the bits above
/// carry the slot's generation at creation time. Generations start at
/// one, so every valid id is non-zero.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EnvId(usize);

impl EnvId {
    pub(crate) fn from_parts(generation: usize, slot: usize) -> Self {
        debug_assert!(generation > 0 && slot < MAX_ENV_SLOTS);
        Self(generation << SLOT_BITS | slot)
    }

    /// Reconstructs an identifier from its raw form, e.g. one read back
    /// from a page an environment stored it in.
    ///
    /// # Returns
    /// - `Some(EnvId)` if `raw` has the shape of a valid id.
    /// - `None` for zero (no generation).
    pub const fn from_usize(raw: usize) -> Option<Self> {
        if raw >> SLOT_BITS == 0 { None } else { Some(Self(raw)) }
    }

    /// Returns the raw `usize` representation of the identifier.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Index of the environment-table slot this id refers to.
    #[inline]
    pub const fn slot(self) -> usize {
        self.0 & (MAX_ENV_SLOTS - 1)
    }

    /// Generation of the slot at the time this id was created.
    #[inline]
    pub const fn generation(self) -> usize {
        self.0 >> SLOT_BITS
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId(0x{:x})", self.0)
    }
}

/// A possible status of an environment.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum EnvStatus {
    /// Created but not yet runnable; a freshly duplicated context stays
    /// here until its setup completes.
    Uninit,
    /// Ready to be given the processor.
    Runnable,
    /// Currently driving the model.
    Running,
    /// Marked for teardown by an external policy.
    Dying,
}

/// The duplicated register state of an environment.
///
/// The model keeps only what its protocols observe: the instruction
/// pointer, advanced once per user-memory access and reported in fault
/// diagnostics.
#[derive(Clone, Debug, Default)]
pub struct Registers {
    /// Program counter, diagnostic only.
    pub ip: usize,
}

/// An environment record, owned by the kernel's environment table.
pub(crate) struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent: Option<EnvId>,
    pub(crate) status: EnvStatus,
    pub(crate) aspace: AddressSpace,
    pub(crate) upcall: Option<FaultUpcall>,
    pub(crate) regs: Registers,
    /// Set while a fault upcall is running; a second fault arriving in
    /// that window is fatal, the staging resource is not re-entrant.
    pub(crate) handling_fault: bool,
    /// Set on a freshly duplicated context; consumed the first time it
    /// resumes through the duplication primitive to produce the
    /// child-side return.
    pub(crate) fork_pending: bool,
}

impl Env {
    pub(crate) fn new(id: EnvId, parent: Option<EnvId>) -> Self {
        Self {
            id,
            parent,
            status: EnvStatus::Uninit,
            aspace: AddressSpace::new(),
            upcall: None,
            regs: Registers::default(),
            handling_fault: false,
            fork_pending: false,
        }
    }
}
