//! `fork`: lazy duplication of the calling environment.
//!
//! The lifecycle walks a fixed ladder, one fallible step per rung: the
//! child is created uninitialized, the caller's address space is
//! re-established in it page by page, the child gets a fresh exception
//! stack and a registered fault upcall, and only then is it marked
//! runnable. A failure on any rung surfaces to the caller and leaves the
//! child uninitialized and un-started; nothing already mapped into it is
//! rolled back, the surrounding reclamation of abandoned environments
//! takes care of it.
//!
//! The creation primitive returns twice. Here that is explicit in the
//! type: the caller's continuation gets [`ForkReturn::Parent`] with the
//! child's identifier, and the child's first resumption re-enters
//! [`fork()`] and gets [`ForkReturn::Child`]. On the child path nothing
//! inherited
//! from the duplicated pages can be trusted to describe the child itself;
//! in particular the self-identification slot still holds the parent's
//! identifier, byte for byte, and is rewritten from the child's own
//! answer to `sys_getenvid`. That rewrite is the child's first
//! copy-on-write fault.

use crate::{
    perm::{self, PageClass},
    pgfault::{handle_cow_fault, set_fault_handler},
};
use teos::{
    CloneReturn, Kernel, KernelError,
    addressing::{EXCEPTION_STACK_TOP, PAGE_SIZE, USER_TOP, Va},
    env::{EnvId, EnvStatus},
    mm::page_table::{PD_SPAN, PteFlags},
};

/// Fixed address of the self-identification slot.
///
/// An environment that has called [`init_self_slot`] keeps its own
/// identifier in the first word of this page, the way a process keeps a
/// cached pointer to its own bookkeeping record. The page is ordinary
/// private memory and is duplicated by `fork` like any other.
pub const SELF_SLOT: Va = match Va::new(0x1000) {
    Some(va) => va,
    None => unreachable!(),
};

/// The two continuations of a successful [`fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkReturn {
    /// Returned in the calling environment, carrying the new child.
    Parent(EnvId),
    /// Returned in the child the first time it runs.
    Child,
}

/// Installs the self-identification slot for the calling environment.
///
/// Allocates the page if missing and stores the caller's identifier in
/// it. Runs once per environment lineage root; descendants inherit the
/// page through `fork` and rewrite it on their child path.
pub fn init_self_slot(kern: &mut Kernel) -> Result<(), KernelError> {
    let me = kern.sys_getenvid();
    let mapped = matches!(
        kern.lookup(SELF_SLOT),
        Some((_, pte)) if pte.contains(PteFlags::P)
    );
    if !mapped {
        kern.sys_page_alloc(me, SELF_SLOT, PteFlags::P | PteFlags::RW | PteFlags::US)?;
    }
    store_self_id(kern, me)
}

/// Reads the calling environment's identity back from the self slot.
pub fn self_id(kern: &mut Kernel) -> Result<EnvId, KernelError> {
    let mut raw = [0u8; 8];
    kern.user_read(SELF_SLOT, &mut raw)?;
    EnvId::from_usize(u64::from_le_bytes(raw) as usize).ok_or(KernelError::BadAddress)
}

fn store_self_id(kern: &mut Kernel, id: EnvId) -> Result<(), KernelError> {
    kern.user_write(SELF_SLOT, &(id.into_usize() as u64).to_le_bytes())
}

/// Duplicates the calling environment with copy-on-write semantics.
///
/// # Returns
/// - `Ok(ForkReturn::Parent(child))` in the caller once the child is
///   runnable.
/// - `Ok(ForkReturn::Child)` in the child, on its first run.
/// - `Err(KernelError)` in the caller if any setup step failed; the
///   child, if it was created, stays [`EnvStatus::Uninit`] and never
///   runs.
pub fn fork(kern: &mut Kernel) -> Result<ForkReturn, KernelError> {
    set_fault_handler(kern)?;
    match kern.sys_env_clone()? {
        CloneReturn::Child => {
            // First run of the child: recompute who we are rather than
            // trusting the duplicated bytes, which still name the parent.
            let me = kern.sys_getenvid();
            store_self_id(kern, me)?;
            Ok(ForkReturn::Child)
        }
        CloneReturn::Parent(child) => {
            duplicate_user_pages(kern, child, USER_TOP)?;
            kern.sys_page_alloc(
                child,
                EXCEPTION_STACK_TOP - PAGE_SIZE,
                PteFlags::P | PteFlags::RW | PteFlags::US,
            )?;
            kern.sys_set_fault_upcall(child, handle_cow_fault)?;
            kern.sys_env_set_status(child, EnvStatus::Runnable)?;
            Ok(ForkReturn::Parent(child))
        }
    }
}

/// Re-establishes every mapping of the caller below `top` in `child`.
///
/// The exception-stack page is never part of the sweep; the child gets
/// its own. For each remaining mapped page the classification decides:
///
/// - shared pages are handed over as they are, minus any bits that may
///   not cross the system-call boundary;
/// - mutable pages are mapped copy-on-write into the child *first* and
///   the caller's own mapping is then downgraded to the same
///   copy-on-write state. The second step is not redundant even when the
///   page was already copy-on-write, and without it the caller could
///   keep writing through its old mapping while the child still shares
///   the frame;
/// - immutable pages are handed over unchanged.
///
/// The first failing primitive ends the sweep and the error propagates;
/// pages already mapped into the child stay mapped.
fn duplicate_user_pages(kern: &mut Kernel, child: EnvId, top: Va) -> Result<(), KernelError> {
    let me = kern.sys_getenvid();
    let xstack = EXCEPTION_STACK_TOP - PAGE_SIZE;
    let cross = PteFlags::P | PteFlags::RW | PteFlags::US | PteFlags::SHARED;

    let mut va = Va::ZERO;
    while va < top {
        if va == xstack {
            va = va + PAGE_SIZE;
            continue;
        }
        let Some((pde, pte)) = kern.lookup(va) else {
            // Nothing under this directory entry; skip its whole span.
            let span_end = (va.into_usize() & !(PD_SPAN - 1)) + PD_SPAN;
            va = Va::new(span_end).unwrap_or(top);
            continue;
        };
        match perm::classify(pde, pte) {
            None => {}
            Some(PageClass::Shared) => {
                kern.sys_page_map(me, va, child, va, pte & cross)?;
            }
            Some(PageClass::PrivateMutable) => {
                let flags = PteFlags::P | PteFlags::US | PteFlags::COW;
                kern.sys_page_map(me, va, child, va, flags)?;
                kern.sys_page_map(child, va, me, va, flags)?;
            }
            Some(PageClass::PrivateImmutable) => {
                kern.sys_page_map(me, va, child, va, pte & cross)?;
            }
        }
        va = va + PAGE_SIZE;
    }
    Ok(())
}
