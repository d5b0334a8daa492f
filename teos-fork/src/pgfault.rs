//! The copy-on-write page-fault handler.
//!
//! Resolution of a fault is a fixed four-step protocol around the single
//! reserved staging address: allocate a fresh page there, copy the
//! faulting page into it, re-map the staged frame over the faulting
//! address with write permission (the copy-on-write marker gone), and
//! drop the staging mapping. Only the faulting environment's view changes;
//! every sibling still holding the original frame through its own
//! copy-on-write mapping is untouched and will fault and copy on its own
//! first write.
//!
//! Everything outside that narrow protocol is fatal to the environment: a
//! read fault, a fault on an unmapped address, a fault on a page that is
//! not copy-on-write (including a second delivery for an address that was
//! already resolved, which can only mean the privileged layer re-delivered
//! a fault it should not have), and any failure of the staging sequence
//! itself. There is no partial-copy recovery.

use crate::perm;
use teos::{
    FaultCode, FaultFrame, Kernel, KernelError,
    addressing::{EXCEPTION_STACK_TOP, PAGE_SIZE, SCRATCH_BASE, Va},
    mm::page_table::PteFlags,
};

/// Registers the copy-on-write fault handler for the calling environment.
///
/// The first registration also provisions the caller's exception stack:
/// the upcall must run on a stack that can never itself be subject to
/// copy-on-write, so the page below [`EXCEPTION_STACK_TOP`] is allocated
/// fresh if it is not already present. Re-registration is idempotent.
pub fn set_fault_handler(kern: &mut Kernel) -> Result<(), KernelError> {
    let me = kern.sys_getenvid();
    let xstack = EXCEPTION_STACK_TOP - PAGE_SIZE;
    let mapped = matches!(
        kern.lookup(xstack),
        Some((_, pte)) if pte.contains(PteFlags::P)
    );
    if !mapped {
        kern.sys_page_alloc(me, xstack, PteFlags::P | PteFlags::RW | PteFlags::US)?;
    }
    kern.sys_set_fault_upcall(me, handle_cow_fault)
}

/// The fault upcall: resolves exactly one copy-on-write write fault.
///
/// Returns an error, aborting the environment, unless the fault is a
/// write to a page that is present at both levels and carries the
/// copy-on-write capability. The classification rejections happen before
/// any mapping primitive is invoked.
pub fn handle_cow_fault(kern: &mut Kernel, utf: &FaultFrame) -> Result<(), KernelError> {
    if !utf.code.contains(FaultCode::WRITE) {
        log::warn!("fault at {:?} was not a write", utf.fault_va);
        return Err(KernelError::InvalidAccess);
    }
    let va = utf.fault_va.page_down();
    let Some((pde, pte)) = kern.lookup(va) else {
        log::warn!("write fault at {:?} with no page table", va);
        return Err(KernelError::BadAddress);
    };
    let eff = perm::effective(pde, pte);
    if !eff.contains(PteFlags::P) {
        log::warn!("write fault at {:?} with no mapping", va);
        return Err(KernelError::BadAddress);
    }
    if !eff.contains(PteFlags::COW) {
        log::warn!("write fault at {:?} on a page that is not copy-on-write", va);
        return Err(KernelError::InvalidAccess);
    }
    let staging = StagedPage::acquire(kern)?;
    staging.resolve(kern, va)
}

/// The staging slot at [`SCRATCH_BASE`], held for the duration of one
/// fault resolution.
///
/// The slot is a process-wide singleton: acquiring it while a mapping is
/// already live there fails, and the owner must consume the value through
/// [`StagedPage::resolve`]. Dropping it unconsumed is a bug in the caller
/// and panics; on the fatal error paths the environment teardown reclaims
/// the mapping along with everything else.
struct StagedPage {
    va: Va,
}

impl StagedPage {
    /// Maps a fresh writable page at the staging address.
    fn acquire(kern: &mut Kernel) -> Result<Self, KernelError> {
        let me = kern.sys_getenvid();
        if matches!(kern.lookup(SCRATCH_BASE), Some((_, pte)) if pte.contains(PteFlags::P)) {
            return Err(KernelError::Busy);
        }
        kern.sys_page_alloc(me, SCRATCH_BASE, PteFlags::P | PteFlags::RW | PteFlags::US)?;
        Ok(Self { va: SCRATCH_BASE })
    }

    /// Copies the page at `dst` into the staged frame, re-maps that frame
    /// over `dst` writable and private, and releases the staging slot.
    ///
    /// The staged frame itself survives: after the re-map it is owned by
    /// the mapping at `dst`.
    fn resolve(self, kern: &mut Kernel, dst: Va) -> Result<(), KernelError> {
        let this = core::mem::ManuallyDrop::new(self);
        let me = kern.sys_getenvid();
        kern.copy_page(dst, this.va)?;
        kern.sys_page_map(me, this.va, me, dst, PteFlags::P | PteFlags::RW | PteFlags::US)?;
        kern.sys_page_unmap(me, this.va)?;
        log::debug!("{:?}: private copy installed at {:?}", me, dst);
        Ok(())
    }
}

impl Drop for StagedPage {
    fn drop(&mut self) {
        panic!("staging mapping at {:?} was never resolved", self.va);
    }
}
