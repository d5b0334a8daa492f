//! The privileged layer: environment table, system calls, fault delivery.
//!
//! A [`Kernel`] owns the frame pool and the environment table and exposes
//! the system-call surface user code drives. One environment at a time is
//! *current* and performs user-memory accesses; a denied access raises a
//! synchronous page fault, which is delivered to the environment's
//! registered upcall exactly once and then retried exactly once. Anything
//! else aborts the environment with a logged diagnostic naming the
//! faulting address and instruction pointer.
//!
//! System calls directed at another environment are permission-checked:
//! the target must be the caller itself or one of its immediate children.
//! Stale identifiers (an earlier generation of a reused slot) never pass
//! the check.

use crate::{
    KernelError, SystemConfiguration,
    addressing::{EXCEPTION_STACK_TOP, PAGE_SIZE, Pa, USER_TOP, Va},
    env::{Env, EnvId, EnvStatus, MAX_ENV_SLOTS},
    mm::{
        FrameAllocator,
        page_table::{PdeFlags, PteFlags},
    },
};
use alloc::vec::Vec;

bitflags::bitflags! {
    /// Cause bits of a page fault, as delivered to the fault upcall.
    pub struct FaultCode: usize {
        /// The faulting access hit a present mapping whose permissions
        /// denied it. Clear when no mapping was present at all.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access came from user-level execution.
        const USER = 1 << 2;
    }
}

/// The fault record delivered to a registered upcall.
///
/// `fault_va` is the raw faulting address; handlers align it down to the
/// containing page themselves. `ip` is diagnostic only.
#[derive(Debug)]
pub struct FaultFrame {
    /// The address whose access faulted, unaligned.
    pub fault_va: Va,
    /// Decoded cause of the fault.
    pub code: FaultCode,
    /// Instruction pointer of the faulting environment.
    pub ip: usize,
}

/// A registered page-fault upcall.
///
/// The upcall runs synchronously in the faulting environment, on its
/// exception stack, with full access to the system-call surface. Returning
/// `Ok` re-runs the faulting access once; returning an error aborts the
/// environment.
pub type FaultUpcall = fn(&mut Kernel, &FaultFrame) -> Result<(), KernelError>;

/// The two continuations produced by the context-duplication primitive.
///
/// The primitive logically returns twice: once in the creating
/// environment, carrying the new identifier, and once in the duplicate
/// when it first resumes, carrying nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneReturn {
    /// The caller's continuation; carries the child's identifier.
    Parent(EnvId),
    /// The duplicate's continuation, produced on its first resumption.
    Child,
}

/// The modeled privileged layer.
pub struct Kernel {
    frames: FrameAllocator,
    envs: Vec<Option<Env>>,
    generations: Vec<usize>,
    current: Option<EnvId>,
    mapping_ops: usize,
}

impl Kernel {
    /// Builds a kernel from a boot-time configuration.
    pub fn new(conf: SystemConfiguration) -> Self {
        assert!(
            conf.env_slots > 0 && conf.env_slots <= MAX_ENV_SLOTS,
            "environment table size out of range"
        );
        let mut envs = Vec::with_capacity(conf.env_slots);
        envs.resize_with(conf.env_slots, || None);
        Self {
            frames: FrameAllocator::new(conf.frames),
            envs,
            generations: alloc::vec![1; conf.env_slots],
            current: None,
            mapping_ops: 0,
        }
    }

    /// Boots an initial environment with an empty address space and makes
    /// it current.
    pub fn spawn_initial(&mut self) -> Result<EnvId, KernelError> {
        let id = self.alloc_env(None)?;
        self.envs[id.slot()].as_mut().unwrap().status = EnvStatus::Running;
        self.current = Some(id);
        Ok(id)
    }

    fn alloc_env(&mut self, parent: Option<EnvId>) -> Result<EnvId, KernelError> {
        let slot = self
            .envs
            .iter()
            .position(|e| e.is_none())
            .ok_or(KernelError::NoMemory)?;
        let id = EnvId::from_parts(self.generations[slot], slot);
        self.generations[slot] += 1;
        self.envs[slot] = Some(Env::new(id, parent));
        Ok(id)
    }

    /// Resolves `id` to its slot, rejecting stale or never-issued ids.
    fn slot_of(&self, id: EnvId) -> Result<usize, KernelError> {
        let slot = id.slot();
        match self.envs.get(slot).and_then(|e| e.as_ref()) {
            Some(env) if env.id == id => Ok(slot),
            _ => Err(KernelError::NoSuchEntry),
        }
    }

    /// Like [`Kernel::slot_of`], but additionally requires the target to
    /// be the current environment or one of its immediate children.
    fn checked_slot(&self, id: EnvId) -> Result<usize, KernelError> {
        let slot = self.slot_of(id)?;
        let cur = self.sys_getenvid();
        let env = self.envs[slot].as_ref().unwrap();
        if env.id == cur || env.parent == Some(cur) {
            Ok(slot)
        } else {
            Err(KernelError::OperationNotPermitted)
        }
    }

    fn current_slot(&self) -> usize {
        let cur = self.sys_getenvid();
        self.slot_of(cur).expect("current environment vanished")
    }

    /// Returns the identifier of the current environment.
    pub fn sys_getenvid(&self) -> EnvId {
        self.current.expect("no environment is running")
    }

    /// Duplicates the current context.
    ///
    /// On the caller's side this creates a new environment in state
    /// [`EnvStatus::Uninit`] with a copy of the caller's register state, an
    /// empty address space, and no registered upcall, and returns
    /// [`CloneReturn::Parent`]. The first time the duplicate itself
    /// resumes through this call it observes [`CloneReturn::Child`]
    /// instead, completing the two-sided return.
    pub fn sys_env_clone(&mut self) -> Result<CloneReturn, KernelError> {
        let slot = self.current_slot();
        if self.envs[slot].as_ref().unwrap().fork_pending {
            self.envs[slot].as_mut().unwrap().fork_pending = false;
            return Ok(CloneReturn::Child);
        }
        let cur = self.sys_getenvid();
        let child = self.alloc_env(Some(cur))?;
        let regs = self.envs[slot].as_ref().unwrap().regs.clone();
        let child_env = self.envs[child.slot()].as_mut().unwrap();
        child_env.regs = regs;
        child_env.fork_pending = true;
        Ok(CloneReturn::Parent(child))
    }

    /// Masks `flags` to the legal system-call subset and validates the
    /// combination.
    fn check_syscall_flags(flags: PteFlags) -> Result<PteFlags, KernelError> {
        let flags = flags & PteFlags::SYSCALL;
        if !flags.contains(PteFlags::P | PteFlags::US) {
            return Err(KernelError::InvalidArgument);
        }
        // A shared mapping is never copy-on-write, and a copy-on-write
        // mapping is never directly writable.
        if flags.contains(PteFlags::COW)
            && flags.intersects(PteFlags::SHARED | PteFlags::RW)
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(flags)
    }

    fn check_user_va(va: Va) -> Result<(), KernelError> {
        if va.offset() != 0 || va >= USER_TOP {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Allocates a fresh zero-filled frame and maps it at `va` in the
    /// target environment with `flags`.
    pub fn sys_page_alloc(
        &mut self,
        target: EnvId,
        va: Va,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        self.mapping_ops += 1;
        let flags = Self::check_syscall_flags(flags)?;
        Self::check_user_va(va)?;
        let slot = self.checked_slot(target)?;
        let pa = self.frames.alloc()?;
        let Kernel { frames, envs, .. } = self;
        let result = envs[slot].as_mut().unwrap().aspace.map(frames, va, pa, flags);
        // Whether the mapping took the frame or not, the allocation
        // reference is no longer needed.
        frames.decref(pa);
        result
    }

    /// Maps the frame backing `src_va` in `src` at `dst_va` in `dst` with
    /// `flags`. The two environments may be the same; remapping an address
    /// onto itself is how a caller rewrites its own permissions.
    pub fn sys_page_map(
        &mut self,
        src: EnvId,
        src_va: Va,
        dst: EnvId,
        dst_va: Va,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        self.mapping_ops += 1;
        let flags = Self::check_syscall_flags(flags)?;
        Self::check_user_va(src_va)?;
        Self::check_user_va(dst_va)?;
        let src_slot = self.checked_slot(src)?;
        let dst_slot = self.checked_slot(dst)?;
        let src_pte = self.envs[src_slot]
            .as_ref()
            .unwrap()
            .aspace
            .entries(&self.frames, src_va)
            .map(|(_, pte)| pte)
            .ok_or(KernelError::InvalidArgument)?;
        let pa = src_pte.pa().ok_or(KernelError::InvalidArgument)?;
        // Writability cannot be conjured: a writable mapping may only be
        // derived from one that is already writable.
        if flags.contains(PteFlags::RW) && !src_pte.flags().contains(PteFlags::RW) {
            return Err(KernelError::InvalidArgument);
        }
        let Kernel { frames, envs, .. } = self;
        envs[dst_slot]
            .as_mut()
            .unwrap()
            .aspace
            .map(frames, dst_va, pa, flags)
    }

    /// Removes the mapping at `va` in the target environment, if any.
    pub fn sys_page_unmap(&mut self, target: EnvId, va: Va) -> Result<(), KernelError> {
        self.mapping_ops += 1;
        Self::check_user_va(va)?;
        let slot = self.checked_slot(target)?;
        let Kernel { frames, envs, .. } = self;
        envs[slot].as_mut().unwrap().aspace.unmap(frames, va)
    }

    /// Registers the page-fault upcall of the target environment.
    pub fn sys_set_fault_upcall(
        &mut self,
        target: EnvId,
        upcall: FaultUpcall,
    ) -> Result<(), KernelError> {
        let slot = self.checked_slot(target)?;
        self.envs[slot].as_mut().unwrap().upcall = Some(upcall);
        Ok(())
    }

    /// Sets the status of the target environment. Only
    /// [`EnvStatus::Runnable`] and [`EnvStatus::Uninit`] may be requested.
    pub fn sys_env_set_status(
        &mut self,
        target: EnvId,
        status: EnvStatus,
    ) -> Result<(), KernelError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::Uninit) {
            return Err(KernelError::InvalidArgument);
        }
        let slot = self.checked_slot(target)?;
        self.envs[slot].as_mut().unwrap().status = status;
        Ok(())
    }

    /// Hands the processor to `id`.
    ///
    /// This is mechanism, not policy: the embedding harness decides who
    /// runs next. The target must be runnable; the previously running
    /// environment becomes runnable again.
    pub fn run(&mut self, id: EnvId) -> Result<(), KernelError> {
        let slot = self.slot_of(id)?;
        if self.current == Some(id) {
            return Ok(());
        }
        if self.envs[slot].as_ref().unwrap().status != EnvStatus::Runnable {
            return Err(KernelError::OperationNotPermitted);
        }
        if let Some(cur) = self.current {
            if let Ok(cs) = self.slot_of(cur) {
                let env = self.envs[cs].as_mut().unwrap();
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }
        self.envs[slot].as_mut().unwrap().status = EnvStatus::Running;
        self.current = Some(id);
        Ok(())
    }

    /// Tears an environment down, reclaiming every frame it references.
    ///
    /// This is the reclamation entry the surrounding lifecycle uses for
    /// aborted and abandoned environments; the model applies the same
    /// teardown to fatal faults.
    pub fn destroy(&mut self, id: EnvId) -> Result<(), KernelError> {
        let slot = self.slot_of(id)?;
        let Kernel { frames, envs, .. } = self;
        envs[slot].as_mut().unwrap().aspace.clear(frames);
        envs[slot] = None;
        if self.current == Some(id) {
            self.current = None;
        }
        Ok(())
    }

    /// Checks whether an access by the current environment translates,
    /// returning the backing frame or the fault cause.
    fn translate(&self, va: Va, is_write: bool) -> Result<Pa, FaultCode> {
        let miss = if is_write {
            FaultCode::WRITE | FaultCode::USER
        } else {
            FaultCode::USER
        };
        if va >= USER_TOP {
            return Err(miss);
        }
        let env = self.envs[self.current_slot()].as_ref().unwrap();
        let Some((pde, pte)) = env.aspace.entries(&self.frames, va) else {
            return Err(miss);
        };
        if !pte.flags().contains(PteFlags::P) {
            return Err(miss);
        }
        // Present at both levels: anything denied below is a protection
        // violation. Enforcement conjoins the levels.
        let prot = miss | FaultCode::PRESENT;
        if !pde.flags().contains(PdeFlags::US) || !pte.flags().contains(PteFlags::US) {
            return Err(prot);
        }
        if is_write
            && (!pde.flags().contains(PdeFlags::RW) || !pte.flags().contains(PteFlags::RW))
        {
            return Err(prot);
        }
        Ok(pte.pa().unwrap())
    }

    /// Aborts the current environment with a diagnostic and passes the
    /// error through.
    fn abort_current(&mut self, va: Va, reason: &str, err: KernelError) -> KernelError {
        if let Some(cur) = self.current {
            if let Ok(slot) = self.slot_of(cur) {
                let ip = self.envs[slot].as_ref().unwrap().regs.ip;
                log::warn!(
                    "{:?} aborted: {} (fault va {:?}, ip {:#x})",
                    cur,
                    reason,
                    va,
                    ip
                );
            }
            let _ = self.destroy(cur);
        }
        err
    }

    /// Delivers a fault to the current environment's upcall.
    fn deliver_fault(&mut self, va: Va, code: FaultCode) -> Result<(), KernelError> {
        let cur = self.sys_getenvid();
        let slot = self.current_slot();
        if self.envs[slot].as_ref().unwrap().handling_fault {
            return Err(self.abort_current(
                va,
                "page fault while a fault was being handled",
                KernelError::InvalidAccess,
            ));
        }
        let Some(upcall) = self.envs[slot].as_ref().unwrap().upcall else {
            return Err(self.abort_current(
                va,
                "page fault with no upcall registered",
                KernelError::BadAddress,
            ));
        };
        // The upcall runs on the environment's exception stack.
        if self.translate(EXCEPTION_STACK_TOP - PAGE_SIZE, true).is_err() {
            return Err(self.abort_current(
                va,
                "exception stack is missing or not writable",
                KernelError::BadAddress,
            ));
        }
        let frame = FaultFrame {
            fault_va: va,
            code,
            ip: self.envs[slot].as_ref().unwrap().regs.ip,
        };
        log::debug!("{:?} fault at {:?} ({:?})", cur, va, code);
        self.envs[slot].as_mut().unwrap().handling_fault = true;
        let result = upcall(self, &frame);
        if let Ok(slot) = self.slot_of(cur) {
            self.envs[slot].as_mut().unwrap().handling_fault = false;
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort_current(va, "fault upcall failed", e)),
        }
    }

    /// Translates an access, resolving at most one fault along the way.
    fn resolve(&mut self, va: Va, is_write: bool) -> Result<Pa, KernelError> {
        let code = match self.translate(va, is_write) {
            Ok(pa) => {
                self.mark_access(va, is_write);
                return Ok(pa);
            }
            Err(code) => code,
        };
        self.deliver_fault(va, code)?;
        match self.translate(va, is_write) {
            Ok(pa) => {
                self.mark_access(va, is_write);
                Ok(pa)
            }
            Err(_) => Err(self.abort_current(
                va,
                "fault upcall did not repair the mapping",
                KernelError::BadAddress,
            )),
        }
    }

    /// Maintains the accessed and dirty bits after a successful access.
    fn mark_access(&mut self, va: Va, is_write: bool) {
        let marks = if is_write {
            PteFlags::A | PteFlags::D
        } else {
            PteFlags::A
        };
        let slot = self.current_slot();
        let Kernel { frames, envs, .. } = self;
        envs[slot].as_mut().unwrap().aspace.mark(frames, va, marks);
    }

    fn bump_ip(&mut self) {
        let slot = self.current_slot();
        self.envs[slot].as_mut().unwrap().regs.ip += 1;
    }

    /// Writes `buf` into the current environment's memory at `va`.
    ///
    /// A denied page goes through fault delivery once; if the access still
    /// does not translate afterwards, the environment is aborted and the
    /// error surfaces here.
    pub fn user_write(&mut self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        self.bump_ip();
        let mut off = 0;
        while off < buf.len() {
            let at = va + off;
            let chunk = core::cmp::min(PAGE_SIZE - at.offset(), buf.len() - off);
            let pa = self.resolve(at, true)?;
            let start = at.offset();
            self.frames.data_mut(pa)[start..start + chunk]
                .copy_from_slice(&buf[off..off + chunk]);
            off += chunk;
        }
        Ok(())
    }

    /// Reads the current environment's memory at `va` into `buf`.
    pub fn user_read(&mut self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        self.bump_ip();
        let mut off = 0;
        while off < buf.len() {
            let at = va + off;
            let chunk = core::cmp::min(PAGE_SIZE - at.offset(), buf.len() - off);
            let pa = self.resolve(at, false)?;
            let start = at.offset();
            buf[off..off + chunk].copy_from_slice(&self.frames.data(pa)[start..start + chunk]);
            off += chunk;
        }
        Ok(())
    }

    /// Copies one full page of the current environment's memory from `src`
    /// to `dst`.
    ///
    /// Permissions are checked but faults are not delivered: this models
    /// the copy a fault upcall performs itself, inside the window where a
    /// second fault would be fatal anyway.
    pub fn copy_page(&mut self, src: Va, dst: Va) -> Result<(), KernelError> {
        if src.offset() != 0 || dst.offset() != 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.bump_ip();
        let spa = self
            .translate(src, false)
            .map_err(|_| KernelError::InvalidAccess)?;
        let dpa = self
            .translate(dst, true)
            .map_err(|_| KernelError::InvalidAccess)?;
        self.frames.copy_frame(spa, dpa);
        self.mark_access(src, false);
        self.mark_access(dst, true);
        Ok(())
    }

    /// The current environment's view of its own page tables: directory
    /// and table flags covering `va`, or `None` when the directory entry
    /// is absent.
    pub fn lookup(&self, va: Va) -> Option<(PdeFlags, PteFlags)> {
        let env = self.envs[self.current_slot()].as_ref().unwrap();
        let (pde, pte) = env.aspace.entries(&self.frames, va)?;
        Some((pde.flags(), pte.flags()))
    }

    /// Resolves `va` in any live environment to its backing frame and leaf
    /// flags. Inspection only; no permission interpretation.
    pub fn probe(&self, env: EnvId, va: Va) -> Option<(Pa, PteFlags)> {
        let slot = self.slot_of(env).ok()?;
        let (_, pte) = self.envs[slot]
            .as_ref()
            .unwrap()
            .aspace
            .entries(&self.frames, va)?;
        Some((pte.pa()?, pte.flags()))
    }

    /// Status of a live environment, `None` for stale or unknown ids.
    pub fn status_of(&self, env: EnvId) -> Option<EnvStatus> {
        let slot = self.slot_of(env).ok()?;
        Some(self.envs[slot].as_ref().unwrap().status)
    }

    /// Reference count of the frame at `pa`.
    pub fn frame_refs(&self, pa: Pa) -> usize {
        self.frames.refs(pa)
    }

    /// Number of free frames left in the pool.
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    /// Number of mapping primitives (allocate, map, unmap) invoked so far.
    pub fn mapping_ops(&self) -> usize {
        self.mapping_ops
    }

    /// The currently running environment, if any.
    pub fn current(&self) -> Option<EnvId> {
        self.current
    }
}
