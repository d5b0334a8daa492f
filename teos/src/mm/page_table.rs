//! Two-level page table: entries, permission bits, and address spaces.
//!
//! Every environment owns an [`AddressSpace`]: a 512-entry page directory
//! whose present entries point at 512-entry page tables held in table
//! frames. One table frame spans [`PD_SPAN`] bytes of virtual address
//! space; together the two levels cover the whole modeled space.
//!
//! Permission bits live in both levels. A directory entry's bits gate the
//! entire span beneath it and accumulate the present/writable/user bits of
//! the mappings installed there; the copy-on-write and shared markers are
//! leaf-level bits the kernel never places on a directory entry. Access
//! enforcement conjoins the two levels (a write needs the writable bit at
//! both), which is what makes a leaf-level downgrade to copy-on-write trap
//! even while the directory still carries the writable bit from earlier
//! installs.

use crate::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SHIFT, Pa, Va},
    mm::FrameAllocator,
};
use alloc::boxed::Box;

/// Number of entries in the page directory.
pub const NPDENTRIES: usize = 512;

/// Number of entries in a page table.
pub const NPTENTRIES: usize = 512;

/// Bytes of virtual address space mapped by one page-directory entry.
pub const PD_SPAN: usize = NPTENTRIES * crate::addressing::PAGE_SIZE;

bitflags::bitflags! {
    /// Flags for a page-directory entry.
    pub struct PdeFlags: usize {
        /// Present; must be set for the table beneath to be reachable.
        const P = 1 << 0;
        /// Writable; some mapping beneath this entry was installed writable.
        const RW = 1 << 1;
        /// User-accessible; some mapping beneath was installed for user use.
        const US = 1 << 2;
        /// Shared-mapping marker. Meaningful on leaf entries; the kernel
        /// never sets it at the directory level.
        const SHARED = 1 << 10;
        /// Copy-on-write marker. Meaningful on leaf entries; the kernel
        /// never sets it at the directory level.
        const COW = 1 << 11;
    }
}

bitflags::bitflags! {
    /// Flags for a page-table entry.
    pub struct PteFlags: usize {
        /// Present; must be set for the entry to name a frame.
        const P = 1 << 0;
        /// Writable.
        const RW = 1 << 1;
        /// User-accessible.
        const US = 1 << 2;
        /// Accessed; set by the access path when the page is read or
        /// written. Never crosses the system-call boundary.
        const A = 1 << 5;
        /// Dirty; set by the access path when the page is written. Never
        /// crosses the system-call boundary.
        const D = 1 << 6;
        /// Shared-mapping: the frame is deliberately visible to several
        /// environments and is exempt from copy-on-write treatment.
        const SHARED = 1 << 10;
        /// Copy-on-write: the frame is shared until the owner first writes,
        /// at which point the fault path installs a private copy.
        const COW = 1 << 11;

        /// The subset of bits that may legally cross the system-call
        /// boundary. Anything outside is reserved to the kernel.
        const SYSCALL = Self::P.bits | Self::RW.bits | Self::US.bits
                      | Self::SHARED.bits | Self::COW.bits;
    }
}

/// Page Table Mapping Error.
///
/// Failures of the pure, entry-level part of a mapping operation. The
/// kernel folds these into its own error vocabulary at the system-call
/// boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum MappingError {
    /// An address that must be page-aligned is not.
    Unaligned,
    /// The requested entry does not exist.
    NotMapped,
}

impl From<MappingError> for KernelError {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::Unaligned => KernelError::InvalidArgument,
            MappingError::NotMapped => KernelError::BadAddress,
        }
    }
}

/// Page-directory entry.
///
/// A present entry stores the physical address of the page table covering
/// its span together with the accumulated [`PdeFlags`].
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pde(pub usize);

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pde({:016x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pde {
    /// Get the physical address of the page table this entry points to.
    ///
    /// # Returns
    /// - `Some(Pa)` if the entry is present.
    /// - `None` otherwise.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PdeFlags::P) {
            Pa::new(self.0 & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PdeFlags {
        PdeFlags::from_bits_truncate(self.0)
    }

    /// Set the physical address of the page table, preserving the current
    /// flags and marking the entry present.
    ///
    /// # Returns
    /// - `Ok(&mut Self)` on success, for chaining.
    /// - `Err(MappingError::Unaligned)` if `pa` is not page-aligned.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, MappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(MappingError::Unaligned)
        } else {
            self.0 = pa | self.flags().bits() | PdeFlags::P.bits();
            Ok(self)
        }
    }

    /// Replace the flags of this entry, preserving the physical address.
    #[inline]
    pub fn set_flags(&mut self, perm: PdeFlags) -> &mut Self {
        self.0 = self.pa().map(|pa| pa.into_usize()).unwrap_or(0) | perm.bits();
        self
    }

    /// Clears the entry, returning the previously stored physical address
    /// if there was one.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }
}

/// Page-table entry.
///
/// A present entry stores the physical address of the mapped frame
/// together with its [`PteFlags`].
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:016x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// Get the physical address of the mapped frame.
    ///
    /// # Returns
    /// - `Some(Pa)` if the entry is present.
    /// - `None` otherwise.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Set the physical address of the mapped frame, preserving the current
    /// flags and marking the entry present.
    ///
    /// # Returns
    /// - `Ok(&mut Self)` on success, for chaining.
    /// - `Err(MappingError::Unaligned)` if `pa` is not page-aligned.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, MappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(MappingError::Unaligned)
        } else {
            self.0 = pa | self.flags().bits() | PteFlags::P.bits();
            Ok(self)
        }
    }

    /// Replace the flags of this entry, preserving the physical address.
    #[inline]
    pub fn set_flags(&mut self, perm: PteFlags) -> &mut Self {
        self.0 = self.pa().map(|pa| pa.into_usize()).unwrap_or(0) | perm.bits();
        self
    }

    /// Clears the entry, returning the previously stored physical address
    /// if there was one.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }
}

/// Page-table indices for a given virtual address.
///
/// Decomposes a page-aligned [`Va`] into its directory index and table
/// index.
#[derive(Debug)]
pub struct PtIndices {
    /// The virtual address this breakdown was computed from.
    pub va: Va,
    /// Page-directory index.
    pub pdei: usize,
    /// Page-table index.
    pub ptei: usize,
}

impl PtIndices {
    /// Extracts page-table indices from a page-aligned virtual address.
    ///
    /// # Returns
    /// - `Ok(Self)` if `va` is page-aligned.
    /// - `Err(MappingError::Unaligned)` otherwise.
    pub fn from_va(va: Va) -> Result<Self, MappingError> {
        if va.offset() == 0 {
            Ok(Self {
                va,
                pdei: (va.into_usize() >> (PAGE_SHIFT + 9)) & (NPDENTRIES - 1),
                ptei: (va.into_usize() >> PAGE_SHIFT) & (NPTENTRIES - 1),
            })
        } else {
            Err(MappingError::Unaligned)
        }
    }
}

/// An environment's address space: the page directory plus the table
/// frames its present entries point at.
///
/// All operations take the frame pool explicitly; the address space holds
/// references into it (each mapped frame and each table frame counts one),
/// and [`AddressSpace::clear`] hands every reference back.
pub struct AddressSpace {
    pgdir: Box<[Pde; NPDENTRIES]>,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self {
            pgdir: Box::new([Pde(0); NPDENTRIES]),
        }
    }

    /// Reads the directory entry and table entry covering `va`.
    ///
    /// The address is aligned down internally.
    ///
    /// # Returns
    /// - `Some((Pde, Pte))` if the directory entry is present. The table
    ///   entry may still be non-present.
    /// - `None` if the directory entry is absent.
    pub fn entries(&self, frames: &FrameAllocator, va: Va) -> Option<(Pde, Pte)> {
        let idx = PtIndices::from_va(va.page_down()).ok()?;
        let pde = self.pgdir[idx.pdei];
        let tpa = pde.pa()?;
        Some((pde, frames.table(tpa)[idx.ptei]))
    }

    /// Translates `va` to the physical address of its backing frame, with
    /// no permission interpretation beyond presence at both levels.
    pub fn translate(&self, frames: &FrameAllocator, va: Va) -> Option<Pa> {
        let (_, pte) = self.entries(frames, va)?;
        pte.pa()
    }

    /// Installs a mapping from `va` to the frame at `pa` with `flags`.
    ///
    /// The present bit is always set on the installed entry. An existing
    /// mapping at `va` is replaced, releasing its reference. The directory
    /// entry covering `va` accumulates the writable/user bits requested
    /// here; a missing page table is allocated from the pool.
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::InvalidArgument)` if `va` or `pa` is unaligned.
    /// - `Err(KernelError::NoMemory)` if a page table was needed and the
    ///   pool is exhausted.
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        va: Va,
        pa: Pa,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        let idx = PtIndices::from_va(va)?;
        let mut entry = Pte(0);
        entry.set_pa(pa)?.set_flags(flags | PteFlags::P);

        // Take the new reference first so replacing a mapping by itself
        // cannot transiently free the frame.
        frames.incref(pa);

        let pde = &mut self.pgdir[idx.pdei];
        let tpa = match pde.pa() {
            Some(tpa) => tpa,
            None => match frames.alloc_table() {
                Ok(tpa) => {
                    pde.set_pa(tpa)?;
                    tpa
                }
                Err(e) => {
                    frames.decref(pa);
                    return Err(e);
                }
            },
        };
        let accumulated =
            PdeFlags::from_bits_truncate((flags & (PteFlags::RW | PteFlags::US)).bits());
        pde.set_flags(pde.flags() | PdeFlags::P | accumulated);

        if let Some(old) = frames.table(tpa)[idx.ptei].pa() {
            frames.decref(old);
        }
        frames.table_mut(tpa)[idx.ptei] = entry;
        Ok(())
    }

    /// ORs `marks` into the leaf entry covering `va`. Used by the access
    /// path to maintain the accessed and dirty bits; does nothing when the
    /// address is unmapped.
    pub fn mark(&mut self, frames: &mut FrameAllocator, va: Va, marks: PteFlags) {
        let Ok(idx) = PtIndices::from_va(va.page_down()) else {
            return;
        };
        let Some(tpa) = self.pgdir[idx.pdei].pa() else {
            return;
        };
        let pte = &mut frames.table_mut(tpa)[idx.ptei];
        if pte.flags().contains(PteFlags::P) {
            let flags = pte.flags() | marks;
            pte.set_flags(flags);
        }
    }

    /// Removes the mapping at `va`, if any, releasing its frame reference.
    ///
    /// Removing a non-existent mapping succeeds silently. Page tables are
    /// not torn down here; they live until [`AddressSpace::clear`].
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::InvalidArgument)` if `va` is unaligned.
    pub fn unmap(&mut self, frames: &mut FrameAllocator, va: Va) -> Result<(), KernelError> {
        let idx = PtIndices::from_va(va)?;
        let Some(tpa) = self.pgdir[idx.pdei].pa() else {
            return Ok(());
        };
        if let Some(pa) = frames.table_mut(tpa)[idx.ptei].clear() {
            frames.decref(pa);
        }
        Ok(())
    }

    /// Tears the whole address space down: releases every mapped frame,
    /// then every table frame, leaving the directory empty.
    pub fn clear(&mut self, frames: &mut FrameAllocator) {
        for pde in self.pgdir.iter_mut() {
            let Some(tpa) = pde.clear() else { continue };
            for ptei in 0..NPTENTRIES {
                if let Some(pa) = frames.table_mut(tpa)[ptei].clear() {
                    frames.decref(pa);
                }
            }
            frames.decref(tpa);
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
