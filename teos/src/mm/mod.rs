//! Physical memory management.
//!
//! The [`FrameAllocator`] models the machine's physical memory as a pool of
//! page-sized frames with a fixed capacity chosen at construction. Every
//! frame carries a reference count: mapping a frame into an address space
//! takes a reference, unmapping releases one, and the frame returns to the
//! free list when the last reference is gone. Frames are zero-filled when
//! handed out.
//!
//! Frames come in two kinds. Data frames back user pages and expose their
//! contents as a byte array. Table frames back second-level page tables and
//! expose their contents as an array of page-table entries; keeping the two
//! apart in the store stands in for the reinterpretation of raw memory a
//! real kernel performs, which a host-side model cannot do soundly.

pub mod page_table;

use crate::{
    KernelError,
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
};
use alloc::{boxed::Box, vec::Vec};
use page_table::{NPTENTRIES, Pte};

/// Backing storage of a single frame.
enum FrameStore {
    /// An ordinary page of user data.
    Data(Box<[u8; PAGE_SIZE]>),
    /// A second-level page table.
    Table(Box<[Pte; NPTENTRIES]>),
}

struct Frame {
    refs: usize,
    store: FrameStore,
}

/// A reference-counted pool of physical frames.
///
/// Physical addresses handed out by the pool are frame numbers shifted by
/// [`PAGE_SHIFT`]; the pool panics if asked about an address it never
/// produced, since only the kernel model itself manufactures [`Pa`] values.
pub struct FrameAllocator {
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
}

impl FrameAllocator {
    /// Creates a pool of `nframes` frames, all free.
    pub fn new(nframes: usize) -> Self {
        let mut frames = Vec::with_capacity(nframes);
        frames.resize_with(nframes, || None);
        // Hand out low frame numbers first.
        let free = (0..nframes).rev().collect();
        Self { frames, free }
    }

    /// Allocates a zero-filled data frame.
    ///
    /// # Returns
    /// - `Ok(Pa)` with a reference count of one.
    /// - `Err(KernelError::NoMemory)` if the pool is exhausted.
    pub fn alloc(&mut self) -> Result<Pa, KernelError> {
        self.alloc_with(FrameStore::Data(Box::new([0u8; PAGE_SIZE])))
    }

    /// Allocates a frame holding an empty page table.
    ///
    /// Table frames draw from the same pool as data frames, so running out
    /// of memory surfaces identically for both.
    pub(crate) fn alloc_table(&mut self) -> Result<Pa, KernelError> {
        self.alloc_with(FrameStore::Table(Box::new([Pte(0); NPTENTRIES])))
    }

    fn alloc_with(&mut self, store: FrameStore) -> Result<Pa, KernelError> {
        let index = self.free.pop().ok_or(KernelError::NoMemory)?;
        self.frames[index] = Some(Frame { refs: 1, store });
        Ok(Pa::new(index << PAGE_SHIFT).unwrap())
    }

    /// Takes an additional reference on the frame at `pa`.
    pub fn incref(&mut self, pa: Pa) {
        self.frame_mut(pa).refs += 1;
    }

    /// Releases one reference on the frame at `pa`, returning it to the
    /// free list when the count reaches zero.
    pub fn decref(&mut self, pa: Pa) {
        let index = self.index_of(pa);
        let frame = self.frames[index]
            .as_mut()
            .expect("decref of a free frame");
        frame.refs -= 1;
        if frame.refs == 0 {
            self.frames[index] = None;
            self.free.push(index);
        }
    }

    /// Current reference count of the frame at `pa`.
    pub fn refs(&self, pa: Pa) -> usize {
        self.frame(pa).refs
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Read access to the contents of a data frame.
    pub fn data(&self, pa: Pa) -> &[u8; PAGE_SIZE] {
        match &self.frame(pa).store {
            FrameStore::Data(bytes) => bytes,
            FrameStore::Table(_) => panic!("data access to table frame {:?}", pa),
        }
    }

    /// Write access to the contents of a data frame.
    pub fn data_mut(&mut self, pa: Pa) -> &mut [u8; PAGE_SIZE] {
        match &mut self.frame_mut(pa).store {
            FrameStore::Data(bytes) => bytes,
            FrameStore::Table(_) => panic!("data access to table frame {:?}", pa),
        }
    }

    /// Read access to the entries of a table frame.
    pub(crate) fn table(&self, pa: Pa) -> &[Pte; NPTENTRIES] {
        match &self.frame(pa).store {
            FrameStore::Table(entries) => entries,
            FrameStore::Data(_) => panic!("table access to data frame {:?}", pa),
        }
    }

    /// Write access to the entries of a table frame.
    pub(crate) fn table_mut(&mut self, pa: Pa) -> &mut [Pte; NPTENTRIES] {
        match &mut self.frame_mut(pa).store {
            FrameStore::Table(entries) => entries,
            FrameStore::Data(_) => panic!("table access to data frame {:?}", pa),
        }
    }

    /// Copies the full contents of the data frame at `src` over the data
    /// frame at `dst`.
    pub fn copy_frame(&mut self, src: Pa, dst: Pa) {
        let bytes = *self.data(src);
        self.data_mut(dst).copy_from_slice(&bytes);
    }

    fn index_of(&self, pa: Pa) -> usize {
        let index = pa.into_usize() >> PAGE_SHIFT;
        assert!(
            pa.offset() == 0 && index < self.frames.len(),
            "foreign physical address {:?}",
            pa
        );
        index
    }

    fn frame(&self, pa: Pa) -> &Frame {
        let index = self.index_of(pa);
        self.frames[index].as_ref().expect("access to free frame")
    }

    fn frame_mut(&mut self, pa: Pa) -> &mut Frame {
        let index = self.index_of(pa);
        self.frames[index].as_mut().expect("access to free frame")
    }
}
