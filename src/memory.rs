//! Physical memory for the paging subsystem
//!
//! Main memory is a flat run of `frame_count * page_size` bytes where byte
//! `page_size * ppn + offset` belongs to frame `ppn`. Each frame sits behind
//! its own lock so copies into different frames never contend; callers that
//! must keep a frame from being reused pin it through the frame manager.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::types::Ppn;

/// Simulated physical memory
pub struct PhysicalMemory {
    page_size: usize,
    frames: Vec<Mutex<Box<[u8]>>>,
}

impl PhysicalMemory {
    /// Create zeroed memory with `frame_count` frames of `page_size` bytes
    pub fn new(page_size: usize, frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|_| Mutex::new(vec![0u8; page_size].into_boxed_slice()))
            .collect();
        Self { page_size, frames }
    }

    /// Bytes per frame
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of frames
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.page_size * self.frames.len()
    }

    /// Flat physical address of `offset` within frame `ppn`
    pub fn paddr(&self, ppn: Ppn, offset: usize) -> usize {
        self.page_size * ppn.index() + offset
    }

    /// Run `f` with exclusive access to one frame
    pub fn with_frame<R>(&self, ppn: Ppn, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut frame = self.frame(ppn).lock();
        f(&mut frame)
    }

    /// Copy bytes out of a frame starting at `offset`
    pub fn read(&self, ppn: Ppn, offset: usize, dst: &mut [u8]) {
        let frame = self.frame(ppn).lock();
        dst.copy_from_slice(&frame[offset..offset + dst.len()]);
    }

    /// Copy bytes into a frame starting at `offset`
    pub fn write(&self, ppn: Ppn, offset: usize, src: &[u8]) {
        let mut frame = self.frame(ppn).lock();
        frame[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Zero a whole frame
    pub fn zero(&self, ppn: Ppn) {
        self.frame(ppn).lock().fill(0);
    }

    fn frame(&self, ppn: Ppn) -> &Mutex<Box<[u8]>> {
        match self.frames.get(ppn.index()) {
            Some(frame) => frame,
            None => panic!("frame {} out of range ({} frames)", ppn, self.frames.len()),
        }
    }
}

impl core::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("page_size", &self.page_size)
            .field("frames", &self.frames.len())
            .finish()
    }
}
