//! Swap Space - Backing Store for Evicted Pages
//!
//! The store is an unstructured run of `page_size`-byte slots: slot `k`
//! lives at byte offset `k * page_size`. No header or slot metadata is
//! written; which slots are live is known only to the kernel, so the store
//! is scratch space for one kernel lifetime.
//!
//! Three locks, never held together across I/O:
//! - the free-slot list
//! - the slot counter (high-water mark)
//! - the store itself, serialising every read and write

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{StoreError, SwapOp, VmError, VmResult};
use crate::memory::PhysicalMemory;
use crate::types::{Ppn, SwapSlot};

// ============================================================================
// Backing Store
// ============================================================================

/// Byte-addressed backing store
pub trait SwapStore: Send {
    /// Fill `buf` from `offset`
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Write `buf` at `offset`, growing the store as needed
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), StoreError>;

    /// Current size in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the store; later accesses fail with `StoreError::Closed`
    fn destroy(&mut self) -> Result<(), StoreError>;
}

/// Store kept in a growable buffer
#[derive(Debug, Default)]
pub struct MemorySwapStore {
    data: Vec<u8>,
    closed: bool,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwapStore for MemorySwapStore {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let start = usize::try_from(offset).map_err(|_| StoreError::OutOfRange { offset })?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.data.get(start..end))
            .ok_or(StoreError::OutOfRange { offset })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let start = usize::try_from(offset).map_err(|_| StoreError::OutOfRange { offset })?;
        let end = start
            .checked_add(buf.len())
            .ok_or(StoreError::OutOfRange { offset })?;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn destroy(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        self.data = Vec::new();
        Ok(())
    }
}

/// Store kept in a scratch file, removed when destroyed or dropped
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct FileSwapStore {
    path: std::path::PathBuf,
    file: Option<std::fs::File>,
    len: u64,
}

#[cfg(feature = "std")]
impl FileSwapStore {
    /// Create (or truncate) the swap file at `path`
    pub fn create(path: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        log::info!("swap file {} created", path.display());
        Ok(Self {
            path,
            file: Some(file),
            len: 0,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut std::fs::File, StoreError> {
        self.file.as_mut().ok_or(StoreError::Closed)
    }
}

#[cfg(feature = "std")]
impl SwapStore for FileSwapStore {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        use std::io::{Read, Seek, SeekFrom};

        if offset.saturating_add(buf.len() as u64) > self.len {
            return Err(StoreError::OutOfRange { offset });
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
        use std::io::{Seek, SeekFrom, Write};

        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn destroy(&mut self) -> Result<(), StoreError> {
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path)?;
            log::info!("swap file {} removed", self.path.display());
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
impl Drop for FileSwapStore {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::warn!("cannot remove swap file {}: {}", self.path.display(), err);
        }
    }
}

// ============================================================================
// Swap Statistics
// ============================================================================

/// Swap statistics
#[derive(Debug, Default)]
pub struct SwapStats {
    /// Slots handed out
    pub allocated: AtomicU64,
    /// Slots returned
    pub freed: AtomicU64,
    /// Slots minted by growing the store
    pub grown: AtomicU64,
    /// Pages read back in
    pub reads: AtomicU64,
    /// Pages written out
    pub writes: AtomicU64,
    /// Failed reads or writes
    pub errors: AtomicU64,
}

// ============================================================================
// Swap Space
// ============================================================================

/// Slot allocator and page-granularity I/O over a `SwapStore`
pub struct SwapSpace {
    page_size: usize,
    free_slots: Mutex<Vec<SwapSlot>>,
    next_slot: Mutex<u32>,
    store: Mutex<Box<dyn SwapStore>>,
    stats: SwapStats,
}

impl SwapSpace {
    pub fn new(page_size: usize, store: Box<dyn SwapStore>) -> Self {
        Self {
            page_size,
            free_slots: Mutex::new(Vec::new()),
            next_slot: Mutex::new(0),
            store: Mutex::new(store),
            stats: SwapStats::default(),
        }
    }

    /// Take a slot, reusing a freed one before growing the store
    pub fn allocate_slot(&self) -> SwapSlot {
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.free_slots.lock().pop() {
            log::trace!("swap slot {} reused", slot);
            return slot;
        }

        let mut next = self.next_slot.lock();
        let slot = SwapSlot(*next);
        *next += 1;
        self.stats.grown.fetch_add(1, Ordering::Relaxed);
        log::trace!("swap slot {} minted", slot);
        slot
    }

    /// Return a slot to the free list
    ///
    /// # Panics
    ///
    /// If `slot` was never allocated or is already free.
    pub fn free_slot(&self, slot: SwapSlot) {
        let minted = *self.next_slot.lock();
        assert!(slot.0 < minted, "swap slot {} was never allocated", slot);

        let mut free = self.free_slots.lock();
        assert!(!free.contains(&slot), "swap slot {} freed twice", slot);
        free.push(slot);
        self.stats.freed.fetch_add(1, Ordering::Relaxed);
        log::trace!("swap slot {} freed", slot);
    }

    /// Copy `slot` into frame `ppn`
    pub fn read_slot(&self, slot: SwapSlot, memory: &PhysicalMemory, ppn: Ppn) -> VmResult<()> {
        let offset = slot.offset(self.page_size);
        let result = {
            let mut store = self.store.lock();
            memory.with_frame(ppn, |frame| store.read(offset, frame))
        };
        self.finish_io(SwapOp::Read, slot, result)
    }

    /// Copy frame `ppn` into `slot`
    pub fn write_slot(&self, slot: SwapSlot, memory: &PhysicalMemory, ppn: Ppn) -> VmResult<()> {
        let offset = slot.offset(self.page_size);
        let result = {
            let mut store = self.store.lock();
            memory.with_frame(ppn, |frame| store.write(offset, frame))
        };
        self.finish_io(SwapOp::Write, slot, result)
    }

    fn finish_io(
        &self,
        op: SwapOp,
        slot: SwapSlot,
        result: Result<(), StoreError>,
    ) -> VmResult<()> {
        match result {
            Ok(()) => {
                let counter = match op {
                    SwapOp::Read => &self.stats.reads,
                    SwapOp::Write => &self.stats.writes,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(source) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                log::error!("swap {} of slot {} failed: {}", op, slot, source);
                Err(VmError::StorageFault { op, slot, source })
            }
        }
    }

    /// Slots referenced by evicted pages
    pub fn slots_in_use(&self) -> usize {
        let minted = *self.next_slot.lock() as usize;
        minted - self.free_slots.lock().len()
    }

    /// Slots ever minted
    pub fn slots_minted(&self) -> usize {
        *self.next_slot.lock() as usize
    }

    /// Size of the backing store in bytes
    pub fn store_len(&self) -> u64 {
        self.store.lock().len()
    }

    pub fn stats(&self) -> &SwapStats {
        &self.stats
    }

    /// Release the backing store
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.store.lock().destroy()
    }
}

impl core::fmt::Debug for SwapSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SwapSpace")
            .field("page_size", &self.page_size)
            .field("slots_in_use", &self.slots_in_use())
            .finish()
    }
}
