//! VM Page Management - Physical Frame Ownership and Pinning
//!
//! Every physical frame is in exactly one of three states:
//! - **free**: on the free list, unowned, unpinned
//! - **owned**: mapped by exactly one valid translation entry
//! - **reserved**: unowned and pinned by the thread that took it, while
//!   it is populated or swapped out, or by a copy still running when its
//!   address space was released (an orphan, freed by the last unpin)
//!
//! Two locks guard the frame state:
//! - the free list
//! - the core map, holding the inverted table (one `FrameEntry` per
//!   frame), pin counts, the pinned-frame counter, the clock hand and
//!   every registered translation table
//!
//! Keeping the translation tables under the core-map lock makes every
//! update to a `TranslationEntry` and its inverted-table entry one
//! critical section. No path holds both locks while blocking.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::error::{VmError, VmResult};
use crate::kern::sched_prim::{Parker, WaitQueue, WaitReason, WaitToken};
use crate::types::{Access, AddressSpaceId, Ppn, SwapSlot, Vpn};
use crate::vm::pmap::{PageTable, TranslationEntry};

// ============================================================================
// Inverted Page Table
// ============================================================================

/// The (address space, page) a frame is mapped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameOwner {
    pub space: AddressSpaceId,
    pub vpn: Vpn,
}

/// Inverted page table entry, one per physical frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameEntry {
    /// Current owner; `None` while free or reserved
    pub owner: Option<FrameOwner>,
    /// Outstanding pins; the frame is never evicted while non-zero
    pub pins: u32,
    /// Held by a non-paging process for its whole lifetime
    pub wired: bool,
    /// Released by its address space while pinned; goes to the free list
    /// on the last unpin
    pub orphaned: bool,
}

/// State guarded by the core-map lock
#[derive(Debug)]
pub struct CoreMap {
    pub(crate) frames: Vec<FrameEntry>,
    pub(crate) tables: BTreeMap<AddressSpaceId, PageTable>,
    /// Clock hand
    pub(crate) hand: usize,
    /// Frames with a non-zero pin count
    pub(crate) pinned_frames: usize,
    pub(crate) wired_frames: usize,
}

impl CoreMap {
    fn new(frame_count: usize) -> Self {
        Self {
            frames: alloc::vec![FrameEntry::default(); frame_count],
            tables: BTreeMap::new(),
            hand: 0,
            pinned_frames: 0,
            wired_frames: 0,
        }
    }

    /// Is every frame pinned?
    pub fn all_pinned(&self) -> bool {
        self.pinned_frames == self.frames.len()
    }

    /// Add a pin to `ppn`
    pub(crate) fn pin_frame(&mut self, ppn: Ppn) {
        let frame = &mut self.frames[ppn.index()];
        frame.pins += 1;
        if frame.pins == 1 {
            self.pinned_frames += 1;
        }
    }

    /// Drop a pin from `ppn`
    ///
    /// Returns true when this unpin ended a state where every frame was
    /// pinned, meaning blocked allocators must be woken.
    pub(crate) fn unpin_frame(&mut self, ppn: Ppn) -> bool {
        let saturated = self.all_pinned();
        let frame = &mut self.frames[ppn.index()];
        assert!(frame.pins > 0, "unpin of unpinned frame {}", ppn);
        frame.pins -= 1;
        if frame.pins == 0 {
            self.pinned_frames -= 1;
            return saturated;
        }
        false
    }

    pub fn entry(&self, space: AddressSpaceId, vpn: Vpn) -> Option<&TranslationEntry> {
        self.tables.get(&space)?.get(vpn)
    }

    pub(crate) fn entry_mut(
        &mut self,
        space: AddressSpaceId,
        vpn: Vpn,
    ) -> Option<&mut TranslationEntry> {
        self.tables.get_mut(&space)?.get_mut(vpn)
    }
}

// ============================================================================
// Fault Coordination
// ============================================================================

/// Where the contents of a faulting page come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// Previously evicted to this slot
    Swap(SwapSlot),
    /// Never resident, or a clean page that was dropped
    Fresh,
}

/// Result of claiming a page for fault resolution
#[derive(Debug)]
pub enum FaultClaim {
    /// Already mapped, nothing to do
    Resident,
    /// Another thread owns the page's transition; wait and retry
    Busy(WaitToken),
    /// The caller now owns the transition
    Claimed(PageSource),
}

/// Result of pinning a page for a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// Resident and pinned in this frame
    Pinned(Ppn),
    /// Needs a fault first
    NotResident,
    /// Write to a read-only page
    ReadOnly,
}

// ============================================================================
// Audit
// ============================================================================

/// Broken frame-accounting invariant found by `audit`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("frame {0} is mapped by more than one valid entry")]
    SharedFrame(Ppn),

    #[error("entry {space}:{vpn} maps frame {ppn} owned by someone else")]
    BrokenBackReference {
        space: AddressSpaceId,
        vpn: Vpn,
        ppn: Ppn,
    },

    #[error("frame {0} names an owner whose entry does not map it")]
    StaleOwner(Ppn),

    #[error("frame {0} is on the free list but owned or pinned")]
    BusyFreeFrame(Ppn),

    #[error("frame {0} is neither free, owned nor reserved")]
    LostFrame(Ppn),

    #[error("pinned-frame counter is {counted}, frames say {actual}")]
    PinCount { counted: usize, actual: usize },
}

/// Frame accounting snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCensus {
    pub free: usize,
    pub owned: usize,
    pub reserved: usize,
    pub pinned: usize,
}

impl FrameCensus {
    pub fn total(&self) -> usize {
        self.free + self.owned + self.reserved
    }
}

// ============================================================================
// Page Statistics
// ============================================================================

/// Frame manager statistics
#[derive(Debug, Default)]
pub struct PageStats {
    /// Frames taken from the free list
    pub free_hits: AtomicU64,
    /// Frames returned to the free list
    pub releases: AtomicU64,
    pub pins: AtomicU64,
    pub unpins: AtomicU64,
    /// Pages mapped
    pub installs: AtomicU64,
}

// ============================================================================
// Physical Memory Manager
// ============================================================================

/// Owner of the free list, the inverted table and the clock hand
pub struct PhysicalMemoryManager {
    core: Mutex<CoreMap>,
    free: Mutex<VecDeque<Ppn>>,
    frame_count: usize,
    unpinned: WaitQueue,
    transit: WaitQueue,
    stats: PageStats,
}

impl PhysicalMemoryManager {
    /// Manage `frame_count` frames, all initially free
    pub fn new(frame_count: usize, parker: Arc<dyn Parker>) -> Self {
        Self {
            core: Mutex::new(CoreMap::new(frame_count)),
            free: Mutex::new((0..frame_count as u32).map(Ppn).collect()),
            frame_count,
            unpinned: WaitQueue::new(WaitReason::FrameUnpinned, Arc::clone(&parker)),
            transit: WaitQueue::new(WaitReason::PageTransit, parker),
            stats: PageStats::default(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn pinned_count(&self) -> usize {
        self.core.lock().pinned_frames
    }

    /// Frames held by non-paging processes
    pub fn wired_count(&self) -> usize {
        self.core.lock().wired_frames
    }

    pub fn stats(&self) -> &PageStats {
        &self.stats
    }

    /// Queue of threads waiting for some frame to become unpinned
    pub fn unpinned_queue(&self) -> &WaitQueue {
        &self.unpinned
    }

    /// Queue of threads waiting for a page to finish paging in or out
    pub fn transit_queue(&self) -> &WaitQueue {
        &self.transit
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, CoreMap> {
        self.core.lock()
    }

    // ------------------------------------------------------------------------
    // Free list
    // ------------------------------------------------------------------------

    /// Take a free frame, reserved for the caller
    pub fn take_free(&self) -> Option<Ppn> {
        let ppn = self.free.lock().pop_front()?;
        self.core.lock().pin_frame(ppn);
        self.stats.free_hits.fetch_add(1, Ordering::Relaxed);
        log::trace!("frame {} taken from free list", ppn);
        Some(ppn)
    }

    /// Take `count` free frames or none at all
    ///
    /// On shortage returns the number that were free.
    pub fn take_free_many(&self, count: usize) -> Result<Vec<Ppn>, usize> {
        let taken: Vec<Ppn> = {
            let mut free = self.free.lock();
            if free.len() < count {
                return Err(free.len());
            }
            free.drain(..count).collect()
        };
        let mut core = self.core.lock();
        for &ppn in &taken {
            core.pin_frame(ppn);
        }
        self.stats
            .free_hits
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(taken)
    }

    /// Return a reserved frame to the free list
    pub fn release(&self, ppn: Ppn) {
        let wake = {
            let mut core = self.core.lock();
            let frame = &core.frames[ppn.index()];
            assert!(
                frame.owner.is_none(),
                "release of frame {} still owned by {:?}",
                ppn,
                frame.owner
            );
            core.unpin_frame(ppn)
        };
        self.push_free(ppn);
        if wake {
            self.unpinned.wake_all();
        }
    }

    fn push_free(&self, ppn: Ppn) {
        self.free.lock().push_back(ppn);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        log::trace!("frame {} released", ppn);
    }

    // ------------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------------

    /// Keep `ppn` from being evicted
    pub fn pin(&self, ppn: Ppn) {
        self.core.lock().pin_frame(ppn);
        self.stats.pins.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one pin from `ppn`, waking blocked allocators if it frees capacity
    ///
    /// The last unpin of an orphaned frame returns it to the free list.
    pub fn unpin(&self, ppn: Ppn) {
        let (wake, orphan_freed) = {
            let mut core = self.core.lock();
            let wake = core.unpin_frame(ppn);
            let frame = &mut core.frames[ppn.index()];
            let orphan_freed = frame.orphaned && frame.pins == 0;
            if orphan_freed {
                frame.orphaned = false;
            }
            (wake, orphan_freed)
        };
        self.stats.unpins.fetch_add(1, Ordering::Relaxed);
        if orphan_freed {
            self.push_free(ppn);
            self.unpinned.wake_all();
        }
        if wake {
            log::trace!("frame {} unpinned, waking allocators", ppn);
            self.unpinned.wake_all();
        }
    }

    /// Pin the frame mapping `vpn` for a copy in direction `access`
    ///
    /// Marks the page used, and dirty for writes.
    pub fn pin_resident(
        &self,
        space: AddressSpaceId,
        vpn: Vpn,
        access: Access,
    ) -> VmResult<PinOutcome> {
        let mut core = self.core.lock();
        let entry = core
            .entry_mut(space, vpn)
            .ok_or(VmError::UnknownAddressSpace(space))?;

        if access == Access::Write && entry.read_only {
            return Ok(PinOutcome::ReadOnly);
        }
        if !entry.valid {
            return Ok(PinOutcome::NotResident);
        }
        entry.used = true;
        if access == Access::Write {
            entry.dirty = true;
        }
        let ppn = entry.ppn;
        core.pin_frame(ppn);
        self.stats.pins.fetch_add(1, Ordering::Relaxed);
        Ok(PinOutcome::Pinned(ppn))
    }

    // ------------------------------------------------------------------------
    // Address spaces
    // ------------------------------------------------------------------------

    /// Start tracking an address space's translation table
    pub fn register(&self, table: PageTable) -> VmResult<()> {
        let space = table.space();
        let mut core = self.core.lock();
        if core.tables.contains_key(&space) {
            return Err(VmError::AlreadyLoaded(space));
        }
        core.tables.insert(space, table);
        Ok(())
    }

    /// Drop an address space, freeing its frames
    ///
    /// Returns the swap slots its evicted pages held, or `None` if it was
    /// not registered. Pages in transit keep their frames with the thread
    /// moving them, which releases them once it sees the table is gone.
    /// Frames still pinned by a copy are orphaned: they stay reserved until
    /// the copy unpins them.
    pub fn unregister(&self, space: AddressSpaceId) -> Option<Vec<SwapSlot>> {
        let (frames, orphans, slots) = {
            let mut core = self.core.lock();
            let table = core.tables.remove(&space)?;
            let mut frames = Vec::new();
            let mut orphans = 0;
            for entry in table.iter().filter(|e| e.valid) {
                let ppn = entry.ppn;
                let frame = &mut core.frames[ppn.index()];
                debug_assert_eq!(
                    frame.owner,
                    Some(FrameOwner {
                        space,
                        vpn: entry.vpn
                    })
                );
                let wired = frame.wired;
                frame.owner = None;
                frame.wired = false;
                if wired {
                    core.wired_frames -= 1;
                    core.unpin_frame(ppn);
                }

                let frame = &mut core.frames[ppn.index()];
                if frame.pins > 0 {
                    frame.orphaned = true;
                    orphans += 1;
                } else {
                    frames.push(ppn);
                }
            }
            (frames, orphans, table.swap_slots().collect::<Vec<_>>())
        };

        let released = frames.len();
        self.free.lock().extend(frames);
        self.stats
            .releases
            .fetch_add(released as u64, Ordering::Relaxed);
        log::debug!(
            "{} unloaded: {} frames ({} still pinned) and {} swap slots released",
            space,
            released,
            orphans,
            slots.len()
        );
        self.unpinned.wake_all();
        self.transit.wake_all();
        Some(slots)
    }

    /// Snapshot of one translation entry
    pub fn translation(&self, space: AddressSpaceId, vpn: Vpn) -> Option<TranslationEntry> {
        self.core.lock().entry(space, vpn).copied()
    }

    /// Snapshot of a whole translation table
    pub fn page_table(&self, space: AddressSpaceId) -> Option<PageTable> {
        self.core.lock().tables.get(&space).cloned()
    }

    /// Inverted table entry for `ppn`
    pub fn frame(&self, ppn: Ppn) -> Option<FrameEntry> {
        self.core.lock().frames.get(ppn.index()).copied()
    }

    // ------------------------------------------------------------------------
    // Fault protocol
    // ------------------------------------------------------------------------

    /// Claim `vpn` for fault resolution
    ///
    /// # Panics
    ///
    /// If a dirty writable page is neither resident nor in swap.
    pub fn begin_fault(&self, space: AddressSpaceId, vpn: Vpn) -> VmResult<FaultClaim> {
        let mut core = self.core.lock();
        let entry = core
            .entry_mut(space, vpn)
            .ok_or(VmError::UnknownAddressSpace(space))?;

        if entry.valid {
            return Ok(FaultClaim::Resident);
        }
        if entry.in_transit {
            return Ok(FaultClaim::Busy(self.transit.prepare()));
        }

        let source = if entry.needs_swap() {
            match entry.swap_slot {
                Some(slot) => PageSource::Swap(slot),
                None => panic!("dirty page {}:{} has no swap slot", space, vpn),
            }
        } else {
            PageSource::Fresh
        };
        entry.in_transit = true;
        Ok(FaultClaim::Claimed(source))
    }

    /// Map reserved frame `ppn` at `vpn` and end the transition
    ///
    /// Returns the swap slot the page came from, which the caller frees.
    /// Fails if the address space was unloaded meanwhile; the frame is
    /// released in that case.
    pub fn install(
        &self,
        space: AddressSpaceId,
        vpn: Vpn,
        ppn: Ppn,
        dirty: bool,
    ) -> VmResult<Option<SwapSlot>> {
        self.map_frame(space, vpn, ppn, dirty, false)
    }

    /// Map reserved frame `ppn` and keep it pinned for the address
    /// space's lifetime
    pub fn install_wired(
        &self,
        space: AddressSpaceId,
        vpn: Vpn,
        ppn: Ppn,
        dirty: bool,
    ) -> VmResult<()> {
        self.map_frame(space, vpn, ppn, dirty, true).map(|_| ())
    }

    fn map_frame(
        &self,
        space: AddressSpaceId,
        vpn: Vpn,
        ppn: Ppn,
        dirty: bool,
        wired: bool,
    ) -> VmResult<Option<SwapSlot>> {
        let (slot, wake) = {
            let mut core = self.core.lock();
            let Some(entry) = core.entry_mut(space, vpn) else {
                drop(core);
                self.release(ppn);
                return Err(VmError::UnknownAddressSpace(space));
            };
            entry.ppn = ppn;
            entry.valid = true;
            entry.used = true;
            entry.dirty = dirty;
            entry.in_transit = false;
            let slot = entry.swap_slot.take();

            let frame = &mut core.frames[ppn.index()];
            debug_assert!(frame.owner.is_none() && frame.pins > 0);
            frame.owner = Some(FrameOwner { space, vpn });
            let wake = if wired {
                frame.wired = true;
                core.wired_frames += 1;
                false
            } else {
                core.unpin_frame(ppn)
            };
            (slot, wake)
        };

        self.stats.installs.fetch_add(1, Ordering::Relaxed);
        self.transit.wake_all();
        if wake {
            self.unpinned.wake_all();
        }
        Ok(slot)
    }

    /// Abandon a claimed fault, returning reserved frame `ppn` if any
    pub fn abort_fault(&self, space: AddressSpaceId, vpn: Vpn, ppn: Option<Ppn>) {
        if let Some(entry) = self.core.lock().entry_mut(space, vpn) {
            entry.in_transit = false;
        }
        if let Some(ppn) = ppn {
            self.release(ppn);
        }
        self.transit.wake_all();
    }

    // ------------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------------

    /// Check frame uniqueness, back-reference consistency and conservation
    pub fn audit(&self) -> Result<FrameCensus, InvariantViolation> {
        let core = self.core.lock();
        let free = self.free.lock();

        let mut mapped = BTreeSet::new();
        for (&space, table) in &core.tables {
            for entry in table.iter().filter(|e| e.valid) {
                if !mapped.insert(entry.ppn) {
                    return Err(InvariantViolation::SharedFrame(entry.ppn));
                }
                let owner = core.frames.get(entry.ppn.index()).and_then(|f| f.owner);
                if owner != Some(FrameOwner { space, vpn: entry.vpn }) {
                    return Err(InvariantViolation::BrokenBackReference {
                        space,
                        vpn: entry.vpn,
                        ppn: entry.ppn,
                    });
                }
            }
        }

        let free_set: BTreeSet<Ppn> = free.iter().copied().collect();
        let mut census = FrameCensus {
            free: free_set.len(),
            owned: 0,
            reserved: 0,
            pinned: 0,
        };
        for (index, frame) in core.frames.iter().enumerate() {
            let ppn = Ppn(index as u32);
            if frame.pins > 0 {
                census.pinned += 1;
            }
            if free_set.contains(&ppn) {
                if frame.owner.is_some() || frame.pins > 0 || frame.orphaned {
                    return Err(InvariantViolation::BusyFreeFrame(ppn));
                }
                continue;
            }
            match frame.owner {
                Some(owner) => {
                    let maps_back = core
                        .entry(owner.space, owner.vpn)
                        .is_some_and(|e| e.valid && e.ppn == ppn);
                    if !maps_back {
                        return Err(InvariantViolation::StaleOwner(ppn));
                    }
                    census.owned += 1;
                }
                None if frame.pins > 0 => census.reserved += 1,
                None => return Err(InvariantViolation::LostFrame(ppn)),
            }
        }

        if census.pinned != core.pinned_frames {
            return Err(InvariantViolation::PinCount {
                counted: core.pinned_frames,
                actual: census.pinned,
            });
        }
        if free.len() != free_set.len() {
            // A frame listed twice would be handed out twice
            let dup = free
                .iter()
                .enumerate()
                .find(|(i, p)| free.iter().skip(i + 1).any(|q| q == *p))
                .map(|(_, p)| *p)
                .unwrap_or_default();
            return Err(InvariantViolation::BusyFreeFrame(dup));
        }
        Ok(census)
    }
}

impl core::fmt::Debug for PhysicalMemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemoryManager")
            .field("frame_count", &self.frame_count)
            .field("free", &self.free_count())
            .field("pinned", &self.pinned_count())
            .finish()
    }
}
