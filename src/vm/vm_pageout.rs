//! Page Reclaim - Clock (Second-Chance) Eviction
//!
//! When the free list is empty, a single clock hand sweeps the inverted
//! table:
//! - pinned frames are skipped
//! - a frame whose page was used recently loses its used bit and is passed
//!   over (second chance)
//! - the first unpinned frame with a clear used bit is the victim, and the
//!   hand moves past it
//!
//! Detaching the victim happens under the core-map lock. A read-only page
//! is simply dropped, since the image can reproduce it. Any other page is
//! dirty and is marked in transit, written to a fresh swap slot with no
//! lock held, and only then recorded as evicted.
//!
//! If every frame is pinned the allocator blocks on the "frame unpinned"
//! queue until some unpin frees capacity.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::VmResult;
use crate::types::{Ppn, SwapSlot};
use crate::vm::context::KernelMemoryContext;
use crate::vm::vm_page::{CoreMap, FrameOwner, PhysicalMemoryManager};

// ============================================================================
// Pageout Statistics
// ============================================================================

/// Pageout statistics
#[derive(Debug, Default)]
pub struct PageoutStats {
    /// Clock scans run
    pub scans: AtomicU64,
    /// Owned frames examined
    pub examined: AtomicU64,
    /// Used bits cleared
    pub second_chances: AtomicU64,
    /// Pinned frames passed over
    pub pinned_skips: AtomicU64,
    /// Victims dropped without I/O
    pub discarded: AtomicU64,
    /// Victims written to swap
    pub swapped_out: AtomicU64,
    /// Times an allocator blocked with every frame pinned
    pub blocked: AtomicU64,
}

impl PageoutStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Clock Scan
// ============================================================================

/// A frame detached from its page by the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    /// Frame now reserved for the caller
    pub ppn: Ppn,
    /// Page that was mapped there
    pub owner: FrameOwner,
    /// The contents must be written to swap before reuse
    pub swap_out: bool,
}

impl CoreMap {
    /// Run the clock from the hand and detach a victim
    ///
    /// Two sweeps are enough: the first clears every used bit it passes.
    /// Returns `None` if no owned, unpinned frame exists.
    pub(crate) fn clock_scan(&mut self, stats: &PageoutStats) -> Option<Eviction> {
        let count = self.frames.len();
        stats.scans.fetch_add(1, Ordering::Relaxed);

        for _ in 0..2 * count {
            let ppn = Ppn(self.hand as u32);
            self.hand = (self.hand + 1) % count;

            let frame = self.frames[ppn.index()];
            if frame.pins > 0 {
                stats.pinned_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let Some(owner) = frame.owner else {
                continue;
            };
            stats.examined.fetch_add(1, Ordering::Relaxed);

            let entry = match self.entry_mut(owner.space, owner.vpn) {
                Some(entry) => entry,
                None => panic!("frame {} owned by unknown page {:?}", ppn, owner),
            };
            assert!(entry.valid && entry.ppn == ppn, "frame {} back-reference broken", ppn);

            if entry.used {
                entry.used = false;
                stats.second_chances.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            entry.valid = false;
            let swap_out = entry.needs_swap();
            if swap_out {
                assert!(entry.swap_slot.is_none(), "resident page {:?} holds a slot", owner);
                entry.in_transit = true;
            }

            self.frames[ppn.index()].owner = None;
            self.pin_frame(ppn);
            return Some(Eviction {
                ppn,
                owner,
                swap_out,
            });
        }
        None
    }
}

// ============================================================================
// Swap-out Completion
// ============================================================================

impl PhysicalMemoryManager {
    /// Record that an evicted page now lives in `slot`
    ///
    /// Returns false if the address space was unloaded meanwhile, in which
    /// case the slot is the caller's to free.
    fn finish_swap_out(&self, owner: FrameOwner, slot: SwapSlot) -> bool {
        let recorded = match self.lock_core().entry_mut(owner.space, owner.vpn) {
            Some(entry) => {
                entry.swap_slot = Some(slot);
                entry.in_transit = false;
                true
            }
            None => false,
        };
        self.transit_queue().wake_all();
        recorded
    }

    /// Put a victim back after its swap-out failed
    fn restore_victim(&self, eviction: Eviction) {
        let wake = {
            let mut core = self.lock_core();
            match core.entry_mut(eviction.owner.space, eviction.owner.vpn) {
                Some(entry) => {
                    entry.valid = true;
                    entry.ppn = eviction.ppn;
                    entry.in_transit = false;
                    core.frames[eviction.ppn.index()].owner = Some(eviction.owner);
                    Some(core.unpin_frame(eviction.ppn))
                }
                None => None,
            }
        };
        match wake {
            Some(true) => self.unpinned_queue().wake_all(),
            Some(false) => {}
            // Owner exited during the write
            None => self.release(eviction.ppn),
        }
        self.transit_queue().wake_all();
    }
}

// ============================================================================
// Reclaim
// ============================================================================

/// Produce a reserved frame, evicting if the free list is empty
///
/// Blocks while every frame is pinned. Fails only if a victim's swap-out
/// fails; the victim is left mapped in that case.
pub fn reclaim(ctx: &KernelMemoryContext) -> VmResult<Ppn> {
    let frames = ctx.frames();
    let stats = ctx.pageout_stats();

    loop {
        if let Some(ppn) = frames.take_free() {
            return Ok(ppn);
        }

        let scan = {
            let mut core = frames.lock_core();
            if core.all_pinned() {
                Err(Some(frames.unpinned_queue().prepare()))
            } else {
                core.clock_scan(stats).ok_or(None)
            }
        };

        match scan {
            Ok(eviction) => {
                swap_out(ctx, eviction)?;
                return Ok(eviction.ppn);
            }
            Err(Some(token)) => {
                stats.blocked.fetch_add(1, Ordering::Relaxed);
                log::debug!("all {} frames pinned, waiting", frames.frame_count());
                frames.unpinned_queue().wait(token);
            }
            // Only unowned frames were unpinned: one is on its way to
            // the free list
            Err(None) => core::hint::spin_loop(),
        }
    }
}

/// Save a detached victim's contents so its frame can be reused
fn swap_out(ctx: &KernelMemoryContext, eviction: Eviction) -> VmResult<()> {
    let stats = ctx.pageout_stats();
    let Eviction {
        ppn,
        owner,
        swap_out,
    } = eviction;

    if !swap_out {
        stats.discarded.fetch_add(1, Ordering::Relaxed);
        log::debug!("evicted clean page {}:{} from frame {}", owner.space, owner.vpn, ppn);
        return Ok(());
    }

    let swap = ctx.swap();
    let slot = swap.allocate_slot();
    if let Err(err) = swap.write_slot(slot, ctx.memory(), ppn) {
        ctx.frames().restore_victim(eviction);
        swap.free_slot(slot);
        return Err(err);
    }

    if !ctx.frames().finish_swap_out(owner, slot) {
        swap.free_slot(slot);
    }
    stats.swapped_out.fetch_add(1, Ordering::Relaxed);
    log::debug!(
        "evicted page {}:{} from frame {} to slot {}",
        owner.space,
        owner.vpn,
        ppn,
        slot
    );
    Ok(())
}
