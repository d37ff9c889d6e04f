//! VM Fault - Page Fault Resolution
//!
//! Resolving a fault on a virtual page:
//! 1. Claim the page under the core-map lock. A page that is already
//!    resident needs nothing; a page another thread is moving is waited
//!    for, and the claim retried.
//! 2. Take a reserved frame, evicting if needed.
//! 3. Fill it with no lock held:
//!    - dirty writable page: read back from its swap slot
//!    - section page: loaded from the executable image
//!    - anonymous page: zero-filled
//! 4. Install the mapping and free the swap slot it came from.
//!
//! Read-only section pages install clean and are never swapped. Writable
//! section pages and anonymous pages install dirty, so eviction always
//! sends them through swap.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::types::{Ppn, Vpn};
use crate::vm::context::KernelMemoryContext;
use crate::vm::vm_map::{AddressSpace, PageOrigin};
use crate::vm::vm_page::{FaultClaim, PageSource};

// ============================================================================
// Fault Outcome
// ============================================================================

/// How a fault was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was already mapped
    AlreadyResident,
    /// Read back from swap
    SwappedIn,
    /// Loaded from an executable section
    SectionLoaded,
    /// Anonymous page zero-filled
    ZeroFilled,
}

impl FaultOutcome {
    /// Dirty bit the page is installed with
    fn installs_dirty(self, read_only: bool) -> bool {
        match self {
            FaultOutcome::SectionLoaded => !read_only,
            _ => true,
        }
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Total faults handled
    pub faults: AtomicU64,
    /// Faults that found the page already resident
    pub already_resident: AtomicU64,
    pub swapped_in: AtomicU64,
    pub section_loads: AtomicU64,
    pub zero_fills: AtomicU64,
    /// Faults that waited for another thread's transition
    pub transit_waits: AtomicU64,
    /// Faults that failed
    pub failures: AtomicU64,
}

impl FaultStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: FaultOutcome) {
        let counter = match outcome {
            FaultOutcome::AlreadyResident => &self.already_resident,
            FaultOutcome::SwappedIn => &self.swapped_in,
            FaultOutcome::SectionLoaded => &self.section_loads,
            FaultOutcome::ZeroFilled => &self.zero_fills,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Page Fault Handler
// ============================================================================

/// Resolves faults for one address space
pub struct PageFaultHandler<'a> {
    ctx: &'a KernelMemoryContext,
    space: &'a AddressSpace,
}

impl<'a> PageFaultHandler<'a> {
    pub fn new(ctx: &'a KernelMemoryContext, space: &'a AddressSpace) -> Self {
        Self { ctx, space }
    }

    /// Make `vpn` resident
    ///
    /// May block waiting for a frame or for another thread's transition
    /// of the same page.
    pub fn handle_fault(&self, vpn: Vpn) -> VmResult<FaultOutcome> {
        let stats = self.ctx.fault_stats();
        stats.faults.fetch_add(1, Ordering::Relaxed);

        if vpn.index() >= self.space.num_pages() {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err(VmError::InvalidAddress {
                vaddr: self.space.vaddr_of(vpn),
            });
        }

        let frames = self.ctx.frames();
        let space = self.space.id();
        let source = loop {
            match frames.begin_fault(space, vpn) {
                Ok(FaultClaim::Resident) => {
                    stats.record(FaultOutcome::AlreadyResident);
                    return Ok(FaultOutcome::AlreadyResident);
                }
                Ok(FaultClaim::Busy(token)) => {
                    stats.transit_waits.fetch_add(1, Ordering::Relaxed);
                    frames.transit_queue().wait(token);
                }
                Ok(FaultClaim::Claimed(source)) => break source,
                Err(err) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        };

        match self.resolve(vpn, source) {
            Ok(outcome) => {
                stats.record(outcome);
                log::debug!("fault {}:{} resolved: {:?}", space, vpn, outcome);
                Ok(outcome)
            }
            Err(err) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("fault {}:{} failed: {}", space, vpn, err);
                Err(err)
            }
        }
    }

    /// Make the page holding `vaddr` resident
    pub fn handle_fault_at(&self, vaddr: usize) -> VmResult<FaultOutcome> {
        match self.space.page_of(vaddr) {
            Some(vpn) => self.handle_fault(vpn),
            None => Err(VmError::InvalidAddress { vaddr }),
        }
    }

    /// Fill a frame for a claimed page and map it
    fn resolve(&self, vpn: Vpn, source: PageSource) -> VmResult<FaultOutcome> {
        let frames = self.ctx.frames();
        let space = self.space.id();

        let ppn = match self.ctx.allocate() {
            Ok(ppn) => ppn,
            Err(err) => {
                frames.abort_fault(space, vpn, None);
                return Err(err);
            }
        };

        let outcome = match source {
            PageSource::Swap(slot) => match self.ctx.swap().read_slot(slot, self.ctx.memory(), ppn) {
                Ok(()) => FaultOutcome::SwappedIn,
                Err(err) => {
                    frames.abort_fault(space, vpn, Some(ppn));
                    return Err(err);
                }
            },
            PageSource::Fresh => populate_fresh(self.ctx, self.space, vpn, ppn),
        };

        let dirty = outcome.installs_dirty(self.space.is_read_only(vpn));
        if let Some(slot) = frames.install(space, vpn, ppn, dirty)? {
            self.ctx.swap().free_slot(slot);
        }
        Ok(outcome)
    }
}

/// Fill frame `ppn` with the first copy of `vpn`
pub(crate) fn populate_fresh(
    ctx: &KernelMemoryContext,
    space: &AddressSpace,
    vpn: Vpn,
    ppn: Ppn,
) -> FaultOutcome {
    match space.origin(vpn) {
        Some(PageOrigin::Section { .. }) => {
            ctx.memory()
                .with_frame(ppn, |frame| space.load_section_page(vpn, frame));
            FaultOutcome::SectionLoaded
        }
        _ => {
            ctx.memory().zero(ppn);
            FaultOutcome::ZeroFilled
        }
    }
}

/// Dirty bit a freshly populated page is mapped with
pub(crate) fn fresh_dirty(space: &AddressSpace, vpn: Vpn, outcome: FaultOutcome) -> bool {
    outcome.installs_dirty(space.is_read_only(vpn))
}
