//! Task Memory - Per-Process Paging Capability
//!
//! A process sees memory management through one interface,
//! `ProcessMemory`. Two implementations exist:
//! - `PagedProcess`: demand paging. Loading only registers an all-invalid
//!   translation table; pages arrive on first touch and may be evicted.
//! - `EagerProcess`: no paging. Loading takes a frame for every page up
//!   front and wires them, so faults never happen on a loaded process.
//!
//! Either way the table is released exactly once, by `unload_sections`
//! or on drop.

use alloc::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::kern::copyio::MemoryAccessor;
use crate::kern::loader::ExecutableImage;
use crate::types::{Ppn, Vpn};
use crate::vm::context::KernelMemoryContext;
use crate::vm::vm_fault::{self, FaultOutcome};
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_page::{FaultClaim, PageSource};

/// Frames a demand-paged process needs to make progress
pub const MIN_WORKING_SET: usize = 1;

// ============================================================================
// Process Memory Capability
// ============================================================================

/// Memory operations the process layer relies on
pub trait ProcessMemory {
    /// Shared paging state
    fn context(&self) -> &KernelMemoryContext;

    /// This process's address space
    fn address_space(&self) -> &AddressSpace;

    /// Set up the translation table at process start
    ///
    /// Fails with `ResourceExhausted` if the machine cannot hold the
    /// process's static footprint; nothing stays mapped in that case.
    fn load_sections(&mut self) -> VmResult<()>;

    /// Release every frame and swap slot the process holds
    fn unload_sections(&mut self);

    /// Make `vpn` resident
    fn handle_fault(&self, vpn: Vpn) -> VmResult<FaultOutcome>;

    /// Make the page holding `vaddr` resident
    fn handle_fault_at(&self, vaddr: usize) -> VmResult<FaultOutcome> {
        match self.address_space().page_of(vaddr) {
            Some(vpn) => self.handle_fault(vpn),
            None => Err(VmError::InvalidAddress { vaddr }),
        }
    }

    /// Copy from process memory; returns bytes transferred
    fn read_virtual_memory(&self, vaddr: usize, data: &mut [u8], offset: usize, length: usize) -> usize {
        MemoryAccessor::new(self.context(), self.address_space())
            .read_virtual_memory(vaddr, data, offset, length)
    }

    /// Copy into process memory; returns bytes transferred
    fn write_virtual_memory(&self, vaddr: usize, data: &[u8], offset: usize, length: usize) -> usize {
        MemoryAccessor::new(self.context(), self.address_space())
            .write_virtual_memory(vaddr, data, offset, length)
    }

    /// Accessor for whole-slice and string transfers
    fn accessor(&self) -> MemoryAccessor<'_> {
        MemoryAccessor::new(self.context(), self.address_space())
    }
}

// ============================================================================
// Demand-Paged Process
// ============================================================================

/// Process whose pages are loaded on demand
pub struct PagedProcess {
    ctx: Arc<KernelMemoryContext>,
    space: AddressSpace,
    loaded: bool,
}

impl PagedProcess {
    /// Lay out a process for `image`; nothing is loaded yet
    pub fn new(ctx: Arc<KernelMemoryContext>, image: Arc<dyn ExecutableImage>) -> VmResult<Self> {
        let space = ctx.create_address_space(image)?;
        Ok(Self {
            ctx,
            space,
            loaded: false,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

impl ProcessMemory for PagedProcess {
    fn context(&self) -> &KernelMemoryContext {
        &self.ctx
    }

    fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    fn load_sections(&mut self) -> VmResult<()> {
        if self.loaded {
            return Err(VmError::AlreadyLoaded(self.space.id()));
        }

        let frames = self.ctx.frames();
        let available = frames.frame_count() - frames.wired_count();
        if available < MIN_WORKING_SET {
            log::warn!(
                "{}: no pageable frames ({} wired)",
                self.space.id(),
                frames.wired_count()
            );
            return Err(VmError::ResourceExhausted {
                needed: MIN_WORKING_SET,
                available,
            });
        }

        frames.register(self.space.initial_page_table())?;
        self.loaded = true;
        log::info!(
            "{}: loaded {} pages ({} from sections), demand paged",
            self.space.id(),
            self.space.num_pages(),
            self.space.layout().section_pages
        );
        Ok(())
    }

    fn unload_sections(&mut self) {
        if !self.loaded {
            return;
        }
        self.loaded = false;
        self.ctx.release_address_space(self.space.id());
        log::info!("{}: unloaded", self.space.id());
    }

    fn handle_fault(&self, vpn: Vpn) -> VmResult<FaultOutcome> {
        self.ctx.fault_handler(&self.space).handle_fault(vpn)
    }
}

impl Drop for PagedProcess {
    fn drop(&mut self) {
        self.unload_sections();
    }
}

// ============================================================================
// Eager (Non-Paging) Process
// ============================================================================

/// Process whose pages are all resident and wired from load to exit
pub struct EagerProcess {
    ctx: Arc<KernelMemoryContext>,
    space: AddressSpace,
    loaded: bool,
}

impl EagerProcess {
    pub fn new(ctx: Arc<KernelMemoryContext>, image: Arc<dyn ExecutableImage>) -> VmResult<Self> {
        let space = ctx.create_address_space(image)?;
        Ok(Self {
            ctx,
            space,
            loaded: false,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Claim, fill and wire every page of the registered table
    ///
    /// On failure the table is dropped and every frame in `taken` is back
    /// on the free list.
    fn wire_pages(&self, taken: Vec<Ppn>) -> VmResult<()> {
        let frames = self.ctx.frames();
        let id = self.space.id();

        // Claim every page so concurrent faults wait for the load
        let claimed = (0..taken.len()).try_for_each(|vpn| {
            match frames.begin_fault(id, Vpn(vpn as u32))? {
                FaultClaim::Claimed(PageSource::Fresh) => Ok(()),
                _ => Err(VmError::AlreadyLoaded(id)),
            }
        });
        if let Err(err) = claimed {
            self.ctx.release_address_space(id);
            for ppn in taken {
                frames.release(ppn);
            }
            return Err(err);
        }

        for (index, &ppn) in taken.iter().enumerate() {
            // A failed install has already released `ppn`
            if let Err(err) = self.populate(Vpn(index as u32), ppn) {
                self.ctx.release_address_space(id);
                for &rest in &taken[index + 1..] {
                    frames.release(rest);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn populate(&self, vpn: Vpn, ppn: Ppn) -> VmResult<()> {
        let outcome = vm_fault::populate_fresh(&self.ctx, &self.space, vpn, ppn);
        let dirty = vm_fault::fresh_dirty(&self.space, vpn, outcome);
        self.ctx
            .frames()
            .install_wired(self.space.id(), vpn, ppn, dirty)
    }
}

impl ProcessMemory for EagerProcess {
    fn context(&self) -> &KernelMemoryContext {
        &self.ctx
    }

    fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    fn load_sections(&mut self) -> VmResult<()> {
        if self.loaded {
            return Err(VmError::AlreadyLoaded(self.space.id()));
        }

        let needed = self.space.num_pages();
        let frames = self.ctx.frames();
        let taken = frames.take_free_many(needed).map_err(|available| {
            log::warn!(
                "{}: needs {} frames, {} free",
                self.space.id(),
                needed,
                available
            );
            VmError::ResourceExhausted { needed, available }
        })?;

        if let Err(err) = frames.register(self.space.initial_page_table()) {
            for ppn in taken {
                frames.release(ppn);
            }
            return Err(err);
        }

        if let Err(err) = self.wire_pages(taken) {
            log::warn!("{}: eager load failed: {}", self.space.id(), err);
            return Err(err);
        }

        self.loaded = true;
        log::info!(
            "{}: loaded {} pages, wired",
            self.space.id(),
            needed
        );
        Ok(())
    }

    fn unload_sections(&mut self) {
        if !self.loaded {
            return;
        }
        self.loaded = false;
        self.ctx.release_address_space(self.space.id());
        log::info!("{}: unloaded", self.space.id());
    }

    fn handle_fault(&self, vpn: Vpn) -> VmResult<FaultOutcome> {
        if vpn.index() >= self.space.num_pages() {
            return Err(VmError::InvalidAddress {
                vaddr: self.space.vaddr_of(vpn),
            });
        }
        match self.ctx.frames().translation(self.space.id(), vpn) {
            Some(entry) if entry.valid => Ok(FaultOutcome::AlreadyResident),
            Some(_) => self.ctx.fault_handler(&self.space).handle_fault(vpn),
            None => Err(VmError::UnknownAddressSpace(self.space.id())),
        }
    }
}

impl Drop for EagerProcess {
    fn drop(&mut self) {
        self.unload_sections();
    }
}
