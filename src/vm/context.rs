//! Kernel Memory Context
//!
//! One object owns every piece of shared paging state:
//! - physical memory
//! - the frame manager
//! - swap space
//! - statistics
//!
//! It is created once at kernel start and shared by reference (or `Arc`)
//! with every process, instead of living in globals.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::config::{SwapBacking, VmConfig};
use crate::error::{VmError, VmResult};
use crate::kern::loader::ExecutableImage;
use crate::kern::sched_prim::{default_parker, Parker};
use crate::memory::PhysicalMemory;
use crate::types::{AddressSpaceId, Ppn};
use crate::vm::vm_fault::{FaultStats, PageFaultHandler};
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_page::{FrameCensus, InvariantViolation, PhysicalMemoryManager};
use crate::vm::vm_pageout::{self, PageoutStats};
use crate::vm::vm_swap::{MemorySwapStore, SwapSpace, SwapStore};

/// All shared paging state of one kernel
pub struct KernelMemoryContext {
    config: VmConfig,
    memory: PhysicalMemory,
    frames: PhysicalMemoryManager,
    swap: SwapSpace,
    pageout_stats: PageoutStats,
    fault_stats: FaultStats,
}

impl KernelMemoryContext {
    /// Bring up paging as described by `config`
    pub fn new(config: VmConfig) -> VmResult<Self> {
        config.validate()?;
        let store = open_store(&config.swap)?;
        Self::with_store(config, store, default_parker())
    }

    /// Bring up paging over a caller-supplied store and parker
    pub fn with_store(
        config: VmConfig,
        store: Box<dyn SwapStore>,
        parker: Arc<dyn Parker>,
    ) -> VmResult<Self> {
        config.validate()?;
        log::info!(
            "paging up: {} frames of {} bytes, {} stack pages",
            config.phys_pages,
            config.page_size,
            config.stack_pages
        );
        Ok(Self {
            memory: PhysicalMemory::new(config.page_size, config.phys_pages),
            frames: PhysicalMemoryManager::new(config.phys_pages, parker),
            swap: SwapSpace::new(config.page_size, store),
            pageout_stats: PageoutStats::new(),
            fault_stats: FaultStats::new(),
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.config.phys_pages
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn frames(&self) -> &PhysicalMemoryManager {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn pageout_stats(&self) -> &PageoutStats {
        &self.pageout_stats
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }

    /// Get a frame reserved for the caller, evicting if none are free
    ///
    /// Blocks while every frame is pinned. The frame stays pinned until
    /// it is installed or passed to `release_frame`.
    pub fn allocate(&self) -> VmResult<Ppn> {
        vm_pageout::reclaim(self)
    }

    /// Return a frame obtained from `allocate`
    pub fn release_frame(&self, ppn: Ppn) {
        self.frames.release(ppn);
    }

    pub fn pin(&self, ppn: Ppn) {
        self.frames.pin(ppn);
    }

    pub fn unpin(&self, ppn: Ppn) {
        self.frames.unpin(ppn);
    }

    /// Lay out an address space for `image` with the configured stack
    pub fn create_address_space(&self, image: Arc<dyn ExecutableImage>) -> VmResult<AddressSpace> {
        Ok(AddressSpace::new(
            image,
            self.config.stack_pages,
            self.config.page_size,
        )?)
    }

    /// Fault handler for `space`
    pub fn fault_handler<'a>(&'a self, space: &'a AddressSpace) -> PageFaultHandler<'a> {
        PageFaultHandler::new(self, space)
    }

    /// Drop an address space's table, freeing its frames and swap slots
    ///
    /// Returns false if it was not registered.
    pub fn release_address_space(&self, space: AddressSpaceId) -> bool {
        match self.frames.unregister(space) {
            Some(slots) => {
                for slot in slots {
                    self.swap.free_slot(slot);
                }
                true
            }
            None => false,
        }
    }

    /// Check the frame accounting invariants
    pub fn audit(&self) -> Result<FrameCensus, InvariantViolation> {
        self.frames.audit()
    }

    /// Tear down the swap store
    pub fn shutdown(&self) -> VmResult<()> {
        log::info!(
            "paging down: {} swap slots minted",
            self.swap.slots_minted()
        );
        self.swap.destroy().map_err(VmError::SwapUnavailable)
    }
}

impl core::fmt::Debug for KernelMemoryContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelMemoryContext")
            .field("config", &self.config)
            .field("frames", &self.frames)
            .field("swap", &self.swap)
            .finish()
    }
}

fn open_store(backing: &SwapBacking) -> VmResult<Box<dyn SwapStore>> {
    match backing {
        SwapBacking::Memory => Ok(Box::new(MemorySwapStore::new())),
        #[cfg(feature = "std")]
        SwapBacking::File(path) => {
            let store = crate::vm::vm_swap::FileSwapStore::create(path.as_str())
                .map_err(VmError::SwapUnavailable)?;
            Ok(Box::new(store))
        }
        #[cfg(not(feature = "std"))]
        SwapBacking::File(_) => Err(crate::config::ConfigError::Invalid(
            "file-backed swap needs the std feature",
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::loader::MemoryImage;

    fn context(frames: usize) -> KernelMemoryContext {
        KernelMemoryContext::new(VmConfig::new().with_page_size(64).with_phys_pages(frames))
            .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(matches!(
            KernelMemoryContext::new(VmConfig::new().with_phys_pages(0)),
            Err(VmError::Config(_))
        ));
    }

    #[test]
    fn test_allocate_and_release() {
        let ctx = context(2);
        let a = ctx.allocate().unwrap();
        let b = ctx.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(ctx.audit().unwrap().reserved, 2);

        ctx.release_frame(a);
        ctx.release_frame(b);
        let census = ctx.audit().unwrap();
        assert_eq!(census.free, 2);
        assert_eq!(census.total(), ctx.frame_count());
    }

    #[test]
    fn test_address_space_lifecycle() {
        let ctx = context(2);
        let image = MemoryImage::new(64).with_filled_section(".data", false, 1, 9);
        let space = ctx.create_address_space(Arc::new(image)).unwrap();
        assert_eq!(space.num_pages(), 1 + ctx.config().stack_pages + 1);

        ctx.frames().register(space.initial_page_table()).unwrap();
        let handler = ctx.fault_handler(&space);
        for vpn in 0..3 {
            handler.handle_fault(crate::types::Vpn(vpn)).unwrap();
        }
        // Three pages through two frames: one is in swap
        assert_eq!(ctx.swap().slots_in_use(), 1);

        assert!(ctx.release_address_space(space.id()));
        assert!(!ctx.release_address_space(space.id()));
        assert_eq!(ctx.swap().slots_in_use(), 0);
        assert_eq!(ctx.audit().unwrap().free, 2);
    }

    #[test]
    fn test_shutdown_closes_store() {
        let ctx = context(1);
        ctx.shutdown().unwrap();
        let slot = ctx.swap().allocate_slot();
        assert!(ctx.swap().write_slot(slot, ctx.memory(), Ppn(0)).is_err());
    }
}
