//! demand_pager - Demand-paging virtual memory for a teaching kernel
//!
//! Multiplexes a small physical memory across processes. Each process gets
//! a flat translation table; pages are loaded on first touch from the
//! executable image, zero-filled, or read back from swap. When memory runs
//! out a clock (second-chance) scan picks a victim, skipping frames pinned
//! by in-progress copies.
//!
//! ```no_run
//! use std::sync::Arc;
//! use demand_pager::{KernelMemoryContext, MemoryImage, PagedProcess, ProcessMemory, VmConfig};
//!
//! let ctx = Arc::new(KernelMemoryContext::new(VmConfig::new())?);
//! let image = MemoryImage::new(ctx.page_size()).with_section(".text", true, b"\x90\x90");
//! let mut process = PagedProcess::new(Arc::clone(&ctx), Arc::new(image))?;
//! process.load_sections()?;
//!
//! let argv = process.address_space().layout().argv_vpn;
//! let vaddr = process.address_space().vaddr_of(argv);
//! process.accessor().write(vaddr, b"init\0");
//! # Ok::<(), demand_pager::VmError>(())
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod memory;
pub mod types;

pub mod kern;
pub mod vm;

// Re-exports
pub use config::{SwapBacking, VmConfig};
pub use error::{ImageError, StoreError, SwapOp, VmError, VmResult};
pub use kern::{
    EagerProcess, ExecutableImage, MemoryAccessor, MemoryImage, PagedProcess, ProcessMemory,
    SectionInfo,
};
pub use memory::PhysicalMemory;
pub use types::{Access, AddressSpaceId, Ppn, SwapSlot, Vpn};
pub use vm::{AddressSpace, FaultOutcome, KernelMemoryContext, PageFaultHandler, PageState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
