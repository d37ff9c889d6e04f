//! Demand-Paging Virtual Memory
//!
//! - pmap: per-process translation tables
//! - vm_map: address space layout and page classification
//! - vm_page: physical frame ownership, pinning and the inverted table
//! - vm_pageout: clock eviction
//! - vm_swap: swap slots and backing stores
//! - vm_fault: page fault resolution
//! - context: the object that owns all of the above

pub mod context;
pub mod pmap;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_page;
pub mod vm_pageout;
pub mod vm_swap;

pub use context::KernelMemoryContext;
pub use pmap::{PageState, PageTable, TranslationEntry};
pub use vm_fault::{FaultOutcome, FaultStats, PageFaultHandler};
pub use vm_map::{AddressSpace, PageOrigin};
pub use vm_page::{FrameCensus, FrameEntry, FrameOwner, InvariantViolation, PhysicalMemoryManager};
pub use vm_pageout::PageoutStats;
#[cfg(feature = "std")]
pub use vm_swap::FileSwapStore;
pub use vm_swap::{MemorySwapStore, SwapSpace, SwapStore};
