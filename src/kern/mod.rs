//! Kern subsystem - Kernel-side collaborators of the pager
//!
//! Contains the wait queues threads block on, the executable image
//! capability, copyin/copyout for system calls and the per-process
//! memory capability.

pub mod copyio;
pub mod loader;
pub mod sched_prim;
pub mod task;

pub use copyio::MemoryAccessor;
pub use loader::{ExecutableImage, MemoryImage, ProcessLayout, SectionInfo};
#[cfg(feature = "std")]
pub use sched_prim::ThreadParker;
pub use sched_prim::{default_parker, Parker, SpinParker, WaitQueue, WaitReason, WaitToken};
pub use task::{EagerProcess, PagedProcess, ProcessMemory};
