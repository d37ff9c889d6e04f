//! Common types used across the paging subsystem
//!
//! Page numbers, swap slots and address spaces are all small integer
//! handles. Tables index each other through these handles instead of
//! holding references, so the frame -> address space -> entry -> frame
//! cycle never turns into an ownership cycle.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Virtual page number within one address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vpn(pub u32);

impl Vpn {
    /// Index into a flat page table
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Vpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical page number (frame index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ppn(pub u32);

impl Ppn {
    /// Index into the inverted page table
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot number in the swap store
///
/// Slot `k` occupies bytes `k * page_size .. (k + 1) * page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

impl SwapSlot {
    /// Byte offset of this slot in the store
    pub const fn offset(self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(pub u32);

impl AddressSpaceId {
    /// Create a new address space ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        AddressSpaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Direction of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Kernel reads user memory
    Read,
    /// Kernel writes user memory
    Write,
}
