//! Unified error types for the paging subsystem using thiserror
//!
//! Only process-creation failures and backing-store failures travel up as
//! errors. Bad user addresses are reported as short transfers by the
//! copy routines, and broken internal invariants are assertions.

use core::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{AddressSpaceId, SwapSlot, Vpn};

/// Result alias for fallible VM operations
pub type VmResult<T> = Result<T, VmError>;

/// Top-level error type for VM operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("insufficient physical memory: need {needed} frames, {available} available")]
    ResourceExhausted { needed: usize, available: usize },

    #[error("virtual address {vaddr:#x} is outside the address space")]
    InvalidAddress { vaddr: usize },

    #[error("swap {op} of slot {slot} failed: {source}")]
    StorageFault {
        op: SwapOp,
        slot: SwapSlot,
        #[source]
        source: StoreError,
    },

    #[error("swap store unavailable: {0}")]
    SwapUnavailable(#[source] StoreError),

    #[error("invalid executable image: {0}")]
    InvalidImage(#[from] ImageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("address space {0} is not registered")]
    UnknownAddressSpace(AddressSpaceId),

    #[error("address space {0} is already loaded")]
    AlreadyLoaded(AddressSpaceId),
}

/// Swap I/O direction, for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOp {
    /// Slot -> frame
    Read,
    /// Frame -> slot
    Write,
}

impl fmt::Display for SwapOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapOp::Read => f.write_str("read"),
            SwapOp::Write => f.write_str("write"),
        }
    }
}

/// Backing store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("access at offset {offset} is past the end of the store")]
    OutOfRange { offset: u64 },

    #[error("store has been destroyed")]
    Closed,

    #[cfg(feature = "std")]
    #[error("i/o error: {0}")]
    Io(std::io::ErrorKind),
}

#[cfg(feature = "std")]
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.kind())
    }
}

/// Executable image layout errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("fragmented executable: section {section} starts at vpn {found}, expected {expected}")]
    Fragmented {
        section: usize,
        expected: Vpn,
        found: Vpn,
    },

    #[error("section {0} has no pages")]
    EmptySection(usize),

    #[error("section index {0} out of range")]
    NoSuchSection(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_messages() {
        let err = VmError::ResourceExhausted {
            needed: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient physical memory: need 4 frames, 1 available"
        );

        let err = VmError::StorageFault {
            op: SwapOp::Write,
            slot: SwapSlot(7),
            source: StoreError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "swap write of slot 7 failed: store has been destroyed"
        );
    }

    #[test]
    fn test_image_error_converts() {
        let err: VmError = ImageError::EmptySection(2).into();
        assert_eq!(err, VmError::InvalidImage(ImageError::EmptySection(2)));
    }
}
