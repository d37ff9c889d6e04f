//! VM configuration
//!
//! Machine geometry (page size, frame count), the per-process stack size and
//! the choice of swap backing. Configurations can be built in code or read
//! from a TOML file (`std` only); missing keys keep their defaults:
//!
//! ```toml
//! [vm]
//! page_size = 1024
//! phys_pages = 16
//! stack_pages = 8
//! swap = { file = "vm.swap" }   # or swap = "memory"
//! ```

use alloc::string::String;

use serde::Deserialize;
use thiserror::Error;

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Default number of physical frames
pub const DEFAULT_PHYS_PAGES: usize = 16;

/// Default stack size in pages
pub const DEFAULT_STACK_PAGES: usize = 8;

/// Pages reserved at the top of every address space for program arguments
pub const ARGUMENT_PAGES: usize = 1;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 64;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(String),

    #[error("{0}")]
    Invalid(&'static str),

    #[cfg(feature = "std")]
    #[error("cannot read config file: {0}")]
    Io(std::io::ErrorKind),
}

#[cfg(feature = "std")]
impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

// ============================================================================
// Swap Backing
// ============================================================================

/// Where evicted pages are kept
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapBacking {
    /// Growable in-memory buffer
    #[default]
    Memory,
    /// Scratch file at the given path, removed at shutdown
    File(String),
}

// ============================================================================
// VM Configuration
// ============================================================================

/// VM configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Bytes per page (power of two)
    pub page_size: usize,
    /// Number of physical frames
    pub phys_pages: usize,
    /// Stack pages given to every process
    pub stack_pages: usize,
    /// Swap backing
    pub swap: SwapBacking,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            phys_pages: DEFAULT_PHYS_PAGES,
            stack_pages: DEFAULT_STACK_PAGES,
            swap: SwapBacking::Memory,
        }
    }
}

impl VmConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_phys_pages(mut self, phys_pages: usize) -> Self {
        self.phys_pages = phys_pages;
        self
    }

    pub fn with_stack_pages(mut self, stack_pages: usize) -> Self {
        self.stack_pages = stack_pages;
        self
    }

    pub fn with_swap_file(mut self, path: impl Into<String>) -> Self {
        self.swap = SwapBacking::File(path.into());
        self
    }

    pub fn with_memory_swap(mut self) -> Self {
        self.swap = SwapBacking::Memory;
        self
    }

    /// Check the configuration describes a usable machine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("page size must be a power of two"));
        }
        if self.page_size < MIN_PAGE_SIZE {
            return Err(ConfigError::Invalid("page size below minimum"));
        }
        if self.phys_pages == 0 {
            return Err(ConfigError::Invalid("at least one physical page is required"));
        }
        if u32::try_from(self.phys_pages).is_err() {
            return Err(ConfigError::Invalid("too many physical pages"));
        }
        if self.stack_pages == 0 {
            return Err(ConfigError::Invalid("at least one stack page is required"));
        }
        if let SwapBacking::File(path) = &self.swap {
            if path.is_empty() {
                return Err(ConfigError::Invalid("swap file path is empty"));
            }
        }
        Ok(())
    }

    /// Parse a TOML configuration, starting from the defaults
    #[cfg(feature = "std")]
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.vm.validate()?;
        Ok(file.vm)
    }

    /// Read and parse a configuration file
    #[cfg(feature = "std")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.kind()))?;
        Self::parse(&text)
    }
}

/// On-disk layout: everything lives under `[vm]`
#[cfg(feature = "std")]
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    vm: VmConfig,
}
