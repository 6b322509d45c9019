//! Machine memory settings.

use thiserror::Error;

use crate::fault::FaultPolicy;
use crate::guest::PARAGRAPH;
use crate::xms::XMS_HANDLES;

/// Conventional memory ends at 640 KB, where video memory starts.
pub const MAX_CONVENTIONAL_KB: u32 = 640;
/// DOS needs room for itself and a command interpreter.
pub const MIN_CONVENTIONAL_KB: u32 = 64;
/// The largest RAM size the page tables can describe.
pub const MAX_RAM_BYTES: u32 = 0xc000_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0}K of conventional memory is out of range ({}K..={}K)", MIN_CONVENTIONAL_KB, MAX_CONVENTIONAL_KB)]
    Conventional(u32),

    #[error("{0:#x} bytes of RAM do not cover {1}K of conventional memory")]
    RamTooSmall(u32, u32),

    #[error("{0:#x} bytes of RAM is more than the {:#x} supported", MAX_RAM_BYTES)]
    RamTooLarge(u32),

    #[error("an XMS handle table needs at least 2 entries, not {0}")]
    Handles(usize),
}

/// How the emulated machine's memory is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Conventional memory handed to DOS, in kilobytes.
    pub conventional_kb: u32,
    /// Total guest RAM in bytes.
    pub ram_bytes: u32,
    pub umb: bool,
    /// EMS claims half of the upper memory area for its page frame.
    pub ems: bool,
    pub xms: bool,
    pub fault_policy: FaultPolicy,
    /// XMS handles, the unusable handle 0 included.
    pub xms_handles: usize,
    /// Clear DOS blocks as they are allocated.
    pub zero_dos_allocations: bool,
    /// Clear XMS blocks as they are allocated.
    pub zero_xms_allocations: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            conventional_kb: MAX_CONVENTIONAL_KB,
            ram_bytes: 16 * 1024 * 1024,
            umb: true,
            ems: false,
            xms: true,
            fault_policy: FaultPolicy::default(),
            xms_handles: XMS_HANDLES,
            zero_dos_allocations: false,
            zero_xms_allocations: false,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conventional_kb < MIN_CONVENTIONAL_KB || self.conventional_kb > MAX_CONVENTIONAL_KB {
            return Err(ConfigError::Conventional(self.conventional_kb));
        }
        if self.ram_bytes > MAX_RAM_BYTES {
            return Err(ConfigError::RamTooLarge(self.ram_bytes));
        }
        if self.ram_bytes < self.conventional_kb * 1024 {
            return Err(ConfigError::RamTooSmall(self.ram_bytes, self.conventional_kb));
        }
        if self.xms && self.xms_handles < 2 {
            return Err(ConfigError::Handles(self.xms_handles));
        }
        Ok(())
    }

    /// The segment where conventional memory ends.
    pub fn conventional_top(&self) -> u16 {
        (self.conventional_kb * 1024 / PARAGRAPH) as u16
    }
}
