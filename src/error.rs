//! Error types for DOS memory and XMS services.
//!
//! Each error knows the byte the guest sees for it (`AX` for DOS calls, `BL`
//! for the XMS driver), so the kernel layer can report failures through the
//! usual channels without translating them itself.

use thiserror::Error;

/// Failures of the DOS memory calls (int 21h, AH=48h..4Ah, 58h).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DosError {
    /// Not enough memory; `largest` is the biggest block (in paragraphs)
    /// that could have been satisfied.
    #[error("insufficient memory, largest available block is {largest:#06x} paragraphs")]
    InsufficientMemory { largest: u16 },

    #[error("memory control blocks destroyed")]
    McbDestroyed,

    #[error("invalid memory block address")]
    MbAddressInvalid,

    #[error("invalid value {0:#04x}")]
    InvalidValue(u16),
}

impl DosError {
    /// The DOS error code returned to the guest.
    pub fn code(&self) -> u16 {
        match self {
            DosError::InvalidValue(_) => 0x01,
            DosError::McbDestroyed => 0x07,
            DosError::InsufficientMemory { .. } => 0x08,
            DosError::MbAddressInvalid => 0x09,
        }
    }
}

/// Failures of the XMS driver entry point.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmsError {
    #[error("function not implemented")]
    NotImplemented,

    #[error("A20 line error")]
    A20LineError,

    #[error("all extended memory is allocated")]
    OutOfSpace,

    #[error("all XMS handles are in use")]
    OutOfHandles,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid source handle")]
    InvalidSrcHandle,

    #[error("invalid source offset")]
    InvalidSrcOffset,

    #[error("invalid destination handle")]
    InvalidDestHandle,

    #[error("invalid destination offset")]
    InvalidDestOffset,

    #[error("invalid length")]
    InvalidLength,

    #[error("parity error: move length must be even")]
    ParityError,

    #[error("block is not locked")]
    BlockNotLocked,

    #[error("block is locked")]
    BlockLocked,

    #[error("lock count overflow")]
    LockCountOverflow,

    #[error("only a smaller UMB is available ({largest:#06x} paragraphs)")]
    UmbOnlySmallerBlock { largest: u16 },

    #[error("no UMBs are available")]
    UmbNoBlocksAvailable,
}

impl XmsError {
    /// The XMS error code returned to the guest in `BL`.
    pub fn code(&self) -> u8 {
        match self {
            XmsError::NotImplemented => 0x80,
            XmsError::A20LineError => 0x82,
            XmsError::OutOfSpace => 0xa0,
            XmsError::OutOfHandles => 0xa1,
            XmsError::InvalidHandle => 0xa2,
            XmsError::InvalidSrcHandle => 0xa3,
            XmsError::InvalidSrcOffset => 0xa4,
            XmsError::InvalidDestHandle => 0xa5,
            XmsError::InvalidDestOffset => 0xa6,
            XmsError::InvalidLength => 0xa7,
            XmsError::ParityError => 0xa9,
            XmsError::BlockNotLocked => 0xaa,
            XmsError::BlockLocked => 0xab,
            XmsError::LockCountOverflow => 0xac,
            XmsError::UmbOnlySmallerBlock { .. } => 0xb0,
            XmsError::UmbNoBlocksAvailable => 0xb1,
        }
    }
}
