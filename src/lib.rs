//! Guest memory management for a DOS emulator.
//!
//! DOS keeps its allocator state inside the memory it hands out: a chain of
//! memory control blocks (MCBs), one paragraph each, in front of every block.
//! This crate implements that allocator over an emulated address space, along
//! with the pieces of the memory subsystem that sit around it:
//!
//! - [`DosMemory`](dos_memory/struct.DosMemory.html): the MCB chain allocator
//!   (int 21h AH=48h/49h/4Ah/58h), including the upper memory block chain.
//! - [`XmsManager`](xms/struct.XmsManager.html): XMS handles over a
//!   [`PageAllocator`](pages/trait.PageAllocator.html).
//! - [`A20Gate`](a20/struct.A20Gate.html): the A20 line and its XMS counters.
//! - [`MemoryManager`](manager/struct.MemoryManager.html): all of the above,
//!   together with guest RAM, set up the way DOS leaves memory at boot.
//!
//! Nothing is cached on the host side: every chain operation reads MCB headers
//! back out of guest RAM, so guest programs that edit MCBs directly are seen
//! immediately. What happens when they corrupt one is decided by the
//! [`FaultPolicy`](fault/enum.FaultPolicy.html).

pub mod a20;
pub mod chain;
pub mod config;
pub mod dos_memory;
pub mod error;
pub mod fault;
pub mod guest;
pub mod manager;
pub mod mcb;
pub mod pages;
pub mod report;
pub mod umb;
pub mod xms;

pub use a20::{A20Gate, A20Outcome};
pub use chain::{ChainSnapshot, Stats, Validity};
pub use config::{ConfigError, MemoryConfig};
pub use dos_memory::{DosMemory, FitMode, SearchOrder};
pub use error::{DosError, XmsError};
pub use fault::FaultPolicy;
pub use guest::{AddressSpace, GuestRam, RealPtr};
pub use manager::{MemoryManager, MemorySnapshot, SharedMemoryManager};
pub use mcb::{Mcb, McbInfo, McbKind};
pub use pages::{PageAllocator, PageHandle, PageMap};
pub use report::MemoryReport;
pub use xms::{HandleInfo, MoveDescriptor, XmsManager};
