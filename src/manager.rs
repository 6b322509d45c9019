//! The memory subsystem of one emulated machine.
//!
//! [`MemoryManager`](struct.MemoryManager.html) owns guest RAM together with
//! everything allocating from it: the DOS MCB chains, the XMS handle table and
//! the A20 gate. Creating one boots memory into the state DOS leaves it in;
//! [`reset`](struct.MemoryManager.html#method.reset) does so again, and
//! dropping it tears everything down.
//!
//! [`SharedMemoryManager`](struct.SharedMemoryManager.html) wraps a manager in
//! a spin lock, for debuggers and other threads that want to look at memory
//! while the emulator runs.

use log::{debug, info};
use spin::Mutex;

use crate::a20::A20Gate;
use crate::config::{ConfigError, MemoryConfig};
use crate::dos_memory::{DosMemory, DOS_INFOBLOCK_SEG, NO_UMB_CHAIN};
use crate::error::{DosError, XmsError};
use crate::guest::{AddressSpace, GuestRam};
use crate::pages::{PageMap, PageAllocator, PAGE_SIZE, XMS_START_PAGE};
use crate::report::MemoryReport;
use crate::xms::{MoveDescriptor, XmsManager};

/// Strategy used for XMS UMB requests: upper memory only, first fit.
const UMB_ONLY_STRATEGY: u8 = 0x40;

#[derive(Debug)]
pub struct MemoryManager<M = GuestRam, P = PageMap> {
    config: MemoryConfig,
    ram: M,
    dos: DosMemory,
    xms: Option<XmsManager<P>>,
    a20: A20Gate,
}

/// A copy of a whole [`MemoryManager`](struct.MemoryManager.html), for save
/// states.
#[derive(Debug, Clone)]
pub struct MemorySnapshot<M = GuestRam, P = PageMap> {
    ram: M,
    dos: DosMemory,
    xms: Option<XmsManager<P>>,
    a20: A20Gate,
}

impl MemoryManager<GuestRam, PageMap> {
    /// Allocate guest RAM as configured and boot it.
    pub fn new(config: MemoryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ram = GuestRam::new(config.ram_bytes);
        let pages = PageMap::new(config.ram_bytes / PAGE_SIZE, XMS_START_PAGE);
        Self::with_parts(config, ram, pages)
    }
}

impl<M: AddressSpace, P: PageAllocator> MemoryManager<M, P> {
    /// Boot memory on top of the given RAM and page allocator.
    pub fn with_parts(config: MemoryConfig, ram: M, pages: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let xms = if config.xms {
            Some(XmsManager::new(pages, config.xms_handles))
        } else {
            None
        };
        let mut manager = MemoryManager {
            dos: DosMemory::new(DOS_INFOBLOCK_SEG, config.fault_policy),
            config,
            ram,
            xms,
            a20: A20Gate::new(),
        };
        manager.boot()?;
        Ok(manager)
    }

    fn boot(&mut self) -> Result<(), ConfigError> {
        let config = &self.config;
        self.dos = DosMemory::new(DOS_INFOBLOCK_SEG, config.fault_policy);
        self.dos.set_zero_on_allocate(config.zero_dos_allocations);
        self.dos
            .setup(&mut self.ram, config.conventional_top())
            .map_err(|_| ConfigError::Conventional(config.conventional_kb))?;
        self.dos.build_umb_chain(&mut self.ram, config.umb, config.ems);
        if let Some(xms) = &mut self.xms {
            xms.set_zero_on_allocate(config.zero_xms_allocations);
        }
        self.a20 = A20Gate::new();
        info!(
            "Memory ready: {}K conventional, {:#x} bytes RAM, UMB {}, XMS {}",
            config.conventional_kb,
            self.ram.size(),
            if self.dos.umb_region(&self.ram).is_some() { "on" } else { "off" },
            if self.xms.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    /// Return to the state right after boot: every DOS block and XMS handle
    /// is released and the A20 line is off.
    pub fn reset(&mut self) -> Result<(), ConfigError> {
        if let Some(xms) = &mut self.xms {
            xms.reset();
        }
        self.boot()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn ram(&self) -> &M {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut M {
        &mut self.ram
    }

    pub fn dos(&self) -> &DosMemory {
        &self.dos
    }

    pub fn xms(&self) -> Option<&XmsManager<P>> {
        self.xms.as_ref()
    }

    pub fn a20(&self) -> &A20Gate {
        &self.a20
    }

    pub fn a20_mut(&mut self) -> &mut A20Gate {
        &mut self.a20
    }

    ////////////////////////////////////////////////////////////
    // DOS services

    pub fn allocate(&mut self, owner: u16, paragraphs: u16) -> Result<u16, DosError> {
        self.dos.allocate(&mut self.ram, owner, paragraphs)
    }

    pub fn resize(&mut self, segment: u16, paragraphs: u16) -> Result<(), DosError> {
        self.dos.resize(&mut self.ram, segment, paragraphs)
    }

    pub fn free(&mut self, segment: u16) -> Result<(), DosError> {
        self.dos.free(&mut self.ram, segment)
    }

    pub fn compress(&mut self) {
        self.dos.compress(&mut self.ram)
    }

    pub fn free_process_memory(&mut self, owner: u16) {
        self.dos.free_process_memory(&mut self.ram, owner)
    }

    pub fn strategy(&self) -> u8 {
        self.dos.strategy()
    }

    pub fn set_strategy(&mut self, strategy: u8) -> Result<(), DosError> {
        self.dos.set_strategy(strategy)
    }

    pub fn link_umb(&mut self, link: bool) -> bool {
        self.dos.link_umb(&mut self.ram, link)
    }

    pub fn umb_linked(&self) -> bool {
        self.dos.umb_linked(&self.ram)
    }

    ////////////////////////////////////////////////////////////
    // XMS services

    pub fn xms_mut(&mut self) -> Result<&mut XmsManager<P>, XmsError> {
        self.xms.as_mut().ok_or(XmsError::NotImplemented)
    }

    pub fn xms_allocate(&mut self, size_kb: u32) -> Result<u16, XmsError> {
        let xms = self.xms.as_mut().ok_or(XmsError::NotImplemented)?;
        xms.allocate(&mut self.ram, size_kb)
    }

    pub fn xms_resize(&mut self, handle: u16, size_kb: u32) -> Result<(), XmsError> {
        let xms = self.xms.as_mut().ok_or(XmsError::NotImplemented)?;
        xms.resize(&mut self.ram, handle, size_kb)
    }

    /// Function 0Bh, with the move structure at linear `addr` in guest RAM.
    pub fn xms_move(&mut self, addr: u32) -> Result<(), XmsError> {
        let xms = self.xms.as_ref().ok_or(XmsError::NotImplemented)?;
        let desc = MoveDescriptor::read(&self.ram, addr);
        debug!("XMS move {:?}", desc);
        xms.move_memory(&mut self.ram, &mut self.a20, &desc)
    }

    /// Function 10h: allocate an upper memory block for `owner`, whatever the
    /// current strategy and link state.
    pub fn allocate_umb(&mut self, owner: u16, paragraphs: u16) -> Result<u16, XmsError> {
        if !self.config.umb {
            return Err(XmsError::NotImplemented);
        }
        if self.dos.umb_start(&self.ram) == NO_UMB_CHAIN {
            return Err(XmsError::UmbNoBlocksAvailable);
        }

        let was_linked = self.dos.umb_linked(&self.ram);
        if !was_linked {
            self.dos.link_umb(&mut self.ram, true);
        }
        let strategy = self.dos.strategy();
        self.dos.strategy = UMB_ONLY_STRATEGY;

        let result = self.dos.allocate(&mut self.ram, owner, paragraphs);

        if self.dos.umb_linked(&self.ram) != was_linked {
            self.dos.link_umb(&mut self.ram, was_linked);
        }
        self.dos.strategy = strategy;

        result.map_err(|e| match e {
            DosError::InsufficientMemory { largest } if largest > 0 => {
                XmsError::UmbOnlySmallerBlock { largest }
            }
            _ => XmsError::UmbNoBlocksAvailable,
        })
    }

    /// Function 11h.
    pub fn deallocate_umb(&mut self, segment: u16) -> Result<(), XmsError> {
        if !self.config.umb {
            return Err(XmsError::NotImplemented);
        }
        if self.dos.umb_start(&self.ram) == NO_UMB_CHAIN {
            return Err(XmsError::UmbNoBlocksAvailable);
        }
        self.dos
            .free(&mut self.ram, segment)
            .map_err(|_| XmsError::UmbNoBlocksAvailable)
    }

    ////////////////////////////////////////////////////////////
    // Introspection

    pub fn report(&self) -> MemoryReport {
        MemoryReport::gather(&self.ram, &self.dos, self.xms.as_ref(), &self.a20)
    }
}

impl<M: Clone, P: Clone> MemoryManager<M, P> {
    pub fn snapshot(&self) -> MemorySnapshot<M, P> {
        MemorySnapshot {
            ram: self.ram.clone(),
            dos: self.dos.clone(),
            xms: self.xms.clone(),
            a20: self.a20.clone(),
        }
    }

    /// Put everything back the way it was when `snapshot` was taken. The
    /// configuration is not part of a snapshot.
    pub fn restore(&mut self, snapshot: &MemorySnapshot<M, P>) {
        self.ram = snapshot.ram.clone();
        self.dos = snapshot.dos.clone();
        self.xms = snapshot.xms.clone();
        self.a20 = snapshot.a20.clone();
    }
}

/// A [`MemoryManager`](struct.MemoryManager.html) that can be shared between
/// threads.
pub struct SharedMemoryManager<M = GuestRam, P = PageMap> {
    inner: Mutex<MemoryManager<M, P>>,
}

impl<M, P> SharedMemoryManager<M, P> {
    pub fn new(manager: MemoryManager<M, P>) -> Self {
        SharedMemoryManager {
            inner: Mutex::new(manager),
        }
    }

    /// Run `f` with the manager locked.
    pub fn with<R, F: FnOnce(&mut MemoryManager<M, P>) -> R>(&self, f: F) -> R {
        let mut manager = self.inner.lock();
        f(&mut manager)
    }

    pub fn into_inner(self) -> MemoryManager<M, P> {
        self.inner.into_inner()
    }
}
