//! The A20 address line.
//!
//! With A20 off, the 8086 wraps addresses above 1 MB back to 0. XMS clients
//! switch the line through local enable/disable calls, which nest through a
//! counter, or through the global calls, which are latched so that repeating
//! one is harmless.

use log::{debug, trace};

use crate::error::XmsError;

/// The address bit gated by A20.
pub const A20_BIT: u32 = 1 << 20;

/// Successful result of a local disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A20Outcome {
    /// The request took effect.
    Done,
    /// Other local enables are outstanding; the line stays on.
    StillEnabled,
}

impl A20Outcome {
    /// The XMS status byte returned to the guest in `BL`.
    pub fn code(self) -> u8 {
        match self {
            A20Outcome::Done => 0x00,
            A20Outcome::StillEnabled => 0x94,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct A20Gate {
    enabled: bool,
    local_count: u8,
    global: bool,
}

impl A20Gate {
    /// A gate with the line off, as after reset.
    pub fn new() -> Self {
        A20Gate::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn local_count(&self) -> u8 {
        self.local_count
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Switch the line directly, as a write to the fast A20 port (0x92)
    /// would. The counters are left alone.
    pub fn set_line(&mut self, enabled: bool) {
        if self.enabled != enabled {
            debug!("A20 line {}", if enabled { "on" } else { "off" });
        }
        self.enabled = enabled;
    }

    pub fn enable_local(&mut self) -> Result<A20Outcome, XmsError> {
        if self.local_count == u8::MAX {
            return Err(XmsError::A20LineError);
        }
        self.local_count += 1;
        if self.local_count == 1 {
            self.set_line(true);
        }
        trace!("A20 local enable, count {}", self.local_count);
        Ok(A20Outcome::Done)
    }

    pub fn disable_local(&mut self) -> Result<A20Outcome, XmsError> {
        if self.local_count == 0 {
            return Err(XmsError::A20LineError);
        }
        self.local_count -= 1;
        trace!("A20 local disable, count {}", self.local_count);
        if self.local_count == 0 {
            self.set_line(false);
            Ok(A20Outcome::Done)
        } else {
            Ok(A20Outcome::StillEnabled)
        }
    }

    pub fn enable_global(&mut self) -> Result<A20Outcome, XmsError> {
        if self.global {
            return Ok(A20Outcome::Done);
        }
        let outcome = self.enable_local()?;
        self.global = true;
        Ok(outcome)
    }

    pub fn disable_global(&mut self) -> Result<A20Outcome, XmsError> {
        if !self.global {
            return Ok(A20Outcome::Done);
        }
        let outcome = self.disable_local()?;
        self.global = false;
        Ok(outcome)
    }

    /// The address the bus actually sees.
    pub fn mask(&self, addr: u32) -> u32 {
        if self.enabled {
            addr
        } else {
            addr & !A20_BIT
        }
    }
}
