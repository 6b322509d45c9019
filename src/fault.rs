//! What to do when an MCB chain walk finds a header that is neither `'M'`
//! nor `'Z'`.
//!
//! Guest programs can and do overwrite MCBs. The configured
//! [`FaultPolicy`](enum.FaultPolicy.html) decides whether that kills the
//! emulator, gets fixed up, gets logged, or is ignored; the
//! [`FaultTracker`](struct.FaultTracker.html) applies it and bounds the
//! number of faults a single walk will put up with.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

use crate::chain::ChainSnapshot;
use crate::guest::AddressSpace;
use crate::mcb::{Mcb, McbKind};

/// A walk gives up after this many faults.
pub const FAULT_CEILING: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Abort the emulator: the chain cannot be trusted any more.
    Deny,
    /// Rewrite the kind byte to what the walk expected, and log it.
    Repair,
    /// Log the fault and carry on with the block as it is.
    Report,
    /// Carry on silently.
    Allow,
}

/// The action a policy takes for a single corrupt header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Abort,
    Rewrite,
    Log,
    Ignore,
}

impl FaultPolicy {
    pub fn action(self) -> FaultAction {
        match self {
            FaultPolicy::Deny => FaultAction::Abort,
            FaultPolicy::Repair => FaultAction::Rewrite,
            FaultPolicy::Report => FaultAction::Log,
            FaultPolicy::Allow => FaultAction::Ignore,
        }
    }
}

impl Default for FaultPolicy {
    fn default() -> Self {
        FaultPolicy::Report
    }
}

impl fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultPolicy::Deny => "deny",
            FaultPolicy::Repair => "repair",
            FaultPolicy::Report => "report",
            FaultPolicy::Allow => "allow",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown MCB fault policy {0:?} (expected deny, repair, report or allow)")]
pub struct UnknownPolicy(pub String);

impl FromStr for FaultPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(FaultPolicy::Deny),
            "repair" => Ok(FaultPolicy::Repair),
            "report" => Ok(FaultPolicy::Report),
            "allow" => Ok(FaultPolicy::Allow),
            _ => Err(UnknownPolicy(s.to_owned())),
        }
    }
}

/// A chain walk stopped before reaching the last block.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("MCB chain walk aborted at segment {segment:#06x} after {faults} faults")]
pub struct WalkAborted {
    pub segment: u16,
    pub faults: u32,
}

/// Applies a [`FaultPolicy`](enum.FaultPolicy.html) over the course of one
/// walk.
#[derive(Debug, Clone)]
pub struct FaultTracker {
    policy: FaultPolicy,
    faults: u32,
    // Where to start the dump when the policy is Deny
    head: u16,
}

impl FaultTracker {
    pub fn new(policy: FaultPolicy, head: u16) -> Self {
        FaultTracker {
            policy,
            faults: 0,
            head,
        }
    }

    pub fn faults(&self) -> u32 {
        self.faults
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Check the kind byte of `mcb`, where the walk expected `expected`.
    ///
    /// Returns the kind the walk should continue with: the repaired kind under
    /// `Repair`, the corrupt kind otherwise.
    pub fn inspect<M: AddressSpace>(
        &mut self,
        mem: &mut M,
        mcb: Mcb,
        expected: McbKind,
    ) -> Result<McbKind, WalkAborted> {
        let kind = mcb.kind(mem);
        if kind.is_valid() {
            return Ok(kind);
        }

        self.count(mcb.segment())?;
        match self.policy.action() {
            FaultAction::Abort => self.abort(mem, mcb.segment(), "corrupt MCB type"),
            FaultAction::Rewrite => {
                log::warn!(
                    "Repairing MCB at {:#06x}: type {:#04x} -> {:#04x}",
                    mcb.segment(),
                    kind.byte(),
                    expected.byte()
                );
                mcb.set_kind(mem, expected);
                Ok(expected)
            }
            FaultAction::Log => {
                log::warn!(
                    "Corrupt MCB at {:#06x}: type {:#04x}",
                    mcb.segment(),
                    kind.byte()
                );
                Ok(kind)
            }
            FaultAction::Ignore => Ok(kind),
        }
    }

    /// Record a structural fault (a link that wraps or does not advance).
    /// The walk cannot follow such a link, so this always ends it.
    pub fn broken_link<M: AddressSpace>(&mut self, mem: &M, segment: u16) -> WalkAborted {
        self.faults += 1;
        if self.policy == FaultPolicy::Deny {
            self.abort(mem, segment, "MCB chain link wraps around");
        }
        if self.policy != FaultPolicy::Allow {
            log::error!("MCB at {:#06x} does not link forward", segment);
        }
        WalkAborted {
            segment,
            faults: self.faults,
        }
    }

    fn count(&mut self, segment: u16) -> Result<(), WalkAborted> {
        self.faults += 1;
        if self.faults > FAULT_CEILING {
            log::error!(
                "Giving up on MCB chain at {:#06x}: more than {} faults",
                segment,
                FAULT_CEILING
            );
            return Err(WalkAborted {
                segment,
                faults: self.faults,
            });
        }
        Ok(())
    }

    fn abort<M: AddressSpace>(&self, mem: &M, segment: u16, what: &str) -> ! {
        log::error!("DOS MCB dump:\n{:#}", ChainSnapshot::capture(mem, self.head));
        panic!("DOS MCB chain corrupted: {} at segment {:#06x}", what, segment);
    }
}
