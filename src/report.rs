//! A summary of memory use, in the shape of the DOS `MEM` command.

use core::fmt;

use crate::a20::A20Gate;
use crate::chain::ChainSnapshot;
use crate::dos_memory::DosMemory;
use crate::guest::{AddressSpace, PARAGRAPH};
use crate::pages::{PageAllocator, PAGE_SIZE};
use crate::xms::XmsManager;

/// Totals for one MCB chain, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AreaUsage {
    pub total: u32,
    pub free: u32,
    pub largest_free: u32,
    pub blocks: usize,
    /// Whether the chain was well formed when the report was taken.
    pub valid: bool,
}

impl AreaUsage {
    pub fn from_snapshot(snapshot: &ChainSnapshot) -> Self {
        let (validity, stats) = snapshot.stats();
        AreaUsage {
            total: stats.span * PARAGRAPH,
            free: stats.free * PARAGRAPH,
            largest_free: stats.largest_free as u32 * PARAGRAPH,
            blocks: stats.length,
            valid: validity.is_valid(),
        }
    }

    pub fn used(&self) -> u32 {
        self.total - self.free
    }
}

/// Extended memory totals, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmsUsage {
    pub total: u32,
    pub free: u32,
    pub largest_free: u32,
    pub handles_used: usize,
    /// Handles a client can get, handle 0 not included.
    pub handles_total: usize,
}

impl XmsUsage {
    pub fn used(&self) -> u32 {
        self.total - self.free
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryReport {
    pub conventional: AreaUsage,
    pub upper: Option<AreaUsage>,
    pub xms: Option<XmsUsage>,
    pub umb_linked: bool,
    pub a20_enabled: bool,
}

impl MemoryReport {
    pub fn gather<M: AddressSpace, P: PageAllocator>(
        mem: &M,
        dos: &DosMemory,
        xms: Option<&XmsManager<P>>,
        a20: &A20Gate,
    ) -> Self {
        let conventional = AreaUsage::from_snapshot(&dos.conventional_snapshot(mem));
        let upper = dos
            .umb_region(mem)
            .map(|region| {
                AreaUsage::from_snapshot(&ChainSnapshot::capture_region(
                    mem,
                    region.base,
                    None,
                    region.end(),
                ))
            });
        let xms = xms.map(|xms| {
            let pages = xms.pages();
            XmsUsage {
                total: pages.capacity() * PAGE_SIZE,
                free: pages.free_total() * PAGE_SIZE,
                largest_free: pages.free_largest() * PAGE_SIZE,
                handles_used: xms.allocated().count(),
                handles_total: xms.handle_count() - 1,
            }
        });
        MemoryReport {
            conventional,
            upper,
            xms,
            umb_linked: dos.umb_linked(mem),
            a20_enabled: a20.is_enabled(),
        }
    }
}

fn kb(bytes: u32) -> String {
    format!("{}K", bytes / 1024)
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<18}{:>10}{:>10}{:>10}", "Memory Type", "Total", "Used", "Free")?;
        writeln!(f, "{:<18}{:>10}{:>10}{:>10}", "----------------", "-----", "----", "----")?;
        let c = &self.conventional;
        writeln!(f, "{:<18}{:>10}{:>10}{:>10}", "Conventional", kb(c.total), kb(c.used()), kb(c.free))?;
        if let Some(u) = &self.upper {
            writeln!(f, "{:<18}{:>10}{:>10}{:>10}", "Upper", kb(u.total), kb(u.used()), kb(u.free))?;
        }
        if let Some(x) = &self.xms {
            writeln!(f, "{:<18}{:>10}{:>10}{:>10}", "Extended (XMS)", kb(x.total), kb(x.used()), kb(x.free))?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "Largest executable program size {:>8} ({} bytes)",
            kb(c.largest_free),
            c.largest_free
        )?;
        if let Some(u) = &self.upper {
            writeln!(
                f,
                "Largest free upper memory block {:>8} ({} bytes){}",
                kb(u.largest_free),
                u.largest_free,
                if self.umb_linked { ", linked" } else { "" }
            )?;
        }
        if let Some(x) = &self.xms {
            writeln!(f, "XMS handles in use: {} of {}", x.handles_used, x.handles_total)?;
        }
        if !c.valid || self.upper.map_or(false, |u| !u.valid) {
            writeln!(f, "Memory control blocks damaged")?;
        }
        write!(f, "A20 line is {}", if self.a20_enabled { "enabled" } else { "disabled" })
    }
}
