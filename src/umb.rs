//! The upper memory block chain.
//!
//! Upper memory lives in its own MCB chain between the video memory and the
//! BIOS. A covering DOS block bridges the gap from the end of conventional
//! memory to the first UMB; linking the chains just turns the conventional
//! `'Z'` block into an `'M'` so that walks run on into upper memory.

use log::{debug, error, info, warn};

use crate::chain::ChainWalker;
use crate::dos_memory::{DosMemory, UmbRegion, NO_UMB_CHAIN};
use crate::guest::{segment_to_linear, AddressSpace};
use crate::mcb::{mcb_name, Mcb, McbKind, HEADER_PARAGRAPHS, OWNER_DOS, OWNER_FREE};

/// Segment of the first upper memory block.
pub const UMB_BASE: u16 = 0xd000;
/// Paragraphs of upper memory, headers included.
pub const UMB_PARAGRAPHS: u16 = 0x2000;
/// Paragraphs left when EMS claims the page frame at 0xe000.
pub const UMB_PARAGRAPHS_EMS: u16 = 0x1000;

/// UMBs need RAM up to this segment (1 MB + 64 KB).
const UMB_MIN_SEG_LIMIT: u16 = 0xffff;

impl DosMemory {
    /// Create the UMB chain, or record that there is none.
    pub fn build_umb_chain<M: AddressSpace>(&mut self, mem: &mut M, enabled: bool, ems: bool) {
        self.umb = None;
        self.sysvars.set_umb_start(mem, NO_UMB_CHAIN);
        self.sysvars.set_umb_chain_state(mem, 0);

        if !enabled {
            return;
        }
        if mem.size() < segment_to_linear(UMB_MIN_SEG_LIMIT) + 0x1000 {
            warn!("Not enough RAM for upper memory ({:#x} bytes)", mem.size());
            return;
        }

        let cover = match self.conventional_tail(mem) {
            Some(tail) => tail.next_segment(mem),
            None => {
                error!("Cannot add UMBs to a broken MCB chain");
                return;
            }
        };
        if cover >= UMB_BASE {
            error!("Conventional memory reaches {:#06x}, no room for UMBs", cover);
            return;
        }

        let paragraphs = if ems { UMB_PARAGRAPHS_EMS } else { UMB_PARAGRAPHS };
        Mcb::at(UMB_BASE).write(mem, McbKind::Last, OWNER_FREE, paragraphs - HEADER_PARAGRAPHS);

        let cover_mcb = Mcb::at(cover);
        cover_mcb.write(mem, McbKind::Middle, OWNER_DOS, UMB_BASE - cover - HEADER_PARAGRAPHS);
        cover_mcb.set_name(mem, &mcb_name("SC"));

        self.sysvars.set_umb_start(mem, cover);
        self.umb = Some(UmbRegion {
            head: cover,
            base: UMB_BASE,
            paragraphs,
        });
        info!(
            "UMB chain at {:#06x}: {:#06x} paragraphs from {:#06x}",
            cover, paragraphs, UMB_BASE
        );
    }

    // The 'Z' block of the conventional chain, when it is the last block.
    fn conventional_tail<M: AddressSpace>(&self, mem: &mut M) -> Option<Mcb> {
        let mut walker = ChainWalker::new(
            self.first_mcb(mem),
            self.conv_end as u32,
            self.policy,
            self.first_mcb(mem),
        );
        loop {
            if walker.check(mem).ok()? == McbKind::Last {
                return Some(walker.mcb());
            }
            walker.advance(mem).ok()?;
        }
    }

    /// The UMB chain set up at boot, if the guest has not trampled the
    /// pointer to it.
    pub(crate) fn umb_region<M: AddressSpace>(&self, mem: &M) -> Option<UmbRegion> {
        let region = self.umb?;
        if self.sysvars.umb_start(mem) == region.head {
            Some(region)
        } else {
            None
        }
    }

    pub(crate) fn linked_umb<M: AddressSpace>(&self, mem: &M) -> Option<UmbRegion> {
        self.umb_region(mem)
            .filter(|_| self.sysvars.umb_chain_state(mem) & 1 != 0)
    }

    pub(crate) fn unlinked_umb<M: AddressSpace>(&self, mem: &M) -> Option<UmbRegion> {
        self.umb_region(mem)
            .filter(|_| self.sysvars.umb_chain_state(mem) & 1 == 0)
    }

    /// Whether walks from the first MCB run on into upper memory.
    pub fn umb_linked<M: AddressSpace>(&self, mem: &M) -> bool {
        self.linked_umb(mem).is_some()
    }

    /// The guest-visible start of the UMB chain, `0xffff` without UMBs.
    pub fn umb_start<M: AddressSpace>(&self, mem: &M) -> u16 {
        self.sysvars.umb_start(mem)
    }

    /// Link or unlink the UMB chain (int 21h AX=5803h). Returns whether the
    /// chain is now in the requested state.
    pub fn link_umb<M: AddressSpace>(&mut self, mem: &mut M, link: bool) -> bool {
        let umb_start = self.sysvars.umb_start(mem);
        let head = match self.umb {
            Some(region) if region.head == umb_start => region.head,
            _ => {
                if umb_start != NO_UMB_CHAIN {
                    error!("Corrupt UMB chain: {:#06x}", umb_start);
                }
                return false;
            }
        };

        let state = self.sysvars.umb_chain_state(mem);
        if (state & 1 != 0) == link {
            return true;
        }

        // Find the block just before the UMB chain. Only the kind bytes are
        // followed here, so a broken chain just stops the scan.
        let mut segment = self.first_mcb(mem);
        let mut previous = segment;
        for _ in 0..crate::chain::MAX_WALK_STEPS {
            let mcb = Mcb::at(segment);
            if segment == head || mcb.kind(mem) == McbKind::Last {
                break;
            }
            let next = mcb.next_segment(mem);
            if next <= segment {
                break;
            }
            previous = segment;
            segment = next;
        }

        if link {
            let tail = Mcb::at(segment);
            if tail.kind(mem) != McbKind::Last || tail.next_segment(mem) != head {
                warn!("MCB chain no longer goes to end of memory, not linking in UMBs");
                return false;
            }
            tail.set_kind(mem, McbKind::Middle);
            self.sysvars.set_umb_chain_state(mem, state | 1);
        } else {
            let previous = Mcb::at(previous);
            if segment == head && previous.kind(mem) == McbKind::Middle {
                previous.set_kind(mem, McbKind::Last);
            }
            self.sysvars.set_umb_chain_state(mem, state & !1);
        }
        debug!("UMBs {}", if link { "linked" } else { "unlinked" });
        true
    }
}
