//! The DOS conventional memory allocator.
//!
//! DOS manages memory as a chain of MCBs living inside the very memory they
//! describe. [`DosMemory`](struct.DosMemory.html) holds only settings (the
//! allocation strategy, the fault policy, the layout it set up); every chain
//! pointer is read back from guest RAM on every call.

use log::{debug, error, info, warn};

use crate::chain::{ChainSnapshot, ChainWalker};
use crate::error::DosError;
use crate::fault::{FaultPolicy, WalkAborted};
use crate::guest::{segment_to_linear, AddressSpace, PARAGRAPH};
use crate::mcb::{mcb_name, Mcb, McbKind, HEADER_PARAGRAPHS, OWNER_DOS, OWNER_FREE, OWNER_RESERVED};

/// Segment of the DOS list of lists.
pub const DOS_INFOBLOCK_SEG: u16 = 0x80;
/// First segment DOS hands to the MCB chain.
pub const DOS_MEM_START: u16 = 0x16f;
/// Value of the UMB chain start when there are no UMBs.
pub const NO_UMB_CHAIN: u16 = 0xffff;

// Offsets into the list of lists, which DOS programs find through int 21h
// AH=52h at sysvars:0026.
const LOL_OFFSET: u32 = 0x26;
const FIRST_MCB_OFFSET: u32 = LOL_OFFSET - 2;
const UMB_CHAIN_STATE_OFFSET: u32 = LOL_OFFSET + 0x63;
const UMB_CHAIN_START_OFFSET: u32 = LOL_OFFSET + 0x66;

/// The part of the DOS list of lists describing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysVars {
    segment: u16,
}

impl SysVars {
    pub const fn at(segment: u16) -> Self {
        SysVars { segment }
    }

    pub fn segment(self) -> u16 {
        self.segment
    }

    fn addr(self, offset: u32) -> u32 {
        segment_to_linear(self.segment) + offset
    }

    pub fn first_mcb<M: AddressSpace>(self, mem: &M) -> u16 {
        mem.read_u16(self.addr(FIRST_MCB_OFFSET))
    }

    pub fn set_first_mcb<M: AddressSpace>(self, mem: &mut M, segment: u16) {
        mem.write_u16(self.addr(FIRST_MCB_OFFSET), segment)
    }

    /// Bit 0 set when the UMB chain is linked to the conventional chain.
    pub fn umb_chain_state<M: AddressSpace>(self, mem: &M) -> u8 {
        mem.read_u8(self.addr(UMB_CHAIN_STATE_OFFSET))
    }

    pub fn set_umb_chain_state<M: AddressSpace>(self, mem: &mut M, state: u8) {
        mem.write_u8(self.addr(UMB_CHAIN_STATE_OFFSET), state)
    }

    pub fn umb_start<M: AddressSpace>(self, mem: &M) -> u16 {
        mem.read_u16(self.addr(UMB_CHAIN_START_OFFSET))
    }

    pub fn set_umb_start<M: AddressSpace>(self, mem: &mut M, segment: u16) {
        mem.write_u16(self.addr(UMB_CHAIN_START_OFFSET), segment)
    }
}

/// How to pick among the free blocks large enough for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// The first block found, allocated at its start.
    First,
    /// The smallest block, allocated at its start.
    Best,
    /// The last block found, allocated at its end.
    Last,
}

/// Which chains to search, in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrder {
    LowOnly,
    UpperOnly,
    UpperFirst,
}

/// Decode the fit mode from the low six bits of a strategy byte. DOS treats
/// every reserved code as last fit.
pub fn fit_mode(strategy: u8) -> FitMode {
    match strategy & 0x3f {
        0 => FitMode::First,
        1 => FitMode::Best,
        _ => FitMode::Last,
    }
}

/// Decode the search order from bits 6 and 7 of a strategy byte.
pub fn search_order(strategy: u8) -> SearchOrder {
    if strategy & 0x80 != 0 {
        SearchOrder::UpperFirst
    } else if strategy & 0x40 != 0 {
        SearchOrder::UpperOnly
    } else {
        SearchOrder::LowOnly
    }
}

/// The upper memory area as set up by
/// [`build_umb_chain`](struct.DosMemory.html#method.build_umb_chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmbRegion {
    /// Segment of the covering MCB that starts the UMB chain.
    pub head: u16,
    /// Segment of the first real upper memory MCB.
    pub base: u16,
    /// Paragraphs of upper memory, headers included.
    pub paragraphs: u16,
}

impl UmbRegion {
    /// Segment just past the upper memory area.
    pub fn end(&self) -> u32 {
        self.base as u32 + self.paragraphs as u32
    }
}

/// The MCB chain allocator.
#[derive(Debug, Clone)]
pub struct DosMemory {
    pub(crate) sysvars: SysVars,
    pub(crate) strategy: u8,
    pub(crate) policy: FaultPolicy,
    pub(crate) zero_on_allocate: bool,
    // Segment just past the last block of the conventional chain
    pub(crate) conv_end: u16,
    pub(crate) umb: Option<UmbRegion>,
}

impl DosMemory {
    /// Create an allocator whose list of lists lives at `sysvars`. Nothing is
    /// written to guest memory until [`setup`](#method.setup) or
    /// [`format`](#method.format).
    pub fn new(sysvars: u16, policy: FaultPolicy) -> Self {
        DosMemory {
            sysvars: SysVars::at(sysvars),
            strategy: 0,
            policy,
            zero_on_allocate: false,
            conv_end: 0,
            umb: None,
        }
    }

    /// Clear every newly allocated block, to shake out programs relying on
    /// leftover memory contents.
    pub fn set_zero_on_allocate(&mut self, zero: bool) {
        self.zero_on_allocate = zero;
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FaultPolicy) {
        self.policy = policy;
    }

    pub fn sysvars(&self) -> SysVars {
        self.sysvars
    }

    pub fn first_mcb<M: AddressSpace>(&self, mem: &M) -> u16 {
        self.sysvars.first_mcb(mem)
    }

    /// Segment just past the conventional chain.
    pub fn conventional_end(&self) -> u16 {
        self.conv_end
    }

    /// Lay out conventional memory the way DOS leaves it after boot: a device
    /// block, a small free block left over from environment growth, a block
    /// reserved for LOADFIX, and everything else free up to the paragraph
    /// before `top`. That last paragraph is where the UMB chain gets linked.
    pub fn setup<M: AddressSpace>(&mut self, mem: &mut M, top: u16) -> Result<(), DosError> {
        const DEVICE_SIZE: u16 = 1;
        const ENV_SIZE: u16 = 4;
        const RESERVED_SIZE: u16 = 16;
        let used = (DEVICE_SIZE + 1) + (ENV_SIZE + 1) + (RESERVED_SIZE + 1);

        let last = DOS_MEM_START + used;
        if top < last + 2 + 0x100 {
            return Err(DosError::InsufficientMemory { largest: 0 });
        }

        let mut segment = DOS_MEM_START;
        Mcb::at(segment).write(mem, McbKind::Middle, OWNER_DOS, DEVICE_SIZE);
        segment += DEVICE_SIZE + 1;
        Mcb::at(segment).write(mem, McbKind::Middle, OWNER_FREE, ENV_SIZE);
        segment += ENV_SIZE + 1;
        Mcb::at(segment).write(mem, McbKind::Middle, OWNER_RESERVED, RESERVED_SIZE);
        segment += RESERVED_SIZE + 1;
        debug_assert_eq!(segment, last);
        Mcb::at(last).write(mem, McbKind::Last, OWNER_FREE, (top - 2) - last);

        self.conv_end = top - 1;
        self.init_sysvars(mem, DOS_MEM_START);
        info!(
            "DOS memory: {:#06x} paragraphs free at {:#06x}",
            (top - 2) - last,
            last + 1
        );
        Ok(())
    }

    /// Make conventional memory a single free block of `paragraphs` at
    /// `first_mcb`.
    pub fn format<M: AddressSpace>(&mut self, mem: &mut M, first_mcb: u16, paragraphs: u16) {
        Mcb::at(first_mcb).write(mem, McbKind::Last, OWNER_FREE, paragraphs);
        self.conv_end = first_mcb.wrapping_add(paragraphs).wrapping_add(HEADER_PARAGRAPHS);
        self.init_sysvars(mem, first_mcb);
    }

    fn init_sysvars<M: AddressSpace>(&mut self, mem: &mut M, first_mcb: u16) {
        self.sysvars.set_first_mcb(mem, first_mcb);
        self.sysvars.set_umb_start(mem, NO_UMB_CHAIN);
        self.sysvars.set_umb_chain_state(mem, 0);
        self.umb = None;
    }

    ////////////////////////////////////////////////////////////
    // Allocation strategy

    pub fn strategy(&self) -> u8 {
        self.strategy
    }

    /// Set the allocation strategy (int 21h AX=5801h).
    ///
    /// Reserved fit codes are accepted and behave as last fit. The one
    /// combination refused is a reserved fit code with both search order bits
    /// set.
    pub fn set_strategy(&mut self, strategy: u8) -> Result<(), DosError> {
        if strategy & 0xc0 == 0xc0 && strategy & 0x3f >= 3 {
            warn!("Rejecting allocation strategy {:#04x}", strategy);
            return Err(DosError::InvalidValue(strategy as u16));
        }
        debug!("Allocation strategy {:#04x}", strategy);
        self.strategy = strategy;
        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // Walk helpers

    // Where a walk from the conventional head may end up
    pub(crate) fn walk_end<M: AddressSpace>(&self, mem: &M) -> u32 {
        match self.linked_umb(mem) {
            Some(region) => region.end(),
            None => self.conv_end as u32,
        }
    }

    fn walker<M: AddressSpace>(&self, mem: &M, start: u16) -> ChainWalker {
        ChainWalker::new(start, self.walk_end(mem), self.policy, self.first_mcb(mem))
    }

    /// Copy the conventional chain (including linked UMBs).
    pub fn snapshot<M: AddressSpace>(&self, mem: &M) -> ChainSnapshot {
        ChainSnapshot::capture_region(mem, self.first_mcb(mem), None, self.walk_end(mem))
    }

    /// Copy conventional memory only, stopping at the UMB chain even when
    /// linked.
    pub fn conventional_snapshot<M: AddressSpace>(&self, mem: &M) -> ChainSnapshot {
        let stop = self.linked_umb(mem).map(|region| region.head);
        ChainSnapshot::capture_region(mem, self.first_mcb(mem), stop, self.walk_end(mem))
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate `paragraphs` for `owner` (int 21h AH=48h), returning the
    /// segment of the new block.
    pub fn allocate<M: AddressSpace>(
        &mut self,
        mem: &mut M,
        owner: u16,
        paragraphs: u16,
    ) -> Result<u16, DosError> {
        self.compress(mem);

        let fit = fit_mode(self.strategy);
        let first = self.first_mcb(mem);
        let umb_head = self.linked_umb(mem).map(|region| region.head);

        // Without linked UMBs, the search bits mean nothing. Low memory
        // searches run from the first MCB to the 'Z' block, which is the end
        // of upper memory once the chains are linked.
        let (start, mut upper_pass) = match (search_order(self.strategy), umb_head) {
            (SearchOrder::UpperOnly, Some(head)) => (head, false),
            (SearchOrder::UpperFirst, Some(head)) => (head, true),
            _ => (first, false),
        };

        let end = self.walk_end(mem);
        let mut walker = self.walker(mem, start);
        let mut largest: u16 = 0;
        let mut found: Option<(Mcb, u16)> = None;

        loop {
            let mcb = walker.mcb();
            let kind = walker.check(mem).map_err(|_| DosError::McbDestroyed)?;
            if mcb.is_free(mem) {
                let size = mcb.size(mem);
                if size < paragraphs {
                    largest = largest.max(size);
                } else if size == paragraphs && fit != FitMode::Last {
                    return Ok(self.take(mem, mcb, owner));
                } else {
                    match fit {
                        FitMode::First => return Ok(self.claim_front(mem, mcb, paragraphs, owner)),
                        FitMode::Best => {
                            if found.map_or(true, |(_, best)| size < best) {
                                found = Some((mcb, size));
                            }
                        }
                        FitMode::Last => found = Some((mcb, size)),
                    }
                }
            }

            if walker.is_tail(mem, kind) {
                if upper_pass {
                    // Upper memory is done with; now search from the bottom
                    upper_pass = false;
                    walker.restart(first, end);
                    continue;
                }
                break;
            }
            walker.advance(mem).map_err(|_| DosError::McbDestroyed)?;
        }

        match found {
            Some((mcb, _)) if fit == FitMode::Best => Ok(self.claim_front(mem, mcb, paragraphs, owner)),
            Some((mcb, size)) => Ok(self.claim_back(mem, mcb, size, paragraphs, owner)),
            None => {
                debug!(
                    "Allocation of {:#06x} paragraphs failed, largest block {:#06x}",
                    paragraphs, largest
                );
                Err(DosError::InsufficientMemory { largest })
            }
        }
    }

    // Take the start of a free block, leaving the rest free.
    fn claim_front<M: AddressSpace>(&self, mem: &mut M, mcb: Mcb, paragraphs: u16, owner: u16) -> u16 {
        let size = mcb.size(mem);
        if size > paragraphs {
            let rest = Mcb::at(mcb.segment().wrapping_add(paragraphs + HEADER_PARAGRAPHS));
            rest.write(mem, mcb.kind(mem), OWNER_FREE, size - paragraphs - HEADER_PARAGRAPHS);
            mcb.set_size(mem, paragraphs);
            mcb.set_kind(mem, McbKind::Middle);
        }
        self.take(mem, mcb, owner)
    }

    // Take the end of a free block, leaving the start free.
    fn claim_back<M: AddressSpace>(
        &self,
        mem: &mut M,
        mcb: Mcb,
        size: u16,
        paragraphs: u16,
        owner: u16,
    ) -> u16 {
        if size == paragraphs {
            return self.take(mem, mcb, owner);
        }
        let block = Mcb::at(mcb.segment().wrapping_add(size - paragraphs));
        block.write(mem, mcb.kind(mem), OWNER_FREE, paragraphs);
        mcb.write(mem, McbKind::Middle, OWNER_FREE, size - paragraphs - HEADER_PARAGRAPHS);
        self.take(mem, block, owner)
    }

    // Hand a block over to its owner.
    fn take<M: AddressSpace>(&self, mem: &mut M, mcb: Mcb, owner: u16) -> u16 {
        let name = Mcb::for_block(owner).name(mem);
        mcb.set_owner(mem, owner);
        mcb.set_name(mem, &name);

        let segment = mcb.data_segment();
        let size = mcb.size(mem);
        if self.zero_on_allocate {
            mem.fill(segment_to_linear(segment), size as u32 * PARAGRAPH, 0);
        }
        debug!(
            "Allocated {:#06x} paragraphs for {:#06x}: {:#06x}-{:#06x}",
            size,
            owner,
            segment,
            segment as u32 + size as u32
        );
        segment
    }

    /// Resize the block at `segment` in place (int 21h AH=4Ah).
    ///
    /// When the block cannot grow enough, it grows as far as it can and the
    /// error carries that size.
    pub fn resize<M: AddressSpace>(
        &mut self,
        mem: &mut M,
        segment: u16,
        paragraphs: u16,
    ) -> Result<(), DosError> {
        if segment <= self.first_mcb(mem) {
            warn!("Program resizes {:#06x}, take care", segment);
        }

        let mcb = Mcb::for_block(segment);
        let kind = mcb.kind(mem);
        if !kind.is_valid() {
            return Err(DosError::McbDestroyed);
        }
        let size = mcb.size(mem);

        if paragraphs <= size {
            if paragraphs < size {
                let rest = Mcb::at(segment.wrapping_add(paragraphs));
                rest.write(mem, kind, OWNER_FREE, size - paragraphs - HEADER_PARAGRAPHS);
                mcb.set_size(mem, paragraphs);
                mcb.set_kind(mem, McbKind::Middle);
            }
            self.compress(mem);
            return Ok(());
        }

        // Growing: try to swallow the following block
        let next = Mcb::at(mcb.next_segment(mem));
        let next_kind = next.kind(mem);
        let joinable = kind != McbKind::Last
            && next.segment() > mcb.segment()
            && next.is_free(mem)
            && next_kind.is_valid();
        let mut total = size as u32;
        if joinable {
            total += next.size(mem) as u32 + HEADER_PARAGRAPHS as u32;
        }
        if total > 0xffff {
            return Err(DosError::McbDestroyed);
        }
        let total = total as u16;

        if paragraphs < total {
            // The joined block overshoots; split the excess off again
            mcb.set_size(mem, paragraphs);
            mcb.set_kind(mem, McbKind::Middle);
            let rest = Mcb::at(segment.wrapping_add(paragraphs));
            rest.write(mem, next_kind, OWNER_FREE, total - paragraphs - HEADER_PARAGRAPHS);
            self.compress(mem);
            return Ok(());
        }

        if joinable {
            mcb.set_kind(mem, next_kind);
        }
        mcb.set_size(mem, total);
        self.compress(mem);
        if paragraphs == total {
            Ok(())
        } else {
            debug!(
                "Resize of {:#06x} to {:#06x} failed, grew to {:#06x}",
                segment, paragraphs, total
            );
            Err(DosError::InsufficientMemory { largest: total })
        }
    }

    /// Free the block at `segment` (int 21h AH=49h). Adjacent free blocks are
    /// merged by the next allocation, not here.
    pub fn free<M: AddressSpace>(&mut self, mem: &mut M, segment: u16) -> Result<(), DosError> {
        if segment <= self.first_mcb(mem) {
            error!("Program tried to free {:#06x}", segment);
            return Err(DosError::MbAddressInvalid);
        }
        let mcb = Mcb::for_block(segment);
        if !mcb.kind(mem).is_valid() {
            return Err(DosError::MbAddressInvalid);
        }
        debug!("Freeing {:#06x}", segment);
        mcb.set_owner(mem, OWNER_FREE);
        Ok(())
    }

    /// Merge all adjacent free blocks.
    pub fn compress<M: AddressSpace>(&mut self, mem: &mut M) {
        let first = self.first_mcb(mem);
        let end = self.walk_end(mem);
        if let Err(e) = self.compress_chain(mem, first, end) {
            warn!("DOS memory compaction stopped: {}", e);
        }
        if let Some(region) = self.unlinked_umb(mem) {
            if let Err(e) = self.compress_chain(mem, region.head, region.end()) {
                warn!("UMB compaction stopped: {}", e);
            }
        }
    }

    fn compress_chain<M: AddressSpace>(
        &self,
        mem: &mut M,
        start: u16,
        end: u32,
    ) -> Result<(), WalkAborted> {
        let mut walker = ChainWalker::new(start, end, self.policy, self.first_mcb(mem));
        loop {
            let kind = walker.check(mem)?;
            if walker.is_tail(mem, kind) {
                return Ok(());
            }
            let mcb = walker.mcb();
            let next = Mcb::at(mcb.next_segment(mem));
            if next.segment() > mcb.segment() && mcb.is_free(mem) && next.is_free(mem) {
                let merged = mcb.size(mem) as u32 + next.size(mem) as u32 + HEADER_PARAGRAPHS as u32;
                // A damaged neighbour is only absorbed once repaired
                let next_kind = walker.check_block(mem, next)?;
                if merged <= 0xffff && next_kind.is_valid() {
                    mcb.set_size(mem, merged as u16);
                    mcb.set_kind(mem, next_kind);
                    continue;
                }
            }
            walker.advance(mem)?;
        }
    }

    /// Free every block owned by `owner`, in conventional and upper memory,
    /// then compact.
    pub fn free_process_memory<M: AddressSpace>(&mut self, mem: &mut M, owner: u16) {
        let first = self.first_mcb(mem);
        let end = self.walk_end(mem);
        if let Err(e) = self.free_owned(mem, first, end, owner) {
            warn!("Freeing memory of {:#06x} stopped: {}", owner, e);
        }

        let umb_start = self.sysvars.umb_start(mem);
        match self.umb {
            Some(region) if region.head == umb_start => {
                if self.linked_umb(mem).is_none() {
                    if let Err(e) = self.free_owned(mem, region.head, region.end(), owner) {
                        warn!("Freeing UMBs of {:#06x} stopped: {}", owner, e);
                    }
                }
            }
            _ if umb_start != NO_UMB_CHAIN => error!("Corrupt UMB chain: {:#06x}", umb_start),
            _ => {}
        }

        self.compress(mem);
    }

    fn free_owned<M: AddressSpace>(
        &self,
        mem: &mut M,
        start: u16,
        end: u32,
        owner: u16,
    ) -> Result<(), WalkAborted> {
        let mut walker = ChainWalker::new(start, end, self.policy, self.first_mcb(mem));
        loop {
            let kind = walker.check(mem)?;
            let mcb = walker.mcb();
            if mcb.owner(mem) == owner {
                mcb.set_owner(mem, OWNER_FREE);
            }
            if walker.is_tail(mem, kind) {
                return Ok(());
            }
            walker.advance(mem)?;
        }
    }

    /// Name a block, as DOS does for programs it loads.
    pub fn set_block_name<M: AddressSpace>(&self, mem: &mut M, segment: u16, name: &str) {
        Mcb::for_block(segment).set_name(mem, &mcb_name(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::guest::GuestRam;
    use crate::mcb::MCB_LAST;
    use test_env_log::test;

    const FIRST: u16 = 0x100;
    const OWNER: u16 = 0x0abc;

    fn formatted(paragraphs: u16) -> (GuestRam, DosMemory) {
        let mut ram = GuestRam::new(0x10_0000);
        let mut dos = DosMemory::new(DOS_INFOBLOCK_SEG, FaultPolicy::Report);
        dos.format(&mut ram, FIRST, paragraphs);
        (ram, dos)
    }

    fn assert_valid(ram: &GuestRam, dos: &DosMemory) {
        let snapshot = dos.snapshot(ram);
        log::info!("{}", snapshot);
        let (validity, _) = snapshot.stats();
        assert!(validity.is_valid(), "{:?}", validity);
    }

    // Free blocks of the given sizes, separated by 1-paragraph used blocks.
    fn with_free_blocks(sizes: &[u16]) -> (GuestRam, DosMemory, Vec<u16>) {
        let total: u16 = sizes.iter().map(|s| s + 1 + 2).sum::<u16>() + 100;
        let (mut ram, mut dos) = formatted(total);
        let mut segments = Vec::new();
        for &size in sizes {
            segments.push(dos.allocate(&mut ram, OWNER, size).unwrap());
            dos.allocate(&mut ram, OWNER + 1, 1).unwrap();
        }
        for &seg in &segments {
            dos.free(&mut ram, seg).unwrap();
        }
        assert_valid(&ram, &dos);
        (ram, dos, segments)
    }

    #[test]
    fn test_allocate_free_scenario() {
        let (mut ram, mut dos) = formatted(100);

        let seg = dos.allocate(&mut ram, OWNER, 30).unwrap();
        assert_eq!(seg, FIRST + 1);
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.blocks[0].size, 30);
        assert_eq!(snapshot.blocks[0].owner, OWNER);
        assert_eq!(snapshot.blocks[1].size, 69);
        assert!(snapshot.blocks[1].is_free());
        assert_eq!(snapshot.blocks[1].kind, McbKind::Last);

        dos.free(&mut ram, seg).unwrap();
        dos.compress(&mut ram);
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.blocks[0].size, 100);
        assert!(snapshot.blocks[0].is_free());
    }

    #[test]
    fn test_exact_fit_does_not_split() {
        let (mut ram, mut dos) = formatted(100);
        dos.allocate(&mut ram, OWNER, 100).unwrap();
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.blocks[0].kind, McbKind::Last);
        assert_eq!(
            dos.allocate(&mut ram, OWNER, 1),
            Err(DosError::InsufficientMemory { largest: 0 })
        );
    }

    #[test]
    fn test_one_paragraph_remainder() {
        let (mut ram, mut dos) = formatted(100);
        dos.allocate(&mut ram, OWNER, 99).unwrap();
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.blocks[1].size, 0);
        assert!(snapshot.blocks[1].is_free());
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_insufficient_reports_largest() {
        let (mut ram, mut dos, _) = with_free_blocks(&[5, 20, 8]);
        // The trailing free block is the largest
        let tail = dos.snapshot(&ram).blocks.last().unwrap().size;
        assert_eq!(
            dos.allocate(&mut ram, OWNER, 0xf000),
            Err(DosError::InsufficientMemory { largest: tail })
        );
    }

    #[test]
    fn test_first_fit() {
        let (mut ram, mut dos, segments) = with_free_blocks(&[5, 20, 8, 20]);
        dos.set_strategy(0x00).unwrap();
        assert_eq!(dos.allocate(&mut ram, OWNER, 8), Ok(segments[1]));
        assert_eq!(Mcb::for_block(segments[1]).size(&ram), 8);
        // The remainder stays free right behind it
        let rest = Mcb::at(segments[1] + 8);
        assert!(rest.is_free(&ram));
        assert_eq!(rest.size(&ram), 11);
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_best_fit() {
        let (mut ram, mut dos, segments) = with_free_blocks(&[5, 20, 8, 20]);
        dos.set_strategy(0x01).unwrap();
        assert_eq!(dos.allocate(&mut ram, OWNER, 8), Ok(segments[2]));

        // Smallest sufficient block is split at its start
        assert_eq!(dos.allocate(&mut ram, OWNER, 6), Ok(segments[1]));
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_last_fit() {
        let (mut ram, mut dos, _) = with_free_blocks(&[5, 20, 8, 20]);
        dos.set_strategy(0x02).unwrap();
        let before = dos.snapshot(&ram);
        let tail = before.blocks.last().unwrap();
        let seg = dos.allocate(&mut ram, OWNER, 8).unwrap();
        // The end of the last sufficient block, the free tail of memory
        assert_eq!(seg as u32, tail.segment as u32 + 1 + tail.size as u32 - 8);
        assert_eq!(Mcb::for_block(seg).kind(&ram), McbKind::Last);
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_last_fit_reserved_codes() {
        let (mut ram, mut dos, segments) = with_free_blocks(&[5, 20]);
        // Fill the tail so only the listed blocks are free
        let tail = dos.snapshot(&ram).blocks.last().unwrap().size;
        dos.allocate(&mut ram, OWNER + 2, tail).unwrap();

        dos.set_strategy(0x3f).unwrap();
        assert_eq!(dos.allocate(&mut ram, OWNER, 5), Ok(segments[1] + 15));
        // The last candidate is now an exact match, and is taken whole
        assert_eq!(dos.allocate(&mut ram, OWNER, 14), Ok(segments[1]));
        assert_eq!(Mcb::for_block(segments[1]).size(&ram), 14);
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_strategy_validation() {
        let mut dos = DosMemory::new(DOS_INFOBLOCK_SEG, FaultPolicy::Report);
        assert_eq!(dos.set_strategy(0x82), Ok(()));
        assert_eq!(dos.strategy(), 0x82);
        assert_eq!(dos.set_strategy(0x05), Ok(()));
        assert_eq!(fit_mode(0x05), FitMode::Last);
        assert_eq!(dos.set_strategy(0xc3), Err(DosError::InvalidValue(0xc3)));
        assert_eq!(dos.strategy(), 0x05);
        assert_eq!(search_order(0x41), SearchOrder::UpperOnly);
        assert_eq!(search_order(0x80), SearchOrder::UpperFirst);
    }

    #[test]
    fn test_resize_round_trip() {
        let (mut ram, mut dos) = formatted(200);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        let b = dos.allocate(&mut ram, OWNER + 1, 10).unwrap();
        dos.free(&mut ram, b).unwrap();
        let before = dos.snapshot(&ram);

        // Grows into the free block behind it
        dos.resize(&mut ram, a, 15).unwrap();
        assert_eq!(Mcb::for_block(a).size(&ram), 15);
        assert_valid(&ram, &dos);

        dos.resize(&mut ram, a, 10).unwrap();
        dos.compress(&mut ram);
        let after = dos.snapshot(&ram);
        assert_eq!(after.blocks[0], before.blocks[0]);
        assert_eq!(after.blocks[1].size, 200 - 10 - 1);
        assert_eq!(after.stats().1.span, before.stats().1.span);
    }

    #[test]
    fn test_resize_exactly_into_last_block() {
        let (mut ram, mut dos) = formatted(100);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        // 10 + 89 + 1 header
        dos.resize(&mut ram, a, 100).unwrap();
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.blocks[0].kind, McbKind::Last);
        assert_eq!(snapshot.blocks[0].owner, OWNER);

        dos.resize(&mut ram, a, 10).unwrap();
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.blocks[1].kind, McbKind::Last);
        assert_eq!(snapshot.blocks[1].size, 89);
    }

    #[test]
    fn test_resize_too_large_grows_to_maximum() {
        let (mut ram, mut dos) = formatted(100);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        let b = dos.allocate(&mut ram, OWNER, 10).unwrap();
        dos.allocate(&mut ram, OWNER, 10).unwrap();
        dos.free(&mut ram, b).unwrap();

        assert_eq!(
            dos.resize(&mut ram, a, 40),
            Err(DosError::InsufficientMemory { largest: 21 })
        );
        assert_eq!(Mcb::for_block(a).size(&ram), 21);
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_resize_keeps_owner() {
        let (mut ram, mut dos) = formatted(100);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        dos.resize(&mut ram, a, 5).unwrap();
        assert_eq!(Mcb::for_block(a).owner(&ram), OWNER);
        assert_eq!(Mcb::for_block(a).size(&ram), 5);
    }

    #[test]
    fn test_resize_destroyed() {
        let (mut ram, mut dos) = formatted(100);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        ram.write_u8(segment_to_linear(a - 1), 0);
        assert_eq!(dos.resize(&mut ram, a, 5), Err(DosError::McbDestroyed));
    }

    #[test]
    fn test_free_validates_header() {
        let (mut ram, mut dos) = formatted(100);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        assert_eq!(dos.free(&mut ram, a + 3), Err(DosError::MbAddressInvalid));
        assert_eq!(dos.free(&mut ram, FIRST), Err(DosError::MbAddressInvalid));
        assert_eq!(dos.free(&mut ram, a), Ok(()));

        // Freeing does not compact
        let (validity, _) = dos.snapshot(&ram).stats();
        assert_eq!(validity.unmerged, 1);
    }

    #[test]
    fn test_free_process_memory() {
        let (mut ram, mut dos) = formatted(100);
        dos.allocate(&mut ram, OWNER, 10).unwrap();
        dos.allocate(&mut ram, OWNER + 1, 10).unwrap();
        dos.allocate(&mut ram, OWNER, 10).unwrap();

        dos.free_process_memory(&mut ram, OWNER);
        let snapshot = dos.snapshot(&ram);
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.blocks[0].is_free());
        assert_eq!(snapshot.blocks[1].owner, OWNER + 1);
        assert!(snapshot.blocks[2].is_free());
        assert_eq!(snapshot.blocks[2].size, 100 - 22);
        assert!(snapshot.stats().0.is_compact());
    }

    #[test]
    fn test_setup_layout() {
        let mut ram = GuestRam::new(0x10_0000);
        let mut dos = DosMemory::new(DOS_INFOBLOCK_SEG, FaultPolicy::Report);
        dos.setup(&mut ram, 0xa000).unwrap();

        let snapshot = dos.snapshot(&ram);
        log::info!("{:#}", snapshot);
        assert_eq!(dos.first_mcb(&ram), DOS_MEM_START);
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.blocks[0].owner, OWNER_DOS);
        assert_eq!(snapshot.blocks[2].owner, OWNER_RESERVED);
        let last = snapshot.blocks[3];
        assert_eq!(last.segment as u32 + last.size as u32 + 1, 0x9fff);
        assert_eq!(dos.conventional_end(), 0x9fff);
        assert_eq!(dos.sysvars().umb_start(&ram), NO_UMB_CHAIN);
    }

    #[test]
    fn test_zero_on_allocate() {
        let (mut ram, mut dos) = formatted(100);
        ram.fill(segment_to_linear(FIRST + 1), 16 * 4, 0xcc);
        dos.set_zero_on_allocate(true);
        let seg = dos.allocate(&mut ram, OWNER, 4).unwrap();
        assert!(ram.as_slice()[segment_to_linear(seg) as usize..][..64]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn test_repair_corrupt_tail() {
        let (mut ram, mut dos) = formatted(100);
        dos.set_policy(FaultPolicy::Repair);
        dos.allocate(&mut ram, OWNER, 10).unwrap();
        // Scribble over the type of the last block
        let tail = Mcb::at(FIRST + 11);
        ram.write_u8(segment_to_linear(tail.segment()), b'x');

        dos.compress(&mut ram);
        assert_eq!(ram.read_u8(segment_to_linear(tail.segment())), MCB_LAST);
        assert_valid(&ram, &dos);
    }

    #[test]
    fn test_report_corrupt_middle() {
        let (mut ram, mut dos) = formatted(100);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        dos.allocate(&mut ram, OWNER, 10).unwrap();
        ram.write_u8(segment_to_linear(a - 1), b'x');

        // Report carries on past the bad block, so allocation still works
        assert!(dos.allocate(&mut ram, OWNER, 10).is_ok());
        assert_eq!(ram.read_u8(segment_to_linear(a - 1)), b'x');
    }

    #[test]
    fn test_damaged_tail_stays_in_bounds() {
        for &policy in &[FaultPolicy::Report, FaultPolicy::Allow] {
            let (mut ram, mut dos) = formatted(100);
            dos.set_policy(policy);
            dos.allocate(&mut ram, OWNER, 10).unwrap();
            let tail = Mcb::at(FIRST + 11);
            ram.write_u8(segment_to_linear(tail.segment()), b'x');
            let span = dos.snapshot(&ram).stats().1.span;
            assert_eq!(span, 101);

            // The free RAM behind the chain is never merged in
            dos.compress(&mut ram);
            assert_eq!(tail.size(&ram), 89);
            assert_eq!(
                dos.allocate(&mut ram, OWNER, 150),
                Err(DosError::InsufficientMemory { largest: 89 })
            );

            // The damaged kind moves on to the remainder as-is
            assert_eq!(dos.allocate(&mut ram, OWNER, 20), Ok(tail.data_segment()));
            let rest = Mcb::at(tail.segment() + 21);
            assert_eq!(ram.read_u8(segment_to_linear(rest.segment())), b'x');
            assert_eq!(rest.size(&ram), 68);

            let (validity, stats) = dos.snapshot(&ram).stats();
            log::info!("{:?}: {:?}", policy, stats);
            assert_eq!(stats.span, span);
            assert_eq!(validity.corrupt, 1);
        }
    }

    #[test]
    fn test_cyclic_chain_terminates() {
        let (mut ram, mut dos) = formatted(100);
        dos.set_policy(FaultPolicy::Allow);
        let a = dos.allocate(&mut ram, OWNER, 10).unwrap();
        // Make the first block's successor point back before it
        let mcb = Mcb::for_block(a);
        mcb.set_size(&mut ram, 0xffff);
        assert_eq!(dos.allocate(&mut ram, OWNER, 200), Err(DosError::McbDestroyed));
    }

    #[test]
    #[should_panic(expected = "DOS MCB chain corrupted")]
    fn test_deny_is_fatal() {
        let (mut ram, mut dos) = formatted(100);
        dos.set_policy(FaultPolicy::Deny);
        dos.allocate(&mut ram, OWNER, 10).unwrap();
        ram.write_u8(segment_to_linear(FIRST + 11), 0);
        let _ = dos.allocate(&mut ram, OWNER, 10);
    }
}
