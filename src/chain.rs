//! Walking MCB chains.
//!
//! The chain is a singly linked list embedded in the memory it manages: the
//! "next" pointer of each block is implied by its size. Nothing here keeps a
//! list on the host side; [`ChainWalker`](struct.ChainWalker.html) only
//! remembers the segment it is at, and [`ChainSnapshot`](struct.ChainSnapshot.html)
//! copies headers out for inspection.

use core::fmt;

use crate::fault::{FaultPolicy, FaultTracker, WalkAborted};
use crate::guest::AddressSpace;
use crate::mcb::{Mcb, McbInfo, McbKind, HEADER_PARAGRAPHS};

/// No chain can have more blocks than there are paragraphs.
pub const MAX_WALK_STEPS: u32 = 0x10000;

/// A cursor over an MCB chain, applying a fault policy to every block it
/// visits.
///
/// The walker knows the end of the region it walks (`end`, the segment just
/// past the last paragraph the chain may cover), which is what lets `Repair`
/// tell whether a corrupt block should have been the last one.
#[derive(Debug, Clone)]
pub struct ChainWalker {
    segment: u16,
    end: u32,
    steps: u32,
    tracker: FaultTracker,
}

impl ChainWalker {
    pub fn new(start: u16, end: u32, policy: FaultPolicy, head: u16) -> Self {
        ChainWalker {
            segment: start,
            end,
            steps: 0,
            tracker: FaultTracker::new(policy, head),
        }
    }

    /// The block the walker is at.
    pub fn mcb(&self) -> Mcb {
        Mcb::at(self.segment)
    }

    pub fn segment(&self) -> u16 {
        self.segment
    }

    pub fn faults(&self) -> u32 {
        self.tracker.faults()
    }

    /// What the kind of `mcb` ought to be, judging by where it ends.
    pub fn expected_kind<M: AddressSpace>(&self, mem: &M, mcb: Mcb) -> McbKind {
        let next = mcb.segment() as u32 + mcb.size(mem) as u32 + HEADER_PARAGRAPHS as u32;
        if next >= self.end {
            McbKind::Last
        } else {
            McbKind::Middle
        }
    }

    /// Segment just past the region being walked.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Whether the current block runs up to (or past) the end of the region.
    pub fn reaches_end<M: AddressSpace>(&self, mem: &M) -> bool {
        self.expected_kind(mem, self.mcb()) == McbKind::Last
    }

    /// Whether the walk is over at the current block, whose kind is `kind`.
    /// A damaged block that reaches the end of the region is the tail.
    pub fn is_tail<M: AddressSpace>(&self, mem: &M, kind: McbKind) -> bool {
        match kind {
            McbKind::Last => true,
            McbKind::Middle => false,
            McbKind::Corrupt(_) => self.reaches_end(mem),
        }
    }

    /// Validate the current block, returning its (possibly repaired) kind.
    pub fn check<M: AddressSpace>(&mut self, mem: &mut M) -> Result<McbKind, WalkAborted> {
        self.check_block(mem, self.mcb())
    }

    /// Validate some other block the walk is looking at, such as the
    /// neighbour about to be merged.
    pub fn check_block<M: AddressSpace>(
        &mut self,
        mem: &mut M,
        mcb: Mcb,
    ) -> Result<McbKind, WalkAborted> {
        let expected = self.expected_kind(mem, mcb);
        self.tracker.inspect(mem, mcb, expected)
    }

    /// Move to the block following the current one.
    pub fn advance<M: AddressSpace>(&mut self, mem: &M) -> Result<Mcb, WalkAborted> {
        let current = self.mcb();
        let next = current.next_segment(mem);
        self.steps += 1;
        if next <= self.segment || next as u32 >= self.end || self.steps > MAX_WALK_STEPS {
            return Err(self.tracker.broken_link(mem, self.segment));
        }
        self.segment = next;
        Ok(self.mcb())
    }

    /// Continue the walk from another chain head, keeping the fault count.
    pub fn restart(&mut self, segment: u16, end: u32) {
        self.segment = segment;
        self.end = end;
    }
}

/// Validity contains a representation of all invalid states found in an MCB
/// chain.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks whose type is neither `'M'` nor `'Z'`.
    pub corrupt: usize,
    /// Number of free blocks directly followed by another free block. DOS
    /// tolerates these until the next compaction, so this isn't corruption.
    pub unmerged: usize,
    /// Whether the walk ended without reaching a `'Z'` block.
    pub unterminated: bool,
}

impl Validity {
    /// Returns a boolean - a simple check that the chain is well formed.
    pub fn is_valid(&self) -> bool {
        self.corrupt == 0 && !self.unterminated
    }

    /// Well formed, and fully compacted.
    pub fn is_compact(&self) -> bool {
        self.is_valid() && self.unmerged == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Sizes are all in paragraphs.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub length: usize,
    pub free_blocks: usize,
    pub free: u32,
    pub used: u32,
    pub largest_free: u16,
    /// Paragraphs covered by the chain, headers included.
    pub span: u32,
}

/// A copy of every header in a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub blocks: Vec<McbInfo>,
    pub terminated: bool,
}

impl ChainSnapshot {
    /// Copy headers starting at `start` until a `'Z'` block, a link that does
    /// not go forward, or [`MAX_WALK_STEPS`](constant.MAX_WALK_STEPS.html).
    /// Corrupt blocks are recorded and followed.
    pub fn capture<M: AddressSpace>(mem: &M, start: u16) -> Self {
        Self::capture_until(mem, start, None)
    }

    /// Like `capture`, but stop before reaching `stop` (a chain head that
    /// belongs to somebody else, such as the UMB chain).
    pub fn capture_until<M: AddressSpace>(mem: &M, start: u16, stop: Option<u16>) -> Self {
        Self::capture_region(mem, start, stop, u32::MAX)
    }

    /// Like `capture_until`, for a chain managing the paragraphs below `end`.
    /// A damaged block reaching `end` is the last one copied; nothing at or
    /// past `end` is.
    pub fn capture_region<M: AddressSpace>(
        mem: &M,
        start: u16,
        stop: Option<u16>,
        end: u32,
    ) -> Self {
        let mut snapshot = ChainSnapshot::default();
        let mut mcb = Mcb::at(start);
        for _ in 0..MAX_WALK_STEPS {
            if Some(mcb.segment()) == stop {
                snapshot.terminated = true;
                break;
            }
            let info = mcb.info(mem);
            snapshot.blocks.push(info);
            if info.kind == McbKind::Last {
                snapshot.terminated = true;
                break;
            }
            let next = mcb.next_segment(mem);
            if next <= mcb.segment() || next as u32 >= end {
                break;
            }
            mcb = Mcb::at(next);
        }
        snapshot
    }

    pub fn iter(&self) -> core::slice::Iter<'_, McbInfo> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Check sizes, and whether the chain is valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity {
            unterminated: !self.terminated,
            ..Validity::default()
        };
        let mut stats = Stats::default();

        let mut previous: Option<&McbInfo> = None;
        for block in self {
            if !block.kind.is_valid() {
                validity.corrupt += 1;
            }
            if block.is_free() {
                if previous.map_or(false, |p| p.is_free()) {
                    validity.unmerged += 1;
                }
                stats.free_blocks += 1;
                stats.free += block.size as u32;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used += block.size as u32;
            }
            stats.length += 1;
            stats.span += block.size as u32 + HEADER_PARAGRAPHS as u32;
            previous = Some(block);
        }

        (validity, stats)
    }
}

impl<'a> IntoIterator for &'a ChainSnapshot {
    type Item = &'a McbInfo;
    type IntoIter = core::slice::Iter<'a, McbInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

impl fmt::Display for ChainSnapshot {
    /// `{}` prints the chain on one line, `{:#}` one block per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            for block in self {
                writeln!(f, "  {}", block)?;
            }
            if !self.terminated {
                writeln!(f, "  (chain does not terminate)")?;
            }
            return Ok(());
        }

        write!(f, "McbChain(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}", block)?;
        }
        if !self.terminated {
            write!(f, ", ...")?;
        }
        write!(f, ")")
    }
}
