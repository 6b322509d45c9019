//! Memory control blocks.
//!
//! An MCB is a 16-byte header stored in guest RAM, one paragraph before the
//! block it describes. Layout:
//!
//! | offset | size | field                                    |
//! |--------|------|------------------------------------------|
//! | 0      | 1    | kind: `'M'` (more follow) or `'Z'` (last) |
//! | 1      | 2    | owner PSP segment, 0 when free           |
//! | 3      | 2    | size of the block in paragraphs          |
//! | 5      | 3    | unused                                   |
//! | 8      | 8    | name, not NUL terminated when 8 long     |
//!
//! [`Mcb`](struct.Mcb.html) holds nothing but a segment: every accessor goes
//! back to guest RAM, so whatever the guest scribbles over a header is what
//! we see on the next access.

use core::fmt;

use static_assertions::const_assert;

use crate::guest::{segment_to_linear, AddressSpace, PARAGRAPH};

pub const MCB_MIDDLE: u8 = b'M';
pub const MCB_LAST: u8 = b'Z';

/// Owner of free blocks.
pub const OWNER_FREE: u16 = 0x0000;
/// Owner of blocks belonging to DOS itself (devices, the UMB cover).
pub const OWNER_DOS: u16 = 0x0008;
/// Owner of the block reserved below the first program, removable by LOADFIX.
pub const OWNER_RESERVED: u16 = 0x0040;

const KIND_OFFSET: u32 = 0;
const OWNER_OFFSET: u32 = 1;
const SIZE_OFFSET: u32 = 3;
const NAME_OFFSET: u32 = 8;
pub const NAME_LEN: usize = 8;

/// Headers occupy exactly one paragraph.
pub const HEADER_PARAGRAPHS: u16 = 1;
const_assert!(NAME_OFFSET as usize + NAME_LEN <= PARAGRAPH as usize);
const_assert!(SIZE_OFFSET + 2 <= NAME_OFFSET);

/// The kind byte of an MCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McbKind {
    Middle,
    Last,
    /// Anything other than `'M'` or `'Z'`.
    Corrupt(u8),
}

impl McbKind {
    pub fn byte(self) -> u8 {
        match self {
            McbKind::Middle => MCB_MIDDLE,
            McbKind::Last => MCB_LAST,
            McbKind::Corrupt(b) => b,
        }
    }

    pub fn is_valid(self) -> bool {
        !matches!(self, McbKind::Corrupt(_))
    }
}

impl From<u8> for McbKind {
    fn from(b: u8) -> Self {
        match b {
            MCB_MIDDLE => McbKind::Middle,
            MCB_LAST => McbKind::Last,
            b => McbKind::Corrupt(b),
        }
    }
}

/// A memory control block at a given segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mcb {
    segment: u16,
}

impl Mcb {
    pub const fn at(segment: u16) -> Self {
        Mcb { segment }
    }

    /// The MCB describing the block that starts at `segment`.
    pub const fn for_block(segment: u16) -> Self {
        Mcb {
            segment: segment.wrapping_sub(HEADER_PARAGRAPHS),
        }
    }

    pub fn segment(self) -> u16 {
        self.segment
    }

    /// Segment of the first paragraph of the block, as handed out to DOS
    /// programs.
    pub fn data_segment(self) -> u16 {
        self.segment.wrapping_add(HEADER_PARAGRAPHS)
    }

    fn addr(self, offset: u32) -> u32 {
        segment_to_linear(self.segment) + offset
    }

    pub fn kind<M: AddressSpace>(self, mem: &M) -> McbKind {
        McbKind::from(mem.read_u8(self.addr(KIND_OFFSET)))
    }

    pub fn set_kind<M: AddressSpace>(self, mem: &mut M, kind: McbKind) {
        mem.write_u8(self.addr(KIND_OFFSET), kind.byte())
    }

    pub fn owner<M: AddressSpace>(self, mem: &M) -> u16 {
        mem.read_u16(self.addr(OWNER_OFFSET))
    }

    pub fn set_owner<M: AddressSpace>(self, mem: &mut M, owner: u16) {
        mem.write_u16(self.addr(OWNER_OFFSET), owner)
    }

    pub fn is_free<M: AddressSpace>(self, mem: &M) -> bool {
        self.owner(mem) == OWNER_FREE
    }

    /// Size of the block in paragraphs, not counting this header.
    pub fn size<M: AddressSpace>(self, mem: &M) -> u16 {
        mem.read_u16(self.addr(SIZE_OFFSET))
    }

    pub fn set_size<M: AddressSpace>(self, mem: &mut M, size: u16) {
        mem.write_u16(self.addr(SIZE_OFFSET), size)
    }

    pub fn name<M: AddressSpace>(self, mem: &M) -> [u8; NAME_LEN] {
        let mut name = [0; NAME_LEN];
        mem.read_bytes(self.addr(NAME_OFFSET), &mut name);
        name
    }

    pub fn set_name<M: AddressSpace>(self, mem: &mut M, name: &[u8; NAME_LEN]) {
        mem.write_bytes(self.addr(NAME_OFFSET), name)
    }

    /// Segment of the header following this block, with 16-bit wraparound
    /// as on real hardware.
    pub fn next_segment<M: AddressSpace>(self, mem: &M) -> u16 {
        self.segment
            .wrapping_add(self.size(mem))
            .wrapping_add(HEADER_PARAGRAPHS)
    }

    /// Write a complete header in one go.
    pub fn write<M: AddressSpace>(self, mem: &mut M, kind: McbKind, owner: u16, size: u16) {
        self.set_kind(mem, kind);
        self.set_owner(mem, owner);
        self.set_size(mem, size);
    }

    /// Read the header into a plain value.
    pub fn info<M: AddressSpace>(self, mem: &M) -> McbInfo {
        McbInfo {
            segment: self.segment,
            kind: self.kind(mem),
            owner: self.owner(mem),
            size: self.size(mem),
            name: self.name(mem),
        }
    }
}

/// Pad `name` with spaces (or truncate it) to an MCB name field.
pub fn mcb_name(name: &str) -> [u8; NAME_LEN] {
    let mut field = [b' '; NAME_LEN];
    for (dst, src) in field.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    field
}

/// A copy of an MCB header, taken at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McbInfo {
    pub segment: u16,
    pub kind: McbKind,
    pub owner: u16,
    pub size: u16,
    pub name: [u8; NAME_LEN],
}

impl McbInfo {
    pub fn is_free(&self) -> bool {
        self.owner == OWNER_FREE
    }

    /// The printable part of the name.
    pub fn display_name(&self) -> String {
        self.name
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect::<String>()
            .trim_end()
            .to_owned()
    }
}

impl fmt::Display for McbInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.byte();
        let shown = if kind.is_ascii_graphic() { kind as char } else { '?' };
        write!(
            f,
            "Mcb(seg={:#06x}, type={:#04x}({}), owner={:#06x}, size={:#06x}",
            self.segment, kind, shown, self.owner, self.size
        )?;
        let name = self.display_name();
        if !name.is_empty() {
            write!(f, ", name={:?}", name)?;
        }
        write!(f, ")")
    }
}
