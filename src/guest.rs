//! Access to emulated guest RAM.
//!
//! Everything in this crate reads and writes guest memory through the
//! [`AddressSpace`](trait.AddressSpace.html) trait, using flat linear
//! addresses. DOS hands out 16-bit segments, so the helpers here convert
//! between the two representations exactly as the hardware does.

use byteorder::{ByteOrder, LittleEndian};

/// Size of a paragraph, the granularity of segment addressing.
pub const PARAGRAPH: u32 = 16;

/// The value read from addresses that are not backed by RAM.
pub const OPEN_BUS: u8 = 0xff;

/// Linear address of the first byte of `segment`.
pub const fn segment_to_linear(segment: u16) -> u32 {
    (segment as u32) << 4
}

/// A real-mode far pointer, packed the way DOS stores it in memory: offset
/// in the low word, segment in the high word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealPtr {
    pub segment: u16,
    pub offset: u16,
}

impl RealPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        RealPtr { segment, offset }
    }

    pub fn from_packed(packed: u32) -> Self {
        RealPtr {
            segment: (packed >> 16) as u16,
            offset: packed as u16,
        }
    }

    pub fn packed(self) -> u32 {
        ((self.segment as u32) << 16) | self.offset as u32
    }

    /// The 20-bit (21 with A20) physical address this pointer refers to.
    pub fn linear(self) -> u32 {
        segment_to_linear(self.segment) + self.offset as u32
    }
}

/// Byte, word and dword access into guest memory.
///
/// Implementations must never panic on bad addresses: guest programs are
/// free to hand us garbage, and corrupt MCB chains regularly point outside
/// of RAM.
pub trait AddressSpace {
    /// Number of bytes of RAM backing this address space.
    fn size(&self) -> u32;

    fn read_u8(&self, addr: u32) -> u8;
    fn write_u8(&mut self, addr: u32, value: u8);

    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        let bytes = value.to_le_bytes();
        self.write_u8(addr, bytes[0]);
        self.write_u8(addr.wrapping_add(1), bytes[1]);
    }

    fn read_u32(&self, addr: u32) -> u32 {
        self.read_u16(addr) as u32 | (self.read_u16(addr.wrapping_add(2)) as u32) << 16
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_u16(addr, value as u16);
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
    }

    fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(addr.wrapping_add(i as u32));
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), b);
        }
    }

    fn fill(&mut self, addr: u32, len: u32, value: u8) {
        for i in 0..len {
            self.write_u8(addr.wrapping_add(i), value);
        }
    }
}

/// Flat guest RAM, starting at linear address 0.
#[derive(Clone)]
pub struct GuestRam {
    bytes: Vec<u8>,
}

impl GuestRam {
    /// Create `size` bytes of zeroed RAM.
    pub fn new(size: u32) -> Self {
        GuestRam {
            bytes: vec![0; size as usize],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    // The range for a `len`-byte access at `addr`, if it lies entirely in RAM.
    fn span(&self, addr: u32, len: usize) -> Option<core::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(len)?;
        if end <= self.bytes.len() {
            Some(start..end)
        } else {
            None
        }
    }
}

impl core::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GuestRam({} KB)", self.bytes.len() / 1024)
    }
}

impl AddressSpace for GuestRam {
    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read_u8(&self, addr: u32) -> u8 {
        match self.bytes.get(addr as usize) {
            Some(&b) => b,
            None => {
                log::trace!("read from unbacked address {:#x}", addr);
                OPEN_BUS
            }
        }
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        match self.bytes.get_mut(addr as usize) {
            Some(b) => *b = value,
            None => log::trace!("dropped write of {:#04x} to {:#x}", value, addr),
        }
    }

    fn read_u16(&self, addr: u32) -> u16 {
        match self.span(addr, 2) {
            Some(r) => LittleEndian::read_u16(&self.bytes[r]),
            None => u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))]),
        }
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        match self.span(addr, 2) {
            Some(r) => LittleEndian::write_u16(&mut self.bytes[r], value),
            None => {
                let bytes = value.to_le_bytes();
                self.write_u8(addr, bytes[0]);
                self.write_u8(addr.wrapping_add(1), bytes[1]);
            }
        }
    }

    fn read_u32(&self, addr: u32) -> u32 {
        match self.span(addr, 4) {
            Some(r) => LittleEndian::read_u32(&self.bytes[r]),
            None => self.read_u16(addr) as u32 | (self.read_u16(addr.wrapping_add(2)) as u32) << 16,
        }
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        match self.span(addr, 4) {
            Some(r) => LittleEndian::write_u32(&mut self.bytes[r], value),
            None => {
                self.write_u16(addr, value as u16);
                self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
            }
        }
    }

    fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        match self.span(addr, buf.len()) {
            Some(r) => buf.copy_from_slice(&self.bytes[r]),
            None => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.read_u8(addr.wrapping_add(i as u32));
                }
            }
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        match self.span(addr, data.len()) {
            Some(r) => self.bytes[r].copy_from_slice(data),
            None => {
                for (i, &b) in data.iter().enumerate() {
                    self.write_u8(addr.wrapping_add(i as u32), b);
                }
            }
        }
    }

    fn fill(&mut self, addr: u32, len: u32, value: u8) {
        match self.span(addr, len as usize) {
            Some(r) => {
                for b in &mut self.bytes[r] {
                    *b = value;
                }
            }
            None => {
                for i in 0..len {
                    self.write_u8(addr.wrapping_add(i), value);
                }
            }
        }
    }
}
