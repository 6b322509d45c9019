//! The XMS driver: extended memory handles.
//!
//! Every handle owns a contiguous run of pages from a
//! [`PageAllocator`](../pages/trait.PageAllocator.html). Handle 0 is never
//! handed out: in a move descriptor it stands for a real-mode pointer into
//! conventional memory.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info};
use static_assertions::const_assert_eq;

use crate::a20::A20Gate;
use crate::error::XmsError;
use crate::guest::{AddressSpace, RealPtr};
use crate::pages::{PageAllocator, PageHandle, PAGE_SIZE};

/// Handles, including the unusable handle 0.
pub const XMS_HANDLES: usize = 50;

/// Moves to or from a real-mode pointer must end below this address.
pub const REAL_MODE_LIMIT: u32 = 0x10_fff0;

/// Pages needed to hold `kb` kilobytes.
pub fn kb_to_pages(kb: u32) -> u32 {
    kb / 4 + if kb & 3 != 0 { 1 } else { 0 }
}

/// The extended memory move structure a client points DS:SI at for
/// function 0Bh.
///
/// | offset | size | field                                |
/// |--------|------|--------------------------------------|
/// | 0      | 4    | length in bytes                      |
/// | 4      | 2    | source handle                        |
/// | 6      | 4    | source offset, or seg:off for handle 0 |
/// | 10     | 2    | destination handle                   |
/// | 12     | 4    | destination offset, or seg:off       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveDescriptor {
    pub length: u32,
    pub src_handle: u16,
    pub src_offset: u32,
    pub dest_handle: u16,
    pub dest_offset: u32,
}

const LENGTH_OFFSET: usize = 0;
const SRC_HANDLE_OFFSET: usize = 4;
const SRC_OFFSET_OFFSET: usize = 6;
const DEST_HANDLE_OFFSET: usize = 10;
const DEST_OFFSET_OFFSET: usize = 12;
/// Size of the packed move structure.
pub const MOVE_DESCRIPTOR_LEN: usize = 16;
const_assert_eq!(DEST_OFFSET_OFFSET + 4, MOVE_DESCRIPTOR_LEN);

impl MoveDescriptor {
    pub fn from_bytes(bytes: &[u8; MOVE_DESCRIPTOR_LEN]) -> Self {
        MoveDescriptor {
            length: LittleEndian::read_u32(&bytes[LENGTH_OFFSET..]),
            src_handle: LittleEndian::read_u16(&bytes[SRC_HANDLE_OFFSET..]),
            src_offset: LittleEndian::read_u32(&bytes[SRC_OFFSET_OFFSET..]),
            dest_handle: LittleEndian::read_u16(&bytes[DEST_HANDLE_OFFSET..]),
            dest_offset: LittleEndian::read_u32(&bytes[DEST_OFFSET_OFFSET..]),
        }
    }

    pub fn to_bytes(&self) -> [u8; MOVE_DESCRIPTOR_LEN] {
        let mut bytes = [0; MOVE_DESCRIPTOR_LEN];
        LittleEndian::write_u32(&mut bytes[LENGTH_OFFSET..], self.length);
        LittleEndian::write_u16(&mut bytes[SRC_HANDLE_OFFSET..], self.src_handle);
        LittleEndian::write_u32(&mut bytes[SRC_OFFSET_OFFSET..], self.src_offset);
        LittleEndian::write_u16(&mut bytes[DEST_HANDLE_OFFSET..], self.dest_handle);
        LittleEndian::write_u32(&mut bytes[DEST_OFFSET_OFFSET..], self.dest_offset);
        bytes
    }

    /// Decode the structure from guest memory at linear `addr`.
    pub fn read<M: AddressSpace>(mem: &M, addr: u32) -> Self {
        let mut bytes = [0; MOVE_DESCRIPTOR_LEN];
        mem.read_bytes(addr, &mut bytes);
        Self::from_bytes(&bytes)
    }

    pub fn write<M: AddressSpace>(&self, mem: &mut M, addr: u32) {
        mem.write_bytes(addr, &self.to_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct XmsBlock {
    size_kb: u32,
    backing: Option<PageHandle>,
    base: u32,
    lock_count: u8,
    free: bool,
}

impl XmsBlock {
    const FREE: XmsBlock = XmsBlock {
        size_kb: 0,
        backing: None,
        base: 0,
        lock_count: 0,
        free: true,
    };

    // Handle 0
    const RESERVED: XmsBlock = XmsBlock {
        free: false,
        ..XmsBlock::FREE
    };
}

/// What function 0Eh reports about a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub lock_count: u8,
    pub free_handles: u8,
    pub size_kb: u32,
}

/// The XMS handle table.
#[derive(Debug, Clone)]
pub struct XmsManager<P> {
    pages: P,
    handles: Vec<XmsBlock>,
    zero_on_allocate: bool,
}

impl<P: PageAllocator> XmsManager<P> {
    /// `handles` counts handle 0, so `handles - 1` can be allocated.
    pub fn new(pages: P, handles: usize) -> Self {
        let mut table = vec![XmsBlock::FREE; handles.max(1)];
        table[0] = XmsBlock::RESERVED;
        XmsManager {
            pages,
            handles: table,
            zero_on_allocate: false,
        }
    }

    pub fn set_zero_on_allocate(&mut self, zero: bool) {
        self.zero_on_allocate = zero;
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }

    /// Number of handles, handle 0 included.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn free_handles(&self) -> usize {
        self.handles.iter().filter(|h| h.free).count()
    }

    /// Handles in use, with their sizes in kilobytes.
    pub fn allocated(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        self.handles
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, h)| !h.free)
            .map(|(i, h)| (i as u16, h.size_kb))
    }

    fn block(&self, handle: u16) -> Option<&XmsBlock> {
        match self.handles.get(handle as usize) {
            Some(block) if handle != 0 && !block.free => Some(block),
            _ => None,
        }
    }

    fn block_mut(&mut self, handle: u16) -> Result<&mut XmsBlock, XmsError> {
        match self.handles.get_mut(handle as usize) {
            Some(block) if handle != 0 && !block.free => Ok(block),
            _ => Err(XmsError::InvalidHandle),
        }
    }

    fn zero<M: AddressSpace>(&self, mem: &mut M, base: u32, pages: u32) {
        if self.zero_on_allocate && pages > 0 {
            mem.fill(base, pages * PAGE_SIZE, 0);
        }
    }

    // Where a block without pages says it lives
    fn empty_base(&self) -> u32 {
        match self.pages.next_free_page() {
            Some(page) => page * PAGE_SIZE,
            None => {
                error!("XMS: allocating zero pages with no memory left");
                0
            }
        }
    }

    /// Function 08h: the largest free block and the total free memory, both
    /// in kilobytes.
    pub fn query_free(&self) -> Result<(u32, u32), XmsError> {
        let total = self.pages.free_total() * 4;
        let largest = self.pages.free_largest() * 4;
        if total == 0 {
            return Err(XmsError::OutOfSpace);
        }
        Ok((largest, total))
    }

    /// Function 09h.
    pub fn allocate<M: AddressSpace>(&mut self, mem: &mut M, size_kb: u32) -> Result<u16, XmsError> {
        let index = self
            .handles
            .iter()
            .position(|h| h.free)
            .ok_or(XmsError::OutOfHandles)?;

        let (backing, base) = if size_kb != 0 {
            let pages = kb_to_pages(size_kb);
            let backing = self.pages.allocate_pages(pages).ok_or(XmsError::OutOfSpace)?;
            self.zero(mem, backing.base(), pages);
            (Some(backing), backing.base())
        } else {
            (None, self.empty_base())
        };

        self.handles[index] = XmsBlock {
            size_kb,
            backing,
            base,
            lock_count: 0,
            free: false,
        };
        debug!("XMS handle {} allocated: {}K at {:#x}", index, size_kb, base);
        Ok(index as u16)
    }

    /// Function 0Ah.
    pub fn free(&mut self, handle: u16) -> Result<(), XmsError> {
        let block = self.block_mut(handle)?;
        if block.lock_count > 0 {
            return Err(XmsError::BlockLocked);
        }
        let backing = block.backing;
        *block = XmsBlock::FREE;
        if let Some(backing) = backing {
            self.pages.release_pages(backing);
        }
        debug!("XMS handle {} freed", handle);
        Ok(())
    }

    // The linear address and size of one side of a move
    fn resolve(&self, handle: u16, offset: u32, length: u32, source: bool) -> Result<u32, XmsError> {
        let (bad_handle, bad_offset) = if source {
            (XmsError::InvalidSrcHandle, XmsError::InvalidSrcOffset)
        } else {
            (XmsError::InvalidDestHandle, XmsError::InvalidDestOffset)
        };

        if handle == 0 {
            let addr = RealPtr::from_packed(offset).linear();
            if addr as u64 + length as u64 > REAL_MODE_LIMIT as u64 {
                return Err(XmsError::InvalidLength);
            }
            return Ok(addr);
        }

        let block = self.block(handle).ok_or(bad_handle)?;
        let size = block.size_kb as u64 * 1024;
        if offset as u64 >= size {
            return Err(bad_offset);
        }
        if length as u64 > size - offset as u64 {
            return Err(XmsError::InvalidLength);
        }
        Ok(block.base + offset)
    }

    /// Function 0Bh. The A20 line is on for the duration of the copy, and
    /// back in its old state afterwards.
    pub fn move_memory<M: AddressSpace>(
        &self,
        mem: &mut M,
        a20: &mut A20Gate,
        desc: &MoveDescriptor,
    ) -> Result<(), XmsError> {
        if desc.length & 1 != 0 {
            return Err(XmsError::ParityError);
        }
        let src = self.resolve(desc.src_handle, desc.src_offset, desc.length, true)?;
        let dest = self.resolve(desc.dest_handle, desc.dest_offset, desc.length, false)?;

        let was_enabled = a20.is_enabled();
        let counted = a20.enable_local().is_ok();
        // Outstanding local enables do not stop the guest switching the line
        // off through the port
        if !a20.is_enabled() {
            a20.set_line(true);
        }

        // Forward, a byte at a time: overlapping moves repeat the pattern
        // the way the hardware copy loop does.
        for i in 0..desc.length {
            let byte = mem.read_u8(a20.mask(src.wrapping_add(i)));
            mem.write_u8(a20.mask(dest.wrapping_add(i)), byte);
        }

        if counted {
            if let Err(e) = a20.disable_local() {
                error!("XMS move could not release A20: {}", e);
            }
        }
        if a20.is_enabled() != was_enabled {
            a20.set_line(was_enabled);
        }
        Ok(())
    }

    /// Function 0Ch: returns the linear address of the block.
    pub fn lock(&mut self, handle: u16) -> Result<u32, XmsError> {
        let block = self.block_mut(handle)?;
        if block.lock_count == u8::MAX {
            return Err(XmsError::LockCountOverflow);
        }
        block.lock_count += 1;
        Ok(block.base)
    }

    /// Function 0Dh.
    pub fn unlock(&mut self, handle: u16) -> Result<(), XmsError> {
        let block = self.block_mut(handle)?;
        if block.lock_count == 0 {
            return Err(XmsError::BlockNotLocked);
        }
        block.lock_count -= 1;
        Ok(())
    }

    /// Function 0Eh.
    pub fn handle_info(&self, handle: u16) -> Result<HandleInfo, XmsError> {
        let block = self.block(handle).ok_or(XmsError::InvalidHandle)?;
        Ok(HandleInfo {
            lock_count: block.lock_count,
            free_handles: self.free_handles().min(u8::MAX as usize) as u8,
            size_kb: block.size_kb,
        })
    }

    /// Function 0Fh. Blocks grow in place when they can, and are moved
    /// (contents included) when they cannot.
    pub fn resize<M: AddressSpace>(
        &mut self,
        mem: &mut M,
        handle: u16,
        size_kb: u32,
    ) -> Result<(), XmsError> {
        let block = *self.block(handle).ok_or(XmsError::InvalidHandle)?;
        if block.lock_count > 0 {
            return Err(XmsError::BlockLocked);
        }

        let pages = kb_to_pages(size_kb);
        let old_pages = block.backing.map_or(0, |b| self.pages.page_count(b));
        let backing = match block.backing {
            None if pages == 0 => None,
            None => {
                let backing = self.pages.allocate_pages(pages).ok_or(XmsError::OutOfSpace)?;
                self.zero(mem, backing.base(), pages);
                Some(backing)
            }
            Some(old) if pages == 0 => {
                self.pages.release_pages(old);
                None
            }
            Some(old) => {
                let new = self
                    .pages
                    .reallocate_pages(old, pages)
                    .ok_or(XmsError::OutOfSpace)?;
                if new != old {
                    copy(mem, old.base(), new.base(), old_pages.min(pages) * PAGE_SIZE);
                }
                if pages > old_pages {
                    self.zero(mem, new.base() + old_pages * PAGE_SIZE, pages - old_pages);
                }
                Some(new)
            }
        };

        let base = match backing {
            Some(backing) => backing.base(),
            None => self.empty_base(),
        };
        let entry = &mut self.handles[handle as usize];
        entry.backing = backing;
        entry.base = base;
        entry.size_kb = size_kb;
        debug!("XMS handle {} resized to {}K at {:#x}", handle, size_kb, base);
        Ok(())
    }

    /// Release every handle, locked or not.
    pub fn reset(&mut self) {
        for index in 1..self.handles.len() {
            if let Some(backing) = self.handles[index].backing {
                self.pages.release_pages(backing);
            }
            self.handles[index] = XmsBlock::FREE;
        }
        info!("XMS handles reset");
    }
}

fn copy<M: AddressSpace>(mem: &mut M, from: u32, to: u32, len: u32) {
    let mut buf = vec![0; PAGE_SIZE as usize];
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(PAGE_SIZE) as usize;
        mem.read_bytes(from + done, &mut buf[..chunk]);
        mem.write_bytes(to + done, &buf[..chunk]);
        done += chunk as u32;
    }
}
