//! Extended memory pages.
//!
//! XMS blocks are backed by runs of 4 KB pages above the first megabyte.
//! [`PageAllocator`](trait.PageAllocator.html) is the seam the XMS driver
//! allocates through; [`PageMap`](struct.PageMap.html) is the implementation
//! used by the emulator, a table of page owners searched best-fit.

use core::fmt;

use log::{debug, trace};

/// Bytes per page.
pub const PAGE_SIZE: u32 = 4096;
/// First page handed out to XMS: everything below is conventional memory,
/// upper memory and the HMA.
pub const XMS_START_PAGE: u32 = 0x110;

/// A run of allocated pages, identified by its first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    first: u32,
}

impl PageHandle {
    pub const fn new(first: u32) -> Self {
        PageHandle { first }
    }

    pub fn first_page(self) -> u32 {
        self.first
    }

    /// Linear address of the first byte of the run.
    pub fn base(self) -> u32 {
        self.first * PAGE_SIZE
    }
}

/// Allocates runs of contiguous pages.
pub trait PageAllocator {
    /// Allocate `count` contiguous pages. `count` must not be zero.
    fn allocate_pages(&mut self, count: u32) -> Option<PageHandle>;

    fn release_pages(&mut self, handle: PageHandle);

    /// Resize a run to `count` pages (not zero). Returns the same handle when
    /// the run could be resized in place. A different handle means the run
    /// moved: the old pages are released and their contents are the caller's
    /// to copy. On `None`, the old run is untouched.
    fn reallocate_pages(&mut self, handle: PageHandle, count: u32) -> Option<PageHandle>;

    /// Number of pages in a run.
    fn page_count(&self, handle: PageHandle) -> u32;

    /// The longest run of free pages.
    fn free_largest(&self) -> u32;

    fn free_total(&self) -> u32;

    /// Number of pages managed, free or not.
    fn capacity(&self) -> u32;

    /// The page the next single-page allocation would get.
    fn next_free_page(&self) -> Option<u32>;
}

/// A page table recording which run owns each page.
#[derive(Clone, PartialEq, Eq)]
pub struct PageMap {
    first_page: u32,
    // Owner of each page, by first page of its run
    owners: Vec<Option<u32>>,
}

impl PageMap {
    /// Manage pages `first_page..total_pages`.
    pub fn new(total_pages: u32, first_page: u32) -> Self {
        let len = total_pages.saturating_sub(first_page) as usize;
        PageMap {
            first_page,
            owners: vec![None; len],
        }
    }

    pub fn first_page(&self) -> u32 {
        self.first_page
    }

    fn index(&self, page: u32) -> Option<usize> {
        let index = page.checked_sub(self.first_page)? as usize;
        if index < self.owners.len() {
            Some(index)
        } else {
            None
        }
    }

    fn page(&self, index: usize) -> u32 {
        self.first_page + index as u32
    }

    // Runs of free pages, as (start index, length)
    fn free_runs(&self) -> FreeRuns<'_> {
        FreeRuns {
            owners: &self.owners,
            index: 0,
        }
    }

    /// The start of the first free run of exactly `count` pages, or else the
    /// smallest free run longer than that.
    fn best_match(&self, count: u32) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (start, len) in self.free_runs() {
            if len == count {
                return Some(start);
            }
            if len > count && best.map_or(true, |(_, l)| len < l) {
                best = Some((start, len));
            }
        }
        best.map(|(start, _)| start)
    }

    fn assign(&mut self, start: usize, count: u32, owner: Option<u32>) {
        for slot in &mut self.owners[start..start + count as usize] {
            *slot = owner;
        }
    }
}

struct FreeRuns<'a> {
    owners: &'a [Option<u32>],
    index: usize,
}

impl<'a> Iterator for FreeRuns<'a> {
    type Item = (usize, u32);

    fn next(&mut self) -> Option<(usize, u32)> {
        while self.index < self.owners.len() && self.owners[self.index].is_some() {
            self.index += 1;
        }
        if self.index >= self.owners.len() {
            return None;
        }
        let start = self.index;
        while self.index < self.owners.len() && self.owners[self.index].is_none() {
            self.index += 1;
        }
        Some((start, (self.index - start) as u32))
    }
}

impl PageAllocator for PageMap {
    fn allocate_pages(&mut self, count: u32) -> Option<PageHandle> {
        if count == 0 {
            return None;
        }
        let start = self.best_match(count)?;
        let first = self.page(start);
        self.assign(start, count, Some(first));
        trace!("Pages {:#x}+{:#x} allocated", first, count);
        Some(PageHandle::new(first))
    }

    fn release_pages(&mut self, handle: PageHandle) {
        let count = self.page_count(handle);
        if let Some(start) = self.index(handle.first) {
            self.assign(start, count, None);
        }
        trace!("Pages {:#x}+{:#x} released", handle.first, count);
    }

    fn reallocate_pages(&mut self, handle: PageHandle, count: u32) -> Option<PageHandle> {
        let start = self.index(handle.first)?;
        let old = self.page_count(handle);
        if count == 0 || old == 0 {
            return None;
        }

        if count <= old {
            self.assign(start + count as usize, old - count, None);
            return Some(handle);
        }

        // Grow in place when the pages behind the run are free
        let end = start + old as usize;
        let behind = self.owners[end..]
            .iter()
            .take_while(|owner| owner.is_none())
            .count() as u32;
        if behind >= count - old {
            self.assign(end, count - old, Some(handle.first));
            return Some(handle);
        }

        let moved = self.allocate_pages(count)?;
        self.release_pages(handle);
        debug!(
            "Pages {:#x}+{:#x} moved to {:#x}+{:#x}",
            handle.first, old, moved.first, count
        );
        Some(moved)
    }

    fn page_count(&self, handle: PageHandle) -> u32 {
        match self.index(handle.first) {
            Some(start) => self.owners[start..]
                .iter()
                .take_while(|&&owner| owner == Some(handle.first))
                .count() as u32,
            None => 0,
        }
    }

    fn free_largest(&self) -> u32 {
        self.free_runs().map(|(_, len)| len).max().unwrap_or(0)
    }

    fn free_total(&self) -> u32 {
        self.owners.iter().filter(|owner| owner.is_none()).count() as u32
    }

    fn next_free_page(&self) -> Option<u32> {
        self.best_match(1).map(|start| self.page(start))
    }

    fn capacity(&self) -> u32 {
        self.owners.len() as u32
    }
}

impl fmt::Debug for PageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMap")
            .field("first_page", &self.first_page)
            .field("capacity", &self.capacity())
            .field("free_total", &self.free_total())
            .field("free_largest", &self.free_largest())
            .finish()
    }
}
