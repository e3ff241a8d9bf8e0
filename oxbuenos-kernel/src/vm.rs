use crate::param::{PAGETABLE_ENTRIES, PAGE_SIZE, USERLAND_END};
use crate::platform::{Platform, ThreadId};
use crate::Kernel;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use log::debug;

/// [`PAGE_SIZE`] in the width of a virtual address
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

macro_rules! PGROUNDUP {
    ($e:expr) => {
        ($e + $crate::vm::PAGE_SIZE_U32 - 1) & !($crate::vm::PAGE_SIZE_U32 - 1)
    };
}

macro_rules! PGROUNDDOWN {
    ($e:expr) => {
        $e & !($crate::vm::PAGE_SIZE_U32 - 1)
    };
}

pub(crate) use PGROUNDDOWN;
pub(crate) use PGROUNDUP;

/// Number of the virtual page pair `vaddr` falls in
#[must_use]
pub const fn vpn2(vaddr: u32) -> u32 {
    vaddr >> 13
}

/// Does `vaddr` lie on the odd page of its page pair?
#[must_use]
pub const fn is_odd_page(vaddr: u32) -> bool {
    vaddr & PAGE_SIZE_U32 != 0
}

#[must_use]
pub const fn is_page_aligned(vaddr: u32) -> bool {
    vaddr & (PAGE_SIZE_U32 - 1) == 0
}

/// A physical page frame, by frame number. Frame 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysFrame(u32);

impl PhysFrame {
    #[must_use]
    pub const fn from_pfn(pfn: u32) -> Self {
        Self(pfn)
    }

    #[must_use]
    pub const fn pfn(self) -> u32 {
        self.0
    }

    /// Physical address of the first byte of this frame
    #[must_use]
    pub const fn addr(self) -> u32 {
        self.0 << 12
    }
}

/// Mapping state of one page of a page pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HalfPage {
    pub valid: bool,
    /// Writable. Stores to a page without it raise a TLB modified exception.
    pub dirty: bool,
    pub pfn: u32,
}

impl HalfPage {
    #[must_use]
    pub const fn frame(&self) -> PhysFrame {
        PhysFrame::from_pfn(self.pfn)
    }
}

/// One page table record: a pair of adjacent virtual pages sharing a tag.
/// The even page starts at `vpn2 << 13`, the odd page one page above it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpn2: u32,
    pub asid: u8,
    pub even: HalfPage,
    pub odd: HalfPage,
}

impl TlbEntry {
    /// The half of this entry that maps `vaddr`
    #[must_use]
    pub fn half(&self, vaddr: u32) -> &HalfPage {
        if is_odd_page(vaddr) {
            &self.odd
        } else {
            &self.even
        }
    }

    fn half_mut(&mut self, vaddr: u32) -> &mut HalfPage {
        if is_odd_page(vaddr) {
            &mut self.odd
        } else {
            &mut self.even
        }
    }

    #[must_use]
    pub fn is_valid_for(&self, vaddr: u32) -> bool {
        self.half(vaddr).valid
    }

    /// Valid halves of this entry, with the virtual address of each page
    pub fn pages(&self) -> impl Iterator<Item = (u32, HalfPage)> {
        let even_vaddr = self.vpn2 << 13;
        [(even_vaddr, self.even), (even_vaddr | PAGE_SIZE_U32, self.odd)]
            .into_iter()
            .filter(|(_, half)| half.valid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The virtual address is not on a page boundary
    Unaligned(u32),
    /// The virtual address lies outside user space
    NotUserAddress(u32),
    /// Every entry of the page table is in use
    TableFull,
    /// The page is mapped already
    Remap(u32),
    /// The page is not mapped
    NotMapped(u32),
    /// No free physical frame was left
    OutOfMemory,
    /// The thread has no page table attached
    NoPagetable,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Unaligned(vaddr) => write!(f, "address 0x{vaddr:08x} is not page aligned"),
            MapError::NotUserAddress(vaddr) => write!(f, "address 0x{vaddr:08x} is outside user space"),
            MapError::TableFull => f.write_str("page table full"),
            MapError::Remap(vaddr) => write!(f, "page 0x{vaddr:08x} is already mapped"),
            MapError::NotMapped(vaddr) => write!(f, "page 0x{vaddr:08x} is not mapped"),
            MapError::OutOfMemory => f.write_str("out of physical frames"),
            MapError::NoPagetable => f.write_str("no page table attached"),
        }
    }
}

/// The resident pages of one process, as even/odd page pair records.
/// The hardware TLB caches entries of this table and is refilled from it.
#[derive(Clone)]
pub struct PageTable {
    asid: u8,
    valid_count: usize,
    entries: [TlbEntry; PAGETABLE_ENTRIES],
}

impl PageTable {
    /// Creates a new, empty page table, located on the heap
    #[must_use]
    pub fn new(asid: u8) -> Box<Self> {
        Box::new(PageTable {
            asid,
            valid_count: 0,
            entries: [TlbEntry::default(); PAGETABLE_ENTRIES],
        })
    }

    #[must_use]
    pub fn asid(&self) -> u8 {
        self.asid
    }

    /// The entries in use, in the order they were created
    #[must_use]
    pub fn entries(&self) -> &[TlbEntry] {
        &self.entries[..self.valid_count]
    }

    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.valid_count
    }

    /// Map the page at `vaddr` to `frame`. `dirty` makes the page writable.
    pub fn map(&mut self, frame: PhysFrame, vaddr: u32, dirty: bool) -> Result<(), MapError> {
        if !is_page_aligned(vaddr) {
            return Err(MapError::Unaligned(vaddr));
        }
        if vaddr >= USERLAND_END {
            return Err(MapError::NotUserAddress(vaddr));
        }

        let index = match self.position(vaddr) {
            Some(index) => index,
            None => {
                if self.valid_count == PAGETABLE_ENTRIES {
                    return Err(MapError::TableFull);
                }
                self.entries[self.valid_count] = TlbEntry {
                    vpn2: vpn2(vaddr),
                    asid: self.asid,
                    ..TlbEntry::default()
                };
                self.valid_count += 1;
                self.valid_count - 1
            }
        };

        let half = self.entries[index].half_mut(vaddr);
        if half.valid {
            return Err(MapError::Remap(vaddr));
        }
        *half = HalfPage {
            valid: true,
            dirty,
            pfn: frame.pfn(),
        };
        Ok(())
    }

    /// Change whether the mapped page at `vaddr` is writable
    pub fn set_dirty(&mut self, vaddr: u32, dirty: bool) -> Result<(), MapError> {
        let index = self.position(vaddr).ok_or(MapError::NotMapped(vaddr))?;
        let half = self.entries[index].half_mut(vaddr);
        if !half.valid {
            return Err(MapError::NotMapped(vaddr));
        }
        half.dirty = dirty;
        Ok(())
    }

    /// The entry whose tag covers `vaddr`, whether or not the page itself is valid
    #[must_use]
    pub fn lookup(&self, vaddr: u32) -> Option<&TlbEntry> {
        self.position(vaddr).map(|index| &self.entries[index])
    }

    /// The mapping of the page holding `vaddr`, if that page is resident
    #[must_use]
    pub fn translate(&self, vaddr: u32) -> Option<HalfPage> {
        self.lookup(vaddr)
            .map(|entry| *entry.half(vaddr))
            .filter(|half| half.valid)
    }

    /// Every frame mapped by this table
    pub fn frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.entries()
            .iter()
            .flat_map(TlbEntry::pages)
            .map(|(_, half)| half.frame())
    }

    fn position(&self, vaddr: u32) -> Option<usize> {
        let tag = vpn2(vaddr);
        self.entries().iter().position(|entry| entry.vpn2 == tag)
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("asid", &self.asid)
            .field("entries", &self.entries())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMemoryError {
    /// The calling thread has no address space
    NoPagetable,
    /// The address is not mapped
    Unmapped(u32),
    /// The address is mapped read-only
    ReadOnly(u32),
    /// A string did not end within the allowed length
    TooLong,
}

impl fmt::Display for UserMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserMemoryError::NoPagetable => f.write_str("no address space"),
            UserMemoryError::Unmapped(vaddr) => write!(f, "0x{vaddr:08x} is not mapped"),
            UserMemoryError::ReadOnly(vaddr) => write!(f, "0x{vaddr:08x} is read-only"),
            UserMemoryError::TooLong => f.write_str("string too long"),
        }
    }
}

impl<P: Platform> Kernel<P> {
    pub(crate) fn get_phys_page(&self) -> Option<PhysFrame> {
        self.frames.alloc(&self.platform)
    }

    /// Release an address space and every frame it maps
    pub(crate) fn vm_destroy_pagetable(&self, pagetable: Box<PageTable>) {
        let mut released = 0;
        for frame in pagetable.frames() {
            self.frames.free(&self.platform, frame);
            released += 1;
        }
        debug!(
            "destroyed page table of asid {}, {released} frames released",
            pagetable.asid()
        );
    }

    /// Run `edit` on the page table attached to `thread`
    pub(crate) fn with_pagetable<R>(
        &self,
        thread: ThreadId,
        edit: impl FnOnce(&mut PageTable) -> R,
    ) -> Option<R> {
        let mut entry = self.thread_table[thread].lock(&self.platform);
        entry.pagetable.as_deref_mut().map(edit)
    }

    /// A copy of the page table of the calling thread
    pub fn current_pagetable(&self) -> Option<Box<PageTable>> {
        let thread = self.platform.current_thread();
        self.thread_table[thread].lock(&self.platform).pagetable.clone()
    }

    /// Map a fresh, zeroed frame at `vaddr` in the address space of `thread`
    pub(crate) fn map_fresh_page(
        &self,
        thread: ThreadId,
        vaddr: u32,
        dirty: bool,
    ) -> Result<PhysFrame, MapError> {
        let frame = self.get_phys_page().ok_or(MapError::OutOfMemory)?;
        let mapped = self
            .with_pagetable(thread, |pagetable| pagetable.map(frame, vaddr, dirty))
            .unwrap_or(Err(MapError::NoPagetable));
        if let Err(err) = mapped {
            self.frames.free(&self.platform, frame);
            return Err(err);
        }
        self.zero_frame(frame);
        debug!("thread {thread}: mapped 0x{vaddr:08x} -> frame {}", frame.pfn());
        Ok(frame)
    }

    pub(crate) fn zero_frame(&self, frame: PhysFrame) {
        // SAFETY: the frame came from the allocator and is owned by one page table
        unsafe { self.platform.frame_mut(frame) }.fill(0);
    }

    /// Copy the contents of `source` into `destination`
    pub(crate) fn copy_frame(&self, destination: PhysFrame, source: PhysFrame) {
        assert_ne!(destination, source, "copy_frame: same frame");
        // SAFETY: two distinct frames, each owned by exactly one page table
        let (destination, source) = unsafe {
            (
                self.platform.frame_mut(destination),
                &*self.platform.frame_mut(source),
            )
        };
        destination.copy_from_slice(source);
    }

    /// Walk the user range `vaddr..vaddr + len` of `thread` page by page.
    /// `visit` gets the frame, the offset in that frame, and the matching range of the buffer.
    fn walk_user_range(
        &self,
        thread: ThreadId,
        vaddr: u32,
        len: usize,
        writing: bool,
        mut visit: impl FnMut(PhysFrame, usize, Range<usize>),
    ) -> Result<(), UserMemoryError> {
        let mut done = 0;
        while done < len {
            let addr = u32::try_from(done)
                .ok()
                .and_then(|done| vaddr.checked_add(done))
                .ok_or(UserMemoryError::Unmapped(vaddr))?;
            let offset = (addr % PAGE_SIZE_U32) as usize;
            let chunk = core::cmp::min(PAGE_SIZE - offset, len - done);
            let half = self
                .with_pagetable(thread, |pagetable| pagetable.translate(addr))
                .ok_or(UserMemoryError::NoPagetable)?
                .ok_or(UserMemoryError::Unmapped(addr))?;
            if writing && !half.dirty {
                return Err(UserMemoryError::ReadOnly(addr));
            }
            visit(half.frame(), offset, done..done + chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Write into the address space of `thread` regardless of page protection
    pub(crate) fn write_user_unchecked(
        &self,
        thread: ThreadId,
        vaddr: u32,
        data: &[u8],
    ) -> Result<(), UserMemoryError> {
        self.walk_user_range(thread, vaddr, data.len(), false, |frame, offset, range| {
            // SAFETY: the frame belongs to the page table of `thread`
            let page = unsafe { self.platform.frame_mut(frame) };
            page[offset..offset + range.len()].copy_from_slice(&data[range]);
        })
    }

    /// Copy `data` to user memory of the calling thread. Every touched page must be writable.
    pub fn copy_to_user(&self, vaddr: u32, data: &[u8]) -> Result<(), UserMemoryError> {
        let thread = self.platform.current_thread();
        self.walk_user_range(thread, vaddr, data.len(), true, |frame, offset, range| {
            // SAFETY: the frame belongs to the page table of the calling thread
            let page = unsafe { self.platform.frame_mut(frame) };
            page[offset..offset + range.len()].copy_from_slice(&data[range]);
        })
    }

    /// Fill `buffer` from user memory of the calling thread
    pub fn copy_from_user(&self, vaddr: u32, buffer: &mut [u8]) -> Result<(), UserMemoryError> {
        let thread = self.platform.current_thread();
        self.walk_user_range(thread, vaddr, buffer.len(), false, |frame, offset, range| {
            // SAFETY: the frame belongs to the page table of the calling thread
            let page = unsafe { self.platform.frame_mut(frame) };
            let len = range.len();
            buffer[range].copy_from_slice(&page[offset..offset + len]);
        })
    }

    /// Read a NUL-terminated string of at most `max_len` bytes (terminator excluded)
    pub fn copy_string_from_user(
        &self,
        vaddr: u32,
        max_len: usize,
    ) -> Result<Vec<u8>, UserMemoryError> {
        let mut string = Vec::new();
        let mut addr = vaddr;
        loop {
            let mut byte = [0u8; 1];
            self.copy_from_user(addr, &mut byte)?;
            if byte[0] == 0 {
                return Ok(string);
            }
            if string.len() == max_len {
                return Err(UserMemoryError::TooLong);
            }
            string.push(byte[0]);
            addr = addr.checked_add(1).ok_or(UserMemoryError::Unmapped(addr))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(PGROUNDUP!(0x1001_u32), 0x2000);
        assert_eq!(PGROUNDUP!(0x2000_u32), 0x2000);
        assert_eq!(PGROUNDDOWN!(0x2fff_u32), 0x2000);
    }

    #[test]
    fn even_and_odd_pages_share_one_entry() {
        let mut pagetable = PageTable::new(3);
        pagetable.map(PhysFrame::from_pfn(10), 0x0040_0000, true).unwrap();
        pagetable.map(PhysFrame::from_pfn(11), 0x0040_1000, false).unwrap();

        assert_eq!(pagetable.valid_count(), 1);
        let entry = pagetable.entries()[0];
        assert_eq!(entry.vpn2, 0x0040_0000 >> 13);
        assert_eq!(entry.asid, 3);
        assert_eq!(
            entry.even,
            HalfPage {
                valid: true,
                dirty: true,
                pfn: 10
            }
        );
        assert_eq!(
            entry.odd,
            HalfPage {
                valid: true,
                dirty: false,
                pfn: 11
            }
        );
    }

    #[test]
    fn odd_page_alone_leaves_even_invalid() {
        let mut pagetable = PageTable::new(0);
        pagetable.map(PhysFrame::from_pfn(7), 0x0001_3000, true).unwrap();
        let entry = pagetable.lookup(0x0001_2000).unwrap();
        assert!(!entry.is_valid_for(0x0001_2000));
        assert!(entry.is_valid_for(0x0001_3abc));
        assert_eq!(pagetable.translate(0x0001_2000), None);
        assert_eq!(pagetable.translate(0x0001_3abc).map(|half| half.pfn), Some(7));
    }

    #[test]
    fn map_rejects_bad_requests() {
        let mut pagetable = PageTable::new(0);
        assert_eq!(
            pagetable.map(PhysFrame::from_pfn(1), 0x1234, true),
            Err(MapError::Unaligned(0x1234))
        );
        assert_eq!(
            pagetable.map(PhysFrame::from_pfn(1), USERLAND_END, true),
            Err(MapError::NotUserAddress(USERLAND_END))
        );
        pagetable.map(PhysFrame::from_pfn(1), 0x2000, true).unwrap();
        assert_eq!(
            pagetable.map(PhysFrame::from_pfn(2), 0x2000, true),
            Err(MapError::Remap(0x2000))
        );
    }

    #[test]
    fn table_fills_up() {
        let mut pagetable = PageTable::new(0);
        for i in 0..PAGETABLE_ENTRIES as u32 {
            pagetable
                .map(PhysFrame::from_pfn(i + 1), i * 2 * PAGE_SIZE_U32, true)
                .unwrap();
        }
        assert_eq!(
            pagetable.map(PhysFrame::from_pfn(9999), 0x7000_0000, true),
            Err(MapError::TableFull)
        );
        // The odd half of an existing pair still fits.
        pagetable
            .map(PhysFrame::from_pfn(9999), PAGE_SIZE_U32, true)
            .unwrap();
    }

    #[test]
    fn set_dirty_toggles_write_permission() {
        let mut pagetable = PageTable::new(0);
        pagetable.map(PhysFrame::from_pfn(4), 0x0040_0000, true).unwrap();
        pagetable.set_dirty(0x0040_0000, false).unwrap();
        assert!(!pagetable.translate(0x0040_0010).unwrap().dirty);
        assert_eq!(
            pagetable.set_dirty(0x0040_1000, false),
            Err(MapError::NotMapped(0x0040_1000))
        );
        assert_eq!(
            pagetable.set_dirty(0x0050_0000, false),
            Err(MapError::NotMapped(0x0050_0000))
        );
    }

    #[test]
    fn frames_lists_every_valid_half() {
        let mut pagetable = PageTable::new(0);
        pagetable.map(PhysFrame::from_pfn(5), 0x0000_4000, true).unwrap();
        pagetable.map(PhysFrame::from_pfn(6), 0x0000_5000, true).unwrap();
        pagetable.map(PhysFrame::from_pfn(8), 0x0001_1000, true).unwrap();
        let mut frames: Vec<u32> = pagetable.frames().map(PhysFrame::pfn).collect();
        frames.sort_unstable();
        assert_eq!(frames, [5, 6, 8]);
    }
}
