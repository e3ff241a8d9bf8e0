//! Front-end of the program loader: reads the program headers of a 32-bit
//! MIPS executable and reports where its segments go.

use crate::param::USERLAND_END;
use crate::platform::{OpenFile, Vfs, VfsError};
use crate::vm::{PGROUNDDOWN, PGROUNDUP, PAGE_SIZE_U32};
use bitflags::bitflags;
use core::fmt;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_MIPS: u16 = 8;
const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    Vfs(VfsError),
    /// The file ended inside a header
    Truncated,
    BadMagic,
    /// Not a 32-bit ELF file of a known byte order and version
    Unsupported,
    NotExecutable,
    WrongMachine,
    /// A second read-only or read-write loadable segment
    TooManySegments,
    /// A segment that is not page aligned, is smaller on disk than in memory,
    /// or reaches past user space
    BadSegment,
}

impl From<VfsError> for ElfError {
    fn from(err: VfsError) -> Self {
        ElfError::Vfs(err)
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::Vfs(err) => write!(f, "reading executable: {err}"),
            ElfError::Truncated => f.write_str("truncated header"),
            ElfError::BadMagic => f.write_str("not an ELF file"),
            ElfError::Unsupported => f.write_str("unsupported ELF class, encoding or version"),
            ElfError::NotExecutable => f.write_str("not an executable"),
            ElfError::WrongMachine => f.write_str("not a MIPS executable"),
            ElfError::TooManySegments => f.write_str("too many loadable segments"),
            ElfError::BadSegment => f.write_str("malformed loadable segment"),
        }
    }
}

/// A loadable segment of an executable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// Offset of the segment contents in the file
    pub location: u32,
    pub vaddr: u32,
    pub file_size: u32,
    pub mem_size: u32,
    /// Number of pages the segment occupies in memory
    pub pages: u32,
}

impl Segment {
    /// First address past the memory image of the segment
    #[must_use]
    pub fn end(&self) -> u32 {
        self.vaddr + self.mem_size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElfInfo {
    pub entry_point: u32,
    /// Read-only segment (text and constants), empty if absent
    pub ro: Segment,
    /// Read-write segment (data and bss), empty if absent
    pub rw: Segment,
}

#[derive(Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, bytes: &[u8], offset: usize) -> u16 {
        let raw = [bytes[offset], bytes[offset + 1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }

    fn u32(self, bytes: &[u8], offset: usize) -> u32 {
        let raw = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }
}

fn read_exact<V: Vfs + ?Sized>(
    vfs: &V,
    file: OpenFile,
    position: u32,
    buffer: &mut [u8],
) -> Result<(), ElfError> {
    vfs.vfs_seek(file, position)?;
    let mut done = 0;
    while done < buffer.len() {
        match vfs.vfs_read(file, &mut buffer[done..])? {
            0 => return Err(ElfError::Truncated),
            read => done += read,
        }
    }
    Ok(())
}

fn segment(order: ByteOrder, phdr: &[u8]) -> Result<Segment, ElfError> {
    let location = order.u32(phdr, 4);
    let vaddr = order.u32(phdr, 8);
    let file_size = order.u32(phdr, 16);
    let mem_size = order.u32(phdr, 20);

    let end = vaddr.checked_add(mem_size).ok_or(ElfError::BadSegment)?;
    if PGROUNDDOWN!(vaddr) != vaddr
        || vaddr < PAGE_SIZE_U32
        || file_size > mem_size
        || end > USERLAND_END
        || location.checked_add(file_size).is_none()
    {
        return Err(ElfError::BadSegment);
    }

    Ok(Segment {
        location,
        vaddr,
        file_size,
        mem_size,
        pages: PGROUNDUP!(end) / PAGE_SIZE_U32 - vaddr / PAGE_SIZE_U32,
    })
}

/// Read the headers of the executable open as `file`
pub fn parse<V: Vfs + ?Sized>(vfs: &V, file: OpenFile) -> Result<ElfInfo, ElfError> {
    let mut ehdr = [0u8; EHDR_SIZE];
    read_exact(vfs, file, 0, &mut ehdr)?;

    if ehdr[..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    let order = match ehdr[5] {
        ELFDATA2LSB => ByteOrder::Little,
        ELFDATA2MSB => ByteOrder::Big,
        _ => return Err(ElfError::Unsupported),
    };
    if ehdr[4] != ELFCLASS32 || order.u32(&ehdr, 20) != EV_CURRENT {
        return Err(ElfError::Unsupported);
    }
    if order.u16(&ehdr, 16) != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if order.u16(&ehdr, 18) != EM_MIPS {
        return Err(ElfError::WrongMachine);
    }

    let entry_point = order.u32(&ehdr, 24);
    let phoff = order.u32(&ehdr, 28);
    let phentsize = u32::from(order.u16(&ehdr, 42));
    let phnum = u32::from(order.u16(&ehdr, 44));
    if (phentsize as usize) < PHDR_SIZE {
        return Err(ElfError::Unsupported);
    }

    let mut info = ElfInfo {
        entry_point,
        ..ElfInfo::default()
    };
    let mut ro_seen = false;
    let mut rw_seen = false;
    for index in 0..phnum {
        let position = index
            .checked_mul(phentsize)
            .and_then(|offset| phoff.checked_add(offset))
            .ok_or(ElfError::Truncated)?;
        let mut phdr = [0u8; PHDR_SIZE];
        read_exact(vfs, file, position, &mut phdr)?;
        if order.u32(&phdr, 0) != PT_LOAD {
            continue;
        }

        let flags = SegmentFlags::from_bits_truncate(order.u32(&phdr, 24));
        let parsed = segment(order, &phdr)?;
        let (slot, seen) = if flags.contains(SegmentFlags::WRITE) {
            (&mut info.rw, &mut rw_seen)
        } else {
            (&mut info.ro, &mut ro_seen)
        };
        if *seen {
            return Err(ElfError::TooManySegments);
        }
        *seen = true;
        *slot = parsed;
    }

    Ok(info)
}
