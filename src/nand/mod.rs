//! Geometry of the dual-plane NAND dump, and positioned access to the raw dump files

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Bytes in one physical page, data and spare areas included
pub const PAGE_BYTES: u64 = 8832;

/// Bytes of user data in one logical sector
pub const SECTOR_BYTES: u64 = 1024;

/// Logical sectors stored in one page
pub const SECTORS_PER_PAGE: u64 = 8;

/// Pages in one logical block (the two planes hold half each)
pub const PAGES_PER_BLOCK: u64 = 512;

/// Spare/ECC bytes trailing every sector in a physical page
pub const SPARE_BYTES: u64 = 70;

/// The sector unit that patch lists are addressed in. This is NOT [SECTOR_BYTES].
pub const PATCH_SECTOR_BYTES: u64 = 512;

/// Patch-list sectors covered by a single patch
pub const PATCH_SECTORS_PER_GROUP: u64 = 16;

/// Logical bytes in one page
pub const PAGE_DATA_BYTES: u64 = SECTOR_BYTES * SECTORS_PER_PAGE;

/// Logical bytes in one block, i.e. the span of one forward map entry
pub const BLOCK_DATA_BYTES: u64 = PAGE_DATA_BYTES * PAGES_PER_BLOCK;

/// Stride between consecutive sectors within a physical page
pub const SECTOR_STRIDE: u64 = SECTOR_BYTES + SPARE_BYTES;

/// One of the two flash planes, each dumped to its own file
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Channel {
    Cs0,
    Cs1,
}

impl Channel {
    pub fn index(self) -> usize {
        match self {
            Channel::Cs0 => 0,
            Channel::Cs1 => 1,
        }
    }
}

/// Split a page index within a logical block into the plane holding it and the page index within
/// that plane's half of the block.
///
/// The controller puts even pages in the first half of the block and odd pages in the second
/// half, then stripes the result across the two planes.
pub fn deinterleave(page: u32) -> (Channel, u32) {
    let split = (page >> 1) + ((page & 1) << 8);
    let channel = match split & 1 {
        0 => Channel::Cs0,
        _ => Channel::Cs1,
    };

    (channel, split >> 1)
}

/// Offset of a byte within a physical page, skipping the spare areas of preceding sectors
pub fn page_offset(sector: u64, sector_offset: u64) -> u64 {
    sector * SECTOR_STRIDE + sector_offset
}

/// A read-only source of raw dump bytes that can be read at an explicit offset.
///
/// Implementations must not share a cursor between calls, so a single handle can serve reads
/// from several threads at once.
pub trait ReadAt {
    /// Read up to `buf.len()` bytes starting at `offset`, returning how many were read.
    ///
    /// A return of 0 means the offset is at or past the end of the source.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        loop {
            match FileExt::read_at(self, buf, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                r => return r,
            }
        }
    }
}

/// An in-memory dump, for testing purposes
impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Some(src) = usize::try_from(offset).ok().and_then(|x| self.get(x..)) else {
            return Ok(0);
        };

        let len = std::cmp::min(src.len(), buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        Ok(len)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

#[test]
fn test_deinterleave() {
    assert_eq!(deinterleave(0), (Channel::Cs0, 0));
    assert_eq!(deinterleave(1), (Channel::Cs0, 128));
    assert_eq!(deinterleave(2), (Channel::Cs1, 0));
    assert_eq!(deinterleave(3), (Channel::Cs1, 128));
    assert_eq!(deinterleave(4), (Channel::Cs0, 1));
    assert_eq!(deinterleave(510), (Channel::Cs1, 127));
    assert_eq!(deinterleave(511), (Channel::Cs1, 255));
}

#[test]
fn test_deinterleave_covers_block() {
    // Every page of a block lands on a distinct (channel, page) pair within half a block
    let mut seen = std::collections::HashSet::new();
    for page in 0..PAGES_PER_BLOCK as u32 {
        let (channel, plane_page) = deinterleave(page);
        assert!(u64::from(plane_page) < PAGES_PER_BLOCK / 2);
        assert!(seen.insert((channel, plane_page)));
    }
}

#[test]
fn test_page_layout_fits() {
    // The last sector, data and spare, still fits inside the physical page
    assert!(page_offset(SECTORS_PER_PAGE - 1, SECTOR_BYTES) <= PAGE_BYTES);
    assert_eq!(page_offset(2, 5), 2 * 1094 + 5);
}

#[test]
fn test_mem_read_at() -> io::Result<()> {
    let dump: Vec<u8> = (0..16).collect();
    let mut buf = [0u8; 4];

    assert_eq!(dump.read_at(&mut buf, 2)?, 4);
    assert_eq!(buf, [2, 3, 4, 5]);
    assert_eq!(dump.read_at(&mut buf, 14)?, 2);
    assert_eq!(buf[..2], [14, 15]);
    assert_eq!(dump.read_at(&mut buf, 16)?, 0);
    assert_eq!(dump.read_at(&mut buf, u64::MAX)?, 0);
    Ok(())
}
