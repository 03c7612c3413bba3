//! Translation of logical byte offsets in the reconstructed image into reads of the raw dumps.

use crate::nand::{
    deinterleave, page_offset, Channel, BLOCK_DATA_BYTES, PAGES_PER_BLOCK, PAGE_BYTES,
    PAGE_DATA_BYTES, SECTOR_BYTES,
};
use crate::table::{ForwardMap, PatchStore, SourceId};

/// Which raw dump a chunk is read from
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Source {
    Channel(Channel),
    Patch(SourceId),
}

/// One step of servicing a read. No chunk ever crosses a sector boundary.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Chunk {
    /// The offset is past the end of the image
    End,

    /// The block is unmapped; produce this many zero bytes
    Zero(usize),

    /// Read `len` bytes at `offset` of `source`
    Read {
        source: Source,
        offset: u64,
        len: usize,
    },
}

impl Chunk {
    /// How many bytes this chunk would produce, if fully read
    pub fn len(&self) -> usize {
        match *self {
            Chunk::End => 0,
            Chunk::Zero(len) | Chunk::Read { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Work out where the first chunk of a `len`-byte read at logical `offset` comes from.
///
/// `size` is the size of the image; it must agree with `forward`.
pub fn translate<F>(
    forward: &ForwardMap,
    patches: &PatchStore<F>,
    offset: u64,
    len: usize,
    size: u64,
) -> Chunk {
    if offset >= size {
        return Chunk::End;
    }

    // Clip to the end of the current sector
    let sector_offset = offset % SECTOR_BYTES;
    let len = std::cmp::min(len as u64, SECTOR_BYTES - sector_offset) as usize;

    let block = offset / BLOCK_DATA_BYTES;
    let Some(entry) = forward.get(block) else {
        return Chunk::End;
    };
    if !entry.is_mapped() {
        log::debug!("no mapping for block {block:04x}");
        return Chunk::Zero(len);
    }

    let block_offset = offset % BLOCK_DATA_BYTES;
    let sector = block_offset % PAGE_DATA_BYTES / SECTOR_BYTES;

    if let Some(patch) = patches.lookup(offset) {
        log::trace!(
            "applying patch from source {}, pg {:x} for sector {:x}",
            patch.source.0,
            patch.page,
            patch.sector
        );
        return Chunk::Read {
            source: Source::Patch(patch.source),
            offset: patch.physical_offset(sector, sector_offset),
            len,
        };
    }

    // Page indices within a block are < 512, so this can't truncate
    let page = (block_offset / PAGE_DATA_BYTES) as u32;
    let (channel, plane_page) = deinterleave(page);

    log::trace!(
        "offset {offset:08x} -> block {block:04x} (phys {:04x}, confidence {}), {channel:?}, \
         pg {plane_page:02x}, sec {sector}, secofs {sector_offset:03x}",
        entry.phys,
        entry.confidence,
    );

    let plane_block = u64::from(entry.phys) * (PAGES_PER_BLOCK / 2);
    Chunk::Read {
        source: Source::Channel(channel),
        offset: (plane_block + u64::from(plane_page)) * PAGE_BYTES
            + page_offset(sector, sector_offset),
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::patch::encode_list;
    use crate::table::{ForwardEntry, PatchRecord};

    fn fixture() -> (ForwardMap, PatchStore<()>) {
        let forward = ForwardMap::from_entries(vec![
            ForwardEntry::new(2, 5),
            ForwardEntry::unmapped(),
            ForwardEntry::new(7, 0),
        ]);
        (forward, PatchStore::new())
    }

    #[test]
    fn test_worked_example() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();

        assert_eq!(
            translate(&forward, &patches, 0, 1024, size),
            Chunk::Read {
                source: Source::Channel(Channel::Cs0),
                offset: 4_521_984,
                len: 1024,
            }
        );
    }

    #[test]
    fn test_sector_clipping() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();

        assert_eq!(translate(&forward, &patches, 1000, 4096, size).len(), 24);
        assert_eq!(translate(&forward, &patches, 1024, 4096, size).len(), 1024);
        assert_eq!(translate(&forward, &patches, 1030, 10, size).len(), 10);
    }

    #[test]
    fn test_sectors_skip_spare() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();

        // Third sector of page 0, 5 bytes in
        let Chunk::Read { offset, .. } = translate(&forward, &patches, 2 * 1024 + 5, 1, size)
        else {
            panic!("expected a read");
        };
        assert_eq!(offset, 512 * 8832 + 2 * 1094 + 5);
    }

    #[test]
    fn test_plane_selection() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();
        let block2 = 2 * BLOCK_DATA_BYTES;

        // Logical page 3 of block 2 (phys 7) is page 128 of CS1's half
        assert_eq!(
            translate(&forward, &patches, block2 + 3 * 8192, 1024, size),
            Chunk::Read {
                source: Source::Channel(Channel::Cs1),
                offset: (7 * 256 + 128) * 8832,
                len: 1024,
            }
        );
    }

    #[test]
    fn test_unmapped_block() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();

        let start = BLOCK_DATA_BYTES;
        assert_eq!(translate(&forward, &patches, start, 100, size), Chunk::Zero(100));
        assert_eq!(translate(&forward, &patches, start + 1000, 100, size), Chunk::Zero(24));
    }

    #[test]
    fn test_end_of_image() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();

        assert_eq!(translate(&forward, &patches, size, 100, size), Chunk::End);
        assert_eq!(translate(&forward, &patches, size + 1, 100, size), Chunk::End);
        assert_eq!(translate(&forward, &patches, size - 1, 100, size).len(), 1);
    }

    #[test]
    fn test_patched_group() -> anyhow::Result<()> {
        let (forward, mut patches) = fixture();
        let size = forward.virtual_size();

        // Sector 0x25 sits in 512-byte group 2, covering logical bytes 0x4000..0x6000
        let list = encode_list(&[PatchRecord::new(0x25, 0x11, 1)]);
        patches.load_batch((), &mut &list[..])?;

        assert_eq!(
            translate(&forward, &patches, 0x4000 + 1024 + 3, 2000, size),
            Chunk::Read {
                source: Source::Patch(SourceId(0)),
                offset: 0x11 * 8832 + 1094 + 3,
                len: 1021,
            }
        );

        // Bytes either side of the group still come from the planes
        assert!(matches!(
            translate(&forward, &patches, 0x3FFF, 1, size),
            Chunk::Read {
                source: Source::Channel(_),
                ..
            }
        ));
        assert!(matches!(
            translate(&forward, &patches, 0x6000, 1, size),
            Chunk::Read {
                source: Source::Channel(_),
                ..
            }
        ));

        Ok(())
    }

    #[test]
    fn test_unmapped_beats_patch() -> anyhow::Result<()> {
        let (forward, mut patches) = fixture();
        let size = forward.virtual_size();

        // A patch over the unmapped block is never consulted
        let sector = (BLOCK_DATA_BYTES / 512) as i32;
        let list = encode_list(&[PatchRecord::new(sector, 1, 1)]);
        patches.load_batch((), &mut &list[..])?;

        assert_eq!(
            translate(&forward, &patches, BLOCK_DATA_BYTES, 1024, size),
            Chunk::Zero(1024)
        );
        Ok(())
    }

    #[test]
    fn test_pure() {
        let (forward, patches) = fixture();
        let size = forward.virtual_size();

        for offset in [0, 4095, 8192 * 7 + 3, BLOCK_DATA_BYTES + 9, size - 1, size] {
            let first = translate(&forward, &patches, offset, 777, size);
            let second = translate(&forward, &patches, offset, 777, size);
            assert_eq!(first, second);
        }
    }
}
