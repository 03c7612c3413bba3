//! The forward map: which physical block (if any) holds each logical block.

use super::LoadError;
use crate::nand::BLOCK_DATA_BYTES;

use deku::prelude::*;

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One record of the block table, as stored on disk
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ForwardEntry {
    /// Physical block number within each plane dump
    pub phys: u16,

    /// How sure the block-table builder was about `phys`; negative means unmapped
    pub confidence: i16,
}

impl ForwardEntry {
    /// Size of one record on disk
    pub const SIZE: usize = 4;

    pub fn new(phys: u16, confidence: i16) -> Self {
        Self { phys, confidence }
    }

    /// An entry that maps nowhere; reads from its block are zero-filled
    pub fn unmapped() -> Self {
        Self::new(0, -1)
    }

    pub fn is_mapped(&self) -> bool {
        self.confidence >= 0
    }
}

/// The whole block table, indexed by logical block number
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ForwardMap {
    entries: Box<[ForwardEntry]>,
}

impl ForwardMap {
    pub fn from_entries(entries: impl Into<Box<[ForwardEntry]>>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Parse a complete block table from a reader.
    ///
    /// The input must be a whole number of records; a trailing fragment means the table was
    /// truncated or isn't a block table at all.
    pub fn load<R: Read>(read: &mut R) -> Result<Self, LoadError> {
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes)?;

        if bytes.len() % ForwardEntry::SIZE != 0 {
            return Err(LoadError::RaggedBlockTable {
                len: bytes.len(),
                record: ForwardEntry::SIZE,
            });
        }

        let mut entries = Vec::with_capacity(bytes.len() / ForwardEntry::SIZE);
        for record in bytes.chunks_exact(ForwardEntry::SIZE) {
            let (_, entry) = ForwardEntry::from_bytes((record, 0))?;
            entries.push(entry);
        }

        Ok(Self::from_entries(entries))
    }

    /// Open and parse a block table file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| LoadError::Open {
            path: path.into(),
            source,
        })?;

        let map = Self::load(&mut file).map_err(|e| e.with_path(path))?;
        log::info!(
            "loaded {} block table entries ({} mapped) from {}",
            map.len(),
            map.mapped_count(),
            path.display()
        );

        Ok(map)
    }

    /// Look up the entry for a logical block
    pub fn get(&self, block: u64) -> Option<&ForwardEntry> {
        self.entries.get(usize::try_from(block).ok()?)
    }

    /// Number of logical blocks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForwardEntry> {
        self.entries.iter()
    }

    /// Number of logical blocks with a known physical location
    pub fn mapped_count(&self) -> usize {
        self.iter().filter(|x| x.is_mapped()).count()
    }

    /// Size of the reconstructed image, in bytes
    pub fn virtual_size(&self) -> u64 {
        self.entries.len() as u64 * BLOCK_DATA_BYTES
    }
}

#[test]
fn test_load() -> anyhow::Result<()> {
    let bytes = [0x02, 0x00, 0x05, 0x00, 0x34, 0x12, 0xFF, 0xFF];
    let map = ForwardMap::load(&mut &bytes[..])?;

    assert_eq!(map.len(), 2);
    assert_eq!(map.get(0), Some(&ForwardEntry::new(2, 5)));
    assert_eq!(map.get(1), Some(&ForwardEntry::new(0x1234, -1)));
    assert_eq!(map.get(2), None);
    assert_eq!(map.mapped_count(), 1);
    assert_eq!(map.virtual_size(), 2 * 4 * 1024 * 1024);

    Ok(())
}

#[test]
fn test_load_ragged() {
    let bytes = [0x02, 0x00, 0x05, 0x00, 0x34, 0x12];
    assert!(matches!(
        ForwardMap::load(&mut &bytes[..]),
        Err(LoadError::RaggedBlockTable { len: 6, record: 4 })
    ));
}

#[test]
fn test_load_empty() -> anyhow::Result<()> {
    let map = ForwardMap::load(&mut std::io::empty())?;
    assert!(map.is_empty());
    assert_eq!(map.virtual_size(), 0);
    Ok(())
}

#[test]
fn test_entry_roundtrip() -> anyhow::Result<()> {
    let entry = ForwardEntry::new(0xBEEF, -300);
    let bytes = entry.to_bytes()?;
    assert_eq!(bytes.len(), ForwardEntry::SIZE);
    assert_eq!(ForwardEntry::from_bytes((&bytes[..], 0))?.1, entry);
    Ok(())
}

#[test]
fn test_open_missing() {
    let err = ForwardMap::open("/nonexistent/blocktable.bin").unwrap_err();
    assert!(matches!(err, LoadError::Open { .. }));
    assert!(err.to_string().contains("/nonexistent/blocktable.bin"));
}

#[test]
fn test_open_ragged() -> anyhow::Result<()> {
    let dir = crate::store::tests::scratch_dir("open-ragged")?;
    let path = dir.join("blocktable.bin");
    std::fs::write(&path, [0u8; 6])?;

    let err = ForwardMap::open(&path).unwrap_err();
    assert!(matches!(&err, LoadError::Invalid { path: p, .. } if *p == path));
    assert!(matches!(
        err.cause(),
        LoadError::RaggedBlockTable { len: 6, record: 4 }
    ));

    std::fs::remove_dir_all(dir)?;
    Ok(())
}
