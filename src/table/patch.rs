//! Patches: overrides that redirect a group of sectors to a page of some alternate recovery dump.
//!
//! Patch lists come in batches, each paired with the dump file its pages refer to. All batches
//! share one table of [PATCH_SLOTS] slots; when two batches patch the same sector, the one with the
//! higher confidence wins, regardless of load order.

use super::LoadError;
use crate::nand::{page_offset, PAGE_BYTES, PATCH_SECTORS_PER_GROUP, PATCH_SECTOR_BYTES};
use crate::util::ReadExt;

use deku::prelude::*;

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

/// Records in every patch list file
pub const LIST_RECORDS: usize = 256;

/// Bytes in every patch list file
pub const LIST_BYTES: usize = LIST_RECORDS * PatchRecord::SIZE;

/// Slots in the combined patch table
pub const PATCH_SLOTS: usize = 2 * LIST_RECORDS;

/// One record of a patch list, as stored on disk
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PatchRecord {
    /// Patched sector, in [PATCH_SECTOR_BYTES] units; 0 ends the list
    pub sector: i32,

    /// Page of the batch's source dump holding the replacement data
    pub page: i32,

    pub confidence: i32,

    /// Unused on disk
    pub reserved: u32,
}

impl PatchRecord {
    /// Size of one record on disk
    pub const SIZE: usize = 16;

    pub fn new(sector: i32, page: i32, confidence: i32) -> Self {
        Self {
            sector,
            page,
            confidence,
            reserved: 0,
        }
    }

    /// Does this record mark the end of the in-use part of its list?
    pub fn is_terminator(&self) -> bool {
        self.sector == 0
    }
}

/// Index of a patch source dump within a [PatchStore]
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub struct SourceId(pub usize);

/// An installed patch
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Patch {
    pub sector: i32,
    pub page: u32,
    pub confidence: i32,
    pub source: SourceId,
}

impl Patch {
    /// Does this patch cover the logical byte at `offset`?
    ///
    /// Patches cover a group of [PATCH_SECTORS_PER_GROUP] sectors of [PATCH_SECTOR_BYTES] each,
    /// which is a different unit than the one the forward map uses.
    pub fn covers(&self, offset: u64) -> bool {
        let group = offset / (PATCH_SECTOR_BYTES * PATCH_SECTORS_PER_GROUP);
        i64::try_from(group).is_ok_and(|group| {
            i64::from(self.sector) / PATCH_SECTORS_PER_GROUP as i64 == group
        })
    }

    /// The logical bytes this patch covers, or None if it cannot cover any
    pub fn covered_range(&self) -> Option<Range<u64>> {
        let group_bytes = PATCH_SECTOR_BYTES * PATCH_SECTORS_PER_GROUP;
        let group = i64::from(self.sector) / PATCH_SECTORS_PER_GROUP as i64;
        let group = u64::try_from(group).ok()?;
        Some(group * group_bytes..(group + 1) * group_bytes)
    }

    /// Offset in the source dump of `sector_offset` bytes into logical sector `sector` of the
    /// patched page
    pub fn physical_offset(&self, sector: u64, sector_offset: u64) -> u64 {
        u64::from(self.page) * PAGE_BYTES + page_offset(sector, sector_offset)
    }
}

/// Counts of what happened to the records of one patch batch
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct BatchSummary {
    /// Records before the terminator
    pub records: usize,

    /// Records that took over a slot
    pub installed: usize,

    /// Records that lost confidence arbitration against an installed patch
    pub rejected: usize,

    /// Records with nowhere to go because the table is full
    pub dropped: usize,

    /// Records that cannot be addressed (negative page)
    pub skipped: usize,
}

/// The combined patch table, plus every source dump any batch was loaded with.
///
/// Source handles are owned here and stay open until the store is dropped, so an installed
/// patch can never outlive the dump it points into.
#[derive(Debug)]
pub struct PatchStore<F> {
    slots: Box<[Option<Patch>]>,
    sources: Vec<F>,
}

impl<F> Default for PatchStore<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> PatchStore<F> {
    pub fn new() -> Self {
        Self {
            slots: vec![None; PATCH_SLOTS].into_boxed_slice(),
            sources: Vec::new(),
        }
    }

    /// Merge one batch into the table.
    ///
    /// `list` must hold exactly [LIST_BYTES] bytes. Anything else means the list is corrupt, and
    /// nothing from it is installed.
    pub fn load_batch<R: Read>(
        &mut self,
        source: F,
        list: &mut R,
    ) -> Result<BatchSummary, LoadError> {
        let bytes = list.read_up_to(LIST_BYTES + 1)?;
        if bytes.len() != LIST_BYTES {
            return Err(LoadError::PatchListSize {
                len: bytes.len(),
                expected: LIST_BYTES,
            });
        }

        let mut records = Vec::with_capacity(LIST_RECORDS);
        for chunk in bytes.chunks_exact(PatchRecord::SIZE) {
            let (_, record) = PatchRecord::from_bytes((chunk, 0))?;
            if record.is_terminator() {
                break;
            }
            records.push(record);
        }

        let id = SourceId(self.sources.len());
        self.sources.push(source);

        let mut summary = BatchSummary {
            records: records.len(),
            ..Default::default()
        };
        for record in records {
            self.install(record, id, &mut summary);
        }

        Ok(summary)
    }

    /// Arbitrate a single record against the table
    fn install(&mut self, record: PatchRecord, source: SourceId, summary: &mut BatchSummary) {
        let Ok(page) = u32::try_from(record.page) else {
            log::warn!(
                "skipping patch for sector {:x}: bad page {}",
                record.sector,
                record.page
            );
            summary.skipped += 1;
            return;
        };

        let slot = self
            .slots
            .iter()
            .position(|x| x.is_some_and(|p| p.sector == record.sector))
            .or_else(|| self.slots.iter().position(Option::is_none));

        let Some(slot) = slot else {
            log::warn!("patch table full, dropping patch for sector {:x}", record.sector);
            summary.dropped += 1;
            return;
        };

        // A free slot behaves as a patch of confidence 0
        let current = self.slots[slot].map_or(0, |p| p.confidence);
        if record.confidence <= current {
            log::debug!(
                "keeping installed patch for sector {:x} (confidence {current} >= {})",
                record.sector,
                record.confidence
            );
            summary.rejected += 1;
            return;
        }

        log::info!(
            "installing patch: sector {:x} -> source {}, pg {:x}",
            record.sector,
            source.0,
            page
        );
        self.slots[slot] = Some(Patch {
            sector: record.sector,
            page,
            confidence: record.confidence,
            source,
        });
        summary.installed += 1;
    }

    /// Find the patch covering the logical byte at `offset`, if any.
    ///
    /// Slots are scanned in order and the first match wins.
    pub fn lookup(&self, offset: u64) -> Option<&Patch> {
        self.iter().find(|p| p.covers(offset))
    }

    /// Installed patches, in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.slots.iter().flatten()
    }

    /// Number of installed patches
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Get the dump a patch reads from
    pub fn source(&self, id: SourceId) -> Option<&F> {
        self.sources.get(id.0)
    }

    /// Number of batches loaded, and thus source dumps held open
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

impl PatchStore<File> {
    /// Open a patch source dump and its patch list, and merge the list into the table
    pub fn open_batch<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        source: P,
        list: Q,
    ) -> Result<BatchSummary, LoadError> {
        let (source, list) = (source.as_ref(), list.as_ref());
        let open = |path: &Path| {
            File::open(path).map_err(|e| LoadError::Open {
                path: path.into(),
                source: e,
            })
        };

        let source_file = open(source)?;
        let mut list_file = open(list)?;

        let summary = self
            .load_batch(source_file, &mut list_file)
            .map_err(|e| e.with_path(list))?;
        log::info!(
            "patch batch {} + {}: {summary:?}",
            source.display(),
            list.display()
        );

        Ok(summary)
    }
}

/// Build the bytes of a patch list file holding `records`, padded out with terminators
#[cfg(test)]
pub(crate) fn encode_list(records: &[PatchRecord]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(LIST_BYTES);
    for record in records
        .iter()
        .copied()
        .chain(std::iter::repeat(PatchRecord::default()))
        .take(LIST_RECORDS)
    {
        bytes.extend(record.to_bytes().unwrap());
    }
    bytes
}

#[test]
fn test_record_layout() -> anyhow::Result<()> {
    let record = PatchRecord::new(0x1234, 7, -2);
    let bytes = record.to_bytes()?;
    assert_eq!(bytes.len(), PatchRecord::SIZE);
    assert_eq!(bytes[..4], [0x34, 0x12, 0, 0]);
    assert_eq!(bytes[4..8], [7, 0, 0, 0]);
    assert_eq!(bytes[8..12], [0xFE, 0xFF, 0xFF, 0xFF]);
    assert_eq!(encode_list(&[record]).len(), LIST_BYTES);
    Ok(())
}

#[test]
fn test_load_batch() -> anyhow::Result<()> {
    let mut store = PatchStore::new();
    let list = encode_list(&[
        PatchRecord::new(0x10, 3, 5),
        PatchRecord::new(0x20, 4, 5),
        PatchRecord::new(0, 0, 0),
        PatchRecord::new(0x30, 5, 5),
    ]);

    let summary = store.load_batch((), &mut &list[..])?;
    assert_eq!(summary.records, 2);
    assert_eq!(summary.installed, 2);
    assert_eq!(store.len(), 2);
    assert_eq!(store.source_count(), 1);

    // Everything after the terminator is ignored
    assert!(store.iter().all(|p| p.sector != 0x30));

    let patch = store.lookup(0x20 / 16 * 8192).unwrap();
    assert_eq!((patch.sector, patch.page), (0x20, 4));
    assert_eq!(patch.source, SourceId(0));

    Ok(())
}

#[test]
fn test_short_list() {
    let mut store = PatchStore::new();
    let list = encode_list(&[PatchRecord::new(0x10, 3, 5)]);

    let err = store.load_batch((), &mut &list[..LIST_BYTES - 1]).unwrap_err();
    assert!(matches!(err, LoadError::PatchListSize { len, .. } if len == LIST_BYTES - 1));

    let mut long = list.clone();
    long.push(0);
    assert!(store.load_batch((), &mut &long[..]).is_err());

    assert!(store.is_empty());
}

#[test]
fn test_confidence_arbitration() -> anyhow::Result<()> {
    let mut store = PatchStore::new();

    let low = encode_list(&[PatchRecord::new(0x40, 1, 3)]);
    let high = encode_list(&[PatchRecord::new(0x40, 2, 9)]);
    let lower = encode_list(&[PatchRecord::new(0x40, 3, 8)]);
    let equal = encode_list(&[PatchRecord::new(0x40, 4, 9)]);

    assert_eq!(store.load_batch("low", &mut &low[..])?.installed, 1);
    assert_eq!(store.load_batch("high", &mut &high[..])?.installed, 1);
    assert_eq!(store.load_batch("lower", &mut &lower[..])?.rejected, 1);
    assert_eq!(store.load_batch("equal", &mut &equal[..])?.rejected, 1);

    // One slot per sector, owned by the most confident batch
    assert_eq!(store.len(), 1);
    let patch = store.lookup(0x40 * 512).unwrap();
    assert_eq!((patch.page, patch.confidence), (2, 9));
    assert_eq!(store.source(patch.source), Some(&"high"));

    // Every batch's source is retained, even the ones that lost
    assert_eq!(store.source_count(), 4);

    Ok(())
}

#[test]
fn test_nonpositive_confidence() -> anyhow::Result<()> {
    let mut store = PatchStore::new();
    let list = encode_list(&[PatchRecord::new(0x10, 1, 0), PatchRecord::new(0x20, 1, -4)]);

    let summary = store.load_batch((), &mut &list[..])?;
    assert_eq!(summary.rejected, 2);
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn test_negative_page() -> anyhow::Result<()> {
    let mut store = PatchStore::new();
    let list = encode_list(&[PatchRecord::new(0x10, -1, 5)]);

    assert_eq!(store.load_batch((), &mut &list[..])?.skipped, 1);
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn test_table_full() -> anyhow::Result<()> {
    let mut store = PatchStore::new();

    // Two full batches fill the table exactly
    for batch in 0..2 {
        let records: Vec<_> = (0..LIST_RECORDS as i32)
            .map(|i| PatchRecord::new(1 + batch * LIST_RECORDS as i32 + i, i, 1))
            .collect();
        let list = encode_list(&records);
        assert_eq!(store.load_batch((), &mut &list[..])?.installed, LIST_RECORDS);
    }
    assert_eq!(store.len(), PATCH_SLOTS);

    // A new sector has nowhere to go, but an existing sector can still be upgraded
    let list = encode_list(&[PatchRecord::new(0x7FFF_0000, 0, 10), PatchRecord::new(1, 99, 10)]);
    let summary = store.load_batch((), &mut &list[..])?;
    assert_eq!((summary.dropped, summary.installed), (1, 1));
    assert_eq!(store.iter().find(|p| p.sector == 1).map(|p| p.page), Some(99));

    Ok(())
}

#[test]
fn test_covers() {
    let patch = Patch {
        sector: 0x35,
        page: 0,
        confidence: 1,
        source: SourceId(0),
    };

    // Sector 0x35 is in 512-byte group 3, i.e. bytes 0x6000..0x8000
    assert_eq!(patch.covered_range(), Some(0x6000..0x8000));
    assert!(!patch.covers(0x5FFF));
    assert!(patch.covers(0x6000));
    assert!(patch.covers(0x7FFF));
    assert!(!patch.covers(0x8000));
}

#[test]
fn test_first_slot_wins() -> anyhow::Result<()> {
    let mut store = PatchStore::new();

    // Different sectors, same 16-sector group
    let list = encode_list(&[PatchRecord::new(0x31, 1, 1), PatchRecord::new(0x32, 2, 1)]);
    store.load_batch((), &mut &list[..])?;

    assert_eq!(store.lookup(0x6000).map(|p| p.sector), Some(0x31));
    assert_eq!(store.lookup(0x8000), None);
    Ok(())
}
