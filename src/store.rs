//! Everything needed to reconstruct the image, loaded once at startup and read-only afterwards.

use crate::nand::ReadAt;
use crate::table::{ForwardMap, LoadError, PatchStore};
use crate::translate::{translate, Chunk, Source};

use std::fs::File;
use std::path::Path;

/// The forward map, the patch table, and the handles of every dump they refer to.
///
/// Nothing in here changes once built, so a shared reference can serve reads from any number of
/// threads as long as `F` can.
#[derive(Debug)]
pub struct Store<F> {
    forward: ForwardMap,
    patches: PatchStore<F>,
    channels: [F; 2],
    size: u64,
}

impl<F> Store<F> {
    pub fn new(forward: ForwardMap, channels: [F; 2], patches: PatchStore<F>) -> Self {
        let size = forward.virtual_size();
        Self {
            forward,
            patches,
            channels,
            size,
        }
    }

    /// Size of the reconstructed image, in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn forward(&self) -> &ForwardMap {
        &self.forward
    }

    pub fn patches(&self) -> &PatchStore<F> {
        &self.patches
    }

    /// Work out where the next chunk of a read comes from
    pub fn translate(&self, offset: u64, len: usize) -> Chunk {
        translate(&self.forward, &self.patches, offset, len, self.size)
    }

    /// Get the handle of a dump
    pub fn source(&self, source: Source) -> Option<&F> {
        match source {
            Source::Channel(channel) => self.channels.get(channel.index()),
            Source::Patch(id) => self.patches.source(id),
        }
    }
}

impl<F: ReadAt> Store<F> {
    /// Execute a single chunk into the front of `buf`, returning the bytes produced.
    ///
    /// Any failure to read is reported as 0 bytes, i.e. end of data.
    pub fn read_chunk(&self, chunk: Chunk, buf: &mut [u8]) -> usize {
        match chunk {
            Chunk::End => 0,
            Chunk::Zero(len) => {
                buf[..len].fill(0);
                len
            }
            Chunk::Read {
                source,
                offset,
                len,
            } => {
                let Some(file) = self.source(source) else {
                    log::warn!("no dump for {source:?}");
                    return 0;
                };

                match file.read_at(&mut buf[..len], offset) {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("reading {len} bytes at {offset:#x} of {source:?}: {e}");
                        0
                    }
                }
            }
        }
    }
}

impl Store<File> {
    /// Open the block table and both plane dumps, then merge every patch batch, in order
    pub fn open<P, Q, R>(
        blocktable: P,
        channels: [Q; 2],
        batches: impl IntoIterator<Item = (R, R)>,
    ) -> Result<Self, LoadError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        let forward = ForwardMap::open(blocktable)?;

        let open = |path: &Q| {
            let path = path.as_ref();
            File::open(path).map_err(|source| LoadError::Open {
                path: path.into(),
                source,
            })
        };
        let [cs0, cs1] = &channels;
        let channels = [open(cs0)?, open(cs1)?];

        let mut patches = PatchStore::new();
        for (source, list) in batches {
            patches.open_batch(source, list)?;
        }
        if patches.source_count() > 0 {
            log::info!(
                "{} patches in effect from {} batches",
                patches.len(),
                patches.source_count()
            );
        }

        let store = Self::new(forward, channels, patches);
        log::debug!("image size is {:#x} bytes", store.size);
        Ok(store)
    }
}
