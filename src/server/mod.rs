//! The virtual file: a read-only root directory holding the reconstructed image as its only entry.
//!
//! The filesystem host (FUSE, see [fuse]) only ever talks to [ReadOnlyFs], so the server can be
//! exercised without mounting anything.

pub mod fuse;

use crate::nand::ReadAt;
use crate::store::Store;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use thiserror::Error;

/// Path of the root directory
pub const ROOT_PATH: &str = "/";

/// Name of the image file unless told otherwise
pub const DEFAULT_FILE_NAME: &str = "lofile";

/// Check that `name` can be the image file's name: a single, ordinary path component
pub fn parse_file_name(name: &str) -> anyhow::Result<String> {
    anyhow::ensure!(!name.is_empty(), "file name is empty");
    anyhow::ensure!(!name.contains('/'), "file name {name:?} contains a '/'");
    anyhow::ensure!(name != "." && name != "..", "file name {name:?} is reserved");
    Ok(name.to_owned())
}

#[derive(Error, Debug, Eq, PartialEq, Copy, Clone)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    AccessDenied,
}

impl FsError {
    /// The errno to report to the kernel
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => Errno::ENOENT as i32,
            FsError::AccessDenied => Errno::EACCES as i32,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum NodeKind {
    Directory,
    RegularFile,
}

/// What `stat` reports about a node
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Attributes {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// The access mode bits of an `open` call
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Decode the access mode from raw `open(2)` flags, ignoring every other flag
    pub fn from_flags(flags: i32) -> Self {
        let mode = OFlag::from_bits_truncate(flags) & OFlag::O_ACCMODE;
        if mode == OFlag::O_RDONLY {
            AccessMode::ReadOnly
        } else if mode == OFlag::O_WRONLY {
            AccessMode::WriteOnly
        } else {
            AccessMode::ReadWrite
        }
    }
}

/// The operations a filesystem host needs from a read-only, path-addressed filesystem
pub trait ReadOnlyFs {
    fn query_attributes(&self, path: &str) -> Result<Attributes, FsError>;

    /// List a directory, not including `.` and `..`
    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;

    /// Check that `path` may be opened with `mode`; nothing is held open
    fn open(&self, path: &str, mode: AccessMode) -> Result<(), FsError>;

    /// Read into `buf` from `offset`, returning the number of bytes read.
    ///
    /// Fewer bytes than `buf.len()` means end of data; it is not an error.
    fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;
}

/// Serves the reconstructed image as a single read-only file
#[derive(Debug)]
pub struct LoFile<F> {
    store: Store<F>,
    path: String,
}

impl<F> LoFile<F> {
    pub fn new(store: Store<F>, name: &str) -> Self {
        Self {
            store,
            path: format!("{ROOT_PATH}{name}"),
        }
    }

    pub fn store(&self) -> &Store<F> {
        &self.store
    }

    /// Name of the image file within the root directory
    pub fn name(&self) -> &str {
        &self.path[ROOT_PATH.len()..]
    }

    fn check_path(&self, path: &str) -> Result<(), FsError> {
        match path == self.path {
            true => Ok(()),
            false => Err(FsError::NotFound),
        }
    }
}

impl<F: ReadAt> LoFile<F> {
    /// Fill as much of `buf` as possible with image content starting at `offset`.
    ///
    /// Stops early at the end of the image, or at the first chunk that produces nothing (such as
    /// a read past the end of a truncated dump).
    pub fn read(&self, mut offset: u64, buf: &mut [u8]) -> usize {
        log::debug!("read request: offset {offset:08x}, size {:08x}", buf.len());

        let mut done = 0;
        while done < buf.len() {
            let chunk = self.store.translate(offset, buf.len() - done);
            let n = self.store.read_chunk(chunk, &mut buf[done..]);
            if n == 0 {
                break;
            }

            done += n;
            offset += n as u64;
        }

        done
    }
}

impl<F: ReadAt> ReadOnlyFs for LoFile<F> {
    fn query_attributes(&self, path: &str) -> Result<Attributes, FsError> {
        if path == ROOT_PATH {
            return Ok(Attributes {
                kind: NodeKind::Directory,
                size: 0,
                perm: 0o555,
                nlink: 2,
            });
        }

        self.check_path(path)?;
        Ok(Attributes {
            kind: NodeKind::RegularFile,
            size: self.store.size(),
            perm: 0o444,
            nlink: 1,
        })
    }

    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        if path != ROOT_PATH {
            return Err(FsError::NotFound);
        }

        Ok(vec![DirEntry {
            name: self.name().to_owned(),
            kind: NodeKind::RegularFile,
        }])
    }

    fn open(&self, path: &str, mode: AccessMode) -> Result<(), FsError> {
        self.check_path(path)?;
        match mode {
            AccessMode::ReadOnly => Ok(()),
            _ => Err(FsError::AccessDenied),
        }
    }

    fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.check_path(path)?;
        Ok(self.read(offset, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::{BLOCK_DATA_BYTES, PAGE_BYTES};
    use crate::store::tests::{sim_dump, sim_store};
    use crate::table::patch::encode_list;
    use crate::table::{ForwardEntry, ForwardMap, PatchRecord, PatchStore};

    fn sim_file() -> LoFile<Vec<u8>> {
        LoFile::new(sim_store(), DEFAULT_FILE_NAME)
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("disk.img").unwrap(), "disk.img");
        assert_eq!(parse_file_name(DEFAULT_FILE_NAME).unwrap(), DEFAULT_FILE_NAME);
        for bad in ["", "a/b", "/lofile", "lofile/", ".", ".."] {
            assert!(parse_file_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_attributes() {
        let fs = sim_file();

        let root = fs.query_attributes("/").unwrap();
        assert_eq!(root.kind, NodeKind::Directory);

        let file = fs.query_attributes("/lofile").unwrap();
        assert_eq!(file.kind, NodeKind::RegularFile);
        assert_eq!(file.size, 3 * BLOCK_DATA_BYTES);
        assert_eq!(file.perm, 0o444);

        assert_eq!(fs.query_attributes("/other"), Err(FsError::NotFound));
        assert_eq!(fs.query_attributes("lofile"), Err(FsError::NotFound));
    }

    #[test]
    fn test_list() {
        let fs = LoFile::new(sim_store(), "image.bin");

        let entries = fs.list_directory("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "image.bin");
        assert_eq!(fs.list_directory("/image.bin"), Err(FsError::NotFound));
    }

    #[test]
    fn test_open_modes() {
        let fs = sim_file();

        assert_eq!(fs.open("/lofile", AccessMode::ReadOnly), Ok(()));
        assert_eq!(fs.open("/lofile", AccessMode::WriteOnly), Err(FsError::AccessDenied));
        assert_eq!(fs.open("/lofile", AccessMode::ReadWrite), Err(FsError::AccessDenied));
        assert_eq!(fs.open("/nope", AccessMode::ReadOnly), Err(FsError::NotFound));
    }

    #[test]
    fn test_access_mode_flags() {
        let flags = |f: OFlag| AccessMode::from_flags(f.bits());
        assert_eq!(flags(OFlag::O_RDONLY), AccessMode::ReadOnly);
        assert_eq!(flags(OFlag::O_RDONLY | OFlag::O_NOFOLLOW), AccessMode::ReadOnly);
        assert_eq!(flags(OFlag::O_WRONLY | OFlag::O_APPEND), AccessMode::WriteOnly);
        assert_eq!(flags(OFlag::O_RDWR), AccessMode::ReadWrite);
    }

    #[test]
    fn test_errno() {
        assert_eq!(FsError::NotFound.errno(), nix::libc::ENOENT);
        assert_eq!(FsError::AccessDenied.errno(), nix::libc::EACCES);
    }

    #[test]
    fn test_read_spans_chunks() {
        let fs = sim_file();

        // Two whole pages of block 0 (phys 1): logical page 0 on CS0 and page 1 on CS0 too, in
        // the second half of the plane block
        let mut buf = vec![0u8; 2 * 8192];
        assert_eq!(fs.read_at("/lofile", 0, &mut buf), Ok(buf.len()));

        let cs0 = sim_dump(0x00, (2 * 256 * PAGE_BYTES) as usize);
        for (page, plane_page) in [(0, 0), (1, 128)] {
            for sector in 0..8 {
                let phys = ((256 + plane_page) * PAGE_BYTES + sector * 1094) as usize;
                let logical = (page * 8192 + sector * 1024) as usize;
                assert_eq!(buf[logical..][..1024], cs0[phys..][..1024]);
            }
        }
    }

    #[test]
    fn test_read_unaligned() {
        let fs = sim_file();

        // Start 3 bytes before a sector boundary, stop 5 bytes past the next one
        let offset = 2 * 8192 + 1021;
        let mut buf = vec![0u8; 3 + 1024 + 5];
        assert_eq!(fs.read(offset, &mut buf), buf.len());

        let mut whole = vec![0u8; 3 * 1024];
        assert_eq!(fs.read(2 * 8192, &mut whole), whole.len());
        assert_eq!(buf[..], whole[1021..][..buf.len()]);
    }

    #[test]
    fn test_unmapped_reads_zero() {
        let fs = sim_file();

        let mut buf = vec![0xFFu8; 10_000];
        assert_eq!(fs.read(BLOCK_DATA_BYTES + 123, &mut buf), buf.len());
        assert!(buf.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_read_past_end() {
        let fs = sim_file();
        let size = fs.store().size();

        let mut buf = vec![0u8; 5000];
        assert_eq!(fs.read(size - 1000, &mut buf), 1000);
        assert_eq!(fs.read(size, &mut buf), 0);
        assert_eq!(fs.read(size + 12345, &mut buf), 0);
    }

    #[test]
    fn test_short_dump() {
        // Plane dumps that end partway through sector 7 of the very first page
        const DUMP_LEN: u64 = 8000;
        let forward = ForwardMap::from_entries(vec![ForwardEntry::new(0, 1)]);
        let channels = [0x00, 0x80].map(|m| sim_dump(m, DUMP_LEN as usize));
        let fs = LoFile::new(Store::new(forward, channels, PatchStore::new()), "x");

        let tail = (DUMP_LEN - 7 * 1094) as usize;

        // The read stops where the dump does, rather than failing or skipping ahead
        let mut buf = vec![0u8; 2 * 8192];
        assert_eq!(fs.read(0, &mut buf), 7 * 1024 + tail);

        let mut buf = vec![0u8; 1024];
        assert_eq!(fs.read(7 * 1024, &mut buf), tail);

        // Logical page 1 lives at CS0 page 128, which is missing entirely
        assert_eq!(fs.read(8192, &mut buf), 0);
    }

    #[test]
    fn test_patch_redirects() -> anyhow::Result<()> {
        let forward = ForwardMap::from_entries(vec![ForwardEntry::new(0, 1)]);
        let channels = [0x00, 0x80].map(|m| sim_dump(m, (256 * PAGE_BYTES) as usize));
        let mut patches = PatchStore::new();

        let weak = vec![0x11; (4 * PAGE_BYTES) as usize];
        let strong = vec![0x22; (4 * PAGE_BYTES) as usize];
        let weaker = vec![0x33; (4 * PAGE_BYTES) as usize];

        // All three batches patch 512-byte sector 0x20, i.e. logical bytes 0x4000..0x6000
        patches.load_batch(weak, &mut &encode_list(&[PatchRecord::new(0x20, 2, 4)])[..])?;
        patches.load_batch(strong, &mut &encode_list(&[PatchRecord::new(0x20, 3, 8)])[..])?;
        patches.load_batch(weaker, &mut &encode_list(&[PatchRecord::new(0x20, 1, 6)])[..])?;

        let fs = LoFile::new(Store::new(forward, channels, patches), "x");

        let mut buf = vec![0u8; 0x2000];
        assert_eq!(fs.read(0x4000, &mut buf), buf.len());
        assert!(buf.iter().all(|&x| x == 0x22));

        // Just outside the group, the plane dumps are used again
        let mut buf = [0u8; 1];
        fs.read(0x6000, &mut buf);
        assert_ne!(buf[0], 0x22);

        Ok(())
    }

    #[test]
    fn test_concurrent_reads() {
        let fs = sim_file();

        let mut expected = vec![0u8; 64 * 1024];
        assert_eq!(fs.read(0, &mut expected), expected.len());

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let fs = &fs;
                let expected = &expected;
                s.spawn(move || {
                    for i in 0..16u64 {
                        let offset = (t * 997 + i * 3001) % 60_000;
                        let mut buf = vec![0u8; 2048];
                        assert_eq!(fs.read(offset, &mut buf), buf.len());
                        assert_eq!(buf[..], expected[offset as usize..][..2048]);
                    }
                });
            }
        });
    }
}
