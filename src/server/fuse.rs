//! Host a [ReadOnlyFs] through FUSE.
//!
//! FUSE addresses nodes by inode number, while [ReadOnlyFs] uses paths. The tree is only one level
//! deep, so inode 1 is the root and the entries of the root listing get inodes 2, 3, ... in order.

use super::{AccessMode, Attributes, FsError, NodeKind, ReadOnlyFs, ROOT_PATH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    ReplyOpen, Request,
};
use nix::errno::Errno;
use nix::unistd::{getgid, getuid};

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

pub struct FuseHost<S> {
    fs: S,
    /// Paths of the root's entries, indexed by `ino - 2`
    entries: Vec<(String, NodeKind)>,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl<S: ReadOnlyFs> FuseHost<S> {
    /// Prepare to host `fs`; its root listing is taken once, here
    pub fn new(fs: S) -> Result<Self, FsError> {
        let entries = fs
            .list_directory(ROOT_PATH)?
            .into_iter()
            .map(|x| (format!("{ROOT_PATH}{}", x.name), x.kind))
            .collect();

        Ok(Self {
            fs,
            entries,
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            mounted_at: SystemTime::now(),
        })
    }

    /// Mount read-only at `mountpoint` and serve requests until unmounted
    pub fn mount<P: AsRef<Path>>(self, mountpoint: P, extra: &[MountOption]) -> std::io::Result<()>
    where
        S: Send + 'static,
    {
        let mut options = vec![MountOption::RO, MountOption::FSName("lofile".into())];
        options.extend_from_slice(extra);
        fuser::mount2(self, mountpoint, &options)
    }

    fn path(&self, ino: u64) -> Option<&str> {
        match ino {
            ROOT_INO => Some(ROOT_PATH),
            _ => {
                let index = usize::try_from(ino.checked_sub(ROOT_INO + 1)?).ok()?;
                self.entries.get(index).map(|(path, _)| path.as_str())
            }
        }
    }

    fn attr(&self, ino: u64, attributes: Attributes) -> FileAttr {
        FileAttr {
            ino,
            size: attributes.size,
            blocks: attributes.size.div_ceil(512),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind: file_type(attributes.kind),
            perm: attributes.perm,
            nlink: attributes.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::RegularFile => FileType::RegularFile,
    }
}

/// Translate a `-o` argument (possibly comma-separated) into mount options
pub fn parse_mount_options(s: &str) -> Vec<MountOption> {
    s.split(',')
        .filter(|x| !x.is_empty())
        .map(|x| match x {
            "ro" => MountOption::RO,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_unmount" => MountOption::AutoUnmount,
            "default_permissions" => MountOption::DefaultPermissions,
            other => MountOption::CUSTOM(other.into()),
        })
        .collect()
}

impl<S: ReadOnlyFs> Filesystem for FuseHost<S> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            return reply.error(Errno::ENOENT as i32);
        }

        let Some(name) = name.to_str() else {
            return reply.error(Errno::ENOENT as i32);
        };
        let path = format!("{ROOT_PATH}{name}");
        let Some(index) = self.entries.iter().position(|(x, _)| *x == path) else {
            return reply.error(Errno::ENOENT as i32);
        };

        match self.fs.query_attributes(&path) {
            Ok(attributes) => {
                let ino = ROOT_INO + 1 + index as u64;
                reply.entry(&TTL, &self.attr(ino, attributes), 0)
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path(ino) else {
            return reply.error(Errno::ENOENT as i32);
        };

        match self.fs.query_attributes(path) {
            Ok(attributes) => reply.attr(&TTL, &self.attr(ino, attributes)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path(ino) else {
            return reply.error(Errno::ENOENT as i32);
        };

        match self.fs.open(path, AccessMode::from_flags(flags)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path(ino) else {
            return reply.error(Errno::ENOENT as i32);
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(Errno::EINVAL as i32);
        };

        let mut buf = vec![0; size as usize];
        match self.fs.read_at(path, offset, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            return reply.error(Errno::ENOTDIR as i32);
        }

        let dots = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
        ];
        let entries = self.entries.iter().enumerate().map(|(i, (path, kind))| {
            let name = &path[ROOT_PATH.len()..];
            (ROOT_INO + 1 + i as u64, file_type(*kind), name)
        });

        // Each entry's offset is the index of the entry after it
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (ino, kind, name)) in dots.into_iter().chain(entries).enumerate().skip(skip) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{LoFile, DEFAULT_FILE_NAME};
    use crate::store::tests::sim_store;

    #[test]
    fn test_inode_paths() {
        let host = FuseHost::new(LoFile::new(sim_store(), DEFAULT_FILE_NAME)).unwrap();

        assert_eq!(host.path(ROOT_INO), Some("/"));
        assert_eq!(host.path(ROOT_INO + 1), Some("/lofile"));
        assert_eq!(host.path(ROOT_INO + 2), None);
        assert_eq!(host.path(0), None);
    }

    #[test]
    fn test_file_attr() {
        let host = FuseHost::new(LoFile::new(sim_store(), DEFAULT_FILE_NAME)).unwrap();
        let attributes = host.fs.query_attributes("/lofile").unwrap();
        let attr = host.attr(2, attributes);

        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o444);
        assert_eq!(attr.size, host.fs.store().size());
        assert_eq!(attr.blocks * 512, attr.size);
    }

    #[test]
    fn test_parse_mount_options() {
        let options = parse_mount_options("allow_other,,fsname=foo");
        assert_eq!(
            options,
            [
                MountOption::AllowOther,
                MountOption::CUSTOM("fsname=foo".into())
            ]
        );
    }

    /// A filesystem whose root cannot be listed
    struct Unlistable;

    impl ReadOnlyFs for Unlistable {
        fn query_attributes(&self, _path: &str) -> Result<Attributes, FsError> {
            Err(FsError::NotFound)
        }

        fn list_directory(&self, _path: &str) -> Result<Vec<crate::server::DirEntry>, FsError> {
            Err(FsError::AccessDenied)
        }

        fn open(&self, _path: &str, _mode: AccessMode) -> Result<(), FsError> {
            Err(FsError::NotFound)
        }

        fn read_at(&self, _path: &str, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
            Err(FsError::NotFound)
        }
    }

    #[test]
    fn test_unlistable_root() {
        assert!(matches!(FuseHost::new(Unlistable), Err(FsError::AccessDenied)));
    }
}
