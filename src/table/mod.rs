//! The two on-disk tables that drive address translation: the forward map (one entry per logical
//! block) and the patch lists (sector overrides sourced from alternate dumps).
//!
//! Both are flat arrays of fixed-size little-endian records, parsed with deku.

pub mod forward;
pub mod patch;

pub use forward::{ForwardEntry, ForwardMap};
pub use patch::{Patch, PatchRecord, PatchStore, SourceId};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while loading the tables and opening the dumps.
///
/// All of these are fatal: continuing with a half-loaded table would silently produce a wrong
/// reconstruction.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot open {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not usable", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: Box<LoadError>,
    },
    #[error("block table is {len} bytes, not a multiple of the {record}-byte record size")]
    RaggedBlockTable { len: usize, record: usize },
    #[error("patch list holds {len} bytes, expected exactly {expected}")]
    PatchListSize { len: usize, expected: usize },
    #[error("malformed record")]
    Record(#[from] deku::DekuError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LoadError {
    /// Attach the path of the file being loaded, unless the error already names one
    pub(crate) fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            LoadError::Io(source) => LoadError::Read {
                path: path.into(),
                source,
            },
            e @ (LoadError::Open { .. } | LoadError::Read { .. } | LoadError::Invalid { .. }) => e,
            other => LoadError::Invalid {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error underneath any path wrapper
    pub fn cause(&self) -> &LoadError {
        match self {
            LoadError::Invalid { source, .. } => source.cause(),
            other => other,
        }
    }
}

#[test]
fn test_with_path() {
    let err = LoadError::PatchListSize {
        len: 100,
        expected: 4096,
    }
    .with_path("batch2.lst");
    assert!(matches!(&err, LoadError::Invalid { path, .. } if path.ends_with("batch2.lst")));
    assert!(matches!(err.cause(), LoadError::PatchListSize { len: 100, .. }));
    assert_eq!(err.to_string(), "batch2.lst is not usable");

    let err = LoadError::Io(io::ErrorKind::UnexpectedEof.into()).with_path("bt.bin");
    assert!(matches!(&err, LoadError::Read { path, .. } if path.ends_with("bt.bin")));

    let err = err.with_path("other.bin");
    assert!(matches!(&err, LoadError::Read { path, .. } if path.ends_with("bt.bin")));
}
