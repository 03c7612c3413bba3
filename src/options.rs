//! Command-line options shared by the binaries

use crate::store::Store;

use anyhow::Context;
use clap::{ArgAction, Args};

use std::fs::File;
use std::path::{Path, PathBuf};

/// The files an image is reconstructed from
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Block table, with one (physical block, confidence) record per logical block
    pub blocktable: PathBuf,

    /// Dump of the first flash plane
    pub cs0: PathBuf,

    /// Dump of the second flash plane
    pub cs1: PathBuf,

    /// A recovery dump and the patch list that refers into it; may be given several times
    #[clap(
        long = "patch",
        num_args = 2,
        value_names = ["SOURCE", "LIST"],
        action = ArgAction::Append
    )]
    pub patches: Vec<PathBuf>,
}

impl SourceArgs {
    /// The patch batches, in the order given
    pub fn batches(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.patches
            .chunks_exact(2)
            .map(|pair| (pair[0].as_path(), pair[1].as_path()))
    }

    /// Load everything; any failure here is fatal
    pub fn open(&self) -> anyhow::Result<Store<File>> {
        Store::open(&self.blocktable, [&self.cs0, &self.cs1], self.batches())
            .context("cannot load recovery sources")
    }
}

#[derive(Args, Debug, Clone, Copy)]
pub struct Verbosity {
    /// Log more detail (repeat for per-request tracing)
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Verbosity {
    /// Set up `env_logger`; `RUST_LOG` still takes precedence
    pub fn init_logging(self) {
        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    }
}

#[test]
fn test_batches() {
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        sources: SourceArgs,
    }

    let cli = Cli::parse_from([
        "lofile", "bt.bin", "cs0.bin", "cs1.bin", "--patch", "a.bin", "a.lst", "--patch",
        "b.bin", "b.lst",
    ]);
    let batches: Vec<_> = cli.sources.batches().collect();
    assert_eq!(
        batches,
        [
            (Path::new("a.bin"), Path::new("a.lst")),
            (Path::new("b.bin"), Path::new("b.lst"))
        ]
    );
    assert_eq!(cli.sources.cs1, Path::new("cs1.bin"));

    assert!(Cli::try_parse_from(["lofile", "bt.bin", "cs0.bin"]).is_err());
    assert!(Cli::try_parse_from(["lofile", "bt", "a", "b", "--patch", "x"]).is_err());
}
