//! Mount the reconstructed image of a dual-plane NAND dump as a read-only file.
//!
//! Everything is loaded up front: a missing or malformed input aborts before anything is mounted,
//! since a half-loaded table would make for a silently wrong image.

use anyhow::Context;
use clap::Parser;
use nand_lofile::{
    options::{SourceArgs, Verbosity},
    server::{
        fuse::{parse_mount_options, FuseHost},
        parse_file_name, LoFile, DEFAULT_FILE_NAME,
    },
};

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    sources: SourceArgs,

    /// Directory to mount the image under
    mountpoint: PathBuf,

    /// Name of the image file within the mount
    #[clap(long, default_value = DEFAULT_FILE_NAME, value_parser = parse_file_name)]
    name: String,

    /// FUSE mount options, comma-separated
    #[clap(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Let users other than the mounting one see the image
    #[clap(long)]
    allow_other: bool,

    #[clap(flatten)]
    verbosity: Verbosity,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    args.verbosity.init_logging();

    let store = args.sources.open()?;
    let fs = LoFile::new(store, &args.name);

    let mut options: Vec<_> = args
        .options
        .iter()
        .flat_map(|x| parse_mount_options(x))
        .collect();
    if args.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    log::info!(
        "serving {:#x} bytes as {}",
        fs.store().size(),
        args.mountpoint.join(fs.name()).display()
    );
    FuseHost::new(fs)
        .context("cannot list the image directory")?
        .mount(&args.mountpoint, &options)
        .with_context(|| format!("cannot mount at {}", args.mountpoint.display()))
}

#[test]
fn test_name_is_one_component() {
    let base = ["lofile", "bt.bin", "cs0.bin", "cs1.bin", "/mnt"];
    let args = Cli::try_parse_from(base).unwrap();
    assert_eq!(args.name, DEFAULT_FILE_NAME);

    let args = Cli::try_parse_from(base.into_iter().chain(["--name", "disk.img"])).unwrap();
    assert_eq!(args.name, "disk.img");

    for bad in ["a/b", ""] {
        assert!(Cli::try_parse_from(base.into_iter().chain(["--name", bad])).is_err());
    }
}
