//! Offline inspection of a reconstruction, without mounting anything.
//!
//! Useful for checking a block table or patch set before handing the image to other tools, and
//! for pulling the image (or part of it) out into a regular file.

use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use nand_lofile::{
    nand::{ReadAt, BLOCK_DATA_BYTES},
    options::{SourceArgs, Verbosity},
    server::{LoFile, DEFAULT_FILE_NAME},
    store::Store,
    translate::{Chunk, Source},
    util::parse_u64,
};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize the block table and the patches in effect
    Info,

    /// List every installed patch
    Patches,

    /// Show where each sector of a logical byte range is read from
    Translate {
        /// Logical byte offset (decimal, or hex with 0x)
        #[clap(value_parser = parse_u64)]
        offset: u64,

        /// Number of bytes to translate
        #[clap(long, default_value = "1024", value_parser = parse_u64)]
        length: u64,
    },

    /// Copy the image, or a range of it, into a regular file
    Extract {
        /// Where to write the image
        output: PathBuf,

        /// Logical byte offset to start at
        #[clap(long, default_value = "0", value_parser = parse_u64)]
        offset: u64,

        /// Number of bytes to copy; defaults to the rest of the image
        #[clap(long, value_parser = parse_u64)]
        length: Option<u64>,
    },
}

impl Command {
    fn execute(self, store: Store<File>) -> Result<()> {
        match self {
            Command::Info => {
                let forward = store.forward();
                let patches = store.patches();

                println!("logical blocks: {}", forward.len());
                println!("  mapped:       {}", forward.mapped_count());
                println!("  unmapped:     {}", forward.len() - forward.mapped_count());
                println!("image size:     {:#x} bytes", store.size());
                println!("patch batches:  {}", patches.source_count());
                println!("patches:        {}", patches.len());
            }

            Command::Patches => {
                for patch in store.patches().iter() {
                    let covers = match patch.covered_range() {
                        Some(range) => format!("{:#010x}..{:#010x}", range.start, range.end),
                        None => "nothing".into(),
                    };
                    println!(
                        "sector {:8x} => batch {:2}, pg {:6x}, confidence {:5} (covers {covers})",
                        patch.sector, patch.source.0, patch.page, patch.confidence
                    );
                }
            }

            Command::Translate { offset, length } => {
                let end = offset.saturating_add(length);
                let mut pos = offset;
                while pos < end {
                    let len = usize::try_from(end - pos).unwrap_or(usize::MAX);
                    let chunk = store.translate(pos, len);
                    match chunk {
                        Chunk::End => {
                            println!("{pos:#010x}: end of image");
                            break;
                        }
                        Chunk::Zero(len) => println!("{pos:#010x} +{len:4}: unmapped"),
                        Chunk::Read {
                            source,
                            offset: phys,
                            len,
                        } => {
                            let source = match source {
                                Source::Channel(channel) => format!("{channel:?}"),
                                Source::Patch(id) => format!("patch batch {}", id.0),
                            };
                            println!("{pos:#010x} +{len:4}: {source} @ {phys:#x}");
                        }
                    }
                    pos += chunk.len() as u64;
                }
            }

            Command::Extract {
                output,
                offset,
                length,
            } => {
                let fs = LoFile::new(store, DEFAULT_FILE_NAME);
                let size = fs.store().size();
                ensure!(offset <= size, "offset {offset:#x} is past the end of the image");

                let length = length.map_or(size - offset, |x| std::cmp::min(x, size - offset));
                extract(&fs, offset, length, File::create(&output)?)?;
            }
        };

        Ok(())
    }
}

/// Stream `length` bytes of the image from `offset` into `out`, stopping early on a short read
fn extract<F: ReadAt, W: Write>(fs: &LoFile<F>, offset: u64, length: u64, out: W) -> Result<()> {
    // One block of the forward map per piece
    const PIECE: u64 = BLOCK_DATA_BYTES;

    let rpt = howudoin::new()
        .label("Extracting image")
        .set_len(length.div_ceil(PIECE));

    let mut out = BufWriter::new(out);
    let mut buf = vec![0; PIECE as usize];
    let mut done = 0;
    while done < length {
        let want = std::cmp::min(PIECE, length - done) as usize;
        let n = fs.read(offset + done, &mut buf[..want]);
        out.write_all(&buf[..n])?;
        done += n as u64;
        rpt.inc();

        if n < want {
            log::warn!("short read at {:#x}, stopping", offset + done);
            break;
        }
    }

    out.flush()?;
    rpt.close();

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
    eprintln!("wrote {done:#x} of {length:#x} bytes");
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    sources: SourceArgs,

    #[clap(flatten)]
    verbosity: Verbosity,

    /// What to do with the reconstruction
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    args.verbosity.init_logging();
    howudoin::init(howudoin::consumers::TermLine::default());

    let store = args.sources.open()?;
    args.cmd.execute(store)
}
