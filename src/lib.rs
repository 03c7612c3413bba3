//! Reconstruct a readable image from raw dumps of a dual-plane NAND flash.
//!
//! The image is never materialized: a block table maps every logical block to a physical block,
//! and each read is translated, sector by sector, into positioned reads of the two plane dumps.
//! Patch lists can redirect groups of sectors to pages of other recovery dumps. The result is
//! served as a single read-only file.

pub mod nand;
pub mod options;
pub mod server;
pub mod store;
pub mod table;
pub mod translate;
pub mod util;
