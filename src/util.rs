//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Reads until EOF or until `limit` bytes have been collected, whichever comes first.
    ///
    /// Unlike `read_to_end`, this refuses to buffer an arbitrarily large input: a result of
    /// exactly `limit` bytes means the input may hold more.
    fn read_up_to(&mut self, limit: usize) -> io::Result<Vec<u8>>;
}

impl<T: Read> ReadExt for T {
    fn read_up_to(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        const CHUNK_SIZE: usize = 65536;

        let mut vec = Vec::new();
        loop {
            let cursor = vec.len();
            if cursor == limit {
                return Ok(vec);
            }

            vec.resize(std::cmp::min(limit, cursor + CHUNK_SIZE), 0u8);

            match self.read(&mut vec[cursor..]) {
                Ok(0) => {
                    vec.truncate(cursor);
                    return Ok(vec);
                }
                Ok(n) => vec.truncate(cursor + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => vec.truncate(cursor),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse a byte offset or length, given either in decimal or as `0x`-prefixed hex
pub fn parse_u64(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

#[test]
fn test_read_up_to() -> io::Result<()> {
    assert_eq!(io::repeat(0xAA).read_up_to(4)?, [0xAA; 4]);
    assert_eq!((&[1, 2, 3][..]).read_up_to(8)?, [1, 2, 3]);
    assert_eq!((&[1, 2, 3][..]).read_up_to(3)?, [1, 2, 3]);
    assert!((&[0u8; 0][..]).read_up_to(3)?.is_empty());
    assert_eq!(io::repeat(0x55).read_up_to(200_000)?.len(), 200_000);
    Ok(())
}

#[test]
fn test_parse_u64() {
    assert_eq!(parse_u64("4096").unwrap(), 4096);
    assert_eq!(parse_u64("0x1000").unwrap(), 4096);
    assert_eq!(parse_u64("0X1f").unwrap(), 31);
    assert!(parse_u64("0xzz").is_err());
    assert!(parse_u64("-1").is_err());
}
