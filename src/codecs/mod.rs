//! The format codecs. Each submodule implements the registry contract for
//! one format family: an optional signature `test_*`, a `load_*` that
//! sizes the destination via `pre_load` and then feeds pixels through the
//! sink protocol, and a `save_*` that reads back through `get_pixel`.
//!
//! The byte-level helpers below are shared by the hand-rolled binary
//! codecs (PCX, IMG); GIF and PNG go through their dedicated crates.

use std::io::{self, Read, Write};

pub mod fallback;
pub mod gif;
pub mod img;
pub mod palette;
pub mod pcx;
pub mod png;

pub(crate) fn read_word_le(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_bytes<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_byte(w: &mut impl Write, b: u8) -> io::Result<()> {
    w.write_all(&[b])
}

pub(crate) fn write_word_le(w: &mut impl Write, value: u16) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn word_round_trip_is_little_endian() {
        let mut buf = Vec::new();
        write_word_le(&mut buf, 0x3412).unwrap();
        write_byte(&mut buf, 0x90).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0x90]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_word_le(&mut cursor).unwrap(), 0x3412);
        assert_eq!(read_bytes::<1>(&mut cursor).unwrap(), [0x90]);
        assert!(read_word_le(&mut cursor).is_err()); // stream exhausted
    }

    #[test]
    fn read_bytes_is_exact() {
        let mut cursor = Cursor::new(vec![1u8, 2, 3]);
        assert_eq!(read_bytes::<2>(&mut cursor).unwrap(), [1, 2]);
        assert!(read_bytes::<2>(&mut cursor).is_err());
    }
}
