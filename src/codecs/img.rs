//! IMG raw-dump codec — the format the emergency backup writes, chosen
//! because it is nearly impossible to produce an unreadable file with it:
//! a fixed header, a raw 768-byte palette, then raw index bytes with no
//! compression.
//!
//! Layout: 6-byte magic, LE width, LE height, a 118-byte filler block
//! (bytes 22..24 encode the length of the embedded signature string,
//! whose text starts at offset 23 — the overlap is historical and kept
//! for compatibility), the palette, the pixels.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};

use super::{read_bytes, read_word_le, write_word_le};
use crate::context::{IoContext, PixelRatio};
use crate::error::{FileError, FileResult};
use crate::page::{Palette, Rgb};
use crate::paths;

const MAGIC: [u8; 6] = [0x01, 0x00, 0x47, 0x12, 0x6D, 0xB0];
const SIGNATURE_TEXT: &[u8; 64] =
    b"RetroPaint canvas dump (IMG layout from PV (c)W.Wiedmann)\0\0\0\0\0\0\0";

pub fn test_img(file: &mut File) -> io::Result<bool> {
    let mut magic = [0u8; 6];
    if file.read_exact(&mut magic).is_err() {
        return Ok(false);
    }
    Ok(magic == MAGIC)
}

pub fn load_img(context: &mut IoContext) -> FileResult<()> {
    let path = paths::context_path(context);
    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let mut r = BufReader::new(File::open(&path)?);

    let magic: [u8; 6] = read_bytes(&mut r)?;
    if magic != MAGIC {
        return Err(FileError::NotRecognized);
    }
    let width = read_word_le(&mut r)? as usize;
    let height = read_word_le(&mut r)? as usize;
    let _filler: [u8; 118] = read_bytes(&mut r)?;
    let mut palette_bytes = [0u8; 768];
    r.read_exact(&mut palette_bytes)?;

    context.pre_load(width, height, file_size, PixelRatio::Simple, 8)?;
    for (entry, rgb) in context.palette.iter_mut().zip(palette_bytes.chunks_exact(3)) {
        *entry = Rgb { r: rgb[0], g: rgb[1], b: rgb[2] };
    }

    let mut row = vec![0u8; width];
    for y in 0..height {
        r.read_exact(&mut row)?;
        for (x, &color) in row.iter().enumerate() {
            context.set_pixel(x, y, color);
        }
    }
    Ok(())
}

pub fn save_img(context: &mut IoContext) -> FileResult<()> {
    let result = (|| -> FileResult<()> {
        let mut w = BufWriter::new(paths::open_file_write(context)?);
        write_header(&mut w, context.width, context.height, &context.palette)?;
        for y in 0..context.height {
            for x in 0..context.width {
                w.write_all(&[context.get_pixel(x, y)])?;
            }
        }
        w.flush()?;
        Ok(())
    })();
    result.inspect_err(|_| paths::remove_file(context))
}

/// Write the fixed IMG header + palette. Shared with the emergency backup
/// writer, which bypasses the context machinery entirely.
pub(crate) fn write_header(
    w: &mut impl Write,
    width: usize,
    height: usize,
    palette: &Palette,
) -> io::Result<()> {
    let mut filler = [0u8; 118];
    filler[4] = 0xFF;
    filler[22] = SIGNATURE_TEXT.len() as u8; // length, low byte
    filler[23] = 0; // length, high byte — immediately overlaid by the text
    let text_end = (23 + SIGNATURE_TEXT.len()).min(filler.len());
    filler[23..text_end].copy_from_slice(&SIGNATURE_TEXT[..text_end - 23]);

    w.write_all(&MAGIC)?;
    write_word_le(w, width as u16)?;
    write_word_le(w, height as u16)?;
    w.write_all(&filler)?;
    for color in palette {
        w.write_all(&[color.r, color.g, color.b])?;
    }
    Ok(())
}
