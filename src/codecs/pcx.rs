//! PCX codec, hand-rolled. Reads the common planar variants (1-bit mono,
//! 4-plane EGA, packed 2/4-bit, 8-bit with VGA trailer palette, 3-plane
//! truecolor) and writes 8-bit single-plane RLE.
//!
//! PCX's "signature" is a single magic byte, which is why this entry sits
//! near the end of the probe order.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};

use super::{read_bytes, write_byte, write_word_le};
use crate::context::{IoContext, PixelRatio};
use crate::error::{FileError, FileResult};
use crate::page::{Rgb, MAX_IMAGE_DIM};
use crate::paths;

const MANUFACTURER: u8 = 0x0A;
const VGA_PALETTE_MARKER: u8 = 0x0C;

struct PcxHeader {
    version: u8,
    encoding: u8,
    bits_per_pixel: u8,
    width: usize,
    height: usize,
    ega_palette: [u8; 48],
    nb_planes: usize,
    bytes_per_line: usize,
}

fn read_header(r: &mut impl Read) -> io::Result<Option<PcxHeader>> {
    let raw: [u8; 128] = read_bytes(r)?;
    let word = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]) as usize;
    let (x_min, y_min, x_max, y_max) = (word(4), word(6), word(8), word(10));
    let header = PcxHeader {
        version: raw[1],
        encoding: raw[2],
        bits_per_pixel: raw[3],
        width: x_max.wrapping_sub(x_min).wrapping_add(1),
        height: y_max.wrapping_sub(y_min).wrapping_add(1),
        ega_palette: raw[16..64].try_into().unwrap(),
        nb_planes: raw[65] as usize,
        bytes_per_line: word(66),
    };
    if raw[0] != MANUFACTURER
        || !matches!(header.version, 0 | 2 | 3 | 4 | 5)
        || header.encoding > 1
        || !matches!(header.bits_per_pixel, 1 | 2 | 4 | 8)
        || x_max < x_min
        || y_max < y_min
    {
        return Ok(None);
    }
    Ok(Some(header))
}

pub fn test_pcx(file: &mut File) -> io::Result<bool> {
    let mut start = [0u8; 4];
    if file.read_exact(&mut start).is_err() {
        return Ok(false);
    }
    Ok(start[0] == MANUFACTURER
        && matches!(start[1], 0 | 2 | 3 | 4 | 5)
        && start[2] <= 1
        && matches!(start[3], 1 | 2 | 4 | 8))
}

pub fn load_pcx(context: &mut IoContext) -> FileResult<()> {
    let path = paths::context_path(context);
    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let mut reader = BufReader::new(File::open(&path)?);

    let Some(header) = read_header(&mut reader)? else {
        return Err(FileError::NotRecognized);
    };
    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;

    // 256-color files keep their real palette in a marker-prefixed trailer.
    let mut vga_palette: Option<&[u8]> = None;
    if header.bits_per_pixel == 8 && header.nb_planes == 1 && body.len() > 769 {
        let trailer_start = body.len() - 769;
        if body[trailer_start] == VGA_PALETTE_MARKER {
            vga_palette = Some(&body[trailer_start + 1..]);
        }
    }
    let pixel_stream_len = body.len() - vga_palette.map_or(0, |_| 769);

    let scanline = header.bytes_per_line * header.nb_planes;
    if header.width > MAX_IMAGE_DIM || header.height > MAX_IMAGE_DIM || scanline > MAX_IMAGE_DIM * 4
    {
        return Err(FileError::Allocation);
    }
    let rows = decode_rle(
        &body[..pixel_stream_len],
        header.encoding == 1,
        scanline,
        header.height,
    );
    if rows.len() < header.height {
        return Err(FileError::NotRecognized);
    }

    let truecolor = header.bits_per_pixel == 8 && header.nb_planes == 3;
    context.pre_load(
        header.width,
        header.height,
        file_size,
        PixelRatio::Simple,
        if truecolor { 24 } else { header.bits_per_pixel * header.nb_planes as u8 },
    )?;

    match (header.bits_per_pixel, header.nb_planes) {
        (8, 1) => {
            match vga_palette {
                Some(bytes) => {
                    for (entry, rgb) in context.palette.iter_mut().zip(bytes.chunks_exact(3)) {
                        *entry = Rgb { r: rgb[0], g: rgb[1], b: rgb[2] };
                    }
                }
                // Old writers drop the trailer; a gray ramp beats garbage.
                None => {
                    for (index, entry) in context.palette.iter_mut().enumerate() {
                        let v = index as u8;
                        *entry = Rgb { r: v, g: v, b: v };
                    }
                }
            }
            for (y, row) in rows.iter().enumerate() {
                for x in 0..header.width.min(header.bytes_per_line) {
                    context.set_pixel(x, y, row[x]);
                }
            }
        }
        (8, 3) => {
            for (y, row) in rows.iter().enumerate() {
                for x in 0..header.width.min(header.bytes_per_line) {
                    context.set_pixel_24(
                        x,
                        y,
                        row[x],
                        row[header.bytes_per_line + x],
                        row[header.bytes_per_line * 2 + x],
                    );
                }
            }
        }
        (1, planes @ 2..=4) => {
            load_header_palette(context, &header, 1 << planes);
            for (y, row) in rows.iter().enumerate() {
                for x in 0..header.width.min(header.bytes_per_line * 8) {
                    let mut color = 0u8;
                    for plane in 0..planes {
                        let bit = (row[plane * header.bytes_per_line + x / 8] >> (7 - x % 8)) & 1;
                        color |= bit << plane;
                    }
                    context.set_pixel(x, y, color);
                }
            }
        }
        (1, 1) => {
            context.palette[0] = Rgb { r: 0, g: 0, b: 0 };
            context.palette[1] = Rgb { r: 255, g: 255, b: 255 };
            for (y, row) in rows.iter().enumerate() {
                for x in 0..header.width.min(header.bytes_per_line * 8) {
                    context.set_pixel(x, y, (row[x / 8] >> (7 - x % 8)) & 1);
                }
            }
        }
        (depth @ (2 | 4), 1) => {
            load_header_palette(context, &header, 1 << depth);
            let per_byte = 8 / depth as usize;
            let mask = ((1u16 << depth) - 1) as u8;
            for (y, row) in rows.iter().enumerate() {
                for x in 0..header.width.min(header.bytes_per_line * per_byte) {
                    let shift = 8 - depth as usize * (x % per_byte + 1);
                    context.set_pixel(x, y, (row[x / per_byte] >> shift) & mask);
                }
            }
        }
        _ => return Err(FileError::NotRecognized),
    }
    Ok(())
}

fn load_header_palette(context: &mut IoContext, header: &PcxHeader, colors: usize) {
    for (entry, rgb) in
        context.palette.iter_mut().take(colors).zip(header.ega_palette.chunks_exact(3))
    {
        *entry = Rgb { r: rgb[0], g: rgb[1], b: rgb[2] };
    }
}

/// Decode `height` scanlines of `scanline` bytes each. Runs may cross row
/// boundaries; short input yields fewer rows.
fn decode_rle(data: &[u8], compressed: bool, scanline: usize, height: usize) -> Vec<Vec<u8>> {
    let mut rows = Vec::with_capacity(height);
    let mut row = Vec::with_capacity(scanline);
    let mut push = |rows: &mut Vec<Vec<u8>>, row: &mut Vec<u8>, value: u8| {
        if rows.len() == height {
            return;
        }
        row.push(value);
        if row.len() == scanline {
            rows.push(std::mem::take(row));
        }
    };

    if !compressed {
        for &value in data {
            push(&mut rows, &mut row, value);
        }
        return rows;
    }
    let mut i = 0;
    while i < data.len() && rows.len() < height {
        let byte = data[i];
        i += 1;
        if byte >= 0xC0 {
            if i >= data.len() {
                break;
            }
            let value = data[i];
            i += 1;
            for _ in 0..(byte & 0x3F) {
                push(&mut rows, &mut row, value);
            }
        } else {
            push(&mut rows, &mut row, byte);
        }
    }
    rows
}

pub fn save_pcx(context: &mut IoContext) -> FileResult<()> {
    write_pcx(context).inspect_err(|_| {
        paths::remove_file(context);
    })
}

fn write_pcx(context: &mut IoContext) -> FileResult<()> {
    if context.width == 0 || context.width > u16::MAX as usize || context.height > u16::MAX as usize
    {
        return Err(FileError::NotRecognized);
    }
    let mut w = BufWriter::new(paths::open_file_write(context)?);
    let bytes_per_line = context.width + (context.width & 1);

    write_byte(&mut w, MANUFACTURER)?;
    write_byte(&mut w, 5)?; // version: VGA palette capable
    write_byte(&mut w, 1)?; // RLE
    write_byte(&mut w, 8)?;
    write_word_le(&mut w, 0)?; // x_min
    write_word_le(&mut w, 0)?; // y_min
    write_word_le(&mut w, (context.width - 1) as u16)?;
    write_word_le(&mut w, (context.height - 1) as u16)?;
    write_word_le(&mut w, 300)?; // dpi, nominal
    write_word_le(&mut w, 300)?;
    w.write_all(&[0u8; 48])?; // EGA palette, unused at 8bpp
    write_byte(&mut w, 0)?; // reserved
    write_byte(&mut w, 1)?; // planes
    write_word_le(&mut w, bytes_per_line as u16)?;
    write_word_le(&mut w, 1)?; // palette info: color
    w.write_all(&[0u8; 58])?; // filler up to 128 bytes

    let mut row = vec![0u8; bytes_per_line];
    for y in 0..context.height {
        for x in 0..context.width {
            row[x] = context.get_pixel(x, y);
        }
        encode_rle_row(&mut w, &row)?;
    }

    write_byte(&mut w, VGA_PALETTE_MARKER)?;
    for color in &context.palette {
        w.write_all(&[color.r, color.g, color.b])?;
    }
    w.flush()?;
    Ok(())
}

fn encode_rle_row(w: &mut impl Write, row: &[u8]) -> io::Result<()> {
    let mut i = 0;
    while i < row.len() {
        let value = row[i];
        let mut run = 1usize;
        while run < 63 && i + run < row.len() && row[i + run] == value {
            run += 1;
        }
        if run > 1 || value >= 0xC0 {
            write_byte(w, 0xC0 | run as u8)?;
        }
        write_byte(w, value)?;
        i += run;
    }
    Ok(())
}
