//! PNG codec, via the `png` crate. Loads indexed and grayscale files as
//! palette indices (any bit depth), truecolor files through the 24-bit
//! side buffer, and honors pHYs pixel shape and the `Comment` tEXt chunk.
//! Saves are always 8-bit indexed — that is what the canvas holds.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};

use crate::context::{IoContext, PixelRatio};
use crate::error::{FileError, FileResult};
use crate::page::{clamp_comment, Rgb};
use crate::paths;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub fn test_png(file: &mut File) -> io::Result<bool> {
    let mut signature = [0u8; 8];
    if file.read_exact(&mut signature).is_err() {
        return Ok(false);
    }
    Ok(signature == PNG_SIGNATURE)
}

pub fn load_png(context: &mut IoContext) -> FileResult<()> {
    let path = paths::context_path(context);
    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let mut decoder = png::Decoder::new(BufReader::new(File::open(&path)?));
    // Keep the raw representation: indexed stays indexed, packed bits stay
    // packed. Expansion would throw the palette away.
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().map_err(decode_error)?;

    let (palette_bytes, trns, ratio, comment) = {
        let info = reader.info();
        let palette_bytes = info.palette.as_ref().map(|p| p.to_vec());
        let trns = info.trns.as_ref().map(|t| t.to_vec());
        let ratio = info
            .pixel_dims
            .map(|d| match d.xppu.cmp(&d.yppu) {
                std::cmp::Ordering::Less => PixelRatio::Wide,
                std::cmp::Ordering::Greater => PixelRatio::Tall,
                std::cmp::Ordering::Equal => PixelRatio::Simple,
            })
            .unwrap_or(PixelRatio::Simple);
        let comment = info
            .uncompressed_latin1_text
            .iter()
            .find(|c| c.keyword == "Comment")
            .map(|c| c.text.clone());
        (palette_bytes, trns, ratio, comment)
    };

    let mut buf = vec![0u8; reader.output_buffer_size()];
    let out = reader.next_frame(&mut buf).map_err(decode_error)?;
    let (width, height) = (out.width as usize, out.height as usize);
    let depth = out.bit_depth as u8;
    let line_size = out.line_size;

    match out.color_type {
        png::ColorType::Indexed => {
            context.pre_load(width, height, file_size, ratio, depth)?;
            if let Some(bytes) = &palette_bytes {
                for (entry, rgb) in context.palette.iter_mut().zip(bytes.chunks_exact(3)) {
                    *entry = Rgb { r: rgb[0], g: rgb[1], b: rgb[2] };
                }
            }
            // A mostly-transparent tRNS entry becomes the background color.
            if let Some(alpha) = &trns
                && let Some(index) = alpha.iter().position(|&a| a < 128)
            {
                context.transparent_color = index as u8;
                context.background_transparent = true;
            }
            for y in 0..height {
                unpack_indexed_row(&buf[y * line_size..], depth, width, |x, index| {
                    context.set_pixel(x, y, index)
                });
            }
        }
        png::ColorType::Grayscale if depth <= 8 => {
            context.pre_load(width, height, file_size, ratio, depth)?;
            let levels = (1u16 << depth) as usize;
            for (index, entry) in context.palette.iter_mut().take(levels).enumerate() {
                let value = (index * 255 / (levels - 1).max(1)) as u8;
                *entry = Rgb { r: value, g: value, b: value };
            }
            for y in 0..height {
                unpack_indexed_row(&buf[y * line_size..], depth, width, |x, index| {
                    context.set_pixel(x, y, index)
                });
            }
        }
        color_type => {
            // Everything else is truecolor for our purposes; 16-bit
            // channels keep their high byte.
            let samples = match color_type {
                png::ColorType::Grayscale => 1,
                png::ColorType::GrayscaleAlpha => 2,
                png::ColorType::Rgb => 3,
                png::ColorType::Rgba => 4,
                png::ColorType::Indexed => unreachable!(),
            };
            let bytes_per_sample = if depth == 16 { 2 } else { 1 };
            context.pre_load(width, height, file_size, ratio, 24)?;
            for y in 0..height {
                let row = &buf[y * line_size..];
                for x in 0..width {
                    let p = x * samples * bytes_per_sample;
                    let sample = |i: usize| row[p + i * bytes_per_sample];
                    let (r, g, b) = match color_type {
                        png::ColorType::Rgb | png::ColorType::Rgba => {
                            (sample(0), sample(1), sample(2))
                        }
                        _ => (sample(0), sample(0), sample(0)),
                    };
                    context.set_pixel_24(x, y, r, g, b);
                }
            }
        }
    }

    if let Some(comment) = comment {
        context.comment = comment;
        clamp_comment(&mut context.comment);
    }
    Ok(())
}

pub fn save_png(context: &mut IoContext) -> FileResult<()> {
    write_png(context).inspect_err(|_| {
        paths::remove_file(context);
    })
}

fn write_png(context: &mut IoContext) -> FileResult<()> {
    let file = paths::open_file_write(context)?;
    let mut encoder =
        png::Encoder::new(BufWriter::new(file), context.width as u32, context.height as u32);
    encoder.set_color(png::ColorType::Indexed);
    encoder.set_depth(png::BitDepth::Eight);

    let mut flat_palette = Vec::with_capacity(768);
    for color in &context.palette {
        flat_palette.extend_from_slice(&[color.r, color.g, color.b]);
    }
    encoder.set_palette(flat_palette);

    if context.background_transparent {
        let mut alpha = vec![255u8; 256];
        alpha[context.transparent_color as usize] = 0;
        encoder.set_trns(alpha);
    }
    if !context.comment.is_empty() {
        let mut comment = context.comment.clone();
        clamp_comment(&mut comment);
        encoder
            .add_text_chunk("Comment".to_string(), comment)
            .map_err(encode_error)?;
    }

    let mut writer = encoder.write_header().map_err(encode_error)?;
    let mut data = Vec::with_capacity(context.width * context.height);
    context.set_saving_layer(context.current_layer);
    for y in 0..context.height {
        for x in 0..context.width {
            data.push(context.get_pixel(x, y));
        }
    }
    writer.write_image_data(&data).map_err(encode_error)?;
    writer.finish().map_err(encode_error)?;
    Ok(())
}

/// Walk one row of MSB-first packed indices.
fn unpack_indexed_row(row: &[u8], depth: u8, width: usize, mut put: impl FnMut(usize, u8)) {
    debug_assert!(matches!(depth, 1 | 2 | 4 | 8));
    let per_byte = 8 / depth as usize;
    let mask = ((1u16 << depth) - 1) as u8;
    for x in 0..width {
        let byte = row[x / per_byte];
        let shift = 8 - depth as usize * (x % per_byte + 1);
        put(x, (byte >> shift) & mask);
    }
}

fn decode_error(e: png::DecodingError) -> FileError {
    match e {
        png::DecodingError::IoError(e) => FileError::Io(e),
        _ => FileError::NotRecognized,
    }
}

fn encode_error(e: png::EncodingError) -> FileError {
    match e {
        png::EncodingError::IoError(e) => FileError::Io(e),
        _ => FileError::NotRecognized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Settings;
    use crate::page::Document;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("retropaint-png-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn indexed_round_trip_keeps_pixels_palette_and_comment() {
        let dir = scratch_dir("rt");
        let mut doc = Document::new(3, 2);
        doc.layers[0].pixels = vec![0, 1, 2, 2, 1, 0];
        doc.palette[0] = Rgb { r: 10, g: 20, b: 30 };
        doc.palette[1] = Rgb { r: 40, g: 50, b: 60 };
        doc.palette[2] = Rgb { r: 70, g: 80, b: 90 };
        doc.comment = "three colors".to_string();
        doc.transparent_color = 2;
        doc.background_transparent = true;

        let mut ctx = IoContext::for_main_image(&mut doc, "rt.png", &dir, Settings::default());
        save_png(&mut ctx).unwrap();
        drop(ctx);

        let mut loaded = Document::new(1, 1);
        let mut ctx = IoContext::for_main_image(&mut loaded, "rt.png", &dir, Settings::default());
        load_png(&mut ctx).unwrap();
        assert_eq!(ctx.width, 3);
        assert_eq!(ctx.height, 2);
        assert_eq!(ctx.comment, "three colors");
        assert_eq!(ctx.transparent_color, 2);
        assert!(ctx.background_transparent);
        assert_eq!(ctx.palette[1], Rgb { r: 40, g: 50, b: 60 });
        drop(ctx);
        assert_eq!(loaded.layers[0].pixels, vec![0, 1, 2, 2, 1, 0]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn packed_row_unpacking_is_msb_first() {
        let mut out = Vec::new();
        unpack_indexed_row(&[0b1010_0000], 1, 4, |_, v| out.push(v));
        assert_eq!(out, vec![1, 0, 1, 0]);

        out.clear();
        unpack_indexed_row(&[0x12, 0x34], 4, 4, |_, v| out.push(v));
        assert_eq!(out, vec![1, 2, 3, 4]);
    }
}
