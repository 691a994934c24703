//! GIF codec. Layers (or animation frames) map to GIF frames; the global
//! palette carries the 256 colors; two application extensions carry what
//! plain GIF cannot: the original path of a safety backup, and the color
//! cycling ranges.
//!
//! Pixel work goes through the `gif` crate. Its high-level decoder does
//! not surface comment or application extensions, so `scan_metadata`
//! walks the block structure once before decoding to pick those up.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::PathBuf;

use crate::context::{Destination, IoContext, PixelRatio};
use crate::error::{FileError, FileResult};
use crate::page::{clamp_comment, CycleRange, ImageMode, Rgb};
use crate::paths;

/// Application extension carrying the original file name + directory of a
/// safety backup (11-byte application identifier block).
const APP_PATH_ID: [u8; 11] = *b"RPNTPATH1.0";
/// Application extension carrying color cycling ranges, 4 bytes per range.
const APP_CRNG_ID: [u8; 11] = *b"RPNTCRNG1.0";

pub fn test_gif(file: &mut File) -> io::Result<bool> {
    let mut signature = [0u8; 6];
    if file.read_exact(&mut signature).is_err() {
        return Ok(false);
    }
    Ok(&signature == b"GIF87a" || &signature == b"GIF89a")
}

pub fn load_gif(context: &mut IoContext) -> FileResult<()> {
    let path = paths::context_path(context);
    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    // Extensions first; a malformed tail must not sink the pixel decode.
    let metadata = File::open(&path)
        .ok()
        .and_then(|f| scan_metadata(&mut BufReader::new(f)).ok())
        .unwrap_or_default();

    let mut options = gif::DecodeOptions::new();
    options.set_color_output(gif::ColorOutput::Indexed);
    let mut decoder = options
        .read_info(BufReader::new(File::open(&path)?))
        .map_err(decode_error)?;

    let width = decoder.width() as usize;
    let height = decoder.height() as usize;
    let mut palette = [Rgb::default(); 256];
    if let Some(global) = decoder.global_palette() {
        for (entry, rgb) in palette.iter_mut().zip(global.chunks_exact(3)) {
            *entry = Rgb { r: rgb[0], g: rgb[1], b: rgb[2] };
        }
    }
    let background = decoder.bg_color().unwrap_or(0).min(255) as u8;

    context.pre_load(width, height, file_size, PixelRatio::Simple, 8)?;
    context.palette = palette;

    let mut layer = 0usize;
    let mut animated = false;
    while let Some(frame) = decoder.read_next_frame().map_err(decode_error)? {
        let frame_width = frame.width as usize;
        if frame_width == 0 {
            continue;
        }
        context.set_loading_layer(layer);
        if layer == 0 {
            context.fill_canvas(background);
            if let Some(transparent) = frame.transparent {
                context.transparent_color = transparent;
                context.background_transparent = true;
            }
        }
        if frame.delay > 0 {
            animated = true;
        }
        context.set_frame_duration(frame.delay as u32 * 10);
        let (left, top) = (frame.left as usize, frame.top as usize);
        // Local frame palettes are rare outside broken optimizers; the
        // indices are used as-is against the global palette.
        for (offset, &color) in frame.buffer.iter().enumerate() {
            context.set_pixel(left + offset % frame_width, top + offset / frame_width, color);
        }
        layer += 1;
    }
    if layer == 0 {
        return Err(FileError::NotRecognized);
    }
    if layer > 1 && animated {
        context.set_image_mode(ImageMode::Animation);
    }

    context.comment = metadata.comment;
    clamp_comment(&mut context.comment);
    if metadata.original_file_name.as_deref().is_some_and(|n| !n.is_empty()) {
        context.original_file_name = metadata.original_file_name;
        context.original_file_directory = metadata.original_file_directory;
    }
    for range in metadata.cycle_ranges {
        context.add_cycle_range(range);
    }
    Ok(())
}

pub fn save_gif(context: &mut IoContext) -> FileResult<()> {
    write_gif(context).inspect_err(|_| {
        // Never leave a half-written file behind.
        paths::remove_file(context);
    })
}

fn write_gif(context: &mut IoContext) -> FileResult<()> {
    if context.width > u16::MAX as usize || context.height > u16::MAX as usize {
        return Err(FileError::NotRecognized);
    }
    let (width, height) = (context.width as u16, context.height as u16);

    let mut flat_palette = Vec::with_capacity(768);
    for color in &context.palette {
        flat_palette.extend_from_slice(&[color.r, color.g, color.b]);
    }

    let file = paths::open_file_write(context)?;
    let mut encoder = gif::Encoder::new(BufWriter::new(file), width, height, &flat_palette)
        .map_err(encode_error)?;

    let animated = matches!(
        &context.destination,
        Destination::MainImage { doc, .. } if doc.image_mode == ImageMode::Animation
    );
    if animated {
        encoder.set_repeat(gif::Repeat::Infinite).map_err(encode_error)?;
    }

    if !context.comment.is_empty() {
        let mut comment = context.comment.clone();
        clamp_comment(&mut comment);
        encoder.write_raw_extension(gif::Extension::Comment.into(), &[comment.as_bytes()])?;
    }
    if let Some(name) = context.original_file_name.as_deref().filter(|n| !n.is_empty()) {
        let directory = context
            .original_file_directory
            .as_deref()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = name.as_bytes().to_vec();
        let mut dir_bytes = directory.into_bytes();
        name.truncate(255);
        dir_bytes.truncate(255);
        encoder.write_raw_extension(
            gif::Extension::Application.into(),
            &[APP_PATH_ID.as_slice(), &name, &dir_bytes],
        )?;
    }
    if !context.cycle_ranges.is_empty() {
        let mut data = Vec::with_capacity(context.cycle_ranges.len() * 4);
        for range in &context.cycle_ranges {
            data.extend_from_slice(&[range.start, range.end, range.inverse as u8, range.speed]);
        }
        encoder
            .write_raw_extension(gif::Extension::Application.into(), &[APP_CRNG_ID.as_slice(), &data])?;
    }

    for layer in 0..context.nb_layers {
        context.set_saving_layer(layer);
        let mut buffer = Vec::with_capacity(context.width * context.height);
        for y in 0..context.height {
            for x in 0..context.width {
                buffer.push(context.get_pixel(x, y));
            }
        }
        let frame = gif::Frame {
            width,
            height,
            delay: (context.get_frame_duration() / 10).min(u16::MAX as u32) as u16,
            transparent: context.background_transparent.then_some(context.transparent_color),
            buffer: Cow::Owned(buffer),
            ..gif::Frame::default()
        };
        encoder.write_frame(&frame).map_err(encode_error)?;
    }
    Ok(())
}

fn decode_error(e: gif::DecodingError) -> FileError {
    match e {
        gif::DecodingError::Io(e) => FileError::Io(e),
        _ => FileError::NotRecognized,
    }
}

fn encode_error(e: gif::EncodingError) -> FileError {
    match e {
        gif::EncodingError::Io(e) => FileError::Io(e),
        _ => FileError::NotRecognized,
    }
}

// ---------------------------------------------------------------------------
// Extension scan
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GifMetadata {
    comment: String,
    original_file_name: Option<String>,
    original_file_directory: Option<PathBuf>,
    cycle_ranges: Vec<CycleRange>,
}

/// Walk the GIF block structure collecting comment and application
/// extensions. Stops quietly at the trailer or at a truncation.
fn scan_metadata(r: &mut impl Read) -> io::Result<GifMetadata> {
    let mut meta = GifMetadata::default();

    let header: [u8; 6] = read_array(r)?;
    if &header[..3] != b"GIF" {
        return Ok(meta);
    }
    let descriptor: [u8; 7] = read_array(r)?;
    let flags = descriptor[4];
    if flags & 0x80 != 0 {
        skip(r, 3 << ((flags & 0x07) as usize + 1))?;
    }

    loop {
        let mut introducer = [0u8; 1];
        if r.read_exact(&mut introducer).is_err() {
            break;
        }
        match introducer[0] {
            0x3B => break, // trailer
            0x21 => {
                let label = read_array::<1>(r)?[0];
                let blocks = read_sub_blocks(r)?;
                match label {
                    0xFE => {
                        for block in &blocks {
                            meta.comment.push_str(&latin1(block));
                        }
                    }
                    0xFF => {
                        if blocks.first().map(Vec::as_slice) == Some(APP_PATH_ID.as_slice()) {
                            meta.original_file_name =
                                blocks.get(1).map(|b| latin1(b));
                            meta.original_file_directory =
                                blocks.get(2).map(|b| PathBuf::from(latin1(b)));
                        } else if blocks.first().map(Vec::as_slice) == Some(APP_CRNG_ID.as_slice())
                            && let Some(data) = blocks.get(1)
                        {
                            for chunk in data.chunks_exact(4) {
                                meta.cycle_ranges.push(CycleRange {
                                    start: chunk[0],
                                    end: chunk[1],
                                    inverse: chunk[2] != 0,
                                    speed: chunk[3],
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            0x2C => {
                // Image descriptor: geometry, optional local palette, LZW
                // code size, then the compressed sub-blocks.
                let descriptor: [u8; 9] = read_array(r)?;
                let flags = descriptor[8];
                if flags & 0x80 != 0 {
                    skip(r, 3 << ((flags & 0x07) as usize + 1))?;
                }
                skip(r, 1)?;
                read_sub_blocks(r)?;
            }
            _ => break, // junk — stop scanning, the decoder will complain
        }
    }
    Ok(meta)
}

fn read_array<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_sub_blocks(r: &mut impl Read) -> io::Result<Vec<Vec<u8>>> {
    let mut blocks = Vec::new();
    loop {
        let len = read_array::<1>(r)?[0] as usize;
        if len == 0 {
            return Ok(blocks);
        }
        let mut block = vec![0u8; len];
        r.read_exact(&mut block)?;
        blocks.push(block);
    }
}

fn skip(r: &mut impl Read, count: usize) -> io::Result<()> {
    io::copy(&mut r.take(count as u64), &mut io::sink())?;
    Ok(())
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Settings;
    use crate::page::Document;
    use std::io::Write;
    use std::path::Path;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("retropaint-gif-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn signature_test_rejects_other_files() {
        let dir = scratch_dir("sig");
        let path = dir.join("not.gif");
        File::create(&path).unwrap().write_all(b"PNG is not a gif").unwrap();
        assert!(!test_gif(&mut File::open(&path).unwrap()).unwrap());

        let gif_path = dir.join("ok.gif");
        File::create(&gif_path).unwrap().write_all(b"GIF89a\x01\x00\x01\x00").unwrap();
        assert!(test_gif(&mut File::open(&gif_path).unwrap()).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn metadata_extensions_survive_a_round_trip() {
        let dir = scratch_dir("meta");
        let mut doc = Document::new(4, 2);
        doc.layers[0].pixels = vec![0, 1, 2, 3, 3, 2, 1, 0];
        doc.comment = "cycling test".to_string();
        doc.cycle_ranges[0] = CycleRange { start: 16, end: 31, inverse: true, speed: 12 };

        let mut ctx = IoContext::for_main_image(&mut doc, "meta.gif", &dir, Settings::default());
        ctx.original_file_name = Some("original.gif".to_string());
        ctx.original_file_directory = Some(PathBuf::from("/somewhere/else"));
        save_gif(&mut ctx).unwrap();
        drop(ctx);

        let meta =
            scan_metadata(&mut BufReader::new(File::open(dir.join("meta.gif")).unwrap())).unwrap();
        assert_eq!(meta.comment, "cycling test");
        assert_eq!(meta.original_file_name.as_deref(), Some("original.gif"));
        assert_eq!(meta.original_file_directory.as_deref(), Some(Path::new("/somewhere/else")));
        assert_eq!(
            meta.cycle_ranges,
            vec![CycleRange { start: 16, end: 31, inverse: true, speed: 12 }]
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
