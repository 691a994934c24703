//! The load/save dispatcher. `load_image` opens the file, finds its
//! format (explicit hint first, then registry-order signature probing,
//! then the generic fallback decoder), runs the codec, and integrates the
//! result into the destination — truecolor quantization, palette merging,
//! brush remapping, preview palette polish. `save_image` validates the
//! layer situation against the target format (asking the caller to
//! flatten when needed) and runs the encoder.
//!
//! Integration only happens after a successful decode: a load that fails
//! outright leaves the previously-displayed image, brush and palette
//! exactly as they were.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::codecs::{self, fallback};
use crate::context::{
    Destination, DestinationKind, IoContext, SaveSource, GUI_COLORS,
};
use crate::error::{FileError, FileResult};
use crate::formats::{self, FormatDescriptor, DEFAULT_FORMAT, FILE_FORMATS};
use crate::page::{
    clamp_comment, fake_truecolor_palette, CycleRange, Document, ImageMode, Palette, Rgb,
    MAX_CYCLE_RANGES,
};
use crate::paths;
use crate::{log_err, log_info, log_warn};

/// Outcome of the "this format can't hold your layers" prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlattenDecision {
    /// Flatten the visible layers and save the composite.
    FlattenedCopy,
    /// Save only the current layer/frame.
    CurrentFrame,
    /// Abort the save.
    Cancel,
}

/// Load any known type of image (or palette) file into the context's
/// destination.
pub fn load_image(context: &mut IoContext) -> FileResult<()> {
    context.cycle_ranges.clear();

    // The document is reshaped in place during decode; keep what it held
    // in case nothing loadable comes out of the file.
    let snapshot = match &context.destination {
        Destination::MainImage { doc, .. } => Some(Document::clone(doc)),
        _ => None,
    };

    let result = probe_and_decode(context);
    let result = finish_load(context, result, snapshot);

    if let Err(e) = &result {
        // Previews and surfaces are throwaway; don't alarm anyone while
        // the user is just browsing a directory.
        match context.kind() {
            DestinationKind::Preview
            | DestinationKind::PreviewPalette
            | DestinationKind::Surface => {
                log_warn!("Unable to load file {} (error {})", context.file_name, e.code());
            }
            _ => {
                log_err!("Unable to load file {} (error {})", context.file_name, e.code());
            }
        }
        context.clear_owned_buffers();
    }
    result
}

/// Save the context's destination in its target format.
pub fn save_image(
    context: &mut IoContext,
    mut prompt: impl FnMut(ImageMode) -> FlattenDecision,
) -> FileResult<()> {
    let format = formats::lookup(context.format.unwrap_or(DEFAULT_FORMAT));

    let layered_conflict = matches!(
        &context.destination,
        Destination::MainImage { doc, .. }
            if doc.layers.len() > 1 && !format.supports_layers && !format.palette_only
    );
    if layered_conflict {
        let (mode, current_layer) = match &context.destination {
            Destination::MainImage { doc, .. } => (doc.image_mode, doc.current_layer),
            _ => unreachable!(),
        };
        let decision = match (mode, prompt(mode)) {
            (_, FlattenDecision::Cancel) => FlattenDecision::Cancel,
            // An animation has no meaningful flattened form; proceeding
            // means "current frame".
            (ImageMode::Animation, _) => FlattenDecision::CurrentFrame,
            (ImageMode::Layered, decision) => decision,
        };
        match decision {
            FlattenDecision::Cancel => {
                log_info!("Save of {} cancelled", context.file_name);
                return Err(FileError::NotRecognized);
            }
            FlattenDecision::CurrentFrame => {
                context.nb_layers = 1;
                context.current_layer = current_layer;
                if let Destination::MainImage { save_source, .. } = &mut context.destination {
                    *save_source = SaveSource::CurrentLayer;
                }
            }
            FlattenDecision::FlattenedCopy => {
                context.nb_layers = 1;
                context.current_layer = 0;
                if let Destination::MainImage { doc, save_source } = &mut context.destination {
                    *save_source = SaveSource::Flattened(doc.flattened());
                }
            }
        }
    }

    let Some(save) = format.save else {
        // A format without an encoder should never have been selectable.
        log_err!("Format {} has no encoder", format.label.trim());
        return Err(FileError::NotRecognized);
    };
    let result = save(context);
    if let Err(e) = &result {
        log_err!("Unable to save file {} (error {})", context.file_name, e.code());
    }
    result
}

// ---------------------------------------------------------------------------
// Format probing
// ---------------------------------------------------------------------------

fn probe_and_decode(context: &mut IoContext) -> FileResult<()> {
    let mut file = match paths::open_file_read(context) {
        Ok(file) => file,
        Err(e) => {
            // Unreadable is a different failure than unrecognized; report
            // it right away.
            log_err!("Cannot open {} for reading: {}", context.file_name, e);
            return Err(FileError::Io(e));
        }
    };

    let mut matched: Option<&'static FormatDescriptor> = None;
    if let Some(format) = context.format {
        let descriptor = formats::lookup(format);
        if let Some(test) = descriptor.test
            && run_test(test, &mut file)
        {
            matched = Some(descriptor);
        }
    }
    if matched.is_none() {
        for descriptor in &FILE_FORMATS {
            let Some(test) = descriptor.test else { continue };
            if run_test(test, &mut file) {
                matched = Some(descriptor);
                break;
            }
        }
    }
    drop(file);

    match matched {
        Some(descriptor) => {
            context.format = Some(descriptor.identifier);
            match descriptor.load {
                Some(load) => load(context),
                None => Err(FileError::NotRecognized),
            }
        }
        None => {
            // Nothing claimed the file; let the generic decoder try.
            context.format = Some(DEFAULT_FORMAT);
            fallback::load_generic(context)
        }
    }
}

/// Rewind and run one signature test. Read errors count as "no match" —
/// the next format gets its turn.
fn run_test(test: formats::TestFn, file: &mut File) -> bool {
    if file.seek(SeekFrom::Start(0)).is_err() {
        return false;
    }
    test(file).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Post-load integration
// ---------------------------------------------------------------------------

fn finish_load(
    context: &mut IoContext,
    mut result: FileResult<()>,
    snapshot: Option<Document>,
) -> FileResult<()> {
    // A truecolor decode parked its pixels in the side buffer; turn them
    // into indexed data now. Quantization failure is its own error code.
    if context.truecolor.is_some() {
        if result.is_ok() {
            result = quantize_truecolor(context);
        } else {
            context.truecolor = None;
        }
    }

    if result.is_ok()
        && context.bpp <= 8
        && context.settings.safety_colors
        && context.kind() == DestinationKind::MainImage
    {
        inject_safety_colors(context);
    }

    match context.kind() {
        DestinationKind::MainImage => {
            // Only a did-not-even-decode failure (code 1) leaves the old
            // image intact; quantization/allocation failures happen after
            // pixels already landed, so the merged state stands, marked
            // modified.
            if matches!(&result, Err(e) if e.code() == 1) {
                if let (Some(snapshot), Some(doc)) = (snapshot, context.doc_mut()) {
                    *doc = snapshot;
                }
            } else {
                merge_into_document(context, result.is_ok());
            }
        }
        DestinationKind::Palette => {
            if result.is_ok() {
                let palette = context.palette;
                if let Some(doc) = context.doc_mut() {
                    doc.palette = palette;
                }
            }
        }
        DestinationKind::Brush => {
            if result.is_ok() {
                install_brush(context);
            }
        }
        DestinationKind::Surface => {
            if result.is_ok() {
                let palette = context.palette;
                if let Destination::Surface { surface: Some(surface) } = &mut context.destination {
                    surface.palette = palette;
                }
            }
        }
        DestinationKind::Preview | DestinationKind::PreviewPalette => {
            if result.is_ok() {
                polish_preview_palette(context);
            }
        }
    }
    result
}

/// Reduce the 24-bit side buffer to 256 colors and write the indices into
/// the destination, replacing the context palette with the quantized one.
fn quantize_truecolor(context: &mut IoContext) -> FileResult<()> {
    let Some(buffer) = context.truecolor.take() else { return Ok(()) };
    if buffer.is_empty() || context.width == 0 {
        return Err(FileError::Quantization);
    }

    let mut samples = Vec::with_capacity(buffer.len() * 4);
    for pixel in &buffer {
        samples.extend_from_slice(&[pixel.r, pixel.g, pixel.b, 255]);
    }
    let quantizer = color_quant::NeuQuant::new(10, 256, &samples);

    for (index, entry) in context.palette.iter_mut().enumerate() {
        *entry = match quantizer.lookup(index) {
            Some(color) => Rgb { r: color[0], g: color[1], b: color[2] },
            None => Rgb::default(),
        };
    }
    let width = context.width;
    for (offset, pixel) in buffer.iter().enumerate() {
        let index = quantizer.index_of(&[pixel.r, pixel.g, pixel.b, 255]) as u8;
        context.set_pixel(offset % width, offset / width, index);
    }
    Ok(())
}

/// Transfer everything the context collected into the owning document.
fn merge_into_document(context: &mut IoContext, loaded_cleanly: bool) {
    let palette = context.palette;
    let palette_only =
        context.format.map(|f| formats::lookup(f).palette_only).unwrap_or(false);
    let mut comment = context.comment.clone();
    clamp_comment(&mut comment);
    let transparent_color = context.transparent_color;
    let background_transparent = context.background_transparent;
    let nb_layers = context.nb_layers;
    let format = context.format.unwrap_or(DEFAULT_FORMAT);
    let ranges = context.cycle_ranges.clone();
    // A replayed backup points back at the file it was a backup *of*.
    let (file_name, file_directory) = match (
        context.original_file_name.as_deref().filter(|n| !n.is_empty()),
        context.original_file_directory.as_deref(),
    ) {
        (Some(name), Some(dir)) => (name.to_string(), dir.to_path_buf()),
        _ => (context.file_name.clone(), context.file_directory.clone()),
    };

    let Some(doc) = context.doc_mut() else { return };
    doc.palette = palette;
    if palette_only {
        // Palette files replace the colors and nothing else.
        return;
    }
    doc.file_name = file_name;
    doc.file_directory = file_directory;
    doc.file_format = format;
    doc.modified = !loaded_cleanly;
    doc.transparent_color = transparent_color;
    doc.background_transparent = background_transparent;
    doc.comment = comment;
    match doc.image_mode {
        ImageMode::Animation => doc.current_layer = 0,
        ImageMode::Layered => {
            doc.current_layer = nb_layers.saturating_sub(1);
            doc.layers_visible = if doc.current_layer >= 31 {
                u32::MAX
            } else {
                (2u32 << doc.current_layer) - 1
            };
        }
    }
    doc.cycle_ranges = [CycleRange::default(); MAX_CYCLE_RANGES];
    for (slot, range) in doc.cycle_ranges.iter_mut().zip(ranges) {
        *slot = range;
    }
}

/// Keep the GUI legible after a load: if at most 251 colors are in use,
/// make sure something close to each of the four GUI colors exists in the
/// palette, recycling unused slots from the top down. Best effort — with
/// no free slot the palette stays as loaded.
fn inject_safety_colors(context: &mut IoContext) {
    let mut usage = match &context.destination {
        Destination::MainImage { doc, .. } => doc.color_usage(),
        _ => return,
    };
    if usage.iter().filter(|&&used| used).count() >= 252 {
        return;
    }
    // From white to black.
    for gui_color in GUI_COLORS.iter().rev() {
        // A near match (low two bits ignored) is good enough.
        let near = |a: &Rgb| {
            (a.r | 3) == (gui_color.r | 3)
                && (a.g | 3) == (gui_color.g | 3)
                && (a.b | 3) == (gui_color.b | 3)
        };
        if context.palette.iter().rev().any(near) {
            continue;
        }
        if let Some(slot) = (0..256).rev().find(|&c| !usage[c]) {
            context.palette[slot] = *gui_color;
            usage[slot] = true;
        }
    }
}

/// Make room for the GUI in a preview's palette: when exactly four unused
/// slots can be found (top down), they take the four GUI colors.
fn polish_preview_palette(context: &mut IoContext) {
    if context.kind() == DestinationKind::Preview && context.bpp > 8 {
        context.palette = fake_truecolor_palette();
    }
    let unused: Vec<usize> = match &context.destination {
        Destination::Preview(state) | Destination::PreviewPalette(state) => {
            (0..256).rev().filter(|&c| !state.usage[c]).take(4).collect()
        }
        _ => return,
    };
    if unused.len() == 4 {
        for (gui_color, &slot) in GUI_COLORS.iter().zip(unused.iter()) {
            context.palette[slot] = *gui_color;
        }
    }
}

/// Move a successfully decoded brush into the caller's brush slot,
/// remapping its palette onto the colors currently on screen. The
/// declared transparent color follows the remap.
fn install_brush(context: &mut IoContext) {
    let decoded_palette = context.palette;
    let (width, height) = (context.width, context.height);
    let transparent_color = context.transparent_color;
    let background_transparent = context.background_transparent;

    let Destination::Brush { brush, screen_palette, buffer } = &mut context.destination else {
        return;
    };
    let Some(pixels) = buffer.take() else { return };

    let mut index_map = [0u8; 256];
    for (index, color) in decoded_palette.iter().enumerate() {
        index_map[index] = nearest_color(screen_palette, *color);
    }
    brush.width = width;
    brush.height = height;
    brush.pixels = pixels.iter().map(|&i| index_map[i as usize]).collect();
    if background_transparent {
        brush.transparent_color = index_map[transparent_color as usize];
    }
}

/// Index of the palette entry closest to `color` (squared RGB distance).
fn nearest_color(palette: &Palette, color: Rgb) -> u8 {
    let mut best = 0usize;
    let mut best_distance = u32::MAX;
    for (index, entry) in palette.iter().enumerate() {
        let dr = entry.r as i32 - color.r as i32;
        let dg = entry.g as i32 - color.g as i32;
        let db = entry.b as i32 - color.b as i32;
        let distance = (dr * dr + dg * dg + db * db) as u32;
        if distance < best_distance {
            best_distance = distance;
            best = index;
        }
    }
    best as u8
}

// ---------------------------------------------------------------------------
// Emergency backup
// ---------------------------------------------------------------------------

/// Absolute last-chance save, for when the program is already going down:
/// raw IMG dump, no context, no dispatcher, nothing clever left to fail.
pub fn emergency_backup(
    directory: &Path,
    file_name: &str,
    pixels: &[u8],
    width: usize,
    height: usize,
    palette: &Palette,
) -> std::io::Result<()> {
    if width == 0 || height == 0 || pixels.len() < width * height {
        return Ok(());
    }
    let mut w = BufWriter::new(File::create(directory.join(file_name))?);
    codecs::img::write_header(&mut w, width, height, palette)?;
    w.write_all(&pixels[..width * height])?;
    w.flush()
}
