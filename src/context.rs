//! The I/O context: a transient descriptor binding one load or save
//! operation to a destination. Every codec writes pixels through the same
//! four calls (`set_pixel`, `set_pixel_24`, `get_pixel`, `fill_canvas`);
//! what actually happens depends on the destination variant — direct
//! writes into the document, an owned brush buffer, a downsampled preview,
//! a free-standing surface, or nothing at all for palette files.
//!
//! A context is built by one of the `for_*` constructors, passed through
//! exactly one `load_image`/`save_image` call, and then dropped. Owned
//! buffers go with it.

use std::path::{Path, PathBuf};

use crate::error::{FileError, FileResult};
use crate::formats::FileFormat;
use crate::page::{
    rgb_to_332, CycleRange, Document, ImageMode, Palette, Rgb, MAX_CYCLE_RANGES, MAX_IMAGE_DIM,
};

/// Fixed preview viewport, in menu-scale units.
pub const PREVIEW_WIDTH: usize = 120;
pub const PREVIEW_HEIGHT: usize = 80;

/// Pixel shape class of a source image (or of the display).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelRatio {
    #[default]
    Simple,
    /// Pixels twice as wide as tall (e.g. Amiga low-res laced sources).
    Wide,
    /// Pixels twice as tall as wide (e.g. Atari ST medium-res sources).
    Tall,
}

/// The four colors the GUI needs to stay legible, darkest first. Values
/// keep their low two bits clear so the near-match test in the dispatcher
/// can ignore those bits.
pub const GUI_COLORS: [Rgb; 4] = [
    Rgb { r: 0, g: 0, b: 0 },
    Rgb { r: 84, g: 84, b: 84 },
    Rgb { r: 168, g: 168, b: 168 },
    Rgb { r: 252, g: 252, b: 252 },
];

/// Engine-level knobs, normally owned by the configuration layer.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Display-density multiplier applied to the preview viewport.
    pub menu_scale_x: usize,
    pub menu_scale_y: usize,
    /// When set, the two preview axes may sample at different
    /// granularities; otherwise the larger factor wins on both.
    pub maximize_preview: bool,
    /// Inject GUI colors into mostly-unused palettes after a load.
    pub safety_colors: bool,
    /// Pixel shape of the current display mode.
    pub display_ratio: PixelRatio,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            menu_scale_x: 1,
            menu_scale_y: 1,
            maximize_preview: false,
            safety_colors: true,
            display_ratio: PixelRatio::Simple,
        }
    }
}

/// The user's brush slot — owned by the caller, filled by a brush load.
pub struct Brush {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
    pub transparent_color: u8,
}

impl Brush {
    pub fn new(width: usize, height: usize) -> Self {
        Brush { width, height, pixels: vec![0; width * height], transparent_color: 0 }
    }
}

/// A free-standing 8-bit pixel surface with its own color table, for
/// callers that want an image without touching the document (e.g. skin
/// and texture loading).
pub struct IndexedSurface {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
    pub palette: Palette,
}

impl IndexedSurface {
    fn new(width: usize, height: usize) -> FileResult<Self> {
        if width == 0 || height == 0 || width > MAX_IMAGE_DIM || height > MAX_IMAGE_DIM {
            return Err(FileError::Allocation);
        }
        Ok(IndexedSurface {
            width,
            height,
            pixels: vec![0; width * height],
            palette: [Rgb::default(); 256],
        })
    }
}

/// Scratch state of a preview destination.
pub struct PreviewState {
    /// Downsampled bitmap, `PREVIEW_WIDTH*sx` wide; allocated by
    /// `pre_load`, absent for palette-only previews.
    pub bitmap: Option<Vec<u8>>,
    /// Which palette indices the sampled pixels actually use.
    pub usage: [bool; 256],
    pub factor_x: usize,
    pub factor_y: usize,
}

impl Default for PreviewState {
    fn default() -> Self {
        PreviewState {
            bitmap: None,
            usage: [false; 256],
            factor_x: 0,
            factor_y: 0,
        }
    }
}

/// What part of the document a save reads from.
pub enum SaveSource {
    AllLayers,
    CurrentLayer,
    /// Flattened copy, produced when the target format has no layers.
    Flattened(Vec<u8>),
}

/// Where decoded pixels land (and where saved pixels come from).
pub enum Destination<'a> {
    /// The document itself: pixel writes go straight into its layers.
    MainImage { doc: &'a mut Document, save_source: SaveSource },
    /// The user brush: decoded into an owned buffer, remapped into the
    /// caller's brush slot after a successful load.
    Brush { brush: &'a mut Brush, screen_palette: Palette, buffer: Option<Vec<u8>> },
    /// File-selector thumbnail.
    Preview(PreviewState),
    /// An owned surface, handed to the caller on success.
    Surface { surface: Option<IndexedSurface> },
    /// Palette-only load into the document.
    Palette { doc: &'a mut Document },
    /// Palette-only preview; tracks usage, never stores pixels.
    PreviewPalette(PreviewState),
}

/// Destination kind without the payload, for dispatch decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestinationKind {
    MainImage,
    Brush,
    Preview,
    Surface,
    Palette,
    PreviewPalette,
}

/// The context itself. One load or save operation, single owner, short
/// lived.
pub struct IoContext<'a> {
    pub destination: Destination<'a>,
    pub file_name: String,
    pub file_directory: PathBuf,
    /// Where the image originally came from, when this file is a safety
    /// backup of something loaded from elsewhere.
    pub original_file_name: Option<String>,
    pub original_file_directory: Option<PathBuf>,
    /// Explicit target format; `None` means "probe the registry".
    pub format: Option<FileFormat>,
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub bpp: u8,
    pub file_size: u64,
    pub ratio: PixelRatio,
    pub nb_layers: usize,
    pub current_layer: usize,
    pub palette: Palette,
    pub comment: String,
    pub transparent_color: u8,
    pub background_transparent: bool,
    pub cycle_ranges: Vec<CycleRange>,
    /// Side buffer for truecolor sources, quantized away after decode.
    pub truecolor: Option<Vec<Rgb>>,
    pub settings: Settings,
}

impl<'a> IoContext<'a> {
    fn blank(destination: Destination<'a>, file_name: &str, dir: &Path, settings: Settings) -> Self {
        IoContext {
            destination,
            file_name: file_name.to_string(),
            file_directory: dir.to_path_buf(),
            original_file_name: None,
            original_file_directory: None,
            format: None,
            width: 0,
            height: 0,
            pitch: 0,
            bpp: 8,
            file_size: 0,
            ratio: PixelRatio::Simple,
            nb_layers: 1,
            current_layer: 0,
            palette: [Rgb::default(); 256],
            comment: String::new(),
            transparent_color: 0,
            background_transparent: false,
            cycle_ranges: Vec::new(),
            truecolor: None,
            settings,
        }
    }

    /// Context for loading or saving the current document. Copies the
    /// document's current state so encoders see the same image the screen
    /// shows.
    pub fn for_main_image(
        doc: &'a mut Document,
        file_name: &str,
        dir: &Path,
        settings: Settings,
    ) -> Self {
        let width = doc.width;
        let height = doc.height;
        let nb_layers = doc.layers.len();
        let palette = doc.palette;
        let comment = doc.comment.clone();
        let transparent_color = doc.transparent_color;
        let background_transparent = doc.background_transparent;
        let format = doc.file_format;
        let cycle_ranges: Vec<CycleRange> =
            doc.cycle_ranges.iter().copied().filter(|r| r.is_active()).collect();

        let mut ctx = Self::blank(
            Destination::MainImage { doc, save_source: SaveSource::AllLayers },
            file_name,
            dir,
            settings,
        );
        ctx.format = Some(format);
        ctx.width = width;
        ctx.height = height;
        ctx.pitch = width;
        ctx.nb_layers = nb_layers;
        ctx.palette = palette;
        ctx.comment = comment;
        ctx.transparent_color = transparent_color;
        ctx.background_transparent = background_transparent;
        ctx.ratio = settings.display_ratio;
        ctx.cycle_ranges = cycle_ranges;
        ctx
    }

    /// Context for loading or saving a safety backup of the document.
    pub fn for_backup_image(
        doc: &'a mut Document,
        file_name: &str,
        dir: &Path,
        settings: Settings,
    ) -> Self {
        Self::for_main_image(doc, file_name, dir, settings)
    }

    /// Context for loading or saving the user brush. `screen_palette` is
    /// the palette currently on screen; decoded brushes are remapped to
    /// it.
    pub fn for_brush(
        brush: &'a mut Brush,
        screen_palette: Palette,
        file_name: &str,
        dir: &Path,
        format: Option<FileFormat>,
        settings: Settings,
    ) -> Self {
        let (width, height, transparent) = (brush.width, brush.height, brush.transparent_color);
        let mut ctx = Self::blank(
            Destination::Brush { brush, screen_palette, buffer: None },
            file_name,
            dir,
            settings,
        );
        ctx.format = format;
        ctx.width = width;
        ctx.height = height;
        ctx.pitch = width;
        ctx.palette = screen_palette;
        ctx.transparent_color = transparent;
        ctx.background_transparent = true;
        ctx
    }

    /// Context for a file-selector preview.
    pub fn for_preview(
        file_name: &str,
        dir: &Path,
        format_hint: Option<FileFormat>,
        settings: Settings,
    ) -> Self {
        let mut ctx =
            Self::blank(Destination::Preview(PreviewState::default()), file_name, dir, settings);
        ctx.format = format_hint;
        ctx
    }

    /// Context for previewing a palette file.
    pub fn for_preview_palette(
        file_name: &str,
        dir: &Path,
        format_hint: Option<FileFormat>,
        settings: Settings,
    ) -> Self {
        let mut ctx = Self::blank(
            Destination::PreviewPalette(PreviewState::default()),
            file_name,
            dir,
            settings,
        );
        ctx.format = format_hint;
        ctx
    }

    /// Context for loading into a fresh surface.
    pub fn for_surface(file_name: &str, dir: &Path, settings: Settings) -> Self {
        Self::blank(Destination::Surface { surface: None }, file_name, dir, settings)
    }

    /// Context for loading a palette file straight into the document's
    /// color table.
    pub fn for_palette(
        doc: &'a mut Document,
        file_name: &str,
        dir: &Path,
        settings: Settings,
    ) -> Self {
        let palette = doc.palette;
        let mut ctx = Self::blank(Destination::Palette { doc }, file_name, dir, settings);
        ctx.palette = palette;
        ctx
    }

    pub fn kind(&self) -> DestinationKind {
        match &self.destination {
            Destination::MainImage { .. } => DestinationKind::MainImage,
            Destination::Brush { .. } => DestinationKind::Brush,
            Destination::Preview(_) => DestinationKind::Preview,
            Destination::Surface { .. } => DestinationKind::Surface,
            Destination::Palette { .. } => DestinationKind::Palette,
            Destination::PreviewPalette(_) => DestinationKind::PreviewPalette,
        }
    }

    pub(crate) fn doc_mut(&mut self) -> Option<&mut Document> {
        match &mut self.destination {
            Destination::MainImage { doc, .. } => Some(doc),
            Destination::Palette { doc } => Some(doc),
            _ => None,
        }
    }

    /// Generic allocation done at the beginning of an image load, as soon
    /// as the dimensions are known. Failing to size a destination is a
    /// fatal decode error, distinct from a format mismatch.
    pub fn pre_load(
        &mut self,
        width: usize,
        height: usize,
        file_size: u64,
        ratio: PixelRatio,
        bpp: u8,
    ) -> FileResult<()> {
        let bpp = if bpp == 0 { 8 } else { bpp };
        self.bpp = bpp;
        self.width = width;
        self.height = height;
        self.pitch = width;
        self.file_size = file_size;
        self.ratio = ratio;
        self.nb_layers = 1;
        self.current_layer = 0;
        self.transparent_color = 0;
        self.background_transparent = false;

        let settings = self.settings;
        match &mut self.destination {
            Destination::Preview(state) => {
                // Factors come from the *apparent* size: non-square source
                // pixels double the relevant axis so proportions survive.
                let mut apparent_w = width;
                let mut apparent_h = height;
                if ratio == PixelRatio::Wide && settings.display_ratio != PixelRatio::Wide {
                    apparent_w *= 2;
                } else if ratio == PixelRatio::Tall && settings.display_ratio != PixelRatio::Tall {
                    apparent_h *= 2;
                }
                let mut fx = round_div_max(apparent_w, PREVIEW_WIDTH * settings.menu_scale_x);
                let mut fy = round_div_max(apparent_h, PREVIEW_HEIGHT * settings.menu_scale_y);
                if !settings.maximize_preview && fx != fy {
                    fx = fx.max(fy);
                    fy = fx;
                }
                state.factor_x = fx;
                state.factor_y = fy;
                state.bitmap = Some(vec![
                    0;
                    PREVIEW_WIDTH
                        * PREVIEW_HEIGHT
                        * settings.menu_scale_x
                        * settings.menu_scale_y
                ]);
            }
            Destination::MainImage { doc, .. } => {
                doc.reset_for_load(width, height)?;
                doc.current_layer = 0;
                doc.layers_visible = 1;
                // Stale comment must not survive into an image that has
                // none of its own.
                self.comment.clear();
            }
            Destination::Brush { buffer, .. } => {
                if width == 0 || height == 0 || width > MAX_IMAGE_DIM || height > MAX_IMAGE_DIM {
                    return Err(FileError::Allocation);
                }
                *buffer = Some(vec![0; width * height]);
            }
            Destination::Surface { surface } => {
                *surface = Some(IndexedSurface::new(width, height)?);
            }
            Destination::Palette { .. } | Destination::PreviewPalette(_) => {
                // In a palette, there are no pixels.
            }
        }

        // Truecolor sources decode into a side buffer first; previews
        // quantize inline to 3-3-2 instead and need no extra memory.
        if bpp > 8 {
            match self.destination {
                Destination::MainImage { .. }
                | Destination::Brush { .. }
                | Destination::Surface { .. } => {
                    if width.checked_mul(height).is_none_or(|n| n > MAX_IMAGE_DIM * MAX_IMAGE_DIM) {
                        return Err(FileError::Allocation);
                    }
                    self.truecolor = Some(vec![Rgb::default(); width * height]);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Set the color of a pixel (on load). Out-of-bounds writes are
    /// silently clipped — decoders of padded formats rely on it.
    pub fn set_pixel(&mut self, x: usize, y: usize, color: u8) {
        if x >= self.width || y >= self.height {
            return;
        }
        let (pitch, current_layer, transparent, ratio) =
            (self.pitch, self.current_layer, self.transparent_color, self.ratio);
        let settings = self.settings;
        match &mut self.destination {
            Destination::MainImage { doc, .. } => {
                let offset = y * pitch + x;
                if let Some(frame) = doc.layers.get_mut(current_layer)
                    && let Some(px) = frame.pixels.get_mut(offset)
                {
                    *px = color;
                }
            }
            Destination::Brush { buffer: Some(buffer), .. } => {
                buffer[y * pitch + x] = color;
            }
            Destination::Brush { buffer: None, .. } => {}
            Destination::Preview(state) => {
                // Layers above the first keep the preview of what's
                // below them visible through their transparent color.
                if color == transparent && current_layer > 0 {
                    return;
                }
                if x % state.factor_x != 0 || y % state.factor_y != 0 {
                    return;
                }
                state.usage[color as usize] = true;
                let row_pitch = PREVIEW_WIDTH * settings.menu_scale_x;
                let Some(bitmap) = state.bitmap.as_mut() else { return };
                let py = y / state.factor_y;
                let px = x / state.factor_x;
                if ratio == PixelRatio::Wide && settings.display_ratio != PixelRatio::Wide {
                    put_preview(bitmap, px * 2, py, row_pitch, color);
                    put_preview(bitmap, px * 2 + 1, py, row_pitch, color);
                } else if ratio == PixelRatio::Tall && settings.display_ratio != PixelRatio::Tall {
                    put_preview(bitmap, px, py * 2, row_pitch, color);
                    put_preview(bitmap, px, py * 2 + 1, row_pitch, color);
                } else {
                    put_preview(bitmap, px, py, row_pitch, color);
                }
            }
            Destination::Surface { surface: Some(surface) } => {
                if x < surface.width && y < surface.height {
                    surface.pixels[y * surface.width + x] = color;
                }
            }
            Destination::Surface { surface: None } => {}
            Destination::Palette { .. } | Destination::PreviewPalette(_) => {
                // In a palette, there are no pixels.
            }
        }
    }

    /// Store a truecolor pixel (on load). Buffered destinations keep the
    /// RGB triple for the post-decode quantization pass; previews quantize
    /// inline to 3-3-2.
    pub fn set_pixel_24(&mut self, x: usize, y: usize, r: u8, g: u8, b: u8) {
        if x >= self.width || y >= self.height {
            return;
        }
        let width = self.width;
        match &mut self.destination {
            Destination::MainImage { .. }
            | Destination::Brush { .. }
            | Destination::Surface { .. } => {
                if let Some(buffer) = self.truecolor.as_mut() {
                    buffer[y * width + x] = Rgb { r, g, b };
                }
            }
            Destination::Preview(state) => {
                if x % state.factor_x != 0 || y % state.factor_y != 0 {
                    return;
                }
                let color = rgb_to_332(r, g, b);
                state.usage[color as usize] = true;
                let row_pitch = PREVIEW_WIDTH * self.settings.menu_scale_x;
                if let Some(bitmap) = state.bitmap.as_mut() {
                    put_preview(bitmap, x / state.factor_x, y / state.factor_y, row_pitch, color);
                }
            }
            Destination::Palette { .. } | Destination::PreviewPalette(_) => {
                // In a palette, there are no pixels.
            }
        }
    }

    /// Query the color of a pixel (on save). Save paths only run with
    /// validated dimensions; indexing is direct.
    pub fn get_pixel(&self, x: usize, y: usize) -> u8 {
        match &self.destination {
            Destination::MainImage { doc, save_source } => match save_source {
                SaveSource::Flattened(buffer) => buffer[y * self.pitch + x],
                _ => doc.layers[self.current_layer].pixels[y * self.pitch + x],
            },
            Destination::Brush { brush, .. } => brush.pixels[y * self.pitch + x],
            Destination::Surface { surface: Some(surface) } => {
                surface.pixels[y * surface.width + x]
            }
            _ => 0,
        }
    }

    /// Bulk-fill the destination with one color. For previews only the
    /// first layer may do this — later layers must not erase what is
    /// already sampled.
    pub fn fill_canvas(&mut self, color: u8) {
        let current_layer = self.current_layer;
        match &mut self.destination {
            Destination::MainImage { doc, .. } => {
                if let Some(frame) = doc.layers.get_mut(current_layer) {
                    frame.pixels.fill(color);
                }
            }
            Destination::Brush { buffer: Some(buffer), .. } => buffer.fill(color),
            Destination::Preview(state) => {
                if current_layer == 0
                    && let Some(bitmap) = state.bitmap.as_mut()
                {
                    bitmap.fill(color);
                }
            }
            _ => {}
        }
    }

    /// Switch to `layer` while loading, growing the document as needed.
    pub fn set_loading_layer(&mut self, layer: usize) {
        let mut layer = layer;
        if let Destination::MainImage { doc, .. } = &mut self.destination {
            while layer >= self.nb_layers {
                if !doc.add_layer() {
                    layer = self.nb_layers - 1;
                    break;
                }
                self.nb_layers = doc.layers.len();
                doc.layers_visible = visible_mask(layer);
            }
            doc.current_layer = layer;
        }
        self.current_layer = layer;
    }

    /// Switch to `layer` while saving. When the context was narrowed to a
    /// single layer of a multi-layer document, the codec's layer loop must
    /// not move it off that layer.
    pub fn set_saving_layer(&mut self, layer: usize) {
        if let Destination::MainImage { doc, .. } = &self.destination
            && self.nb_layers == 1
            && doc.layers.len() != 1
        {
            return;
        }
        self.current_layer = layer;
    }

    /// Record a frame duration (animation formats).
    pub fn set_frame_duration(&mut self, duration_ms: u32) {
        let current_layer = self.current_layer;
        if let Destination::MainImage { doc, .. } = &mut self.destination
            && let Some(frame) = doc.layers.get_mut(current_layer)
        {
            frame.duration_ms = duration_ms;
        }
    }

    pub fn get_frame_duration(&self) -> u32 {
        match &self.destination {
            Destination::MainImage { doc, .. } => {
                doc.layers.get(self.current_layer).map_or(0, |f| f.duration_ms)
            }
            _ => 0,
        }
    }

    /// Mark the document as layered or animated (animation formats).
    pub fn set_image_mode(&mut self, mode: ImageMode) {
        if let Destination::MainImage { doc, .. } = &mut self.destination {
            doc.image_mode = mode;
        }
    }

    /// Record a color-cycling range; silently ignored past the slot limit.
    pub fn add_cycle_range(&mut self, range: CycleRange) {
        if self.cycle_ranges.len() < MAX_CYCLE_RANGES {
            self.cycle_ranges.push(range);
        }
    }

    /// Take the loaded surface out of a surface context.
    pub fn take_surface(&mut self) -> Option<IndexedSurface> {
        match &mut self.destination {
            Destination::Surface { surface } => surface.take(),
            _ => None,
        }
    }

    /// Copy of the preview picture at its displayed size, if one was
    /// loaded.
    pub fn preview_image(&self) -> Option<PreviewImage> {
        let state = match &self.destination {
            Destination::Preview(state) => state,
            _ => return None,
        };
        let bitmap = state.bitmap.as_ref()?;
        let row_pitch = PREVIEW_WIDTH * self.settings.menu_scale_x;
        let rows = bitmap.len() / row_pitch.max(1);
        let mut width = self.width / state.factor_x.max(1);
        let mut height = self.height / state.factor_y.max(1);
        if self.ratio == PixelRatio::Wide && self.settings.display_ratio != PixelRatio::Wide {
            width *= 2;
        } else if self.ratio == PixelRatio::Tall && self.settings.display_ratio != PixelRatio::Tall
        {
            height *= 2;
        }
        width = width.min(row_pitch);
        height = height.min(rows);
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            pixels.extend_from_slice(&bitmap[y * row_pitch..y * row_pitch + width]);
        }
        Some(PreviewImage { width, height, pixels, palette: self.palette })
    }

    /// Drop every buffer this context owns; used after a failed load so
    /// partial data is never handed to anyone.
    pub(crate) fn clear_owned_buffers(&mut self) {
        self.truecolor = None;
        match &mut self.destination {
            Destination::Brush { buffer, .. } => *buffer = None,
            Destination::Surface { surface } => *surface = None,
            Destination::Preview(state) => state.bitmap = None,
            _ => {}
        }
    }
}

/// What a preview context produced, ready for the file selector to draw.
pub struct PreviewImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
    pub palette: Palette,
}

fn put_preview(bitmap: &mut [u8], x: usize, y: usize, row_pitch: usize, color: u8) {
    if x >= row_pitch {
        return;
    }
    if let Some(px) = bitmap.get_mut(y * row_pitch + x) {
        *px = color;
    }
}

/// Visibility mask covering layers 0..=layer.
fn visible_mask(layer: usize) -> u32 {
    if layer >= 31 { u32::MAX } else { (2u32 << layer) - 1 }
}

/// Ceiling division, never less than 1 — the preview sampling step.
pub(crate) fn round_div_max(dividend: usize, divisor: usize) -> usize {
    if dividend == 0 {
        return 1;
    }
    dividend.div_ceil(divisor).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn preview_ctx(width: usize, height: usize) -> IoContext<'static> {
        let mut ctx =
            IoContext::for_preview("x.gif", Path::new("."), None, Settings::default());
        ctx.pre_load(width, height, 0, PixelRatio::Simple, 8).unwrap();
        ctx
    }

    #[test]
    fn brush_writes_are_clipped_not_fatal() {
        let mut brush = Brush::new(1, 1);
        let mut ctx = IoContext::for_brush(
            &mut brush,
            [Rgb::default(); 256],
            "b.pcx",
            Path::new("."),
            None,
            Settings::default(),
        );
        ctx.pre_load(4, 3, 0, PixelRatio::Simple, 8).unwrap();
        ctx.fill_canvas(9);
        ctx.set_pixel(3, 2, 1);
        ctx.set_pixel(4, 0, 2); // clipped
        ctx.set_pixel(0, 3, 2); // clipped
        let Destination::Brush { buffer: Some(buffer), .. } = &ctx.destination else {
            panic!("no buffer")
        };
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer[2 * 4 + 3], 1);
        assert!(buffer.iter().all(|&c| c == 9 || c == 1));
    }

    #[test]
    fn preview_samples_exactly_the_expected_pixel_count() {
        let (w, h) = (137, 93);
        let mut ctx = preview_ctx(w, h);
        let (fx, fy) = match &ctx.destination {
            Destination::Preview(state) => (state.factor_x, state.factor_y),
            _ => unreachable!(),
        };
        for y in 0..h {
            for x in 0..w {
                ctx.set_pixel(x, y, 1);
            }
        }
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        let written =
            state.bitmap.as_ref().unwrap().iter().filter(|&&c| c == 1).count();
        assert_eq!(written, w.div_ceil(fx) * h.div_ceil(fy));
        assert!(w.div_ceil(fx) <= PREVIEW_WIDTH);
        assert!(h.div_ceil(fy) <= PREVIEW_HEIGHT);
    }

    #[test]
    fn preview_factors_equalize_by_default() {
        let ctx = preview_ctx(960, 80);
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        assert_eq!(state.factor_x, 8);
        assert_eq!(state.factor_y, 8);

        let mut settings = Settings::default();
        settings.maximize_preview = true;
        let mut ctx = IoContext::for_preview("x.gif", Path::new("."), None, settings);
        ctx.pre_load(960, 80, 0, PixelRatio::Simple, 8).unwrap();
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        assert_eq!(state.factor_x, 8);
        assert_eq!(state.factor_y, 1);
    }

    #[test]
    fn wide_pixels_double_the_apparent_width() {
        let mut settings = Settings::default();
        settings.maximize_preview = true;
        let mut ctx = IoContext::for_preview("x.pi1", Path::new("."), None, settings);
        ctx.pre_load(120, 40, 0, PixelRatio::Wide, 8).unwrap();
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        // 120 wide pixels look like 240: factor 2 on X.
        assert_eq!(state.factor_x, 2);
        assert_eq!(state.factor_y, 1);
        ctx.set_pixel(0, 0, 5);
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        let bitmap = state.bitmap.as_ref().unwrap();
        assert_eq!(bitmap[0], 5);
        assert_eq!(bitmap[1], 5); // doubled horizontally
    }

    #[test]
    fn later_layers_keep_preview_content() {
        let mut ctx = preview_ctx(10, 10);
        ctx.fill_canvas(3);
        ctx.current_layer = 1;
        ctx.fill_canvas(7); // must be ignored
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        assert!(state.bitmap.as_ref().unwrap().iter().all(|&c| c == 3));
    }

    #[test]
    fn transparent_pixels_of_upper_layers_skip_preview() {
        let mut ctx = preview_ctx(10, 10);
        ctx.transparent_color = 4;
        ctx.set_pixel(0, 0, 4); // layer 0: transparent color paints
        ctx.current_layer = 1;
        ctx.set_pixel(1, 0, 4); // upper layer: skipped
        ctx.set_pixel(2, 0, 6);
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        let bitmap = state.bitmap.as_ref().unwrap();
        assert_eq!(bitmap[0], 4);
        assert_eq!(bitmap[1], 0);
        assert_eq!(bitmap[2], 6);
    }

    #[test]
    fn truecolor_preview_pixels_quantize_inline() {
        let mut ctx = preview_ctx(8, 8);
        ctx.set_pixel_24(0, 0, 255, 0, 0);
        let Destination::Preview(state) = &ctx.destination else { unreachable!() };
        assert_eq!(state.bitmap.as_ref().unwrap()[0], 0b1110_0000);
        assert!(state.usage[0b1110_0000 as usize]);
    }

    #[test]
    fn palette_contexts_ignore_pixels() {
        let mut doc = Document::new(4, 4);
        let mut ctx =
            IoContext::for_palette(&mut doc, "p.pal", Path::new("."), Settings::default());
        ctx.width = 4;
        ctx.height = 4;
        ctx.set_pixel(0, 0, 12);
        ctx.set_pixel_24(1, 1, 1, 2, 3);
        ctx.fill_canvas(9);
        let Destination::Palette { doc } = &ctx.destination else { unreachable!() };
        assert!(doc.layers[0].pixels.iter().all(|&c| c == 0));
    }

    #[test]
    fn loading_layers_grows_the_document() {
        let mut doc = Document::new(2, 2);
        let mut ctx =
            IoContext::for_main_image(&mut doc, "a.gif", Path::new("."), Settings::default());
        ctx.pre_load(2, 2, 0, PixelRatio::Simple, 8).unwrap();
        ctx.set_loading_layer(2);
        assert_eq!(ctx.nb_layers, 3);
        ctx.set_pixel(1, 1, 8);
        let Destination::MainImage { doc, .. } = &ctx.destination else { unreachable!() };
        assert_eq!(doc.layers.len(), 3);
        assert_eq!(doc.layers[2].pixels[3], 8);
        assert_eq!(doc.layers_visible, 0b111);
    }

    #[test]
    fn round_div_max_is_a_ceiling_with_floor_one() {
        assert_eq!(round_div_max(0, 120), 1);
        assert_eq!(round_div_max(120, 120), 1);
        assert_eq!(round_div_max(121, 120), 2);
        assert_eq!(round_div_max(961, 120), 9);
    }
}
