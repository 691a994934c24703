//! Format registry: one descriptor per supported file format, in probe
//! order. The dispatcher walks this table when a file's format is unknown,
//! so entries with weak signatures (PCX's single magic byte) come after the
//! formats with real ones.

use std::fs::File;
use std::io;

use crate::codecs;
use crate::context::IoContext;
use crate::error::FileResult;

/// Identifier of a concrete file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Gif,
    Png,
    Img,
    Pcx,
    Pal,
    Gpl,
}

/// Signature probe: read just enough of the rewound stream to decide.
pub type TestFn = fn(&mut File) -> io::Result<bool>;
/// Full decode into the context's destination.
pub type LoadFn = for<'a> fn(&mut IoContext<'a>) -> FileResult<()>;
/// Full encode from the context's destination.
pub type SaveFn = for<'a> fn(&mut IoContext<'a>) -> FileResult<()>;

/// One registry entry.
pub struct FormatDescriptor {
    pub identifier: FileFormat,
    /// Short label shown in the file selector and in preview headers.
    pub label: &'static str,
    pub test: Option<TestFn>,
    pub load: Option<LoadFn>,
    pub save: Option<SaveFn>,
    /// True for palette files: no pixels, only 256 RGB entries.
    pub palette_only: bool,
    /// True when the format can hold more than one layer/frame.
    pub supports_layers: bool,
    /// Canonical extension, without the dot.
    pub extension: &'static str,
    /// All recognized extensions, semicolon-separated.
    pub extensions: &'static str,
}

/// All concrete formats, in signature-probe order.
pub static FILE_FORMATS: [FormatDescriptor; 6] = [
    FormatDescriptor {
        identifier: FileFormat::Gif,
        label: " gif",
        test: Some(codecs::gif::test_gif),
        load: Some(codecs::gif::load_gif),
        save: Some(codecs::gif::save_gif),
        palette_only: false,
        supports_layers: true,
        extension: "gif",
        extensions: "gif",
    },
    FormatDescriptor {
        identifier: FileFormat::Png,
        label: " png",
        test: Some(codecs::png::test_png),
        load: Some(codecs::png::load_png),
        save: Some(codecs::png::save_png),
        palette_only: false,
        supports_layers: false,
        extension: "png",
        extensions: "png",
    },
    FormatDescriptor {
        identifier: FileFormat::Img,
        label: " img",
        test: Some(codecs::img::test_img),
        load: Some(codecs::img::load_img),
        save: Some(codecs::img::save_img),
        palette_only: false,
        supports_layers: false,
        extension: "img",
        extensions: "img",
    },
    FormatDescriptor {
        identifier: FileFormat::Pcx,
        label: " pcx",
        test: Some(codecs::pcx::test_pcx),
        load: Some(codecs::pcx::load_pcx),
        save: Some(codecs::pcx::save_pcx),
        palette_only: false,
        supports_layers: false,
        extension: "pcx",
        extensions: "pcx",
    },
    FormatDescriptor {
        identifier: FileFormat::Pal,
        label: " pal",
        test: Some(codecs::palette::test_pal),
        load: Some(codecs::palette::load_pal),
        save: Some(codecs::palette::save_pal),
        palette_only: true,
        supports_layers: false,
        extension: "pal",
        extensions: "pal",
    },
    FormatDescriptor {
        identifier: FileFormat::Gpl,
        label: " gpl",
        test: Some(codecs::palette::test_gpl),
        load: Some(codecs::palette::load_gpl),
        save: Some(codecs::palette::save_gpl),
        palette_only: true,
        supports_layers: false,
        extension: "gpl",
        extensions: "gpl",
    },
];

/// Format assumed when nothing better is known (first format with a
/// whole-file signature; also the safety-backup format).
pub const DEFAULT_FORMAT: FileFormat = FileFormat::Gif;

/// Number of concrete registry entries.
pub fn nb_known_formats() -> usize {
    FILE_FORMATS.len()
}

/// Find a format's descriptor. Never fails: an unknown identifier falls
/// back to the GIF entry, so error-reporting paths can always print a
/// label.
pub fn lookup(format: FileFormat) -> &'static FormatDescriptor {
    let mut safe_default = &FILE_FORMATS[0];
    for descriptor in &FILE_FORMATS {
        if descriptor.identifier == format {
            return descriptor;
        }
        if descriptor.identifier == DEFAULT_FORMAT {
            safe_default = descriptor;
        }
    }
    safe_default
}

/// Format whose extension list contains `ext` (case-insensitive).
pub fn format_for_extension(ext: &str) -> Option<FileFormat> {
    let ext = ext.to_lowercase();
    FILE_FORMATS
        .iter()
        .find(|d| d.extensions.split(';').any(|e| e == ext))
        .map(|d| d.identifier)
}

/// A file-selector filter line. These are not formats — they only group
/// extensions for the open/save dialogs and never reach the codec
/// dispatch loop.
pub struct SelectorFilter {
    pub label: &'static str,
    pub palette_only: bool,
    pub extensions: &'static str,
}

pub static FILE_SELECTOR_FILTERS: [SelectorFilter; 3] = [
    SelectorFilter {
        label: "(all)",
        palette_only: false,
        extensions: "gif;png;img;pcx;bmp;tga;jpg;jpeg;ico;tif;tiff;webp;pnm",
    },
    SelectorFilter { label: "(pal)", palette_only: true, extensions: "pal;gpl" },
    SelectorFilter { label: "(*.*)", palette_only: false, extensions: "*" },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_never_fails_and_prefers_exact_match() {
        assert_eq!(lookup(FileFormat::Pcx).identifier, FileFormat::Pcx);
        assert_eq!(lookup(FileFormat::Gpl).identifier, FileFormat::Gpl);
    }

    #[test]
    fn weak_signatures_probe_after_strong_ones() {
        let pos = |f: FileFormat| FILE_FORMATS.iter().position(|d| d.identifier == f).unwrap();
        assert!(pos(FileFormat::Pcx) > pos(FileFormat::Gif));
        assert!(pos(FileFormat::Pcx) > pos(FileFormat::Png));
        assert!(pos(FileFormat::Pcx) > pos(FileFormat::Img));
    }

    #[test]
    fn every_loadable_format_has_a_distinct_identifier() {
        for (i, a) in FILE_FORMATS.iter().enumerate() {
            if a.load.is_some() {
                for b in &FILE_FORMATS[i + 1..] {
                    assert_ne!(a.identifier, b.identifier);
                }
            }
        }
    }

    #[test]
    fn extension_lookup() {
        assert_eq!(format_for_extension("PCX"), Some(FileFormat::Pcx));
        assert_eq!(format_for_extension("gpl"), Some(FileFormat::Gpl));
        assert_eq!(format_for_extension("xyz"), None);
    }
}
