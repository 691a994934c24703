//! RetroPaint load-save engine — decodes and encodes the indexed-color file
//! formats of a 256-color bitmap paint program, and keeps periodic safety
//! backups of the editing session on disk.
//!
//! The engine is built around three pieces:
//! * an [`context::IoContext`] describing *where* decoded pixels land
//!   (main canvas, brush, preview thumbnail, free-standing surface, or a
//!   palette-only store),
//! * a format registry ([`formats`]) probed in order by the dispatcher
//!   ([`io::load_image`] / [`io::save_image`]),
//! * a crash-recovery subsystem ([`backup`]) that snapshots the canvas as
//!   rotating GIF files and replays them on the next startup.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]

pub mod backup;
pub mod codecs;
pub mod context;
pub mod error;
pub mod formats;
pub mod io;
pub mod logger;
pub mod page;
pub mod paths;

pub use context::{Brush, Destination, IndexedSurface, IoContext, PixelRatio, Settings};
pub use error::{FileError, FileResult};
pub use formats::{FileFormat, FormatDescriptor};
pub use io::{load_image, save_image, FlattenDecision};
pub use page::{CycleRange, Document, ImageMode, Palette, Rgb};
