//! Last-resort decoder: when no registry signature matches, hand the file
//! to the `image` crate, which covers the common interchange formats
//! (JPEG, TIFF, TGA, ICO, WEBP, BMP, ...). Everything arrives as
//! truecolor and goes through the 24-bit side buffer or the inline
//! preview quantizer.

use std::fs;

use crate::context::{IoContext, PixelRatio};
use crate::error::{FileError, FileResult};
use crate::paths;

pub fn load_generic(context: &mut IoContext) -> FileResult<()> {
    let path = paths::context_path(context);
    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let image = image::open(&path).map_err(|_| FileError::NotRecognized)?;
    let rgb = image.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);

    context.pre_load(width, height, file_size, PixelRatio::Simple, 24)?;
    for (x, y, pixel) in rgb.enumerate_pixels() {
        context.set_pixel_24(x as usize, y as usize, pixel[0], pixel[1], pixel[2]);
    }
    Ok(())
}
