//! Palette-only codecs: JASC `.pal` and GIMP `.gpl`. No pixels — loading
//! one of these only replaces the 256-entry color table, which is why
//! they never call `pre_load`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

use crate::context::IoContext;
use crate::error::{FileError, FileResult};
use crate::page::Rgb;
use crate::paths;

// ---------------------------------------------------------------------------
// JASC-PAL
// ---------------------------------------------------------------------------

pub fn test_pal(file: &mut File) -> io::Result<bool> {
    let mut start = [0u8; 8];
    if file.read_exact(&mut start).is_err() {
        return Ok(false);
    }
    Ok(&start == b"JASC-PAL")
}

pub fn load_pal(context: &mut IoContext) -> FileResult<()> {
    let reader = BufReader::new(paths::open_file_read(context)?);
    let mut lines = reader.lines();
    let mut next = || -> FileResult<String> {
        match lines.next() {
            Some(line) => Ok(line?),
            None => Err(FileError::NotRecognized),
        }
    };

    if next()?.trim() != "JASC-PAL" || next()?.trim() != "0100" {
        return Err(FileError::NotRecognized);
    }
    let count: usize = next()?.trim().parse().map_err(|_| FileError::NotRecognized)?;
    if count == 0 || count > 256 {
        return Err(FileError::NotRecognized);
    }
    for index in 0..count {
        let line = next()?;
        context.palette[index] = parse_rgb_line(&line).ok_or(FileError::NotRecognized)?;
    }
    Ok(())
}

pub fn save_pal(context: &mut IoContext) -> FileResult<()> {
    let result = (|| -> FileResult<()> {
        let mut w = BufWriter::new(paths::open_file_write(context)?);
        write!(w, "JASC-PAL\r\n0100\r\n256\r\n")?;
        for color in &context.palette {
            write!(w, "{} {} {}\r\n", color.r, color.g, color.b)?;
        }
        w.flush()?;
        Ok(())
    })();
    result.inspect_err(|_| paths::remove_file(context))
}

// ---------------------------------------------------------------------------
// GIMP palette
// ---------------------------------------------------------------------------

pub fn test_gpl(file: &mut File) -> io::Result<bool> {
    let mut start = [0u8; 12];
    if file.read_exact(&mut start).is_err() {
        return Ok(false);
    }
    Ok(&start == b"GIMP Palette")
}

pub fn load_gpl(context: &mut IoContext) -> FileResult<()> {
    let reader = BufReader::new(paths::open_file_read(context)?);
    let mut lines = reader.lines();
    match lines.next() {
        Some(Ok(first)) if first.trim_end() == "GIMP Palette" => {}
        _ => return Err(FileError::NotRecognized),
    }

    let mut index = 0usize;
    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        // Header attributes ("Name:", "Columns:") and comments interleave
        // freely with color lines.
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains(':') {
            continue;
        }
        let Some(color) = parse_rgb_line(trimmed) else { continue };
        if index >= 256 {
            break;
        }
        context.palette[index] = color;
        index += 1;
    }
    if index == 0 {
        return Err(FileError::NotRecognized);
    }
    Ok(())
}

pub fn save_gpl(context: &mut IoContext) -> FileResult<()> {
    let result = (|| -> FileResult<()> {
        let mut w = BufWriter::new(paths::open_file_write(context)?);
        writeln!(w, "GIMP Palette")?;
        let name = context.file_name.rsplit_once('.').map_or(context.file_name.as_str(), |p| p.0);
        writeln!(w, "Name: {}", name)?;
        writeln!(w, "Columns: 16")?;
        writeln!(w, "#")?;
        for (index, color) in context.palette.iter().enumerate() {
            writeln!(w, "{:3} {:3} {:3}\tIndex {}", color.r, color.g, color.b, index)?;
        }
        w.flush()?;
        Ok(())
    })();
    result.inspect_err(|_| paths::remove_file(context))
}

/// Parse the first three whitespace-separated integers of a line.
fn parse_rgb_line(line: &str) -> Option<Rgb> {
    let mut parts = line.split_whitespace();
    let mut component = || parts.next()?.parse::<u8>().ok();
    Some(Rgb { r: component()?, g: component()?, b: component()? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Destination, Settings};
    use crate::page::Document;
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("retropaint-pal-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn jasc_round_trip() {
        let dir = scratch_dir("jasc");
        let mut doc = Document::new(1, 1);
        for (i, entry) in doc.palette.iter_mut().enumerate() {
            entry.r = i as u8;
            entry.g = 255 - i as u8;
            entry.b = 128;
        }
        let mut ctx = IoContext::for_palette(&mut doc, "p.pal", &dir, Settings::default());
        save_pal(&mut ctx).unwrap();
        drop(ctx);

        let mut other = Document::new(1, 1);
        let mut ctx = IoContext::for_palette(&mut other, "p.pal", &dir, Settings::default());
        load_pal(&mut ctx).unwrap();
        assert_eq!(ctx.palette[17], Rgb { r: 17, g: 238, b: 128 });
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn gimp_palette_parses_around_headers_and_comments() {
        let dir = scratch_dir("gpl");
        fs::write(
            dir.join("x.gpl"),
            "GIMP Palette\nName: test\nColumns: 8\n# a comment\n 10  20  30\tfirst\n200 201 202\n",
        )
        .unwrap();
        let mut doc = Document::new(1, 1);
        let mut ctx = IoContext::for_palette(&mut doc, "x.gpl", &dir, Settings::default());
        load_gpl(&mut ctx).unwrap();
        assert_eq!(ctx.palette[0], Rgb { r: 10, g: 20, b: 30 });
        assert_eq!(ctx.palette[1], Rgb { r: 200, g: 201, b: 202 });
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn palette_loads_never_touch_document_pixels() {
        let dir = scratch_dir("nopix");
        let mut doc = Document::new(2, 2);
        doc.layers[0].pixels = vec![7, 7, 7, 7];
        {
            let mut ctx = IoContext::for_palette(&mut doc, "p.pal", &dir, Settings::default());
            save_pal(&mut ctx).unwrap();
        }
        let mut ctx = IoContext::for_palette(&mut doc, "p.pal", &dir, Settings::default());
        load_pal(&mut ctx).unwrap();
        let Destination::Palette { doc } = &ctx.destination else { unreachable!() };
        assert_eq!(doc.layers[0].pixels, vec![7, 7, 7, 7]);
        let _ = fs::remove_dir_all(&dir);
    }
}
