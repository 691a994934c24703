//! Path resolution for the load-save engine: building a context's full
//! path, opening it, and finding sibling files that share the basename
//! with a different extension (multi-file formats keep their palette or
//! pixel data in such siblings).

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::context::IoContext;

/// Join a directory and a file name the way the file selector does.
pub fn full_path(directory: &Path, file_name: &str) -> PathBuf {
    directory.join(file_name)
}

/// The context's target path.
pub fn context_path(context: &IoContext) -> PathBuf {
    full_path(&context.file_directory, &context.file_name)
}

/// For use by `load_*()` and `test_*()` functions.
pub fn open_file_read(context: &IoContext) -> io::Result<File> {
    File::open(context_path(context))
}

/// For use by `save_*()` functions.
pub fn open_file_write(context: &IoContext) -> io::Result<File> {
    File::create(context_path(context))
}

/// Remove the context's target file; failures are ignored (the caller is
/// already on an error path).
pub fn remove_file(context: &IoContext) {
    let _ = fs::remove_file(context_path(context));
}

/// Find a sibling of `file_name` in `directory` whose extension is `ext`,
/// matching the basename case-insensitively. Returns the sibling's real
/// path so the caller opens exactly what the directory listing showed.
pub fn find_alternate_ext(directory: &Path, file_name: &str, ext: &str) -> Option<PathBuf> {
    let basename = match file_name.rsplit_once('.') {
        Some((base, _)) => base,
        None => file_name,
    };
    let wanted = format!("{}.{}", basename, ext);
    let entries = fs::read_dir(directory).ok()?;
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.eq_ignore_ascii_case(&wanted) {
            return Some(entry.path());
        }
    }
    None
}

/// Open a sibling of the context's file with another extension, if one
/// exists.
pub fn open_file_read_with_alternate_ext(
    context: &IoContext,
    ext: &str,
) -> io::Result<Option<File>> {
    match find_alternate_ext(&context.file_directory, &context.file_name, ext) {
        Some(path) => File::open(path).map(Some),
        None => Ok(None),
    }
}

/// Create the context's file with its extension replaced by `ext`.
pub fn open_file_write_with_alternate_ext(context: &IoContext, ext: &str) -> io::Result<File> {
    let basename = match context.file_name.rsplit_once('.') {
        Some((base, _)) => base,
        None => context.file_name.as_str(),
    };
    File::create(context.file_directory.join(format!("{}.{}", basename, ext)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("retropaint-paths-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn alternate_ext_matches_case_insensitively() {
        let dir = scratch_dir("alt");
        let mut f = File::create(dir.join("Picture.PAL")).unwrap();
        f.write_all(b"JASC-PAL").unwrap();

        let found = find_alternate_ext(&dir, "picture.img", "pal").unwrap();
        assert_eq!(found.file_name().unwrap(), "Picture.PAL");
        assert!(find_alternate_ext(&dir, "other.img", "pal").is_none());
        assert!(find_alternate_ext(&dir, "picture.img", "gpl").is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn alternate_ext_write_replaces_the_extension() {
        let dir = scratch_dir("altw");
        let ctx = IoContext::for_surface("shot.img", &dir, crate::context::Settings::default());
        let mut f = open_file_write_with_alternate_ext(&ctx, "pal").unwrap();
        f.write_all(b"x").unwrap();
        assert!(dir.join("shot.pal").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
