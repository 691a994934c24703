//! Error type shared by every load/save/test routine in the engine.
//!
//! The paint program reports file problems with a small numeric code in its
//! status bar, so [`FileError::code`] keeps the historical numbering: 1 for
//! "could not read / not a known format", 2 for a failed truecolor
//! quantization, 3 for a failed destination-buffer allocation. Propagation
//! is ordinary `Result` + `?`; because every step early-returns, the first
//! failure in a pipeline is the one the caller sees — later steps never
//! overwrite it.

use std::fmt;
use std::io;

/// Result alias used across the load-save engine.
pub type FileResult<T> = Result<T, FileError>;

/// Error raised by the dispatcher, the codecs and the pixel-sink helpers.
#[derive(Debug)]
pub enum FileError {
    /// I/O failure while reading or writing the file.
    Io(io::Error),
    /// No known format matched, the file is truncated/corrupt, or the user
    /// cancelled a save prompt.
    NotRecognized,
    /// Truecolor source could not be quantized to 256 colors.
    Quantization,
    /// A destination pixel buffer could not be allocated (or the declared
    /// dimensions are beyond what the program accepts).
    Allocation,
}

impl FileError {
    /// Historical numeric code, used in log lines and the status bar.
    pub fn code(&self) -> u8 {
        match self {
            FileError::Io(_) | FileError::NotRecognized => 1,
            FileError::Quantization => 2,
            FileError::Allocation => 3,
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::Io(e) => write!(f, "I/O error: {}", e),
            FileError::NotRecognized => write!(f, "file format not recognized"),
            FileError::Quantization => write!(f, "color quantization failed"),
            FileError::Allocation => write!(f, "could not allocate image buffer"),
        }
    }
}

impl From<io::Error> for FileError {
    fn from(e: io::Error) -> Self {
        FileError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_historical_numbering() {
        assert_eq!(FileError::NotRecognized.code(), 1);
        assert_eq!(FileError::Io(io::Error::other("x")).code(), 1);
        assert_eq!(FileError::Quantization.code(), 2);
        assert_eq!(FileError::Allocation.code(), 3);
    }
}
