//! # framecsv-format
//!
//! The byte/line layer of the frame-indexed CSV profile format.
//!
//! ## Format Overview
//!
//! The file is line-oriented and comma-separated:
//!
//! - Line 1: `EVENTS,<series-name-1>,<series-name-2>,...` header. The
//!   EVENTS column is always first.
//! - One line per frame, in increasing frame order: semicolon-joined event
//!   strings (or empty) in column 1, then one numeric value per series,
//!   zero-filled for series with no update that frame.
//! - After the last data row: a duplicate header row, so readers scanning
//!   from the end of the file can recover column names.
//! - Metadata rows of the form `[key],value`. The writer's caller is
//!   expected to emit its designated final entry last; parsers depend on it
//!   being the last line of the file.
//!
//! ## Numeric formatting
//!
//! Integral values are written with no fractional part, magnitudes below
//! `0.001` with six decimals, everything else with four. This keeps file
//! size bounded while preserving sub-millisecond timer precision.
//!
//! ## Compression
//!
//! With [`Compression::Zstd`] the stream is a sequence of chunks, each a
//! little-endian `u32` compressed length followed by one zstd block. The
//! concatenated decompressed chunks are byte-identical to the uncompressed
//! stream. A chunk whose compression fails even after growing the output
//! buffer is discarded and logged rather than stalling the capture.

use thiserror::Error;

pub use stream::{format_value, Compression, CsvStream};

pub(crate) mod stream;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FormatError>;
