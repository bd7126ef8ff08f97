use std::fmt::Write as _;
use std::io::Write;
use tracing::{debug, warn};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

/// Formats one numeric cell into `out` without allocating.
pub fn format_value(out: &mut String, value: f64) {
    if value == value.trunc() && value.abs() < 1e15 {
        let _ = write!(out, "{}", value as i64);
    } else if value.abs() < 0.001 {
        let _ = write!(out, "{value:.6}");
    } else {
        let _ = write!(out, "{value:.4}");
    }
}

/// Buffered line writer for the frame-indexed CSV format.
///
/// Rows are accumulated into a chunk buffer of `write_buffer_size` bytes
/// and flushed to the underlying writer whole chunks at a time, optionally
/// compressed. The stream performs no ordering checks; the caller is
/// responsible for emitting header, rows, trailer and metadata in format
/// order.
pub struct CsvStream<W: Write> {
    out: W,
    compression: Compression,
    chunk: Vec<u8>,
    chunk_capacity: usize,
    scratch: Vec<u8>,
    line: String,
}

impl<W: Write> CsvStream<W> {
    pub fn new(out: W, write_buffer_size: usize, compression: Compression) -> Self {
        let chunk_capacity = write_buffer_size.max(4096);
        CsvStream {
            out,
            compression,
            chunk: Vec::with_capacity(chunk_capacity),
            chunk_capacity,
            scratch: Vec::new(),
            line: String::new(),
        }
    }

    /// Writes a header line: `EVENTS,<name>,<name>,...`.
    pub fn write_header<'a>(&mut self, names: impl Iterator<Item = &'a str>) -> Result<()> {
        self.line.clear();
        self.line.push_str("EVENTS");
        for name in names {
            self.line.push(',');
            self.line.push_str(name);
        }
        self.push_line()
    }

    /// Writes one data row: semicolon-joined events, then one value per
    /// series column.
    pub fn write_row(&mut self, events: &[String], values: &[f64]) -> Result<()> {
        self.line.clear();
        for (i, event) in events.iter().enumerate() {
            if i > 0 {
                self.line.push(';');
            }
            // Commas and newlines would corrupt the row structure.
            for c in event.chars() {
                self.line.push(match c {
                    ',' | '\n' | '\r' => ' ',
                    c => c,
                });
            }
        }
        for value in values {
            self.line.push(',');
            format_value(&mut self.line, *value);
        }
        self.push_line()
    }

    /// Writes one `[key],value` metadata row.
    pub fn write_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.line.clear();
        let _ = write!(self.line, "[{key}],{value}");
        self.push_line()
    }

    /// Flushes any buffered chunk and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.flush_chunk()?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn push_line(&mut self) -> Result<()> {
        if self.chunk.len() + self.line.len() + 1 > self.chunk_capacity {
            self.flush_chunk()?;
        }
        self.chunk.extend_from_slice(self.line.as_bytes());
        self.chunk.push(b'\n');
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        match self.compression {
            Compression::None => {
                self.out.write_all(&self.chunk)?;
            }
            Compression::Zstd { level } => {
                if let Some(len) = self.compress_chunk(level) {
                    self.out.write_all(&(len as u32).to_le_bytes())?;
                    self.out.write_all(&self.scratch[..len])?;
                }
            }
        }
        self.chunk.clear();
        Ok(())
    }

    /// Compresses the pending chunk into `scratch`, growing the output
    /// buffer and retrying once on insufficient space. Returns `None` if
    /// the chunk had to be discarded.
    fn compress_chunk(&mut self, level: i32) -> Option<usize> {
        self.scratch.resize(self.chunk.len(), 0);
        match zstd::bulk::compress_to_buffer(&self.chunk, &mut self.scratch[..], level) {
            Ok(len) => return Some(len),
            Err(error) => {
                debug!(
                    chunk_len = self.chunk.len(),
                    error = %error,
                    "compressed chunk did not fit, growing output buffer"
                );
            }
        }
        let bound = zstd::zstd_safe::compress_bound(self.chunk.len());
        self.scratch.resize(bound, 0);
        match zstd::bulk::compress_to_buffer(&self.chunk, &mut self.scratch[..], level) {
            Ok(len) => Some(len),
            Err(error) => {
                warn!(
                    chunk_len = self.chunk.len(),
                    error = %error,
                    "chunk compression failed after growth, discarding chunk"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::io::Read;

    #[rstest]
    #[case(0.0, "0")]
    #[case(5.0, "5")]
    #[case(-12.0, "-12")]
    #[case(1234567.0, "1234567")]
    #[case(16.66667, "16.6667")]
    #[case(0.5, "0.5000")]
    #[case(0.000123, "0.000123")]
    #[case(-0.0005, "-0.000500")]
    fn test_format_value(#[case] value: f64, #[case] expected: &str) {
        let mut out = String::new();
        format_value(&mut out, value);
        assert_eq!(out, expected);
    }

    fn lines_of(bytes: &[u8]) -> Vec<String> {
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[rstest]
    fn test_plain_stream_layout() {
        let mut stream = CsvStream::new(Vec::new(), 4096, Compression::None);
        stream
            .write_header(["GameThread/FrameTime", "RenderThread/FrameTime"].into_iter())
            .unwrap();
        stream
            .write_row(&["loaded map".to_string()], &[16.66667, 8.0])
            .unwrap();
        stream.write_row(&[], &[0.0, 0.0]).unwrap();
        stream
            .write_header(["GameThread/FrameTime", "RenderThread/FrameTime"].into_iter())
            .unwrap();
        stream.write_metadata("Platform", "linux").unwrap();
        let out = stream.finish().unwrap();

        let lines = lines_of(&out);
        assert_eq!(
            lines,
            vec![
                "EVENTS,GameThread/FrameTime,RenderThread/FrameTime",
                "loaded map,16.6667,8",
                ",0,0",
                "EVENTS,GameThread/FrameTime,RenderThread/FrameTime",
                "[Platform],linux",
            ]
        );
    }

    #[rstest]
    fn test_event_text_sanitized() {
        let mut stream = CsvStream::new(Vec::new(), 4096, Compression::None);
        stream
            .write_row(&["a,b\nc".to_string(), "d".to_string()], &[1.0])
            .unwrap();
        let out = stream.finish().unwrap();
        assert_eq!(lines_of(&out), vec!["a b c;d,1"]);
    }

    #[rstest]
    fn test_compressed_round_trip() {
        let mut stream = CsvStream::new(Vec::new(), 256, Compression::Zstd { level: 3 });
        stream.write_header(["A", "B"].into_iter()).unwrap();
        for i in 0..100 {
            stream.write_row(&[], &[i as f64, (i * 2) as f64]).unwrap();
        }
        let out = stream.finish().unwrap();

        // Decode the chunked container back into the plain stream.
        let mut decoded = Vec::new();
        let mut cursor = std::io::Cursor::new(out);
        loop {
            let mut len_bytes = [0u8; 4];
            match cursor.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(_) => break,
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut compressed = vec![0u8; len];
            cursor.read_exact(&mut compressed).unwrap();
            decoded.extend(zstd::bulk::decompress(&compressed, 1 << 20).unwrap());
        }

        let lines = lines_of(&decoded);
        assert_eq!(lines.len(), 101);
        assert_eq!(lines[0], "EVENTS,A,B");
        assert_eq!(lines[100], ",99,198");
    }

    #[rstest]
    fn test_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.csv");
        let file = std::fs::File::create(&path).unwrap();
        let mut stream = CsvStream::new(std::io::BufWriter::new(file), 4096, Compression::None);
        stream.write_header(["A"].into_iter()).unwrap();
        stream.write_row(&[], &[1.0]).unwrap();
        stream.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "EVENTS,A\n,1\n");
    }
}
