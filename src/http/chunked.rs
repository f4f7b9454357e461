//! Chunked transfer encoding support
//!
//! Request bodies are decoded by the connection one size line at a time, so
//! this module only parses a single size line. The encoders build chunked
//! response bodies for applications.

use super::{Error, Headers, Result, CRLF};
use bytes::Bytes;
use std::io::Write;

/// Parse a chunk-size line (`size[;ext]\r\n`) into size and extension.
///
/// The size is hexadecimal and the line must end with CRLF.
pub fn parse_chunk_line(line: &[u8]) -> Result<(usize, Option<String>)> {
    let Some(line) = line.strip_suffix(CRLF.as_bytes()) else {
        return Err(Error::InvalidChunkSize(
            "Chunk size line not terminated by CRLF".to_string(),
        ));
    };
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::InvalidChunkSize("Chunk size line is not UTF-8".to_string()))?;

    let (size_str, extension) = match line.split_once(';') {
        Some((size, ext)) => (size.trim(), Some(ext.trim().to_string())),
        None => (line.trim(), None),
    };

    if size_str.is_empty() || !size_str.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidChunkSize(size_str.to_string()));
    }
    let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;

    Ok((size, extension))
}

/// Frame `data` as one chunk; empty input yields no bytes
pub fn encode_chunk(data: &[u8]) -> Bytes {
    if data.is_empty() {
        return Bytes::new();
    }

    let mut buf = Vec::with_capacity(data.len() + 12);
    // Writing into a Vec cannot fail
    let _ = write!(buf, "{:x}{}", data.len(), CRLF);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF.as_bytes());
    Bytes::from(buf)
}

/// The zero-size chunk, optional trailers and the final blank line
pub fn encode_last_chunk(trailers: Option<&Headers>) -> Bytes {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        trailers.write_to(&mut buf);
    }
    buf.extend_from_slice(CRLF.as_bytes());
    Bytes::from(buf)
}
