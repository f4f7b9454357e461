//! Chunked read/write buffers.
//!
//! Both buffers keep a queue of `Bytes` chunks instead of one contiguous
//! vector. The read side merges chunks lazily, doubling the merged prefix
//! on every failed search so a delimiter scan over many small reads stays
//! linear overall.

use bytes::{Buf, Bytes, BytesMut};
use regex::bytes::Regex;
use std::collections::VecDeque;

/// Largest prefix merged into one send call
pub(crate) const WRITE_MERGE_SIZE: usize = 128 * 1024;

/// Reshape `chunks` so the first chunk is exactly `size` bytes long (or
/// holds everything if fewer bytes are queued).
pub(crate) fn merge_prefix(chunks: &mut VecDeque<Bytes>, size: usize) {
    if size == 0 {
        return;
    }
    match chunks.front() {
        None => return,
        Some(front) if front.len() == size => return,
        Some(front) if chunks.len() == 1 && front.len() <= size => return,
        _ => {}
    }

    let mut prefix = BytesMut::with_capacity(size);
    let mut remaining = size;
    while remaining > 0 {
        let Some(mut chunk) = chunks.pop_front() else {
            break;
        };
        if chunk.len() > remaining {
            let rest = chunk.split_off(remaining);
            chunks.push_front(rest);
        }
        remaining -= chunk.len();
        prefix.extend_from_slice(&chunk);
    }
    chunks.push_front(prefix.freeze());
}

/// Grow the first chunk to at least twice its size, and at least enough
/// to absorb the second chunk
fn double_prefix(chunks: &mut VecDeque<Bytes>) {
    if chunks.len() < 2 {
        return;
    }
    let first = chunks[0].len();
    let second = chunks[1].len();
    merge_prefix(chunks, (first * 2).max(first + second));
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove and return the first `n` bytes (fewer if not buffered)
    pub(crate) fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }
        merge_prefix(&mut self.chunks, n);
        self.len -= n;
        self.chunks.pop_front().unwrap_or_default()
    }

    pub(crate) fn take_all(&mut self) -> Bytes {
        self.consume(self.len)
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Offset just past the first occurrence of `delimiter`
    pub(crate) fn find_delimiter(&mut self, delimiter: &[u8]) -> Option<usize> {
        self.search(|chunk| find_subslice(chunk, delimiter).map(|pos| pos + delimiter.len()))
    }

    /// Offset just past the end of the first match of `pattern`
    pub(crate) fn find_regex(&mut self, pattern: &Regex) -> Option<usize> {
        self.search(|chunk| pattern.find(chunk).map(|m| m.end()))
    }

    fn search<F>(&mut self, mut finder: F) -> Option<usize>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        loop {
            let front = self.chunks.front()?;
            if let Some(end) = finder(front) {
                return Some(end);
            }
            if self.chunks.len() == 1 {
                return None;
            }
            double_prefix(&mut self.chunks);
        }
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    frozen: bool,
}

impl WriteBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(data);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Next bytes to hand to the transport.
    ///
    /// While frozen the front chunk is returned unchanged so a retried send
    /// sees exactly the bytes the previous attempt saw.
    pub(crate) fn front(&mut self) -> Option<Bytes> {
        if !self.frozen {
            merge_prefix(&mut self.chunks, WRITE_MERGE_SIZE);
        }
        self.chunks.front().cloned()
    }

    /// The transport accepted nothing; keep the front chunk as it is
    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Drop `n` sent bytes from the front chunk
    pub(crate) fn advance(&mut self, n: usize) {
        self.frozen = false;
        let Some(front) = self.chunks.front_mut() else {
            return;
        };
        let n = n.min(front.len());
        front.advance(n);
        self.len -= n;
        if front.is_empty() {
            self.chunks.pop_front();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
        self.frozen = false;
    }
}
