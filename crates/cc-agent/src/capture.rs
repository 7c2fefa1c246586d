use std::io::{self, Write};

/// Default retention per captured stream.
pub const DEFAULT_CAPTURE_LIMIT: usize = 256 * 1024;

const TRUNCATION_BANNER: &str = "... output truncated ...\n";

/// Ring-buffer writer that keeps the tail of an unbounded byte stream.
///
/// Writes never fail and always report the full input length as accepted, so
/// a child process piping into this buffer is never stalled. Once more than
/// the configured limit has passed through, rendering prepends a truncation
/// banner and yields exactly the last `limit` bytes.
pub struct TailBuffer {
    buf: Vec<u8>,
    head: usize,
    total: u64,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        let limit = if limit == 0 { DEFAULT_CAPTURE_LIMIT } else { limit };
        Self {
            buf: vec![0; limit],
            head: 0,
            total: 0,
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total
    }

    /// Reconstructs the retained tail. Stable under repeated calls.
    pub fn render(&self) -> String {
        let limit = self.buf.len();
        if self.total <= limit as u64 {
            return String::from_utf8_lossy(&self.buf[..self.total as usize]).into_owned();
        }

        // Wrapped: head points at the oldest retained byte.
        let mut assembled = Vec::with_capacity(TRUNCATION_BANNER.len() + limit);
        assembled.extend_from_slice(TRUNCATION_BANNER.as_bytes());
        assembled.extend_from_slice(&self.buf[self.head..]);
        assembled.extend_from_slice(&self.buf[..self.head]);
        String::from_utf8_lossy(&assembled).into_owned()
    }
}

impl Write for TailBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let full_len = data.len();
        let limit = self.buf.len();

        // A write larger than the ring can only contribute its final bytes.
        let mut chunk = data;
        if chunk.len() > limit {
            chunk = &chunk[chunk.len() - limit..];
        }

        while !chunk.is_empty() {
            let span = (limit - self.head).min(chunk.len());
            self.buf[self.head..self.head + span].copy_from_slice(&chunk[..span]);
            self.head += span;
            if self.head == limit {
                self.head = 0;
            }
            chunk = &chunk[span..];
        }

        self.total += full_len as u64;
        Ok(full_len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
