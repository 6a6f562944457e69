//! Line frame reader and writer.
//!
//! A frame is one line of text terminated by `\n`. [`FrameReader`] yields one
//! line per call over any `AsyncRead`; end-of-stream is reported as `None`,
//! not as an error. [`write_frame`] strips separators from the payload,
//! appends the terminator and flushes.
//!
//! # Example
//!
//! ```
//! # tokio_test_block_on(async {
//! use pipelink::protocol::{write_frame, FrameReader};
//!
//! let (mut tx, rx) = tokio::io::duplex(1024);
//! write_frame(&mut tx, "[\"hello\"]").await.unwrap();
//! drop(tx);
//!
//! let mut reader = FrameReader::new(rx);
//! assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("[\"hello\"]"));
//! assert_eq!(reader.next_line().await.unwrap(), None);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::line_buffer::LineBuffer;
use crate::codec::strip_line_separators;
use crate::error::Result;

/// Size of a single read from the pipe.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads line frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: LineBuffer,
    ready: VecDeque<String>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default maximum line length.
    pub fn new(reader: R) -> Self {
        Self::with_buffer(reader, LineBuffer::new())
    }

    /// Create a reader with a custom maximum line length.
    pub fn with_max_line_length(reader: R, max_line_length: usize) -> Self {
        Self::with_buffer(reader, LineBuffer::with_max_line_length(max_line_length))
    }

    fn with_buffer(reader: R, buffer: LineBuffer) -> Self {
        Self {
            reader,
            buffer,
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Read the next line.
    ///
    /// Returns `Ok(None)` when the peer closed the stream. Bytes of an
    /// unterminated trailing line are discarded at that point.
    ///
    /// Cancel-safe: complete lines are buffered before this returns, so
    /// dropping the future between reads loses nothing already received.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if let Some(e) = self.buffer.take_error() {
                return Err(e);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        bytes = self.buffer.len(),
                        "Discarding unterminated line at end of stream"
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }

            let lines = self.buffer.push(&self.chunk[..n])?;
            self.ready.extend(lines);
        }
    }

    /// Consume the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Write one frame and flush it.
///
/// Line separators inside `line` are removed before writing, so a frame can
/// never be split in two on the reading side. Waiting for the peer to read
/// the frame is up to the pipe layer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    let payload = strip_line_separators(line);

    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.extend_from_slice(payload.as_bytes());
    buf.extend_from_slice(b"\n");

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut tx, rx) = duplex(1024);
        let mut reader = FrameReader::new(rx);

        write_frame(&mut tx, "one").await.unwrap();
        write_frame(&mut tx, "two").await.unwrap();

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_eof_is_none() {
        let (tx, rx) = duplex(64);
        let mut reader = FrameReader::new(rx);

        drop(tx);

        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_line_discarded_at_eof() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"complete\nincompl").await.unwrap();
        drop(tx);

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("complete"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_embedded_separators_are_stripped() {
        let (mut tx, rx) = duplex(1024);
        let mut reader = FrameReader::new(rx);

        write_frame(&mut tx, "<a>\r\n  <b/>\n</a>").await.unwrap();
        drop(tx);

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("<a>  <b/></a>"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_line_is_error() {
        let (mut tx, rx) = duplex(1024);
        let mut reader = FrameReader::with_max_line_length(rx, 4);

        write_frame(&mut tx, "too long").await.unwrap();

        assert!(reader.next_line().await.is_err());
    }

    #[tokio::test]
    async fn test_lines_before_invalid_line_are_delivered() {
        let (mut tx, rx) = duplex(1024);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"\"good\"\n\xff\n").await.unwrap();

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("\"good\""));
        assert!(reader.next_line().await.is_err());
    }

    #[tokio::test]
    async fn test_small_duplex_buffer_splits_frames() {
        // 8-byte pipe forces the writer to block until the reader drains
        let (mut tx, rx) = duplex(8);
        let mut reader = FrameReader::new(rx);

        let writer = tokio::spawn(async move {
            write_frame(&mut tx, "a fairly long frame payload").await.unwrap();
            tx
        });

        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("a fairly long frame payload")
        );
        writer.await.unwrap();
    }
}
