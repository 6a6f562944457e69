//! Line buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management. Bytes arrive from the pipe
//! in arbitrary chunks; every `\n` terminates one frame. A trailing `\r`
//! before the terminator is dropped so peers that write CRLF are accepted.
//!
//! # Example
//!
//! ```ignore
//! use pipelink::protocol::LineBuffer;
//!
//! let mut buffer = LineBuffer::new();
//!
//! // Data arrives in chunks from the pipe
//! let lines = buffer.push(b"[\"a\",\"b\"]\n[\"c").unwrap();
//! assert_eq!(lines, vec!["[\"a\",\"b\"]"]);
//! ```

use bytes::BytesMut;

use crate::error::{PipeLinkError, Result};

/// Default maximum line length (16 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete lines.
pub struct LineBuffer {
    /// Accumulated bytes from pipe reads.
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no terminator.
    scanned: usize,
    /// Maximum allowed line length, terminator excluded.
    max_line_length: usize,
    /// Error hit after some lines of the same push were already extracted.
    deferred: Option<PipeLinkError>,
}

impl LineBuffer {
    /// Create a new line buffer with default settings.
    ///
    /// Default capacity: 64KB, max line: 16MB.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a new line buffer with a custom max line length.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            scanned: 0,
            max_line_length,
            deferred: None,
        }
    }

    /// Push data into the buffer and extract all complete lines.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a line exceeds the maximum length or
    /// is not valid UTF-8. The buffer is cleared in that case. Lines that
    /// preceded the bad one in the same push are still returned, and the
    /// error is held for [`take_error`](Self::take_error).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>> {
        if let Some(e) = self.deferred.take() {
            self.clear();
            return Err(e);
        }

        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => break,
                Err(e) => {
                    self.clear();
                    if lines.is_empty() {
                        return Err(e);
                    }
                    self.deferred = Some(e);
                    break;
                }
            }
        }

        Ok(lines)
    }

    /// Take the error held back by the last [`push`](Self::push), if any.
    pub fn take_error(&mut self) -> Option<PipeLinkError> {
        self.deferred.take()
    }

    /// Try to extract a single line from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<String>> {
        let newline = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| self.scanned + offset);

        let Some(end) = newline else {
            self.scanned = self.buffer.len();
            if self.buffer.len() > self.max_line_length {
                return Err(line_too_long(self.buffer.len(), self.max_line_length));
            }
            return Ok(None);
        };

        let mut line = self.buffer.split_to(end + 1);
        self.scanned = 0;

        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        if line.len() > self.max_line_length {
            return Err(line_too_long(line.len(), self.max_line_length));
        }

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| PipeLinkError::Protocol(format!("Line is not valid UTF-8: {}", e)))
    }

    /// Get the number of buffered bytes (an incomplete line).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer, dropping any partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn line_too_long(len: usize, max: usize) -> PipeLinkError {
    PipeLinkError::Protocol(format!("Line length {} exceeds maximum {}", len, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_complete_line() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"hello\n").unwrap();

        assert_eq!(lines, vec!["hello"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_lines_in_one_push() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"first\nsecond\nthird\n").unwrap();

        assert_eq!(lines, vec!["first", "second", "third"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_line() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"{\"id\":").unwrap();
        assert!(lines.is_empty());
        assert_eq!(buffer.len(), 6);

        let lines = buffer.push(b"1}\n").unwrap();
        assert_eq!(lines, vec!["{\"id\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_crlf_terminator() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"windows\r\nunix\n").unwrap();

        assert_eq!(lines, vec!["windows", "unix"]);
    }

    #[test]
    fn test_empty_line() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"\n").unwrap();

        assert_eq!(lines, vec![""]);
    }

    #[test]
    fn test_max_line_validation() {
        let mut buffer = LineBuffer::with_max_line_length(8);

        let result = buffer.push(b"0123456789");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_max_line_validation_on_complete_line() {
        let mut buffer = LineBuffer::with_max_line_length(4);

        assert!(buffer.push(b"abcd\n").is_ok());
        assert!(buffer.push(b"abcde\n").is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buffer = LineBuffer::new();

        let result = buffer.push(b"\xff\xfe\n");

        assert!(result.unwrap_err().to_string().contains("UTF-8"));
    }

    #[test]
    fn test_good_lines_survive_bad_line_in_same_push() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"\"good\"\n\xff\n\"lost\"\n").unwrap();

        assert_eq!(lines, vec!["\"good\""]);
        assert!(buffer.is_empty());
        let err = buffer.take_error().unwrap();
        assert!(err.to_string().contains("UTF-8"));
        assert!(buffer.take_error().is_none());
    }

    #[test]
    fn test_deferred_error_reported_by_next_push() {
        let mut buffer = LineBuffer::with_max_line_length(4);

        assert_eq!(buffer.push(b"ok\ntoo long\n").unwrap(), vec!["ok"]);

        let result = buffer.push(b"next\n");
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
        assert_eq!(buffer.push(b"next\n").unwrap(), vec!["next"]);
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = LineBuffer::new();

        let lines = buffer.push(b"one\ntw").unwrap();
        assert_eq!(lines, vec!["one"]);
        assert_eq!(buffer.len(), 2);

        let lines = buffer.push(b"o\n").unwrap();
        assert_eq!(lines, vec!["two"]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = LineBuffer::new();
        let data = b"hi\nthere\n";

        let mut all_lines = Vec::new();
        for byte in data {
            all_lines.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_lines, vec!["hi", "there"]);
    }

    #[test]
    fn test_clear_drops_partial_line() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"partial").unwrap();

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.push(b"next\n").unwrap(), vec!["next"]);
    }
}
