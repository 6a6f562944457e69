//! Protocol module - line framing.
//!
//! Every frame is exactly one line:
//! - client → server: one encoded request batch
//! - server → client: one encoded response value
//!
//! End-of-stream on read is a disconnect signal, not an error.
//!
//! An empty line on the callback pipe stands in for a response the server
//! could not produce. No codec encodes a value to an empty line, so the
//! client can tell it apart and still count it toward the batch.

mod frame;
mod line_buffer;

pub use frame::{write_frame, FrameReader};
pub use line_buffer::{LineBuffer, DEFAULT_MAX_LINE_LENGTH};

/// Callback frame sent in place of a response that could not be produced.
pub const FAILED_ITEM_FRAME: &str = "";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonLineCodec, LineCodec, MsgPackLineCodec};

    #[test]
    fn test_codecs_never_emit_failed_item_frame() {
        assert_ne!(JsonLineCodec::encode(&()).unwrap(), FAILED_ITEM_FRAME);
        assert_ne!(JsonLineCodec::encode(&String::new()).unwrap(), FAILED_ITEM_FRAME);
        assert_ne!(MsgPackLineCodec::encode(&()).unwrap(), FAILED_ITEM_FRAME);
        assert_ne!(MsgPackLineCodec::encode(&String::new()).unwrap(), FAILED_ITEM_FRAME);
    }
}
