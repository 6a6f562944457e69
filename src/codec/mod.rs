//! Codec module - value ⇄ single-line text.
//!
//! Every frame on the wire is one line, so a codec must produce text that
//! contains no line separators. Two codecs are provided:
//!
//! - [`JsonLineCodec`] - compact JSON via `serde_json` (default)
//! - [`MsgPackLineCodec`] - MessagePack (`to_vec_named`) wrapped in standard base64
//!
//! # Design
//!
//! Codecs are marker types with associated functions rather than trait objects,
//! so the client and server select a codec at compile time through a type parameter.
//!
//! # Example
//!
//! ```
//! use pipelink::codec::{JsonLineCodec, LineCodec};
//!
//! let line = JsonLineCodec::encode(&vec!["a", "b"]).unwrap();
//! assert!(!line.contains('\n'));
//! let batch: Vec<String> = JsonLineCodec::decode(&line).unwrap();
//! assert_eq!(batch, vec!["a", "b"]);
//! ```

mod json;
mod msgpack;

use std::borrow::Cow;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use json::JsonLineCodec;
pub use msgpack::MsgPackLineCodec;

/// Encodes values to line-safe text and back.
pub trait LineCodec: Send + Sync + 'static {
    /// Encode a value into text free of `\r` and `\n`.
    fn encode<T: Serialize>(value: &T) -> Result<String>;

    /// Decode one line (without its terminator) into a value.
    fn decode<T: DeserializeOwned>(line: &str) -> Result<T>;
}

/// Remove every line separator (`\r\n`, `\n`, `\r`) from `text`.
///
/// Borrows when there is nothing to strip.
pub fn strip_line_separators(text: &str) -> Cow<'_, str> {
    if text.contains(['\r', '\n']) {
        Cow::Owned(text.chars().filter(|c| *c != '\r' && *c != '\n').collect())
    } else {
        Cow::Borrowed(text)
    }
}
