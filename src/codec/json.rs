//! JSON line codec using `serde_json`.
//!
//! `serde_json::to_string` is compact and escapes control characters inside
//! strings, so encoded output never spans lines. Separators are still stripped
//! to honour the codec contract for custom `Serialize` impls that emit raw text.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{strip_line_separators, LineCodec};
use crate::error::Result;

/// Compact JSON, one value per line.
pub struct JsonLineCodec;

impl LineCodec for JsonLineCodec {
    fn encode<T: Serialize>(value: &T) -> Result<String> {
        let json = serde_json::to_string(value)?;
        Ok(strip_line_separators(&json).into_owned())
    }

    fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
        Ok(serde_json::from_str(line)?)
    }
}
