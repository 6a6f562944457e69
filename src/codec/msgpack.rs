//! MsgPack line codec using `rmp-serde` plus base64.
//!
//! **CRITICAL**: Always use `to_vec_named`, NEVER `to_vec`!
//! Peers written against map-based MsgPack decoders expect struct-as-map format.
//!
//! MsgPack is binary and may contain `0x0A` bytes, so the encoded bytes are
//! wrapped in standard base64 to keep each frame on one line.
//!
//! # Example
//!
//! ```
//! use pipelink::codec::{LineCodec, MsgPackLineCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 10, content: "hello".to_string() };
//! let line = MsgPackLineCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackLineCodec::decode(&line).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::LineCodec;
use crate::error::Result;

/// MessagePack codec, base64-armoured for line framing.
pub struct MsgPackLineCodec;

impl LineCodec for MsgPackLineCodec {
    #[inline]
    fn encode<T: Serialize>(value: &T) -> Result<String> {
        // CRITICAL: to_vec_named, NOT to_vec!
        let bytes = rmp_serde::to_vec_named(value)?;
        Ok(STANDARD.encode(bytes))
    }

    #[inline]
    fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
        let bytes = STANDARD.decode(line.trim())?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipeLinkError;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let line = MsgPackLineCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackLineCodec::decode(&line).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_newline_bytes_are_armoured() {
        // 10 == b'\n' shows up verbatim in the raw msgpack encoding
        let raw = rmp_serde::to_vec_named(&10u8).unwrap();
        assert!(raw.contains(&b'\n'));

        let line = MsgPackLineCodec::encode(&10u8).unwrap();
        assert!(!line.contains('\n'));
        let decoded: u8 = MsgPackLineCodec::decode(&line).unwrap();
        assert_eq!(decoded, 10);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let line = MsgPackLineCodec::encode(&test).unwrap();
        let raw = STANDARD.decode(line).unwrap();

        // fixmap, not fixarray
        assert_eq!(raw[0] & 0xF0, 0x80, "Expected map format, got {:02X}", raw[0]);
    }

    #[test]
    fn test_batch_of_strings() {
        let batch = vec!["hello".to_string(), "world".to_string()];
        let line = MsgPackLineCodec::encode(&batch).unwrap();
        let decoded: Vec<String> = MsgPackLineCodec::decode(&line).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_error_on_invalid_base64() {
        let result: Result<TestStruct> = MsgPackLineCodec::decode("not base64 !!");
        assert!(matches!(result, Err(PipeLinkError::Base64(_))));
    }

    #[test]
    fn test_decode_error_on_invalid_msgpack() {
        let line = STANDARD.encode(b"\xc1\xc1\xc1");
        let result: Result<TestStruct> = MsgPackLineCodec::decode(&line);
        assert!(matches!(result, Err(PipeLinkError::MsgPackDecode(_))));
    }
}
