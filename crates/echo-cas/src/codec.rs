// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pluggable encoding for stored task results.
//!
//! Result bytes written to an [`crate::InstanceDirectory`]'s `result` file
//! are opaque to the cache layer itself; what they mean is a decision for
//! whoever writes and reads them. [`OpaqueCodec`] is the default — compact,
//! binary, via `ciborium` — and [`JsonCodec`] trades size for being
//! inspectable with any JSON tool, for callers who want to poke at a cache
//! root by hand.

use serde_json::Value;

use crate::CasError;

/// Encodes and decodes task results for on-disk storage.
pub trait Codec: Send + Sync {
    /// Encodes `value` to bytes suitable for [`crate::InstanceDirectory::save_result`].
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Codec`] if `value` cannot be encoded.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CasError>;

    /// Decodes bytes previously produced by [`Codec::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Codec`] if `bytes` cannot be decoded.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CasError>;
}

/// Default codec: compact binary encoding via `ciborium`. Not meant for
/// human inspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueCodec;

impl Codec for OpaqueCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CasError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).map_err(|e| CasError::Codec(e.to_string()))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CasError> {
        ciborium::de::from_reader(bytes).map_err(|e| CasError::Codec(e.to_string()))
    }
}

/// JSON encoding, for cache roots meant to be inspected with generic
/// tooling rather than only by this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CasError> {
        serde_json::to_vec(value).map_err(|e| CasError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CasError> {
        serde_json::from_slice(bytes).map_err(|e| CasError::Codec(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn opaque_codec_round_trips() {
        let codec = OpaqueCodec;
        let value = json!({"n": 6, "k": 3, "result": 20});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let value = json!({"n": 6, "k": 3, "result": 20});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn json_codec_output_is_human_readable_json() {
        let codec = JsonCodec;
        let bytes = codec.encode(&json!({"a": 1})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn opaque_and_json_codecs_disagree_on_encoding() {
        let value = json!({"a": 1});
        let opaque = OpaqueCodec.encode(&value).unwrap();
        let json = JsonCodec.encode(&value).unwrap();
        assert_ne!(opaque, json);
    }
}
