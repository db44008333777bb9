//! Codec contract (§6.2): type-parameterized (de)serialization. The engine never
//! inspects message contents, only the bytes a codec produces and consumes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// A serialization strategy for RPC request/response payloads.
pub trait Codec: Send + Sync + 'static {
    type EncodeError: std::error::Error + Send + Sync + 'static;
    type DecodeError: std::error::Error + Send + Sync + 'static;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::EncodeError>;
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Compact binary codec; the default for production traffic.
pub struct PostcardCodec;

#[derive(Debug)]
pub struct PostcardError(postcard::Error);

impl fmt::Display for PostcardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "postcard error: {}", self.0)
    }
}

impl std::error::Error for PostcardError {}

impl Codec for PostcardCodec {
    type EncodeError = PostcardError;
    type DecodeError = PostcardError;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(value).map_err(PostcardError)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf).map_err(PostcardError)
    }
}

/// Human-readable codec; useful for debugging and interop.
pub struct JsonCodec;

#[derive(Debug)]
pub struct JsonError(serde_json::Error);

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "json error: {}", self.0)
    }
}

impl std::error::Error for JsonError {}

impl Codec for JsonCodec {
    type EncodeError = JsonError;
    type DecodeError = JsonError;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(value).map_err(JsonError)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf).map_err(JsonError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: u32,
        name: String,
    }

    #[test]
    fn postcard_round_trips() {
        let value = Sample {
            id: 7,
            name: "hi".into(),
        };
        let bytes = PostcardCodec::encode(&value).unwrap();
        let decoded: Sample = PostcardCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_round_trips() {
        let value = Sample {
            id: 7,
            name: "hi".into(),
        };
        let bytes = JsonCodec::encode(&value).unwrap();
        let decoded: Sample = JsonCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
