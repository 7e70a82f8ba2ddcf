//! Typed message codecs.
//!
//! A codec turns a typed value into the opaque bytes carried inside a message
//! frame and back. Framing and compression happen after encoding.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The bytes could not be decoded into the expected type.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encodes and decodes values of type `T`.
pub trait Codec<T>: Send + Sync + 'static {
    /// Encodes a value into message bytes.
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Decodes message bytes into a value.
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// `bincode` serialization for any serde type.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Identity codec for raw byte payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec<Bytes> for BytesCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
