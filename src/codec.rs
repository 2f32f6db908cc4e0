//! Canonical binary encoding used for cache keys, disk entries and immutable
//! data.

use base64::Engine;
use base64::engine::general_purpose;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Encodes anything serializable as CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a CBOR buffer produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Serializes a value and renders the bytes as standard base64.
pub fn value_to_base64_string<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    Ok(general_purpose::STANDARD.encode(encode(value)?))
}

/// CRC32 (IEEE) of a serialized buffer.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
