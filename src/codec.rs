//! Payload codec: typed models to and from JSON documents.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Encode a payload into the stored document format.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, CodecError> {
    serde_json::to_value(value).map_err(|source| CodecError::Encode {
        what: std::any::type_name::<T>(),
        source,
    })
}

/// Decode a stored document into a typed payload.
pub fn decode<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, CodecError> {
    T::deserialize(value).map_err(|source| CodecError::Decode {
        what: std::any::type_name::<T>(),
        source,
    })
}
