//! JSON codec using `serde_json`.

use crate::error::Result;

/// JSON codec for configuration files and readable snapshots.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value as pretty-printed JSON.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    /// Decode a value from JSON text.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
        Ok(serde_json::from_str(text)?)
    }
}
