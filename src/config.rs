//! Session configuration.
//!
//! Every field has a default matching the device's usual behaviour, so a
//! config file only needs the fields it changes:
//!
//! ```
//! use k2_client::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::from_json(r#"{ "call_timeout_ms": 2500 }"#).unwrap();
//! assert_eq!(config.call_timeout, Duration::from_millis(2500));
//! assert_eq!(config.ping_timeout, Duration::from_millis(100));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::JsonCodec;
use crate::dispatch::ReassemblyMode;
use crate::error::Result;
use crate::protocol::{DeviceAddress, FrameChecksum, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::writer::WriterConfig;

/// Default bound on a single request.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on the liveness ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Default transport read size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a [`Session`](crate::Session) can be tuned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Addressing bytes every frame carries.
    pub address: DeviceAddress,
    /// Whether frames end with a checksum byte. Stock firmware sends none;
    /// MIDI port sessions use `Disabled` unless this is set explicitly.
    pub frame_checksum: FrameChecksum,
    /// Bound on each request.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    /// Bound on the liveness ping at startup.
    #[serde(rename = "ping_timeout_ms", with = "duration_ms")]
    pub ping_timeout: Duration,
    /// Longest frame accepted before it is discarded.
    pub max_frame_size: usize,
    /// Bytes requested from the transport per read.
    pub read_buffer_size: usize,
    /// Outbound queue settings.
    pub writer: WriterConfig,
    /// How chunked transfers are put back together.
    pub reassembly: ReassemblyMode,
    /// Read the screen after each navigation step.
    pub confirm_navigation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: DeviceAddress::default(),
            frame_checksum: FrameChecksum::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
            reassembly: ReassemblyMode::default(),
            confirm_navigation: false,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        JsonCodec::decode(text)
    }

    pub fn to_json(&self) -> Result<String> {
        JsonCodec::encode(self)
    }

    /// Frame codec for this configuration.
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.address, self.frame_checksum)
    }
}

/// Durations as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::K2Error;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(1));
        assert_eq!(config.ping_timeout, Duration::from_millis(100));
        assert_eq!(config.frame_checksum, FrameChecksum::Sum7);
        assert_eq!(config.reassembly, ReassemblyMode::SequentialOffsets);
        assert!(!config.confirm_navigation);
    }

    #[test]
    fn test_partial_json() {
        let config = SessionConfig::from_json(
            r#"{
                "frame_checksum": "disabled",
                "reassembly": "arrival_order",
                "writer": { "channel_capacity": 8 },
                "address": { "device_id": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.frame_checksum, FrameChecksum::Disabled);
        assert_eq!(config.reassembly, ReassemblyMode::ArrivalOrder);
        assert_eq!(config.writer.channel_capacity, 8);
        assert_eq!(config.writer.max_pending_frames, WriterConfig::default().max_pending_frames);
        assert_eq!(config.address.device_id, 3);
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SessionConfig {
            confirm_navigation: true,
            call_timeout: Duration::from_millis(750),
            ..SessionConfig::default()
        };
        let text = config.to_json().unwrap();
        assert!(text.contains("\"call_timeout_ms\": 750"));
        assert_eq!(SessionConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            SessionConfig::from_json("{\"call_timeout_ms\": \"soon\"}"),
            Err(K2Error::Json(_))
        ));
    }
}
