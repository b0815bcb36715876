//! SysEx frame type and codec.
//!
//! A [`FrameCodec`] turns a command byte and a 7-bit payload into a complete
//! `F0 … F7` SysEx message for one device address, and parses such messages
//! back into [`Frame`]s. Payloads are held in `bytes::Bytes` so frames handed
//! out by the [`FrameBuffer`](super::FrameBuffer) share the read buffer.
//!
//! # Example
//!
//! ```
//! use k2_client::protocol::{FrameCodec, DeviceAddress, FrameChecksum};
//!
//! let codec = FrameCodec::new(DeviceAddress::default(), FrameChecksum::Sum7);
//! let bytes = codec.encode(0x15, &[]);
//! assert_eq!(&bytes[..], &[0xF0, 0x07, 0x00, 0x78, 0x15, 0x14, 0xF7]);
//!
//! let frame = codec.decode(&bytes).unwrap();
//! assert_eq!(frame.command, 0x15);
//! assert!(frame.payload.is_empty());
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::wire_format::{
    is_7bit, running_checksum, DEFAULT_DEVICE_ID, HEADER_SIZE, K2_PRODUCT_ID,
    KURZWEIL_MANUFACTURER_ID, SYSEX_END, SYSEX_START,
};

/// Why a byte sequence is not a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Bad delimiters, foreign addressing, too short, or an 8-bit data byte.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The trailing checksum disagrees with the frame contents.
    #[error("checksum mismatch on command 0x{command:02X}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch {
        /// Command byte of the damaged frame, for attribution.
        command: u8,
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
        /// Unverified payload, for best-effort attribution.
        payload: Bytes,
    },

    /// The end delimiter has not arrived yet.
    #[error("truncated frame")]
    Truncated,
}

/// The fixed addressing bytes every frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAddress {
    /// SysEx manufacturer ID (Kurzweil = 0x07).
    pub manufacturer_id: u8,
    /// Device ID set on the instrument's MIDI page.
    pub device_id: u8,
    /// Product identifier (K2 series = 0x78).
    pub product_id: u8,
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self {
            manufacturer_id: KURZWEIL_MANUFACTURER_ID,
            device_id: DEFAULT_DEVICE_ID,
            product_id: K2_PRODUCT_ID,
        }
    }
}

impl DeviceAddress {
    /// Address the default manufacturer/product with a specific device ID.
    pub fn with_device_id(device_id: u8) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }
}

/// Frame-level integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameChecksum {
    /// One byte before `F7`: 7-bit sum of everything after `F0`.
    #[default]
    Sum7,
    /// No frame checksum byte (stock K2 firmware).
    Disabled,
}

impl FrameChecksum {
    /// Bytes after the payload, including the end delimiter.
    #[inline]
    pub fn trailer_size(self) -> usize {
        match self {
            FrameChecksum::Sum7 => 2,
            FrameChecksum::Disabled => 1,
        }
    }
}

/// A decoded SysEx frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Device ID the frame was addressed with.
    pub device_id: u8,
    /// Command (message type) byte.
    pub command: u8,
    /// Bytes between the command and the checksum.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from its parts.
    pub fn new(device_id: u8, command: u8, payload: Bytes) -> Self {
        Self {
            device_id,
            command,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Encodes and decodes frames for one device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCodec {
    address: DeviceAddress,
    checksum: FrameChecksum,
}

impl FrameCodec {
    /// Create a codec for the given address and checksum mode.
    pub fn new(address: DeviceAddress, checksum: FrameChecksum) -> Self {
        Self { address, checksum }
    }

    /// The address this codec writes and accepts.
    #[inline]
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// The frame checksum mode.
    #[inline]
    pub fn checksum(&self) -> FrameChecksum {
        self.checksum
    }

    /// Smallest frame this codec can produce (empty payload).
    #[inline]
    pub fn min_frame_size(&self) -> usize {
        HEADER_SIZE + self.checksum.trailer_size()
    }

    /// Build a complete frame.
    ///
    /// `command` and every payload byte must be 7-bit; message encoders
    /// guarantee this for everything they produce.
    pub fn encode(&self, command: u8, payload: &[u8]) -> Bytes {
        debug_assert!(command & 0x80 == 0);
        debug_assert!(is_7bit(payload));

        let mut buf = BytesMut::with_capacity(self.min_frame_size() + payload.len());
        buf.put_u8(SYSEX_START);
        buf.put_u8(self.address.manufacturer_id);
        buf.put_u8(self.address.device_id);
        buf.put_u8(self.address.product_id);
        buf.put_u8(command);
        buf.put_slice(payload);
        if self.checksum == FrameChecksum::Sum7 {
            let sum = running_checksum(0, &buf[1..]);
            buf.put_u8(sum);
        }
        buf.put_u8(SYSEX_END);
        buf.freeze()
    }

    /// Re-encode a decoded frame under this codec's address.
    pub fn encode_frame(&self, frame: &Frame) -> Bytes {
        self.encode(frame.command, &frame.payload)
    }

    /// Parse a complete frame, copying the payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        self.decode_bytes(Bytes::copy_from_slice(bytes))
    }

    /// Parse a complete frame without copying its payload.
    pub fn decode_bytes(&self, bytes: Bytes) -> Result<Frame, FrameError> {
        match bytes.first() {
            Some(&SYSEX_START) => {}
            Some(&other) => {
                return Err(FrameError::Malformed(format!(
                    "expected start byte 0xF0, got 0x{:02X}",
                    other
                )))
            }
            None => return Err(FrameError::Truncated),
        }
        if bytes.last() != Some(&SYSEX_END) {
            return Err(FrameError::Truncated);
        }
        if bytes.len() < self.min_frame_size() {
            return Err(FrameError::Malformed(format!(
                "frame of {} bytes is shorter than the {}-byte minimum",
                bytes.len(),
                self.min_frame_size()
            )));
        }

        let (manufacturer, device, product, command) = (bytes[1], bytes[2], bytes[3], bytes[4]);
        if manufacturer != self.address.manufacturer_id {
            return Err(FrameError::Malformed(format!(
                "foreign manufacturer ID 0x{:02X}",
                manufacturer
            )));
        }
        if product != self.address.product_id {
            return Err(FrameError::Malformed(format!(
                "foreign product ID 0x{:02X}",
                product
            )));
        }
        if device != self.address.device_id {
            return Err(FrameError::Malformed(format!(
                "frame addressed to device 0x{:02X}",
                device
            )));
        }

        let body_end = bytes.len() - self.checksum.trailer_size();
        if self.checksum == FrameChecksum::Sum7 {
            let expected = running_checksum(0, &bytes[1..body_end]);
            let actual = bytes[body_end];
            if expected != actual {
                return Err(FrameError::ChecksumMismatch {
                    command,
                    expected,
                    actual,
                    payload: bytes.slice(HEADER_SIZE..body_end),
                });
            }
        }

        if !is_7bit(&bytes[1..bytes.len() - 1]) {
            return Err(FrameError::Malformed(
                "data byte with the high bit set".to_string(),
            ));
        }

        Ok(Frame {
            device_id: device,
            command,
            payload: bytes.slice(HEADER_SIZE..body_end),
        })
    }
}
