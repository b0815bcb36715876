//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the SysEx layer:
//! - Frame codec with addressing and 7-bit checksum
//! - Frame buffer for reassembling frames across arbitrary reads
//! - 7-bit field and object data encodings

mod frame;
mod frame_buffer;
pub mod wire_format;

pub use frame::{DeviceAddress, Frame, FrameChecksum, FrameCodec, FrameError};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_data, encode_7bit, encode_data, read_7bit, EncodingFormat, DEFAULT_MAX_FRAME_SIZE,
    HEADER_SIZE, K2_PRODUCT_ID, KURZWEIL_MANUFACTURER_ID, SYSEX_END, SYSEX_START, WHOLE_OBJECT,
};
