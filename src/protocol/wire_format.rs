//! Wire format constants and field encodings.
//!
//! Every K2 SysEx frame has the shape:
//! ```text
//! ┌──────┬──────┬────────┬─────────┬─────────┬──────────┬──────────┬──────┐
//! │ F0   │ 07   │ Dev ID │ 78      │ Command │ Payload  │ Checksum │ F7   │
//! │ start│ mfr  │ 1 byte │ product │ 1 byte  │ N bytes  │ 1 byte   │ end  │
//! └──────┴──────┴────────┴─────────┴─────────┴──────────┴──────────┴──────┘
//! ```
//!
//! All bytes between the delimiters are 7-bit. Numeric fields inside payloads
//! are big-endian groups of 7 bits, and object data is carried either
//! "nibblized" (4 bits per byte) or as a 7-bit "bit stream".

use serde::{Deserialize, Serialize};

use crate::error::{K2Error, Result};

/// SysEx start delimiter.
pub const SYSEX_START: u8 = 0xF0;

/// SysEx end delimiter.
pub const SYSEX_END: u8 = 0xF7;

/// Kurzweil manufacturer ID.
pub const KURZWEIL_MANUFACTURER_ID: u8 = 0x07;

/// Device ID the K2 answers to out of the box.
pub const DEFAULT_DEVICE_ID: u8 = 0x00;

/// Product identifier for the K2 series.
pub const K2_PRODUCT_ID: u8 = 0x78;

/// Bytes before the payload: start, manufacturer, device, product, command.
pub const HEADER_SIZE: usize = 5;

/// Default upper bound for a single frame (4 MB).
///
/// The largest K2 object (2^21 - 1 bytes) bitstream-encoded is ~2.4 MB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Largest value the DUMP `size` field can carry; asks for "everything".
pub const WHOLE_OBJECT: u32 = (1 << 21) - 1;

/// How object data bytes are spread over 7-bit SysEx bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncodingFormat {
    /// Each 8-bit byte becomes two right-aligned 4-bit bytes.
    Nibblized = 0,
    /// The data is one big-endian bit string cut into 7-bit bytes.
    BitStream = 1,
}

impl EncodingFormat {
    /// Bits carried per transmitted byte.
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            EncodingFormat::Nibblized => 4,
            EncodingFormat::BitStream => 7,
        }
    }

    /// Parse the `form` byte of a DUMP/LOAD/WRITE message.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EncodingFormat::Nibblized),
            1 => Some(EncodingFormat::BitStream),
            _ => None,
        }
    }
}

/// Check that every byte is a SysEx data byte (high bit clear).
#[inline]
pub fn is_7bit(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b & 0x80 == 0)
}

/// Append `value` as `width` big-endian 7-bit groups.
///
/// Fails with a validation error if `value` does not fit.
pub fn put_7bit(buf: &mut Vec<u8>, value: u32, width: usize) -> Result<()> {
    let limit = 1u64 << (7 * width as u64);
    if u64::from(value) >= limit {
        return Err(K2Error::Validation(format!(
            "Can't encode {} in {} 7-bit bytes",
            value, width
        )));
    }
    for i in (0..width).rev() {
        buf.push(((value >> (7 * i)) & 0x7F) as u8);
    }
    Ok(())
}

/// Encode `value` as `width` big-endian 7-bit groups.
pub fn encode_7bit(value: u32, width: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(width);
    put_7bit(&mut buf, value, width)?;
    Ok(buf)
}

/// Read a big-endian 7-bit multi-byte integer.
pub fn read_7bit(bytes: &[u8]) -> Result<u32> {
    if bytes.len() > 4 {
        return Err(K2Error::Malformed(format!(
            "7-bit field of {} bytes is too wide",
            bytes.len()
        )));
    }
    let mut value = 0u32;
    for &b in bytes {
        if b & 0x80 != 0 {
            return Err(K2Error::Malformed(format!(
                "byte 0x{:02X} has bits set above the 7th",
                b
            )));
        }
        value = (value << 7) | u32::from(b);
    }
    Ok(value)
}

/// Pack data bytes into right-aligned `n`-bit groups.
///
/// The data is treated as one big-endian bit string, left-padded with zeros
/// to a whole number of groups.
pub fn pack_bits(data: &[u8], n: u32) -> Vec<u8> {
    debug_assert!((1..=7).contains(&n));
    let total_bits = data.len() as u64 * 8;
    let groups = total_bits.div_ceil(u64::from(n));
    let mut out = Vec::with_capacity(groups as usize);

    let mask = (1u32 << n) - 1;
    let mut acc: u32 = 0;
    // Leading pad bits are zeros already sitting in `acc`.
    let mut nbits = (groups * u64::from(n) - total_bits) as u32;

    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        nbits += 8;
        while nbits >= n {
            nbits -= n;
            out.push(((acc >> nbits) & mask) as u8);
        }
        acc &= (1u32 << nbits) - 1;
    }

    out
}

/// Unpack `n`-bit groups back into bytes, keeping the trailing `size` bytes.
pub fn unpack_bits(encoded: &[u8], n: u32, size: usize) -> Result<Vec<u8>> {
    debug_assert!((1..=7).contains(&n));
    let total_bits = encoded.len() as u64 * u64::from(n);
    let mut out = Vec::with_capacity(total_bits.div_ceil(8) as usize);

    let mut acc: u32 = 0;
    let mut nbits = ((8 - total_bits % 8) % 8) as u32;

    for &group in encoded {
        if u32::from(group) >> n != 0 {
            return Err(K2Error::Malformed(format!(
                "byte 0x{:02X} has bits set above the {}th",
                group, n
            )));
        }
        acc = (acc << n) | u32::from(group);
        nbits += n;
        while nbits >= 8 {
            nbits -= 8;
            out.push(((acc >> nbits) & 0xFF) as u8);
        }
        acc &= (1u32 << nbits) - 1;
    }

    if size > out.len() {
        return Err(K2Error::Malformed(format!(
            "declared size {} exceeds the {} bytes carried",
            size,
            out.len()
        )));
    }
    Ok(out.split_off(out.len() - size))
}

/// Encode object data for transmission.
#[inline]
pub fn encode_data(data: &[u8], form: EncodingFormat) -> Vec<u8> {
    pack_bits(data, form.bits())
}

/// Decode transmitted object data of the declared `size`.
#[inline]
pub fn decode_data(encoded: &[u8], form: EncodingFormat, size: usize) -> Result<Vec<u8>> {
    unpack_bits(encoded, form.bits(), size)
}

/// 7-bit checksum of encoded data bytes.
#[inline]
pub fn data_checksum(encoded: &[u8]) -> u8 {
    running_checksum(0, encoded)
}

/// Fold more encoded bytes into an existing 7-bit checksum.
///
/// Checksums are sums modulo 128, so the checksum of a concatenation is the
/// running fold over its parts.
#[inline]
pub fn running_checksum(previous: u8, encoded: &[u8]) -> u8 {
    encoded
        .iter()
        .fold(u32::from(previous), |acc, &b| acc + u32::from(b)) as u8
        & 0x7F
}
