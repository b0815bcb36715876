//! Display decoding.
//!
//! A SCREENREPLY payload is one of three things, told apart by length:
//! - 321 bytes: the 8 × 40 text layer, row-major, plus a terminator
//! - 2561 bytes: the 240 × 64 graphics layer, 6 pixels per byte, plus a terminator
//! - anything else: a NUL-terminated string (parameter name or value)
//!
//! Decoding is pure. The inverse encoders build payloads for simulated
//! devices and tests.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{K2Error, Result};

/// Text columns per row.
pub const TEXT_COLUMNS: usize = 40;
/// Text rows.
pub const TEXT_ROWS: usize = 8;
/// Raster width in pixels.
pub const RASTER_WIDTH: usize = 240;
/// Raster height in pixels.
pub const RASTER_HEIGHT: usize = 64;
/// Horizontal pixels packed into each graphics byte.
pub const PIXELS_PER_BYTE: usize = 6;

/// Payload length of a text-layer reply.
pub const TEXT_REPLY_LEN: usize = TEXT_ROWS * TEXT_COLUMNS + 1;
/// Payload length of a graphics-layer reply.
pub const GRAPHICS_REPLY_LEN: usize = RASTER_WIDTH * RASTER_HEIGHT / PIXELS_PER_BYTE + 1;

/// Luminance of a lit pixel.
pub const PIXEL_ON: u8 = 0xFF;
/// Luminance of a dark pixel.
pub const PIXEL_OFF: u8 = 0x00;

/// Map a display character code to the character shown.
///
/// Printable ASCII is itself; every other code renders blank.
#[inline]
pub fn display_char(code: u8) -> char {
    if (0x20..=0x7E).contains(&code) {
        code as char
    } else {
        ' '
    }
}

/// The 8 × 40 text layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextGrid {
    rows: Vec<String>,
}

impl TextGrid {
    /// An all-blank grid.
    pub fn blank() -> Self {
        Self {
            rows: vec![" ".repeat(TEXT_COLUMNS); TEXT_ROWS],
        }
    }

    /// Build a grid from text, one line per row. Lines are cut or padded to
    /// 40 columns; missing rows are blank.
    pub fn from_text(text: &str) -> Self {
        let mut grid = Self::blank();
        for (row, line) in grid.rows.iter_mut().zip(text.lines()) {
            let mut cells: String = line.bytes().map(display_char).take(TEXT_COLUMNS).collect();
            while cells.len() < TEXT_COLUMNS {
                cells.push(' ');
            }
            *row = cells;
        }
        grid
    }

    /// Decode a 321-byte text reply.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != TEXT_REPLY_LEN {
            return Err(K2Error::Malformed(format!(
                "text layer must be {} bytes, got {}",
                TEXT_REPLY_LEN,
                payload.len()
            )));
        }
        let rows = payload[..TEXT_REPLY_LEN - 1]
            .chunks(TEXT_COLUMNS)
            .map(|row| row.iter().copied().map(display_char).collect())
            .collect();
        Ok(Self { rows })
    }

    /// Encode as a 321-byte text reply.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TEXT_REPLY_LEN);
        for row in &self.rows {
            out.extend_from_slice(row.as_bytes());
        }
        out.push(0x00);
        out
    }

    /// All rows, each exactly 40 characters.
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// One row, or `None` past the last.
    pub fn row(&self, index: usize) -> Option<&str> {
        self.rows.get(index).map(String::as_str)
    }

    /// Character at a cell, or `None` outside the grid.
    pub fn cell(&self, row: usize, column: usize) -> Option<char> {
        self.rows
            .get(row)
            .and_then(|r| r.as_bytes().get(column))
            .map(|&b| b as char)
    }

    /// Whether any row contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.rows.iter().any(|row| row.contains(needle))
    }
}

impl Default for TextGrid {
    fn default() -> Self {
        Self::blank()
    }
}

impl fmt::Display for TextGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(row)?;
        }
        Ok(())
    }
}

/// The 240 × 64 monochrome graphics layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raster {
    /// Row-major luminance, one byte per pixel.
    pixels: Vec<u8>,
}

impl Raster {
    /// An all-dark raster.
    pub fn blank() -> Self {
        Self {
            pixels: vec![PIXEL_OFF; RASTER_WIDTH * RASTER_HEIGHT],
        }
    }

    /// Build a raster from a pixel predicate.
    pub fn from_fn(mut lit: impl FnMut(usize, usize) -> bool) -> Self {
        let mut raster = Self::blank();
        for y in 0..RASTER_HEIGHT {
            for x in 0..RASTER_WIDTH {
                raster.set(x, y, lit(x, y));
            }
        }
        raster
    }

    /// Decode a 2561-byte graphics reply.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != GRAPHICS_REPLY_LEN {
            return Err(K2Error::Malformed(format!(
                "graphics layer must be {} bytes, got {}",
                GRAPHICS_REPLY_LEN,
                payload.len()
            )));
        }
        let mut pixels = Vec::with_capacity(RASTER_WIDTH * RASTER_HEIGHT);
        for &packed in &payload[..GRAPHICS_REPLY_LEN - 1] {
            // Bit 0 is the leftmost pixel.
            for bit in 0..PIXELS_PER_BYTE {
                let lit = packed >> bit & 1 == 1;
                pixels.push(if lit { PIXEL_ON } else { PIXEL_OFF });
            }
        }
        Ok(Self { pixels })
    }

    /// Encode as a 2561-byte graphics reply.
    pub fn encode(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self
            .pixels
            .chunks(PIXELS_PER_BYTE)
            .map(|group| {
                group
                    .iter()
                    .enumerate()
                    .filter(|&(_, &luma)| luma != PIXEL_OFF)
                    .fold(0u8, |acc, (bit, _)| acc | 1 << bit)
            })
            .collect();
        out.push(0x00);
        out
    }

    /// Whether the pixel at (x, y) is lit. Out-of-range reads are dark.
    pub fn get(&self, x: usize, y: usize) -> bool {
        x < RASTER_WIDTH
            && y < RASTER_HEIGHT
            && self.pixels[y * RASTER_WIDTH + x] != PIXEL_OFF
    }

    /// Light or darken a pixel. Out-of-range writes are ignored.
    pub fn set(&mut self, x: usize, y: usize, lit: bool) {
        if x < RASTER_WIDTH && y < RASTER_HEIGHT {
            self.pixels[y * RASTER_WIDTH + x] = if lit { PIXEL_ON } else { PIXEL_OFF };
        }
    }

    /// Row-major luminance bytes (0x00 or 0xFF), `width * height` long.
    pub fn luminance(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> usize {
        RASTER_WIDTH
    }

    pub fn height(&self) -> usize {
        RASTER_HEIGHT
    }

    /// Number of lit pixels.
    pub fn lit_count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p != PIXEL_OFF).count()
    }
}

impl Default for Raster {
    fn default() -> Self {
        Self::blank()
    }
}

/// Decode a NUL-terminated string reply.
pub fn decode_string(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    payload[..end].iter().copied().map(display_char).collect()
}

/// Encode a string reply. Only printable ASCII survives.
pub fn encode_string(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.bytes().map(|b| display_char(b) as u8).collect();
    out.push(0x00);
    out
}

/// What a SCREENREPLY payload contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenContent {
    Text(TextGrid),
    Graphics(Raster),
    /// Parameter name or value.
    String(String),
}

impl ScreenContent {
    /// Classify and decode a SCREENREPLY payload by its length.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            TEXT_REPLY_LEN => TextGrid::decode(payload).map(ScreenContent::Text),
            GRAPHICS_REPLY_LEN => Raster::decode(payload).map(ScreenContent::Graphics),
            _ => Ok(ScreenContent::String(decode_string(payload))),
        }
    }
}

/// Last known contents of the display.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreenState {
    pub text: TextGrid,
    pub raster: Option<Raster>,
}

impl ScreenState {
    pub fn new(text: TextGrid, raster: Option<Raster>) -> Self {
        Self { text, raster }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_grid_decodes_rows() {
        let mut payload = vec![b' '; TEXT_REPLY_LEN - 1];
        payload[..7].copy_from_slice(b"Program");
        payload[TEXT_COLUMNS..TEXT_COLUMNS + 3].copy_from_slice(b"125");
        payload.push(0x00);

        let grid = TextGrid::decode(&payload).unwrap();
        assert_eq!(grid.rows().len(), TEXT_ROWS);
        assert!(grid.row(0).unwrap().starts_with("Program"));
        assert!(grid.row(1).unwrap().starts_with("125"));
        assert_eq!(grid.cell(1, 2), Some('5'));
        assert_eq!(grid.cell(8, 0), None);
    }

    #[test]
    fn test_unprintable_codes_render_blank() {
        let mut payload = vec![0x00; TEXT_REPLY_LEN];
        payload[0] = 0x7F;
        payload[1] = b'A';
        payload[2] = 0x01;

        let grid = TextGrid::decode(&payload).unwrap();
        assert_eq!(grid.cell(0, 0), Some(' '));
        assert_eq!(grid.cell(0, 1), Some('A'));
        assert_eq!(grid.cell(0, 2), Some(' '));
        assert!(grid.rows().iter().all(|r| r.len() == TEXT_COLUMNS));
    }

    #[test]
    fn test_character_table() {
        for code in 0x00..=0xFFu8 {
            let expected = match code {
                0x20..=0x7E => code as char,
                _ => ' ',
            };
            assert_eq!(display_char(code), expected, "code 0x{:02X}", code);
        }
        assert_eq!(display_char(b'~'), '~');
        assert_eq!(display_char(0x7F), ' ');
    }

    #[test]
    fn test_every_code_decodes_in_place() {
        // Codes 0x00..=0x7F fill the first 128 cells, then repeat.
        let mut payload: Vec<u8> = (0..TEXT_ROWS * TEXT_COLUMNS)
            .map(|i| (i % 0x80) as u8)
            .collect();
        payload.push(0x00);

        let grid = TextGrid::decode(&payload).unwrap();
        for (i, &code) in payload[..TEXT_REPLY_LEN - 1].iter().enumerate() {
            let cell = grid.cell(i / TEXT_COLUMNS, i % TEXT_COLUMNS);
            assert_eq!(cell, Some(display_char(code)), "cell {}", i);
        }
    }

    #[test]
    fn test_terminator_is_not_a_cell() {
        let mut payload = vec![b'x'; TEXT_REPLY_LEN];
        payload[TEXT_REPLY_LEN - 1] = b'Z';

        let grid = TextGrid::decode(&payload).unwrap();
        assert!(!grid.contains("Z"));
        assert_eq!(grid.rows().len(), TEXT_ROWS);
        assert!(grid.rows().iter().all(|r| r == &"x".repeat(TEXT_COLUMNS)));

        let encoded = grid.encode();
        assert_eq!(encoded.len(), TEXT_REPLY_LEN);
        assert_eq!(encoded[TEXT_REPLY_LEN - 1], 0x00);
    }

    #[test]
    fn test_text_encode_is_inverse() {
        let grid = TextGrid::from_text("Program Mode\n125 Fast Solo Tenor");
        let payload = grid.encode();
        assert_eq!(payload.len(), TEXT_REPLY_LEN);
        assert_eq!(TextGrid::decode(&payload).unwrap(), grid);
        assert!(grid.contains("Fast Solo Tenor"));
        assert_eq!(grid.to_string().lines().count(), TEXT_ROWS);
    }

    #[test]
    fn test_raster_pixel_order() {
        let mut payload = vec![0u8; GRAPHICS_REPLY_LEN];
        // First byte: leftmost pixel only.
        payload[0] = 0b000001;
        // Second byte of row 1: pixels 6 and 11.
        payload[41] = 0b100001;

        let raster = Raster::decode(&payload).unwrap();
        assert!(raster.get(0, 0));
        assert!(!raster.get(1, 0));
        assert!(raster.get(6, 1));
        assert!(raster.get(11, 1));
        assert!(!raster.get(12, 1));
        assert_eq!(raster.lit_count(), 3);
        assert_eq!(raster.luminance().len(), RASTER_WIDTH * RASTER_HEIGHT);
        assert_eq!(raster.luminance()[0], PIXEL_ON);
    }

    #[test]
    fn test_raster_encode_is_inverse() {
        let raster = Raster::from_fn(|x, y| (x + y) % 3 == 0 || x == RASTER_WIDTH - 1);
        let payload = raster.encode();
        assert_eq!(payload.len(), GRAPHICS_REPLY_LEN);
        assert_eq!(Raster::decode(&payload).unwrap(), raster);
    }

    #[test]
    fn test_screen_content_dispatches_on_length() {
        let text = TextGrid::blank().encode();
        assert!(matches!(
            ScreenContent::decode(&text).unwrap(),
            ScreenContent::Text(_)
        ));

        let graphics = Raster::blank().encode();
        assert!(matches!(
            ScreenContent::decode(&graphics).unwrap(),
            ScreenContent::Graphics(_)
        ));

        assert_eq!(
            ScreenContent::decode(b"Volume\0").unwrap(),
            ScreenContent::String("Volume".to_string())
        );
    }

    #[test]
    fn test_string_reply() {
        assert_eq!(decode_string(&encode_string("-12 dB")), "-12 dB");
        assert_eq!(decode_string(b"abc"), "abc");
        assert_eq!(decode_string(b""), "");
    }

    #[test]
    fn test_wrong_lengths_rejected() {
        assert!(TextGrid::decode(&[0; 10]).is_err());
        assert!(Raster::decode(&[0; 10]).is_err());
    }
}
