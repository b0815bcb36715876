//! Frame buffer for accumulating partial reads.
//!
//! MIDI transports deliver SysEx messages split at arbitrary boundaries and
//! interleaved with unrelated traffic. The buffer is a small state machine:
//! - `Idle`: outside a frame; everything except `F0` is ignored
//! - `InFrame`: collecting data bytes until `F7`
//! - `Discarding`: the frame grew past the size limit; wait for its end
//!
//! Real-time bytes (`F8`–`FF`) may appear anywhere and are skipped. Any other
//! status byte inside a frame aborts it.
//!
//! # Example
//!
//! ```
//! use k2_client::protocol::{FrameBuffer, FrameCodec};
//!
//! let codec = FrameCodec::default();
//! let bytes = codec.encode(0x15, &[]);
//!
//! let mut buffer = FrameBuffer::new(codec);
//! assert!(buffer.push(&bytes[..3]).is_empty());
//!
//! let frames = buffer.push(&bytes[3..]);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].as_ref().unwrap().command, 0x15);
//! ```

use bytes::BytesMut;
use tracing::debug;

use super::frame::{Frame, FrameCodec, FrameError};
use super::wire_format::{DEFAULT_MAX_FRAME_SIZE, SYSEX_END, SYSEX_START};

/// State machine for frame extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between frames.
    Idle,
    /// Inside a frame, collecting bytes into the buffer.
    InFrame,
    /// Inside an oversized frame; bytes are dropped until `F7`.
    Discarding { seen: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Bytes of the frame currently being collected.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Decoder applied to each complete frame.
    codec: FrameCodec,
    /// Largest frame accepted, delimiters included.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a frame buffer with the default size limit (4 MB).
    pub fn new(codec: FrameCodec) -> Self {
        Self::with_max_frame_size(codec, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame buffer with a custom size limit.
    pub fn with_max_frame_size(codec: FrameCodec, max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::Idle,
            codec,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Each element is either a decoded frame or the reason a delimited
    /// frame was rejected. Partial frames stay buffered for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Frame, FrameError>> {
        let mut frames = Vec::new();
        let mut i = 0;

        while i < data.len() {
            let byte = data[i];

            if byte >= 0xF8 {
                // Real-time messages can be interleaved with anything.
                i += 1;
                continue;
            }

            match self.state {
                State::Idle => {
                    if byte == SYSEX_START {
                        self.begin_frame();
                    }
                    i += 1;
                }

                State::InFrame | State::Discarding { .. } if byte == SYSEX_START => {
                    frames.push(Err(FrameError::Malformed(
                        "frame interrupted by a new start byte".to_string(),
                    )));
                    self.begin_frame();
                    i += 1;
                }

                State::InFrame | State::Discarding { .. } if byte == SYSEX_END => {
                    frames.push(self.finish_frame());
                    i += 1;
                }

                State::InFrame | State::Discarding { .. } if byte & 0x80 != 0 => {
                    frames.push(Err(FrameError::Malformed(format!(
                        "status byte 0x{:02X} inside frame",
                        byte
                    ))));
                    self.reset();
                    i += 1;
                }

                State::InFrame => {
                    let run = data_run(&data[i..]);
                    if self.buffer.len() + run > self.max_frame_size {
                        debug!(
                            "Frame exceeds {} bytes, discarding until end",
                            self.max_frame_size
                        );
                        self.state = State::Discarding {
                            seen: self.buffer.len() + run,
                        };
                        self.buffer.clear();
                    } else {
                        self.buffer.extend_from_slice(&data[i..i + run]);
                    }
                    i += run;
                }

                State::Discarding { seen } => {
                    let run = data_run(&data[i..]);
                    self.state = State::Discarding { seen: seen + run };
                    i += run;
                }
            }
        }

        frames
    }

    fn begin_frame(&mut self) {
        self.buffer.clear();
        self.buffer.extend_from_slice(&[SYSEX_START]);
        self.state = State::InFrame;
    }

    fn finish_frame(&mut self) -> Result<Frame, FrameError> {
        let state = self.state;
        self.state = State::Idle;

        match state {
            State::Discarding { seen } => {
                self.buffer.clear();
                Err(FrameError::Malformed(format!(
                    "frame of {} bytes exceeds maximum {}",
                    seen + 1,
                    self.max_frame_size
                )))
            }
            _ => {
                if self.buffer.len() + 1 > self.max_frame_size {
                    self.buffer.clear();
                    return Err(FrameError::Malformed(format!(
                        "frame exceeds maximum {}",
                        self.max_frame_size
                    )));
                }
                self.buffer.extend_from_slice(&[SYSEX_END]);
                let bytes = self.buffer.split().freeze();
                self.codec.decode_bytes(bytes)
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Idle;
    }

    /// Get the number of buffered bytes of the current partial frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if a frame has started but not yet ended.
    pub fn in_frame(&self) -> bool {
        self.state != State::Idle
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.reset();
    }

    /// The codec used to decode complete frames.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::Idle => "Idle",
            State::InFrame => "InFrame",
            State::Discarding { .. } => "Discarding",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(FrameCodec::default())
    }
}

/// Length of the leading run of 7-bit data bytes.
fn data_run(data: &[u8]) -> usize {
    data.iter().position(|b| b & 0x80 != 0).unwrap_or(data.len())
}
