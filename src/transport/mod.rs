//! Transports a session can run over.
//!
//! A session needs nothing more than a byte stream in each direction, so
//! any `AsyncRead + AsyncWrite` works (tests use `tokio::io::duplex`). With
//! the `midi` feature, [`midi`] bridges a pair of hardware MIDI ports into
//! such a stream.

#[cfg(feature = "midi")]
pub mod midi;
