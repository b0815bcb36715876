//! MIDI port transport through `midir`.
//!
//! midir delivers input on its own callback thread and sends output one
//! complete message at a time. [`open`] hides both behind an in-memory
//! duplex stream: bytes from the input callback are written into it, and
//! bytes the session writes are cut into SysEx messages and sent out.
//!
//! # Example
//!
//! ```ignore
//! use k2_client::transport::midi;
//!
//! for name in midi::input_port_names()? {
//!     println!("in:  {}", name);
//! }
//! let (stream, connection) = midi::open("K2600", 64 * 1024)?;
//! ```

use std::sync::{Mutex, PoisonError};

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{K2Error, Result};
use crate::protocol::{SYSEX_END, SYSEX_START};

const CLIENT_NAME: &str = "k2-client";

/// Names of the MIDI inputs currently present.
pub fn input_port_names() -> Result<Vec<String>> {
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(transport_error)?;
    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .collect())
}

/// Names of the MIDI outputs currently present.
pub fn output_port_names() -> Result<Vec<String>> {
    let midi_out = MidiOutput::new(CLIENT_NAME).map_err(transport_error)?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|port| midi_out.port_name(port).ok())
        .collect())
}

/// Keeps the input port open. Dropping it closes the port.
pub struct MidiConnection {
    input: Mutex<Option<MidiInputConnection<()>>>,
}

impl MidiConnection {
    /// Close the input port; the output closes once the stream is dropped.
    pub fn close(&self) {
        let input = self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(input) = input {
            input.close();
            debug!("MIDI input closed");
        }
    }
}

/// Open the input and output ports whose names contain `port_name`.
///
/// Returns the session side of a duplex stream plus the guard that keeps
/// the input port open. Must be called inside a tokio runtime.
pub fn open(port_name: &str, buffer_size: usize) -> Result<(DuplexStream, MidiConnection)> {
    let mut midi_in = MidiInput::new(CLIENT_NAME).map_err(transport_error)?;
    // SysEx is filtered by default.
    midi_in.ignore(Ignore::None);
    let midi_out = MidiOutput::new(CLIENT_NAME).map_err(transport_error)?;

    let in_port = midi_in
        .ports()
        .into_iter()
        .find(|port| {
            midi_in
                .port_name(port)
                .is_ok_and(|name| name.contains(port_name))
        })
        .ok_or_else(|| K2Error::Transport(format!("no MIDI input matching {:?}", port_name)))?;
    let out_port = midi_out
        .ports()
        .into_iter()
        .find(|port| {
            midi_out
                .port_name(port)
                .is_ok_and(|name| name.contains(port_name))
        })
        .ok_or_else(|| K2Error::Transport(format!("no MIDI output matching {:?}", port_name)))?;

    let (session_side, device_side) = tokio::io::duplex(buffer_size.max(1));
    let (device_read, device_write) = tokio::io::split(device_side);

    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let input = midi_in
        .connect(
            &in_port,
            CLIENT_NAME,
            move |_stamp, message, _| {
                // Receiver gone means the session closed.
                let _ = tx.send(message.to_vec());
            },
            (),
        )
        .map_err(transport_error)?;
    let output = midi_out
        .connect(&out_port, CLIENT_NAME)
        .map_err(transport_error)?;

    info!("Connected to MIDI ports matching {:?}", port_name);

    tokio::spawn(async move {
        if let Err(e) = pump_input(rx, device_write).await {
            warn!("MIDI input pump stopped: {}", e);
        }
    });
    tokio::spawn(async move {
        if let Err(e) = pump_output(device_read, output).await {
            error!("MIDI output pump stopped: {}", e);
        }
    });

    Ok((
        session_side,
        MidiConnection {
            input: Mutex::new(Some(input)),
        },
    ))
}

async fn pump_input(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut device_write: WriteHalf<DuplexStream>,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        device_write.write_all(&message).await?;
    }
    Ok(())
}

async fn pump_output(
    mut device_read: ReadHalf<DuplexStream>,
    mut output: MidiOutputConnection,
) -> Result<()> {
    let mut splitter = SysexSplitter::default();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = device_read.read(&mut buf).await?;
        if n == 0 {
            output.close();
            return Ok(());
        }
        for message in splitter.push(&buf[..n]) {
            output.send(&message).map_err(transport_error)?;
        }
    }
}

/// Cuts an outbound byte stream into whole SysEx messages.
#[derive(Debug, Default)]
struct SysexSplitter {
    current: Vec<u8>,
}

impl SysexSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();
        for &byte in data {
            if byte == SYSEX_START {
                self.current.clear();
            } else if self.current.is_empty() {
                // Stray byte outside a message.
                continue;
            }
            self.current.push(byte);
            if byte == SYSEX_END {
                complete.push(std::mem::take(&mut self.current));
            }
        }
        complete
    }
}

fn transport_error(err: impl std::fmt::Display) -> K2Error {
    K2Error::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_whole_and_split_messages() {
        let mut splitter = SysexSplitter::default();
        assert!(splitter.push(&[0xF0, 0x07, 0x00]).is_empty());
        let out = splitter.push(&[0x78, 0x15, 0xF7, 0xF0, 0x01, 0xF7]);
        assert_eq!(out, vec![vec![0xF0, 0x07, 0x00, 0x78, 0x15, 0xF7], vec![0xF0, 0x01, 0xF7]]);
    }

    #[test]
    fn test_splitter_drops_stray_bytes() {
        let mut splitter = SysexSplitter::default();
        let out = splitter.push(&[0x01, 0x02, 0xF0, 0x03, 0xF7]);
        assert_eq!(out, vec![vec![0xF0, 0x03, 0xF7]]);
    }
}
