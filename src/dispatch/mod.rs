//! Routing of inbound frames to the requests waiting for them.
//!
//! The [`Dispatcher`] owns the table of pending requests, keyed by
//! [`CorrelationKey`]. Every frame the read loop decodes is classified as a
//! response to a pending request, a fragment of a chunked transfer, or an
//! unsolicited message. The device tags replies only with object type and
//! slot, so at most one request per key is in flight; callers queue on a
//! per-key lock before registering here.
//!
//! All methods are synchronous. The session keeps the dispatcher behind one
//! mutex so two inbound frames are never routed at the same time.

mod reassembly;

pub use reassembly::{
    ArrivalOrder, ChunkedTransfer, Progress, ReassemblyMode, ReassemblyStrategy,
    SequentialOffsets,
};

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::display::{ScreenContent, ScreenState};
use crate::error::{K2Error, Result};
use crate::message::{command, ButtonEvent, Message, ObjectKind, Write};
use crate::protocol::wire_format::read_7bit;
use crate::protocol::{Frame, FrameError};

/// What a reply can be matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Screen, parameter name and parameter value requests. Their replies
    /// carry no identifying fields, so they share one key.
    Screen,
    /// A request about one object.
    Object { kind: ObjectKind, slot: u16 },
    /// NEW or WRITE asking the device to choose the slot.
    AnySlot { kind: ObjectKind },
    /// Bank-wide delete or move.
    Bank,
    /// Macro load.
    Macro,
}

impl CorrelationKey {
    pub fn object(kind: ObjectKind, slot: u16) -> Self {
        CorrelationKey::Object { kind, slot }
    }

    /// Object type the key is about, if any.
    pub fn kind(self) -> Option<ObjectKind> {
        match self {
            CorrelationKey::Object { kind, .. } | CorrelationKey::AnySlot { kind } => Some(kind),
            _ => None,
        }
    }

    /// Key a request's reply will arrive under, or `None` for requests the
    /// device does not answer.
    pub fn for_request(message: &Message) -> Option<Self> {
        let key = match message {
            Message::AllText
            | Message::ParameterValue
            | Message::ParameterName
            | Message::GetGraphics => CorrelationKey::Screen,
            Message::Dump(m) => Self::object(m.kind, m.slot),
            Message::Load(m) => Self::object(m.kind, m.slot),
            Message::Dir(m) => Self::object(m.kind, m.slot),
            Message::Del(m) => Self::object(m.kind, m.slot),
            Message::Read(m) => Self::object(m.kind, m.slot),
            Message::New(m) => Self::maybe_any(m.kind, m.slot),
            Message::Write(m) => Self::maybe_any(m.kind, m.slot),
            Message::Change(m) if m.new_slot != 0 => Self::object(m.kind, m.new_slot),
            Message::Change(m) => Self::object(m.kind, m.slot),
            Message::DelBank(_) | Message::MoveBank(_) => CorrelationKey::Bank,
            Message::LoadMacro => CorrelationKey::Macro,
            _ => return None,
        };
        Some(key)
    }

    /// Key an inbound message would answer.
    pub fn for_reply(message: &Message) -> Option<Self> {
        let key = match message {
            Message::ScreenReply(_) => CorrelationKey::Screen,
            Message::Load(m) => Self::object(m.kind, m.slot),
            Message::DataAck(m) => Self::object(m.kind, m.slot),
            Message::DataNak(m) => Self::object(m.kind, m.slot),
            Message::Info(m) => Self::object(m.kind, m.slot),
            Message::Write(m) => Self::object(m.kind, m.slot),
            Message::EndOfBank(_) => CorrelationKey::Bank,
            Message::MacroDone { .. } => CorrelationKey::Macro,
            _ => return None,
        };
        Some(key)
    }

    fn maybe_any(kind: ObjectKind, slot: u16) -> Self {
        if slot == 0 {
            CorrelationKey::AnySlot { kind }
        } else {
            Self::object(kind, slot)
        }
    }

    /// Wider key a reply may also satisfy.
    fn fallback(self) -> Option<Self> {
        match self {
            CorrelationKey::Object { kind, .. } => Some(CorrelationKey::AnySlot { kind }),
            _ => None,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Screen => write!(f, "screen"),
            CorrelationKey::Object { kind, slot } => write!(f, "{} {}", kind, slot),
            CorrelationKey::AnySlot { kind } => write!(f, "{} (any slot)", kind),
            CorrelationKey::Bank => write!(f, "bank"),
            CorrelationKey::Macro => write!(f, "macro"),
        }
    }
}

/// What a pending request eventually receives.
pub type Reply = Result<Message>;

struct PendingRequest {
    request: &'static str,
    accepts: &'static [u8],
    reply: oneshot::Sender<Reply>,
    transfer: Option<ChunkedTransfer>,
}

impl PendingRequest {
    fn accepts(&self, command: u8) -> bool {
        self.accepts.contains(&command)
    }

    fn resolve(self, reply: Reply) {
        // The caller may have given up already.
        let _ = self.reply.send(reply);
    }
}

/// Something the device sent on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Front-panel activity echoed by the device.
    Panel(Vec<ButtonEvent>),
    /// Display contents nobody asked for.
    Screen(ScreenContent),
    /// An object dumped from the front panel.
    ObjectStored(Write),
    /// Any other message.
    Message(Message),
}

impl DeviceEvent {
    pub fn from_unsolicited(message: Message) -> Self {
        match message {
            Message::Panel(events) => DeviceEvent::Panel(events),
            Message::Write(write) => DeviceEvent::ObjectStored(write),
            Message::ScreenReply(payload) => match ScreenContent::decode(&payload) {
                Ok(content) => DeviceEvent::Screen(content),
                Err(_) => DeviceEvent::Message(Message::ScreenReply(payload)),
            },
            other => DeviceEvent::Message(other),
        }
    }
}

/// How one inbound frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Resolved the pending request under `key`.
    Response { key: CorrelationKey, command: u8 },
    /// Added to the transfer pending under `key`.
    Fragment { key: CorrelationKey, received: usize },
    /// Aborted the request under `key`.
    Failed { key: CorrelationKey },
    /// Matched no pending request.
    Unsolicited(Message),
    /// Dropped as damaged.
    Discarded,
}

/// Counters kept by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub frames_received: u64,
    pub responses: u64,
    pub unsolicited: u64,
    pub malformed: u64,
    pub checksum_failures: u64,
    pub transfers_failed: u64,
    pub timeouts: u64,
}

/// Pending requests and everything learned from inbound traffic.
pub struct Dispatcher {
    pending: HashMap<CorrelationKey, PendingRequest>,
    strategy: Box<dyn ReassemblyStrategy>,
    screen: ScreenState,
    stats: DispatchStats,
    last_seen: Option<Instant>,
    closed: bool,
}

impl Dispatcher {
    pub fn new(strategy: Box<dyn ReassemblyStrategy>) -> Self {
        Self {
            pending: HashMap::new(),
            strategy,
            screen: ScreenState::default(),
            stats: DispatchStats::default(),
            last_seen: None,
            closed: false,
        }
    }

    /// Register `request` as waiting under `key`.
    ///
    /// The returned receiver resolves with the reply, an aborted transfer, or
    /// `Disconnected`. A DUMP also opens a chunked transfer for its LOADs.
    pub fn register(
        &mut self,
        key: CorrelationKey,
        request: &Message,
    ) -> Result<oneshot::Receiver<Reply>> {
        if self.closed {
            return Err(K2Error::Disconnected);
        }

        let accepts = request.reply_commands();
        if accepts.is_empty() {
            return Err(K2Error::Validation(format!(
                "{} has no reply to wait for",
                request.name()
            )));
        }

        if let Some(existing) = self.pending.get(&key) {
            if !existing.reply.is_closed() {
                return Err(K2Error::Validation(format!(
                    "{} is already waiting on {}",
                    existing.request, key
                )));
            }
            debug!("Replacing abandoned {} request on {}", existing.request, key);
        }

        let transfer = match request {
            Message::Dump(dump) => Some(ChunkedTransfer::for_dump(
                dump.kind,
                dump.slot,
                dump.offset,
                dump.size,
            )),
            _ => None,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            key,
            PendingRequest {
                request: request.name(),
                accepts,
                reply: tx,
                transfer,
            },
        );
        Ok(rx)
    }

    /// Forget the request under `key` after its caller timed out. Any partial
    /// transfer is dropped.
    pub fn expire(&mut self, key: CorrelationKey) -> bool {
        match self.pending.remove(&key) {
            Some(pending) => {
                self.stats.timeouts += 1;
                match &pending.transfer {
                    Some(transfer) if transfer.received() > 0 => warn!(
                        "{} on {} timed out, dropping {} partial bytes",
                        pending.request,
                        key,
                        transfer.received()
                    ),
                    _ => debug!("{} on {} timed out", pending.request, key),
                }
                true
            }
            None => false,
        }
    }

    /// Route one item from the frame buffer.
    pub fn handle(&mut self, item: std::result::Result<Frame, FrameError>) -> Inbound {
        match item {
            Ok(frame) => self.handle_frame(&frame),
            Err(FrameError::ChecksumMismatch {
                command,
                expected,
                actual,
                payload,
            }) => {
                self.stats.checksum_failures += 1;
                let reason = format!(
                    "{} frame checksum 0x{:02X}, expected 0x{:02X}",
                    crate::message::command_name(command),
                    actual,
                    expected
                );
                warn!("Discarding frame: {}", reason);
                self.fail_corrupted(command, &payload, reason)
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!("Discarding frame: {}", e);
                Inbound::Discarded
            }
        }
    }

    /// Decode and route one well-formed frame.
    pub fn handle_frame(&mut self, frame: &Frame) -> Inbound {
        self.stats.frames_received += 1;
        self.last_seen = Some(Instant::now());

        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(K2Error::ChecksumMismatch {
                command,
                expected,
                actual,
            }) => {
                self.stats.checksum_failures += 1;
                let reason = format!(
                    "{} data checksum 0x{:02X}, expected 0x{:02X}",
                    crate::message::command_name(command),
                    actual,
                    expected
                );
                warn!("Discarding frame: {}", reason);
                return self.fail_corrupted(frame.command, &frame.payload, reason);
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!(
                    "Discarding undecodable {} frame: {}",
                    crate::message::command_name(frame.command),
                    e
                );
                return Inbound::Discarded;
            }
        };

        debug!("Received {} ({} bytes)", message.name(), frame.payload_len());
        self.handle_message(message)
    }

    /// Route one decoded message.
    pub fn handle_message(&mut self, message: Message) -> Inbound {
        if let Message::ScreenReply(payload) = &message {
            self.observe_screen(payload);
        }

        let command = message.command();
        let key = match CorrelationKey::for_reply(&message)
            .and_then(|key| self.matching(key, command))
        {
            Some(key) => key,
            None => {
                self.stats.unsolicited += 1;
                debug!("Unsolicited {}", message.name());
                return Inbound::Unsolicited(message);
            }
        };

        if let Message::Load(load) = message {
            return self.feed(key, load);
        }

        self.resolve(key, Ok(message));
        Inbound::Response { key, command }
    }

    fn feed(&mut self, key: CorrelationKey, load: crate::message::Load) -> Inbound {
        let progress = match self.pending.get_mut(&key) {
            Some(PendingRequest {
                transfer: Some(transfer),
                ..
            }) => self.strategy.accept(transfer, &load),
            _ => {
                self.resolve(key, Ok(Message::Load(load)));
                return Inbound::Response {
                    key,
                    command: command::LOAD,
                };
            }
        };

        match progress {
            Ok(Progress::Incomplete) => {
                let received = self
                    .pending
                    .get(&key)
                    .and_then(|p| p.transfer.as_ref())
                    .map_or(0, ChunkedTransfer::received);
                debug!("Fragment for {}: {} bytes so far", key, received);
                Inbound::Fragment { key, received }
            }
            Ok(Progress::Complete) => {
                if let Some(mut pending) = self.pending.remove(&key) {
                    if let Some(transfer) = pending.transfer.take() {
                        debug!(
                            "Transfer for {} complete: {} bytes in {} fragments",
                            key,
                            transfer.received(),
                            transfer.fragments()
                        );
                        self.stats.responses += 1;
                        pending.resolve(Ok(Message::Load(transfer.finish())));
                    }
                }
                Inbound::Response {
                    key,
                    command: command::LOAD,
                }
            }
            Err(e) => {
                warn!("Transfer for {} failed: {}", key, e);
                self.abort(key, e);
                Inbound::Failed { key }
            }
        }
    }

    /// Fail the request a damaged frame was most likely answering.
    fn fail_corrupted(&mut self, command: u8, payload: &Bytes, reason: String) -> Inbound {
        let key = corrupted_key(command, payload)
            .and_then(|key| self.matching(key, command))
            .or_else(|| {
                if command == command::LOAD {
                    self.only_transfer()
                } else {
                    None
                }
            });

        match key {
            Some(key) => {
                self.abort(key, K2Error::TransferFailed(reason));
                Inbound::Failed { key }
            }
            None => Inbound::Discarded,
        }
    }

    fn matching(&self, key: CorrelationKey, command: u8) -> Option<CorrelationKey> {
        [Some(key), key.fallback()]
            .into_iter()
            .flatten()
            .find(|k| self.pending.get(k).is_some_and(|p| p.accepts(command)))
    }

    fn only_transfer(&self) -> Option<CorrelationKey> {
        let mut keys = self
            .pending
            .iter()
            .filter(|(_, p)| p.transfer.is_some())
            .map(|(key, _)| *key);
        match (keys.next(), keys.next()) {
            (Some(key), None) => Some(key),
            _ => None,
        }
    }

    fn resolve(&mut self, key: CorrelationKey, reply: Reply) {
        if let Some(pending) = self.pending.remove(&key) {
            self.stats.responses += 1;
            pending.resolve(reply);
        }
    }

    fn abort(&mut self, key: CorrelationKey, error: K2Error) {
        if let Some(pending) = self.pending.remove(&key) {
            self.stats.transfers_failed += 1;
            pending.resolve(Err(error));
        }
    }

    fn observe_screen(&mut self, payload: &[u8]) {
        match ScreenContent::decode(payload) {
            Ok(ScreenContent::Text(text)) => self.screen.text = text,
            Ok(ScreenContent::Graphics(raster)) => self.screen.raster = Some(raster),
            Ok(ScreenContent::String(_)) => {}
            Err(e) => debug!("Ignoring undecodable screen reply: {}", e),
        }
    }

    /// Resolve every pending request with `Disconnected` and refuse new ones.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let drained = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.resolve(Err(K2Error::Disconnected));
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_pending(&self, key: CorrelationKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Last display contents seen in any screen reply.
    pub fn screen(&self) -> &ScreenState {
        &self.screen
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// When the last well-formed frame arrived.
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("strategy", &self.strategy)
            .field("stats", &self.stats)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Best-effort key from an unverified payload.
fn corrupted_key(command: u8, payload: &[u8]) -> Option<CorrelationKey> {
    match command {
        command::SCREENREPLY => Some(CorrelationKey::Screen),
        command::ENDOFBANK => Some(CorrelationKey::Bank),
        command::MACRODONE => Some(CorrelationKey::Macro),
        command::LOAD | command::DACK | command::DNAK | command::INFO | command::WRITE => {
            let id = read_7bit(payload.get(0..2)?).ok()?;
            let slot = read_7bit(payload.get(2..4)?).ok()?;
            let kind = ObjectKind::from_wire_id(u16::try_from(id).ok()?)?;
            Some(CorrelationKey::object(kind, u16::try_from(slot).ok()?))
        }
        _ => None,
    }
}
