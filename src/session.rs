//! Session builder and runtime loop.
//!
//! The [`SessionBuilder`] configures a session; starting it over any byte
//! stream spawns two background tasks:
//! 1. a read loop: transport → [`FrameBuffer`] → [`Dispatcher`]
//! 2. a writer task: outbound queue → transport
//!
//! Every request goes through [`Session::call`]: wait for the correlation
//! key's lock, register with the dispatcher, queue the frame, then await the
//! reply under a timeout.
//!
//! # Example
//!
//! ```ignore
//! use k2_client::{ObjectKind, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::connect("K2600").await?;
//!
//!     session.program().await?;
//!     session.number(125).await?;
//!     session.enter().await?;
//!     println!("{}", session.screen_text().await?);
//!
//!     if let Some(entry) = session.catalog().get(ObjectKind::Program, 125).await? {
//!         println!("{}: {} bytes", entry.name, entry.data.len());
//!     }
//!
//!     session.close();
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogHandle, ObjectCatalog, ObjectEntry};
use crate::config::SessionConfig;
use crate::display::{decode_string, Raster, ScreenContent, ScreenState, TextGrid};
use crate::dispatch::{
    CorrelationKey, DeviceEvent, DispatchStats, Dispatcher, Inbound, ReassemblyMode,
};
use crate::error::{K2Error, Result};
use crate::message::{commands, Button, Direction, Info, Message, ObjectAddress, ObjectKind};
use crate::protocol::{DeviceAddress, FrameBuffer, FrameChecksum, FrameCodec};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Capacity of the unsolicited event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Time one byte takes on a 31250 baud MIDI cable.
const MIDI_BYTE_TIME: Duration = Duration::from_micros(320);

/// Builder for configuring and starting a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    /// Frame checksum chosen by the caller rather than defaulted.
    checksum_pinned: bool,
}

impl SessionBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            checksum_pinned: false,
        }
    }

    /// Replace every setting at once, e.g. with a config loaded from JSON.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self.checksum_pinned = true;
        self
    }

    /// Set the manufacturer, device and product bytes.
    pub fn address(mut self, address: DeviceAddress) -> Self {
        self.config.address = address;
        self
    }

    /// Set the device ID configured on the instrument.
    ///
    /// Default: 0
    pub fn device_id(mut self, device_id: u8) -> Self {
        self.config.address.device_id = device_id;
        self
    }

    /// Choose whether frames carry a trailing checksum.
    ///
    /// Default: [`FrameChecksum::Sum7`] over a stream,
    /// [`FrameChecksum::Disabled`] over MIDI ports, as stock firmware sends
    /// no frame checksum.
    pub fn frame_checksum(mut self, checksum: FrameChecksum) -> Self {
        self.config.frame_checksum = checksum;
        self.checksum_pinned = true;
        self
    }

    /// Set the bound on each request.
    ///
    /// Default: 1 second
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the bound on the liveness ping.
    ///
    /// Default: 100 ms
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Set the longest frame accepted from the device.
    ///
    /// Default: 4 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set how many bytes each transport read asks for.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the maximum queued frames before senders wait.
    ///
    /// Default: 256
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set how long a sender waits for the queue to drain.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Pause between outbound frames, for MIDI interfaces that lose
    /// back-to-back SysEx.
    ///
    /// Default: none
    pub fn frame_gap(mut self, gap: Duration) -> Self {
        self.config.writer.frame_gap = gap;
        self
    }

    /// Choose how chunked transfers are reassembled.
    ///
    /// Default: [`ReassemblyMode::SequentialOffsets`]
    pub fn reassembly(mut self, mode: ReassemblyMode) -> Self {
        self.config.reassembly = mode;
        self
    }

    /// Read the screen after each navigation step, so the step returns only
    /// once the device has processed it.
    ///
    /// Default: false
    pub fn confirm_navigation(mut self, confirm: bool) -> Self {
        self.config.confirm_navigation = confirm;
        self
    }

    /// Start a session over separate read and write halves.
    ///
    /// Spawns the read loop and writer task, then pings the device. A
    /// device that does not answer still yields a session; check
    /// [`Session::is_connected`].
    pub async fn start<R, W>(self, reader: R, writer: W) -> Result<Session>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Session::start(self.config, reader, writer).await
    }

    /// Start a session over one bidirectional stream.
    pub async fn start_stream<S>(self, stream: S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.start(reader, writer).await
    }

    /// Open the MIDI ports whose names contain `port_name` and start a
    /// session over them.
    #[cfg(feature = "midi")]
    pub async fn connect(self, port_name: &str) -> Result<Session> {
        let builder = self.for_hardware();
        let (stream, connection) =
            crate::transport::midi::open(port_name, builder.config.read_buffer_size)?;
        let mut session = builder.start_stream(stream).await?;
        session.midi = Some(connection);
        Ok(session)
    }

    /// Settings for a real instrument: stock frames unless the caller chose
    /// a checksum mode.
    #[cfg_attr(not(feature = "midi"), allow(dead_code))]
    fn for_hardware(mut self) -> Self {
        if !self.checksum_pinned {
            self.config.frame_checksum = FrameChecksum::Disabled;
        }
        self
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Traffic counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    #[serde(flatten)]
    pub dispatch: DispatchStats,
}

/// State shared between the session and its read loop.
struct Shared {
    dispatcher: Mutex<Dispatcher>,
    catalog: ObjectCatalog,
    events: broadcast::Sender<DeviceEvent>,
    key_locks: Mutex<HashMap<CorrelationKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Shared by slot requests of a kind, exclusive for device-chosen slots.
    kind_locks: Mutex<HashMap<ObjectKind, Arc<tokio::sync::RwLock<()>>>>,
    alive: AtomicBool,
    frames_sent: AtomicU64,
}

impl Shared {
    fn new(reassembly: ReassemblyMode) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            dispatcher: Mutex::new(Dispatcher::new(reassembly.strategy())),
            catalog: ObjectCatalog::new(),
            events,
            key_locks: Mutex::new(HashMap::new()),
            kind_locks: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
        }
    }

    fn dispatcher(&self) -> MutexGuard<'_, Dispatcher> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: CorrelationKey) -> Arc<tokio::sync::Mutex<()>> {
        lock_entry(&self.key_locks, key)
    }

    fn kind_lock(&self, kind: ObjectKind) -> Arc<tokio::sync::RwLock<()>> {
        lock_entry(&self.kind_locks, kind)
    }

    /// Apply the side effects of a message nobody was waiting for.
    fn unsolicited(&self, message: Message) {
        if let Message::Write(write) = &message {
            info!("Device sent {} {} {:?}", write.kind, write.slot, write.name);
            self.catalog.insert(ObjectEntry::new(
                write.kind,
                write.slot,
                write.name.clone(),
                write.data.clone(),
            ));
        }
        // No subscribers is fine.
        let _ = self.events.send(DeviceEvent::from_unsolicited(message));
    }

    fn disconnect(&self) {
        self.alive.store(false, Ordering::Release);
        let drained = self.dispatcher().close();
        if drained > 0 {
            debug!("Disconnected {} pending requests", drained);
        }
    }
}

/// Lock for `key`, pruning entries no call holds any more.
fn lock_entry<K, L>(table: &Mutex<HashMap<K, Arc<L>>>, key: K) -> Arc<L>
where
    K: Eq + Hash,
    L: Default,
{
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    table.retain(|_, lock| Arc::strong_count(lock) > 1);
    table.entry(key).or_default().clone()
}

/// A running connection to one K2 instrument.
///
/// All methods take `&self`; wrap the session in an `Arc` to share it
/// between tasks. Requests on different objects run concurrently, requests
/// on the same object (or on the screen) queue behind each other.
pub struct Session {
    shared: Arc<Shared>,
    config: SessionConfig,
    codec: FrameCodec,
    writer: WriterHandle,
    read_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
    #[cfg(feature = "midi")]
    midi: Option<crate::transport::midi::MidiConnection>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Open a MIDI port pair with default settings.
    #[cfg(feature = "midi")]
    pub async fn connect(port_name: &str) -> Result<Self> {
        SessionBuilder::new().connect(port_name).await
    }

    async fn start<R, W>(config: SessionConfig, reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = config.codec();

        // 1. Spawn writer task
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());

        // 2. Spawn read loop
        let shared = Arc::new(Shared::new(config.reassembly));
        let frame_buffer = FrameBuffer::with_max_frame_size(codec, config.max_frame_size);
        let read_size = config.read_buffer_size.max(1);
        let shared_clone = shared.clone();

        let read_task = tokio::spawn(async move {
            if let Err(e) = Self::read_loop(reader, &shared_clone, frame_buffer, read_size).await {
                error!("Read loop error: {}", e);
            }
            shared_clone.disconnect();
        });

        let session = Session {
            shared,
            config,
            codec,
            writer,
            read_task,
            writer_task,
            #[cfg(feature = "midi")]
            midi: None,
        };

        // 3. Liveness ping
        if session.ping().await {
            info!("K2 device {} answered", session.config.address.device_id);
        } else {
            warn!(
                "K2 device {} did not answer within {:?}",
                session.config.address.device_id, session.config.ping_timeout
            );
        }

        Ok(session)
    }

    /// Main read loop - reassembles frames and hands them to the dispatcher.
    async fn read_loop<R: AsyncRead + Unpin>(
        mut reader: R,
        shared: &Shared,
        mut frame_buffer: FrameBuffer,
        read_size: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; read_size];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Transport closed");
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => return Err(K2Error::Io(e)),
            };

            for item in frame_buffer.push(&buf[..n]) {
                let inbound = shared.dispatcher().handle(item);
                match inbound {
                    Inbound::Unsolicited(message) => {
                        shared.alive.store(true, Ordering::Release);
                        shared.unsolicited(message);
                    }
                    Inbound::Discarded => {}
                    _ => shared.alive.store(true, Ordering::Release),
                }
            }
        }
    }

    /// Send `message` and wait up to `timeout` for its reply under `key`.
    ///
    /// Calls on the same key queue behind each other. A call that lets the
    /// device choose the slot also waits for, and holds off, every other
    /// call on that object type, since its reply may name any slot. On
    /// timeout the pending request, and any partial transfer, is dropped.
    pub async fn call(
        &self,
        message: Message,
        key: CorrelationKey,
        timeout: Duration,
    ) -> Result<Message> {
        let bytes = message.to_bytes(&self.codec)?;

        let kind_lock = key.kind().map(|kind| self.shared.kind_lock(kind));
        let (_kind_shared, _kind_exclusive) = match &kind_lock {
            Some(lock) if matches!(key, CorrelationKey::AnySlot { .. }) => {
                (None, Some(lock.write().await))
            }
            Some(lock) => (Some(lock.read().await), None),
            None => (None, None),
        };
        let lock = self.shared.key_lock(key);
        let _guard = lock.lock().await;

        let rx = self.shared.dispatcher().register(key, &message)?;
        debug!("Calling {} on {}", message.name(), key);

        if let Err(e) = self.write(bytes).await {
            self.shared.dispatcher().expire(key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(K2Error::Disconnected),
            Err(_) => {
                self.shared.dispatcher().expire(key);
                Err(K2Error::Timeout(timeout))
            }
        }
    }

    /// [`call`](Self::call) with the key derived from the message and the
    /// configured timeout.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let timeout = self.config.call_timeout;
        self.request_within(message, timeout).await
    }

    async fn request_within(&self, message: Message, timeout: Duration) -> Result<Message> {
        let key = CorrelationKey::for_request(&message).ok_or_else(|| {
            K2Error::Validation(format!("{} has no reply to wait for", message.name()))
        })?;
        self.call(message, key, timeout).await
    }

    /// Send a message without waiting for any reply.
    pub async fn send(&self, message: Message) -> Result<()> {
        let bytes = message.to_bytes(&self.codec)?;
        debug!("Sending {}", message.name());
        self.write(bytes).await
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(K2Error::Disconnected);
        }
        self.writer.send(OutboundFrame::new(bytes)).await?;
        self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    async fn navigate(&self, message: Message) -> Result<()> {
        self.send(message).await?;
        if self.config.confirm_navigation {
            self.screen_text().await?;
        }
        Ok(())
    }

    /// Press and release one button.
    pub async fn press(&self, button: Button) -> Result<()> {
        self.navigate(commands::press(button)).await
    }

    /// Press and release a button given by raw panel code.
    pub async fn button(&self, code: u8) -> Result<()> {
        self.navigate(commands::button_press(code)?).await
    }

    /// Press several buttons in order.
    pub async fn press_sequence(&self, buttons: &[Button]) -> Result<()> {
        self.navigate(commands::press_sequence(buttons)).await
    }

    /// Type a number on the keypad.
    pub async fn number(&self, value: i64) -> Result<()> {
        self.navigate(commands::number_entry(value)).await
    }

    /// Turn the alpha wheel by `clicks` (-64..=63).
    pub async fn alpha_wheel(&self, clicks: i32) -> Result<()> {
        self.navigate(commands::alpha_wheel(clicks)?).await
    }

    pub async fn cursor(&self, direction: Direction) -> Result<()> {
        self.navigate(commands::cursor_move(direction)).await
    }

    pub async fn up(&self) -> Result<()> {
        self.cursor(Direction::Up).await
    }

    pub async fn down(&self) -> Result<()> {
        self.cursor(Direction::Down).await
    }

    pub async fn left(&self) -> Result<()> {
        self.cursor(Direction::Left).await
    }

    pub async fn right(&self) -> Result<()> {
        self.cursor(Direction::Right).await
    }

    pub async fn enter(&self) -> Result<()> {
        self.press(Button::Enter).await
    }

    pub async fn exit(&self) -> Result<()> {
        self.press(Button::Exit).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.press(Button::Cancel).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.press(Button::Clear).await
    }

    pub async fn edit(&self) -> Result<()> {
        self.press(Button::Edit).await
    }

    /// Answer "yes" in a dialog.
    pub async fn yes(&self) -> Result<()> {
        self.press(Button::SOFT_YES).await
    }

    /// Answer "no" in a dialog.
    pub async fn no(&self) -> Result<()> {
        self.press(Button::SOFT_NO).await
    }

    pub async fn plus(&self) -> Result<()> {
        self.press(Button::Plus).await
    }

    pub async fn minus(&self) -> Result<()> {
        self.press(Button::Minus).await
    }

    pub async fn a(&self) -> Result<()> {
        self.press(Button::SoftA).await
    }

    pub async fn b(&self) -> Result<()> {
        self.press(Button::SoftB).await
    }

    pub async fn c(&self) -> Result<()> {
        self.press(Button::SoftC).await
    }

    pub async fn d(&self) -> Result<()> {
        self.press(Button::SoftD).await
    }

    pub async fn e(&self) -> Result<()> {
        self.press(Button::SoftE).await
    }

    pub async fn f(&self) -> Result<()> {
        self.press(Button::SoftF).await
    }

    pub async fn program(&self) -> Result<()> {
        self.press(Button::Program).await
    }

    pub async fn setup(&self) -> Result<()> {
        self.press(Button::Setup).await
    }

    pub async fn quick_access(&self) -> Result<()> {
        self.press(Button::QuickAccess).await
    }

    pub async fn effects(&self) -> Result<()> {
        self.press(Button::Effects).await
    }

    pub async fn midi(&self) -> Result<()> {
        self.press(Button::Midi).await
    }

    pub async fn master(&self) -> Result<()> {
        self.press(Button::Master).await
    }

    pub async fn song(&self) -> Result<()> {
        self.press(Button::Song).await
    }

    pub async fn disk(&self) -> Result<()> {
        self.press(Button::Disk).await
    }

    // ------------------------------------------------------------------
    // Screen
    // ------------------------------------------------------------------

    async fn screen_request(&self, message: Message) -> Result<Bytes> {
        let request = message.name();
        match self.request(message).await? {
            Message::ScreenReply(payload) => Ok(payload),
            other => Err(unexpected(request, &other)),
        }
    }

    /// Read the 8 × 40 text layer.
    pub async fn screen_text(&self) -> Result<TextGrid> {
        let payload = self.screen_request(commands::screen_read()).await?;
        match ScreenContent::decode(&payload)? {
            ScreenContent::Text(grid) => Ok(grid),
            _ => Err(K2Error::UnexpectedReply(format!(
                "ALLTEXT answered with a {}-byte screen reply",
                payload.len()
            ))),
        }
    }

    /// Read the 240 × 64 graphics layer.
    pub async fn screenshot(&self) -> Result<Raster> {
        let payload = self.screen_request(commands::graphics_read()).await?;
        match ScreenContent::decode(&payload)? {
            ScreenContent::Graphics(raster) => Ok(raster),
            _ => Err(K2Error::UnexpectedReply(format!(
                "GETGRAPHICS answered with a {}-byte screen reply",
                payload.len()
            ))),
        }
    }

    /// Read both display layers.
    pub async fn capture_screen(&self) -> Result<ScreenState> {
        let text = self.screen_text().await?;
        let raster = self.screenshot().await?;
        Ok(ScreenState::new(text, Some(raster)))
    }

    /// Display contents from the most recent screen replies, without asking
    /// the device.
    pub fn last_screen(&self) -> ScreenState {
        self.shared.dispatcher().screen().clone()
    }

    /// Name of the parameter under the cursor.
    pub async fn parameter_name(&self) -> Result<String> {
        let payload = self.screen_request(commands::parameter_name()).await?;
        Ok(decode_string(&payload))
    }

    /// Value of the parameter under the cursor, as displayed.
    pub async fn parameter_value(&self) -> Result<String> {
        let payload = self.screen_request(commands::parameter_value()).await?;
        Ok(decode_string(&payload))
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Object metadata. An empty slot has `size == 0`.
    pub async fn dir(&self, kind: ObjectKind, slot: u16) -> Result<Info> {
        let request = commands::dir_request(kind, slot)?;
        expect_info("DIR", self.request(request).await?)
    }

    /// Fetch a whole object from the device, `None` for an empty slot.
    ///
    /// Does not consult or fill the catalog; see [`Session::catalog`].
    pub async fn dump(&self, kind: ObjectKind, slot: u16) -> Result<Option<ObjectEntry>> {
        let info = self.dir(kind, slot).await?;
        if info.size == 0 {
            return Ok(None);
        }

        let request = commands::dump_range(kind, slot, 0, info.size)?;
        let timeout = self.transfer_timeout(info.size as usize);
        match self.request_within(request, timeout).await? {
            Message::Load(load) => Ok(Some(ObjectEntry {
                kind,
                slot,
                name: info.name,
                in_ram: info.in_ram,
                data: load.data,
            })),
            other => Err(unexpected("DUMP", &other)),
        }
    }

    /// Read `len` bytes of an object starting at the address offset.
    pub async fn read_range(&self, address: ObjectAddress, len: u32) -> Result<Bytes> {
        let request = commands::parameter_read(address, len)?;
        let timeout = self.transfer_timeout(len as usize);
        match self.request_within(request, timeout).await? {
            Message::Load(load) => Ok(load.data),
            other => Err(unexpected("DUMP", &other)),
        }
    }

    /// Overwrite bytes of an object starting at the address offset.
    pub async fn write_range(&self, address: ObjectAddress, bytes: impl Into<Bytes>) -> Result<()> {
        let request = commands::parameter_write(address, bytes)?;
        expect_ack("LOAD", self.request(request).await?)?;
        self.shared.catalog.invalidate(address.kind, address.slot);
        Ok(())
    }

    /// Store a whole object. Slot 0 lets the device pick; the slot written
    /// is returned.
    pub async fn write_object(
        &self,
        kind: ObjectKind,
        slot: u16,
        name: &str,
        data: impl Into<Bytes>,
    ) -> Result<u16> {
        let data = data.into();
        let timeout = self.transfer_timeout(data.len());
        let request = commands::write_object(kind, slot, name, data)?;
        let written = expect_ack("WRITE", self.request_within(request, timeout).await?)?;
        self.shared.catalog.invalidate(kind, written);
        Ok(written)
    }

    /// Create an uninitialized object. Slot 0 lets the device pick.
    pub async fn new_object(
        &self,
        kind: ObjectKind,
        slot: u16,
        size: u32,
        name: &str,
    ) -> Result<Info> {
        let request = commands::new_object(kind, slot, size, name)?;
        let info = expect_info("NEW", self.request(request).await?)?;
        self.shared.catalog.invalidate(kind, info.slot);
        Ok(info)
    }

    /// Delete an object.
    pub async fn delete_object(&self, kind: ObjectKind, slot: u16) -> Result<()> {
        let request = commands::delete_object(kind, slot)?;
        expect_info("DEL", self.request(request).await?)?;
        self.shared.catalog.invalidate(kind, slot);
        Ok(())
    }

    /// Rename an object, optionally moving it to `new_slot`.
    pub async fn rename_object(
        &self,
        kind: ObjectKind,
        slot: u16,
        new_slot: Option<u16>,
        name: &str,
    ) -> Result<Info> {
        let request = commands::rename_object(kind, slot, new_slot, name)?;
        let info = expect_info("CHANGE", self.request(request).await?)?;
        self.shared.catalog.invalidate(kind, slot);
        self.shared.catalog.invalidate(kind, info.slot);
        Ok(info)
    }

    /// Cached object access backed by this session.
    pub fn catalog(&self) -> CatalogHandle<'_> {
        CatalogHandle::new(self, &self.shared.catalog)
    }

    /// Reply bound for a transfer of `len` bytes: the call timeout plus the
    /// wire time of the bit-stream encoded data.
    fn transfer_timeout(&self, len: usize) -> Duration {
        let encoded = (len * 8).div_ceil(7) as u32;
        self.config.call_timeout + MIDI_BYTE_TIME * encoded
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Check the device with a screen read. Updates [`is_connected`](Self::is_connected).
    pub async fn ping(&self) -> bool {
        let alive = self
            .call(
                commands::ping(),
                CorrelationKey::Screen,
                self.config.ping_timeout,
            )
            .await
            .is_ok();
        self.shared.alive.store(alive, Ordering::Release);
        alive
    }

    /// Whether the device has answered since the last failed ping, and the
    /// session is open.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.shared.alive.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.dispatcher().is_closed()
    }

    /// Receive messages the device sends on its own.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            dispatch: self.shared.dispatcher().stats(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Stop both tasks and fail every pending request with `Disconnected`.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        info!("Closing session");
        self.shared.disconnect();
        self.read_task.abort();
        self.writer_task.abort();
        #[cfg(feature = "midi")]
        if let Some(midi) = &self.midi {
            midi.close();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected(request: &str, reply: &Message) -> K2Error {
    K2Error::UnexpectedReply(format!("{} answered with {}", request, reply.name()))
}

fn expect_info(request: &str, reply: Message) -> Result<Info> {
    match reply {
        Message::Info(info) => Ok(info),
        other => Err(unexpected(request, &other)),
    }
}

/// Slot acknowledged by a DACK, or the device's reason for a DNAK.
fn expect_ack(request: &str, reply: Message) -> Result<u16> {
    match reply {
        Message::DataAck(ack) => Ok(ack.slot),
        Message::DataNak(nak) => Err(K2Error::Rejected { code: nak.code }),
        other => Err(unexpected(request, &other)),
    }
}
