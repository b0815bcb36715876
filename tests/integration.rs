//! Integration tests for k2-client.
//!
//! A simulated K2 answers on the far end of an in-memory duplex stream, so
//! these tests drive the whole stack: session, writer task, read loop,
//! frame buffer, dispatcher and catalog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use k2_client::display::{encode_string, Raster, TextGrid};
use k2_client::message::{command, DataAck, DataNak, Info, Load, NakCode, Write, WriteMode};
use k2_client::protocol::{EncodingFormat, FrameBuffer, FrameCodec};
use k2_client::{
    DeviceEvent, K2Error, Message, ObjectAddress, ObjectKind, Session, SessionBuilder,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

const TENOR_NAME: &str = "Fast Solo Tenor";
const TENOR_SIZE: usize = 586;

fn tenor_data() -> Vec<u8> {
    (0..TENOR_SIZE).map(|i| (i * 7 + 3) as u8).collect()
}

/// What the simulated device has seen and holds.
#[derive(Default)]
struct DeviceState {
    objects: HashMap<(ObjectKind, u16), (String, Vec<u8>)>,
    commands: Vec<u8>,
    events: Vec<&'static str>,
    dumps: usize,
    screen_reads: usize,
}

/// How the simulated device misbehaves.
#[derive(Clone, Copy)]
struct Behavior {
    fragments: usize,
    corrupt_fragment: Option<usize>,
    ignore_first_dir: bool,
    byte_at_a_time: bool,
    reply_delay: Duration,
    hang_up_on: Option<u8>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            fragments: 1,
            corrupt_fragment: None,
            ignore_first_dir: false,
            byte_at_a_time: false,
            reply_delay: Duration::ZERO,
            hang_up_on: None,
        }
    }
}

struct SimulatedK2 {
    state: Arc<Mutex<DeviceState>>,
    behavior: Behavior,
    dirs_seen: usize,
}

impl SimulatedK2 {
    fn new(behavior: Behavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            behavior,
            dirs_seen: 0,
        }
    }

    fn with_object(self, kind: ObjectKind, slot: u16, name: &str, data: Vec<u8>) -> Self {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind, slot), (name.to_string(), data));
        self
    }

    /// Start a session against this device.
    async fn session(self, builder: SessionBuilder) -> (Session, Arc<Mutex<DeviceState>>) {
        let (client, device) = duplex(64 * 1024);
        let state = self.state.clone();
        tokio::spawn(self.run(device));
        let session = builder.start_stream(client).await.unwrap();
        (session, state)
    }

    async fn run(mut self, mut stream: DuplexStream) {
        let codec = FrameCodec::default();
        let mut buffer = FrameBuffer::new(codec);
        let mut buf = vec![0u8; 4096];

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };

            for frame in buffer.push(&buf[..n]) {
                let Ok(frame) = frame else { continue };
                let Ok(message) = Message::decode(&frame) else { continue };
                {
                    let mut state = self.state.lock().unwrap();
                    state.commands.push(frame.command);
                    state.events.push("request");
                }
                if self.behavior.hang_up_on == Some(frame.command) {
                    return;
                }

                let replies = self.respond(message);
                if replies.is_empty() {
                    continue;
                }
                tokio::time::sleep(self.behavior.reply_delay).await;
                for reply in replies {
                    let bytes = reply.to_bytes(&codec).unwrap();
                    if self.behavior.byte_at_a_time {
                        for byte in bytes.iter() {
                            stream.write_all(&[*byte]).await.unwrap();
                        }
                    } else {
                        stream.write_all(&bytes).await.unwrap();
                    }
                }
                self.state.lock().unwrap().events.push("reply");
            }
        }
    }

    fn respond(&mut self, message: Message) -> Vec<Message> {
        let mut state = self.state.lock().unwrap();
        match message {
            Message::AllText => {
                state.screen_reads += 1;
                let text = format!("Program Mode\nRead {}", state.screen_reads);
                vec![Message::ScreenReply(Bytes::from(
                    TextGrid::from_text(&text).encode(),
                ))]
            }
            Message::GetGraphics => vec![Message::ScreenReply(Bytes::from(
                Raster::from_fn(|x, y| x == y).encode(),
            ))],
            Message::ParameterName => {
                vec![Message::ScreenReply(Bytes::from(encode_string("Volume")))]
            }
            Message::ParameterValue => {
                vec![Message::ScreenReply(Bytes::from(encode_string("-6 dB")))]
            }
            Message::Dir(dir) => {
                self.dirs_seen += 1;
                if self.behavior.ignore_first_dir && self.dirs_seen == 1 {
                    return vec![];
                }
                let (name, size) = match state.objects.get(&(dir.kind, dir.slot)) {
                    Some((name, data)) => (name.clone(), data.len() as u32),
                    None => (String::new(), 0),
                };
                vec![Message::Info(Info {
                    kind: dir.kind,
                    slot: dir.slot,
                    size,
                    in_ram: true,
                    name,
                })]
            }
            Message::Dump(dump) => {
                state.dumps += 1;
                let Some((_, data)) = state.objects.get(&(dump.kind, dump.slot)) else {
                    return vec![];
                };
                let start = dump.offset as usize;
                let end = (start + dump.size as usize).min(data.len());
                let range = &data[start..end];
                let chunk = range.len().div_ceil(self.behavior.fragments).max(1);

                let mut replies = Vec::new();
                let mut previous = None;
                for (i, piece) in range.chunks(chunk).enumerate() {
                    let offset = dump.offset + (i * chunk) as u32;
                    let load = Load::new(dump.kind, dump.slot, offset, dump.form, piece.to_vec());
                    let mut load = match previous {
                        Some(previous) => load.continuing(previous),
                        None => load,
                    };
                    previous = Some(load.checksum);
                    if self.behavior.corrupt_fragment == Some(i) {
                        load.checksum ^= 0x01;
                    }
                    replies.push(Message::Load(load));
                }
                replies
            }
            Message::Write(write) => {
                let slot = if write.slot == 0 {
                    (200..).find(|s| !state.objects.contains_key(&(write.kind, *s))).unwrap()
                } else {
                    write.slot
                };
                state
                    .objects
                    .insert((write.kind, slot), (write.name.clone(), write.data.to_vec()));
                vec![Message::DataAck(DataAck {
                    kind: write.kind,
                    slot,
                    offset: 0,
                    size: write.data.len() as u32,
                })]
            }
            Message::Load(load) => match state.objects.get_mut(&(load.kind, load.slot)) {
                Some((_, data)) => {
                    let end = load.offset as usize + load.data.len();
                    if data.len() < end {
                        data.resize(end, 0);
                    }
                    data[load.offset as usize..end].copy_from_slice(&load.data);
                    vec![Message::DataAck(DataAck {
                        kind: load.kind,
                        slot: load.slot,
                        offset: load.offset,
                        size: load.data.len() as u32,
                    })]
                }
                None => vec![Message::DataNak(DataNak {
                    kind: load.kind,
                    slot: load.slot,
                    offset: load.offset,
                    size: load.data.len() as u32,
                    code: NakCode::ObjectNotFound,
                })],
            },
            Message::Del(del) => {
                state.objects.remove(&(del.kind, del.slot));
                vec![Message::Info(Info {
                    kind: del.kind,
                    slot: del.slot,
                    size: 0,
                    in_ram: false,
                    name: String::new(),
                })]
            }
            _ => vec![],
        }
    }
}

fn builder() -> SessionBuilder {
    Session::builder().call_timeout(Duration::from_secs(2))
}

/// Dump of Program 125 in three fragments, then a cache hit.
#[tokio::test]
async fn test_program_125_end_to_end() {
    let device = SimulatedK2::new(Behavior {
        fragments: 3,
        ..Behavior::default()
    })
    .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, state) = device.session(builder()).await;
    assert!(session.is_connected());

    let entry = session
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.name, TENOR_NAME);
    assert_eq!(entry.data.len(), TENOR_SIZE);
    assert_eq!(&entry.data[..], &tenor_data()[..]);
    assert_eq!(state.lock().unwrap().dumps, 1);

    let frames_before = session.stats().frames_sent;
    let again = session
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&entry, &again));
    assert_eq!(session.stats().frames_sent, frames_before);
    assert_eq!(state.lock().unwrap().dumps, 1);

    // The DUMP asked for exactly the size INFO declared.
    let commands = state.lock().unwrap().commands.clone();
    assert_eq!(
        commands.iter().filter(|&&c| c == command::DUMP).count(),
        1
    );

    assert!(session.catalog().invalidate(ObjectKind::Program, 125));
    session
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.lock().unwrap().dumps, 2);
}

#[tokio::test]
async fn test_empty_slot_is_none() {
    let device = SimulatedK2::new(Behavior::default());
    let (session, state) = device.session(builder()).await;

    assert!(session
        .catalog()
        .get(ObjectKind::Program, 5)
        .await
        .unwrap()
        .is_none());
    assert_eq!(state.lock().unwrap().dumps, 0);
    assert!(session.catalog().is_empty());
}

#[tokio::test]
async fn test_corrupted_fragment_fails_transfer() {
    let device = SimulatedK2::new(Behavior {
        fragments: 3,
        corrupt_fragment: Some(1),
        ..Behavior::default()
    })
    .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, _state) = device.session(builder()).await;

    let result = session.catalog().get(ObjectKind::Program, 125).await;
    assert!(matches!(result, Err(K2Error::TransferFailed(_))));
    assert!(session.catalog().cached(ObjectKind::Program, 125).is_none());

    let stats = session.stats();
    assert_eq!(stats.dispatch.transfers_failed, 1);

    // The stray third fragment arrives after the transfer was dropped.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.stats().dispatch.unsolicited >= 1);
}

#[tokio::test]
async fn test_reassembly_over_byte_at_a_time_transport() {
    let device = SimulatedK2::new(Behavior {
        fragments: 4,
        byte_at_a_time: true,
        ..Behavior::default()
    })
    .with_object(ObjectKind::Setup, 12, "Split Bass", vec![0xA5; 300]);
    let (session, _state) = device.session(builder()).await;

    let entry = session
        .catalog()
        .get(ObjectKind::Setup, 12)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&entry.data[..], &[0xA5; 300][..]);
}

#[tokio::test]
async fn test_screen_text_and_screenshot() {
    let device = SimulatedK2::new(Behavior::default());
    let (session, _state) = device.session(builder()).await;

    let grid = session.screen_text().await.unwrap();
    assert_eq!(grid.row(0).unwrap().trim_end(), "Program Mode");
    assert!(grid.contains("Read 2"));

    let raster = session.screenshot().await.unwrap();
    assert!(raster.get(10, 10));
    assert!(!raster.get(11, 10));
    assert_eq!(raster.lit_count(), 64);

    let last = session.last_screen();
    assert_eq!(last.text, grid);
    assert_eq!(last.raster, Some(raster));

    let captured = session.capture_screen().await.unwrap();
    assert!(captured.text.contains("Read 3"));
}

#[tokio::test]
async fn test_parameter_queries() {
    let device = SimulatedK2::new(Behavior::default());
    let (session, _state) = device.session(builder()).await;

    assert_eq!(session.parameter_name().await.unwrap(), "Volume");
    assert_eq!(session.parameter_value().await.unwrap(), "-6 dB");
}

/// Two screen reads at once: the second waits for the first's reply.
#[tokio::test]
async fn test_same_key_calls_queue() {
    let device = SimulatedK2::new(Behavior {
        reply_delay: Duration::from_millis(20),
        ..Behavior::default()
    });
    let (session, state) = device.session(builder()).await;

    let (first, second) = tokio::join!(session.screen_text(), session.screen_text());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first, second);

    let events = state.lock().unwrap().events.clone();
    assert_eq!(events, vec!["request", "reply", "request", "reply", "request", "reply"]);
}

/// Reads of different objects are not serialized behind each other.
#[tokio::test]
async fn test_different_keys_run_concurrently() {
    let device = SimulatedK2::new(Behavior::default())
        .with_object(ObjectKind::Program, 1, "One", vec![1; 10])
        .with_object(ObjectKind::Program, 2, "Two", vec![2; 20]);
    let (session, _state) = device.session(builder()).await;

    let (one, two) = tokio::join!(
        session.dir(ObjectKind::Program, 1),
        session.dir(ObjectKind::Program, 2)
    );
    assert_eq!(one.unwrap().name, "One");
    assert_eq!(two.unwrap().size, 20);
}

#[tokio::test]
async fn test_timeout_then_recovery() {
    let device = SimulatedK2::new(Behavior {
        ignore_first_dir: true,
        ..Behavior::default()
    })
    .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, _state) = device
        .session(Session::builder().call_timeout(Duration::from_millis(50)))
        .await;

    let result = session.dir(ObjectKind::Program, 125).await;
    assert!(matches!(result, Err(K2Error::Timeout(_))));

    let info = session.dir(ObjectKind::Program, 125).await.unwrap();
    assert_eq!(info.size as usize, TENOR_SIZE);
    assert_eq!(session.stats().dispatch.timeouts, 1);
}

#[tokio::test]
async fn test_hang_up_disconnects_pending_call() {
    let device = SimulatedK2::new(Behavior {
        hang_up_on: Some(command::DIR),
        ..Behavior::default()
    });
    let (session, _state) = device
        .session(Session::builder().call_timeout(Duration::from_secs(5)))
        .await;

    let result = session.dir(ObjectKind::Program, 1).await;
    assert!(matches!(result, Err(K2Error::Disconnected)));
    assert!(!session.is_connected());
    assert!(matches!(session.enter().await, Err(K2Error::Disconnected)));
}

#[tokio::test]
async fn test_put_lets_device_pick_slot() {
    let device = SimulatedK2::new(Behavior::default());
    let (session, state) = device.session(builder()).await;

    let entry = session
        .catalog()
        .put(ObjectKind::Program, 0, "New Sound", vec![9u8; 40])
        .await
        .unwrap();
    assert_eq!(entry.slot, 200);
    assert!(session.catalog().cached(ObjectKind::Program, 200).is_some());
    assert_eq!(
        state.lock().unwrap().objects[&(ObjectKind::Program, 200)].0,
        "New Sound"
    );
}

#[tokio::test]
async fn test_write_range_and_rejection() {
    let device = SimulatedK2::new(Behavior::default())
        .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, state) = device.session(builder()).await;

    let address = ObjectAddress::new(ObjectKind::Program, 125, 10);
    session.write_range(address, vec![0xEE, 0xFF]).await.unwrap();
    assert_eq!(
        &state.lock().unwrap().objects[&(ObjectKind::Program, 125)].1[10..12],
        &[0xEE, 0xFF]
    );
    assert_eq!(&session.read_range(address, 2).await.unwrap()[..], &[0xEE, 0xFF]);

    let missing = ObjectAddress::new(ObjectKind::Program, 7, 0);
    assert!(matches!(
        session.write_range(missing, vec![1]).await,
        Err(K2Error::Rejected {
            code: NakCode::ObjectNotFound
        })
    ));
}

#[tokio::test]
async fn test_delete_invalidates_cache() {
    let device = SimulatedK2::new(Behavior::default())
        .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, _state) = device.session(builder()).await;

    session
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap()
        .unwrap();
    session.delete_object(ObjectKind::Program, 125).await.unwrap();
    assert!(session.catalog().cached(ObjectKind::Program, 125).is_none());
    assert!(session
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_confirmed_navigation_reads_screen() {
    let device = SimulatedK2::new(Behavior::default());
    let (session, state) = device
        .session(builder().confirm_navigation(true))
        .await;

    session.number(125).await.unwrap();
    session.enter().await.unwrap();

    let commands = state.lock().unwrap().commands.clone();
    assert_eq!(
        commands,
        vec![
            command::ALLTEXT,
            command::PANEL,
            command::ALLTEXT,
            command::PANEL,
            command::ALLTEXT
        ]
    );
}

#[tokio::test]
async fn test_front_panel_dump_is_cached_and_broadcast() {
    let (client, mut device) = duplex(64 * 1024);
    let session = Session::builder()
        .ping_timeout(Duration::from_millis(10))
        .start_stream(client)
        .await
        .unwrap();
    let mut events = session.subscribe();

    let write = Message::Write(Write {
        kind: ObjectKind::Program,
        slot: 33,
        mode: WriteMode::ExactSlot,
        name: "Panel Dump".to_string(),
        form: EncodingFormat::BitStream,
        data: Bytes::from_static(&[1, 2, 3, 4]),
    });
    device
        .write_all(&write.to_bytes(&FrameCodec::default()).unwrap())
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        DeviceEvent::ObjectStored(stored) => assert_eq!(stored.name, "Panel Dump"),
        other => panic!("expected stored object, got {:?}", other),
    }
    let cached = session.catalog().cached(ObjectKind::Program, 33).unwrap();
    assert_eq!(&cached.data[..], &[1, 2, 3, 4]);
}

#[tokio::test]
async fn test_catalog_snapshot_survives_sessions() {
    let device = SimulatedK2::new(Behavior::default())
        .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, _state) = device.session(builder()).await;
    session
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap();
    let bytes = session.catalog().snapshot().to_msgpack().unwrap();
    session.close();

    let (other, state) = SimulatedK2::new(Behavior::default())
        .session(builder())
        .await;
    other
        .catalog()
        .restore(&k2_client::CatalogSnapshot::from_msgpack(&bytes).unwrap())
        .unwrap();
    let entry = other
        .catalog()
        .get(ObjectKind::Program, 125)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.name, TENOR_NAME);
    assert_eq!(state.lock().unwrap().dumps, 0);
}

/// An invalidation that lands while a fetch is in flight wins over the fetch.
#[tokio::test]
async fn test_invalidate_during_fetch_is_not_overwritten() {
    let device = SimulatedK2::new(Behavior {
        reply_delay: Duration::from_millis(30),
        ..Behavior::default()
    })
    .with_object(ObjectKind::Program, 125, TENOR_NAME, tenor_data());
    let (session, state) = device.session(builder()).await;
    let catalog = session.catalog();

    let invalidate = async {
        while state.lock().unwrap().dumps == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        catalog.invalidate(ObjectKind::Program, 125);
    };
    let (fetched, ()) = tokio::join!(catalog.get(ObjectKind::Program, 125), invalidate);

    assert_eq!(fetched.unwrap().unwrap().name, TENOR_NAME);
    assert!(catalog.cached(ObjectKind::Program, 125).is_none());

    catalog.get(ObjectKind::Program, 125).await.unwrap();
    assert_eq!(state.lock().unwrap().dumps, 2);
    assert!(catalog.cached(ObjectKind::Program, 125).is_some());
}

/// Frames split at every boundary decode the same as whole frames.
#[test]
fn test_frame_buffer_arbitrary_chunking() {
    let codec = FrameCodec::default();
    let messages = vec![
        Message::AllText,
        Message::ScreenReply(Bytes::from(encode_string("Volume"))),
        Message::Load(Load::new(
            ObjectKind::Program,
            125,
            0,
            EncodingFormat::BitStream,
            tenor_data(),
        )),
        Message::Info(Info {
            kind: ObjectKind::Program,
            slot: 125,
            size: TENOR_SIZE as u32,
            in_ram: true,
            name: TENOR_NAME.to_string(),
        }),
    ];
    let stream: Vec<u8> = messages
        .iter()
        .flat_map(|m| m.to_bytes(&codec).unwrap().to_vec())
        .collect();

    for chunk_size in [1, 2, 3, 7, 64, stream.len()] {
        let mut buffer = FrameBuffer::new(codec);
        let decoded: Vec<Message> = stream
            .chunks(chunk_size)
            .flat_map(|chunk| buffer.push(chunk))
            .map(|frame| Message::decode(&frame.unwrap()).unwrap())
            .collect();
        assert_eq!(decoded, messages, "chunk size {}", chunk_size);
    }
}
