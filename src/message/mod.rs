//! Typed K2 SysEx messages.
//!
//! Every frame the device understands or sends maps to one [`Message`]
//! variant. Encoding produces the payload that sits between the command byte
//! and the frame checksum; decoding parses a [`Frame`]'s payload back.
//! Commands this client does not model decode to [`Message::Unknown`].
//!
//! # Example
//!
//! ```
//! use k2_client::message::{Message, Dir, ObjectKind};
//! use k2_client::protocol::FrameCodec;
//!
//! let codec = FrameCodec::default();
//! let dir = Message::Dir(Dir { kind: ObjectKind::Program, slot: 125 });
//! let bytes = dir.to_bytes(&codec).unwrap();
//!
//! let frame = codec.decode(&bytes).unwrap();
//! assert_eq!(Message::decode(&frame).unwrap(), dir);
//! ```

pub mod commands;
mod types;

use bytes::Bytes;

use crate::error::{K2Error, Result};
use crate::protocol::wire_format::{
    data_checksum, decode_data, encode_data, put_7bit, read_7bit, running_checksum,
};
use crate::protocol::{EncodingFormat, Frame, FrameCodec};

pub use types::{
    Button, ButtonEvent, ButtonEventType, Direction, NakCode, ObjectAddress, ObjectKind,
    WriteMode, MAX_NAME_LEN, SLOT_RANGE,
};

/// Command byte of each message type.
pub mod command {
    pub const DUMP: u8 = 0x00;
    pub const LOAD: u8 = 0x01;
    pub const DACK: u8 = 0x02;
    pub const DNAK: u8 = 0x03;
    pub const DIR: u8 = 0x04;
    pub const INFO: u8 = 0x05;
    pub const NEW: u8 = 0x06;
    pub const DEL: u8 = 0x07;
    pub const CHANGE: u8 = 0x08;
    pub const WRITE: u8 = 0x09;
    pub const READ: u8 = 0x0A;
    pub const READBANK: u8 = 0x0B;
    pub const DIRBANK: u8 = 0x0C;
    pub const ENDOFBANK: u8 = 0x0D;
    pub const DELBANK: u8 = 0x0E;
    pub const MOVEBANK: u8 = 0x0F;
    pub const LOADMACRO: u8 = 0x10;
    pub const MACRODONE: u8 = 0x11;
    pub const PANEL: u8 = 0x14;
    pub const ALLTEXT: u8 = 0x15;
    pub const PARAMVALUE: u8 = 0x16;
    pub const PARAMNAME: u8 = 0x17;
    pub const GETGRAPHICS: u8 = 0x18;
    pub const SCREENREPLY: u8 = 0x19;
}

/// Bank number meaning "every bank" in bank-wide requests.
pub const ALL_BANKS: u8 = 127;

/// Request for a LOAD of an object's data, or a byte range of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dump {
    pub kind: ObjectKind,
    pub slot: u16,
    pub offset: u32,
    pub size: u32,
    pub form: EncodingFormat,
}

/// Object data, sent to the device or received in reply to a DUMP.
///
/// `checksum` is the 7-bit sum of the encoded data. When a reply is split
/// over several LOAD frames each fragment carries the running sum over all
/// encoded data so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Load {
    pub kind: ObjectKind,
    pub slot: u16,
    pub offset: u32,
    pub form: EncodingFormat,
    pub data: Bytes,
    pub checksum: u8,
    encoded_sum: u8,
}

impl Load {
    /// A self-contained LOAD whose checksum covers only its own data.
    pub fn new(
        kind: ObjectKind,
        slot: u16,
        offset: u32,
        form: EncodingFormat,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        let encoded_sum = data_checksum(&encode_data(&data, form));
        Self {
            kind,
            slot,
            offset,
            form,
            data,
            checksum: encoded_sum,
            encoded_sum,
        }
    }

    /// Re-seat the checksum as a continuation of earlier fragments.
    pub fn continuing(mut self, previous: u8) -> Self {
        self.checksum = running_checksum(previous, &[self.encoded_sum]);
        self
    }

    /// 7-bit sum of this fragment's encoded data alone.
    #[inline]
    pub fn encoded_sum(&self) -> u8 {
        self.encoded_sum
    }
}

/// Positive acknowledgement of a LOAD or WRITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAck {
    pub kind: ObjectKind,
    pub slot: u16,
    pub offset: u32,
    pub size: u32,
}

/// Negative acknowledgement of a LOAD or WRITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNak {
    pub kind: ObjectKind,
    pub slot: u16,
    pub offset: u32,
    pub size: u32,
    pub code: NakCode,
}

/// Request for an object's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    pub kind: ObjectKind,
    pub slot: u16,
}

/// Object metadata; `size == 0` means the slot is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub kind: ObjectKind,
    pub slot: u16,
    pub size: u32,
    pub in_ram: bool,
    pub name: String,
}

/// Create an object. Slot 0 lets the device pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct New {
    pub kind: ObjectKind,
    pub slot: u16,
    pub size: u32,
    pub ram_copy: bool,
    pub name: String,
}

/// Delete an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Del {
    pub kind: ObjectKind,
    pub slot: u16,
}

/// Rename and/or move an object. `new_slot == 0` keeps the slot, an empty
/// name keeps the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ObjectKind,
    pub slot: u16,
    pub new_slot: u16,
    pub name: String,
}

/// A whole object with its name. Sent to store one; received in reply to a
/// READ or when dumped from the front panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub kind: ObjectKind,
    pub slot: u16,
    pub mode: WriteMode,
    pub name: String,
    pub form: EncodingFormat,
    pub data: Bytes,
}

/// Ask for a WRITE of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub kind: ObjectKind,
    pub slot: u16,
    pub form: EncodingFormat,
}

/// Ask for WRITEs of every object in a bank. `kind: None` selects all types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBank {
    pub kind: Option<ObjectKind>,
    pub bank: u8,
    pub form: EncodingFormat,
    pub ram_only: bool,
}

/// Ask for INFOs of every object in a bank, followed by ENDOFBANK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBank {
    pub kind: Option<ObjectKind>,
    pub bank: u8,
    pub ram_only: bool,
}

/// Terminates the replies to a bank request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfBank {
    pub kind: Option<ObjectKind>,
    pub bank: u8,
}

/// Delete every RAM object in a bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelBank {
    pub kind: Option<ObjectKind>,
    pub bank: u8,
}

/// Move every RAM object in a bank to another bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveBank {
    pub kind: Option<ObjectKind>,
    pub bank: u8,
    pub new_bank: u8,
}

/// Every message of the K2 SysEx protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Dump(Dump),
    Load(Load),
    DataAck(DataAck),
    DataNak(DataNak),
    Dir(Dir),
    Info(Info),
    New(New),
    Del(Del),
    Change(Change),
    Write(Write),
    Read(Read),
    ReadBank(ReadBank),
    DirBank(DirBank),
    EndOfBank(EndOfBank),
    DelBank(DelBank),
    MoveBank(MoveBank),
    LoadMacro,
    MacroDone { failed: bool },
    /// Front-panel button events, sent or echoed.
    Panel(Vec<ButtonEvent>),
    AllText,
    ParameterValue,
    ParameterName,
    GetGraphics,
    /// Screen text, graphics, or a parameter string.
    ScreenReply(Bytes),
    /// A command byte this client does not model.
    Unknown { command: u8, payload: Bytes },
}

impl Message {
    /// Command byte on the wire.
    pub fn command(&self) -> u8 {
        match self {
            Message::Dump(_) => command::DUMP,
            Message::Load(_) => command::LOAD,
            Message::DataAck(_) => command::DACK,
            Message::DataNak(_) => command::DNAK,
            Message::Dir(_) => command::DIR,
            Message::Info(_) => command::INFO,
            Message::New(_) => command::NEW,
            Message::Del(_) => command::DEL,
            Message::Change(_) => command::CHANGE,
            Message::Write(_) => command::WRITE,
            Message::Read(_) => command::READ,
            Message::ReadBank(_) => command::READBANK,
            Message::DirBank(_) => command::DIRBANK,
            Message::EndOfBank(_) => command::ENDOFBANK,
            Message::DelBank(_) => command::DELBANK,
            Message::MoveBank(_) => command::MOVEBANK,
            Message::LoadMacro => command::LOADMACRO,
            Message::MacroDone { .. } => command::MACRODONE,
            Message::Panel(_) => command::PANEL,
            Message::AllText => command::ALLTEXT,
            Message::ParameterValue => command::PARAMVALUE,
            Message::ParameterName => command::PARAMNAME,
            Message::GetGraphics => command::GETGRAPHICS,
            Message::ScreenReply(_) => command::SCREENREPLY,
            Message::Unknown { command, .. } => *command,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        command_name(self.command())
    }

    /// Reply commands that answer this request. Empty when the device
    /// sends nothing back (PANEL) or answers with a stream of replies.
    pub fn reply_commands(&self) -> &'static [u8] {
        match self {
            Message::Dump(_) => &[command::LOAD],
            Message::Load(_) | Message::Write(_) => &[command::DACK, command::DNAK],
            Message::Dir(_) | Message::New(_) | Message::Del(_) | Message::Change(_) => {
                &[command::INFO]
            }
            Message::Read(_) => &[command::WRITE],
            Message::DelBank(_) | Message::MoveBank(_) => &[command::ENDOFBANK],
            Message::LoadMacro => &[command::MACRODONE],
            Message::AllText
            | Message::ParameterValue
            | Message::ParameterName
            | Message::GetGraphics => &[command::SCREENREPLY],
            _ => &[],
        }
    }

    /// Encode the payload (everything between command byte and checksum).
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Message::Dump(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, m.offset, 3)?;
                put_7bit(&mut out, m.size, 3)?;
                out.push(m.form as u8);
            }
            Message::Load(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, m.offset, 3)?;
                put_7bit(&mut out, len_u32(m.data.len())?, 3)?;
                out.push(m.form as u8);
                out.extend_from_slice(&encode_data(&m.data, m.form));
                out.push(m.checksum & 0x7F);
            }
            Message::DataAck(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, m.offset, 3)?;
                put_7bit(&mut out, m.size, 3)?;
            }
            Message::DataNak(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, m.offset, 3)?;
                put_7bit(&mut out, m.size, 3)?;
                put_7bit(&mut out, u32::from(m.code.code()), 1)?;
            }
            Message::Dir(m) => put_object(&mut out, m.kind, m.slot)?,
            Message::Info(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, m.size, 3)?;
                out.push(u8::from(m.in_ram));
                put_name(&mut out, &m.name)?;
            }
            Message::New(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, m.size, 3)?;
                out.push(u8::from(m.ram_copy));
                put_name(&mut out, &m.name)?;
            }
            Message::Del(m) => put_object(&mut out, m.kind, m.slot)?,
            Message::Change(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, u32::from(m.new_slot), 2)?;
                put_name(&mut out, &m.name)?;
            }
            Message::Write(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                put_7bit(&mut out, len_u32(m.data.len())?, 3)?;
                out.push(m.mode as u8);
                put_name(&mut out, &m.name)?;
                out.push(m.form as u8);
                let encoded = encode_data(&m.data, m.form);
                let checksum = data_checksum(&encoded);
                out.extend_from_slice(&encoded);
                out.push(checksum);
            }
            Message::Read(m) => {
                put_object(&mut out, m.kind, m.slot)?;
                out.push(m.form as u8);
            }
            Message::ReadBank(m) => {
                put_bank_kind(&mut out, m.kind)?;
                put_7bit(&mut out, u32::from(m.bank), 1)?;
                out.push(m.form as u8);
                out.push(u8::from(m.ram_only));
            }
            Message::DirBank(m) => {
                put_bank_kind(&mut out, m.kind)?;
                put_7bit(&mut out, u32::from(m.bank), 1)?;
                out.push(u8::from(m.ram_only));
            }
            Message::EndOfBank(m) => {
                put_bank_kind(&mut out, m.kind)?;
                put_7bit(&mut out, u32::from(m.bank), 1)?;
            }
            Message::DelBank(m) => {
                put_bank_kind(&mut out, m.kind)?;
                put_7bit(&mut out, u32::from(m.bank), 1)?;
            }
            Message::MoveBank(m) => {
                put_bank_kind(&mut out, m.kind)?;
                put_7bit(&mut out, u32::from(m.bank), 1)?;
                put_7bit(&mut out, u32::from(m.new_bank), 1)?;
            }
            Message::MacroDone { failed } => out.push(u8::from(*failed)),
            Message::Panel(events) => {
                for event in events {
                    out.extend_from_slice(&event.encode());
                }
            }
            Message::LoadMacro
            | Message::AllText
            | Message::ParameterValue
            | Message::ParameterName
            | Message::GetGraphics => {}
            Message::ScreenReply(data) => put_raw(&mut out, data)?,
            Message::Unknown { payload, .. } => put_raw(&mut out, payload)?,
        }
        Ok(out)
    }

    /// Encode as a complete frame.
    pub fn to_bytes(&self, codec: &FrameCodec) -> Result<Bytes> {
        let command = self.command();
        if command & 0x80 != 0 {
            return Err(K2Error::Validation(format!(
                "command byte 0x{:02X} is not 7-bit",
                command
            )));
        }
        Ok(codec.encode(command, &self.encode_payload()?))
    }

    /// Decode a frame's payload.
    pub fn decode(frame: &Frame) -> Result<Message> {
        let mut r = PayloadReader::new(&frame.payload);
        let message = match frame.command {
            command::DUMP => {
                let (kind, slot) = r.object()?;
                Message::Dump(Dump {
                    kind,
                    slot,
                    offset: r.int(3)?,
                    size: r.int(3)?,
                    form: r.form()?,
                })
            }
            command::LOAD => {
                let (kind, slot) = r.object()?;
                let offset = r.int(3)?;
                let size = r.int(3)? as usize;
                let form = r.form()?;
                let (encoded, checksum) = r.data_and_checksum()?;
                let data = decode_data(encoded, form, size)?;
                Message::Load(Load {
                    kind,
                    slot,
                    offset,
                    form,
                    data: Bytes::from(data),
                    checksum,
                    encoded_sum: data_checksum(encoded),
                })
            }
            command::DACK => {
                let (kind, slot) = r.object()?;
                Message::DataAck(DataAck {
                    kind,
                    slot,
                    offset: r.int(3)?,
                    size: r.int(3)?,
                })
            }
            command::DNAK => {
                let (kind, slot) = r.object()?;
                Message::DataNak(DataNak {
                    kind,
                    slot,
                    offset: r.int(3)?,
                    size: r.int(3)?,
                    code: NakCode::from_u8(r.byte()?),
                })
            }
            command::DIR => {
                let (kind, slot) = r.object()?;
                Message::Dir(Dir { kind, slot })
            }
            command::INFO => {
                let (kind, slot) = r.object()?;
                Message::Info(Info {
                    kind,
                    slot,
                    size: r.int(3)?,
                    in_ram: r.flag()?,
                    name: r.name()?,
                })
            }
            command::NEW => {
                let (kind, slot) = r.object()?;
                Message::New(New {
                    kind,
                    slot,
                    size: r.int(3)?,
                    ram_copy: r.flag()?,
                    name: r.name()?,
                })
            }
            command::DEL => {
                let (kind, slot) = r.object()?;
                Message::Del(Del { kind, slot })
            }
            command::CHANGE => {
                let (kind, slot) = r.object()?;
                Message::Change(Change {
                    kind,
                    slot,
                    new_slot: r.int(2)? as u16,
                    name: r.name()?,
                })
            }
            command::WRITE => {
                let (kind, slot) = r.object()?;
                let size = r.int(3)? as usize;
                let mode = r.byte()?;
                let mode = WriteMode::from_u8(mode)
                    .ok_or_else(|| K2Error::Malformed(format!("unknown write mode {}", mode)))?;
                let name = r.name()?;
                let form = r.form()?;
                let (encoded, checksum) = r.data_and_checksum()?;
                let expected = data_checksum(encoded);
                if expected != checksum {
                    return Err(K2Error::ChecksumMismatch {
                        command: command::WRITE,
                        expected,
                        actual: checksum,
                    });
                }
                Message::Write(Write {
                    kind,
                    slot,
                    mode,
                    name,
                    form,
                    data: Bytes::from(decode_data(encoded, form, size)?),
                })
            }
            command::READ => {
                let (kind, slot) = r.object()?;
                Message::Read(Read {
                    kind,
                    slot,
                    form: r.form()?,
                })
            }
            command::READBANK => Message::ReadBank(ReadBank {
                kind: r.bank_kind()?,
                bank: r.byte()?,
                form: r.form()?,
                ram_only: r.flag()?,
            }),
            command::DIRBANK => Message::DirBank(DirBank {
                kind: r.bank_kind()?,
                bank: r.byte()?,
                ram_only: r.flag()?,
            }),
            command::ENDOFBANK => Message::EndOfBank(EndOfBank {
                kind: r.bank_kind()?,
                bank: r.byte()?,
            }),
            command::DELBANK => Message::DelBank(DelBank {
                kind: r.bank_kind()?,
                bank: r.byte()?,
            }),
            command::MOVEBANK => Message::MoveBank(MoveBank {
                kind: r.bank_kind()?,
                bank: r.byte()?,
                new_bank: r.byte()?,
            }),
            command::LOADMACRO => r.empty(Message::LoadMacro)?,
            command::MACRODONE => Message::MacroDone { failed: r.flag()? },
            command::PANEL => {
                let body = r.rest();
                if body.len() % ButtonEvent::SIZE != 0 {
                    return Err(K2Error::Malformed(format!(
                        "panel payload of {} bytes is not a whole number of events",
                        body.len()
                    )));
                }
                let events = body
                    .chunks(ButtonEvent::SIZE)
                    .map(ButtonEvent::decode)
                    .collect::<Result<Vec<_>>>()?;
                Message::Panel(events)
            }
            command::ALLTEXT => r.empty(Message::AllText)?,
            command::PARAMVALUE => r.empty(Message::ParameterValue)?,
            command::PARAMNAME => r.empty(Message::ParameterName)?,
            command::GETGRAPHICS => r.empty(Message::GetGraphics)?,
            command::SCREENREPLY => Message::ScreenReply(frame.payload.clone()),
            other => Message::Unknown {
                command: other,
                payload: frame.payload.clone(),
            },
        };
        Ok(message)
    }
}

/// Log name for a command byte.
pub fn command_name(command: u8) -> &'static str {
    match command {
        command::DUMP => "DUMP",
        command::LOAD => "LOAD",
        command::DACK => "DACK",
        command::DNAK => "DNAK",
        command::DIR => "DIR",
        command::INFO => "INFO",
        command::NEW => "NEW",
        command::DEL => "DEL",
        command::CHANGE => "CHANGE",
        command::WRITE => "WRITE",
        command::READ => "READ",
        command::READBANK => "READBANK",
        command::DIRBANK => "DIRBANK",
        command::ENDOFBANK => "ENDOFBANK",
        command::DELBANK => "DELBANK",
        command::MOVEBANK => "MOVEBANK",
        command::LOADMACRO => "LOADMACRO",
        command::MACRODONE => "MACRODONE",
        command::PANEL => "PANEL",
        command::ALLTEXT => "ALLTEXT",
        command::PARAMVALUE => "PARAMVALUE",
        command::PARAMNAME => "PARAMNAME",
        command::GETGRAPHICS => "GETGRAPHICS",
        command::SCREENREPLY => "SCREENREPLY",
        _ => "UNKNOWN",
    }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| K2Error::Validation(format!("{} bytes is too large", len)))
}

fn put_object(out: &mut Vec<u8>, kind: ObjectKind, slot: u16) -> Result<()> {
    put_7bit(out, u32::from(kind.wire_id()), 2)?;
    put_7bit(out, u32::from(slot), 2)
}

fn put_bank_kind(out: &mut Vec<u8>, kind: Option<ObjectKind>) -> Result<()> {
    put_7bit(out, kind.map_or(0, |k| u32::from(k.wire_id())), 2)
}

fn put_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    if !name.bytes().all(|b| (0x01..0x80).contains(&b)) {
        return Err(K2Error::Validation(format!(
            "name {:?} must be 7-bit ASCII without NUL",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(K2Error::Validation(format!(
            "name {:?} is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0x00);
    Ok(())
}

fn put_raw(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.iter().any(|b| b & 0x80 != 0) {
        return Err(K2Error::Validation(
            "payload contains bytes above 0x7F".to_string(),
        ));
    }
    out.extend_from_slice(bytes);
    Ok(())
}

/// Cursor over a message payload.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(K2Error::Malformed(format!(
                "payload of {} bytes ends inside a field at {}",
                self.data.len(),
                self.pos
            )));
        }
        let field = &self.data[self.pos..end];
        self.pos = end;
        Ok(field)
    }

    fn int(&mut self, width: usize) -> Result<u32> {
        read_7bit(self.take(width)?)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self) -> Result<bool> {
        Ok(self.byte()? != 0)
    }

    fn kind(&mut self) -> Result<ObjectKind> {
        let id = self.int(2)? as u16;
        ObjectKind::from_wire_id(id)
            .ok_or_else(|| K2Error::Malformed(format!("unknown object type {}", id)))
    }

    fn bank_kind(&mut self) -> Result<Option<ObjectKind>> {
        let id = self.int(2)? as u16;
        if id == 0 {
            return Ok(None);
        }
        ObjectKind::from_wire_id(id)
            .map(Some)
            .ok_or_else(|| K2Error::Malformed(format!("unknown object type {}", id)))
    }

    fn object(&mut self) -> Result<(ObjectKind, u16)> {
        let kind = self.kind()?;
        let slot = self.int(2)? as u16;
        Ok((kind, slot))
    }

    fn form(&mut self) -> Result<EncodingFormat> {
        let byte = self.byte()?;
        EncodingFormat::from_byte(byte)
            .ok_or_else(|| K2Error::Malformed(format!("unknown data format {}", byte)))
    }

    /// NUL-terminated name; a missing terminator ends at the payload end.
    fn name(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let name = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += (len + 1).min(rest.len());
        Ok(name)
    }

    /// Encoded data followed by a trailing checksum byte.
    fn data_and_checksum(&mut self) -> Result<(&'a [u8], u8)> {
        let rest = self.rest();
        match rest.split_last() {
            Some((&checksum, encoded)) => Ok((encoded, checksum)),
            None => Err(K2Error::Malformed("missing data checksum".to_string())),
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn empty(&mut self, message: Message) -> Result<Message> {
        if self.pos < self.data.len() {
            return Err(K2Error::Malformed(format!(
                "{} carries an unexpected {}-byte body",
                message.name(),
                self.data.len() - self.pos
            )));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    fn roundtrip(message: &Message) -> Message {
        let bytes = message.to_bytes(&codec()).unwrap();
        let frame = codec().decode(&bytes).unwrap();
        Message::decode(&frame).unwrap()
    }

    #[test]
    fn test_panel_bytes() {
        let message = Message::Panel(vec![
            ButtonEvent::down(Button::CursorUp),
            ButtonEvent::up(Button::CursorUp),
        ]);
        assert_eq!(
            message.encode_payload().unwrap(),
            vec![0x09, 0x10, 0x40, 0x08, 0x10, 0x40]
        );
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn test_dump_layout() {
        let message = Message::Dump(Dump {
            kind: ObjectKind::Program,
            slot: 125,
            offset: 0,
            size: 586,
            form: EncodingFormat::BitStream,
        });
        // 132 = 01 04, 125 = 00 7D, 586 = 00 04 4A
        assert_eq!(
            message.encode_payload().unwrap(),
            vec![0x01, 0x04, 0x00, 0x7D, 0x00, 0x00, 0x00, 0x00, 0x04, 0x4A, 0x01]
        );
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn test_load_layout_and_checksum() {
        let load = Load::new(
            ObjectKind::Program,
            1,
            0,
            EncodingFormat::BitStream,
            Bytes::from_static(b"1234"),
        );
        assert_eq!(load.checksum, 0x6E);

        let payload = Message::Load(load.clone()).encode_payload().unwrap();
        assert_eq!(
            payload,
            vec![
                0x01, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01, 0x03, 0x09,
                0x48, 0x66, 0x34, 0x6E
            ]
        );

        match roundtrip(&Message::Load(load.clone())) {
            Message::Load(decoded) => {
                assert_eq!(decoded.data, load.data);
                assert_eq!(decoded.checksum, 0x6E);
                assert_eq!(decoded.encoded_sum(), 0x6E);
            }
            other => panic!("expected LOAD, got {:?}", other),
        }
    }

    #[test]
    fn test_continuing_load_checksum() {
        let first = Load::new(
            ObjectKind::Program,
            1,
            0,
            EncodingFormat::BitStream,
            Bytes::from_static(b"12"),
        );
        let second = Load::new(
            ObjectKind::Program,
            1,
            2,
            EncodingFormat::BitStream,
            Bytes::from_static(b"34"),
        )
        .continuing(first.checksum);

        let expected = running_checksum(first.encoded_sum(), &[second.encoded_sum()]);
        assert_eq!(second.checksum, expected);
        assert_ne!(second.checksum, second.encoded_sum());
    }

    #[test]
    fn test_info_with_name() {
        let message = Message::Info(Info {
            kind: ObjectKind::Program,
            slot: 125,
            size: 586,
            in_ram: true,
            name: "Fast Solo Tenor".to_string(),
        });
        let payload = message.encode_payload().unwrap();
        assert_eq!(*payload.last().unwrap(), 0x00);
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn test_write_checksum_verified() {
        let write = Message::Write(Write {
            kind: ObjectKind::Setup,
            slot: 5,
            mode: WriteMode::ExactSlot,
            name: "Split".to_string(),
            form: EncodingFormat::Nibblized,
            data: Bytes::from_static(&[0xDE, 0xAD]),
        });
        assert_eq!(roundtrip(&write), write);

        let mut payload = write.encode_payload().unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let frame = Frame::new(0, command::WRITE, Bytes::from(payload));
        assert!(matches!(
            Message::decode(&frame),
            Err(K2Error::ChecksumMismatch {
                command: command::WRITE,
                ..
            })
        ));
    }

    #[test]
    fn test_dnak_code() {
        let message = Message::DataNak(DataNak {
            kind: ObjectKind::Program,
            slot: 1,
            offset: 0,
            size: 4,
            code: NakCode::ObjectNotFound,
        });
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn test_bank_messages() {
        let all = Message::ReadBank(ReadBank {
            kind: None,
            bank: ALL_BANKS,
            form: EncodingFormat::BitStream,
            ram_only: true,
        });
        assert_eq!(all.encode_payload().unwrap(), vec![0x00, 0x00, 0x7F, 0x01, 0x01]);
        assert_eq!(roundtrip(&all), all);

        let moved = Message::MoveBank(MoveBank {
            kind: Some(ObjectKind::Effect),
            bank: 7,
            new_bank: 2,
        });
        assert_eq!(roundtrip(&moved), moved);
    }

    #[test]
    fn test_screen_requests_have_empty_bodies() {
        for message in [
            Message::AllText,
            Message::GetGraphics,
            Message::ParameterName,
            Message::ParameterValue,
        ] {
            assert!(message.encode_payload().unwrap().is_empty());
            assert_eq!(message.reply_commands(), &[command::SCREENREPLY]);
            assert_eq!(roundtrip(&message), message);
        }

        let frame = Frame::new(0, command::ALLTEXT, Bytes::from_static(&[0x01]));
        assert!(matches!(Message::decode(&frame), Err(K2Error::Malformed(_))));
    }

    #[test]
    fn test_reply_commands() {
        let dir = Message::Dir(Dir {
            kind: ObjectKind::Program,
            slot: 1,
        });
        assert_eq!(dir.reply_commands(), &[command::INFO]);
        assert!(Message::Panel(vec![]).reply_commands().is_empty());
    }

    #[test]
    fn test_unknown_command() {
        let frame = Frame::new(0, 0x13, Bytes::from_static(&[0x01, 0x02]));
        let message = Message::decode(&frame).unwrap();
        assert_eq!(
            message,
            Message::Unknown {
                command: 0x13,
                payload: Bytes::from_static(&[0x01, 0x02])
            }
        );
        assert_eq!(message.command(), 0x13);
        assert_eq!(message.name(), "UNKNOWN");
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let frame = Frame::new(0, command::DUMP, Bytes::from_static(&[0x01, 0x04, 0x00]));
        assert!(matches!(Message::decode(&frame), Err(K2Error::Malformed(_))));
    }

    #[test]
    fn test_unknown_object_type_is_malformed() {
        let frame = Frame::new(0, command::DIR, Bytes::from_static(&[0x00, 0x01, 0x00, 0x01]));
        assert!(matches!(Message::decode(&frame), Err(K2Error::Malformed(_))));
    }

    #[test]
    fn test_name_validation() {
        let message = Message::New(New {
            kind: ObjectKind::Program,
            slot: 0,
            size: 10,
            ram_copy: false,
            name: "This name is far too long".to_string(),
        });
        assert!(matches!(
            message.encode_payload(),
            Err(K2Error::Validation(_))
        ));
    }
}
