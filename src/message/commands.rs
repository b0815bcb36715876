//! Outbound message builders.
//!
//! Each builder validates its arguments and returns a ready [`Message`], so
//! nothing reaches the wire unless it is well-formed. Object data is always
//! requested and sent bit-stream encoded.

use bytes::Bytes;

use super::{
    Button, ButtonEvent, Change, Del, Dir, Direction, Dump, Load, Message, New, ObjectAddress,
    ObjectKind, Read, Write, WriteMode, MAX_NAME_LEN,
};
use crate::error::{K2Error, Result};
use crate::protocol::wire_format::WHOLE_OBJECT;
use crate::protocol::EncodingFormat;

/// Data format used for every transfer this client starts.
pub const TRANSFER_FORMAT: EncodingFormat = EncodingFormat::BitStream;

/// Largest offset or size a DUMP/LOAD field can carry.
const MAX_FIELD: u32 = WHOLE_OBJECT;

/// Press and release a button given by raw panel code.
pub fn button_press(button_id: u8) -> Result<Message> {
    let button = Button::from_u8(button_id).ok_or_else(|| {
        K2Error::Validation(format!("unknown button code 0x{:02X}", button_id))
    })?;
    Ok(press(button))
}

/// Press and release one button.
pub fn press(button: Button) -> Message {
    Message::Panel(vec![ButtonEvent::down(button), ButtonEvent::up(button)])
}

/// Press buttons in order. Consecutive presses of the same button are sent
/// as repeated DOWN events closed by a single UP.
pub fn press_sequence(buttons: &[Button]) -> Message {
    let mut events = Vec::with_capacity(buttons.len() * 2);
    for (i, &button) in buttons.iter().enumerate() {
        events.push(ButtonEvent::down(button));
        if buttons.get(i + 1) != Some(&button) {
            events.push(ButtonEvent::up(button));
        }
    }
    Message::Panel(events)
}

/// Type a number on the keypad; negative numbers start with ±.
pub fn number_entry(value: i64) -> Message {
    let mut buttons = Vec::new();
    if value < 0 {
        buttons.push(Button::PlusMinus);
    }
    for digit in value.unsigned_abs().to_string().bytes() {
        if let Some(button) = Button::digit(digit - b'0') {
            buttons.push(button);
        }
    }
    press_sequence(&buttons)
}

/// Move the cursor one step.
pub fn cursor_move(direction: Direction) -> Message {
    press(direction.button())
}

/// Turn the alpha wheel; -64..=63 clicks.
pub fn alpha_wheel(clicks: i32) -> Result<Message> {
    Ok(Message::Panel(vec![ButtonEvent::alpha_wheel(clicks)?]))
}

/// Read `len` bytes of an object starting at the address offset.
pub fn parameter_read(address: ObjectAddress, len: u32) -> Result<Message> {
    dump_range(address.kind, address.slot, address.offset, len)
}

/// Overwrite bytes of an existing object starting at the address offset.
pub fn parameter_write(address: ObjectAddress, bytes: impl Into<Bytes>) -> Result<Message> {
    address.kind.check_slot(address.slot)?;
    let bytes = bytes.into();
    check_range(address.offset, bytes.len() as u64)?;
    Ok(Message::Load(Load::new(
        address.kind,
        address.slot,
        address.offset,
        TRANSFER_FORMAT,
        bytes,
    )))
}

/// Ask for a whole object's data.
pub fn dump_request(kind: ObjectKind, slot: u16) -> Result<Message> {
    dump_range(kind, slot, 0, WHOLE_OBJECT)
}

/// Ask for `size` bytes of an object starting at `offset`.
pub fn dump_range(kind: ObjectKind, slot: u16, offset: u32, size: u32) -> Result<Message> {
    kind.check_slot(slot)?;
    if size == 0 {
        return Err(K2Error::Validation("dump size must be positive".to_string()));
    }
    check_range(offset, u64::from(size))?;
    Ok(Message::Dump(Dump {
        kind,
        slot,
        offset,
        size,
        form: TRANSFER_FORMAT,
    }))
}

/// Ask for the 8×40 text layer of the display.
pub fn screen_read() -> Message {
    Message::AllText
}

/// Ask for the 240×64 graphics layer of the display.
pub fn graphics_read() -> Message {
    Message::GetGraphics
}

/// Ask for the name of the parameter under the cursor.
pub fn parameter_name() -> Message {
    Message::ParameterName
}

/// Ask for the value of the parameter under the cursor.
pub fn parameter_value() -> Message {
    Message::ParameterValue
}

/// Cheapest request the device always answers.
pub fn ping() -> Message {
    Message::AllText
}

/// Ask for an object's metadata.
pub fn dir_request(kind: ObjectKind, slot: u16) -> Result<Message> {
    kind.check_slot(slot)?;
    Ok(Message::Dir(Dir { kind, slot }))
}

/// Ask for a whole object as a WRITE (name and data together).
pub fn read_request(kind: ObjectKind, slot: u16) -> Result<Message> {
    kind.check_slot(slot)?;
    Ok(Message::Read(Read {
        kind,
        slot,
        form: TRANSFER_FORMAT,
    }))
}

/// Store a whole object. Slot 0 lets the device pick a free slot.
pub fn write_object(
    kind: ObjectKind,
    slot: u16,
    name: &str,
    data: impl Into<Bytes>,
) -> Result<Message> {
    check_slot_or_any(kind, slot)?;
    check_name(name)?;
    let data = data.into();
    check_range(0, data.len() as u64)?;
    Ok(Message::Write(Write {
        kind,
        slot,
        mode: WriteMode::ExactSlot,
        name: name.to_string(),
        form: TRANSFER_FORMAT,
        data,
    }))
}

/// Create an uninitialized object. Slot 0 lets the device pick.
pub fn new_object(kind: ObjectKind, slot: u16, size: u32, name: &str) -> Result<Message> {
    check_slot_or_any(kind, slot)?;
    check_name(name)?;
    check_range(0, u64::from(size))?;
    Ok(Message::New(New {
        kind,
        slot,
        size,
        ram_copy: false,
        name: name.to_string(),
    }))
}

/// Delete an object.
pub fn delete_object(kind: ObjectKind, slot: u16) -> Result<Message> {
    kind.check_slot(slot)?;
    Ok(Message::Del(Del { kind, slot }))
}

/// Rename an object, optionally moving it to `new_slot`.
pub fn rename_object(
    kind: ObjectKind,
    slot: u16,
    new_slot: Option<u16>,
    name: &str,
) -> Result<Message> {
    kind.check_slot(slot)?;
    if let Some(new_slot) = new_slot {
        kind.check_slot(new_slot)?;
    }
    check_name(name)?;
    Ok(Message::Change(Change {
        kind,
        slot,
        new_slot: new_slot.unwrap_or(0),
        name: name.to_string(),
    }))
}

fn check_slot_or_any(kind: ObjectKind, slot: u16) -> Result<()> {
    if slot == 0 {
        Ok(())
    } else {
        kind.check_slot(slot)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(K2Error::Validation(format!(
            "name {:?} is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if !name.bytes().all(|b| (0x20..0x7F).contains(&b)) {
        return Err(K2Error::Validation(format!(
            "name {:?} must be printable ASCII",
            name
        )));
    }
    Ok(())
}

fn check_range(offset: u32, len: u64) -> Result<()> {
    if offset > MAX_FIELD || len > u64::from(MAX_FIELD) {
        return Err(K2Error::Validation(format!(
            "range at offset {} of {} bytes exceeds the 21-bit field limit",
            offset, len
        )));
    }
    Ok(())
}
