//! Enumerations shared by K2 messages: object kinds, front-panel buttons,
//! button events and device reply codes.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{K2Error, Result};

/// Slot numbers user-addressable for every object kind.
pub const SLOT_RANGE: RangeInclusive<u16> = 1..=999;

/// Longest object name the device stores.
pub const MAX_NAME_LEN: usize = 16;

/// The type of an object in the K2 database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    IntonationTable,
    VelocityMap,
    PressureMap,
    QuickAccessBank,
    Song,
    Effect,
    Program,
    Keymap,
    Soundblock,
    Setup,
}

impl ObjectKind {
    /// Every kind, in type-number order.
    pub const ALL: [ObjectKind; 10] = [
        ObjectKind::IntonationTable,
        ObjectKind::VelocityMap,
        ObjectKind::PressureMap,
        ObjectKind::QuickAccessBank,
        ObjectKind::Song,
        ObjectKind::Effect,
        ObjectKind::Program,
        ObjectKind::Keymap,
        ObjectKind::Soundblock,
        ObjectKind::Setup,
    ];

    /// Type number used on the wire.
    pub fn wire_id(self) -> u16 {
        match self {
            ObjectKind::IntonationTable => 103,
            ObjectKind::VelocityMap => 104,
            ObjectKind::PressureMap => 105,
            ObjectKind::QuickAccessBank => 111,
            ObjectKind::Song => 112,
            ObjectKind::Effect => 113,
            ObjectKind::Program => 132,
            ObjectKind::Keymap => 133,
            ObjectKind::Soundblock => 134,
            ObjectKind::Setup => 135,
        }
    }

    /// Look up a kind by wire type number.
    pub fn from_wire_id(id: u16) -> Option<Self> {
        ObjectKind::ALL.into_iter().find(|kind| kind.wire_id() == id)
    }

    /// Slots that can hold an object of this kind.
    pub fn slots(self) -> RangeInclusive<u16> {
        SLOT_RANGE
    }

    /// Fail with a validation error if `slot` is outside this kind's range.
    pub fn check_slot(self, slot: u16) -> Result<()> {
        if self.slots().contains(&slot) {
            Ok(())
        } else {
            Err(K2Error::Validation(format!(
                "{} slot must be between {} and {}, got {}",
                self,
                self.slots().start(),
                self.slots().end(),
                slot
            )))
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::IntonationTable => "Intonation table",
            ObjectKind::VelocityMap => "Velocity map",
            ObjectKind::PressureMap => "Pressure map",
            ObjectKind::QuickAccessBank => "Quick access bank",
            ObjectKind::Song => "Song",
            ObjectKind::Effect => "Effect",
            ObjectKind::Program => "Program",
            ObjectKind::Keymap => "Keymap",
            ObjectKind::Soundblock => "Soundblock",
            ObjectKind::Setup => "Setup",
        };
        f.write_str(name)
    }
}

/// A byte position inside one stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAddress {
    pub kind: ObjectKind,
    pub slot: u16,
    pub offset: u32,
}

impl ObjectAddress {
    pub fn new(kind: ObjectKind, slot: u16, offset: u32) -> Self {
        Self { kind, slot, offset }
    }
}

/// What a button event does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ButtonEventType {
    Up = 0x08,
    Down = 0x09,
    Repeat = 0x0A,
    AlphaWheel = 0x0D,
}

impl ButtonEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x08 => Some(ButtonEventType::Up),
            0x09 => Some(ButtonEventType::Down),
            0x0A => Some(ButtonEventType::Repeat),
            0x0D => Some(ButtonEventType::AlphaWheel),
            _ => None,
        }
    }
}

macro_rules! buttons {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// A front-panel button.
        ///
        /// Chord codes (`PlusAndMinus`, `SoftAB`, …) stand for two buttons
        /// pressed together.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Button {
            $($name = $code),+
        }

        impl Button {
            /// Every button, in declaration order.
            pub const ALL: &'static [Button] = &[$(Button::$name),+];

            /// Look up a button by panel code.
            pub fn from_u8(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(Button::$name),)+
                    _ => None,
                }
            }
        }
    };
}

buttons! {
    Number0 = 0x00,
    Number1 = 0x01,
    Number2 = 0x02,
    Number3 = 0x03,
    Number4 = 0x04,
    Number5 = 0x05,
    Number6 = 0x06,
    Number7 = 0x07,
    Number8 = 0x08,
    Number9 = 0x09,
    PlusMinus = 0x0A,
    Cancel = 0x0B,
    Clear = 0x0C,
    Enter = 0x0D,
    CursorUp = 0x10,
    CursorDown = 0x11,
    CursorLeft = 0x12,
    CursorRight = 0x13,
    ChanBankInc = 0x14,
    ChanBankDec = 0x15,
    Plus = 0x16,
    Minus = 0x17,
    CursorLeftRight = 0x1A,
    ChanBankIncDec = 0x1C,
    PlusAndMinus = 0x1E,
    Edit = 0x20,
    Exit = 0x21,
    SoftA = 0x22,
    SoftB = 0x23,
    SoftC = 0x24,
    SoftD = 0x25,
    SoftE = 0x26,
    SoftF = 0x27,
    SoftAB = 0x28,
    SoftCD = 0x29,
    SoftEF = 0x2A,
    Program = 0x40,
    Setup = 0x41,
    QuickAccess = 0x42,
    Master = 0x43,
    Midi = 0x44,
    Disk = 0x45,
    Song = 0x46,
    Effects = 0x47,
}

impl Button {
    /// "Yes" in dialogs shares the E soft button.
    pub const SOFT_YES: Button = Button::SoftE;
    /// "No" in dialogs shares the F soft button.
    pub const SOFT_NO: Button = Button::SoftF;

    /// Panel code sent on the wire.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Numeric keypad button for a decimal digit.
    pub fn digit(digit: u8) -> Option<Self> {
        if digit <= 9 {
            Button::from_u8(digit)
        } else {
            None
        }
    }
}

/// Cursor direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn button(self) -> Button {
        match self {
            Direction::Up => Button::CursorUp,
            Direction::Down => Button::CursorDown,
            Direction::Left => Button::CursorLeft,
            Direction::Right => Button::CursorRight,
        }
    }
}

/// One 3-byte event inside a PANEL message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ButtonEvent {
    pub event_type: ButtonEventType,
    pub button: Button,
    /// Alpha wheel clicks, -64..=63. Zero for ordinary presses.
    pub clicks: i8,
}

impl ButtonEvent {
    /// Bytes per event on the wire.
    pub const SIZE: usize = 3;

    pub fn new(event_type: ButtonEventType, button: Button) -> Self {
        Self {
            event_type,
            button,
            clicks: 0,
        }
    }

    pub fn down(button: Button) -> Self {
        Self::new(ButtonEventType::Down, button)
    }

    pub fn up(button: Button) -> Self {
        Self::new(ButtonEventType::Up, button)
    }

    /// Alpha wheel turn; negative clicks turn counter-clockwise.
    pub fn alpha_wheel(clicks: i32) -> Result<Self> {
        if !(-64..=63).contains(&clicks) {
            return Err(K2Error::Validation(format!(
                "alpha wheel clicks must be between -64 and 63, got {}",
                clicks
            )));
        }
        Ok(Self {
            event_type: ButtonEventType::AlphaWheel,
            // Wheel events carry no button; code 0x00 fills the slot.
            button: Button::Number0,
            clicks: clicks as i8,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        [
            self.event_type as u8,
            self.button.code(),
            (i16::from(self.clicks) + 64) as u8,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let [event_type, button, clicks] = bytes else {
            return Err(K2Error::Malformed(format!(
                "button event must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        };
        let event_type = ButtonEventType::from_u8(*event_type).ok_or_else(|| {
            K2Error::Malformed(format!("unknown button event type 0x{:02X}", event_type))
        })?;
        let button = Button::from_u8(*button)
            .ok_or_else(|| K2Error::Malformed(format!("unknown button code 0x{:02X}", button)))?;
        if *clicks > 0x7F {
            return Err(K2Error::Malformed(format!(
                "alpha wheel byte 0x{:02X} out of range",
                clicks
            )));
        }
        Ok(Self {
            event_type,
            button,
            clicks: (i16::from(*clicks) - 64) as i8,
        })
    }
}

/// Reason code carried by a DNAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NakCode {
    ObjectCurrentlyBeingEdited,
    IncorrectChecksum,
    IdOutOfRange,
    ObjectNotFound,
    RamIsFull,
    /// A code this client does not know.
    Other(u8),
}

impl NakCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => NakCode::ObjectCurrentlyBeingEdited,
            2 => NakCode::IncorrectChecksum,
            3 => NakCode::IdOutOfRange,
            4 => NakCode::ObjectNotFound,
            5 => NakCode::RamIsFull,
            other => NakCode::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            NakCode::ObjectCurrentlyBeingEdited => 1,
            NakCode::IncorrectChecksum => 2,
            NakCode::IdOutOfRange => 3,
            NakCode::ObjectNotFound => 4,
            NakCode::RamIsFull => 5,
            NakCode::Other(other) => other,
        }
    }
}

/// Where a WRITE lands when the target slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// Replace whatever is at the given slot.
    #[default]
    ExactSlot = 0,
    /// Use the first free slot after the given one.
    FirstAvailableAfter = 1,
}

impl WriteMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WriteMode::ExactSlot),
            1 => Some(WriteMode::FirstAvailableAfter),
            _ => None,
        }
    }
}
