use thiserror::Error;

use crate::{color::ring_rgb, types::FanSpeed};

/// Fixed header every frame starts with. Byte [`SELECTOR_INDEX`] is
/// overwritten per command.
pub const PREAMBLE: [u8; 17] = [
    0x01, 0xFE, 0x00, 0x00, 0x51, 0x81, 0x18, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x0D,
];
pub const SUFFIX: [u8; 2] = [0x0E, 0x00];
pub const SELECTOR_INDEX: usize = 6;
pub const SELECTOR_DEFAULT: u8 = 0x18;
pub const SELECTOR_RGB: u8 = 0x1C;
pub const MAX_FRAME_LEN: usize = 128;

const POWER_ON: u8 = 0x01;
const POWER_OFF: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("unknown command type code {0:#04x}")]
    UnknownCommand(u8),
    #[error("payload of {len} bytes exceeds frame capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    LightOnOff,
    LightIntensity,
    LightWarmth,
    Rgb,
    FanSpeed,
}

impl CommandType {
    pub const ALL: [CommandType; 5] = [
        Self::LightOnOff,
        Self::LightIntensity,
        Self::LightWarmth,
        Self::Rgb,
        Self::FanSpeed,
    ];

    pub fn code(self) -> u8 {
        match self {
            Self::LightOnOff => 1,
            Self::LightIntensity => 2,
            Self::LightWarmth => 3,
            Self::Rgb => 4,
            Self::FanSpeed => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.code() == code)
    }

    pub fn prefix(self) -> &'static [u8] {
        match self {
            Self::LightOnOff => &[0x07, 0x01, 0x03, 0x01],
            Self::LightIntensity => &[0x07, 0x01, 0x03, 0x02],
            Self::LightWarmth => &[0x07, 0x01, 0x03, 0x03],
            Self::Rgb => &[0x0A, 0x02, 0x03, 0x0C],
            Self::FanSpeed => &[0x07, 0x0E, 0x03, 0x03],
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            Self::Rgb => SELECTOR_RGB,
            _ => SELECTOR_DEFAULT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LightOnOff => "LIGHT_ON_OFF",
            Self::LightIntensity => "LIGHT_INTENSITY",
            Self::LightWarmth => "LIGHT_WARMTH",
            Self::Rgb => "RGB",
            Self::FanSpeed => "FAN_SPEED",
        }
    }
}

impl TryFrom<u8> for CommandType {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(PacketError::UnknownCommand(code))
    }
}

pub fn encode(cmd: CommandType, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let prefix = cmd.prefix();
    let len = PREAMBLE.len() + prefix.len() + payload.len() + SUFFIX.len();
    if len > MAX_FRAME_LEN {
        return Err(PacketError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN - (len - payload.len()),
        });
    }

    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&PREAMBLE);
    frame[SELECTOR_INDEX] = cmd.selector();
    frame.extend_from_slice(prefix);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&SUFFIX);
    Ok(frame)
}

pub fn encode_code(code: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    encode(CommandType::try_from(code)?, payload)
}

/// A typed fixture command, built per send and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Power(bool),
    Intensity(u8),
    Warmth(u8),
    Rgb {
        brightness: u8,
        red: u8,
        green: u8,
        blue: u8,
    },
    FanSpeed(FanSpeed),
}

impl Command {
    /// RGB frame for the accent ring at a hue step and brightness.
    pub fn ring_color(hue: u8, brightness: u8) -> Self {
        let (red, green, blue) = ring_rgb(hue, brightness);
        Self::Rgb {
            brightness,
            red,
            green,
            blue,
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Power(_) => CommandType::LightOnOff,
            Self::Intensity(_) => CommandType::LightIntensity,
            Self::Warmth(_) => CommandType::LightWarmth,
            Self::Rgb { .. } => CommandType::Rgb,
            Self::FanSpeed(_) => CommandType::FanSpeed,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Self::Power(on) => vec![if on { POWER_ON } else { POWER_OFF }],
            Self::Intensity(level) => vec![level],
            Self::Warmth(level) => vec![level],
            Self::Rgb {
                brightness,
                red,
                green,
                blue,
            } => vec![brightness, red, green, blue],
            Self::FanSpeed(speed) => vec![speed.level()],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        encode(self.command_type(), &self.payload())
    }
}

pub fn to_hex(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
