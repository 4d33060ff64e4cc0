use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacParseError {
    #[error("MAC address `{0}` must contain 12 hex digits")]
    Length(String),
    #[error("MAC address `{0}` contains a non-hex digit")]
    Digit(String),
}

/// Bluetooth device address, the sole identity of a fixture.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Storage namespace holding this device's record. Always 15 characters,
    /// which is the NVS namespace limit.
    pub fn namespace(&self) -> String {
        let mut out = String::with_capacity(15);
        out.push_str("cfg");
        for octet in self.0 {
            out.push_str(&format!("{octet:02x}"));
        }
        out
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<char> = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 {
            return Err(MacParseError::Length(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (idx, pair) in digits.chunks(2).enumerate() {
            let hi = pair[0].to_digit(16);
            let lo = pair[1].to_digit(16);
            match (hi, lo) {
                (Some(hi), Some(lo)) => octets[idx] = (hi * 16 + lo) as u8,
                _ => return Err(MacParseError::Digit(s.to_string())),
            }
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightMode {
    #[default]
    Main,
    #[serde(rename = "rgb")]
    RgbRing,
}

impl LightMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::RgbRing => "rgb",
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Main => 0,
            Self::RgbRing => 1,
        }
    }

    /// Unknown persisted values fall back to the main light.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::RgbRing,
            _ => Self::Main,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Main => Self::RgbRing,
            Self::RgbRing => Self::Main,
        }
    }

    /// Legal brightness range of the channel this mode drives.
    pub fn brightness_range(self) -> (u8, u8) {
        match self {
            Self::Main => (1, 16),
            Self::RgbRing => (0, 255),
        }
    }
}

impl FromStr for LightMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(Self::Main),
            "rgb" | "ring" => Ok(Self::RgbRing),
            other => Err(format!("unknown light mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FanSpeed {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl FanSpeed {
    pub const MAX_LEVEL: u8 = 3;

    pub fn level(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn from_level(level: i32) -> Self {
        match level.clamp(0, i32::from(Self::MAX_LEVEL)) {
            0 => Self::Off,
            1 => Self::Low,
            2 => Self::Medium,
            _ => Self::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

impl TryFrom<u8> for FanSpeed {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value > Self::MAX_LEVEL {
            return Err(format!("fan speed {value} out of range"));
        }
        Ok(Self::from_level(i32::from(value)))
    }
}

impl From<FanSpeed> for u8 {
    fn from(value: FanSpeed) -> Self {
        value.level()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting(MacAddress),
    Connected(MacAddress),
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting(_) => "CONNECTING",
            Self::Connected(_) => "CONNECTED",
        }
    }

    pub fn connected_mac(self) -> Option<MacAddress> {
        match self {
            Self::Connected(mac) => Some(mac),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: MacAddress,
}

#[derive(Debug, Clone, Serialize)]
pub struct DimmerStatus {
    pub connection: &'static str,
    #[serde(rename = "connectedMac")]
    pub connected_mac: Option<MacAddress>,
    #[serde(rename = "boundMac")]
    pub bound_mac: Option<MacAddress>,
    #[serde(rename = "isOn")]
    pub is_on: bool,
    #[serde(rename = "lightMode")]
    pub light_mode: LightMode,
    #[serde(rename = "mainBrightness")]
    pub main_brightness: u8,
    #[serde(rename = "mainWarmth")]
    pub main_warmth: u8,
    #[serde(rename = "ringHue")]
    pub ring_hue: u8,
    #[serde(rename = "ringBrightness")]
    pub ring_brightness: u8,
    #[serde(rename = "fanSpeed")]
    pub fan_speed: FanSpeed,
    #[serde(rename = "fanLabel")]
    pub fan_label: &'static str,
    #[serde(rename = "pendingSave")]
    pub pending_save: bool,
    #[serde(rename = "knownDevices")]
    pub known_devices: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_any_separator_and_prints_canonical() {
        let colon: MacAddress = "c9:a3:05:36:c4:72".parse().unwrap();
        let dashed: MacAddress = "C9-A3-05-36-C4-72".parse().unwrap();
        let bare: MacAddress = "C9A30536C472".parse().unwrap();

        assert_eq!(colon, dashed);
        assert_eq!(colon, bare);
        assert_eq!(colon.to_string(), "C9:A3:05:36:C4:72");
    }

    #[test]
    fn mac_rejects_malformed_input() {
        assert!(matches!(
            "C9:A3:05".parse::<MacAddress>(),
            Err(MacParseError::Length(_))
        ));
        assert!(matches!(
            "C9:A3:05:36:C4:7Z".parse::<MacAddress>(),
            Err(MacParseError::Digit(_))
        ));
    }

    #[test]
    fn namespace_fits_nvs_limit() {
        let mac: MacAddress = "C9:A3:05:36:C4:72".parse().unwrap();
        let ns = mac.namespace();
        assert_eq!(ns, "cfgc9a30536c472");
        assert_eq!(ns.len(), 15);
    }

    #[test]
    fn fan_speed_clamps_levels() {
        assert_eq!(FanSpeed::from_level(-4), FanSpeed::Off);
        assert_eq!(FanSpeed::from_level(2), FanSpeed::Medium);
        assert_eq!(FanSpeed::from_level(9), FanSpeed::High);
        assert!(FanSpeed::try_from(4u8).is_err());
    }

    #[test]
    fn unknown_persisted_mode_reads_as_main() {
        assert_eq!(LightMode::from_u8(1), LightMode::RgbRing);
        assert_eq!(LightMode::from_u8(7), LightMode::Main);
    }

    #[test]
    fn mac_serializes_as_string() {
        let mac = MacAddress::new([0xC9, 0xA3, 0x05, 0x01, 0x02, 0x03]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"C9:A3:05:01:02:03\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
