use serde::{Deserialize, Serialize};

use crate::types::{FanSpeed, LightMode, MacAddress};

pub const MAIN_BRIGHTNESS_MIN: u8 = 1;
pub const MAIN_BRIGHTNESS_MAX: u8 = 16;
pub const WARMTH_MIN: u8 = 0;
pub const WARMTH_MAX: u8 = 250;
pub const HUE_STEPS: u8 = 100;
pub const DEFAULT_DEVICE_NAME: &str = "Unnamed";
pub const MAX_DEVICE_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimmerConfig {
    pub min_send_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub scan_settle_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub save_quiet_period_ms: u64,
    pub save_min_interval_ms: u64,
    pub mode_resend_delay_ms: u64,
    pub warmth_step: u8,
    pub vendor_prefix: [u8; 3],
}

impl Default for DimmerConfig {
    fn default() -> Self {
        Self {
            min_send_interval_ms: 100,
            scan_timeout_ms: 10_000,
            scan_settle_ms: 500,
            connect_timeout_ms: 15_000,
            reconnect_interval_ms: 5_000,
            save_quiet_period_ms: 2_000,
            save_min_interval_ms: 1_000,
            mode_resend_delay_ms: 10,
            warmth_step: 10,
            vendor_prefix: [0xC9, 0xA3, 0x05],
        }
    }
}

impl DimmerConfig {
    pub fn sanitize(&mut self) {
        self.min_send_interval_ms = self.min_send_interval_ms.clamp(20, 1_000);
        self.scan_timeout_ms = self.scan_timeout_ms.clamp(1_280, 60_000);
        self.scan_settle_ms = self.scan_settle_ms.min(5_000);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(1_000, 60_000);
        self.reconnect_interval_ms = self.reconnect_interval_ms.clamp(1_000, 300_000);
        self.mode_resend_delay_ms = self.mode_resend_delay_ms.min(1_000);
        self.warmth_step = self.warmth_step.clamp(1, WARMTH_MAX);
    }
}

/// Persisted configuration of one paired fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub mac: MacAddress,
    pub name: String,
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
}

impl DeviceConfig {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            name: DEFAULT_DEVICE_NAME.to_string(),
            is_on: false,
            light_mode: LightMode::Main,
            main_brightness: 8,
            main_warmth: 150,
            ring_hue: 0,
            ring_brightness: 0,
            fan_speed: FanSpeed::Off,
        }
    }

    pub fn sanitize(&mut self) {
        self.main_brightness = self
            .main_brightness
            .clamp(MAIN_BRIGHTNESS_MIN, MAIN_BRIGHTNESS_MAX);
        self.main_warmth = self.main_warmth.clamp(WARMTH_MIN, WARMTH_MAX);
        self.ring_hue %= HUE_STEPS;
        self.name = sanitize_name(&self.name);
    }
}

pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DEVICE_NAME_LEN)
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        DEFAULT_DEVICE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub dimmer: DimmerConfig,
    pub radio_name: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dimmer: DimmerConfig::default(),
            radio_name: "ESP32_Master_BT".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_levels_and_wraps_hue() {
        let mut config = DeviceConfig::new(MacAddress::new([0xC9, 0xA3, 0x05, 0, 0, 1]));
        config.main_brightness = 0;
        config.main_warmth = 255;
        config.ring_hue = 130;
        config.sanitize();

        assert_eq!(config.main_brightness, MAIN_BRIGHTNESS_MIN);
        assert_eq!(config.main_warmth, WARMTH_MAX);
        assert_eq!(config.ring_hue, 30);
    }

    #[test]
    fn names_lose_control_characters_and_fall_back() {
        assert_eq!(sanitize_name("Den\n Lamp"), "Den Lamp");
        assert_eq!(sanitize_name("  \t"), DEFAULT_DEVICE_NAME);
        assert_eq!(sanitize_name(&"x".repeat(40)).len(), MAX_DEVICE_NAME_LEN);
    }

    #[test]
    fn runtime_config_tolerates_missing_network_block() {
        let json = serde_json::to_value(DimmerConfig::default()).unwrap();
        let raw = serde_json::json!({ "dimmer": json, "radio_name": "bench" });
        let parsed: RuntimeConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.radio_name, "bench");
        assert_eq!(parsed.network.http_port, 80);
    }
}
