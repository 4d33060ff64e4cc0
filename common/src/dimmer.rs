use log::{info, warn};
use serde::Deserialize;

use crate::{
    config::{
        DeviceConfig, DimmerConfig, HUE_STEPS, MAIN_BRIGHTNESS_MAX, MAIN_BRIGHTNESS_MIN,
        WARMTH_MAX, WARMTH_MIN,
    },
    fan::FanController,
    kv::KeyValueStore,
    light::{LightController, LightState},
    link::{
        BtTransport, Clock, LinkAction, LinkEvent, LinkManager, ScanOutcome, TransportEvents,
    },
    store::ConfigStore,
    types::{DimmerStatus, DiscoveredDevice, FanSpeed, LightMode, MacAddress},
};

/// Partial configuration for one managed fixture. Absent fields keep their
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlRequest {
    pub mac: MacAddress,
    pub is_on: Option<bool>,
    pub light_mode: Option<LightMode>,
    pub main_brightness: Option<i32>,
    pub main_warmth: Option<i32>,
    pub ring_hue: Option<i32>,
    pub ring_brightness: Option<i32>,
    pub fan_speed: Option<i32>,
}

impl ControlRequest {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            ..Self::default()
        }
    }

    /// Builds a request from query-style parameters: `mac`, `mode`
    /// (`main`, `rgb` or `off`), `bright`, `warm`, `hue`, `rgbBright`, `fan`.
    pub fn from_params<F>(param: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mac = param("mac")
            .ok_or("Missing 'mac' parameter")?
            .parse::<MacAddress>()
            .map_err(|err| err.to_string())?;
        let mut request = Self::new(mac);

        if let Some(mode) = param("mode") {
            if mode.trim().eq_ignore_ascii_case("off") {
                request.is_on = Some(false);
            } else {
                request.light_mode = Some(mode.parse()?);
                request.is_on = Some(true);
            }
        }

        let number = |key: &str| {
            param(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<i32>()
                        .map_err(|_| format!("Invalid '{key}' parameter"))
                })
                .transpose()
        };
        request.main_brightness = number("bright")?;
        request.main_warmth = number("warm")?;
        request.ring_hue = number("hue")?;
        request.ring_brightness = number("rgbBright")?;
        request.fan_speed = number("fan")?;
        Ok(request)
    }

    pub fn apply_to(&self, base: &DeviceConfig) -> DeviceConfig {
        let mut config = base.clone();
        if let Some(on) = self.is_on {
            config.is_on = on;
        }
        if let Some(mode) = self.light_mode {
            config.light_mode = mode;
        }
        if let Some(v) = self.main_brightness {
            config.main_brightness =
                v.clamp(i32::from(MAIN_BRIGHTNESS_MIN), i32::from(MAIN_BRIGHTNESS_MAX)) as u8;
        }
        if let Some(v) = self.main_warmth {
            config.main_warmth = v.clamp(i32::from(WARMTH_MIN), i32::from(WARMTH_MAX)) as u8;
        }
        if let Some(v) = self.ring_hue {
            config.ring_hue = v.rem_euclid(i32::from(HUE_STEPS)) as u8;
        }
        if let Some(v) = self.ring_brightness {
            config.ring_brightness = v.clamp(0, 255) as u8;
        }
        if let Some(v) = self.fan_speed {
            config.fan_speed = FanSpeed::from_level(v);
        }
        config.sanitize();
        config
    }
}

/// Owns the link, the controllers and the config store, and is the only
/// consumer of link events.
pub struct Dimmer<T: BtTransport, K: KeyValueStore, C: Clock + Clone> {
    link: LinkManager<T, C>,
    store: ConfigStore<K>,
    light: LightController,
    fan: FanController,
    clock: C,
    scan_timeout_ms: u64,
    last_scan: Vec<DiscoveredDevice>,
}

impl<T: BtTransport, K: KeyValueStore, C: Clock + Clone> Dimmer<T, K, C> {
    pub fn new(
        transport: T,
        events: TransportEvents,
        kv: K,
        clock: C,
        mut config: DimmerConfig,
    ) -> Self {
        config.sanitize();
        Self {
            link: LinkManager::new(transport, events, clock.clone(), config.clone()),
            store: ConfigStore::load(kv, &config),
            light: LightController::new(&config),
            fan: FanController::new(),
            clock,
            scan_timeout_ms: config.scan_timeout_ms,
            last_scan: Vec::new(),
        }
    }

    pub fn link(&self) -> &LinkManager<T, C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkManager<T, C> {
        &mut self.link
    }

    pub fn store(&self) -> &ConfigStore<K> {
        &self.store
    }

    pub fn light(&self) -> &LightState {
        self.light.state()
    }

    pub fn fan_speed(&self) -> FanSpeed {
        self.fan.speed()
    }

    /// One pass of the poll loop.
    pub fn tick(&mut self) {
        for event in self.link.poll() {
            self.handle_link_event(event);
        }
        let now = self.clock.now_ms();
        self.store.try_flush(now);
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected {
                mac,
                pending_applied,
            } => {
                let now = self.clock.now_ms();
                let Some(record) = self.store.on_device_connected(mac, now) else {
                    return;
                };
                self.light.load(&record);
                self.fan.load(&record);
                if !pending_applied {
                    self.link.send_full_config(&record);
                }
            }
            LinkEvent::Disconnected { .. } => self.store.on_device_disconnected(),
            LinkEvent::ScanCompleted(devices) => {
                info!("deferred scan delivered {} fixture(s)", devices.len());
                self.last_scan = devices;
            }
        }
    }

    pub fn toggle_light(&mut self) -> bool {
        let actions = self.light.toggle();
        self.apply_light(actions)
    }

    pub fn turn_light_on(&mut self) -> bool {
        let actions = self.light.turn_on();
        self.apply_light(actions)
    }

    pub fn turn_light_off(&mut self) -> bool {
        let actions = self.light.turn_off();
        self.apply_light(actions)
    }

    pub fn set_brightness(&mut self, value: i32, force: bool) -> bool {
        let actions = self.light.set_brightness(value, force);
        self.apply_light(actions)
    }

    pub fn increase_brightness(&mut self) -> bool {
        let actions = self.light.increase_brightness();
        self.apply_light(actions)
    }

    pub fn decrease_brightness(&mut self) -> bool {
        let actions = self.light.decrease_brightness();
        self.apply_light(actions)
    }

    pub fn set_warmth(&mut self, value: i32, force: bool) -> bool {
        let actions = self.light.set_warmth(value, force);
        self.apply_light(actions)
    }

    pub fn change_warmth(&mut self) -> bool {
        let actions = self.light.change_warmth();
        self.apply_light(actions)
    }

    pub fn set_hue(&mut self, value: i32, force: bool) -> bool {
        let actions = self.light.set_hue(value, force);
        self.apply_light(actions)
    }

    pub fn rotate_hue(&mut self) -> bool {
        let actions = self.light.rotate_hue();
        self.apply_light(actions)
    }

    pub fn switch_mode(&mut self) -> bool {
        let actions = self.light.switch_mode();
        self.apply_light(actions)
    }

    pub fn set_light_mode(&mut self, mode: LightMode) -> bool {
        let actions = self.light.set_mode(mode);
        self.apply_light(actions)
    }

    pub fn set_fan_speed(&mut self, level: i32, force: bool) -> bool {
        let actions = self.fan.set_speed(level, force);
        self.apply_fan(actions)
    }

    pub fn increase_fan_speed(&mut self) -> bool {
        let actions = self.fan.increase_speed();
        self.apply_fan(actions)
    }

    pub fn decrease_fan_speed(&mut self) -> bool {
        let actions = self.fan.decrease_speed();
        self.apply_fan(actions)
    }

    /// Applies a configuration to a managed fixture. The bound fixture is
    /// updated in place; any other one is saved, then connected and synced.
    pub fn control(&mut self, request: &ControlRequest) -> bool {
        let mac = request.mac;
        if !self.store.contains(mac) {
            warn!("control request for unmanaged device {mac}");
            return false;
        }

        let target = request.apply_to(&self.store.device_config(mac));
        if self.store.bound_mac() == Some(mac) && self.link.connected_mac() == Some(mac) {
            let light_actions = self.light.set_all(&LightState::from_config(&target));
            self.apply_light(light_actions);
            let fan_actions = self.fan.set_speed(i32::from(target.fan_speed.level()), false);
            self.apply_fan(fan_actions);
            return true;
        }

        let now = self.clock.now_ms();
        if !self.store.save_record(&target, now) {
            return false;
        }
        self.link.send_full_config(&target);
        true
    }

    pub fn add_device(&mut self, mac: MacAddress, name: &str) -> bool {
        let now = self.clock.now_ms();
        self.store.add_device(mac, name, now)
    }

    pub fn remove_device(&mut self, mac: MacAddress) -> bool {
        if !self.store.delete_record(mac) {
            return false;
        }
        self.link.forget(mac);
        true
    }

    /// Pushes the stored record of `mac` to its fixture, connecting first if
    /// needed.
    pub fn select_device(&mut self, mac: MacAddress) -> bool {
        if !self.store.contains(mac) {
            warn!("cannot select unmanaged device {mac}");
            return false;
        }
        let record = self.store.device_config(mac);
        self.link.send_full_config(&record);
        true
    }

    pub fn disconnect(&mut self) -> bool {
        self.link.disconnect()
    }

    pub fn devices(&self) -> Vec<DeviceConfig> {
        self.store.devices()
    }

    pub fn device_config(&self, mac: MacAddress) -> Option<DeviceConfig> {
        self.store
            .contains(mac)
            .then(|| self.store.device_config(mac))
    }

    pub fn scan(&mut self, timeout_ms: Option<u64>) -> ScanOutcome {
        let outcome = self
            .link
            .scan_for_devices(timeout_ms.unwrap_or(self.scan_timeout_ms));
        if let ScanOutcome::Completed(devices) = &outcome {
            self.last_scan = devices.clone();
        }
        outcome
    }

    pub fn last_scan(&self) -> &[DiscoveredDevice] {
        &self.last_scan
    }

    pub fn status(&self) -> DimmerStatus {
        let light = self.light.state();
        let state = self.link.state();
        DimmerStatus {
            connection: state.as_str(),
            connected_mac: state.connected_mac(),
            bound_mac: self.store.bound_mac(),
            is_on: light.is_on,
            light_mode: light.mode,
            main_brightness: light.main.brightness,
            main_warmth: light.main.warmth,
            ring_hue: light.ring.hue,
            ring_brightness: light.ring.brightness,
            fan_speed: self.fan.speed(),
            fan_label: self.fan.speed().as_str(),
            pending_save: self.store.is_dirty(),
            known_devices: self.store.index().len(),
        }
    }

    fn apply_light(&mut self, actions: Vec<LinkAction>) -> bool {
        if actions.is_empty() {
            return false;
        }
        self.link.execute(&actions);
        let now = self.clock.now_ms();
        self.store.on_light_change(self.light.state(), now);
        true
    }

    fn apply_fan(&mut self, actions: Vec<LinkAction>) -> bool {
        if actions.is_empty() {
            return false;
        }
        self.link.execute(&actions);
        let now = self.clock.now_ms();
        self.store.on_fan_change(self.fan.speed(), now);
        true
    }
}
