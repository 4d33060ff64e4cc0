use std::{collections::HashMap, error::Error as StdError};

use log::{info, warn};
use thiserror::Error;

use crate::{
    config::{DeviceConfig, DimmerConfig},
    kv::KeyValueStore,
    light::LightState,
    types::{FanSpeed, LightMode, MacAddress},
};

pub const INDEX_NAMESPACE: &str = "dimmer";
pub const INDEX_KEY: &str = "devices";
const INDEX_DELIMITER: char = ',';

const KEY_FAN_SPEED: &str = "fan_speed";
const KEY_LIGHT_MODE: &str = "light_mode";
const KEY_MAIN_BRIGHTNESS: &str = "main_brightness";
const KEY_MAIN_WARMTH: &str = "main_warmth";
const KEY_RING_HUE: &str = "ring_hue";
const KEY_RING_BRIGHTNESS: &str = "ring_brightness";
const KEY_IS_ON: &str = "is_on";
const KEY_NAME: &str = "name";

const RECORD_KEYS: [&str; 8] = [
    KEY_FAN_SPEED,
    KEY_LIGHT_MODE,
    KEY_MAIN_BRIGHTNESS,
    KEY_MAIN_WARMTH,
    KEY_RING_HUE,
    KEY_RING_BRIGHTNESS,
    KEY_IS_ON,
    KEY_NAME,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

impl StoreError {
    fn backend<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        Self::Backend(Box::new(err))
    }
}

pub fn parse_index(raw: &str) -> Vec<MacAddress> {
    let mut index = Vec::new();
    for entry in raw
        .split(INDEX_DELIMITER)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        match entry.parse::<MacAddress>() {
            Ok(mac) if !index.contains(&mac) => index.push(mac),
            Ok(_) => {}
            Err(err) => warn!("skipping device index entry: {err}"),
        }
    }
    index
}

pub fn format_index(index: &[MacAddress]) -> String {
    index
        .iter()
        .map(MacAddress::to_string)
        .collect::<Vec<_>>()
        .join(&INDEX_DELIMITER.to_string())
}

/// Per-device records plus the master index, with debounced write-back of
/// the bound record.
///
/// The bound record is only written once it has been quiet for longer than
/// the quiet period and the previous write is older than the minimum save
/// interval.
pub struct ConfigStore<K: KeyValueStore> {
    kv: K,
    quiet_period_ms: u64,
    min_save_interval_ms: u64,
    index: Vec<MacAddress>,
    records: HashMap<MacAddress, DeviceConfig>,
    bound: Option<MacAddress>,
    snapshot: Option<DeviceConfig>,
    last_change_ms: u64,
    last_save_ms: u64,
}

impl<K: KeyValueStore> ConfigStore<K> {
    pub fn load(kv: K, config: &DimmerConfig) -> Self {
        let mut store = Self {
            kv,
            quiet_period_ms: config.save_quiet_period_ms,
            min_save_interval_ms: config.save_min_interval_ms,
            index: Vec::new(),
            records: HashMap::new(),
            bound: None,
            snapshot: None,
            last_change_ms: 0,
            last_save_ms: 0,
        };

        match store.read_index() {
            Ok(index) => store.index = index,
            Err(err) => warn!("failed to read device index: {err}"),
        }
        for mac in store.index.clone() {
            let record = store.read_record(mac).unwrap_or_else(|err| {
                warn!("failed to read record for {mac}, using defaults: {err}");
                DeviceConfig::new(mac)
            });
            store.records.insert(mac, record);
        }

        info!("config store loaded {} device(s)", store.index.len());
        store
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn kv_mut(&mut self) -> &mut K {
        &mut self.kv
    }

    pub fn index(&self) -> &[MacAddress] {
        &self.index
    }

    pub fn contains(&self, mac: MacAddress) -> bool {
        self.index.contains(&mac)
    }

    pub fn bound_mac(&self) -> Option<MacAddress> {
        self.bound
    }

    pub fn bound_record(&self) -> Option<&DeviceConfig> {
        self.bound.and_then(|mac| self.records.get(&mac))
    }

    /// Tracked record for `mac`, or a default record when it is unknown.
    pub fn device_config(&self, mac: MacAddress) -> DeviceConfig {
        self.records
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| DeviceConfig::new(mac))
    }

    pub fn devices(&self) -> Vec<DeviceConfig> {
        self.index
            .iter()
            .map(|mac| self.device_config(*mac))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        match (self.bound_record(), &self.snapshot) {
            (Some(record), Some(snapshot)) => record != snapshot,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Binds the store to a freshly connected fixture. Returns the record to
    /// apply, or `None` when the MAC is not managed.
    pub fn on_device_connected(&mut self, mac: MacAddress, now_ms: u64) -> Option<DeviceConfig> {
        if !self.contains(mac) {
            info!("{mac} is not a managed device; ignoring connection");
            return None;
        }

        let persisted = match self.read_record(mac) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!("failed to refresh {mac} from storage: {err}");
                self.device_config(mac)
            }
        };
        let record = self.records.entry(mac).or_insert(persisted.clone()).clone();

        self.bound = Some(mac);
        self.snapshot = Some(persisted);
        self.last_change_ms = now_ms;
        self.last_save_ms = now_ms;
        info!("bound {mac} ({})", record.name);
        Some(record)
    }

    pub fn on_device_disconnected(&mut self) {
        if let Some(mac) = self.bound.take() {
            info!("unbound {mac}");
        }
        self.snapshot = None;
    }

    pub fn on_light_change(&mut self, state: &LightState, now_ms: u64) {
        let Some(record) = self.bound_record_mut() else {
            warn!("light change with no bound device; not recorded");
            return;
        };
        state.apply_to(record);
        self.mark_changed(now_ms);
    }

    pub fn on_fan_change(&mut self, speed: FanSpeed, now_ms: u64) {
        let Some(record) = self.bound_record_mut() else {
            warn!("fan change with no bound device; not recorded");
            return;
        };
        record.fan_speed = speed;
        self.mark_changed(now_ms);
    }

    /// Writes the bound record if the debounce window allows it. Returns
    /// whether a write happened.
    pub fn try_flush(&mut self, now_ms: u64) -> bool {
        let Some(mac) = self.bound else {
            return false;
        };
        if !self.is_dirty()
            || now_ms.saturating_sub(self.last_change_ms) <= self.quiet_period_ms
            || now_ms.saturating_sub(self.last_save_ms) <= self.min_save_interval_ms
        {
            return false;
        }
        let Some(record) = self.records.get(&mac).cloned() else {
            return false;
        };

        let previous = self.snapshot.take();
        self.last_save_ms = now_ms;
        match self.write_record(&record, previous.as_ref()) {
            Ok(written) => {
                info!("saved {mac} ({written} field(s) changed)");
                self.snapshot = Some(record);
                true
            }
            Err(err) => {
                warn!("saving {mac} failed: {err}");
                self.snapshot = previous;
                false
            }
        }
    }

    /// Writes a full record and makes sure the index lists it.
    pub fn save_record(&mut self, config: &DeviceConfig, now_ms: u64) -> bool {
        let mut config = config.clone();
        config.sanitize();
        let mac = config.mac;
        let previous = self.contains(mac).then(|| self.device_config(mac));

        if let Err(err) = self.write_record(&config, None) {
            warn!("saving {mac} failed: {err}");
            match &previous {
                Some(record) => self.restore_fields(record, &config),
                None => self.discard_fields(mac),
            }
            return false;
        }

        if previous.is_none() {
            let mut index = self.index.clone();
            index.push(mac);
            if let Err(err) = self.write_index(&index) {
                warn!("failed to add {mac} to device index: {err}");
                self.discard_fields(mac);
                return false;
            }
            self.index = index;
            info!("added {mac} to device index");
        }

        self.records.insert(mac, config.clone());
        if self.bound == Some(mac) {
            self.snapshot = Some(config);
            self.last_change_ms = now_ms;
            self.last_save_ms = now_ms;
        }
        true
    }

    /// Creates a default record for `mac`, or renames the existing one.
    pub fn add_device(&mut self, mac: MacAddress, name: &str, now_ms: u64) -> bool {
        let mut config = self.device_config(mac);
        config.name = name.to_string();
        self.save_record(&config, now_ms)
    }

    pub fn delete_record(&mut self, mac: MacAddress) -> bool {
        if !self.contains(mac) {
            warn!("cannot delete {mac}: not a managed device");
            return false;
        }

        let previous = self.index.clone();
        let remaining: Vec<MacAddress> = previous.iter().copied().filter(|m| *m != mac).collect();
        if let Err(err) = self.write_index(&remaining) {
            warn!("failed to remove {mac} from device index: {err}");
            return false;
        }
        if let Err(err) = self.clear_fields(mac) {
            warn!("failed to clear storage for {mac}: {err}; restoring index");
            if let Err(err) = self.write_index(&previous) {
                warn!("device index restore failed: {err}");
            }
            return false;
        }

        self.index = remaining;
        self.records.remove(&mac);
        if self.bound == Some(mac) {
            self.bound = None;
            self.snapshot = None;
        }
        info!("deleted {mac}");
        true
    }

    fn bound_record_mut(&mut self) -> Option<&mut DeviceConfig> {
        let mac = self.bound?;
        self.records.get_mut(&mac)
    }

    fn mark_changed(&mut self, now_ms: u64) {
        if self.is_dirty() {
            self.last_change_ms = now_ms;
        }
    }

    fn read_index(&mut self) -> Result<Vec<MacAddress>, StoreError> {
        let raw = self
            .kv
            .get_str(INDEX_NAMESPACE, INDEX_KEY)
            .map_err(StoreError::backend)?
            .unwrap_or_default();
        Ok(parse_index(&raw))
    }

    fn write_index(&mut self, index: &[MacAddress]) -> Result<(), StoreError> {
        self.kv
            .set_str(INDEX_NAMESPACE, INDEX_KEY, &format_index(index))
            .map_err(StoreError::backend)
    }

    fn read_record(&mut self, mac: MacAddress) -> Result<DeviceConfig, StoreError> {
        let ns = mac.namespace();
        let mut config = DeviceConfig::new(mac);

        if let Some(v) = self.read_u8(&ns, KEY_FAN_SPEED)? {
            config.fan_speed = FanSpeed::from_level(i32::from(v));
        }
        if let Some(v) = self.read_u8(&ns, KEY_LIGHT_MODE)? {
            config.light_mode = LightMode::from_u8(v);
        }
        if let Some(v) = self.read_u8(&ns, KEY_MAIN_BRIGHTNESS)? {
            config.main_brightness = v;
        }
        if let Some(v) = self.read_u8(&ns, KEY_MAIN_WARMTH)? {
            config.main_warmth = v;
        }
        if let Some(v) = self.read_u8(&ns, KEY_RING_HUE)? {
            config.ring_hue = v;
        }
        if let Some(v) = self.read_u8(&ns, KEY_RING_BRIGHTNESS)? {
            config.ring_brightness = v;
        }
        if let Some(v) = self.kv.get_bool(&ns, KEY_IS_ON).map_err(StoreError::backend)? {
            config.is_on = v;
        }
        if let Some(v) = self.kv.get_str(&ns, KEY_NAME).map_err(StoreError::backend)? {
            config.name = v;
        }

        config.sanitize();
        Ok(config)
    }

    fn read_u8(&mut self, ns: &str, key: &str) -> Result<Option<u8>, StoreError> {
        self.kv.get_u8(ns, key).map_err(StoreError::backend)
    }

    /// Writes the fields of `config` that differ from `previous`, or all of
    /// them without a previous copy. Returns the number of fields written.
    fn write_record(
        &mut self,
        config: &DeviceConfig,
        previous: Option<&DeviceConfig>,
    ) -> Result<usize, StoreError> {
        let ns = config.mac.namespace();
        let bytes = [
            (KEY_FAN_SPEED, config.fan_speed.level(), previous.map(|p| p.fan_speed.level())),
            (KEY_LIGHT_MODE, config.light_mode.as_u8(), previous.map(|p| p.light_mode.as_u8())),
            (KEY_MAIN_BRIGHTNESS, config.main_brightness, previous.map(|p| p.main_brightness)),
            (KEY_MAIN_WARMTH, config.main_warmth, previous.map(|p| p.main_warmth)),
            (KEY_RING_HUE, config.ring_hue, previous.map(|p| p.ring_hue)),
            (KEY_RING_BRIGHTNESS, config.ring_brightness, previous.map(|p| p.ring_brightness)),
        ];

        let mut written = 0;
        for (key, value, old) in bytes {
            if old != Some(value) {
                self.kv
                    .set_u8(&ns, key, value)
                    .map_err(StoreError::backend)?;
                written += 1;
            }
        }
        if previous.map(|p| p.is_on) != Some(config.is_on) {
            self.kv
                .set_bool(&ns, KEY_IS_ON, config.is_on)
                .map_err(StoreError::backend)?;
            written += 1;
        }
        if previous.map(|p| p.name.as_str()) != Some(config.name.as_str()) {
            self.kv
                .set_str(&ns, KEY_NAME, &config.name)
                .map_err(StoreError::backend)?;
            written += 1;
        }
        Ok(written)
    }

    fn clear_fields(&mut self, mac: MacAddress) -> Result<(), StoreError> {
        let ns = mac.namespace();
        for key in RECORD_KEYS {
            self.kv.remove(&ns, key).map_err(StoreError::backend)?;
        }
        Ok(())
    }

    fn discard_fields(&mut self, mac: MacAddress) {
        if let Err(err) = self.clear_fields(mac) {
            warn!("failed to roll back fields for {mac}: {err}");
        }
    }

    /// Puts back the fields of a tracked record after a partial save.
    fn restore_fields(&mut self, record: &DeviceConfig, attempted: &DeviceConfig) {
        if let Err(err) = self.write_record(record, Some(attempted)) {
            warn!("failed to restore fields for {}: {err}", record.mac);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{kv::MemoryStore, testing::mac};

    #[derive(Debug, Error)]
    #[error("injected failure")]
    struct Injected;

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_index_writes: bool,
        fail_name_writes: bool,
        fail_removes: bool,
    }

    impl KeyValueStore for FlakyStore {
        type Error = Injected;

        fn get_u8(&mut self, namespace: &str, key: &str) -> Result<Option<u8>, Injected> {
            Ok(self.inner.get_u8(namespace, key).unwrap())
        }

        fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), Injected> {
            self.inner.set_u8(namespace, key, value).unwrap();
            Ok(())
        }

        fn get_str(&mut self, namespace: &str, key: &str) -> Result<Option<String>, Injected> {
            Ok(self.inner.get_str(namespace, key).unwrap())
        }

        fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), Injected> {
            if self.fail_index_writes && namespace == INDEX_NAMESPACE {
                return Err(Injected);
            }
            if self.fail_name_writes && key == KEY_NAME {
                return Err(Injected);
            }
            self.inner.set_str(namespace, key, value).unwrap();
            Ok(())
        }

        fn remove(&mut self, namespace: &str, key: &str) -> Result<(), Injected> {
            if self.fail_removes {
                return Err(Injected);
            }
            self.inner.remove(namespace, key).unwrap();
            Ok(())
        }
    }

    fn store_with(macs: &[MacAddress]) -> ConfigStore<MemoryStore> {
        let mut store = ConfigStore::load(MemoryStore::new(), &DimmerConfig::default());
        for mac in macs {
            assert!(store.add_device(*mac, "Fixture", 0));
        }
        store
    }

    fn lit_state(record: &DeviceConfig) -> LightState {
        let mut state = LightState::from_config(record);
        state.is_on = true;
        state
    }

    #[test]
    fn load_skips_bad_index_entries_and_defaults_missing_fields() {
        let mut kv = MemoryStore::new();
        let target = mac(1);
        kv.set_str(INDEX_NAMESPACE, INDEX_KEY, &format!("{target},not-a-mac,{target}"))
            .unwrap();
        kv.set_u8(&target.namespace(), KEY_MAIN_BRIGHTNESS, 12).unwrap();
        kv.set_u8(&target.namespace(), KEY_LIGHT_MODE, 9).unwrap();

        let store = ConfigStore::load(kv, &DimmerConfig::default());
        assert_eq!(store.index(), &[target]);

        let record = store.device_config(target);
        assert_eq!(record.main_brightness, 12);
        assert_eq!(record.light_mode, LightMode::Main);
        assert_eq!(record.main_warmth, 150);
        assert_eq!(record.name, "Unnamed");
    }

    #[test]
    fn burst_of_changes_lands_as_one_write_after_quiet_period() {
        let target = mac(1);
        let mut store = store_with(&[target]);
        let record = store.on_device_connected(target, 0).unwrap();
        let writes_before = store.kv().writes();

        let mut state = lit_state(&record);
        store.on_light_change(&state, 0);
        state.main.brightness = 10;
        store.on_light_change(&state, 300);
        store.on_fan_change(FanSpeed::Low, 600);

        let mut saved_at = Vec::new();
        for now in 600..=6_000 {
            if store.try_flush(now) {
                saved_at.push(now);
            }
        }
        assert_eq!(saved_at, vec![2_601]);
        assert_eq!(store.kv().writes() - writes_before, 3);
        assert!(!store.is_dirty());
    }

    #[test]
    fn flush_waits_for_minimum_save_interval() {
        let config = DimmerConfig {
            save_quiet_period_ms: 200,
            ..DimmerConfig::default()
        };
        let target = mac(1);
        let mut store = ConfigStore::load(MemoryStore::new(), &config);
        store.add_device(target, "Den", 0);
        let record = store.on_device_connected(target, 0).unwrap();

        store.on_light_change(&lit_state(&record), 0);
        assert!(!store.try_flush(201));
        assert!(!store.try_flush(1_000));
        assert!(store.try_flush(1_001));
    }

    #[test]
    fn unchanged_record_is_never_flushed() {
        let target = mac(1);
        let mut store = store_with(&[target]);
        let record = store.on_device_connected(target, 0).unwrap();
        store.on_light_change(&LightState::from_config(&record), 10);
        assert!(!store.try_flush(60_000));
    }

    #[test]
    fn unmanaged_connection_binds_nothing() {
        let mut store = store_with(&[mac(1)]);
        assert_eq!(store.on_device_connected(mac(2), 0), None);
        assert_eq!(store.bound_mac(), None);
    }

    #[test]
    fn changes_without_bound_device_are_ignored() {
        let target = mac(1);
        let mut store = store_with(&[target]);
        let before = store.device_config(target);
        store.on_fan_change(FanSpeed::High, 10);
        assert_eq!(store.device_config(target), before);
        assert!(!store.try_flush(60_000));
    }

    #[test]
    fn saving_new_record_writes_fields_and_index() {
        let target = mac(3);
        let mut store = store_with(&[]);
        let mut config = DeviceConfig::new(target);
        config.ring_hue = 142;

        assert!(store.save_record(&config, 0));
        assert_eq!(store.index(), &[target]);

        let fields = store.kv().namespace(&target.namespace()).unwrap();
        assert_eq!(fields.len(), RECORD_KEYS.len());

        let reloaded = ConfigStore::load(store.kv().clone(), &DimmerConfig::default());
        assert_eq!(reloaded.device_config(target).ring_hue, 42);
    }

    #[test]
    fn delete_removes_index_entry_and_namespace() {
        let (a, b) = (mac(1), mac(2));
        let mut store = store_with(&[a, b]);
        store.on_device_connected(a, 0);

        assert!(store.delete_record(a));
        assert_eq!(store.index(), &[b]);
        assert_eq!(store.bound_mac(), None);
        assert!(store.kv().namespace(&a.namespace()).is_none());

        let reloaded = ConfigStore::load(store.kv().clone(), &DimmerConfig::default());
        assert_eq!(reloaded.index(), &[b]);
    }

    #[test]
    fn deleted_device_falls_back_to_defaults() {
        let target = mac(1);
        let mut store = store_with(&[target]);
        let mut config = store.device_config(target);
        config.main_brightness = 17;
        config.ring_hue = 64;
        config.fan_speed = FanSpeed::High;
        assert!(store.save_record(&config, 0));

        assert!(store.delete_record(target));
        assert_eq!(store.device_config(target), DeviceConfig::new(target));
    }

    #[test]
    fn deleting_untracked_device_changes_nothing() {
        let mut store = store_with(&[mac(1)]);
        let writes = store.kv().writes();
        assert!(!store.delete_record(mac(9)));
        assert_eq!(store.kv().writes(), writes);
    }

    #[test]
    fn failed_field_removal_restores_index() {
        let target = mac(1);
        let mut store = ConfigStore::load(FlakyStore::default(), &DimmerConfig::default());
        assert!(store.add_device(target, "Den", 0));

        store.kv_mut().fail_removes = true;
        assert!(!store.delete_record(target));
        assert_eq!(store.index(), &[target]);

        let raw = store
            .kv_mut()
            .get_str(INDEX_NAMESPACE, INDEX_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(parse_index(&raw), vec![target]);
    }

    #[test]
    fn failed_index_write_rolls_back_new_record() {
        let target = mac(1);
        let mut store = ConfigStore::load(FlakyStore::default(), &DimmerConfig::default());
        store.kv_mut().fail_index_writes = true;

        assert!(!store.add_device(target, "Den", 0));
        assert!(store.index().is_empty());
        assert!(store.kv().inner.namespace(&target.namespace()).is_none());
    }

    #[test]
    fn failed_update_restores_previous_fields() {
        let target = mac(1);
        let mut store = ConfigStore::load(FlakyStore::default(), &DimmerConfig::default());
        assert!(store.add_device(target, "Den", 0));
        let before = store.device_config(target);

        let mut config = before.clone();
        config.main_brightness = 33;
        config.fan_speed = FanSpeed::Medium;
        config.name = "Porch".to_string();
        store.kv_mut().fail_name_writes = true;

        assert!(!store.save_record(&config, 0));
        assert_eq!(store.device_config(target), before);

        let ns = target.namespace();
        let kv = store.kv_mut();
        assert_eq!(
            kv.get_u8(&ns, KEY_MAIN_BRIGHTNESS).unwrap(),
            Some(before.main_brightness)
        );
        assert_eq!(
            kv.get_u8(&ns, KEY_FAN_SPEED).unwrap(),
            Some(before.fan_speed.level())
        );
        assert_eq!(kv.get_str(&ns, KEY_NAME).unwrap().as_deref(), Some("Den"));
    }

    #[test]
    fn index_round_trips_through_delimited_string() {
        let macs = vec![mac(1), mac(2)];
        assert_eq!(
            format_index(&macs),
            "C9:A3:05:36:C4:01,C9:A3:05:36:C4:02"
        );
        assert_eq!(parse_index(" C9:A3:05:36:C4:01 ,,"), vec![mac(1)]);
    }
}
