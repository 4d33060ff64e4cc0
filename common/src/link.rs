use std::{
    collections::BTreeMap,
    fmt,
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    config::{DeviceConfig, DimmerConfig},
    packet::{self, Command},
    types::{ConnectionState, DiscoveredDevice, LightMode, MacAddress},
};

pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms));
        }
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Classic Bluetooth serial link to a fixture.
///
/// `connect` and `disconnect` only start the operation. Their outcome, and any
/// unexpected link loss, is reported through the [`TransportEventSink`] the
/// transport was built with.
pub trait BtTransport {
    type Error: fmt::Display;

    fn connect(&mut self, mac: MacAddress) -> Result<(), Self::Error>;
    fn disconnect(&mut self) -> Result<(), Self::Error>;
    fn write(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
    /// Blocking inquiry bounded by `timeout_ms`.
    fn discover(&mut self, timeout_ms: u64) -> Result<Vec<DiscoveredDevice>, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(MacAddress),
    Disconnected,
}

/// Sending half of the transport mailbox. Safe to use from radio callbacks.
#[derive(Debug, Clone)]
pub struct TransportEventSink(mpsc::Sender<TransportEvent>);

impl TransportEventSink {
    pub fn connected(&self, mac: MacAddress) {
        self.push(TransportEvent::Connected(mac));
    }

    pub fn disconnected(&self) {
        self.push(TransportEvent::Disconnected);
    }

    pub fn push(&self, event: TransportEvent) {
        if self.0.send(event).is_err() {
            debug!("link manager dropped; discarding {event:?}");
        }
    }
}

#[derive(Debug)]
pub struct TransportEvents(mpsc::Receiver<TransportEvent>);

pub fn event_channel() -> (TransportEventSink, TransportEvents) {
    let (tx, rx) = mpsc::channel();
    (TransportEventSink(tx), TransportEvents(rx))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected {
        mac: MacAddress,
        pending_applied: bool,
    },
    Disconnected {
        mac: MacAddress,
    },
    ScanCompleted(Vec<DiscoveredDevice>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Send(Command),
    Delay(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed(Vec<DiscoveredDevice>),
    /// The link is being torn down first; results arrive as
    /// [`LinkEvent::ScanCompleted`].
    Deferred,
}

/// Commands that bring a fixture fully in line with a stored record, in the
/// order the receiver expects them.
pub fn full_config_commands(config: &DeviceConfig) -> Vec<Command> {
    let mut commands = vec![
        Command::Power(config.is_on),
        Command::FanSpeed(config.fan_speed),
        Command::Intensity(config.main_brightness),
        Command::Warmth(config.main_warmth),
    ];
    if config.light_mode == LightMode::RgbRing {
        commands.push(Command::ring_color(config.ring_hue, config.ring_brightness));
    }
    commands
}

pub struct LinkManager<T: BtTransport, C: Clock> {
    transport: T,
    events: TransportEvents,
    clock: C,
    config: DimmerConfig,
    state: ConnectionState,
    last_send_ms: Option<u64>,
    last_attempt_ms: Option<u64>,
    reconnect_target: Option<MacAddress>,
    pending_connect: Option<MacAddress>,
    pending_apply: Option<DeviceConfig>,
    pending_scan: Option<u64>,
}

impl<T: BtTransport, C: Clock> LinkManager<T, C> {
    pub fn new(transport: T, events: TransportEvents, clock: C, config: DimmerConfig) -> Self {
        Self {
            transport,
            events,
            clock,
            config,
            state: ConnectionState::Disconnected,
            last_send_ms: None,
            last_attempt_ms: None,
            reconnect_target: None,
            pending_connect: None,
            pending_apply: None,
            pending_scan: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    pub fn connected_mac(&self) -> Option<MacAddress> {
        self.state.connected_mac()
    }

    pub fn pending_apply(&self) -> Option<&DeviceConfig> {
        self.pending_apply.as_ref()
    }

    pub fn scan_pending(&self) -> bool {
        self.pending_scan.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn connect(&mut self, mac: MacAddress) -> bool {
        match self.state {
            ConnectionState::Connected(current) | ConnectionState::Connecting(current)
                if current == mac =>
            {
                true
            }
            ConnectionState::Connected(current) => {
                info!("switching link from {current} to {mac}");
                self.reconnect_target = Some(mac);
                self.pending_connect = Some(mac);
                self.request_teardown()
            }
            ConnectionState::Connecting(current) => {
                info!("abandoning connection attempt to {current}");
                self.abort_attempt();
                self.start_connect(mac)
            }
            ConnectionState::Disconnected => self.start_connect(mac),
        }
    }

    /// User-initiated disconnect. Also stops auto-reconnect.
    pub fn disconnect(&mut self) -> bool {
        self.reconnect_target = None;
        self.pending_connect = None;
        self.pending_apply = None;
        match self.state {
            ConnectionState::Disconnected => true,
            ConnectionState::Connecting(mac) => {
                info!("cancelling connection attempt to {mac}");
                self.abort_attempt();
                true
            }
            ConnectionState::Connected(_) => self.request_teardown(),
        }
    }

    /// Drops everything queued for `mac`: its parked config, a pending
    /// switch to it and auto-reconnect. An attempt already in flight is
    /// abandoned; an established link is left up.
    pub fn forget(&mut self, mac: MacAddress) {
        if self
            .pending_apply
            .as_ref()
            .is_some_and(|pending| pending.mac == mac)
        {
            self.pending_apply = None;
        }
        if self.pending_connect == Some(mac) {
            self.pending_connect = None;
        }
        if self.reconnect_target == Some(mac) {
            self.reconnect_target = None;
        }
        if self.state == ConnectionState::Connecting(mac) {
            info!("abandoning connection attempt to forgotten {mac}");
            self.abort_attempt();
        }
    }

    pub fn send(&mut self, command: Command) -> bool {
        let label = command.command_type().as_str();
        let Some(mac) = self.state.connected_mac() else {
            warn!("not connected; dropping {label}");
            return false;
        };
        match command.encode() {
            Ok(frame) => self.transmit(mac, label, &frame),
            Err(err) => {
                warn!("cannot encode {label}: {err}");
                false
            }
        }
    }

    /// Sends a payload under a numeric command code.
    pub fn send_raw(&mut self, code: u8, payload: &[u8]) -> bool {
        let Some(mac) = self.state.connected_mac() else {
            warn!("not connected; dropping command {code:#04x}");
            return false;
        };
        match packet::encode_code(code, payload) {
            Ok(frame) => self.transmit(mac, "raw", &frame),
            Err(err) => {
                warn!("cannot encode command {code:#04x}: {err}");
                false
            }
        }
    }

    pub fn execute(&mut self, actions: &[LinkAction]) -> bool {
        let mut ok = true;
        for action in actions {
            match *action {
                LinkAction::Send(command) => ok &= self.send(command),
                LinkAction::Delay(ms) => self.clock.sleep_ms(ms),
            }
        }
        ok
    }

    /// Pushes a whole record to its fixture. When that fixture is not the
    /// connected one the record is parked and applied on connect; only the
    /// latest parked record survives.
    pub fn send_full_config(&mut self, config: &DeviceConfig) -> bool {
        if self.state != ConnectionState::Connected(config.mac) {
            info!("{} not connected; queueing config", config.mac);
            if let Some(previous) = self.pending_apply.replace(config.clone()) {
                if previous.mac != config.mac {
                    debug!("dropping queued config for {}", previous.mac);
                }
            }
            self.connect(config.mac);
            return false;
        }

        if self
            .pending_apply
            .as_ref()
            .is_some_and(|pending| pending.mac == config.mac)
        {
            self.pending_apply = None;
        }

        let mut ok = true;
        for command in full_config_commands(config) {
            ok &= self.send(command);
        }
        ok
    }

    pub fn scan_for_devices(&mut self, timeout_ms: u64) -> ScanOutcome {
        if self.pending_scan.is_some() {
            self.pending_scan = Some(timeout_ms);
            return ScanOutcome::Deferred;
        }

        match self.state {
            ConnectionState::Connected(mac) => {
                info!("scan requested while connected to {mac}; disconnecting first");
                self.pending_scan = Some(timeout_ms);
                if self.request_teardown() {
                    ScanOutcome::Deferred
                } else {
                    self.pending_scan = None;
                    ScanOutcome::Completed(Vec::new())
                }
            }
            ConnectionState::Connecting(mac) => {
                info!("abandoning connection attempt to {mac} for scan");
                self.abort_attempt();
                ScanOutcome::Completed(self.run_scan(timeout_ms))
            }
            ConnectionState::Disconnected => ScanOutcome::Completed(self.run_scan(timeout_ms)),
        }
    }

    /// Drains transport events, then runs connection maintenance.
    pub fn poll(&mut self) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.0.try_recv() {
            match event {
                TransportEvent::Connected(mac) => self.on_connected(mac, &mut out),
                TransportEvent::Disconnected => self.on_disconnected(&mut out),
            }
        }
        self.maintain();
        out
    }

    fn on_connected(&mut self, mac: MacAddress, out: &mut Vec<LinkEvent>) {
        match self.state {
            ConnectionState::Disconnected if self.reconnect_target != Some(mac) => {
                warn!("unexpected connection from {mac}; closing");
                self.request_teardown();
                return;
            }
            ConnectionState::Connecting(target) if target != mac => {
                warn!("stale connection from {mac} while waiting for {target}; closing");
                self.request_teardown();
                return;
            }
            _ => {}
        }

        info!("link up: {mac}");
        self.state = ConnectionState::Connected(mac);
        self.reconnect_target = Some(mac);
        self.last_attempt_ms = None;

        let pending_applied = match self.pending_apply.take() {
            Some(config) if config.mac == mac => {
                info!("applying queued config to {mac}");
                self.send_full_config(&config);
                true
            }
            other => {
                self.pending_apply = other;
                false
            }
        };
        out.push(LinkEvent::Connected {
            mac,
            pending_applied,
        });
    }

    fn on_disconnected(&mut self, out: &mut Vec<LinkEvent>) {
        let previous = match self.state {
            ConnectionState::Connected(mac) | ConnectionState::Connecting(mac) => Some(mac),
            ConnectionState::Disconnected => None,
        };
        self.state = ConnectionState::Disconnected;
        if let Some(mac) = previous {
            info!("link down: {mac}");
            out.push(LinkEvent::Disconnected { mac });
        }

        if let Some(timeout_ms) = self.pending_scan.take() {
            self.clock.sleep_ms(self.config.scan_settle_ms);
            let devices = self.run_scan(timeout_ms);
            out.push(LinkEvent::ScanCompleted(devices));
        }

        if let Some(target) = self.pending_connect.take() {
            self.start_connect(target);
        }
    }

    fn maintain(&mut self) {
        let now = self.clock.now_ms();
        match self.state {
            ConnectionState::Connecting(mac) => {
                let started = self.last_attempt_ms.unwrap_or(now);
                if now.saturating_sub(started) >= self.config.connect_timeout_ms {
                    warn!("connection attempt to {mac} timed out");
                    self.abort_attempt();
                }
            }
            ConnectionState::Disconnected => {
                let Some(target) = self.reconnect_target else {
                    return;
                };
                if self.pending_scan.is_some() {
                    return;
                }
                let due = self.last_attempt_ms.map_or(true, |last| {
                    now.saturating_sub(last) >= self.config.reconnect_interval_ms
                });
                if due {
                    info!("reconnecting to {target}");
                    self.start_connect(target);
                }
            }
            ConnectionState::Connected(_) => {}
        }
    }

    fn start_connect(&mut self, mac: MacAddress) -> bool {
        self.reconnect_target = Some(mac);
        self.last_attempt_ms = Some(self.clock.now_ms());
        match self.transport.connect(mac) {
            Ok(()) => {
                info!("connecting to {mac}");
                self.state = ConnectionState::Connecting(mac);
                true
            }
            Err(err) => {
                warn!("connect to {mac} failed: {err}");
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    fn abort_attempt(&mut self) {
        if let Err(err) = self.transport.disconnect() {
            warn!("failed to cancel connection attempt: {err}");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn request_teardown(&mut self) -> bool {
        match self.transport.disconnect() {
            Ok(()) => true,
            Err(err) => {
                warn!("disconnect request failed: {err}");
                false
            }
        }
    }

    fn transmit(&mut self, mac: MacAddress, label: &str, frame: &[u8]) -> bool {
        if let Some(last) = self.last_send_ms {
            let elapsed = self.clock.now_ms().saturating_sub(last);
            if elapsed < self.config.min_send_interval_ms {
                self.clock
                    .sleep_ms(self.config.min_send_interval_ms - elapsed);
            }
        }

        match self.transport.write(frame) {
            Ok(()) => {
                self.last_send_ms = Some(self.clock.now_ms());
                debug!("{mac} <- {label} [{}]", packet::to_hex(frame));
                true
            }
            Err(err) => {
                warn!("write of {label} to {mac} failed: {err}");
                false
            }
        }
    }

    fn run_scan(&mut self, timeout_ms: u64) -> Vec<DiscoveredDevice> {
        info!("scanning for fixtures for {timeout_ms} ms");
        let found = match self.transport.discover(timeout_ms) {
            Ok(found) => found,
            Err(err) => {
                warn!("discovery failed: {err}");
                Vec::new()
            }
        };

        let prefix = self.config.vendor_prefix;
        let mut unique = BTreeMap::new();
        for device in found {
            if device.address.has_prefix(&prefix) {
                unique.entry(device.address).or_insert(device);
            }
        }
        let devices: Vec<DiscoveredDevice> = unique.into_values().collect();
        info!("scan finished with {} fixture(s)", devices.len());
        devices
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        testing::{device, frames, mac, FakeTransport, ManualClock},
        types::FanSpeed,
    };

    struct Harness {
        clock: ManualClock,
        sink: TransportEventSink,
        link: LinkManager<FakeTransport, ManualClock>,
    }

    fn harness() -> Harness {
        let clock = ManualClock::default();
        clock.advance(50_000);
        let (sink, events) = event_channel();
        let link = LinkManager::new(
            FakeTransport::new(clock.clone()),
            events,
            clock.clone(),
            DimmerConfig::default(),
        );
        Harness { clock, sink, link }
    }

    fn connected(target: MacAddress) -> Harness {
        let mut h = harness();
        assert!(h.link.connect(target));
        h.sink.connected(target);
        h.link.poll();
        assert_eq!(h.link.state(), ConnectionState::Connected(target));
        h
    }

    #[test]
    fn sends_are_dropped_while_disconnected() {
        let mut h = harness();
        assert!(!h.link.send(Command::Power(true)));
        assert!(h.link.transport().frames.is_empty());
    }

    #[test]
    fn sends_are_spaced_by_minimum_interval() {
        let mut h = connected(mac(1));
        assert!(h.link.send(Command::Power(true)));
        assert!(h.link.send(Command::Intensity(4)));
        h.clock.advance(30);
        assert!(h.link.send(Command::Warmth(40)));

        let stamps: Vec<u64> = h.link.transport().frames.iter().map(|(t, _)| *t).collect();
        assert_eq!(stamps[1] - stamps[0], 100);
        assert_eq!(stamps[2] - stamps[1], 100);
    }

    #[test]
    fn unknown_raw_command_transmits_nothing() {
        let mut h = connected(mac(1));
        assert!(!h.link.send_raw(0x42, &[1]));
        assert!(h.link.send_raw(5, &[2]));
        assert_eq!(h.link.transport().frames.len(), 1);
    }

    #[test]
    fn failed_write_reports_false() {
        let mut h = connected(mac(1));
        h.link.transport_mut().fail_writes = true;
        assert!(!h.link.send(Command::Power(false)));
    }

    #[test]
    fn full_config_follows_receiver_order() {
        let target = mac(1);
        let mut h = connected(target);
        let mut config = DeviceConfig::new(target);
        config.is_on = true;
        config.fan_speed = FanSpeed::Medium;
        config.light_mode = LightMode::RgbRing;
        config.ring_hue = 50;
        config.ring_brightness = 128;

        assert!(h.link.send_full_config(&config));
        assert_eq!(
            h.link.transport().sent(),
            frames(&[
                Command::Power(true),
                Command::FanSpeed(FanSpeed::Medium),
                Command::Intensity(8),
                Command::Warmth(150),
                Command::ring_color(50, 128),
            ])
        );
    }

    #[test]
    fn queued_config_is_applied_on_connect() {
        let target = mac(2);
        let mut h = harness();
        let mut config = DeviceConfig::new(target);
        config.is_on = true;

        assert!(!h.link.send_full_config(&config));
        assert_eq!(h.link.transport().connects, vec![target]);
        assert!(h.link.transport().frames.is_empty());

        h.sink.connected(target);
        let events = h.link.poll();
        assert_eq!(
            events,
            vec![LinkEvent::Connected {
                mac: target,
                pending_applied: true,
            }]
        );
        assert_eq!(h.link.transport().frames.len(), 4);
        assert!(h.link.pending_apply().is_none());
    }

    #[test]
    fn newer_queued_config_supersedes_older() {
        let target = mac(2);
        let mut h = harness();
        let mut first = DeviceConfig::new(target);
        first.main_brightness = 3;
        let mut second = first.clone();
        second.main_brightness = 12;

        h.link.send_full_config(&first);
        h.link.send_full_config(&second);
        h.sink.connected(target);
        h.link.poll();

        let sent = h.link.transport().sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2], Command::Intensity(12).encode().unwrap());
    }

    #[test]
    fn switching_devices_waits_for_teardown() {
        let mut h = connected(mac(1));
        assert!(h.link.connect(mac(2)));
        assert_eq!(h.link.transport().disconnects, 1);
        assert_eq!(h.link.transport().connects, vec![mac(1)]);

        h.sink.disconnected();
        let events = h.link.poll();
        assert_eq!(events, vec![LinkEvent::Disconnected { mac: mac(1) }]);
        assert_eq!(h.link.transport().connects, vec![mac(1), mac(2)]);
        assert_eq!(h.link.state(), ConnectionState::Connecting(mac(2)));
    }

    #[test]
    fn late_connect_from_abandoned_attempt_is_closed() {
        let mut h = harness();
        assert!(h.link.connect(mac(1)));
        assert!(h.link.connect(mac(2)));
        assert_eq!(h.link.state(), ConnectionState::Connecting(mac(2)));
        let mut config = DeviceConfig::new(mac(2));
        config.is_on = true;
        h.link.send_full_config(&config);
        let disconnects = h.link.transport().disconnects;

        h.sink.connected(mac(1));
        let events = h.link.poll();

        assert!(events.is_empty());
        assert_eq!(h.link.state(), ConnectionState::Connecting(mac(2)));
        assert_eq!(h.link.transport().disconnects, disconnects + 1);
        assert!(h.link.transport().frames.is_empty());
        assert!(h.link.pending_apply().is_some());
    }

    #[test]
    fn forgotten_device_gets_no_queued_config() {
        let target = mac(2);
        let mut h = harness();
        let mut config = DeviceConfig::new(target);
        config.is_on = true;
        h.link.send_full_config(&config);
        assert_eq!(h.link.state(), ConnectionState::Connecting(target));

        h.link.forget(target);
        assert!(h.link.pending_apply().is_none());
        assert_eq!(h.link.state(), ConnectionState::Disconnected);

        h.sink.connected(target);
        h.link.poll();
        assert!(h.link.transport().frames.is_empty());
        assert_ne!(h.link.state(), ConnectionState::Connected(target));

        h.clock.advance(60_000);
        h.link.poll();
        assert_eq!(h.link.transport().connects, vec![target]);
    }

    #[test]
    fn connecting_to_current_device_is_a_no_op() {
        let mut h = connected(mac(1));
        assert!(h.link.connect(mac(1)));
        assert_eq!(h.link.transport().disconnects, 0);
        assert_eq!(h.link.transport().connects.len(), 1);
    }

    #[test]
    fn scan_while_disconnected_filters_and_dedupes() {
        let mut h = harness();
        h.link.transport_mut().nearby = vec![
            device("Fan B", mac(9)),
            device("Other", MacAddress::new([0x11, 0x22, 0x33, 0, 0, 1])),
            device("Fan A", mac(3)),
            device("Fan B again", mac(9)),
        ];

        let outcome = h.link.scan_for_devices(10_000);
        assert_eq!(
            outcome,
            ScanOutcome::Completed(vec![device("Fan A", mac(3)), device("Fan B", mac(9))])
        );
    }

    #[test]
    fn scan_while_connected_resumes_once_after_disconnect() {
        let mut h = connected(mac(1));
        h.link.transport_mut().nearby = vec![device("Fan", mac(4))];

        assert_eq!(h.link.scan_for_devices(10_000), ScanOutcome::Deferred);
        assert!(h.link.transport().discoveries.is_empty());

        let before = h.clock.now_ms();
        h.sink.disconnected();
        let events = h.link.poll();
        assert_eq!(
            events,
            vec![
                LinkEvent::Disconnected { mac: mac(1) },
                LinkEvent::ScanCompleted(vec![device("Fan", mac(4))]),
            ]
        );
        let (started, timeout) = h.link.transport().discoveries[0];
        assert_eq!(started - before, 500);
        assert_eq!(timeout, 10_000);

        h.link.poll();
        assert_eq!(h.link.transport().discoveries.len(), 1);
    }

    #[test]
    fn lost_link_reconnects_at_most_once_per_interval() {
        let mut h = connected(mac(1));
        h.sink.disconnected();
        h.link.poll();
        assert_eq!(h.link.transport().connects.len(), 2);

        h.sink.disconnected();
        h.link.poll();
        h.link.poll();
        assert_eq!(h.link.transport().connects.len(), 2);

        h.clock.advance(5_000);
        h.link.poll();
        assert_eq!(h.link.transport().connects.len(), 3);
    }

    #[test]
    fn user_disconnect_stops_reconnecting() {
        let mut h = connected(mac(1));
        assert!(h.link.disconnect());
        h.sink.disconnected();
        h.link.poll();
        h.clock.advance(60_000);
        h.link.poll();
        assert_eq!(h.link.transport().connects.len(), 1);
        assert_eq!(h.link.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stalled_attempt_times_out() {
        let mut h = harness();
        h.link.connect(mac(1));
        h.clock.advance(14_999);
        h.link.poll();
        assert_eq!(h.link.state(), ConnectionState::Connecting(mac(1)));

        h.clock.advance(1);
        h.link.poll();
        assert_eq!(h.link.state(), ConnectionState::Disconnected);
        assert_eq!(h.link.transport().disconnects, 1);
    }
}
