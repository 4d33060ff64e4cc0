use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    bt::{BtClassic, BtDriver},
    eventloop::EspSystemEventLoop,
    hal::{modem::WifiModem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use dimmer_common::{
    event_channel, ControlRequest, Dimmer, DimmerStatus, DiscoveredDevice, KeyValueStore,
    LightMode, MacAddress, RuntimeConfig, ScanOutcome, SystemClock,
};

use crate::spp::SppTransport;

type EspDimmer = Dimmer<SppTransport, NvsKvStore, SystemClock>;
type SharedDimmer = Arc<Mutex<EspDimmer>>;
type HttpRequest<'a, 'r> = Request<&'a mut EspHttpConnection<'r>>;

const NVS_RUNTIME_NAMESPACE: &str = "runtime";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_NVS_STR: usize = 4096;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const POLL_INTERVAL_MS: u64 = 20;

#[derive(Debug, Serialize)]
struct IntentResponse {
    changed: bool,
    status: DimmerStatus,
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    deferred: bool,
    devices: Vec<DiscoveredDevice>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut kv = NvsKvStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = load_runtime_config(&mut kv).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.dimmer.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, radio=`{}`",
        runtime.network.wifi_ssid, runtime.radio_name
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let (wifi_modem, bt_modem) = modem.split();

    let bt = BtDriver::<BtClassic>::new(bt_modem, Some(nvs_partition.clone()))
        .context("failed to start classic bluetooth")?;
    let (sink, events) = event_channel();
    let transport = SppTransport::new(bt, sink, &runtime.radio_name)?;

    let dimmer: SharedDimmer = Arc::new(Mutex::new(Dimmer::new(
        transport,
        events,
        kv,
        SystemClock,
        runtime.dimmer.clone(),
    )));
    spawn_poll_loop(dimmer.clone());

    if !has_station_credentials(&runtime) {
        warn!("wifi credentials missing; running without the HTTP API");
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }

    let wifi = connect_wifi(wifi_modem, sys_loop, nvs_partition, &runtime)
        .context("wifi startup failed")?;
    let server = create_http_server(dimmer, runtime.network.http_port)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn has_station_credentials(runtime: &RuntimeConfig) -> bool {
    !runtime.network.wifi_ssid.trim().is_empty()
}

fn load_runtime_config(kv: &mut NvsKvStore) -> anyhow::Result<RuntimeConfig> {
    match kv.get_str(NVS_RUNTIME_NAMESPACE, NVS_RUNTIME_KEY)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(&value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn spawn_poll_loop(dimmer: SharedDimmer) {
    thread::Builder::new()
        .name("dimmer-poll".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            dimmer.lock().unwrap().tick();
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        })
        .expect("failed to spawn poll loop thread");
}

fn create_http_server(dimmer: SharedDimmer, port: u16) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        http_port: port,
        max_uri_handlers: 32,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = dimmer.lock().unwrap().status();
            write_json(req, &status)
        })?;
    }

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/devices", Method::Get, move |req| {
            let devices = dimmer.lock().unwrap().devices();
            write_json(req, &devices)
        })?;
    }

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/devices/add", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(mac) = mac_param(&uri) else {
                return write_error(req, 400, "Missing or invalid 'mac' parameter");
            };
            let name = query_param(&uri, "name").unwrap_or_default();

            let mut dimmer = dimmer.lock().unwrap();
            if !dimmer.add_device(mac, &name) {
                return write_error(req, 500, "Failed to save device");
            }
            write_json(req, &dimmer.devices())
        })?;
    }

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/devices/remove", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(mac) = mac_param(&uri) else {
                return write_error(req, 400, "Missing or invalid 'mac' parameter");
            };

            let mut dimmer = dimmer.lock().unwrap();
            if dimmer.device_config(mac).is_none() {
                return write_error(req, 404, "Unknown device");
            }
            if !dimmer.remove_device(mac) {
                return write_error(req, 500, "Failed to remove device");
            }
            write_json(req, &dimmer.devices())
        })?;
    }

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/control", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let request = match ControlRequest::from_params(|key| query_param(&uri, key)) {
                Ok(request) => request,
                Err(message) => return write_error(req, 400, &message),
            };
            write_intent(req, &dimmer, |d| Ok(d.control(&request)))
        })?;
    }

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/scan", Method::Get, move |req| {
            let devices = dimmer.lock().unwrap().last_scan().to_vec();
            write_json(
                req,
                &ScanResponse {
                    deferred: false,
                    devices,
                },
            )
        })?;
    }

    {
        let dimmer = dimmer.clone();
        server.fn_handler("/api/scan", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let timeout_ms = match query_param(&uri, "timeoutMs") {
                None => None,
                Some(raw) => match raw.parse::<u64>() {
                    Ok(value) => Some(value),
                    Err(_) => return write_error(req, 400, "Invalid 'timeoutMs' parameter"),
                },
            };

            let outcome = dimmer.lock().unwrap().scan(timeout_ms);
            match outcome {
                ScanOutcome::Completed(devices) => write_json(
                    req,
                    &ScanResponse {
                        deferred: false,
                        devices,
                    },
                ),
                ScanOutcome::Deferred => write_json_with_status(
                    req,
                    202,
                    &ScanResponse {
                        deferred: true,
                        devices: Vec::new(),
                    },
                ),
            }
        })?;
    }

    register_intent(&mut server, &dimmer, "/api/devices/select", |d, uri| {
        let mac = mac_param(uri).ok_or("Missing or invalid 'mac' parameter")?;
        Ok(d.select_device(mac))
    })?;
    register_intent(&mut server, &dimmer, "/api/disconnect", |d, _| {
        Ok(d.disconnect())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/on", |d, _| {
        Ok(d.turn_light_on())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/off", |d, _| {
        Ok(d.turn_light_off())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/toggle", |d, _| {
        Ok(d.toggle_light())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/brightness", |d, uri| {
        let value = int_param(uri, "value")?;
        Ok(d.set_brightness(value, flag_param(uri, "force")))
    })?;
    register_intent(&mut server, &dimmer, "/api/light/brightness/up", |d, _| {
        Ok(d.increase_brightness())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/brightness/down", |d, _| {
        Ok(d.decrease_brightness())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/warmth", |d, uri| {
        let value = int_param(uri, "value")?;
        Ok(d.set_warmth(value, flag_param(uri, "force")))
    })?;
    register_intent(&mut server, &dimmer, "/api/light/warmth/cycle", |d, _| {
        Ok(d.change_warmth())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/hue", |d, uri| {
        let value = int_param(uri, "value")?;
        Ok(d.set_hue(value, flag_param(uri, "force")))
    })?;
    register_intent(&mut server, &dimmer, "/api/light/hue/rotate", |d, _| {
        Ok(d.rotate_hue())
    })?;
    register_intent(&mut server, &dimmer, "/api/light/mode", |d, uri| {
        let mode: LightMode = query_param(uri, "value")
            .ok_or("Missing 'value' parameter")?
            .parse()?;
        Ok(d.set_light_mode(mode))
    })?;
    register_intent(&mut server, &dimmer, "/api/light/mode/switch", |d, _| {
        Ok(d.switch_mode())
    })?;
    register_intent(&mut server, &dimmer, "/api/fan/speed", |d, uri| {
        let value = int_param(uri, "value")?;
        Ok(d.set_fan_speed(value, flag_param(uri, "force")))
    })?;
    register_intent(&mut server, &dimmer, "/api/fan/up", |d, _| {
        Ok(d.increase_fan_speed())
    })?;
    register_intent(&mut server, &dimmer, "/api/fan/down", |d, _| {
        Ok(d.decrease_fan_speed())
    })?;

    info!("HTTP API listening on port {port}");
    Ok(server)
}

/// Registers a POST route that runs one intent and answers with the
/// resulting status. `intent` receives the request URI for its parameters.
fn register_intent<F>(
    server: &mut EspHttpServer<'static>,
    dimmer: &SharedDimmer,
    uri: &str,
    intent: F,
) -> anyhow::Result<()>
where
    F: Fn(&mut EspDimmer, &str) -> Result<bool, String> + Send + 'static,
{
    let dimmer = dimmer.clone();
    server.fn_handler(uri, Method::Post, move |req| {
        let uri = req.uri().to_string();
        write_intent(req, &dimmer, |d| intent(d, &uri))
    })?;
    Ok(())
}

fn write_intent<T>(req: HttpRequest<'_, '_>, dimmer: &SharedDimmer, intent: T) -> anyhow::Result<()>
where
    T: FnOnce(&mut EspDimmer) -> Result<bool, String>,
{
    let outcome = {
        let mut dimmer = dimmer.lock().unwrap();
        intent(&mut *dimmer).map(|changed| IntentResponse {
            changed,
            status: dimmer.status(),
        })
    };
    match outcome {
        Ok(body) => write_json(req, &body),
        Err(message) => write_error(req, 400, &message),
    }
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    write_json_with_status(req, 200, payload)
}

fn write_json_with_status<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    write_json_with_status(req, status_code, &payload)
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(percent_decode(value));
        }
    }

    None
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let hex = |b: u8| char::from(b).to_digit(16);
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'+' => out.push(b' '),
            b'%' if idx + 2 < bytes.len() => match (hex(bytes[idx + 1]), hex(bytes[idx + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push((hi * 16 + lo) as u8);
                    idx += 2;
                }
                _ => out.push(b'%'),
            },
            other => out.push(other),
        }
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn mac_param(uri: &str) -> Option<MacAddress> {
    query_param(uri, "mac")?.parse().ok()
}

fn int_param(uri: &str, key: &str) -> Result<i32, String> {
    query_param(uri, key)
        .ok_or_else(|| format!("Missing '{key}' parameter"))?
        .trim()
        .parse()
        .map_err(|_| format!("Invalid '{key}' parameter"))
}

fn flag_param(uri: &str, key: &str) -> bool {
    query_param(uri, key).is_some_and(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

fn connect_wifi(
    modem: WifiModem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    runtime: &RuntimeConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let network = &runtime.network;
    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);
    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

/// [`KeyValueStore`] over the default NVS partition. Each call opens its
/// namespace handle and commits before returning.
struct NvsKvStore {
    partition: EspDefaultNvsPartition,
}

impl NvsKvStore {
    fn open(&self, namespace: &str) -> Result<EspNvs<NvsDefault>, EspError> {
        EspNvs::new(self.partition.clone(), namespace, true)
    }
}

impl KeyValueStore for NvsKvStore {
    type Error = EspError;

    fn get_u8(&mut self, namespace: &str, key: &str) -> Result<Option<u8>, EspError> {
        self.open(namespace)?.get_u8(key)
    }

    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), EspError> {
        self.open(namespace)?.set_u8(key, value)
    }

    fn get_str(&mut self, namespace: &str, key: &str) -> Result<Option<String>, EspError> {
        let nvs = self.open(namespace)?;
        let mut buffer = vec![0_u8; MAX_NVS_STR];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), EspError> {
        self.open(namespace)?.set_str(key, value)
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), EspError> {
        self.open(namespace)?.remove(key)?;
        Ok(())
    }
}
