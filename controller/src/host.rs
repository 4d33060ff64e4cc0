use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use dimmer_common::{
    event_channel, packet, BtTransport, ControlRequest, Dimmer, DimmerStatus, DiscoveredDevice,
    KeyValueStore, LightMode, MacAddress, MemoryStore, RuntimeConfig, ScanOutcome, SystemClock,
    TransportEventSink,
};

type HostDimmer = Dimmer<SimulatedRadio, FileKvStore, SystemClock>;

const POLL_INTERVAL_MS: u64 = 50;
const SIM_LINK_LATENCY_MS: u64 = 300;
const SIM_INQUIRY_MS: u64 = 1_500;
const DEFAULT_SIM_DEVICES: &str =
    "C9:A3:05:36:C4:72=Living Room;C9:A3:05:36:C4:73=Bedroom;4A:10:22:01:02:03=Soundbar";

#[derive(Clone)]
struct AppState {
    dimmer: Arc<Mutex<HostDimmer>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

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

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("DIMMER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.dimmer"));

    let mut runtime = load_runtime_config(&data_dir.join("runtime.json")).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    runtime.dimmer.sanitize();

    let kv = FileKvStore::open(data_dir.join("nvs.json")).context("failed to open device store")?;
    let fixtures = std::env::var("DIMMER_SIM_DEVICES")
        .map(|raw| parse_sim_devices(&raw))
        .unwrap_or_else(|_| parse_sim_devices(DEFAULT_SIM_DEVICES));
    info!(
        "radio `{}` simulating {} nearby device(s)",
        runtime.radio_name,
        fixtures.len()
    );

    let (sink, events) = event_channel();
    let radio = SimulatedRadio::new(sink, fixtures);
    let dimmer = Dimmer::new(radio, events, kv, SystemClock, runtime.dimmer.clone());

    let app_state = AppState {
        dimmer: Arc::new(Mutex::new(dimmer)),
    };
    spawn_poll_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/devices", get(handle_get_devices))
        .route("/api/devices/add", post(handle_add_device))
        .route("/api/devices/remove", post(handle_remove_device))
        .route("/api/devices/select", post(handle_select_device))
        .route("/api/control", post(handle_control))
        .route("/api/light/on", post(handle_light_on))
        .route("/api/light/off", post(handle_light_off))
        .route("/api/light/toggle", post(handle_light_toggle))
        .route("/api/light/brightness", post(handle_light_brightness))
        .route("/api/light/brightness/up", post(handle_light_brightness_up))
        .route("/api/light/brightness/down", post(handle_light_brightness_down))
        .route("/api/light/warmth", post(handle_light_warmth))
        .route("/api/light/warmth/cycle", post(handle_light_warmth_cycle))
        .route("/api/light/hue", post(handle_light_hue))
        .route("/api/light/hue/rotate", post(handle_light_hue_rotate))
        .route("/api/light/mode", post(handle_light_mode))
        .route("/api/light/mode/switch", post(handle_light_mode_switch))
        .route("/api/fan/speed", post(handle_fan_speed))
        .route("/api/fan/up", post(handle_fan_up))
        .route("/api/fan/down", post(handle_fan_down))
        .route("/api/scan", get(handle_get_scan).post(handle_post_scan))
        .route("/api/disconnect", post(handle_disconnect))
        .with_state(app_state);

    let port = std::env::var("DIMMER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind dimmer server at {addr}"))?;

    info!("dimmer listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_runtime_config(path: &PathBuf) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn spawn_poll_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
        loop {
            interval.tick().await;
            if let Err(err) = with_dimmer(&app_state, |dimmer| dimmer.tick()).await {
                warn!("poll tick failed: {err:#}");
            }
        }
    });
}

/// Runs `f` against the dimmer on the blocking pool; sends sleep to honour
/// the link's inter-command spacing.
async fn with_dimmer<R, F>(state: &AppState, f: F) -> anyhow::Result<R>
where
    F: FnOnce(&mut HostDimmer) -> R + Send + 'static,
    R: Send + 'static,
{
    let dimmer = state.dimmer.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = dimmer
            .lock()
            .map_err(|_| anyhow!("dimmer state poisoned"))?;
        Ok(f(&mut *guard))
    })
    .await?
}

async fn intent_response<F>(state: AppState, intent: F) -> Response
where
    F: FnOnce(&mut HostDimmer) -> bool + Send + 'static,
{
    let result = with_dimmer(&state, move |dimmer| {
        let changed = intent(&mut *dimmer);
        (changed, dimmer.status())
    })
    .await;

    match result {
        Ok((changed, status)) => Json(IntentResponse { changed, status }).into_response(),
        Err(err) => unavailable(err),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    match with_dimmer(&state, |dimmer| dimmer.status()).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => unavailable(err),
    }
}

async fn handle_get_devices(State(state): State<AppState>) -> Response {
    match with_dimmer(&state, |dimmer| dimmer.devices()).await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => unavailable(err),
    }
}

async fn handle_add_device(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let mac: MacAddress = required_param(&params, "mac")?;
    let name = params.get("name").cloned().unwrap_or_default();
    let added = with_dimmer(&state, move |dimmer| dimmer.add_device(mac, &name))
        .await
        .map_err(unavailable)?;
    if !added {
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save device",
        ));
    }
    Ok(handle_get_devices(State(state)).await)
}

async fn handle_remove_device(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let mac: MacAddress = required_param(&params, "mac")?;
    let removed = with_dimmer(&state, move |dimmer| {
        dimmer
            .device_config(mac)
            .map(|_| dimmer.remove_device(mac))
    })
    .await
    .map_err(unavailable)?;
    match removed {
        None => return Err(error_response(StatusCode::NOT_FOUND, "Unknown device")),
        Some(false) => {
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to remove device",
            ))
        }
        Some(true) => {}
    }
    Ok(handle_get_devices(State(state)).await)
}

async fn handle_select_device(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let mac: MacAddress = required_param(&params, "mac")?;
    Ok(intent_response(state, move |dimmer| dimmer.select_device(mac)).await)
}

async fn handle_control(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let request = parse_control(&params)?;
    Ok(intent_response(state, move |dimmer| dimmer.control(&request)).await)
}

async fn handle_light_on(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.turn_light_on()).await
}

async fn handle_light_off(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.turn_light_off()).await
}

async fn handle_light_toggle(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.toggle_light()).await
}

async fn handle_light_brightness(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let value: i32 = required_param(&params, "value")?;
    let force = flag_param(&params, "force");
    Ok(intent_response(state, move |dimmer| dimmer.set_brightness(value, force)).await)
}

async fn handle_light_brightness_up(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.increase_brightness()).await
}

async fn handle_light_brightness_down(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.decrease_brightness()).await
}

async fn handle_light_warmth(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let value: i32 = required_param(&params, "value")?;
    let force = flag_param(&params, "force");
    Ok(intent_response(state, move |dimmer| dimmer.set_warmth(value, force)).await)
}

async fn handle_light_warmth_cycle(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.change_warmth()).await
}

async fn handle_light_hue(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let value: i32 = required_param(&params, "value")?;
    let force = flag_param(&params, "force");
    Ok(intent_response(state, move |dimmer| dimmer.set_hue(value, force)).await)
}

async fn handle_light_hue_rotate(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.rotate_hue()).await
}

async fn handle_light_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let mode: LightMode = required_param(&params, "value")?;
    Ok(intent_response(state, move |dimmer| dimmer.set_light_mode(mode)).await)
}

async fn handle_light_mode_switch(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.switch_mode()).await
}

async fn handle_fan_speed(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let value: i32 = required_param(&params, "value")?;
    let force = flag_param(&params, "force");
    Ok(intent_response(state, move |dimmer| dimmer.set_fan_speed(value, force)).await)
}

async fn handle_fan_up(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.increase_fan_speed()).await
}

async fn handle_fan_down(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.decrease_fan_speed()).await
}

async fn handle_get_scan(State(state): State<AppState>) -> Response {
    match with_dimmer(&state, |dimmer| dimmer.last_scan().to_vec()).await {
        Ok(devices) => Json(ScanResponse {
            deferred: false,
            devices,
        })
        .into_response(),
        Err(err) => unavailable(err),
    }
}

async fn handle_post_scan(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let timeout_ms: Option<u64> = optional_param(&params, "timeoutMs")?;
    let outcome = with_dimmer(&state, move |dimmer| dimmer.scan(timeout_ms))
        .await
        .map_err(unavailable)?;

    Ok(match outcome {
        ScanOutcome::Completed(devices) => Json(ScanResponse {
            deferred: false,
            devices,
        })
        .into_response(),
        ScanOutcome::Deferred => (
            StatusCode::ACCEPTED,
            Json(ScanResponse {
                deferred: true,
                devices: Vec::new(),
            }),
        )
            .into_response(),
    })
}

async fn handle_disconnect(State(state): State<AppState>) -> Response {
    intent_response(state, |dimmer| dimmer.disconnect()).await
}

fn parse_control(params: &HashMap<String, String>) -> Result<ControlRequest, Response> {
    ControlRequest::from_params(|key| params.get(key).cloned())
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &err))
}

fn optional_param<T: FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, Response> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            error_response(StatusCode::BAD_REQUEST, &format!("Invalid '{key}' parameter"))
        }),
    }
}

fn required_param<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<T, Response> {
    optional_param(params, key)?.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, &format!("Missing '{key}' parameter"))
    })
}

fn flag_param(params: &HashMap<String, String>, key: &str) -> bool {
    params
        .get(key)
        .is_some_and(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

fn parse_sim_devices(raw: &str) -> Vec<DiscoveredDevice> {
    raw.split(';')
        .filter_map(|entry| {
            let (mac, name) = entry.split_once('=').unwrap_or((entry, "Unnamed"));
            match mac.parse::<MacAddress>() {
                Ok(address) => Some(DiscoveredDevice {
                    name: name.trim().to_string(),
                    address,
                }),
                Err(err) => {
                    if !entry.trim().is_empty() {
                        warn!("ignoring simulated device `{entry}`: {err}");
                    }
                    None
                }
            }
        })
        .collect()
}

fn unavailable(err: anyhow::Error) -> Response {
    warn!("dimmer request failed: {err:#}");
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Dimmer unavailable")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, thiserror::Error)]
enum SimError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to spawn radio worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Stand-in radio for running off-target. Connections complete after a
/// short delay on a worker thread, and frames are logged instead of sent.
struct SimulatedRadio {
    sink: TransportEventSink,
    fixtures: Vec<DiscoveredDevice>,
    connected: Arc<Mutex<Option<MacAddress>>>,
}

impl SimulatedRadio {
    fn new(sink: TransportEventSink, fixtures: Vec<DiscoveredDevice>) -> Self {
        Self {
            sink,
            fixtures,
            connected: Arc::new(Mutex::new(None)),
        }
    }

    fn after_latency<F>(&self, name: &str, f: F) -> Result<(), SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new().name(name.into()).spawn(move || {
            thread::sleep(Duration::from_millis(SIM_LINK_LATENCY_MS));
            f();
        })?;
        Ok(())
    }
}

impl BtTransport for SimulatedRadio {
    type Error = SimError;

    fn connect(&mut self, mac: MacAddress) -> Result<(), SimError> {
        let sink = self.sink.clone();
        let connected = self.connected.clone();
        let in_range = self.fixtures.iter().any(|device| device.address == mac);
        self.after_latency("sim-connect", move || {
            if in_range {
                *connected.lock().unwrap_or_else(PoisonError::into_inner) = Some(mac);
                sink.connected(mac);
            } else {
                sink.disconnected();
            }
        })
    }

    fn disconnect(&mut self) -> Result<(), SimError> {
        let previous = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_none() {
            return Ok(());
        }
        let sink = self.sink.clone();
        self.after_latency("sim-disconnect", move || sink.disconnected())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), SimError> {
        let target = *self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mac = target.ok_or(SimError::NotConnected)?;
        info!("sim {mac} <- [{}]", packet::to_hex(frame));
        Ok(())
    }

    fn discover(&mut self, timeout_ms: u64) -> Result<Vec<DiscoveredDevice>, SimError> {
        thread::sleep(Duration::from_millis(timeout_ms.min(SIM_INQUIRY_MS)));
        Ok(self.fixtures.clone())
    }
}

#[derive(Debug, thiserror::Error)]
enum FileStoreError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// NVS stand-in: an in-memory image mirrored to a JSON file on every write.
struct FileKvStore {
    path: PathBuf,
    image: MemoryStore,
}

impl FileKvStore {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let image = match std::fs::read(&path) {
            Ok(raw) => MemoryStore::from_json(&raw)
                .with_context(|| format!("corrupt store file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => MemoryStore::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, image })
    }

    fn persist(&self) -> Result<(), FileStoreError> {
        let io_err = |source| FileStoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let payload = self.image.to_json()?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload).map_err(io_err)?;
        std::fs::rename(&staging, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyValueStore for FileKvStore {
    type Error = FileStoreError;

    fn get_u8(&mut self, namespace: &str, key: &str) -> Result<Option<u8>, FileStoreError> {
        let Ok(value) = self.image.get_u8(namespace, key);
        Ok(value)
    }

    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), FileStoreError> {
        let Ok(()) = self.image.set_u8(namespace, key, value);
        self.persist()
    }

    fn get_str(&mut self, namespace: &str, key: &str) -> Result<Option<String>, FileStoreError> {
        let Ok(value) = self.image.get_str(namespace, key);
        Ok(value)
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), FileStoreError> {
        let Ok(()) = self.image.set_str(namespace, key, value);
        self.persist()
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), FileStoreError> {
        let Ok(()) = self.image.remove(namespace, key);
        self.persist()
    }
}
