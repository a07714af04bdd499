use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use templogger_common::{
    channel, parse_mac,
    sensors::{conversion_time_ms, RomCode, SensorBus},
    web::Method as RouteMethod,
    AssociationError, BlobStore, BootOutcome, BootSequence, Clock, ClockSync, ConnectionFields,
    ControlHandle, ControlLoop, HttpResponse, HttpTransport, InfluxClientFactory, Logger,
    NetworkAssociator, PostAction, Route, StatusIndicator, StoreError, WebReply, RESTART_DELAY,
};

const DEFAULT_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xAB, 0xCD, 0xEF];
const DEFAULT_SIM_SENSORS: usize = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const REBOOT_GRACE: Duration = Duration::from_millis(500);

struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    mac: [u8; 6],
    sim_sensors: usize,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("LOGGER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.templogger"));
        let http_port = std::env::var("LOGGER_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);
        let mac = match std::env::var("LOGGER_MAC") {
            Ok(text) => parse_mac(&text).unwrap_or_else(|| {
                warn!("LOGGER_MAC `{text}` is not a MAC address; using the default");
                DEFAULT_MAC
            }),
            Err(_) => DEFAULT_MAC,
        };
        let sim_sensors = std::env::var("SIM_SENSORS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_SIM_SENSORS);

        Self {
            data_dir,
            http_port,
            mac,
            sim_sensors,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "templogger=info,templogger_common=info,tower_http=info".into()
            }),
        )
        .init();

    let settings = HostSettings::from_env();
    let mut network = HostNetwork::new(settings.data_dir.join("wifi.json"));

    loop {
        let (action, returned) = run_once(&settings, network).await?;
        network = returned;

        if action == PostAction::ResetWifiAndRestart {
            network.reset_credentials();
        }
        info!("restarting logger");
    }
}

/// One boot-to-restart lifetime of the logger.
async fn run_once(
    settings: &HostSettings,
    network: HostNetwork,
) -> anyhow::Result<(PostAction, HostNetwork)> {
    let store = FileStore::new(settings.data_dir.join("config.json"));
    let mac = settings.mac;
    let (outcome, network) = tokio::task::spawn_blocking(move || {
        let mut network = network;
        let mut clock = SystemClockSync;
        let outcome = BootSequence::new(store, &mut network, &mut clock, mac).run();
        (outcome, network)
    })
    .await
    .context("boot task panicked")?;

    let report = match outcome {
        BootOutcome::Ready(report) => report,
        BootOutcome::Restart(err) => {
            warn!("boot failed: {err}; restarting in {}s", RESTART_DELAY.as_secs());
            tokio::time::sleep(RESTART_DELAY).await;
            return Ok((PostAction::Restart, network));
        }
    };

    let (handle, requests) = channel();
    let (done_tx, done_rx) = oneshot::channel();
    let sim_sensors = settings.sim_sensors;

    // reqwest's blocking client must live outside the async runtime.
    thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || {
            let transport = match ReqwestTransport::new() {
                Ok(transport) => transport,
                Err(err) => {
                    warn!("http client unavailable: {err:#}");
                    let _ = done_tx.send(PostAction::Restart);
                    return;
                }
            };
            let logger = Logger::new(
                report.config,
                report.store,
                InfluxClientFactory::new(transport),
                SimulatedBus::new(sim_sensors),
            );
            let control = ControlLoop::new(logger, requests, LogIndicator, HostClock::new());
            let _ = done_tx.send(control.run());
        })
        .context("failed to spawn control loop thread")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind logger server at {addr}"))?;
    info!("logger listening on http://{addr}");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, build_router(handle))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let action = done_rx.await.context("control loop exited unexpectedly")?;
    tokio::time::sleep(REBOOT_GRACE).await;
    let _ = stop_tx.send(());
    server
        .await
        .context("server task panicked")?
        .context("logger server failed")?;

    Ok((action, network))
}

fn build_router(handle: ControlHandle) -> Router {
    let mut router = Router::new();
    for route in Route::ALL {
        let handler = move |State(handle): State<ControlHandle>, body: Bytes| async move {
            dispatch(handle, route, body).await
        };
        router = match route.method() {
            RouteMethod::Get => router.route(route.path(), get(handler)),
            RouteMethod::Post => router.route(route.path(), post(handler)),
        };
    }
    router
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

async fn dispatch(handle: ControlHandle, route: Route, body: Bytes) -> Response {
    let request = match route.decode(&body) {
        Ok(request) => request,
        Err(reply) => return into_response(reply),
    };

    let reply = tokio::task::spawn_blocking(move || handle.call(request))
        .await
        .unwrap_or_else(|err| WebReply::text(500, format!("request task failed: {err}")));
    into_response(reply)
}

fn into_response(reply: WebReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, reply.content_type)],
        reply.body,
    )
        .into_response();
    if let Some(location) = reply.location {
        response
            .headers_mut()
            .insert(header::LOCATION, HeaderValue::from_static(location));
    }
    response
}

struct FileStore {
    path: PathBuf,
}

impl FileStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BlobStore for FileStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Read(format!("{}: {err}", self.path.display()))),
        }
    }

    fn write(&mut self, blob: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::Write(format!("{}: {err}", parent.display())))?;
        }
        std::fs::write(&self.path, blob)
            .map_err(|err| StoreError::Write(format!("{}: {err}", self.path.display())))
    }
}

/// Stand-in for Wi-Fi on a workstation. "Joining" succeeds once the portal
/// has run; the portal itself takes its answers from `INFLUX_*` variables.
struct HostNetwork {
    credentials_path: PathBuf,
}

impl HostNetwork {
    fn new(credentials_path: PathBuf) -> Self {
        Self { credentials_path }
    }
}

impl NetworkAssociator for HostNetwork {
    fn auto_connect(&mut self, _timeout: Duration) -> bool {
        self.credentials_path.exists()
    }

    fn run_portal(
        &mut self,
        seed: &ConnectionFields,
    ) -> Result<ConnectionFields, AssociationError> {
        let mut fields = seed.clone();
        let overrides = [
            ("INFLUX_URL", &mut fields.url),
            ("INFLUX_TOKEN", &mut fields.token),
            ("INFLUX_ORG", &mut fields.org),
            ("INFLUX_BUCKET", &mut fields.bucket),
        ];
        for (key, field) in overrides {
            if let Ok(value) = std::env::var(key) {
                *field = value;
            }
        }
        if fields.org.trim().is_empty() || fields.token.trim().is_empty() {
            warn!("portal: INFLUX_ORG/INFLUX_TOKEN not set; uploads stay disabled");
        }

        if let Some(parent) = self.credentials_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| AssociationError::Portal(err.to_string()))?;
        }
        std::fs::write(&self.credentials_path, br#"{"ssid":"host"}"#)
            .map_err(|err| AssociationError::Portal(err.to_string()))?;
        info!("portal: settings taken from the environment");
        Ok(fields)
    }

    fn reset_credentials(&mut self) {
        match std::fs::remove_file(&self.credentials_path) {
            Ok(()) => info!("wifi credentials cleared"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to clear wifi credentials: {err}"),
        }
    }
}

struct SystemClockSync;

impl ClockSync for SystemClockSync {
    fn sync(&mut self) -> bool {
        true
    }
}

struct HostClock {
    started: Instant,
}

impl HostClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for HostClock {
    fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn epoch_ms(&self) -> Option<i64> {
        Some(chrono::Utc::now().timestamp_millis())
    }
}

struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn signal_success(&mut self) {
        info!("status: upload ok");
    }

    fn signal_failure(&mut self) {
        warn!("status: upload failed");
    }
}

#[derive(Clone)]
struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<HttpResponse, String> {
        let response = request.send().map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Ok(HttpResponse { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, String> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request)
    }

    fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, String> {
        let mut request = self.client.post(url).body(body.to_vec());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request)
    }
}

/// Probes with fixed ROM codes and slowly drifting temperatures.
struct SimulatedBus {
    count: usize,
    resolution: u8,
    conversions: u64,
}

impl SimulatedBus {
    fn new(count: usize) -> Self {
        Self {
            count,
            resolution: 12,
            conversions: 0,
        }
    }
}

impl SensorBus for SimulatedBus {
    fn device_count(&mut self) -> usize {
        self.count
    }

    fn address(&mut self, index: usize) -> Option<RomCode> {
        (index < self.count).then(|| RomCode([0x28, 0xFF, 0x64, 0x1E, 0x00, 0x00, index as u8, 0xA0]))
    }

    fn set_resolution(&mut self, bits: u8) {
        self.resolution = bits;
    }

    fn request_conversion(&mut self) {
        thread::sleep(Duration::from_millis(conversion_time_ms(self.resolution)));
        self.conversions += 1;
    }

    fn read_celsius(&mut self, address: &RomCode) -> f32 {
        let index = address.0[6] as f32;
        let drift = (self.conversions % 20) as f32 * 0.05;
        20.0 + index * 1.5 + drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("templogger-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_store_reports_missing_blob() {
        let mut store = FileStore::new(scratch_dir("missing").join("config.json"));

        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn file_store_round_trips_blob() {
        let dir = scratch_dir("store");
        let mut store = FileStore::new(dir.join("nested").join("config.json"));

        store.write(b"{\"mode\":\"identify\"}").unwrap();

        assert_eq!(store.read().unwrap().as_deref(), Some(&b"{\"mode\":\"identify\"}"[..]));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn host_network_joins_after_portal_and_forgets_on_reset() {
        let dir = scratch_dir("network");
        let mut network = HostNetwork::new(dir.join("wifi.json"));
        assert!(!network.auto_connect(Duration::ZERO));

        network.run_portal(&ConnectionFields::default()).unwrap();
        assert!(network.auto_connect(Duration::ZERO));

        network.reset_credentials();
        assert!(!network.auto_connect(Duration::ZERO));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn simulated_bus_exposes_configured_probes() {
        let mut bus = SimulatedBus::new(2);
        bus.set_resolution(9);

        assert_eq!(bus.device_count(), 2);
        assert!(bus.address(2).is_none());
        let second = bus.address(1).unwrap();
        bus.request_conversion();
        assert!((bus.read_celsius(&second) - 21.55).abs() < 1e-4);
    }
}
