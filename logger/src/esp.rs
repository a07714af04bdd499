use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use templogger_common::{
    channel, derive_device_id,
    control::Step,
    pages::render_portal_page,
    sensors::{newly_attached, RomCode, SensorBus, DISCONNECTED_C},
    web::Method as RouteMethod,
    AssociationError, BlobStore, BootOutcome, BootSequence, Clock, ClockSync, ConnectionFields,
    ControlHandle, ControlLoop, HttpResponse, HttpTransport, InfluxClientFactory, Logger,
    NetworkAssociator, PortalSubmission, PostAction, Route, StatusIndicator, StoreError, WebReply,
    AUTO_CONNECT_TIMEOUT, MAX_SENSORS, RESTART_DELAY,
};

const NVS_NAMESPACE: &str = "templogger";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_WIFI_SSID_KEY: &str = "wifi_ssid";
const NVS_WIFI_PASS_KEY: &str = "wifi_pass";
const MAX_CONFIG_BLOB: usize = 4096;

const ONE_WIRE_PIN: i32 = 4;
const STATUS_LED_PIN: i32 = 2;

const PROVISIONING_AP_SSID: &str = "TempLogger-Setup";
const PROVISIONING_AP_PASSWORD: &str = "templogger";
const PORTAL_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_HTTP_BODY: usize = 4096;
const MAX_RESPONSE_BODY: usize = 1024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const SNTP_WAIT: Duration = Duration::from_secs(15);
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_RETRY_DELAY: Duration = Duration::from_secs(3);
const REBOOT_GRACE: Duration = Duration::from_millis(500);
/// 2024-01-01T00:00:00Z; anything earlier means SNTP has not run.
const MIN_VALID_EPOCH_MS: i64 = 1_704_067_200_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore::new(nvs_partition.clone());

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let bus = Ds18b20Bus::new(pins.gpio4.downgrade()).context("failed to initialize one-wire bus")?;
    let indicator = LedIndicator::new(pins.gpio2.downgrade_output());

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut network = EspNetwork::new(esp_wifi, sys_loop, nvs_store.clone())?;
    let mut clock_sync = SntpSync::default();
    let mac = network.mac;

    let report = match BootSequence::new(nvs_store, &mut network, &mut clock_sync, mac).run() {
        BootOutcome::Ready(report) => report,
        BootOutcome::Restart(err) => {
            warn!("boot failed: {err}; restarting in {}s", RESTART_DELAY.as_secs());
            thread::sleep(RESTART_DELAY);
            restart();
        }
    };
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let (handle, requests) = channel();
    let _server = create_http_server(handle)?;

    let logger = Logger::new(
        report.config,
        report.store,
        InfluxClientFactory::new(EspTransport),
        bus,
    );
    let mut control = ControlLoop::new(logger, requests, indicator, EspClock::new());

    let mut wifi_disconnected_since: Option<Instant> = None;
    let action = loop {
        feed_watchdog();
        maintain_wifi_health(&mut wifi_disconnected_since);
        if let Step::Stop(action) = control.step() {
            break action;
        }
    };

    thread::sleep(REBOOT_GRACE);
    if action == PostAction::ResetWifiAndRestart {
        network.reset_credentials();
    }
    restart();
}

fn restart() -> ! {
    info!("restarting");
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn create_http_server(handle: ControlHandle) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for route in Route::ALL {
        let handle = handle.clone();
        let method = match route.method() {
            RouteMethod::Get => Method::Get,
            RouteMethod::Post => Method::Post,
        };
        server.fn_handler::<anyhow::Error, _>(route.path(), method, move |mut req| {
            let body = read_request_body(&mut req)?;
            let reply = match route.decode(&body) {
                Ok(request) => handle.call(request),
                Err(reply) => reply,
            };
            write_reply(req, &reply)
        })?;
    }

    Ok(server)
}

fn create_portal_server(
    device_id: &str,
    seed: &ConnectionFields,
    submissions: mpsc::Sender<PortalSubmission>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    let html = render_portal_page(device_id, seed);

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        let html = html.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            write_reply(req, &WebReply::html(html.clone()))
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/portal", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let submission: PortalSubmission = match serde_json::from_slice(&body) {
            Ok(submission) => submission,
            Err(err) => return write_reply(req, &WebReply::text(400, format!("invalid form: {err}"))),
        };
        if let Err(message) = submission.validate() {
            return write_reply(req, &WebReply::text(400, message));
        }

        let reply = if submissions.send(submission).is_ok() {
            WebReply::text(200, "saved; joining network")
        } else {
            WebReply::text(409, "portal already closed")
        };
        write_reply(req, &reply)
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    reply: &WebReply,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", reply.content_type)];
    if let Some(location) = reply.location {
        headers.push(("Location", location));
    }
    req.into_response(reply.status, None, &headers)?
        .write_all(reply.body.as_bytes())?;
    Ok(())
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }

    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NVS_NAMESPACE}`"))
    }

    fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; MAX_CONFIG_BLOB];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn set_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut nvs = self.open()?;
        nvs.set_str(key, value)?;
        Ok(())
    }

    fn load_wifi_credentials(&self) -> Option<WifiCredentials> {
        let stored = self
            .get_string(NVS_WIFI_SSID_KEY)
            .and_then(|ssid| Ok((ssid, self.get_string(NVS_WIFI_PASS_KEY)?)));
        match stored {
            Ok((Some(ssid), pass)) if !ssid.trim().is_empty() => Some(WifiCredentials {
                ssid,
                pass: pass.unwrap_or_default(),
            }),
            Ok(_) => option_env!("WIFI_SSID").map(|ssid| WifiCredentials {
                ssid: ssid.to_string(),
                pass: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
            }),
            Err(err) => {
                warn!("failed to load wifi credentials: {err:#}");
                None
            }
        }
    }

    fn save_wifi_credentials(&self, credentials: &WifiCredentials) -> anyhow::Result<()> {
        self.set_string(NVS_WIFI_SSID_KEY, &credentials.ssid)?;
        self.set_string(NVS_WIFI_PASS_KEY, &credentials.pass)
    }

    fn clear_wifi_credentials(&self) -> anyhow::Result<()> {
        let mut nvs = self.open()?;
        nvs.remove(NVS_WIFI_SSID_KEY)?;
        nvs.remove(NVS_WIFI_PASS_KEY)?;
        Ok(())
    }
}

impl BlobStore for NvsStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_string(NVS_CONFIG_KEY)
            .map(|value| value.map(String::into_bytes))
            .map_err(|err| StoreError::Read(format!("{err:#}")))
    }

    fn write(&mut self, blob: &[u8]) -> Result<(), StoreError> {
        let text = std::str::from_utf8(blob).map_err(|err| StoreError::Write(err.to_string()))?;
        self.set_string(NVS_CONFIG_KEY, text)
            .map_err(|err| StoreError::Write(format!("{err:#}")))
    }
}

struct WifiCredentials {
    ssid: String,
    pass: String,
}

struct EspNetwork {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    nvs: NvsStore,
    mac: [u8; 6],
}

impl EspNetwork {
    fn new(wifi: EspWifi<'static>, sys_loop: EspSystemEventLoop, nvs: NvsStore) -> anyhow::Result<Self> {
        let mac = wifi
            .sta_netif()
            .get_mac()
            .context("failed to read station MAC")?;
        Ok(Self {
            wifi,
            sys_loop,
            nvs,
            mac,
        })
    }

    fn join(&mut self, credentials: &WifiCredentials, timeout: Duration) -> anyhow::Result<()> {
        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        if wifi.is_started()? {
            let _ = wifi.stop();
        }

        let auth_method = if credentials.pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: credentials
                .pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        info!("wifi started, connecting to `{}`", credentials.ssid);

        let deadline = Instant::now() + timeout;
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect attempt {attempt} failed: {err:#}");
                    let _ = wifi.disconnect();
                    if Instant::now() + WIFI_RETRY_DELAY >= deadline {
                        return Err(anyhow::Error::from(err).context("wifi connect timed out"));
                    }
                    thread::sleep(WIFI_RETRY_DELAY);
                }
            }
        }
    }

    fn start_provisioning_ap(&mut self) -> anyhow::Result<()> {
        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        if wifi.is_started()? {
            let _ = wifi.stop();
        }
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: PROVISIONING_AP_SSID
                .try_into()
                .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
            password: PROVISIONING_AP_PASSWORD
                .try_into()
                .map_err(|_| anyhow!("provisioning AP password too long"))?,
            auth_method: AuthMethod::WPAWPA2Personal,
            channel: 1,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.wait_netif_up()?;
        info!(
            "provisioning AP started on `{}` (password: `{}`)",
            PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
        );
        Ok(())
    }
}

impl NetworkAssociator for EspNetwork {
    fn auto_connect(&mut self, timeout: Duration) -> bool {
        let Some(credentials) = self.nvs.load_wifi_credentials() else {
            warn!("no stored wifi credentials");
            return false;
        };
        match self.join(&credentials, timeout) {
            Ok(()) => true,
            Err(err) => {
                warn!("wifi auto-connect failed: {err:#}");
                false
            }
        }
    }

    fn run_portal(
        &mut self,
        seed: &ConnectionFields,
    ) -> Result<ConnectionFields, AssociationError> {
        self.start_provisioning_ap()
            .map_err(|err| AssociationError::Portal(format!("{err:#}")))?;

        let (tx, rx) = mpsc::channel();
        let server = create_portal_server(&derive_device_id(&self.mac), seed, tx)
            .map_err(|err| AssociationError::Portal(format!("{err:#}")))?;

        let submission = rx
            .recv_timeout(PORTAL_TIMEOUT)
            .map_err(|_| AssociationError::Portal("no settings submitted".to_string()))?;
        // Let the browser receive the acknowledgement before the AP goes away.
        thread::sleep(REBOOT_GRACE);
        drop(server);

        let credentials = WifiCredentials {
            ssid: submission.wifi_ssid.trim().to_string(),
            pass: submission.wifi_pass.clone(),
        };
        self.join(&credentials, AUTO_CONNECT_TIMEOUT)
            .map_err(|err| AssociationError::Network(format!("{err:#}")))?;
        if let Err(err) = self.nvs.save_wifi_credentials(&credentials) {
            warn!("wifi credentials not persisted: {err:#}");
        }

        Ok(submission.merged_fields(seed))
    }

    fn reset_credentials(&mut self) {
        match self.nvs.clear_wifi_credentials() {
            Ok(()) => info!("wifi credentials cleared"),
            Err(err) => warn!("failed to clear wifi credentials: {err:#}"),
        }
    }
}

#[derive(Default)]
struct SntpSync {
    sntp: Option<EspSntp<'static>>,
}

impl ClockSync for SntpSync {
    fn sync(&mut self) -> bool {
        let sntp = match EspSntp::new_default() {
            Ok(sntp) => self.sntp.insert(sntp),
            Err(err) => {
                warn!("failed to start SNTP: {err:?}");
                return false;
            }
        };

        let deadline = Instant::now() + SNTP_WAIT;
        while Instant::now() < deadline {
            if sntp.get_sync_status() == SyncStatus::Completed {
                info!("SNTP synchronised");
                return true;
            }
            thread::sleep(Duration::from_millis(250));
        }
        false
    }
}

struct EspClock {
    started: Instant,
}

impl EspClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for EspClock {
    fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn epoch_ms(&self) -> Option<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        (now >= MIN_VALID_EPOCH_MS).then_some(now)
    }
}

struct LedIndicator {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl LedIndicator {
    fn new(pin: AnyOutputPin) -> Self {
        match PinDriver::output(pin) {
            Ok(mut pin) => {
                let _ = pin.set_low();
                Self { pin: Some(pin) }
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{STATUS_LED_PIN}: {err}");
                Self { pin: None }
            }
        }
    }

    fn blink(&mut self, times: u32, on_ms: u64, off_ms: u64) {
        let Some(pin) = self.pin.as_mut() else {
            return;
        };
        for _ in 0..times {
            let _ = pin.set_high();
            thread::sleep(Duration::from_millis(on_ms));
            let _ = pin.set_low();
            thread::sleep(Duration::from_millis(off_ms));
        }
    }
}

impl StatusIndicator for LedIndicator {
    fn signal_success(&mut self) {
        self.blink(1, 400, 100);
    }

    fn signal_failure(&mut self) {
        self.blink(3, 100, 100);
    }
}

#[derive(Clone)]
struct EspTransport;

impl EspTransport {
    fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> anyhow::Result<HttpResponse> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

        let content_length = body.map(|body| body.len().to_string());
        let mut all_headers = headers.to_vec();
        if let Some(length) = content_length.as_deref() {
            all_headers.push(("Content-Length", length));
        }

        let mut request = client.request(method, url, &all_headers)?;
        if let Some(body) = body {
            request.write_all(body).map_err(|e| anyhow!("{e:?}"))?;
            request.flush().map_err(|e| anyhow!("{e:?}"))?;
        }
        let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
        let status = response.status();

        let mut collected = Vec::new();
        let mut chunk = [0_u8; 256];
        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                break;
            }
            if collected.len() < MAX_RESPONSE_BODY {
                collected.extend_from_slice(&chunk[..read]);
            }
        }

        Ok(HttpResponse {
            status,
            body: String::from_utf8_lossy(&collected).into_owned(),
        })
    }
}

impl HttpTransport for EspTransport {
    fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, String> {
        self.execute(Method::Get, url, headers, None)
            .map_err(|err| format!("{err:#}"))
    }

    fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, String> {
        self.execute(Method::Post, url, headers, Some(body))
            .map_err(|err| format!("{err:#}"))
    }
}

/// DS18B20 probes on one one-wire line, in scan order.
struct Ds18b20Bus {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
    addresses: Vec<Address>,
    resolution: Resolution,
}

impl Ds18b20Bus {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut bus = Self {
            one_wire,
            delay: Ets,
            addresses: Vec::new(),
            resolution: Resolution::Bits12,
        };
        bus.scan();
        info!(
            "{} DS18B20 probe(s) on GPIO{}",
            bus.addresses.len(),
            ONE_WIRE_PIN
        );
        Ok(bus)
    }

    fn scan(&mut self) {
        let mut found = Vec::new();
        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    if found.len() < MAX_SENSORS {
                        found.push(address);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        let added = newly_attached(&self.addresses, &found);
        self.addresses = found;
        if !added.is_empty() {
            info!("{} new DS18B20 probe(s) on the bus", added.len());
            self.configure(&added);
        }
    }

    // Probes power up at 12 bits; the conversion wait assumes `self.resolution`.
    fn configure(&mut self, addresses: &[Address]) {
        for &address in addresses {
            let Some(sensor) = Self::sensor(address) else {
                continue;
            };
            if let Err(err) = sensor.set_config(
                i8::MIN,
                i8::MAX,
                self.resolution,
                &mut self.one_wire,
                &mut self.delay,
            ) {
                warn!("failed to set resolution on {address:?}: {err:?}");
            }
        }
    }

    fn sensor(address: Address) -> Option<Ds18b20> {
        match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => Some(sensor),
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                None
            }
        }
    }
}

impl SensorBus for Ds18b20Bus {
    fn device_count(&mut self) -> usize {
        self.scan();
        self.addresses.len()
    }

    fn address(&mut self, index: usize) -> Option<RomCode> {
        self.addresses
            .get(index)
            .map(|address| RomCode(address.0.to_le_bytes()))
    }

    fn set_resolution(&mut self, bits: u8) {
        self.resolution = match bits {
            0..=9 => Resolution::Bits9,
            10 => Resolution::Bits10,
            11 => Resolution::Bits11,
            _ => Resolution::Bits12,
        };
        let addresses = self.addresses.clone();
        self.configure(&addresses);
    }

    fn request_conversion(&mut self) {
        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            return;
        }
        self.resolution.delay_for_measurement_time(&mut self.delay);
    }

    fn read_celsius(&mut self, rom: &RomCode) -> f32 {
        let address = Address(u64::from_le_bytes(rom.0));
        let Some(sensor) = Self::sensor(address) else {
            return DISCONNECTED_C;
        };
        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => data.temperature,
            Err(err) => {
                warn!("failed to read DS18B20 {rom}: {err:?}");
                DISCONNECTED_C
            }
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            restart();
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
    }
}
