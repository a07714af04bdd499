use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    config::{ConnectionFields, LoggerConfig},
    identity::enforce_device_id,
    mode::LoggerMode,
    store::{load_config, save_config, BlobStore},
};

pub const AUTO_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const RESTART_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssociationError {
    #[error("configuration portal failed: {0}")]
    Portal(String),
    #[error("network association failed: {0}")]
    Network(String),
}

pub trait NetworkAssociator {
    fn auto_connect(&mut self, timeout: Duration) -> bool;

    fn run_portal(&mut self, seed: &ConnectionFields)
        -> Result<ConnectionFields, AssociationError>;

    fn reset_credentials(&mut self);
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortalSubmission {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass")]
    pub wifi_pass: String,
    #[serde(flatten)]
    pub fields: ConnectionFields,
}

impl PortalSubmission {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.wifi_ssid.trim().is_empty() {
            return Err("wifiSsid cannot be empty");
        }
        if self.wifi_ssid.len() > 32 {
            return Err("wifiSsid is longer than 32 bytes");
        }
        if self.wifi_pass.len() > 64 {
            return Err("wifiPass is longer than 64 bytes");
        }
        Ok(())
    }

    pub fn merged_fields(&self, seed: &ConnectionFields) -> ConnectionFields {
        let pick = |value: &str, fallback: &str| {
            let value = value.trim();
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };
        ConnectionFields {
            url: pick(&self.fields.url, &seed.url),
            token: pick(&self.fields.token, &seed.token),
            org: pick(&self.fields.org, &seed.org),
            bucket: pick(&self.fields.bucket, &seed.bucket),
            measurement: pick(&self.fields.measurement, &seed.measurement),
        }
    }
}

pub trait ClockSync {
    fn sync(&mut self) -> bool;
}

pub fn should_prompt(loaded_ok: bool, config: &LoggerConfig) -> bool {
    !loaded_ok || (config.mode == LoggerMode::Operate && !config.is_upload_capable())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    LoadConfig,
    DeriveIdentity,
    DecidePortal,
    Associate { portal: bool },
    SyncClock,
    Ready,
    Restart,
}

#[derive(Debug)]
pub struct BootReport<S> {
    pub config: LoggerConfig,
    pub store: S,
    pub loaded_ok: bool,
    pub portal_used: bool,
    pub clock_synced: bool,
}

#[derive(Debug)]
pub enum BootOutcome<S> {
    Ready(BootReport<S>),
    Restart(AssociationError),
}

pub struct BootSequence<'a, S, N, K> {
    phase: BootPhase,
    store: S,
    network: &'a mut N,
    clock: &'a mut K,
    mac: [u8; 6],
    config: LoggerConfig,
    loaded_ok: bool,
    portal_used: bool,
    clock_synced: bool,
    failure: Option<AssociationError>,
}

impl<'a, S, N, K> BootSequence<'a, S, N, K>
where
    S: BlobStore,
    N: NetworkAssociator,
    K: ClockSync,
{
    pub fn new(store: S, network: &'a mut N, clock: &'a mut K, mac: [u8; 6]) -> Self {
        Self {
            phase: BootPhase::LoadConfig,
            store,
            network,
            clock,
            mac,
            config: LoggerConfig::default(),
            loaded_ok: false,
            portal_used: false,
            clock_synced: false,
            failure: None,
        }
    }

    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    pub fn step(&mut self) -> BootPhase {
        self.phase = match self.phase {
            BootPhase::LoadConfig => self.load_config(),
            BootPhase::DeriveIdentity => self.derive_identity(),
            BootPhase::DecidePortal => self.decide_portal(),
            BootPhase::Associate { portal } => self.associate(portal),
            BootPhase::SyncClock => self.sync_clock(),
            terminal @ (BootPhase::Ready | BootPhase::Restart) => terminal,
        };
        self.phase
    }

    pub fn run(mut self) -> BootOutcome<S> {
        loop {
            match self.step() {
                BootPhase::Ready => {
                    return BootOutcome::Ready(BootReport {
                        config: self.config,
                        store: self.store,
                        loaded_ok: self.loaded_ok,
                        portal_used: self.portal_used,
                        clock_synced: self.clock_synced,
                    })
                }
                BootPhase::Restart => {
                    let err = self
                        .failure
                        .take()
                        .unwrap_or_else(|| AssociationError::Network("unknown".to_string()));
                    return BootOutcome::Restart(err);
                }
                _ => {}
            }
        }
    }

    fn load_config(&mut self) -> BootPhase {
        let (config, loaded_ok) = load_config(&mut self.store);
        self.config = config.normalized();
        self.loaded_ok = loaded_ok;
        info!(
            "boot: configuration {} (mode {})",
            if loaded_ok { "loaded" } else { "defaulted" },
            self.config.mode.as_str()
        );
        BootPhase::DeriveIdentity
    }

    fn derive_identity(&mut self) -> BootPhase {
        if enforce_device_id(&mut self.config, &self.mac) {
            info!("boot: device id set to {}", self.config.device_id);
            if let Err(err) = save_config(&mut self.store, &self.config) {
                warn!("boot: device id not persisted: {err}");
            }
        }
        BootPhase::DecidePortal
    }

    fn decide_portal(&mut self) -> BootPhase {
        let portal = should_prompt(self.loaded_ok, &self.config);
        if portal {
            info!("boot: configuration incomplete; portal required");
        }
        BootPhase::Associate { portal }
    }

    fn associate(&mut self, portal: bool) -> BootPhase {
        if !portal {
            if self.network.auto_connect(AUTO_CONNECT_TIMEOUT) {
                info!("boot: network joined");
                return BootPhase::SyncClock;
            }
            warn!(
                "boot: auto-connect timed out after {}s; opening portal",
                AUTO_CONNECT_TIMEOUT.as_secs()
            );
        }

        self.portal_used = true;
        match self.network.run_portal(&self.config.connection()) {
            Ok(fields) => {
                self.config.apply_connection(fields);
                self.config.normalize();
                if let Err(err) = save_config(&mut self.store, &self.config) {
                    warn!("boot: portal settings not persisted: {err}");
                }
                info!("boot: portal completed");
                BootPhase::SyncClock
            }
            Err(err) => {
                warn!("boot: {err}; restarting in {}s", RESTART_DELAY.as_secs());
                self.failure = Some(err);
                BootPhase::Restart
            }
        }
    }

    fn sync_clock(&mut self) -> BootPhase {
        self.clock_synced = self.clock.sync();
        if !self.clock_synced {
            warn!("boot: clock not synchronised; points carry server time");
        }
        BootPhase::Ready
    }
}
