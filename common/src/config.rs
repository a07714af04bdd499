use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::mode::{LoggerMode, ModeParseError};

pub const MAX_SENSORS: usize = 10;

pub const DEFAULT_URL: &str = "http://192.168.1.100:8086";
pub const DEFAULT_BUCKET: &str = "temperatures";
pub const DEFAULT_MEASUREMENT: &str = "temperature";

pub const MIN_RESOLUTION_BITS: u8 = 9;
pub const MAX_RESOLUTION_BITS: u8 = 12;
pub const MIN_OPERATE_INTERVAL_MS: u32 = 5_000;
pub const MIN_IDENTIFY_INTERVAL_MS: u32 = 2_000;
pub const MAX_INTERVAL_MS: u32 = 3_600_000;

#[derive(Debug, Error)]
pub enum ConfigDecodeError {
    #[error("config blob is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config blob is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggerConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub alias: String,
    #[serde(rename = "tempResBits")]
    pub temp_resolution_bits: u8,
    #[serde(rename = "operateIntervalMs")]
    pub operate_interval_ms: u32,
    #[serde(rename = "identifyIntervalMs")]
    pub identify_interval_ms: u32,
    pub mode: LoggerMode,
    pub rooms: Vec<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            token: String::new(),
            org: String::new(),
            bucket: DEFAULT_BUCKET.to_string(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
            device_id: crate::identity::UNKNOWN_DEVICE_ID.to_string(),
            alias: String::new(),
            temp_resolution_bits: 12,
            operate_interval_ms: 60_000,
            identify_interval_ms: MIN_IDENTIFY_INTERVAL_MS,
            mode: LoggerMode::Operate,
            rooms: Vec::new(),
        }
    }
}

impl LoggerConfig {
    pub fn normalize(&mut self) {
        blank_controls(&mut self.alias);
        for field in [
            &mut self.url,
            &mut self.token,
            &mut self.org,
            &mut self.bucket,
            &mut self.measurement,
            &mut self.device_id,
            &mut self.alias,
        ] {
            trim_in_place(field);
        }

        fill_if_empty(&mut self.url, DEFAULT_URL);
        fill_if_empty(&mut self.bucket, DEFAULT_BUCKET);
        fill_if_empty(&mut self.measurement, DEFAULT_MEASUREMENT);

        self.temp_resolution_bits = self
            .temp_resolution_bits
            .clamp(MIN_RESOLUTION_BITS, MAX_RESOLUTION_BITS);
        self.operate_interval_ms = self
            .operate_interval_ms
            .clamp(MIN_OPERATE_INTERVAL_MS, MAX_INTERVAL_MS);
        self.identify_interval_ms = self
            .identify_interval_ms
            .clamp(MIN_IDENTIFY_INTERVAL_MS, MAX_INTERVAL_MS);

        self.rooms.truncate(MAX_SENSORS);
        for room in &mut self.rooms {
            blank_controls(room);
            trim_in_place(room);
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn is_upload_capable(&self) -> bool {
        [&self.url, &self.bucket, &self.org, &self.token]
            .iter()
            .all(|value| !value.trim().is_empty())
    }

    pub fn connection(&self) -> ConnectionFields {
        ConnectionFields {
            url: self.url.clone(),
            token: self.token.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            measurement: self.measurement.clone(),
        }
    }

    pub fn apply_connection(&mut self, fields: ConnectionFields) {
        self.url = fields.url;
        self.token = fields.token;
        self.org = fields.org;
        self.bucket = fields.bucket;
        self.measurement = fields.measurement;
    }

    /// Applies operator-supplied fields. The mode is validated before anything
    /// is touched, so a rejected request leaves the record unchanged.
    ///
    /// Returns whether the mode changed.
    pub fn apply_update(&mut self, update: ConfigUpdate) -> Result<bool, ModeParseError> {
        let mode = match update.mode.as_deref() {
            Some(text) => Some(text.parse::<LoggerMode>()?),
            None => None,
        };

        if let Some(url) = update.url {
            self.url = url;
        }
        if let Some(token) = update.token.filter(|token| !token.trim().is_empty()) {
            self.token = token;
        }
        if let Some(org) = update.org {
            self.org = org;
        }
        if let Some(bucket) = update.bucket {
            self.bucket = bucket;
        }
        if let Some(measurement) = update.measurement {
            self.measurement = measurement;
        }
        if let Some(alias) = update.alias {
            self.alias = alias;
        }
        if let Some(bits) = update.temp_resolution_bits {
            self.temp_resolution_bits = saturate_u8(bits);
        }
        if let Some(interval) = update.operate_interval_ms {
            self.operate_interval_ms = saturate_u32(interval);
        }
        if let Some(interval) = update.identify_interval_ms {
            self.identify_interval_ms = saturate_u32(interval);
        }

        let previous = self.mode;
        if let Some(mode) = mode {
            self.mode = mode;
        }
        Ok(previous != self.mode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a persisted blob field by field. Missing or mistyped fields
    /// fall back to their defaults; only a blob that is not a JSON object at
    /// all is rejected.
    pub fn decode(blob: &[u8]) -> Result<Self, ConfigDecodeError> {
        let value: Value = serde_json::from_slice(blob)?;
        let Value::Object(fields) = value else {
            return Err(ConfigDecodeError::NotAnObject);
        };

        let defaults = Self::default();
        Ok(Self {
            url: string_field(&fields, "url").unwrap_or(defaults.url),
            token: string_field(&fields, "token").unwrap_or(defaults.token),
            org: string_field(&fields, "org").unwrap_or(defaults.org),
            bucket: string_field(&fields, "bucket").unwrap_or(defaults.bucket),
            measurement: string_field(&fields, "measurement").unwrap_or(defaults.measurement),
            device_id: string_field(&fields, "deviceId").unwrap_or(defaults.device_id),
            alias: string_field(&fields, "alias").unwrap_or(defaults.alias),
            temp_resolution_bits: int_field(&fields, "tempResBits")
                .map(saturate_u8)
                .unwrap_or(defaults.temp_resolution_bits),
            operate_interval_ms: int_field(&fields, "operateIntervalMs")
                .map(saturate_u32)
                .unwrap_or(defaults.operate_interval_ms),
            identify_interval_ms: int_field(&fields, "identifyIntervalMs")
                .map(saturate_u32)
                .unwrap_or(defaults.identify_interval_ms),
            mode: string_field(&fields, "mode")
                .and_then(|text| LoggerMode::parse(&text))
                .unwrap_or(defaults.mode),
            rooms: rooms_field(&fields).unwrap_or(defaults.rooms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionFields {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub measurement: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(rename = "tempResBits", default)]
    pub temp_resolution_bits: Option<i64>,
    #[serde(rename = "operateIntervalMs", default)]
    pub operate_interval_ms: Option<i64>,
    #[serde(rename = "identifyIntervalMs", default)]
    pub identify_interval_ms: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomsUpdate {
    pub rooms: Vec<String>,
}

fn trim_in_place(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

// Labels end up as line-protocol tag values, which cannot span lines.
fn blank_controls(value: &mut String) {
    if value.chars().any(char::is_control) {
        *value = value
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
    }
}

fn fill_if_empty(value: &mut String, default: &str) {
    if value.is_empty() {
        *value = default.to_string();
    }
}

fn saturate_u8(value: i64) -> u8 {
    value.clamp(0, i64::from(u8::MAX)) as u8
}

fn saturate_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key)?.as_str().map(str::to_string)
}

fn int_field(fields: &Map<String, Value>, key: &str) -> Option<i64> {
    match fields.get(key)? {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|value| value.is_finite())
                .map(|value| value.round() as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn rooms_field(fields: &Map<String, Value>) -> Option<Vec<String>> {
    let entries = fields.get("rooms")?.as_array()?;
    Some(
        entries
            .iter()
            .map(|entry| entry.as_str().unwrap_or_default().to_string())
            .collect(),
    )
}
