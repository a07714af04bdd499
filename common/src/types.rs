use serde::Serialize;

use crate::{
    config::LoggerConfig,
    sensors::{logical_id, room_name, SensorReading, SensorSlot},
};

#[derive(Debug, Clone, Serialize)]
pub struct SensorTempView {
    pub idx: usize,
    pub sensor: String,
    pub room: String,
    pub rom: String,
    pub ok: bool,
    #[serde(rename = "tC", skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<&'static str>,
}

impl SensorTempView {
    pub fn from_reading(reading: &SensorReading, config: &LoggerConfig) -> Self {
        let err = match (reading.address, reading.temp_c) {
            (None, _) => Some("no address"),
            (Some(_), None) => Some("disconnected"),
            _ => None,
        };
        Self {
            idx: reading.index,
            sensor: logical_id(reading.index),
            room: room_name(reading.index, config),
            rom: reading.address.map(|rom| rom.to_string()).unwrap_or_default(),
            ok: err.is_none(),
            temp_c: reading.temp_c,
            err,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TempsPayload {
    pub mode: &'static str,
    pub count: usize,
    pub ts_ms: u64,
    pub sensors: Vec<SensorTempView>,
}

/// Configuration as shown to the browser. The token is never echoed.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub url: String,
    #[serde(rename = "tokenSet")]
    pub token_set: bool,
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
    pub mode: &'static str,
    pub rooms: Vec<String>,
    #[serde(rename = "uploadCapable")]
    pub upload_capable: bool,
}

impl From<&LoggerConfig> for ConfigView {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            url: config.url.clone(),
            token_set: !config.token.is_empty(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            measurement: config.measurement.clone(),
            device_id: config.device_id.clone(),
            alias: config.alias.clone(),
            temp_resolution_bits: config.temp_resolution_bits,
            operate_interval_ms: config.operate_interval_ms,
            identify_interval_ms: config.identify_interval_ms,
            mode: config.mode.as_str(),
            rooms: config.rooms.clone(),
            upload_capable: config.is_upload_capable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRow {
    pub index: usize,
    pub sensor: String,
    pub rom: Option<String>,
    pub room: String,
}

impl RoomRow {
    pub fn build(slots: &[SensorSlot], config: &LoggerConfig) -> Vec<Self> {
        let rows = slots.len().max(config.rooms.len());
        (0..rows)
            .map(|index| Self {
                index,
                sensor: logical_id(index),
                rom: slots
                    .get(index)
                    .and_then(|slot| slot.address)
                    .map(|rom| rom.to_string()),
                room: config.rooms.get(index).cloned().unwrap_or_default(),
            })
            .collect()
    }
}
