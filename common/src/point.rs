use crate::{
    config::LoggerConfig,
    sensors::{logical_id, room_name, RomCode},
};

pub const TEMPERATURE_FIELD: &str = "tempC";

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPoint {
    pub measurement: String,
    pub tags: Vec<(&'static str, String)>,
    pub temp_c: f32,
    pub timestamp_ms: Option<i64>,
}

impl MeasurementPoint {
    pub fn for_sensor(
        config: &LoggerConfig,
        index: usize,
        address: &RomCode,
        temp_c: f32,
        timestamp_ms: Option<i64>,
    ) -> Self {
        let mut tags = vec![("device", config.device_id.clone())];
        if !config.alias.is_empty() {
            tags.push(("alias", config.alias.clone()));
        }
        tags.push(("sensor", logical_id(index)));
        tags.push(("room", room_name(index, config)));
        tags.push(("rom", address.to_string()));

        Self {
            measurement: config.measurement.clone(),
            tags,
            temp_c,
            timestamp_ms,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }
        line.push(' ');
        line.push_str(TEMPERATURE_FIELD);
        line.push('=');
        line.push_str(&self.temp_c.to_string());
        if let Some(timestamp_ms) = self.timestamp_ms {
            line.push(' ');
            line.push_str(&timestamp_ms.to_string());
        }
        line
    }
}

fn escape(text: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        let c = if c.is_control() { ' ' } else { c };
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
