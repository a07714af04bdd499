use log::{info, warn};
use thiserror::Error;

use crate::{
    config::LoggerConfig,
    influx::TimeSeriesClient,
    point::MeasurementPoint,
    sensors::{enumerate, is_plausible_celsius, logical_id, SensorBus},
};

pub trait StatusIndicator {
    fn signal_success(&mut self);

    fn signal_failure(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub submitted: usize,
    pub skipped: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleFailure {
    #[error("configuration is not upload capable")]
    NotUploadCapable,
    #[error("no upload client is active")]
    NoClient,
    #[error("no sensors present on the bus")]
    NoSensors,
    #[error("batch flush failed: {0}")]
    Flush(String),
}

pub fn run_cycle<B, C>(
    config: &LoggerConfig,
    client: Option<&mut C>,
    bus: &mut B,
    timestamp_ms: Option<i64>,
) -> Result<CycleReport, CycleFailure>
where
    B: SensorBus,
    C: TimeSeriesClient,
{
    if !config.is_upload_capable() {
        return Err(CycleFailure::NotUploadCapable);
    }
    let Some(client) = client else {
        return Err(CycleFailure::NoClient);
    };

    let slots = enumerate(bus);
    if slots.is_empty() {
        return Err(CycleFailure::NoSensors);
    }

    bus.request_conversion();

    let mut report = CycleReport::default();
    for slot in slots {
        let sensor = logical_id(slot.index);
        let Some(address) = slot.address else {
            warn!("{sensor}: address not resolvable; skipping");
            report.skipped += 1;
            continue;
        };

        let temp_c = bus.read_celsius(&address);
        if !is_plausible_celsius(temp_c) {
            warn!("{sensor} ({address}): disconnected; skipping");
            report.skipped += 1;
            continue;
        }

        let point = MeasurementPoint::for_sensor(config, slot.index, &address, temp_c, timestamp_ms);
        match client.write_point(&point) {
            Ok(()) => report.submitted += 1,
            Err(err) => {
                warn!("{sensor}: point not buffered: {err}");
                report.rejected += 1;
            }
        }
    }

    client
        .flush()
        .map_err(|err| CycleFailure::Flush(err.to_string()))?;

    info!(
        "cycle uploaded {} point(s), {} skipped, {} rejected",
        report.submitted, report.skipped, report.rejected
    );
    Ok(report)
}

/// Monotonic interval gate. The first poll after a reset fires immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTimer {
    interval_ms: u64,
    last_fire_ms: Option<u64>,
}

impl IntervalTimer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_fire_ms: None,
        }
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }

    pub fn reset(&mut self) {
        self.last_fire_ms = None;
    }

    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.last_fire_ms {
            Some(last) if now_ms.saturating_sub(last) < self.interval_ms => false,
            _ => {
                self.last_fire_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.last_fire_ms {
            Some(last) => self.interval_ms.saturating_sub(now_ms.saturating_sub(last)),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        influx::{testing::RecordingTransport, ConnectionSettings, InfluxClient},
        sensors::testing::ScriptedBus,
    };

    fn capable_config() -> LoggerConfig {
        LoggerConfig {
            org: "home".to_string(),
            token: "secret".to_string(),
            device_id: "esp32-ABCDEF".to_string(),
            ..LoggerConfig::default()
        }
    }

    fn client(status: u16) -> (InfluxClient<RecordingTransport>, RecordingTransport) {
        let transport = RecordingTransport::answering(status);
        let client = InfluxClient::new(
            ConnectionSettings::from_config(&capable_config()),
            transport.clone(),
        );
        (client, transport)
    }

    #[test]
    fn unresolved_sensor_is_skipped_and_batch_still_flushes() {
        let config = capable_config();
        let (mut client, transport) = client(204);
        let mut bus = ScriptedBus::with_temps(&[Some(20.0), None, Some(22.5)]);

        let report = run_cycle(&config, Some(&mut client), &mut bus, None).unwrap();

        assert_eq!(
            report,
            CycleReport {
                submitted: 2,
                skipped: 1,
                rejected: 0
            }
        );
        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].body.lines().count(), 2);
        assert!(posts[0].body.contains("sensor=S1"));
        assert!(posts[0].body.contains("sensor=S3"));
    }

    #[test]
    fn not_upload_capable_does_no_work() {
        let config = LoggerConfig::default();
        let (mut client, transport) = client(204);
        let mut bus = ScriptedBus::with_temps(&[Some(20.0)]);

        let result = run_cycle(&config, Some(&mut client), &mut bus, None);

        assert_eq!(result, Err(CycleFailure::NotUploadCapable));
        assert_eq!(bus.conversions, 0);
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn missing_client_fails_the_cycle() {
        let mut bus = ScriptedBus::with_temps(&[Some(20.0)]);

        let result = run_cycle::<_, InfluxClient<RecordingTransport>>(
            &capable_config(),
            None,
            &mut bus,
            None,
        );

        assert_eq!(result, Err(CycleFailure::NoClient));
        assert_eq!(bus.conversions, 0);
    }

    #[test]
    fn empty_bus_fails_the_cycle() {
        let (mut client, transport) = client(204);
        let mut bus = ScriptedBus::default();

        let result = run_cycle(&capable_config(), Some(&mut client), &mut bus, None);

        assert_eq!(result, Err(CycleFailure::NoSensors));
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn flush_failure_is_the_cycle_result() {
        let (mut client, _transport) = client(500);
        let mut bus = ScriptedBus::with_temps(&[Some(20.0), Some(21.0)]);

        let result = run_cycle(&capable_config(), Some(&mut client), &mut bus, None);

        assert!(matches!(result, Err(CycleFailure::Flush(msg)) if msg.contains("500")));
    }

    #[test]
    fn disconnected_reading_is_not_uploaded() {
        let (mut client, transport) = client(204);
        let mut bus = ScriptedBus::with_temps(&[Some(crate::sensors::DISCONNECTED_C), Some(19.0)]);

        let report = run_cycle(&capable_config(), Some(&mut client), &mut bus, Some(42)).unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.skipped, 1);
        assert!(transport.posts()[0].body.ends_with("tempC=19 42"));
    }

    #[test]
    fn timer_fires_first_then_every_interval() {
        let mut timer = IntervalTimer::new(5_000);

        assert!(timer.poll(100));
        assert!(!timer.poll(5_099));
        assert_eq!(timer.remaining_ms(4_100), 1_000);
        assert!(timer.poll(5_100));

        timer.reset();
        assert!(timer.poll(5_200));
    }
}
