use log::{info, warn};
use thiserror::Error;

use crate::{
    config::{ConfigUpdate, LoggerConfig},
    cycle::{run_cycle, CycleFailure, CycleReport, IntervalTimer},
    influx::{ClientFactory, ConnectionSettings, TimeSeriesClient, UploadError},
    mode::{LoggerMode, ModeParseError},
    sensors::{enumerate, read_all, SensorBus, SensorReading, SensorSlot},
    store::{save_config, BlobStore, StoreError},
};

#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    InvalidMode(#[from] ModeParseError),
    /// The change is in effect but was not persisted.
    #[error("saved in memory only: {0}")]
    Persist(#[from] StoreError),
}

pub struct Logger<S, F: ClientFactory, B> {
    config: LoggerConfig,
    store: S,
    factory: F,
    client: Option<F::Client>,
    bus: B,
    timer: IntervalTimer,
}

impl<S, F, B> Logger<S, F, B>
where
    S: BlobStore,
    F: ClientFactory,
    B: SensorBus,
{
    pub fn new(mut config: LoggerConfig, store: S, factory: F, bus: B) -> Self {
        config.normalize();
        let timer = IntervalTimer::new(u64::from(config.operate_interval_ms));
        let mut logger = Self {
            config,
            store,
            factory,
            client: None,
            bus,
            timer,
        };
        logger.apply_runtime();
        logger
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn mode(&self) -> LoggerMode {
        self.config.mode
    }

    pub fn client(&self) -> Option<&F::Client> {
        self.client.as_ref()
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Re-applies the configuration to the hardware and the upload client.
    ///
    /// Any existing client is dropped first. In operate mode a fresh one is
    /// built when the configuration allows uploads, and its connectivity is
    /// checked right away; the check result is returned.
    pub fn apply_runtime(&mut self) -> Option<Result<(), UploadError>> {
        self.bus.set_resolution(self.config.temp_resolution_bits);
        self.timer
            .set_interval(u64::from(self.config.operate_interval_ms));

        self.client = None;

        if self.config.mode == LoggerMode::Identify {
            info!("identify mode: upload client disabled");
            return None;
        }
        if !self.config.is_upload_capable() {
            warn!("operate mode without org/token; uploads disabled");
            return None;
        }

        let settings = ConnectionSettings::from_config(&self.config);
        let mut client = self.factory.build(&settings);
        let check = client.validate_connection();
        match &check {
            Ok(()) => info!("database reachable at {}", settings.url),
            Err(err) => warn!("database check failed for {}: {err}", settings.url),
        }
        self.client = Some(client);
        Some(check)
    }

    pub fn save_config(&mut self, update: ConfigUpdate) -> Result<(), SaveError> {
        let interval_before = self.config.operate_interval_ms;
        let mode_changed = self.config.apply_update(update)?;
        self.config.normalize();
        if mode_changed {
            info!("mode changed to {}", self.config.mode.as_str());
        }
        // Entering operate or changing the period restarts the schedule.
        if mode_changed || self.config.operate_interval_ms != interval_before {
            self.timer.reset();
        }
        self.apply_runtime();
        self.persist()
    }

    pub fn save_rooms(&mut self, rooms: Vec<String>) -> Result<(), SaveError> {
        self.config.rooms = rooms;
        self.config.normalize();
        self.persist()
    }

    fn persist(&mut self) -> Result<(), SaveError> {
        save_config(&mut self.store, &self.config).map_err(|err| {
            warn!("configuration not persisted: {err}");
            SaveError::from(err)
        })
    }

    pub fn test_connection(&mut self) -> Result<(), String> {
        if !self.config.is_upload_capable() {
            return Err("url, bucket, org and token are required".to_string());
        }
        let settings = ConnectionSettings::from_config(&self.config);
        let mut client = self.factory.build(&settings);
        client.validate_connection().map_err(|err| err.to_string())
    }

    pub fn tick(
        &mut self,
        now_ms: u64,
        timestamp_ms: Option<i64>,
    ) -> Option<Result<CycleReport, CycleFailure>> {
        if !self.config.mode.uploads() || !self.timer.poll(now_ms) {
            return None;
        }

        let result = run_cycle(
            &self.config,
            self.client.as_mut(),
            &mut self.bus,
            timestamp_ms,
        );
        if let Err(err) = &result {
            warn!("upload cycle failed: {err}");
            if let Some(detail) = self.client.as_ref().and_then(|client| client.last_error()) {
                warn!("last client error: {detail}");
            }
        }
        Some(result)
    }

    pub fn next_cycle_in_ms(&self, now_ms: u64) -> Option<u64> {
        self.config
            .mode
            .uploads()
            .then(|| self.timer.remaining_ms(now_ms))
    }

    pub fn sensor_slots(&mut self) -> Vec<SensorSlot> {
        enumerate(&mut self.bus)
    }

    pub fn live_readings(&mut self) -> Option<Vec<SensorReading>> {
        (self.config.mode == LoggerMode::Identify).then(|| read_all(&mut self.bus))
    }
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::testing::*;
    use super::*;
    use crate::config::MIN_OPERATE_INTERVAL_MS;

    #[test]
    fn operate_mode_builds_and_validates_client() {
        let (logger, transport) = logger(capable_config(), &[Some(20.0)], 200);

        assert!(logger.client().is_some());
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].url.ends_with("/health"));
    }

    #[test]
    fn operate_without_credentials_has_no_client() {
        let (mut logger, transport) = logger(LoggerConfig::default(), &[Some(20.0)], 204);

        assert!(logger.client().is_none());
        assert_eq!(logger.tick(0, None), Some(Err(CycleFailure::NotUploadCapable)));
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn switching_to_identify_tears_down_client_and_stops_uploads() {
        let (mut logger, transport) = logger(capable_config(), &[Some(20.0), Some(21.0)], 204);
        assert!(logger.client().is_some());

        logger
            .save_config(ConfigUpdate {
                mode: Some("identify".to_string()),
                ..ConfigUpdate::default()
            })
            .unwrap();
        let requests_before = transport.sent.borrow().len();

        assert!(logger.client().is_none());
        assert_eq!(logger.mode(), LoggerMode::Identify);
        assert_eq!(logger.tick(1_000_000, None), None);
        assert_eq!(transport.sent.borrow().len(), requests_before);
        assert!(transport.posts().is_empty());
    }

    #[test]
    fn returning_to_operate_rebuilds_client() {
        let config = LoggerConfig {
            mode: LoggerMode::Identify,
            ..capable_config()
        };
        let (mut logger, transport) = logger(config, &[Some(20.0)], 204);
        assert!(logger.client().is_none());

        logger
            .save_config(ConfigUpdate {
                mode: Some("Operate".to_string()),
                ..ConfigUpdate::default()
            })
            .unwrap();

        assert!(logger.client().is_some());
        assert_eq!(transport.sent.borrow().len(), 1);
        assert!(matches!(logger.tick(0, None), Some(Ok(report)) if report.submitted == 1));
    }

    #[test]
    fn tick_respects_operate_interval() {
        let (mut logger, transport) = logger(capable_config(), &[Some(20.0)], 204);

        assert!(logger.tick(0, None).is_some());
        assert!(logger.tick(u64::from(MIN_OPERATE_INTERVAL_MS), None).is_none());
        assert!(logger.tick(60_000, None).is_some());
        assert_eq!(transport.posts().len(), 2);
    }

    #[test]
    fn label_only_save_keeps_the_upload_schedule() {
        let (mut logger, transport) = logger(capable_config(), &[Some(20.0)], 204);
        assert!(logger.tick(0, None).is_some());

        for step in 1..=5u64 {
            logger
                .save_config(ConfigUpdate {
                    alias: Some(format!("shed {step}")),
                    ..ConfigUpdate::default()
                })
                .unwrap();
            assert!(logger.tick(step * 100, None).is_none());
        }

        assert_eq!(transport.posts().len(), 1);
        assert!(logger.tick(60_000, None).is_some());
        assert_eq!(transport.posts().len(), 2);
    }

    #[test]
    fn interval_change_restarts_the_schedule() {
        let (mut logger, transport) = logger(capable_config(), &[Some(20.0)], 204);
        assert!(logger.tick(0, None).is_some());

        logger
            .save_config(ConfigUpdate {
                operate_interval_ms: Some(30_000),
                ..ConfigUpdate::default()
            })
            .unwrap();

        assert!(logger.tick(100, None).is_some());
        assert!(logger.tick(20_000, None).is_none());
        assert!(logger.tick(30_100, None).is_some());
        assert_eq!(transport.posts().len(), 3);
    }

    #[test]
    fn room_with_line_break_keeps_one_line_per_sensor() {
        let (mut logger, transport) = logger(capable_config(), &[Some(20.0), Some(21.0)], 204);

        logger
            .save_rooms(vec!["Living\nroom".to_string(), "Bath".to_string()])
            .unwrap();

        assert!(matches!(logger.tick(0, None), Some(Ok(report)) if report.submitted == 2));
        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].body.lines().count(), 2);
        assert!(posts[0].body.contains("room=Living\\ room"));
    }

    #[test]
    fn invalid_mode_rejects_whole_save() {
        let (mut logger, _transport) = logger(capable_config(), &[], 204);

        let err = logger
            .save_config(ConfigUpdate {
                org: Some("other".to_string()),
                mode: Some("foo".to_string()),
                ..ConfigUpdate::default()
            })
            .unwrap_err();

        assert!(matches!(err, SaveError::InvalidMode(_)));
        assert_eq!(logger.config().org, "home");
        assert_eq!(store_of(&logger).writes, 0);
    }

    #[test]
    fn persist_failure_keeps_change_in_memory() {
        let (mut logger, _transport) = logger(capable_config(), &[], 204);
        store_mut(&mut logger).fail_writes = true;

        let err = logger
            .save_config(ConfigUpdate {
                alias: Some("garage".to_string()),
                ..ConfigUpdate::default()
            })
            .unwrap_err();

        assert!(matches!(err, SaveError::Persist(_)));
        assert_eq!(logger.config().alias, "garage");
    }

    #[test]
    fn save_applies_resolution_to_bus() {
        let (mut logger, _transport) = logger(capable_config(), &[Some(20.0)], 204);

        logger
            .save_config(ConfigUpdate {
                temp_resolution_bits: Some(4),
                ..ConfigUpdate::default()
            })
            .unwrap();

        assert_eq!(logger.bus_mut().resolution, Some(9));
    }

    #[test]
    fn rooms_are_normalized_and_persisted() {
        let (mut logger, _transport) = logger(capable_config(), &[], 204);
        let rooms: Vec<String> = (0..12).map(|i| format!(" R{i} ")).collect();

        logger.save_rooms(rooms).unwrap();

        assert_eq!(logger.config().rooms.len(), crate::config::MAX_SENSORS);
        assert_eq!(logger.config().rooms[0], "R0");
        let blob = store_of(&logger).blob.clone().unwrap();
        assert_eq!(LoggerConfig::decode(&blob).unwrap(), *logger.config());
    }

    #[test]
    fn live_readings_only_in_identify() {
        let (mut operate, _transport) = logger(capable_config(), &[Some(20.0)], 204);
        assert!(operate.live_readings().is_none());

        let config = LoggerConfig {
            mode: LoggerMode::Identify,
            ..capable_config()
        };
        let (mut identify, _transport) = logger(config, &[Some(20.0), None], 204);
        let readings = identify.live_readings().unwrap();
        assert_eq!(readings.len(), 2);
    }

    #[test]
    fn test_connection_uses_current_config() {
        let (mut logger, transport) = logger(LoggerConfig::default(), &[], 204);
        assert!(logger.test_connection().is_err());

        logger
            .save_config(ConfigUpdate {
                org: Some("home".to_string()),
                token: Some("secret".to_string()),
                mode: Some("identify".to_string()),
                ..ConfigUpdate::default()
            })
            .unwrap();
        *transport.status.borrow_mut() = Ok(200);

        assert_eq!(logger.test_connection(), Ok(()));
        assert!(logger.client().is_none());
    }
}
