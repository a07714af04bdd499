use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{ConfigUpdate, RoomsUpdate},
    influx::ClientFactory,
    pages::{render_config_page, render_rooms_page},
    runtime::{Logger, SaveError},
    sensors::SensorBus,
    store::BlobStore,
    types::{ConfigView, RoomRow, SensorTempView, TempsPayload},
};

pub const CONTENT_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_JSON: &str = "application/json; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Root,
    ConfigPage,
    Save,
    Test,
    Reboot,
    WifiReset,
    RoomsPage,
    SaveRooms,
    Temps,
    ConfigJson,
}

impl Route {
    pub const ALL: [Route; 10] = [
        Route::Root,
        Route::ConfigPage,
        Route::Save,
        Route::Test,
        Route::Reboot,
        Route::WifiReset,
        Route::RoomsPage,
        Route::SaveRooms,
        Route::Temps,
        Route::ConfigJson,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::Root => "/",
            Self::ConfigPage => "/config",
            Self::Save => "/save",
            Self::Test => "/test",
            Self::Reboot => "/reboot",
            Self::WifiReset => "/wifiReset",
            Self::RoomsPage => "/rooms",
            Self::SaveRooms => "/saveRooms",
            Self::Temps => "/api/temps",
            Self::ConfigJson => "/api/config",
        }
    }

    pub fn method(self) -> Method {
        match self {
            Self::Save | Self::Test | Self::Reboot | Self::WifiReset | Self::SaveRooms => {
                Method::Post
            }
            _ => Method::Get,
        }
    }

    pub fn decode(self, body: &[u8]) -> Result<WebRequest, WebReply> {
        Ok(match self {
            Self::Root => WebRequest::Root,
            Self::ConfigPage => WebRequest::ConfigPage,
            Self::Save => WebRequest::Save(parse_json(body)?),
            Self::Test => WebRequest::Test,
            Self::Reboot => WebRequest::Reboot,
            Self::WifiReset => WebRequest::WifiReset,
            Self::RoomsPage => WebRequest::RoomsPage,
            Self::SaveRooms => WebRequest::SaveRooms(parse_json(body)?),
            Self::Temps => WebRequest::Temps,
            Self::ConfigJson => WebRequest::ConfigJson,
        })
    }
}

#[derive(Debug, Clone)]
pub enum WebRequest {
    Root,
    ConfigPage,
    ConfigJson,
    Save(ConfigUpdate),
    Test,
    Reboot,
    WifiReset,
    RoomsPage,
    SaveRooms(RoomsUpdate),
    Temps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    Restart,
    ResetWifiAndRestart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub location: Option<&'static str>,
    pub after: Option<PostAction>,
}

impl WebReply {
    pub fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_HTML,
            body,
            location: None,
            after: None,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TEXT,
            body: body.into(),
            location: None,
            after: None,
        }
    }

    pub fn json<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(body) => Self {
                status: 200,
                content_type: CONTENT_JSON,
                body,
                location: None,
                after: None,
            },
            Err(err) => Self::text(500, format!("serialization failed: {err}")),
        }
    }

    pub fn redirect(location: &'static str) -> Self {
        Self {
            status: 302,
            content_type: CONTENT_TEXT,
            body: String::new(),
            location: Some(location),
            after: None,
        }
    }

    fn then(mut self, action: PostAction) -> Self {
        self.after = Some(action);
        self
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, WebReply> {
    serde_json::from_slice(body).map_err(|err| WebReply::text(400, format!("invalid request body: {err}")))
}

/// Serves one request against the logger. Runs on the control loop only.
pub fn handle<S, F, B>(logger: &mut Logger<S, F, B>, request: WebRequest, uptime_ms: u64) -> WebReply
where
    S: BlobStore,
    F: ClientFactory,
    B: SensorBus,
{
    match request {
        WebRequest::Root => WebReply::redirect(Route::ConfigPage.path()),
        WebRequest::ConfigPage => WebReply::html(render_config_page(logger.config())),
        WebRequest::ConfigJson => WebReply::json(&ConfigView::from(logger.config())),
        WebRequest::Save(update) => match logger.save_config(update) {
            Ok(()) => WebReply::text(200, format!("saved; mode {}", logger.mode().as_str())),
            Err(SaveError::InvalidMode(err)) => WebReply::text(400, err.to_string()),
            Err(err @ SaveError::Persist(_)) => WebReply::text(500, err.to_string()),
        },
        WebRequest::Test => match logger.test_connection() {
            Ok(()) => WebReply::text(200, "ok"),
            Err(err) => WebReply::text(502, format!("error: {err}")),
        },
        WebRequest::Reboot => {
            info!("reboot requested");
            WebReply::text(200, "rebooting").then(PostAction::Restart)
        }
        WebRequest::WifiReset => {
            warn!("wifi reset requested");
            WebReply::text(200, "wifi credentials cleared; rebooting")
                .then(PostAction::ResetWifiAndRestart)
        }
        WebRequest::RoomsPage => {
            let slots = logger.sensor_slots();
            let rows = RoomRow::build(&slots, logger.config());
            WebReply::html(render_rooms_page(&rows, logger.config()))
        }
        WebRequest::SaveRooms(update) => match logger.save_rooms(update.rooms) {
            Ok(()) => WebReply::text(200, "rooms saved"),
            Err(err) => WebReply::text(500, err.to_string()),
        },
        WebRequest::Temps => {
            let payload = match logger.live_readings() {
                Some(readings) => TempsPayload {
                    mode: logger.mode().as_str(),
                    count: readings.len(),
                    ts_ms: uptime_ms,
                    sensors: readings
                        .iter()
                        .map(|reading| SensorTempView::from_reading(reading, logger.config()))
                        .collect(),
                },
                None => TempsPayload {
                    mode: logger.mode().as_str(),
                    count: logger.sensor_slots().len(),
                    ts_ms: uptime_ms,
                    sensors: Vec::new(),
                },
            };
            WebReply::json(&payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        config::LoggerConfig,
        mode::LoggerMode,
        runtime::testing::{capable_config, logger, store_mut},
    };

    fn json(reply: &WebReply) -> Value {
        assert_eq!(reply.content_type, CONTENT_JSON);
        serde_json::from_str(&reply.body).unwrap()
    }

    #[test]
    fn routes_have_expected_methods() {
        let posts: Vec<&str> = Route::ALL
            .iter()
            .filter(|route| route.method() == Method::Post)
            .map(|route| route.path())
            .collect();

        assert_eq!(posts, vec!["/save", "/test", "/reboot", "/wifiReset", "/saveRooms"]);
    }

    #[test]
    fn root_redirects_to_config() {
        let (mut logger, _) = logger(capable_config(), &[], 204);

        let reply = handle(&mut logger, WebRequest::Root, 0);

        assert_eq!(reply.status, 302);
        assert_eq!(reply.location, Some("/config"));
    }

    #[test]
    fn save_decodes_json_and_applies() {
        let (mut logger, _) = logger(capable_config(), &[], 204);
        let request = Route::Save
            .decode(br#"{"alias":"garage","mode":"IDENTIFY","operateIntervalMs":1000}"#)
            .unwrap();

        let reply = handle(&mut logger, request, 0);

        assert_eq!(reply.status, 200);
        assert_eq!(logger.config().alias, "garage");
        assert_eq!(logger.mode(), LoggerMode::Identify);
        assert_eq!(logger.config().operate_interval_ms, 5_000);
        assert!(logger.client().is_none());
    }

    #[test]
    fn save_with_bad_mode_is_rejected() {
        let (mut logger, _) = logger(capable_config(), &[], 204);
        let request = Route::Save.decode(br#"{"mode":"foo"}"#).unwrap();

        let reply = handle(&mut logger, request, 0);

        assert_eq!(reply.status, 400);
        assert_eq!(logger.mode(), LoggerMode::Operate);
    }

    #[test]
    fn malformed_body_is_a_bad_request() {
        let err = Route::SaveRooms.decode(b"rooms=Kitchen").unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn persist_failure_is_reported_but_applied() {
        let (mut logger, _) = logger(capable_config(), &[], 204);
        store_mut(&mut logger).fail_writes = true;
        let request = Route::SaveRooms.decode(br#"{"rooms":["Kitchen"]}"#).unwrap();

        let reply = handle(&mut logger, request, 0);

        assert_eq!(reply.status, 500);
        assert_eq!(logger.config().rooms, vec!["Kitchen"]);
    }

    #[test]
    fn test_route_reports_connectivity() {
        let (mut ok_logger, _) = logger(capable_config(), &[], 200);
        assert_eq!(handle(&mut ok_logger, WebRequest::Test, 0).body, "ok");

        let (mut bad_logger, _) = logger(capable_config(), &[], 401);
        let reply = handle(&mut bad_logger, WebRequest::Test, 0);
        assert_eq!(reply.status, 502);
        assert!(reply.body.starts_with("error:"));
    }

    #[test]
    fn reboot_and_wifi_reset_schedule_post_actions() {
        let (mut logger, _) = logger(capable_config(), &[], 204);

        assert_eq!(
            handle(&mut logger, WebRequest::Reboot, 0).after,
            Some(PostAction::Restart)
        );
        assert_eq!(
            handle(&mut logger, WebRequest::WifiReset, 0).after,
            Some(PostAction::ResetWifiAndRestart)
        );
    }

    #[test]
    fn temps_in_identify_lists_live_readings() {
        let config = LoggerConfig {
            mode: LoggerMode::Identify,
            rooms: vec!["Kitchen".to_string()],
            ..capable_config()
        };
        let (mut logger, _) = logger(config, &[Some(21.5), None], 204);

        let body = json(&handle(&mut logger, WebRequest::Temps, 1_234));

        assert_eq!(body["mode"], "identify");
        assert_eq!(body["count"], 2);
        assert_eq!(body["ts_ms"], 1_234);
        assert_eq!(body["sensors"][0]["sensor"], "S1");
        assert_eq!(body["sensors"][0]["room"], "Kitchen");
        assert_eq!(body["sensors"][0]["ok"], true);
        assert_eq!(body["sensors"][0]["tC"], 21.5);
        assert_eq!(body["sensors"][1]["ok"], false);
        assert_eq!(body["sensors"][1]["err"], "no address");
        assert!(body["sensors"][1].get("tC").is_none());
    }

    #[test]
    fn temps_in_operate_does_not_read_the_bus() {
        let (mut logger, _) = logger(capable_config(), &[Some(21.5)], 204);

        let body = json(&handle(&mut logger, WebRequest::Temps, 0));

        assert_eq!(body["mode"], "operate");
        assert_eq!(body["count"], 1);
        assert_eq!(body["sensors"].as_array().map(Vec::len), Some(0));
        assert_eq!(logger.bus_mut().conversions, 0);
    }

    #[test]
    fn config_json_masks_token() {
        let (mut logger, _) = logger(capable_config(), &[], 204);

        let body = json(&handle(&mut logger, WebRequest::ConfigJson, 0));

        assert_eq!(body["tokenSet"], true);
        assert!(body.get("token").is_none());
        assert_eq!(body["uploadCapable"], true);
    }

    #[test]
    fn rooms_page_lists_present_sensors() {
        let (mut logger, _) = logger(capable_config(), &[Some(20.0), Some(21.0)], 204);

        let reply = handle(&mut logger, WebRequest::RoomsPage, 0);

        assert_eq!(reply.content_type, CONTENT_HTML);
        assert!(reply.body.contains(">S1<"));
        assert!(reply.body.contains(">S2<"));
        assert!(!reply.body.contains(">S3<"));
    }
}
