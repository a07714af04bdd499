use log::{info, warn};
use thiserror::Error;

use crate::{config::LoggerConfig, point::MeasurementPoint};

pub const MAX_BATCH_POINTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("batch buffer full ({0} points)")]
    BufferFull(usize),
    #[error("point has a non-finite value")]
    InvalidPoint,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

impl ConnectionSettings {
    pub fn from_config(config: &LoggerConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        }
    }
}

pub trait TimeSeriesClient {
    fn write_point(&mut self, point: &MeasurementPoint) -> Result<(), UploadError>;

    fn flush(&mut self) -> Result<(), UploadError>;

    fn validate_connection(&mut self) -> Result<(), UploadError>;

    fn last_error(&self) -> Option<&str>;
}

pub trait ClientFactory {
    type Client: TimeSeriesClient;

    fn build(&mut self, settings: &ConnectionSettings) -> Self::Client;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpTransport {
    fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, String>;

    fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, String>;
}

pub struct InfluxClient<T> {
    settings: ConnectionSettings,
    transport: T,
    batch: Vec<String>,
    last_error: Option<String>,
}

impl<T: HttpTransport> InfluxClient<T> {
    pub fn new(settings: ConnectionSettings, transport: T) -> Self {
        Self {
            settings,
            transport,
            batch: Vec::with_capacity(MAX_BATCH_POINTS),
            last_error: None,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    pub fn write_url(&self) -> String {
        format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.settings.url,
            encode_query_component(&self.settings.org),
            encode_query_component(&self.settings.bucket)
        )
    }

    fn record<V>(&mut self, result: Result<V, UploadError>) -> Result<V, UploadError> {
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        result
    }
}

impl<T: HttpTransport> TimeSeriesClient for InfluxClient<T> {
    fn write_point(&mut self, point: &MeasurementPoint) -> Result<(), UploadError> {
        let result = if !point.temp_c.is_finite() {
            Err(UploadError::InvalidPoint)
        } else if self.batch.len() >= MAX_BATCH_POINTS {
            Err(UploadError::BufferFull(MAX_BATCH_POINTS))
        } else {
            self.batch.push(point.to_line_protocol());
            Ok(())
        };
        self.record(result)
    }

    fn flush(&mut self) -> Result<(), UploadError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let url = self.write_url();
        let authorization = format!("Token {}", self.settings.token);
        let body = self.batch.join("\n");
        let points = self.batch.len();
        self.batch.clear();

        let result = match self.transport.post(
            &url,
            &[
                ("Authorization", authorization.as_str()),
                ("Content-Type", "text/plain; charset=utf-8"),
            ],
            body.as_bytes(),
        ) {
            Ok(response) if (200..300).contains(&response.status) => {
                info!("flushed {points} point(s) to {}", self.settings.url);
                Ok(())
            }
            Ok(response) => Err(UploadError::Status {
                status: response.status,
                body: response.body,
            }),
            Err(err) => Err(UploadError::Transport(err)),
        };

        if let Err(err) = &result {
            warn!("dropping batch of {points} point(s): {err}");
        }
        self.record(result)
    }

    fn validate_connection(&mut self) -> Result<(), UploadError> {
        let url = format!("{}/health", self.settings.url);
        let authorization = format!("Token {}", self.settings.token);
        let result = match self
            .transport
            .get(&url, &[("Authorization", authorization.as_str())])
        {
            Ok(response) if (200..300).contains(&response.status) => Ok(()),
            Ok(response) => Err(UploadError::Status {
                status: response.status,
                body: response.body,
            }),
            Err(err) => Err(UploadError::Transport(err)),
        };
        self.record(result)
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct InfluxClientFactory<T> {
    transport: T,
}

impl<T: HttpTransport + Clone> InfluxClientFactory<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: HttpTransport + Clone> ClientFactory for InfluxClientFactory<T> {
    type Client = InfluxClient<T>;

    fn build(&mut self, settings: &ConnectionSettings) -> Self::Client {
        InfluxClient::new(settings.clone(), self.transport.clone())
    }
}

fn encode_query_component(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct SentRequest {
        pub method: &'static str,
        pub url: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    fn owned(headers: &[(&str, &str)]) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[derive(Debug, Clone)]
    pub struct RecordingTransport {
        pub sent: Rc<RefCell<Vec<SentRequest>>>,
        pub status: Rc<RefCell<Result<u16, String>>>,
    }

    impl RecordingTransport {
        pub fn answering(status: u16) -> Self {
            Self {
                sent: Rc::default(),
                status: Rc::new(RefCell::new(Ok(status))),
            }
        }

        pub fn posts(&self) -> Vec<SentRequest> {
            self.sent
                .borrow()
                .iter()
                .filter(|request| request.method == "POST")
                .cloned()
                .collect()
        }

        fn respond(&self) -> Result<HttpResponse, String> {
            self.status.borrow().clone().map(|status| HttpResponse {
                status,
                body: String::new(),
            })
        }
    }

    impl HttpTransport for RecordingTransport {
        fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, String> {
            self.sent.borrow_mut().push(SentRequest {
                method: "GET",
                url: url.to_string(),
                headers: owned(headers),
                body: String::new(),
            });
            self.respond()
        }

        fn post(
            &mut self,
            url: &str,
            headers: &[(&str, &str)],
            body: &[u8],
        ) -> Result<HttpResponse, String> {
            self.sent.borrow_mut().push(SentRequest {
                method: "POST",
                url: url.to_string(),
                headers: owned(headers),
                body: String::from_utf8_lossy(body).into_owned(),
            });
            self.respond()
        }
    }
}
