pub mod bootstrap;
pub mod config;
pub mod control;
pub mod cycle;
pub mod identity;
pub mod influx;
pub mod mode;
pub mod pages;
pub mod point;
pub mod runtime;
pub mod sensors;
pub mod store;
pub mod types;
pub mod web;

pub use bootstrap::{
    should_prompt, AssociationError, BootOutcome, BootPhase, BootReport, BootSequence, ClockSync,
    NetworkAssociator, PortalSubmission, AUTO_CONNECT_TIMEOUT, RESTART_DELAY,
};
pub use config::{ConfigUpdate, ConnectionFields, LoggerConfig, RoomsUpdate, MAX_SENSORS};
pub use control::{channel, Clock, ControlHandle, ControlLoop, Envelope};
pub use cycle::{run_cycle, CycleFailure, CycleReport, StatusIndicator};
pub use identity::{derive_device_id, enforce_device_id, parse_mac};
pub use influx::{
    ClientFactory, HttpResponse, HttpTransport, InfluxClient, InfluxClientFactory,
    TimeSeriesClient, UploadError,
};
pub use mode::{LoggerMode, ModeParseError};
pub use runtime::{Logger, SaveError};
pub use sensors::{RomCode, SensorBus, DISCONNECTED_C};
pub use store::{BlobStore, StoreError};
pub use web::{Method, PostAction, Route, WebReply, WebRequest};
