use std::time::Duration;

use thiserror::Error;

use crate::types::{DeviceId, ReadOnlySetting, ScheduleId};

/// Input rejected before any network call was made.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid temperature unit: {0:?} (expected \"C\" or \"F\")")]
    InvalidUnit(String),

    #[error("target temperature {value_f:.3}\u{00b0}F outside {min_f}..={max_f}\u{00b0}F")]
    OutOfRange { value_f: f64, min_f: f64, max_f: f64 },

    #[error("temperature is not a finite number")]
    NotFinite,

    #[error("invalid time of day: {0:?} (expected HH:MM:SS)")]
    InvalidTime(String),

    #[error("mode {0} cannot be written")]
    UnsupportedMode(i64),

    #[error("brightness {0} outside 0..=100")]
    Brightness(u8),

    #[error("device id is empty")]
    EmptyDeviceId,

    #[error("schedule creation requires a device id")]
    MissingScheduleDevice,

    #[error("poll interval {0:?} outside 10..=300 seconds")]
    PollInterval(Duration),

    #[error("API timeout {0:?} outside 5..=60 seconds")]
    ApiTimeout(Duration),

    #[error("missing configuration key: {0}")]
    MissingConfig(&'static str),

    #[error("invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("API error from {endpoint}: {message}")]
    Api {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("device {device_id} rejected the request: {message}")]
    DeviceRejected { device_id: DeviceId, message: String },

    #[error("invalid payload for device {device_id}: {reason}")]
    InvalidDevicePayload { device_id: DeviceId, reason: String },

    #[error("schedule {0} not found")]
    ScheduleNotFound(ScheduleId),

    #[error("{setting} is read-only on device {device_id}")]
    ReadOnlySetting {
        device_id: DeviceId,
        setting: ReadOnlySetting,
    },

    #[error("giving up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("no result within the {0:?} cycle deadline")]
    DeadlineExceeded(Duration),

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors the coordinator treats as device-scoped rather than cycle-scoped.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound(_)
                | Error::DeviceRejected { .. }
                | Error::InvalidDevicePayload { .. }
                | Error::ReadOnlySetting { .. }
                | Error::ScheduleNotFound(_)
        )
    }

    /// Transport failures and 5xx responses; these are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Error::Server { status } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }

    pub(crate) fn api(endpoint: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Api {
            endpoint: endpoint.to_string(),
            status,
            message: message.into(),
        }
    }

    /// Re-scope an API rejection onto the device the call targeted.
    pub(crate) fn for_device(self, device_id: &DeviceId) -> Self {
        match self {
            Error::Api {
                status: Some(404), ..
            } => Error::DeviceNotFound(device_id.clone()),
            Error::Api {
                status: Some(status),
                message,
                ..
            } if (400..500).contains(&status) => Error::DeviceRejected {
                device_id: device_id.clone(),
                message,
            },
            Error::Api {
                status: None,
                message,
                ..
            } => Error::DeviceRejected {
                device_id: device_id.clone(),
                message,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
