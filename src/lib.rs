mod auth;
mod client;
pub mod config;
mod coordinator;
mod diff;
mod error;
mod logger;
mod protocol;
mod retry;
pub mod temperature;
mod types;

pub use auth::{AuthPhase, DEFAULT_REFRESH_MARGIN, token_expiry};
pub use client::{EnviClient, EnviClientBuilder};
pub use config::Config;
pub use coordinator::{Aggregate, Coordinator, CoordinatorBuilder, CycleReport, DeviceSource, PollHandle};
pub use error::{Error, Result, ValidationError};
pub use logger::MessageLogMode;
pub use protocol::DEFAULT_BASE_URL;
pub use retry::{RetryPolicy, parse_retry_after};
pub use temperature::{Temperature, TemperatureUnit, convert, validate_target_temperature};
pub use types::*;
