use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::temperature::{Temperature, TemperatureUnit};

/// Vendor-assigned device identifier. The API sends these as numbers or
/// strings; they are carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub i64);

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterMode {
    Heat,
    Auto,
    /// A mode code this crate has no name for. Never written back.
    Unknown(i64),
}

impl HeaterMode {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => HeaterMode::Heat,
            3 => HeaterMode::Auto,
            other => HeaterMode::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            HeaterMode::Heat => 1,
            HeaterMode::Auto => 3,
            HeaterMode::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for HeaterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaterMode::Heat => f.write_str("Heat"),
            HeaterMode::Auto => f.write_str("Auto"),
            HeaterMode::Unknown(code) => write!(f, "Mode {code}"),
        }
    }
}

/// Settings the vendor API reports but refuses to accept writes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadOnlySetting {
    FreezeProtect,
    ChildLock,
    Hold,
    PermanentHold,
    Notification,
}

impl fmt::Display for ReadOnlySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadOnlySetting::FreezeProtect => "freeze protection",
            ReadOnlySetting::ChildLock => "child lock",
            ReadOnlySetting::Hold => "hold",
            ReadOnlySetting::PermanentHold => "permanent hold",
            ReadOnlySetting::Notification => "notifications",
        };
        f.write_str(name)
    }
}

/// One slot of a schedule: wall-clock time, target, per-slot switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub time: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Schedule as embedded in a device detail payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduleSummary {
    pub id: Option<ScheduleId>,
    pub name: Option<String>,
    pub active: bool,
    pub temperature: Option<f64>,
    pub entries: Vec<ScheduleEntry>,
}

/// Schedule as owned by the vendor API.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub id: ScheduleId,
    pub device_id: Option<DeviceId>,
    pub name: Option<String>,
    pub enabled: bool,
    pub temperature: Option<f64>,
    pub trigger_time: Option<String>,
    pub day: Option<String>,
    pub entries: Vec<ScheduleEntry>,
}

/// Body for schedule creation and update. Entry temperatures are in `unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub device_id: Option<DeviceId>,
    pub enabled: bool,
    pub name: Option<String>,
    pub unit: TemperatureUnit,
    pub entries: Vec<ScheduleEntry>,
}

impl ScheduleRequest {
    pub fn for_device(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            enabled: true,
            name: None,
            unit: TemperatureUnit::Fahrenheit,
            entries: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unit(mut self, unit: TemperatureUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn entry(mut self, time: impl Into<String>, temperature: f64) -> Self {
        self.entries.push(ScheduleEntry {
            time: time.into(),
            temperature: Some(temperature),
            enabled: true,
        });
        self
    }
}

/// Night light state as the vendor reports it. Keys not modelled here are
/// kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NightLightSetting {
    pub brightness: Option<u8>,
    pub color: Option<serde_json::Value>,
    pub auto: Option<bool>,
    pub on: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NightLightUpdate {
    pub brightness: Option<u8>,
    pub color: Option<serde_json::Value>,
    pub auto: Option<bool>,
    pub on: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PilotLightSetting {
    pub brightness: Option<u8>,
    pub always_on: Option<bool>,
    pub auto_dim: Option<bool>,
    pub auto_dim_time: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PilotLightUpdate {
    pub brightness: Option<u8>,
    pub always_on: Option<bool>,
    pub auto_dim: Option<bool>,
    pub auto_dim_time: Option<u32>,
}

/// Normalized state of one heater as last observed. Temperatures stay in
/// `temperature_unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub name: String,
    pub location: Option<String>,
    pub firmware_version: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub online: bool,
    pub powered_on: bool,
    pub ambient_temperature: Option<Temperature>,
    pub target_temperature: Option<Temperature>,
    pub temperature_unit: TemperatureUnit,
    pub mode: Option<HeaterMode>,
    pub signal_strength: Option<i64>,
    pub ssid: Option<String>,
    pub schedule: Option<ScheduleSummary>,
    pub child_lock: bool,
    pub freeze_protect: bool,
    pub hold: bool,
    pub permanent_hold: bool,
    pub notifications: bool,
    pub geofence_active: bool,
    pub night_light: Option<NightLightSetting>,
    pub pilot_light: Option<PilotLightSetting>,
    /// Vendor's own report timestamp, verbatim.
    pub reported_at: Option<String>,
    /// When this snapshot was fetched.
    pub last_updated: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn setting(&self, setting: ReadOnlySetting) -> bool {
        match setting {
            ReadOnlySetting::FreezeProtect => self.freeze_protect,
            ReadOnlySetting::ChildLock => self.child_lock,
            ReadOnlySetting::Hold => self.hold,
            ReadOnlySetting::PermanentHold => self.permanent_hold,
            ReadOnlySetting::Notification => self.notifications,
        }
    }
}

/// Changes observed between two published aggregates.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceDiscovered { device_id: DeviceId, name: String },
    DeviceRemoved { device_id: DeviceId },
    OnlineChanged { device_id: DeviceId, online: bool },
    AmbientTemperatureChanged { device_id: DeviceId, temp: Temperature },
    TargetTemperatureChanged { device_id: DeviceId, temp: Temperature },
    PowerChanged { device_id: DeviceId, on: bool },
    ModeChanged { device_id: DeviceId, mode: HeaterMode },
    DeviceFetchFailed { device_id: DeviceId, consecutive: u32 },
}
