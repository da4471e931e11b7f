use chrono::{DateTime, NaiveTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result, ValidationError};
use crate::temperature::{Temperature, TemperatureUnit};
use crate::types::*;

pub const DEFAULT_BASE_URL: &str = "https://app-apis.enviliving.com/apis/v1";
pub const USER_AGENT: &str = "smart-envi-rs/0.1";

pub const LOGIN: &str = "auth/login";
pub const DEVICE_LIST: &str = "device/list";
pub const SCHEDULE_LIST: &str = "schedule/list";
pub const SCHEDULE_ADD: &str = "schedule/add";

pub fn device_path(id: &DeviceId) -> String {
    format!("device/{id}")
}

pub fn device_update_path(id: &DeviceId) -> String {
    format!("device/update-temperature/{id}")
}

pub fn schedule_path(id: ScheduleId) -> String {
    format!("schedule/{id}")
}

/// Each login registers a fresh client device id with the vendor.
pub fn login_message(username: &str, password: &str) -> Value {
    let simple = Uuid::new_v4().simple().to_string();
    let device_id = format!("rs_{}_{}", Utc::now().timestamp(), &simple[..8]);
    json!({
        "username": username,
        "password": password,
        "login_type": 1,
        "device_id": device_id,
        "device_type": "homeassistant",
    })
}

pub fn set_temperature_data(value: f64) -> Value {
    json!({ "temperature": value })
}

pub fn set_state_data(on: bool) -> Value {
    json!({ "state": if on { 1 } else { 0 } })
}

pub fn set_mode_data(mode: HeaterMode) -> Value {
    json!({ "mode": mode.code() })
}

pub fn night_light_data(setting: &NightLightSetting) -> Value {
    json!({ "night_light_setting": setting })
}

pub fn pilot_light_data(setting: &PilotLightSetting) -> Value {
    json!({ "pilot_light_setting": setting })
}

/// Entries must already be validated and normalized (Fahrenheit, HH:MM:SS).
pub fn schedule_data(req: &ScheduleRequest, entries: &[ScheduleEntry]) -> Value {
    let mut body = Map::new();
    if let Some(ref device_id) = req.device_id {
        body.insert("device_id".into(), json!(device_id));
    }
    body.insert("enabled".into(), json!(req.enabled));
    if let Some(ref name) = req.name {
        body.insert("name".into(), json!(name));
    }
    body.insert("times".into(), json!(entries));
    Value::Object(body)
}

/// Normalize a time of day to `HH:MM:SS`. `HH:MM` is accepted as well.
pub fn normalize_time_of_day(raw: &str) -> std::result::Result<String, ValidationError> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map(|t| t.format("%H:%M:%S").to_string())
        .map_err(|_| ValidationError::InvalidTime(raw.to_string()))
}

/// Check the `{status, statusCode, msgCode, msg, data}` envelope and hand
/// back the body. A `status` other than "success" is an error even under
/// HTTP 200.
pub fn check_envelope(endpoint: &str, body: Value) -> Result<Value> {
    let Value::Object(ref obj) = body else {
        return Err(Error::api(endpoint, None, "response is not a JSON object"));
    };
    let failed = match obj.get("status") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => s != "success",
        Some(_) => true,
    };
    if !failed {
        return Ok(body);
    }

    let msg = obj.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
    let code = obj
        .get("msgCode")
        .map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "unknown".to_string());
    let status = obj
        .get("statusCode")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok());
    debug!(endpoint, msg, code = %code, "API reported failure");
    Err(Error::api(endpoint, status, format!("{msg} (code: {code})")))
}

fn data_field<'a>(endpoint: &str, body: &'a Value) -> Result<&'a Value> {
    body.get("data")
        .ok_or_else(|| Error::api(endpoint, None, "response is missing `data`"))
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_device_list(body: &Value) -> Result<Vec<DeviceId>> {
    let Value::Array(entries) = data_field(DEVICE_LIST, body)? else {
        return Err(Error::api(DEVICE_LIST, None, "`data` is not an array"));
    };
    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.get("id").and_then(id_string) {
            Some(id) => ids.push(DeviceId::new(id)),
            None => warn!(entry = %entry, "device list entry without an id, skipping"),
        }
    }
    Ok(ids)
}

pub fn parse_schedule_list(body: &Value) -> Result<Vec<Schedule>> {
    let Value::Array(entries) = data_field(SCHEDULE_LIST, body)? else {
        return Err(Error::api(SCHEDULE_LIST, None, "`data` is not an array"));
    };
    let mut schedules = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_schedule(entry) {
            Some(s) => schedules.push(s),
            None => warn!(entry = %entry, "schedule entry without a numeric id, skipping"),
        }
    }
    Ok(schedules)
}

fn parse_schedule(v: &Value) -> Option<Schedule> {
    let id = v.get("id").and_then(Value::as_i64)?;
    Some(Schedule {
        id: ScheduleId(id),
        device_id: v.get("device_id").and_then(id_string).map(DeviceId::new),
        name: v
            .get("name")
            .or_else(|| v.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string),
        enabled: v.get("enabled").and_then(flag_value).unwrap_or(false),
        temperature: v.get("temperature").and_then(Value::as_f64),
        trigger_time: v.get("trigger_time").and_then(Value::as_str).map(str::to_string),
        day: v.get("day").and_then(|d| match d {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        entries: parse_entries(v.get("times")),
    })
}

fn parse_entries(v: Option<&Value>) -> Vec<ScheduleEntry> {
    let Some(Value::Array(items)) = v else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(entry = %item, "unreadable schedule slot: {e}");
                None
            }
        })
        .collect()
}

/// Accepts booleans, 0/1 and their string spellings.
fn flag_value(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.as_str() {
            "true" | "True" | "1" => Some(true),
            "false" | "False" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Typed, strict accessors over a device payload object.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn string(&self, key: &str) -> std::result::Result<Option<String>, String> {
        match self.obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(format!("`{key}` should be a string, got {other}")),
        }
    }

    fn number(&self, key: &str) -> std::result::Result<Option<f64>, String> {
        match self.obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(other) => Err(format!("`{key}` should be a number, got {other}")),
        }
    }

    fn integer(&self, key: &str) -> std::result::Result<Option<i64>, String> {
        match self.obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| format!("`{key}` out of range")),
            Some(other) => Err(format!("`{key}` should be an integer, got {other}")),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.obj.get(key).and_then(flag_value).unwrap_or(false)
    }

    /// The vendor reports lock and freeze protection inverted: a raw `true`
    /// means the feature is off.
    fn inverted_flag(&self, key: &str, missing: bool) -> bool {
        match self.obj.get(key) {
            None => missing,
            Some(Value::Null) => true,
            Some(v) => flag_value(v).map(|raw| !raw).unwrap_or(missing),
        }
    }

    /// Light settings are loose objects; anything else is ignored.
    fn nested(&self, key: &str) -> Option<&'a Map<String, Value>> {
        match self.obj.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Object(m)) => Some(m),
            Some(other) => {
                debug!(key, value = %other, "expected an object, ignoring");
                None
            }
        }
    }
}

/// Accepts non-negative integers, whole floats and numeric strings.
fn small_uint<T: TryFrom<u64>>(v: &Value) -> Option<T> {
    let n = match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    T::try_from(n).ok()
}

/// Remove `key` from a light setting and read it. An unreadable value is
/// dropped instead of failing the device.
fn take_lenient<T>(
    rest: &mut Map<String, Value>,
    key: &str,
    read: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    let raw = rest.remove(key)?;
    if raw.is_null() {
        return None;
    }
    let value = read(&raw);
    if value.is_none() {
        debug!(key, value = %raw, "unreadable light setting field, ignoring");
    }
    value
}

fn parse_night_light(raw: &Map<String, Value>) -> NightLightSetting {
    let mut rest = raw.clone();
    NightLightSetting {
        brightness: take_lenient(&mut rest, "brightness", small_uint),
        color: rest.remove("color").filter(|c| !c.is_null()),
        auto: take_lenient(&mut rest, "auto", flag_value),
        on: take_lenient(&mut rest, "on", flag_value),
        extra: rest,
    }
}

fn parse_pilot_light(raw: &Map<String, Value>) -> PilotLightSetting {
    let mut rest = raw.clone();
    PilotLightSetting {
        brightness: take_lenient(&mut rest, "brightness", small_uint),
        always_on: take_lenient(&mut rest, "always_on", flag_value),
        auto_dim: take_lenient(&mut rest, "auto_dim", flag_value),
        auto_dim_time: take_lenient(&mut rest, "auto_dim_time", small_uint),
        extra: rest,
    }
}

/// Structural validation of a device detail body into a snapshot.
pub fn parse_device(requested: &DeviceId, body: &Value, fetched_at: DateTime<Utc>) -> Result<DeviceSnapshot> {
    let invalid = |reason: String| Error::InvalidDevicePayload {
        device_id: requested.clone(),
        reason,
    };

    let data = body
        .get("data")
        .ok_or_else(|| invalid("response is missing `data`".into()))?;
    let Value::Object(obj) = data else {
        return Err(invalid(format!("`data` should be an object, got {data}")));
    };
    let f = Fields { obj };

    let id = match obj.get("id").and_then(id_string) {
        Some(id) if id == requested.as_str() => DeviceId::new(id),
        Some(other) => return Err(invalid(format!("payload is for device {other}"))),
        None if obj.contains_key("serial_no") => requested.clone(),
        None => return Err(invalid("payload has neither `id` nor `serial_no`".into())),
    };

    let unit = match f.string("temperature_unit").map_err(invalid)? {
        Some(u) => u
            .parse::<TemperatureUnit>()
            .map_err(|e| invalid(e.to_string()))?,
        None => TemperatureUnit::Fahrenheit,
    };
    let temp = |key: &str| -> Result<Option<Temperature>> {
        Ok(f
            .number(key)
            .map_err(invalid)?
            .map(|v| Temperature::new(v, unit)))
    };

    let schedule = match obj.get("schedule") {
        Some(Value::Object(s)) => Some(ScheduleSummary {
            id: s
                .get("schedule_id")
                .or_else(|| s.get("id"))
                .and_then(Value::as_i64)
                .map(ScheduleId),
            name: s
                .get("name")
                .or_else(|| s.get("title"))
                .and_then(Value::as_str)
                .map(str::to_string),
            active: f.flag("is_schedule_active"),
            temperature: s.get("temperature").and_then(Value::as_f64),
            entries: parse_entries(s.get("times")),
        }),
        _ => None,
    };

    Ok(DeviceSnapshot {
        name: f
            .string("name")
            .map_err(invalid)?
            .unwrap_or_else(|| format!("Heater {id}")),
        location: match f.string("location_name").map_err(invalid)? {
            Some(l) => Some(l),
            None => f.string("relative_location_name").map_err(invalid)?,
        },
        firmware_version: f.string("firmware_version").map_err(invalid)?,
        model: f.string("model_no").map_err(invalid)?,
        serial: f.string("serial_no").map_err(invalid)?,
        online: f.integer("device_status").map_err(invalid)? == Some(1),
        powered_on: f.integer("state").map_err(invalid)? == Some(1),
        ambient_temperature: temp("ambient_temperature")?,
        target_temperature: temp("current_temperature")?,
        temperature_unit: unit,
        mode: f
            .integer("current_mode")
            .map_err(invalid)?
            .map(HeaterMode::from_code),
        signal_strength: f.integer("signal_strength").map_err(invalid)?,
        ssid: f.string("ssid").map_err(invalid)?,
        schedule,
        child_lock: f.inverted_flag("child_lock_setting", true),
        freeze_protect: f.inverted_flag("freeze_protect_setting", true),
        hold: f.flag("is_hold"),
        permanent_hold: f.flag("permanent_hold"),
        notifications: f.flag("notification_setting"),
        geofence_active: f.flag("is_geofence_active"),
        night_light: f.nested("night_light_setting").map(parse_night_light),
        pilot_light: f.nested("pilot_light_setting").map(parse_pilot_light),
        reported_at: match f.string("device_status_res_at").map_err(invalid)? {
            Some(t) => Some(t),
            None => f.string("device_status_req_at").map_err(invalid)?,
        },
        last_updated: fetched_at,
        id,
    })
}

/// Pull the bearer token out of a login response.
pub fn parse_login_token(body: &Value) -> std::result::Result<String, String> {
    if let Some(status) = body.get("status").and_then(Value::as_str)
        && status != "success"
    {
        let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(format!("vendor rejected login: {msg}"));
    }
    body.pointer("/data/token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "login response has no token".to_string())
}
