use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::auth::{AuthPhase, Authenticator, DEFAULT_REFRESH_MARGIN};
use crate::config::{self, Config, DEFAULT_API_TIMEOUT};
use crate::coordinator::DeviceSource;
use crate::error::ValidationError;
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{self, DEFAULT_BASE_URL, DEVICE_LIST, SCHEDULE_ADD, SCHEDULE_LIST};
use crate::retry::{self, Failure, RetryPolicy, parse_retry_after};
use crate::temperature::{TemperatureUnit, round_tenth, validate_target_temperature};
use crate::types::*;
use crate::{Error, Result};

pub struct EnviClientBuilder {
    username: String,
    password: String,
    base_url: String,
    api_timeout: Duration,
    retry_policy: RetryPolicy,
    refresh_margin: Duration,
    log_mode: Option<MessageLogMode>,
    log_path: Option<PathBuf>,
}

impl EnviClientBuilder {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_timeout: DEFAULT_API_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            log_mode: None,
            log_path: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Per-request timeout; must be within 5..=60 seconds.
    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// How long before expiry the token is renewed.
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<PathBuf>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<EnviClient> {
        let timeout = config::validate_api_timeout(self.api_timeout)?;
        if self.username.trim().is_empty() {
            return Err(ValidationError::MissingConfig("username").into());
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        let journal = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, path)?)),
            _ => None,
        };

        let auth = Authenticator::new(
            http.clone(),
            self.base_url.clone(),
            self.username,
            self.password,
            self.refresh_margin,
        );

        Ok(EnviClient {
            http,
            base_url: self.base_url,
            auth,
            policy: self.retry_policy,
            units: Mutex::new(HashMap::new()),
            journal,
        })
    }
}

/// Session against the vendor cloud API. Safe to share behind an `Arc`;
/// every operation takes `&self`.
pub struct EnviClient {
    http: reqwest::Client,
    base_url: String,
    auth: Authenticator,
    policy: RetryPolicy,
    /// Native unit per device, learned from detail fetches.
    units: Mutex<HashMap<DeviceId, TemperatureUnit>>,
    journal: Option<Mutex<MessageLogger>>,
}

fn check_id(id: &DeviceId) -> std::result::Result<(), ValidationError> {
    if id.as_str().trim().is_empty() {
        Err(ValidationError::EmptyDeviceId)
    } else {
        Ok(())
    }
}

fn check_brightness(brightness: Option<u8>) -> std::result::Result<(), ValidationError> {
    match brightness {
        Some(b) if b > 100 => Err(ValidationError::Brightness(b)),
        _ => Ok(()),
    }
}

impl EnviClient {
    pub fn builder(username: impl Into<String>, password: impl Into<String>) -> EnviClientBuilder {
        EnviClientBuilder::new(username, password)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        EnviClientBuilder::new(&config.username, &config.password)
            .base_url(&config.base_url)
            .api_timeout(config.api_timeout)
            .build()
    }

    pub fn auth_phase(&self) -> AuthPhase {
        self.auth.phase()
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.auth.expires_at()
    }

    fn journal(&self, f: impl FnOnce(&mut MessageLogger)) {
        if let Some(ref journal) = self.journal {
            let mut logger = journal.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut logger);
        }
    }

    /// One attempt: authenticate, send, classify the outcome.
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Value, Failure> {
        let token = self.auth.bearer().await.map_err(Failure::Fatal)?;
        let url = format!("{}/{path}", self.base_url);

        let mut req = self
            .http
            .request(method, &url)
            .bearer_auth(&token)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, protocol::USER_AGENT);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| Failure::from(Error::Http(e)))?;
        let status = resp.status();
        trace!(path, status = status.as_u16(), "response");

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.auth.invalidate(&token);
                return Err(Failure::Reauthenticate);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp.headers().get(RETRY_AFTER).and_then(parse_retry_after);
                return Err(Failure::RateLimited { retry_after });
            }
            s if s.is_server_error() => {
                return Err(Failure::from(Error::Server { status: s.as_u16() }));
            }
            _ => {}
        }

        let text = resp.text().await.map_err(|e| Failure::from(Error::Http(e)))?;
        let body: Value = if text.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text).map_err(|e| {
                Failure::Fatal(Error::api(path, Some(status.as_u16()), format!("invalid JSON: {e}")))
            })?
        };
        self.journal(|j| j.log_response(status.as_u16(), path, &body));

        if !status.is_success() {
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .or_else(|| status.canonical_reason())
                .unwrap_or("request failed");
            return Err(Failure::Fatal(Error::api(path, Some(status.as_u16()), msg)));
        }
        protocol::check_envelope(path, body).map_err(Failure::Fatal)
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        debug!(%method, path, "api call");
        retry::run(&self.policy, path, || self.send_once(method.clone(), path, body)).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.journal(|j| j.log_request("GET", path));
        self.request(Method::GET, path, None).await
    }

    /// PATCH a partial update onto one device.
    async fn update(&self, id: &DeviceId, action: &str, data: Value) -> Result<()> {
        self.journal(|j| j.log_command(action, Some(id), &data));
        debug!(device_id = %id, action, "sending update");
        self.request(Method::PATCH, &protocol::device_update_path(id), Some(&data))
            .await
            .map_err(|e| e.for_device(id))?;
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceId>> {
        let body = self.get(DEVICE_LIST).await?;
        let ids = protocol::parse_device_list(&body)?;
        debug!(count = ids.len(), "listed devices");
        Ok(ids)
    }

    pub async fn get_device(&self, id: &DeviceId) -> Result<DeviceSnapshot> {
        check_id(id)?;
        let body = self
            .get(&protocol::device_path(id))
            .await
            .map_err(|e| e.for_device(id))?;
        let snapshot = protocol::parse_device(id, &body, Utc::now())?;
        self.units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), snapshot.temperature_unit);
        Ok(snapshot)
    }

    async fn native_unit(&self, id: &DeviceId) -> Result<TemperatureUnit> {
        let cached = self
            .units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied();
        match cached {
            Some(unit) => Ok(unit),
            None => Ok(self.get_device(id).await?.temperature_unit),
        }
    }

    /// Set the target temperature. `value` is in `unit`; the device receives
    /// it in its own unit.
    pub async fn set_temperature(&self, id: &DeviceId, value: f64, unit: TemperatureUnit) -> Result<()> {
        check_id(id)?;
        let value_f = validate_target_temperature(value, unit)?;
        let native = self.native_unit(id).await?;
        let wire = if native == unit {
            value
        } else {
            round_tenth(TemperatureUnit::Fahrenheit.convert(value_f, native))
        };
        self.update(id, "set_temperature", protocol::set_temperature_data(wire))
            .await
    }

    pub async fn set_state(&self, id: &DeviceId, on: bool) -> Result<()> {
        check_id(id)?;
        self.update(id, "set_state", protocol::set_state_data(on)).await
    }

    pub async fn set_mode(&self, id: &DeviceId, mode: HeaterMode) -> Result<()> {
        check_id(id)?;
        if let HeaterMode::Unknown(code) = mode {
            return Err(ValidationError::UnsupportedMode(code).into());
        }
        self.update(id, "set_mode", protocol::set_mode_data(mode)).await
    }

    pub async fn set_night_light(&self, id: &DeviceId, change: NightLightUpdate) -> Result<()> {
        check_id(id)?;
        check_brightness(change.brightness)?;
        let mut setting = self.get_device(id).await?.night_light.unwrap_or_default();
        if change.brightness.is_some() {
            setting.brightness = change.brightness;
        }
        if change.color.is_some() {
            setting.color = change.color;
        }
        if change.auto.is_some() {
            setting.auto = change.auto;
        }
        if change.on.is_some() {
            setting.on = change.on;
        }
        self.update(id, "set_night_light", protocol::night_light_data(&setting))
            .await
    }

    pub async fn set_pilot_light(&self, id: &DeviceId, change: PilotLightUpdate) -> Result<()> {
        check_id(id)?;
        check_brightness(change.brightness)?;
        let mut setting = self.get_device(id).await?.pilot_light.unwrap_or_default();
        if change.brightness.is_some() {
            setting.brightness = change.brightness;
        }
        if change.always_on.is_some() {
            setting.always_on = change.always_on;
        }
        if change.auto_dim.is_some() {
            setting.auto_dim = change.auto_dim;
        }
        if change.auto_dim_time.is_some() {
            setting.auto_dim_time = change.auto_dim_time;
        }
        self.update(id, "set_pilot_light", protocol::pilot_light_data(&setting))
            .await
    }

    /// Current value of a read-only setting, from a fresh fetch.
    pub async fn get_setting(&self, id: &DeviceId, setting: ReadOnlySetting) -> Result<bool> {
        Ok(self.get_device(id).await?.setting(setting))
    }

    /// The vendor rejects writes to these settings, so this fails without
    /// touching the network.
    pub fn set_setting(&self, id: &DeviceId, setting: ReadOnlySetting, _enabled: bool) -> Result<()> {
        check_id(id)?;
        Err(Error::ReadOnlySetting {
            device_id: id.clone(),
            setting,
        })
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let body = self.get(SCHEDULE_LIST).await?;
        protocol::parse_schedule_list(&body)
    }

    /// Looked up through the schedule list.
    pub async fn get_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.list_schedules()
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(Error::ScheduleNotFound(id))
    }

    /// Validate every entry and rewrite it as the vendor expects: Fahrenheit,
    /// `HH:MM:SS`.
    fn schedule_body(req: &ScheduleRequest) -> Result<Value> {
        if let Some(ref id) = req.device_id {
            check_id(id)?;
        }
        let mut entries = Vec::with_capacity(req.entries.len());
        for entry in &req.entries {
            let time = protocol::normalize_time_of_day(&entry.time)?;
            let temperature = match entry.temperature {
                Some(t) => {
                    let f = validate_target_temperature(t, req.unit)?;
                    Some(if req.unit == TemperatureUnit::Fahrenheit { t } else { round_tenth(f) })
                }
                None => None,
            };
            entries.push(ScheduleEntry {
                time,
                temperature,
                enabled: entry.enabled,
            });
        }
        Ok(protocol::schedule_data(req, &entries))
    }

    /// Returns the vendor-assigned id when the response carries one.
    pub async fn create_schedule(&self, req: &ScheduleRequest) -> Result<Option<ScheduleId>> {
        let device = req
            .device_id
            .as_ref()
            .ok_or(ValidationError::MissingScheduleDevice)?;
        let body = Self::schedule_body(req)?;
        self.journal(|j| j.log_command("create_schedule", Some(device), &body));
        let resp = self.request(Method::POST, SCHEDULE_ADD, Some(&body)).await?;
        let id = resp.pointer("/data/id").and_then(Value::as_i64).map(ScheduleId);
        debug!(device_id = %device, schedule_id = ?id, "schedule created");
        Ok(id)
    }

    pub async fn update_schedule(&self, id: ScheduleId, req: &ScheduleRequest) -> Result<()> {
        let body = Self::schedule_body(req)?;
        self.journal(|j| j.log_command("update_schedule", req.device_id.as_ref(), &body));
        self.request(Method::PUT, &protocol::schedule_path(id), Some(&body))
            .await
            .map_err(|e| schedule_error(e, id))?;
        Ok(())
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        self.journal(|j| j.log_command("delete_schedule", None, &json!({ "id": id })));
        self.request(Method::DELETE, &protocol::schedule_path(id), None)
            .await
            .map_err(|e| schedule_error(e, id))?;
        Ok(())
    }
}

impl DeviceSource for EnviClient {
    async fn list_devices(&self) -> Result<Vec<DeviceId>> {
        EnviClient::list_devices(self).await
    }

    async fn get_device(&self, id: &DeviceId) -> Result<DeviceSnapshot> {
        EnviClient::get_device(self, id).await
    }
}

fn schedule_error(e: Error, id: ScheduleId) -> Error {
    match e {
        Error::Api {
            status: Some(404), ..
        } => Error::ScheduleNotFound(id),
        other => other,
    }
}
