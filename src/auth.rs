use std::sync::RwLock;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{self, LOGIN, USER_AGENT};
use crate::{Error, Result};

pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    fn is_fresh(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        now < self.expires_at - margin
    }
}

#[derive(Debug)]
struct State {
    phase: AuthPhase,
    credential: Option<Credential>,
    /// Bumped every time a login attempt finishes, success or not.
    generation: u64,
    last_failure: Option<String>,
}

/// Read the `exp` claim from a JWT without verifying it.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = match claims.get("exp")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(exp, 0)
}

/// Owns the session credential. Logins are single-flight: callers that
/// arrive while one is running wait for it and share its outcome.
pub(crate) struct Authenticator {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    margin: TimeDelta,
    state: RwLock<State>,
    login_lock: tokio::sync::Mutex<()>,
}

impl Authenticator {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        username: String,
        password: String,
        margin: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            username,
            password,
            margin: TimeDelta::from_std(margin).unwrap_or_else(|_| TimeDelta::days(365)),
            state: RwLock::new(State {
                phase: AuthPhase::Unauthenticated,
                credential: None,
                generation: 0,
                last_failure: None,
            }),
            login_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.state.read().unwrap_or_else(|e| e.into_inner()).phase
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .credential
            .as_ref()
            .map(|c| c.expires_at)
    }

    fn fresh_token(&self) -> (Option<String>, u64) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let token = state
            .credential
            .as_ref()
            .filter(|c| c.is_fresh(Utc::now(), self.margin))
            .map(|c| c.token.clone());
        (token, state.generation)
    }

    /// A bearer token valid for at least the refresh margin.
    pub async fn bearer(&self) -> Result<String> {
        let (token, seen_generation) = self.fresh_token();
        if let Some(token) = token {
            return Ok(token);
        }

        let _guard = self.login_lock.lock().await;

        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = state
                .credential
                .as_ref()
                .filter(|c| c.is_fresh(Utc::now(), self.margin))
            {
                return Ok(c.token.clone());
            }
            // A login finished while we waited and it failed; share the failure.
            if state.generation != seen_generation
                && let Some(ref failure) = state.last_failure
            {
                return Err(Error::Authentication(failure.clone()));
            }
        }

        let refreshing = self.set_phase_for_login();
        debug!(refreshing, "logging in");

        match self.login().await {
            Ok(credential) => {
                info!(
                    expires_at = %credential.expires_at.format("%Y-%m-%d %H:%M"),
                    "login successful"
                );
                let token = credential.token.clone();
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                state.credential = Some(credential);
                state.phase = AuthPhase::Authenticated;
                state.generation += 1;
                state.last_failure = None;
                Ok(token)
            }
            Err(e) => {
                warn!("login failed: {e}");
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                state.credential = None;
                state.phase = AuthPhase::Unauthenticated;
                state.generation += 1;
                state.last_failure = Some(e.to_string());
                Err(Error::Authentication(e))
            }
        }
    }

    fn set_phase_for_login(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let refreshing = state.credential.is_some();
        state.phase = if refreshing {
            AuthPhase::Refreshing
        } else {
            AuthPhase::Authenticating
        };
        refreshing
    }

    /// Drop the credential if it is still the one the server rejected.
    pub fn invalidate(&self, rejected: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.credential.as_ref().is_some_and(|c| c.token == rejected) {
            debug!("credential rejected by server, forcing login");
            state.credential = None;
            state.phase = AuthPhase::Unauthenticated;
        }
    }

    async fn login(&self) -> std::result::Result<Credential, String> {
        let url = format!("{}/{LOGIN}", self.base_url);
        let body = protocol::login_message(&self.username, &self.password);

        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("login request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("login failed (HTTP {})", status.as_u16()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("unreadable login response: {e}"))?;
        let token = protocol::parse_login_token(&body)?;

        let expires_at = match token_expiry(&token) {
            Some(exp) => exp,
            None => {
                debug!("token has no readable exp claim, assuming 24h lifetime");
                Utc::now() + TimeDelta::hours(24)
            }
        };
        Ok(Credential { token, expires_at })
    }
}
