//! Runtime configuration read from the environment.

use std::time::Duration;

use crate::error::ValidationError;
use crate::protocol::DEFAULT_BASE_URL;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(300);

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(15);
pub const MIN_API_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_API_TIMEOUT: Duration = Duration::from_secs(60);

pub fn validate_poll_interval(interval: Duration) -> Result<Duration, ValidationError> {
    if (MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&interval) {
        Ok(interval)
    } else {
        Err(ValidationError::PollInterval(interval))
    }
}

pub fn validate_api_timeout(timeout: Duration) -> Result<Duration, ValidationError> {
    if (MIN_API_TIMEOUT..=MAX_API_TIMEOUT).contains(&timeout) {
        Ok(timeout)
    } else {
        Err(ValidationError::ApiTimeout(timeout))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub base_url: String,
    /// Coordinator cadence, 10..=300 seconds.
    pub poll_interval: Duration,
    /// Per-request HTTP timeout, 5..=60 seconds.
    pub api_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ValidationError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username = get("ENVI_USERNAME").ok_or(ValidationError::MissingConfig("ENVI_USERNAME"))?;
        let password = get("ENVI_PASSWORD").ok_or(ValidationError::MissingConfig("ENVI_PASSWORD"))?;
        let base_url = get("ENVI_BASE_URL")
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ValidationError> {
            match get(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ValidationError::InvalidConfig { key, value: raw }),
            }
        };

        Ok(Config {
            username: username.trim().to_string(),
            password,
            base_url,
            poll_interval: validate_poll_interval(secs("ENVI_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL)?)?,
            api_timeout: validate_api_timeout(secs("ENVI_API_TIMEOUT_SECS", DEFAULT_API_TIMEOUT)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_applied() {
        let cfg = Config::from_lookup(lookup(&[("ENVI_USERNAME", "me@example.com"), ("ENVI_PASSWORD", "pw")]))
            .unwrap();
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.api_timeout, Duration::from_secs(15));
    }

    #[test]
    fn overrides_parsed() {
        let cfg = Config::from_lookup(lookup(&[
            ("ENVI_USERNAME", "me"),
            ("ENVI_PASSWORD", "pw"),
            ("ENVI_BASE_URL", "http://localhost:8080/api/"),
            ("ENVI_POLL_INTERVAL_SECS", "300"),
            ("ENVI_API_TIMEOUT_SECS", " 5 "),
        ]))
        .unwrap();
        assert_eq!(cfg.base_url, "http://localhost:8080/api");
        assert_eq!(cfg.poll_interval, Duration::from_secs(300));
        assert_eq!(cfg.api_timeout, Duration::from_secs(5));
    }

    #[test]
    fn missing_credentials() {
        assert_eq!(
            Config::from_lookup(lookup(&[("ENVI_PASSWORD", "pw")])).unwrap_err(),
            ValidationError::MissingConfig("ENVI_USERNAME")
        );
        assert_eq!(
            Config::from_lookup(lookup(&[("ENVI_USERNAME", "me"), ("ENVI_PASSWORD", "  ")])).unwrap_err(),
            ValidationError::MissingConfig("ENVI_PASSWORD")
        );
    }

    #[test]
    fn out_of_range_values_rejected() {
        let base = [("ENVI_USERNAME", "me"), ("ENVI_PASSWORD", "pw")];
        let with = |k: &'static str, v: &'static str| {
            let mut pairs = base.to_vec();
            pairs.push((k, v));
            Config::from_lookup(lookup(&pairs))
        };
        assert!(matches!(with("ENVI_POLL_INTERVAL_SECS", "9"), Err(ValidationError::PollInterval(_))));
        assert!(matches!(with("ENVI_POLL_INTERVAL_SECS", "301"), Err(ValidationError::PollInterval(_))));
        assert!(matches!(with("ENVI_API_TIMEOUT_SECS", "61"), Err(ValidationError::ApiTimeout(_))));
        assert!(matches!(
            with("ENVI_API_TIMEOUT_SECS", "soon"),
            Err(ValidationError::InvalidConfig { key: "ENVI_API_TIMEOUT_SECS", .. })
        ));
    }

    #[test]
    fn range_edges_inclusive() {
        assert!(validate_poll_interval(Duration::from_secs(10)).is_ok());
        assert!(validate_poll_interval(Duration::from_secs(300)).is_ok());
        assert!(validate_poll_interval(Duration::from_millis(9_999)).is_err());
        assert!(validate_api_timeout(Duration::from_secs(5)).is_ok());
        assert!(validate_api_timeout(Duration::from_secs(60)).is_ok());
        assert!(validate_api_timeout(Duration::from_secs(4)).is_err());
    }
}
