use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use tracing::warn;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `step` earlier backoffs:
    /// initial, 2x, 4x ... capped at `max_delay`.
    pub fn backoff(&self, step: u32) -> Duration {
        let factor = 2u32.saturating_pow(step);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// How a single attempt failed.
#[derive(Debug)]
pub(crate) enum Failure {
    /// Timeouts, connection errors, 500/502/503/504.
    Transient(Error),
    /// HTTP 429, with the server's `Retry-After` when it sent one.
    RateLimited { retry_after: Option<Duration> },
    /// 401/403: the credential was dropped; replay once with a new login.
    Reauthenticate,
    /// Anything else; returned as-is.
    Fatal(Error),
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        if e.is_transient() {
            Failure::Transient(e)
        } else {
            Failure::Fatal(e)
        }
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    let raw = value.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Run `op` until it succeeds, fails fatally, or the retry budget is spent.
///
/// Transient failures back off exponentially. A 429 with `Retry-After`
/// sleeps exactly that long and leaves the exponential schedule where it
/// was; without the header it takes the next exponential step. Both consume
/// one retry. A re-authentication replay is free but allowed only once.
pub(crate) async fn run<T, F, Fut>(policy: &RetryPolicy, endpoint: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure>>,
{
    let mut retries = 0u32;
    let mut backoff_step = 0u32;
    let mut reauthenticated = false;

    loop {
        let failure = match op().await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        let delay = match failure {
            Failure::Fatal(e) => return Err(e),
            Failure::Reauthenticate if reauthenticated => {
                return Err(Error::Authentication(format!(
                    "{endpoint}: credential rejected after re-login"
                )));
            }
            Failure::Reauthenticate => {
                reauthenticated = true;
                continue;
            }
            Failure::RateLimited { retry_after } => {
                if retries >= policy.max_retries {
                    warn!(endpoint, attempts = retries + 1, "rate limited, retries exhausted");
                    return Err(Error::RateLimited { attempts: retries + 1 });
                }
                match retry_after {
                    Some(wait) => wait,
                    None => {
                        let d = policy.backoff(backoff_step);
                        backoff_step += 1;
                        d
                    }
                }
            }
            Failure::Transient(e) => {
                if retries >= policy.max_retries {
                    warn!(endpoint, attempts = retries + 1, "giving up: {e}");
                    return Err(Error::RetryExhausted {
                        attempts: retries + 1,
                        source: Box::new(e),
                    });
                }
                warn!(
                    endpoint,
                    attempt = retries + 1,
                    of = policy.max_retries + 1,
                    "transient failure: {e}"
                );
                let d = policy.backoff(backoff_step);
                backoff_step += 1;
                d
            }
        };

        retries += 1;
        warn!(endpoint, delay_ms = delay.as_millis() as u64, retry = retries, "retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        let secs: Vec<u64> = (0..7).map(|s| p.backoff(s).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(p.backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn retry_after_seconds() {
        let v = HeaderValue::from_static("7");
        assert_eq!(parse_retry_after(&v), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(&HeaderValue::from_static("soon")), None);
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        let v = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(&v), Some(Duration::ZERO));
    }

    /// Replays a scripted sequence of outcomes and records when each attempt ran.
    struct Script {
        outcomes: Mutex<Vec<Option<Failure>>>,
        calls: AtomicU32,
        started: Instant,
        stamps: Mutex<Vec<Duration>>,
    }

    impl Script {
        fn new(mut outcomes: Vec<Option<Failure>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
                started: Instant::now(),
                stamps: Mutex::new(Vec::new()),
            }
        }

        async fn attempt(&self) -> std::result::Result<&'static str, Failure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stamps.lock().unwrap().push(self.started.elapsed());
            match self.outcomes.lock().unwrap().pop().flatten() {
                None => Ok("ok"),
                Some(f) => Err(f),
            }
        }

        fn gaps(&self) -> Vec<u64> {
            let stamps = self.stamps.lock().unwrap();
            stamps.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect()
        }
    }

    fn unavailable() -> Option<Failure> {
        Some(Failure::Transient(Error::Server { status: 503 }))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_exponentially() {
        let script = Script::new(vec![unavailable(), unavailable(), unavailable(), None]);
        let out = run(&RetryPolicy::default(), "device/list", || script.attempt()).await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(script.calls.load(Ordering::SeqCst), 4);
        assert_eq!(script.gaps(), vec![1, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_tagged() {
        let script = Script::new((0..4).map(|_| unavailable()).collect());
        let err = run(&RetryPolicy::default(), "device/list", || script.attempt())
            .await
            .unwrap_err();
        match err {
            Error::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, Error::Server { status: 503 }));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_schedule() {
        let script = Script::new(vec![
            Some(Failure::RateLimited { retry_after: Some(Duration::from_secs(7)) }),
            unavailable(),
            None,
        ]);
        run(&RetryPolicy::default(), "device/1", || script.attempt())
            .await
            .unwrap();
        // 7s as instructed, then the exponential schedule starts at its first step.
        assert_eq!(script.gaps(), vec![7, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_header_uses_backoff() {
        let limited = || Some(Failure::RateLimited { retry_after: None });
        let script = Script::new(vec![limited(), limited(), limited(), limited()]);
        let err = run(&RetryPolicy::default(), "device/1", || script.attempt())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { attempts: 4 }));
        assert_eq!(script.gaps(), vec![1, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_not_retried() {
        let script = Script::new(vec![Some(Failure::Fatal(Error::api("device/1", Some(400), "bad")))]);
        let err = run(&RetryPolicy::default(), "device/1", || script.attempt())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api { status: Some(400), .. }));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reauthentication_replayed_once() {
        let script = Script::new(vec![Some(Failure::Reauthenticate), None]);
        run(&RetryPolicy::default(), "device/1", || script.attempt())
            .await
            .unwrap();
        assert_eq!(script.gaps(), vec![0]);

        let script = Script::new(vec![Some(Failure::Reauthenticate), Some(Failure::Reauthenticate)]);
        let err = run(&RetryPolicy::default(), "device/1", || script.attempt())
            .await
            .unwrap_err();
        assert!(err.is_authentication());
    }
}
