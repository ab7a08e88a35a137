//! Application-level configuration loading: polling cadence, retry policy, scoring and journal.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};
use validator::{Validate, ValidationError};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/live-sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_SYNC_CONFIG_PATH";
/// Default location of the offline vote journal.
const DEFAULT_JOURNAL_PATH: &str = "data/pending-votes.json";

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// Immutable runtime configuration shared across the client.
pub struct AppConfig {
    #[validate(nested)]
    pub poll: PollConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub scoring: ScoringConfig,
    /// Where the offline vote journal lives.
    pub journal_path: PathBuf,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_poll_bounds"))]
/// Adaptive polling cadence of the poll synchronization engine.
pub struct PollConfig {
    /// Interval used after any observed change or push notification.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "base_interval_ms")]
    pub base_interval: Duration,
    /// Cap reached by idle growth.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_interval_ms")]
    pub max_interval: Duration,
    /// Separate, higher cap reached while refreshes keep failing.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "error_max_interval_ms")]
    pub error_max_interval: Duration,
    /// Factor applied after enough unchanged cycles.
    #[validate(range(min = 1.0, max = 4.0))]
    pub growth_factor: f64,
    /// Unchanged cycles (while voting) before the interval grows.
    #[validate(range(min = 1, max = 50))]
    pub idle_cycles_before_growth: u32,
    /// Consecutive failures before the interval backs off.
    #[validate(range(min = 1, max = 50))]
    pub errors_before_backoff: u32,
    /// Delay of the fast refresh scheduled after a local vote.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "post_vote_refresh_ms")]
    pub post_vote_refresh_delay: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// Bounded retry applied to every remote call.
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[validate(range(min = 1, max = 5))]
    pub attempts: usize,
    /// Delay before the first retry; later retries back off exponentially.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound for a single attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "call_timeout_ms")]
    pub call_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// Point values awarded for answers.
pub struct ScoringConfig {
    /// Points for any correct answer.
    #[validate(range(max = 10_000))]
    pub base_points: u32,
    /// Extra points for answering instantly, scaled down linearly over the answer window.
    #[validate(range(max = 10_000))]
    pub max_speed_bonus: u32,
    /// Answer window used for the speed bonus of untimed questions.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "untimed_bonus_window_ms")]
    pub untimed_bonus_window: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
            scoring: ScoringConfig::default(),
            journal_path: PathBuf::from(DEFAULT_JOURNAL_PATH),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            error_max_interval: Duration::from_secs(30),
            growth_factor: 1.5,
            idle_cycles_before_growth: 3,
            errors_before_backoff: 3,
            post_vote_refresh_delay: Duration::from_millis(250),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_points: 100,
            max_speed_bonus: 50,
            untimed_bonus_window: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "invalid config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_poll_bounds(config: &PollConfig) -> Result<(), ValidationError> {
    if config.base_interval.is_zero() {
        return Err(ValidationError::new("base_interval_zero"));
    }
    if config.base_interval > config.max_interval || config.max_interval > config.error_max_interval
    {
        let mut err = ValidationError::new("poll_interval_order");
        err.message =
            Some("expected base_interval <= max_interval <= error_max_interval".into());
        return Err(err);
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config =
            AppConfig::from_json(r#"{"poll": {"base_interval_ms": 1000}, "journal_path": "q.json"}"#)
                .unwrap();

        assert_eq!(config.poll.base_interval, Duration::from_secs(1));
        assert_eq!(config.poll.max_interval, Duration::from_secs(10));
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.journal_path, PathBuf::from("q.json"));
    }

    #[test]
    fn inverted_interval_bounds_are_rejected() {
        let result = AppConfig::from_json(
            r#"{"poll": {"base_interval_ms": 20000, "max_interval_ms": 10000}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_retry_attempts_are_rejected() {
        assert!(AppConfig::from_json(r#"{"retry": {"attempts": 0}}"#).is_err());
    }
}
