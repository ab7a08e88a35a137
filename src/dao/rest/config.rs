use std::time::Duration;

use super::error::{RestDaoError, RestResult};

const DEFAULT_CHANGES_PATH: &str = "changes";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration describing how to reach the hosted row API.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the row API, e.g. `https://example.org/rest/v1`.
    pub base_url: String,
    /// API key sent both as `apikey` header and bearer token.
    pub api_key: Option<String>,
    /// Path (relative to `base_url`) of the server-sent change feed.
    pub changes_path: String,
    /// Timeout applied to each non-streaming request.
    pub request_timeout: Duration,
}

impl RestConfig {
    /// Construct a configuration from an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            changes_path: DEFAULT_CHANGES_PATH.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Attach the API key used for every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the change feed path.
    pub fn with_changes_path(mut self, path: impl Into<String>) -> Self {
        self.changes_path = path.into();
        self
    }

    /// Build a configuration by reading the expected environment variables.
    pub fn from_env() -> RestResult<Self> {
        let base_url = std::env::var("REMOTE_STORE_URL").map_err(|_| {
            RestDaoError::MissingEnvVar {
                var: "REMOTE_STORE_URL",
            }
        })?;

        let mut config = Self::new(base_url);
        if let Ok(key) = std::env::var("REMOTE_STORE_KEY") {
            config = config.with_api_key(key);
        }
        if let Some(path) = std::env::var("REMOTE_STORE_CHANGES_PATH")
            .ok()
            .filter(|p| !p.is_empty())
        {
            config = config.with_changes_path(path);
        }
        Ok(config)
    }
}
