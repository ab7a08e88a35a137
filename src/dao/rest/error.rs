//! Error types shared by the HTTP row API implementation.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Postgres error code for a unique constraint violation.
pub(super) const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Convenient result alias returning [`RestDaoError`] failures.
pub type RestResult<T> = Result<T, RestDaoError>;

/// Failures that can occur while talking to the hosted row API.
#[derive(Debug, Error)]
pub enum RestDaoError {
    /// Required environment variable is missing.
    #[error("missing remote store environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build HTTP client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// The request never got a response.
    #[error("failed to send request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The API answered with a non-success status.
    #[error("unexpected response status {status} for `{path}`: {message}")]
    RequestStatus {
        path: String,
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<RestDaoError> for StorageError {
    fn from(err: RestDaoError) -> Self {
        match err {
            RestDaoError::RequestSend { path, source } => {
                StorageError::network(format!("no response from `{path}`"), source)
            }
            RestDaoError::RequestStatus {
                path,
                status,
                code,
                ..
            } if status == StatusCode::CONFLICT
                || code.as_deref() == Some(UNIQUE_VIOLATION_CODE) =>
            {
                StorageError::UniqueViolation { table: path }
            }
            RestDaoError::RequestStatus { status, .. }
                if matches!(
                    status,
                    StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                ) =>
            {
                StorageError::offline(format!("remote store gateway answered {status}"))
            }
            RestDaoError::RequestStatus {
                status,
                code,
                message,
                ..
            } => StorageError::application(
                code.unwrap_or_else(|| status.as_u16().to_string()),
                message,
            ),
            other @ (RestDaoError::MissingEnvVar { .. }
            | RestDaoError::ClientBuilder { .. }
            | RestDaoError::DecodeResponse { .. }) => {
                StorageError::application("client", other.to_string())
            }
        }
    }
}
