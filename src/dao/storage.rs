use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse classification of a storage failure, decided once at the backend boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No response from the remote side (offline, refused, timed out).
    Network,
    /// The remote store rejected a row because of a uniqueness constraint.
    Duplicate,
    /// Any other failure reported by the remote store or while decoding its answer.
    Application,
}

/// Error raised by storage backends regardless of the underlying transport.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("remote store unreachable: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn Error + Send + Sync>>,
    },
    #[error("unique constraint violated on `{table}`")]
    UniqueViolation { table: String },
    #[error("remote store rejected the request ({code}): {message}")]
    Application { code: String, message: String },
    #[error("failed to decode `{table}` row")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("local journal failure: {message}")]
    Journal {
        message: String,
        #[source]
        source: Option<Box<dyn Error + Send + Sync>>,
    },
}

impl StorageError {
    /// Construct a network error from any transport failure.
    pub fn network(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Network error without an underlying cause (simulated outage, timeout).
    pub fn offline(message: impl Into<String>) -> Self {
        StorageError::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Application error carrying the store's error code.
    pub fn application(code: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Application {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Journal error from any local I/O or encoding failure.
    pub fn journal(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Journal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Classify the failure for retry and user-facing decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Network { .. } => ErrorClass::Network,
            StorageError::UniqueViolation { .. } => ErrorClass::Duplicate,
            StorageError::Application { .. }
            | StorageError::Decode { .. }
            | StorageError::Journal { .. } => ErrorClass::Application,
        }
    }

    /// Only network failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Network
    }

    /// Whether the failure is a uniqueness violation.
    pub fn is_duplicate(&self) -> bool {
        self.class() == ErrorClass::Duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(StorageError::offline("down").is_retryable());
        assert!(
            !StorageError::UniqueViolation {
                table: "votes".into()
            }
            .is_retryable()
        );
        assert!(!StorageError::application("42501", "denied").is_retryable());
    }

    #[test]
    fn unique_violation_is_classified_as_duplicate() {
        let err = StorageError::UniqueViolation {
            table: "votes".into(),
        };
        assert_eq!(err.class(), ErrorClass::Duplicate);
        assert!(err.is_duplicate());
    }
}
