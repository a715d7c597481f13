//! Error taxonomy for queueing, dispatching and transport.
//!
//! Three families matter to callers:
//! - `Recoverable`: the remote side is not ready (unreachable, 401, 404). Retry later.
//! - `Fatal`: the attempt failed for good (bad response, persistence exhausted).
//! - `Capability`: the caller asked a queue for an operation it does not advertise.
//!
//! The remaining variants are raised by backends and collaborators and are
//! folded into one of the families by the code that handles them.

use thiserror::Error;

use crate::queue::QueueCapability;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, ShuttleError>;

#[derive(Debug, Clone, Error)]
pub enum ShuttleError {
    /// Transient failure, safe to retry on a later attempt.
    #[error("recoverable distribution error: {message}")]
    Recoverable { message: String },

    /// Failure of this attempt. Callers record it instead of spinning.
    #[error("distribution error: {message}")]
    Fatal { message: String },

    /// Operation not supported by the queue.
    #[error("queue '{queue}' does not support {capability}")]
    Capability {
        queue: String,
        capability: QueueCapability,
    },

    /// Package does not support reference-counted release.
    #[error("package '{package_id}' cannot be shared across queues")]
    NotShared { package_id: String },

    /// Backend storage failure (may succeed on retry).
    #[error("store error: {message}")]
    Store { message: String },

    /// Concurrent writer created the same node first.
    #[error("conflict at '{path}'")]
    Conflict { path: String },

    /// Referenced node, job or package does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Invalid configuration or wiring.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
}

impl ShuttleError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn capability(queue: impl Into<String>, capability: QueueCapability) -> Self {
        Self::Capability {
            queue: queue.into(),
            capability,
        }
    }

    pub fn not_shared(package_id: impl Into<String>) -> Self {
        Self::NotShared {
            package_id: package_id.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn conflict(path: impl Into<String>) -> Self {
        Self::Conflict { path: path.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether a later retry of the same operation can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Recoverable { .. } | Self::Store { .. } | Self::Conflict { .. }
        )
    }
}

impl From<serde_json::Error> for ShuttleError {
    fn from(err: serde_json::Error) -> Self {
        Self::fatal(format!("malformed data: {err}"))
    }
}

impl From<toml::de::Error> for ShuttleError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_identified() {
        assert!(ShuttleError::recoverable("endpoint down").is_recoverable());
        assert!(ShuttleError::store("commit failed").is_recoverable());
        assert!(ShuttleError::conflict("/q/2024").is_recoverable());

        assert!(!ShuttleError::fatal("HTTP 500").is_recoverable());
        assert!(!ShuttleError::capability("q", QueueCapability::Clearable).is_recoverable());
        assert!(!ShuttleError::not_shared("pkg-1").is_recoverable());
    }

    #[test]
    fn capability_error_names_queue_and_operation() {
        let err = ShuttleError::capability("default", QueueCapability::Clearable);
        assert_eq!(err.to_string(), "queue 'default' does not support CLEARABLE");
    }
}
