//! Fleetlink Error Types
//!
//! Layered error hierarchy:
//! - `DomainError`: policy-level failures (auth, protocol, throttling, task lifecycle)
//! - `InfraError`: external system failures (IO, network, database, serialization)
//! - `FleetError`: top-level error that wraps both categories
//!
//! Wake-channel transport failures are deliberately NOT errors: the wake path
//! reports a boolean per target and a success count for batches.

use std::fmt;

use crate::tasks::TaskStatus;

/// Domain-level errors representing policy and lifecycle failures
#[derive(Debug)]
pub enum DomainError {
    /// Bad, missing, or mismatched session credentials. The session is
    /// closed with a policy-violation code and never retried server-side.
    Auth { reason: String },
    /// Malformed payload or unrecognized frame. Logged; the session stays open.
    Protocol { reason: String },
    /// Operation targeted an unknown device
    DeviceNotFound { cpe_id: String },
    /// Operation targeted an unknown reconciliation task
    TaskNotFound { task_id: String },
    /// Normal-mode reconciliation requested inside the throttle window
    Throttled {
        minutes_since_last_run: i64,
        minutes_left: i64,
    },
    /// A reconciliation run failed while processing
    Task { task_id: String, reason: String },
    /// Task state machine rejected the requested transition
    InvalidTransition {
        task_id: String,
        status: TaskStatus,
    },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { reason } => write!(f, "Authentication failed: {}", reason),
            Self::Protocol { reason } => write!(f, "Protocol error: {}", reason),
            Self::DeviceNotFound { cpe_id } => write!(f, "Device not found: {}", cpe_id),
            Self::TaskNotFound { task_id } => write!(f, "Task not found: {}", task_id),
            Self::Throttled {
                minutes_since_last_run,
                minutes_left,
            } => write!(
                f,
                "Reconciliation throttled: last run {} minute(s) ago, {} minute(s) left",
                minutes_since_last_run, minutes_left
            ),
            Self::Task { task_id, reason } => {
                write!(f, "Task {} failed: {}", task_id, reason)
            }
            Self::InvalidTransition { task_id, status } => {
                write!(f, "Task {} cannot transition from {:?}", task_id, status)
            }
        }
    }
}

impl std::error::Error for DomainError {}

/// Infrastructure-level errors representing external system failures
#[derive(Debug)]
pub enum InfraError {
    /// IO operation failed
    Io(std::io::Error),
    /// JSON serialization/deserialization failed
    Json(serde_json::Error),
    /// YAML serialization/deserialization failed
    Yaml(serde_yml::Error),
    /// Database operation failed
    Database(rusqlite::Error),
    /// WebSocket transport failure
    WebSocket(tokio_tungstenite::tungstenite::Error),
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Json(err) => write!(f, "JSON error: {}", err),
            Self::Yaml(err) => write!(f, "YAML error: {}", err),
            Self::Database(err) => write!(f, "Database error: {}", err),
            Self::WebSocket(err) => write!(f, "WebSocket error: {}", err),
        }
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Yaml(err) => Some(err),
            Self::Database(err) => Some(err),
            Self::WebSocket(err) => Some(err),
        }
    }
}

/// Top-level error type
#[derive(Debug)]
pub enum FleetError {
    Domain(DomainError),
    Infra(InfraError),
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(err) => err.fmt(f),
            Self::Infra(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(err) => Some(err),
            Self::Infra(err) => Some(err),
        }
    }
}

impl From<DomainError> for FleetError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<InfraError> for FleetError {
    fn from(err: InfraError) -> Self {
        Self::Infra(err)
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infra(InfraError::Json(err))
    }
}

impl From<serde_yml::Error> for FleetError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl From<rusqlite::Error> for FleetError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Infra(InfraError::Database(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FleetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Infra(InfraError::WebSocket(err))
    }
}
