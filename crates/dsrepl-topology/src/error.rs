//! Error types for the replication topology controller.

use thiserror::Error;

/// Client-side validation failures. None of these ever reach the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// One or more required fields were left empty.
    #[error("missing required fields: {}", fields.join(", "))]
    MissingFields {
        /// Names of the missing fields, in declaration order.
        fields: Vec<&'static str>,
    },

    /// A master replica needs an id in `[1, 65534]`.
    #[error("replica id must be a number between 1 and 65534, got {value:?}")]
    ReplicaIdOutOfRange {
        /// The rejected input, as given.
        value: String,
    },

    /// Consumers and hubs need a manager DN or a bind group DN.
    #[error("a replication manager or a replication bind group is required")]
    MissingBindIdentity,

    /// Demotion to hub/consumer requires a registered manager.
    #[error("a replication manager must exist before demoting the replica to {target}")]
    MissingManager {
        /// Requested role.
        target: String,
    },

    /// Secret and its confirmation differ.
    #[error("passwords do not match")]
    PasswordMismatch,

    /// A field expected to hold a distinguished name does not.
    #[error("invalid DN for {field}: {value:?}")]
    MalformedDn {
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: String,
    },

    /// A custom schedule needs at least one day.
    #[error("the schedule must select at least one day")]
    EmptySchedule,

    /// A custom schedule cannot start and end at the same time.
    #[error("the schedule start and end times cannot be the same ({0})")]
    ScheduleTimesEqual(String),

    /// A schedule time is not `HHMM`/`HH:MM` in range.
    #[error("invalid schedule time {0:?}")]
    ScheduleTime(String),

    /// Port field is not a valid TCP port.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// The requested edge does not exist in the role graph.
    #[error("illegal role transition from {from} to {to}")]
    IllegalTransition {
        /// Current role.
        from: String,
        /// Requested role.
        to: String,
    },

    /// The changelog must be created before it can be configured.
    #[error("the replication changelog does not exist")]
    ChangelogMissing,

    /// The operation needs replication to be enabled on the suffix.
    #[error("replication is not enabled for suffix {0}")]
    ReplicationDisabled(String),
}

/// Errors surfaced by the topology controller.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Rejected before any gateway call was made.
    #[error("{operation} not attempted: {source}")]
    Validation {
        /// Operation that was refused.
        operation: &'static str,
        /// The rule that failed.
        #[source]
        source: ValidationError,
    },

    /// The remote administrative command failed; `message` is verbatim.
    #[error("{operation} failed: {message}")]
    Gateway {
        /// Operation that failed.
        operation: String,
        /// Message returned by the gateway.
        message: String,
    },

    /// A compensating action failed after the original operation failed.
    #[error("{original}; rollback also failed: {rollback}")]
    Compensation {
        /// The error that triggered the compensation.
        original: Box<TopologyError>,
        /// The error raised by the compensating action.
        rollback: Box<TopologyError>,
    },

    /// The gateway answered with a document of an unexpected shape.
    #[error("malformed payload: {msg}")]
    MalformedPayload {
        /// What was wrong with it.
        msg: String,
    },

    /// A winsync composite address token could not be decomposed.
    #[error("malformed winsync address {token:?}: {msg}")]
    MalformedAddress {
        /// The offending token.
        token: String,
        /// What was wrong with it.
        msg: String,
    },

    /// A stored update schedule could not be parsed.
    #[error("malformed update schedule {value:?}")]
    MalformedSchedule {
        /// The offending attribute value.
        value: String,
    },

    /// Configuration file problem.
    #[error("configuration error: {msg}")]
    Config {
        /// Error description.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// TOML decoding error.
    #[error("TOML error")]
    Toml(#[from] toml::de::Error),

    /// The controller was shut down.
    #[error("topology controller shut down")]
    Shutdown,
}

impl TopologyError {
    /// Shorthand for a validation failure.
    pub fn validation(operation: &'static str, source: ValidationError) -> Self {
        TopologyError::Validation { operation, source }
    }

    /// Shorthand for a gateway failure.
    pub fn gateway(operation: impl Into<String>, message: impl Into<String>) -> Self {
        TopologyError::Gateway {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for errors raised before any gateway call.
    pub fn is_validation(&self) -> bool {
        matches!(self, TopologyError::Validation { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TopologyError>;
