//! Error types for hermes-control.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A project.
    Project,
    /// An environment within a project.
    Environment,
    /// An environment variable.
    Variable,
    /// A deployment.
    Deployment,
    /// A VM executor.
    Vm,
    /// A cloud instance behind a VM.
    Instance,
}

impl ResourceKind {
    /// Get the kind as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Environment => "environment",
            Self::Variable => "variable",
            Self::Deployment => "deployment",
            Self::Vm => "vm",
            Self::Instance => "instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason attached to a rejected promotion or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The deployment does not exist or belongs to another project.
    NotFound,
    /// The deployment's environment is not flagged as production.
    NotProduction,
    /// The deployment's status does not allow the operation.
    NotEligible,
    /// No older successful deployment exists to roll back to.
    NoPriorSuccess,
}

impl RejectReason {
    /// Get the reason as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotProduction => "not_production",
            Self::NotEligible => "not_eligible",
            Self::NoPriorSuccess => "no_prior_success",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A referenced entity is absent.
    NotFound,
    /// The request collides with existing state.
    Conflict,
    /// A promotion or rollback guard was not met.
    PreconditionFailed,
    /// Temporary condition; the operation may be retried.
    Transient,
    /// Unrecoverable execution failure.
    Fatal,
    /// The request itself is malformed.
    InvalidInput,
    /// Storage, transport or programming error.
    Internal,
}

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        kind: ResourceKind,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// Request fields failed validation.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Request collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Promotion or rollback guard failed.
    #[error("rejected ({reason}): {detail}")]
    Rejected {
        /// Machine-readable reason.
        reason: RejectReason,
        /// Human-readable detail.
        detail: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Temporary failure, eligible for retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Unrecoverable failure.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: ResourceKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a rejection with the given reason.
    #[must_use]
    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            detail: detail.into(),
        }
    }

    /// Create a transient error.
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error.
    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Rejected {
                reason: RejectReason::NotFound,
                ..
            } => ErrorKind::NotFound,
            Self::Rejected { .. } => ErrorKind::PreconditionFailed,
            Self::Conflict(_) | Self::InvalidStateTransition { .. } => ErrorKind::Conflict,
            Self::Transient(_) | Self::Http(_) => ErrorKind::Transient,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Invalid(_) => ErrorKind::InvalidInput,
            Self::Database(_) | Self::Config(_) | Self::Serialisation(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Get the rejection reason, if this is a rejection.
    #[must_use]
    pub const fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_kinds() {
        let not_found = ControlError::rejected(RejectReason::NotFound, "missing");
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let not_prod = ControlError::rejected(RejectReason::NotProduction, "staging");
        assert_eq!(not_prod.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(not_prod.reject_reason(), Some(RejectReason::NotProduction));
    }

    #[test]
    fn display_includes_reason() {
        let err = ControlError::rejected(RejectReason::NoPriorSuccess, "nothing older");
        assert_eq!(err.to_string(), "rejected (no_prior_success): nothing older");

        let err = ControlError::not_found(ResourceKind::Environment, "p1/feature");
        assert_eq!(err.to_string(), "environment not found: p1/feature");
    }

    #[test]
    fn transient_classification() {
        assert!(ControlError::transient("pool exhausted").is_transient());
        assert!(!ControlError::fatal("script exited 1").is_transient());
        assert_eq!(
            ControlError::InvalidStateTransition {
                from: "success",
                to: "running"
            }
            .kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn reason_serialises_snake_case() {
        let json = serde_json::to_string(&RejectReason::NotProduction).unwrap();
        assert_eq!(json, "\"not_production\"");
    }
}
