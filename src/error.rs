//! Error types for stratus workflows
//!
//! The taxonomy follows how the orchestrator reacts to a failure:
//!
//! - [`Error::Validation`] and [`Error::StateConflict`] are rejected before
//!   any side effect, so no compensation runs.
//! - [`Error::Provisioning`] and [`Error::ReadinessTimeout`] always route
//!   through the compensator.
//! - [`Error::Teardown`] aggregates compensation failures; it never stops
//!   remaining compensation steps from being attempted.

use thiserror::Error;

/// Main error type for stratus operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad operator input - nothing was created, no compensation needed
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation conflicts with recorded state (duplicate instance, missing
    /// instance, genesis instance with live dependents)
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// A provisioning step failed after resources were created
    #[error("provisioning step '{step}' failed: {message}")]
    Provisioning {
        /// The orchestrator step that failed
        step: String,
        /// Underlying error message
        message: String,
    },

    /// The control-plane API did not become reachable within the retry budget
    #[error("API server not reachable after {attempts} attempts: {message}")]
    ReadinessTimeout {
        /// Number of probe attempts made
        attempts: u32,
        /// Last probe error
        message: String,
    },

    /// One or more compensation steps failed; manual inspection of the cloud
    /// account may be required
    #[error("teardown error: {0}")]
    Teardown(String),

    /// Infrastructure provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// Cloud identity/role management error
    #[error("identity error: {0}")]
    Identity(String),

    /// Certificate or key generation error
    #[error("pki error: {0}")]
    Pki(String),

    /// Local instance registry error
    #[error("registry error: {0}")]
    Registry(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state conflict error with the given message
    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    /// Wrap an error with the name of the orchestrator step that failed
    pub fn provisioning(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Provisioning {
            step: step.into(),
            message: err.to_string(),
        }
    }

    /// Create a teardown error with the given message
    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::Teardown(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create an identity error with the given message
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Create a pki error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// True if this error was rejected before any side effect occurred,
    /// meaning compensation must not run
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::StateConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_skip_compensation() {
        let err = Error::validation("name too long");
        assert!(err.is_precondition());
        assert!(err.to_string().contains("validation error"));

        let err = Error::state_conflict("instance 'dev' already exists");
        assert!(err.is_precondition());
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn provisioning_errors_carry_step_name() {
        let err = Error::provisioning("install api server", "connection refused");
        assert!(!err.is_precondition());
        let msg = err.to_string();
        assert!(msg.contains("install api server"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn readiness_timeout_reports_attempts() {
        let err = Error::ReadinessTimeout {
            attempts: 30,
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("30 attempts"));
    }

    #[test]
    fn teardown_error_is_not_precondition() {
        let err = Error::teardown("failed to delete node group; failed to delete role");
        assert!(!err.is_precondition());
        assert!(err.to_string().contains("node group"));
    }
}
