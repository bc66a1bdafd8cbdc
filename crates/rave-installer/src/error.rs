//! Error types for the installer
//!
//! Covers:
//! - Plan loading and validation (malformed YAML, missing fields, cycles)
//! - Run control misuse (starting twice, illegal phase changes)
//! - Configuration and cache persistence

use rave_session::SessionError;
use std::path::PathBuf;

/// Plan loading and ordering errors
///
/// All of these are fatal to a run: no step executes.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Plan file could not be read
    #[error("failed to read plan {path}: {source}")]
    Io {
        /// Plan path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Plan is not valid YAML
    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Plan has no `steps` sequence
    #[error("plan has no steps sequence")]
    MissingSteps,

    /// A step lacks a required field
    #[error("step #{index} is missing required field `{field}`")]
    MissingField {
        /// Zero-based position in the plan
        index: usize,
        /// Field name
        field: &'static str,
    },

    /// Two steps share an id
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    /// A step transitively needs itself
    #[error("dependency cycle detected at step {step}")]
    CycleDetected {
        /// A step on the cycle
        step: String,
    },

    /// Step kind is not shell or script
    #[error("step {step} has unsupported kind `{kind}`")]
    UnsupportedKind {
        /// Step id
        step: String,
        /// Kind as written
        kind: String,
    },
}

/// Run-level errors
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Plan could not be loaded or ordered
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// A run is already in progress
    #[error("an installation run is already in progress")]
    AlreadyRunning,

    /// Phase or status change not in the transition table
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Session layer failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl InstallError {
    /// Create illegal transition error from any two displayable states
    pub fn illegal(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether the run cannot continue
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Plan(_) | Self::IllegalTransition { .. })
    }

    /// Whether the caller may retry later
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadyRunning => true,
            Self::Session(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config is not valid TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config values are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Cache store errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Cache file IO failed
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache record could not be (de)serialized
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, InstallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_errors_are_fatal() {
        let err = InstallError::from(PlanError::CycleDetected { step: "a".into() });
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "plan error: dependency cycle detected at step a"
        );
    }

    #[test]
    fn busy_session_is_recoverable() {
        let err = InstallError::from(SessionError::Busy("s".into()));
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_field_message() {
        let err = PlanError::MissingField {
            index: 2,
            field: "name",
        };
        assert_eq!(err.to_string(), "step #2 is missing required field `name`");
    }
}
