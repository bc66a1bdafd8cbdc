//! Error types for session supervision
//!
//! Covers:
//! - Port pool exhaustion
//! - Session registry misuse (duplicate ids, unknown ids, busy sessions)
//! - Process spawn and stdio failures

/// Port allocator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// Every port in the range is in use or unbindable
    #[error("port pool exhausted ({start}-{end})")]
    Exhausted {
        /// First port of the range
        start: u16,
        /// Last port of the range
        end: u16,
    },

    /// Range bounds are reversed
    #[error("invalid port range: {start} > {end}")]
    InvalidRange {
        /// Requested start
        start: u16,
        /// Requested end
        end: u16,
    },
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session with this id is already registered
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// No session with this id
    #[error("session not found: {0}")]
    NotFound(String),

    /// Session is executing another command
    #[error("session {0} is busy")]
    Busy(String),

    /// Session cannot accept commands (crashed or exited)
    #[error("session {0} is not ready")]
    NotReady(String),

    /// No interpreter executable could be resolved
    #[error("no executable path resolvable for session {0}")]
    ExecutableNotFound(String),

    /// Port allocation failed
    #[error("port allocation failed: {0}")]
    Port(#[from] PortError),

    /// Process could not be spawned
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Interpreter stdin is gone
    #[error("stdin closed for session {0}")]
    StdinClosed(String),

    /// Manual-prompt resolution without a pending prompt
    #[error("no manual prompt pending for session {0}")]
    NoPendingPrompt(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Create spawn error for a program
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Whether the caller may retry after cleaning up
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Port(PortError::Exhausted { .. }))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_retryable() {
        let err = SessionError::from(PortError::Exhausted {
            start: 8100,
            end: 8101,
        });
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "port allocation failed: port pool exhausted (8100-8101)"
        );
    }

    #[test]
    fn not_found_is_not_retryable() {
        assert!(!SessionError::NotFound("r".into()).is_retryable());
    }
}
