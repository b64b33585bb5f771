use thiserror::Error;

/// Stable failure reason codes. These strings appear verbatim in logs,
/// metric labels and the `error_reason` column, so never rename them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ErrorReason {
    DbDeadlock,
    DbConflict,
    DbUnavailable,
    Downstream429,
    Downstream5xx,
    LeaseLost,
    MalformedPayload,
    UnknownEventType,
    MissingSource,
    MissingSourceExhausted,
    Unhandled,
}

/// Coarse class of a failure; drives the worker's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Transient,
    Malformed,
    MissingSource,
    Bug,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DbDeadlock => "transient.db_deadlock",
            Self::DbConflict => "transient.db_conflict",
            Self::DbUnavailable => "transient.db_unavailable",
            Self::Downstream429 => "transient.downstream_429",
            Self::Downstream5xx => "transient.downstream_5xx",
            Self::LeaseLost => "transient.lease_lost",
            Self::MalformedPayload => "malformed.payload",
            Self::UnknownEventType => "malformed.unknown_event_type",
            Self::MissingSource => "missing_source",
            Self::MissingSourceExhausted => "missing_source.exhausted",
            Self::Unhandled => "bug.unhandled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|r| r.as_str() == s)
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::DbDeadlock
            | Self::DbConflict
            | Self::DbUnavailable
            | Self::Downstream429
            | Self::Downstream5xx
            | Self::LeaseLost => FailureClass::Transient,
            Self::MalformedPayload | Self::UnknownEventType => FailureClass::Malformed,
            Self::MissingSource | Self::MissingSourceExhausted => FailureClass::MissingSource,
            Self::Unhandled => FailureClass::Bug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Terminal regardless of attempt count or projector policy.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::Malformed | FailureClass::Bug
        ) || *self == Self::MissingSourceExhausted
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged failure raised by a projector (or by anything it calls).
#[derive(Debug, Clone, Error)]
#[error("{reason}: {message}")]
pub struct ProjectionError {
    pub reason: ErrorReason,
    pub message: String,
}

impl ProjectionError {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::MalformedPayload, message)
    }

    pub fn unknown_type(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::UnknownEventType, message)
    }

    pub fn missing_source(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::MissingSource, message)
    }

    pub fn bug(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::Unhandled, message)
    }
}

#[derive(Debug, Error)]
pub enum WordloomError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("environment mismatch: WORDLOOM_ENV={expected} but database sentinel is {found}")]
    EnvironmentMismatch { expected: String, found: String },

    #[error("storage ({reason}): {message}")]
    Storage {
        reason: ErrorReason,
        message: String,
    },

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl WordloomError {
    pub fn storage(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self::Storage {
            reason,
            message: message.into(),
        }
    }

    /// Reason code used when this error surfaces in the worker.
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::NotFound(_) => ErrorReason::MissingSource,
            Self::InvalidInput(_) => ErrorReason::MalformedPayload,
            Self::Storage { reason, .. } => *reason,
            Self::Projection(e) => e.reason,
            Self::EnvironmentMismatch { .. } | Self::Internal(_) => ErrorReason::Unhandled,
        }
    }
}

impl From<WordloomError> for ProjectionError {
    fn from(err: WordloomError) -> Self {
        match err {
            WordloomError::Projection(e) => e,
            other => ProjectionError::new(other.reason(), other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProjectionError {
    fn from(err: serde_json::Error) -> Self {
        ProjectionError::malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WordloomError>;

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn reason_codes_round_trip() {
        for reason in ErrorReason::iter() {
            assert_eq!(ErrorReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(ErrorReason::parse("transient.bogus"), None);
    }

    #[test]
    fn only_transient_reasons_retry() {
        let retryable: Vec<_> = ErrorReason::iter().filter(|r| r.is_retryable()).collect();
        assert_eq!(retryable.len(), 6);
        assert!(retryable.iter().all(|r| r.as_str().starts_with("transient.")));
    }

    #[test]
    fn missing_source_is_its_own_class() {
        assert_eq!(
            ErrorReason::MissingSource.class(),
            FailureClass::MissingSource
        );
        assert!(!ErrorReason::MissingSource.is_terminal());
        assert!(ErrorReason::MissingSourceExhausted.is_terminal());
        assert!(ErrorReason::MalformedPayload.is_terminal());
        assert!(!ErrorReason::Downstream429.is_terminal());
    }

    #[test]
    fn storage_error_keeps_reason_through_conversion() {
        let err = WordloomError::storage(ErrorReason::DbDeadlock, "deadlock detected");
        let pe: ProjectionError = err.into();
        assert_eq!(pe.reason, ErrorReason::DbDeadlock);
        assert!(pe.message.contains("deadlock detected"));
    }

    #[test]
    fn not_found_maps_to_missing_source() {
        let pe: ProjectionError = WordloomError::NotFound("book 1".into()).into();
        assert_eq!(pe.reason, ErrorReason::MissingSource);
    }

    #[test]
    fn display_projection_error() {
        let e = ProjectionError::malformed("expected object");
        assert_eq!(e.to_string(), "malformed.payload: expected object");
    }

    #[test]
    fn display_environment_mismatch() {
        let e = WordloomError::EnvironmentMismatch {
            expected: "dev".into(),
            found: "sandbox".into(),
        };
        assert_eq!(
            e.to_string(),
            "environment mismatch: WORDLOOM_ENV=dev but database sentinel is sandbox"
        );
    }
}
