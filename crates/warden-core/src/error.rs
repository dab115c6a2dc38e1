use thiserror::Error;

pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed (status {current}): {detail}")]
    PreconditionFailed { current: String, detail: String },

    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("signer rejected request: {0}")]
    SignerRejected(String),

    #[error("idempotency conflict on key {0}")]
    IdempotencyConflict(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("tamper detected at index {index} (event {event_id}): {reason}")]
    TamperDetected {
        index: usize,
        event_id: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Stable machine-readable code surfaced at API boundaries.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            Self::SignerUnavailable(_) => "SIGNER_UNAVAILABLE",
            Self::SignerRejected(_) => "SIGNER_REJECTED",
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Self::Conflict(_) => "CONFLICT",
            Self::TamperDetected { .. } => "TAMPER_DETECTED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    pub fn precondition(current: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            current: current.into(),
            detail: detail.into(),
        }
    }

    pub fn tamper(index: usize, event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TamperDetected {
            index,
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}

impl From<rusqlite::Error> for WardenError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(msg.unwrap_or_else(|| "constraint violation".into()))
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(WardenError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(
            WardenError::precondition("draft", "not ready").code(),
            "PRECONDITION_FAILED"
        );
        assert_eq!(WardenError::tamper(2, "e", "bad").code(), "TAMPER_DETECTED");
        assert_eq!(
            WardenError::SignerUnavailable("down".into()).code(),
            "SIGNER_UNAVAILABLE"
        );
    }

    #[test]
    fn precondition_message_carries_current_status() {
        let err = WardenError::precondition("multisig_partial", "threshold not met");
        assert!(err.to_string().contains("multisig_partial"));
    }
}
