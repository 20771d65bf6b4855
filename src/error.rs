use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error kinds the orchestration core distinguishes. Callers branch on
/// kind (`is_not_found` etc.); the display string carries the wrapped context.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more validation rules failed. No state was changed.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Etag mismatch on an optimistic update. Caller re-reads and retries.
    #[error("optimistic lock failed: {0}")]
    OptimisticLock(String),

    /// DAG construction failed. Reported once, at enqueue time.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// An upstream job dependency ended in failed or canceled.
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A collaborator call failed. `retryable` drives the work-queue
    /// handler contract.
    #[error("external call failed: {message}")]
    External { retryable: bool, message: String },

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(vec![msg.into()])
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn external(retryable: bool, message: impl Into<String>) -> Self {
        Error::External {
            retryable,
            message: message.into(),
        }
    }

    /// Prefix the message with context while preserving the kind, so
    /// `is_*` checks keep working across component boundaries.
    pub fn wrap(self, prefix: &str) -> Self {
        match self {
            Error::Validation(errs) => Error::Validation(
                errs.into_iter().map(|e| format!("{prefix}: {e}")).collect(),
            ),
            Error::NotFound(m) => Error::NotFound(format!("{prefix}: {m}")),
            Error::AlreadyExists(m) => Error::AlreadyExists(format!("{prefix}: {m}")),
            Error::OptimisticLock(m) => Error::OptimisticLock(format!("{prefix}: {m}")),
            Error::CycleDetected(m) => Error::CycleDetected(format!("{prefix}: {m}")),
            Error::DependencyFailed(m) => Error::DependencyFailed(format!("{prefix}: {m}")),
            Error::InvalidArgument(m) => Error::InvalidArgument(format!("{prefix}: {m}")),
            Error::External { retryable, message } => Error::External {
                retryable,
                message: format!("{prefix}: {message}"),
            },
            Error::Canceled(m) => Error::Canceled(format!("{prefix}: {m}")),
            Error::Internal(m) => Error::Internal(format!("{prefix}: {m}")),
        }
    }

    /// Merge a list of errors into one. A single error passes through
    /// unchanged (kind preserved); two or more become a composite
    /// validation error, folded in by display string.
    pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => return None,
            1 => return Some(errors.remove(0)),
            _ => {}
        }
        let mut msgs = Vec::new();
        for e in errors {
            match e {
                Error::Validation(v) => msgs.extend(v),
                other => msgs.push(other.to_string()),
            }
        }
        Some(Error::Validation(msgs))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::CycleDetected(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
    }

    /// True when a retry may succeed (transient collaborator failures).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::External { retryable: true, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {e}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::AlreadyExists(db.to_string())
            }
            other => Error::Internal(format!("database: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_preserves_kind() {
        let e = Error::not_found("job build:123").wrap("dispatch");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "not found: dispatch: job build:123");
    }

    #[test]
    fn combine_flattens_validation_lists() {
        let combined = Error::combine(vec![
            Error::Validation(vec!["a".into(), "b".into()]),
            Error::validation("c"),
        ])
        .unwrap();
        match combined {
            Error::Validation(msgs) => assert_eq!(msgs, vec!["a", "b", "c"]),
            other => panic!("expected validation, got {other:?}"),
        }
    }

    #[test]
    fn combine_empty_is_none() {
        assert!(Error::combine(vec![]).is_none());
    }

    #[test]
    fn combine_single_preserves_kind() {
        let e = Error::combine(vec![Error::not_found("step")]).unwrap();
        assert!(e.is_not_found());
    }

    #[test]
    fn retryable_external() {
        assert!(Error::external(true, "rate limited").is_retryable());
        assert!(!Error::external(false, "bad credentials").is_retryable());
    }
}
