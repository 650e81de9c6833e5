//! Unified error type for the core translator, mapped to GraphQL error extensions.
//!
//! Every `CoreError` variant carries a stable `code` surfaced to clients via
//! `extend_with(|_, e| e.set("code", ..))`, mirroring the teacher's `graphql/auth.rs` idiom.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("join not found: {0}")]
    JoinNotFound(String),

    #[error("resume expired for request {0}")]
    ResumeExpired(u32),

    #[error("crc mismatch for request {0} chunk {1}")]
    CrcMismatch(u32, u32),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation-error",
            CoreError::AuthRequired => "auth-required",
            CoreError::NotFound(_) => "not-found",
            CoreError::JoinNotFound(_) => "join-not-found",
            CoreError::ResumeExpired(_) => "resume-expired",
            CoreError::CrcMismatch(..) => "crc-mismatch",
            CoreError::Internal(_) => "internal-error",
            CoreError::Database(_) => "internal-error",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }
}

impl From<CoreError> for async_graphql::Error {
    fn from(err: CoreError) -> Self {
        let code = err.code();
        if matches!(err, CoreError::Internal(_) | CoreError::Database(_)) {
            tracing::error!(error = %err, code, "internal error surfaced to client");
            return async_graphql::Error::new("internal error")
                .extend_with(|_, e| e.set("code", code));
        }
        async_graphql::Error::new(err.to_string()).extend_with(|_, e| e.set("code", code))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::validation("bad").code(), "validation-error");
        assert_eq!(CoreError::AuthRequired.code(), "auth-required");
        assert_eq!(CoreError::NotFound("x".into()).code(), "not-found");
        assert_eq!(CoreError::JoinNotFound("x".into()).code(), "join-not-found");
        assert_eq!(CoreError::ResumeExpired(1).code(), "resume-expired");
        assert_eq!(CoreError::CrcMismatch(1, 2).code(), "crc-mismatch");
    }

    #[test]
    fn internal_errors_hide_details_from_client() {
        let err = CoreError::Internal(anyhow::anyhow!("leaked secret path"));
        let gql: async_graphql::Error = err.into();
        assert_eq!(gql.message, "internal error");
    }
}
