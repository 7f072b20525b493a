//! Unified error handling for arenad.
//!
//! Every operation that can reach a client fails with an [`ApiError`]
//! carrying one of the seven wire-visible kinds. Internal layers have their
//! own error enums and are translated at the pipeline edge; anything that
//! escapes untranslated surfaces as `Internal`.

use arena_proto::{Envelope, ErrorCode, Payload, WireError};
use thiserror::Error;

/// Client-visible operation failure.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("aborted: {0}")]
    Aborted(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Aborted(_) => ErrorCode::Aborted,
        }
    }

    /// Static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
            Self::Aborted(_) => "aborted",
        }
    }

    /// Convert to an error envelope answering the frame with `cid`.
    pub fn to_envelope(&self, cid: &str) -> Envelope {
        let message = match self {
            // Internal detail stays in the logs.
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        Envelope::new(
            cid,
            Payload::Error(WireError {
                code: self.kind().code(),
                message,
                context: Default::default(),
            }),
        )
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<crate::db::DbError> for ApiError {
    fn from(err: crate::db::DbError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<arena_proto::CodecError> for ApiError {
    fn from(err: arena_proto::CodecError) -> Self {
        ApiError::InvalidArgument(err.to_string())
    }
}

/// Result type for pipeline handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Extension runtime failures: hook registration at startup, RPC and hook
/// invocation at runtime.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("rpc not found: {0}")]
    RpcNotFound(String),

    #[error("{message}")]
    Hook { kind: ErrorCode, message: String },

    #[error("hook panicked: {0}")]
    Faulted(String),
}

impl RuntimeError {
    /// An error raised by provider code, carrying a wire error kind.
    pub fn hook(kind: ErrorCode, message: impl Into<String>) -> Self {
        Self::Hook {
            kind,
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::RpcNotFound(id) => ApiError::NotFound(format!("rpc {id}")),
            RuntimeError::Hook { kind, message } => match kind {
                ErrorCode::InvalidArgument => ApiError::InvalidArgument(message),
                ErrorCode::NotFound => ApiError::NotFound(message),
                ErrorCode::PermissionDenied => ApiError::PermissionDenied(message),
                ErrorCode::FailedPrecondition => ApiError::FailedPrecondition(message),
                ErrorCode::Unavailable => ApiError::Unavailable(message),
                ErrorCode::Aborted => ApiError::Aborted(message),
                ErrorCode::Internal => ApiError::Internal(message),
            },
            RuntimeError::Faulted(detail) => ApiError::Internal(detail),
        }
    }
}

/// Match registry and match lifecycle failures.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
    #[error("no provider claims match name {0:?}")]
    UnknownName(String),

    #[error("match init failed: {0}")]
    InitFailed(String),

    #[error("tick rate {0} outside [1,30]")]
    InvalidTickRate(u32),

    #[error("label exceeds 256 bytes ({0})")]
    LabelTooLong(usize),

    #[error("match not found")]
    NotFound,

    #[error("match core fault: {0}")]
    Faulted(String),
}

impl From<MatchError> for ApiError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::UnknownName(name) => {
                ApiError::InvalidArgument(format!("match name {name:?}"))
            }
            MatchError::InvalidTickRate(_) | MatchError::LabelTooLong(_) => {
                ApiError::InvalidArgument(err.to_string())
            }
            MatchError::NotFound => ApiError::NotFound("match".to_string()),
            MatchError::InitFailed(detail) | MatchError::Faulted(detail) => {
                ApiError::Internal(detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_label_match_kinds() {
        assert_eq!(ApiError::NotFound("x".into()).error_code(), "not_found");
        assert_eq!(
            ApiError::InvalidArgument("x".into()).kind(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn internal_detail_is_not_wire_visible() {
        let env = ApiError::Internal("pool exhausted on shard 3".into()).to_envelope("9");
        match env.payload {
            Payload::Error(err) => {
                assert_eq!(err.code, ErrorCode::Internal.code());
                assert_eq!(err.message, "internal server error");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(env.cid, "9");
    }

    #[test]
    fn runtime_hook_errors_map_to_their_kind() {
        let err: ApiError = RuntimeError::hook(ErrorCode::PermissionDenied, "nope").into();
        assert!(matches!(err, ApiError::PermissionDenied(_)));
    }
}
