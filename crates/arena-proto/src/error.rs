//! Wire error codes and codec failures.

use thiserror::Error;

/// Wire-visible error kind. The numeric values are stable and shared with
/// every client SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InvalidArgument => 3,
            ErrorCode::NotFound => 5,
            ErrorCode::PermissionDenied => 7,
            ErrorCode::FailedPrecondition => 9,
            ErrorCode::Aborted => 10,
            ErrorCode::Internal => 13,
            ErrorCode::Unavailable => 14,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            3 => Some(ErrorCode::InvalidArgument),
            5 => Some(ErrorCode::NotFound),
            7 => Some(ErrorCode::PermissionDenied),
            9 => Some(ErrorCode::FailedPrecondition),
            10 => Some(ErrorCode::Aborted),
            13 => Some(ErrorCode::Internal),
            14 => Some(ErrorCode::Unavailable),
            _ => None,
        }
    }
}

/// Encoding/decoding failure on either protocol.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for kind in [
            ErrorCode::InvalidArgument,
            ErrorCode::NotFound,
            ErrorCode::PermissionDenied,
            ErrorCode::FailedPrecondition,
            ErrorCode::Aborted,
            ErrorCode::Internal,
            ErrorCode::Unavailable,
        ] {
            assert_eq!(ErrorCode::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }
}
