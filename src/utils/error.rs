use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable wire error codes. Clients switch on these, so renaming a
/// variant is a protocol break.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    JoinFailed,
    SendFailed,
    RateLimited,
    TokenRefreshFailed,
    MarkReadFailed,
    GetReadReceiptsFailed,
    BadFrame,
    Timeout,
    NotAvailable,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::JoinFailed => "JOIN_FAILED",
            Self::SendFailed => "SEND_FAILED",
            Self::RateLimited => "RATE_LIMITED",
            Self::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            Self::MarkReadFailed => "MARK_READ_FAILED",
            Self::GetReadReceiptsFailed => "GET_READ_RECEIPTS_FAILED",
            Self::BadFrame => "BAD_FRAME",
            Self::Timeout => "TIMEOUT",
            Self::NotAvailable => "NOT_AVAILABLE",
        };
        write!(f, "{code}")
    }
}

/// Payload of the `error` wire frame.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("the keyspace is not connected: {0}")]
    KeyspaceUnavailable(String),
    #[error("keyspace operation timed out: {0}")]
    KeyspaceTimeout(String),
    #[error("keyspace value could not be decoded: {0}")]
    KeyspaceEncoding(String),
    #[error("could not reach the persistence service: {source}")]
    Connector {
        #[from]
        source: reqwest::Error,
    },
    #[error("could not do this io: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{0}")]
    BadConfig(&'static str),
    #[error("{0}")]
    /// Don't create this directly. Use Error::bad_keyspace instead.
    BadKeyspace(&'static str),
    #[error("{0}: {1}")]
    BadRequest(ErrorCode, &'static str),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    NotAvailable(&'static str),
    #[error("handler exceeded its time budget")]
    HandlerTimeout,
}

impl Error {
    pub fn bad_keyspace(message: &'static str) -> Self {
        error!("BadKeyspace: {}", message);
        Self::BadKeyspace(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }

    /// True for failures of the keyspace itself rather than of the request.
    /// Best-effort callers (typing, presence broadcast) log these and move on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KeyspaceUnavailable(_) | Self::KeyspaceTimeout(_)
        )
    }

    /// Converts the error into the `error` wire frame. Errors that carry no
    /// stable code of their own surface under `fallback`, the failure code
    /// of the frame kind being handled.
    pub fn to_frame(&self, fallback: ErrorCode) -> ErrorFrame {
        let (code, message, retry_after) = match self {
            Self::BadRequest(code, message) => (*code, (*message).to_owned(), None),
            Self::RateLimited { retry_after_secs } => (
                ErrorCode::RateLimited,
                "Rate limit exceeded".to_owned(),
                Some(*retry_after_secs),
            ),
            Self::NotAvailable(message) => (ErrorCode::NotAvailable, (*message).to_owned(), None),
            Self::HandlerTimeout => (
                ErrorCode::Timeout,
                "The request took too long to process".to_owned(),
                None,
            ),
            _ => (fallback, self.sanitized_message(), None),
        };

        info!("Returning an error frame: {}: {}", code, message);

        ErrorFrame {
            code,
            message,
            retry_after,
        }
    }

    /// Sanitizes public-facing errors that can leak sensitive information.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::KeyspaceUnavailable(_)
            | Self::KeyspaceTimeout(_)
            | Self::KeyspaceEncoding(_)
            | Self::BadKeyspace(_)
            | Self::BadConfig(_)
            | Self::Io { .. } => String::from("Keyspace or I/O error occurred."),
            Self::Connector { .. } => String::from("Persistence service error occurred."),
            _ => self.to_string(),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            Self::KeyspaceTimeout(e.to_string())
        } else {
            Self::KeyspaceUnavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::GetReadReceiptsFailed).unwrap(),
            "\"GET_READ_RECEIPTS_FAILED\""
        );
        assert_eq!(ErrorCode::RateLimited.to_string(), "RATE_LIMITED");
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let frame = Error::KeyspaceUnavailable("secret host".to_owned())
            .to_frame(ErrorCode::SendFailed);
        assert_eq!(frame.code, ErrorCode::SendFailed);
        assert!(!frame.message.contains("secret host"));
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let frame = Error::RateLimited {
            retry_after_secs: 42,
        }
        .to_frame(ErrorCode::SendFailed);
        assert_eq!(frame.code, ErrorCode::RateLimited);
        assert_eq!(frame.retry_after, Some(42));
    }
}
