use serde::Deserialize;
use thiserror::Error;

use crate::error::SyncError;

/// Outcome classes of a call to the remote protocol service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The credential was missing, expired or rejected.
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// Timeouts, connection failures, rate limiting and 5xx responses.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Any other failure reported by the service.
    #[error("Request rejected ({error}): {message}")]
    Rejected { error: String, message: String },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error names the service uses for credentials that need refreshing
const AUTH_ERROR_NAMES: &[&str] = &["ExpiredToken", "InvalidToken", "AuthenticationRequired"];

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl CallError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed = serde_json::from_str::<XrpcErrorBody>(body).ok();
        let error_name = parsed.as_ref().and_then(|b| b.error.clone());
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| Self::truncate_body(body));

        if let Some(ref name) = error_name {
            if AUTH_ERROR_NAMES.contains(&name.as_str()) {
                return CallError::Auth(format!("{}: {}", name, message));
            }
        }

        match status.as_u16() {
            401 => CallError::Auth(message),
            408 | 429 => CallError::Transient(format!("Status {}: {}", status, message)),
            500..=599 => CallError::Transient(format!("Status {}: {}", status, message)),
            _ => CallError::Rejected {
                error: error_name.unwrap_or_else(|| format!("Status{}", status.as_u16())),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CallError::Rejected {
                error: "InvalidResponse".to_string(),
                message: e.to_string(),
            }
        } else {
            // Connect, timeout, body and request errors are all worth retrying
            CallError::Transient(e.to_string())
        }
    }
}

impl From<CallError> for SyncError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Auth(msg) => SyncError::Unauthorized(msg),
            CallError::Transient(msg) => SyncError::ServiceUnavailable(msg),
            CallError::Rejected { error, message } => SyncError::Rejected { error, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            CallError::from_status(StatusCode::UNAUTHORIZED, ""),
            CallError::Auth(_)
        ));
        assert!(matches!(
            CallError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            CallError::Transient(_)
        ));
        assert!(matches!(
            CallError::from_status(StatusCode::BAD_GATEWAY, "<html>"),
            CallError::Transient(_)
        ));
        assert!(matches!(
            CallError::from_status(StatusCode::NOT_FOUND, ""),
            CallError::Rejected { .. }
        ));
    }

    #[test]
    fn test_expired_token_body_is_auth_failure() {
        let body = r#"{"error":"ExpiredToken","message":"Token has expired"}"#;
        match CallError::from_status(StatusCode::BAD_REQUEST, body) {
            CallError::Auth(msg) => assert!(msg.contains("Token has expired")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejected_keeps_service_error_name() {
        let body = r#"{"error":"InvalidRequest","message":"Record not found"}"#;
        assert_eq!(
            CallError::from_status(StatusCode::BAD_REQUEST, body),
            CallError::Rejected {
                error: "InvalidRequest".into(),
                message: "Record not found".into()
            }
        );
    }

    #[test]
    fn test_long_body_truncated() {
        let body = "x".repeat(2000);
        match CallError::from_status(StatusCode::IM_A_TEAPOT, &body) {
            CallError::Rejected { message, .. } => {
                assert!(message.contains("truncated, 2000 total bytes"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
