// Provider-facing error types shared by the payment backends.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a provider API error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderErrorKind {
    Connection,
    Api,
    Authentication,
    CardDeclined,
    InvalidRequest,
    RateLimited,
    Unknown,
}

impl From<&str> for ProviderErrorKind {
    fn from(s: &str) -> Self {
        match s {
            "api_connection_error" => ProviderErrorKind::Connection,
            "api_error" => ProviderErrorKind::Api,
            "authentication_error" => ProviderErrorKind::Authentication,
            "card_error" | "card_declined" | "CARD_DECLINED" | "GENERIC_DECLINE" => {
                ProviderErrorKind::CardDeclined
            }
            "invalid_request_error" | "INVALID_REQUEST_ERROR" | "VALUE_TOO_LOW" => {
                ProviderErrorKind::InvalidRequest
            }
            "rate_limit_error" | "RATE_LIMITED" => ProviderErrorKind::RateLimited,
            _ => ProviderErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderApiError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("provider error: {kind:?} message={message:?} code={code:?}")]
    Api {
        kind: ProviderErrorKind,
        message: Option<String>,
        code: Option<String>,
        status: Option<u16>,
    },
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
    #[error("transient error: {0}")]
    Transient(String),
}

impl ProviderApiError {
    /// A declined card is a user-facing payment failure, not an outage.
    pub fn is_decline(&self) -> bool {
        matches!(
            self,
            ProviderApiError::Api {
                kind: ProviderErrorKind::CardDeclined,
                ..
            }
        )
    }
}

/// Retryable when the provider itself is having trouble (5xx, connection,
/// rate limit), never when the request is at fault.
pub fn is_transient(http_status: Option<u16>, kind: Option<ProviderErrorKind>) -> bool {
    if let Some(s) = http_status {
        if (500..600).contains(&s) {
            return true;
        }
    }
    matches!(
        kind,
        Some(ProviderErrorKind::Connection)
            | Some(ProviderErrorKind::Api)
            | Some(ProviderErrorKind::RateLimited)
    )
}

// Webhook-specific errors
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("timestamp tolerance exceeded: {0}")]
    TimestampTolerance(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing webhook secret")]
    MissingSecret,
    #[error("missing signature header")]
    MissingSignature,
    #[error("event processing failed: {0}")]
    ProcessingFailed(String),
}

impl WebhookError {
    /// Map webhook error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::InvalidSignature(_) => 401,
            WebhookError::MissingSignature => 401,
            WebhookError::TimestampTolerance(_) => 400,
            WebhookError::MalformedPayload(_) => 400,
            WebhookError::MissingSecret => 500,
            WebhookError::ProcessingFailed(_) => 500,
        }
    }
}
