//! Error types for token custody and authenticated requests

use std::time::Duration;

use thiserror::Error;

use crate::api::transport::HttpResponse;

/// Failures raised by a key/value backend or by (de)serializing slot records.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode stored value: {0}")]
    Encode(String),

    #[error("failed to decode stored value: {0}")]
    Decode(String),

    #[error("backend rejected write to {0}")]
    Rejected(String),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("no storage directory available")]
    NoDirectory,
}

/// Every way a token or request operation can fail.
///
/// Nothing in the core logs-and-swallows these; callers decide what to do.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No valid access token and nothing to mint one from.
    #[error("Token not available")]
    TokenUnavailable,

    /// An explicit refresh was requested with nothing to refresh from.
    #[error("Refresh token is not available")]
    RefreshUnavailable,

    /// A stored or refreshed access token cannot be sent as a bearer header.
    #[error("Access token is not a valid header value")]
    InvalidToken,

    /// The refresh endpoint rejected the refresh token itself (HTTP 401).
    #[error("Refresh token expired or revoked (HTTP {})", .response.status.as_u16())]
    TokenExpired { response: HttpResponse },

    /// The refresh endpoint answered with any other failure.
    #[error("Token refresh failed (HTTP {})", .response.status.as_u16())]
    RefreshFailed { response: HttpResponse },

    /// Transport failure or an HTTP failure without an application error code.
    /// `status` is 0 when no HTTP response was received at all.
    #[error("Network error (status {status}): {message}")]
    Network { status: u16, message: String },

    /// Structured application error carried in the response body.
    #[error("API error {code} (HTTP {status}): {message}")]
    Api {
        code: String,
        message: String,
        status: u16,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TokenExpired { response } | Self::RefreshFailed { response } => {
                Some(response.status.as_u16())
            }
            Self::Network { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw refresh response for refresh failures.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::TokenExpired { response } | Self::RefreshFailed { response } => Some(response),
            _ => None,
        }
    }

    /// Normalize an executor failure. Errors that already are an `AuthError`
    /// pass through; anything else means no HTTP response was received.
    pub fn from_transport(err: anyhow::Error) -> Self {
        match err.downcast::<AuthError>() {
            Ok(auth) => auth,
            Err(other) => Self::network(0, format!("{:#}", other)),
        }
    }

    pub(crate) fn network(status: u16, message: impl Into<String>) -> Self {
        Self::Network {
            status,
            message: message.into(),
        }
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;
