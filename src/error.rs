use std::{fmt, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::types::QueryKey;

/// Error envelope returned by the feed backend for non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl Default for ErrorPayload {
    fn default() -> Self {
        Self {
            status: 500,
            code: String::new(),
            message: "Something went wrong".into(),
        }
    }
}

impl ErrorPayload {
    /// Decodes the envelope from a response body. The HTTP status always wins
    /// over whatever the body claims.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let mut payload: ErrorPayload = serde_json::from_slice(body).unwrap_or_default();
        payload.status = status;
        payload
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{} {}", self.status, self.message)
        } else {
            write!(f, "{} {}: {}", self.status, self.code, self.message)
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The credential refresh itself failed. Always terminal for the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session could not be refreshed: {reason}")]
pub struct TerminalAuthError {
    pub reason: String,
}

impl TerminalAuthError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime channel is closed")]
    Closed,
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unauthorized: {0}")]
    Authorization(ErrorPayload),
    #[error(transparent)]
    TerminalAuth(#[from] TerminalAuthError),
    #[error("validation failed: {0}")]
    Validation(ErrorPayload),
    #[error("conflict: {0}")]
    Conflict(ErrorPayload),
    #[error("request failed: {0}")]
    Status(ErrorPayload),
    #[error("no credential available")]
    NotAuthenticated,
    #[error("mutation already in flight for {key}")]
    MutationInFlight { key: QueryKey },
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl ApiError {
    /// Maps a non-2xx response onto the closed error taxonomy.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let payload = ErrorPayload::from_response(status, body);
        match status {
            401 => Self::Authorization(payload),
            400 | 422 => Self::Validation(payload),
            409 => Self::Conflict(payload),
            _ => Self::Status(payload),
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Authorization(_) | Self::TerminalAuth(_) | Self::NotAuthenticated
        )
    }

    pub fn payload(&self) -> Option<&ErrorPayload> {
        match self {
            Self::Authorization(p) | Self::Validation(p) | Self::Conflict(p) | Self::Status(p) => {
                Some(p)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(TransportError::Serde(err))
    }
}
