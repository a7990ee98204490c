use shared::error::ApiError;
use thiserror::Error;

/// Failure talking to the board-data service or its push channel.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("service rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("malformed response body: {0}")]
    Body(String),
    #[error("invalid service url: {0}")]
    Url(String),
}

impl TransportError {
    /// The request referred to an entity the service no longer has.
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_not_found())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Body(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

impl From<url::ParseError> for TransportError {
    fn from(value: url::ParseError) -> Self {
        Self::Url(value.to_string())
    }
}

/// A push notification that could not be turned into a typed change.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized event type '{0}'")]
    UnknownType(String),
    #[error("event '{kind}' is missing its payload")]
    MissingPayload { kind: String },
    #[error("event '{kind}' has an invalid payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

/// Returned by [`crate::SyncHandle`] once the engine task has stopped.
#[derive(Debug, Clone, Copy, Error)]
#[error("sync engine is no longer running")]
pub struct EngineClosed;
