use mtf_data::DataError;
use thiserror::Error;

/// All errors generated in `mtf-stream-client`.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    Url(String),

    #[error("http transport: {0}")]
    Http(String),

    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to decode: {0}")]
    Decode(String),

    #[error("state store: {0}")]
    Store(String),

    #[error("stream client closed")]
    Closed,

    #[error(transparent)]
    Data(#[from] DataError),
}

impl ClientError {
    /// Determine if an error means retrying the same request cannot succeed.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            ClientError::Url(_) | ClientError::Closed => true,
            ClientError::Status { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => ClientError::Status {
                status: status.as_u16(),
                body: error.to_string(),
            },
            None if error.is_decode() => ClientError::Decode(error.to_string()),
            None => ClientError::Http(error.to_string()),
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(error: url::ParseError) -> Self {
        ClientError::Url(error.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        ClientError::Decode(error.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(error: std::io::Error) -> Self {
        ClientError::Store(error.to_string())
    }
}
