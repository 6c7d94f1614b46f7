use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("not authenticated: no access token")]
    NotAuthenticated,
    #[error("request failed with status {status}: {error}")]
    Status { status: u16, error: ApiError },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gave up connecting after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("socket handshake failed: {0}")]
    Handshake(String),
}

impl ClientError {
    /// 4xx answers are final; everything else may succeed on another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !(400..500).contains(status),
            Self::Http(err) => !err.is_builder() && !err.is_decode(),
            Self::Transport(_) | Self::Handshake(_) => true,
            Self::EmptyMessage | Self::NotAuthenticated | Self::ConnectionExhausted { .. } => {
                false
            }
        }
    }
}
