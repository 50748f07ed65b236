use hyper::StatusCode;
use thiserror::Error;

use crate::keys::KeyStoreError;

/// Everything that can end a single request or session early.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("missing auth query parameter")]
    MissingCredential,
    #[error("auth key is not in the key list")]
    InvalidCredential,
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error("failed to dial upstream {url}: {source}")]
    UpstreamDial {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("upstream HTTP request failed: {0}")]
    UpstreamRequest(#[from] reqwest::Error),
    #[error("upstream sent no response headers within {}s", .0.as_secs())]
    UpstreamTimeout(std::time::Duration),
    #[error("malformed WebSocket upgrade request: {0}")]
    BadUpgrade(&'static str),
    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),
    #[error("relay I/O failed: {0}")]
    Relay(#[from] tokio_tungstenite::tungstenite::Error),
}

impl GateError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential => StatusCode::FORBIDDEN,
            Self::BadUpgrade(_) | Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::KeyStore(_)
            | Self::UpstreamDial { .. }
            | Self::UpstreamRequest(_)
            | Self::UpstreamTimeout(_)
            | Self::Upgrade(_)
            | Self::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body text sent with the error status. Internal details stay in the log.
    #[must_use]
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::MissingCredential | Self::InvalidCredential => "403 Forbidden - Unauthorized.",
            Self::BadUpgrade(_) => "400 Bad Request - Invalid WebSocket handshake.",
            Self::RequestBody(_) => "400 Bad Request - Unreadable body.",
            _ => "500 Internal Server Error",
        }
    }
}
