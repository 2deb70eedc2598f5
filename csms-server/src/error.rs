//! Server error type

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("no codec registered for action {0}")]
    UnknownAction(&'static str),
}

pub type Result<T> = std::result::Result<T, ServerError>;
