use thiserror::Error;

use crate::types::FailureKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to start relay: {0}")]
    RelayStart(String),

    #[error("Extension not connected")]
    PeerNotConnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No session: {0}")]
    NoSession(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classification carried by a failed task result.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::PeerNotConnected => FailureKind::PeerNotConnected,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::NoSession(_) => FailureKind::NoSession,
            Error::Peer(_) => FailureKind::PeerError,
            Error::Connection(_)
            | Error::RelayStart(_)
            | Error::Protocol(_)
            | Error::Io(_)
            | Error::Json(_) => FailureKind::Transport,
            Error::Config(_) | Error::Validation(_) => FailureKind::Usage,
            Error::Other(_) => FailureKind::PeerError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
