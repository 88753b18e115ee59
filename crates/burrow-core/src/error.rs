use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
///
/// Per-session failures (`Io`, `Eof`) close only the session they belong
/// to; `Handshake` and `Protocol` are fatal to the whole control channel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    Eof,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
