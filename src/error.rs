//! Error taxonomy for the proxy core.
//!
//! Protocol and transport failures end the owning transaction and travel on
//! the event stream inside `Arc<ProxyError>`. `Cancelled` is a normal outcome
//! of closing the server, not a failure.

use std::io;

/// Errors produced while proxying a session.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("request has no Host header")]
    MissingHost,

    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("decoded body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("unsupported content coding: {0}")]
    UnsupportedEncoding(String),

    #[error("proxy server is already listening")]
    AlreadyListening,

    #[error("connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {authority}")]
    ConnectTimeout { authority: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProxyError {
    /// Whether this error is the result of cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProxyError::Cancelled)
    }

    /// Whether this error means the peer went away.
    ///
    /// Tunnels treat these as a graceful end of stream.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_counts_as_peer_closure() {
        let err = ProxyError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_peer_closed());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn protocol_errors_are_not_peer_closure() {
        assert!(!ProxyError::MissingHost.is_peer_closed());
        assert!(ProxyError::Cancelled.is_cancelled());
    }
}
