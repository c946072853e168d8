use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::http::FramingError;

/// Which part of a connection a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Reading the plaintext proxy request.
    ProxyRequest,
    ClientHandshake,
    /// TCP connect plus TLS handshake towards the target.
    TargetHandshake,
    /// A relay read or write stalled.
    Idle,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPhase::ProxyRequest => "proxy request",
            TimeoutPhase::ClientHandshake => "client handshake",
            TimeoutPhase::TargetHandshake => "target handshake",
            TimeoutPhase::Idle => "idle",
        })
    }
}

/// Errors surfaced by the proxy, either from the server lifecycle or
/// reported per direction in `on_connection_ended`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept loop failed: {0}")]
    Listener(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("client TLS handshake failed: {0}")]
    ClientHandshake(#[source] std::io::Error),

    #[error("failed to connect to {target}: {source}")]
    TargetConnect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("target TLS handshake failed: {0}")]
    TargetHandshake(#[source] std::io::Error),

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    #[error("method {0} cannot be intercepted")]
    UnsupportedMethod(String),

    #[error("proxy is shutting down")]
    Shutdown,
}

impl ProxyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }
}
