//! Per-connection records handed to the observer.

use std::fmt;
use std::net::SocketAddr;

use tokio_rustls::rustls::CommonState;

use crate::net::{ConnectionId, ServerIdentity, TargetAddress, TrustPolicy};

/// What is known about a connection before the observer decides on it.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// The plaintext request line the client sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl ProxyRequestLine {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Intercept {
        identity: ServerIdentity,
        trust: TrustPolicy,
    },
    Passthrough,
}

/// The observer's answer to `accept_connection`.
#[derive(Debug, Clone)]
pub struct TlsDecision {
    target: TargetAddress,
    mode: Mode,
}

impl TlsDecision {
    /// Terminate the client's TLS with `identity` and verify `target` with `trust`.
    pub fn intercept(target: TargetAddress, identity: ServerIdentity, trust: TrustPolicy) -> Self {
        Self {
            target,
            mode: Mode::Intercept { identity, trust },
        }
    }

    /// Relay bytes to `target` without looking at them.
    pub fn passthrough(target: TargetAddress) -> Self {
        Self {
            target,
            mode: Mode::Passthrough,
        }
    }

    pub fn target(&self) -> &TargetAddress {
        &self.target
    }

    pub fn is_intercept(&self) -> bool {
        matches!(self.mode, Mode::Intercept { .. })
    }

    pub(crate) fn tls_material(&self) -> Option<(&ServerIdentity, &TrustPolicy)> {
        match &self.mode {
            Mode::Intercept { identity, trust } => Some((identity, trust)),
            Mode::Passthrough => None,
        }
    }
}

/// An accepted connection. Built once, shared with every later callback.
#[derive(Debug)]
pub struct ConnectionInfo {
    meta: ConnectionMeta,
    request_line: ProxyRequestLine,
    decision: TlsDecision,
}

impl ConnectionInfo {
    pub(crate) fn new(
        meta: ConnectionMeta,
        request_line: ProxyRequestLine,
        decision: TlsDecision,
    ) -> Self {
        Self {
            meta,
            request_line,
            decision,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.meta.id
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.meta.peer_addr
    }

    pub fn request_line(&self) -> &ProxyRequestLine {
        &self.request_line
    }

    pub fn decision(&self) -> &TlsDecision {
        &self.decision
    }

    /// Where the proxy connects, which may differ from what the client asked for.
    pub fn target(&self) -> &TargetAddress {
        self.decision.target()
    }
}

/// Which TLS session a handshake event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Proxy acting as server towards the client.
    Client,
    /// Proxy acting as client towards the target.
    Target,
}

impl Leg {
    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Client => "client",
            Leg::Target => "target",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiated parameters of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub leg: Leg,
    /// e.g. `TLSv1_3`.
    pub protocol_version: Option<String>,
    /// e.g. `TLS13_AES_256_GCM_SHA384`.
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<String>,
    /// SNI sent by the client, or the name the proxy presented to the target.
    pub server_name: Option<String>,
}

impl HandshakeInfo {
    pub(crate) fn from_session(leg: Leg, session: &CommonState, server_name: Option<String>) -> Self {
        Self {
            leg,
            protocol_version: session.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            alpn_protocol: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            server_name,
        }
    }
}
