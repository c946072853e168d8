//! TLS-intercepting forward proxy library.
//!
//! Clients send `CONNECT host:port` in plaintext; an [`Interceptor`] decides
//! whether to tunnel the connection untouched or to terminate TLS on both
//! legs and observe the HTTP/1.x exchange in between.

pub mod config;
pub mod error;
pub mod http;
pub mod intercept;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod resilience;

pub use config::ProxyConfig;
pub use error::{ProxyError, TimeoutPhase};
pub use http::{BodyBytesKind, FramingError, Headers, Request, Response};
pub use intercept::{ConnectionInfo, ConnectionMeta, HandshakeInfo, Interceptor, Leg, TlsDecision};
pub use lifecycle::Shutdown;
pub use net::{request_target_to_address, ServerIdentity, TargetAddress, TrustPolicy};
pub use proxy::{ProxyHandle, ProxyServer};
