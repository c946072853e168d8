//! TLS interception subsystem.
//!
//! # Data Flow
//! ```text
//! accepted TcpStream
//!     → gate.rs (proxy request, observer decision, double handshake)
//!     → relay.rs (two pumps, HTTP framing or opaque copy)
//!     → observer.rs (guarded callbacks into the Interceptor)
//! ```
//!
//! # Design Decisions
//! - One task per connection; both pumps run inside it
//! - Client handshake always completes before the target leg starts
//! - `ConnectionInfo` is built once after the decision and never mutated

pub mod connection;
pub(crate) mod gate;
pub mod observer;
pub(crate) mod relay;

pub use connection::{ConnectionInfo, ConnectionMeta, HandshakeInfo, Leg, ProxyRequestLine, TlsDecision};
pub use observer::Interceptor;
