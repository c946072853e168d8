//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, registry entry for shutdown)
//!     → intercept::gate (proxy request, TLS decision)
//!         → resolve.rs (request-target → host:port)
//!         → tls.rs (client identity, target trust)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS material is supplied per connection by the observer

pub mod connection;
pub mod listener;
pub mod resolve;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionRegistry};
pub use listener::{Listener, ListenerError};
pub use resolve::{request_target_to_address, ResolveError, TargetAddress};
pub use tls::{ServerIdentity, TlsMaterialError, TrustPolicy};
