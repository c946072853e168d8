//! Proxy lifecycle: start, accept, close.
//!
//! # Data Flow
//! ```text
//! ProxyServer::start(config, interceptor)
//!     → net::listener (bind, backlog, connection limit)
//!     → accept loop (backoff on transient errors)
//!     → one task per connection → intercept::gate
//! ProxyHandle::close()
//!     → shutdown signal → wait for tasks (grace) → abort stragglers
//! ```

pub mod server;

pub use server::{ProxyHandle, ProxyServer};
