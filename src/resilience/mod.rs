//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! accept() fails transiently:
//!     → backoff.rs (exponential delay with jitter before the next accept)
//!
//! handshake / connect / relay I/O:
//!     → timeouts.rs (optional per-phase deadline)
//! ```
//!
//! # Design Decisions
//! - Unset timeouts never fire; configured ones fail only their connection
//! - The failure streak resets after the first successful accept

pub mod backoff;
pub mod timeouts;

pub use backoff::AcceptBackoff;
pub use timeouts::{bounded, TimedOut};
