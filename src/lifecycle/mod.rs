//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     close() or handle drop → stop accepting → connections observe signal → drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls ProxyHandle::close()
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, abort stragglers
//! - Shutdown has timeout: connections past the grace period are aborted

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
