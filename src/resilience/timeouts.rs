//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound handshakes, target connects and relay reads/writes
//! - Treat an unset limit as "wait forever"
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors and carry the limit

use std::future::Future;
use std::time::Duration;

/// The bounded operation did not finish in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    pub after: Duration,
}

/// Run `fut`, giving up after `limit` when one is set.
pub async fn bounded<F>(limit: Option<Duration>, fut: F) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| TimedOut { after }),
        None => Ok(fut.await),
    }
}
