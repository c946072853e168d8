//! Connection supervisor.
//!
//! # Responsibilities
//! - Bind the listener and run the accept loop
//! - Spawn one task per accepted connection and track it
//! - Retry transient accept failures with backoff, stop on fatal ones
//! - Drain or abort connections on close
//!
//! # Design Decisions
//! - The handle owns the shutdown signal; dropping it stops the proxy
//! - `close()` is idempotent and reports the accept loop's fatal error, if any

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{AcceptRetryConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::intercept::gate::{handle_connection, GateContext};
use crate::intercept::observer::Dispatcher;
use crate::intercept::{ConnectionMeta, Interceptor};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::{ConnectionId, ConnectionRegistry, Listener, ListenerError};
use crate::observability::metrics;
use crate::resilience::AcceptBackoff;

/// How long to wait for aborted tasks to unwind after the grace period.
const ABORT_SETTLE: Duration = Duration::from_secs(1);

/// Entry point for running the proxy.
pub struct ProxyServer;

impl ProxyServer {
    /// Bind according to `config` and start accepting connections.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start<I>(config: ProxyConfig, interceptor: I) -> Result<ProxyHandle, ProxyError>
    where
        I: Interceptor,
    {
        let listener = Listener::bind(&config.listener).map_err(|e| match e {
            ListenerError::Bind { address, source } => ProxyError::Bind { address, source },
            other => ProxyError::Listener(std::io::Error::other(other)),
        })?;
        let address = listener.local_addr()?;

        let config = Arc::new(config);
        let shutdown = Shutdown::new();
        let registry = ConnectionRegistry::new();
        let ctx = GateContext {
            dispatcher: Dispatcher::new(
                Arc::new(interceptor),
                config.observer.isolate_blocking_callbacks,
            ),
            shutdown: shutdown.subscribe(),
            config: Arc::clone(&config),
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            address,
            ctx,
            registry.clone(),
            config.accept_retry.clone(),
        ));

        tracing::info!(address = %address, "Proxy started");

        Ok(ProxyHandle {
            address,
            shutdown,
            registry,
            accept_task: Mutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
            grace: config.timeouts.shutdown_grace(),
        })
    }
}

/// Control handle for a running proxy.
pub struct ProxyHandle {
    address: SocketAddr,
    shutdown: Shutdown,
    registry: ConnectionRegistry,
    accept_task: Mutex<Option<JoinHandle<Result<(), ProxyError>>>>,
    closed: AtomicBool,
    grace: Duration,
}

impl ProxyHandle {
    /// The bound address, with the real port when port 0 was configured.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.registry.active_count()
    }

    /// Stop accepting, signal every connection and wait for them to finish.
    ///
    /// Connections still running after `timeouts.shutdown_grace_ms` are
    /// aborted. Calls after the first return `Ok(())` immediately.
    pub async fn close(&self) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.trigger();
        tracing::info!(
            active_connections = self.registry.active_count(),
            "Shutting down proxy"
        );

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let accepted = match accept_task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(ProxyError::Listener(std::io::Error::other(e))),
            },
            None => Ok(()),
        };

        if !self.registry.wait_idle(self.grace).await {
            let aborted = self.registry.abort_all();
            tracing::warn!(aborted, grace = ?self.grace, "Aborting connections past shutdown grace");
            self.registry.wait_idle(ABORT_SETTLE).await;
        }

        tracing::info!("Proxy stopped");
        accepted
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn accept_loop(
    listener: Listener,
    address: SocketAddr,
    ctx: GateContext,
    registry: ConnectionRegistry,
    retry: AcceptRetryConfig,
) -> Result<(), ProxyError> {
    let mut shutdown: ShutdownSignal = ctx.shutdown.clone();
    let mut backoff = AcceptBackoff::new(&retry);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer_addr, permit)) => {
                backoff.reset();
                let id = ConnectionId::new();
                let meta = ConnectionMeta {
                    id,
                    peer_addr,
                    local_addr: stream.local_addr().unwrap_or(address),
                };
                let _ = stream.set_nodelay(true);

                let guard = registry.register(id);
                let span = tracing::info_span!("connection", connection_id = %id, peer_addr = %peer_addr);
                let ctx = ctx.clone();
                let task = tokio::spawn(
                    async move {
                        let _permit = permit;
                        let _guard = guard;
                        handle_connection(stream, meta, ctx).await;
                    }
                    .instrument(span),
                );
                registry.attach_abort(id, task.abort_handle());
            }
            Err(e) if e.is_transient() => {
                metrics::record_accept_error("transient");
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, attempt = backoff.failures(), delay_ms = delay.as_millis() as u64, "Transient accept error");
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                metrics::record_accept_error("fatal");
                tracing::error!(error = %e, "Accept loop failed");
                return Err(match e {
                    ListenerError::Accept(source) => ProxyError::Listener(source),
                    other => ProxyError::Listener(std::io::Error::other(other)),
                });
            }
        }
    }

    tracing::info!(address = %address, "Accept loop stopped");
    Ok(())
}
