//! Per-connection entry point: proxy request, decision, handshakes.
//!
//! # Data Flow
//! ```text
//! plaintext proxy request (read byte by byte, TLS bytes stay in the socket)
//!     → 400 / 505 on malformed input, no events
//!     → accept_connection
//!         None         → close
//!         passthrough  → opaque relay
//!         intercept    → 200, client handshake, target connect + handshake, HTTP relay
//!     → on_connection_ended (every accepted connection, exactly once)
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, TimeoutPhase};
use crate::intercept::connection::{
    ConnectionInfo, ConnectionMeta, HandshakeInfo, Leg, ProxyRequestLine,
};
use crate::intercept::observer::Dispatcher;
use crate::intercept::relay::{relay_http, relay_opaque, PumpControl, RelayOutcome};
use crate::lifecycle::ShutdownSignal;
use crate::net::{ServerIdentity, TargetAddress, TrustPolicy};
use crate::observability::metrics;
use crate::resilience::bounded;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const VERSION_NOT_SUPPORTED: &[u8] =
    b"HTTP/1.1 505 HTTP Version Not Supported\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// How long an error reply waits for the client to stop sending.
const REPLY_LINGER: Duration = Duration::from_millis(500);

/// Everything a connection task needs besides its socket.
#[derive(Clone)]
pub(crate) struct GateContext {
    pub config: Arc<ProxyConfig>,
    pub dispatcher: Dispatcher,
    pub shutdown: ShutdownSignal,
}

impl GateContext {
    fn idle(&self) -> Option<Duration> {
        self.config.timeouts.idle()
    }

    fn handshake(&self) -> Option<Duration> {
        self.config.timeouts.handshake()
    }

    fn pump_control(&self) -> PumpControl {
        PumpControl::new(self.idle(), self.shutdown.clone())
    }

    /// Run `fut` bounded by `limit` and interrupted by shutdown.
    async fn guarded<F, T>(
        &mut self,
        phase: TimeoutPhase,
        limit: Option<Duration>,
        fut: F,
    ) -> Result<T, ProxyError>
    where
        F: std::future::Future<Output = Result<T, ProxyError>>,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.recv() => Err(ProxyError::Shutdown),
            res = bounded(limit, fut) => res.unwrap_or_else(|t| Err(ProxyError::Timeout { phase, after: t.after })),
        }
    }
}

/// Why reading the proxy request stopped without a usable head.
#[derive(Debug)]
enum HeadOutcome {
    Head(Bytes),
    /// The client went away (or never spoke); close silently.
    Closed,
    TooLarge,
}

/// Serve one accepted client socket to completion.
pub(crate) async fn handle_connection(mut stream: TcpStream, meta: ConnectionMeta, mut ctx: GateContext) {
    let max_head = ctx.config.limits.max_head_bytes;
    let idle = ctx.idle();
    let head = ctx
        .guarded(
            TimeoutPhase::ProxyRequest,
            idle,
            read_proxy_head(&mut stream, max_head),
        )
        .await;

    let head = match head {
        Ok(HeadOutcome::Head(head)) => head,
        Ok(HeadOutcome::Closed) => {
            tracing::debug!("Client closed before sending a proxy request");
            return;
        }
        Ok(HeadOutcome::TooLarge) => {
            metrics::record_connection("bad_request");
            reply(&mut stream, BAD_REQUEST).await;
            return;
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read proxy request");
            return;
        }
    };

    let request_line = match parse_request_line(&head) {
        Ok(line) => line,
        Err(status) => {
            metrics::record_connection("bad_request");
            tracing::debug!("Rejecting malformed proxy request");
            reply(&mut stream, status).await;
            return;
        }
    };

    let Some(decision) = ctx.dispatcher.accept_connection(
        &meta,
        &request_line.method,
        &request_line.target,
        &request_line.version,
    ) else {
        metrics::record_connection("rejected");
        tracing::debug!(target = %request_line.target, "Connection rejected by observer");
        return;
    };

    let conn = Arc::new(ConnectionInfo::new(meta, request_line, decision));
    tracing::info!(
        method = %conn.request_line().method,
        target = %conn.target(),
        intercept = conn.decision().is_intercept(),
        "Connection accepted"
    );

    let outcome = match conn.decision().tls_material() {
        None => {
            metrics::record_connection("passthrough");
            passthrough(stream, head, &conn, &mut ctx).await
        }
        Some(_) if !conn.request_line().is_connect() => {
            metrics::record_connection("method_not_allowed");
            reply(&mut stream, METHOD_NOT_ALLOWED).await;
            RelayOutcome {
                client_to_target: Some(ProxyError::UnsupportedMethod(
                    conn.request_line().method.clone(),
                )),
                target_to_client: None,
            }
        }
        Some((identity, trust)) => {
            let (identity, trust) = (identity.clone(), trust.clone());
            intercept(stream, &conn, identity, trust, &mut ctx).await
        }
    };

    tracing::info!(
        client_to_target = outcome.client_to_target.as_ref().map(tracing::field::display),
        target_to_client = outcome.target_to_client.as_ref().map(tracing::field::display),
        "Connection ended"
    );
    ctx.dispatcher.connection_ended(
        &conn,
        outcome.client_to_target.as_ref(),
        outcome.target_to_client.as_ref(),
    );
}

async fn intercept(
    mut stream: TcpStream,
    conn: &Arc<ConnectionInfo>,
    identity: ServerIdentity,
    trust: TrustPolicy,
    ctx: &mut GateContext,
) -> RelayOutcome {
    let client_failed = |e: ProxyError| {
        metrics::record_connection("client_handshake_failed");
        RelayOutcome {
            client_to_target: Some(e),
            target_to_client: None,
        }
    };

    if let Err(e) = stream.write_all(CONNECTION_ESTABLISHED).await {
        return client_failed(ProxyError::Io(e));
    }

    let handshake_limit = ctx.handshake();
    let acceptor = identity.acceptor();
    let client = ctx
        .guarded(TimeoutPhase::ClientHandshake, handshake_limit, async {
            acceptor
                .accept(stream)
                .await
                .map_err(ProxyError::ClientHandshake)
        })
        .await;
    let client = match client {
        Ok(tls) => tls,
        Err(e) => {
            metrics::record_handshake_failure(Leg::Client.as_str());
            tracing::warn!(error = %e, "Client TLS handshake failed");
            return client_failed(e);
        }
    };

    let (_, session) = client.get_ref();
    let sni = session.server_name().map(str::to_string);
    let info = HandshakeInfo::from_session(Leg::Client, session, sni);
    ctx.dispatcher.client_handshake_complete(conn, &info);

    let target = conn.target().clone();
    let connected = ctx
        .guarded(
            TimeoutPhase::TargetHandshake,
            handshake_limit,
            connect_target_tls(&target, &trust),
        )
        .await;
    let mut client = client;
    let target_tls = match connected {
        Ok(tls) => tls,
        Err(e) => {
            metrics::record_connection("target_failed");
            metrics::record_handshake_failure(Leg::Target.as_str());
            tracing::warn!(target = %target, error = %e, "Target connection failed");
            let _ = bounded(Some(Duration::from_secs(1)), client.shutdown()).await;
            return RelayOutcome {
                client_to_target: None,
                target_to_client: Some(e),
            };
        }
    };

    let (_, session) = target_tls.get_ref();
    let info = HandshakeInfo::from_session(Leg::Target, session, Some(target.host().to_string()));
    ctx.dispatcher.target_handshake_complete(conn, &info);
    metrics::record_connection("intercepted");

    relay_http(
        client,
        target_tls,
        conn,
        &ctx.dispatcher,
        ctx.config.limits.parser_limits(),
        ctx.pump_control(),
    )
    .await
}

async fn connect_target_tls(
    target: &TargetAddress,
    trust: &TrustPolicy,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    let server_name = ServerName::try_from(target.host().to_string())
        .map_err(|_| ProxyError::InvalidServerName(target.host().to_string()))?;
    let tcp = connect_target(target).await?;
    trust
        .connector()
        .connect(server_name, tcp)
        .await
        .map_err(ProxyError::TargetHandshake)
}

async fn connect_target(target: &TargetAddress) -> Result<TcpStream, ProxyError> {
    let tcp = TcpStream::connect((target.host(), target.port()))
        .await
        .map_err(|source| ProxyError::TargetConnect {
            target: target.to_string(),
            source,
        })?;
    // Small writes (heads, chunk lines) should not wait for Nagle.
    let _ = tcp.set_nodelay(true);
    Ok(tcp)
}

async fn passthrough(
    mut stream: TcpStream,
    head: Bytes,
    conn: &Arc<ConnectionInfo>,
    ctx: &mut GateContext,
) -> RelayOutcome {
    let target = conn.target().clone();
    let limit = ctx.handshake();
    let connected = ctx
        .guarded(TimeoutPhase::TargetHandshake, limit, connect_target(&target))
        .await;
    let upstream = match connected {
        Ok(tcp) => tcp,
        Err(e) => {
            tracing::warn!(target = %target, error = %e, "Passthrough target unreachable");
            reply(&mut stream, BAD_GATEWAY).await;
            return RelayOutcome {
                client_to_target: None,
                target_to_client: Some(e),
            };
        }
    };

    // CONNECT is answered by the proxy; any other request goes to the target as sent.
    let initial = if conn.request_line().is_connect() {
        if let Err(e) = stream.write_all(CONNECTION_ESTABLISHED).await {
            return RelayOutcome {
                client_to_target: Some(ProxyError::Io(e)),
                target_to_client: None,
            };
        }
        Bytes::new()
    } else {
        head
    };

    relay_opaque(stream, upstream, initial, ctx.pump_control()).await
}

/// Read up to and including the blank line ending the proxy request head.
///
/// One byte per read so that nothing after the head (the client's TLS
/// ClientHello) is consumed from the socket.
async fn read_proxy_head(
    stream: &mut TcpStream,
    max_head: usize,
) -> Result<HeadOutcome, ProxyError> {
    let mut head = BytesMut::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Ok(HeadOutcome::Closed);
        }
        head.extend_from_slice(&byte);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(HeadOutcome::Head(head.freeze()));
        }
        if head.len() >= max_head {
            return Ok(HeadOutcome::TooLarge);
        }
    }
}

/// Validate the request line; on failure returns the reply to send.
fn parse_request_line(head: &[u8]) -> Result<ProxyRequestLine, &'static [u8]> {
    let end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(BAD_REQUEST)?;
    let line = std::str::from_utf8(&head[..end]).map_err(|_| BAD_REQUEST)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(BAD_REQUEST);
    };
    if method.is_empty()
        || target.is_empty()
        || !method.bytes().all(|b| b.is_ascii_alphabetic())
        || !version.starts_with("HTTP/")
    {
        return Err(BAD_REQUEST);
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(VERSION_NOT_SUPPORTED);
    }
    Ok(ProxyRequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

async fn reply(stream: &mut TcpStream, response: &[u8]) {
    if let Err(e) = stream.write_all(response).await {
        tracing::debug!(error = %e, "Failed to write proxy reply");
        return;
    }
    let _ = stream.shutdown().await;
    // Closing with unread input would reset the connection and could drop the reply.
    let mut sink = [0u8; 1024];
    let _ = bounded(Some(REPLY_LINGER), async {
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;
}
