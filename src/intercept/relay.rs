//! Byte relay between the two legs of a connection.
//!
//! # Responsibilities
//! - Pump client→target and target→client concurrently inside the
//!   connection's task
//! - Drive the framing parser on intercepted traffic and forward heads,
//!   raw body bytes and passthrough bytes
//! - Half-close each destination when its source ends
//!
//! # Design Decisions
//! - Content spans go to the observer only; the wire always carries Raw bytes
//! - A direction that fails reports against its own in-flight message and
//!   leaves the other direction running
//! - The idle limit covers the whole connection: traffic either way keeps
//!   both pumps alive

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{ProxyError, TimeoutPhase};
use crate::http::{
    pipeline, BodyBytesKind, Exchange, FramingError, Http1Parser, ParseListener, ParserLimits,
    Request,
};
use crate::http::parser::Role;
use crate::intercept::connection::ConnectionInfo;
use crate::intercept::observer::Dispatcher;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::resilience::bounded;

const READ_CHUNK: usize = 8 * 1024;

/// How long a half-close may take before it is abandoned.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToTarget => "client_to_target",
            Direction::TargetToClient => "target_to_client",
        }
    }
}

/// What stopped each direction, if anything other than a clean end of stream.
#[derive(Debug, Default)]
pub(crate) struct RelayOutcome {
    pub client_to_target: Option<ProxyError>,
    pub target_to_client: Option<ProxyError>,
}

/// Last time any pump of a connection moved bytes.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Read/write policy shared by every pump of a connection.
#[derive(Clone)]
pub(crate) struct PumpControl {
    idle: Option<Duration>,
    activity: Arc<Activity>,
    shutdown: ShutdownSignal,
}

impl PumpControl {
    pub(crate) fn new(idle: Option<Duration>, shutdown: ShutdownSignal) -> Self {
        Self {
            idle,
            activity: Arc::new(Activity::new()),
            shutdown,
        }
    }

    async fn read<R>(&mut self, src: &mut R, buf: &mut [u8]) -> Result<usize, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        self.io(src.read(buf)).await
    }

    async fn write<W>(&mut self, dst: &mut W, bytes: &[u8]) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        if bytes.is_empty() {
            return Ok(());
        }
        self.io(async {
            dst.write_all(bytes).await?;
            dst.flush().await
        })
        .await
    }

    /// Drive `op` until it completes, shutdown fires, or the whole connection
    /// has been quiet for the idle limit.
    async fn io<F, T>(&mut self, op: F) -> Result<T, ProxyError>
    where
        F: Future<Output = io::Result<T>>,
    {
        tokio::pin!(op);
        loop {
            let deadline = self.idle.map(|idle| self.activity.last() + idle);
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => return Err(ProxyError::Shutdown),
                res = &mut op => {
                    let out = res?;
                    self.activity.touch();
                    return Ok(out);
                }
                _ = sleep_until(deadline) => {
                    let Some(idle) = self.idle else { continue };
                    if self.activity.last() + idle <= Instant::now() {
                        return Err(ProxyError::Timeout { phase: TimeoutPhase::Idle, after: idle });
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn half_close<W: AsyncWrite + Unpin>(dst: &mut W) {
    // The peer may already be gone; nothing useful to report either way.
    let _ = bounded(Some(CLOSE_GRACE), dst.shutdown()).await;
}

/// Parser events for one direction, collecting the bytes to forward.
trait DirectionEvents<M>: ParseListener<M> {
    fn take_output(&mut self) -> BytesMut;
    fn report_error(&mut self, message: &M, error: &ProxyError);
}

struct RequestEvents<'a> {
    conn: &'a ConnectionInfo,
    dispatcher: &'a Dispatcher,
    out: BytesMut,
}

impl ParseListener<Request> for RequestEvents<'_> {
    fn on_headers(&mut self, request: &mut Request) {
        self.dispatcher.request_headers_ready(self.conn, request);
        self.out.extend_from_slice(&request.head_bytes());
        tracing::debug!(method = request.method(), target = request.target(), "Request headers");
    }

    fn on_body(&mut self, request: &Request, kind: BodyBytesKind, bytes: &[u8]) {
        self.dispatcher.request_body_bytes(self.conn, request, kind, bytes);
        if kind == BodyBytesKind::Raw {
            self.out.extend_from_slice(bytes);
        }
    }

    fn on_ended(&mut self, request: &Request) {
        metrics::record_message("request", "ended");
        self.dispatcher.request_ended(self.conn, request);
    }

    fn on_passthrough(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }
}

impl DirectionEvents<Request> for RequestEvents<'_> {
    fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    fn report_error(&mut self, request: &Request, error: &ProxyError) {
        metrics::record_message("request", "error");
        self.dispatcher.request_error(self.conn, request, error);
    }
}

struct ResponseEvents<'a> {
    conn: &'a ConnectionInfo,
    dispatcher: &'a Dispatcher,
    out: BytesMut,
}

impl ParseListener<Exchange> for ResponseEvents<'_> {
    fn on_headers(&mut self, exchange: &mut Exchange) {
        let (request, response) = exchange.parts_mut();
        self.dispatcher.response_headers_ready(self.conn, request, response);
        self.out.extend_from_slice(&response.head_bytes());
        tracing::debug!(status = response.status(), target = request.target(), "Response headers");
    }

    fn on_body(&mut self, exchange: &Exchange, kind: BodyBytesKind, bytes: &[u8]) {
        self.dispatcher
            .response_body_bytes(self.conn, exchange.request(), exchange.response(), kind, bytes);
        if kind == BodyBytesKind::Raw {
            self.out.extend_from_slice(bytes);
        }
    }

    fn on_ended(&mut self, exchange: &Exchange) {
        metrics::record_message("response", "ended");
        self.dispatcher
            .response_ended(self.conn, exchange.request(), exchange.response());
    }

    fn on_passthrough(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }
}

impl DirectionEvents<Exchange> for ResponseEvents<'_> {
    fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    fn report_error(&mut self, exchange: &Exchange, error: &ProxyError) {
        metrics::record_message("response", "error");
        self.dispatcher
            .response_error(self.conn, exchange.request(), exchange.response(), error);
    }
}

/// Relay intercepted HTTP/1.x between the decrypted client and target streams.
pub(crate) async fn relay_http<C, T>(
    client: C,
    target: T,
    conn: &Arc<ConnectionInfo>,
    dispatcher: &Dispatcher,
    limits: ParserLimits,
    control: PumpControl,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send,
    T: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    let (requests, responses) = pipeline(limits);

    let upstream = http_pump(
        client_read,
        target_write,
        requests,
        RequestEvents {
            conn,
            dispatcher,
            out: BytesMut::new(),
        },
        Direction::ClientToTarget,
        control.clone(),
    );
    let downstream = http_pump(
        target_read,
        client_write,
        responses,
        ResponseEvents {
            conn,
            dispatcher,
            out: BytesMut::new(),
        },
        Direction::TargetToClient,
        control,
    );

    let (client_to_target, target_to_client) = tokio::join!(upstream, downstream);
    RelayOutcome {
        client_to_target,
        target_to_client,
    }
}

/// What woke a pump that might be waiting on a protocol switch.
enum Wake {
    Read(Result<usize, ProxyError>),
    Switch(Result<(), FramingError>),
}

async fn http_pump<R, W, Ro, L>(
    mut src: R,
    mut dst: W,
    mut parser: Http1Parser<Ro>,
    mut events: L,
    direction: Direction,
    mut control: PumpControl,
) -> Option<ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    Ro: Role,
    L: DirectionEvents<Ro::Message>,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let error = loop {
        let wake = if parser.awaits_switch() {
            tokio::select! {
                resolved = parser.resolve_switch(&mut events) => Wake::Switch(resolved),
                read = control.read(&mut src, &mut buf) => Wake::Read(read),
            }
        } else {
            Wake::Read(control.read(&mut src, &mut buf).await)
        };
        let read = match wake {
            Wake::Read(Ok(read)) => read,
            Wake::Read(Err(e)) => break Some(e),
            Wake::Switch(resolved) => {
                let out = events.take_output();
                if let Err(e) = control.write(&mut dst, &out).await {
                    break Some(e);
                }
                if let Err(e) = resolved {
                    break Some(ProxyError::from(e));
                }
                continue;
            }
        };
        if read == 0 {
            let finished = parser.finish(&mut events);
            let out = events.take_output();
            if let Err(e) = control.write(&mut dst, &out).await {
                break Some(e);
            }
            break finished.err().map(ProxyError::from);
        }

        metrics::record_relayed_bytes(direction.as_str(), read);
        let fed = parser.feed(&buf[..read], &mut events);
        let out = events.take_output();
        if let Err(e) = control.write(&mut dst, &out).await {
            break Some(e);
        }
        if let Err(e) = fed {
            break Some(ProxyError::from(e));
        }
    };

    if let Some(err) = &error {
        tracing::debug!(direction = direction.as_str(), error = %err, "Relay direction failed");
        if let Some(message) = parser.in_flight() {
            events.report_error(message, err);
        }
    }
    half_close(&mut dst).await;
    error
}

/// Copy bytes both ways without interpretation. `initial` is sent to the target first.
pub(crate) async fn relay_opaque<C, T>(
    client: C,
    target: T,
    initial: Bytes,
    control: PumpControl,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send,
    T: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, mut target_write) = tokio::io::split(target);

    let mut first = control.clone();
    if let Err(e) = first.write(&mut target_write, &initial).await {
        return RelayOutcome {
            client_to_target: Some(e),
            target_to_client: None,
        };
    }

    let (client_to_target, target_to_client) = tokio::join!(
        copy_pump(client_read, target_write, Direction::ClientToTarget, control.clone()),
        copy_pump(target_read, client_write, Direction::TargetToClient, control),
    );
    RelayOutcome {
        client_to_target,
        target_to_client,
    }
}

async fn copy_pump<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    mut control: PumpControl,
) -> Option<ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let error = loop {
        match control.read(&mut src, &mut buf).await {
            Ok(0) => break None,
            Ok(read) => {
                metrics::record_relayed_bytes(direction.as_str(), read);
                if let Err(e) = control.write(&mut dst, &buf[..read]).await {
                    break Some(e);
                }
            }
            Err(e) => break Some(e),
        }
    };
    half_close(&mut dst).await;
    error
}
