//! Observer contract and guarded dispatch.
//!
//! # Responsibilities
//! - Define the [`Interceptor`] hooks and their per-connection order
//! - Run every hook behind a panic guard so one observer bug only costs
//!   the event, never the proxy
//! - Optionally move blocking observers off the async worker
//!
//! # Design Decisions
//! - Hooks are synchronous; they run inside the parser callbacks
//! - Only `accept_connection` must be implemented
//! - A panicking `accept_connection` counts as a rejection

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::ProxyError;
use crate::http::{BodyBytesKind, Request, Response};
use crate::intercept::connection::{ConnectionInfo, ConnectionMeta, HandshakeInfo, TlsDecision};
use crate::observability::metrics;

/// Receives the lifecycle of every proxied connection.
///
/// Per connection the order is: `accept_connection`, client handshake,
/// target handshake, then per request headers, body bytes, ended or error,
/// per response the same, and finally exactly one `on_connection_ended`.
pub trait Interceptor: Send + Sync + 'static {
    /// Decide what to do with a new proxy request. `None` closes the connection.
    fn accept_connection(
        &self,
        meta: &ConnectionMeta,
        method: &str,
        request_target: &str,
        http_version: &str,
    ) -> Option<TlsDecision>;

    fn on_client_handshake_complete(&self, _conn: &ConnectionInfo, _handshake: &HandshakeInfo) {}

    fn on_target_handshake_complete(&self, _conn: &ConnectionInfo, _handshake: &HandshakeInfo) {}

    /// The request head may be modified before it is sent to the target.
    fn on_request_headers_ready(&self, _conn: &ConnectionInfo, _request: &mut Request) {}

    fn on_request_body_bytes(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        _kind: BodyBytesKind,
        _bytes: &[u8],
    ) {
    }

    fn on_request_ended(&self, _conn: &ConnectionInfo, _request: &Request) {}

    fn on_request_error(&self, _conn: &ConnectionInfo, _request: &Request, _error: &ProxyError) {}

    /// The response head may be modified before it is sent to the client.
    fn on_response_headers_ready(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        _response: &mut Response,
    ) {
    }

    fn on_response_body_bytes(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        _response: &Response,
        _kind: BodyBytesKind,
        _bytes: &[u8],
    ) {
    }

    fn on_response_ended(&self, _conn: &ConnectionInfo, _request: &Request, _response: &Response) {}

    fn on_response_error(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        _response: &Response,
        _error: &ProxyError,
    ) {
    }

    /// Both directions have stopped. Each error is what stopped that direction.
    fn on_connection_ended(
        &self,
        _conn: &ConnectionInfo,
        _client_to_target: Option<&ProxyError>,
        _target_to_client: Option<&ProxyError>,
    ) {
    }
}

impl<T: Interceptor + ?Sized> Interceptor for Arc<T> {
    fn accept_connection(
        &self,
        meta: &ConnectionMeta,
        method: &str,
        request_target: &str,
        http_version: &str,
    ) -> Option<TlsDecision> {
        (**self).accept_connection(meta, method, request_target, http_version)
    }

    fn on_client_handshake_complete(&self, conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        (**self).on_client_handshake_complete(conn, handshake)
    }

    fn on_target_handshake_complete(&self, conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        (**self).on_target_handshake_complete(conn, handshake)
    }

    fn on_request_headers_ready(&self, conn: &ConnectionInfo, request: &mut Request) {
        (**self).on_request_headers_ready(conn, request)
    }

    fn on_request_body_bytes(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        (**self).on_request_body_bytes(conn, request, kind, bytes)
    }

    fn on_request_ended(&self, conn: &ConnectionInfo, request: &Request) {
        (**self).on_request_ended(conn, request)
    }

    fn on_request_error(&self, conn: &ConnectionInfo, request: &Request, error: &ProxyError) {
        (**self).on_request_error(conn, request, error)
    }

    fn on_response_headers_ready(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &mut Response,
    ) {
        (**self).on_response_headers_ready(conn, request, response)
    }

    fn on_response_body_bytes(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &Response,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        (**self).on_response_body_bytes(conn, request, response, kind, bytes)
    }

    fn on_response_ended(&self, conn: &ConnectionInfo, request: &Request, response: &Response) {
        (**self).on_response_ended(conn, request, response)
    }

    fn on_response_error(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &Response,
        error: &ProxyError,
    ) {
        (**self).on_response_error(conn, request, response, error)
    }

    fn on_connection_ended(
        &self,
        conn: &ConnectionInfo,
        client_to_target: Option<&ProxyError>,
        target_to_client: Option<&ProxyError>,
    ) {
        (**self).on_connection_ended(conn, client_to_target, target_to_client)
    }
}

/// Calls into the interceptor with panic isolation.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    interceptor: Arc<dyn Interceptor>,
    isolate_blocking: bool,
}

impl Dispatcher {
    pub(crate) fn new(interceptor: Arc<dyn Interceptor>, isolate_blocking: bool) -> Self {
        Self {
            interceptor,
            isolate_blocking,
        }
    }

    fn guard<R>(&self, hook: &'static str, fallback: R, callback: impl FnOnce() -> R) -> R {
        let callback = AssertUnwindSafe(callback);
        let result = if self.isolate_blocking && on_multi_thread_runtime() {
            tokio::task::block_in_place(|| catch_unwind(callback))
        } else {
            catch_unwind(callback)
        };
        match result {
            Ok(value) => value,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(hook, panic = %message, "Observer callback panicked");
                metrics::record_observer_panic(hook);
                fallback
            }
        }
    }

    pub(crate) fn accept_connection(
        &self,
        meta: &ConnectionMeta,
        method: &str,
        request_target: &str,
        http_version: &str,
    ) -> Option<TlsDecision> {
        self.guard("accept_connection", None, || {
            self.interceptor
                .accept_connection(meta, method, request_target, http_version)
        })
    }

    pub(crate) fn client_handshake_complete(&self, conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        self.guard("on_client_handshake_complete", (), || {
            self.interceptor.on_client_handshake_complete(conn, handshake)
        })
    }

    pub(crate) fn target_handshake_complete(&self, conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        self.guard("on_target_handshake_complete", (), || {
            self.interceptor.on_target_handshake_complete(conn, handshake)
        })
    }

    pub(crate) fn request_headers_ready(&self, conn: &ConnectionInfo, request: &mut Request) {
        self.guard("on_request_headers_ready", (), || {
            self.interceptor.on_request_headers_ready(conn, request)
        })
    }

    pub(crate) fn request_body_bytes(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        self.guard("on_request_body_bytes", (), || {
            self.interceptor.on_request_body_bytes(conn, request, kind, bytes)
        })
    }

    pub(crate) fn request_ended(&self, conn: &ConnectionInfo, request: &Request) {
        self.guard("on_request_ended", (), || {
            self.interceptor.on_request_ended(conn, request)
        })
    }

    pub(crate) fn request_error(&self, conn: &ConnectionInfo, request: &Request, error: &ProxyError) {
        self.guard("on_request_error", (), || {
            self.interceptor.on_request_error(conn, request, error)
        })
    }

    pub(crate) fn response_headers_ready(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &mut Response,
    ) {
        self.guard("on_response_headers_ready", (), || {
            self.interceptor
                .on_response_headers_ready(conn, request, response)
        })
    }

    pub(crate) fn response_body_bytes(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &Response,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        self.guard("on_response_body_bytes", (), || {
            self.interceptor
                .on_response_body_bytes(conn, request, response, kind, bytes)
        })
    }

    pub(crate) fn response_ended(&self, conn: &ConnectionInfo, request: &Request, response: &Response) {
        self.guard("on_response_ended", (), || {
            self.interceptor.on_response_ended(conn, request, response)
        })
    }

    pub(crate) fn response_error(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &Response,
        error: &ProxyError,
    ) {
        self.guard("on_response_error", (), || {
            self.interceptor
                .on_response_error(conn, request, response, error)
        })
    }

    pub(crate) fn connection_ended(
        &self,
        conn: &ConnectionInfo,
        client_to_target: Option<&ProxyError>,
        target_to_client: Option<&ProxyError>,
    ) {
        self.guard("on_connection_ended", (), || {
            self.interceptor
                .on_connection_ended(conn, client_to_target, target_to_client)
        })
    }
}

fn on_multi_thread_runtime() -> bool {
    Handle::try_current()
        .map(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
        .unwrap_or(false)
}
