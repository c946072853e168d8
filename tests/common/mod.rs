//! Shared utilities for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use intercepting_proxy::{
    request_target_to_address, BodyBytesKind, ConnectionInfo, ConnectionMeta, HandshakeInfo,
    Interceptor, ProxyConfig, ProxyError, Request, Response, ServerIdentity, TlsDecision,
    TrustPolicy,
};

/// A throwaway CA plus one leaf for `localhost` / `127.0.0.1`.
pub struct TestPki {
    ca_der: CertificateDer<'static>,
    ca_pem: String,
    leaf_der: CertificateDer<'static>,
    leaf_pem: String,
    leaf_key_der: Vec<u8>,
    leaf_key_pem: String,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "intercepting-proxy test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        leaf_params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Self {
            ca_der: ca.der().clone(),
            ca_pem: ca.pem(),
            leaf_der: leaf.der().clone(),
            leaf_pem: leaf.pem(),
            leaf_key_der: leaf_key.serialize_der(),
            leaf_key_pem: leaf_key.serialize_pem(),
        }
    }

    /// What the proxy presents to intercepted clients.
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::from_pem(self.leaf_pem.as_bytes(), self.leaf_key_pem.as_bytes()).unwrap()
    }

    /// How the proxy verifies test targets.
    pub fn trust(&self) -> TrustPolicy {
        TrustPolicy::from_ca_pem(self.ca_pem.as_bytes()).unwrap()
    }

    pub fn target_acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key_der.clone()));
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.leaf_der.clone()], key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    pub fn client_connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

/// Proxy config bound to an ephemeral loopback port.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.timeouts.shutdown_grace_ms = 2_000;
    config
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start a TLS server; `handler` gets each decrypted connection.
pub async fn start_tls_target<F, Fut>(pki: &TestPki, handler: F) -> SocketAddr
where
    F: Fn(ServerTlsStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = pki.target_acceptor();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    handler(tls).await;
                }
            });
        }
    });

    addr
}

/// Heads received by an HTTP target, in arrival order.
pub type SeenHeads = Arc<Mutex<Vec<String>>>;

/// Keep-alive HTTP/1.1 target answering every request with `respond(head, body)`.
pub async fn start_http_target<F>(pki: &TestPki, respond: F) -> (SocketAddr, SeenHeads)
where
    F: Fn(&str, &[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    let seen: SeenHeads = Arc::default();
    let respond = Arc::new(respond);
    let recorded = seen.clone();
    let addr = start_tls_target(pki, move |mut tls| {
        let respond = respond.clone();
        let recorded = recorded.clone();
        async move {
            while let Some(head) = read_head(&mut tls).await {
                let body = read_body(&mut tls, &head).await;
                recorded.lock().unwrap().push(head.clone());
                let reply = respond(&head, &body);
                if tls.write_all(&reply).await.is_err() {
                    break;
                }
                let _ = tls.flush().await;
            }
            let _ = tls.shutdown().await;
        }
    })
    .await;
    (addr, seen)
}

pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Send a proxy request and return the proxy's reply head.
pub async fn send_proxy_request(proxy: SocketAddr, line: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("{line}\r\nHost: test\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await.unwrap_or_default();
    (stream, head)
}

/// CONNECT through the proxy and expect `200 Connection Established`.
pub async fn connect_through_proxy(proxy: SocketAddr, authority: &str) -> TcpStream {
    let (stream, head) = send_proxy_request(proxy, &format!("CONNECT {authority} HTTP/1.1")).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established"),
        "unexpected proxy reply: {head:?}"
    );
    stream
}

/// CONNECT, then TLS to the proxy's presented identity with SNI `localhost`.
pub async fn tls_through_proxy(
    pki: &TestPki,
    proxy: SocketAddr,
    authority: &str,
) -> ClientTlsStream<TcpStream> {
    let tcp = connect_through_proxy(proxy, authority).await;
    let name = ServerName::try_from("localhost").unwrap();
    pki.client_connector().connect(name, tcp).await.unwrap()
}

/// Read a head up to and including the blank line. `None` on EOF.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

fn is_chunked(head: &str) -> bool {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        })
}

/// Read the body for `head`: chunked up to the last-chunk marker, else Content-Length.
pub async fn read_body<S: AsyncRead + Unpin>(stream: &mut S, head: &str) -> Vec<u8> {
    if is_chunked(head) {
        let mut body = Vec::new();
        let mut byte = [0u8; 1];
        while !body.ends_with(b"0\r\n\r\n") {
            match stream.read(&mut byte).await {
                Ok(1) => body.push(byte[0]),
                _ => break,
            }
        }
        return body;
    }
    let mut body = vec![0u8; content_length(head)];
    if stream.read_exact(&mut body).await.is_err() {
        body.clear();
    }
    body
}

/// Read one Content-Length delimited response.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let head = read_head(stream).await.expect("response head");
    let body = read_body(stream, &head).await;
    (head, body)
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Short label for an error, stable enough to assert on.
pub fn error_tag(error: &ProxyError) -> String {
    match error {
        ProxyError::Timeout { phase, .. } => format!("timeout:{phase}"),
        ProxyError::Framing(_) => "framing".into(),
        ProxyError::ClientHandshake(_) => "client_handshake".into(),
        ProxyError::TargetConnect { .. } => "target_connect".into(),
        ProxyError::TargetHandshake(_) => "target_handshake".into(),
        ProxyError::InvalidServerName(_) => "server_name".into(),
        ProxyError::UnsupportedMethod(_) => "unsupported_method".into(),
        ProxyError::Shutdown => "shutdown".into(),
        ProxyError::Io(_) => "io".into(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accept { method: String, target: String },
    ClientHandshake { server_name: Option<String>, alpn: Option<String> },
    TargetHandshake { server_name: Option<String> },
    RequestHeaders { method: String, target: String },
    RequestBody { kind: BodyBytesKind, bytes: Vec<u8> },
    RequestEnded { target: String },
    RequestError { target: String, error: String },
    ResponseHeaders { status: u16 },
    ResponseBody { kind: BodyBytesKind, bytes: Vec<u8> },
    ResponseEnded { status: u16 },
    ResponseError { status: u16, error: String },
    ConnectionEnded { client_to_target: Option<String>, target_to_client: Option<String> },
}

impl Event {
    pub fn is_connection_ended(&self) -> bool {
        matches!(self, Event::ConnectionEnded { .. })
    }
}

#[derive(Clone)]
pub enum Decision {
    Intercept,
    Passthrough,
    Reject,
}

/// Records every hook call and answers `accept_connection` with `decision`.
pub struct RecordingInterceptor {
    events: Mutex<Vec<Event>>,
    decision: Decision,
    identity: Option<ServerIdentity>,
    trust: Option<TrustPolicy>,
    /// Header added to every request head.
    pub inject_header: Option<(String, String)>,
    /// Hook name that panics instead of recording.
    pub panic_in: Option<&'static str>,
}

impl RecordingInterceptor {
    pub fn intercepting(pki: &TestPki) -> Self {
        Self {
            identity: Some(pki.identity()),
            trust: Some(pki.trust()),
            ..Self::with_decision(Decision::Intercept)
        }
    }

    pub fn with_decision(decision: Decision) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            decision,
            identity: None,
            trust: None,
            inject_header: None,
            panic_in: None,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn has_ended(&self) -> bool {
        self.count(Event::is_connection_ended) > 0
    }

    fn record(&self, hook: &'static str, event: Event) {
        if self.panic_in == Some(hook) {
            panic!("observer failure in {hook}");
        }
        self.events.lock().unwrap().push(event);
    }
}

impl Interceptor for RecordingInterceptor {
    fn accept_connection(
        &self,
        _meta: &ConnectionMeta,
        method: &str,
        request_target: &str,
        _http_version: &str,
    ) -> Option<TlsDecision> {
        self.record(
            "accept_connection",
            Event::Accept {
                method: method.to_string(),
                target: request_target.to_string(),
            },
        );
        let target = request_target_to_address(request_target).ok()?;
        match &self.decision {
            Decision::Reject => None,
            Decision::Passthrough => Some(TlsDecision::passthrough(target)),
            Decision::Intercept => Some(TlsDecision::intercept(
                target,
                self.identity.clone()?,
                self.trust.clone()?,
            )),
        }
    }

    fn on_client_handshake_complete(&self, _conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        self.record(
            "client_handshake",
            Event::ClientHandshake {
                server_name: handshake.server_name.clone(),
                alpn: handshake.alpn_protocol.clone(),
            },
        );
    }

    fn on_target_handshake_complete(&self, _conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        self.record(
            "target_handshake",
            Event::TargetHandshake {
                server_name: handshake.server_name.clone(),
            },
        );
    }

    fn on_request_headers_ready(&self, _conn: &ConnectionInfo, request: &mut Request) {
        if let Some((name, value)) = &self.inject_header {
            request.headers_mut().set(name.as_str(), value.as_str());
        }
        self.record(
            "request_headers",
            Event::RequestHeaders {
                method: request.method().to_string(),
                target: request.target().to_string(),
            },
        );
    }

    fn on_request_body_bytes(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        self.record(
            "request_body",
            Event::RequestBody {
                kind,
                bytes: bytes.to_vec(),
            },
        );
    }

    fn on_request_ended(&self, _conn: &ConnectionInfo, request: &Request) {
        self.record(
            "request_ended",
            Event::RequestEnded {
                target: request.target().to_string(),
            },
        );
    }

    fn on_request_error(&self, _conn: &ConnectionInfo, request: &Request, error: &ProxyError) {
        self.record(
            "request_error",
            Event::RequestError {
                target: request.target().to_string(),
                error: error_tag(error),
            },
        );
    }

    fn on_response_headers_ready(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        response: &mut Response,
    ) {
        self.record(
            "response_headers",
            Event::ResponseHeaders {
                status: response.status(),
            },
        );
    }

    fn on_response_body_bytes(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        _response: &Response,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        self.record(
            "response_body",
            Event::ResponseBody {
                kind,
                bytes: bytes.to_vec(),
            },
        );
    }

    fn on_response_ended(&self, _conn: &ConnectionInfo, _request: &Request, response: &Response) {
        self.record(
            "response_ended",
            Event::ResponseEnded {
                status: response.status(),
            },
        );
    }

    fn on_response_error(
        &self,
        _conn: &ConnectionInfo,
        _request: &Request,
        response: &Response,
        error: &ProxyError,
    ) {
        self.record(
            "response_error",
            Event::ResponseError {
                status: response.status(),
                error: error_tag(error),
            },
        );
    }

    fn on_connection_ended(
        &self,
        _conn: &ConnectionInfo,
        client_to_target: Option<&ProxyError>,
        target_to_client: Option<&ProxyError>,
    ) {
        self.record(
            "connection_ended",
            Event::ConnectionEnded {
                client_to_target: client_to_target.map(error_tag),
                target_to_client: target_to_client.map(error_tag),
            },
        );
    }
}
