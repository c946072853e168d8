//! intercepting-proxy
//!
//! Command-line front end for the TLS-intercepting forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────┐
//!                         │              INTERCEPTING PROXY               │
//!                         │                                               │
//!   CONNECT host:port     │  ┌─────────┐   ┌──────────┐   ┌───────────┐   │
//!   ──────────────────────┼─▶│   net   │──▶│intercept │──▶│ observer  │   │
//!                         │  │listener │   │   gate   │   │ decision  │   │
//!                         │  └─────────┘   └────┬─────┘   └───────────┘   │
//!                         │                     │ TLS (client)  TLS (target)
//!                         │                     ▼                         │
//!   decrypted HTTP/1.x    │  ┌──────────────────────────────┐             │      Target
//!   ◀─────────────────────┼──│ relay: two pumps + framing   │◀────────────┼───── Server
//!                         │  └──────────────────────────────┘             │
//!                         │                                               │
//!                         │  config · lifecycle · resilience · metrics    │
//!                         └──────────────────────────────────────────────┘
//! ```
//!
//! Every CONNECT is intercepted with the configured identity. Without one,
//! connections are tunnelled untouched. Either way each event is logged.

use std::path::PathBuf;

use clap::Parser;

use intercepting_proxy::config::{load_config, validate_config, ConfigError, TlsConfig};
use intercepting_proxy::lifecycle::signals::wait_for_signal;
use intercepting_proxy::observability::{logging, metrics};
use intercepting_proxy::{
    request_target_to_address, BodyBytesKind, ConnectionInfo, ConnectionMeta, HandshakeInfo,
    Interceptor, ProxyConfig, ProxyError, ProxyServer, Request, Response, ServerIdentity,
    TlsDecision, TrustPolicy,
};

#[derive(Parser)]
#[command(name = "intercepting-proxy")]
#[command(about = "TLS-intercepting forward proxy", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Listen port, overrides `listener.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// PEM certificate chain presented to clients.
    #[arg(long)]
    cert: Option<String>,

    /// PEM private key for `--cert`.
    #[arg(long)]
    key: Option<String>,

    /// PEM CA bundle used to verify targets.
    #[arg(long)]
    ca: Option<String>,

    /// Log level when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if self.cert.is_some() || self.key.is_some() || self.ca.is_some() {
            let tls = config.tls.get_or_insert_with(TlsConfig::default);
            if self.cert.is_some() {
                tls.cert_path = self.cert;
            }
            if self.key.is_some() {
                tls.key_path = self.key;
            }
            if self.ca.is_some() {
                tls.ca_path = self.ca;
            }
        }
    }
}

/// Intercepts CONNECT when an identity is available and logs every event.
struct LoggingInterceptor {
    identity: Option<ServerIdentity>,
    trust: TrustPolicy,
}

impl LoggingInterceptor {
    fn from_config(tls: Option<&TlsConfig>) -> Result<Self, Box<dyn std::error::Error>> {
        let Some(tls) = tls else {
            return Ok(Self {
                identity: None,
                trust: TrustPolicy::webpki_roots(),
            });
        };

        let identity = match (&tls.cert_path, &tls.key_path) {
            (Some(cert), Some(key)) => Some(ServerIdentity::from_pem_files(cert, key)?),
            _ => None,
        };
        let trust = match &tls.ca_path {
            Some(ca) => TrustPolicy::from_ca_pem_file(ca)?,
            None => TrustPolicy::webpki_roots(),
        };
        Ok(Self { identity, trust })
    }
}

impl Interceptor for LoggingInterceptor {
    fn accept_connection(
        &self,
        meta: &ConnectionMeta,
        method: &str,
        request_target: &str,
        _http_version: &str,
    ) -> Option<TlsDecision> {
        let target = match request_target_to_address(request_target) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(peer_addr = %meta.peer_addr, request_target, error = %e, "Rejecting proxy request");
                return None;
            }
        };

        match (&self.identity, method.eq_ignore_ascii_case("CONNECT")) {
            (Some(identity), true) => {
                tracing::info!(peer_addr = %meta.peer_addr, target = %target, "Intercepting");
                Some(TlsDecision::intercept(target, identity.clone(), self.trust.clone()))
            }
            _ => {
                tracing::info!(peer_addr = %meta.peer_addr, target = %target, method, "Tunnelling");
                Some(TlsDecision::passthrough(target))
            }
        }
    }

    fn on_client_handshake_complete(&self, conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        tracing::info!(
            connection_id = %conn.id(),
            sni = handshake.server_name.as_deref().unwrap_or("-"),
            protocol = handshake.protocol_version.as_deref().unwrap_or("-"),
            cipher = handshake.cipher_suite.as_deref().unwrap_or("-"),
            "Client handshake complete"
        );
    }

    fn on_target_handshake_complete(&self, conn: &ConnectionInfo, handshake: &HandshakeInfo) {
        tracing::info!(
            connection_id = %conn.id(),
            target = %conn.target(),
            protocol = handshake.protocol_version.as_deref().unwrap_or("-"),
            cipher = handshake.cipher_suite.as_deref().unwrap_or("-"),
            "Target handshake complete"
        );
    }

    fn on_request_headers_ready(&self, conn: &ConnectionInfo, request: &mut Request) {
        tracing::info!(
            connection_id = %conn.id(),
            method = request.method(),
            target = request.target(),
            "Request"
        );
    }

    fn on_request_body_bytes(
        &self,
        conn: &ConnectionInfo,
        _request: &Request,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        if kind == BodyBytesKind::Content {
            tracing::debug!(connection_id = %conn.id(), len = bytes.len(), "Request body");
        }
    }

    fn on_request_error(&self, conn: &ConnectionInfo, request: &Request, error: &ProxyError) {
        tracing::warn!(connection_id = %conn.id(), target = request.target(), error = %error, "Request failed");
    }

    fn on_response_headers_ready(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        response: &mut Response,
    ) {
        tracing::info!(
            connection_id = %conn.id(),
            target = request.target(),
            status = response.status(),
            "Response"
        );
    }

    fn on_response_body_bytes(
        &self,
        conn: &ConnectionInfo,
        _request: &Request,
        _response: &Response,
        kind: BodyBytesKind,
        bytes: &[u8],
    ) {
        if kind == BodyBytesKind::Content {
            tracing::debug!(connection_id = %conn.id(), len = bytes.len(), "Response body");
        }
    }

    fn on_response_error(
        &self,
        conn: &ConnectionInfo,
        request: &Request,
        _response: &Response,
        error: &ProxyError,
    ) {
        tracing::warn!(connection_id = %conn.id(), target = request.target(), error = %error, "Response failed");
    }

    fn on_connection_ended(
        &self,
        conn: &ConnectionInfo,
        client_to_target: Option<&ProxyError>,
        target_to_client: Option<&ProxyError>,
    ) {
        tracing::info!(
            connection_id = %conn.id(),
            target = %conn.target(),
            client_to_target = ?client_to_target.map(ToString::to_string),
            target_to_client = ?target_to_client.map(ToString::to_string),
            "Connection ended"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!("intercepting-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        let addr: std::net::SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let interceptor = LoggingInterceptor::from_config(config.tls.as_ref())?;
    if interceptor.identity.is_none() {
        tracing::warn!("No certificate configured, tunnelling all connections");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        port = config.listener.port,
        max_connections = config.listener.max_connections,
        "Configuration loaded"
    );

    let handle = ProxyServer::start(config, interceptor).await?;
    tracing::info!(address = %handle.address(), "Listening for connections");

    let signal = wait_for_signal().await?;
    tracing::info!(signal, "Received shutdown signal");

    handle.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
