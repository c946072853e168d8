//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::ParserLimits;

/// Root configuration for the intercepting proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, port, limits).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Backoff applied when `accept` fails transiently.
    pub accept_retry: AcceptRetryConfig,

    /// Framing limits for intercepted HTTP traffic.
    pub limits: LimitsConfig,

    /// Observer dispatch settings.
    pub observer: ObserverConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Identity and trust material, used by the command-line binary.
    pub tls: Option<TlsConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1", "::").
    pub bind_address: String,

    /// Port to listen on. 0 picks an ephemeral port.
    pub port: u16,

    /// Listen backlog passed to the OS.
    pub backlog: u32,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            backlog: 50,
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration for connection phases.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Longest a read or write may stall before the connection is dropped.
    pub idle_ms: Option<u64>,

    /// Bound on each TLS handshake (target side includes the TCP connect).
    pub handshake_ms: Option<u64>,

    /// How long `close()` waits for connections before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_ms: None,
            handshake_ms: None,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn idle(&self) -> Option<Duration> {
        self.idle_ms.map(Duration::from_millis)
    }

    pub fn handshake(&self) -> Option<Duration> {
        self.handshake_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Accept error backoff.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcceptRetryConfig {
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound for the retry delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for AcceptRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1_000,
        }
    }
}

/// Framing limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a message head (start line plus headers).
    pub max_head_bytes: usize,

    /// Maximum size of a chunk size line.
    pub max_chunk_line_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ParserLimits::default();
        Self {
            max_head_bytes: limits.max_head_bytes,
            max_chunk_line_bytes: limits.max_chunk_line_bytes,
        }
    }
}

impl LimitsConfig {
    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_head_bytes: self.max_head_bytes,
            max_chunk_line_bytes: self.max_chunk_line_bytes,
        }
    }
}

/// Observer dispatch settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Run callbacks through `block_in_place` on multi-threaded runtimes.
    pub isolate_blocking_callbacks: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            isolate_blocking_callbacks: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Certificate material for the command-line proxy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented to clients.
    pub cert_path: Option<String>,

    /// PEM private key for `cert_path`.
    pub key_path: Option<String>,

    /// PEM CA bundle used to verify targets. Defaults to the webpki roots.
    pub ca_path: Option<String>,
}
