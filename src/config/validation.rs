//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, delays ordered, addresses parse)
//! - Check that TLS paths come in usable combinations
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Smallest head limit that still fits ordinary requests.
const MIN_HEAD_BYTES: usize = 1024;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not an IP address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    if config.listener.backlog == 0 {
        errors.push(ValidationError::new("listener.backlog", "must be > 0"));
    }

    if config.timeouts.idle_ms == Some(0) {
        errors.push(ValidationError::new("timeouts.idle_ms", "must be > 0 when set"));
    }
    if config.timeouts.handshake_ms == Some(0) {
        errors.push(ValidationError::new("timeouts.handshake_ms", "must be > 0 when set"));
    }

    if config.accept_retry.base_delay_ms == 0 {
        errors.push(ValidationError::new("accept_retry.base_delay_ms", "must be > 0"));
    }
    if config.accept_retry.base_delay_ms > config.accept_retry.max_delay_ms {
        errors.push(ValidationError::new(
            "accept_retry.max_delay_ms",
            "must not be below base_delay_ms",
        ));
    }

    if config.limits.max_head_bytes < MIN_HEAD_BYTES {
        errors.push(ValidationError::new(
            "limits.max_head_bytes",
            format!("must be at least {MIN_HEAD_BYTES}"),
        ));
    }
    if config.limits.max_chunk_line_bytes == 0 {
        errors.push(ValidationError::new("limits.max_chunk_line_bytes", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.is_some() != tls.key_path.is_some() {
            errors.push(ValidationError::new(
                "tls",
                "cert_path and key_path must be set together",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "localhost:80".into();
        config.timeouts.idle_ms = Some(0);
        config.accept_retry.base_delay_ms = 2_000;
        config.limits.max_head_bytes = 100;
        config.tls = Some(TlsConfig {
            cert_path: Some("cert.pem".into()),
            ..TlsConfig::default()
        });

        let fields: Vec<_> = validate_config(&config)
            .unwrap_err()
            .into_iter()
            .map(|e| e.field)
            .collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "timeouts.idle_ms",
                "accept_retry.max_delay_ms",
                "limits.max_head_bytes",
                "tls",
            ]
        );
    }

    #[test]
    fn metrics_address_only_checked_when_enabled() {
        let mut config = ProxyConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
