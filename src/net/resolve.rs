//! Turn a proxy request-target into a host and port.
//!
//! Accepts the authority form used by `CONNECT` (`host:port`, `[::1]:443`)
//! and the absolute form used by plain forward proxying
//! (`http://host[:port]/path`).

use std::fmt;

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("empty request target")]
    Empty,

    #[error("request target {0:?} has no port")]
    MissingPort(String),

    #[error("invalid port in request target {0:?}")]
    InvalidPort(String),

    #[error("invalid host in request target {0:?}")]
    InvalidHost(String),

    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
}

/// A destination host and port. IPv6 hosts are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    host: String,
    port: u16,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolve a request-target to the address it names.
pub fn request_target_to_address(target: &str) -> Result<TargetAddress, ResolveError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ResolveError::Empty);
    }
    if target.contains("://") {
        return from_absolute(target);
    }
    from_authority(target)
}

fn from_absolute(target: &str) -> Result<TargetAddress, ResolveError> {
    let url = Url::parse(target).map_err(|_| ResolveError::InvalidHost(target.to_string()))?;
    let default_port = match url.scheme() {
        "http" | "ws" => 80,
        "https" | "wss" => 443,
        other => return Err(ResolveError::UnsupportedScheme(other.to_string())),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ResolveError::InvalidHost(target.to_string()))?;
    Ok(TargetAddress::new(host, url.port().unwrap_or(default_port)))
}

fn from_authority(target: &str) -> Result<TargetAddress, ResolveError> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ResolveError::InvalidHost(target.to_string()))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| ResolveError::MissingPort(target.to_string()))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .ok_or_else(|| ResolveError::MissingPort(target.to_string()))?
    };

    if host.is_empty() || host.contains(['/', ' ', '@']) {
        return Err(ResolveError::InvalidHost(target.to_string()));
    }
    let port: u16 = port
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ResolveError::InvalidPort(target.to_string()))?;
    Ok(TargetAddress::new(host, port))
}
