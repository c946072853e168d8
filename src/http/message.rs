//! Request and response heads plus body framing rules.
//!
//! # Responsibilities
//! - Hold the parsed start line and headers of one message
//! - Keep the exact head bytes so untouched messages are forwarded verbatim
//! - Decide how the body is delimited (RFC 9112 section 6.3)

use bytes::{BufMut, Bytes, BytesMut};

use crate::http::error::FramingError;
use crate::http::headers::Headers;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the sender closes the connection.
    UntilClose,
    /// The head switches the connection to another protocol.
    Tunnel,
}

/// Classification of body bytes handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyBytesKind {
    /// Wire bytes, including chunk sizes, chunk delimiters and trailers.
    Raw,
    /// Decoded payload only.
    Content,
}

/// One HTTP request head framed on the client to target direction.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    target: String,
    version: String,
    headers: Headers,
    framing: BodyFraming,
    raw_head: Bytes,
    modified: bool,
}

impl Request {
    pub(crate) fn new(
        method: String,
        target: String,
        version: String,
        headers: Headers,
        raw_head: Bytes,
    ) -> Result<Self, FramingError> {
        let framing = request_framing(&headers)?;
        Ok(Self {
            method,
            target,
            version,
            headers,
            framing,
            raw_head,
            modified: false,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request-target exactly as sent (origin, absolute, authority or asterisk form).
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable headers. Any access marks the head for re-serialization.
    pub fn headers_mut(&mut self) -> &mut Headers {
        self.modified = true;
        &mut self.headers
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.modified = true;
        self.method = method.into();
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.modified = true;
        self.target = target.into();
    }

    /// Body framing determined when the head was parsed.
    pub fn body_framing(&self) -> BodyFraming {
        self.framing
    }

    /// Whether the client asked to switch protocols after this request.
    ///
    /// Only a `101` answer (or a 2xx to CONNECT) actually switches.
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains("upgrade") || self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Head bytes to forward: the original bytes unless the head was touched.
    pub fn head_bytes(&self) -> Bytes {
        if !self.modified {
            return self.raw_head.clone();
        }
        let mut out = BytesMut::with_capacity(self.raw_head.len() + 64);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.version.as_bytes());
        out.put_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

/// One HTTP response head framed on the target to client direction.
#[derive(Debug, Clone)]
pub struct Response {
    version: String,
    status: u16,
    reason: String,
    headers: Headers,
    framing: BodyFraming,
    raw_head: Bytes,
    modified: bool,
}

impl Response {
    pub(crate) fn new(
        version: String,
        status: u16,
        reason: String,
        headers: Headers,
        raw_head: Bytes,
        request: &Request,
    ) -> Result<Self, FramingError> {
        let framing = response_framing(status, &headers, request)?;
        Ok(Self {
            version,
            status,
            reason,
            headers,
            framing,
            raw_head,
            modified: false,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable headers. Any access marks the head for re-serialization.
    pub fn headers_mut(&mut self) -> &mut Headers {
        self.modified = true;
        &mut self.headers
    }

    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        self.modified = true;
        self.status = status;
        self.reason = reason.into();
    }

    pub fn body_framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Head bytes to forward: the original bytes unless the head was touched.
    pub fn head_bytes(&self) -> Bytes {
        if !self.modified {
            return self.raw_head.clone();
        }
        let mut out = BytesMut::with_capacity(self.raw_head.len() + 64);
        out.put_slice(self.version.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.status.to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.reason.as_bytes());
        out.put_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

/// Interim responses (1xx other than 101) precede the final response.
pub(crate) fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

fn request_framing(headers: &Headers) -> Result<BodyFraming, FramingError> {
    if headers.contains("transfer-encoding") {
        return match headers.list_values("transfer-encoding").last() {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
            other => Err(FramingError::UnsupportedTransferEncoding(
                other.unwrap_or_default().to_string(),
            )),
        };
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyFraming::None,
        Some(len) => BodyFraming::Fixed(len),
    })
}

fn response_framing(
    status: u16,
    headers: &Headers,
    request: &Request,
) -> Result<BodyFraming, FramingError> {
    if status == 101 {
        return Ok(BodyFraming::Tunnel);
    }
    if request.method().eq_ignore_ascii_case("CONNECT") && (200..300).contains(&status) {
        return Ok(BodyFraming::Tunnel);
    }
    if request.method().eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::None);
    }
    if headers.contains("transfer-encoding") {
        let last = headers.list_values("transfer-encoding").last();
        return Ok(match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => BodyFraming::Chunked,
            _ => BodyFraming::UntilClose,
        });
    }
    Ok(match content_length(headers)? {
        Some(0) => BodyFraming::None,
        Some(len) => BodyFraming::Fixed(len),
        None => BodyFraming::UntilClose,
    })
}

/// Parse `Content-Length`, allowing repeats of one identical value.
fn content_length(headers: &Headers) -> Result<Option<u64>, FramingError> {
    let mut found: Option<u64> = None;
    for value in headers.list_values("content-length") {
        if value.is_empty() || value.len() > 19 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FramingError::InvalidContentLength(value.to_string()));
        }
        let len: u64 = value
            .parse()
            .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;
        match found {
            Some(existing) if existing != len => {
                return Err(FramingError::ConflictingContentLength)
            }
            _ => found = Some(len),
        }
    }
    if found.is_none() && headers.contains("content-length") {
        return Err(FramingError::InvalidContentLength(String::new()));
    }
    Ok(found)
}
