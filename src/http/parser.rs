//! Incremental HTTP/1.x framing.
//!
//! # Responsibilities
//! - Split a byte stream into message heads and body spans
//! - Classify body spans as raw wire bytes or decoded content
//! - Hand each completed request to the response side of the same connection
//! - Hold the request side after an upgrade or CONNECT until the response
//!   says whether the connection switched protocols
//!
//! # Design Decisions
//! - Synchronous and push based: the caller feeds whatever it read and the
//!   parser calls back into a [`ParseListener`] before returning
//! - The parser never writes; the listener decides what reaches the other leg
//! - One parser per direction, reused for every message on a kept-alive connection

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::http::error::FramingError;
use crate::http::headers::Headers;
use crate::http::message::{is_interim, BodyBytesKind, BodyFraming, Request, Response};

/// Size limits applied while framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Upper bound for a start line plus headers, and separately for trailers.
    pub max_head_bytes: usize,
    /// Upper bound for one chunk size line including extensions.
    pub max_chunk_line_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_chunk_line_bytes: 4096,
        }
    }
}

/// Receives framing events in wire order.
pub trait ParseListener<M> {
    /// A complete head was parsed. The message may be modified.
    fn on_headers(&mut self, message: &mut M);

    /// A span of body bytes. Raw spans precede the Content span they contain.
    fn on_body(&mut self, message: &M, kind: BodyBytesKind, bytes: &[u8]);

    /// The message body is complete.
    fn on_ended(&mut self, message: &M);

    /// Bytes outside any observed message: blank lines between messages,
    /// interim responses and tunnelled traffic.
    fn on_passthrough(&mut self, bytes: &[u8]);
}

/// Outcome of turning a parsed head into a message.
pub enum Head<M> {
    Message(M),
    /// An interim (1xx) response, forwarded without events.
    Interim,
}

/// Direction specific part of the parser.
pub trait Role {
    type Start;
    type Message;

    fn parse_start(&self, line: &str) -> Result<Self::Start, FramingError>;

    fn build(
        &mut self,
        start: Self::Start,
        headers: Headers,
        raw_head: Bytes,
    ) -> Result<Head<Self::Message>, FramingError>;

    fn framing(message: &Self::Message) -> BodyFraming;

    /// Called once the listener is done with the head.
    fn headers_delivered(&mut self, _message: &Arc<Self::Message>) {}

    /// Whether bytes after this message depend on the peer accepting a protocol switch.
    fn requests_switch(_message: &Self::Message) -> bool {
        false
    }

    /// Answers to switch requests, in request order. `true` means the peer switched.
    fn switch_answers(&mut self) -> Option<&mut mpsc::UnboundedReceiver<bool>> {
        None
    }
}

/// A response together with the request it answers.
#[derive(Debug)]
pub struct Exchange {
    request: Arc<Request>,
    response: Response,
}

impl Exchange {
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// The request alongside a mutable response.
    pub fn parts_mut(&mut self) -> (&Request, &mut Response) {
        (&self.request, &mut self.response)
    }
}

pub struct RequestRole {
    pending: mpsc::UnboundedSender<Arc<Request>>,
    answers: mpsc::UnboundedReceiver<bool>,
}

pub struct RequestStart {
    method: String,
    target: String,
    version: String,
}

impl Role for RequestRole {
    type Start = RequestStart;
    type Message = Request;

    fn parse_start(&self, line: &str) -> Result<RequestStart, FramingError> {
        let malformed = || FramingError::MalformedStartLine(line.to_string());
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if !is_token(method) || target.is_empty() || target.contains(['\t', '\r']) {
            return Err(malformed());
        }
        if !is_http_version(version) {
            return Err(malformed());
        }
        Ok(RequestStart {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    fn build(
        &mut self,
        start: RequestStart,
        headers: Headers,
        raw_head: Bytes,
    ) -> Result<Head<Request>, FramingError> {
        Request::new(start.method, start.target, start.version, headers, raw_head).map(Head::Message)
    }

    fn framing(message: &Request) -> BodyFraming {
        message.body_framing()
    }

    fn headers_delivered(&mut self, message: &Arc<Request>) {
        // The response side may already be gone; its parser reports that on its own.
        let _ = self.pending.send(Arc::clone(message));
    }

    fn requests_switch(message: &Request) -> bool {
        message.is_upgrade()
    }

    fn switch_answers(&mut self) -> Option<&mut mpsc::UnboundedReceiver<bool>> {
        Some(&mut self.answers)
    }
}

pub struct ResponseRole {
    pending: mpsc::UnboundedReceiver<Arc<Request>>,
    answers: mpsc::UnboundedSender<bool>,
}

pub struct ResponseStart {
    version: String,
    status: u16,
    reason: String,
}

impl Role for ResponseRole {
    type Start = ResponseStart;
    type Message = Exchange;

    fn parse_start(&self, line: &str) -> Result<ResponseStart, FramingError> {
        let malformed = || FramingError::MalformedStartLine(line.to_string());
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let code = parts.next().ok_or_else(malformed)?;
        let reason = parts.next().unwrap_or_default();
        if !is_http_version(version) {
            return Err(malformed());
        }
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let status: u16 = code.parse().map_err(|_| malformed())?;
        if status < 100 {
            return Err(malformed());
        }
        Ok(ResponseStart {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
        })
    }

    fn build(
        &mut self,
        start: ResponseStart,
        headers: Headers,
        raw_head: Bytes,
    ) -> Result<Head<Exchange>, FramingError> {
        if is_interim(start.status) {
            return Ok(Head::Interim);
        }
        let request = self
            .pending
            .try_recv()
            .map_err(|_| FramingError::ResponseWithoutRequest)?;
        let response = Response::new(
            start.version,
            start.status,
            start.reason,
            headers,
            raw_head,
            &request,
        )?;
        if request.is_upgrade() {
            let switched = response.body_framing() == BodyFraming::Tunnel;
            // The request side may already be gone; nothing is waiting then.
            let _ = self.answers.send(switched);
        }
        Ok(Head::Message(Exchange { request, response }))
    }

    fn framing(message: &Exchange) -> BodyFraming {
        message.response.body_framing()
    }
}

pub type RequestParser = Http1Parser<RequestRole>;
pub type ResponseParser = Http1Parser<ResponseRole>;

/// Parsers for both directions of one connection, linked so that every
/// response is matched with the oldest request still awaiting one.
pub fn pipeline(limits: ParserLimits) -> (RequestParser, ResponseParser) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (answer_tx, answer_rx) = mpsc::unbounded_channel();
    (
        Http1Parser::new(
            RequestRole {
                pending: tx,
                answers: answer_rx,
            },
            limits,
        ),
        Http1Parser::new(
            ResponseRole {
                pending: rx,
                answers: answer_tx,
            },
            limits,
        ),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers { consumed: usize },
    UntilClose,
    AwaitingSwitch,
    Tunnel,
    Failed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::StartLine => "start line",
            State::Headers => "headers",
            State::FixedBody { .. } => "fixed-length body",
            State::ChunkSize => "chunk size line",
            State::ChunkData { .. } => "chunk data",
            State::ChunkDataEnd => "chunk terminator",
            State::Trailers { .. } => "trailers",
            State::UntilClose => "close-delimited body",
            State::AwaitingSwitch => "pending protocol switch",
            State::Tunnel => "tunnel",
            State::Failed => "failed parser",
        }
    }
}

/// Framing state machine for one direction of a connection.
pub struct Http1Parser<R: Role> {
    role: R,
    limits: ParserLimits,
    state: State,
    buf: BytesMut,
    head: BytesMut,
    start: Option<R::Start>,
    headers: Headers,
    in_flight: Option<Arc<R::Message>>,
}

impl<R: Role> Http1Parser<R> {
    pub fn new(role: R, limits: ParserLimits) -> Self {
        Self {
            role,
            limits,
            state: State::StartLine,
            buf: BytesMut::new(),
            head: BytesMut::new(),
            start: None,
            headers: Headers::new(),
            in_flight: None,
        }
    }

    /// The message whose headers were delivered and that has not ended yet.
    pub fn in_flight(&self) -> Option<&Arc<R::Message>> {
        self.in_flight.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    pub fn is_tunnel(&self) -> bool {
        self.state == State::Tunnel
    }

    /// Framing is paused until the peer answers an upgrade or CONNECT.
    pub fn awaits_switch(&self) -> bool {
        self.state == State::AwaitingSwitch
    }

    /// Wait for the answer to a pending switch, then frame any bytes held meanwhile.
    ///
    /// Cancel safe. An answer that can no longer arrive counts as a refusal.
    pub async fn resolve_switch<L>(&mut self, listener: &mut L) -> Result<(), FramingError>
    where
        L: ParseListener<R::Message>,
    {
        if self.state != State::AwaitingSwitch {
            return Ok(());
        }
        let switched = match self.role.switch_answers() {
            Some(answers) => answers.recv().await.unwrap_or(false),
            None => false,
        };
        self.apply_switch(switched);
        match self.drive(listener) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    fn apply_switch(&mut self, switched: bool) {
        self.state = if switched {
            State::Tunnel
        } else {
            State::StartLine
        };
    }

    /// Process the next bytes read from the wire.
    pub fn feed<L>(&mut self, data: &[u8], listener: &mut L) -> Result<(), FramingError>
    where
        L: ParseListener<R::Message>,
    {
        if self.state == State::Failed {
            return Err(FramingError::AlreadyFailed);
        }
        self.buf.extend_from_slice(data);
        match self.drive(listener) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    /// The source reached end of stream.
    pub fn finish<L>(&mut self, listener: &mut L) -> Result<(), FramingError>
    where
        L: ParseListener<R::Message>,
    {
        match self.state {
            State::Failed => Err(FramingError::AlreadyFailed),
            State::Tunnel => Ok(()),
            State::AwaitingSwitch => {
                // Nothing will frame these any more; keep them on the wire.
                let held = self.buf.split();
                if !held.is_empty() {
                    listener.on_passthrough(&held);
                }
                Ok(())
            }
            State::UntilClose => {
                self.end_message(listener);
                Ok(())
            }
            State::StartLine if self.buf.is_empty() => Ok(()),
            state => {
                self.state = State::Failed;
                Err(FramingError::UnexpectedEof { state: state.name() })
            }
        }
    }

    fn drive<L>(&mut self, listener: &mut L) -> Result<(), FramingError>
    where
        L: ParseListener<R::Message>,
    {
        loop {
            if self.buf.is_empty() {
                return Ok(());
            }
            match self.state {
                State::StartLine => {
                    let limit = self.limits.max_head_bytes;
                    let Some(line) = take_line(&mut self.buf, limit)
                        .map_err(|e| e.or_head_limit(limit))?
                    else {
                        return Ok(());
                    };
                    if &line[..] == b"\r\n" {
                        listener.on_passthrough(&line);
                        continue;
                    }
                    let text = line_text(&line);
                    self.start = Some(self.role.parse_start(text.as_ref())?);
                    self.head.extend_from_slice(&line);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let limit = self.limits.max_head_bytes;
                    let remaining = limit.saturating_sub(self.head.len());
                    let Some(line) = take_line(&mut self.buf, remaining)
                        .map_err(|e| e.or_head_limit(limit))?
                    else {
                        return Ok(());
                    };
                    self.head.extend_from_slice(&line);
                    if &line[..] == b"\r\n" {
                        self.complete_head(listener)?;
                    } else {
                        let (name, value) = parse_field(&line)
                            .ok_or_else(|| FramingError::InvalidHeader(line_text(&line).into()))?;
                        self.headers.append(name, value);
                    }
                }
                State::FixedBody { remaining } => {
                    let left = self.emit_body(remaining, listener);
                    if left == 0 {
                        self.end_message(listener);
                    } else {
                        self.state = State::FixedBody { remaining: left };
                    }
                }
                State::ChunkSize => {
                    let limit = self.limits.max_chunk_line_bytes;
                    let Some(line) = take_line(&mut self.buf, limit)
                        .map_err(|e| e.or_line_limit(limit))?
                    else {
                        return Ok(());
                    };
                    let size = parse_chunk_size(&line)?;
                    self.emit_raw(&line, listener);
                    self.state = if size == 0 {
                        State::Trailers { consumed: 0 }
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    let left = self.emit_body(remaining, listener);
                    self.state = if left == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                }
                State::ChunkDataEnd => {
                    if self.buf[0] != b'\r' {
                        return Err(FramingError::MissingChunkTerminator);
                    }
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if self.buf[1] != b'\n' {
                        return Err(FramingError::MissingChunkTerminator);
                    }
                    let crlf = self.buf.split_to(2);
                    self.emit_raw(&crlf, listener);
                    self.state = State::ChunkSize;
                }
                State::Trailers { consumed } => {
                    let limit = self.limits.max_head_bytes;
                    let Some(line) = take_line(&mut self.buf, limit.saturating_sub(consumed))
                        .map_err(|e| e.or_head_limit(limit))?
                    else {
                        return Ok(());
                    };
                    if &line[..] != b"\r\n" && parse_field(&line).is_none() {
                        return Err(FramingError::InvalidTrailer(line_text(&line).into()));
                    }
                    self.emit_raw(&line, listener);
                    if &line[..] == b"\r\n" {
                        self.end_message(listener);
                    } else {
                        self.state = State::Trailers {
                            consumed: consumed + line.len(),
                        };
                    }
                }
                State::UntilClose => {
                    let span = self.buf.split();
                    self.emit_raw(&span, listener);
                    self.emit_content(&span, listener);
                }
                State::AwaitingSwitch => {
                    let answer = match self.role.switch_answers() {
                        Some(answers) => answers.try_recv(),
                        None => Err(mpsc::error::TryRecvError::Disconnected),
                    };
                    match answer {
                        Ok(switched) => self.apply_switch(switched),
                        Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                        Err(mpsc::error::TryRecvError::Disconnected) => self.apply_switch(false),
                    }
                }
                State::Tunnel => {
                    let span = self.buf.split();
                    listener.on_passthrough(&span);
                }
                State::Failed => return Err(FramingError::AlreadyFailed),
            }
        }
    }

    fn complete_head<L>(&mut self, listener: &mut L) -> Result<(), FramingError>
    where
        L: ParseListener<R::Message>,
    {
        let raw_head = self.head.split().freeze();
        let headers = std::mem::take(&mut self.headers);
        let start = self
            .start
            .take()
            .ok_or_else(|| FramingError::MalformedStartLine(String::new()))?;

        match self.role.build(start, headers, raw_head.clone())? {
            Head::Interim => {
                listener.on_passthrough(&raw_head);
                self.state = State::StartLine;
            }
            Head::Message(mut message) => {
                listener.on_headers(&mut message);
                let framing = R::framing(&message);
                let message = Arc::new(message);
                self.role.headers_delivered(&message);
                self.in_flight = Some(message);
                match framing {
                    BodyFraming::None | BodyFraming::Fixed(0) => self.end_message(listener),
                    BodyFraming::Fixed(len) => self.state = State::FixedBody { remaining: len },
                    BodyFraming::Chunked => self.state = State::ChunkSize,
                    BodyFraming::UntilClose => self.state = State::UntilClose,
                    BodyFraming::Tunnel => {
                        self.end_message(listener);
                        self.state = State::Tunnel;
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit up to `remaining` buffered bytes as Raw then Content. Returns what is left.
    fn emit_body<L>(&mut self, remaining: u64, listener: &mut L) -> u64
    where
        L: ParseListener<R::Message>,
    {
        let take = remaining.min(self.buf.len() as u64) as usize;
        let span = self.buf.split_to(take);
        self.emit_raw(&span, listener);
        self.emit_content(&span, listener);
        remaining - take as u64
    }

    fn emit_raw<L>(&self, bytes: &[u8], listener: &mut L)
    where
        L: ParseListener<R::Message>,
    {
        if let Some(message) = &self.in_flight {
            listener.on_body(message, BodyBytesKind::Raw, bytes);
        }
    }

    fn emit_content<L>(&self, bytes: &[u8], listener: &mut L)
    where
        L: ParseListener<R::Message>,
    {
        if let Some(message) = &self.in_flight {
            listener.on_body(message, BodyBytesKind::Content, bytes);
        }
    }

    fn end_message<L>(&mut self, listener: &mut L)
    where
        L: ParseListener<R::Message>,
    {
        self.state = State::StartLine;
        if let Some(message) = self.in_flight.take() {
            listener.on_ended(&message);
            if R::requests_switch(&message) {
                self.state = State::AwaitingSwitch;
            }
        }
    }
}

enum LineError {
    TooLong,
    BareLineFeed,
}

impl LineError {
    fn or_head_limit(self, limit: usize) -> FramingError {
        match self {
            LineError::TooLong => FramingError::HeadTooLarge { limit },
            LineError::BareLineFeed => FramingError::BareLineFeed,
        }
    }

    fn or_line_limit(self, limit: usize) -> FramingError {
        match self {
            LineError::TooLong => FramingError::LineTooLong { limit },
            LineError::BareLineFeed => FramingError::BareLineFeed,
        }
    }
}

/// Split one CRLF-terminated line (terminator included) off the buffer.
fn take_line(buf: &mut BytesMut, limit: usize) -> Result<Option<Bytes>, LineError> {
    let window = buf.len().min(limit);
    match buf[..window].iter().position(|&b| b == b'\n') {
        Some(0) => Err(LineError::BareLineFeed),
        Some(i) if buf[i - 1] != b'\r' => Err(LineError::BareLineFeed),
        Some(i) => Ok(Some(buf.split_to(i + 1).freeze())),
        None if buf.len() >= limit => Err(LineError::TooLong),
        None => Ok(None),
    }
}

fn line_text(line: &[u8]) -> std::borrow::Cow<'_, str> {
    let trimmed = line.strip_suffix(b"\r\n").unwrap_or(line);
    String::from_utf8_lossy(trimmed)
}

/// `name: value` with a token name, no whitespace before the colon and no folding.
fn parse_field(line: &[u8]) -> Option<(String, String)> {
    let line = line.strip_suffix(b"\r\n")?;
    let colon = line.iter().position(|&b| b == b':')?;
    let name = std::str::from_utf8(&line[..colon]).ok()?;
    if !is_token(name) {
        return None;
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    let value = value.trim_matches([' ', '\t']);
    Some((name.to_string(), value.to_string()))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, FramingError> {
    let invalid = || FramingError::InvalidChunkSize(line_text(line).into());
    let text = line.strip_suffix(b"\r\n").ok_or_else(invalid)?;
    let size = match text.iter().position(|&b| b == b';') {
        Some(i) => &text[..i],
        None => text,
    };
    let size = trim_trailing_ws(size);
    if size.is_empty() || size.len() > 16 || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let digits = std::str::from_utf8(size).map_err(|_| invalid())?;
    u64::from_str_radix(digits, 16).map_err(|_| invalid())
}

fn trim_trailing_ws(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn is_http_version(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 8
        && b.starts_with(b"HTTP/")
        && b[5].is_ascii_digit()
        && b[6] == b'.'
        && b[7].is_ascii_digit()
}
