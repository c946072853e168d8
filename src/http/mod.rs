//! HTTP/1.x framing for intercepted connections.
//!
//! # Data Flow
//! ```text
//! decrypted client bytes
//!     → parser.rs (RequestParser: head, body spans, end)
//!     → pending request channel
//! decrypted target bytes
//!     → parser.rs (ResponseParser: paired with the oldest pending request)
//! ```
//! `message.rs` decides body framing, `headers.rs` holds the ordered fields.

pub mod error;
pub mod headers;
pub mod message;
pub mod parser;

pub use error::FramingError;
pub use headers::Headers;
pub use message::{BodyBytesKind, BodyFraming, Request, Response};
pub use parser::{
    pipeline, Exchange, Http1Parser, ParseListener, ParserLimits, RequestParser, ResponseParser,
};
