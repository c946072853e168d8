use thiserror::Error;

/// Violations of HTTP/1.x message framing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),

    #[error("malformed header line: {0:?}")]
    InvalidHeader(String),

    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("chunk size line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("line terminated by bare LF")]
    BareLineFeed,

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("conflicting Content-Length values")]
    ConflictingContentLength,

    #[error("unsupported transfer coding: {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("chunk data not followed by CRLF")]
    MissingChunkTerminator,

    #[error("malformed trailer line: {0:?}")]
    InvalidTrailer(String),

    #[error("stream ended inside {state}")]
    UnexpectedEof { state: &'static str },

    #[error("response received with no pending request")]
    ResponseWithoutRequest,

    #[error("parser already failed")]
    AlreadyFailed,
}
