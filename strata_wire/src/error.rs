use thiserror::Error;

/// Errors produced while parsing addresses, identifiers and target encodings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("identifier must have 32 hex digits, got {0}")]
    IdentifierLength(usize),
    #[error("invalid hex digit {0:?} in identifier")]
    InvalidHex(char),
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("empty host in address {0:?}")]
    EmptyHost(String),
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
    #[error("invalid target address: {0}")]
    InvalidTarget(String),
    #[error("unknown address type: {0:#04x}")]
    UnknownAddressType(u8),
    #[error("target address truncated")]
    TruncatedTarget,
}

/// Framing errors are fatal to the stream they occur on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("cannot encode an empty frame")]
    EmptyPayload,
    #[error("frame header declares a zero length")]
    ZeroLength,
    #[error("frame length {0} exceeds the {max} byte limit", max = crate::grpc_web::MAX_FRAME_LEN)]
    TooLarge(usize),
    #[error("compressed frames are not supported")]
    UnsupportedCompression,
    #[error("stream ended inside a frame header")]
    TruncatedHeader,
    #[error("stream ended inside a frame body ({read} of {expected} bytes)")]
    TruncatedBody { expected: usize, read: usize },
    #[error("malformed envelope: {0}")]
    Envelope(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
