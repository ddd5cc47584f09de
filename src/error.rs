//! Shared error taxonomy for the FBSP/FBDP core.
//!
//! Errors are hand-rolled enums with manual `Display` and `std::error::Error`
//! impls rather than a derive-macro crate, matching the rest of this codebase.

use std::fmt;

/// Error taxonomy values carried on the wire inside ERROR messages.
///
/// Codes `>= 2000` are fatal: the recipient must close the session.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidMessage = 1,
    ProtocolViolation = 2,
    BadRequest = 3,
    NotImplemented = 4,
    Error = 5,
    InternalServiceError = 6,
    RequestTimeout = 7,
    TooManyRequests = 8,
    FailedDependency = 9,
    Forbidden = 10,
    Unauthorized = 11,
    NotFound = 12,
    Gone = 13,
    Conflict = 14,
    PayloadTooLarge = 15,
    InsufficientStorage = 16,
    ServiceUnavailable = 2000,
    FbspVersionNotSupported = 2001,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => ErrorCode::InvalidMessage,
            2 => ErrorCode::ProtocolViolation,
            3 => ErrorCode::BadRequest,
            4 => ErrorCode::NotImplemented,
            5 => ErrorCode::Error,
            6 => ErrorCode::InternalServiceError,
            7 => ErrorCode::RequestTimeout,
            8 => ErrorCode::TooManyRequests,
            9 => ErrorCode::FailedDependency,
            10 => ErrorCode::Forbidden,
            11 => ErrorCode::Unauthorized,
            12 => ErrorCode::NotFound,
            13 => ErrorCode::Gone,
            14 => ErrorCode::Conflict,
            15 => ErrorCode::PayloadTooLarge,
            16 => ErrorCode::InsufficientStorage,
            2000 => ErrorCode::ServiceUnavailable,
            2001 => ErrorCode::FbspVersionNotSupported,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Codes `>= 2000` require the recipient to close the session.
    pub fn is_fatal(self) -> bool {
        self.as_u16() >= 2000
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::Error => "ERROR",
            ErrorCode::InternalServiceError => "INTERNAL_SERVICE_ERROR",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::FailedDependency => "FAILED_DEPENDENCY",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Gone => "GONE",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::InsufficientStorage => "INSUFFICIENT_STORAGE",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::FbspVersionNotSupported => "FBSP_VERSION_NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u16())
    }
}

/// FBDP pipe close codes. A subset of [`ErrorCode`] plus a normal-termination
/// value of zero.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeCloseCode {
    Ok = 0,
    PipeEndpointUnavailable = 17,
    DataFormatNotSupported = 18,
    InvalidData = 19,
}

impl PipeCloseCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => PipeCloseCode::Ok,
            17 => PipeCloseCode::PipeEndpointUnavailable,
            18 => PipeCloseCode::DataFormatNotSupported,
            19 => PipeCloseCode::InvalidData,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A wire-format failure: bad magic, unknown type, reserved-bit violation,
/// wrong length, or a structural validation failure of a parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidMessage {
    WrongMagic { found: [u8; 4] },
    UnsupportedVersion { found: u8 },
    UnknownMessageType { found: u8 },
    ReservedFlagBits { flags: u8 },
    HeaderTooShort { len: usize, expected: usize },
    WrongFrameCount { found: usize, expected: &'static str },
    NotPermittedForRole { message_type: &'static str, role: &'static str },
    NotAGreeting { message_type: &'static str },
    ZeroRequestCode,
    ZeroErrorCode,
    BadRelatesTo { found: u8 },
    RecordDecode(String),
}

impl fmt::Display for InvalidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidMessage::WrongMagic { found } => {
                write!(f, "wrong magic bytes: {found:?}")
            }
            InvalidMessage::UnsupportedVersion { found } => {
                write!(f, "unsupported protocol version: {found}")
            }
            InvalidMessage::UnknownMessageType { found } => {
                write!(f, "unknown message type code: {found}")
            }
            InvalidMessage::ReservedFlagBits { flags } => {
                write!(f, "reserved flag bits set: {flags:#04x}")
            }
            InvalidMessage::HeaderTooShort { len, expected } => {
                write!(f, "header too short: {len} bytes, expected {expected}")
            }
            InvalidMessage::WrongFrameCount { found, expected } => {
                write!(f, "wrong frame count: found {found}, expected {expected}")
            }
            InvalidMessage::NotPermittedForRole { message_type, role } => {
                write!(f, "{role} is not permitted to send {message_type}")
            }
            InvalidMessage::NotAGreeting { message_type } => {
                write!(f, "{message_type} is not a valid greeting message")
            }
            InvalidMessage::ZeroRequestCode => write!(f, "request code must be non-zero"),
            InvalidMessage::ZeroErrorCode => write!(f, "error code must be non-zero"),
            InvalidMessage::BadRelatesTo { found } => {
                write!(f, "relates_to message type code {found} is not valid")
            }
            InvalidMessage::RecordDecode(msg) => write!(f, "structured record decode failed: {msg}"),
        }
    }
}

impl std::error::Error for InvalidMessage {}

/// Channel/transport lifecycle failures.
#[derive(Debug)]
pub enum ChannelError {
    InvalidEndpoint(String),
    AlreadyBound,
    ModeConflict,
    TooManyEndpointsForPair,
    Io(std::io::Error),
    Zmq(zeromq::ZmqError),
    HostUnreachable,
    WouldBlock,
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::InvalidEndpoint(s) => write!(f, "invalid endpoint: {s}"),
            ChannelError::AlreadyBound => write!(f, "channel already bound/connected"),
            ChannelError::ModeConflict => write!(f, "cannot mix bind and connect on one channel"),
            ChannelError::TooManyEndpointsForPair => {
                write!(f, "PAIR channels accept at most one endpoint")
            }
            ChannelError::Io(e) => write!(f, "i/o error: {e}"),
            ChannelError::Zmq(e) => write!(f, "zmq error: {e}"),
            ChannelError::HostUnreachable => write!(f, "host unreachable"),
            ChannelError::WouldBlock => write!(f, "operation would block"),
            ChannelError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl From<zeromq::ZmqError> for ChannelError {
    fn from(e: zeromq::ZmqError) -> Self {
        ChannelError::Zmq(e)
    }
}

/// Errors raised by dispatch handlers (the application/session layer).
#[derive(Debug)]
pub enum ServiceError {
    Protocol(ErrorCode, String),
    Channel(ChannelError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Protocol(code, msg) => write!(f, "{code}: {msg}"),
            ServiceError::Channel(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ChannelError> for ServiceError {
    fn from(e: ChannelError) -> Self {
        ServiceError::Channel(e)
    }
}

/// Client-side call failures.
#[derive(Debug)]
pub enum ClientError {
    Timeout,
    ConnectionClosed,
    Channel(ChannelError),
    Remote {
        error_code: ErrorCode,
        relates_to: &'static str,
        descriptions: Vec<crate::descriptor::ErrorDescription>,
    },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::ConnectionClosed => write!(f, "connection closed"),
            ClientError::Channel(e) => write!(f, "{e}"),
            ClientError::Remote {
                error_code,
                relates_to,
                descriptions,
            } => {
                write!(f, "{} (relates_to {})", error_code.name(), relates_to)?;
                for d in descriptions {
                    write!(f, "; {}: {}", d.code, d.description)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ChannelError> for ClientError {
    fn from(e: ChannelError) -> Self {
        ClientError::Channel(e)
    }
}

/// Signals a clean, intentional end of a data source feeding an FBDP
/// producer. Distinct from any other error so the pipe closes with `OK`
/// rather than `INVALID_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopError;

impl fmt::Display for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data source signalled a clean stop")
    }
}

impl std::error::Error for StopError {}
