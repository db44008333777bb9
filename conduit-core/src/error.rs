//! Status codes and error types shared across the engine.

use std::fmt;

/// gRPC-style status code carried in a trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
}

impl StatusCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// Call-boundary error: what callers and handlers see.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn status(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::status(StatusCode::Cancelled)
    }

    pub fn unimplemented(what: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, what)
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, what)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.code, m),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for RpcError {}

/// Frame codec errors (C1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Truncated,
    ZeroStreamId,
    MethodPathOnDataFrame,
    InvalidUtf8MethodPath,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame header truncated"),
            Self::ZeroStreamId => write!(f, "stream id must not be zero"),
            Self::MethodPathOnDataFrame => write!(f, "HAS_METHOD_PATH set on a DATA frame"),
            Self::InvalidUtf8MethodPath => write!(f, "method path is not valid utf-8"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Payload-frame reassembly errors (C3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    MessageTooLarge { declared: usize, max: usize },
}

impl fmt::Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge { declared, max } => {
                write!(f, "message of {declared} bytes exceeds max {max} bytes")
            }
        }
    }
}

impl std::error::Error for ParserError {}

/// Transport-contract errors (C4).
#[derive(Debug, Clone)]
pub enum TransportError {
    Closed,
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(msg) => write!(f, "transport io error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Method-registry errors (C9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyExists { service: String, method: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists { service, method } => {
                write!(f, "method {service}/{method} already registered")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<FrameError> for RpcError {
    fn from(e: FrameError) -> Self {
        RpcError::new(StatusCode::Internal, e.to_string())
    }
}

impl From<ParserError> for RpcError {
    fn from(e: ParserError) -> Self {
        RpcError::new(StatusCode::ResourceExhausted, e.to_string())
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        RpcError::new(StatusCode::Unavailable, e.to_string())
    }
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        RpcError::new(StatusCode::AlreadyExists, e.to_string())
    }
}
