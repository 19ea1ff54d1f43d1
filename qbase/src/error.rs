use thiserror::Error;

use crate::frame::FrameType;

/// The kinds of connection-level errors raised by the stream layer.
///
/// Every kind except [`ErrorKind::Application`] is a protocol violation by the peer
/// or an internal inconsistency, all of them are fatal to the connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// No error, used when the connection is closed gracefully
    None,
    /// An internal invariant was broken
    Internal,
    /// The peer sent more data than the advertised window allows
    FlowControl,
    /// The peer opened more streams than the advertised limit allows
    StreamLimit,
    /// A frame was received for a stream in a state that does not permit it
    StreamState,
    /// A final size was changed or contradicted by received data
    FinalSize,
    /// A frame referenced a stream that has already been reclaimed
    ProtocolViolation,
    /// The application closed the connection with the given error code
    Application(u64),
}

impl ErrorKind {
    /// Returns the numeric error code carried in a connection close.
    pub fn code(&self) -> u64 {
        match self {
            ErrorKind::None => 0x00,
            ErrorKind::Internal => 0x01,
            ErrorKind::FlowControl => 0x03,
            ErrorKind::StreamLimit => 0x04,
            ErrorKind::StreamState => 0x05,
            ErrorKind::FinalSize => 0x06,
            ErrorKind::ProtocolViolation => 0x0a,
            ErrorKind::Application(code) => *code,
        }
    }
}

/// A connection-level error.
///
/// Once raised, it is latched into every shared state of the connection,
/// so that all subsequent operations observe the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection error occurred in {frame_type:?}, kind: {kind:?}, reason: {reason}")]
pub struct Error {
    kind: ErrorKind,
    frame_type: Option<FrameType>,
    reason: String,
}

impl Error {
    pub fn new(kind: ErrorKind, frame_type: FrameType, reason: impl Into<String>) -> Self {
        Self {
            kind,
            frame_type: Some(frame_type),
            reason: reason.into(),
        }
    }

    /// Create an error that is not caused by any specific frame.
    pub fn with_default_fty(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            frame_type: None,
            reason: reason.into(),
        }
    }

    /// The error used when the application closes the connection explicitly.
    pub fn app_close(error_code: u64, reason: impl Into<String>) -> Self {
        Self::with_default_fty(ErrorKind::Application(error_code), reason)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        self.frame_type
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
