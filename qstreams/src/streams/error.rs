use std::io;

use qbase::{error::Error, frame::ResetStreamError, sid::Dir};

/// Errors observed by the application on streams and on the stream-opening calls.
///
/// Only [`StreamError::Connection`] is shared by every stream,
/// the others concern the stream or the call they were returned from.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The connection failed or was closed, carrying the connection error.
    #[error(transparent)]
    Connection(#[from] Error),
    /// The stream half was abandoned, by the peer or locally.
    #[error(transparent)]
    Reset(#[from] ResetStreamError),
    /// The sending half has already been closed, no more data can be written.
    #[error("the sending part of the stream has been closed")]
    Closed,
    /// The peer does not allow opening more streams of this direction for now.
    #[error("the limit of {0} streams has been reached")]
    LimitReached(Dir),
    /// The deadline of a suspended call elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// A suspended call was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamError {
    /// Extract the stream error carried by an [`io::Error`] returned from the
    /// [`AsyncRead`](tokio::io::AsyncRead) or [`AsyncWrite`](tokio::io::AsyncWrite) surfaces.
    pub fn from_io(error: &io::Error) -> Option<&StreamError> {
        error.get_ref()?.downcast_ref()
    }
}

impl From<StreamError> for io::Error {
    fn from(value: StreamError) -> Self {
        let kind = match value {
            StreamError::Connection(..) | StreamError::Reset(..) => io::ErrorKind::BrokenPipe,
            StreamError::Closed => io::ErrorKind::Unsupported,
            StreamError::LimitReached(..) => io::ErrorKind::WouldBlock,
            StreamError::DeadlineExceeded => io::ErrorKind::TimedOut,
            StreamError::Cancelled => io::ErrorKind::Interrupted,
        };
        io::Error::new(kind, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_io_error() {
        let error = io::Error::from(StreamError::Reset(ResetStreamError::new(3, 10)));
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(
            StreamError::from_io(&error),
            Some(&StreamError::Reset(ResetStreamError::new(3, 10)))
        );

        let error = io::Error::from(StreamError::Closed);
        assert_eq!(error.kind(), io::ErrorKind::Unsupported);
        assert!(StreamError::from_io(&io::Error::other("not a stream error")).is_none());
    }
}
