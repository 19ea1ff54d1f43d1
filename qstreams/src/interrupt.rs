//! Bound the suspended stream operations with a deadline or a cancellation.
//!
//! Any future of this crate can be wrapped: opening, accepting, reading, writing, flushing.
//! An interrupted operation leaves no trace on the stream: the bytes already accepted by a
//! write stay written, the bytes already read stay read.
//!
//! ```rust, ignore
//! use qstreams::interrupt::with_deadline;
//!
//! let deadline = Instant::now() + Duration::from_secs(3);
//! let (sid, writer) = with_deadline(streams.open_uni_stream(), deadline).await?;
//! ```
use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::StreamError;

/// Run `fut` until `deadline`, failing with [`StreamError::DeadlineExceeded`] past it.
pub async fn with_deadline<F, T, E>(fut: F, deadline: Instant) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StreamError>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(StreamError::DeadlineExceeded.into()),
    }
}

/// Run `fut` until `token` is cancelled, failing with [`StreamError::Cancelled`] then.
///
/// A token cancelled beforehand interrupts the operation before it makes any progress.
pub async fn with_cancel<F, T, E>(fut: F, token: &CancellationToken) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StreamError>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StreamError::Cancelled.into()),
        result = fut => result,
    }
}
