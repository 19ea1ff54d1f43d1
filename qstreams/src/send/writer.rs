use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use qbase::sid::StreamId;
use tokio::io::AsyncWrite;

use super::sender::ArcSender;
use crate::StreamError;

/// The writing half of a stream, owned by the application.
///
/// It implements [`AsyncWrite`]. A write accepts as many bytes as the stream window and the
/// connection window allow, and is pending while either one is exhausted.
/// [`flush`] waits until all written data has been acknowledged by the peer,
/// [`shutdown`] finishes the stream and waits until the peer acknowledged everything.
///
/// Dropping a [`Writer`] that has neither been finished nor reset resets the stream with
/// error code 0, as the peer would otherwise wait forever for the rest of the data.
///
/// [`flush`]: tokio::io::AsyncWriteExt::flush
/// [`shutdown`]: tokio::io::AsyncWriteExt::shutdown
#[derive(Debug)]
pub struct Writer {
    inner: ArcSender,
    sid: StreamId,
}

impl Writer {
    pub(crate) fn new(inner: ArcSender, sid: StreamId) -> Self {
        Self { inner, sid }
    }

    pub fn stream_id(&self) -> StreamId {
        self.sid
    }

    /// Write a prefix of `buf`, resolving to the amount of bytes accepted.
    pub fn poll_send(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, StreamError>> {
        match self.inner.sender().as_mut() {
            Ok(sender) => sender.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e.clone().into())),
        }
    }

    /// Finish the stream without waiting, no more data may be written afterwards.
    ///
    /// Closing an already finished stream does nothing,
    /// closing a reset stream returns the [`StreamError::Reset`] error it was reset with.
    pub fn close(&mut self) -> Result<(), StreamError> {
        match self.inner.sender().as_mut() {
            Ok(sender) => sender.close(),
            Err(e) => Err(e.clone().into()),
        }
    }

    /// Abandon the stream with the application `error_code`, unsent data is dropped.
    ///
    /// Does nothing if the stream was already reset, or all its data was acknowledged.
    pub fn reset(&mut self, error_code: u64) {
        if let Ok(sender) = self.inner.sender().as_mut() {
            sender.reset(error_code);
        }
    }
}

impl AsyncWrite for Writer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_send(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.sender().as_mut() {
            Ok(sender) => sender.poll_flush(cx).map_err(io::Error::from),
            Err(e) => Poll::Ready(Err(StreamError::from(e.clone()).into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.sender().as_mut() {
            Ok(sender) => sender.poll_shutdown(cx).map_err(io::Error::from),
            Err(e) => Poll::Ready(Err(StreamError::from(e.clone()).into())),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Ok(sender) = self.inner.sender().as_mut() {
            if sender.is_writable() {
                tracing::warn!(
                    "the sending {} is neither finished nor reset before dropped, reset it",
                    sender.stream_id()
                );
                sender.reset(0);
            }
        }
    }
}
