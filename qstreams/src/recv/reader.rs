use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BufMut;
use qbase::sid::StreamId;
use tokio::io::{AsyncRead, ReadBuf};

use super::recver::ArcRecver;
use crate::{StreamError, streams::IOState};

/// The reading half of a stream, owned by the application.
///
/// A stream is *reliable*, *ordered*, and *flow-controlled*:
/// the [`Reader`] yields the bytes of the peer in order, whatever order they arrived in,
/// and every byte consumed gives credit back to the peer.
///
/// It implements [`AsyncRead`], reading `Ok(0)` into a non-empty buffer means the peer
/// finished the stream and all of its data has been read.
/// An error means the stream was reset, stopped, or the connection failed,
/// see [`StreamError::from_io`] to tell them apart.
///
/// # Note
///
/// The stream should be read to its end or [stopped](Reader::stop) before the [`Reader`] is dropped,
/// otherwise the peer may keep sending data nobody will read.
///
/// # Example
///
/// ```rust, ignore
/// # use tokio::io::{AsyncReadExt, AsyncWriteExt};
/// let (sid, (mut reader, mut writer)) = streams.open_bi_stream().await?;
/// writer.write_all(b"GET README.md\r\n").await?;
/// writer.shutdown().await?;
///
/// let mut response = String::new();
/// reader.read_to_string(&mut response).await?;
/// ```
#[derive(Debug)]
pub struct Reader {
    inner: ArcRecver,
    io_state: IOState,
}

impl Reader {
    pub(crate) fn new(inner: ArcRecver, io_state: IOState) -> Self {
        Self { inner, io_state }
    }

    pub fn stream_id(&self) -> StreamId {
        self.io_state.stream_id()
    }

    /// Read the contiguous data available into `buf`.
    ///
    /// Resolves to `Ok(())` without writing anything once all data has been read.
    pub fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut impl BufMut,
    ) -> Poll<Result<(), StreamError>> {
        let mut recver = self.inner.recver();
        let (poll, terminal) = match recver.as_mut() {
            Ok(r) => {
                let poll = r.poll_read(cx, buf);
                (poll, r.is_terminal())
            }
            Err(e) => return Poll::Ready(Err(e.clone().into())),
        };
        drop(recver);
        if terminal {
            self.io_state.shutdown_receive();
        }
        poll
    }

    /// Tell the peer to stop sending with the given application `error_code`.
    ///
    /// The buffered data is dropped and later reads fail with a [`StreamError::Reset`]
    /// carrying this code. Does nothing if all data has been received, or the stream was reset.
    pub fn stop(&mut self, error_code: u64) {
        let terminal = match self.inner.recver().as_mut() {
            Ok(r) => r.stop(error_code),
            Err(_) => false,
        };
        if terminal {
            self.io_state.shutdown_receive();
        }
    }
}

impl AsyncRead for Reader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().poll_recv(cx, buf).map_err(io::Error::from)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Ok(r) = self.inner.recver().as_ref() {
            if !r.is_terminal() && !r.is_stopped() {
                tracing::warn!(
                    "the receiving {} is not stopped with error before dropped!",
                    r.stream_id()
                );
            }
        }
    }
}
