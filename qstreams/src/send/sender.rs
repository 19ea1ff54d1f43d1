use std::{
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use qbase::{
    error::{Error, ErrorKind},
    flow::{ArcSendController, SendWindow},
    frame::{ResetStreamError, SendFrame, StreamDataBlockedFrame, StreamFrame},
    sid::StreamId,
};

use super::sndbuf::SendBuf;
use crate::{FrameQueue, StreamError};

/// The sending states of a stream.
///
/// ```text
///        app write
///  ---> Ready ------> Send ------------.
///         |            |               |
///         | app close  | app close     | app reset / recv STOP_SENDING
///         v            v               v
///        DataSent <----'           ResetSent
///         |                            |
///         | recv all ACKs              | recv ACK of RESET_STREAM
///         v                            v
///        DataRecvd                 ResetRecvd
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent(ResetStreamError),
    ResetRecvd(ResetStreamError),
}

/// The sending half of a stream.
#[derive(Debug)]
pub(crate) struct Sender {
    sid: StreamId,
    state: State,
    sndbuf: SendBuf,
    window: SendWindow,
    fin_sent: bool,
    fin_acked: bool,
    // the limit last reported by a StreamDataBlocked frame
    blocked_at: Option<u64>,
    write_waker: Option<Waker>,
    flush_waker: Option<Waker>,
    conn: ArcSendController<FrameQueue>,
    frames: FrameQueue,
}

impl Sender {
    pub(crate) fn new(
        sid: StreamId,
        max_stream_data: u64,
        conn: ArcSendController<FrameQueue>,
        frames: FrameQueue,
    ) -> Self {
        Self {
            sid,
            state: State::Ready,
            sndbuf: SendBuf::default(),
            window: SendWindow::new(max_stream_data),
            fin_sent: false,
            fin_acked: false,
            blocked_at: None,
            write_waker: None,
            flush_waker: None,
            conn,
            frames,
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.sid
    }

    /// Whether the peer acknowledged the whole story of this half, its data or its reset.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, State::DataRecvd | State::ResetRecvd(..))
    }

    /// Whether the application may still write or finish the half.
    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.state, State::Ready | State::Send)
    }

    fn wake_all(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.flush_waker.take() {
            waker.wake();
        }
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        match self.state {
            State::Ready | State::Send => Ok(()),
            State::DataSent | State::DataRecvd => Err(StreamError::Closed),
            State::ResetSent(error) | State::ResetRecvd(error) => Err(StreamError::Reset(error)),
        }
    }

    /// Accept as much of `buf` as both the stream window and the connection window allow.
    ///
    /// Pending only when either window is exhausted, after reporting the blockage to the peer.
    pub(crate) fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, StreamError>> {
        self.check_writable()?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let stream_available = self.window.available();
        let mut credit = self.conn.credit()?;
        let conn_available = credit.available();
        let n = (buf.len() as u64).min(stream_available).min(conn_available);
        if n == 0 {
            if stream_available == 0 {
                let limit = self.window.limit();
                if self.blocked_at != Some(limit) {
                    self.blocked_at = Some(limit);
                    tracing::debug!("{} is blocked by its send window at {limit}", self.sid);
                    self.frames
                        .send_frame([StreamDataBlockedFrame::new(self.sid, limit)]);
                }
            }
            if conn_available == 0 {
                credit.register_blocked(cx.waker());
            }
            self.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if let Err(overflow) = self.window.add_bytes_sent(n) {
            let reason = format!("{} wrote {} bytes beyond its send window", self.sid, overflow.0);
            tracing::error!("   Cause by: {reason}");
            return Poll::Ready(Err(Error::with_default_fty(ErrorKind::Internal, reason).into()));
        }
        credit.post_sent(n)?;
        self.sndbuf.write(Bytes::copy_from_slice(&buf[..n as usize]));
        if self.state == State::Ready {
            self.state = State::Send;
        }
        Poll::Ready(Ok(n as usize))
    }

    /// Finish the half, the final size is the amount written so far.
    ///
    /// Closing again is a no-op, closing a reset half returns the reset error.
    pub(crate) fn close(&mut self) -> Result<(), StreamError> {
        match self.state {
            State::Ready | State::Send => {
                tracing::debug!("{} finished with final size {}", self.sid, self.sndbuf.written());
                self.state = State::DataSent;
                Ok(())
            }
            State::DataSent | State::DataRecvd => Ok(()),
            State::ResetSent(error) | State::ResetRecvd(error) => Err(StreamError::Reset(error)),
        }
    }

    /// Wait until every byte written has been acknowledged.
    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        match self.state {
            State::Ready | State::DataRecvd => Poll::Ready(Ok(())),
            State::Send | State::DataSent => {
                if self.sndbuf.is_all_rcvd() {
                    Poll::Ready(Ok(()))
                } else {
                    self.flush_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
            State::ResetSent(error) | State::ResetRecvd(error) => {
                Poll::Ready(Err(StreamError::Reset(error)))
            }
        }
    }

    /// Finish the half and wait until the peer acknowledged all data and the end of stream.
    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        self.close()?;
        match self.state {
            State::DataRecvd => Poll::Ready(Ok(())),
            State::ResetSent(error) | State::ResetRecvd(error) => {
                Poll::Ready(Err(StreamError::Reset(error)))
            }
            _ => {
                self.flush_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Abandon the half with the application `error_code`, the unsent data is dropped.
    ///
    /// The final size is the amount written so far. Returns whether the half was reset now,
    /// resetting a half that is already reset or fully acknowledged does nothing.
    pub(crate) fn reset(&mut self, error_code: u64) -> bool {
        match self.state {
            State::Ready | State::Send | State::DataSent => {
                let error = ResetStreamError::new(error_code, self.sndbuf.written());
                tracing::debug!("{} is reset: {error}", self.sid);
                self.state = State::ResetSent(error);
                self.sndbuf.clear();
                self.frames.send_frame([error.combine(self.sid)]);
                self.wake_all();
                true
            }
            _ => false,
        }
    }

    /// Pick up the next STREAM frame of at most `max_len` payload bytes.
    ///
    /// A finished half with nothing left to send yields an empty frame carrying the FIN bit.
    pub(crate) fn pick_up(&mut self, max_len: usize) -> Option<(StreamFrame, Bytes)> {
        if !matches!(self.state, State::Send | State::DataSent) {
            return None;
        }
        if let Some((offset, data)) = self.sndbuf.pick_up(max_len) {
            let fin = self.state == State::DataSent && !self.sndbuf.has_unsent();
            self.fin_sent |= fin;
            let frame = StreamFrame::new(self.sid, offset, data.len()).with_fin(fin);
            return Some((frame, data));
        }
        if self.state == State::DataSent && !self.fin_sent {
            self.fin_sent = true;
            let frame = StreamFrame::new(self.sid, self.sndbuf.written(), 0).with_fin(true);
            return Some((frame, Bytes::new()));
        }
        None
    }

    /// The peer acknowledged the data of `frame`, returns whether the half became terminal.
    pub(crate) fn on_data_acked(&mut self, frame: &StreamFrame) -> bool {
        if !matches!(self.state, State::Send | State::DataSent) {
            return false;
        }
        self.sndbuf.on_data_acked(frame.range());
        self.fin_acked |= frame.is_fin();
        if !self.sndbuf.is_all_rcvd() {
            return false;
        }
        let terminal = self.state == State::DataSent && self.fin_acked;
        if terminal {
            tracing::debug!("{} all data received by peer", self.sid);
            self.state = State::DataRecvd;
        }
        if let Some(waker) = self.flush_waker.take() {
            waker.wake();
        }
        terminal
    }

    /// The peer acknowledged the RESET_STREAM frame, returns whether the half became terminal.
    pub(crate) fn on_reset_acked(&mut self) -> bool {
        match self.state {
            State::ResetSent(error) => {
                self.state = State::ResetRecvd(error);
                true
            }
            _ => false,
        }
    }

    /// Raise the stream window by a MAX_STREAM_DATA frame, waking the blocked writer.
    pub(crate) fn update_window(&mut self, max_stream_data: u64) {
        if self.window.update_send_window(max_stream_data) {
            if let Some(waker) = self.write_waker.take() {
                waker.wake();
            }
        }
    }
}

/// Shared sending half, latched with the connection error once the connection fails.
#[derive(Debug, Clone)]
pub(crate) struct ArcSender(Arc<Mutex<Result<Sender, Error>>>);

impl ArcSender {
    pub(crate) fn new(sender: Sender) -> Self {
        Self(Arc::new(Mutex::new(Ok(sender))))
    }

    pub(crate) fn sender(&self) -> MutexGuard<'_, Result<Sender, Error>> {
        self.0.lock().unwrap()
    }

    pub(crate) fn on_conn_error(&self, error: &Error) {
        let mut sender = self.sender();
        if let Ok(s) = sender.as_mut() {
            s.wake_all();
            *sender = Err(error.clone());
        }
    }
}
