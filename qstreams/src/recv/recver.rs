use std::{
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    time::Instant,
};

use bytes::{BufMut, Bytes};
use qbase::{
    error::{Error, ErrorKind},
    flow::{ArcRecvController, ArcRtt, RecvWindow},
    frame::{
        FrameType, ResetStreamError, ResetStreamFrame, SendFrame, StopSendingFrame, StreamFrame,
    },
    param::VARINT_MAX,
    sid::StreamId,
};

use super::rcvbuf::RecvBuf;
use crate::{FrameQueue, StreamError};

/// The receiving states of a stream.
///
/// ```text
///        recv STREAM / RESET_STREAM
///  ---> Recv ----------------------.
///        |                          |
///        | recv STREAM + FIN        |
///        v                          |
///     SizeKnown -------------------+
///        |                          | recv RESET_STREAM
///        | recv all data            v
///        v                     ResetRecvd
///     DataRecvd                     |
///        |                          | app read reset
///        | app read all data        v
///        v                      ResetRead
///     DataRead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Recv,
    SizeKnown(u64),
    DataRecvd(u64),
    DataRead(u64),
    ResetRecvd(ResetStreamError),
    ResetRead(ResetStreamError),
}

/// The receiving half of a stream.
#[derive(Debug)]
pub(crate) struct Recver {
    sid: StreamId,
    state: State,
    rcvbuf: RecvBuf,
    window: RecvWindow,
    // the error code the application stopped receiving with
    stopped: Option<u64>,
    read_waker: Option<Waker>,
    conn: ArcRecvController,
    rtt: ArcRtt,
    frames: FrameQueue,
}

impl Recver {
    pub(crate) fn new(
        sid: StreamId,
        window: RecvWindow,
        conn: ArcRecvController,
        rtt: ArcRtt,
        frames: FrameQueue,
    ) -> Self {
        Self {
            sid,
            state: State::Recv,
            rcvbuf: RecvBuf::default(),
            window,
            stopped: None,
            read_waker: None,
            conn,
            rtt,
            frames,
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.sid
    }

    /// Whether the application learned the whole story of this half, its data or its reset.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, State::DataRead(..) | State::ResetRead(..))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    /// Release `n` bytes of connection-level credit that no reader will ever consume.
    fn release(&self, n: u64) -> Result<(), Error> {
        self.conn.on_bytes_read(n, self.rtt.smoothed_rtt()).map(|_| ())
    }

    /// Latch an internal error into the connection window, which fails the whole engine.
    fn internal_error(&self, reason: String) -> Error {
        tracing::error!("   Cause by: {reason}");
        let error = Error::with_default_fty(ErrorKind::Internal, reason);
        self.conn.on_conn_error(&error);
        error
    }

    fn final_size(&self) -> Option<u64> {
        match self.state {
            State::Recv => None,
            State::SizeKnown(final_size)
            | State::DataRecvd(final_size)
            | State::DataRead(final_size) => Some(final_size),
            State::ResetRecvd(error) | State::ResetRead(error) => Some(error.final_size()),
        }
    }

    fn final_size_error(&self, frame_type: FrameType, reason: String) -> Error {
        tracing::error!("   Cause by: {reason}");
        Error::new(ErrorKind::FinalSize, frame_type, reason)
    }

    /// Account the highest offset `end` against the stream window and the connection window.
    fn accept_offset(&mut self, frame_type: FrameType, end: u64) -> Result<u64, Error> {
        let delta = self.window.update_highest_received(end).map_err(|overflow| {
            tracing::error!("   Cause by: {} received data beyond its window", self.sid);
            Error::new(
                ErrorKind::FlowControl,
                frame_type,
                format!(
                    "{} received {end} bytes which exceeds the limit {} by {}",
                    self.sid,
                    self.window.max_data(),
                    overflow.0
                ),
            )
        })?;
        self.conn.on_new_rcvd(frame_type, delta)?;
        Ok(delta)
    }

    /// Receive the data carried by a STREAM frame.
    ///
    /// Returns whether the half reached a terminal state, which only happens here
    /// for a stopped half that has learned its final size and every byte up to it.
    pub(crate) fn recv_data(&mut self, frame: &StreamFrame, body: Bytes) -> Result<bool, Error> {
        let Some(end) = frame
            .offset()
            .checked_add(body.len() as u64)
            .filter(|end| *end <= VARINT_MAX)
        else {
            tracing::error!("   Cause by: {} received data beyond the offset space", self.sid);
            return Err(Error::new(
                ErrorKind::FlowControl,
                FrameType::Stream,
                format!(
                    "{} received {} bytes at offset {} beyond {VARINT_MAX}",
                    self.sid,
                    body.len(),
                    frame.offset()
                ),
            ));
        };
        match self.final_size() {
            None => {
                if frame.is_fin() && end < self.window.highest_received() {
                    return Err(self.final_size_error(
                        FrameType::Stream,
                        format!(
                            "{} received final size {end} below the received data {}",
                            self.sid,
                            self.window.highest_received()
                        ),
                    ));
                }
            }
            Some(final_size) => {
                if end > final_size || (frame.is_fin() && end != final_size) {
                    return Err(self.final_size_error(
                        FrameType::Stream,
                        format!(
                            "{} received data up to {end} which changed its final size {final_size}",
                            self.sid
                        ),
                    ));
                }
            }
        }
        if !matches!(self.state, State::Recv | State::SizeKnown(..)) {
            return Ok(false);
        }

        let delta = self.accept_offset(FrameType::Stream, end)?;
        if frame.is_fin() && self.state == State::Recv {
            tracing::debug!("{} learned its final size {end}", self.sid);
            self.state = State::SizeKnown(end);
        }

        if self.stopped.is_some() {
            self.release(delta)?;
            if let State::SizeKnown(final_size) = self.state {
                if self.window.highest_received() == final_size {
                    self.state = State::DataRead(final_size);
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        self.rcvbuf.recv(frame.offset(), body);
        if let State::SizeKnown(final_size) = self.state {
            if self.rcvbuf.nread() + self.rcvbuf.available() == final_size {
                tracing::debug!("{} received all data", self.sid);
                self.state = State::DataRecvd(final_size);
            }
        }
        if self.rcvbuf.is_readable() || matches!(self.state, State::DataRecvd(..)) {
            self.wake_reader();
        }
        Ok(false)
    }

    /// Receive the RESET_STREAM frame from peer.
    ///
    /// Returns whether the half reached a terminal state, as a stopped half does immediately.
    pub(crate) fn recv_reset(&mut self, frame: &ResetStreamFrame) -> Result<bool, Error> {
        let final_size = frame.final_size();
        match self.final_size() {
            None => {
                if final_size < self.window.highest_received() {
                    return Err(self.final_size_error(
                        FrameType::ResetStream,
                        format!(
                            "{} was reset with final size {final_size} below the received data {}",
                            self.sid,
                            self.window.highest_received()
                        ),
                    ));
                }
            }
            Some(known) => {
                if final_size != known {
                    return Err(self.final_size_error(
                        FrameType::ResetStream,
                        format!(
                            "{} was reset with final size {final_size} which differs from {known}",
                            self.sid
                        ),
                    ));
                }
            }
        }
        // once all data has been received, the reset is too late to matter
        if !matches!(self.state, State::Recv | State::SizeKnown(..)) {
            return Ok(false);
        }

        let delta = self.accept_offset(FrameType::ResetStream, final_size)?;
        let error = ResetStreamError::from(frame);
        self.rcvbuf.clear();
        if self.stopped.is_some() {
            self.release(delta)?;
            self.state = State::ResetRead(error);
            return Ok(true);
        }

        self.release(final_size - self.rcvbuf.nread())?;
        tracing::debug!("{} was reset by peer: {error}", self.sid);
        self.state = State::ResetRecvd(error);
        self.wake_reader();
        Ok(false)
    }

    /// Update the windows after the application consumed `n` bytes.
    fn on_read(&mut self, n: u64) -> Result<(), Error> {
        let rtt = self.rtt.smoothed_rtt();
        // no more window updates once the final size is known
        if self.state == State::Recv {
            let window_size = self.window.window_size();
            let update = self
                .window
                .add_bytes_read(n, rtt, Instant::now())
                .map_err(|overflow| {
                    self.internal_error(format!(
                        "{} read {} bytes more than it received",
                        self.sid, overflow.0
                    ))
                })?;
            if update.is_some() && self.window.window_size() > window_size {
                self.conn.ensure_minimum_window(self.window.window_size() * 3 / 2);
            }
        }
        self.conn.on_bytes_read(n, rtt)?;
        Ok(())
    }

    pub(crate) fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut impl BufMut,
    ) -> Poll<Result<(), StreamError>> {
        if let Some(error_code) = self.stopped {
            let error = ResetStreamError::new(error_code, self.rcvbuf.nread());
            return Poll::Ready(Err(StreamError::Reset(error)));
        }
        match self.state {
            State::Recv | State::SizeKnown(..) | State::DataRecvd(..) => {
                if self.rcvbuf.is_readable() {
                    let n = self.rcvbuf.try_read(buf);
                    self.on_read(n as u64)?;
                    if let State::DataRecvd(final_size) = self.state {
                        if self.rcvbuf.nread() == final_size {
                            self.state = State::DataRead(final_size);
                        }
                    }
                    Poll::Ready(Ok(()))
                } else if let State::DataRecvd(final_size) = self.state {
                    self.state = State::DataRead(final_size);
                    Poll::Ready(Ok(()))
                } else {
                    self.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
            State::DataRead(..) => Poll::Ready(Ok(())),
            State::ResetRecvd(error) => {
                self.state = State::ResetRead(error);
                Poll::Ready(Err(StreamError::Reset(error)))
            }
            State::ResetRead(error) => Poll::Ready(Err(StreamError::Reset(error))),
        }
    }

    /// Abandon receiving, asking the peer to stop sending with `error_code`.
    ///
    /// Returns whether the half reached a terminal state.
    pub(crate) fn stop(&mut self, error_code: u64) -> bool {
        if self.stopped.is_some() {
            return false;
        }
        match self.state {
            State::Recv | State::SizeKnown(..) => {
                self.stopped = Some(error_code);
                // a failure is latched by the connection window, failing the engine
                _ = self.release(self.window.highest_received() - self.rcvbuf.nread());
                self.rcvbuf.clear();
                tracing::debug!("{} stopped receiving with error code {error_code}", self.sid);
                self.frames
                    .send_frame([StopSendingFrame::new(self.sid, error_code)]);
                self.wake_reader();
                match self.state {
                    State::SizeKnown(final_size)
                        if self.window.highest_received() == final_size =>
                    {
                        self.state = State::DataRead(final_size);
                        true
                    }
                    _ => false,
                }
            }
            // every byte is here, only the unread part is released
            State::DataRecvd(final_size) => {
                self.stopped = Some(error_code);
                _ = self.release(final_size - self.rcvbuf.nread());
                self.rcvbuf.clear();
                self.state = State::DataRead(final_size);
                self.wake_reader();
                true
            }
            _ => false,
        }
    }

    /// Take the MAX_STREAM_DATA limit waiting to be advertised, if any.
    pub(crate) fn take_window_update(&mut self) -> Option<u64> {
        if self.state == State::Recv && self.stopped.is_none() {
            self.window.take_window_update()
        } else {
            None
        }
    }
}

/// Shared receiving half, latched with the connection error once the connection fails.
#[derive(Debug, Clone)]
pub(crate) struct ArcRecver(Arc<Mutex<Result<Recver, Error>>>);

impl ArcRecver {
    pub(crate) fn new(recver: Recver) -> Self {
        Self(Arc::new(Mutex::new(Ok(recver))))
    }

    pub(crate) fn recver(&self) -> MutexGuard<'_, Result<Recver, Error>> {
        self.0.lock().unwrap()
    }

    pub(crate) fn on_conn_error(&self, error: &Error) {
        let mut recver = self.recver();
        if let Ok(r) = recver.as_mut() {
            r.wake_reader();
            *recver = Err(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use futures::task::noop_waker_ref;
    use qbase::{frame::ReliableFrame, role::Role, sid::Dir};

    use super::*;

    fn new_recver(window: u64) -> (Recver, ArcRecvController, FrameQueue) {
        let conn = ArcRecvController::new(1000, 1000, false);
        let frames = FrameQueue::new();
        let sid = StreamId::new(Role::Client, Dir::Bi, 0);
        let recver = Recver::new(
            sid,
            RecvWindow::new(window, window, false),
            conn.clone(),
            ArcRtt::default(),
            frames.clone(),
        );
        (recver, conn, frames)
    }

    fn read(recver: &mut Recver) -> Poll<Result<Vec<u8>, StreamError>> {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut buf = BytesMut::new();
        recver
            .poll_read(&mut cx, &mut buf)
            .map_ok(|()| buf.to_vec())
    }

    #[test]
    fn test_recv_then_read_to_end() {
        let (mut recver, _, _) = new_recver(100);
        let sid = recver.stream_id();
        assert!(read(&mut recver).is_pending());
        let frame = StreamFrame::new(sid, 5, 5).with_fin(true);
        assert_eq!(recver.recv_data(&frame, Bytes::from("world")), Ok(false));
        assert!(read(&mut recver).is_pending());
        let frame = StreamFrame::new(sid, 0, 5);
        assert_eq!(recver.recv_data(&frame, Bytes::from("hello")), Ok(false));
        assert_eq!(recver.state, State::DataRecvd(10));

        assert_eq!(read(&mut recver), Poll::Ready(Ok(b"helloworld".to_vec())));
        assert!(recver.is_terminal());
        assert_eq!(read(&mut recver), Poll::Ready(Ok(vec![])));
    }

    #[test]
    fn test_final_size_checks() {
        let (mut recver, _, _) = new_recver(100);
        let sid = recver.stream_id();
        recver
            .recv_data(&StreamFrame::new(sid, 0, 10), Bytes::from(vec![0; 10]))
            .unwrap();
        let error = recver
            .recv_data(&StreamFrame::new(sid, 0, 5).with_fin(true), Bytes::from(vec![0; 5]))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::FinalSize);

        let (mut recver, _, _) = new_recver(100);
        recver
            .recv_data(&StreamFrame::new(sid, 0, 10).with_fin(true), Bytes::from(vec![0; 10]))
            .unwrap();
        let error = recver
            .recv_data(&StreamFrame::new(sid, 10, 1), Bytes::from(vec![0; 1]))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::FinalSize);
        let error = recver
            .recv_reset(&ResetStreamFrame::new(sid, 0, 12))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::FinalSize);
    }

    #[test]
    fn test_flow_control_violation() {
        let (mut recver, _, _) = new_recver(8);
        let sid = recver.stream_id();
        let error = recver
            .recv_data(&StreamFrame::new(sid, 4, 5), Bytes::from(vec![0; 5]))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::FlowControl);
    }

    #[test]
    fn test_offset_beyond_the_offset_space() {
        let (mut recver, conn, _) = new_recver(100);
        let sid = recver.stream_id();
        let frame = StreamFrame::new(sid, u64::MAX - 1, 4);
        let error = recver.recv_data(&frame, Bytes::from("abcd")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::FlowControl);
        let frame = StreamFrame::new(sid, VARINT_MAX, 1).with_fin(true);
        let error = recver.recv_data(&frame, Bytes::from("a")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::FlowControl);

        // nothing was accounted, the half keeps working
        assert_eq!(recver.window.highest_received(), 0);
        assert_eq!(conn.max_data(), Ok(1000));
        let frame = StreamFrame::new(sid, 0, 2);
        assert_eq!(recver.recv_data(&frame, Bytes::from("ok")), Ok(false));
        assert_eq!(read(&mut recver), Poll::Ready(Ok(b"ok".to_vec())));
    }

    #[test]
    fn test_broken_connection_window_fails_the_reader() {
        let (mut recver, conn, _) = new_recver(100);
        let sid = recver.stream_id();
        recver
            .recv_data(&StreamFrame::new(sid, 0, 10), Bytes::from(vec![0; 10]))
            .unwrap();
        // the connection window lost track of what was received
        let error = Error::with_default_fty(ErrorKind::Internal, "lost track");
        conn.on_conn_error(&error);
        assert_eq!(read(&mut recver), Poll::Ready(Err(StreamError::Connection(error))));
    }

    #[test]
    fn test_window_update_after_read() {
        let (mut recver, conn, _) = new_recver(100);
        let sid = recver.stream_id();
        recver
            .recv_data(&StreamFrame::new(sid, 0, 60), Bytes::from(vec![0; 60]))
            .unwrap();
        assert_eq!(recver.take_window_update(), None);
        assert!(read(&mut recver).is_ready());
        assert_eq!(recver.take_window_update(), Some(160));
        assert_eq!(recver.take_window_update(), None);
        // the connection accounts the consumed bytes too
        assert_eq!(conn.max_data(), Ok(1000));
    }

    #[test]
    fn test_reset_releases_credit() {
        let (mut recver, conn, _) = new_recver(600);
        let sid = recver.stream_id();
        recver
            .recv_data(&StreamFrame::new(sid, 0, 100), Bytes::from(vec![0; 100]))
            .unwrap();
        assert_eq!(recver.recv_reset(&ResetStreamFrame::new(sid, 9, 600)), Ok(false));
        // all 600 bytes are counted and released at once, crossing the update threshold
        assert_eq!(conn.take_window_update(), Some(1600));

        let error = ResetStreamError::new(9, 600);
        assert_eq!(read(&mut recver), Poll::Ready(Err(StreamError::Reset(error))));
        assert!(recver.is_terminal());
        // later frames are ignored
        assert_eq!(
            recver.recv_data(&StreamFrame::new(sid, 0, 10), Bytes::from(vec![0; 10])),
            Ok(false)
        );
    }

    #[test]
    fn test_stop() {
        let (mut recver, _, frames) = new_recver(100);
        let sid = recver.stream_id();
        recver
            .recv_data(&StreamFrame::new(sid, 0, 10), Bytes::from(vec![0; 10]))
            .unwrap();
        assert!(!recver.stop(5));
        assert!(!recver.stop(6));
        assert_eq!(
            frames.drain(),
            vec![ReliableFrame::from(StopSendingFrame::new(sid, 5))]
        );
        assert_eq!(
            read(&mut recver),
            Poll::Ready(Err(StreamError::Reset(ResetStreamError::new(5, 0))))
        );

        // the reset answering the stop ends the half
        assert_eq!(recver.recv_reset(&ResetStreamFrame::new(sid, 5, 20)), Ok(true));
        assert!(recver.is_terminal());
    }
}
