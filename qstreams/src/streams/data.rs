use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

use bytes::Bytes;
use qbase::{
    error::{Error, ErrorKind},
    flow::{ArcRtt, FlowController, RecvWindow},
    frame::{
        DataBlockedFrame, FrameType, GetFrameType, MaxDataFrame, MaxStreamDataFrame,
        ReliableFrame, StreamCtlFrame, StreamFrame,
    },
    param::StreamParameters,
    role::Role,
    sid::{
        ControlStreamsConcurrency, Dir, StreamId, StreamIds, handy::ConsistentConcurrency,
        remote_sid::{AcceptSid, AcceptSidError},
    },
};

use super::{
    WindowScope,
    io::{ArcInput, ArcInputGuard, ArcOutput, ArcOutputGuard, IOState, Reclaimer},
    listener::{AcceptBiStream, AcceptUniStream, ArcListener, ListenerGuard},
};
use crate::{
    FrameQueue, StreamError,
    recv::{ArcRecver, Incoming, Reader, Recver},
    send::{ArcSender, Outgoing, Sender, Writer},
};

/// The stream engine of one connection.
///
/// It multiplexes many independent ordered byte streams over the connection,
/// enforces the flow control windows in both directions at both levels,
/// and bounds the number of streams each endpoint may open.
///
/// The application opens and accepts streams, and drives them through their [`Reader`]s
/// and [`Writer`]s. The packet layer feeds the frames received from peer into the engine,
/// pulls the frames to send out of it, and reports what the peer acknowledged.
/// The engine never touches the wire itself.
///
/// All handles are shared, clones of a [`DataStreams`] operate on the same engine.
///
/// # Connection errors
///
/// Any protocol violation of the peer is fatal: the frame handler returns the error,
/// and the engine latches it, all pending and later operations fail with
/// [`StreamError::Connection`]. [`DataStreams::close`] does the same on behalf of the application.
#[derive(Debug, Clone)]
pub struct DataStreams {
    role: Role,
    local_params: StreamParameters,
    peer_params: StreamParameters,
    stream_ids: StreamIds<FrameQueue, FrameQueue>,
    flow_ctrl: FlowController<FrameQueue>,
    rtt: ArcRtt,
    // the sending halves, including the reset ones until the reset is acknowledged
    output: ArcOutput,
    // the receiving halves, until their data or reset has been read by the application
    input: ArcInput,
    listener: ArcListener,
    ctrl_frames: FrameQueue,
}

impl DataStreams {
    /// Create the engine of a connection where we play `role`.
    ///
    /// `local_params` are what we offer to the peer, `peer_params` what the peer offered to us.
    /// The limit of streams the peer may open is raised each time one of its streams is reclaimed.
    pub fn new(role: Role, local_params: &StreamParameters, peer_params: &StreamParameters) -> Self {
        let ctrl = ConsistentConcurrency::new(
            local_params.initial_max_streams_bidi(),
            local_params.initial_max_streams_uni(),
        );
        Self::with_concurrency(role, local_params, peer_params, Box::new(ctrl))
    }

    /// Like [`DataStreams::new`], with a custom strategy to raise the limit of streams the peer may open.
    pub fn with_concurrency(
        role: Role,
        local_params: &StreamParameters,
        peer_params: &StreamParameters,
        ctrl: Box<dyn ControlStreamsConcurrency>,
    ) -> Self {
        let ctrl_frames = FrameQueue::new();
        let stream_ids = StreamIds::new(
            role,
            local_params.initial_max_streams_bidi(),
            local_params.initial_max_streams_uni(),
            peer_params.initial_max_streams_bidi(),
            peer_params.initial_max_streams_uni(),
            ctrl_frames.clone(),
            ctrl,
        );
        let flow_ctrl = FlowController::new(
            peer_params.initial_max_data(),
            local_params.initial_max_data(),
            local_params.max_data_window(),
            local_params.auto_tune(),
            ctrl_frames.clone(),
        );
        Self {
            role,
            local_params: *local_params,
            peer_params: *peer_params,
            stream_ids,
            flow_ctrl,
            rtt: ArcRtt::default(),
            output: ArcOutput::new(),
            input: ArcInput::new(),
            listener: ArcListener::new(),
            ctrl_frames,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The queue of control frames produced by the streams, see [`DataStreams::fetch_control_frames`].
    pub fn ctrl_frames(&self) -> &FrameQueue {
        &self.ctrl_frames
    }

    fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(&self.output, &self.input, self.stream_ids.remote.clone())
    }

    fn create_sender(&self, sid: StreamId, max_stream_data: u64) -> ArcSender {
        ArcSender::new(Sender::new(
            sid,
            max_stream_data,
            self.flow_ctrl.sender.clone(),
            self.ctrl_frames.clone(),
        ))
    }

    fn create_recver(&self, sid: StreamId, window_size: u64) -> ArcRecver {
        let window = RecvWindow::new(
            window_size,
            self.local_params.max_stream_data_window(),
            self.local_params.auto_tune(),
        );
        ArcRecver::new(Recver::new(
            sid,
            window,
            self.flow_ctrl.recver.clone(),
            self.rtt.clone(),
            self.ctrl_frames.clone(),
        ))
    }

    fn create_local_bi_stream(
        &self,
        sid: StreamId,
        output: &mut ArcOutputGuard<'_>,
        input: &mut ArcInputGuard<'_>,
    ) -> (Reader, Writer) {
        let sender = self.create_sender(sid, self.peer_params.initial_max_stream_data_bidi_remote());
        let recver = self.create_recver(sid, self.local_params.initial_max_stream_data_bidi_local());
        let io_state = IOState::bidirection(sid, self.reclaimer());
        output.insert(sid, Outgoing::new(sender.clone()), io_state.clone());
        input.insert(sid, Incoming::new(recver.clone()), io_state.clone());
        tracing::debug!("{sid} is opened");
        (Reader::new(recver, io_state), Writer::new(sender, sid))
    }

    fn create_local_uni_stream(&self, sid: StreamId, output: &mut ArcOutputGuard<'_>) -> Writer {
        let sender = self.create_sender(sid, self.peer_params.initial_max_stream_data_uni());
        let io_state = IOState::send_only(sid, self.reclaimer());
        output.insert(sid, Outgoing::new(sender.clone()), io_state);
        tracing::debug!("{sid} is opened");
        Writer::new(sender, sid)
    }

    fn create_remote_stream(
        &self,
        sid: StreamId,
        output: &mut ArcOutputGuard<'_>,
        input: &mut ArcInputGuard<'_>,
        listener: &mut ListenerGuard<'_>,
    ) {
        match sid.dir() {
            Dir::Bi => {
                let sender =
                    self.create_sender(sid, self.peer_params.initial_max_stream_data_bidi_local());
                let recver =
                    self.create_recver(sid, self.local_params.initial_max_stream_data_bidi_remote());
                let io_state = IOState::bidirection(sid, self.reclaimer());
                output.insert(sid, Outgoing::new(sender.clone()), io_state.clone());
                input.insert(sid, Incoming::new(recver.clone()), io_state.clone());
                listener.push_bi_stream(sid, (Reader::new(recver, io_state), Writer::new(sender, sid)));
            }
            Dir::Uni => {
                let recver = self.create_recver(sid, self.local_params.initial_max_stream_data_uni());
                let io_state = IOState::receive_only(sid, self.reclaimer());
                input.insert(sid, Incoming::new(recver.clone()), io_state.clone());
                listener.push_uni_stream(sid, Reader::new(recver, io_state));
            }
        }
        tracing::debug!("{sid} is opened by peer");
    }

    /// Open a bidirectional stream, waiting while the peer does not allow more of them.
    #[allow(clippy::type_complexity)]
    pub fn poll_open_bi_stream(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(StreamId, (Reader, Writer)), StreamError>> {
        // the output is held while waiting, so that a connection error cannot slip in between
        let mut output = self.output.guard()?;
        let mut input = self.input.guard()?;
        let sid = ready!(self.stream_ids.local.poll_alloc_sid(cx, Dir::Bi));
        let stream = self.create_local_bi_stream(sid, &mut output, &mut input);
        Poll::Ready(Ok((sid, stream)))
    }

    /// Open a unidirectional stream, waiting while the peer does not allow more of them.
    pub fn poll_open_uni_stream(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(StreamId, Writer), StreamError>> {
        let mut output = self.output.guard()?;
        let sid = ready!(self.stream_ids.local.poll_alloc_sid(cx, Dir::Uni));
        Poll::Ready(Ok((sid, self.create_local_uni_stream(sid, &mut output))))
    }

    /// Asynchronously open a bidirectional stream.
    ///
    /// See [`interrupt`](crate::interrupt) to bound the waiting with a deadline or a cancellation.
    pub fn open_bi_stream(&self) -> OpenBiStream<'_> {
        OpenBiStream { streams: self }
    }

    /// Asynchronously open a unidirectional stream.
    pub fn open_uni_stream(&self) -> OpenUniStream<'_> {
        OpenUniStream { streams: self }
    }

    /// Open a bidirectional stream without waiting.
    ///
    /// Fails with [`StreamError::LimitReached`] if the peer does not allow more of them,
    /// a STREAMS_BLOCKED frame is reported to the peer then.
    pub fn try_open_bi_stream(&self) -> Result<(StreamId, (Reader, Writer)), StreamError> {
        let mut output = self.output.guard()?;
        let mut input = self.input.guard()?;
        let sid = self
            .stream_ids
            .local
            .try_alloc_sid(Dir::Bi)
            .ok_or(StreamError::LimitReached(Dir::Bi))?;
        Ok((sid, self.create_local_bi_stream(sid, &mut output, &mut input)))
    }

    /// Open a unidirectional stream without waiting, see [`DataStreams::try_open_bi_stream`].
    pub fn try_open_uni_stream(&self) -> Result<(StreamId, Writer), StreamError> {
        let mut output = self.output.guard()?;
        let sid = self
            .stream_ids
            .local
            .try_alloc_sid(Dir::Uni)
            .ok_or(StreamError::LimitReached(Dir::Uni))?;
        Ok((sid, self.create_local_uni_stream(sid, &mut output)))
    }

    /// Accept the next bidirectional stream opened by peer, in the order they were observed.
    pub fn accept_bi_stream(&self) -> AcceptBiStream<'_> {
        self.listener.accept_bi_stream()
    }

    /// Accept the next unidirectional stream opened by peer, in the order they were observed.
    pub fn accept_uni_stream(&self) -> AcceptUniStream<'_> {
        self.listener.accept_uni_stream()
    }

    fn has_sending_half(&self, sid: StreamId) -> bool {
        sid.dir() == Dir::Bi || sid.role() == self.role
    }

    fn has_receiving_half(&self, sid: StreamId) -> bool {
        sid.dir() == Dir::Bi || sid.role() != self.role
    }

    fn stream_state_error(&self, frame_type: FrameType, reason: String) -> Error {
        tracing::error!("   Cause by: {reason}");
        Error::new(ErrorKind::StreamState, frame_type, reason)
    }

    /// Make sure the stream `sid` referred to by a frame of peer may exist.
    ///
    /// A stream of peer that is new gets created, along with all the lower-numbered streams
    /// of the same class that were skipped. A stream of ours must have been opened already.
    fn try_accept_sid(&self, sid: StreamId, frame_type: FrameType) -> Result<(), Error> {
        if sid.role() == self.role {
            let opened = self.stream_ids.local.opened_streams(sid.dir());
            if sid.id() >= opened {
                return Err(self.stream_state_error(
                    frame_type,
                    format!("peer referred to {sid} which has not been opened"),
                ));
            }
            return Ok(());
        }

        // frames received after the connection failed are ignored
        let Ok(mut output) = self.output.guard() else {
            return Ok(());
        };
        let Ok(mut input) = self.input.guard() else {
            return Ok(());
        };
        let Ok(mut listener) = self.listener.guard() else {
            return Ok(());
        };
        match self.stream_ids.remote.try_accept_sid(sid) {
            Ok(AcceptSid::Old) => Ok(()),
            Ok(AcceptSid::New(need_create)) => {
                for sid in need_create {
                    self.create_remote_stream(sid, &mut output, &mut input, &mut listener);
                }
                Ok(())
            }
            Err(e @ AcceptSidError::ExceedLimit(..)) => {
                Err(Error::new(ErrorKind::StreamLimit, frame_type, e.to_string()))
            }
            Err(e @ AcceptSidError::NotRemote(..)) => {
                Err(Error::new(ErrorKind::Internal, frame_type, e.to_string()))
            }
        }
    }

    fn incoming(&self, sid: StreamId) -> Option<(Incoming, IOState)> {
        self.input.guard().ok()?.get(&sid)
    }

    fn outgoing(&self, sid: StreamId) -> Option<(Outgoing, IOState)> {
        self.output.guard().ok()?.get(&sid)
    }

    /// Fail the engine once a connection-level controller latched an internal error.
    ///
    /// The controllers latch it themselves when their accounting is found inconsistent,
    /// from a reader or a writer that cannot reach the engine.
    fn check_flow_ctrl(&self) -> Result<(), Error> {
        let result = self
            .flow_ctrl
            .sender
            .window()
            .and_then(|_| self.flow_ctrl.recver.max_data())
            .map(|_| ());
        self.check(result)
    }

    /// Latch the error of a failed frame handler.
    fn check<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(error) = &result {
            self.on_conn_error(error);
        }
        result
    }

    /// Handle a STREAM frame received from peer, carrying `body`.
    ///
    /// An error is a protocol violation of the peer, the connection is failed with it.
    pub fn recv_data(&self, frame: &StreamFrame, body: Bytes) -> Result<(), Error> {
        self.check(self.handle_data(frame, body))
    }

    fn handle_data(&self, frame: &StreamFrame, body: Bytes) -> Result<(), Error> {
        let sid = frame.stream_id();
        if !self.has_receiving_half(sid) {
            return Err(self.stream_state_error(
                frame.frame_type(),
                format!("local {sid} cannot receive STREAM frame"),
            ));
        }
        self.try_accept_sid(sid, frame.frame_type())?;
        let Ok(mut input) = self.input.guard() else {
            return Ok(());
        };
        let entry = input.get(&sid);
        drop(input);
        match entry {
            Some((incoming, io_state)) => {
                if incoming.recv_data(frame, body)? {
                    io_state.shutdown_receive();
                }
                Ok(())
            }
            None => {
                tracing::error!("   Cause by: received STREAM frame for reclaimed {sid}");
                Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    frame.frame_type(),
                    format!("{sid} has been reclaimed"),
                ))
            }
        }
    }

    /// Handle a stream-scoped control frame received from peer.
    ///
    /// Control frames for streams already reclaimed are ignored.
    /// An error is a protocol violation of the peer, the connection is failed with it.
    pub fn recv_stream_control(&self, frame: &StreamCtlFrame) -> Result<(), Error> {
        self.check(self.handle_stream_control(frame))
    }

    fn handle_stream_control(&self, frame: &StreamCtlFrame) -> Result<(), Error> {
        match frame {
            StreamCtlFrame::ResetStream(reset) => {
                let sid = reset.stream_id();
                if !self.has_receiving_half(sid) {
                    return Err(self.stream_state_error(
                        reset.frame_type(),
                        format!("local {sid} cannot receive RESET_STREAM frame"),
                    ));
                }
                self.try_accept_sid(sid, reset.frame_type())?;
                if let Some((incoming, io_state)) = self.incoming(sid) {
                    if incoming.recv_reset(reset)? {
                        io_state.shutdown_receive();
                    }
                }
            }
            StreamCtlFrame::StopSending(stop) => {
                let sid = stop.stream_id();
                if !self.has_sending_half(sid) {
                    return Err(self.stream_state_error(
                        stop.frame_type(),
                        format!("remote {sid} cannot receive STOP_SENDING frame"),
                    ));
                }
                self.try_accept_sid(sid, stop.frame_type())?;
                if let Some((outgoing, _)) = self.outgoing(sid) {
                    outgoing.be_stopped(stop.app_err_code());
                }
            }
            StreamCtlFrame::MaxStreamData(max_stream_data) => {
                let sid = max_stream_data.stream_id();
                if !self.has_sending_half(sid) {
                    return Err(self.stream_state_error(
                        max_stream_data.frame_type(),
                        format!("remote {sid} cannot receive MAX_STREAM_DATA frame"),
                    ));
                }
                self.try_accept_sid(sid, max_stream_data.frame_type())?;
                if let Some((outgoing, _)) = self.outgoing(sid) {
                    outgoing.update_window(max_stream_data.max_stream_data());
                }
            }
            StreamCtlFrame::StreamDataBlocked(blocked) => {
                let sid = blocked.stream_id();
                if !self.has_receiving_half(sid) {
                    return Err(self.stream_state_error(
                        blocked.frame_type(),
                        format!("local {sid} cannot receive STREAM_DATA_BLOCKED frame"),
                    ));
                }
                self.try_accept_sid(sid, blocked.frame_type())?;
                tracing::trace!(
                    "{sid} is blocked by the window {} we advertised",
                    blocked.maximum_stream_data()
                );
            }
            StreamCtlFrame::MaxStreams(max_streams) => {
                self.stream_ids.local.recv_max_streams_frame(max_streams);
            }
            StreamCtlFrame::StreamsBlocked(blocked) => {
                self.stream_ids.remote.recv_streams_blocked_frame(blocked);
            }
        }
        Ok(())
    }

    /// Raise the connection-level send window by a MAX_DATA frame from peer.
    pub fn recv_max_data(&self, frame: &MaxDataFrame) {
        self.flow_ctrl.sender.update_send_window(frame.max_data);
    }

    pub fn recv_data_blocked(&self, frame: &DataBlockedFrame) {
        tracing::trace!("connection is blocked by the window {} we advertised", frame.limit);
    }

    /// Raise the send window of `scope` to `limit`, smaller limits are ignored.
    pub fn update_send_window(&self, scope: WindowScope, limit: u64) {
        match scope {
            WindowScope::Connection => self.flow_ctrl.sender.update_send_window(limit),
            WindowScope::Stream(sid) => {
                if let Some((outgoing, _)) = self.outgoing(sid) {
                    outgoing.update_window(limit);
                }
            }
        }
    }

    /// Feed the smoothed round trip time estimated by the packet layer, used for auto-tuning.
    pub fn on_rtt_sample(&self, smoothed_rtt: Duration) {
        self.rtt.update(smoothed_rtt);
    }

    /// The peer acknowledged the STREAM frame `frame`.
    pub fn on_data_acked(&self, frame: &StreamFrame) {
        if let Some((outgoing, io_state)) = self.outgoing(frame.stream_id()) {
            if outgoing.on_data_acked(frame) {
                io_state.shutdown_send();
            }
        }
    }

    /// The peer acknowledged the RESET_STREAM frame of stream `sid`.
    pub fn on_reset_acked(&self, sid: StreamId) {
        if let Some((outgoing, io_state)) = self.outgoing(sid) {
            if outgoing.on_reset_acked() {
                io_state.shutdown_send();
            }
        }
    }

    /// Pick up the next STREAM frame carrying at most `max_len` bytes.
    ///
    /// The streams take turns, one frame each, so that no stream starves the others.
    /// Returns `None` when no stream has anything to send.
    pub fn next_sendable(&self, max_len: usize) -> Option<(StreamFrame, Bytes)> {
        self.check_flow_ctrl().ok()?;
        self.output.guard().ok()?.next_sendable(max_len)
    }

    /// Iterate over the STREAM frames ready to be sent, see [`DataStreams::next_sendable`].
    ///
    /// The iteration can be stopped at any time, and restarted later.
    pub fn sendable(&self, max_len: usize) -> Sendable<'_> {
        Sendable {
            streams: self,
            max_len,
        }
    }

    /// Take the window limit of `scope` waiting to be advertised to the peer, if any.
    pub fn pending_window_update(&self, scope: WindowScope) -> Option<u64> {
        self.check_flow_ctrl().ok()?;
        match scope {
            WindowScope::Connection => self.flow_ctrl.recver.take_window_update(),
            WindowScope::Stream(sid) => self.incoming(sid)?.0.take_window_update(),
        }
    }

    /// Collect every control frame waiting to be sent to the peer.
    ///
    /// Includes the frames queued in [`DataStreams::ctrl_frames`],
    /// and the MAX_DATA and MAX_STREAM_DATA frames of the pending window updates.
    pub fn fetch_control_frames(&self) -> Vec<ReliableFrame> {
        if self.check_flow_ctrl().is_err() {
            return Vec::new();
        }
        let mut frames = self.ctrl_frames.drain();
        if let Some(max_data) = self.flow_ctrl.recver.take_window_update() {
            frames.push(MaxDataFrame { max_data }.into());
        }
        if let Ok(mut input) = self.input.guard() {
            frames.extend(
                input
                    .window_updates()
                    .into_iter()
                    .map(|(sid, max)| ReliableFrame::from(MaxStreamDataFrame::new(sid, max))),
            );
        }
        frames
    }

    /// Reset the sending half and stop the receiving half of stream `sid`, with `error_code`.
    pub fn reset_stream(&self, sid: StreamId, error_code: u64) {
        if let Some((outgoing, _)) = self.outgoing(sid) {
            outgoing.reset(error_code);
        }
        if let Some((incoming, io_state)) = self.incoming(sid) {
            if incoming.stop(error_code) {
                io_state.shutdown_receive();
            }
        }
    }

    /// Close the connection on behalf of the application.
    pub fn close(&self, error_code: u64, reason: impl Into<String>) {
        self.on_conn_error(&Error::app_close(error_code, reason));
    }

    /// Fail every stream with the connection `error`, only the first error is latched.
    pub fn on_conn_error(&self, error: &Error) {
        let Ok(mut output) = self.output.guard() else {
            return;
        };
        tracing::warn!("streams are closed by connection error: {error}");
        output.on_conn_error(error);
        // the openers register under the output lock, none of them is missed
        self.stream_ids.local.wake_all();
        drop(output);

        if let Ok(mut input) = self.input.guard() {
            input.on_conn_error(error);
        }
        if let Ok(mut listener) = self.listener.guard() {
            listener.on_conn_error(error);
        }
        self.flow_ctrl.on_conn_error(error);
        self.ctrl_frames.close();
    }
}

/// Future to open a bidirectional stream, created by [`DataStreams::open_bi_stream`].
#[derive(Debug)]
pub struct OpenBiStream<'s> {
    streams: &'s DataStreams,
}

impl Future for OpenBiStream<'_> {
    type Output = Result<(StreamId, (Reader, Writer)), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.streams.poll_open_bi_stream(cx)
    }
}

/// Future to open a unidirectional stream, created by [`DataStreams::open_uni_stream`].
#[derive(Debug)]
pub struct OpenUniStream<'s> {
    streams: &'s DataStreams,
}

impl Future for OpenUniStream<'_> {
    type Output = Result<(StreamId, Writer), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.streams.poll_open_uni_stream(cx)
    }
}

/// Iterator over the STREAM frames ready to be sent, created by [`DataStreams::sendable`].
#[derive(Debug)]
pub struct Sendable<'s> {
    streams: &'s DataStreams,
    max_len: usize,
}

impl Iterator for Sendable<'_> {
    type Item = (StreamFrame, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.streams.next_sendable(self.max_len)
    }
}
