use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use super::{Dir, MAX_STREAMS_LIMIT, Role, StreamId};
use crate::frame::{MaxStreamsFrame, SendFrame, StreamsBlockedFrame};

/// Local stream IDs management.
#[derive(Debug)]
struct LocalStreamIds<BLOCKED> {
    /// Our role
    role: Role,
    /// The cumulative number of streams the peer allows us to open in each direction
    max: [u64; 2],
    /// The sequence number of the next stream to allocate in each direction
    unallocated: [u64; 2],
    /// Openers waiting for the MaxStreams frame from peer, in the order they got blocked
    wakers: [VecDeque<Waker>; 2],
    /// The limit last reported in a StreamsBlocked frame, reported once per limit
    blocked_at: [Option<u64>; 2],
    /// The StreamsBlocked frames that will be sent to peer
    blocked: BLOCKED,
}

impl<BLOCKED> LocalStreamIds<BLOCKED>
where
    BLOCKED: SendFrame<StreamsBlockedFrame>,
{
    fn new(role: Role, init_max_bi_streams: u64, init_max_uni_streams: u64, blocked: BLOCKED) -> Self {
        Self {
            role,
            max: [
                init_max_bi_streams.min(MAX_STREAMS_LIMIT),
                init_max_uni_streams.min(MAX_STREAMS_LIMIT),
            ],
            unallocated: [0, 0],
            wakers: [VecDeque::with_capacity(2), VecDeque::with_capacity(2)],
            blocked_at: [None, None],
            blocked,
        }
    }

    fn role(&self) -> Role {
        self.role
    }

    fn opened_streams(&self, dir: Dir) -> u64 {
        self.unallocated[dir as usize]
    }

    fn max_streams(&self, dir: Dir) -> u64 {
        self.max[dir as usize]
    }

    fn recv_max_streams_frame(&mut self, frame: &MaxStreamsFrame) {
        let (dir, val) = (frame.dir(), frame.max_streams().min(MAX_STREAMS_LIMIT));
        let max_streams = &mut self.max[dir as usize];
        // MAX_STREAMS frames that do not increase the stream limit are ignored.
        if *max_streams < val {
            tracing::debug!("peer raised {dir} streams limit from {max_streams} to {val}");
            *max_streams = val;
            for waker in self.wakers[dir as usize].drain(..) {
                waker.wake();
            }
        }
    }

    fn try_alloc_sid(&mut self, dir: Dir) -> Option<StreamId> {
        let idx = dir as usize;
        let unallocated = self.unallocated[idx];
        if unallocated < self.max[idx] {
            self.unallocated[idx] += 1;
            Some(StreamId::new(self.role, dir, unallocated))
        } else {
            self.report_blocked(dir);
            None
        }
    }

    fn poll_alloc_sid(&mut self, cx: &mut Context<'_>, dir: Dir) -> Poll<StreamId> {
        match self.try_alloc_sid(dir) {
            Some(sid) => Poll::Ready(sid),
            None => {
                let wakers = &mut self.wakers[dir as usize];
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push_back(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }

    fn report_blocked(&mut self, dir: Dir) {
        let idx = dir as usize;
        let max = self.max[idx];
        if self.blocked_at[idx] != Some(max) {
            self.blocked_at[idx] = Some(max);
            self.blocked
                .send_frame([StreamsBlockedFrame::with(dir, max)]);
        }
    }

    fn wake_all(&mut self) {
        for waker in self.wakers.iter_mut().flat_map(|w| w.drain(..)) {
            waker.wake();
        }
    }
}

/// Management of stream IDs that are allowed to be opened locally.
///
/// The number of streams that can be opened is limited by the
/// [`MaxStreamsFrame`] from the peer, which is cumulative over the lifetime of the connection.
/// The peer raises it as the streams we opened end,
/// so that the number of concurrently active streams never exceeds its limit.
///
/// When the stream IDs in the `dir` direction are exhausted,
/// a [`StreamsBlockedFrame`] will be sent to the peer.
/// The generic parameter `BLOCKED` is the container of the [`StreamsBlockedFrame`]
/// that will be sent to peer, it can be a channel, a queue, or a buffer.
#[derive(Debug, Clone)]
pub struct ArcLocalStreamIds<BLOCKED>(Arc<Mutex<LocalStreamIds<BLOCKED>>>);

impl<BLOCKED> ArcLocalStreamIds<BLOCKED>
where
    BLOCKED: SendFrame<StreamsBlockedFrame>,
{
    /// Create a new [`ArcLocalStreamIds`] with the given role,
    /// and the maximum number of streams the peer allows in each direction.
    pub fn new(role: Role, max_bidi: u64, max_uni: u64, blocked: BLOCKED) -> Self {
        Self(Arc::new(Mutex::new(LocalStreamIds::new(
            role, max_bidi, max_uni, blocked,
        ))))
    }

    /// Returns local role
    pub fn role(&self) -> Role {
        self.0.lock().unwrap().role()
    }

    /// Returns the number of opened streams in the `dir` direction.
    pub fn opened_streams(&self, dir: Dir) -> u64 {
        self.0.lock().unwrap().opened_streams(dir)
    }

    /// Returns the cumulative limit currently granted by the peer in the `dir` direction.
    pub fn max_streams(&self, dir: Dir) -> u64 {
        self.0.lock().unwrap().max_streams(dir)
    }

    /// Receive the [`MaxStreamsFrame`] from peer,
    /// and wake up all the openers blocked in that direction.
    pub fn recv_max_streams_frame(&self, frame: &MaxStreamsFrame) {
        self.0.lock().unwrap().recv_max_streams_frame(frame);
    }

    /// Allocate the next [`StreamId`] in the `dir` direction without waiting.
    ///
    /// Returns `None` if the limit granted by the peer has been reached,
    /// a [`StreamsBlockedFrame`] is reported to the peer in that case.
    pub fn try_alloc_sid(&self, dir: Dir) -> Option<StreamId> {
        self.0.lock().unwrap().try_alloc_sid(dir)
    }

    /// Asynchronously allocate the next [`StreamId`] in the `dir` direction.
    ///
    /// Return Pending when the stream IDs in the `dir` direction are exhausted,
    /// until receiving the [`MaxStreamsFrame`] from peer.
    /// Since the limit never exceeds [`MAX_STREAMS_LIMIT`], an allocated ID is always valid.
    pub fn poll_alloc_sid(&self, cx: &mut Context<'_>, dir: Dir) -> Poll<StreamId> {
        self.0.lock().unwrap().poll_alloc_sid(cx, dir)
    }

    /// Wake up all blocked openers, they will observe the connection error on their next poll.
    pub fn wake_all(&self) {
        self.0.lock().unwrap().wake_all();
    }
}
