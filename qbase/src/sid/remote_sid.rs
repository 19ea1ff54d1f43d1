use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::{ControlStreamsConcurrency, Dir, MAX_STREAMS_LIMIT, Role, StreamId};
use crate::frame::{MaxStreamsFrame, SendFrame, StreamsBlockedFrame};

/// The stream ID from peer cannot be accepted.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum AcceptSidError {
    /// The stream ID exceeds the stream limit we advertised,
    /// reported as [`ErrorKind::StreamLimit`](`crate::error::ErrorKind::StreamLimit`).
    #[error("{0} exceed limit: {1}")]
    ExceedLimit(StreamId, u64),
    /// The stream ID is initiated by ourselves, the caller mixed up the roles,
    /// reported as [`ErrorKind::Internal`](`crate::error::ErrorKind::Internal`).
    #[error("{0} is not initiated by peer")]
    NotRemote(StreamId),
}

/// Accept the stream ID received from peer,
/// returned by [`ArcRemoteStreamIds::try_accept_sid`].
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptSid {
    /// Indicates that the stream ID was already accepted.
    Old,
    /// Indicates that the stream ID is new and need to create.
    /// The `NeedCreate` inside indicates the range of stream IDs that need to be created together.
    New(NeedCreate),
}

/// The range of stream IDs that need to be created, in increasing order,
/// see [`ArcRemoteStreamIds::try_accept_sid`] and [`AcceptSid::New`].
#[derive(Debug, PartialEq, Eq)]
pub struct NeedCreate {
    start: StreamId,
    end: StreamId,
}

impl Iterator for NeedCreate {
    type Item = StreamId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start > self.end {
            None
        } else {
            let id = self.start;
            self.start = self.start.successor();
            Some(id)
        }
    }
}

/// Remote stream IDs management.
#[derive(Debug)]
struct RemoteStreamIds<MAX> {
    role: Role,                               // The role of the peer
    max: [u64; 2],                            // The cumulative stream limit advertised to peer
    unallocated: [StreamId; 2],               // The first stream ID that peer has not used
    ctrl: Box<dyn ControlStreamsConcurrency>, // The strategy to control the concurrency of streams
    max_tx: MAX,                              // The channel to send the MAX_STREAMS frame to peer
}

impl<MAX> RemoteStreamIds<MAX>
where
    MAX: SendFrame<MaxStreamsFrame>,
{
    fn new(
        role: Role,
        max_bi: u64,
        max_uni: u64,
        max_tx: MAX,
        ctrl: Box<dyn ControlStreamsConcurrency>,
    ) -> Self {
        Self {
            role,
            max: [max_bi.min(MAX_STREAMS_LIMIT), max_uni.min(MAX_STREAMS_LIMIT)],
            unallocated: [
                StreamId::new(role, Dir::Bi, 0),
                StreamId::new(role, Dir::Uni, 0),
            ],
            ctrl,
            max_tx,
        }
    }

    fn role(&self) -> Role {
        self.role
    }

    fn try_accept_sid(&mut self, sid: StreamId) -> Result<AcceptSid, AcceptSidError> {
        if sid.role() != self.role {
            tracing::error!("   Cause by: {sid} is not initiated by peer");
            return Err(AcceptSidError::NotRemote(sid));
        }
        let idx = sid.dir() as usize;
        if sid.id() >= self.max[idx] {
            tracing::error!("   Cause by: accepted {sid} beyond limit {}", self.max[idx]);
            return Err(AcceptSidError::ExceedLimit(sid, self.max[idx]));
        }
        let cur = &mut self.unallocated[idx];
        if sid < *cur {
            return Ok(AcceptSid::Old);
        }
        let start = *cur;
        *cur = sid.successor();
        if let Some(max_streams) = self.ctrl.on_accept_streams(sid.dir(), sid.id()) {
            self.increase_limit(sid.dir(), max_streams);
        }
        Ok(AcceptSid::New(NeedCreate { start, end: sid }))
    }

    fn increase_limit(&mut self, dir: Dir, max_streams: u64) {
        let max_streams = max_streams.min(MAX_STREAMS_LIMIT);
        let limit = &mut self.max[dir as usize];
        if max_streams > *limit {
            *limit = max_streams;
            self.max_tx.send_frame([MaxStreamsFrame::with(dir, max_streams)]);
        }
    }

    fn on_end_of_stream(&mut self, sid: StreamId) {
        if sid.role() != self.role {
            return;
        }
        if let Some(max_streams) = self.ctrl.on_end_of_stream(sid.dir(), sid.id()) {
            self.increase_limit(sid.dir(), max_streams);
        }
    }

    fn recv_streams_blocked_frame(&mut self, frame: &StreamsBlockedFrame) {
        let (dir, max_streams) = (frame.dir(), frame.max_streams());
        if let Some(max_streams) = self.ctrl.on_streams_blocked(dir, max_streams) {
            self.increase_limit(dir, max_streams);
        }
    }
}

/// Shared remote stream IDs, mainly controls and monitors the stream IDs
/// in the received stream-related frames from peer.
///
/// Checks whether the stream IDs exceed the limit, and tells which streams should be created.
/// And sends a [`MaxStreamsFrame`] to the peer to update the stream limit in time.
///
/// # Note
///
/// Due to possible out-of-order reception,
/// the stream IDs in the frames from peer may have gaps,
/// i.e., they may not be continuous with the previous stream ID of the same type.
/// So before a stream is created,
/// all streams of the same type with lower-numbered stream IDs MUST be created.
#[derive(Debug, Clone)]
pub struct ArcRemoteStreamIds<MAX>(Arc<Mutex<RemoteStreamIds<MAX>>>);

impl<MAX> ArcRemoteStreamIds<MAX>
where
    MAX: SendFrame<MaxStreamsFrame>,
{
    /// Create a new [`ArcRemoteStreamIds`] with the role of peer,
    /// and the stream limits we advertised in each direction.
    pub fn new(
        role: Role,
        max_bi: u64,
        max_uni: u64,
        max_tx: MAX,
        ctrl: Box<dyn ControlStreamsConcurrency>,
    ) -> Self {
        Self(Arc::new(Mutex::new(RemoteStreamIds::new(
            role, max_bi, max_uni, max_tx, ctrl,
        ))))
    }

    /// Returns the role of the peer.
    pub fn role(&self) -> Role {
        self.0.lock().unwrap().role()
    }

    /// Try to accept the stream ID received from peer.
    ///
    /// # Return
    ///
    /// - Return [`AcceptSidError::ExceedLimit`] if the stream ID exceeds the stream limit,
    ///   no stream should be created in that case.
    /// - Return [`AcceptSidError::NotRemote`] if the stream ID is initiated by ourselves.
    /// - Return [`AcceptSid::Old`] if the stream ID was accepted before.
    /// - Return [`AcceptSid::New`] if the stream ID is new and need to create.
    ///   The `NeedCreate` inside indicates the range of stream IDs that need to be created.
    pub fn try_accept_sid(&self, sid: StreamId) -> Result<AcceptSid, AcceptSidError> {
        self.0.lock().unwrap().try_accept_sid(sid)
    }

    /// Called back when a stream has been reclaimed, both of its halves having ended.
    ///
    /// Streams initiated by us are ignored.
    #[inline]
    pub fn on_end_of_stream(&self, sid: StreamId) {
        self.0.lock().unwrap().on_end_of_stream(sid);
    }

    #[inline]
    pub fn recv_streams_blocked_frame(&self, frame: &StreamsBlockedFrame) {
        self.0.lock().unwrap().recv_streams_blocked_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::ReliableFrame, sid::handy::ConsistentConcurrency, util::ArcAsyncDeque};

    #[test]
    fn test_try_accept_sid() {
        let remote = ArcRemoteStreamIds::new(
            Role::Server,
            10,
            5,
            ArcAsyncDeque::<ReliableFrame>::new(),
            Box::new(ConsistentConcurrency::new(10, 5)),
        );
        let result = remote.try_accept_sid(StreamId(21));
        assert_eq!(
            result,
            Ok(AcceptSid::New(NeedCreate {
                start: StreamId(1),
                end: StreamId(21)
            }))
        );
        assert_eq!(remote.0.lock().unwrap().unallocated[0], StreamId(25));
        assert_eq!(remote.try_accept_sid(StreamId(9)), Ok(AcceptSid::Old));

        let result = remote.try_accept_sid(StreamId(29));
        assert_eq!(
            result,
            Ok(AcceptSid::New(NeedCreate {
                start: StreamId(25),
                end: StreamId(29)
            }))
        );
        if let Ok(AcceptSid::New(mut range)) = result {
            assert_eq!(range.next(), Some(StreamId(25)));
            assert_eq!(range.next(), Some(StreamId(29)));
            assert_eq!(range.next(), None);
        }

        // sequence number 9 is the last one allowed by a limit of 10
        assert!(remote.try_accept_sid(StreamId::new(Role::Server, Dir::Bi, 9)).is_ok());
        let sid = StreamId::new(Role::Server, Dir::Bi, 10);
        assert_eq!(remote.try_accept_sid(sid), Err(AcceptSidError::ExceedLimit(sid, 10)));
        // nothing created for the rejected stream
        assert_eq!(remote.0.lock().unwrap().unallocated[0], sid);

        let local = StreamId::new(Role::Client, Dir::Bi, 0);
        assert_eq!(remote.try_accept_sid(local), Err(AcceptSidError::NotRemote(local)));
    }

    #[test]
    fn test_end_of_stream_raises_limit() {
        let frames = ArcAsyncDeque::<ReliableFrame>::new();
        let remote = ArcRemoteStreamIds::new(
            Role::Client,
            1,
            1,
            frames.clone(),
            Box::new(ConsistentConcurrency::new(1, 1)),
        );
        let first = StreamId::new(Role::Client, Dir::Bi, 0);
        let second = StreamId::new(Role::Client, Dir::Bi, 1);
        assert!(remote.try_accept_sid(first).is_ok());
        assert!(remote.try_accept_sid(second).is_err());

        // streams initiated by ourselves are ignored
        remote.on_end_of_stream(StreamId::new(Role::Server, Dir::Bi, 0));
        assert!(frames.is_empty());

        remote.on_end_of_stream(first);
        assert_eq!(frames.drain(), vec![MaxStreamsFrame::Bi(2).into()]);
        assert!(remote.try_accept_sid(second).is_ok());
    }
}
