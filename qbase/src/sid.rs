use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    frame::{MaxStreamsFrame, SendFrame, StreamsBlockedFrame},
    role::Role,
};

/// Sum type for stream directions.
///
/// Unidirectional streams carry data in one direction: from the initiator of the stream to its peer.
/// Bidirectional streams allow for data to be sent in both directions.
///
/// The second least significant bit (0x02) of the [`StreamId`] distinguishes between
/// bidirectional streams (with the bit set to 0) and unidirectional streams (with the bit set to 1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Streams are identified within a connection by a numeric value.
///
/// The two low bits encode the initiator [`Role`] and the [`Dir`],
/// the remaining bits are the sequence number of the stream within its class.
/// Sequence numbers are allocated strictly increasingly within each class
/// and are never reused on a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

/// Maximum sequence number for each class of stream.
///
/// After removing the lowest 2 bits for direction and role,
/// the remaining 60 bits are used to represent the sequence number,
/// so stream count limits can never exceed 2^60.
pub const MAX_STREAMS_LIMIT: u64 = (1 << 60) - 1;

impl StreamId {
    /// Create a new stream ID with the given role, direction, and sequence number.
    pub fn new(role: Role, dir: Dir, id: u64) -> Self {
        assert!(id <= MAX_STREAMS_LIMIT);
        Self((((id << 1) | (dir as u64)) << 1) | (role as u64))
    }

    /// Returns the role which initiated this stream.
    pub fn role(&self) -> Role {
        if self.0 & 0x1 == 0 {
            Role::Client
        } else {
            Role::Server
        }
    }

    /// Returns the direction of this stream.
    pub fn dir(&self) -> Dir {
        if self.0 & 2 == 0 { Dir::Bi } else { Dir::Uni }
    }

    /// Get the sequence number of this stream, removing the lowest 2 bits for direction and role.
    pub fn id(&self) -> u64 {
        self.0 >> 2
    }

    /// The next stream ID of the same class.
    ///
    /// Callers guarantee the sequence number stays within [`MAX_STREAMS_LIMIT`].
    fn successor(&self) -> Self {
        Self(self.0 + 4)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} side {} stream {}",
            self.role(),
            self.dir(),
            self.id()
        )
    }
}

/// Stream IDs arrive from the packet layer as raw integers.
impl From<u64> for StreamId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<StreamId> for u64 {
    fn from(s: StreamId) -> Self {
        s.0
    }
}

/// Controls the concurrency of unidirectional and bidirectional streams created by the peer,
/// primarily through [`StreamsBlockedFrame`] and [`MaxStreamsFrame`].
///
/// Implementations decide when and how far the limit advertised to the peer is raised.
/// They might increase limits as streams end, to keep the number of streams available
/// to the peer roughly consistent, or increase them on demand.
pub trait ControlStreamsConcurrency: fmt::Debug + Send + Sync {
    /// Called back upon accepting new `dir` direction streams up to sequence number `sid`.
    ///
    /// Returns the new limit, if the limit should be raised.
    #[must_use]
    fn on_accept_streams(&mut self, dir: Dir, sid: u64) -> Option<u64>;

    /// Called back upon a `dir` directional stream is ended and reclaimed,
    /// whether it is closed normally or reset abnormally.
    ///
    /// Returns the new limit, if the limit should be raised.
    #[must_use]
    fn on_end_of_stream(&mut self, dir: Dir, sid: u64) -> Option<u64>;

    /// Called back upon receiving the StreamsBlocked frame,
    /// which indicates that the peer is limited to create more `dir` direction streams.
    ///
    /// Returns the new limit, if the limit should be raised.
    #[must_use]
    fn on_streams_blocked(&mut self, dir: Dir, max_streams: u64) -> Option<u64>;
}

impl<C: ?Sized + ControlStreamsConcurrency> ControlStreamsConcurrency for Box<C> {
    fn on_accept_streams(&mut self, dir: Dir, sid: u64) -> Option<u64> {
        self.as_mut().on_accept_streams(dir, sid)
    }

    fn on_end_of_stream(&mut self, dir: Dir, sid: u64) -> Option<u64> {
        self.as_mut().on_end_of_stream(dir, sid)
    }

    fn on_streams_blocked(&mut self, dir: Dir, max_streams: u64) -> Option<u64> {
        self.as_mut().on_streams_blocked(dir, max_streams)
    }
}

pub mod handy;

pub mod local_sid;
pub use local_sid::ArcLocalStreamIds;

pub mod remote_sid;
pub use remote_sid::ArcRemoteStreamIds;

/// Stream IDs management, including an [`ArcLocalStreamIds`] as local,
/// and an [`ArcRemoteStreamIds`] as remote.
#[derive(Debug, Clone)]
pub struct StreamIds<BLOCKED, MAX> {
    pub local: ArcLocalStreamIds<BLOCKED>,
    pub remote: ArcRemoteStreamIds<MAX>,
}

impl<T> StreamIds<T, T>
where
    T: SendFrame<MaxStreamsFrame> + SendFrame<StreamsBlockedFrame> + Clone + Send + 'static,
{
    /// Create a new [`StreamIds`] with the given local role.
    ///
    /// `local_max_*` are the limits we advertise to the peer,
    /// `remote_max_*` are the limits the peer advertised to us.
    pub fn new(
        role: Role,
        local_max_bi: u64,
        local_max_uni: u64,
        remote_max_bi: u64,
        remote_max_uni: u64,
        sid_frames_tx: T,
        ctrl: Box<dyn ControlStreamsConcurrency>,
    ) -> Self {
        let local = ArcLocalStreamIds::new(role, remote_max_bi, remote_max_uni, sid_frames_tx.clone());
        let remote =
            ArcRemoteStreamIds::new(!role, local_max_bi, local_max_uni, sid_frames_tx, ctrl);
        Self { local, remote }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_new() {
        let sid = StreamId::new(Role::Client, Dir::Bi, 0);
        assert_eq!(sid, StreamId(0));
        assert_eq!(sid.role(), Role::Client);
        assert_eq!(sid.dir(), Dir::Bi);

        let sid = StreamId::new(Role::Server, Dir::Uni, 5);
        assert_eq!(u64::from(sid), 23);
        assert_eq!(sid.role(), Role::Server);
        assert_eq!(sid.dir(), Dir::Uni);
        assert_eq!(sid.id(), 5);
        assert_eq!(sid.successor().id(), 6);
        assert_eq!(StreamId::from(23), sid);
    }

    #[test]
    fn test_stream_id_display() {
        let sid = StreamId::new(Role::Server, Dir::Bi, 2);
        assert_eq!(sid.to_string(), "server side bidirectional stream 2");
    }
}
