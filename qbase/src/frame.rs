//! Frame descriptors exchanged between the stream layer and the packet layer.
//!
//! The stream layer never encodes frames on the wire. Inbound frames are delivered to it
//! already parsed, and outbound frames are handed to the packet layer as these plain
//! descriptors through a [`SendFrame`] sink.

use std::ops::Range;

use derive_more::From;
use thiserror::Error;

use crate::sid::{Dir, StreamId};

/// The types of frames the stream layer produces or consumes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    /// RESET_STREAM frame, see [`ResetStreamFrame`].
    ResetStream,
    /// STOP_SENDING frame, see [`StopSendingFrame`].
    StopSending,
    /// STREAM frame, see [`StreamFrame`].
    Stream,
    /// MAX_DATA frame, see [`MaxDataFrame`].
    MaxData,
    /// MAX_STREAM_DATA frame, see [`MaxStreamDataFrame`].
    MaxStreamData,
    /// MAX_STREAMS frame, see [`MaxStreamsFrame`].
    MaxStreams(Dir),
    /// DATA_BLOCKED frame, see [`DataBlockedFrame`].
    DataBlocked,
    /// STREAM_DATA_BLOCKED frame, see [`StreamDataBlockedFrame`].
    StreamDataBlocked,
    /// STREAMS_BLOCKED frame, see [`StreamsBlockedFrame`].
    StreamsBlocked(Dir),
}

/// Return the type of frame.
pub trait GetFrameType {
    fn frame_type(&self) -> FrameType;
}

/// Describes the stream data carried by one STREAM frame.
///
/// The payload travels next to the descriptor as [`bytes::Bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrame {
    stream_id: StreamId,
    offset: u64,
    length: usize,
    fin: bool,
}

impl StreamFrame {
    pub fn new(stream_id: StreamId, offset: u64, length: usize) -> Self {
        Self {
            stream_id,
            offset,
            length,
            fin: false,
        }
    }

    /// Mark this frame as the last frame of the stream.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// The byte range of the stream this frame covers.
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length as u64
    }
}

impl GetFrameType for StreamFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::Stream
    }
}

/// The application error code and final size of a reset stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the stream was reset with app error code: {error_code}, final size: {final_size}")]
pub struct ResetStreamError {
    error_code: u64,
    final_size: u64,
}

impl ResetStreamError {
    pub fn new(error_code: u64, final_size: u64) -> Self {
        Self {
            error_code,
            final_size,
        }
    }

    pub fn error_code(&self) -> u64 {
        self.error_code
    }

    pub fn final_size(&self) -> u64 {
        self.final_size
    }

    /// Build the RESET_STREAM frame announcing this error on stream `sid`.
    pub fn combine(self, stream_id: StreamId) -> ResetStreamFrame {
        ResetStreamFrame {
            stream_id,
            app_error_code: self.error_code,
            final_size: self.final_size,
        }
    }
}

/// RESET_STREAM frame, abandons the sending part of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    stream_id: StreamId,
    app_error_code: u64,
    final_size: u64,
}

impl ResetStreamFrame {
    pub fn new(stream_id: StreamId, app_error_code: u64, final_size: u64) -> Self {
        Self {
            stream_id,
            app_error_code,
            final_size,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn app_error_code(&self) -> u64 {
        self.app_error_code
    }

    pub fn final_size(&self) -> u64 {
        self.final_size
    }
}

impl From<&ResetStreamFrame> for ResetStreamError {
    fn from(frame: &ResetStreamFrame) -> Self {
        Self::new(frame.app_error_code, frame.final_size)
    }
}

impl GetFrameType for ResetStreamFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::ResetStream
    }
}

/// STOP_SENDING frame, asks the peer to abandon its sending part of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    stream_id: StreamId,
    app_err_code: u64,
}

impl StopSendingFrame {
    pub fn new(stream_id: StreamId, app_err_code: u64) -> Self {
        Self {
            stream_id,
            app_err_code,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn app_err_code(&self) -> u64 {
        self.app_err_code
    }
}

impl GetFrameType for StopSendingFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::StopSending
    }
}

/// MAX_DATA frame, raises the connection-level send window of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub max_data: u64,
}

impl GetFrameType for MaxDataFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MaxData
    }
}

/// DATA_BLOCKED frame, tells the peer that sending is blocked by the connection window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub limit: u64,
}

impl GetFrameType for DataBlockedFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::DataBlocked
    }
}

/// MAX_STREAM_DATA frame, raises the send window of one stream of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    stream_id: StreamId,
    max_stream_data: u64,
}

impl MaxStreamDataFrame {
    pub fn new(stream_id: StreamId, max_stream_data: u64) -> Self {
        Self {
            stream_id,
            max_stream_data,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }
}

impl GetFrameType for MaxStreamDataFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MaxStreamData
    }
}

/// STREAM_DATA_BLOCKED frame, tells the peer that a stream is blocked by its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    stream_id: StreamId,
    maximum_stream_data: u64,
}

impl StreamDataBlockedFrame {
    pub fn new(stream_id: StreamId, maximum_stream_data: u64) -> Self {
        Self {
            stream_id,
            maximum_stream_data,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn maximum_stream_data(&self) -> u64 {
        self.maximum_stream_data
    }
}

impl GetFrameType for StreamDataBlockedFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::StreamDataBlocked
    }
}

/// MAX_STREAMS frame, raises the number of streams of one direction the peer may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStreamsFrame {
    Bi(u64),
    Uni(u64),
}

impl MaxStreamsFrame {
    pub fn with(dir: Dir, max_streams: u64) -> Self {
        match dir {
            Dir::Bi => Self::Bi(max_streams),
            Dir::Uni => Self::Uni(max_streams),
        }
    }

    pub fn dir(&self) -> Dir {
        match self {
            Self::Bi(_) => Dir::Bi,
            Self::Uni(_) => Dir::Uni,
        }
    }

    pub fn max_streams(&self) -> u64 {
        match self {
            Self::Bi(max) | Self::Uni(max) => *max,
        }
    }
}

impl GetFrameType for MaxStreamsFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MaxStreams(self.dir())
    }
}

/// STREAMS_BLOCKED frame, tells the peer that opening streams is blocked by its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamsBlockedFrame {
    Bi(u64),
    Uni(u64),
}

impl StreamsBlockedFrame {
    pub fn with(dir: Dir, max_streams: u64) -> Self {
        match dir {
            Dir::Bi => Self::Bi(max_streams),
            Dir::Uni => Self::Uni(max_streams),
        }
    }

    pub fn dir(&self) -> Dir {
        match self {
            Self::Bi(_) => Dir::Bi,
            Self::Uni(_) => Dir::Uni,
        }
    }

    pub fn max_streams(&self) -> u64 {
        match self {
            Self::Bi(max) | Self::Uni(max) => *max,
        }
    }
}

impl GetFrameType for StreamsBlockedFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::StreamsBlocked(self.dir())
    }
}

/// Control frames scoped to streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, From)]
pub enum StreamCtlFrame {
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    MaxStreamData(MaxStreamDataFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    MaxStreams(MaxStreamsFrame),
    StreamsBlocked(StreamsBlockedFrame),
}

impl GetFrameType for StreamCtlFrame {
    fn frame_type(&self) -> FrameType {
        match self {
            StreamCtlFrame::ResetStream(f) => f.frame_type(),
            StreamCtlFrame::StopSending(f) => f.frame_type(),
            StreamCtlFrame::MaxStreamData(f) => f.frame_type(),
            StreamCtlFrame::StreamDataBlocked(f) => f.frame_type(),
            StreamCtlFrame::MaxStreams(f) => f.frame_type(),
            StreamCtlFrame::StreamsBlocked(f) => f.frame_type(),
        }
    }
}

/// Every control frame the stream layer asks the packet layer to deliver reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, From)]
pub enum ReliableFrame {
    Stream(StreamCtlFrame),
    MaxData(MaxDataFrame),
    DataBlocked(DataBlockedFrame),
}

macro_rules! impl_into_reliable {
    ($($frame:ty),*) => {
        $(
            impl From<$frame> for ReliableFrame {
                fn from(frame: $frame) -> Self {
                    ReliableFrame::Stream(frame.into())
                }
            }
        )*
    };
}

impl_into_reliable!(
    ResetStreamFrame,
    StopSendingFrame,
    MaxStreamDataFrame,
    StreamDataBlockedFrame,
    MaxStreamsFrame,
    StreamsBlockedFrame
);

impl GetFrameType for ReliableFrame {
    fn frame_type(&self) -> FrameType {
        match self {
            ReliableFrame::Stream(f) => f.frame_type(),
            ReliableFrame::MaxData(f) => f.frame_type(),
            ReliableFrame::DataBlocked(f) => f.frame_type(),
        }
    }
}

/// The sending end of frames the stream layer wants delivered to the peer.
///
/// It can be a channel, a queue, or a buffer, as long as the frames are
/// eventually handed to the packet layer.
pub trait SendFrame<T> {
    /// Need send the frames to the peer
    fn send_frame<I: IntoIterator<Item = T>>(&self, iter: I);
}
