//! The stream multiplexing and flow control engine of QUIC.
//!
//! Many independent, ordered, reliable byte streams share one connection.
//! Each stream is either bidirectional or unidirectional, and may be opened by either endpoint.
//! The engine bounds how much data the peer may send at the stream level and at the
//! connection level, and how many streams the peer may open, advertising more credit as the
//! application consumes data and as streams end.
//!
//! The engine is transport agnostic: the packet layer feeds it the frames it received,
//! pulls the STREAM frames and the control frames to send, and reports acknowledgements.
//! Retransmission stays the business of the packet layer.
//!
//! ```rust, ignore
//! let streams = DataStreams::new(Role::Client, &local_params, &peer_params);
//! let (sid, (reader, writer)) = streams.open_bi_stream().await?;
//!
//! // in the packet layer
//! while let Some((frame, body)) = streams.try_read_data(1200) {
//!     packet.put_stream_frame(frame, body);
//! }
//! for frame in streams.fetch_control_frames() {
//!     packet.put_reliable_frame(frame);
//! }
//! ```
pub mod interrupt;
pub mod recv;
pub mod send;
pub mod streams;

pub use streams::{
    AcceptBiStream, AcceptUniStream, DataStreams, OpenBiStream, OpenUniStream, ReceiveStream,
    Sendable, StreamError, TransmitStream, WindowScope,
};

/// The queue of control frames produced by the streams, waiting for the packet layer.
pub type FrameQueue = qbase::util::ArcAsyncDeque<qbase::frame::ReliableFrame>;
