//! The streams of a connection, and the frames the packet layer exchanges with them.
//!
//! [`DataStreams`] owns the sending and receiving halves of every stream,
//! creates the streams the peer opens, and keeps the connection-level flow control.
//! The packet layer drives it through [`TransmitStream`] and [`ReceiveStream`].
use bytes::Bytes;
use qbase::{
    error::Error,
    frame::{ReliableFrame, StreamFrame},
    sid::StreamId,
};

mod data;
mod error;
mod io;
mod listener;

pub use data::{DataStreams, OpenBiStream, OpenUniStream, Sendable};
pub use error::StreamError;
pub(crate) use io::IOState;
pub use listener::{AcceptBiStream, AcceptUniStream};

/// The scope of a flow control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowScope {
    /// The window shared by all streams of the connection.
    Connection,
    /// The window of a single stream.
    Stream(StreamId),
}

/// The sending side of the streams, as seen by the packet layer.
pub trait TransmitStream {
    /// Pick up a STREAM frame carrying at most `max_len` bytes, if any stream has data to send.
    fn try_read_data(&self, max_len: usize) -> Option<(StreamFrame, Bytes)>;

    /// The peer acknowledged the STREAM frame.
    fn on_data_acked(&self, frame: &StreamFrame);

    /// The peer acknowledged the RESET_STREAM frame of the stream.
    fn on_reset_acked(&self, sid: StreamId);
}

/// The receiving side of the streams, as seen by the packet layer.
pub trait ReceiveStream {
    /// Deliver a STREAM frame and its body.
    fn recv_data(&self, frame: &StreamFrame, body: Bytes) -> Result<(), Error>;

    /// Deliver a flow control or stream control frame.
    fn recv_frame(&self, frame: &ReliableFrame) -> Result<(), Error>;

    /// The connection failed, or was closed.
    fn on_conn_error(&self, error: &Error);
}

impl TransmitStream for DataStreams {
    fn try_read_data(&self, max_len: usize) -> Option<(StreamFrame, Bytes)> {
        self.next_sendable(max_len)
    }

    fn on_data_acked(&self, frame: &StreamFrame) {
        DataStreams::on_data_acked(self, frame)
    }

    fn on_reset_acked(&self, sid: StreamId) {
        DataStreams::on_reset_acked(self, sid)
    }
}

impl ReceiveStream for DataStreams {
    fn recv_data(&self, frame: &StreamFrame, body: Bytes) -> Result<(), Error> {
        DataStreams::recv_data(self, frame, body)
    }

    fn recv_frame(&self, frame: &ReliableFrame) -> Result<(), Error> {
        match frame {
            ReliableFrame::Stream(frame) => self.recv_stream_control(frame),
            ReliableFrame::MaxData(frame) => {
                self.recv_max_data(frame);
                Ok(())
            }
            ReliableFrame::DataBlocked(frame) => {
                self.recv_data_blocked(frame);
                Ok(())
            }
        }
    }

    fn on_conn_error(&self, error: &Error) {
        DataStreams::on_conn_error(self, error)
    }
}
