use bytes::Bytes;
use qbase::{
    error::Error,
    frame::{ResetStreamFrame, StreamFrame},
};

use super::recver::ArcRecver;

/// The protocol side of a receiving half, fed with the frames from peer.
#[derive(Debug, Clone)]
pub struct Incoming(ArcRecver);

impl Incoming {
    pub(crate) fn new(recver: ArcRecver) -> Self {
        Self(recver)
    }

    /// Receive a STREAM frame, returns whether the half became terminal.
    ///
    /// Frames arriving after the connection failed are ignored.
    pub fn recv_data(&self, frame: &StreamFrame, body: Bytes) -> Result<bool, Error> {
        match self.0.recver().as_mut() {
            Ok(recver) => recver.recv_data(frame, body),
            Err(_) => Ok(false),
        }
    }

    /// Receive a RESET_STREAM frame, returns whether the half became terminal.
    pub fn recv_reset(&self, frame: &ResetStreamFrame) -> Result<bool, Error> {
        match self.0.recver().as_mut() {
            Ok(recver) => recver.recv_reset(frame),
            Err(_) => Ok(false),
        }
    }

    /// Abandon the half from the protocol side, returns whether it became terminal.
    pub fn stop(&self, error_code: u64) -> bool {
        match self.0.recver().as_mut() {
            Ok(recver) => recver.stop(error_code),
            Err(_) => false,
        }
    }

    /// Take the MAX_STREAM_DATA limit waiting to be advertised to the peer, if any.
    pub fn take_window_update(&self) -> Option<u64> {
        self.0.recver().as_mut().ok()?.take_window_update()
    }

    pub fn on_conn_error(&self, error: &Error) {
        self.0.on_conn_error(error);
    }
}
