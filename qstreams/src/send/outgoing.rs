use bytes::Bytes;
use qbase::{error::Error, frame::StreamFrame};

use super::sender::ArcSender;

/// The protocol side of a sending half, drained by the packetizer and driven by acknowledgements.
#[derive(Debug, Clone)]
pub struct Outgoing(ArcSender);

impl Outgoing {
    pub(crate) fn new(sender: ArcSender) -> Self {
        Self(sender)
    }

    /// Pick up the next STREAM frame carrying at most `max_len` bytes, if there is anything to send.
    pub fn pick_up(&self, max_len: usize) -> Option<(StreamFrame, Bytes)> {
        self.0.sender().as_mut().ok()?.pick_up(max_len)
    }

    /// Returns whether the half became terminal.
    pub fn on_data_acked(&self, frame: &StreamFrame) -> bool {
        match self.0.sender().as_mut() {
            Ok(sender) => sender.on_data_acked(frame),
            Err(_) => false,
        }
    }

    /// Returns whether the half became terminal.
    pub fn on_reset_acked(&self) -> bool {
        match self.0.sender().as_mut() {
            Ok(sender) => sender.on_reset_acked(),
            Err(_) => false,
        }
    }

    pub fn update_window(&self, max_stream_data: u64) {
        if let Ok(sender) = self.0.sender().as_mut() {
            sender.update_window(max_stream_data);
        }
    }

    /// Reset the half with `error_code`, returns whether it was reset now.
    pub fn reset(&self, error_code: u64) -> bool {
        match self.0.sender().as_mut() {
            Ok(sender) => sender.reset(error_code),
            Err(_) => false,
        }
    }

    /// The peer is no longer interested in the data, answer with a RESET_STREAM of the same code.
    pub fn be_stopped(&self, error_code: u64) {
        if let Ok(sender) = self.0.sender().as_mut() {
            if sender.reset(error_code) {
                tracing::debug!(
                    "{} is stopped by peer with error code {error_code}",
                    sender.stream_id()
                );
            }
        }
    }

    pub fn on_conn_error(&self, error: &Error) {
        self.0.on_conn_error(error);
    }
}
