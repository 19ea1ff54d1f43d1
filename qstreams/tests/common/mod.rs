#![allow(dead_code)]

use std::time::Duration;

use qbase::{
    frame::{ReliableFrame, StreamCtlFrame},
    param::StreamParameters,
    role::Role,
};
use qstreams::{DataStreams, ReceiveStream, TransmitStream};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const MAX_DATAGRAM: usize = 1200;

pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two engines facing each other, each built from its own parameters and the ones of its peer.
pub fn connect(
    client_params: &StreamParameters,
    server_params: &StreamParameters,
) -> (DataStreams, DataStreams) {
    (
        DataStreams::new(Role::Client, client_params, server_params),
        DataStreams::new(Role::Server, server_params, client_params),
    )
}

/// Move one batch of frames from `from` to `to`, acknowledging everything delivered.
///
/// Returns whether anything moved, or `None` once `to` failed the connection.
pub fn deliver(from: &DataStreams, to: &DataStreams) -> Option<bool> {
    let mut moved = false;
    for frame in from.fetch_control_frames() {
        moved = true;
        to.recv_frame(&frame).ok()?;
        if let ReliableFrame::Stream(StreamCtlFrame::ResetStream(reset)) = frame {
            from.on_reset_acked(reset.stream_id());
        }
    }
    for _ in 0..64 {
        let Some((frame, body)) = from.try_read_data(MAX_DATAGRAM) else {
            break;
        };
        moved = true;
        ReceiveStream::recv_data(to, &frame, body).ok()?;
        TransmitStream::on_data_acked(from, &frame);
    }
    Some(moved)
}

/// Keep delivering frames in both directions, like a lossless network would.
pub fn spawn_pump(client: DataStreams, server: DataStreams) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (Some(upward), Some(downward)) =
                (deliver(&client, &server), deliver(&server, &client))
            else {
                tracing::warn!("pump stopped by a connection error");
                return;
            };
            if upward || downward {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    })
}
