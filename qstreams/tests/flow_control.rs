use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::task::{ArcWake, noop_waker_ref, waker};
use qbase::{
    error::ErrorKind,
    frame::{DataBlockedFrame, MaxDataFrame, ReliableFrame, StreamFrame},
    param::StreamParameters,
    role::Role,
    sid::{Dir, StreamId},
};
use qstreams::{ReceiveStream, StreamError, TransmitStream, WindowScope};

mod common;
use common::*;

#[derive(Default)]
struct WakeFlag(AtomicBool);

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

const W: u64 = 1000;

fn params() -> StreamParameters {
    StreamParameters::builder()
        .initial_max_data(W)
        .initial_max_stream_data_bidi_local(4 * W)
        .initial_max_stream_data_bidi_remote(4 * W)
        .initial_max_stream_data_uni(4 * W)
        .auto_tune(false)
        .build()
        .unwrap()
}

#[test]
fn write_blocks_on_connection_window() {
    let (client, _server) = connect(&params(), &params());
    let (_sid, mut writer) = client.try_open_uni_stream().unwrap();
    let flag = Arc::new(WakeFlag::default());
    let waker = waker(flag.clone());
    let mut cx = Context::from_waker(&waker);

    let data = vec![7u8; 2 * W as usize];
    assert_eq!(writer.poll_send(&mut cx, &data), Poll::Ready(Ok(W as usize)));
    assert!(writer.poll_send(&mut cx, &data[W as usize..]).is_pending());
    assert!(!flag.0.load(Ordering::SeqCst));
    assert_eq!(
        client.fetch_control_frames(),
        vec![ReliableFrame::from(DataBlockedFrame { limit: W })]
    );

    // a smaller limit grants nothing
    client
        .recv_frame(&MaxDataFrame { max_data: W / 2 }.into())
        .unwrap();
    assert!(!flag.0.load(Ordering::SeqCst));

    client
        .recv_frame(&MaxDataFrame { max_data: 2 * W }.into())
        .unwrap();
    assert!(flag.0.load(Ordering::SeqCst));
    assert_eq!(
        writer.poll_send(&mut cx, &data[W as usize..]),
        Poll::Ready(Ok(W as usize))
    );
    writer.reset(0);
}

#[test]
fn connection_credit_is_never_double_counted() {
    let (client, _server) = connect(&params(), &params());
    let mut cx = Context::from_waker(noop_waker_ref());
    let mut writers = (0..4)
        .map(|_| client.try_open_bi_stream().unwrap().1.1)
        .collect::<Vec<_>>();

    let mut accepted = 0;
    for _ in 0..3 {
        for writer in &mut writers {
            if let Poll::Ready(Ok(n)) = writer.poll_send(&mut cx, &[1; 300]) {
                accepted += n as u64;
            }
        }
    }
    assert_eq!(accepted, W);

    client.update_send_window(WindowScope::Connection, W + 100);
    for writer in &mut writers {
        if let Poll::Ready(Ok(n)) = writer.poll_send(&mut cx, &[1; 300]) {
            accepted += n as u64;
        }
    }
    assert_eq!(accepted, W + 100);

    let sent = client
        .sendable(MAX_DATAGRAM)
        .map(|(frame, _)| frame.len() as u64)
        .sum::<u64>();
    assert_eq!(sent, W + 100);
    writers.iter_mut().for_each(|writer| writer.reset(0));
}

#[test]
fn stream_window_blocks_independently() {
    let params = StreamParameters::builder()
        .initial_max_stream_data_uni(100)
        .build()
        .unwrap();
    let (client, _server) = connect(&params, &params);
    let mut cx = Context::from_waker(noop_waker_ref());
    let (sid_a, mut a) = client.try_open_uni_stream().unwrap();
    let (_, mut b) = client.try_open_uni_stream().unwrap();

    assert_eq!(a.poll_send(&mut cx, &[0; 150]), Poll::Ready(Ok(100)));
    assert!(a.poll_send(&mut cx, &[0; 50]).is_pending());
    // the other stream is not affected by the blocked one
    assert_eq!(b.poll_send(&mut cx, &[0; 80]), Poll::Ready(Ok(80)));

    client.update_send_window(WindowScope::Stream(sid_a), 150);
    assert_eq!(a.poll_send(&mut cx, &[0; 50]), Poll::Ready(Ok(50)));
    a.reset(0);
    b.reset(0);
}

#[test]
fn exceeding_the_advertised_window() {
    let (_client, server) = connect(&params(), &params());
    let sid = StreamId::new(Role::Client, Dir::Uni, 0);
    // within the stream window, beyond the connection window
    let frame = StreamFrame::new(sid, 0, (W + 1) as usize);
    let error = server
        .recv_data(&frame, vec![0; (W + 1) as usize].into())
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::FlowControl);

    let error = StreamError::from(error);
    assert!(matches!(
        futures::executor::block_on(server.accept_uni_stream()),
        Err(e) if e == error
    ));
}

#[test]
fn read_releases_credit() {
    let params = params();
    let (client, server) = connect(&params, &params);
    let mut cx = Context::from_waker(noop_waker_ref());
    let (sid, mut writer) = client.try_open_uni_stream().unwrap();
    assert_eq!(writer.poll_send(&mut cx, &vec![1; W as usize]), Poll::Ready(Ok(W as usize)));
    while deliver(&client, &server).unwrap() {}

    let (_, mut reader) = futures::executor::block_on(server.accept_uni_stream()).unwrap();
    assert_eq!(server.pending_window_update(WindowScope::Connection), None);
    let mut buf = Vec::with_capacity(W as usize);
    assert_eq!(reader.poll_recv(&mut cx, &mut buf), Poll::Ready(Ok(())));
    assert_eq!(buf.len(), W as usize);

    // beyond half of the window consumed, the credit is given back
    let update = server.pending_window_update(WindowScope::Connection);
    assert_eq!(update, Some(2 * W));
    assert_eq!(server.pending_window_update(WindowScope::Connection), None);
    // a quarter of the stream window consumed is not worth an update yet
    assert_eq!(server.pending_window_update(WindowScope::Stream(sid)), None);

    client.update_send_window(WindowScope::Connection, update.unwrap());
    assert_eq!(writer.poll_send(&mut cx, &[1; 10]), Poll::Ready(Ok(10)));
    writer.reset(0);
}

#[test]
fn offset_beyond_the_offset_space() {
    let (_client, server) = connect(&params(), &params());
    let sid = StreamId::new(Role::Client, Dir::Uni, 0);
    let frame = StreamFrame::new(sid, u64::MAX - 1, 4);
    let error = server.recv_data(&frame, vec![0; 4].into()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::FlowControl);

    // the engine failed cleanly, later frames and calls observe the error
    let frame = StreamFrame::new(sid, 0, 4);
    assert_eq!(server.recv_data(&frame, vec![0; 4].into()), Ok(()));
    assert!(matches!(
        server.try_open_uni_stream(),
        Err(StreamError::Connection(e)) if e.kind() == ErrorKind::FlowControl
    ));
}
