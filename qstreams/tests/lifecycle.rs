use std::time::Duration;

use qbase::{
    error::{Error, ErrorKind},
    frame::{ResetStreamError, StreamFrame},
    param::StreamParameters,
    role::Role,
    sid::{Dir, StreamId},
};
use qstreams::{
    StreamError, TransmitStream,
    interrupt::{with_cancel, with_deadline},
};
use rand::{Rng, seq::SliceRandom};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

mod common;
use common::*;

#[tokio::test]
async fn out_of_order_delivery() {
    init_tracing();
    let params = StreamParameters::default();
    let (client, server) = connect(&params, &params);
    let mut rng = rand::rng();
    let data = (0..64 * 1024).map(|_| rng.random::<u8>()).collect::<Vec<_>>();

    let (sid, mut writer) = client.try_open_uni_stream().unwrap();
    writer.write_all(&data).await.unwrap();
    writer.close().unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = client.try_read_data(137) {
        frames.push(frame);
    }
    // duplicates, as retransmissions would bring
    let duplicates = frames[..frames.len() / 3].to_vec();
    frames.extend(duplicates);
    frames.shuffle(&mut rng);

    for (frame, body) in &frames {
        server.recv_data(frame, body.clone()).unwrap();
        client.on_data_acked(frame);
    }
    let (accepted, mut reader) = server.accept_uni_stream().await.unwrap();
    assert_eq!(accepted, sid);
    let mut received = Vec::new();
    reader.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, data);

    // everything acknowledged, the writer is done
    writer.shutdown().await.unwrap();
}

#[tokio::test]
async fn idempotent_close() {
    let params = StreamParameters::default();
    let (client, _server) = connect(&params, &params);
    let (sid, mut writer) = client.try_open_uni_stream().unwrap();
    writer.write_all(b"fin").await.unwrap();
    writer.close().unwrap();
    writer.close().unwrap();
    assert_eq!(
        writer.write_all(b"more").await.map_err(|e| StreamError::from_io(&e).cloned()),
        Err(Some(StreamError::Closed))
    );

    let (frame, _) = client.try_read_data(MAX_DATAGRAM).unwrap();
    assert_eq!(frame, StreamFrame::new(sid, 0, 3).with_fin(true));
    assert_eq!(client.try_read_data(MAX_DATAGRAM), None);
    writer.close().unwrap();
    assert_eq!(client.try_read_data(MAX_DATAGRAM), None);
    assert!(client.fetch_control_frames().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_does_not_affect_siblings() {
    init_tracing();
    let params = StreamParameters::default();
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());

    let (sid_a, mut a) = client.open_uni_stream().await.unwrap();
    let (sid_b, mut b) = client.open_uni_stream().await.unwrap();
    a.write_all(&[1; 5000]).await.unwrap();
    b.write_all(&[2; 5000]).await.unwrap();
    a.reset(9);
    b.write_all(&[2; 5000]).await.unwrap();
    b.shutdown().await.unwrap();

    let (accepted_a, mut reader_a) = server.accept_uni_stream().await.unwrap();
    let (accepted_b, mut reader_b) = server.accept_uni_stream().await.unwrap();
    assert_eq!((accepted_a, accepted_b), (sid_a, sid_b));

    let mut received = Vec::new();
    let error = reader_a.read_to_end(&mut received).await.unwrap_err();
    assert_eq!(
        StreamError::from_io(&error),
        Some(&StreamError::Reset(ResetStreamError::new(9, 5000)))
    );

    let mut received = Vec::new();
    reader_b.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, vec![2; 10000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_sending_resets_the_writer() {
    let params = StreamParameters::default();
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());

    let (_sid, (_reader, mut writer)) = client.open_bi_stream().await.unwrap();
    writer.write_all(b"hello").await.unwrap();
    let (_sid, (mut reader, _writer)) = server.accept_bi_stream().await.unwrap();
    reader.stop(5);
    let mut buf = [0; 16];
    let error = reader.read(&mut buf).await.unwrap_err();
    assert_eq!(
        StreamError::from_io(&error),
        Some(&StreamError::Reset(ResetStreamError::new(5, 0)))
    );

    let error = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Err(e) = writer.write_all(b"world").await {
                break e;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        StreamError::from_io(&error),
        Some(StreamError::Reset(e)) if e.error_code() == 5
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_bound_and_accept_order() {
    let params = StreamParameters::builder()
        .initial_max_streams_bidi(3)
        .build()
        .unwrap();
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());

    let mut streams = Vec::new();
    for _ in 0..3 {
        let (sid, (reader, mut writer)) = client.try_open_bi_stream().unwrap();
        writer.write_all(sid.id().to_string().as_bytes()).await.unwrap();
        streams.push((sid, reader, writer));
    }
    assert_eq!(
        client.try_open_bi_stream().unwrap_err(),
        StreamError::LimitReached(Dir::Bi)
    );

    let mut accepted = Vec::new();
    for (id, (sid, _, _)) in streams.iter().enumerate() {
        let (accepted_sid, stream) = server.accept_bi_stream().await.unwrap();
        assert_eq!(accepted_sid, *sid);
        assert_eq!(accepted_sid.id(), id as u64);
        accepted.push(stream);
    }

    // one more stream is allowed only once one of them ends
    let open = tokio::spawn({
        let client = client.clone();
        async move { client.open_bi_stream().await.map(|(sid, _)| sid) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!open.is_finished());

    let (_, mut reader, mut writer) = streams.remove(0);
    writer.reset(0);
    reader.stop(0);
    // the server ends its side once it observed the reset
    let (mut server_reader, _server_writer) = accepted.remove(0);
    let mut buf = Vec::new();
    assert!(server_reader.read_to_end(&mut buf).await.is_err());
    let opened = tokio::time::timeout(Duration::from_secs(5), open)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(opened, StreamId::new(Role::Client, Dir::Bi, 3));
}

#[tokio::test(start_paused = true)]
async fn deadline_and_cancellation() {
    let params = StreamParameters::builder()
        .initial_max_streams_uni(0)
        .build()
        .unwrap();
    let (client, server) = connect(&params, &params);

    let deadline = Instant::now() + Duration::from_secs(1);
    let result = with_deadline(client.open_uni_stream(), deadline).await;
    assert_eq!(result.unwrap_err(), StreamError::DeadlineExceeded);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });
    let result = with_cancel(server.accept_bi_stream(), &token).await;
    assert!(matches!(result, Err(StreamError::Cancelled)));

    // the interrupted calls left nothing behind
    assert_eq!(
        client.try_open_uni_stream().unwrap_err(),
        StreamError::LimitReached(Dir::Uni)
    );
    let (sid, _stream) = client.try_open_bi_stream().unwrap();
    assert_eq!(sid.id(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_close_wakes_everyone() {
    let params = StreamParameters::builder()
        .initial_max_streams_uni(0)
        .build()
        .unwrap();
    let (client, server) = connect(&params, &params);

    let (_sid, (mut reader, _writer)) = client.try_open_bi_stream().unwrap();
    let read = tokio::spawn(async move {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await
    });
    let open = tokio::spawn({
        let client = client.clone();
        async move { client.open_uni_stream().await.map(|(sid, _)| sid) }
    });
    let accept = tokio::spawn({
        let server = server.clone();
        async move { server.accept_bi_stream().await.map(|(sid, _)| sid) }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close(7, "done");
    server.on_conn_error(&Error::app_close(7, "done"));

    let error = read.await.unwrap().unwrap_err();
    let Some(StreamError::Connection(error)) = StreamError::from_io(&error) else {
        panic!("the reader should fail with the connection error");
    };
    assert_eq!(error.kind(), ErrorKind::Application(7));
    assert_eq!(
        open.await.unwrap().unwrap_err(),
        StreamError::Connection(Error::app_close(7, "done"))
    );
    assert!(matches!(
        accept.await.unwrap(),
        Err(StreamError::Connection(e)) if e.kind() == ErrorKind::Application(7)
    ));
}
