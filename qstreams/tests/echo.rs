use std::time::Duration;

use qbase::param::StreamParameters;
use qstreams::DataStreams;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    task::JoinSet,
};

mod common;
use common::*;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn payload(i: usize) -> Vec<u8> {
    (0..25 * i).map(|n| (n % 251) as u8 ^ i as u8).collect()
}

fn launch_echo_server(server: DataStreams) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((sid, (mut reader, mut writer))) = server.accept_bi_stream().await {
            tokio::spawn(async move {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                writer.write_all(&data).await?;
                writer.shutdown().await?;
                tracing::debug!("{sid} echoed {} bytes", data.len());
                Ok::<_, std::io::Error>(())
            });
        }
    })
}

async fn send_and_verify_echo(
    client: DataStreams,
    streams: usize,
) -> Result<(), BoxError> {
    let mut tasks = JoinSet::new();
    for i in 0..streams {
        let client = client.clone();
        tasks.spawn(async move {
            let (_sid, (mut reader, mut writer)) = client.open_bi_stream().await?;
            let data = payload(i);
            writer.write_all(&data).await?;
            writer.shutdown().await?;

            let mut echo = Vec::new();
            reader.read_to_end(&mut echo).await?;
            assert_eq!(echo, data, "stream {i} got a corrupted echo");
            Ok::<_, BoxError>(())
        });
    }
    while let Some(result) = tasks.join_next().await {
        result??;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bi_streams() -> Result<(), BoxError> {
    init_tracing();
    let params = StreamParameters::builder()
        .initial_max_streams_bidi(300)
        .build()?;
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());
    let _server = launch_echo_server(server);

    tokio::time::timeout(Duration::from_secs(30), send_and_verify_echo(client, 300)).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_opens_bi_streams() -> Result<(), BoxError> {
    init_tracing();
    let params = StreamParameters::builder()
        .initial_max_streams_bidi(300)
        .build()?;
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());
    let _client = launch_echo_server(client);

    tokio::time::timeout(Duration::from_secs(30), send_and_verify_echo(server, 300)).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn both_sides_open_bi_streams() -> Result<(), BoxError> {
    init_tracing();
    // each side opens more streams than the other allows at once
    let params = StreamParameters::builder()
        .initial_max_streams_bidi(50)
        .build()?;
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());
    let _client = launch_echo_server(client.clone());
    let _server = launch_echo_server(server.clone());

    tokio::time::timeout(Duration::from_secs(30), async {
        tokio::try_join!(
            send_and_verify_echo(client, 300),
            send_and_verify_echo(server, 300)
        )
    })
    .await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn more_streams_than_the_limit() -> Result<(), BoxError> {
    init_tracing();
    // the server raises the limit each time one of the streams ends
    let params = StreamParameters::builder()
        .initial_max_streams_bidi(8)
        .build()?;
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());
    let _server = launch_echo_server(server);

    tokio::time::timeout(Duration::from_secs(30), send_and_verify_echo(client, 60)).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_windows() -> Result<(), BoxError> {
    init_tracing();
    let params = StreamParameters::builder()
        .initial_max_data(4096)
        .initial_max_stream_data_bidi_local(1500)
        .initial_max_stream_data_bidi_remote(1500)
        .initial_max_stream_data_uni(1500)
        .auto_tune(false)
        .build()?;
    let (client, server) = connect(&params, &params);
    let _pump = spawn_pump(client.clone(), server.clone());

    let data = (0..100_000u32).map(|n| n as u8).collect::<Vec<_>>();
    let expected = data.clone();
    let sender = tokio::spawn(async move {
        let (_sid, mut writer) = client.open_uni_stream().await?;
        writer.write_all(&data).await?;
        writer.shutdown().await?;
        Ok::<_, BoxError>(())
    });

    let (_sid, mut reader) = server.accept_uni_stream().await?;
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut received)).await??;
    assert_eq!(received, expected);
    sender.await??;
    Ok(())
}
