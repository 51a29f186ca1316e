//! A minimal TCP echo exchange over loopback.
//!
//! Run with `cargo run --example tcp_echo`.

use std::time::Duration;

use spindrift::prelude::*;

fn main() -> spindrift::Result<()> {
    spindrift::dev_tracing::init_tracing();

    let engine = Engine::new(EngineConfig::new().with_worker_count(2))?;

    let listener = engine.create_listener_socket(&ListenerSocketOptions::new())?;
    listener.bind(&Endpoint::parse("127.0.0.1:0")?, false)?;
    listener.listen(8)?;
    let endpoint = listener.source_endpoint()?;
    println!("listening on {endpoint}");

    // The accepted side echoes the first line it receives.
    let (accept_tx, accept_rx) = flume::bounded(1);
    listener.accept(
        AcceptOptions::new(),
        Box::new(move |result| {
            let _ = accept_tx.send(result.map(|(stream, context)| {
                println!("accepted {:?}", context.remote_endpoint);
                stream
            }));
        }),
    )?;

    let client = engine.create_stream_socket(StreamSocketOptions::new())?;
    let (connect_tx, connect_rx) = flume::bounded(1);
    client.connect(
        &endpoint,
        ConnectOptions::new(),
        Box::new(move |result| {
            let _ = connect_tx.send(result);
        }),
    )?;
    connect_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("connect timed out")?;
    let server = accept_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("accept timed out")?;

    let (sent_tx, sent_rx) = flume::bounded(1);
    client.send(
        SendPayload::from(Bytes::from_static(b"hello over spindrift\n")),
        SendOptions::new(),
        Box::new(move |result| {
            let _ = sent_tx.send(result);
        }),
    )?;
    sent_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("send timed out")?;

    let (echo_tx, echo_rx) = flume::bounded(1);
    server.receive(
        ReceiveOptions::new(),
        Box::new(move |result| {
            let _ = echo_tx.send(result);
        }),
    )?;
    let (bytes, context) = echo_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("receive timed out")?;
    println!(
        "server received {} bytes: {:?}",
        context.bytes_transferred,
        String::from_utf8_lossy(&bytes)
    );

    client.shutdown(ShutdownDirection::Both)?;
    engine.shutdown();
    Ok(())
}
