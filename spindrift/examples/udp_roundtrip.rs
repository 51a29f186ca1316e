//! A single datagram round trip over loopback.
//!
//! Run with `cargo run --example udp_roundtrip`.

use std::time::Duration;

use spindrift::prelude::*;

fn main() -> spindrift::Result<()> {
    spindrift::dev_tracing::init_tracing();

    let engine = Engine::new(EngineConfig::new().with_worker_count(1))?;

    let first = engine.create_datagram_socket(&DatagramSocketOptions::new())?;
    first.bind(&Endpoint::parse("127.0.0.1:0")?, false)?;

    let second = engine.create_datagram_socket(&DatagramSocketOptions::new())?;
    second.bind(&Endpoint::parse("127.0.0.1:0")?, false)?;
    let target = second.source_endpoint()?;

    let (receive_tx, receive_rx) = flume::bounded(1);
    second.receive(
        ReceiveOptions::new(),
        Box::new(move |result| {
            let _ = receive_tx.send(result);
        }),
    )?;

    let (send_tx, send_rx) = flume::bounded(1);
    first.send_to(
        SendPayload::from(Bytes::from_static(b"ping")),
        &target,
        SendOptions::new(),
        Box::new(move |result| {
            let _ = send_tx.send(result);
        }),
    )?;
    send_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("send timed out")?;

    let (bytes, context) = receive_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("receive timed out")?;
    println!(
        "received {:?} from {:?}",
        String::from_utf8_lossy(&bytes),
        context.endpoint
    );

    engine.shutdown();
    Ok(())
}
