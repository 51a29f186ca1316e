//! Edge-triggered write queue watermark events.

use std::sync::Arc;
use std::time::Duration;

use spindrift::flow::FlowControlDirection;
use spindrift::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(10);

fn connected_pair(
    engine: &Engine,
    client_options: StreamSocketOptions,
) -> (Arc<StreamSocket>, Arc<StreamSocket>) {
    let listener = engine
        .create_listener_socket(&ListenerSocketOptions::new())
        .unwrap();
    listener
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();
    listener.listen(1).unwrap();
    let endpoint = listener.source_endpoint().unwrap();

    let (accept_tx, accept_rx) = flume::bounded(1);
    listener
        .accept(
            AcceptOptions::new(),
            Box::new(move |result| {
                let _ = accept_tx.send(result.map(|(stream, _context)| stream));
            }),
        )
        .unwrap();

    let client = engine.create_stream_socket(client_options).unwrap();
    let (connect_tx, connect_rx) = flume::bounded(1);
    client
        .connect(
            &endpoint,
            ConnectOptions::new(),
            Box::new(move |result| {
                let _ = connect_tx.send(result);
            }),
        )
        .unwrap();
    connect_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    let server = accept_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    (client, server)
}

fn drain_write_queue_events(
    monitor: &SocketMonitor,
    wait: Duration,
) -> Vec<QueueEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = monitor.recv_timeout(wait) {
        if let SocketEvent::WriteQueue(queue_event) = event {
            kinds.push(queue_event.kind);
        }
    }
    kinds
}

#[test]
fn watermark_edges_fire_once_per_crossing() {
    spindrift::dev_tracing::init_tracing();
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();

    let options = StreamSocketOptions::new().with_write_queue_watermarks(0, 4);
    let (client, _server) = connected_pair(&engine, options);
    let monitor = client.monitor();

    // Hold the sends in the queue.
    client.apply_flow_control(FlowControlDirection::Send).unwrap();

    let (send_tx, send_rx) = flume::unbounded();
    for byte in [1u8, 2, 3, 4] {
        let send_tx = send_tx.clone();
        client
            .send(
                SendPayload::from(Bytes::copy_from_slice(&[byte])),
                SendOptions::new(),
                Box::new(move |result| {
                    let _ = send_tx.send(result);
                }),
            )
            .unwrap();
    }

    // Four queued bytes against a high watermark of four: exactly one
    // high watermark edge.
    let kinds = drain_write_queue_events(&monitor, Duration::from_millis(300));
    assert_eq!(kinds, vec![QueueEventKind::HighWatermark]);

    // A fifth byte would exceed the high watermark and is rejected
    // without being enqueued.
    let result = client.send(
        SendPayload::from(Bytes::from_static(b"x")),
        SendOptions::new(),
        Box::new(|_result| {}),
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Limit);

    // Let the OS drain the queue: all four sends complete and exactly
    // one low watermark edge fires.
    client.relax_flow_control(FlowControlDirection::Send).unwrap();
    for _ in 0..4 {
        send_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    }
    let kinds = drain_write_queue_events(&monitor, Duration::from_millis(300));
    assert_eq!(kinds, vec![QueueEventKind::LowWatermark]);

    // One further send below the high watermark: no additional edges.
    let (tx, rx) = flume::bounded(1);
    client
        .send(
            SendPayload::from(Bytes::from_static(b"y")),
            SendOptions::new(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    rx.recv_timeout(TIMEOUT).unwrap().unwrap();

    let kinds = drain_write_queue_events(&monitor, Duration::from_millis(300));
    assert!(kinds.is_empty(), "unexpected watermark events: {kinds:?}");

    engine.shutdown();
}
