//! Detach ordering: in-flight completions land before the detach
//! handler, which fires exactly once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use spindrift::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(10);

fn connected_pair(engine: &Engine) -> (Arc<StreamSocket>, Arc<StreamSocket>) {
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

    let client = engine
        .create_stream_socket(StreamSocketOptions::new())
        .unwrap();
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

#[test]
fn detach_waits_for_in_flight_receive() {
    spindrift::dev_tracing::init_tracing();
    let engine = Engine::new(EngineConfig::new().with_worker_count(2)).unwrap();
    let (_client, server) = connected_pair(&engine);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = flume::bounded(2);

    // A receive with nothing to read stays in flight.
    {
        let order = Arc::clone(&order);
        let done_tx = done_tx.clone();
        server
            .receive(
                ReceiveOptions::new(),
                Box::new(move |result| {
                    let err = result.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::Cancelled);
                    order.lock().push("receive");
                    let _ = done_tx.send(());
                }),
            )
            .unwrap();
    }

    // Detach from another thread.
    let detach_handle = {
        let server = Arc::clone(&server);
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            server
                .detach(Box::new(move || {
                    order.lock().push("detach");
                    let _ = done_tx.send(());
                }))
                .unwrap();
        })
    };
    detach_handle.join().unwrap();

    done_rx.recv_timeout(TIMEOUT).unwrap();
    done_rx.recv_timeout(TIMEOUT).unwrap();

    // The cancelled receive ran first; the detach handler ran once,
    // afterwards.
    assert_eq!(*order.lock(), vec!["receive", "detach"]);

    // A second detach is an invalid state transition.
    assert_eq!(
        server.detach(Box::new(|| {})).unwrap_err().kind(),
        ErrorKind::Invalid
    );

    engine.shutdown();
}

#[test]
fn operations_after_detach_are_rejected() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();
    let (client, _server) = connected_pair(&engine);

    let (detached_tx, detached_rx) = flume::bounded(1);
    client
        .detach(Box::new(move || {
            let _ = detached_tx.send(());
        }))
        .unwrap();
    detached_rx.recv_timeout(TIMEOUT).unwrap();

    let result = client.send(
        SendPayload::from(Bytes::from_static(b"x")),
        SendOptions::new(),
        Box::new(|_result| {}),
    );
    assert!(result.is_err());

    engine.shutdown();
}
