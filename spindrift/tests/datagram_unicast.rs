//! End-to-end datagram exchange over IPv4 loopback.

use std::time::Duration;

use spindrift::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn datagram_unicast() {
    spindrift::dev_tracing::init_tracing();
    let engine = Engine::new(EngineConfig::new().with_worker_count(2)).unwrap();

    let first = engine
        .create_datagram_socket(&DatagramSocketOptions::new())
        .unwrap();
    first
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();
    let first_endpoint = first.source_endpoint().unwrap();

    let second = engine
        .create_datagram_socket(&DatagramSocketOptions::new())
        .unwrap();
    second
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();
    let second_endpoint = second.source_endpoint().unwrap();

    let (receive_tx, receive_rx) = flume::bounded(1);
    second
        .receive(
            ReceiveOptions::new(),
            Box::new(move |result| {
                let _ = receive_tx.send(result);
            }),
        )
        .unwrap();

    let (send_tx, send_rx) = flume::bounded(1);
    first
        .send_to(
            SendPayload::from(Bytes::from_static(&[0x55])),
            &second_endpoint,
            SendOptions::new(),
            Box::new(move |result| {
                let _ = send_tx.send(result);
            }),
        )
        .unwrap();
    let context = send_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(context.bytes_transferred, 1);

    let (bytes, context) = receive_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(context.bytes_transferred, 1);
    assert_eq!(&bytes[..], &[0x55]);
    assert_eq!(context.endpoint, Some(first_endpoint));

    engine.shutdown();
}

#[test]
fn connected_datagram_uses_default_peer() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();

    let receiver = engine
        .create_datagram_socket(&DatagramSocketOptions::new())
        .unwrap();
    receiver
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();
    let receiver_endpoint = receiver.source_endpoint().unwrap();

    let sender = engine
        .create_datagram_socket(&DatagramSocketOptions::new())
        .unwrap();
    sender
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();

    // Without a default peer, a targetless send is rejected.
    let result = sender.send(
        SendPayload::from(Bytes::from_static(b"x")),
        SendOptions::new(),
        Box::new(|_result| {}),
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::NotConnected);

    sender.connect(&receiver_endpoint).unwrap();
    assert_eq!(sender.remote_endpoint().unwrap(), receiver_endpoint);

    let (receive_tx, receive_rx) = flume::bounded(1);
    receiver
        .receive(
            ReceiveOptions::new(),
            Box::new(move |result| {
                let _ = receive_tx.send(result);
            }),
        )
        .unwrap();

    let (send_tx, send_rx) = flume::bounded(1);
    sender
        .send(
            SendPayload::from(Bytes::from_static(b"ping")),
            SendOptions::new(),
            Box::new(move |result| {
                let _ = send_tx.send(result);
            }),
        )
        .unwrap();
    send_rx.recv_timeout(TIMEOUT).unwrap().unwrap();

    let (bytes, _context) = receive_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(&bytes[..], b"ping");

    engine.shutdown();
}
