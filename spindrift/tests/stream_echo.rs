//! End-to-end stream socket exchange over IPv4 loopback.

use std::sync::Arc;
use std::time::Duration;

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

fn send_byte(socket: &StreamSocket, byte: u8) {
    let (tx, rx) = flume::bounded(1);
    socket
        .send(
            SendPayload::from(Bytes::copy_from_slice(&[byte])),
            SendOptions::new(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    let context = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(context.bytes_transferred, 1);
}

fn receive_byte(socket: &StreamSocket) -> u8 {
    let (tx, rx) = flume::bounded(1);
    socket
        .receive(
            ReceiveOptions::new().with_size(1),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    let (bytes, context) = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(context.bytes_transferred, 1);
    assert_eq!(bytes.len(), 1);
    bytes[0]
}

#[test]
fn stream_echo() {
    spindrift::dev_tracing::init_tracing();
    let engine = Engine::new(EngineConfig::new().with_worker_count(2)).unwrap();
    let (client, server) = connected_pair(&engine);

    client.remote_endpoint().unwrap();
    server.remote_endpoint().unwrap();

    // Client speaks first; the server echoes a different byte back.
    send_byte(&client, 0x43);
    assert_eq!(receive_byte(&server), 0x43);

    send_byte(&server, 0x31);
    assert_eq!(receive_byte(&client), 0x31);

    // After a full shutdown every further receive observes end-of-file
    // with zero bytes delivered.
    client.shutdown(ShutdownDirection::Both).unwrap();
    server.shutdown(ShutdownDirection::Both).unwrap();

    let (tx, rx) = flume::bounded(1);
    server
        .receive(
            ReceiveOptions::new(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Eof);

    engine.shutdown();
}

#[test]
fn send_after_send_shutdown_is_rejected() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();
    let (client, _server) = connected_pair(&engine);

    client.shutdown(ShutdownDirection::Send).unwrap();
    let result = client.send(
        SendPayload::from(Bytes::from_static(b"x")),
        SendOptions::new(),
        Box::new(|_result| {}),
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Invalid);

    engine.shutdown();
}

#[test]
fn cancel_of_unknown_token_is_invalid() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();
    let (client, _server) = connected_pair(&engine);

    assert_eq!(
        client.cancel(Token(0x5005)).unwrap_err().kind(),
        ErrorKind::Invalid
    );

    engine.shutdown();
}

#[test]
fn pending_receive_cancels_by_token() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();
    let (client, _server) = connected_pair(&engine);

    let (tx, rx) = flume::bounded(1);
    client
        .receive(
            ReceiveOptions::new().with_token(Token(7)),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();

    client.cancel(Token(7)).unwrap();
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // The token is gone once the operation completed.
    assert_eq!(client.cancel(Token(7)).unwrap_err().kind(), ErrorKind::Invalid);

    engine.shutdown();
}
