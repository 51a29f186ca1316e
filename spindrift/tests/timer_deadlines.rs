//! Timer firing/cancellation races and operation deadlines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spindrift::prelude::*;
use spindrift::TimerCancel;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn one_shot_timer_cancel_race() {
    spindrift::dev_tracing::init_tracing();
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();

    for round in 0..30u64 {
        let fired = Arc::new(AtomicUsize::new(0));
        let (fired_tx, fired_rx) = flume::bounded(1);

        let counter = Arc::clone(&fired);
        let timer = engine
            .schedule_timer(
                Instant::now() + Duration::from_millis(10),
                None,
                Arc::new(move |_event| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = fired_tx.send(());
                }),
                None,
            )
            .unwrap();

        // Cancel around the deadline, earlier or later per round.
        std::thread::sleep(Duration::from_millis(9 + (round % 3)));
        match timer.cancel() {
            TimerCancel::Canceled => {
                // The handler must never run.
                std::thread::sleep(Duration::from_millis(30));
                assert_eq!(fired.load(Ordering::SeqCst), 0);
            }
            TimerCancel::AlreadyFired => {
                fired_rx.recv_timeout(TIMEOUT).unwrap();
                assert_eq!(fired.load(Ordering::SeqCst), 1);
            }
        }
        timer.forget();
    }

    engine.shutdown();
}

#[test]
fn periodic_timer_fires_repeatedly() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();

    let (tick_tx, tick_rx) = flume::unbounded();
    let timer = engine
        .schedule_timer(
            Instant::now() + Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            Arc::new(move |_event| {
                let _ = tick_tx.send(());
            }),
            None,
        )
        .unwrap();

    for _ in 0..3 {
        tick_rx.recv_timeout(TIMEOUT).unwrap();
    }
    assert_eq!(timer.cancel(), TimerCancel::Canceled);

    engine.shutdown();
}

#[test]
fn zero_duration_deadline_cancels_on_next_tick() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();

    let listener = engine
        .create_listener_socket(&ListenerSocketOptions::new())
        .unwrap();
    listener
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();
    listener.listen(1).unwrap();
    let endpoint = listener.source_endpoint().unwrap();

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

    // A deadline that has already passed expires the receive on the
    // next worker tick.
    let (tx, rx) = flume::bounded(1);
    client
        .receive(
            ReceiveOptions::new().with_deadline(Instant::now()),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    engine.shutdown();
}

#[test]
fn accept_deadline_expires() {
    let engine = Engine::new(EngineConfig::new().with_worker_count(1)).unwrap();

    let listener = engine
        .create_listener_socket(&ListenerSocketOptions::new())
        .unwrap();
    listener
        .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
        .unwrap();
    listener.listen(1).unwrap();

    let (tx, rx) = flume::bounded(1);
    listener
        .accept(
            AcceptOptions::new().with_deadline(Instant::now() + Duration::from_millis(20)),
            Box::new(move |result| {
                let _ = tx.send(result.map(|_stream| ()));
            }),
        )
        .unwrap();
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    engine.shutdown();
}
