//! Pipeline tests driving a reactor manually from the test thread, so
//! queue contents can be observed between cycles.

#![cfg(unix)]

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use longeron_core::buffer::Data;
use longeron_core::endpoint::Endpoint;
use longeron_core::error::ErrorKind;
use longeron_core::event::{EventType, QueueEventType, StreamEvent};
use longeron_core::option::{
    ConnectOptions, RateLimiterConfig, SendOptions, StreamSocketOptions,
};
use longeron_core::reactor::Reactor;
use longeron_core::resolver::Resolver;
use longeron_core::stream::StreamSocket;

fn drive_until(reactor: &Reactor, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "reactor did not converge");
        reactor.drive(Some(Duration::from_millis(10))).unwrap();
    }
}

/// Connect a socket to a plain std listener, driving the reactor until the
/// connect callback fires, and return the accepted peer.
fn connect_to_listener(
    reactor: &std::sync::Arc<Reactor>,
    socket: &StreamSocket,
    listener: &std::net::TcpListener,
) -> std::net::TcpStream {
    let target = Endpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();
    let (connect_tx, connect_rx) = flume::unbounded();
    socket
        .connect(
            target,
            ConnectOptions::new(),
            Box::new(move |event| {
                connect_tx.send(event).ok();
            }),
        )
        .unwrap();

    drive_until(reactor, || !connect_rx.is_empty());
    let event = connect_rx.recv().unwrap();
    assert_eq!(event.event_type, EventType::Complete);
    assert!(event.context.latency.is_some());

    let (peer, _) = listener.accept().unwrap();
    peer
}

#[test]
fn write_queue_high_watermark_hysteresis() {
    let reactor = Reactor::new("pipeline").unwrap();
    let resolver = Resolver::new();
    let options = StreamSocketOptions::new().with_write_queue_watermarks(0, 1024);
    let socket = StreamSocket::new(&reactor, resolver, options);
    let monitor = socket.monitor();

    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let _peer = connect_to_listener(&reactor, &socket, &listener);

    // Without driving the reactor, sends stay queued.
    socket
        .send(Data::from(vec![0u8; 900]), SendOptions::new(), None)
        .unwrap();
    assert_eq!(socket.write_queue_size(), 900);

    let error = socket
        .send(Data::from(vec![0u8; 200]), SendOptions::new(), None)
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::WouldFlowControl);
    assert_eq!(socket.write_queue_size(), 900);

    let announced: Vec<StreamEvent> = monitor.try_iter().collect();
    assert!(announced.iter().any(|event| matches!(
        event,
        StreamEvent::WriteQueue(QueueEventType::HighWatermark)
    )));

    // Suppression admits the entry; the announcement already fired and
    // does not repeat until the low watermark is crossed.
    socket
        .send(
            Data::from(vec![0u8; 200]),
            SendOptions::new().with_suppress_high_watermark(true),
            None,
        )
        .unwrap();
    assert_eq!(socket.write_queue_size(), 1100);
    assert!(!monitor.try_iter().any(|event| matches!(
        event,
        StreamEvent::WriteQueue(QueueEventType::HighWatermark)
    )));

    // Draining empties the queue and fires the opposing crossing once.
    drive_until(&reactor, || socket.write_queue_size() == 0);
    let announced: Vec<StreamEvent> = monitor.try_iter().collect();
    assert_eq!(
        announced
            .iter()
            .filter(|event| matches!(
                event,
                StreamEvent::WriteQueue(QueueEventType::LowWatermark)
            ))
            .count(),
        1
    );
}

#[test]
fn rate_limited_send_defers_remainder() {
    let reactor = Reactor::new("limited").unwrap();
    let resolver = Resolver::new();
    let options = StreamSocketOptions::new()
        .with_send_rate_limiter(RateLimiterConfig::uniform(1000));
    let socket = StreamSocket::new(&reactor, resolver, options);
    let monitor = socket.monitor();

    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let _peer = connect_to_listener(&reactor, &socket, &listener);

    let (sent_tx, sent_rx) = flume::unbounded();
    let started = Instant::now();
    socket
        .send(
            Data::from(vec![0u8; 1500]),
            SendOptions::new(),
            Some(Box::new(move |event| {
                sent_tx.send(event).ok();
            })),
        )
        .unwrap();

    drive_until(&reactor, || !sent_rx.is_empty());
    let event = sent_rx.recv().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(event.event_type, EventType::Complete);
    assert_eq!(event.context.bytes_sent, 1500);
    // The first 1000 units transmit immediately; the remaining 500 wait
    // for the bucket to drain at 1000 units per second.
    assert!(elapsed >= Duration::from_millis(250), "finished in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "finished in {elapsed:?}");

    let announced: Vec<StreamEvent> = monitor.try_iter().collect();
    assert_eq!(
        announced
            .iter()
            .filter(|event| matches!(
                event,
                StreamEvent::WriteQueue(QueueEventType::RateLimitApplied)
            ))
            .count(),
        1
    );
    assert_eq!(
        announced
            .iter()
            .filter(|event| matches!(
                event,
                StreamEvent::WriteQueue(QueueEventType::RateLimitRelaxed)
            ))
            .count(),
        1
    );
}

#[test]
fn send_rejected_before_connect() {
    let reactor = Reactor::new("invalid").unwrap();
    let resolver = Resolver::new();
    let socket = StreamSocket::new(&reactor, resolver, StreamSocketOptions::new());

    let error = socket
        .send(Data::from(&b"x"[..]), SendOptions::new(), None)
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Invalid);
}
