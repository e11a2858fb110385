//! End-to-end socket scenarios driven by a running worker pool.

#![cfg(unix)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use longeron_core::buffer::Data;
use longeron_core::endpoint::Endpoint;
use longeron_core::error::ErrorKind;
use longeron_core::event::{EventType, ReceiveEvent, ShutdownEventType, StreamEvent};
use longeron_core::interface::{Interface, InterfaceConfig};
use longeron_core::listener::ListenerSocket;
use longeron_core::option::{
    AcceptOptions, ConnectOptions, OperationToken, ReceiveOptions, SendOptions,
    StreamSocketOptions,
};
use longeron_core::state::ShutdownType;
use longeron_core::stream::StreamSocket;

const STEP: Duration = Duration::from_secs(5);

fn start_interface() -> Arc<Interface> {
    let interface = Interface::new(
        InterfaceConfig::new()
            .with_thread_name("scenario")
            .with_threads(2, 2),
    );
    interface.start().unwrap();
    interface
}

/// Establish a loopback client/server stream pair through a listener.
fn connected_pair(
    interface: &Arc<Interface>,
    client_options: StreamSocketOptions,
    child_options: StreamSocketOptions,
) -> (ListenerSocket, StreamSocket, StreamSocket) {
    let listener = interface
        .create_listener_socket(
            longeron_core::option::ListenerSocketOptions::new().with_child_options(child_options),
        )
        .unwrap();
    listener
        .listen(&Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0))
        .unwrap();
    let port = listener.local_endpoint().unwrap().port().unwrap();

    let (accept_tx, accept_rx) = flume::unbounded();
    listener
        .accept(
            AcceptOptions::new(),
            Box::new(move |event, child| {
                assert_eq!(event.event_type, EventType::Complete);
                accept_tx.send(child).ok();
            }),
        )
        .unwrap();

    let client = interface.create_stream_socket(client_options).unwrap();
    let (connect_tx, connect_rx) = flume::unbounded();
    client
        .connect(
            Endpoint::ipv4(Ipv4Addr::LOCALHOST, port),
            ConnectOptions::new(),
            Box::new(move |event| {
                connect_tx.send(event).ok();
            }),
        )
        .unwrap();

    let connect_event = connect_rx.recv_timeout(STEP).unwrap();
    assert_eq!(connect_event.event_type, EventType::Complete);

    let server = accept_rx.recv_timeout(STEP).unwrap().unwrap();
    (listener, client, server)
}

fn receive_into(socket: &StreamSocket, options: ReceiveOptions) -> flume::Receiver<ReceiveEvent> {
    let (tx, rx) = flume::unbounded();
    socket
        .receive(
            options,
            Box::new(move |event| {
                tx.send(event).ok();
            }),
        )
        .unwrap();
    rx
}

#[test]
fn echo_over_ipv4_tcp() {
    let interface = start_interface();
    let (_listener, client, server) =
        connected_pair(&interface, StreamSocketOptions::new(), StreamSocketOptions::new());

    // Server loop: receive five bytes, send the same five bytes back.
    let echo_server = server.clone();
    server
        .receive(
            ReceiveOptions::new().with_min_size(5),
            Box::new(move |event| {
                assert_eq!(event.event_type, EventType::Complete);
                let data = event.data.unwrap();
                echo_server
                    .send(Data::Blob(data), SendOptions::new(), None)
                    .unwrap();
            }),
        )
        .unwrap();

    client
        .send(Data::from(&b"HELLO"[..]), SendOptions::new(), None)
        .unwrap();
    let reply = receive_into(&client, ReceiveOptions::new().with_min_size(5));
    let event = reply.recv_timeout(STEP).unwrap();
    assert_eq!(event.event_type, EventType::Complete);
    assert_eq!(event.data.unwrap().to_bytes().as_ref(), b"HELLO");

    // Client closes; the server observes end-of-file and winds down.
    let server_monitor = server.monitor();
    client.shutdown(ShutdownType::Both).unwrap();
    let deadline = Instant::now() + STEP;
    let mut server_complete = false;
    while Instant::now() < deadline && !server_complete {
        if let Ok(event) = server_monitor.recv_timeout(Duration::from_millis(100)) {
            server_complete = matches!(
                event,
                StreamEvent::Shutdown(ShutdownEventType::Complete)
            );
        }
    }
    assert!(server_complete);

    interface.stop();
}

#[test]
fn receive_deadline_cancels_without_closing() {
    let interface = start_interface();
    let (_listener, client, server) =
        connected_pair(&interface, StreamSocketOptions::new(), StreamSocketOptions::new());

    let started = Instant::now();
    let rx = receive_into(
        &client,
        ReceiveOptions::new().with_deadline(Instant::now() + Duration::from_millis(50)),
    );
    let event = rx.recv_timeout(STEP).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.context.error.unwrap().kind(), ErrorKind::Cancelled);
    assert!(elapsed >= Duration::from_millis(40), "fired at {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired at {elapsed:?}");

    // The socket stays open; a second receive still works.
    server
        .send(Data::from(&b"STILL HERE"[..]), SendOptions::new(), None)
        .unwrap();
    let rx = receive_into(&client, ReceiveOptions::new());
    let event = rx.recv_timeout(STEP).unwrap();
    assert_eq!(event.event_type, EventType::Complete);

    interface.stop();
}

#[test]
fn cancellation_token_completes_pending_receive() {
    let interface = start_interface();
    let (_listener, client, _server) =
        connected_pair(&interface, StreamSocketOptions::new(), StreamSocketOptions::new());

    let token = OperationToken::generate();
    let rx = receive_into(&client, ReceiveOptions::new().with_token(token));
    client.cancel(token);

    let event = rx.recv_timeout(STEP).unwrap();
    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.context.error.unwrap().kind(), ErrorKind::Cancelled);

    interface.stop();
}

#[test]
fn connect_retries_through_fallback_then_fails() {
    let interface = start_interface();

    // A port that refuses connections.
    let closed_port = {
        let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    };

    let client = interface
        .create_stream_socket(StreamSocketOptions::new())
        .unwrap();
    let (connect_tx, connect_rx) = flume::unbounded();
    let started = Instant::now();
    client
        .connect(
            format!("no-such-host.invalid:{closed_port}").as_str(),
            ConnectOptions::new()
                .with_retry(2, Duration::from_millis(50))
                .with_ip_address_fallback(Ipv4Addr::LOCALHOST.into()),
            Box::new(move |event| {
                connect_tx.send(event).ok();
            }),
        )
        .unwrap();

    let event = connect_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.context.attempts_remaining, 0);
    let error = event.context.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::ConnectionRefused);
    // Two retry intervals elapse between the three attempts.
    assert!(elapsed >= Duration::from_millis(100), "failed at {elapsed:?}");

    // The callback fires exactly once.
    assert!(connect_rx
        .recv_timeout(Duration::from_millis(200))
        .is_err());

    interface.stop();
}

#[test]
fn keep_half_open_shutdown_sequence() {
    let interface = start_interface();
    let options = StreamSocketOptions::new().with_keep_half_open(true);
    let (_listener, client, server) =
        connected_pair(&interface, options.clone(), options);

    let client_monitor = client.monitor();
    let server_monitor = server.monitor();

    // The server waits for data; the client half-closes instead.
    let server_rx = receive_into(&server, ReceiveOptions::new());
    client.shutdown(ShutdownType::Send).unwrap();

    let event = server_rx.recv_timeout(STEP).unwrap();
    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.context.error.unwrap().kind(), ErrorKind::Eof);

    // The other direction still flows.
    server
        .send(Data::from(&b"BYE"[..]), SendOptions::new(), None)
        .unwrap();
    let client_rx = receive_into(&client, ReceiveOptions::new().with_min_size(3));
    let event = client_rx.recv_timeout(STEP).unwrap();
    assert_eq!(event.event_type, EventType::Complete);
    assert_eq!(event.data.unwrap().to_bytes().as_ref(), b"BYE");

    // Completion fires on each side only after both directions are down.
    server.shutdown(ShutdownType::Send).unwrap();
    for monitor in [server_monitor, client_monitor] {
        let deadline = Instant::now() + STEP;
        let mut complete = false;
        while Instant::now() < deadline && !complete {
            if let Ok(event) = monitor.recv_timeout(Duration::from_millis(100)) {
                complete = matches!(event, StreamEvent::Shutdown(ShutdownEventType::Complete));
            }
        }
        assert!(complete);
    }

    interface.stop();
}

#[test]
fn listener_rejects_connections_past_limit() {
    let interface = start_interface();

    let listener = interface
        .create_listener_socket(
            longeron_core::option::ListenerSocketOptions::new().with_max_connections(1),
        )
        .unwrap();
    listener
        .listen(&Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0))
        .unwrap();
    let port = listener.local_endpoint().unwrap().port().unwrap();
    let monitor = listener.monitor();

    let (accept_tx, accept_rx) = flume::unbounded();
    listener
        .accept(
            AcceptOptions::new(),
            Box::new(move |_, child| {
                accept_tx.send(child).ok();
            }),
        )
        .unwrap();

    // First connection is accepted and claimed.
    let _first = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let child = accept_rx.recv_timeout(STEP).unwrap();
    assert!(child.is_some());

    // Second connection exceeds the limit and is closed outright.
    let _second = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let deadline = Instant::now() + STEP;
    let mut rejected = false;
    while Instant::now() < deadline && !rejected {
        if let Ok(event) = monitor.recv_timeout(Duration::from_millis(100)) {
            rejected = matches!(
                event,
                longeron_core::event::ListenerEvent::ConnectionRejectedLimitReached
            );
        }
    }
    assert!(rejected);

    interface.stop();
}
