//! Echo round trip through the public API surface.

#![cfg(unix)]

use std::time::Duration;

use longeron::prelude::*;

const STEP: Duration = Duration::from_secs(5);

#[test]
fn echo_round_trip() {
    longeron::dev_tracing::init_tracing();

    let interface = Interface::new(InterfaceConfig::new().with_thread_name("echo"));
    interface.start().unwrap();

    let listener = interface
        .create_listener_socket(ListenerSocketOptions::new())
        .unwrap();
    listener.listen(&Endpoint::parse("127.0.0.1:0").unwrap()).unwrap();
    let port = listener.local_endpoint().unwrap().port().unwrap();

    let (accept_tx, accept_rx) = flume::unbounded();
    listener
        .accept(
            AcceptOptions::new(),
            Box::new(move |_, child| {
                accept_tx.send(child).ok();
            }),
        )
        .unwrap();

    let client = interface
        .create_stream_socket(StreamSocketOptions::new())
        .unwrap();
    let (connect_tx, connect_rx) = flume::unbounded();
    client
        .connect(
            format!("127.0.0.1:{port}").as_str(),
            ConnectOptions::new(),
            Box::new(move |event| {
                connect_tx.send(event).ok();
            }),
        )
        .unwrap();
    assert_eq!(
        connect_rx.recv_timeout(STEP).unwrap().event_type,
        EventType::Complete
    );

    let server = accept_rx.recv_timeout(STEP).unwrap().unwrap();
    let echo = server.clone();
    server
        .receive(
            ReceiveOptions::new().with_min_size(4),
            Box::new(move |event| {
                let data = event.data.unwrap();
                echo.send(Data::Blob(data), SendOptions::new(), None).unwrap();
            }),
        )
        .unwrap();

    client
        .send("PING".into(), SendOptions::new(), None)
        .unwrap();
    let (reply_tx, reply_rx) = flume::unbounded();
    client
        .receive(
            ReceiveOptions::new().with_min_size(4),
            Box::new(move |event| {
                reply_tx.send(event).ok();
            }),
        )
        .unwrap();

    let reply = reply_rx.recv_timeout(STEP).unwrap();
    assert_eq!(reply.event_type, EventType::Complete);
    assert_eq!(reply.data.unwrap().to_bytes().as_ref(), b"PING");

    client.close().unwrap();
    interface.stop();
}
