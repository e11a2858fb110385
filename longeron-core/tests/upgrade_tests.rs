//! Encryption upgrade pumped through a pass-through driver session.
//!
//! The session implements a tiny SYN/ACK handshake and a null cipher, so
//! the test exercises the socket's pump (handshake bytes out, ciphertext
//! in, plaintext into the read queue) without a real TLS driver.

#![cfg(unix)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use longeron_core::buffer::Data;
use longeron_core::encryption::EncryptionSession;
use longeron_core::endpoint::Endpoint;
use longeron_core::error::{Error, ErrorKind, Result};
use longeron_core::event::EventType;
use longeron_core::interface::{Interface, InterfaceConfig};
use longeron_core::option::{
    AcceptOptions, ConnectOptions, ListenerSocketOptions, ReceiveOptions, SendOptions,
    StreamSocketOptions,
};
use longeron_core::stream::StreamSocket;

const STEP: Duration = Duration::from_secs(5);
const SYN: &[u8] = b"NUL-SYN";
const ACK: &[u8] = b"NUL-ACK";

/// A null-cipher session with a SYN/ACK handshake.
struct NullSession {
    initiator: bool,
    established: bool,
    handshake_buffer: Vec<u8>,
    incoming_plain: VecDeque<Bytes>,
    outgoing_cipher: VecDeque<Bytes>,
}

impl NullSession {
    fn new(initiator: bool) -> Box<Self> {
        Box::new(Self {
            initiator,
            established: false,
            handshake_buffer: Vec::new(),
            incoming_plain: VecDeque::new(),
            outgoing_cipher: VecDeque::new(),
        })
    }

    fn expected_token(&self) -> &'static [u8] {
        if self.initiator {
            ACK
        } else {
            SYN
        }
    }
}

impl EncryptionSession for NullSession {
    fn initiate_handshake(&mut self) -> Result<()> {
        if self.initiator {
            self.outgoing_cipher.push_back(Bytes::from_static(SYN));
        }
        Ok(())
    }

    fn push_incoming_cipher_text(&mut self, data: &[u8]) -> Result<()> {
        if self.established {
            self.incoming_plain.push_back(Bytes::copy_from_slice(data));
            return Ok(());
        }

        self.handshake_buffer.extend_from_slice(data);
        let token = self.expected_token();
        if self.handshake_buffer.len() < token.len() {
            return Ok(());
        }
        if &self.handshake_buffer[..token.len()] != token {
            return Err(Error::generic(ErrorKind::TlsHandshake));
        }

        self.established = true;
        if !self.initiator {
            self.outgoing_cipher.push_back(Bytes::from_static(ACK));
        }
        let surplus = self.handshake_buffer.split_off(token.len());
        if !surplus.is_empty() {
            self.incoming_plain.push_back(Bytes::from(surplus));
        }
        Ok(())
    }

    fn pop_incoming_plain_text(&mut self) -> Option<Bytes> {
        self.incoming_plain.pop_front()
    }

    fn push_outgoing_plain_text(&mut self, data: &[u8]) -> Result<()> {
        if !self.established {
            return Err(Error::new(ErrorKind::Pending));
        }
        self.outgoing_cipher.push_back(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn pop_outgoing_cipher_text(&mut self) -> Option<Bytes> {
        self.outgoing_cipher.pop_front()
    }

    fn is_handshake_complete(&self) -> bool {
        self.established
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.established.then(|| vec![0x30, 0x82])
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

fn connected_pair(interface: &Arc<Interface>) -> (StreamSocket, StreamSocket) {
    let listener = interface
        .create_listener_socket(ListenerSocketOptions::new())
        .unwrap();
    listener
        .listen(&Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0))
        .unwrap();
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
            Endpoint::ipv4(Ipv4Addr::LOCALHOST, port),
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
    (client, server)
}

#[test]
fn handshake_completes_and_data_flows_encrypted() {
    let interface = Interface::new(InterfaceConfig::new().with_thread_name("upgrade"));
    interface.start().unwrap();
    let (client, server) = connected_pair(&interface);

    // The accepting side must interpose its session before the initiator's
    // first record arrives.
    let (server_up_tx, server_up_rx) = flume::unbounded();
    server
        .upgrade(
            NullSession::new(false),
            Box::new(move |event| {
                server_up_tx.send(event).ok();
            }),
        )
        .unwrap();

    let (client_up_tx, client_up_rx) = flume::unbounded();
    client
        .upgrade(
            NullSession::new(true),
            Box::new(move |event| {
                client_up_tx.send(event).ok();
            }),
        )
        .unwrap();

    let server_event = server_up_rx.recv_timeout(STEP).unwrap();
    assert_eq!(server_event.event_type, EventType::Complete);
    let client_event = client_up_rx.recv_timeout(STEP).unwrap();
    assert_eq!(client_event.event_type, EventType::Complete);
    assert!(client_event.context.peer_certificate.is_some());

    // Application data now rides the session in both directions.
    let (receive_tx, receive_rx) = flume::unbounded();
    server
        .receive(
            ReceiveOptions::new().with_min_size(6),
            Box::new(move |event| {
                receive_tx.send(event).ok();
            }),
        )
        .unwrap();
    client
        .send(Data::from(&b"SECRET"[..]), SendOptions::new(), None)
        .unwrap();

    let event = receive_rx.recv_timeout(STEP).unwrap();
    assert_eq!(event.event_type, EventType::Complete);
    assert_eq!(event.data.unwrap().to_bytes().as_ref(), b"SECRET");

    interface.stop();
}

#[test]
fn send_rejected_until_handshake_completes() {
    let interface = Interface::new(InterfaceConfig::new().with_thread_name("upgrade-gate"));
    interface.start().unwrap();
    let (client, _server) = connected_pair(&interface);

    client
        .upgrade(NullSession::new(true), Box::new(|_| {}))
        .unwrap();

    // The responder never answers, so the handshake stays pending.
    let error = client
        .send(Data::from(&b"EARLY"[..]), SendOptions::new(), None)
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Pending);

    interface.stop();
}
