//! # Longeron
//!
//! A cross-platform asynchronous network transport framework with
//! reactor-driven sockets.
//!
//! ## Architecture
//!
//! Longeron is structured as a **transport kernel** with clean layering:
//!
//! - **`longeron-core`**: the reactor engine, socket state machines,
//!   chronology, strand, rate limiters, and resolver
//! - **`longeron`**: Public API surface (this crate)
//!
//! An [`Interface`] owns a pool of worker threads; each worker drives one
//! demultiplexer (a readiness-based [`Reactor`] or a completion-based
//! [`Proactor`]) plus its timer queue. Sockets are bound to one worker,
//! and all of a socket's callbacks are serialized on its strand in the
//! order the triggering events were observed.
//!
//! ## Quick Start
//!
//! ### Echo client
//!
//! ```rust,no_run
//! use longeron::prelude::*;
//!
//! # fn example() -> Result<()> {
//! let interface = Interface::new(InterfaceConfig::new());
//! interface.start()?;
//!
//! let socket = interface.create_stream_socket(StreamSocketOptions::new())?;
//! socket.connect(
//!     "127.0.0.1:5555",
//!     ConnectOptions::new(),
//!     Box::new(|event| println!("connect: {event:?}")),
//! )?;
//! socket.send(
//!     "HELLO".into(),
//!     SendOptions::new(),
//!     Some(Box::new(|event| println!("send: {event:?}"))),
//! )?;
//! socket.receive(
//!     ReceiveOptions::new().with_min_size(5),
//!     Box::new(|event| println!("receive: {event:?}")),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Echo server
//!
//! ```rust,no_run
//! use longeron::prelude::*;
//!
//! # fn example() -> Result<()> {
//! let interface = Interface::new(InterfaceConfig::new());
//! interface.start()?;
//!
//! let listener = interface.create_listener_socket(ListenerSocketOptions::new())?;
//! listener.listen(&Endpoint::parse("127.0.0.1:5555")?)?;
//! listener.accept(
//!     AcceptOptions::new(),
//!     Box::new(|event, child| {
//!         if let Some(child) = child {
//!             // Drive the child: receive then send back.
//!         }
//!         let _ = event;
//!     }),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - **Per-socket ordering**: callbacks of one socket never run
//!   concurrently and observe events in arrival order
//! - **Exactly-one terminal event** per asynchronous operation
//! - **Safe teardown**: a handle closes only after the demultiplexer has
//!   provably stopped delivering to it

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

// Re-export core types
pub use bytes::Bytes;
pub use longeron_core::buffer::{Blob, Data, FileRegion};
pub use longeron_core::chronology::{Chronology, Timer, TimerEvent, TimerOptions};
pub use longeron_core::encryption::{
    CompressionDriver, EncryptionDriver, EncryptionSession, UpgradeOptions,
};
pub use longeron_core::datagram::DatagramSocket;
pub use longeron_core::endpoint::{Endpoint, EthernetAddress};
pub use longeron_core::error::{Error, ErrorCategory, ErrorKind, Result};
pub use longeron_core::event::{
    AcceptEvent, ConnectCallback, ConnectEvent, DatagramEvent, EventType, ListenerEvent,
    QueueEventType, ReceiveCallback, ReceiveEvent, SendCallback, SendEvent, ShutdownEventType,
    StreamEvent, TimestampHook, TimestampSample, UpgradeCallback, UpgradeEvent,
};
pub use longeron_core::interface::{
    DemultiplexerKind, Interface, InterfaceConfig, SocketPlacement,
};
pub use longeron_core::limiter::{LeakyBucket, RateLimiter};
pub use longeron_core::listener::{AcceptCallback, ListenerSocket};
pub use longeron_core::option::{
    AcceptOptions, ConnectOptions, DatagramSocketOptions, IpAddressType, ListenerSocketOptions,
    OperationToken, RateLimiterConfig, ReceiveOptions, SendOptions, SocketOption,
    StreamSocketOptions,
};
pub use longeron_core::plugin;
pub use longeron_core::proactor::{
    Completion, CompletionBackend, CompletionKind, Proactor, ProactorSocket, Submission,
};
#[cfg(unix)]
pub use longeron_core::proactor::SynchronousBackend;
pub use longeron_core::reactor::{PollBackend, PollEvent, Reactor};
pub use longeron_core::resolver::{IpAddressOptions, PortOptions, Resolver, ResolverBackend};
pub use longeron_core::state::{ShutdownOrigin, ShutdownType};
pub use longeron_core::stream::{ConnectTarget, StreamSocket};
pub use longeron_core::syscall::{PeerCredentials, Transport};

/// Development helpers (benches/tests)
pub mod dev_tracing;

/// The types most applications need, importable in one line.
pub mod prelude {
    pub use longeron_core::prelude::*;
    pub use longeron_core::option::OperationToken;
    pub use longeron_core::state::ShutdownType;
}
