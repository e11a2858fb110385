//! The encryption adapter.
//!
//! The engine implements no TLS itself. An external driver supplies opaque
//! sessions; the stream socket pumps bytes through a session between its
//! queues and the syscall layer: user plaintext is transformed to
//! ciphertext during enqueue, network ciphertext is fed in during fill and
//! plaintext pulled out into the read queue.

use bytes::Bytes;

use crate::error::Result;

/// Options of an encryption upgrade.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// The server name presented during the handshake (SNI).
    pub server_name: Option<String>,
}

impl UpgradeOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Present `server_name` during the handshake.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }
}

/// One TLS session obtained from an external driver.
///
/// All operations are non-blocking byte-pump steps; the session never
/// performs I/O itself.
pub trait EncryptionSession: Send {
    /// Begin the handshake, emitting initial ciphertext to send.
    fn initiate_handshake(&mut self) -> Result<()>;

    /// Feed ciphertext received from the network.
    fn push_incoming_cipher_text(&mut self, data: &[u8]) -> Result<()>;

    /// Pull decrypted application bytes, if any are ready.
    fn pop_incoming_plain_text(&mut self) -> Option<Bytes>;

    /// Feed application bytes for encryption.
    fn push_outgoing_plain_text(&mut self, data: &[u8]) -> Result<()>;

    /// Pull ciphertext to send, if any is ready.
    fn pop_outgoing_cipher_text(&mut self) -> Option<Bytes>;

    /// True once the handshake has completed.
    fn is_handshake_complete(&self) -> bool;

    /// The peer certificate in DER form, when the driver surfaced one.
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// Emit ciphertext for a graceful close alert.
    fn shutdown(&mut self) -> Result<()>;
}

/// A factory of encryption sessions, registered process-wide by name.
pub trait EncryptionDriver: Send + Sync {
    /// The driver's name.
    fn name(&self) -> &str;

    /// Create a session acting in the client role.
    fn create_client_session(&self, options: &UpgradeOptions)
        -> Result<Box<dyn EncryptionSession>>;

    /// Create a session acting in the server role.
    fn create_server_session(&self, options: &UpgradeOptions)
        -> Result<Box<dyn EncryptionSession>>;
}

/// An external compressor, registered process-wide by name. The engine
/// only brokers registration; no pipeline consumes it directly.
pub trait CompressionDriver: Send + Sync {
    /// The driver's name.
    fn name(&self) -> &str;

    /// Compress `data`.
    fn deflate(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `data`.
    fn inflate(&self, data: &[u8]) -> Result<Vec<u8>>;
}
