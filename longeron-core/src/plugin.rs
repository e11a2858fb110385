//! The process-wide driver registry.
//!
//! Encryption drivers, compression drivers, and the reactor and proactor
//! backends are registered by name; registering under an existing name
//! replaces the previous entry. [`initialize`] installs the platform
//! defaults and is idempotent; [`exit`] clears everything.

use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::encryption::{CompressionDriver, EncryptionDriver};
use crate::error::{Error, ErrorKind, Result};
use crate::proactor::CompletionBackend;
use crate::reactor::PollBackend;

/// A factory of readiness (reactor) backends, registered by name.
pub trait PollBackendFactory: Send + Sync {
    /// The factory's name.
    fn name(&self) -> &'static str;

    /// Create one backend instance.
    fn create(&self) -> Result<Box<dyn PollBackend>>;
}

/// A factory of completion (proactor) backends, registered by name.
pub trait CompletionBackendFactory: Send + Sync {
    /// The factory's name.
    fn name(&self) -> &'static str;

    /// Create one backend instance.
    fn create(&self) -> Result<Box<dyn CompletionBackend>>;
}

#[derive(Default)]
struct PluginRegistry {
    encryption: HashMap<String, Arc<dyn EncryptionDriver>>,
    compression: HashMap<String, Arc<dyn CompressionDriver>>,
    backends: HashMap<String, Arc<dyn PollBackendFactory>>,
    proactors: HashMap<String, Arc<dyn CompletionBackendFactory>>,
    initialized: bool,
}

static REGISTRY: Lazy<RwLock<PluginRegistry>> =
    Lazy::new(|| RwLock::new(PluginRegistry::default()));

#[cfg(unix)]
struct SystemBackendFactory;

#[cfg(unix)]
impl PollBackendFactory for SystemBackendFactory {
    fn name(&self) -> &'static str {
        "system"
    }

    fn create(&self) -> Result<Box<dyn PollBackend>> {
        Ok(Box::new(crate::reactor::SystemBackend::new()?))
    }
}

#[cfg(unix)]
struct SynchronousBackendFactory;

#[cfg(unix)]
impl CompletionBackendFactory for SynchronousBackendFactory {
    fn name(&self) -> &'static str {
        "synchronous"
    }

    fn create(&self) -> Result<Box<dyn CompletionBackend>> {
        Ok(Box::new(crate::proactor::SynchronousBackend::new()))
    }
}

/// Install the platform defaults. Idempotent.
pub fn initialize() {
    let mut registry = REGISTRY.write();
    if registry.initialized {
        return;
    }
    registry.initialized = true;
    #[cfg(unix)]
    {
        registry
            .backends
            .insert("system".to_string(), Arc::new(SystemBackendFactory));
        registry
            .proactors
            .insert("synchronous".to_string(), Arc::new(SynchronousBackendFactory));
    }
}

/// Clear every registration.
pub fn exit() {
    let mut registry = REGISTRY.write();
    registry.encryption.clear();
    registry.compression.clear();
    registry.backends.clear();
    registry.proactors.clear();
    registry.initialized = false;
}

/// Register `driver` as the encryption driver named `name`.
pub fn register_encryption_driver(name: impl Into<String>, driver: Arc<dyn EncryptionDriver>) {
    REGISTRY.write().encryption.insert(name.into(), driver);
}

/// Remove the encryption driver named `name`.
pub fn deregister_encryption_driver(name: &str) {
    REGISTRY.write().encryption.remove(name);
}

/// Look up the encryption driver named `name`.
pub fn lookup_encryption_driver(name: &str) -> Result<Arc<dyn EncryptionDriver>> {
    REGISTRY
        .read()
        .encryption
        .get(name)
        .cloned()
        .ok_or(Error::new(ErrorKind::NotImplemented))
}

/// Register `driver` as the compression driver named `name`.
pub fn register_compression_driver(name: impl Into<String>, driver: Arc<dyn CompressionDriver>) {
    REGISTRY.write().compression.insert(name.into(), driver);
}

/// Remove the compression driver named `name`.
pub fn deregister_compression_driver(name: &str) {
    REGISTRY.write().compression.remove(name);
}

/// Look up the compression driver named `name`.
pub fn lookup_compression_driver(name: &str) -> Result<Arc<dyn CompressionDriver>> {
    REGISTRY
        .read()
        .compression
        .get(name)
        .cloned()
        .ok_or(Error::new(ErrorKind::NotImplemented))
}

/// Register `factory` as the polling backend named `name`.
pub fn register_poll_backend(name: impl Into<String>, factory: Arc<dyn PollBackendFactory>) {
    REGISTRY.write().backends.insert(name.into(), factory);
}

/// Remove the polling backend named `name`.
pub fn deregister_poll_backend(name: &str) {
    REGISTRY.write().backends.remove(name);
}

/// Create a readiness backend from the factory named `name`, installing
/// the platform defaults first if needed.
pub fn create_poll_backend(name: &str) -> Result<Box<dyn PollBackend>> {
    initialize();
    let factory = REGISTRY
        .read()
        .backends
        .get(name)
        .cloned()
        .ok_or(Error::new(ErrorKind::NotImplemented))?;
    factory.create()
}

/// Register `factory` as the completion backend named `name`.
pub fn register_proactor_backend(
    name: impl Into<String>,
    factory: Arc<dyn CompletionBackendFactory>,
) {
    REGISTRY.write().proactors.insert(name.into(), factory);
}

/// Remove the completion backend named `name`.
pub fn deregister_proactor_backend(name: &str) {
    REGISTRY.write().proactors.remove(name);
}

/// Create a completion backend from the factory named `name`, installing
/// the platform defaults first if needed.
pub fn create_proactor_backend(name: &str) -> Result<Box<dyn CompletionBackend>> {
    initialize();
    let factory = REGISTRY
        .read()
        .proactors
        .get(name)
        .cloned()
        .ok_or(Error::new(ErrorKind::NotImplemented))?;
    factory.create()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{EncryptionSession, UpgradeOptions};

    struct FakeDriver(&'static str);

    impl EncryptionDriver for FakeDriver {
        fn name(&self) -> &str {
            self.0
        }

        fn create_client_session(
            &self,
            _options: &UpgradeOptions,
        ) -> Result<Box<dyn EncryptionSession>> {
            Err(Error::new(ErrorKind::NotImplemented))
        }

        fn create_server_session(
            &self,
            _options: &UpgradeOptions,
        ) -> Result<Box<dyn EncryptionSession>> {
            Err(Error::new(ErrorKind::NotImplemented))
        }
    }

    #[test]
    fn last_registration_wins() {
        register_encryption_driver("fake", Arc::new(FakeDriver("first")));
        register_encryption_driver("fake", Arc::new(FakeDriver("second")));
        let driver = lookup_encryption_driver("fake").unwrap();
        assert_eq!(driver.name(), "second");
        deregister_encryption_driver("fake");
        assert!(lookup_encryption_driver("fake").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn system_backend_available_after_initialize() {
        initialize();
        let backend = create_poll_backend("system").unwrap();
        assert_eq!(backend.name(), "system");
        assert!(create_poll_backend("no-such-backend").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn synchronous_proactor_backend_available_after_initialize() {
        initialize();
        let backend = create_proactor_backend("synchronous").unwrap();
        assert_eq!(backend.name(), "synchronous");
        assert!(create_proactor_backend("no-such-backend").is_err());
    }
}
