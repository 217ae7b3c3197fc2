//! Device catalog
//!
//! Maps device type names to factories and stream handlers. Names are
//! explicit tags supplied at registration, looked up case-insensitively.
//! There is no process-wide registry: the server owns a catalog instance
//! and tests build their own.

use crate::{Keyboard, Mouse, SteamDeck, Xbox360};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use usb::device::Device;
use usb::stream::run_device_stream;

pub type DeviceFactory = fn() -> Arc<dyn Device>;

pub type StreamFuture = Pin<Box<dyn Future<Output = common::Result<()>> + Send>>;

/// Takes ownership of an upgraded management connection and runs it as the
/// device's stream.
pub type StreamHandler = fn(TcpStream, Arc<dyn Device>) -> StreamFuture;

/// Factory and stream handler of one device type.
#[derive(Clone, Copy)]
pub struct Registration {
    pub type_name: &'static str,
    pub factory: DeviceFactory,
    pub stream_handler: StreamHandler,
}

impl Registration {
    /// Registration using the shared frame pump as stream handler.
    pub fn new(type_name: &'static str, factory: DeviceFactory) -> Self {
        Self {
            type_name,
            factory,
            stream_handler: default_stream_handler,
        }
    }
}

fn default_stream_handler(stream: TcpStream, dev: Arc<dyn Device>) -> StreamFuture {
    Box::pin(run_device_stream(stream, dev))
}

/// Registry of known device types.
pub struct Catalog {
    entries: RwLock<HashMap<String, Registration>>,
}

impl Catalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A catalog with every built-in device type registered.
    pub fn with_builtin() -> Self {
        let catalog = Self::new();
        catalog.register(Registration::new("keyboard", || Arc::new(Keyboard::new())));
        catalog.register(Registration::new("mouse", || Arc::new(Mouse::new())));
        catalog.register(Registration::new("xbox360", || Arc::new(Xbox360::new())));
        catalog.register(Registration::new("steamdeck", || {
            Arc::new(SteamDeck::new())
        }));
        catalog
    }

    /// Register a device type. A second registration under the same name
    /// overrides the first.
    pub fn register(&self, registration: Registration) {
        let key = registration.type_name.to_ascii_lowercase();
        self.entries.write().unwrap().insert(key, registration);
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Registration> {
        self.entries
            .read()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .copied()
    }

    /// Sorted list of registered type names.
    pub fn device_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every registration (used by tests).
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::with_builtin()
    }
}
