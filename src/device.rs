//! External collaborator interfaces: devices, the handlers that back them,
//! and the registry the embedder populates before constructing a
//! [`crate::dataplane::DataPlane`]. Everything in this module is implemented
//! by the embedder; the core only calls through these traits.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reading::{ReadContext, Reading, WriteData};

/// Stable identifier for one externally managed device. Devices are looked
/// up by this id throughout the engine (current readings map, registry
/// lookups, read-stream filters).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Error surface for embedder-supplied callbacks (`Read`, `BulkRead`,
/// `Write`, `Listen`). `UnsupportedCommand` is swallowed silently on the read
/// path (§7) to avoid flooding logs on tight polling loops; `Io` is logged
/// and, on the write path, recorded onto the transaction.
#[derive(Clone, Debug, Error)]
pub enum HandlerError {
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("{0}")]
    Io(String),
}

impl HandlerError {
    pub fn message(&self) -> String {
        match self {
            HandlerError::UnsupportedCommand(msg) | HandlerError::Io(msg) => msg.clone(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, HandlerError::UnsupportedCommand(_))
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

type ReadFn = dyn Fn(Arc<dyn Device>) -> BoxFuture<'static, HandlerResult<Vec<Reading>>> + Send + Sync;
type BulkReadFn =
    dyn Fn(Vec<Arc<dyn Device>>) -> BoxFuture<'static, HandlerResult<Vec<ReadContext>>> + Send + Sync;
type WriteFn = dyn Fn(Arc<dyn Device>, WriteData) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync;
type ListenFn = dyn Fn(Arc<dyn Device>, tokio::sync::mpsc::Sender<ReadContext>) -> BoxFuture<'static, HandlerResult<()>>
    + Send
    + Sync;

/// A named group of user-supplied callbacks shared by every device of the
/// same kind. Each callback is optional; capability predicates derive from
/// which ones are present. `can_bulk_read` holds iff `bulk_read` is set and
/// `read` is not — a handler that defines both is expected to serve reads
/// per-device and leave bulk batching to callers that ask for it explicitly
/// by omitting `read`.
pub struct DeviceHandler {
    pub name: String,
    pub read: Option<Arc<ReadFn>>,
    pub bulk_read: Option<Arc<BulkReadFn>>,
    pub write: Option<Arc<WriteFn>>,
    pub listen: Option<Arc<ListenFn>>,
}

impl fmt::Debug for DeviceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("name", &self.name)
            .field("has_read", &self.read.is_some())
            .field("has_bulk_read", &self.bulk_read.is_some())
            .field("has_write", &self.write.is_some())
            .field("has_listen", &self.listen.is_some())
            .finish()
    }
}

impl DeviceHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read: None,
            bulk_read: None,
            write: None,
            listen: None,
        }
    }

    pub fn with_read(mut self, f: impl Fn(Arc<dyn Device>) -> BoxFuture<'static, HandlerResult<Vec<Reading>>> + Send + Sync + 'static) -> Self {
        self.read = Some(Arc::new(f));
        self
    }

    pub fn with_bulk_read(
        mut self,
        f: impl Fn(Vec<Arc<dyn Device>>) -> BoxFuture<'static, HandlerResult<Vec<ReadContext>>> + Send + Sync + 'static,
    ) -> Self {
        self.bulk_read = Some(Arc::new(f));
        self
    }

    pub fn with_write(
        mut self,
        f: impl Fn(Arc<dyn Device>, WriteData) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync + 'static,
    ) -> Self {
        self.write = Some(Arc::new(f));
        self
    }

    pub fn with_listen(
        mut self,
        f: impl Fn(Arc<dyn Device>, tokio::sync::mpsc::Sender<ReadContext>) -> BoxFuture<'static, HandlerResult<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.listen = Some(Arc::new(f));
        self
    }

    /// `CanBulkRead ≡ (BulkRead defined ∧ Read not defined)` (§3).
    pub fn can_bulk_read(&self) -> bool {
        self.bulk_read.is_some() && self.read.is_none()
    }

    pub fn can_read(&self) -> bool {
        self.read.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.write.is_some()
    }

    pub fn can_listen(&self) -> bool {
        self.listen.is_some()
    }
}

/// One externally managed physical or virtual endpoint. Ownership: the
/// registry owns devices for the process lifetime; the core only ever holds
/// `Arc<dyn Device>` handles.
pub trait Device: Send + Sync + fmt::Debug {
    fn id(&self) -> &DeviceId;

    fn handler(&self) -> &Arc<DeviceHandler>;

    /// Absolute deadline applied to this device's `Write` callback (§4.4.2).
    fn write_timeout(&self) -> Duration;

    fn is_readable(&self) -> bool {
        self.handler().can_read()
    }

    fn is_writable(&self) -> bool {
        self.handler().can_write()
    }

    fn is_bulk_readable(&self) -> bool {
        self.handler().can_bulk_read()
    }

    fn is_listenable(&self) -> bool {
        self.handler().can_listen()
    }
}

/// Lookup surface the scheduler and state manager need over the embedder's
/// populated device set: by id, by handler, and in full for fan-out.
pub trait DeviceRegistry: Send + Sync {
    fn get(&self, id: &DeviceId) -> Option<Arc<dyn Device>>;

    fn devices(&self) -> Vec<Arc<dyn Device>>;

    fn handlers(&self) -> Vec<Arc<DeviceHandler>>;

    fn devices_for_handler(&self, handler_name: &str) -> Vec<Arc<dyn Device>> {
        self.devices()
            .into_iter()
            .filter(|d| d.handler().name == handler_name)
            .collect()
    }
}

/// A simple in-process registry, useful for embedders that assemble devices
/// at startup from configuration and for tests.
#[derive(Default)]
pub struct InMemoryDeviceRegistry {
    devices: Vec<Arc<dyn Device>>,
    handlers: Vec<Arc<DeviceHandler>>,
}

impl InMemoryDeviceRegistry {
    pub fn new(devices: Vec<Arc<dyn Device>>, handlers: Vec<Arc<DeviceHandler>>) -> Self {
        Self { devices, handlers }
    }
}

impl DeviceRegistry for InMemoryDeviceRegistry {
    fn get(&self, id: &DeviceId) -> Option<Arc<dyn Device>> {
        self.devices.iter().find(|d| d.id() == id).cloned()
    }

    fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices.clone()
    }

    fn handlers(&self) -> Vec<Arc<DeviceHandler>> {
        self.handlers.clone()
    }
}
