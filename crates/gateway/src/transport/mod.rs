//! Transport module for datagram media.
//!
//! A transport moves opaque datagrams between devices and the gateway. It
//! never looks inside them; everything protocol related happens in the
//! dispatcher.
//!
//! - [`udp`]: UDP socket, usually facing a LoRa packet forwarder
//! - [`memory`]: in-process channel pair, used by tests and local tooling

pub mod memory;
pub mod udp;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by transports and the transport registry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket failure.
    #[error("transport '{name}' I/O error: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The transport configuration is unusable.
    #[error("transport '{name}' misconfigured: {reason}")]
    InvalidConfig { name: String, reason: String },

    /// Operation requires a started transport.
    #[error("transport '{0}' is not running")]
    NotRunning(String),

    /// The transport was already started once.
    #[error("transport '{0}' already started")]
    AlreadyStarted(String),

    /// The peer side of an in-process transport is gone.
    #[error("transport '{0}' is closed")]
    Closed(String),

    /// A transport with this name is already registered.
    #[error("transport '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Future returned by [`Transport::start`].
pub type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// A physical medium delivering datagrams to and from devices.
///
/// Implementations are shared behind `Arc<dyn Transport>`: the runtime owns
/// them through the [`TransportRegistry`] and device records keep a
/// reference to the one they were last heard on.
pub trait Transport: Send + Sync {
    /// Unique instance name from configuration.
    fn name(&self) -> &str;

    /// Kind of medium, e.g. `"udp"`.
    fn kind(&self) -> &'static str;

    /// Opens the medium and begins filling the receive queue.
    fn start(&self) -> StartFuture<'_>;

    /// Stops reading and releases the medium. Idempotent.
    fn stop(&self);

    /// Sends one datagram without blocking.
    fn send(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// Hands out the queue of received datagrams.
    ///
    /// Returns `None` once the queue has been taken.
    fn receive(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind(), self.name())
    }
}

/// Name to instance table of transports, built at startup.
#[derive(Default)]
pub struct TransportRegistry {
    transports: DashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transport` under its own name.
    pub fn add(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        let name = transport.name().to_string();
        match self.transports.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(TransportError::AlreadyRegistered(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                tracing::debug!(name = %entry.key(), kind = transport.kind(), "Transport registered");
                entry.insert(transport);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).map(|t| Arc::clone(t.value()))
    }

    /// Every transport, ordered by name.
    pub fn all(&self) -> Vec<Arc<dyn Transport>> {
        let mut all: Vec<Arc<dyn Transport>> =
            self.transports.iter().map(|t| Arc::clone(t.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

pub use memory::{MemoryPeer, MemoryTransport};
pub use udp::{UdpTransport, DEFAULT_MAX_PACKET_SIZE};
