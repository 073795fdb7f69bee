//! Consumers of decoded device payloads.
//!
//! A handler is attached to devices by name. The dispatcher calls every
//! attached handler, in attachment order, for each accepted message. A
//! failing handler never prevents the next one from running.

pub mod logger;

use std::sync::Arc;

use dashmap::DashMap;
use protocol::DevicePayload;
use thiserror::Error;

use crate::devices::Device;

pub use logger::LoggingHandler;

/// Errors raised by handlers and the handler registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandlerError {
    /// A handler with this name is already registered.
    #[error("handler '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The handler received a payload type it does not understand.
    #[error("handler '{handler}' cannot process payload type '{type_name}'")]
    UnexpectedPayload { handler: String, type_name: String },

    /// Processing failed.
    #[error("handler '{handler}' failed: {reason}")]
    Failed { handler: String, reason: String },
}

/// Receives payloads from the devices it is attached to.
pub trait Handler: Send + Sync {
    /// Unique handler name, used in configuration and persisted records.
    fn name(&self) -> &str;

    /// Called once the handler is attached to a committed device record.
    fn on_device_attached(&self, device: &Device);

    /// Processes one accepted payload from `device`.
    fn process_message(
        &self,
        device: &Device,
        payload: &dyn DevicePayload,
    ) -> Result<(), HandlerError>;
}

/// Name to instance table of handlers, built at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the handlers shipped with the gateway.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry
            .handlers
            .insert(logger::NAME.to_string(), Arc::new(LoggingHandler::new()));
        registry
    }

    /// Registers `handler` under its own name.
    pub fn add(&self, handler: Arc<dyn Handler>) -> Result<(), HandlerError> {
        let name = handler.name().to_string();
        match self.handlers.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(HandlerError::AlreadyRegistered(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                tracing::debug!(name = %entry.key(), "Handler registered");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    /// Registered names in lexical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
