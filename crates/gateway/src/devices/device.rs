//! The device record tracked by the gateway.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use protocol::EncryptionType;
use thiserror::Error;

use crate::handlers::Handler;
use crate::transport::Transport;

/// 64-bit identifier of a physical device.
///
/// Displayed and persisted as lowercase hex with a `0x` prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub u64);

impl DeviceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:#x})", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceError;

    /// Accepts `0x` prefixed hex or plain decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed
            .map(DeviceId)
            .map_err(|_| DeviceError::InvalidId(s.to_string()))
    }
}

/// Errors raised when building or mutating a device record.
#[derive(Debug, Error, PartialEq)]
pub enum DeviceError {
    /// The identifier string could not be parsed.
    #[error("invalid device id '{0}'")]
    InvalidId(String),

    /// A handler with the same name is already attached.
    #[error("handler '{handler}' is already attached to device {device_id}")]
    DuplicateHandler { device_id: DeviceId, handler: String },
}

/// A registered device.
///
/// Records are owned by [`super::DeviceRegistry`]; everything else works on
/// snapshots obtained through lookups.
#[derive(Clone)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub manufacturer: String,
    pub product_url: String,
    pub protobuf_url: String,
    /// Name of the payload type this device emits.
    pub message_type: String,
    /// Symmetric key; empty for plain devices.
    pub key: Vec<u8>,
    pub encryption: EncryptionType,
    /// Incremented before every message sent to the device.
    pub sequence_send: u32,
    /// Highest sequence accepted from the device.
    pub sequence_receive: u32,
    handlers: Vec<Arc<dyn Handler>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Device {
    /// Creates an empty plain-text record for `id`.
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            name: String::new(),
            manufacturer: String::new(),
            product_url: String::new(),
            protobuf_url: String::new(),
            message_type: String::new(),
            key: Vec::new(),
            encryption: EncryptionType::Plain,
            sequence_send: 0,
            sequence_receive: 0,
            handlers: Vec::new(),
            transport: None,
        }
    }

    /// Name for logs: the announced name, or the id when none was given.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    /// IV used for CBC traffic. Devices chain from their own key.
    pub fn iv(&self) -> &[u8] {
        &self.key
    }

    /// Appends `handler`, rejecting a name already present.
    ///
    /// The caller notifies the handler once the record is committed.
    pub fn attach_handler(&mut self, handler: Arc<dyn Handler>) -> Result<(), DeviceError> {
        if self.has_handler(handler.name()) {
            return Err(DeviceError::DuplicateHandler {
                device_id: self.id,
                handler: handler.name().to_string(),
            });
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.iter().any(|h| h.name() == name)
    }

    /// Attached handlers in attachment order.
    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    /// Transport the device was last heard on.
    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("manufacturer", &self.manufacturer)
            .field("message_type", &self.message_type)
            .field("encryption", &self.encryption)
            .field("key", &"[REDACTED]")
            .field("handlers", &self.handler_names())
            .field("transport", &self.transport.as_ref().map(|t| t.name().to_string()))
            .field("sequence_send", &self.sequence_send)
            .field("sequence_receive", &self.sequence_receive)
            .finish()
    }
}
