//! Persistent device storage.
//!
//! Registered devices are saved to a TOML file so they survive restarts:
//!
//! ```toml
//! version = 1
//!
//! [[device]]
//! id = "0x1f"
//! name = "Porch sensor"
//! message_type = "openiot.ClimateSensor"
//! key = "000102030405060708090a0b0c0d0e0f"
//! encryption = "aes_ecb"
//! handlers = ["logger"]
//! transport = "lora"
//! sequence_send = 3
//! sequence_receive = 118
//! ```
//!
//! Handlers and transports are stored by name and resolved against the
//! registries on load.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::EncryptionType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::{Device, DeviceId};
use super::registry::DeviceRegistry;
use crate::handlers::HandlerRegistry;
use crate::transport::TransportRegistry;

/// Current file format version.
const STORE_VERSION: u32 = 1;

/// Problems with the content of a devices file.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("unsupported devices file version {0}")]
    UnsupportedVersion(u32),

    #[error("device entry {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    /// A record names a handler that is not registered.
    #[error("device {device_id}: unknown handler '{handler}'")]
    UnknownHandler { device_id: DeviceId, handler: String },
}

/// On-disk representation of one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
struct DeviceRecord {
    id: String,
    name: String,
    manufacturer: String,
    product_url: String,
    protobuf_url: String,
    message_type: String,
    key: String,
    encryption: String,
    handlers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transport: Option<String>,
    sequence_send: u32,
    sequence_receive: u32,
}

/// Wrapper for serializing the device file.
#[derive(Debug, Serialize, Deserialize)]
struct DevicesFile {
    /// Version of the file format (for future migrations).
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default, rename = "device")]
    devices: Vec<DeviceRecord>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl From<&Device> for DeviceRecord {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.to_string(),
            name: device.name.clone(),
            manufacturer: device.manufacturer.clone(),
            product_url: device.product_url.clone(),
            protobuf_url: device.protobuf_url.clone(),
            message_type: device.message_type.clone(),
            key: hex::encode(&device.key),
            encryption: device.encryption.as_config_str().to_string(),
            handlers: device.handler_names(),
            transport: device.transport().map(|t| t.name().to_string()),
            sequence_send: device.sequence_send,
            sequence_receive: device.sequence_receive,
        }
    }
}

impl DeviceRecord {
    fn into_device(
        self,
        index: usize,
        handlers: &HandlerRegistry,
        transports: &TransportRegistry,
    ) -> Result<Device, StoreError> {
        let invalid = |reason: String| StoreError::InvalidRecord { index, reason };

        let id: DeviceId = self.id.parse().map_err(|e| invalid(format!("{}", e)))?;
        let key = hex::decode(&self.key).map_err(|e| invalid(format!("invalid key: {}", e)))?;
        let encryption = if self.encryption.is_empty() {
            EncryptionType::Plain
        } else {
            EncryptionType::from_config_str(&self.encryption)
                .ok_or_else(|| invalid(format!("unknown encryption '{}'", self.encryption)))?
        };

        let mut device = Device::new(id);
        device.name = self.name;
        device.manufacturer = self.manufacturer;
        device.product_url = self.product_url;
        device.protobuf_url = self.protobuf_url;
        device.message_type = self.message_type;
        device.key = key;
        device.encryption = encryption;
        device.sequence_send = self.sequence_send;
        device.sequence_receive = self.sequence_receive;

        for name in self.handlers {
            let handler = handlers
                .find(&name)
                .ok_or_else(|| StoreError::UnknownHandler {
                    device_id: id,
                    handler: name.clone(),
                })?;
            device
                .attach_handler(handler)
                .map_err(|e| invalid(e.to_string()))?;
        }

        if let Some(name) = self.transport {
            match transports.find(&name) {
                Some(transport) => device.set_transport(transport),
                None => {
                    tracing::warn!(device_id = %id, transport = %name, "Unknown transport in devices file, leaving unset");
                }
            }
        }

        Ok(device)
    }
}

/// Reads devices from `path`, resolving handler and transport names.
///
/// A missing file yields no devices.
pub fn load_devices<P: AsRef<Path>>(
    path: P,
    handlers: &HandlerRegistry,
    transports: &TransportRegistry,
) -> Result<Vec<Device>> {
    let path = path.as_ref();

    if !path.exists() {
        tracing::debug!("Devices file not found at {:?}, starting empty", path);
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read devices file: {}", path.display()))?;

    let file: DevicesFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse devices file: {}", path.display()))?;

    if file.version > STORE_VERSION {
        return Err(StoreError::UnsupportedVersion(file.version).into());
    }

    let devices = file
        .devices
        .into_iter()
        .enumerate()
        .map(|(index, record)| record.into_device(index, handlers, transports))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid devices file: {}", path.display()))?;

    tracing::info!("Loaded {} devices from {:?}", devices.len(), path);
    Ok(devices)
}

/// Writes `devices` to `path`.
///
/// Uses atomic write (write to temp file, then rename) to prevent corruption.
/// Creates parent directories if they don't exist.
pub fn save_devices<P: AsRef<Path>>(path: P, devices: &[Device]) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create devices directory: {}", parent.display())
        })?;
    }

    let file = DevicesFile {
        version: STORE_VERSION,
        devices: devices.iter().map(DeviceRecord::from).collect(),
    };
    let contents = toml::to_string_pretty(&file).context("Failed to serialize devices")?;

    let temp_path = temp_path(path);
    fs::write(&temp_path, &contents)
        .with_context(|| format!("Failed to write temp devices file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename temp devices file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    tracing::debug!("Saved {} devices to {:?}", devices.len(), path);
    Ok(())
}

/// Loads `path` into `registry`, replacing its content, and notifies every
/// attached handler. Returns the number of devices loaded.
pub fn load_into<P: AsRef<Path>>(
    path: P,
    registry: &DeviceRegistry,
    handlers: &HandlerRegistry,
    transports: &TransportRegistry,
) -> Result<usize> {
    let devices = load_devices(path, handlers, transports)?;
    let count = devices.len();
    registry.replace_all(devices.clone())?;

    for device in &devices {
        for handler in device.handlers() {
            handler.on_device_attached(device);
        }
    }
    Ok(count)
}

/// Saves a snapshot of `registry` to `path`. Returns the number of devices
/// written.
pub fn save_from<P: AsRef<Path>>(path: P, registry: &DeviceRegistry) -> Result<usize> {
    let devices = registry.all()?;
    save_devices(path, &devices)?;
    Ok(devices.len())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
