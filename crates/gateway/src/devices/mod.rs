//! Device management module.
//!
//! This module provides the device record, the in-memory registry that owns
//! every record, and persistence of the registry to disk.

pub mod device;
pub mod registry;
pub mod store;

pub use device::{Device, DeviceError, DeviceId};
pub use registry::{DeviceRegistry, RegistryError, RegistryResult};
pub use store::{load_devices, load_into, save_devices, save_from, StoreError};
