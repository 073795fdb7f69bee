//! # Open IoT Gateway Library
//!
//! Server side of the Open IoT device protocol. Small battery powered
//! devices send datagrams over LoRa or UDP; the gateway onboards them,
//! authenticates and decrypts their messages, and hands the decoded payloads
//! to handlers.
//!
//! ## Overview
//!
//! - **Device Registry**: every registered device with its key, mode and counters
//! - **Onboarding**: per-byte Diffie-Hellman key exchange and join
//! - **Dispatcher**: header and CRC checks, decryption, replay protection, handler fan-out
//! - **Transports**: UDP sockets and in-process channel pairs
//! - **Handlers**: named payload consumers attached to devices
//! - **Runtime**: forwarders, worker pool, periodic persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Runtime                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Transports  │─▶│ Intake queue │─▶│       Workers        │   │
//! │  │  (UDP, mem)  │  │  (bounded)   │  │                      │   │
//! │  └──────────────┘  └──────────────┘  └──────────┬───────────┘   │
//! │                                                 ▼               │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                       Dispatcher                           │ │
//! │  └──────┬───────────────────────┬─────────────────────┬───────┘ │
//! │         ▼                       ▼                     ▼         │
//! │  ┌──────────────┐  ┌───────────────────────┐  ┌─────────────┐   │
//! │  │  Onboarding  │  │    Device Registry    │  │  Handlers   │   │
//! │  │  + key cache │  │  (persisted as TOML)  │  │             │   │
//! │  └──────────────┘  └───────────────────────┘  └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway::{Config, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load(gateway::config::default_config_path())?;
//!     config.apply_env_overrides();
//!
//!     let runtime = Runtime::new(config)?;
//!     runtime.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     runtime.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`devices`]: Device records, registry and persistence
//! - [`onboarding`]: Key exchange and join
//! - [`dispatcher`]: Inbound datagram processing
//! - [`handlers`]: Payload consumers
//! - [`transport`]: Datagram media
//! - [`runtime`]: Task wiring and lifecycle

pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod handlers;
pub mod onboarding;
pub mod runtime;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use devices::{Device, DeviceError, DeviceId, DeviceRegistry, RegistryError, StoreError};
pub use dispatcher::{DispatchError, Dispatched, Dispatcher};
pub use handlers::{Handler, HandlerError, HandlerRegistry, LoggingHandler};
pub use onboarding::{KeyExchangeCache, Onboarding, OnboardingError, OnboardingState};
pub use runtime::{Runtime, RuntimeEvent, RuntimeState};
pub use transport::{
    MemoryPeer, MemoryTransport, Transport, TransportError, TransportRegistry, UdpTransport,
};
