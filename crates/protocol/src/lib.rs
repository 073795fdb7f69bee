//! # Open IoT Protocol Library
//!
//! Wire format shared by the gateway and constrained IoT devices.
//!
//! ## Overview
//!
//! The protocol crate knows nothing about device state. It provides:
//!
//! - **Message Definitions**: Header, MessageInfo and onboarding messages (protobuf)
//! - **Framing**: varint length-delimited frames
//! - **Ciphers**: plain, AES-128-ECB and AES-128-CBC bodies with random padding
//! - **Key Agreement**: the per-byte Diffie-Hellman exchange used when onboarding
//! - **Message Types**: runtime registry of device payload decoders
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Device Payloads              │  protobuf, resolved by type name
//! ├─────────────────────────────────────────┤
//! │      MessageInfo (sequence, date)       │
//! ├─────────────────────────────────────────┤
//! │           Body Encryption               │  AES-128 ECB / CBC, or plain
//! ├─────────────────────────────────────────┤
//! │      Header (device id, CRC32)          │  always plain
//! ├─────────────────────────────────────────┤
//! │           Transport (UDP)               │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{make_ready_to_send_message, EncryptionType, Header, JoinRequest, MessageReader};
//!
//! let request = JoinRequest {
//!     name: "Kitchen sensor".to_string(),
//!     ..Default::default()
//! };
//! let datagram = make_ready_to_send_message(
//!     Header::join_request(0x1f),
//!     EncryptionType::Plain,
//!     &[],
//!     &[],
//!     &[&request],
//! )
//! .unwrap();
//!
//! let mut reader = MessageReader::new(datagram);
//! let header: Header = reader.read().unwrap();
//! assert!(header.join_request);
//! let decoded: JoinRequest = reader.read().unwrap();
//! assert_eq!(decoded.name, "Kitchen sensor");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`framing`]: Length-delimited frames
//! - [`cipher`]: Body encryption
//! - [`codec`]: Datagram assembly and CRC
//! - [`dh`]: Per-byte Diffie-Hellman
//! - [`schema`]: Device payload type registry
//! - [`error`]: Error types

pub mod cipher;
pub mod codec;
pub mod dh;
pub mod error;
pub mod framing;
pub mod messages;
pub mod schema;

pub use cipher::BLOCK_SIZE;
pub use codec::{
    crc32, decrypt_and_read, make_ready_to_send_device_message, make_ready_to_send_message,
    write_and_encrypt,
};
pub use dh::{DhParams, KeyPair};
pub use error::{ProtocolError, Result};
pub use framing::{read_frame, read_message, write_frame, write_message, MessageReader, WireMessage};
pub use messages::{
    EncryptionType, Header, HeaderKind, JoinRequest, JoinResponse, KeyExchangeRequest,
    KeyExchangeResponse, MessageInfo, KEY_SIZE,
};
pub use schema::{
    downcast, ClimateSensor, Counter, DevicePayload, MessageTypeRegistry, NamedMessage,
    PayloadDecoder, Switch,
};
