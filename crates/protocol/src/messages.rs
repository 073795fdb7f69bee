//! Wire message definitions for the Open IoT device protocol.
//!
//! Every datagram starts with a plain [`Header`], followed by a sequence of
//! length-delimited protobuf messages. Onboarding uses the key exchange and
//! join messages; regular device traffic prefixes every payload with a
//! [`MessageInfo`].

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::{ProtocolError, Result};

/// Size of the symmetric key, and of the Diffie-Hellman public value arrays.
pub const KEY_SIZE: usize = 16;

// ============================================================================
// Header
// ============================================================================

/// First frame of every datagram, never encrypted.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    /// Device the datagram belongs to.
    #[prost(uint64, tag = "1")]
    pub device_id: u64,
    /// CRC32 (IEEE) over every byte after the header frame.
    #[prost(uint32, tag = "2")]
    pub crc: u32,
    /// Datagram carries a key exchange request or response.
    #[prost(bool, tag = "3")]
    pub key_exchange: bool,
    /// Datagram carries a join request or response.
    #[prost(bool, tag = "4")]
    pub join_request: bool,
}

/// What a datagram carries, according to its header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Regular message from a registered device.
    Message,
    /// First onboarding step.
    KeyExchange,
    /// Second onboarding step.
    JoinRequest,
}

impl Header {
    /// Header for a regular device message.
    pub fn for_device(device_id: u64) -> Self {
        Self {
            device_id,
            ..Default::default()
        }
    }

    /// Header flagged as key exchange.
    pub fn key_exchange(device_id: u64) -> Self {
        Self {
            device_id,
            key_exchange: true,
            ..Default::default()
        }
    }

    /// Header flagged as join request.
    pub fn join_request(device_id: u64) -> Self {
        Self {
            device_id,
            join_request: true,
            ..Default::default()
        }
    }

    /// Classifies the datagram, rejecting headers with both onboarding flags.
    pub fn kind(&self) -> Result<HeaderKind> {
        match (self.key_exchange, self.join_request) {
            (true, true) => Err(ProtocolError::ConflictingHeaderFlags {
                device_id: self.device_id,
            }),
            (true, false) => Ok(HeaderKind::KeyExchange),
            (false, true) => Ok(HeaderKind::JoinRequest),
            (false, false) => Ok(HeaderKind::Message),
        }
    }
}

// ============================================================================
// Message Info
// ============================================================================

/// Per-message metadata preceding every device payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageInfo {
    /// Sender-assigned, strictly increasing sequence number.
    #[prost(uint32, tag = "1")]
    pub sequence: u32,
    /// BCD packed date: `YY MM DD WD` from high to low byte.
    #[prost(uint32, tag = "2")]
    pub date: u32,
    /// BCD packed time: `00 HH MM SS` from high to low byte.
    #[prost(uint32, tag = "3")]
    pub time: u32,
}

impl MessageInfo {
    /// Creates a message info stamped with the given wall-clock time.
    pub fn stamped(sequence: u32, at: &NaiveDateTime) -> Self {
        Self {
            sequence,
            date: encode_date(at),
            time: encode_time(at),
        }
    }
}

/// Packs a calendar date as BCD, with the ISO weekday (Monday = 1,
/// Sunday = 7) in the low byte.
pub fn encode_date(at: &NaiveDateTime) -> u32 {
    let mut packed = at.weekday().number_from_monday();
    packed |= int_to_bcd(at.day()) << 8;
    packed |= int_to_bcd(at.month()) << 16;
    packed |= int_to_bcd_signed(at.year() - 2000) << 24;
    packed
}

/// Packs hours, minutes and seconds as BCD.
pub fn encode_time(at: &NaiveDateTime) -> u32 {
    let mut packed = int_to_bcd(at.second());
    packed |= int_to_bcd(at.minute()) << 8;
    packed |= int_to_bcd(at.hour()) << 16;
    packed
}

/// Two-digit BCD. Values above 99 encode as 0.
pub fn int_to_bcd(value: u32) -> u32 {
    if value > 99 {
        return 0;
    }
    ((value / 10) << 4) | (value % 10)
}

fn int_to_bcd_signed(value: i32) -> u32 {
    u32::try_from(value).map(int_to_bcd).unwrap_or(0)
}

// ============================================================================
// Onboarding Messages
// ============================================================================

/// Encryption applied to the messages following the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EncryptionType {
    /// No encryption.
    Plain = 0,
    /// AES-128, each block encrypted independently.
    AesEcb = 1,
    /// AES-128, cipher block chaining.
    AesCbc = 2,
}

impl EncryptionType {
    /// Converts a raw wire value, failing for modes this build does not know.
    pub fn from_wire(value: i32) -> Result<Self> {
        Ok(Self::try_from(value)?)
    }

    /// Lowercase name used in configuration files and logs.
    pub fn as_config_str(&self) -> &'static str {
        match self {
            EncryptionType::Plain => "plain",
            EncryptionType::AesEcb => "aes_ecb",
            EncryptionType::AesCbc => "aes_cbc",
        }
    }

    /// Parses the configuration name produced by [`Self::as_config_str`].
    pub fn from_config_str(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(EncryptionType::Plain),
            "aes_ecb" => Some(EncryptionType::AesEcb),
            "aes_cbc" => Some(EncryptionType::AesCbc),
            _ => None,
        }
    }
}

/// First onboarding step sent by a device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyExchangeRequest {
    /// Diffie-Hellman modulus.
    #[prost(uint64, tag = "1")]
    pub dh_p: u64,
    /// Diffie-Hellman generator.
    #[prost(uint64, tag = "2")]
    pub dh_g: u64,
    /// Device public values, one per key byte.
    #[prost(uint32, repeated, tag = "3")]
    pub dh_a: Vec<u32>,
    /// Encryption mode the device wants to use once joined.
    #[prost(enumeration = "EncryptionType", tag = "4")]
    pub encryption_type: i32,
}

/// Gateway reply to a key exchange request. Always sent unencrypted.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyExchangeResponse {
    /// Gateway public values, one per key byte.
    #[prost(uint32, repeated, tag = "1")]
    pub dh_b: Vec<u32>,
}

/// Second onboarding step, describing the device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub manufacturer: String,
    #[prost(string, tag = "3")]
    pub product_url: String,
    #[prost(string, tag = "4")]
    pub protobuf_url: String,
    /// Handler the device would like to be attached to, if any.
    #[prost(string, tag = "5")]
    pub default_handler: String,
}

/// Gateway reply to a join request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinResponse {
    /// Name of the gateway.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Gateway time as Unix seconds.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}
