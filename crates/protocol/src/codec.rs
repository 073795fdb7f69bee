//! Composition of framing, encryption and integrity checking.
//!
//! # Datagram Layout
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ varint len + Header  │  body: frame, frame, ... [+ padding]     │
//! │ (never encrypted)    │  (encrypted per mode, covered by CRC32)  │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```

use bytes::Bytes;
use chrono::NaiveDateTime;

use crate::cipher;
use crate::error::Result;
use crate::framing::{write_message, MessageReader, WireMessage};
use crate::messages::{EncryptionType, Header, MessageInfo};

/// CRC32 (IEEE) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Frames every message into one buffer and encrypts it as a whole.
pub fn write_and_encrypt(
    mode: EncryptionType,
    key: &[u8],
    iv: &[u8],
    messages: &[&dyn WireMessage],
) -> Result<Vec<u8>> {
    let mut plaintext = Vec::new();
    for message in messages {
        message.write_to(&mut plaintext)?;
    }
    cipher::encrypt(mode, key, iv, plaintext)
}

/// Decrypts `body` and returns a reader over the contained frames.
pub fn decrypt_and_read(
    mode: EncryptionType,
    key: &[u8],
    iv: &[u8],
    body: Bytes,
) -> Result<MessageReader> {
    let plaintext = cipher::decrypt(mode, key, iv, body)?;
    Ok(MessageReader::new(plaintext))
}

/// Builds a complete datagram: the header with its CRC filled in, followed
/// by the encrypted body.
pub fn make_ready_to_send_message(
    mut header: Header,
    mode: EncryptionType,
    key: &[u8],
    iv: &[u8],
    messages: &[&dyn WireMessage],
) -> Result<Vec<u8>> {
    let body = write_and_encrypt(mode, key, iv, messages)?;
    header.crc = crc32(&body);

    let mut datagram = Vec::with_capacity(body.len() + 16);
    write_message(&mut datagram, &header)?;
    datagram.extend_from_slice(&body);
    Ok(datagram)
}

/// Builds a regular device datagram carrying `payload`.
///
/// `sequence` must already be the incremented send counter of the device.
pub fn make_ready_to_send_device_message(
    device_id: u64,
    sequence: u32,
    at: &NaiveDateTime,
    mode: EncryptionType,
    key: &[u8],
    iv: &[u8],
    payload: &dyn WireMessage,
) -> Result<Vec<u8>> {
    let info = MessageInfo::stamped(sequence, at);
    make_ready_to_send_message(Header::for_device(device_id), mode, key, iv, &[&info, payload])
}
