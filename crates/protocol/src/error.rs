//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Framing errors
    /// A length prefix declared more bytes than the buffer holds.
    #[error("truncated input: message declares {declared} bytes, only {available} available")]
    TruncatedInput {
        /// Length declared by the varint prefix.
        declared: usize,
        /// Bytes remaining in the buffer.
        available: usize,
    },

    /// The varint length prefix itself could not be read.
    #[error("invalid length prefix: {0}")]
    InvalidLengthPrefix(String),

    /// The message body was not a valid encoding of the requested type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A header claimed to be both a key exchange and a join request.
    #[error("header for device {device_id:#x} sets both key exchange and join request flags")]
    ConflictingHeaderFlags {
        /// Device identifier carried by the header.
        device_id: u64,
    },

    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    // Cipher errors
    /// The requested encryption mode is not known to this implementation.
    #[error("encryption type {0} is not supported")]
    UnsupportedEncryption(i32),

    /// The symmetric key has the wrong length for the cipher.
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length supplied.
        got: usize,
    },

    /// The initialization vector has the wrong length.
    #[error("invalid IV length: expected {expected} bytes, got {got}")]
    InvalidIvLength {
        /// Required IV length.
        expected: usize,
        /// Length supplied.
        got: usize,
    },

    /// Ciphertext length is not a multiple of the cipher block size.
    #[error("buffer of {len} bytes is not aligned to block size {block}")]
    MisalignedCiphertext {
        /// Ciphertext length.
        len: usize,
        /// Cipher block size.
        block: usize,
    },

    // Key exchange errors
    /// Diffie-Hellman modulus cannot be used for modular arithmetic.
    #[error("invalid Diffie-Hellman modulus: {0}")]
    InvalidModulus(u64),

    // Message type errors
    /// No decoder is registered under the given type name.
    #[error("message type '{0}' is not registered")]
    UnknownMessageType(String),

    /// A decoder is already registered under the given type name.
    #[error("message type '{0}' is already registered")]
    DuplicateMessageType(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<prost::DecodeError> for ProtocolError {
    fn from(err: prost::DecodeError) -> Self {
        ProtocolError::MalformedPayload(err.to_string())
    }
}

impl From<prost::EncodeError> for ProtocolError {
    fn from(err: prost::EncodeError) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<prost::UnknownEnumValue> for ProtocolError {
    fn from(err: prost::UnknownEnumValue) -> Self {
        ProtocolError::UnsupportedEncryption(err.0)
    }
}
