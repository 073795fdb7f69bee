//! Block encryption of framed message bodies.
//!
//! Both AES modes use a 128-bit key and pad the plaintext with random bytes
//! up to a multiple of [`BLOCK_SIZE`]. The padding is never stripped: frame
//! length prefixes tell the reader where the messages end.
//!
//! ECB encrypts each block on its own, so identical plaintext blocks yield
//! identical ciphertext blocks. Deployed devices depend on it and it stays.

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};
use crate::messages::{EncryptionType, KEY_SIZE};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

type EcbEncryptor = ecb::Encryptor<Aes128>;
type EcbDecryptor = ecb::Decryptor<Aes128>;
type CbcEncryptor = cbc::Encryptor<Aes128>;
type CbcDecryptor = cbc::Decryptor<Aes128>;

/// Encrypts `plaintext` according to `mode`.
///
/// `iv` is only used by [`EncryptionType::AesCbc`].
pub fn encrypt(mode: EncryptionType, key: &[u8], iv: &[u8], mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
    if mode == EncryptionType::Plain {
        return Ok(plaintext);
    }

    check_key(key)?;
    if mode == EncryptionType::AesCbc {
        check_iv(iv)?;
    }

    add_padding(&mut plaintext);
    let len = plaintext.len();
    let result = match mode {
        EncryptionType::AesCbc => CbcEncryptor::new_from_slices(key, iv)
            .map_err(|_| key_error(key))?
            .encrypt_padded_mut::<NoPadding>(&mut plaintext, len)
            .map(|_| ()),
        _ => EcbEncryptor::new_from_slice(key)
            .map_err(|_| key_error(key))?
            .encrypt_padded_mut::<NoPadding>(&mut plaintext, len)
            .map(|_| ()),
    };
    result.map_err(|_| misaligned(len))?;
    Ok(plaintext)
}

/// Decrypts `ciphertext` according to `mode`.
pub fn decrypt(mode: EncryptionType, key: &[u8], iv: &[u8], ciphertext: Bytes) -> Result<Bytes> {
    if mode == EncryptionType::Plain {
        return Ok(ciphertext);
    }

    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(misaligned(ciphertext.len()));
    }
    check_key(key)?;
    if mode == EncryptionType::AesCbc {
        check_iv(iv)?;
    }

    let mut buffer = ciphertext.to_vec();
    let result = match mode {
        EncryptionType::AesCbc => CbcDecryptor::new_from_slices(key, iv)
            .map_err(|_| key_error(key))?
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map(|_| ()),
        _ => EcbDecryptor::new_from_slice(key)
            .map_err(|_| key_error(key))?
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map(|_| ()),
    };
    result.map_err(|_| misaligned(buffer.len()))?;

    Ok(Bytes::from(buffer))
}

/// Appends random bytes until `buffer` is block aligned.
pub fn add_padding(buffer: &mut Vec<u8>) {
    let rem = buffer.len() % BLOCK_SIZE;
    if rem == 0 {
        return;
    }
    let mut padding = [0u8; BLOCK_SIZE];
    let needed = BLOCK_SIZE - rem;
    OsRng.fill_bytes(&mut padding[..needed]);
    buffer.extend_from_slice(&padding[..needed]);
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(key_error(key));
    }
    Ok(())
}

fn key_error(key: &[u8]) -> ProtocolError {
    ProtocolError::InvalidKeyLength {
        expected: KEY_SIZE,
        got: key.len(),
    }
}

fn check_iv(iv: &[u8]) -> Result<()> {
    if iv.len() != BLOCK_SIZE {
        return Err(ProtocolError::InvalidIvLength {
            expected: BLOCK_SIZE,
            got: iv.len(),
        });
    }
    Ok(())
}

fn misaligned(len: usize) -> ProtocolError {
    ProtocolError::MisalignedCiphertext {
        len,
        block: BLOCK_SIZE,
    }
}
