//! Per-byte Diffie-Hellman key agreement used during onboarding.
//!
//! Devices are too small for a full-size exchange, so each of the 16 key
//! bytes is agreed independently with its own private exponent, and the
//! shared value is truncated to its low byte. The resulting key has far less
//! entropy than a conventional exchange; it is kept for compatibility with
//! deployed firmware.

use rand::Rng;

use crate::error::{ProtocolError, Result};
use crate::messages::KEY_SIZE;

/// Private exponents are drawn from `0..PRIVATE_EXPONENT_LIMIT`.
pub const PRIVATE_EXPONENT_LIMIT: u32 = 4096;

/// Public parameters announced by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhParams {
    g: u64,
    p: u64,
}

impl DhParams {
    /// Validates the modulus; anything below 2 has no useful residues.
    pub fn new(g: u64, p: u64) -> Result<Self> {
        if p < 2 {
            return Err(ProtocolError::InvalidModulus(p));
        }
        Ok(Self { g, p })
    }

    pub fn generator(&self) -> u64 {
        self.g
    }

    pub fn modulus(&self) -> u64 {
        self.p
    }

    /// Public value for one key position.
    pub fn public_value(&self, private: u32) -> u64 {
        pow_mod(self.g, u64::from(private), self.p)
    }

    /// Shared key byte for one position, from the peer's public value.
    pub fn shared_byte(&self, peer_public: u32, private: u32) -> u8 {
        pow_mod(u64::from(peer_public), u64::from(private), self.p) as u8
    }
}

/// One side's half of the per-byte exchange.
#[derive(Clone)]
pub struct KeyPair {
    private: [u32; KEY_SIZE],
    public: [u32; KEY_SIZE],
}

impl KeyPair {
    /// Draws fresh private exponents for every key position.
    pub fn generate<R: Rng>(params: &DhParams, rng: &mut R) -> Self {
        let mut private = [0u32; KEY_SIZE];
        for exponent in private.iter_mut() {
            *exponent = rng.gen_range(0..PRIVATE_EXPONENT_LIMIT);
        }
        Self::from_private(params, private)
    }

    /// Builds a key pair from known exponents.
    pub fn from_private(params: &DhParams, private: [u32; KEY_SIZE]) -> Self {
        let mut public = [0u32; KEY_SIZE];
        for (value, exponent) in public.iter_mut().zip(private.iter()) {
            // Residues of a modulus wider than 32 bits get truncated on the wire
            *value = params.public_value(*exponent) as u32;
        }
        Self { private, public }
    }

    /// Public values to send to the peer.
    pub fn public(&self) -> &[u32; KEY_SIZE] {
        &self.public
    }

    /// Derives the symmetric key from the peer's public values.
    pub fn derive_key(&self, params: &DhParams, peer_public: &[u32; KEY_SIZE]) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (index, byte) in key.iter_mut().enumerate() {
            *byte = params.shared_byte(peer_public[index], self.private[index]);
        }
        key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// `base^exponent mod modulus` by square-and-multiply.
///
/// Intermediate products are widened to 128 bits so no modulus overflows.
pub fn pow_mod(base: u64, exponent: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let m = u128::from(modulus);
    let mut result: u128 = 1;
    let mut base = u128::from(base) % m;
    let mut exponent = exponent;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        exponent >>= 1;
    }

    result as u64
}
