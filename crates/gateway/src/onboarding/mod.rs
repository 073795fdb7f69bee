//! Device onboarding: key exchange followed by join.
//!
//! ```text
//!   Unknown ──key exchange──▶ KeyPending ──join──▶ Registered
//!      │                                              ▲
//!      └─────────────────plain join───────────────────┘
//! ```
//!
//! A key exchange agrees a 16-byte key with the per-byte Diffie-Hellman of
//! [`protocol::dh`] and parks it in the [`KeyExchangeCache`]. The following
//! join is decrypted with that key, creates or refreshes the device record
//! and consumes the cache entry. Devices may skip the key exchange and join
//! in plain text.

pub mod cache;

use std::sync::Arc;

use bytes::Bytes;
use protocol::{
    make_ready_to_send_message, DhParams, EncryptionType, Header, JoinRequest, JoinResponse,
    KeyExchangeRequest, KeyExchangeResponse, KeyPair, MessageReader, ProtocolError, KEY_SIZE,
};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::devices::{Device, DeviceId, DeviceRegistry, RegistryError};
use crate::handlers::{Handler, HandlerRegistry};
use crate::transport::{Transport, TransportError};

pub use cache::{CacheError, KeyExchangeCache, PendingKey};

/// Errors raised while onboarding a device.
#[derive(Debug, Error)]
pub enum OnboardingError {
    /// The device sent the wrong number of public values.
    #[error("expected {expected} Diffie-Hellman public values, got {0}", expected = KEY_SIZE)]
    InvalidParameterLength(usize),

    /// The Diffie-Hellman parameters cannot be used.
    #[error("invalid Diffie-Hellman parameters: {0}")]
    InvalidDhParameters(#[source] ProtocolError),

    /// Key exchange attempted by a device that is already registered.
    #[error("device {0} is already registered")]
    AlreadyRegistered(DeviceId),

    /// The requested encryption mode is unknown.
    #[error("unsupported encryption type {0}")]
    UnsupportedEncryption(i32),

    /// The request body could not be decrypted or decoded.
    #[error("device {device_id}: cannot decode {what}: {source}")]
    Decode {
        device_id: DeviceId,
        what: &'static str,
        #[source]
        source: ProtocolError,
    },

    /// The reply could not be built.
    #[error("cannot encode reply: {0}")]
    Encode(#[source] ProtocolError),

    /// The reply could not be sent.
    #[error(transparent)]
    Send(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Where a device stands in the onboarding flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingState {
    Unknown,
    KeyPending,
    Registered,
}

/// Outcome of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Snapshot of the committed record.
    pub device: Device,
    /// True when the join created the record.
    pub created: bool,
}

/// Runs the onboarding flows against the shared registries.
pub struct Onboarding {
    registry: Arc<DeviceRegistry>,
    handlers: Arc<HandlerRegistry>,
    cache: KeyExchangeCache,
    server_name: String,
}

impl Onboarding {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        handlers: Arc<HandlerRegistry>,
        cache: KeyExchangeCache,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            handlers,
            cache,
            server_name: server_name.into(),
        }
    }

    /// Pending key exchanges.
    pub fn cache(&self) -> &KeyExchangeCache {
        &self.cache
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Current onboarding state of `id`.
    pub fn state(&self, id: DeviceId) -> Result<OnboardingState, OnboardingError> {
        if self.registry.contains(id)? {
            Ok(OnboardingState::Registered)
        } else if self.cache.contains(id)? {
            Ok(OnboardingState::KeyPending)
        } else {
            Ok(OnboardingState::Unknown)
        }
    }

    /// Handles a key exchange request and replies with the gateway's
    /// public values.
    ///
    /// `body` is everything after the header frame; key exchanges are never
    /// encrypted.
    pub fn key_exchange(
        &self,
        header: &Header,
        body: Bytes,
        source: &Arc<dyn Transport>,
    ) -> Result<(), OnboardingError> {
        let device_id = DeviceId(header.device_id);

        let request: KeyExchangeRequest =
            MessageReader::new(body)
                .read()
                .map_err(|source| OnboardingError::Decode {
                    device_id,
                    what: "key exchange request",
                    source,
                })?;

        if self.registry.contains(device_id)? {
            return Err(OnboardingError::AlreadyRegistered(device_id));
        }

        let dh_a: [u32; KEY_SIZE] = request
            .dh_a
            .as_slice()
            .try_into()
            .map_err(|_| OnboardingError::InvalidParameterLength(request.dh_a.len()))?;
        let params = DhParams::new(request.dh_g, request.dh_p)
            .map_err(OnboardingError::InvalidDhParameters)?;
        let encryption = EncryptionType::from_wire(request.encryption_type)
            .map_err(|_| OnboardingError::UnsupportedEncryption(request.encryption_type))?;

        let pair = KeyPair::generate(&params, &mut OsRng);
        let key = pair.derive_key(&params, &dh_a);

        self.cache.insert(device_id, PendingKey { key, encryption })?;

        let response = KeyExchangeResponse {
            dh_b: pair.public().to_vec(),
        };
        let datagram = make_ready_to_send_message(
            Header::key_exchange(device_id.as_u64()),
            EncryptionType::Plain,
            &[],
            &[],
            &[&response],
        )
        .map_err(OnboardingError::Encode)?;
        source.send(&datagram)?;

        tracing::info!(
            device_id = %device_id,
            encryption = encryption.as_config_str(),
            transport = source.name(),
            "Key exchange completed, join pending"
        );
        Ok(())
    }

    /// Handles a join request, registering or refreshing the device, and
    /// replies with the server name and time.
    pub fn join(
        &self,
        header: &Header,
        body: Bytes,
        source: &Arc<dyn Transport>,
    ) -> Result<JoinOutcome, OnboardingError> {
        let device_id = DeviceId(header.device_id);
        let (key, encryption) = self.resolve_key(device_id)?;

        let request: JoinRequest = protocol::decrypt_and_read(encryption, &key, &key, body)
            .and_then(|mut reader| reader.read())
            .map_err(|source| OnboardingError::Decode {
                device_id,
                what: "join request",
                source,
            })?;

        let default_handler = self.default_handler(device_id, &request.default_handler);
        let mut attached: Option<Arc<dyn Handler>> = None;

        let (device, created) = self.registry.upsert_with(device_id, |device| {
            device.name = request.name.clone();
            device.manufacturer = request.manufacturer.clone();
            device.product_url = request.product_url.clone();
            device.protobuf_url = request.protobuf_url.clone();
            device.key = key.clone();
            device.encryption = encryption;
            if let Some(handler) = default_handler {
                if device.attach_handler(Arc::clone(&handler)).is_ok() {
                    attached = Some(handler);
                }
            }
            device.set_transport(Arc::clone(source));
        })?;

        // The device is committed; a stale pending key only costs a cache slot.
        if let Err(e) = self.cache.take(device_id) {
            tracing::warn!(device_id = %device_id, error = %e, "Failed to drop pending key after join");
        }

        if let Some(handler) = attached {
            handler.on_device_attached(&device);
        }

        let response = JoinResponse {
            name: self.server_name.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let datagram = make_ready_to_send_message(
            Header::join_request(device_id.as_u64()),
            encryption,
            &key,
            &key,
            &[&response],
        )
        .map_err(OnboardingError::Encode)?;
        source.send(&datagram)?;

        tracing::info!(
            device_id = %device_id,
            name = %device.display_name(),
            manufacturer = %device.manufacturer,
            encryption = encryption.as_config_str(),
            created,
            "Device joined"
        );

        Ok(JoinOutcome { device, created })
    }

    /// Key a join must be decrypted with: the registered device's, then a
    /// pending exchange, then none.
    fn resolve_key(&self, id: DeviceId) -> Result<(Vec<u8>, EncryptionType), OnboardingError> {
        if let Some(device) = self.registry.find(id)? {
            return Ok((device.key, device.encryption));
        }
        if let Some(pending) = self.cache.get(id)? {
            return Ok((pending.key.to_vec(), pending.encryption));
        }
        Ok((Vec::new(), EncryptionType::Plain))
    }

    fn default_handler(&self, id: DeviceId, name: &str) -> Option<Arc<dyn Handler>> {
        if name.is_empty() {
            return None;
        }
        let handler = self.handlers.find(name);
        if handler.is_none() {
            tracing::warn!(device_id = %id, handler = name, "Unknown default handler requested, skipping");
        }
        handler
    }
}
