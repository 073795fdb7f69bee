//! Inbound datagram processing.
//!
//! The dispatcher turns a raw datagram into one of three outcomes: a key
//! exchange, a join, or a payload delivered to the device's handlers.
//! Every check that can reject a datagram runs before any state changes,
//! so a rejected datagram never advances a sequence counter.

use std::sync::Arc;

use protocol::{
    make_ready_to_send_device_message, DevicePayload, Header, HeaderKind, MessageInfo,
    MessageReader, MessageTypeRegistry, ProtocolError,
};
use thiserror::Error;

use crate::devices::{DeviceId, DeviceRegistry, RegistryError};
use crate::handlers::HandlerError;
use crate::onboarding::{Onboarding, OnboardingError};
use crate::transport::{Transport, TransportError};

/// Reasons a datagram was rejected or a send failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The header frame is unreadable or its flags conflict.
    #[error("malformed header: {0}")]
    MalformedHeader(#[source] ProtocolError),

    /// The body does not match the header checksum.
    #[error("device {device_id}: CRC mismatch, header says {expected:#010x}, body is {actual:#010x}")]
    IntegrityCheckFailed {
        device_id: DeviceId,
        expected: u32,
        actual: u32,
    },

    #[error("onboarding failed: {0}")]
    Onboarding(#[from] OnboardingError),

    /// Regular message from a device that never joined.
    #[error("device {0} is not registered")]
    DeviceNotRegistered(DeviceId),

    /// The device's message type has no decoder.
    #[error("device {device_id}: unknown message type '{type_name}'")]
    UnknownMessageType { device_id: DeviceId, type_name: String },

    /// Decryption or decoding of the body failed.
    #[error("device {device_id}: cannot decode message: {source}")]
    DecodeFailed {
        device_id: DeviceId,
        #[source]
        source: ProtocolError,
    },

    /// Replayed or reordered message.
    #[error("device {device_id}: duplicate message, sequence {sequence} is not newer than {last}")]
    DuplicateMessage {
        device_id: DeviceId,
        sequence: u32,
        last: u32,
    },

    #[error(transparent)]
    Registry(RegistryError),

    /// Outbound message to a device never heard on any transport.
    #[error("device {0} has no known transport")]
    DeviceHasNoTransport(DeviceId),

    /// An outbound message could not be built.
    #[error("cannot encode message: {0}")]
    Encode(#[source] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::StaleSequence {
                device_id,
                sequence,
                last,
            } => DispatchError::DuplicateMessage {
                device_id,
                sequence,
                last,
            },
            RegistryError::NotFound(id) => DispatchError::DeviceNotRegistered(id),
            other => DispatchError::Registry(other),
        }
    }
}

/// What a successfully processed datagram did.
#[derive(Debug, Clone)]
pub enum Dispatched {
    /// A key exchange was answered.
    KeyExchange { device_id: DeviceId },
    /// A device joined or re-joined.
    Joined { device_id: DeviceId, created: bool },
    /// A payload was accepted and handed to the device's handlers.
    Delivered {
        device_id: DeviceId,
        sequence: u32,
        /// Handlers that returned an error, by name.
        handler_failures: Vec<(String, HandlerError)>,
    },
}

/// Decodes inbound datagrams and routes them.
///
/// Cheap to share: workers hold it behind an `Arc` and call
/// [`Dispatcher::process_message`] concurrently.
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    message_types: Arc<MessageTypeRegistry>,
    onboarding: Onboarding,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        message_types: Arc<MessageTypeRegistry>,
        onboarding: Onboarding,
    ) -> Self {
        Self {
            registry,
            message_types,
            onboarding,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn onboarding(&self) -> &Onboarding {
        &self.onboarding
    }

    /// Processes one datagram received on `source`.
    pub fn process_message(
        &self,
        source: &Arc<dyn Transport>,
        raw: &[u8],
    ) -> Result<Dispatched, DispatchError> {
        let mut reader = MessageReader::new(raw.to_vec());
        let header: Header = reader.read().map_err(DispatchError::MalformedHeader)?;
        let kind = header.kind().map_err(DispatchError::MalformedHeader)?;
        let device_id = DeviceId(header.device_id);

        let actual = protocol::crc32(reader.remaining_bytes());
        if actual != header.crc {
            return Err(DispatchError::IntegrityCheckFailed {
                device_id,
                expected: header.crc,
                actual,
            });
        }

        let body = reader.into_remaining();
        match kind {
            HeaderKind::KeyExchange => {
                self.onboarding.key_exchange(&header, body, source)?;
                return Ok(Dispatched::KeyExchange { device_id });
            }
            HeaderKind::JoinRequest => {
                let outcome = self.onboarding.join(&header, body, source)?;
                return Ok(Dispatched::Joined {
                    device_id,
                    created: outcome.created,
                });
            }
            HeaderKind::Message => {}
        }

        let device = self
            .registry
            .find(device_id)?
            .ok_or(DispatchError::DeviceNotRegistered(device_id))?;

        let decoder = self
            .message_types
            .decoder(&device.message_type)
            .ok_or_else(|| DispatchError::UnknownMessageType {
                device_id,
                type_name: device.message_type.clone(),
            })?;

        let decode_failed = |source: ProtocolError| DispatchError::DecodeFailed { device_id, source };
        let mut body = protocol::decrypt_and_read(device.encryption, &device.key, device.iv(), body)
            .map_err(decode_failed)?;
        let info: MessageInfo = body.read().map_err(decode_failed)?;
        let payload = body
            .read_frame()
            .and_then(|frame| decoder.decode(&frame))
            .map_err(decode_failed)?;

        self.registry.accept_sequence(device_id, info.sequence)?;
        let device = self.registry.update(device_id, |device| {
            device.set_transport(Arc::clone(source));
            device.clone()
        })?;

        tracing::debug!(
            device_id = %device_id,
            sequence = info.sequence,
            type_name = payload.type_name(),
            transport = source.name(),
            "Message accepted"
        );

        let mut handler_failures = Vec::new();
        for handler in device.handlers() {
            if let Err(e) = handler.process_message(&device, payload.as_ref()) {
                tracing::warn!(
                    device_id = %device_id,
                    handler = handler.name(),
                    error = %e,
                    "Handler failed"
                );
                handler_failures.push((handler.name().to_string(), e));
            }
        }

        Ok(Dispatched::Delivered {
            device_id,
            sequence: info.sequence,
            handler_failures,
        })
    }

    /// Sends `payload` to a registered device on the transport it was last
    /// heard on.
    ///
    /// The send sequence is consumed even if the transport then fails.
    pub fn send_to_device(
        &self,
        id: DeviceId,
        payload: &dyn DevicePayload,
    ) -> Result<(), DispatchError> {
        let device = self.registry.next_send_sequence(id)?;
        let transport = device
            .transport()
            .cloned()
            .ok_or(DispatchError::DeviceHasNoTransport(id))?;

        let now = chrono::Local::now().naive_local();
        let datagram = make_ready_to_send_device_message(
            id.as_u64(),
            device.sequence_send,
            &now,
            device.encryption,
            &device.key,
            device.iv(),
            payload.as_wire(),
        )
        .map_err(DispatchError::Encode)?;

        transport.send(&datagram)?;
        tracing::debug!(
            device_id = %id,
            sequence = device.sequence_send,
            type_name = payload.type_name(),
            transport = transport.name(),
            "Message sent to device"
        );
        Ok(())
    }
}
