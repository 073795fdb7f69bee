//! Runtime lookup of device payload types by name.
//!
//! Each registered device declares the name of the message type it emits.
//! The dispatcher resolves that name through a [`MessageTypeRegistry`],
//! which maps names to decoder functions filled in once at startup.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use prost::Message;

use crate::error::{ProtocolError, Result};
use crate::framing::WireMessage;

/// A protobuf message with a stable, fully qualified type name.
pub trait NamedMessage: Message + Default + 'static {
    /// Name devices use to refer to this type.
    const TYPE_NAME: &'static str;
}

/// Decoded device payload whose concrete type is only known at runtime.
pub trait DevicePayload: fmt::Debug + Send + Sync + 'static {
    /// Registered type name.
    fn type_name(&self) -> &'static str;

    /// Access to the concrete message for handlers that know the type.
    fn as_any(&self) -> &dyn Any;

    /// View used to frame the payload for sending.
    fn as_wire(&self) -> &dyn WireMessage;
}

impl<T: NamedMessage> DevicePayload for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_wire(&self) -> &dyn WireMessage {
        self
    }
}

/// Downcasts a payload to a concrete message type.
pub fn downcast<T: NamedMessage>(payload: &dyn DevicePayload) -> Option<&T> {
    payload.as_any().downcast_ref::<T>()
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn DevicePayload>>;

fn decode_boxed<T: NamedMessage>(body: &[u8]) -> Result<Box<dyn DevicePayload>> {
    let payload: Box<dyn DevicePayload> = Box::new(T::decode(body)?);
    Ok(payload)
}

/// Table of payload decoders keyed by type name.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    decoders: BTreeMap<&'static str, DecodeFn>,
}

impl MessageTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in device schemas.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        // Names are distinct constants, registration cannot collide.
        registry.decoders.insert(
            ClimateSensor::TYPE_NAME,
            decode_boxed::<ClimateSensor> as DecodeFn,
        );
        registry
            .decoders
            .insert(Switch::TYPE_NAME, decode_boxed::<Switch> as DecodeFn);
        registry
            .decoders
            .insert(Counter::TYPE_NAME, decode_boxed::<Counter> as DecodeFn);
        registry
    }

    /// Register a decoder for `T`, rejecting a name that is already taken.
    pub fn register<T: NamedMessage>(&mut self) -> Result<()> {
        if self.decoders.contains_key(T::TYPE_NAME) {
            return Err(ProtocolError::DuplicateMessageType(T::TYPE_NAME.to_string()));
        }
        self.decoders.insert(T::TYPE_NAME, decode_boxed::<T>);
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Registered names in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decoder for `type_name`, if registered.
    pub fn decoder(&self, type_name: &str) -> Option<PayloadDecoder> {
        self.decoders
            .get_key_value(type_name)
            .map(|(name, decode)| PayloadDecoder {
                type_name: *name,
                decode: *decode,
            })
    }

    /// Decode `body` as the type registered under `type_name`.
    pub fn decode(&self, type_name: &str, body: &[u8]) -> Result<Box<dyn DevicePayload>> {
        let decoder = self
            .decoder(type_name)
            .ok_or_else(|| ProtocolError::UnknownMessageType(type_name.to_string()))?;
        decoder.decode(body)
    }
}

impl fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.decoders.keys()).finish()
    }
}

/// A resolved entry of the registry.
#[derive(Clone, Copy)]
pub struct PayloadDecoder {
    type_name: &'static str,
    decode: DecodeFn,
}

impl PayloadDecoder {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn decode(&self, body: &[u8]) -> Result<Box<dyn DevicePayload>> {
        (self.decode)(body)
    }
}

impl fmt::Debug for PayloadDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PayloadDecoder").field(&self.type_name).finish()
    }
}

// ============================================================================
// Built-in Device Schemas
// ============================================================================

/// Periodic reading of a temperature/humidity sensor.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClimateSensor {
    /// Degrees Celsius.
    #[prost(float, tag = "1")]
    pub temperature: f32,
    /// Relative humidity in percent.
    #[prost(float, tag = "2")]
    pub humidity: f32,
    /// Battery voltage in millivolts.
    #[prost(uint32, tag = "3")]
    pub battery_mv: u32,
}

impl NamedMessage for ClimateSensor {
    const TYPE_NAME: &'static str = "openiot.ClimateSensor";
}

/// State report of a relay or wall switch.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Switch {
    #[prost(bool, tag = "1")]
    pub on: bool,
    #[prost(uint32, tag = "2")]
    pub channel: u32,
}

impl NamedMessage for Switch {
    const TYPE_NAME: &'static str = "openiot.Switch";
}

/// Monotonic pulse counter (water, gas and power meters).
#[derive(Clone, PartialEq, prost::Message)]
pub struct Counter {
    #[prost(uint64, tag = "1")]
    pub value: u64,
}

impl NamedMessage for Counter {
    const TYPE_NAME: &'static str = "openiot.Counter";
}
