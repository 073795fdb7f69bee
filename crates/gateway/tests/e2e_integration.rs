//! End-to-end integration tests for the Open IoT gateway.
//!
//! These tests verify complete flows work correctly:
//! - Plain and encrypted onboarding
//! - Message delivery and replay protection
//! - Runtime startup, processing and shutdown over in-memory transports

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gateway::config::Config;
use gateway::devices::{Device, DeviceId, DeviceRegistry};
use gateway::dispatcher::{DispatchError, Dispatched, Dispatcher};
use gateway::handlers::{Handler, HandlerError, HandlerRegistry};
use gateway::onboarding::{KeyExchangeCache, Onboarding, OnboardingError, OnboardingState};
use gateway::runtime::{Runtime, RuntimeEvent, RuntimeState};
use gateway::transport::{MemoryPeer, MemoryTransport, Transport, TransportRegistry};
use protocol::{
    downcast, make_ready_to_send_device_message, make_ready_to_send_message, ClimateSensor,
    DevicePayload, DhParams, EncryptionType, Header, JoinRequest, JoinResponse,
    KeyExchangeRequest, KeyExchangeResponse, KeyPair, MessageReader, MessageTypeRegistry,
    NamedMessage, KEY_SIZE,
};
use tempfile::TempDir;

// =============================================================================
// Test Fixtures
// =============================================================================

/// Handler collecting every temperature it sees.
#[derive(Default)]
struct Thermometer {
    readings: Mutex<Vec<(DeviceId, f32)>>,
    attached: Mutex<Vec<DeviceId>>,
}

impl Thermometer {
    fn readings(&self) -> Vec<(DeviceId, f32)> {
        self.readings.lock().unwrap().clone()
    }
}

impl Handler for Thermometer {
    fn name(&self) -> &str {
        "thermometer"
    }

    fn on_device_attached(&self, device: &Device) {
        self.attached.lock().unwrap().push(device.id);
    }

    fn process_message(
        &self,
        device: &Device,
        payload: &dyn DevicePayload,
    ) -> Result<(), HandlerError> {
        let reading = downcast::<ClimateSensor>(payload).ok_or_else(|| {
            HandlerError::UnexpectedPayload {
                handler: "thermometer".to_string(),
                type_name: payload.type_name().to_string(),
            }
        })?;
        self.readings
            .lock()
            .unwrap()
            .push((device.id, reading.temperature));
        Ok(())
    }
}

struct Gateway {
    dispatcher: Dispatcher,
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    device: MemoryPeer,
    thermometer: Arc<Thermometer>,
}

fn gateway() -> Gateway {
    let registry = Arc::new(DeviceRegistry::new());
    let handlers = Arc::new(HandlerRegistry::with_builtin());
    let thermometer = Arc::new(Thermometer::default());
    handlers.add(thermometer.clone()).unwrap();

    let onboarding = Onboarding::new(
        Arc::clone(&registry),
        handlers,
        KeyExchangeCache::default(),
        "Integration Server",
    );
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::new(MessageTypeRegistry::with_builtin()),
        onboarding,
    );
    let (transport, device) = MemoryTransport::pair("radio");

    Gateway {
        dispatcher,
        registry,
        transport: Arc::new(transport),
        device,
        thermometer,
    }
}

fn join_datagram(id: u64, mode: EncryptionType, key: &[u8]) -> Vec<u8> {
    let request = JoinRequest {
        name: "Greenhouse".to_string(),
        manufacturer: "Open IoT".to_string(),
        product_url: "https://example.org/greenhouse".to_string(),
        protobuf_url: "https://example.org/greenhouse.proto".to_string(),
        default_handler: "thermometer".to_string(),
    };
    make_ready_to_send_message(Header::join_request(id), mode, key, key, &[&request]).unwrap()
}

fn reading_datagram(id: u64, sequence: u32, mode: EncryptionType, key: &[u8], temperature: f32) -> Vec<u8> {
    let now = chrono::Local::now().naive_local();
    make_ready_to_send_device_message(
        id,
        sequence,
        &now,
        mode,
        key,
        key,
        &ClimateSensor {
            temperature,
            humidity: 60.0,
            battery_mv: 2950,
        },
    )
    .unwrap()
}

fn set_message_type(registry: &DeviceRegistry, id: u64) {
    registry
        .update(DeviceId(id), |d| {
            d.message_type = ClimateSensor::TYPE_NAME.to_string()
        })
        .unwrap();
}

fn split_reply(datagram: Vec<u8>) -> (Header, bytes::Bytes) {
    let mut reader = MessageReader::new(datagram);
    let header: Header = reader.read().unwrap();
    assert_eq!(header.crc, protocol::crc32(reader.remaining_bytes()));
    (header, reader.into_remaining())
}

// =============================================================================
// Onboarding
// =============================================================================

#[test]
fn test_plain_join_then_rejoin() {
    let gw = gateway();

    let first = gw
        .dispatcher
        .process_message(&gw.transport, &join_datagram(0x1f, EncryptionType::Plain, &[]))
        .unwrap();
    assert!(matches!(first, Dispatched::Joined { created: true, .. }));

    gw.registry
        .update(DeviceId(0x1f), |d| d.sequence_send = 12)
        .unwrap();

    let second = gw
        .dispatcher
        .process_message(&gw.transport, &join_datagram(0x1f, EncryptionType::Plain, &[]))
        .unwrap();
    assert!(matches!(second, Dispatched::Joined { created: false, .. }));

    assert_eq!(gw.registry.len().unwrap(), 1);
    let device = gw.registry.find(DeviceId(0x1f)).unwrap().unwrap();
    assert_eq!(device.sequence_send, 12);
    assert_eq!(device.name, "Greenhouse");
    assert_eq!(device.handler_names(), vec!["thermometer"]);
    assert_eq!(*gw.thermometer.attached.lock().unwrap(), vec![DeviceId(0x1f)]);
}

#[test]
fn test_key_exchange_for_registered_device_rejected() {
    let gw = gateway();
    gw.dispatcher
        .process_message(&gw.transport, &join_datagram(7, EncryptionType::Plain, &[]))
        .unwrap();

    let request = KeyExchangeRequest {
        dh_p: 65_521,
        dh_g: 17,
        dh_a: vec![3; KEY_SIZE],
        encryption_type: EncryptionType::AesEcb as i32,
    };
    let datagram = make_ready_to_send_message(
        Header::key_exchange(7),
        EncryptionType::Plain,
        &[],
        &[],
        &[&request],
    )
    .unwrap();

    let before = gw.dispatcher.onboarding().cache().len();
    let err = gw
        .dispatcher
        .process_message(&gw.transport, &datagram)
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Onboarding(OnboardingError::AlreadyRegistered(DeviceId(7)))
    ));
    assert_eq!(gw.dispatcher.onboarding().cache().len(), before);
}

#[test]
fn test_encrypted_onboarding_and_messages() {
    for mode in [EncryptionType::AesEcb, EncryptionType::AesCbc] {
        let mut gw = gateway();
        let id = 0xabcd;

        // Device side of the key exchange
        let params = DhParams::new(17, 65_521).unwrap();
        let device_keys = KeyPair::generate(&params, &mut rand::thread_rng());
        let request = KeyExchangeRequest {
            dh_p: params.modulus(),
            dh_g: params.generator(),
            dh_a: device_keys.public().to_vec(),
            encryption_type: mode as i32,
        };
        let datagram = make_ready_to_send_message(
            Header::key_exchange(id),
            EncryptionType::Plain,
            &[],
            &[],
            &[&request],
        )
        .unwrap();

        let outcome = gw.dispatcher.process_message(&gw.transport, &datagram).unwrap();
        assert!(matches!(outcome, Dispatched::KeyExchange { .. }));
        assert_eq!(
            gw.dispatcher.onboarding().state(DeviceId(id)).unwrap(),
            OnboardingState::KeyPending
        );

        let (header, body) = split_reply(gw.device.try_recv().unwrap());
        assert!(header.key_exchange);
        let response: KeyExchangeResponse = MessageReader::new(body).read().unwrap();
        let dh_b: [u32; KEY_SIZE] = response.dh_b.as_slice().try_into().unwrap();
        let key = device_keys.derive_key(&params, &dh_b);

        // Join encrypted with the agreed key
        gw.dispatcher
            .process_message(&gw.transport, &join_datagram(id, mode, &key))
            .unwrap();
        assert_eq!(
            gw.dispatcher.onboarding().state(DeviceId(id)).unwrap(),
            OnboardingState::Registered
        );

        let (header, body) = split_reply(gw.device.try_recv().unwrap());
        assert!(header.join_request);
        let response: JoinResponse = protocol::decrypt_and_read(mode, &key, &key, body)
            .unwrap()
            .read()
            .unwrap();
        assert_eq!(response.name, "Integration Server");

        // Regular traffic
        set_message_type(&gw.registry, id);
        gw.dispatcher
            .process_message(&gw.transport, &reading_datagram(id, 1, mode, &key, 23.5))
            .unwrap();
        gw.dispatcher
            .process_message(&gw.transport, &reading_datagram(id, 2, mode, &key, 24.0))
            .unwrap();

        assert_eq!(
            gw.thermometer.readings(),
            vec![(DeviceId(id), 23.5), (DeviceId(id), 24.0)]
        );
    }
}

// =============================================================================
// Message Delivery
// =============================================================================

#[test]
fn test_plain_message_accepted_then_replay_rejected() {
    let gw = gateway();
    gw.dispatcher
        .process_message(&gw.transport, &join_datagram(0x1f, EncryptionType::Plain, &[]))
        .unwrap();
    set_message_type(&gw.registry, 0x1f);

    let datagram = reading_datagram(0x1f, 1, EncryptionType::Plain, &[], 18.0);
    let outcome = gw.dispatcher.process_message(&gw.transport, &datagram).unwrap();
    assert!(matches!(
        outcome,
        Dispatched::Delivered { sequence: 1, .. }
    ));
    assert_eq!(gw.thermometer.readings().len(), 1);

    let err = gw
        .dispatcher
        .process_message(&gw.transport, &datagram)
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::DuplicateMessage { device_id: DeviceId(0x1f), sequence: 1, last: 1 }
    ));
    assert_eq!(gw.thermometer.readings().len(), 1);
}

#[test]
fn test_monotonic_sequences_with_gaps() {
    let gw = gateway();
    gw.dispatcher
        .process_message(&gw.transport, &join_datagram(3, EncryptionType::Plain, &[]))
        .unwrap();
    set_message_type(&gw.registry, 3);

    for sequence in [1, 2, 10, 11] {
        gw.dispatcher
            .process_message(&gw.transport, &reading_datagram(3, sequence, EncryptionType::Plain, &[], 20.0))
            .unwrap();
    }
    for stale in [5, 11] {
        assert!(gw
            .dispatcher
            .process_message(&gw.transport, &reading_datagram(3, stale, EncryptionType::Plain, &[], 20.0))
            .is_err());
    }

    assert_eq!(gw.thermometer.readings().len(), 4);
    assert_eq!(gw.registry.find(DeviceId(3)).unwrap().unwrap().sequence_receive, 11);
}

#[test]
fn test_unknown_device_rejected() {
    let gw = gateway();
    let err = gw
        .dispatcher
        .process_message(&gw.transport, &reading_datagram(0x55, 1, EncryptionType::Plain, &[], 1.0))
        .unwrap_err();
    assert!(matches!(err, DispatchError::DeviceNotRegistered(DeviceId(0x55))));
}

// =============================================================================
// Runtime Lifecycle
// =============================================================================

fn memory_runtime(temp_dir: &TempDir) -> (Runtime, MemoryPeer, Arc<Thermometer>) {
    let mut config = Config::default();
    config.server.devices_file = temp_dir.path().join("devices.toml");
    config.server.workers = 4;
    config.server.save_interval_secs = 0;

    let handlers = Arc::new(HandlerRegistry::with_builtin());
    let thermometer = Arc::new(Thermometer::default());
    handlers.add(thermometer.clone()).unwrap();

    let transports = TransportRegistry::new();
    let (transport, peer) = MemoryTransport::pair("radio");
    transports.add(Arc::new(transport)).unwrap();

    let runtime = Runtime::with_components(
        config,
        handlers,
        Arc::new(transports),
        MessageTypeRegistry::with_builtin(),
    );
    (runtime, peer, thermometer)
}

async fn wait_for_processed(events: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>, count: usize) -> Vec<RuntimeEvent> {
    let mut seen = Vec::new();
    while seen.len() < count {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for runtime event")
            .unwrap();
        if matches!(event, RuntimeEvent::Processed { .. } | RuntimeEvent::Rejected { .. }) {
            seen.push(event);
        }
    }
    seen
}

#[tokio::test]
async fn test_runtime_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let (runtime, mut peer, thermometer) = memory_runtime(&temp_dir);
    let mut events = runtime.subscribe();

    runtime.start().await.unwrap();
    assert_eq!(runtime.state().await, RuntimeState::Running);

    peer.send(join_datagram(0x1f, EncryptionType::Plain, &[])).await.unwrap();
    wait_for_processed(&mut events, 1).await;
    assert!(peer.recv().await.is_some());
    set_message_type(runtime.registry(), 0x1f);

    peer.send(reading_datagram(0x1f, 1, EncryptionType::Plain, &[], 21.0))
        .await
        .unwrap();
    wait_for_processed(&mut events, 1).await;

    // Replay is reported, not delivered
    peer.send(reading_datagram(0x1f, 1, EncryptionType::Plain, &[], 21.0))
        .await
        .unwrap();
    let replay = wait_for_processed(&mut events, 1).await;
    assert!(matches!(replay[0], RuntimeEvent::Rejected { .. }));

    assert_eq!(thermometer.readings(), vec![(DeviceId(0x1f), 21.0)]);

    runtime.stop().await.unwrap();
    assert_eq!(runtime.state().await, RuntimeState::Stopped);

    let saved = std::fs::read_to_string(temp_dir.path().join("devices.toml")).unwrap();
    assert!(saved.contains("id = \"0x1f\""));
    assert!(saved.contains("sequence_receive = 1"));
}

#[tokio::test]
async fn test_runtime_restart_keeps_counters() {
    let temp_dir = TempDir::new().unwrap();

    {
        let (runtime, peer, _) = memory_runtime(&temp_dir);
        let mut events = runtime.subscribe();
        runtime.start().await.unwrap();
        peer.send(join_datagram(9, EncryptionType::Plain, &[])).await.unwrap();
        wait_for_processed(&mut events, 1).await;
        set_message_type(runtime.registry(), 9);
        peer.send(reading_datagram(9, 41, EncryptionType::Plain, &[], 5.0))
            .await
            .unwrap();
        wait_for_processed(&mut events, 1).await;
        runtime.stop().await.unwrap();
    }

    let (runtime, peer, thermometer) = memory_runtime(&temp_dir);
    let mut events = runtime.subscribe();
    runtime.start().await.unwrap();
    assert_eq!(*thermometer.attached.lock().unwrap(), vec![DeviceId(9)]);

    // Sequence 41 was already accepted before the restart
    peer.send(reading_datagram(9, 41, EncryptionType::Plain, &[], 5.0))
        .await
        .unwrap();
    peer.send(reading_datagram(9, 42, EncryptionType::Plain, &[], 6.0))
        .await
        .unwrap();
    wait_for_processed(&mut events, 2).await;

    assert_eq!(thermometer.readings(), vec![(DeviceId(9), 6.0)]);
    runtime.stop().await.unwrap();
}
