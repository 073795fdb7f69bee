//! Gateway runtime wiring transports, workers and persistence together.
//!
//! ```text
//!  transport A ──forwarder──┐
//!  transport B ──forwarder──┼──▶ intake queue ──▶ worker 1..N ──▶ Dispatcher
//!  transport C ──forwarder──┘        (bounded)
//! ```
//!
//! Each transport gets one forwarding task, so datagrams from the same
//! transport enter the intake queue in arrival order. Workers share the
//! queue and process messages independently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::MessageTypeRegistry;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::devices::{self, DeviceRegistry};
use crate::dispatcher::{DispatchError, Dispatched, Dispatcher};
use crate::handlers::HandlerRegistry;
use crate::onboarding::{KeyExchangeCache, Onboarding};
use crate::transport::{Transport, TransportRegistry, UdpTransport};

/// Capacity of the runtime event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A datagram waiting for a worker, with the transport it arrived on.
type Intake = (Arc<dyn Transport>, Vec<u8>);

/// Runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, loading devices and opening transports.
    Starting,
    /// Running and processing datagrams.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the runtime.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Runtime state changed.
    StateChanged(RuntimeState),
    /// A datagram was processed.
    Processed { transport: String, outcome: Dispatched },
    /// A datagram was rejected.
    Rejected { transport: String, reason: String },
    /// Devices were written to disk.
    Saved { count: usize },
}

/// The gateway runtime.
pub struct Runtime {
    /// Configuration.
    config: Config,
    /// Registered devices.
    registry: Arc<DeviceRegistry>,
    /// Handlers by name.
    handlers: Arc<HandlerRegistry>,
    /// Transports by name.
    transports: Arc<TransportRegistry>,
    /// Shared by all workers.
    dispatcher: Arc<Dispatcher>,
    /// Current state.
    state: Arc<RwLock<RuntimeState>>,
    /// Event broadcaster.
    event_tx: broadcast::Sender<RuntimeEvent>,
    /// Token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Forwarder, worker and save tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Creates a runtime with the built-in handlers and message types and
    /// the UDP transports listed in `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let transports = build_transports(&config)?;
        Ok(Self::with_components(
            config,
            Arc::new(HandlerRegistry::with_builtin()),
            Arc::new(transports),
            MessageTypeRegistry::with_builtin(),
        ))
    }

    /// Creates a runtime from explicit registries.
    pub fn with_components(
        config: Config,
        handlers: Arc<HandlerRegistry>,
        transports: Arc<TransportRegistry>,
        message_types: MessageTypeRegistry,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let onboarding = Onboarding::new(
            Arc::clone(&registry),
            Arc::clone(&handlers),
            KeyExchangeCache::new(config.onboarding.key_exchange_cache_size),
            config.server.name.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(message_types),
            onboarding,
        ));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            registry,
            handlers,
            transports,
            dispatcher,
            state: Arc::new(RwLock::new(RuntimeState::Stopped)),
            event_tx,
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Returns a receiver for runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the runtime: loads devices, opens every transport and spawns
    /// the forwarders, workers and periodic save task.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != RuntimeState::Stopped {
                anyhow::bail!("Runtime is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Runtime has been stopped and cannot be restarted");
            }
            *state = RuntimeState::Starting;
        }
        self.emit_event(RuntimeEvent::StateChanged(RuntimeState::Starting));

        info!(server = %self.config.server.name, "Starting gateway runtime...");

        if let Err(e) = self.spawn_tasks().await {
            // Unwind whatever was already started
            self.shutdown_token.cancel();
            for transport in self.transports.all() {
                transport.stop();
            }
            self.set_state(RuntimeState::Stopped).await;
            return Err(e);
        }

        self.set_state(RuntimeState::Running).await;
        info!(
            transports = self.transports.len(),
            workers = self.config.server.workers,
            devices = self.registry.len().unwrap_or(0),
            "Gateway runtime started"
        );
        Ok(())
    }

    async fn spawn_tasks(&self) -> Result<()> {
        let loaded = devices::load_into(
            &self.config.server.devices_file,
            &self.registry,
            &self.handlers,
            &self.transports,
        )?;
        debug!("Loaded {} devices", loaded);

        let (intake_tx, intake_rx) = mpsc::channel::<Intake>(self.config.server.intake_queue.max(1));
        let mut tasks = self.tasks.lock().await;

        for transport in self.transports.all() {
            transport
                .start()
                .await
                .with_context(|| format!("Failed to start transport '{}'", transport.name()))?;

            match transport.receive() {
                Some(receiver) => tasks.push(tokio::spawn(forward(
                    transport,
                    receiver,
                    intake_tx.clone(),
                    self.shutdown_token.clone(),
                ))),
                None => warn!(transport = transport.name(), "Receive queue already taken, transport will only send"),
            }
        }
        drop(intake_tx);

        let intake_rx = Arc::new(Mutex::new(intake_rx));
        for worker in 0..self.config.server.workers.max(1) {
            tasks.push(tokio::spawn(work(
                worker,
                Arc::clone(&intake_rx),
                Arc::clone(&self.dispatcher),
                self.event_tx.clone(),
                self.shutdown_token.clone(),
            )));
        }

        if self.config.server.save_interval_secs > 0 {
            tasks.push(tokio::spawn(save_periodically(
                Duration::from_secs(self.config.server.save_interval_secs),
                self.config.server.devices_file.clone(),
                Arc::clone(&self.registry),
                self.event_tx.clone(),
                self.shutdown_token.clone(),
            )));
        }

        Ok(())
    }

    /// Stops the runtime gracefully and saves devices.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == RuntimeState::Stopped {
                return Ok(());
            }
            if *state == RuntimeState::ShuttingDown {
                anyhow::bail!("Runtime is already shutting down");
            }
            *state = RuntimeState::ShuttingDown;
        }
        self.emit_event(RuntimeEvent::StateChanged(RuntimeState::ShuttingDown));

        info!("Stopping gateway runtime...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        for transport in self.transports.all() {
            debug!("Stopping transport {}", transport.name());
            transport.stop();
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Runtime task ended abnormally: {}", e);
            }
        }

        match devices::save_from(&self.config.server.devices_file, &self.registry) {
            Ok(count) => self.emit_event(RuntimeEvent::Saved { count }),
            Err(e) => warn!("Error saving devices: {:#}", e),
        }

        self.set_state(RuntimeState::Stopped).await;
        info!("Gateway runtime stopped");
        Ok(())
    }

    async fn set_state(&self, new_state: RuntimeState) {
        *self.state.write().await = new_state;
        self.emit_event(RuntimeEvent::StateChanged(new_state));
    }

    /// Emits a runtime event.
    fn emit_event(&self, event: RuntimeEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

/// Builds a UDP transport for every `[udp.<name>]` section.
pub fn build_transports(config: &Config) -> Result<TransportRegistry> {
    let registry = TransportRegistry::new();
    for (name, udp) in &config.udp {
        let transport = UdpTransport::new(name.clone(), udp)
            .with_context(|| format!("Failed to create UDP transport '{}'", name))?;
        registry.add(Arc::new(transport))?;
    }
    Ok(registry)
}

/// Moves datagrams from one transport into the shared intake queue.
async fn forward(
    transport: Arc<dyn Transport>,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    intake: mpsc::Sender<Intake>,
    shutdown_token: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            packet = receiver.recv() => packet,
        };
        let Some(packet) = packet else {
            debug!(transport = transport.name(), "Transport receive queue closed");
            break;
        };

        tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            sent = intake.send((Arc::clone(&transport), packet)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(transport = transport.name(), "Forwarder stopped");
}

/// Takes datagrams off the intake queue and dispatches them until shutdown.
async fn work(
    worker: usize,
    intake: Arc<Mutex<mpsc::Receiver<Intake>>>,
    dispatcher: Arc<Dispatcher>,
    event_tx: broadcast::Sender<RuntimeEvent>,
    shutdown_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => None,
            next = async { intake.lock().await.recv().await } => next,
        };
        let Some((transport, packet)) = next else {
            break;
        };

        let event = match dispatcher.process_message(&transport, &packet) {
            Ok(outcome) => RuntimeEvent::Processed {
                transport: transport.name().to_string(),
                outcome,
            },
            Err(e) => {
                log_rejection(transport.name(), &e);
                RuntimeEvent::Rejected {
                    transport: transport.name().to_string(),
                    reason: e.to_string(),
                }
            }
        };
        let _ = event_tx.send(event);
    }
    debug!(worker, "Worker stopped");
}

fn log_rejection(transport: &str, err: &DispatchError) {
    match err {
        DispatchError::DuplicateMessage { .. }
        | DispatchError::IntegrityCheckFailed { .. }
        | DispatchError::DeviceNotRegistered(_)
        | DispatchError::MalformedHeader(_) => {
            debug!(transport, error = %err, "Datagram rejected");
        }
        DispatchError::Registry(_) => error!(transport, error = %err, "Datagram rejected"),
        _ => warn!(transport, error = %err, "Datagram rejected"),
    }
}

async fn save_periodically(
    period: Duration,
    path: std::path::PathBuf,
    registry: Arc<DeviceRegistry>,
    event_tx: broadcast::Sender<RuntimeEvent>,
    shutdown_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = interval.tick() => {
                match devices::save_from(&path, &registry) {
                    Ok(count) => {
                        debug!("Periodic save wrote {} devices", count);
                        let _ = event_tx.send(RuntimeEvent::Saved { count });
                    }
                    Err(e) => warn!("Periodic device save failed: {:#}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceId;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use protocol::{make_ready_to_send_message, EncryptionType, Header, JoinRequest};
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.devices_file = temp_dir.path().join("devices.toml");
        config.server.save_interval_secs = 0;
        config
    }

    fn memory_runtime(config: Config) -> (Runtime, MemoryPeer) {
        let transports = TransportRegistry::new();
        let (transport, peer) = MemoryTransport::pair("mem");
        transports.add(Arc::new(transport)).unwrap();
        let runtime = Runtime::with_components(
            config,
            Arc::new(HandlerRegistry::with_builtin()),
            Arc::new(transports),
            MessageTypeRegistry::with_builtin(),
        );
        (runtime, peer)
    }

    fn join_datagram(id: u64) -> Vec<u8> {
        let request = JoinRequest {
            name: "Porch".to_string(),
            default_handler: "logger".to_string(),
            ..Default::default()
        };
        make_ready_to_send_message(Header::join_request(id), EncryptionType::Plain, &[], &[], &[&request])
            .unwrap()
    }

    async fn next_outcome(events: &mut broadcast::Receiver<RuntimeEvent>) -> RuntimeEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if !matches!(event, RuntimeEvent::StateChanged(_) | RuntimeEvent::Saved { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_runtime_creation() {
        let temp_dir = TempDir::new().unwrap();
        let runtime = Runtime::new(create_test_config(&temp_dir)).unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Stopped);
        assert!(runtime.transports().is_empty());
        assert_eq!(runtime.handlers().names(), vec!["logger"]);
    }

    #[tokio::test]
    async fn test_runtime_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.server.workers = 0;
        assert!(Runtime::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_process_stop() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let devices_file = config.server.devices_file.clone();
        let (runtime, mut peer) = memory_runtime(config);
        let mut events = runtime.subscribe();

        runtime.start().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Running);
        assert!(runtime.start().await.is_err());

        peer.send(join_datagram(0x1f)).await.unwrap();
        match next_outcome(&mut events).await {
            RuntimeEvent::Processed { transport, outcome } => {
                assert_eq!(transport, "mem");
                assert!(matches!(outcome, Dispatched::Joined { created: true, .. }));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(peer.recv().await.is_some());

        runtime.stop().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Stopped);
        assert!(devices_file.exists());

        // Stopping twice is a no-op, restarting is refused
        runtime.stop().await.unwrap();
        assert!(runtime.start().await.is_err());
    }

    #[tokio::test]
    async fn test_rejections_are_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (runtime, peer) = memory_runtime(create_test_config(&temp_dir));
        let mut events = runtime.subscribe();
        runtime.start().await.unwrap();

        peer.send(vec![0x7f]).await.unwrap();
        assert!(matches!(
            next_outcome(&mut events).await,
            RuntimeEvent::Rejected { .. }
        ));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_devices_survive_restart() {
        let temp_dir = TempDir::new().unwrap();

        let (first, peer) = memory_runtime(create_test_config(&temp_dir));
        let mut events = first.subscribe();
        first.start().await.unwrap();
        peer.send(join_datagram(0x2a)).await.unwrap();
        next_outcome(&mut events).await;
        first.stop().await.unwrap();

        let (second, _peer) = memory_runtime(create_test_config(&temp_dir));
        second.start().await.unwrap();
        let device = second.registry().find(DeviceId(0x2a)).unwrap().unwrap();
        assert_eq!(device.name, "Porch");
        assert_eq!(device.handler_names(), vec!["logger"]);
        assert_eq!(device.transport().unwrap().name(), "mem");
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_corrupt_devices_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        std::fs::write(&config.server.devices_file, "[[device]\n").unwrap();

        let (runtime, _peer) = memory_runtime(config);
        assert!(runtime.start().await.is_err());
        assert_eq!(runtime.state().await, RuntimeState::Stopped);
    }
}
