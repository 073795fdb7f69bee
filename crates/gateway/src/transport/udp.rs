//! UDP datagram transport.
//!
//! Binds a local socket and forwards every received datagram into the
//! receive queue. Replies go to a single configured gateway address, which
//! is how LoRa packet forwarders are usually wired.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{StartFuture, Transport, TransportError};
use crate::config::UdpTransportConfig;

/// Receive buffer size when the configuration leaves it out.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024;

/// Receive queue depth.
const RECEIVE_QUEUE: usize = 128;

/// UDP transport instance.
pub struct UdpTransport {
    name: String,
    listen: String,
    gateway: Option<SocketAddr>,
    max_packet_size: usize,
    /// Send handle, cloned from the socket the receive loop reads.
    socket: Mutex<Option<Arc<std::net::UdpSocket>>>,
    sender: mpsc::Sender<Vec<u8>>,
    receiver: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    shutdown: CancellationToken,
}

impl UdpTransport {
    /// Builds a transport from configuration. Nothing is bound until
    /// [`Transport::start`].
    pub fn new(name: impl Into<String>, config: &UdpTransportConfig) -> Result<Self, TransportError> {
        let name = name.into();

        let gateway = match &config.gateway {
            Some(address) => Some(resolve(&name, address)?),
            None => None,
        };

        let max_packet_size = if config.max_packet_size == 0 {
            DEFAULT_MAX_PACKET_SIZE
        } else {
            config.max_packet_size
        };

        let (sender, receiver) = mpsc::channel(RECEIVE_QUEUE);

        Ok(Self {
            name,
            listen: config.listen.clone(),
            gateway,
            max_packet_size,
            socket: Mutex::new(None),
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_socket()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Configured reply address.
    pub fn gateway(&self) -> Option<SocketAddr> {
        self.gateway
    }

    fn current_socket(&self) -> Option<Arc<std::net::UdpSocket>> {
        self.socket.lock().ok().and_then(|socket| socket.clone())
    }

    async fn bind(&self) -> Result<(), TransportError> {
        if self.current_socket().is_some() {
            return Err(TransportError::AlreadyStarted(self.name.clone()));
        }
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed(self.name.clone()));
        }

        let io_error = |source: std::io::Error| TransportError::Io {
            name: self.name.clone(),
            source,
        };

        // Sends bypass the reactor through a cloned std handle.
        let std_socket = std::net::UdpSocket::bind(&self.listen).map_err(io_error)?;
        let sender_socket = Arc::new(std_socket.try_clone().map_err(io_error)?);
        std_socket.set_nonblocking(true).map_err(io_error)?;
        let socket = UdpSocket::from_std(std_socket).map_err(io_error)?;

        {
            let mut slot = self
                .socket
                .lock()
                .map_err(|_| TransportError::NotRunning(self.name.clone()))?;
            if slot.is_some() {
                return Err(TransportError::AlreadyStarted(self.name.clone()));
            }
            *slot = Some(Arc::clone(&sender_socket));
        }

        tracing::info!(
            transport = %self.name,
            listen = ?socket.local_addr().ok(),
            gateway = ?self.gateway,
            "UDP transport started"
        );

        tokio::spawn(receive_loop(
            self.name.clone(),
            socket,
            self.max_packet_size,
            self.sender.clone(),
            self.shutdown.clone(),
        ));

        Ok(())
    }
}

fn resolve(name: &str, address: &str) -> Result<SocketAddr, TransportError> {
    address
        .to_socket_addrs()
        .map_err(|e| TransportError::InvalidConfig {
            name: name.to_string(),
            reason: format!("cannot resolve gateway '{}': {}", address, e),
        })?
        .next()
        .ok_or_else(|| TransportError::InvalidConfig {
            name: name.to_string(),
            reason: format!("gateway '{}' resolved to no address", address),
        })
}

async fn receive_loop(
    name: String,
    socket: UdpSocket,
    max_packet_size: usize,
    sender: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; max_packet_size];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(transport = %name, "UDP receive loop cancelled");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        tracing::trace!(transport = %name, %from, len, "Datagram received");
                        if sender.send(buf[..len].to_vec()).await.is_err() {
                            tracing::debug!(transport = %name, "Receive queue dropped, stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(transport = %name, error = %e, "UDP read failed");
                    }
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "udp"
    }

    fn start(&self) -> StartFuture<'_> {
        Box::pin(self.bind())
    }

    fn stop(&self) {
        self.shutdown.cancel();
        if let Ok(mut socket) = self.socket.lock() {
            if socket.take().is_some() {
                tracing::info!(transport = %self.name, "UDP transport stopped");
            }
        }
    }

    fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        let Some(gateway) = self.gateway else {
            tracing::debug!(transport = %self.name, len = packet.len(), "No gateway configured, dropping outgoing datagram");
            return Ok(());
        };

        let Some(socket) = self.current_socket() else {
            tracing::debug!(transport = %self.name, len = packet.len(), "Transport not running, dropping outgoing datagram");
            return Ok(());
        };

        socket
            .send_to(packet, gateway)
            .map(|_| ())
            .map_err(|source| TransportError::Io {
                name: self.name.clone(),
                source,
            })
    }

    fn receive(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.receiver.lock().ok().and_then(|mut receiver| receiver.take())
    }
}
