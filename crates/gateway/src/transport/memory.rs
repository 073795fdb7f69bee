//! In-process transport backed by tokio channels.
//!
//! [`MemoryTransport::pair`] returns the gateway side and a [`MemoryPeer`]
//! playing the device side. Useful for exercising the full pipeline without
//! sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{StartFuture, Transport, TransportError};

/// Inbound queue depth of a memory transport.
const INBOUND_CAPACITY: usize = 64;

/// Gateway side of an in-process link.
pub struct MemoryTransport {
    name: String,
    inbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Device side of an in-process link.
pub struct MemoryPeer {
    name: String,
    to_gateway: mpsc::Sender<Vec<u8>>,
    from_gateway: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Creates a connected transport/peer pair.
    pub fn pair(name: impl Into<String>) -> (Self, MemoryPeer) {
        let name = name.into();
        let (to_gateway, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound, from_gateway) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Self {
            name: name.clone(),
            inbound: Mutex::new(Some(inbound)),
            outbound,
            closed: Arc::clone(&closed),
        };
        let peer = MemoryPeer {
            name,
            to_gateway,
            from_gateway,
            closed,
        };
        (transport, peer)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn start(&self) -> StartFuture<'_> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed(self.name.clone()));
            }
            Ok(())
        })
    }

    fn stop(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.name.clone()));
        }
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| TransportError::Closed(self.name.clone()))
    }

    fn receive(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound.lock().ok().and_then(|mut inbound| inbound.take())
    }
}

impl MemoryPeer {
    /// Delivers a datagram to the gateway.
    pub async fn send(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.name.clone()));
        }
        self.to_gateway
            .send(datagram)
            .await
            .map_err(|_| TransportError::Closed(self.name.clone()))
    }

    /// Waits for the next datagram sent by the gateway.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_gateway.recv().await
    }

    /// Next datagram sent by the gateway, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_gateway.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_to_gateway() {
        let (transport, peer) = MemoryTransport::pair("mem");
        transport.start().await.unwrap();
        let mut rx = transport.receive().unwrap();

        peer.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_gateway_to_peer() {
        let (transport, mut peer) = MemoryTransport::pair("mem");
        transport.send(&[9, 9]).unwrap();
        assert_eq!(peer.recv().await, Some(vec![9, 9]));
        assert!(peer.try_recv().is_none());
    }

    #[test]
    fn test_receive_taken_once() {
        let (transport, _peer) = MemoryTransport::pair("mem");
        assert!(transport.receive().is_some());
        assert!(transport.receive().is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_both_directions() {
        let (transport, peer) = MemoryTransport::pair("mem");
        transport.stop();
        assert!(matches!(
            transport.send(&[1]),
            Err(TransportError::Closed(_))
        ));
        assert!(matches!(
            peer.send(vec![1]).await,
            Err(TransportError::Closed(_))
        ));
        assert!(transport.start().await.is_err());
    }
}
