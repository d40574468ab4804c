//! In-memory transport implementation for testing
//!
//! This transport routes frames between clients and listeners within the
//! same process, perfect for testing and development scenarios. Addresses are
//! arbitrary strings scoped to a [`MemoryNetwork`].

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wsrpc_transport::{
    Channel, Connector, FrameSink, Listener, TransportError, WriteStrategy,
};

/// Frames buffered per direction before a writer has to wait.
const CHANNEL_CAPACITY: usize = 100;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct Registration {
    id: u64,
    incoming_tx: flume::Sender<Channel>,
}

/// A namespace of listening addresses.
///
/// Cloning yields another handle to the same namespace.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, Registration>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `address`.
    ///
    /// # Errors
    ///
    /// Fails if another live listener already holds the address.
    pub fn listen(&self, address: impl Into<String>) -> Result<MemoryListener, TransportError> {
        let address = address.into();

        if self.listeners.contains_key(&address) {
            return Err(TransportError::Other(format!(
                "address {address} already has a listener"
            )));
        }

        let (incoming_tx, incoming_rx) = flume::unbounded();
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .insert(address.clone(), Registration { id, incoming_tx });

        info!("Memory listener created for {}", address);

        Ok(MemoryListener {
            id,
            address,
            incoming_rx,
            network: self.clone(),
        })
    }

    /// A connector dialing addresses on this network.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            strategy: WriteStrategy::Acknowledged,
        }
    }

    /// Whether something is listening on `address`.
    #[must_use]
    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.contains_key(address)
    }
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Create two connected channels.
///
/// Frames written to one side's sink come out of the other side's stream.
/// Closing or dropping either sink closes both directions.
#[must_use]
pub fn pair() -> (Channel, Channel) {
    let (a_to_b_tx, a_to_b_rx) = flume::bounded(CHANNEL_CAPACITY);
    let (b_to_a_tx, b_to_a_rx) = flume::bounded(CHANNEL_CAPACITY);
    let closed = CancellationToken::new();

    let a = half(a_to_b_tx, b_to_a_rx, closed.clone());
    let b = half(b_to_a_tx, a_to_b_rx, closed);

    (a, b)
}

fn half(tx: flume::Sender<Bytes>, rx: flume::Receiver<Bytes>, closed: CancellationToken) -> Channel {
    let stream = rx
        .into_stream()
        .map(Ok)
        .take_until(closed.clone().cancelled_owned());

    Channel::new(Box::new(MemorySink { tx, closed }), Box::pin(stream))
}

/// Outgoing half of an in-memory channel.
struct MemorySink {
    tx: flume::Sender<Bytes>,
    closed: CancellationToken,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        debug!("Memory channel sending {} bytes", data.len());

        self.tx
            .send_async(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Dials listeners of a [`MemoryNetwork`].
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    strategy: WriteStrategy,
}

impl MemoryConnector {
    /// Report a different write strategy to clients using this connector.
    #[must_use]
    pub const fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Channel, TransportError> {
        debug!("Connecting to memory address {}", address);

        let incoming_tx = self
            .network
            .listeners
            .get(address)
            .map(|registration| registration.incoming_tx.clone())
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no listener at {address}"))
            })?;

        let (client, server) = pair();

        incoming_tx
            .send_async(server.with_peer("memory-client"))
            .await
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;

        info!("Memory connection established to {}", address);

        Ok(client.with_peer(address))
    }

    fn write_strategy(&self) -> WriteStrategy {
        self.strategy
    }
}

/// Accepts channels dialed to one address.
///
/// The address is released when the listener is dropped.
pub struct MemoryListener {
    id: u64,
    address: String,
    incoming_rx: flume::Receiver<Channel>,
    network: MemoryNetwork,
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Channel, TransportError> {
        let channel = self
            .incoming_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        info!("Memory listener accepted connection on {}", self.address);

        Ok(channel)
    }

    fn local_addr(&self) -> Option<String> {
        Some(self.address.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let id = self.id;
        self.network
            .listeners
            .remove_if(&self.address, |_, registration| registration.id == id);
        debug!("Memory listener on {} released", self.address);
    }
}
