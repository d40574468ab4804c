//! Generic transport abstraction for the RPC session layer
//!
//! This crate provides a transport-agnostic interface for message-framed,
//! full-duplex channels. Specific transport implementations (in-memory,
//! WebSocket) are provided in separate crates.
//!
//! Transports handle:
//! - Opening channels to an address (client side)
//! - Accepting channels from peers (server side)
//! - Delivering whole frames in order, in both directions
//! - Reporting close and I/O failures
//!
//! They know nothing about envelopes, sequence numbers or services.

pub mod error;

use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub use error::TransportError;
pub use error::TransportError as Error;

/// Incoming half of a channel.
///
/// Yields one item per received frame. The stream ending means the channel
/// closed; an `Err` item reports a failure after which the channel should be
/// treated as closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Outgoing half of a channel.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write a single frame. Resolves once the transport accepted it.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Send a keep-alive probe, if the transport has such a thing.
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Begin closing the channel. The paired [`FrameStream`] ends once the
    /// close has been observed.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An open, bidirectional, message-framed channel.
pub struct Channel {
    /// Outgoing frames.
    pub sink: Box<dyn FrameSink>,
    /// Incoming frames.
    pub stream: FrameStream,
    /// Human readable peer description, for logging.
    pub peer: Option<String>,
}

impl Channel {
    /// Assemble a channel from its halves.
    pub fn new(sink: Box<dyn FrameSink>, stream: FrameStream) -> Self {
        Self {
            sink,
            stream,
            peer: None,
        }
    }

    /// Attach a peer description.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// How a writer learns that a frame has left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStrategy {
    /// A write resolves once the transport reports the frame was flushed,
    /// and fails with the transport's error otherwise.
    #[default]
    Acknowledged,
    /// A write resolves as soon as the frame is queued; failures are only
    /// logged.
    FireAndForget,
}

/// Opens channels to a remote address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a channel to `address`. Resolves once the channel is open.
    async fn connect(&self, address: &str) -> Result<Channel, TransportError>;

    /// Write completion semantics of channels produced by this connector.
    fn write_strategy(&self) -> WriteStrategy {
        WriteStrategy::Acknowledged
    }
}

/// Accepts channels opened by remote peers.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next peer.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the listener can no
    /// longer produce channels.
    async fn accept(&self) -> Result<Channel, TransportError>;

    /// The address peers should connect to, if known.
    fn local_addr(&self) -> Option<String> {
        None
    }
}

/// Configuration for transports
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Maximum message size in bytes
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5000,        // 5 seconds
            max_message_size: 10 * 1024 * 1024, // 10MB
        }
    }
}
