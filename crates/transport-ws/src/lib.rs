//! WebSocket transport implementation
//!
//! This implementation provides WebSocket connectivity on top of
//! tokio-tungstenite:
//! - For listening: [`WebSocketListener`] binds a TCP socket and performs the
//!   WebSocket handshake for every accepted peer in its own task
//! - For connecting: [`WebSocketConnector`] uses standard WebSocket client
//!   connections
//!
//! Every frame travels as one binary WebSocket message. Text messages are
//! ignored, ping/pong is answered by tungstenite itself.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, trace, warn};
use url::Url;
use wsrpc_transport::{
    Channel, Config, Connector, FrameSink, FrameStream, Listener, TransportError, WriteStrategy,
};

fn ws_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        e => TransportError::Io(std::io::Error::other(e)),
    }
}

/// Split an established WebSocket into a transport [`Channel`].
pub fn channel<S>(ws_stream: WebSocketStream<S>, max_message_size: usize) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws_stream.split();

    Channel::new(
        Box::new(WebSocketSink {
            sink,
            max_message_size,
        }),
        frames(stream, max_message_size),
    )
}

fn frames<S>(stream: SplitStream<WebSocketStream<S>>, max_message_size: usize) -> FrameStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(futures_util::stream::unfold(stream, move |mut stream| async move {
        loop {
            match stream.next().await? {
                Ok(Message::Binary(data)) => {
                    trace!("WebSocket received {} bytes", data.len());
                    if data.len() > max_message_size {
                        let error = TransportError::MessageTooLarge {
                            size: data.len(),
                            max: max_message_size,
                        };
                        return Some((Err(error), stream));
                    }
                    return Some((Ok(data), stream));
                }
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                Ok(Message::Text(_)) => {
                    debug!("Ignoring text frame");
                }
                Ok(_) => {
                    // Ping, pong and raw frames
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some((Err(ws_error(e)), stream)),
            }
        }
    }))
}

/// Outgoing half of a WebSocket.
struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    max_message_size: usize,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if data.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }

        self.sink.send(Message::Binary(data)).await.map_err(ws_error)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_error(e)),
        }
    }
}

/// Opens WebSocket connections to `ws://` addresses.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: Config,
    strategy: WriteStrategy,
}

impl WebSocketConnector {
    /// Create a connector with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a connector with the given configuration.
    #[must_use]
    pub const fn with_config(config: Config) -> Self {
        Self {
            config,
            strategy: WriteStrategy::Acknowledged,
        }
    }

    /// Report a different write strategy to clients using this connector.
    #[must_use]
    pub const fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, address: &str) -> Result<Channel, TransportError> {
        let url = Url::parse(address)
            .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidAddress(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        debug!("Connecting to WebSocket at {}", url);

        let connect_timeout = Duration::from_millis(self.config.connection_timeout_ms);
        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "WebSocket connect timed out after {connect_timeout:?}"
                ))
            })?
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("WebSocket connect failed: {e}"))
            })?;

        Ok(channel(ws_stream, self.config.max_message_size).with_peer(url.to_string()))
    }

    fn write_strategy(&self) -> WriteStrategy {
        self.strategy
    }
}

/// Delay before accepting again after a TCP accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accepts WebSocket peers on a TCP socket.
///
/// A background task accepts TCP connections and runs each handshake in its
/// own task, bounded by the configured connection timeout. Peers that fail or
/// stall the handshake are dropped without holding up the others.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    incoming_rx: flume::Receiver<Channel>,
    acceptor: JoinHandle<()>,
}

impl WebSocketListener {
    /// Bind to `addr`. Use port `0` to let the OS pick one.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, Config::default()).await
    }

    /// Bind to `addr` with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind_with_config(
        addr: impl ToSocketAddrs,
        config: Config,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!("WebSocket listener bound to {}", local_addr);

        let (incoming_tx, incoming_rx) = flume::unbounded();
        let acceptor = tokio::spawn(run_acceptor(listener, config, incoming_tx));

        Ok(Self {
            local_addr,
            incoming_rx,
            acceptor,
        })
    }

    /// The bound socket address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The `ws://` URL clients should dial.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }
}

async fn run_acceptor(listener: TcpListener, config: Config, incoming_tx: flume::Sender<Channel>) {
    let handshake_timeout = Duration::from_millis(config.connection_timeout_ms);

    loop {
        let (tcp_stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let incoming_tx = incoming_tx.clone();
        let max_message_size = config.max_message_size;
        tokio::spawn(async move {
            match timeout(handshake_timeout, accept_async(tcp_stream)).await {
                Ok(Ok(ws_stream)) => {
                    debug!("Accepted WebSocket connection from {}", peer);
                    let channel = channel(ws_stream, max_message_size).with_peer(peer.to_string());
                    if incoming_tx.send_async(channel).await.is_err() {
                        debug!("Listener gone, dropping {}", peer);
                    }
                }
                Ok(Err(e)) => warn!("WebSocket handshake with {} failed: {}", peer, e),
                Err(_) => warn!(
                    "WebSocket handshake with {} timed out after {:?}",
                    peer, handshake_timeout
                ),
            }
        });
    }
}

impl Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[async_trait]
impl Listener for WebSocketListener {
    async fn accept(&self) -> Result<Channel, TransportError> {
        self.incoming_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn local_addr(&self) -> Option<String> {
        Some(self.url())
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        self.acceptor.abort();
        debug!("WebSocket listener on {} released", self.local_addr);
    }
}
