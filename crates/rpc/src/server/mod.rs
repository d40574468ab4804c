//! RPC server.
//!
//! A [`Server`] serves one or more services to every channel it accepts.
//! Each channel becomes a [`Connection`] with its own reader task, writer task
//! and optional keep-alive ping; requests on a connection are handled
//! concurrently.

mod connection;
mod options;
mod registry;
mod resolver;

pub use connection::Connection;
pub use options::ServerOptions;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use wsrpc_transport::{Channel, Listener, TransportError, WriteStrategy};

use crate::error::{ResolveError, ServerError};
use crate::service::{
    MethodDescriptor, MethodRef, ServiceDescriptor, ServiceRef, Services, TypeDescriptor,
};
use crate::session;
use registry::ConnectionRegistry;
use resolver::{MethodResolver, TypedHandler};

/// Delay before accepting again after a listener error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Something that happened on a server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A listener started accepting.
    Listening {
        /// Where peers should connect, if the listener knows.
        address: Option<String>,
    },
    /// A peer connected.
    Connection(Connection),
    /// A connection or listener failed.
    Error(Arc<ServerError>),
}

pub(crate) struct ServerShared {
    resolver: MethodResolver,
    connections: ConnectionRegistry,
    options: ServerOptions,
    events: broadcast::Sender<ServerEvent>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ServerShared {
    fn emit(&self, event: ServerEvent) {
        if let ServerEvent::Error(e) = &event {
            debug!("Server error: {}", e);
        }
        let _ = self.events.send(event);
    }
}

/// RPC server.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server for `services`.
    ///
    /// # Errors
    ///
    /// Fails if there are no services or two share a full name.
    pub fn new(
        services: impl IntoIterator<Item = ServiceDescriptor>,
        options: ServerOptions,
    ) -> Result<Self, ResolveError> {
        let resolver = MethodResolver::new(services.into_iter().collect())?;
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        Ok(Self {
            shared: Arc::new(ServerShared {
                resolver,
                connections: ConnectionRegistry::default(),
                options,
                events,
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// The served services.
    #[must_use]
    pub fn services(&self) -> &Services {
        self.shared.resolver.services()
    }

    /// Implement a method given by dotted name (`package.Service.method`),
    /// by bare name when serving a single service, or by descriptor.
    ///
    /// # Errors
    ///
    /// Fails if the method cannot be resolved or its message types differ
    /// from `Req`/`Resp`.
    pub fn implement<'m, Req, Resp, F, Fut>(
        &self,
        method: impl Into<MethodRef<'m>>,
        handler: F,
    ) -> Result<(), ResolveError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let method = self.shared.resolver.target(None, method.into())?;
        self.register(method, handler)
    }

    /// Implement a method of an explicitly named service.
    ///
    /// # Errors
    ///
    /// Fails if the service or method cannot be resolved or the method's
    /// message types differ from `Req`/`Resp`.
    pub fn implement_service<'s, 'm, Req, Resp, F, Fut>(
        &self,
        service: impl Into<ServiceRef<'s>>,
        method: impl Into<MethodRef<'m>>,
        handler: F,
    ) -> Result<(), ResolveError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let method = self
            .shared
            .resolver
            .target(Some(service.into()), method.into())?;
        self.register(method, handler)
    }

    fn register<Req, Resp, F, Fut>(
        &self,
        method: &MethodDescriptor,
        handler: F,
    ) -> Result<(), ResolveError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        for (expected, actual) in [
            (method.request_type(), TypeDescriptor::of::<Req>()),
            (method.response_type(), TypeDescriptor::of::<Resp>()),
        ] {
            if expected != actual {
                return Err(ResolveError::TypeMismatch {
                    method: method.full_name(),
                    expected: expected.name(),
                    actual: actual.name(),
                });
            }
        }

        debug!(method = %method.full_name(), "Implemented");
        self.shared
            .resolver
            .register(method, Arc::new(TypedHandler::<Req, Resp, F>::new(handler)));
        Ok(())
    }

    /// Accept channels from `listener` until the server closes or the
    /// listener stops.
    pub fn listen(&self, listener: impl Listener) -> JoinHandle<()> {
        let address = listener.local_addr();
        info!(address = ?address, "Server listening");
        self.shared.emit(ServerEvent::Listening { address });

        let server = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok(channel) => {
                        server.accept(channel);
                    }
                    Err(TransportError::ConnectionClosed) => {
                        debug!("Listener closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        server
                            .shared
                            .emit(ServerEvent::Error(Arc::new(ServerError::Transport(e))));
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        })
    }

    /// Serve an already open channel.
    pub fn accept(&self, channel: Channel) -> Connection {
        let Channel { sink, stream, peer } = channel;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let outbox = session::spawn_writer(
            sink,
            WriteStrategy::Acknowledged,
            self.shared.options.ping_interval,
        );
        let connection = Connection::new(id, peer, outbox, Arc::downgrade(&self.shared));

        self.shared.connections.insert(connection.clone());
        info!(connection_id = id, peer = ?connection.peer(), "Connection accepted");

        tokio::spawn(connection.clone().serve(stream));
        self.shared.emit(ServerEvent::Connection(connection.clone()));

        connection
    }

    /// Send an event to every connection. Waits for all writes; individual
    /// failures are ignored.
    #[instrument(skip(self, payload))]
    pub async fn broadcast(&self, name: &str, payload: Option<Bytes>) {
        let connections = self.connections();
        let sends = connections
            .iter()
            .map(|connection| connection.send(name, payload.clone()));

        for (connection, result) in connections
            .iter()
            .zip(futures::future::join_all(sends).await)
        {
            if let Err(e) = result {
                debug!(connection_id = connection.id(), "Broadcast failed: {}", e);
            }
        }
    }

    /// Live connections, ordered by id.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections.snapshot()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Receive server events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Stop accepting and close every connection.
    pub async fn close(&self) {
        info!("Closing server");
        self.shared.shutdown.cancel();

        let connections = self.connections();
        for connection in &connections {
            connection.close();
        }
        futures::future::join_all(connections.iter().map(Connection::closed)).await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.services().names())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
