//! Server-side handle for one connected peer.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use wsrpc_transport::{FrameStream, TransportError};

use super::{ServerEvent, ServerShared};
use crate::error::{ConnectionError, DispatchError, EnvelopeError, ServerError};
use crate::protocol::{Envelope, Event, Request, Response};
use crate::session::Outbox;

const ERROR_CAPACITY: usize = 64;

/// A connected peer.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    peer: Option<String>,
    outbox: Outbox,
    shutdown: CancellationToken,
    closed: CancellationToken,
    errors: broadcast::Sender<Arc<ConnectionError>>,
    server: Weak<ServerShared>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer: Option<String>,
        outbox: Outbox,
        server: Weak<ServerShared>,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                outbox,
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                errors,
                server,
            }),
        }
    }

    /// Unique, never reused identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Transport's description of the peer.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.inner.peer.as_deref()
    }

    /// Push an event to the peer. Resolves once the transport took it.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the write failed.
    #[instrument(skip(self, payload), fields(connection_id = self.inner.id))]
    pub async fn send(&self, name: &str, payload: Option<Bytes>) -> Result<(), TransportError> {
        let data = Envelope::Event(Event {
            name: name.to_string(),
            payload,
        })
        .encode();

        self.inner.outbox.write(data).await
    }

    /// Close the connection.
    ///
    /// Stops reading at once; the peer is not waited on to acknowledge.
    pub fn close(&self) {
        debug!(connection_id = self.inner.id, "Closing connection");
        self.inner.outbox.close();
        self.inner.shutdown.cancel();
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Whether the connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.outbox.is_closed()
    }

    /// Receive errors raised on this connection from now on.
    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<ConnectionError>> {
        self.inner.errors.subscribe()
    }

    /// Read requests until the peer goes away, then deregister.
    pub(crate) async fn serve(self, mut stream: FrameStream) {
        loop {
            let frame = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(data)) => self.handle_frame(&data),
                Some(Err(e)) => {
                    warn!(connection_id = self.inner.id, "Transport error: {}", e);
                    self.report(ConnectionError::Transport(e));
                    break;
                }
                None => break,
            }
        }
        drop(stream);

        self.inner.outbox.close();
        if let Some(server) = self.inner.server.upgrade() {
            server.connections.remove(self.inner.id);
        }
        self.inner.closed.cancel();

        info!(connection_id = self.inner.id, "Connection closed");
    }

    fn handle_frame(&self, data: &[u8]) {
        let request = match Envelope::decode(data) {
            Ok(Envelope::Request(request)) => request,
            Ok(other) => {
                self.report(ConnectionError::Request(EnvelopeError::InvalidType(
                    other.kind().to_string(),
                )));
                return;
            }
            Err(e) => {
                self.report(ConnectionError::Request(e));
                return;
            }
        };

        trace!(
            connection_id = self.inner.id,
            seq = request.seq,
            service = %request.service,
            method = %request.method,
            "Request received"
        );

        tokio::spawn(self.clone().respond(request));
    }

    async fn respond(self, request: Request) {
        let seq = request.seq;
        let outcome = self.dispatch(request).await;

        let result = match &outcome {
            Ok(payload) => Ok(payload.clone()),
            Err(e) => Err(e.to_string()),
        };
        let data = Envelope::Response(Response { seq, result }).encode();

        if let Err(e) = self.inner.outbox.write(data).await {
            debug!(connection_id = self.inner.id, seq, "Failed to write response: {}", e);
        }

        if let Err(e) = outcome {
            self.report(ConnectionError::Dispatch(e));
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Bytes, DispatchError> {
        let handler = self
            .inner
            .server
            .upgrade()
            .ok_or(DispatchError::ServerClosed)?
            .resolver
            .resolve(&request.service, &request.method)?;

        let connection = self.clone();
        let invocation = async move { handler.call(request.payload, connection).await };

        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Handler(panic_message(panic.as_ref()))),
        }
    }

    /// Surface an error on this connection and on the server.
    fn report(&self, error: ConnectionError) {
        debug!(connection_id = self.inner.id, "Connection error: {}", error);

        let error = Arc::new(error);
        let _ = self.inner.errors.send(Arc::clone(&error));

        if let Some(server) = self.inner.server.upgrade() {
            server.emit(ServerEvent::Error(Arc::new(ServerError::Connection {
                id: self.inner.id,
                source: error,
            })));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Handler panicked".to_string())
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
