//! RPC client.
//!
//! A [`Client`] owns one logical session with a server. A background driver
//! task runs the connection state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          |                    |
//!      +--------close-------------+<------close--------+
//!      |                                               |
//!      +---------close---------- Closing <--disconnect()+
//! ```
//!
//! While the client is active, every close schedules a reconnect after
//! `backoff(retries)`. Calls issued while not connected are held and written
//! in issue order once the next connection opens.
//!
//! Sequence numbers are 16 bits and wrap. A call still pending when its
//! sequence number comes around again loses its slot to the newer call.

mod calls;
mod events;
mod options;
mod stub;

pub use events::{ClientEvent, ListenerId};
pub use options::{Backoff, ClientOptions, default_backoff};
pub use stub::ServiceStub;

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use wsrpc_transport::{Channel, Connector, WriteStrategy};

use crate::codec::EventPayload;
use crate::error::ClientError;
use crate::protocol::{Envelope, Event, Request};
use crate::service::{ServiceDescriptor, Services};
use crate::session::{self, Outbox, Written};
use calls::{CallGuard, CallRegistry, Completion};
use events::EventListeners;

const EVENT_CAPACITY: usize = 256;

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No channel, none being opened.
    Disconnected,
    /// A channel is being opened.
    Connecting,
    /// A channel is open.
    Connected,
    /// A channel is being closed on request.
    Closing,
}

struct Session {
    state: ClientState,
    /// Whether the client should keep (re)connecting.
    active: bool,
    next_seq: u16,
    next_ticket: u64,
    retries: u32,
    outbox: Option<Outbox>,
}

struct ClientInner {
    address: String,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    strategy: WriteStrategy,
    services: Services,
    session: Mutex<Session>,
    calls: CallRegistry,
    events: broadcast::Sender<ClientEvent>,
    listeners: EventListeners,
    wake: Notify,
}

/// RPC client.
///
/// Dropping the client stops reconnecting and closes its channel. Calls
/// borrow the client, so none can be pending by then.
pub struct Client {
    inner: Arc<ClientInner>,
    driver: JoinHandle<()>,
}

impl Client {
    /// Create a client talking WebSocket to `address` (`ws://host:port`).
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[cfg(feature = "ws")]
    pub fn new(
        address: impl Into<String>,
        services: impl IntoIterator<Item = ServiceDescriptor>,
        options: ClientOptions,
    ) -> Self {
        Self::with_connector(
            address,
            wsrpc_transport_ws::WebSocketConnector::new(),
            services,
            options,
        )
    }

    /// Create a client opening its channels through `connector`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_connector(
        address: impl Into<String>,
        connector: impl Connector,
        services: impl IntoIterator<Item = ServiceDescriptor>,
        options: ClientOptions,
    ) -> Self {
        let strategy = options
            .write_strategy
            .unwrap_or_else(|| connector.write_strategy());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(ClientInner {
            address: address.into(),
            connector: Arc::new(connector),
            strategy,
            services: services.into_iter().collect(),
            session: Mutex::new(Session {
                state: ClientState::Disconnected,
                active: options.auto_connect,
                next_seq: 0,
                next_ticket: 0,
                retries: 0,
                outbox: None,
            }),
            options,
            calls: CallRegistry::default(),
            events,
            listeners: EventListeners::default(),
            wake: Notify::new(),
        });

        let driver = tokio::spawn(Arc::clone(&inner).drive());

        Self { inner, driver }
    }

    /// The address this client connects to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.inner.session.lock().state
    }

    /// Whether a channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Start (or keep) connecting and wait for the outcome of the attempt.
    ///
    /// The client stays active after a failed attempt and retries according
    /// to its backoff.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if the attempt closed before it
    /// opened.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut events = self.inner.events.subscribe();

        // A session still closing emits one more Close before the next attempt
        let mut stale_close = {
            let mut session = self.inner.session.lock();
            session.active = true;
            match session.state {
                ClientState::Connected => return Ok(()),
                ClientState::Disconnected => {
                    self.inner.wake.notify_one();
                    false
                }
                ClientState::Closing => {
                    self.inner.wake.notify_one();
                    true
                }
                ClientState::Connecting => false,
            }
        };

        loop {
            match events.recv().await {
                Ok(ClientEvent::Open) => return Ok(()),
                Ok(ClientEvent::Close) if stale_close => stale_close = false,
                Ok(ClientEvent::Close) => return Err(ClientError::NotConnected),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if self.is_connected() {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(ClientError::Closed),
            }
        }
    }

    /// Stop reconnecting and close the channel, if any.
    ///
    /// Pending calls are left to their timeouts.
    pub async fn disconnect(&self) {
        let mut events = self.inner.events.subscribe();

        let wait = {
            let mut session = self.inner.session.lock();
            session.active = false;
            match session.state {
                ClientState::Disconnected => false,
                ClientState::Connected => {
                    session.state = ClientState::Closing;
                    if let Some(outbox) = &session.outbox {
                        outbox.close();
                    }
                    true
                }
                ClientState::Connecting | ClientState::Closing => true,
            }
        };
        self.inner.wake.notify_one();

        if !wait {
            return;
        }

        loop {
            match events.recv().await {
                Ok(ClientEvent::Close) | Err(RecvError::Closed) => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if self.state() == ClientState::Disconnected {
                        return;
                    }
                }
            }
        }
    }

    /// Call `service.method` with an encoded request and wait for the
    /// encoded response.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Rpc`] if the server answered with an error
    /// - [`ClientError::Timeout`] if no answer arrived within the send timeout
    /// - [`ClientError::Transport`] if writing the request failed
    /// - [`ClientError::Closed`] if the client went away
    #[instrument(skip(self, payload))]
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes, ClientError> {
        let Issued {
            seq,
            ticket,
            completion,
            write,
        } = self.inner.issue(service, method, payload);
        let _guard = CallGuard {
            calls: &self.inner.calls,
            seq,
            ticket,
        };

        let exchange = async move {
            if let Some((outbox, data)) = write {
                trace!(seq, "Writing request");
                if let Err(e) = outbox.write(data).await {
                    return Err(ClientError::Transport(e));
                }
            } else {
                trace!(seq, "Buffering request until connected");
            }

            completion.await.unwrap_or(Err(ClientError::Closed))
        };

        match self.inner.options.send_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or(Err(ClientError::Timeout { elapsed: limit })),
            None => exchange.await,
        }
    }

    /// A stub for the service `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownService`] if the client was not created
    /// with that service.
    pub fn service(&self, name: &str) -> Result<ServiceStub<'_>, ClientError> {
        self.inner
            .services
            .get(name)
            .map(|descriptor| ServiceStub::new(self, descriptor))
            .ok_or_else(|| ClientError::UnknownService(name.to_string()))
    }

    /// A stub for the only service, if the client has exactly one.
    #[must_use]
    pub fn default_service(&self) -> Option<ServiceStub<'_>> {
        self.inner
            .services
            .default_service()
            .map(|descriptor| ServiceStub::new(self, descriptor))
    }

    /// Stubs for all services.
    pub fn services(&self) -> impl Iterator<Item = ServiceStub<'_>> {
        self.inner
            .services
            .iter()
            .map(|descriptor| ServiceStub::new(self, descriptor))
    }

    /// Receive lifecycle signals, errors and events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Run `listener` for every event named `name`.
    pub fn on_event(
        &self,
        name: impl Into<String>,
        listener: impl Fn(&EventPayload) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner
            .listeners
            .on(name, Arc::new(move |_: &str, payload: &EventPayload| listener(payload)))
    }

    /// Run `listener` for every event named `name` whose payload decoded
    /// to `T`.
    pub fn on_typed<T: Any>(
        &self,
        name: impl Into<String>,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> ListenerId {
        self.on_event(name, move |payload| {
            if let Some(value) = payload.downcast_ref::<T>() {
                listener(value);
            }
        })
    }

    /// Run `listener` for every event.
    pub fn on_any_event(
        &self,
        listener: impl Fn(&str, &EventPayload) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.on_any(Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("services", &self.inner.services.names())
            .finish_non_exhaustive()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.driver.abort();

        let outbox = {
            let mut session = self.inner.session.lock();
            session.active = false;
            session.outbox.take()
        };
        if let Some(outbox) = outbox {
            outbox.close();
        }
    }
}

struct Issued {
    seq: u16,
    ticket: u64,
    completion: Completion,
    write: Option<(Outbox, Bytes)>,
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn is_active(&self) -> bool {
        self.session.lock().active
    }

    fn set_state(&self, state: ClientState) {
        self.session.lock().state = state;
    }

    /// Allocate a seq, register the call and decide whether to write it now.
    fn issue(&self, service: &str, method: &str, payload: Bytes) -> Issued {
        let mut session = self.session.lock();

        let seq = session.next_seq;
        session.next_seq = seq.wrapping_add(1);
        let ticket = session.next_ticket;
        session.next_ticket += 1;

        let data = Envelope::Request(Request {
            seq,
            service: service.to_string(),
            method: method.to_string(),
            payload,
        })
        .encode();

        let outbox = match session.state {
            ClientState::Connected => session.outbox.clone(),
            _ => None,
        };

        match outbox {
            Some(outbox) => Issued {
                seq,
                ticket,
                completion: self.calls.register(seq, ticket, None),
                write: Some((outbox, data)),
            },
            None => Issued {
                seq,
                ticket,
                completion: self.calls.register(seq, ticket, Some(data)),
                write: None,
            },
        }
    }

    async fn drive(self: Arc<Self>) {
        loop {
            while !self.is_active() {
                self.wake.notified().await;
            }

            self.set_state(ClientState::Connecting);
            debug!(address = %self.address, "Connecting");

            match self.connector.connect(&self.address).await {
                Ok(channel) => self.run_session(channel).await,
                Err(e) => {
                    warn!(address = %self.address, "Connection failed: {}", e);
                    self.emit(ClientEvent::Error(Arc::new(ClientError::Transport(e))));
                }
            }

            let retries = self.closed();
            self.emit(ClientEvent::Close);

            if let Some(retries) = retries {
                let delay = (self.options.backoff)(retries);
                debug!(address = %self.address, retries, ?delay, "Reconnecting after backoff");

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.wake.notified() => {}
                }
            }
        }
    }

    /// Move to `Connected` unless the client was deactivated meanwhile, and
    /// queue the calls issued while disconnected.
    fn opened(&self, outbox: &Outbox) -> Option<Vec<(u16, u64, Written)>> {
        let mut session = self.session.lock();
        if !session.active {
            return None;
        }

        session.state = ClientState::Connected;
        session.retries = 0;
        session.outbox = Some(outbox.clone());

        // Queued under the session lock so newer calls land behind them
        let flushed = self
            .calls
            .take_buffered()
            .into_iter()
            .map(|(seq, ticket, data)| (seq, ticket, outbox.write(data)))
            .collect();
        Some(flushed)
    }

    /// Back to `Disconnected`; returns the retry count if a reconnect is due.
    fn closed(&self) -> Option<u32> {
        let mut session = self.session.lock();
        session.state = ClientState::Disconnected;
        session.outbox = None;

        if session.active {
            session.retries = session.retries.saturating_add(1);
            Some(session.retries)
        } else {
            None
        }
    }

    async fn run_session(&self, channel: Channel) {
        let Channel {
            sink,
            mut stream,
            peer,
        } = channel;
        let outbox = session::spawn_writer(sink, self.strategy, None);

        let Some(flushed) = self.opened(&outbox) else {
            debug!(address = %self.address, "Deactivated while connecting");
            outbox.close();
            return;
        };

        info!(address = %self.address, peer = ?peer, "Connected");
        self.emit(ClientEvent::Open);
        self.flush(flushed).await;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(data) => self.handle_frame(&data),
                Err(e) => {
                    warn!(address = %self.address, "Transport error: {}", e);
                    self.emit(ClientEvent::Error(Arc::new(ClientError::Transport(e))));
                    break;
                }
            }
        }

        outbox.close();
        info!(address = %self.address, "Disconnected");
    }

    /// Wait for the buffered calls to be written, failing those that were
    /// not.
    async fn flush(&self, flushed: Vec<(u16, u64, Written)>) {
        if flushed.is_empty() {
            return;
        }

        debug!(count = flushed.len(), "Writing buffered calls");
        for (seq, ticket, written) in flushed {
            if let Err(e) = written.await {
                warn!(seq, "Failed to write buffered call: {}", e);
                self.calls.settle(seq, ticket, Err(ClientError::Transport(e)));
            }
        }
    }

    fn handle_frame(&self, data: &[u8]) {
        match Envelope::decode(data) {
            Ok(Envelope::Response(response)) => {
                let seq = response.seq;
                trace!(seq, "Response received");

                let result = response.result.map_err(ClientError::Rpc);
                if !self.calls.complete(seq, result) {
                    warn!(seq, "Got response for unknown seqNo");
                    self.emit(ClientEvent::Error(Arc::new(ClientError::UnknownSeq { seq })));
                }
            }
            Ok(Envelope::Event(event)) => self.handle_event(event),
            Ok(Envelope::Request(request)) => {
                debug!(seq = request.seq, "Ignoring request from server");
            }
            Err(e) => {
                warn!("Got invalid message: {}", e);
                self.emit(ClientEvent::Error(Arc::new(ClientError::Message(e))));
            }
        }
    }

    fn handle_event(&self, event: Event) {
        let Event { name, payload } = event;

        let payload = match payload.filter(|data| !data.is_empty()) {
            None => EventPayload::Empty,
            Some(data) => match self.options.event_types.get(&name) {
                Some(decoder) => match decoder.decode(&data) {
                    Ok(value) => EventPayload::Decoded(value),
                    Err(source) => {
                        warn!(event = %name, "Could not decode event payload: {}", source);
                        self.emit(ClientEvent::Error(Arc::new(ClientError::Event {
                            name,
                            source,
                        })));
                        return;
                    }
                },
                None => EventPayload::Raw(data),
            },
        };

        trace!(event = %name, "Event received");
        self.listeners.dispatch(&name, &payload);
        self.emit(ClientEvent::Event { name, payload });
    }
}
