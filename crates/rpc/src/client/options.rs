//! Client configuration.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use wsrpc_transport::WriteStrategy;

use crate::codec::{EventDecoder, MessageDecoder};

/// Maps the number of consecutive failed attempts to a reconnect delay.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// `min((tries * 10)^2, 60000)` milliseconds.
#[must_use]
pub fn default_backoff(tries: u32) -> Duration {
    let millis = (u64::from(tries) * 10).saturating_pow(2).min(60_000);
    Duration::from_millis(millis)
}

/// Options for [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientOptions {
    /// Per-call timeout; `None` waits forever.
    pub send_timeout: Option<Duration>,
    /// Reconnect delay policy.
    pub backoff: Backoff,
    /// Connect as soon as the client is created.
    pub auto_connect: bool,
    /// Decoders for typed events, by event name.
    pub event_types: HashMap<String, Arc<dyn EventDecoder>>,
    /// Write strategy; defaults to the connector's.
    pub write_strategy: Option<WriteStrategy>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            send_timeout: Some(Duration::from_secs(5)),
            backoff: Arc::new(default_backoff),
            auto_connect: true,
            event_types: HashMap::new(),
            write_strategy: None,
        }
    }
}

impl ClientOptions {
    /// Set the per-call timeout. Zero disables it.
    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the reconnect delay policy.
    #[must_use]
    pub fn backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Whether to connect on creation.
    #[must_use]
    pub const fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Decode payloads of the event `name` as `T`.
    #[must_use]
    pub fn event_type<T>(self, name: impl Into<String>) -> Self
    where
        T: prost::Message + Default + 'static,
    {
        self.event_decoder(name, Arc::new(MessageDecoder::<T>::new()))
    }

    /// Decode payloads of the event `name` with `decoder`.
    #[must_use]
    pub fn event_decoder(mut self, name: impl Into<String>, decoder: Arc<dyn EventDecoder>) -> Self {
        self.event_types.insert(name.into(), decoder);
        self
    }

    /// Override the connector's write strategy.
    #[must_use]
    pub const fn write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = Some(strategy);
        self
    }
}

impl Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut event_types: Vec<_> = self.event_types.keys().collect();
        event_types.sort();

        f.debug_struct("ClientOptions")
            .field("send_timeout", &self.send_timeout)
            .field("auto_connect", &self.auto_connect)
            .field("event_types", &event_types)
            .field("write_strategy", &self.write_strategy)
            .finish_non_exhaustive()
    }
}
