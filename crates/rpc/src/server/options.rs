//! Server configuration.

use std::time::Duration;

/// Options for [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Keep-alive ping interval per connection; `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// Capacity of the [`ServerEvent`](crate::ServerEvent) channel.
    pub event_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ping_interval: Some(Duration::from_secs(10)),
            event_capacity: 256,
        }
    }
}

impl ServerOptions {
    /// Set the ping interval. Zero disables pings.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
