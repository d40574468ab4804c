//! Bidirectional RPC sessions over message-framed channels.
//!
//! Clients call methods of protobuf-described services; servers answer and
//! may push named events to their clients at any time. Both sides speak the
//! same envelope on any transport that delivers whole frames in order,
//! WebSocket by default.
//!
//! # Features
//!
//! - **Correlated calls**: 16-bit sequence numbers with per-call timeouts
//! - **Reconnection**: backoff between attempts, calls issued while
//!   disconnected are replayed in order once connected
//! - **Events**: server pushes, delivered raw or decoded by registered type
//! - **Multiple services**: methods keyed by full dotted names
//!
//! # Example
//!
//! ```no_run
//! use wsrpc::{Client, ClientOptions, Server, ServerOptions, ServiceDescriptor};
//! use wsrpc::ws::WebSocketListener;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Text {
//!     #[prost(string, tag = "1")]
//!     text: String,
//! }
//!
//! fn echo_service() -> ServiceDescriptor {
//!     ServiceDescriptor::new("demo.Echo").method::<Text, Text>("Echo")
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new([echo_service()], ServerOptions::default())?;
//!     server.implement("demo.Echo.Echo", |request: Text, _connection| async move {
//!         Ok(request)
//!     })?;
//!
//!     let listener = WebSocketListener::bind("127.0.0.1:8080").await?;
//!     server.listen(listener);
//!
//!     let client = Client::new("ws://127.0.0.1:8080", [echo_service()], ClientOptions::default());
//!     let reply: Text = client
//!         .service("demo.Echo")?
//!         .call("Echo", &Text { text: "hello".to_string() })
//!         .await?;
//!
//!     assert_eq!(reply.text, "hello");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;
pub mod service;

mod session;

// Re-export commonly used types
pub use client::{Client, ClientEvent, ClientOptions, ClientState, ListenerId, ServiceStub};
pub use codec::{EventDecoder, EventPayload, MessageDecoder};
pub use error::{
    ClientError, CodecError, ConnectionError, DispatchError, EnvelopeError, ResolveError,
    ServerError,
};
pub use protocol::Envelope;
pub use server::{Connection, Server, ServerEvent, ServerOptions};
pub use service::{MethodDescriptor, MethodRef, ServiceDescriptor, ServiceRef, Services};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use wsrpc_transport as transport;
pub use wsrpc_transport_memory as memory;
#[cfg(feature = "ws")]
pub use wsrpc_transport_ws as ws;
