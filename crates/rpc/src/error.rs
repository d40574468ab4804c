//! Error types for the RPC session layer.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use wsrpc_transport::TransportError;

/// Failure to make sense of a frame as an envelope.
#[derive(Debug, Clone, Error)]
pub enum EnvelopeError {
    /// The bytes are not a valid envelope encoding.
    #[error("{0}")]
    Malformed(#[from] prost::DecodeError),

    /// The envelope type is unknown, or not the one expected here.
    #[error("Invalid message type: {0}")]
    InvalidType(String),

    /// The type tag names a body that is absent.
    #[error("Message {0} missing")]
    MissingBody(&'static str),

    /// A sequence number that does not fit in 16 bits.
    #[error("Sequence number {0} out of range")]
    SeqOutOfRange(u32),
}

/// Payload (de)serialization errors.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Payload bytes could not be decoded as the expected type.
    #[error("Failed to decode {type_name}: {source}")]
    Decode {
        /// The type we tried to decode.
        type_name: &'static str,
        /// The underlying error.
        #[source]
        source: prost::DecodeError,
    },
}

/// Errors produced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No response arrived within the send timeout.
    #[error("Timed out after {}ms", elapsed.as_millis())]
    Timeout {
        /// The configured timeout that expired.
        elapsed: Duration,
    },

    /// The server answered the call with an error.
    #[error("{0}")]
    Rpc(String),

    /// A frame from the server could not be decoded.
    #[error("got invalid message: {0}")]
    Message(#[source] EnvelopeError),

    /// A response arrived for a sequence number with no pending call.
    #[error("Got response for unknown seqNo: {seq}")]
    UnknownSeq {
        /// The unmatched sequence number.
        seq: u16,
    },

    /// A typed event payload failed to decode; the event was dropped.
    #[error("could not decode event payload for {name}: {source}")]
    Event {
        /// Event name.
        name: String,
        /// The underlying error.
        #[source]
        source: CodecError,
    },

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A connection attempt closed before it opened.
    #[error("Not connected")]
    NotConnected,

    /// The client was dropped with the call still pending.
    #[error("Client closed")]
    Closed,

    /// No such service on this client.
    #[error("Invalid service: {0}")]
    UnknownService(String),

    /// No such method on the service.
    #[error("Invalid method: {0}")]
    UnknownMethod(String),

    /// The call's message types differ from the method's descriptor.
    #[error("{method} expects {expected}, got {actual}")]
    TypeMismatch {
        /// Full method name.
        method: String,
        /// Type named by the descriptor.
        expected: &'static str,
        /// Type supplied by the caller.
        actual: &'static str,
    },
}

/// Server-side request failures. The display string is what the caller
/// receives as the error message.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The requested service is not served here.
    #[error("Invalid service")]
    InvalidService,

    /// The service has no such method.
    #[error("Invalid method")]
    InvalidMethod,

    /// The method exists but nobody implemented it.
    #[error("Not implemented")]
    NotImplemented,

    /// The request payload did not decode.
    #[error("{0}")]
    Codec(#[from] CodecError),

    /// The handler failed or panicked.
    #[error("{0}")]
    Handler(String),

    /// The server owning the connection is gone.
    #[error("Server closed")]
    ServerClosed,
}

/// Errors raised on a server-side connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// An inbound frame was not a usable request.
    #[error("could not decode message: {0}")]
    Request(#[from] EnvelopeError),

    /// A request was answered with an error.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A connection reported an error.
    #[error("connection error: {source}")]
    Connection {
        /// The connection's id.
        id: u64,
        /// What went wrong.
        #[source]
        source: Arc<ConnectionError>,
    },

    /// A listener failed.
    #[error("listener error: {0}")]
    Transport(#[from] TransportError),
}

/// Setup-time failures of [`Server::new`](crate::Server::new) and
/// [`Server::implement`](crate::Server::implement).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A server needs at least one service.
    #[error("There are no services")]
    NoServices,

    /// Two services share a full name.
    #[error("Service {0} registered twice")]
    DuplicateService(String),

    /// No such service.
    #[error("Invalid service: {0}")]
    InvalidService(String),

    /// No such method on the service.
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    /// A bare method name was given but more than one service is served.
    #[error("There is no default service, the service has to be named")]
    NoDefaultService,

    /// A method descriptor that belongs to no service.
    #[error("Failed to implement orphan method {0}")]
    OrphanMethod(String),

    /// The handler's message types differ from the method's descriptor.
    #[error("{method} expects {expected}, handler uses {actual}")]
    TypeMismatch {
        /// Full method name.
        method: String,
        /// Type named by the descriptor.
        expected: &'static str,
        /// Type used by the handler.
        actual: &'static str,
    },
}
