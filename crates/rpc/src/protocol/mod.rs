//! Wire protocol.

pub mod envelope;
mod wire;

pub use envelope::{Envelope, Event, Request, Response};
