//! Protobuf schema of the envelope as it travels on the wire.
//!
//! ```protobuf
//! message Message {
//!     enum Type { REQUEST = 0; RESPONSE = 1; EVENT = 2; }
//!     Type type = 1;
//!     Request request = 2;
//!     Response response = 3;
//!     Event event = 4;
//! }
//! message Request { uint32 seq = 1; string method = 2; bytes payload = 3; string service = 4; }
//! message Response { uint32 seq = 1; bool ok = 2; optional bytes payload = 3; optional string error = 4; }
//! message Event { string name = 1; optional bytes payload = 2; }
//! ```

use bytes::Bytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Event = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub request: Option<Request>,
    #[prost(message, optional, tag = "3")]
    pub response: Option<Response>,
    #[prost(message, optional, tag = "4")]
    pub event: Option<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    #[prost(string, tag = "4")]
    pub service: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(bool, tag = "2")]
    pub ok: bool,
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub payload: Option<Bytes>,
    #[prost(string, optional, tag = "4")]
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub payload: Option<Bytes>,
}
