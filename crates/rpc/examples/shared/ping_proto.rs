//! Messages and service shared by the ping demos.

use wsrpc::ServiceDescriptor;

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: bytes::Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: bytes::Bytes,
    /// Milliseconds since the Unix epoch, as seen by the server.
    #[prost(uint64, tag = "3")]
    pub server_time_ms: u64,
}

pub const SERVICE: &str = "ping.PingService";

pub fn ping_service() -> ServiceDescriptor {
    ServiceDescriptor::new(SERVICE).method::<PingRequest, PingResponse>("Ping")
}
