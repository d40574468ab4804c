//! The three message kinds exchanged over a session.

use bytes::Bytes;
use prost::Message as _;

use super::wire;
use crate::error::EnvelopeError;

/// One wire-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A call from client to server.
    Request(Request),
    /// The answer to a request, correlated by `seq`.
    Response(Response),
    /// An unsolicited, named push from server to client.
    Event(Event),
}

/// A method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Client-assigned sequence number.
    pub seq: u16,
    /// Full service name, empty for the default service.
    pub service: String,
    /// Method name.
    pub method: String,
    /// Encoded request message.
    pub payload: Bytes,
}

/// The outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Sequence number of the request being answered.
    pub seq: u16,
    /// Encoded response message, or the error message.
    pub result: Result<Bytes, String>,
}

/// A named event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Optional payload.
    pub payload: Option<Bytes>,
}

impl Envelope {
    /// Short name of the variant, for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
        }
    }

    /// Encode into a single frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let message = match self {
            Self::Request(request) => wire::Message {
                r#type: wire::MessageType::Request as i32,
                request: Some(wire::Request {
                    seq: u32::from(request.seq),
                    method: request.method.clone(),
                    payload: request.payload.clone(),
                    service: request.service.clone(),
                }),
                ..Default::default()
            },
            Self::Response(response) => {
                let (ok, payload, error) = match &response.result {
                    Ok(payload) => (true, Some(payload.clone()), None),
                    Err(error) => (false, None, Some(error.clone())),
                };
                wire::Message {
                    r#type: wire::MessageType::Response as i32,
                    response: Some(wire::Response {
                        seq: u32::from(response.seq),
                        ok,
                        payload,
                        error,
                    }),
                    ..Default::default()
                }
            }
            Self::Event(event) => wire::Message {
                r#type: wire::MessageType::Event as i32,
                event: Some(wire::Event {
                    name: event.name.clone(),
                    payload: event.payload.clone(),
                }),
                ..Default::default()
            },
        };

        Bytes::from(message.encode_to_vec())
    }

    /// Decode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not an envelope, the type tag is
    /// unknown, or the body the tag names is missing.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let message = wire::Message::decode(data)?;

        match wire::MessageType::try_from(message.r#type) {
            Ok(wire::MessageType::Request) => {
                let request = message.request.ok_or(EnvelopeError::MissingBody("request"))?;
                Ok(Self::Request(Request {
                    seq: seq(request.seq)?,
                    service: request.service,
                    method: request.method,
                    payload: request.payload,
                }))
            }
            Ok(wire::MessageType::Response) => {
                let response = message
                    .response
                    .ok_or(EnvelopeError::MissingBody("response"))?;
                let result = if response.ok {
                    Ok(response.payload.unwrap_or_default())
                } else {
                    Err(response
                        .error
                        .unwrap_or_else(|| "Unknown error".to_string()))
                };
                Ok(Self::Response(Response {
                    seq: seq(response.seq)?,
                    result,
                }))
            }
            Ok(wire::MessageType::Event) => {
                let event = message.event.ok_or(EnvelopeError::MissingBody("event"))?;
                Ok(Self::Event(Event {
                    name: event.name,
                    payload: event.payload,
                }))
            }
            Err(_) => Err(EnvelopeError::InvalidType(message.r#type.to_string())),
        }
    }
}

fn seq(value: u32) -> Result<u16, EnvelopeError> {
    u16::try_from(value).map_err(|_| EnvelopeError::SeqOutOfRange(value))
}
