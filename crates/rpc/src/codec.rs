//! Protobuf payload codec and typed event decoding.

use std::any::{Any, type_name};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::CodecError;

/// Encode a message into payload bytes.
#[must_use]
pub fn encode<T: prost::Message>(message: &T) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Decode payload bytes into a message.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid encoding of `T`.
pub fn decode<T: prost::Message + Default>(data: &[u8]) -> Result<T, CodecError> {
    T::decode(data).map_err(|source| CodecError::Decode {
        type_name: type_name::<T>(),
        source,
    })
}

/// Turns raw event payloads into typed values.
pub trait EventDecoder: Send + Sync + 'static {
    /// Decode one payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid encoding.
    fn decode(&self, data: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, CodecError>;

    /// Name of the produced type.
    fn type_name(&self) -> &'static str;
}

/// [`EventDecoder`] for a protobuf message type.
pub struct MessageDecoder<T>(PhantomData<fn() -> T>);

impl<T> MessageDecoder<T> {
    /// Create a decoder for `T`.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for MessageDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventDecoder for MessageDecoder<T>
where
    T: prost::Message + Default + 'static,
{
    fn decode(&self, data: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, CodecError> {
        let value: T = decode(data)?;
        Ok(Arc::new(value))
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// Payload of a received event.
#[derive(Clone)]
pub enum EventPayload {
    /// The event carried no payload.
    Empty,
    /// No decoder is registered for the event name.
    Raw(Bytes),
    /// Output of the registered decoder.
    Decoded(Arc<dyn Any + Send + Sync>),
}

impl EventPayload {
    /// Borrow the decoded value as `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Decoded(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// The raw bytes, if the payload was not decoded.
    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether the event carried no payload.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl Debug for EventPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            Self::Decoded(_) => f.write_str("Decoded(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct TextMessage {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[test]
    fn test_encode_decode() {
        let msg = TextMessage {
            text: "hello world".to_string(),
        };

        let encoded = encode(&msg);
        let decoded: TextMessage = decode(&encoded).unwrap();

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_decode_error_names_type() {
        let result: Result<TextMessage, _> = decode(&[0xFF, 0xFF, 0xFF]);
        let error = result.unwrap_err();
        assert!(error.to_string().contains("TextMessage"));
    }

    #[test]
    fn test_message_decoder_downcasts() {
        let decoder = MessageDecoder::<TextMessage>::new();
        let value = decoder
            .decode(&encode(&TextMessage {
                text: "typed".to_string(),
            }))
            .unwrap();

        let payload = EventPayload::Decoded(value);
        assert_eq!(payload.downcast_ref::<TextMessage>().unwrap().text, "typed");
        assert!(payload.downcast_ref::<String>().is_none());
        assert!(payload.as_bytes().is_none());
    }
}
