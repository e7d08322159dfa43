// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! The engine never hardcodes a wire format. A [`Serializer`] is bound when the
//! client is built and every publish, consume and replay goes through it.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Converts payloads to and from their wire representation.
///
/// Empty input deserializes to `T::default()` rather than failing, which lets
/// producers publish "nothing" without breaking consumers.
pub trait Serializer: Send + Sync + 'static {
    /// Content type stamped on published messages.
    fn content_type(&self) -> &'static str;

    fn serialize_to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError>;

    fn deserialize_from_bytes<T: DeserializeOwned + Default>(
        &self,
        bytes: &[u8],
    ) -> Result<T, AmqpError>;

    fn bytes_to_text(&self, bytes: &[u8]) -> Result<String, AmqpError>;

    fn deserialize_from_string<T: DeserializeOwned + Default>(
        &self,
        text: &str,
    ) -> Result<T, AmqpError>;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn serialize_to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })
    }

    fn deserialize_from_bytes<T: DeserializeOwned + Default>(
        &self,
        bytes: &[u8],
    ) -> Result<T, AmqpError> {
        if bytes.is_empty() {
            return Ok(T::default());
        }

        serde_json::from_slice(bytes).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    fn bytes_to_text(&self, bytes: &[u8]) -> Result<String, AmqpError> {
        String::from_utf8(bytes.to_vec()).map_err(|err| {
            error!(error = err.to_string(), "payload is not valid utf-8");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    fn deserialize_from_string<T: DeserializeOwned + Default>(
        &self,
        text: &str,
    ) -> Result<T, AmqpError> {
        if text.trim().is_empty() {
            return Ok(T::default());
        }

        serde_json::from_str(text).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        id: u64,
        customer: String,
    }

    #[test]
    fn empty_input_yields_default() {
        let s = JsonSerializer;

        let from_bytes: OrderCreated = s.deserialize_from_bytes(&[]).unwrap();
        assert_eq!(from_bytes, OrderCreated::default());

        let from_text: OrderCreated = s.deserialize_from_string("   ").unwrap();
        assert_eq!(from_text, OrderCreated::default());
    }

    #[test]
    fn text_and_bytes_agree() {
        let s = JsonSerializer;
        let order = OrderCreated {
            id: 7,
            customer: "ada".to_owned(),
        };

        let bytes = s.serialize_to_bytes(&order).unwrap();
        let text = s.bytes_to_text(&bytes).unwrap();
        assert_eq!(text, r#"{"id":7,"customer":"ada"}"#);
        assert_eq!(s.deserialize_from_string::<OrderCreated>(&text).unwrap(), order);
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let s = JsonSerializer;

        assert!(matches!(
            s.deserialize_from_bytes::<OrderCreated>(b"{not json"),
            Err(AmqpError::ParsePayloadError(_))
        ));
        assert!(matches!(
            s.bytes_to_text(&[0xff, 0xfe]),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }
}
