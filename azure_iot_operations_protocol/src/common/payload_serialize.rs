// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error;
use std::fmt::Debug;

/// Format indicator for serialization and deserialization.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatIndicator {
    /// Unspecified Bytes
    #[default]
    UnspecifiedBytes = 0,
    /// UTF-8 Encoded Character Data (as JSON)
    Utf8EncodedCharacterData = 1,
}

impl TryFrom<Option<u8>> for FormatIndicator {
    type Error = u8;

    /// Converts the MQTT `payload_format_indicator` property (absent or 0 means unspecified
    /// bytes, 1 means UTF-8) into a [`FormatIndicator`]. Any other value is not defined by the
    /// MQTT spec and is returned as an error.
    fn try_from(value: Option<u8>) -> Result<Self, u8> {
        match value {
            None | Some(0) => Ok(FormatIndicator::UnspecifiedBytes),
            Some(1) => Ok(FormatIndicator::Utf8EncodedCharacterData),
            Some(other) => Err(other),
        }
    }
}

/// The result of successfully serializing a payload: the raw bytes along with the content type
/// and format indicator that should be set on the outgoing MQTT message.
#[derive(Clone, Debug, Default)]
pub struct SerializedPayload {
    /// The serialized payload bytes.
    pub payload: Vec<u8>,
    /// The content type of the payload, e.g. `application/json`.
    pub content_type: String,
    /// The format indicator of the payload.
    pub format_indicator: FormatIndicator,
}

/// Error type surfaced when deserializing an incoming payload fails.
#[derive(Debug)]
pub enum DeserializationError<E> {
    /// The payload bytes could not be deserialized into the target type.
    InvalidPayload(E),
    /// The content type of the incoming message is not supported by this payload type.
    UnsupportedContentType(String),
}

/// Trait for serializing and deserializing payloads.
///
/// Unlike a fixed, type-wide content type and format, implementations negotiate the content
/// type and format indicator per message: `serialize` reports the content type/format it used,
/// and `deserialize` is handed the content type/format indicator the message actually arrived
/// with so it can reject or adapt to unexpected values.
///
/// # Examples
/// ```
/// use azure_iot_operations_protocol::common::payload_serialize::{
///     DeserializationError, FormatIndicator, PayloadSerialize, SerializedPayload,
/// };
/// #[derive(Clone, Debug)]
/// pub struct CarLocation {
///     latitude: f64,
///     longitude: f64,
/// }
/// impl PayloadSerialize for CarLocation {
///     type Error = String;
///     fn serialize(self) -> Result<SerializedPayload, String> {
///         let payload = format!("{{\"latitude\": {}, \"longitude\": {}}}", self.latitude, self.longitude);
///         Ok(SerializedPayload {
///             payload: payload.into_bytes(),
///             content_type: "application/json".to_string(),
///             format_indicator: FormatIndicator::Utf8EncodedCharacterData,
///         })
///     }
///     fn deserialize(
///         payload: &[u8],
///         _content_type: Option<&String>,
///         _format_indicator: &FormatIndicator,
///     ) -> Result<Self, DeserializationError<String>> {
///         // mock deserialization here for brevity
///         let _payload = String::from_utf8(payload.to_vec())
///             .map_err(|e| DeserializationError::InvalidPayload(e.to_string()))?;
///         Ok(CarLocation { latitude: 12.0, longitude: 35.0 })
///     }
/// }
/// ```
pub trait PayloadSerialize: Clone {
    type Error: Debug + Into<Box<dyn Error + Sync + Send + 'static>>;

    /// Serializes the payload, consuming it, into its wire representation.
    ///
    /// # Errors
    /// Returns `Self::Error` if serialization fails.
    fn serialize(self) -> Result<SerializedPayload, Self::Error>;

    /// Deserializes the payload from its wire representation, given the content type and
    /// format indicator the message actually arrived with.
    ///
    /// # Errors
    /// Returns a [`DeserializationError`] if the payload bytes cannot be deserialized or the
    /// content type is not supported.
    fn deserialize(
        payload: &[u8],
        content_type: Option<&String>,
        format_indicator: &FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>>
    where
        Self: Sized;
}

#[cfg(test)]
use mockall::mock;
#[cfg(test)]
use std::sync::Mutex;

/// Mockall's static-context mocking for [`MockPayload::deserialize`] is not inherently
/// thread-safe across concurrently-running tests; tests that configure it serialize on this
/// mutex for the duration of the expectation.
#[cfg(test)]
pub static DESERIALIZE_MTX: Mutex<()> = Mutex::new(());

#[cfg(test)]
mock! {
    pub Payload {}
    impl Clone for Payload {
        fn clone(&self) -> Self;
    }
    impl PayloadSerialize for Payload {
        type Error = String;
        fn serialize(self) -> Result<SerializedPayload, String>;
        fn deserialize(
            payload: &[u8],
            content_type: Option<&String>,
            format_indicator: &FormatIndicator,
        ) -> Result<Self, DeserializationError<String>>;
    }
}
