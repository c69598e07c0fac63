use std::convert::Infallible;
use std::fmt::Debug;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The MQTT payload format indicator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FormatIndicator {
    #[default]
    UnspecifiedBytes = 0,
    Utf8EncodedCharacterData = 1,
}

impl TryFrom<Option<u8>> for FormatIndicator {
    type Error = u8;

    fn try_from(value: Option<u8>) -> Result<Self, Self::Error> {
        match value {
            None | Some(0) => Ok(Self::UnspecifiedBytes),
            Some(1) => Ok(Self::Utf8EncodedCharacterData),
            Some(other) => Err(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedPayload {
    pub payload: Bytes,
    pub content_type: String,
    pub format_indicator: FormatIndicator,
}

#[derive(thiserror::Error, Debug)]
pub enum DeserializationError<E> {
    #[error("invalid payload")]
    InvalidPayload(#[source] E),
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// A type that can be sent as a request or response payload.
pub trait PayloadSerialize: Sized + Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn serialize(self) -> Result<SerializedPayload, Self::Error>;

    fn deserialize(
        payload: &Bytes,
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>>;
}

/// Raw bytes, passed through untouched.
impl PayloadSerialize for Bytes {
    type Error = Infallible;

    fn serialize(self) -> Result<SerializedPayload, Self::Error> {
        Ok(SerializedPayload {
            payload: self,
            content_type: "application/octet-stream".into(),
            format_indicator: FormatIndicator::UnspecifiedBytes,
        })
    }

    fn deserialize(
        payload: &Bytes,
        _content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>> {
        Ok(payload.clone())
    }
}

/// A payload encoded as JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> PayloadSerialize for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = serde_json::Error;

    fn serialize(self) -> Result<SerializedPayload, Self::Error> {
        Ok(SerializedPayload {
            payload: serde_json::to_vec(&self.0)?.into(),
            content_type: "application/json".into(),
            format_indicator: FormatIndicator::Utf8EncodedCharacterData,
        })
    }

    fn deserialize(
        payload: &Bytes,
        content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>> {
        match content_type {
            None | Some("application/json") => serde_json::from_slice(payload)
                .map(Json)
                .map_err(DeserializationError::InvalidPayload),
            Some(other) => Err(DeserializationError::UnsupportedContentType(format!(
                "expected application/json, got {other}"
            ))),
        }
    }
}
