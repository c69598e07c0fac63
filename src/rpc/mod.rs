//! Commands over MQTT: request/response correlation, status codes and protocol metadata.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::ProtocolError;

mod correlation;
pub mod executor;
pub mod invoker;
pub mod payload;
pub mod streaming;
pub mod topic;

/// Prefix of user property keys reserved for the protocol.
pub const RESERVED_PREFIX: &str = "__";

/// The version of the command protocol spoken by this crate.
pub const RPC_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Assumed when a message doesn't carry a version.
pub const DEFAULT_RPC_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

pub const SUPPORTED_MAJOR_VERSIONS: &[u16] = &[1];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parse `major.minor`.
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;

        Some(ProtocolVersion {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    pub fn is_supported(&self, supported_major_versions: &[u16]) -> bool {
        supported_major_versions.contains(&self.major)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parse a space-separated list of major versions, skipping anything that isn't one.
pub fn parse_supported_major_versions(s: &str) -> Vec<u16> {
    s.split_whitespace()
        .filter_map(|version| version.parse().ok())
        .collect()
}

pub fn format_supported_major_versions(versions: &[u16]) -> String {
    versions
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    NoContent = 204,
    BadRequest = 400,
    RequestTimeout = 408,
    UnsupportedMediaType = 415,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    VersionNotSupported = 505,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StatusCodeParseError {
    #[error("status {0:?} is not an integer")]
    InvalidStatusCode(String),
    #[error("unknown status code {0}")]
    UnknownStatusCode(u16),
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::NoContent)
    }
}

impl FromStr for StatusCode {
    type Err = StatusCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code: u16 = s
            .parse()
            .map_err(|_| StatusCodeParseError::InvalidStatusCode(s.to_owned()))?;

        Ok(match code {
            200 => Self::Ok,
            204 => Self::NoContent,
            400 => Self::BadRequest,
            408 => Self::RequestTimeout,
            415 => Self::UnsupportedMediaType,
            500 => Self::InternalServerError,
            503 => Self::ServiceUnavailable,
            505 => Self::VersionNotSupported,
            other => return Err(StatusCodeParseError::UnknownStatusCode(other)),
        })
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

/// User properties with meaning to the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UserProperty {
    ProtocolVersion,
    SourceId,
    Timestamp,
    Status,
    StatusMessage,
    IsApplicationError,
    InvalidPropertyName,
    InvalidPropertyValue,
    SupportedMajorVersions,
    RequestProtocolVersion,
    /// Marks the final message of a stream.
    IsLast,
    /// Position of a message within a stream.
    StreamIndex,
    /// Asks the other side of a stream to stop.
    Cancel,
}

impl UserProperty {
    pub const ALL: [UserProperty; 13] = [
        Self::ProtocolVersion,
        Self::SourceId,
        Self::Timestamp,
        Self::Status,
        Self::StatusMessage,
        Self::IsApplicationError,
        Self::InvalidPropertyName,
        Self::InvalidPropertyValue,
        Self::SupportedMajorVersions,
        Self::RequestProtocolVersion,
        Self::IsLast,
        Self::StreamIndex,
        Self::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolVersion => "__protVer",
            Self::SourceId => "__srcId",
            Self::Timestamp => "__ts",
            Self::Status => "__stat",
            Self::StatusMessage => "__stMsg",
            Self::IsApplicationError => "__apErr",
            Self::InvalidPropertyName => "__propName",
            Self::InvalidPropertyValue => "__propVal",
            Self::SupportedMajorVersions => "__supProtMajVer",
            Self::RequestProtocolVersion => "__requestProtVer",
            Self::IsLast => "__isLast",
            Self::StreamIndex => "__idx",
            Self::Cancel => "__cancel",
        }
    }
}

impl Display for UserProperty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserProperty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|property| property.as_str() == s)
            .ok_or(())
    }
}

/// Reject custom user data that would collide with protocol properties.
pub fn validate_user_properties(properties: &[(String, String)]) -> Result<(), ProtocolError> {
    for (key, value) in properties {
        if key.starts_with(RESERVED_PREFIX) {
            return Err(ProtocolError::argument_invalid(key.clone(), value).with_message(
                format!("custom user data keys must not start with {RESERVED_PREFIX:?}"),
            ));
        }
    }

    Ok(())
}

/// Split user properties into the protocol's and everything else.
pub(crate) fn partition_user_properties(
    properties: Vec<(String, String)>,
) -> (
    crate::collections::HashMap<UserProperty, String>,
    Vec<(String, String)>,
) {
    let mut protocol = crate::collections::HashMap::default();
    let mut custom = Vec::new();

    for (key, value) in properties {
        match key.parse::<UserProperty>() {
            Ok(property) => {
                protocol.insert(property, value);
            }
            Err(()) => custom.push((key, value)),
        }
    }

    (protocol, custom)
}
