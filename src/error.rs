use std::fmt;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by command invocation and execution.
///
/// The [`kind`](ProtocolError::kind) decides how a caller should react; the remaining fields
/// carry diagnostics.
#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: Option<String>,
    /// `true` if the error was reported by the remote side of the exchange.
    pub is_remote: bool,
    pub command_name: Option<String>,
    pub source: Option<BoxError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// A required header (MQTT property or user property) was not present.
    HeaderMissing { header_name: String },
    /// A header was present but could not be interpreted.
    HeaderInvalid {
        header_name: String,
        header_value: String,
    },
    PayloadInvalid,
    Timeout {
        timeout_name: String,
        timeout_value: Option<Duration>,
    },
    /// The transport rejected or failed an operation.
    ClientError,
    /// Bad construction parameters. Never worth retrying.
    ConfigurationInvalid {
        property_name: String,
        property_value: String,
    },
    /// A per-call argument was rejected before anything was sent.
    ArgumentInvalid {
        property_name: String,
        property_value: String,
    },
    StateInvalid { property_name: Option<String> },
    InternalLogicError { property_name: Option<String> },
    UnknownError,
    /// The remote application reported a failure.
    ExecutionException {
        property_name: Option<String>,
        property_value: Option<String>,
    },
    Cancellation,
    UnsupportedVersion {
        protocol_version: String,
        supported_major_versions: Vec<u16>,
    },
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind) -> Self {
        ProtocolError {
            kind,
            message: None,
            is_remote: false,
            command_name: None,
            source: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_command_name(mut self, command_name: impl Into<String>) -> Self {
        self.command_name = Some(command_name.into());
        self
    }

    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    pub fn header_missing(header_name: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::HeaderMissing {
            header_name: header_name.into(),
        })
    }

    pub fn header_invalid(header_name: impl Into<String>, header_value: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::HeaderInvalid {
            header_name: header_name.into(),
            header_value: header_value.into(),
        })
    }

    pub fn payload_invalid() -> Self {
        Self::new(ProtocolErrorKind::PayloadInvalid)
    }

    pub fn timeout(timeout_name: impl Into<String>, timeout_value: Option<Duration>) -> Self {
        Self::new(ProtocolErrorKind::Timeout {
            timeout_name: timeout_name.into(),
            timeout_value,
        })
    }

    pub fn client_error(source: impl Into<BoxError>) -> Self {
        Self::new(ProtocolErrorKind::ClientError).with_source(source)
    }

    pub fn configuration_invalid(
        property_name: impl Into<String>,
        property_value: impl fmt::Display,
    ) -> Self {
        Self::new(ProtocolErrorKind::ConfigurationInvalid {
            property_name: property_name.into(),
            property_value: property_value.to_string(),
        })
    }

    pub fn argument_invalid(
        property_name: impl Into<String>,
        property_value: impl fmt::Display,
    ) -> Self {
        Self::new(ProtocolErrorKind::ArgumentInvalid {
            property_name: property_name.into(),
            property_value: property_value.to_string(),
        })
    }

    pub fn state_invalid(property_name: Option<String>) -> Self {
        Self::new(ProtocolErrorKind::StateInvalid { property_name })
    }

    pub fn internal_logic_error(property_name: Option<String>) -> Self {
        Self::new(ProtocolErrorKind::InternalLogicError { property_name })
    }

    pub fn cancellation() -> Self {
        Self::new(ProtocolErrorKind::Cancellation)
    }

    pub fn unsupported_version(
        protocol_version: impl Into<String>,
        supported_major_versions: Vec<u16>,
    ) -> Self {
        Self::new(ProtocolErrorKind::UnsupportedVersion {
            protocol_version: protocol_version.into(),
            supported_major_versions,
        })
    }

    /// The supported major versions, if this is an [`UnsupportedVersion`] error.
    ///
    /// [`UnsupportedVersion`]: ProtocolErrorKind::UnsupportedVersion
    pub fn supported_major_versions(&self) -> Option<&[u16]> {
        match &self.kind {
            ProtocolErrorKind::UnsupportedVersion {
                supported_major_versions,
                ..
            } => Some(supported_major_versions),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(command_name) = &self.command_name {
            write!(f, "[{command_name}] ")?;
        }

        write!(f, "{}", self.kind)?;

        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }

        if self.is_remote {
            f.write_str(" (reported by remote)")?;
        }

        Ok(())
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderMissing { header_name } => write!(f, "header {header_name:?} missing"),
            Self::HeaderInvalid {
                header_name,
                header_value,
            } => write!(f, "header {header_name:?} has invalid value {header_value:?}"),
            Self::PayloadInvalid => f.write_str("payload invalid"),
            Self::Timeout {
                timeout_name,
                timeout_value,
            } => match timeout_value {
                Some(value) => write!(f, "{timeout_name} timed out after {value:?}"),
                None => write!(f, "{timeout_name} timed out"),
            },
            Self::ClientError => f.write_str("MQTT client error"),
            Self::ConfigurationInvalid {
                property_name,
                property_value,
            } => write!(
                f,
                "configuration {property_name:?} has invalid value {property_value:?}"
            ),
            Self::ArgumentInvalid {
                property_name,
                property_value,
            } => write!(
                f,
                "argument {property_name:?} has invalid value {property_value:?}"
            ),
            Self::StateInvalid { property_name } => match property_name {
                Some(name) => write!(f, "invalid state ({name})"),
                None => f.write_str("invalid state"),
            },
            Self::InternalLogicError { property_name } => match property_name {
                Some(name) => write!(f, "internal logic error ({name})"),
                None => f.write_str("internal logic error"),
            },
            Self::UnknownError => f.write_str("unknown error"),
            Self::ExecutionException { property_name, .. } => match property_name {
                Some(name) => write!(f, "execution error ({name})"),
                None => f.write_str("execution error"),
            },
            Self::Cancellation => f.write_str("cancelled"),
            Self::UnsupportedVersion {
                protocol_version,
                supported_major_versions,
            } => write!(
                f,
                "protocol version {protocol_version} is not supported \
                 (supported major versions: {supported_major_versions:?})"
            ),
        }
    }
}
