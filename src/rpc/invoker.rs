//! Invoking commands: one request, one response.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collections::HashMap;
use crate::error::{ProtocolError, ProtocolErrorKind};
use crate::hlc::{ApplicationHybridLogicalClock, HybridLogicalClock};
use crate::mqtt::{ClientError, PubSubClient, Publish, PublishProperties, QoS};
use crate::rpc::correlation::ResponseRouter;
use crate::rpc::payload::{DeserializationError, FormatIndicator, PayloadSerialize, SerializedPayload};
use crate::rpc::topic::TopicPattern;
use crate::rpc::{
    parse_supported_major_versions, partition_user_properties, validate_user_properties,
    ProtocolVersion, StatusCode, StatusCodeParseError, UserProperty, DEFAULT_RPC_PROTOCOL_VERSION,
    RPC_PROTOCOL_VERSION, SUPPORTED_MAJOR_VERSIONS,
};

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub command_name: String,
    /// May contain `{token}` levels, filled from `topic_token_map` or per request.
    pub request_topic_pattern: String,
    /// Where executors should send responses.
    ///
    /// Defaults to the request topic pattern between `response_topic_prefix` and
    /// `response_topic_suffix`, or under `clients/{client ID}` if neither is set.
    pub response_topic_pattern: Option<String>,
    pub response_topic_prefix: Option<String>,
    pub response_topic_suffix: Option<String>,
    /// Prepended to both topic patterns.
    pub topic_namespace: Option<String>,
    pub topic_token_map: HashMap<String, String>,
    /// Shut down the client along with the invoker.
    pub shutdown_client: bool,
}

impl Options {
    pub fn new(command_name: impl Into<String>, request_topic_pattern: impl Into<String>) -> Self {
        Options {
            command_name: command_name.into(),
            request_topic_pattern: request_topic_pattern.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct Request<T> {
    pub payload: T,
    /// Rounded up to whole seconds; must be at least one second.
    pub timeout: Duration,
    pub custom_user_data: Vec<(String, String)>,
    pub topic_tokens: HashMap<String, String>,
}

impl<T> Request<T> {
    pub fn new(payload: T, timeout: Duration) -> Self {
        Request {
            payload,
            timeout,
            custom_user_data: Vec::new(),
            topic_tokens: HashMap::default(),
        }
    }

    pub fn with_user_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_user_data.push((key.into(), value.into()));
        self
    }

    pub fn with_topic_token(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(token.into(), value.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct Response<T> {
    pub payload: T,
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
    pub custom_user_data: Vec<(String, String)>,
    /// When the executor produced the response.
    pub timestamp: Option<HybridLogicalClock>,
}

/// The message expiry interval for a command with `timeout`.
pub(crate) fn expiry_interval(timeout: Duration) -> Result<u32, ProtocolError> {
    let secs = timeout
        .as_secs()
        .saturating_add(u64::from(timeout.subsec_nanos() > 0));

    if secs == 0 {
        return Err(ProtocolError::argument_invalid("timeout", format!("{timeout:?}"))
            .with_message("timeout must be at least one second"));
    }

    u32::try_from(secs).map_err(|_| {
        ProtocolError::argument_invalid("timeout", format!("{timeout:?}"))
            .with_message("timeout in seconds must fit in a message expiry interval")
    })
}

/// State shared by single-response and streaming invokers.
pub(crate) struct CommandChannel<C> {
    pub command_name: String,
    request_topic: TopicPattern,
    response_topic: TopicPattern,
    response_filter: String,
    pub router: ResponseRouter<C>,
    hlc: Arc<ApplicationHybridLogicalClock>,
    shutdown_client: bool,
}

/// A request message before protocol properties are added.
pub(crate) struct Outgoing {
    pub topic: String,
    pub response_topic: String,
    pub correlation_id: Uuid,
    pub payload: SerializedPayload,
    pub user_properties: Vec<(String, String)>,
    pub message_expiry_interval: u32,
}

impl<C: PubSubClient> CommandChannel<C> {
    pub fn new(
        client: C,
        hlc: Arc<ApplicationHybridLogicalClock>,
        options: Options,
    ) -> Result<Self, ProtocolError> {
        if options.command_name.trim().is_empty() {
            return Err(ProtocolError::configuration_invalid(
                "command_name",
                &options.command_name,
            )
            .with_message("command name must not be empty"));
        }

        for (name, value) in [
            ("response_topic_prefix", &options.response_topic_prefix),
            ("response_topic_suffix", &options.response_topic_suffix),
            ("response_topic_pattern", &options.response_topic_pattern),
        ] {
            if let Some(value) = value.as_deref().filter(|v| v.trim().is_empty()) {
                return Err(ProtocolError::configuration_invalid(name, value)
                    .with_message("must not be empty if set"));
            }
        }

        let namespace = options.topic_namespace.as_deref();

        let request_topic = TopicPattern::new(
            "request_topic_pattern",
            &options.request_topic_pattern,
            namespace,
            &options.topic_token_map,
        )?;

        let response_topic_pattern = match options.response_topic_pattern {
            Some(pattern) => pattern,
            None => match (options.response_topic_prefix, options.response_topic_suffix) {
                (None, None) => format!(
                    "clients/{}/{}",
                    client.client_id(),
                    options.request_topic_pattern
                ),
                (prefix, suffix) => prefix
                    .into_iter()
                    .chain(Some(options.request_topic_pattern))
                    .chain(suffix)
                    .collect::<Vec<_>>()
                    .join("/"),
            },
        };

        let response_topic = TopicPattern::new(
            "response_topic_pattern",
            &response_topic_pattern,
            namespace,
            &options.topic_token_map,
        )?;

        let response_filter = response_topic.as_subscribe_topic();

        Ok(CommandChannel {
            command_name: options.command_name,
            request_topic,
            response_topic,
            response_filter,
            router: ResponseRouter::new(client),
            hlc,
            shutdown_client: options.shutdown_client,
        })
    }

    /// The request and response topics for a request with `tokens`.
    pub fn topics(&self, tokens: &HashMap<String, String>) -> Result<(String, String), ProtocolError> {
        Ok((
            self.request_topic.as_publish_topic(tokens)?,
            self.response_topic.as_publish_topic(tokens)?,
        ))
    }

    pub async fn ensure_subscribed(&self) -> Result<(), ProtocolError> {
        self.router.ensure_subscribed(&self.response_filter).await
    }

    pub async fn send(&self, outgoing: Outgoing) -> Result<(), ProtocolError> {
        let Outgoing {
            topic,
            response_topic,
            correlation_id,
            payload,
            mut user_properties,
            message_expiry_interval,
        } = outgoing;

        let client = self.router.client();

        user_properties.extend([
            (UserProperty::SourceId.to_string(), client.client_id().to_owned()),
            (UserProperty::Timestamp.to_string(), self.hlc.update_now()?),
            (
                UserProperty::ProtocolVersion.to_string(),
                RPC_PROTOCOL_VERSION.to_string(),
            ),
        ]);

        let publish = Publish {
            topic,
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: payload.payload,
            properties: PublishProperties {
                payload_format_indicator: Some(payload.format_indicator as u8),
                message_expiry_interval: Some(message_expiry_interval),
                response_topic: Some(response_topic),
                correlation_data: Some(Bytes::copy_from_slice(correlation_id.as_bytes())),
                user_properties,
                content_type: (!payload.content_type.is_empty()).then_some(payload.content_type),
                ..Default::default()
            },
        };

        let reason_code = client
            .publish(publish)
            .await
            .map_err(ProtocolError::client_error)?;

        if !reason_code.is_success() {
            return Err(ProtocolError::client_error(ClientError::Rejected(reason_code.0))
                .with_message("request publish rejected"));
        }

        Ok(())
    }

    /// Validate a response and decode its payload.
    ///
    /// Also returns the protocol's user properties for callers that need more of them.
    pub fn parse_response<T: PayloadSerialize>(
        &self,
        publish: Publish,
    ) -> Result<(Response<T>, HashMap<UserProperty, String>), ProtocolError> {
        let Publish {
            payload,
            properties,
            ..
        } = publish;

        let (protocol, custom_user_data) = partition_user_properties(properties.user_properties);

        let version = match protocol.get(&UserProperty::ProtocolVersion) {
            Some(version) => ProtocolVersion::parse(version).ok_or_else(|| {
                ProtocolError::unsupported_version(version.clone(), SUPPORTED_MAJOR_VERSIONS.to_vec())
                    .with_message("response protocol version could not be parsed")
            })?,
            None => DEFAULT_RPC_PROTOCOL_VERSION,
        };

        if !version.is_supported(SUPPORTED_MAJOR_VERSIONS) {
            return Err(ProtocolError::unsupported_version(
                version.to_string(),
                SUPPORTED_MAJOR_VERSIONS.to_vec(),
            )
            .with_message("response protocol version is not supported"));
        }

        let Some(status) = protocol.get(&UserProperty::Status) else {
            return Err(ProtocolError::header_missing(UserProperty::Status.as_str())
                .with_message("response has no status"));
        };

        let status = match status.parse::<StatusCode>() {
            Ok(status) => status,
            Err(StatusCodeParseError::InvalidStatusCode(value)) => {
                return Err(ProtocolError::header_invalid(UserProperty::Status.as_str(), value))
            }
            Err(e @ StatusCodeParseError::UnknownStatusCode(_)) => {
                return Err(ProtocolError::new(ProtocolErrorKind::UnknownError)
                    .with_message(e.to_string())
                    .remote())
            }
        };

        if !status.is_success() {
            return Err(status_error(status, &protocol));
        }

        let timestamp = match protocol.get(&UserProperty::Timestamp) {
            Some(timestamp) => {
                let timestamp: HybridLogicalClock = timestamp.parse()?;
                self.hlc.update(&timestamp)?;
                Some(timestamp)
            }
            None => None,
        };

        if status == StatusCode::NoContent && !payload.is_empty() {
            return Err(ProtocolError::payload_invalid()
                .with_message("response with status 204 has a payload"));
        }

        let format_indicator = FormatIndicator::try_from(properties.payload_format_indicator)
            .map_err(|value| {
                ProtocolError::header_invalid("payload_format_indicator", value.to_string())
            })?;

        let payload = T::deserialize(&payload, properties.content_type.as_deref(), format_indicator)
            .map_err(|e| match e {
                DeserializationError::UnsupportedContentType(message) => ProtocolError::header_invalid(
                    "content_type",
                    properties.content_type.clone().unwrap_or_default(),
                )
                .with_message(message),
                DeserializationError::InvalidPayload(e) => ProtocolError::payload_invalid()
                    .with_message("response payload could not be deserialized")
                    .with_source(e),
            })?;

        Ok((
            Response {
                payload,
                content_type: properties.content_type,
                format_indicator,
                custom_user_data,
                timestamp,
            },
            protocol,
        ))
    }

    pub async fn shutdown(&self) {
        self.router.shutdown().await;

        if self.shutdown_client {
            self.router.client().shutdown().await;
        }
    }
}

/// The error reported by a response with a failure status.
fn status_error(status: StatusCode, protocol: &HashMap<UserProperty, String>) -> ProtocolError {
    let get = |property: UserProperty| protocol.get(&property).cloned();

    let property_name = get(UserProperty::InvalidPropertyName);
    let property_value = get(UserProperty::InvalidPropertyValue);
    let is_application_error = get(UserProperty::IsApplicationError)
        .map_or(false, |value| value.eq_ignore_ascii_case("true"));

    let error = match status {
        StatusCode::BadRequest => match (property_name, property_value) {
            (Some(name), Some(value)) => ProtocolError::header_invalid(name, value),
            (Some(name), None) => ProtocolError::header_missing(name),
            _ => ProtocolError::payload_invalid(),
        },
        StatusCode::RequestTimeout => ProtocolError::timeout(
            property_name.unwrap_or_default(),
            property_value
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs),
        ),
        StatusCode::UnsupportedMediaType => ProtocolError::header_invalid(
            property_name.unwrap_or_else(|| "content_type".into()),
            property_value.unwrap_or_default(),
        ),
        StatusCode::InternalServerError if is_application_error => {
            ProtocolError::new(ProtocolErrorKind::ExecutionException {
                property_name,
                property_value,
            })
        }
        StatusCode::InternalServerError if property_name.is_some() => {
            ProtocolError::internal_logic_error(property_name)
        }
        StatusCode::ServiceUnavailable => ProtocolError::state_invalid(property_name),
        StatusCode::VersionNotSupported => ProtocolError::unsupported_version(
            get(UserProperty::RequestProtocolVersion).unwrap_or_default(),
            get(UserProperty::SupportedMajorVersions)
                .map(|versions| parse_supported_major_versions(&versions))
                .unwrap_or_default(),
        ),
        StatusCode::InternalServerError | StatusCode::Ok | StatusCode::NoContent => {
            ProtocolError::new(ProtocolErrorKind::UnknownError)
        }
    };

    error
        .with_message(
            get(UserProperty::StatusMessage)
                .unwrap_or_else(|| format!("executor responded with status {status}")),
        )
        .remote()
}

/// Sends requests for one command and waits for their responses.
pub struct Invoker<TReq, TResp, C> {
    channel: Arc<CommandChannel<C>>,
    _payloads: PhantomData<fn(TReq) -> TResp>,
}

impl<TReq, TResp, C> Clone for Invoker<TReq, TResp, C> {
    fn clone(&self) -> Self {
        Invoker {
            channel: self.channel.clone(),
            _payloads: PhantomData,
        }
    }
}

impl<TReq, TResp, C> Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: PubSubClient,
{
    pub fn new(
        client: C,
        hlc: Arc<ApplicationHybridLogicalClock>,
        options: Options,
    ) -> Result<Self, ProtocolError> {
        Ok(Invoker {
            channel: Arc::new(CommandChannel::new(client, hlc, options)?),
            _payloads: PhantomData,
        })
    }

    pub fn command_name(&self) -> &str {
        &self.channel.command_name
    }

    pub async fn invoke(&self, request: Request<TReq>) -> Result<Response<TResp>, ProtocolError> {
        self.invoke_with_cancellation(request, &CancellationToken::new())
            .await
    }

    /// Invoke the command, giving up if `cancel` is cancelled first.
    #[tracing::instrument(name = "Invoker::invoke", skip_all, fields(command_name = %self.channel.command_name))]
    pub async fn invoke_with_cancellation(
        &self,
        request: Request<TReq>,
        cancel: &CancellationToken,
    ) -> Result<Response<TResp>, ProtocolError> {
        self.invoke_inner(request, cancel)
            .await
            .map_err(|e| e.with_command_name(&self.channel.command_name))
    }

    async fn invoke_inner(
        &self,
        request: Request<TReq>,
        cancel: &CancellationToken,
    ) -> Result<Response<TResp>, ProtocolError> {
        let Request {
            payload,
            timeout,
            custom_user_data,
            topic_tokens,
        } = request;

        let message_expiry_interval = expiry_interval(timeout)?;
        validate_user_properties(&custom_user_data)?;

        let (topic, response_topic) = self.channel.topics(&topic_tokens)?;

        let payload = payload.serialize().map_err(|e| {
            ProtocolError::payload_invalid()
                .with_message("request payload could not be serialized")
                .with_source(e)
        })?;

        let exchange = self.exchange(
            Outgoing {
                topic,
                response_topic,
                correlation_id: Uuid::new_v4(),
                payload,
                user_properties: custom_user_data,
                message_expiry_interval,
            },
            cancel,
        );

        let rounded = Duration::from_secs(message_expiry_interval.into());

        match tokio::time::timeout(rounded, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("command timed out after {timeout:?}");
                Err(ProtocolError::timeout("command", Some(timeout)))
            }
        }
    }

    async fn exchange(
        &self,
        outgoing: Outgoing,
        cancel: &CancellationToken,
    ) -> Result<Response<TResp>, ProtocolError> {
        self.channel.ensure_subscribed().await?;

        let pending = self
            .channel
            .router
            .register(outgoing.correlation_id, outgoing.response_topic.clone())?;

        self.channel.send(outgoing).await?;

        tracing::debug!(correlation_id = pending.correlation_id(), "request sent");

        let response = pending.recv(cancel).await?;
        let (response, _) = self.channel.parse_response(response)?;

        Ok(response)
    }

    /// Unsubscribe from responses. Invocations in progress fail with a cancellation error.
    pub async fn shutdown(&self) {
        self.channel.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::collections::HashMap;
    use crate::error::ProtocolErrorKind;
    use crate::hlc::ApplicationHybridLogicalClock;
    use crate::mqtt::loopback::LoopbackBroker;
    use crate::mqtt::{PubSubClient, Publish, QoS};
    use crate::rpc::UserProperty;

    use super::{expiry_interval, CommandChannel, Invoker, Options, Request};

    fn channel(options: Options) -> CommandChannel<crate::mqtt::loopback::LoopbackClient> {
        CommandChannel::new(
            LoopbackBroker::new().connect(Some("invoker")),
            Arc::default(),
            options,
        )
        .unwrap()
    }

    fn response(properties: &[(UserProperty, &str)], payload: &'static str) -> Publish {
        let mut publish = Publish::new("clients/invoker/rpc/increment", payload);
        publish.properties.user_properties = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        publish
    }

    fn parse_err(properties: &[(UserProperty, &str)], payload: &'static str) -> crate::error::ProtocolError {
        channel(Options::new("increment", "rpc/increment"))
            .parse_response::<Bytes>(response(properties, payload))
            .unwrap_err()
    }

    #[test]
    fn timeouts_round_up() {
        assert_eq!(expiry_interval(Duration::from_millis(1)).unwrap(), 1);
        assert_eq!(expiry_interval(Duration::from_millis(1500)).unwrap(), 2);
        assert_eq!(expiry_interval(Duration::from_secs(3)).unwrap(), 3);

        for invalid in [Duration::ZERO, Duration::from_secs(u64::from(u32::MAX) + 1)] {
            assert!(matches!(
                expiry_interval(invalid).unwrap_err().kind,
                ProtocolErrorKind::ArgumentInvalid { .. }
            ));
        }
    }

    #[tokio::test]
    async fn response_topics() {
        let topics = |options: Options| {
            channel(options)
                .topics(&HashMap::default())
                .unwrap()
                .1
        };

        assert_eq!(
            topics(Options::new("increment", "rpc/increment")),
            "clients/invoker/rpc/increment"
        );
        assert_eq!(
            topics(Options {
                response_topic_prefix: Some("replies".into()),
                response_topic_suffix: Some("out".into()),
                topic_namespace: Some("ns".into()),
                ..Options::new("increment", "rpc/increment")
            }),
            "ns/replies/rpc/increment/out"
        );
        assert_eq!(
            topics(Options {
                response_topic_pattern: Some("fixed/reply".into()),
                ..Options::new("increment", "rpc/increment")
            }),
            "fixed/reply"
        );

        let err = CommandChannel::new(
            LoopbackBroker::new().connect(None),
            Arc::default(),
            Options::new("", "rpc/increment"),
        )
        .err()
        .unwrap();
        assert!(matches!(err.kind, ProtocolErrorKind::ConfigurationInvalid { .. }));
    }

    #[tokio::test]
    async fn response_status_mapping() {
        use UserProperty::*;

        assert_eq!(
            parse_err(&[], "").kind,
            ProtocolErrorKind::HeaderMissing {
                header_name: "__stat".into()
            }
        );
        assert!(matches!(
            parse_err(&[(Status, "abc")], "").kind,
            ProtocolErrorKind::HeaderInvalid { .. }
        ));

        let err = parse_err(&[(Status, "302")], "");
        assert_eq!(err.kind, ProtocolErrorKind::UnknownError);
        assert!(err.is_remote);

        assert_eq!(
            parse_err(&[(Status, "400"), (InvalidPropertyName, "color"), (InvalidPropertyValue, "mauve")], "").kind,
            ProtocolErrorKind::HeaderInvalid {
                header_name: "color".into(),
                header_value: "mauve".into()
            }
        );
        assert_eq!(
            parse_err(&[(Status, "400"), (InvalidPropertyName, "color")], "").kind,
            ProtocolErrorKind::HeaderMissing {
                header_name: "color".into()
            }
        );
        assert_eq!(
            parse_err(&[(Status, "400")], "").kind,
            ProtocolErrorKind::PayloadInvalid
        );
        assert_eq!(
            parse_err(&[(Status, "408"), (InvalidPropertyName, "execution"), (InvalidPropertyValue, "5")], "").kind,
            ProtocolErrorKind::Timeout {
                timeout_name: "execution".into(),
                timeout_value: Some(Duration::from_secs(5))
            }
        );
        assert_eq!(
            parse_err(&[(Status, "500"), (IsApplicationError, "true"), (StatusMessage, "boom")], "").kind,
            ProtocolErrorKind::ExecutionException {
                property_name: None,
                property_value: None
            }
        );
        assert_eq!(
            parse_err(&[(Status, "500"), (InvalidPropertyName, "Counter")], "").kind,
            ProtocolErrorKind::InternalLogicError {
                property_name: Some("Counter".into())
            }
        );
        assert_eq!(
            parse_err(&[(Status, "500")], "").kind,
            ProtocolErrorKind::UnknownError
        );
        assert_eq!(
            parse_err(&[(Status, "503"), (InvalidPropertyName, "Cache")], "").kind,
            ProtocolErrorKind::StateInvalid {
                property_name: Some("Cache".into())
            }
        );

        let err = parse_err(
            &[(Status, "505"), (RequestProtocolVersion, "9.0"), (SupportedMajorVersions, "1 2")],
            "",
        );
        assert_eq!(err.supported_major_versions(), Some(&[1, 2][..]));
        assert!(err.is_remote);

        assert_eq!(
            parse_err(&[(Status, "204")], "unexpected").kind,
            ProtocolErrorKind::PayloadInvalid
        );
    }

    #[tokio::test]
    async fn response_version_checked_first() {
        use UserProperty::*;

        let err = parse_err(&[(ProtocolVersion, "2.0"), (Status, "200")], "");
        assert_eq!(err.supported_major_versions(), Some(&[1][..]));
        assert!(!err.is_remote);

        let err = parse_err(&[(ProtocolVersion, "one"), (Status, "200")], "");
        assert!(matches!(err.kind, ProtocolErrorKind::UnsupportedVersion { .. }));
    }

    #[tokio::test]
    async fn successful_response() {
        use UserProperty::*;

        let hlc = Arc::new(ApplicationHybridLogicalClock::default());
        let remote = ApplicationHybridLogicalClock::default().update_now().unwrap();

        let channel = CommandChannel::new(
            LoopbackBroker::new().connect(Some("invoker")),
            hlc,
            Options::new("increment", "rpc/increment"),
        )
        .unwrap();

        let mut publish = response(&[(Status, "200"), (Timestamp, &remote)], "3");
        publish
            .properties
            .user_properties
            .push(("color".into(), "blue".into()));

        let (response, protocol) = channel.parse_response::<Bytes>(publish).unwrap();
        assert_eq!(response.payload, "3");
        assert_eq!(response.custom_user_data, [("color".to_string(), "blue".to_string())]);
        assert_eq!(response.timestamp.unwrap().to_string(), remote);
        assert_eq!(protocol.get(&Status).map(String::as_str), Some("200"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_executor() {
        let broker = LoopbackBroker::new();
        let invoker: Invoker<Bytes, Bytes, _> = Invoker::new(
            broker.connect(Some("invoker")),
            Arc::default(),
            Options::new("increment", "rpc/increment"),
        )
        .unwrap();

        // Something is listening, but never answers.
        let silent = broker.connect(Some("executor"));
        silent.subscribe("rpc/increment", QoS::AtLeastOnce).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = invoker
            .invoke(Request::new(Bytes::from_static(b"1"), Duration::from_millis(800)))
            .await
            .unwrap_err();

        assert_eq!(
            err.kind,
            ProtocolErrorKind::Timeout {
                timeout_name: "command".into(),
                timeout_value: Some(Duration::from_millis(800))
            }
        );
        assert_eq!(err.command_name.as_deref(), Some("increment"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));

        invoker.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_reserved_user_data() {
        let invoker: Invoker<Bytes, Bytes, _> = Invoker::new(
            LoopbackBroker::new().connect(Some("invoker")),
            Arc::default(),
            Options::new("increment", "rpc/{executorId}/increment"),
        )
        .unwrap();

        let err = invoker
            .invoke(
                Request::new(Bytes::new(), Duration::from_secs(1))
                    .with_user_data("__stat", "200")
                    .with_topic_token("executorId", "e1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ProtocolErrorKind::ArgumentInvalid { .. }));

        let err = invoker
            .invoke(Request::new(Bytes::new(), Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ProtocolErrorKind::ArgumentInvalid { .. }));
    }
}
