//! Executing commands: the receiving end of [`Invoker`][crate::rpc::invoker::Invoker].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CommandRequest, CommandResponseCache, Lookup, StoreOptions};
use crate::collections::HashMap;
use crate::error::{ProtocolError, ProtocolErrorKind};
use crate::hlc::{ApplicationHybridLogicalClock, HybridLogicalClock};
use crate::mqtt::{ClientError, Delivery, PubSubClient, Publish, PublishProperties, QoS, Receiver};
use crate::rpc::payload::{DeserializationError, FormatIndicator, PayloadSerialize};
use crate::rpc::topic::TopicPattern;
use crate::rpc::{
    format_supported_major_versions, partition_user_properties, validate_user_properties,
    ProtocolVersion, StatusCode, UserProperty, DEFAULT_RPC_PROTOCOL_VERSION, RPC_PROTOCOL_VERSION,
    SUPPORTED_MAJOR_VERSIONS,
};

/// Used for the response to a request that didn't say when it expires.
const DEFAULT_MESSAGE_EXPIRY_INTERVAL_SECS: u32 = 10;

/// Correlation data must be a UUID.
const CORRELATION_DATA_LEN: usize = 16;

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub command_name: String,
    pub request_topic_pattern: String,
    pub topic_namespace: Option<String>,
    pub topic_token_map: HashMap<String, String>,
    /// Executing the command twice has the same effect as executing it once.
    pub is_idempotent: bool,
    /// How long a response may be reused for an identical request. Idempotent commands only.
    pub cacheable_duration: Duration,
    /// Reuse responses for identical requests from any invoker, not only the one that sent
    /// the original.
    pub reuse_across_invokers: bool,
    /// Shut down the client along with the executor.
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
pub struct ExecutorRequest<T> {
    pub payload: T,
    pub topic: String,
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
    pub custom_user_data: Vec<(String, String)>,
    /// Client ID of the invoker, if it said.
    pub invoker_id: Option<String>,
    pub timestamp: Option<HybridLogicalClock>,
}

#[derive(Clone, Debug)]
pub struct ExecutorResponse<T> {
    pub payload: T,
    pub custom_user_data: Vec<(String, String)>,
}

impl<T> ExecutorResponse<T> {
    pub fn new(payload: T) -> Self {
        ExecutorResponse {
            payload,
            custom_user_data: Vec::new(),
        }
    }
}

/// A failure reported by a command handler, relayed to the invoker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ApplicationError {
    pub message: String,
    pub property_name: Option<String>,
    pub property_value: Option<String>,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        ApplicationError {
            message: message.into(),
            property_name: None,
            property_value: None,
        }
    }
}

pub trait CommandHandler<TReq, TResp>: Send + Sync + 'static {
    fn handle(
        &self,
        request: ExecutorRequest<TReq>,
    ) -> impl Future<Output = Result<ExecutorResponse<TResp>, ApplicationError>> + Send;
}

impl<TReq, TResp, F, Fut> CommandHandler<TReq, TResp> for F
where
    F: Fn(ExecutorRequest<TReq>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutorResponse<TResp>, ApplicationError>> + Send,
{
    fn handle(
        &self,
        request: ExecutorRequest<TReq>,
    ) -> impl Future<Output = Result<ExecutorResponse<TResp>, ApplicationError>> + Send {
        self(request)
    }
}

/// Receives requests for one command, runs the handler and publishes responses.
///
/// Duplicate requests are answered from the [`CommandResponseCache`] rather than executed again.
pub struct Executor<TReq, TResp, C, H> {
    inner: Arc<Inner<TReq, TResp, C, H>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner<TReq, TResp, C, H> {
    client: C,
    cache: Arc<CommandResponseCache>,
    hlc: Arc<ApplicationHybridLogicalClock>,
    handler: H,
    command_name: String,
    request_filter: String,
    is_idempotent: bool,
    cacheable_duration: Duration,
    reuse_across_invokers: bool,
    shutdown_client: bool,
    token: CancellationToken,
    _payloads: PhantomData<fn(TReq) -> TResp>,
}

/// Everything needed to build a response, successful or not.
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    message: Option<String>,
    is_application_error: bool,
    property_name: Option<String>,
    property_value: Option<String>,
    supported_major_versions: Option<Vec<u16>>,
    request_protocol_version: Option<String>,
    payload: Bytes,
    content_type: Option<String>,
    format_indicator: FormatIndicator,
    custom_user_data: Vec<(String, String)>,
}

impl Reply {
    fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Reply {
            status,
            message: Some(message.into()),
            is_application_error: false,
            property_name: None,
            property_value: None,
            supported_major_versions: None,
            request_protocol_version: None,
            payload: Bytes::new(),
            content_type: None,
            format_indicator: FormatIndicator::UnspecifiedBytes,
            custom_user_data: Vec::new(),
        }
    }

    fn property(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.property_name = Some(name.into());
        self.property_value = value;
        self
    }

    fn unsupported_version(request_version: &str) -> Self {
        Reply {
            supported_major_versions: Some(SUPPORTED_MAJOR_VERSIONS.to_vec()),
            request_protocol_version: Some(request_version.to_owned()),
            ..Reply::status(
                StatusCode::VersionNotSupported,
                format!(
                    "only major protocol versions {SUPPORTED_MAJOR_VERSIONS:?} are supported, \
                     but the request has version {request_version}"
                ),
            )
        }
    }

    /// Report an error found while processing a request.
    fn from_error(e: &ProtocolError) -> Self {
        let message = e.to_string();

        match &e.kind {
            ProtocolErrorKind::HeaderMissing { header_name } => {
                Reply::status(StatusCode::BadRequest, message).property(header_name, None)
            }
            ProtocolErrorKind::HeaderInvalid {
                header_name,
                header_value,
            } => Reply::status(StatusCode::BadRequest, message)
                .property(header_name, Some(header_value.clone())),
            ProtocolErrorKind::PayloadInvalid => Reply::status(StatusCode::BadRequest, message),
            ProtocolErrorKind::Timeout {
                timeout_name,
                timeout_value,
            } => Reply::status(StatusCode::RequestTimeout, message).property(
                timeout_name,
                timeout_value.map(|value| value.as_secs().to_string()),
            ),
            ProtocolErrorKind::StateInvalid { property_name } => Reply {
                property_name: property_name.clone(),
                ..Reply::status(StatusCode::ServiceUnavailable, message)
            },
            ProtocolErrorKind::InternalLogicError { property_name } => Reply {
                property_name: property_name.clone(),
                ..Reply::status(StatusCode::InternalServerError, message)
            },
            ProtocolErrorKind::UnsupportedVersion {
                protocol_version, ..
            } => Reply::unsupported_version(protocol_version),
            _ => Reply::status(StatusCode::InternalServerError, message),
        }
    }
}

impl<TReq, TResp, C, H> Executor<TReq, TResp, C, H>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: PubSubClient,
    H: CommandHandler<TReq, TResp>,
{
    pub fn new(
        client: C,
        cache: Arc<CommandResponseCache>,
        hlc: Arc<ApplicationHybridLogicalClock>,
        options: Options,
        handler: H,
    ) -> Result<Self, ProtocolError> {
        if options.command_name.trim().is_empty() {
            return Err(ProtocolError::configuration_invalid(
                "command_name",
                &options.command_name,
            )
            .with_message("command name must not be empty"));
        }

        if !options.is_idempotent && !options.cacheable_duration.is_zero() {
            return Err(ProtocolError::configuration_invalid(
                "cacheable_duration",
                format!("{:?}", options.cacheable_duration),
            )
            .with_message("only idempotent commands may be cached for reuse"));
        }

        let request_topic = TopicPattern::new(
            "request_topic_pattern",
            &options.request_topic_pattern,
            options.topic_namespace.as_deref(),
            &options.topic_token_map,
        )?;

        Ok(Executor {
            inner: Arc::new(Inner {
                client,
                cache,
                hlc,
                handler,
                command_name: options.command_name,
                request_filter: request_topic.as_subscribe_topic(),
                is_idempotent: options.is_idempotent,
                cacheable_duration: options.cacheable_duration,
                reuse_across_invokers: options.reuse_across_invokers,
                shutdown_client: options.shutdown_client,
                token: CancellationToken::new(),
                _payloads: PhantomData,
            }),
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn command_name(&self) -> &str {
        &self.inner.command_name
    }

    /// Subscribe to requests and start handling them. Does nothing if already started.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let mut task = self.task.lock().await;

        if task.is_some() {
            return Ok(());
        }

        if self.inner.token.is_cancelled() {
            return Err(ProtocolError::cancellation()
                .with_message("executor has been shut down")
                .with_command_name(&self.inner.command_name));
        }

        self.inner.cache.start().await;

        let client_error = |e: ClientError| {
            ProtocolError::client_error(e).with_command_name(&self.inner.command_name)
        };

        let rx = self
            .inner
            .client
            .receiver(&self.inner.request_filter)
            .map_err(client_error)?;

        let reason_code = self
            .inner
            .client
            .subscribe(&self.inner.request_filter, QoS::AtLeastOnce)
            .await
            .map_err(client_error)?;

        if !reason_code.is_success() {
            return Err(client_error(ClientError::Rejected(reason_code.0)));
        }

        tracing::info!(
            command_name = %self.inner.command_name,
            filter = %self.inner.request_filter,
            "executor started"
        );

        *task = Some(tokio::spawn(run(self.inner.clone(), rx)));

        Ok(())
    }

    /// Stop handling requests and unsubscribe.
    ///
    /// Requests being handled are abandoned without an acknowledgement, and their pending cache
    /// entries are released so a redelivery is executed again.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!("executor task failed: {e}");
            }

            match self.inner.client.unsubscribe(&self.inner.request_filter).await {
                Ok(reason_code) if !reason_code.is_success() => {
                    tracing::warn!(?reason_code, "unsubscribe rejected");
                }
                Ok(_) => (),
                Err(e) => tracing::warn!("error unsubscribing: {e}"),
            }
        }

        if self.inner.shutdown_client {
            self.inner.client.shutdown().await;
        }
    }
}

impl<TReq, TResp, C, H> Drop for Executor<TReq, TResp, C, H> {
    fn drop(&mut self) {
        self.inner.token.cancel();
    }
}

#[tracing::instrument(name = "Executor::run", skip_all, fields(command_name = %inner.command_name))]
async fn run<TReq, TResp, C, H>(inner: Arc<Inner<TReq, TResp, C, H>>, mut rx: Receiver)
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: PubSubClient,
    H: CommandHandler<TReq, TResp>,
{
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            Some(res) = tasks.join_next() => {
                if let Err(e) = res {
                    tracing::error!("request task failed: {e}");
                }
            }
            delivery = rx.recv() => {
                let Some(delivery) = delivery else {
                    tracing::debug!("transport closed");
                    break;
                };

                tasks.spawn(inner.clone().handle(delivery, Instant::now()));
            }
        }
    }

    tasks.shutdown().await;

    tracing::debug!("executor closed; exiting.");
}

impl<TReq, TResp, C, H> Inner<TReq, TResp, C, H>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: PubSubClient,
    H: CommandHandler<TReq, TResp>,
{
    async fn handle(self: Arc<Self>, delivery: Delivery, received_at: Instant) {
        let Delivery { publish, ack } = delivery;

        let Some(response_topic) = publish.properties.response_topic.clone() else {
            tracing::warn!(topic = publish.topic, "request without response topic; dropping");
            ack.ack();
            return;
        };

        let expiry_interval = publish.properties.message_expiry_interval;
        let expires_at = received_at
            + Duration::from_secs(
                expiry_interval
                    .unwrap_or(DEFAULT_MESSAGE_EXPIRY_INTERVAL_SECS)
                    .into(),
            );

        let correlation_data = publish.properties.correlation_data.clone();

        let rejection = match &correlation_data {
            None => Some(
                Reply::status(StatusCode::BadRequest, "correlation data missing")
                    .property("Correlation Data", None),
            ),
            Some(data) if data.len() != CORRELATION_DATA_LEN => Some(
                Reply::status(
                    StatusCode::BadRequest,
                    "correlation data bytes do not conform to a GUID",
                )
                .property(
                    "Correlation Data",
                    String::from_utf8(data.to_vec()).ok(),
                ),
            ),
            Some(_) if expiry_interval.is_none() => Some(
                Reply::status(StatusCode::BadRequest, "message expiry interval missing")
                    .property("Message Expiry", None),
            ),
            Some(_) => None,
        };

        // Not worth caching; the invoker can't have sent a usable duplicate.
        if let Some(reply) = rejection {
            let response = self.response(reply, &response_topic, correlation_data, expires_at);
            self.respond(response, expires_at).await;
            ack.ack();
            return;
        }

        let cache_request = CommandRequest {
            command_name: self.command_name.clone(),
            invoker_id: publish
                .user_property(UserProperty::SourceId.as_str())
                .unwrap_or_default()
                .to_owned(),
            topic: response_topic.clone(),
            correlation_data: correlation_data.clone().unwrap_or_default(),
            payload: publish.payload.clone(),
        };

        let is_cacheable = self.is_idempotent && !self.cacheable_duration.is_zero();

        // Dropped if this task is aborted, so a redelivery isn't stuck behind it.
        let reservation = loop {
            let lookup = self
                .cache
                .reserve(cache_request.clone(), is_cacheable, self.reuse_across_invokers)
                .await;

            let cached = match lookup {
                Lookup::Miss(reservation) => break reservation,
                Lookup::Hit(cached) => cached,
            };

            tracing::debug!(topic = publish.topic, "answering duplicate request from cache");

            match tokio::time::timeout_at(expires_at, cached.wait()).await {
                Ok(Ok(mut response)) => {
                    // Possibly a response to an equivalent request from someone else.
                    response.topic = response_topic;
                    response.properties.correlation_data = correlation_data;
                    self.respond(response, expires_at).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!("cached response unavailable: {e}; looking again");
                    continue;
                }
                Err(_) => tracing::debug!("request expired awaiting cached response"),
            }

            ack.ack();
            return;
        };

        let started = Instant::now();
        let reply = self.execute(publish, expires_at).await;
        let execution_duration = started.elapsed();

        let response = self.response(reply, &response_topic, correlation_data, expires_at);

        let stored = reservation
            .store(
                response.clone(),
                StoreOptions {
                    is_idempotent: self.is_idempotent,
                    command_expiration_time: expires_at,
                    execution_duration,
                    cacheable_duration: self.cacheable_duration,
                },
            )
            .await;

        if let Err(e) = stored {
            tracing::error!("failed to cache response: {e}");
        }

        self.respond(response, expires_at).await;
        ack.ack();
    }

    /// Validate and run one request.
    async fn execute(&self, publish: Publish, expires_at: Instant) -> Reply {
        let Publish {
            topic,
            payload,
            properties,
            ..
        } = publish;

        let (protocol, custom_user_data) = partition_user_properties(properties.user_properties);

        if let Some(version) = protocol.get(&UserProperty::ProtocolVersion) {
            match ProtocolVersion::parse(version) {
                Some(version) if version.is_supported(SUPPORTED_MAJOR_VERSIONS) => (),
                _ => return Reply::unsupported_version(version),
            }
        } else if !DEFAULT_RPC_PROTOCOL_VERSION.is_supported(SUPPORTED_MAJOR_VERSIONS) {
            return Reply::unsupported_version(&DEFAULT_RPC_PROTOCOL_VERSION.to_string());
        }

        let timestamp = match protocol.get(&UserProperty::Timestamp) {
            Some(timestamp) => {
                let parsed = timestamp
                    .parse::<HybridLogicalClock>()
                    .map_err(ProtocolError::from)
                    .and_then(|parsed| {
                        self.hlc.update(&parsed)?;
                        Ok(parsed)
                    });

                match parsed {
                    Ok(parsed) => Some(parsed),
                    Err(e) => return Reply::from_error(&e),
                }
            }
            None => None,
        };

        let Ok(format_indicator) = FormatIndicator::try_from(properties.payload_format_indicator)
        else {
            return Reply::status(StatusCode::BadRequest, "invalid payload format indicator").property(
                "Payload Format Indicator",
                properties.payload_format_indicator.map(|v| v.to_string()),
            );
        };

        let request_payload =
            match TReq::deserialize(&payload, properties.content_type.as_deref(), format_indicator) {
                Ok(request_payload) => request_payload,
                Err(DeserializationError::UnsupportedContentType(message)) => {
                    return Reply::status(StatusCode::UnsupportedMediaType, message)
                        .property("Content Type", properties.content_type.clone())
                }
                Err(DeserializationError::InvalidPayload(e)) => {
                    return Reply::status(
                        StatusCode::BadRequest,
                        format!("request payload could not be deserialized: {e}"),
                    )
                }
            };

        let request = ExecutorRequest {
            payload: request_payload,
            topic,
            content_type: properties.content_type,
            format_indicator,
            custom_user_data,
            invoker_id: protocol.get(&UserProperty::SourceId).cloned(),
            timestamp,
        };

        let result = tokio::time::timeout_at(expires_at, self.handler.handle(request)).await;

        match result {
            Ok(Ok(response)) => {
                if let Err(e) = validate_user_properties(&response.custom_user_data) {
                    return Reply::from_error(&ProtocolError::internal_logic_error(Some(
                        "custom_user_data".into(),
                    ))
                    .with_source(e));
                }

                match response.payload.serialize() {
                    Ok(serialized) => Reply {
                        status: if serialized.payload.is_empty() {
                            StatusCode::NoContent
                        } else {
                            StatusCode::Ok
                        },
                        message: None,
                        content_type: (!serialized.content_type.is_empty())
                            .then_some(serialized.content_type),
                        format_indicator: serialized.format_indicator,
                        payload: serialized.payload,
                        custom_user_data: response.custom_user_data,
                        ..Reply::status(StatusCode::Ok, "")
                    },
                    Err(e) => Reply::status(
                        StatusCode::InternalServerError,
                        format!("response payload could not be serialized: {e}"),
                    ),
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(command_name = %self.command_name, "handler failed: {e}");

                Reply {
                    is_application_error: true,
                    property_name: e.property_name,
                    property_value: e.property_value,
                    ..Reply::status(StatusCode::InternalServerError, e.message)
                }
            }
            Err(_) => Reply::from_error(&ProtocolError::timeout(
                "ExecutionTimeout",
                Some(expires_at.saturating_duration_since(Instant::now())),
            )),
        }
    }

    fn response(
        &self,
        reply: Reply,
        response_topic: &str,
        correlation_data: Option<Bytes>,
        expires_at: Instant,
    ) -> Publish {
        let mut user_properties = reply.custom_user_data;

        let mut protocol = vec![
            (UserProperty::Status, reply.status.to_string()),
            (UserProperty::ProtocolVersion, RPC_PROTOCOL_VERSION.to_string()),
        ];

        match self.hlc.update_now() {
            Ok(timestamp) => protocol.push((UserProperty::Timestamp, timestamp)),
            Err(e) => tracing::warn!("response sent without timestamp: {e}"),
        }

        protocol.extend(
            [
                (UserProperty::StatusMessage, reply.message),
                (
                    UserProperty::IsApplicationError,
                    reply.is_application_error.then(|| "true".to_owned()),
                ),
                (UserProperty::InvalidPropertyName, reply.property_name),
                (UserProperty::InvalidPropertyValue, reply.property_value),
                (
                    UserProperty::SupportedMajorVersions,
                    reply
                        .supported_major_versions
                        .map(|versions| format_supported_major_versions(&versions)),
                ),
                (
                    UserProperty::RequestProtocolVersion,
                    reply.request_protocol_version,
                ),
            ]
            .into_iter()
            .filter_map(|(property, value)| Some((property, value?))),
        );

        user_properties.extend(
            protocol
                .into_iter()
                .map(|(property, value)| (property.to_string(), value)),
        );

        Publish {
            topic: response_topic.to_owned(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: reply.payload,
            properties: PublishProperties {
                payload_format_indicator: Some(reply.format_indicator as u8),
                message_expiry_interval: Some(remaining_secs(expires_at).max(1)),
                correlation_data,
                user_properties,
                content_type: reply.content_type,
                ..Default::default()
            },
        }
    }

    /// Publish `response` unless the invoker has given up on it.
    async fn respond(&self, mut response: Publish, expires_at: Instant) {
        let remaining = remaining_secs(expires_at);

        if remaining == 0 {
            tracing::debug!(topic = response.topic, "request expired; not responding");
            return;
        }

        response.properties.message_expiry_interval = Some(remaining);

        match self.client.publish(response).await {
            Ok(reason_code) if !reason_code.is_success() => {
                tracing::warn!(?reason_code, "response rejected");
            }
            Ok(_) => (),
            Err(e) => tracing::warn!("error publishing response: {e}"),
        }
    }
}

/// Whole seconds until `deadline`, rounded up.
fn remaining_secs(deadline: Instant) -> u32 {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let secs = remaining
        .as_secs()
        .saturating_add(u64::from(remaining.subsec_nanos() > 0));

    u32::try_from(secs).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use uuid::Uuid;

    use crate::cache::{CacheConfig, CommandResponseCache};
    use crate::mqtt::loopback::{LoopbackBroker, LoopbackClient};
    use crate::mqtt::{PubSubClient, Publish, QoS, Receiver};
    use crate::rpc::UserProperty;

    use super::{
        ApplicationError, CommandHandler, Executor, ExecutorRequest, ExecutorResponse, Options,
    };

    /// Doubles its argument, counting executions.
    #[derive(Default)]
    struct Doubler {
        executions: Arc<AtomicUsize>,
    }

    impl CommandHandler<Bytes, Bytes> for Doubler {
        async fn handle(
            &self,
            request: ExecutorRequest<Bytes>,
        ) -> Result<ExecutorResponse<Bytes>, ApplicationError> {
            self.executions.fetch_add(1, Ordering::SeqCst);

            let n = std::str::from_utf8(&request.payload)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| ApplicationError::new("not a number"))?;

            Ok(ExecutorResponse::new(Bytes::from((n * 2).to_string())))
        }
    }

    struct Harness {
        _executor: Executor<Bytes, Bytes, LoopbackClient, Doubler>,
        invoker: LoopbackClient,
        responses: Receiver,
        executions: Arc<AtomicUsize>,
    }

    async fn harness(broker: &LoopbackBroker) -> Harness {
        let handler = Doubler::default();
        let executions = handler.executions.clone();

        let executor = Executor::new(
            broker.connect(Some("executor")),
            CommandResponseCache::new(CacheConfig::default()),
            Arc::default(),
            Options::new("double", "rpc/double"),
            handler,
        )
        .unwrap();

        executor.start().await.unwrap();
        executor.start().await.unwrap();

        let invoker = broker.connect(Some("invoker"));
        let responses = invoker.receiver("clients/invoker/#").unwrap();
        invoker
            .subscribe("clients/invoker/#", QoS::AtLeastOnce)
            .await
            .unwrap();

        Harness {
            _executor: executor,
            invoker,
            responses,
            executions,
        }
    }

    fn request(correlation_data: Option<Bytes>, payload: &'static str) -> Publish {
        let mut publish = Publish::new("rpc/double", payload);
        publish.properties.response_topic = Some("clients/invoker/rpc/double".into());
        publish.properties.correlation_data = correlation_data;
        publish.properties.message_expiry_interval = Some(10);
        publish
    }

    fn uuid() -> Option<Bytes> {
        Some(Bytes::copy_from_slice(Uuid::new_v4().as_bytes()))
    }

    impl Harness {
        async fn call(&mut self, request: Publish) -> Publish {
            self.invoker.publish(request).await.unwrap();
            let delivery = self.responses.recv().await.unwrap();
            delivery.ack.ack();
            delivery.publish
        }
    }

    #[tokio::test]
    async fn executes_and_deduplicates() {
        let broker = LoopbackBroker::new();
        let mut harness = harness(&broker).await;

        let correlation_data = uuid();
        let response = harness.call(request(correlation_data.clone(), "21")).await;

        assert_eq!(response.payload, "42");
        assert_eq!(response.user_property("__stat"), Some("200"));
        assert_eq!(response.user_property("__protVer"), Some("1.0"));
        assert!(response.user_property("__ts").is_some());
        assert_eq!(response.properties.correlation_data, correlation_data);

        let duplicate = harness.call(request(correlation_data.clone(), "21")).await;
        assert_eq!(duplicate.payload, "42");
        assert_eq!(harness.executions.load(Ordering::SeqCst), 1);

        harness.call(request(uuid(), "21")).await;
        assert_eq!(harness.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let broker = LoopbackBroker::new();
        let mut harness = harness(&broker).await;

        let response = harness.call(request(None, "1")).await;
        assert_eq!(response.user_property("__stat"), Some("400"));
        assert_eq!(response.user_property("__propName"), Some("Correlation Data"));

        let response = harness
            .call(request(Some(Bytes::from_static(b"short")), "1"))
            .await;
        assert_eq!(response.user_property("__stat"), Some("400"));
        assert_eq!(response.user_property("__propVal"), Some("short"));

        let mut no_expiry = request(uuid(), "1");
        no_expiry.properties.message_expiry_interval = None;
        let response = harness.call(no_expiry).await;
        assert_eq!(response.user_property("__propName"), Some("Message Expiry"));

        assert_eq!(harness.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_unsupported_versions() {
        let broker = LoopbackBroker::new();
        let mut harness = harness(&broker).await;

        let mut publish = request(uuid(), "1");
        publish
            .properties
            .user_properties
            .push((UserProperty::ProtocolVersion.to_string(), "2.0".into()));

        let response = harness.call(publish).await;
        assert_eq!(response.user_property("__stat"), Some("505"));
        assert_eq!(response.user_property("__supProtMajVer"), Some("1"));
        assert_eq!(response.user_property("__requestProtVer"), Some("2.0"));
        assert_eq!(harness.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reports_application_errors() {
        let broker = LoopbackBroker::new();
        let mut harness = harness(&broker).await;

        let response = harness.call(request(uuid(), "twelve")).await;
        assert_eq!(response.user_property("__stat"), Some("500"));
        assert_eq!(response.user_property("__apErr"), Some("true"));
        assert_eq!(response.user_property("__stMsg"), Some("not a number"));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_after_shutdown_executes_again() {
        let broker = LoopbackBroker::new();
        let cache = CommandResponseCache::new(CacheConfig::default());
        let executions = Arc::new(AtomicUsize::new(0));

        let counter = executions.clone();
        let interrupted = Executor::new(
            broker.connect(Some("interrupted")),
            cache.clone(),
            Arc::default(),
            Options::new("double", "rpc/double"),
            move |request: ExecutorRequest<Bytes>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, ApplicationError>(ExecutorResponse::new(request.payload))
                }
            },
        )
        .unwrap();
        interrupted.start().await.unwrap();

        let invoker = broker.connect(Some("invoker"));
        let mut responses = invoker.receiver("clients/invoker/#").unwrap();
        invoker
            .subscribe("clients/invoker/#", QoS::AtLeastOnce)
            .await
            .unwrap();

        let correlation_data = uuid();
        invoker
            .publish(request(correlation_data.clone(), "21"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        interrupted.shutdown().await;
        assert!(cache.is_empty().await);

        let executor = Executor::new(
            broker.connect(Some("executor")),
            cache.clone(),
            Arc::default(),
            Options::new("double", "rpc/double"),
            Doubler {
                executions: executions.clone(),
            },
        )
        .unwrap();
        executor.start().await.unwrap();

        // The broker redelivers the unacknowledged request.
        invoker
            .publish(request(correlation_data.clone(), "21"))
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
        delivery.ack.ack();

        assert_eq!(delivery.publish.payload, "42");
        assert_eq!(delivery.publish.properties.correlation_data, correlation_data);
        assert_eq!(executions.load(Ordering::SeqCst), 2);

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_unsubscribes() {
        let broker = LoopbackBroker::new();

        let executor = Executor::new(
            broker.connect(Some("executor")),
            CommandResponseCache::new(CacheConfig::default()),
            Arc::default(),
            Options::new("double", "rpc/double"),
            |request: ExecutorRequest<Bytes>| async move {
                Ok::<_, ApplicationError>(ExecutorResponse::new(request.payload))
            },
        )
        .unwrap();

        executor.start().await.unwrap();
        executor.shutdown().await;

        assert_eq!(
            broker
                .connect(None)
                .publish(request(uuid(), "1"))
                .await
                .unwrap(),
            crate::mqtt::ReasonCode::NO_MATCHING_SUBSCRIBERS
        );
        assert!(executor.start().await.is_err());
    }
}
