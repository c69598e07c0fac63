//! Invoking commands that exchange several requests and responses under one correlation ID.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, Peekable};
use futures::{FutureExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collections::HashMap;
use crate::error::ProtocolError;
use crate::hlc::ApplicationHybridLogicalClock;
use crate::mqtt::{PubSubClient, Publish};
use crate::rpc::correlation::PendingResponse;
use crate::rpc::invoker::{expiry_interval, CommandChannel, Options, Outgoing, Response};
use crate::rpc::payload::{FormatIndicator, PayloadSerialize, SerializedPayload};
use crate::rpc::{validate_user_properties, UserProperty};

pub struct StreamingRequest<T> {
    /// Published as they are produced, while responses arrive.
    pub payloads: BoxStream<'static, T>,
    /// Covers the whole exchange, including every response.
    pub timeout: Duration,
    pub custom_user_data: Vec<(String, String)>,
    pub topic_tokens: HashMap<String, String>,
}

impl<T> StreamingRequest<T> {
    pub fn new(payloads: impl Stream<Item = T> + Send + 'static, timeout: Duration) -> Self {
        StreamingRequest {
            payloads: payloads.boxed(),
            timeout,
            custom_user_data: Vec::new(),
            topic_tokens: HashMap::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamingExtendedResponse<T> {
    pub response: Response<T>,
    /// Position of this response in the stream.
    pub index: u64,
    /// No more responses follow.
    pub is_last: bool,
}

/// Sends a stream of requests and yields the executor's stream of responses.
pub struct StreamingInvoker<TReq, TResp, C> {
    channel: Arc<CommandChannel<C>>,
    _payloads: PhantomData<fn(TReq) -> TResp>,
}

impl<TReq, TResp, C> Clone for StreamingInvoker<TReq, TResp, C> {
    fn clone(&self) -> Self {
        StreamingInvoker {
            channel: self.channel.clone(),
            _payloads: PhantomData,
        }
    }
}

/// Where the messages of one exchange go.
#[derive(Clone)]
struct Route {
    topic: String,
    response_topic: String,
    correlation_id: Uuid,
    message_expiry_interval: u32,
}

impl Route {
    fn outgoing(&self, payload: SerializedPayload, user_properties: Vec<(String, String)>) -> Outgoing {
        Outgoing {
            topic: self.topic.clone(),
            response_topic: self.response_topic.clone(),
            correlation_id: self.correlation_id,
            payload,
            user_properties,
            message_expiry_interval: self.message_expiry_interval,
        }
    }
}

struct Exchange<TResp, C> {
    channel: Arc<CommandChannel<C>>,
    pending: PendingResponse,
    route: Route,
    /// Publishes the requests.
    sender: JoinHandle<Result<(), ProtocolError>>,
    sending: bool,
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
    received: u64,
    done: bool,
    _payload: PhantomData<fn() -> TResp>,
}

impl<TResp, C> Drop for Exchange<TResp, C> {
    fn drop(&mut self) {
        self.sender.abort();
    }
}

impl<TReq, TResp, C> StreamingInvoker<TReq, TResp, C>
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
        Ok(StreamingInvoker {
            channel: Arc::new(CommandChannel::new(client, hlc, options)?),
            _payloads: PhantomData,
        })
    }

    /// Start sending requests and yield responses until one is marked last.
    ///
    /// Requests are published in the background as `request.payloads` produces them. An error
    /// response is yielded like any other and the stream continues; the stream ends after the
    /// last response, or with an error on timeout, cancellation or shutdown.
    ///
    /// Cancelling `cancel` stops sending and asks the executor to stop; the stream then ends
    /// with a cancellation error.
    pub async fn invoke(
        &self,
        request: StreamingRequest<TReq>,
        cancel: CancellationToken,
    ) -> Result<
        impl Stream<Item = Result<StreamingExtendedResponse<TResp>, ProtocolError>> + Send + 'static,
        ProtocolError,
    > {
        let command_name = self.channel.command_name.clone();

        let exchange = self
            .start(request, cancel)
            .await
            .map_err(|e| e.with_command_name(&command_name))?;

        Ok(futures::stream::unfold(exchange, |mut exchange| async move {
            if exchange.done {
                return None;
            }

            let item = exchange.next().await;
            Some((item, exchange))
        }))
    }

    async fn start(
        &self,
        request: StreamingRequest<TReq>,
        cancel: CancellationToken,
    ) -> Result<Exchange<TResp, C>, ProtocolError> {
        let StreamingRequest {
            payloads,
            timeout,
            custom_user_data,
            topic_tokens,
        } = request;

        let message_expiry_interval = expiry_interval(timeout)?;
        validate_user_properties(&custom_user_data)?;

        let (topic, response_topic) = self.channel.topics(&topic_tokens)?;
        let deadline = Instant::now() + Duration::from_secs(message_expiry_interval.into());

        let mut payloads = payloads.peekable();

        let has_first = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProtocolError::cancellation()
                    .with_message("stream cancelled before its first request"));
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ProtocolError::timeout("command", Some(timeout)));
            }
            first = Pin::new(&mut payloads).peek() => first.is_some(),
        };

        if !has_first {
            return Err(ProtocolError::argument_invalid("payloads", "[]")
                .with_message("a stream needs at least one request"));
        }

        self.channel.ensure_subscribed().await?;

        let correlation_id = Uuid::new_v4();
        let pending = self
            .channel
            .router
            .register(correlation_id, response_topic.clone())?;

        let route = Route {
            topic,
            response_topic,
            correlation_id,
            message_expiry_interval,
        };

        let sender = tokio::spawn(send_requests(
            self.channel.clone(),
            payloads,
            route.clone(),
            custom_user_data,
            cancel.clone(),
        ));

        Ok(Exchange {
            channel: self.channel.clone(),
            pending,
            route,
            sender,
            sending: true,
            timeout,
            deadline,
            cancel,
            received: 0,
            done: false,
            _payload: PhantomData,
        })
    }

    pub async fn shutdown(&self) {
        self.channel.shutdown().await;
    }
}

/// Publish each request as `payloads` yields it.
///
/// A request is marked last if the input has already ended when it is sent. Otherwise the end
/// of the input is announced with an empty request marked last.
#[tracing::instrument(
    name = "StreamingInvoker::send_requests",
    skip_all,
    fields(correlation_id = %route.correlation_id)
)]
async fn send_requests<TReq, C>(
    channel: Arc<CommandChannel<C>>,
    mut payloads: Peekable<BoxStream<'static, TReq>>,
    route: Route,
    custom_user_data: Vec<(String, String)>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError>
where
    TReq: PayloadSerialize,
    C: PubSubClient,
{
    let mut index: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(sent = index, "stream cancelled; exiting.");
                return Ok(());
            }
            next = payloads.next() => next,
        };

        let (payload, is_last) = match next {
            Some(payload) => {
                // Don't wait on the producer; it may be waiting on our responses.
                let is_last = matches!(Pin::new(&mut payloads).peek().now_or_never(), Some(None));

                let payload = payload.serialize().map_err(|e| {
                    ProtocolError::payload_invalid()
                        .with_message("request payload could not be serialized")
                        .with_source(e)
                })?;

                (payload, is_last)
            }
            None => (
                SerializedPayload {
                    payload: Bytes::new(),
                    content_type: String::new(),
                    format_indicator: FormatIndicator::UnspecifiedBytes,
                },
                true,
            ),
        };

        let mut user_properties = custom_user_data.clone();
        user_properties.push((UserProperty::StreamIndex.to_string(), index.to_string()));

        if is_last {
            user_properties.push((UserProperty::IsLast.to_string(), "true".into()));
        }

        channel.send(route.outgoing(payload, user_properties)).await?;
        index += 1;

        if is_last {
            tracing::debug!(count = index, "stream of requests sent; exiting.");
            return Ok(());
        }
    }
}

impl<TResp, C> Exchange<TResp, C>
where
    TResp: PayloadSerialize,
    C: PubSubClient,
{
    async fn next(&mut self) -> Result<StreamingExtendedResponse<TResp>, ProtocolError> {
        let publish = match self.recv().await {
            Ok(publish) => publish,
            Err(e) => {
                self.done = true;
                return Err(e.with_command_name(&self.channel.command_name));
            }
        };

        // Read before parsing so that an error response can still end the stream.
        let is_last = publish
            .user_property(UserProperty::IsLast.as_str())
            .map_or(false, |value| value.eq_ignore_ascii_case("true"));

        if is_last {
            self.done = true;
        }

        let position = self.received;
        self.received += 1;

        let index: Result<u64, ProtocolError> =
            match publish.user_property(UserProperty::StreamIndex.as_str()) {
                Some(index) => index.parse().map_err(|_| {
                    ProtocolError::header_invalid(UserProperty::StreamIndex.as_str(), index)
                }),
                None => Ok(position),
            };

        index
            .and_then(|index| {
                let (response, _) = self.channel.parse_response::<TResp>(publish)?;

                Ok(StreamingExtendedResponse {
                    response,
                    index,
                    is_last,
                })
            })
            .map_err(|e| e.with_command_name(&self.channel.command_name))
    }

    /// Wait for the next response, watching the request sender meanwhile.
    async fn recv(&mut self) -> Result<Publish, ProtocolError> {
        loop {
            let received = tokio::select! {
                sent = &mut self.sender, if self.sending => {
                    self.sending = false;

                    match sent {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => return Err(e),
                        Err(e) => {
                            return Err(ProtocolError::internal_logic_error(None)
                                .with_message("request sender failed")
                                .with_source(e))
                        }
                    }
                }
                received = tokio::time::timeout_at(self.deadline, self.pending.recv(&self.cancel)) => received,
            };

            return match received {
                Ok(Ok(publish)) => Ok(publish),
                Ok(Err(e)) if self.cancel.is_cancelled() => {
                    if let Err(send_error) = self.send_cancel().await {
                        tracing::warn!(
                            correlation_id = %self.route.correlation_id,
                            "failed to tell the executor to stop: {send_error}"
                        );
                    }

                    Err(e.with_message("stream cancelled"))
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ProtocolError::timeout("command", Some(self.timeout))),
            };
        }
    }

    /// Tell the executor to stop sending responses.
    async fn send_cancel(&self) -> Result<(), ProtocolError> {
        tracing::debug!(correlation_id = %self.route.correlation_id, "cancelling stream");

        let payload = SerializedPayload {
            payload: Bytes::new(),
            content_type: String::new(),
            format_indicator: FormatIndicator::UnspecifiedBytes,
        };

        self.channel
            .send(
                self.route
                    .outgoing(payload, vec![(UserProperty::Cancel.to_string(), "true".into())]),
            )
            .await
    }
}
