//! Routing of responses to the invocations waiting for them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collections::{HashMap, HashSet};
use crate::error::ProtocolError;
use crate::mqtt::{ClientError, Delivery, PubSubClient, Publish, QoS, Receiver};
use crate::queue::{BlockingConcurrentQueue, Cancelled};

type PendingMap = Mutex<HashMap<String, Arc<ResponsePromise>>>;

/// Responses for one correlation ID, in arrival order.
struct ResponsePromise {
    response_topic: String,
    queue: BlockingConcurrentQueue<Publish>,
}

/// Subscribes to response topics on behalf of an invoker and hands each response to the
/// invocation with matching correlation data.
pub(crate) struct ResponseRouter<C> {
    client: C,
    pending: Arc<PendingMap>,
    subscribed: tokio::sync::Mutex<HashSet<String>>,
    token: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Registration of an invocation awaiting responses. Deregisters on drop.
pub(crate) struct PendingResponse {
    correlation_id: String,
    promise: Arc<ResponsePromise>,
    pending: Arc<PendingMap>,
    shutdown: CancellationToken,
}

impl<C: PubSubClient> ResponseRouter<C> {
    pub fn new(client: C) -> Self {
        ResponseRouter {
            client,
            pending: Arc::new(Mutex::new(HashMap::default())),
            subscribed: tokio::sync::Mutex::new(HashSet::default()),
            token: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Subscribe to `filter` unless already subscribed.
    pub async fn ensure_subscribed(&self, filter: &str) -> Result<(), ProtocolError> {
        let mut subscribed = self.subscribed.lock().await;

        if subscribed.contains(filter) {
            return Ok(());
        }

        if self.is_shut_down() {
            return Err(ProtocolError::cancellation().with_message("invoker has been shut down"));
        }

        let reason_code = self
            .client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(ProtocolError::client_error)?;

        if !reason_code.is_success() {
            return Err(ProtocolError::client_error(ClientError::Rejected(reason_code.0))
                .with_message(format!("subscription to {filter:?} rejected")));
        }

        let rx = self
            .client
            .receiver(filter)
            .map_err(ProtocolError::client_error)?;

        let task = tokio::spawn(run_receiver(
            filter.to_owned(),
            self.pending.clone(),
            rx,
            self.token.clone(),
        ));

        self.tasks.lock().await.push(task);
        subscribed.insert(filter.to_owned());

        tracing::debug!(filter, "subscribed to responses");

        Ok(())
    }

    /// Start accepting responses with correlation data `correlation_id` on `response_topic`.
    pub fn register(
        &self,
        correlation_id: Uuid,
        response_topic: String,
    ) -> Result<PendingResponse, ProtocolError> {
        let correlation_id = correlation_id.to_string();
        let mut pending = lock(&self.pending);

        if pending.contains_key(&correlation_id) {
            return Err(ProtocolError::state_invalid(Some("correlation_id".into()))
                .with_message(format!("correlation ID {correlation_id} already in use")));
        }

        let promise = Arc::new(ResponsePromise {
            response_topic,
            queue: BlockingConcurrentQueue::new(),
        });

        pending.insert(correlation_id.clone(), promise.clone());

        Ok(PendingResponse {
            correlation_id,
            promise,
            pending: self.pending.clone(),
            shutdown: self.token.clone(),
        })
    }

    /// Stop routing responses and unsubscribe from every response topic.
    ///
    /// Invocations still waiting fail with [`Cancellation`][crate::error::ProtocolErrorKind::Cancellation].
    pub async fn shutdown(&self) {
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("response receiver task failed: {e}");
            }
        }

        let filters = std::mem::take(&mut *self.subscribed.lock().await);

        for filter in filters {
            match self.client.unsubscribe(&filter).await {
                Ok(reason_code) if reason_code.is_success() => {
                    tracing::debug!(filter, "unsubscribed from responses");
                }
                Ok(reason_code) => {
                    tracing::warn!(filter, ?reason_code, "unsubscribe rejected");
                }
                Err(e) => {
                    tracing::warn!(filter, "error unsubscribing: {e}");
                }
            }
        }
    }
}

impl<C> Drop for ResponseRouter<C> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the next response.
    pub async fn recv(&self, cancel: &CancellationToken) -> Result<Publish, ProtocolError> {
        tokio::select! {
            res = self.promise.queue.dequeue(&self.shutdown) => {
                res.map_err(|Cancelled| {
                    ProtocolError::cancellation().with_message("invoker shut down while awaiting response")
                })
            }
            _ = cancel.cancelled() => Err(ProtocolError::cancellation()),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.correlation_id);
    }
}

#[tracing::instrument(name = "ResponseRouter::run_receiver", skip_all, fields(filter = %filter))]
async fn run_receiver(
    filter: String,
    pending: Arc<PendingMap>,
    mut rx: Receiver,
    token: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            delivery = rx.recv() => delivery,
        };

        let Some(Delivery { publish, ack }) = delivery else {
            tracing::debug!("transport closed");
            break;
        };

        route(&pending, publish);

        // Responses are only ever delivered to the invocation once, whatever happens to them.
        ack.ack();
    }

    tracing::debug!("response routing closed; exiting.");
}

fn route(pending: &PendingMap, publish: Publish) {
    let Some(correlation_data) = &publish.properties.correlation_data else {
        tracing::warn!(topic = publish.topic, "response without correlation data; dropping");
        return;
    };

    let Ok(correlation_id) = Uuid::from_slice(correlation_data) else {
        tracing::warn!(
            topic = publish.topic,
            "response correlation data is not a UUID; dropping"
        );
        return;
    };

    let Some(promise) = lock(pending).get(&correlation_id.to_string()).cloned() else {
        tracing::debug!(%correlation_id, "no invocation awaiting response; dropping");
        return;
    };

    if publish.topic != promise.response_topic {
        tracing::warn!(
            %correlation_id,
            topic = publish.topic,
            expected = promise.response_topic,
            "response arrived on unexpected topic; dropping"
        );
        return;
    }

    promise.queue.enqueue(publish);
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, Arc<ResponsePromise>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::error::ProtocolErrorKind;
    use crate::mqtt::loopback::LoopbackBroker;
    use crate::mqtt::{PubSubClient, Publish};

    use super::ResponseRouter;

    fn response(topic: &str, correlation_id: Uuid, payload: &'static str) -> Publish {
        let mut publish = Publish::new(topic, Bytes::from_static(payload.as_bytes()));
        publish.properties.correlation_data = Some(Bytes::copy_from_slice(correlation_id.as_bytes()));
        publish
    }

    #[tokio::test]
    async fn routes_by_correlation_data() {
        let broker = LoopbackBroker::new();
        let router = ResponseRouter::new(broker.connect(Some("invoker")));
        let executor = broker.connect(Some("executor"));

        router.ensure_subscribed("clients/invoker/+").await.unwrap();
        router.ensure_subscribed("clients/invoker/+").await.unwrap();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let first_pending = router.register(first, "clients/invoker/a".into()).unwrap();
        let second_pending = router.register(second, "clients/invoker/b".into()).unwrap();

        // Wrong topic for the correlation ID.
        executor
            .publish(response("clients/invoker/b", first, "lost"))
            .await
            .unwrap();
        executor
            .publish(response("clients/invoker/b", second, "two"))
            .await
            .unwrap();
        executor
            .publish(response("clients/invoker/a", first, "one"))
            .await
            .unwrap();

        let token = CancellationToken::new();
        assert_eq!(first_pending.recv(&token).await.unwrap().payload, "one");
        assert_eq!(second_pending.recv(&token).await.unwrap().payload, "two");

        let err = router.register(first, "clients/invoker/a".into()).err().unwrap();
        assert!(matches!(err.kind, ProtocolErrorKind::StateInvalid { .. }));

        drop(first_pending);
        assert!(router.register(first, "clients/invoker/a".into()).is_ok());

        router.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let broker = LoopbackBroker::new();
        let client = broker.connect(Some("invoker"));
        let router = ResponseRouter::new(client.clone());

        router.ensure_subscribed("clients/invoker/+").await.unwrap();
        let pending = router.register(Uuid::new_v4(), "clients/invoker/a".into()).unwrap();

        router.shutdown().await;
        router.shutdown().await;

        let err = pending.recv(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::Cancellation);

        // The subscription is gone.
        assert_eq!(
            broker
                .connect(None)
                .publish(Publish::new("clients/invoker/a", "x"))
                .await
                .unwrap(),
            crate::mqtt::ReasonCode::NO_MATCHING_SUBSCRIBERS
        );

        let err = router
            .ensure_subscribed("clients/invoker/other")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::Cancellation);
    }

    #[tokio::test]
    async fn caller_cancellation() {
        let broker = LoopbackBroker::new();
        let router = ResponseRouter::new(broker.connect(Some("invoker")));
        let pending = router.register(Uuid::new_v4(), "clients/invoker/a".into()).unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let err = pending.recv(&token).await.unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::Cancellation);
    }
}
