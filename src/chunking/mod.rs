//! Transparent splitting and reassembly of messages too large for one MQTT packet.
//!
//! [`ChunkingClient`] wraps any [`PubSubClient`]: outbound payloads that don't fit under the
//! negotiated maximum packet size are split into chunks, and inbound chunks are buffered
//! per message until the whole message can be handed to the application.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::checksum::ChecksumAlgorithm;
use crate::error::ProtocolError;
use crate::mqtt::{ClientError, Delivery, Filter, PubSubClient, Publish, QoS, ReasonCode, Receiver};

pub use assembler::ChunkedMessageAssembler;
pub use metadata::{ChunkMetadata, ChunkMetadataError, CHUNK_USER_PROPERTY};
pub use splitter::{ChunkedMessageSplitter, SplitError, MIN_PACKET_SIZE};

mod assembler;
mod metadata;
mod splitter;

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ChunkingOptions {
    pub enabled: bool,
    /// Bytes reserved in every chunk for the packet header, topic and properties.
    pub static_overhead: u32,
    /// Partially received messages older than this are discarded.
    pub reassembly_timeout_secs: u64,
    /// How often to look for expired partial messages.
    pub sweep_interval_secs: u64,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        ChunkingOptions {
            enabled: true,
            static_overhead: 1024,
            reassembly_timeout_secs: 10,
            sweep_interval_secs: 5,
            checksum_algorithm: ChecksumAlgorithm::default(),
        }
    }
}

/// A [`PubSubClient`] that splits and reassembles oversized messages.
#[derive(Clone)]
pub struct ChunkingClient<C> {
    shared: Arc<Shared<C>>,
}

struct Shared<C> {
    inner: C,
    options: ChunkingOptions,
    splitter: ChunkedMessageSplitter,
    inbound: Arc<Inbound>,
    token: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// State shared with the background tasks.
struct Inbound {
    assemblers: Mutex<HashMap<String, Arc<ChunkedMessageAssembler>>>,
    receivers: Mutex<Vec<(Filter, mpsc::UnboundedSender<Delivery>)>>,
    checksum_algorithm: ChecksumAlgorithm,
    reassembly_timeout: Duration,
}

impl<C: PubSubClient> ChunkingClient<C> {
    /// Wrap `inner`, taking over all of its inbound messages.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(inner: C, options: ChunkingOptions) -> Result<Self, ProtocolError> {
        let splitter =
            ChunkedMessageSplitter::new(options.static_overhead, options.checksum_algorithm);

        if options.enabled {
            let Some(max_packet_size) = inner.max_packet_size().filter(|&max| max > 0) else {
                return Err(ProtocolError::configuration_invalid(
                    "max_packet_size",
                    "none",
                )
                .with_message("chunking requires the server to report a maximum packet size"));
            };

            splitter.max_chunk_size(max_packet_size).map_err(|e| {
                ProtocolError::configuration_invalid("static_overhead", options.static_overhead)
                    .with_source(e)
            })?;
        }

        let inbound = Arc::new(Inbound {
            assemblers: Mutex::new(HashMap::default()),
            receivers: Mutex::new(Vec::new()),
            checksum_algorithm: options.checksum_algorithm,
            reassembly_timeout: Duration::from_secs(options.reassembly_timeout_secs),
        });

        let token = CancellationToken::new();

        let transport_rx = inner
            .receiver("#")
            .map_err(ProtocolError::client_error)?;

        let mut tasks = vec![task::spawn(run_receiver(
            inbound.clone(),
            transport_rx,
            token.clone(),
        ))];

        if options.enabled {
            tasks.push(task::spawn(run_sweeper(
                inbound.clone(),
                Duration::from_secs(options.sweep_interval_secs.max(1)),
                token.clone(),
            )));
        }

        Ok(ChunkingClient {
            shared: Arc::new(Shared {
                inner,
                options,
                splitter,
                inbound,
                token,
                tasks: tokio::sync::Mutex::new(tasks),
            }),
        })
    }

    pub fn inner(&self) -> &C {
        &self.shared.inner
    }

    /// The number of messages with some, but not all, chunks received.
    pub fn pending_reassemblies(&self) -> usize {
        self.shared.inbound.assemblers().len()
    }

    /// Decide whether `publish` needs splitting and split it if so.
    fn prepare(&self, publish: Publish) -> Result<Vec<Publish>, ClientError> {
        let Some(max_packet_size) = self.shared.inner.max_packet_size() else {
            return Ok(vec![publish]);
        };

        if !self.shared.options.enabled
            || publish.payload.len() <= self.shared.splitter.max_chunk_size(max_packet_size)?
        {
            return Ok(vec![publish]);
        }

        Ok(self.shared.splitter.split(&publish, max_packet_size)?)
    }
}

impl<C: PubSubClient> PubSubClient for ChunkingClient<C> {
    fn client_id(&self) -> &str {
        self.shared.inner.client_id()
    }

    fn max_packet_size(&self) -> Option<u32> {
        self.shared.inner.max_packet_size()
    }

    async fn publish(&self, publish: Publish) -> Result<ReasonCode, ClientError> {
        if self.shared.token.is_cancelled() {
            return Err(ClientError::Disconnected);
        }

        let mut chunks = self.prepare(publish)?;

        if chunks.len() == 1 {
            if let Some(publish) = chunks.pop() {
                return self.shared.inner.publish(publish).await;
            }
        }

        let mut reason_code = ReasonCode::SUCCESS;

        // Sequentially, so chunks leave in index order.
        for chunk in chunks {
            reason_code = self.shared.inner.publish(chunk).await?;

            if !reason_code.is_success() {
                tracing::debug!(?reason_code, "chunk rejected; abandoning message");
                break;
            }
        }

        Ok(reason_code)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<ReasonCode, ClientError> {
        self.shared.inner.subscribe(filter, qos).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<ReasonCode, ClientError> {
        self.shared.inner.unsubscribe(filter).await
    }

    fn receiver(&self, filter: &str) -> Result<Receiver, ClientError> {
        if self.shared.token.is_cancelled() {
            return Err(ClientError::Disconnected);
        }

        let filter: Filter = filter.parse()?;
        let (tx, rx) = Receiver::channel();

        self.shared.inbound.receivers().push((filter, tx));

        Ok(rx)
    }

    /// Stop the background tasks, discard partial messages and shut down the wrapped client.
    ///
    /// Safe to call more than once.
    async fn shutdown(&self) {
        self.shared.token.cancel();

        let tasks = std::mem::take(&mut *self.shared.tasks.lock().await);

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("chunking task failed: {e}");
            }
        }

        self.shared.inbound.assemblers().clear();
        self.shared.inbound.receivers().clear();

        self.shared.inner.shutdown().await;
    }
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Inbound {
    fn assemblers(&self) -> MutexGuard<'_, HashMap<String, Arc<ChunkedMessageAssembler>>> {
        self.assemblers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receivers(&self) -> MutexGuard<'_, Vec<(Filter, mpsc::UnboundedSender<Delivery>)>> {
        self.receivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, delivery: Delivery) {
        let metadata = match ChunkMetadata::from_publish(&delivery.publish) {
            None => return self.dispatch(delivery),
            Some(Ok(metadata)) => metadata,
            Some(Err(e)) => {
                tracing::warn!(
                    topic = delivery.publish.topic,
                    "discarding chunk with malformed metadata: {e}"
                );
                delivery.ack.ack();
                return;
            }
        };

        let assembler = self
            .assemblers()
            .entry(metadata.message_id.clone())
            .or_insert_with(|| Arc::new(ChunkedMessageAssembler::new(self.checksum_algorithm)))
            .clone();

        let ack = delivery.ack.clone();

        if !assembler.add_chunk(metadata.chunk_index, delivery) {
            tracing::trace!(
                message_id = metadata.message_id,
                chunk_index = metadata.chunk_index,
                "duplicate chunk"
            );
            ack.ack();
            return;
        }

        if let (0, Some(total_chunks)) = (metadata.chunk_index, metadata.total_chunks) {
            assembler.update_metadata(total_chunks, metadata.checksum);
        }

        if assembler.is_complete() {
            if let Some(reassembled) = assembler.try_reassemble() {
                self.assemblers().remove(&metadata.message_id);

                tracing::trace!(
                    message_id = metadata.message_id,
                    payload_len = reassembled.publish.payload.len(),
                    "reassembled chunked message"
                );

                // The application acknowledges every chunk through the composite token.
                self.dispatch(reassembled);
                return;
            }

            tracing::warn!(
                message_id = metadata.message_id,
                "failed to reassemble chunked message"
            );
        }

        // Already buffered; the broker doesn't need to redeliver it.
        ack.ack();
    }

    fn dispatch(&self, delivery: Delivery) {
        let mut delivered = false;

        self.receivers().retain(|(filter, tx)| {
            if !filter.matches(&delivery.publish.topic) {
                return true;
            }

            let sent = tx.send(delivery.clone()).is_ok();
            delivered |= sent;
            sent
        });

        if !delivered {
            tracing::trace!(topic = delivery.publish.topic, "no receiver for message");
            delivery.ack.ack();
        }
    }

    fn sweep(&self) {
        self.assemblers().retain(|message_id, assembler| {
            if assembler.has_expired(self.reassembly_timeout) {
                tracing::debug!(
                    message_id,
                    received = assembler.received_count(),
                    "discarding expired partial message"
                );
                return false;
            }

            true
        });
    }
}

#[tracing::instrument(name = "chunking_receiver", skip_all)]
async fn run_receiver(inbound: Arc<Inbound>, mut transport_rx: Receiver, token: CancellationToken) {
    loop {
        tokio::select! {
            delivery = transport_rx.recv() => {
                let Some(delivery) = delivery else {
                    tracing::debug!("Transport receiver closed; exiting.");
                    break;
                };

                inbound.handle(delivery);
            }
            _ = token.cancelled() => {
                break;
            }
        }
    }

    // Close the application's receivers.
    inbound.receivers().clear();
}

#[tracing::instrument(name = "chunking_sweeper", skip_all)]
async fn run_sweeper(inbound: Arc<Inbound>, sweep_interval: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => inbound.sweep(),
            _ = token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::ProtocolErrorKind;
    use crate::mqtt::loopback::{LoopbackBroker, LoopbackClient};
    use crate::mqtt::{PubSubClient, Publish, QoS};

    use super::{ChunkMetadata, ChunkingClient, ChunkingOptions, CHUNK_USER_PROPERTY};

    const MAX_PACKET_SIZE: u32 = 1024;

    fn options() -> ChunkingOptions {
        ChunkingOptions {
            static_overhead: 256,
            ..Default::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    fn pair() -> (
        LoopbackBroker,
        ChunkingClient<LoopbackClient>,
        ChunkingClient<LoopbackClient>,
    ) {
        let broker = LoopbackBroker::with_max_packet_size(MAX_PACKET_SIZE);
        let sender = ChunkingClient::new(broker.connect(Some("sender")), options()).unwrap();
        let receiver = ChunkingClient::new(broker.connect(Some("receiver")), options()).unwrap();
        (broker, sender, receiver)
    }

    #[tokio::test]
    async fn requires_max_packet_size() {
        let broker = LoopbackBroker::new();

        let err = ChunkingClient::new(broker.connect(None), ChunkingOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.kind,
            ProtocolErrorKind::ConfigurationInvalid { .. }
        ));

        // Fine if chunking is disabled.
        let options = ChunkingOptions {
            enabled: false,
            ..Default::default()
        };
        assert!(ChunkingClient::new(broker.connect(None), options).is_ok());
    }

    #[tokio::test]
    async fn large_message_round_trip() {
        let (_broker, sender, receiver) = pair();

        receiver.subscribe("data/#", QoS::AtLeastOnce).await.unwrap();
        let mut rx = receiver.receiver("data/#").unwrap();

        let mut publish = Publish::new("data/large", payload(5000));
        publish.properties.content_type = Some("application/octet-stream".into());
        publish
            .properties
            .user_properties
            .push(("origin".into(), "test".into()));

        sender.publish(publish.clone()).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.publish.payload, publish.payload);
        assert_eq!(delivery.publish.properties, publish.properties);
        assert!(delivery.publish.user_property(CHUNK_USER_PROPERTY).is_none());

        // Every chunk but the last was acknowledged on arrival.
        assert_eq!(receiver.inner().unacked(), 1);
        delivery.ack.ack();
        assert_eq!(receiver.inner().unacked(), 0);
        assert_eq!(receiver.inner().acknowledged(), 7);
        assert_eq!(receiver.pending_reassemblies(), 0);
    }

    #[tokio::test]
    async fn small_message_passes_through() {
        let (_broker, sender, receiver) = pair();

        receiver.subscribe("data", QoS::AtLeastOnce).await.unwrap();
        let mut rx = receiver.receiver("data").unwrap();

        sender
            .publish(Publish::new("data", payload(768)))
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.publish.payload.len(), 768);
        delivery.ack.ack();
        assert_eq!(receiver.inner().acknowledged(), 1);
    }

    #[tokio::test]
    async fn reordered_chunks() {
        let (broker, sender, receiver) = pair();

        receiver.subscribe("data", QoS::AtLeastOnce).await.unwrap();
        let mut rx = receiver.receiver("data").unwrap();

        broker.hold("data".parse().unwrap());
        sender
            .publish(Publish::new("data", payload(3000)))
            .await
            .unwrap();
        broker.release(true);

        assert_eq!(rx.recv().await.unwrap().publish.payload, payload(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_abandoned_messages() {
        let (_broker, sender, receiver) = pair();

        receiver.subscribe("data", QoS::AtLeastOnce).await.unwrap();
        let _rx = receiver.receiver("data").unwrap();

        // Send one chunk of a message that will never complete.
        let metadata = ChunkMetadata {
            message_id: "abandoned".into(),
            chunk_index: 1,
            total_chunks: None,
            checksum: None,
        };
        let mut chunk = Publish::new("data", payload(10));
        chunk
            .properties
            .user_properties
            .push((CHUNK_USER_PROPERTY.into(), metadata.to_json()));

        sender.inner().publish(chunk).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(receiver.pending_reassemblies(), 1);
        assert_eq!(receiver.inner().unacked(), 0);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(receiver.pending_reassemblies(), 0);
    }

    #[tokio::test]
    async fn malformed_metadata_is_dropped() {
        let (_broker, sender, receiver) = pair();

        receiver.subscribe("data", QoS::AtLeastOnce).await.unwrap();
        let mut rx = receiver.receiver("data").unwrap();

        let mut chunk = Publish::new("data", payload(10));
        chunk
            .properties
            .user_properties
            .push((CHUNK_USER_PROPERTY.into(), "{not json".into()));
        sender.inner().publish(chunk).await.unwrap();

        sender.publish(Publish::new("data", "after")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().publish.payload, "after");
        assert_eq!(receiver.pending_reassemblies(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (_broker, _sender, receiver) = pair();
        let mut rx = receiver.receiver("#").unwrap();

        receiver.shutdown().await;
        receiver.shutdown().await;

        assert!(rx.recv().await.is_none());
        assert!(!receiver.inner().is_connected());
        assert!(receiver.receiver("#").is_err());
    }
}
