//! An in-memory broker for tests and the demo.
//!
//! Every [`LoopbackClient`] connected to the same [`LoopbackBroker`] sees the others' publishes,
//! subject to its subscriptions. Delivery happens synchronously inside `publish()`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collections::{HashMap, HashSet};
use rand::distributions::{Alphanumeric, DistString};

use crate::mqtt::{
    AckToken, ClientError, Delivery, Filter, PubSubClient, Publish, QoS, ReasonCode, Receiver,
};

const GENERATED_CLIENT_ID_LEN: usize = 16;

#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    max_packet_size: Option<u32>,
    clients: HashMap<Arc<str>, ClientState>,
    next_packet_id: u64,
    hold: Option<Filter>,
    held: Vec<Publish>,
}

struct ClientState {
    connected: bool,
    subscriptions: Vec<(Filter, QoS)>,
    receivers: Vec<(Filter, tokio::sync::mpsc::UnboundedSender<Delivery>)>,
    /// Packet IDs delivered at QoS 1+ and not yet acknowledged.
    unacked: HashSet<u64>,
    acknowledged: usize,
}

#[derive(Clone)]
pub struct LoopbackClient {
    client_id: Arc<str>,
    broker: LoopbackBroker,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject packets larger than `max_packet_size`, as a real broker would.
    pub fn with_max_packet_size(max_packet_size: u32) -> Self {
        let broker = Self::default();
        broker.lock().max_packet_size = Some(max_packet_size);
        broker
    }

    /// Connect a new client. A random client ID is generated if `client_id` is `None`.
    pub fn connect(&self, client_id: Option<&str>) -> LoopbackClient {
        let client_id: Arc<str> = match client_id {
            Some(id) => id.into(),
            None => Alphanumeric
                .sample_string(&mut rand::thread_rng(), GENERATED_CLIENT_ID_LEN)
                .into(),
        };

        // A reconnecting client gets a clean session.
        self.lock().clients.insert(
            client_id.clone(),
            ClientState {
                connected: true,
                subscriptions: Vec::new(),
                receivers: Vec::new(),
                unacked: HashSet::default(),
                acknowledged: 0,
            },
        );

        tracing::debug!(%client_id, "loopback client connected");

        LoopbackClient {
            client_id,
            broker: self.clone(),
        }
    }

    /// Hold back publishes to topics matching `filter` until [`release()`][Self::release].
    pub fn hold(&self, filter: Filter) {
        self.lock().hold = Some(filter);
    }

    /// Stop holding publishes and route the held ones, optionally in reverse order.
    pub fn release(&self, reverse: bool) {
        let mut held = {
            let mut state = self.lock();
            state.hold = None;
            std::mem::take(&mut state.held)
        };

        if reverse {
            held.reverse();
        }

        for publish in held {
            self.route(publish);
        }
    }

    /// Discard held publishes, simulating loss.
    pub fn drop_held(&self) -> usize {
        let mut state = self.lock();
        state.hold = None;
        std::mem::take(&mut state.held).len()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // The state is never left inconsistent across a panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, publish: Publish) -> ReasonCode {
        let mut to_ack = Vec::new();
        let mut matched = false;

        {
            let mut state = self.lock();
            let state = &mut *state;

            for (client_id, client) in state.clients.iter_mut() {
                if !client.connected {
                    continue;
                }

                let Some(sub_qos) = client
                    .subscriptions
                    .iter()
                    .filter(|(filter, _)| filter.matches(&publish.topic))
                    .map(|(_, qos)| *qos)
                    .max()
                else {
                    continue;
                };

                matched = true;

                let mut publish = publish.clone();
                publish.qos = publish.qos.min(sub_qos);

                let ack = if publish.qos == QoS::AtMostOnce {
                    AckToken::noop()
                } else {
                    state.next_packet_id += 1;
                    let packet_id = state.next_packet_id;
                    client.unacked.insert(packet_id);
                    self.ack_token(client_id.clone(), packet_id)
                };

                let delivery = Delivery { publish, ack };

                let mut delivered = false;

                client.receivers.retain(|(filter, tx)| {
                    if !filter.matches(&delivery.publish.topic) {
                        return true;
                    }

                    let sent = tx.send(delivery.clone()).is_ok();
                    delivered |= sent;
                    sent
                });

                if !delivered {
                    tracing::trace!(%client_id, topic = delivery.publish.topic, "no receiver for message");
                    to_ack.push(delivery.ack);
                }
            }
        }

        // The ack callbacks take the lock.
        for ack in to_ack {
            ack.ack();
        }

        if matched {
            ReasonCode::SUCCESS
        } else {
            ReasonCode::NO_MATCHING_SUBSCRIBERS
        }
    }

    fn ack_token(&self, client_id: Arc<str>, packet_id: u64) -> AckToken {
        let state = Arc::downgrade(&self.state);

        AckToken::new(move || {
            let Some(state) = state.upgrade() else {
                return;
            };

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

            if let Some(client) = state.clients.get_mut(&client_id) {
                if client.unacked.remove(&packet_id) {
                    client.acknowledged += 1;
                }
            }
        })
    }
}

impl LoopbackClient {
    pub fn is_connected(&self) -> bool {
        self.broker
            .lock()
            .clients
            .get(&self.client_id)
            .map_or(false, |client| client.connected)
    }

    /// Close all receivers and drop subscriptions.
    pub fn disconnect(&self) {
        if let Some(client) = self.broker.lock().clients.get_mut(&self.client_id) {
            client.connected = false;
            client.subscriptions.clear();
            client.receivers.clear();
        }
    }

    /// The number of QoS 1+ messages delivered to this client that haven't been acknowledged.
    pub fn unacked(&self) -> usize {
        self.with_client(|client| client.unacked.len())
            .unwrap_or_default()
    }

    /// The number of QoS 1+ messages this client has acknowledged.
    pub fn acknowledged(&self) -> usize {
        self.with_client(|client| client.acknowledged)
            .unwrap_or_default()
    }

    fn with_client<T>(&self, f: impl FnOnce(&mut ClientState) -> T) -> Option<T> {
        let mut state = self.broker.lock();

        state
            .clients
            .get_mut(&self.client_id)
            .filter(|client| client.connected)
            .map(f)
    }
}

impl PubSubClient for LoopbackClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn max_packet_size(&self) -> Option<u32> {
        self.broker.lock().max_packet_size
    }

    async fn publish(&self, publish: Publish) -> Result<ReasonCode, ClientError> {
        {
            let mut state = self.broker.lock();

            if !state
                .clients
                .get(&self.client_id)
                .map_or(false, |client| client.connected)
            {
                return Err(ClientError::Disconnected);
            }

            if let Some(max) = state.max_packet_size {
                let size = publish.packet_size();

                if size > max as usize {
                    return Err(ClientError::PacketTooLarge { size, max });
                }
            }

            if state
                .hold
                .as_ref()
                .map_or(false, |filter| filter.matches(&publish.topic))
            {
                state.held.push(publish);
                return Ok(ReasonCode::SUCCESS);
            }
        }

        Ok(self.broker.route(publish))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<ReasonCode, ClientError> {
        let parsed: Filter = filter.parse()?;

        self.with_client(|client| {
            // Resubscribing replaces the existing subscription.
            client.subscriptions.retain(|(existing, _)| existing != &parsed);
            client.subscriptions.push((parsed, qos));
        })
        .ok_or(ClientError::Disconnected)?;

        tracing::trace!(client_id = %self.client_id, filter, ?qos, "subscribed");

        Ok(ReasonCode(qos as u8))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<ReasonCode, ClientError> {
        let parsed: Filter = filter.parse()?;

        let removed = self
            .with_client(|client| {
                let before = client.subscriptions.len();
                client.subscriptions.retain(|(existing, _)| existing != &parsed);
                before != client.subscriptions.len()
            })
            .ok_or(ClientError::Disconnected)?;

        Ok(if removed {
            ReasonCode::SUCCESS
        } else {
            ReasonCode::NO_SUBSCRIPTION_EXISTED
        })
    }

    fn receiver(&self, filter: &str) -> Result<Receiver, ClientError> {
        let parsed: Filter = filter.parse()?;
        let (tx, rx) = Receiver::channel();

        self.with_client(|client| client.receivers.push((parsed, tx)))
            .ok_or(ClientError::Disconnected)?;

        Ok(rx)
    }

    async fn shutdown(&self) {
        self.disconnect();
    }
}
