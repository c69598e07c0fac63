//! The pub/sub transport that the protocol layer is built on.
//!
//! Only the parts of MQTT v5 that commands and chunking touch are modelled here;
//! packet encoding and connection management belong to whatever implements [`PubSubClient`].

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::chunking::SplitError;

pub use filter::{Filter, FilterParseError};

mod filter;
pub mod loopback;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// The properties of a PUBLISH packet that survive chunking and command exchanges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    /// In seconds.
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
    pub subscription_identifiers: Vec<usize>,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
    pub properties: PublishProperties,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Publish {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Return the value of the first user property named `key`.
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.properties
            .user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Estimate the encoded size of this packet in bytes.
    ///
    /// Variable byte integers are counted at their maximum width, so this never underestimates.
    pub fn packet_size(&self) -> usize {
        // Fixed header (1 + up to 4 for remaining length), topic, packet ID, property length.
        let mut size = 5 + 2 + self.topic.len() + 2 + 4;

        let props = &self.properties;

        size += props.payload_format_indicator.map_or(0, |_| 2);
        size += props.message_expiry_interval.map_or(0, |_| 5);
        size += props.topic_alias.map_or(0, |_| 3);
        size += props
            .response_topic
            .as_ref()
            .map_or(0, |topic| 3 + topic.len());
        size += props
            .correlation_data
            .as_ref()
            .map_or(0, |data| 3 + data.len());
        size += props
            .content_type
            .as_ref()
            .map_or(0, |content_type| 3 + content_type.len());
        size += props.subscription_identifiers.len() * 5;
        size += props
            .user_properties
            .iter()
            .map(|(k, v)| 5 + k.len() + v.len())
            .sum::<usize>();

        size + self.payload.len()
    }
}

/// A PUBACK/SUBACK/UNSUBACK reason code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const NO_MATCHING_SUBSCRIBERS: Self = Self(0x10);
    pub const NO_SUBSCRIPTION_EXISTED: Self = Self(0x11);
    pub const UNSPECIFIED_ERROR: Self = Self(0x80);
    pub const TOPIC_FILTER_INVALID: Self = Self(0x8F);
    pub const PACKET_TOO_LARGE: Self = Self(0x95);

    pub fn is_success(&self) -> bool {
        self.0 < 0x80
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("client is disconnected")]
    Disconnected,

    #[error("operation rejected with reason code {0:#04X}")]
    Rejected(u8),

    #[error("packet of {size} bytes exceeds the maximum packet size of {max} bytes")]
    PacketTooLarge { size: usize, max: u32 },

    #[error("invalid topic filter")]
    InvalidFilter(#[from] FilterParseError),

    #[error("error splitting message into chunks")]
    Chunking(#[from] SplitError),
}

type AckFn = Box<dyn FnOnce() + Send>;

struct PendingAck(Mutex<Option<AckFn>>);

impl PendingAck {
    fn take(&self) -> Option<AckFn> {
        self.0.lock().ok().and_then(|mut ack| ack.take())
    }

    fn is_acked(&self) -> bool {
        self.0.lock().map_or(true, |ack| ack.is_none())
    }
}

/// Acknowledges one or more received messages.
///
/// Cloning a token shares it; acknowledging any clone acknowledges them all, and every
/// underlying message is acknowledged at most once.
#[derive(Clone)]
pub struct AckToken {
    acks: Arc<[Arc<PendingAck>]>,
}

impl AckToken {
    pub fn new(ack: impl FnOnce() + Send + 'static) -> Self {
        AckToken {
            acks: Arc::from(vec![Arc::new(PendingAck(Mutex::new(Some(Box::new(ack)))))]),
        }
    }

    /// A token for a message that needs no acknowledgement (QoS 0).
    pub fn noop() -> Self {
        AckToken {
            acks: Arc::from(Vec::new()),
        }
    }

    /// Join several tokens so that one `ack()` acknowledges every one of them.
    pub fn composite(tokens: impl IntoIterator<Item = AckToken>) -> Self {
        AckToken {
            acks: tokens
                .into_iter()
                .flat_map(|token| token.acks.iter().cloned().collect::<Vec<_>>())
                .collect(),
        }
    }

    pub fn ack(&self) {
        for pending in self.acks.iter() {
            if let Some(ack) = pending.take() {
                ack();
            }
        }
    }

    pub fn is_acked(&self) -> bool {
        self.acks.iter().all(|pending| pending.is_acked())
    }
}

impl Debug for AckToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckToken")
            .field("messages", &self.acks.len())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// A received message along with the means to acknowledge it.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub publish: Publish,
    pub ack: AckToken,
}

/// Inbound messages matching the filter a receiver was created with.
#[derive(Debug)]
pub struct Receiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Receiver {
    pub fn channel() -> (mpsc::UnboundedSender<Delivery>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Receiver { rx })
    }

    /// Returns `None` once the client has shut down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// The capabilities of an MQTT v5 client that commands and chunking need.
///
/// Clones must refer to the same underlying connection.
pub trait PubSubClient: Clone + Send + Sync + 'static {
    /// A stable identifier for this client.
    fn client_id(&self) -> &str;

    /// The maximum packet size negotiated with the server, if there is one.
    fn max_packet_size(&self) -> Option<u32>;

    fn publish(&self, publish: Publish)
        -> impl Future<Output = Result<ReasonCode, ClientError>> + Send;

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<ReasonCode, ClientError>> + Send;

    fn unsubscribe(&self, filter: &str)
        -> impl Future<Output = Result<ReasonCode, ClientError>> + Send;

    /// Route inbound messages whose topic matches `filter` to a new [`Receiver`].
    ///
    /// This does not subscribe; messages only arrive for subscriptions made with
    /// [`subscribe()`][Self::subscribe].
    /// Messages that no receiver matches are acknowledged and dropped.
    fn receiver(&self, filter: &str) -> Result<Receiver, ClientError>;

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
