//! Core types for broker messages.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Broker-unique identifier for a message, stable for its lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Returns the raw numeric identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Name of a queue a message can be enqueued on.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(pub String);

impl QueueName {
    /// Creates a queue name from an existing string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the queue name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// AMQP delivery-mode values carried in basic content headers.
pub struct DeliveryMode;

impl DeliveryMode {
    /// The message may be lost if the broker restarts.
    pub const NON_PERSISTENT: u8 = 1;
    /// The message must survive a broker restart.
    pub const PERSISTENT: u8 = 2;
}

/// AMQP class id of the basic content class.
pub const BASIC_CLASS_ID: u16 = 60;

/// Property bag of the AMQP basic content class.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl BasicProperties {
    /// Properties with only the delivery mode set.
    pub fn with_delivery_mode(mode: u8) -> Self {
        Self {
            delivery_mode: Some(mode),
            ..Self::default()
        }
    }
}

/// Header properties, tagged by the schema they were decoded with.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum HeaderProperties {
    /// Basic content class properties.
    Basic(BasicProperties),
    /// Properties of a class the broker does not decode.
    Opaque { class_id: u16, raw: Vec<u8> },
}

impl HeaderProperties {
    /// Delivery mode, if the schema has one and it is set.
    pub fn delivery_mode(&self) -> Option<u8> {
        match self {
            HeaderProperties::Basic(props) => props.delivery_mode,
            HeaderProperties::Opaque { .. } => None,
        }
    }
}

impl Default for HeaderProperties {
    fn default() -> Self {
        HeaderProperties::Basic(BasicProperties::default())
    }
}

/// Content header of a message: total body size and properties.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContentHeader {
    pub class_id: u16,
    pub weight: u16,
    pub body_size: u64,
    pub properties: HeaderProperties,
}

impl ContentHeader {
    /// Creates a basic-class header.
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: BASIC_CLASS_ID,
            weight: 0,
            body_size,
            properties: HeaderProperties::Basic(properties),
        }
    }
}

/// Routing information supplied when the message was published.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PublishDescriptor {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

impl PublishDescriptor {
    /// Descriptor for a non-mandatory, non-immediate publish.
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
        }
    }
}

/// One ordered fragment of a message body.
///
/// A chunk does not know its own position; the index under which it was
/// stored identifies it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentChunk {
    payload: Bytes,
}

impl ContentChunk {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<&'static [u8]> for ContentChunk {
    fn from(payload: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(payload))
    }
}

impl From<Vec<u8>> for ContentChunk {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

/// The persisted description of a message's shape.
///
/// Written once, when reception of the message is complete.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageMetaData {
    pub header: ContentHeader,
    pub publish: PublishDescriptor,
    pub chunk_count: usize,
}

impl MessageMetaData {
    pub fn new(header: ContentHeader, publish: PublishDescriptor, chunk_count: usize) -> Self {
        Self {
            header,
            publish,
            chunk_count,
        }
    }
}
