use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::error::BrokerError;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Identity of a message within one channel.
///
/// Ordered by `timestamp` first and `tag` second, which is also the order of
/// the channel log. On the wire it is written as `"<timestamp>:<tag>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub timestamp: i64,
    pub tag: u32,
}

impl MessageId {
    pub const fn new(timestamp: i64, tag: u32) -> Self {
        Self { timestamp, tag }
    }

    /// First identity that can exist at `timestamp`.
    pub const fn first_at(timestamp: i64) -> Self {
        Self { timestamp, tag: 0 }
    }

    /// Last identity that can exist at `timestamp`.
    pub const fn last_at(timestamp: i64) -> Self {
        Self { timestamp, tag: u32::MAX }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message id {0:?}")]
pub struct ParseIdError(pub String);

impl FromStr for MessageId {
    type Err = ParseIdError;

    /// Accepts `"<timestamp>:<tag>"`, `"<timestamp>:"` and `"<timestamp>"`;
    /// a missing tag means tag `0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (time, tag) = match s.split_once(':') {
            Some((time, tag)) => (time, tag),
            None => (s, ""),
        };
        let timestamp = time
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseIdError(s.to_string()))?;
        let tag = match tag.trim() {
            "" => 0,
            tag => tag.parse::<u32>().map_err(|_| ParseIdError(s.to_string()))?,
        };
        Ok(Self { timestamp, tag })
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A published message. Immutable once it has been appended to a channel log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub payload: Bytes,
    pub content_type: String,
    pub ttl: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    /// A message is expired once `now - created_at >= ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// Starting point of a traversal, held by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cursor {
    /// Beginning of time.
    #[default]
    Start,
    At(MessageId),
    /// Only messages newer than the newest one at the time of the query.
    End,
}

impl Cursor {
    /// Parses a consumer-supplied message id. An empty string is [`Cursor::Start`].
    pub fn parse(raw: &str) -> Result<Self, ParseIdError> {
        if raw.trim().is_empty() {
            return Ok(Cursor::Start);
        }
        raw.parse().map(Cursor::At)
    }
}

impl From<MessageId> for Cursor {
    fn from(id: MessageId) -> Self {
        Cursor::At(id)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => f.write_str("start"),
            Cursor::At(id) => id.fmt(f),
            Cursor::End => f.write_str("end"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalOrder {
    Fifo,
    #[default]
    Filo,
}

impl FromStr for TraversalOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(TraversalOrder::Fifo),
            "filo" => Ok(TraversalOrder::Filo),
            other => Err(format!("unknown traversal order {other:?}")),
        }
    }
}

impl fmt::Display for TraversalOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversalOrder::Fifo => f.write_str("FIFO"),
            TraversalOrder::Filo => f.write_str("FILO"),
        }
    }
}

/// Result of a fetch. `NotFound` and `NotReady` are ordinary outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Delivered(Message),
    NotFound,
    NotReady,
}

impl FetchOutcome {
    pub fn message(&self) -> Option<&Message> {
        match self {
            FetchOutcome::Delivered(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            FetchOutcome::Delivered(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchOutcome::NotFound)
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, FetchOutcome::NotReady)
    }
}

/// A publish, with every field a caller may leave out made optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub channel: String,
    pub payload: Bytes,
    pub content_type: String,
    /// Seconds since the epoch; the broker uses the current time when unset.
    pub timestamp: Option<i64>,
    /// `None` or zero means the message never expires on its own.
    pub ttl: Option<Duration>,
}

impl PublishRequest {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            timestamp: None,
            ttl: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl_secs(self, secs: u64) -> Self {
        self.ttl(Duration::from_secs(secs))
    }

    /// The content type is written next to the identity in `field:field` form
    /// by storage engines, so it may not contain a colon.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.content_type.contains(':') {
            return Err(BrokerError::InvalidContentType(self.content_type.clone()));
        }
        Ok(())
    }

    /// Effective ttl: zero is folded into "no expiry".
    pub fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// Metadata the broker keeps per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub messages: usize,
    pub last_id: Option<MessageId>,
    /// Seconds since the epoch of the last publish.
    pub last_published_at: Option<i64>,
    /// Long-poll requests currently parked on the channel.
    pub subscribers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub id: MessageId,
    pub channel: ChannelInfo,
}
