//! Ordered, TTL-bounded storage for a single channel.
//!
//! A `ChannelLog` is the single source of truth for ordering and expiry of
//! one channel's messages. Messages are kept in a `BTreeMap` keyed by
//! [`MessageId`], so iteration order is identity order and both traversal
//! directions come from the same comparator.
//!
//! The log is not synchronized; storage engines wrap each log in its own
//! lock so appends to one channel are linearized without blocking others.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{
    ChannelInfo, Cursor, FetchOutcome, Message, MessageId, PublishRequest, TraversalOrder,
};

/// Retention applied on top of per-message ttl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Oldest messages are trimmed once a channel holds more than this.
    pub max_messages: Option<usize>,
    /// Ttl for publishes that carry none.
    pub default_ttl: Option<Duration>,
}

#[derive(Debug)]
pub struct ChannelLog {
    channel: String,
    messages: BTreeMap<MessageId, Message>,
    policy: RetentionPolicy,
    last_issued: Option<MessageId>,
    last_published_at: Option<DateTime<Utc>>,
    deleted: bool,
}

impl ChannelLog {
    pub fn new(channel: impl Into<String>, policy: RetentionPolicy) -> Self {
        Self {
            channel: channel.into(),
            messages: BTreeMap::new(),
            policy,
            last_issued: None,
            last_published_at: None,
            deleted: false,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Set once the log has been deleted; a deleted log accepts no appends.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first_key_value().map(|(_, msg)| msg)
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last_key_value().map(|(_, msg)| msg)
    }

    /// Appends a message and assigns its tag.
    ///
    /// The tag is the next unused tag for `(channel, timestamp)`, starting at
    /// `0`. Without a caller-supplied timestamp the current second is used,
    /// clamped so it never goes below the newest identity already issued.
    pub fn append(&mut self, request: PublishRequest, now: DateTime<Utc>) -> Message {
        self.evict_expired(now);

        let timestamp = match request.timestamp {
            Some(timestamp) => timestamp,
            None => match self.last_issued {
                Some(last) if last.timestamp > now.timestamp() => last.timestamp,
                _ => now.timestamp(),
            },
        };
        let id = MessageId::new(timestamp, self.next_tag(timestamp));
        let ttl = request
            .effective_ttl()
            .or(self.policy.default_ttl.filter(|ttl| !ttl.is_zero()));

        let message = Message {
            id,
            channel: self.channel.clone(),
            payload: request.payload,
            content_type: request.content_type,
            ttl,
            created_at: now,
        };
        self.messages.insert(id, message.clone());
        if self.last_issued.is_none_or(|last| id > last) {
            self.last_issued = Some(id);
        }
        self.last_published_at = Some(now);
        self.trim_to_capacity();
        message
    }

    fn next_tag(&self, timestamp: i64) -> u32 {
        let issued = self
            .last_issued
            .filter(|last| last.timestamp == timestamp)
            .map(|last| last.tag);
        let retained = self
            .messages
            .range(MessageId::first_at(timestamp)..=MessageId::last_at(timestamp))
            .next_back()
            .map(|(id, _)| id.tag);
        match issued.max(retained) {
            Some(tag) => tag.saturating_add(1),
            None => 0,
        }
    }

    fn trim_to_capacity(&mut self) {
        if let Some(max) = self.policy.max_messages {
            while self.messages.len() > max {
                self.messages.pop_first();
            }
        }
    }

    /// Finds the message to deliver for `cursor`. Callers evict first.
    ///
    /// - an empty log is `NotFound`
    /// - `Start` yields the oldest retained message in either order
    /// - `At(id)` yields the smallest identity greater than `id`, or
    ///   `NotReady` when `id` is at or past the newest message
    /// - under `Filo` the cursor must still name a retained message unless it
    ///   lies past the newest one; otherwise the result is `NotFound`
    /// - `End` is `NotReady` whenever the log has messages
    pub fn find(&self, cursor: Cursor, order: TraversalOrder) -> FetchOutcome {
        let (Some(oldest), Some(newest)) = (self.oldest(), self.newest()) else {
            return FetchOutcome::NotFound;
        };
        match cursor {
            Cursor::Start => FetchOutcome::Delivered(oldest.clone()),
            Cursor::End => FetchOutcome::NotReady,
            Cursor::At(id) => {
                if order == TraversalOrder::Filo
                    && id < newest.id
                    && !self.messages.contains_key(&id)
                {
                    return FetchOutcome::NotFound;
                }
                match self.messages.range((Excluded(id), Unbounded)).next() {
                    Some((_, msg)) => FetchOutcome::Delivered(msg.clone()),
                    None => FetchOutcome::NotReady,
                }
            }
        }
    }

    /// Evicts expired messages, then finds.
    pub fn fetch(
        &mut self,
        cursor: Cursor,
        order: TraversalOrder,
        now: DateTime<Utc>,
    ) -> FetchOutcome {
        self.evict_expired(now);
        self.find(cursor, order)
    }

    /// Removes every message whose ttl has elapsed at `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, msg| !msg.is_expired(now));
        before - self.messages.len()
    }

    /// Drops every message and marks the log deleted.
    pub fn delete(&mut self) -> usize {
        let removed = self.messages.len();
        self.messages.clear();
        self.deleted = true;
        removed
    }

    /// All retained messages, oldest first for `Fifo` and newest first for `Filo`.
    pub fn snapshot(&self, order: TraversalOrder) -> Vec<Message> {
        match order {
            TraversalOrder::Fifo => self.messages.values().cloned().collect(),
            TraversalOrder::Filo => self.messages.values().rev().cloned().collect(),
        }
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            messages: self.messages.len(),
            last_id: self.last_issued,
            last_published_at: self.last_published_at.map(|at| at.timestamp()),
            subscribers: 0,
        }
    }
}
