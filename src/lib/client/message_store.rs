use std::borrow::Cow;
use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;

use crate::core::MessageId;

/// A message as seen from the client side of the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Rebuilt from the response validators; `None` for local echoes that
    /// were never confirmed with one.
    pub id: Option<MessageId>,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub times_seen: usize,
}

impl ReceivedMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            body: body.into(),
            content_type: None,
            times_seen: 1,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Mismatch {
    #[error("Message count doesn't match. ({mine}, {theirs})")]
    Count { mine: usize, theirs: usize },
    #[error("Message {index} doesn't match. (|{mine}|, |{theirs}|)")]
    Body { index: usize, mine: usize, theirs: usize },
}

/// Messages collected by a client, in arrival order.
///
/// A keyed store merges repeat deliveries of the same identity into one
/// entry and counts them; a sequential store keeps every push.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<ReceivedMessage>,
    index: Option<HashMap<MessageId, usize>>,
}

impl MessageStore {
    pub fn keyed() -> Self {
        Self {
            messages: Vec::new(),
            index: Some(HashMap::new()),
        }
    }

    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn is_keyed(&self) -> bool {
        self.index.is_some()
    }

    /// Stores `message` and returns how many times its identity has now been seen.
    pub fn push(&mut self, message: ReceivedMessage) -> usize {
        let (Some(index), Some(id)) = (self.index.as_mut(), message.id) else {
            self.messages.push(message);
            return 1;
        };
        match index.get(&id) {
            Some(&at) => {
                let seen = &mut self.messages[at];
                seen.times_seen += 1;
                seen.times_seen
            }
            None => {
                index.insert(id, self.messages.len());
                self.messages.push(message);
                1
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&ReceivedMessage> {
        match &self.index {
            Some(index) => index.get(&id).map(|&at| &self.messages[at]),
            None => self.messages.iter().find(|msg| msg.id == Some(id)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceivedMessage> {
        self.messages.iter()
    }

    /// Message bodies as text, in store order.
    pub fn texts(&self) -> Vec<String> {
        self.messages.iter().map(|msg| msg.text().into_owned()).collect()
    }

    /// Compares bodies position by position.
    pub fn matches(&self, other: &MessageStore) -> Result<(), Mismatch> {
        if self.len() != other.len() {
            return Err(Mismatch::Count {
                mine: self.len(),
                theirs: other.len(),
            });
        }
        for (index, (mine, theirs)) in self.messages.iter().zip(&other.messages).enumerate() {
            if mine.body != theirs.body {
                return Err(Mismatch::Body {
                    index,
                    mine: mine.body.len(),
                    theirs: theirs.body.len(),
                });
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MessageStore {
    type Item = &'a ReceivedMessage;
    type IntoIter = std::slice::Iter<'a, ReceivedMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
