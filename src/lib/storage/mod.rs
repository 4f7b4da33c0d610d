pub mod memory;
#[cfg(feature = "storage")]
pub mod sqlite;

use async_trait::async_trait;
use crate::core::{ChannelInfo, Cursor, FetchOutcome, Message, PublishRequest, TraversalOrder};

/// The keyed storage engine behind the broker.
///
/// Every operation is atomic with respect to one channel: two appends to the
/// same channel are linearized and never receive the same identity, and a
/// query never observes a half-appended message. Expired messages are never
/// returned by `query`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Appends a validated message, assigning its identity.
    async fn append(&self, request: PublishRequest) -> anyhow::Result<(Message, ChannelInfo)>;
    async fn query(
        &self,
        channel: &str,
        cursor: Cursor,
        order: TraversalOrder,
    ) -> anyhow::Result<FetchOutcome>;
    /// Removes a channel and every message in it. Returns the number of messages removed.
    async fn purge(&self, channel: &str) -> anyhow::Result<usize>;
    async fn channel_info(&self, channel: &str) -> anyhow::Result<Option<ChannelInfo>>;
    async fn snapshot(&self, channel: &str, order: TraversalOrder) -> anyhow::Result<Vec<Message>>;
    /// Evicts expired messages across all channels. Returns the number evicted.
    async fn evict_expired(&self) -> anyhow::Result<usize>;
}
