use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::core::{
    BrokerError, ChannelInfo, Cursor, FetchOutcome, Message, MessageId, PublishReceipt,
    PublishRequest, TraversalOrder,
};
use crate::storage::Storage;

#[cfg(feature = "tracing")]
use tracing::{debug, info, instrument, warn};

/// Last thing that happened on a channel, as seen by parked consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Idle,
    Published(MessageId),
    Deleted,
}

/// Channel-addressed broker: owns the storage and wakes parked consumers.
///
/// Consumers that want to wait for a message call [`Broker::watch`] *before*
/// [`Broker::fetch`]; any publish that lands after the fetch then marks the
/// receiver as changed, so a wakeup is never lost.
pub struct Broker<S: Storage + 'static> {
    storage: Arc<S>,
    watchers: RwLock<HashMap<String, watch::Sender<ChannelEvent>>>,
}

impl<S: Storage + 'static> Broker<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            watchers: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(skip(self, request), fields(channel = %request.channel))
    )]
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, BrokerError> {
        request.validate()?;
        let channel = request.channel.clone();
        let (message, mut info) = self.storage.append(request).await?;

        self.notify(&channel, ChannelEvent::Published(message.id)).await;
        info.subscribers = self.subscribers(&channel).await;

        #[cfg(feature = "tracing")]
        debug!(id = %message.id, messages = info.messages, "Message published");

        Ok(PublishReceipt {
            id: message.id,
            channel: info,
        })
    }

    pub async fn fetch(
        &self,
        channel: &str,
        cursor: Cursor,
        order: TraversalOrder,
    ) -> Result<FetchOutcome, BrokerError> {
        Ok(self.storage.query(channel, cursor, order).await?)
    }

    /// Removes the channel. Deleting a channel that does not exist is not an error.
    #[cfg_attr(feature = "tracing", instrument(skip(self)))]
    pub async fn delete(&self, channel: &str) -> Result<usize, BrokerError> {
        let removed = self.storage.purge(channel).await?;
        self.notify(channel, ChannelEvent::Deleted).await;

        #[cfg(feature = "tracing")]
        debug!(removed, "Channel deleted");
        Ok(removed)
    }

    pub async fn channel_info(&self, channel: &str) -> Result<Option<ChannelInfo>, BrokerError> {
        let info = self.storage.channel_info(channel).await?;
        let subscribers = self.subscribers(channel).await;
        Ok(info.map(|info| ChannelInfo { subscribers, ..info }))
    }

    /// Every retained message of a channel, oldest first for FIFO and newest first for FILO.
    pub async fn snapshot(
        &self,
        channel: &str,
        order: TraversalOrder,
    ) -> Result<Vec<Message>, BrokerError> {
        Ok(self.storage.snapshot(channel, order).await?)
    }

    /// Registers interest in a channel. The returned receiver sees every event
    /// raised after this call.
    pub async fn watch(&self, channel: &str) -> watch::Receiver<ChannelEvent> {
        if let Some(sender) = self.watchers.read().await.get(channel) {
            return sender.subscribe();
        }
        let mut watchers = self.watchers.write().await;
        watchers
            .entry(channel.to_string())
            .or_insert_with(|| watch::channel(ChannelEvent::Idle).0)
            .subscribe()
    }

    /// Number of receivers currently parked on the channel.
    pub async fn subscribers(&self, channel: &str) -> usize {
        self.watchers
            .read()
            .await
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    async fn notify(&self, channel: &str, event: ChannelEvent) {
        if let Some(sender) = self.watchers.read().await.get(channel) {
            sender.send_replace(event);
        }
    }

    /// Evicts expired messages and drops watchers nobody listens to any more.
    pub async fn sweep(&self) -> Result<usize, BrokerError> {
        let evicted = self.storage.evict_expired().await?;
        self.watchers
            .write()
            .await
            .retain(|_, sender| sender.receiver_count() > 0);
        Ok(evicted)
    }

    /// Runs [`Broker::sweep`] every `interval` until the handle is aborted.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            #[cfg(feature = "tracing")]
            info!(interval_ms = interval.as_millis() as u64, "Sweeper started");
            loop {
                ticker.tick().await;
                match broker.sweep().await {
                    #[cfg(feature = "tracing")]
                    Ok(evicted) if evicted > 0 => debug!(evicted, "Swept expired messages"),
                    Ok(_) => {}
                    #[cfg(feature = "tracing")]
                    Err(e) => warn!(error = %e, "Sweep failed"),
                    #[cfg(not(feature = "tracing"))]
                    Err(_) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use async_trait::async_trait;

    fn broker() -> Arc<Broker<MemoryStorage>> {
        Arc::new(Broker::new(Arc::new(MemoryStorage::new())))
    }

    #[tokio::test]
    async fn publish_rejects_colon_in_content_type() {
        let broker = broker();
        let err = broker
            .publish(PublishRequest::new("ch", "x").content_type("foo:bar"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(broker.channel_info("ch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_then_fetch_walks_forward() {
        let broker = broker();
        let a = broker.publish(PublishRequest::new("ch", "a").ttl_secs(60)).await.unwrap();
        let b = broker.publish(PublishRequest::new("ch", "b").ttl_secs(60)).await.unwrap();
        assert_eq!(b.channel.messages, 2);

        let first = broker.fetch("ch", Cursor::Start, TraversalOrder::Fifo).await.unwrap();
        assert_eq!(first.message().map(|m| m.id), Some(a.id));
        let second = broker.fetch("ch", a.id.into(), TraversalOrder::Fifo).await.unwrap();
        assert_eq!(second.message().map(|m| m.id), Some(b.id));
        let past_b = broker.fetch("ch", b.id.into(), TraversalOrder::Fifo).await.unwrap();
        assert!(past_b.is_not_ready());
    }

    #[tokio::test]
    async fn watcher_sees_publish_after_fetch() {
        let broker = broker();
        let mut rx = broker.watch("ch").await;
        assert_eq!(broker.subscribers("ch").await, 1);
        let outcome = broker.fetch("ch", Cursor::Start, TraversalOrder::Fifo).await.unwrap();
        assert!(outcome.is_not_found());

        let receipt = broker.publish(PublishRequest::new("ch", "hello")).await.unwrap();
        assert_eq!(receipt.channel.subscribers, 1);
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), ChannelEvent::Published(receipt.id));
    }

    #[tokio::test]
    async fn delete_wakes_watchers_and_is_idempotent() {
        let broker = broker();
        broker.publish(PublishRequest::new("ch", "x")).await.unwrap();
        let mut rx = broker.watch("ch").await;

        assert_eq!(broker.delete("ch").await.unwrap(), 1);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ChannelEvent::Deleted);
        assert_eq!(broker.delete("ch").await.unwrap(), 0);
        let outcome = broker.fetch("ch", Cursor::Start, TraversalOrder::Filo).await.unwrap();
        assert!(outcome.is_not_found());
    }

    #[tokio::test]
    async fn sweep_drops_idle_watchers() {
        let broker = broker();
        let rx = broker.watch("ch").await;
        broker.sweep().await.unwrap();
        assert_eq!(broker.subscribers("ch").await, 1);
        drop(rx);
        broker.sweep().await.unwrap();
        assert_eq!(broker.subscribers("ch").await, 0);
        assert!(broker.watchers.read().await.is_empty());
    }

    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn append(&self, _: PublishRequest) -> anyhow::Result<(Message, ChannelInfo)> {
            anyhow::bail!("disk full")
        }
        async fn query(
            &self,
            _: &str,
            _: Cursor,
            _: TraversalOrder,
        ) -> anyhow::Result<FetchOutcome> {
            anyhow::bail!("disk gone")
        }
        async fn purge(&self, _: &str) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn channel_info(&self, _: &str) -> anyhow::Result<Option<ChannelInfo>> {
            Ok(None)
        }
        async fn snapshot(&self, _: &str, _: TraversalOrder) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn evict_expired(&self) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn storage_failures_surface_as_errors() {
        let broker = Broker::new(Arc::new(BrokenStorage));
        let err = broker.publish(PublishRequest::new("ch", "x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Storage(_)));
        assert!(!err.is_validation());
        assert!(err.to_string().contains("disk full"));
        assert!(broker.fetch("ch", Cursor::Start, TraversalOrder::Fifo).await.is_err());
    }
}
