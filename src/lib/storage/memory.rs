use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::core::{
    ChannelInfo, ChannelLog, Cursor, FetchOutcome, Message, PublishRequest, RetentionPolicy,
    TraversalOrder,
};
use crate::storage::Storage;

type SharedLog = Arc<Mutex<ChannelLog>>;

/// Process-local storage: one lock for the channel map, one lock per channel log.
///
/// The map lock is only held to look up or insert a log, so appends to
/// different channels never wait on each other.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    channels: RwLock<HashMap<String, SharedLog>>,
    policy: RetentionPolicy,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RetentionPolicy) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Number of channel logs currently held, empty ones included.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    async fn log(&self, channel: &str) -> Option<SharedLog> {
        self.channels.read().await.get(channel).cloned()
    }

    async fn log_or_create(&self, channel: &str) -> SharedLog {
        if let Some(log) = self.log(channel).await {
            return log;
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelLog::new(channel, self.policy))))
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append(&self, request: PublishRequest) -> anyhow::Result<(Message, ChannelInfo)> {
        loop {
            let log = self.log_or_create(&request.channel).await;
            let mut log = log.lock().await;
            // Lost a race with purge or garbage collection; the map no longer
            // points at this log.
            if log.is_deleted() {
                continue;
            }
            let message = log.append(request, Utc::now());
            return Ok((message, log.info()));
        }
    }

    async fn query(
        &self,
        channel: &str,
        cursor: Cursor,
        order: TraversalOrder,
    ) -> anyhow::Result<FetchOutcome> {
        let Some(log) = self.log(channel).await else {
            return Ok(FetchOutcome::NotFound);
        };
        let mut log = log.lock().await;
        Ok(log.fetch(cursor, order, Utc::now()))
    }

    async fn purge(&self, channel: &str) -> anyhow::Result<usize> {
        let removed = self.channels.write().await.remove(channel);
        match removed {
            Some(log) => Ok(log.lock().await.delete()),
            None => Ok(0),
        }
    }

    async fn channel_info(&self, channel: &str) -> anyhow::Result<Option<ChannelInfo>> {
        let Some(log) = self.log(channel).await else {
            return Ok(None);
        };
        let mut log = log.lock().await;
        log.evict_expired(Utc::now());
        Ok(Some(log.info()))
    }

    async fn snapshot(&self, channel: &str, order: TraversalOrder) -> anyhow::Result<Vec<Message>> {
        let Some(log) = self.log(channel).await else {
            return Ok(Vec::new());
        };
        let mut log = log.lock().await;
        log.evict_expired(Utc::now());
        Ok(log.snapshot(order))
    }

    async fn evict_expired(&self) -> anyhow::Result<usize> {
        let logs: Vec<(String, SharedLog)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(name, log)| (name.clone(), log.clone()))
            .collect();

        let now = Utc::now();
        let mut evicted = 0;
        let mut empty = Vec::new();
        for (name, log) in logs {
            let mut log = log.lock().await;
            evicted += log.evict_expired(now);
            if log.is_empty() {
                empty.push(name);
            }
        }

        if !empty.is_empty() {
            let mut channels = self.channels.write().await;
            for name in empty {
                let Some(log) = channels.get(&name).cloned() else {
                    continue;
                };
                let mut log = log.lock().await;
                if log.is_empty() {
                    log.delete();
                    channels.remove(&name);
                }
            }
        }
        Ok(evicted)
    }
}
