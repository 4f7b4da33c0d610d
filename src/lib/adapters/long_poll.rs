use std::time::Duration;

use tokio::time::Instant;

use crate::core::{Broker, BrokerError, Cursor, FetchOutcome, Message, TraversalOrder};
use crate::storage::Storage;

#[cfg(feature = "tracing")]
use tracing::trace;

/// How a parked request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered(Message),
    NotFound,
    /// Nothing new arrived before the deadline; the consumer retries with the same cursor.
    TimedOut,
}

/// Fetches from `cursor`, parking until a message is published or `timeout` elapses.
///
/// `Cursor::End` is pinned to the newest identity issued so far. The watch
/// receiver is taken before the first fetch, so a publish landing between a
/// `NotReady` fetch and the wait still wakes this request. The log is also
/// re-checked every `recheck`.
pub async fn wait_for_message<S: Storage + 'static>(
    broker: &Broker<S>,
    channel: &str,
    cursor: Cursor,
    order: TraversalOrder,
    timeout: Duration,
    recheck: Duration,
) -> Result<PollOutcome, BrokerError> {
    let deadline = Instant::now() + timeout;
    let cursor = match cursor {
        Cursor::End => match broker.channel_info(channel).await? {
            Some(info) => info.last_id.map_or(Cursor::Start, Cursor::At),
            None => Cursor::Start,
        },
        cursor => cursor,
    };
    let mut events = broker.watch(channel).await;

    loop {
        match broker.fetch(channel, cursor, order).await? {
            FetchOutcome::Delivered(message) => return Ok(PollOutcome::Delivered(message)),
            FetchOutcome::NotFound => return Ok(PollOutcome::NotFound),
            FetchOutcome::NotReady => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }
        let wait = recheck.min(deadline - now);

        match tokio::time::timeout(wait, events.changed()).await {
            Ok(Ok(())) => {
                #[cfg(feature = "tracing")]
                trace!(channel, "Parked request woken");
            }
            // The sender went away; register again.
            Ok(Err(_)) => events = broker.watch(channel).await,
            Err(_) => {}
        }
    }
}
