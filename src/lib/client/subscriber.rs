//! Long-poll subscriber with a fixed number of request slots.
//!
//! Each slot is its own task holding its own cursor. A slot re-issues its
//! request as soon as the previous one completes, until it sees the quit
//! message, a handler vetoes it, or the whole subscriber is aborted.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode, header};
use reqwest::{Client, Url};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::{ClientError, MessageStore, ReceivedMessage};
use crate::core::{MessageId, TraversalOrder};
use crate::transport::{conditional_headers, id_from_response};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
/// Consecutive failures beyond this no longer lengthen the backoff.
const MAX_BACKOFF_STEPS: u32 = 8;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: String,
    /// Number of long-poll requests kept in flight.
    pub concurrency: usize,
    /// Per-request timeout. Should exceed the server poll timeout.
    pub timeout: Duration,
    /// A slot that receives this body stops re-issuing.
    pub quit_message: Option<String>,
    /// Base pause before retrying after a failure, `404` included.
    pub retry_backoff: Duration,
    /// Sent as the `order` query parameter when set.
    pub order: Option<TraversalOrder>,
}

impl SubscriberConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            concurrency: 1,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            quit_message: None,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            order: None,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn quit_message(mut self, quit_message: impl Into<String>) -> Self {
        self.quit_message = Some(quit_message.into());
        self
    }

    pub fn retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn order(mut self, order: TraversalOrder) -> Self {
        self.order = Some(order);
        self
    }
}

type MessageHandler = Arc<dyn Fn(&ReceivedMessage) -> bool + Send + Sync>;
type FailureHandler = Arc<dyn Fn(&ClientError) -> bool + Send + Sync>;

struct Shared {
    url: Url,
    client: Client,
    config: SubscriberConfig,
    messages: Mutex<MessageStore>,
    errors: Mutex<Vec<String>>,
}

/// What one slot task needs: the shared state plus the handlers.
struct Slot {
    shared: Arc<Shared>,
    on_message: Option<MessageHandler>,
    on_failure: Option<FailureHandler>,
}

enum PollResult {
    Message(ReceivedMessage),
    NotModified,
}

pub struct Subscriber {
    shared: Arc<Shared>,
    on_message: Option<MessageHandler>,
    on_failure: Option<FailureHandler>,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Result<Self, ClientError> {
        let mut url =
            Url::parse(&config.url).map_err(|_| ClientError::InvalidUrl(config.url.clone()))?;
        if let Some(order) = config.order {
            let order = match order {
                TraversalOrder::Fifo => "fifo",
                TraversalOrder::Filo => "filo",
            };
            url.query_pairs_mut().append_pair("order", order);
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                url,
                client,
                config,
                messages: Mutex::new(MessageStore::keyed()),
                errors: Mutex::new(Vec::new()),
            }),
            on_message: None,
            on_failure: None,
        })
    }

    /// Called for every delivered message after it is stored. Returning
    /// `false` stops the slot that received it.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ReceivedMessage) -> bool + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Called for every failed request after it is recorded. Returning
    /// `false` stops the slot that issued it.
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ClientError) -> bool + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(handler));
        self
    }

    /// Starts every slot.
    pub fn run(&self) -> SubscriberHandle {
        #[cfg(feature = "tracing")]
        info!(
            url = %self.shared.url,
            concurrency = self.shared.config.concurrency,
            "Subscriber started"
        );
        let slot = Arc::new(Slot {
            shared: self.shared.clone(),
            on_message: self.on_message.clone(),
            on_failure: self.on_failure.clone(),
        });
        let tasks = (0..self.shared.config.concurrency)
            .map(|index| tokio::spawn(run_slot(slot.clone(), index)))
            .collect();
        SubscriberHandle { tasks }
    }

    /// Everything received so far, one entry per identity.
    pub async fn messages(&self) -> MessageStore {
        self.shared.messages.lock().await.clone()
    }

    pub async fn errors(&self) -> Vec<String> {
        self.shared.errors.lock().await.clone()
    }
}

/// Running slots of a [`Subscriber`].
pub struct SubscriberHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriberHandle {
    /// Waits until every slot has stopped on its own.
    pub async fn wait(self) {
        futures::future::join_all(self.tasks).await;
    }

    /// Waits at most `timeout` for the slots to stop. Returns `false` on timeout.
    pub async fn wait_for(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Cancels every slot, including its in-flight request.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

async fn run_slot(slot: Arc<Slot>, index: usize) {
    let mut last_seen: Option<MessageId> = None;
    let mut consecutive_errors = 0u32;

    loop {
        match slot.poll_once(last_seen).await {
            Ok(PollResult::Message(message)) => {
                consecutive_errors = 0;
                if message.id.is_some() {
                    last_seen = message.id;
                }
                if !slot.deliver(message).await {
                    #[cfg(feature = "tracing")]
                    debug!(slot = index, "Subscriber slot finished");
                    return;
                }
            }
            Ok(PollResult::NotModified) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors = (consecutive_errors + 1).min(MAX_BACKOFF_STEPS);
                // The cursor names a message that is gone (expired, or its
                // channel deleted); resume from the oldest retained one.
                if e.is_not_found() {
                    last_seen = None;
                }
                #[cfg(feature = "tracing")]
                warn!(slot = index, error = %e, consecutive_errors, "Subscriber request failed");
                if !slot.fail(e).await {
                    return;
                }
                tokio::time::sleep(slot.shared.config.retry_backoff * consecutive_errors).await;
            }
        }
    }
}

impl Slot {
    async fn poll_once(&self, last_seen: Option<MessageId>) -> Result<PollResult, ClientError> {
        let mut request = self.shared.client.get(self.shared.url.clone());
        if let Some(id) = last_seen {
            let mut headers = HeaderMap::new();
            headers.extend(conditional_headers(id));
            request = request.headers(headers);
        }
        let response = request.send().await.map_err(ClientError::from_reqwest)?;

        match response.status() {
            StatusCode::OK => {
                let id = id_from_response(response.headers())?;
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await.map_err(ClientError::from_reqwest)?;
                Ok(PollResult::Message(ReceivedMessage {
                    id,
                    body,
                    content_type,
                    times_seen: 1,
                }))
            }
            StatusCode::NOT_MODIFIED => Ok(PollResult::NotModified),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::Status { status, body })
            }
        }
    }

    /// Stores the message; `false` means the slot should stop.
    async fn deliver(&self, message: ReceivedMessage) -> bool {
        self.shared.messages.lock().await.push(message.clone());
        if self.shared.config.quit_message.as_deref() == Some(&*message.text()) {
            return false;
        }
        match &self.on_message {
            Some(handler) => handler(&message),
            None => true,
        }
    }

    /// Records the failure; `false` means the slot should stop.
    async fn fail(&self, error: ClientError) -> bool {
        self.shared.errors.lock().await.push(error.to_string());
        match &self.on_failure {
            Some(handler) => handler(&error),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_is_rejected() {
        let err = Subscriber::new(SubscriberConfig::new("not a url")).err().unwrap();
        assert!(matches!(err, ClientError::InvalidUrl(ref url) if url == "not a url"));
    }

    #[test]
    fn order_lands_in_the_query() {
        let subscriber = Subscriber::new(
            SubscriberConfig::new("http://127.0.0.1:1/ch").order(TraversalOrder::Filo),
        )
        .unwrap();
        assert_eq!(subscriber.shared.url.as_str(), "http://127.0.0.1:1/ch?order=filo");
    }

    #[tokio::test]
    async fn unreachable_server_is_recorded_and_can_be_vetoed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let subscriber = Subscriber::new(
            SubscriberConfig::new(format!("http://{addr}/ch"))
                .concurrency(2)
                .retry_backoff(Duration::from_millis(10)),
        )
        .unwrap()
        .on_failure(|_| false);

        let handle = subscriber.run();
        assert!(handle.wait_for(Duration::from_secs(5)).await);
        let errors = subscriber.errors().await;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("HTTP request error"));
    }

    #[tokio::test]
    async fn abort_stops_every_in_flight_slot() {
        // Bound but never accepting, so every request stays in flight.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let subscriber =
            Subscriber::new(SubscriberConfig::new(format!("http://{addr}/ch")).concurrency(3))
                .unwrap();
        let handle = subscriber.run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(subscriber.errors().await.is_empty());
        drop(listener);
    }
}
