use std::sync::Arc;
use std::time::Duration;

use axum::http::{StatusCode, header};
use bytes::Bytes;
use futures::future::join_all;
use reqwest::{Client, Url};
use tokio::sync::Mutex;

use crate::client::{ClientError, MessageStore, ReceivedMessage};
use crate::core::{DEFAULT_CONTENT_TYPE, PublishReceipt};
use crate::transport::MESSAGE_TTL_HEADER;

#[cfg(feature = "tracing")]
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Posts messages to one channel URL and keeps an echo of every confirmed post.
#[derive(Clone)]
pub struct Publisher {
    url: Url,
    client: Client,
    ttl: Option<Duration>,
    messages: Arc<Mutex<MessageStore>>,
}

impl Publisher {
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let url = Url::parse(url).map_err(|_| ClientError::InvalidUrl(url.to_string()))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url,
            client,
            ttl: None,
            messages: Arc::new(Mutex::new(MessageStore::sequential())),
        })
    }

    /// Ttl sent with every post, rounded up to whole seconds.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Posts one message. Only a confirmed post is recorded.
    pub async fn post(
        &self,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<PublishReceipt, ClientError> {
        let body = body.into();
        let mut request = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, content_type)
            .body(body.clone());
        if let Some(ttl) = self.ttl {
            request = request.header(MESSAGE_TTL_HEADER, ttl_header_secs(ttl));
        }

        let response = request.send().await.map_err(ClientError::from_reqwest)?;
        let status = response.status();
        if status != StatusCode::ACCEPTED && status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        let receipt: PublishReceipt = response.json().await.map_err(ClientError::from_reqwest)?;

        #[cfg(feature = "tracing")]
        debug!(url = %self.url, id = %receipt.id, "Message posted");

        self.messages.lock().await.push(
            ReceivedMessage::new(body)
                .with_id(receipt.id)
                .with_content_type(content_type),
        );
        Ok(receipt)
    }

    /// Posts `body` with the default content type.
    pub async fn post_text(&self, body: impl Into<Bytes>) -> Result<PublishReceipt, ClientError> {
        self.post(body, DEFAULT_CONTENT_TYPE).await
    }

    /// Posts each body in turn, stopping at the first failure. Returns how many were posted.
    pub async fn post_many<I, B>(&self, bodies: I, content_type: &str) -> Result<usize, ClientError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut posted = 0;
        for body in bodies {
            self.post(body, content_type).await?;
            posted += 1;
        }
        Ok(posted)
    }

    /// Posts every body at once. Returns how many were posted, or the first failure.
    pub async fn post_concurrent<I, B>(
        &self,
        bodies: I,
        content_type: &str,
    ) -> Result<usize, ClientError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let posts = bodies.into_iter().map(|body| self.post(body, content_type));
        let results = join_all(posts).await;
        let posted = results.iter().filter(|result| result.is_ok()).count();
        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => Ok(posted),
        }
    }

    /// Every confirmed post, in confirmation order.
    pub async fn messages(&self) -> MessageStore {
        self.messages.lock().await.clone()
    }
}

/// The wire carries whole seconds and `0` means "never expires", so any
/// fraction rounds up.
fn ttl_header_secs(ttl: Duration) -> u64 {
    ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)
}
