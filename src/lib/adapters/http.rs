use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::adapters::long_poll::{PollOutcome, wait_for_message};
use crate::core::{
    Broker, BrokerError, Cursor, DEFAULT_CONTENT_TYPE, PublishRequest, TraversalOrder,
};
use crate::storage::Storage;
use crate::transport::{
    MESSAGE_TIMESTAMP_HEADER, MESSAGE_TTL_HEADER, ValidatorError, cursor_from_request,
    validator_headers,
};

#[cfg(feature = "tracing")]
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// How long a GET is held open before answering `304 Not Modified`.
    pub poll_timeout: Duration,
    /// Upper bound between re-checks of a parked request.
    pub recheck_interval: Duration,
    /// Order used when a GET carries no `order` parameter.
    pub default_order: TraversalOrder,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            recheck_interval: Duration::from_secs(1),
            default_order: TraversalOrder::Fifo,
        }
    }
}

struct HttpState<S: Storage + 'static> {
    broker: Arc<Broker<S>>,
    config: HttpConfig,
}

/// The long-poll delivery server.
///
/// `GET /{channel}` fetches (parking when nothing is ready), `POST /{channel}`
/// publishes, `DELETE /{channel}` deletes and `GET /{channel}/info` reports
/// channel metadata.
pub struct HttpTransport<S: Storage + 'static> {
    state: Arc<HttpState<S>>,
}

impl<S: Storage + 'static> HttpTransport<S> {
    pub fn new(broker: Arc<Broker<S>>, config: HttpConfig) -> Self {
        Self {
            state: Arc::new(HttpState { broker, config }),
        }
    }

    pub fn broker(&self) -> &Arc<Broker<S>> {
        &self.state.broker
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/{channel}",
                get(Self::handle_poll).post(Self::handle_publish).delete(Self::handle_delete),
            )
            .route("/{channel}/info", get(Self::handle_info))
            .with_state(self.state.clone())
    }

    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, std::future::pending()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        #[cfg(feature = "tracing")]
        info!(addr = %listener.local_addr()?, "Long-poll server started");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub async fn serve_tls(
        &self,
        addr: SocketAddr,
        tls: RustlsConfig,
        handle: axum_server::Handle,
    ) -> anyhow::Result<()> {
        #[cfg(feature = "tracing")]
        info!(addr = %addr, "Long-poll server started with TLS");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router().into_make_service())
            .await?;
        Ok(())
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(channel = %channel)))]
    async fn handle_poll(
        State(state): State<Arc<HttpState<S>>>,
        Path(channel): Path<String>,
        Query(params): Query<PollParams>,
        headers: HeaderMap,
    ) -> Result<Response, ApiError> {
        let cursor = match params.from.as_deref() {
            Some("end") => Cursor::End,
            Some("start") | None => cursor_from_request(&headers)?,
            Some(other) => {
                return Err(ApiError::BadRequest(format!("unknown from value {other:?}")));
            }
        };
        let order = params.order.unwrap_or(state.config.default_order);

        #[cfg(feature = "tracing")]
        debug!(%cursor, %order, "Long-poll request");

        let outcome = wait_for_message(
            &state.broker,
            &channel,
            cursor,
            order,
            state.config.poll_timeout,
            state.config.recheck_interval,
        )
        .await?;

        let response = match outcome {
            PollOutcome::Delivered(message) => {
                let content_type = HeaderValue::from_str(&message.content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
                let mut response = message.payload.into_response();
                let response_headers = response.headers_mut();
                response_headers.insert(header::CONTENT_TYPE, content_type);
                response_headers.extend(validator_headers(message.id));
                response
            }
            PollOutcome::TimedOut => {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                if let Cursor::At(id) = cursor {
                    response.headers_mut().extend(validator_headers(id));
                }
                response
            }
            PollOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
        };
        Ok(response)
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(channel = %channel)))]
    async fn handle_publish(
        State(state): State<Arc<HttpState<S>>>,
        Path(channel): Path<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, ApiError> {
        let mut request = PublishRequest::new(channel, body);
        if let Some(content_type) = header_text(&headers, header::CONTENT_TYPE.as_str())? {
            request = request.content_type(content_type);
        }
        if let Some(ttl) = header_text(&headers, MESSAGE_TTL_HEADER)? {
            let secs = ttl.trim().parse::<u64>().map_err(|_| {
                ApiError::BadRequest(format!("invalid {MESSAGE_TTL_HEADER} header {ttl:?}"))
            })?;
            request = request.ttl_secs(secs);
        }
        if let Some(timestamp) = header_text(&headers, MESSAGE_TIMESTAMP_HEADER)? {
            let secs = timestamp.trim().parse::<i64>().map_err(|_| {
                ApiError::BadRequest(format!(
                    "invalid {MESSAGE_TIMESTAMP_HEADER} header {timestamp:?}"
                ))
            })?;
            request = request.timestamp(secs);
        }

        let receipt = state.broker.publish(request).await?;
        Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(channel = %channel)))]
    async fn handle_delete(
        State(state): State<Arc<HttpState<S>>>,
        Path(channel): Path<String>,
    ) -> Result<StatusCode, ApiError> {
        state.broker.delete(&channel).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn handle_info(
        State(state): State<Arc<HttpState<S>>>,
        Path(channel): Path<String>,
    ) -> Result<Response, ApiError> {
        Ok(match state.broker.channel_info(&channel).await? {
            Some(info) => Json(info).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct PollParams {
    order: Option<TraversalOrder>,
    from: Option<String>,
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest(format!("{name} header is not valid text")))
        })
        .transpose()
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Broker(BrokerError),
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError::Broker(e)
    }
}

impl From<ValidatorError> for ApiError {
    fn from(e: ValidatorError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(text) => (StatusCode::BAD_REQUEST, text).into_response(),
            ApiError::Broker(e) if e.is_validation() => {
                (StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
            ApiError::Broker(e) => {
                #[cfg(feature = "tracing")]
                warn!(error = %e, "Broker failure");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}
