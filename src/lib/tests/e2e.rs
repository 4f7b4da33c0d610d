use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode, header};
use tokio::net::TcpListener;

use crate::adapters::{HttpConfig, HttpTransport};
use crate::client::{ClientError, Publisher, Subscriber, SubscriberConfig};
use crate::core::{Broker, MessageId, TraversalOrder};
use crate::storage::Storage;
use crate::storage::memory::MemoryStorage;
use crate::transport::{conditional_headers, id_from_response};

async fn start_server<S: Storage + 'static>(storage: S, poll_timeout: Duration) -> String {
    let broker = Arc::new(Broker::new(Arc::new(storage)));
    broker.start_sweeper(Duration::from_millis(100));
    let transport = HttpTransport::new(
        broker,
        HttpConfig {
            poll_timeout,
            recheck_interval: Duration::from_millis(50),
            ..HttpConfig::default()
        },
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { transport.serve_listener(listener, std::future::pending()).await });
    format!("http://{addr}")
}

async fn get(client: &reqwest::Client, url: &str, after: Option<MessageId>) -> reqwest::Response {
    let mut headers = HeaderMap::new();
    if let Some(id) = after {
        headers.extend(conditional_headers(id));
    }
    client.get(url).headers(headers).send().await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walk_channel_oldest_to_newest() {
    let base = start_server(MemoryStorage::new(), Duration::from_millis(300)).await;
    let url = format!("{base}/walk");
    let payloads = ["foobar1", "whatthe", "isnot", "has-you", "even-move"];

    let publisher = Publisher::new(&url).unwrap().ttl(Duration::from_secs(100));
    assert_eq!(publisher.post_many(payloads, "text/plain").await.unwrap(), 5);

    let client = reqwest::Client::new();
    let mut after = None;
    for expected in payloads {
        let response = get(&client, &url, after).await;
        assert_eq!(response.status(), StatusCode::OK);
        after = id_from_response(response.headers()).unwrap();
        assert!(after.is_some());
        assert_eq!(response.text().await.unwrap(), expected);
    }

    let response = get(&client, &url, after).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(id_from_response(response.headers()).unwrap(), after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_messages_disappear_from_the_channel() {
    let base = start_server(MemoryStorage::new(), Duration::from_millis(300)).await;
    let url = format!("{base}/ttl");
    let publisher = Publisher::new(&url).unwrap().ttl(Duration::from_secs(3));
    let client = reqwest::Client::new();

    publisher.post_text("A").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    publisher.post_many(["B", "C"], "text/plain").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let response = get(&client, &url, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "B");

    tokio::time::sleep(Duration::from_millis(1600)).await;
    let response = get(&client, &url, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_collect_what_was_published() {
    let base = start_server(MemoryStorage::new(), Duration::from_secs(2)).await;
    let url = format!("{base}/chat");

    let publisher = Publisher::new(&url).unwrap();
    publisher
        .post_many(["one", "two", "three", "quit"], "text/plain")
        .await
        .unwrap();

    let subscriber = Subscriber::new(
        SubscriberConfig::new(&url)
            .concurrency(3)
            .quit_message("quit")
            .retry_backoff(Duration::from_millis(20)),
    )
    .unwrap();
    let handle = subscriber.run();

    assert!(handle.wait_for(Duration::from_secs(10)).await);
    let received = subscriber.messages().await;
    assert_eq!(received.texts(), ["one", "two", "three", "quit"]);
    assert!(received.iter().all(|message| message.times_seen == 3));
    assert!(
        received
            .iter()
            .all(|message| message.content_type.as_deref() == Some("text/plain"))
    );
    publisher.messages().await.matches(&received).unwrap();
    assert!(subscriber.errors().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vetoed_slot_stops_while_siblings_keep_receiving() {
    let base = start_server(MemoryStorage::new(), Duration::from_secs(2)).await;
    let url = format!("{base}/veto");
    let publisher = Publisher::new(&url).unwrap();
    let one = publisher.post_text("one").await.unwrap();

    let vetoed = Arc::new(AtomicBool::new(false));
    let subscriber = Subscriber::new(
        SubscriberConfig::new(&url)
            .concurrency(3)
            .quit_message("quit")
            .retry_backoff(Duration::from_millis(20)),
    )
    .unwrap()
    .on_message({
        let vetoed = vetoed.clone();
        move |message| message.text() != "one" || vetoed.swap(true, Ordering::SeqCst)
    });
    let handle = subscriber.run();

    while subscriber.messages().await.get(one.id).map_or(0, |m| m.times_seen) < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let two = publisher.post_text("two").await.unwrap();
    let quit = publisher.post_text("quit").await.unwrap();

    assert!(handle.wait_for(Duration::from_secs(10)).await);
    let received = subscriber.messages().await;
    assert_eq!(received.get(one.id).map(|m| m.times_seen), Some(3));
    assert_eq!(received.get(two.id).map(|m| m.times_seen), Some(2));
    assert_eq!(received.get(quit.id).map(|m| m.times_seen), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filo_subscriber_recovers_after_its_cursor_expires() {
    let base = start_server(MemoryStorage::new(), Duration::from_millis(300)).await;
    let url = format!("{base}/fading");
    Publisher::new(&url)
        .unwrap()
        .ttl(Duration::from_secs(1))
        .post_text("first")
        .await
        .unwrap();

    let subscriber = Subscriber::new(
        SubscriberConfig::new(&url)
            .order(TraversalOrder::Filo)
            .quit_message("second")
            .retry_backoff(Duration::from_millis(50)),
    )
    .unwrap();
    let handle = subscriber.run();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    Publisher::new(&url)
        .unwrap()
        .ttl(Duration::from_secs(100))
        .post_text("second")
        .await
        .unwrap();

    assert!(handle.wait_for(Duration::from_secs(5)).await);
    assert_eq!(subscriber.messages().await.texts(), ["first", "second"]);
    let errors = subscriber.errors().await;
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|error| error.starts_with("HTTP request failed: 404")));
}

#[tokio::test]
async fn parked_subscriber_sees_later_publish() {
    let base = start_server(MemoryStorage::new(), Duration::from_secs(5)).await;
    let url = format!("{base}/late");
    let publisher = Publisher::new(&url).unwrap();
    let first = publisher.post_text("first").await.unwrap();

    let client = reqwest::Client::new();
    let parked = tokio::spawn({
        let url = url.clone();
        async move { get(&client, &url, Some(first.id)).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = publisher.post_text("second").await.unwrap();

    let response = parked.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(id_from_response(response.headers()).unwrap(), Some(second.id));
    assert_eq!(response.text().await.unwrap(), "second");
}

#[tokio::test]
async fn content_type_with_colon_is_refused() {
    let base = start_server(MemoryStorage::new(), Duration::from_millis(300)).await;
    let url = format!("{base}/fruit");
    let publisher = Publisher::new(&url).unwrap();

    let err = publisher.post("bananas", "foo:bar").await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: StatusCode::BAD_REQUEST, .. }));
    assert!(publisher.messages().await.is_empty());

    let response = get(&reqwest::Client::new(), &url, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleted_channel_starts_over() {
    let base = start_server(MemoryStorage::new(), Duration::from_millis(300)).await;
    let url = format!("{base}/gone");
    let publisher = Publisher::new(&url).unwrap();
    publisher.post_many(["a", "b"], "text/plain").await.unwrap();

    let client = reqwest::Client::new();
    let response = client.delete(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(get(&client, &url, None).await.status(), StatusCode::NOT_FOUND);

    publisher.post("c", "X-fruit/banana").await.unwrap();
    let response = get(&client, &url, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "X-fruit/banana");
    assert_eq!(response.text().await.unwrap(), "c");
}

#[cfg(feature = "storage")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_backend_serves_the_same_walk() {
    use crate::core::RetentionPolicy;
    use crate::storage::sqlite::SqliteStorage;

    let storage = SqliteStorage::in_memory(RetentionPolicy::default()).await.unwrap();
    let base = start_server(storage, Duration::from_millis(300)).await;
    let url = format!("{base}/walk");
    let publisher = Publisher::new(&url).unwrap();
    publisher.post_many(["x", "y"], "text/plain").await.unwrap();

    let client = reqwest::Client::new();
    let response = get(&client, &url, None).await;
    let first = id_from_response(response.headers()).unwrap();
    assert_eq!(response.text().await.unwrap(), "x");
    let response = get(&client, &url, first).await;
    let second = id_from_response(response.headers()).unwrap();
    assert_eq!(response.text().await.unwrap(), "y");
    assert_eq!(get(&client, &url, second).await.status(), StatusCode::NOT_MODIFIED);
}
