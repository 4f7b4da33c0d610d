use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pollbus::adapters::HttpTransport;
use pollbus::config::{Settings, StorageBackend, load_config, load_config_from};
use pollbus::core::Broker;
use pollbus::logging;
use pollbus::storage::Storage;
use pollbus::storage::memory::MemoryStorage;
use pollbus::transport::configure_tls;
use tokio::net::TcpListener;

#[cfg(feature = "tracing")]
use tracing::info;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => load_config_from(&path).with_context(|| format!("loading {path}"))?,
        None => load_config()?,
    };
    logging::init(&settings.log_level);

    let policy = settings.broker.retention_policy();
    match settings.storage.backend {
        StorageBackend::Memory => {
            run(Arc::new(MemoryStorage::with_policy(policy)), &settings).await
        }
        #[cfg(feature = "storage")]
        StorageBackend::Sqlite => {
            let path = &settings.storage.path;
            let storage = pollbus::storage::sqlite::SqliteStorage::open(path, policy)
                .await
                .with_context(|| format!("opening {path}"))?;
            run(Arc::new(storage), &settings).await
        }
        #[cfg(not(feature = "storage"))]
        StorageBackend::Sqlite => {
            anyhow::bail!("sqlite backend requested but built without the `storage` feature")
        }
    }
}

async fn run<S: Storage + 'static>(storage: Arc<S>, settings: &Settings) -> anyhow::Result<()> {
    let broker = Arc::new(Broker::new(storage));
    let sweeper = broker.start_sweeper(settings.broker.sweep_interval());
    let transport = HttpTransport::new(broker, settings.broker.http_config());

    let served = match settings.server.tls_paths() {
        Some((cert, key)) => {
            let tls = configure_tls(cert, key).await?;
            let addr = tokio::net::lookup_host(settings.server.addr())
                .await?
                .next()
                .with_context(|| format!("no address for {}", settings.server.addr()))?;
            let handle = axum_server::Handle::new();
            tokio::spawn({
                let handle = handle.clone();
                async move {
                    shutdown_signal().await;
                    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
                }
            });
            transport.serve_tls(addr, tls, handle).await
        }
        None => {
            let listener = TcpListener::bind(settings.server.addr()).await?;
            transport.serve_listener(listener, shutdown_signal()).await
        }
    };

    sweeper.abort();
    #[cfg(feature = "tracing")]
    info!("Server stopped");
    served
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
