/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used as the filter.
/// Calling this more than once is harmless.
#[cfg(feature = "tracing")]
pub fn init(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub fn init(_default_level: &str) {}
