use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global compact subscriber. `RUST_LOG` wins over `default_directive`;
/// an unparsable directive falls back to `info`.
pub fn init(service_name: &str, default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .compact()
        .with_target(false)
        .with_thread_ids(true)
        .with_env_filter(filter)
        .try_init();

    tracing::info!(
        service = service_name,
        version = env!("CARGO_PKG_VERSION"),
        "telemetry initialized"
    );
}
