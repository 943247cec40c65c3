// Tracing setup
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber filtered by `filter`, or by `RUST_LOG`
/// when set. Returns `false` if a global subscriber was already installed.
pub fn init_tracing(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        info!(target: "telemetry", filter, "Tracing initialized");
    }
    installed
}
