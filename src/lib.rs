pub mod admission;
pub mod ca;
pub mod cascade;
pub mod configmap;
pub mod crd;
pub mod deployment;
pub mod errors;
pub mod matcher;
pub mod readiness;
pub mod reconciler;
pub mod report_store;
pub mod reports;
pub mod scanner;
pub mod secrets;
pub mod service;
pub mod status;
pub mod webhooks;

use tracing_subscriber::EnvFilter;

/// Initialize structured logging from a `--loglevel` style filter.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
