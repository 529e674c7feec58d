//! Tracing setup for the command-line binary.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global subscriber once. Honours `RUST_LOG`, defaulting to
/// `info`.
pub fn init() {
  INIT.call_once(|| {
    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(env.clone()).unwrap_or_else(|err| {
      eprintln!("invalid RUST_LOG '{env}': {err}; falling back to 'info'");
      tracing_subscriber::EnvFilter::new("info")
    });
    let _ = tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_target(true)
      .compact()
      .try_init();
  });
}
