// src/logging.rs
//
// Process-wide tracing setup. Binaries call `init_tracing` once; library
// code only emits events.

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber with an `EnvFilter`.
///
/// `RUST_LOG` wins when set; otherwise `<service>=info,warn` is used.
/// Calling this twice is harmless (the second install is ignored).
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,warn")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
