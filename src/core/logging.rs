//! Tracing bootstrap for binaries and tests embedding the executor.
//!
//! `RUST_LOG` takes precedence over the default filter passed in.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global fmt subscriber. Calling it again is a no-op.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}

/// Test helper: quiet unless `RUST_LOG` asks for more.
pub fn init_test_tracing() {
    init_tracing("warn");
}
