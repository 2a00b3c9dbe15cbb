//! Tracing setup.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Install a `tracing` subscriber: an `EnvFilter` from `RUST_LOG` (or
/// `default_directives` when unset) and a `fmt` layer.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns false if a global subscriber was already set elsewhere.
pub fn init_tracing(default_directives: &str) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .try_init()
            .is_ok()
    })
}
