//! Tracing bootstrap.
//!
//! Libraries in this workspace only emit `tracing` events. Binaries and test
//! harnesses call [`init_tracing`] once to get formatted output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "PIPELINE_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// Install a fmt subscriber filtered by `PIPELINE_LOG` (default `info`).
///
/// Returns false when a global subscriber was already installed, so calling
/// it from several tests is harmless.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter_env = LOG_ENV, "Tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
