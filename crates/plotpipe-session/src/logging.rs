//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use plotpipe_core::LogSettings;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns false if a
/// subscriber was already installed, which is not an error.
pub fn init_tracing(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if settings.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!("Tracing initialized: level={}, json={}", settings.level, settings.json);
    }
    installed
}
