/// Installs a global `tracing` subscriber printing to stderr.
///
/// The filter is read from `RUST_LOG` and defaults to `info` for everything
/// and `debug` for this crate.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), crate::error::SystemError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cradle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| crate::error::SystemError::Logging(e.to_string()))
}
