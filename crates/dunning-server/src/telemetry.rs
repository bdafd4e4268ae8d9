//! Tracing subscriber setup for the server binary.
//!
//! `RUST_LOG` wins when set. Otherwise the configured level applies to
//! everything, with the dunning crates raised to `debug`.

use dunning_core::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CRATE_DIRECTIVES: &str = "dunning_server=debug,dunning_channel=debug,dunning_reminders=debug";

pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    tracing::info!(format = %config.format, "Telemetry initialized");
    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("{},{}", level.to_ascii_lowercase(), CRATE_DIRECTIVES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        let directives = default_directives("INFO");
        assert_eq!(
            directives,
            "info,dunning_server=debug,dunning_channel=debug,dunning_reminders=debug"
        );
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
