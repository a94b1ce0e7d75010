//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level. `RUST_LOG` wins when set.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    Ok(())
}

/// Pick the effective level: `--verbose` forces debug, then the explicit
/// override, then the configured default.
pub fn effective_level<'a>(verbose: bool, cli: Option<&'a str>, configured: &'a str) -> &'a str {
    if verbose {
        "debug"
    } else {
        cli.unwrap_or(configured)
    }
}
