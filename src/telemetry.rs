use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ChatError, Result};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. Calling this a second
/// time returns an error instead of replacing the installed subscriber.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok(), &config.filter)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|err| ChatError::Config(format!("failed to install tracing subscriber: {err}")))
}

fn build_filter(from_env: Option<String>, fallback: &str) -> Result<EnvFilter> {
    let directives = from_env
        .filter(|raw| !raw.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string());
    EnvFilter::try_new(&directives)
        .map_err(|err| ChatError::Config(format!("invalid log filter `{directives}`: {err}")))
}
