use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// `RUST_LOG` wins over `OTB_LOG_LEVEL`; `OTB_LOG_FORMAT=json` switches to JSON lines.
/// Logs go to stderr so stdout carries only command output.
pub fn init_subscriber() -> Result<()> {
    let level = std::env::var("OTB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let json = std::env::var("OTB_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    let registry = Registry::default().with(filter);

    if json {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_writer(std::io::stderr)))
    }
    .context("installing tracing subscriber")
}
