//! Tracing subscriber setup, driven by [`crate::config::LoggerConfig`].

use crate::config::LoggerConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Call once, near the very top of
/// `main`, before anything else logs.
pub fn init(config: &LoggerConfig) -> anyhow::Result<()> {
    let level = Level::from_str(&config.level).unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.encoding.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }

    Ok(())
}
