//! Log setup for the stowage binary
//!
//! Logs go to stderr so command results on stdout stay machine readable.

use std::io;
use std::sync::OnceLock;
pub use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};
use uuid::Uuid;

/// How log lines are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TracingFormat {
    /// Multi-line, for reading by eye
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Verbosity selected with `--level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Everything
    Trace,
    /// Debug and above
    Debug,
    /// Info and above
    Info,
    /// Warnings and errors
    Warn,
    /// Errors only
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log setup options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Line format
    pub format: TracingFormat,
    /// Maximum level when no `RUST_LOG` is set
    pub level: Level,
    /// Explicit filter directives, overriding `level` and `RUST_LOG`
    pub filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: TracingFormat::Compact,
            level: Level::WARN,
            filter: None,
        }
    }
}

static SESSION_ID: OnceLock<Uuid> = OnceLock::new();

/// Identifier attached to the first log line of this process
pub fn session_id() -> Uuid {
    *SESSION_ID.get_or_init(Uuid::new_v4)
}

fn default_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    ["stowage", "stowage_cli", "stowage_cache", "stowage_cas"]
        .map(|target| format!("{target}={level}"))
        .join(",")
}

fn filter_for(config: &TracingConfig) -> miette::Result<EnvFilter> {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_directives(config.level))),
    };
    filter.map_err(|e| miette::miette!("Invalid log filter: {e}"))
}

fn format_layer(format: TracingFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    match format {
        TracingFormat::Pretty => layer.pretty().with_thread_names(true).boxed(),
        TracingFormat::Compact => layer.compact().with_target(false).boxed(),
        TracingFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Install the global subscriber
///
/// # Errors
///
/// Returns error if the filter directives are invalid or a subscriber is
/// already installed
pub fn init_tracing(config: TracingConfig) -> miette::Result<()> {
    let filter = filter_for(&config)?;
    tracing_subscriber::registry()
        .with(format_layer(config.format).with_filter(filter))
        .try_init()
        .map_err(|e| miette::miette!("Could not install log subscriber: {e}"))?;

    tracing::debug!(
        session = %session_id(),
        version = env!("CARGO_PKG_VERSION"),
        format = ?config.format,
        "Logging ready"
    );
    Ok(())
}
