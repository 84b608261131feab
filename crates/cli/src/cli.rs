//! Command-line definition, CLI errors and result envelopes

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use clap::{Args, Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Successful run
pub const EXIT_OK: i32 = 0;
/// Bad arguments or configuration
pub const EXIT_CLI: i32 = 2;
/// The cache failed to store or load
pub const EXIT_CACHE: i32 = 3;

/// Everything that can end a stowage run early
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Unusable arguments or settings (exit code 2)
    #[error("{message}")]
    #[diagnostic(code(stowage::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Configuration file that could not be parsed (exit code 2)
    #[error("Invalid configuration file {path}: {reason}")]
    #[diagnostic(code(stowage::cli::config_parse))]
    ConfigParse {
        /// File being parsed
        path: String,
        /// File contents
        #[source_code]
        src: String,
        /// Location of the problem
        #[label("here")]
        span: Option<miette::SourceSpan>,
        /// What is wrong
        reason: String,
    },
    /// Failure while storing or loading (exit code 3)
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] stowage_cache::Error),
    /// Failure of the blob store itself (exit code 3)
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cas(#[from] stowage_cas::Error),
    /// Anything else, such as a broken stdout (exit code 3)
    #[error("{message}")]
    #[diagnostic(code(stowage::cli::other))]
    Other {
        /// The error message
        message: String,
    },
}

impl CliError {
    /// Usage error without a hint
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Usage error with a hint shown below it
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Error outside the cache and the configuration
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } | Self::ConfigParse { .. } => "config",
            Self::Cache(_) | Self::Cas(_) => "cache",
            Self::Other { .. } => "other",
        }
    }
}

/// Process exit code for `err`
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } | CliError::ConfigParse { .. } => EXIT_CLI,
        CliError::Cache(_) | CliError::Cas(_) | CliError::Other { .. } => EXIT_CACHE,
    }
}

/// Report `err` as a JSON envelope on stdout or a miette report on stderr
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub fn render_error(err: CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": err.code(),
            "message": err.to_string(),
        }));
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("{err}: {e}"),
        }
    } else {
        eprintln!("{:?}", Report::new(err));
        let _ = io::stderr().flush();
    }
}

/// Success envelope for JSON output
#[derive(Serialize, Debug)]
pub struct OkEnvelope<T> {
    /// Always `"ok"`
    pub status: &'static str,
    /// Command report
    pub data: T,
}

impl<T> OkEnvelope<T> {
    /// Wrap a command report
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }
}

/// Error envelope for JSON output
#[derive(Serialize, Debug)]
pub struct ErrorEnvelope<E> {
    /// Always `"error"`
    pub status: &'static str,
    /// The error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Wrap an error description
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// A `name=path` pair naming one output property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPath {
    /// Property name
    pub name: String,
    /// Output location
    pub path: PathBuf,
}

fn parse_named_path(value: &str) -> Result<NamedPath, String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{value}'"))?;
    if name.is_empty() {
        return Err(format!("missing output name in '{value}'"));
    }
    if path.is_empty() {
        return Err(format!("missing output path in '{value}'"));
    }
    Ok(NamedPath {
        name: name.to_string(),
        path: PathBuf::from(path),
    })
}

/// stowage: a content-addressed cache for build outputs
#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(about = "Store and restore build outputs in a content-addressed cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// What to do
    #[command(subcommand)]
    pub command: Commands,

    /// Log verbosity
    #[arg(
        short = 'L',
        long,
        global = true,
        help = "Log verbosity",
        default_value = "warn",
        value_enum
    )]
    pub level: crate::tracing::LogLevel,

    /// Log line format.
    #[arg(
        long,
        global = true,
        help = "Log output format",
        default_value = "compact",
        value_enum
    )]
    pub log_format: crate::tracing::TracingFormat,

    /// Emit JSON envelopes instead of text.
    #[arg(long, global = true, help = "Emit JSON envelope instead of text")]
    pub json: bool,

    /// Configuration file.
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "STOWAGE_CONFIG",
        help = "Path to a stowage.toml"
    )]
    pub config: Option<PathBuf>,

    /// Local cache directory.
    #[arg(
        long,
        global = true,
        help = "Local cache directory (overrides config and STOWAGE_CACHE_DIR)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Shared directory acting as the remote cache.
    #[arg(
        long,
        global = true,
        help = "Shared directory used as the remote cache"
    )]
    pub remote_dir: Option<PathBuf>,
}

/// Outputs of one cached entity
#[derive(Args, Debug, Clone)]
pub struct EntityArgs {
    /// Identity of the entity, e.g. a task path.
    #[arg(long, short = 'i', help = "Identity of the cached entity")]
    pub identity: String,

    /// Kind of entity.
    #[arg(
        long = "type",
        default_value = "task",
        help = "Kind of the cached entity"
    )]
    pub entity_type: String,

    /// Cache key as 64 hex digits.
    #[arg(
        long,
        short = 'k',
        help = "Cache key (defaults to a hash of type and identity)"
    )]
    pub key: Option<String>,

    /// Directory outputs.
    #[arg(
        long = "dir",
        value_name = "NAME=PATH",
        value_parser = parse_named_path,
        help = "Directory output"
    )]
    pub dirs: Vec<NamedPath>,

    /// Single file outputs.
    #[arg(
        long = "file",
        value_name = "NAME=PATH",
        value_parser = parse_named_path,
        help = "Single file output"
    )]
    pub files: Vec<NamedPath>,
}

/// stowage subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Snapshot the outputs and store them in the cache.
    #[command(about = "Store outputs in the cache")]
    Store {
        /// Outputs to store.
        #[command(flatten)]
        entity: EntityArgs,
        /// How long producing the outputs took.
        #[arg(
            long,
            default_value_t = 0,
            help = "Execution time recorded with the entry, in milliseconds"
        )]
        execution_time_ms: u64,
    },
    /// Restore the outputs from the cache.
    #[command(about = "Load outputs from the cache")]
    Load {
        /// Outputs to restore.
        #[command(flatten)]
        entity: EntityArgs,
    },
    /// Summarize the local cache.
    #[command(about = "Show local cache statistics")]
    Stats,
}

/// Parse the process arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
