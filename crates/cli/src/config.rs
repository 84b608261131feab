//! `stowage.toml` configuration
//!
//! ```toml
//! cache_dir = "/var/cache/stowage"
//! remote_dir = "/mnt/shared/stowage"
//! max_concurrent_transfers = 8
//!
//! [controller]
//! enabled = true
//! buffer_size = 65536
//! ```

use crate::cli::CliError;
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use stowage_cache::ControllerConfig;
use stowage_cas::DEFAULT_MAX_CONCURRENT_TRANSFERS;
use stowage_cas::paths::CACHE_DIR_ENV;

/// Settings read from a configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StowageConfig {
    /// Local cache directory
    pub cache_dir: Option<PathBuf>,
    /// Shared directory used as the remote tier
    pub remote_dir: Option<PathBuf>,
    /// Parallel blob transfers per batch
    pub max_concurrent_transfers: usize,
    /// Controller settings
    pub controller: ControllerConfig,
}

impl Default for StowageConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            remote_dir: None,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            controller: ControllerConfig::default(),
        }
    }
}

impl StowageConfig {
    /// Read `path`, or return the defaults when no file is given
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid configuration
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let src = fs::read_to_string(path).map_err(|e| {
            CliError::config_with_help(
                format!("Cannot read {}: {e}", path.display()),
                "Pass an existing file with --config or unset STOWAGE_CONFIG",
            )
        })?;
        let config = Self::parse(&src, path)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn parse(src: &str, path: &Path) -> Result<Self, CliError> {
        let config: Self = toml::from_str(src).map_err(|e| CliError::ConfigParse {
            path: path.display().to_string(),
            src: src.to_string(),
            span: e.span().map(Into::into),
            reason: e.message().to_string(),
        })?;
        if config.max_concurrent_transfers == 0 {
            return Err(CliError::config("max_concurrent_transfers must be at least 1"));
        }
        Ok(config)
    }

    /// Local cache directory: flag, then `STOWAGE_CACHE_DIR`, then the file,
    /// then the platform default
    ///
    /// # Errors
    ///
    /// Returns error if no writable default location exists
    pub fn resolve_cache_dir(&self, flag: Option<&Path>) -> Result<PathBuf, CliError> {
        self.cache_dir_from(flag, std::env::var_os(CACHE_DIR_ENV))
    }

    fn cache_dir_from(
        &self,
        flag: Option<&Path>,
        env_override: Option<OsString>,
    ) -> Result<PathBuf, CliError> {
        if let Some(dir) = flag {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = env_override.filter(|dir| !dir.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        Ok(stowage_cas::default_cache_root()?)
    }
}
