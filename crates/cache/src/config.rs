//! Controller configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default size of the copy buffer used when moving blob content
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Settings for a [`BuildCacheController`](crate::BuildCacheController)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// A disabled controller loads nothing and stores nothing
    pub enabled: bool,
    /// Recorded in the origin metadata of every stored manifest
    pub build_invocation_id: String,
    /// Copy buffer size in bytes
    pub buffer_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            build_invocation_id: uuid::Uuid::new_v4().to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ControllerConfig {
    /// Check the settings are usable
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::configuration("buffer_size must be greater than zero"));
        }
        if self.build_invocation_id.trim().is_empty() {
            return Err(Error::configuration("build_invocation_id must not be empty"));
        }
        Ok(())
    }
}
