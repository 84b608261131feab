//! stowage command-line driver
//!
//! Stores and restores declared outputs through a [`BuildCacheController`]
//! backed by a local cache directory and, optionally, a shared directory
//! acting as the remote tier.
//!
//! [`BuildCacheController`]: stowage_cache::BuildCacheController

pub mod cli;
pub mod commands;
pub mod config;
pub mod tracing;
