//! Command execution

use crate::cli::{CliError, Commands, EntityArgs, OkEnvelope};
use crate::config::StowageConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stowage_cache::{
    BuildCacheController, LoadResult, OutputTreeSet, RemoteLoadOutcome, RemoteStoreOutcome,
    StoreOutcome, capture,
};
use stowage_cas::{CacheKey, CasStore, ContentHash, TieredCacheAccess};

/// Where the cache lives, resolved from flags and configuration
#[derive(Debug, Clone)]
pub struct Environment {
    /// Loaded configuration
    pub config: StowageConfig,
    /// Local cache directory
    pub cache_dir: PathBuf,
    /// Shared remote directory, if any
    pub remote_dir: Option<PathBuf>,
}

impl Environment {
    /// Resolve the cache locations
    ///
    /// # Errors
    ///
    /// Returns error if no cache directory can be determined
    pub fn resolve(
        config: StowageConfig,
        cache_dir: Option<&Path>,
        remote_dir: Option<&Path>,
    ) -> Result<Self, CliError> {
        let cache_dir = config.resolve_cache_dir(cache_dir)?;
        let remote_dir = remote_dir
            .map(Path::to_path_buf)
            .or_else(|| config.remote_dir.clone());
        Ok(Self {
            config,
            cache_dir,
            remote_dir,
        })
    }

    fn controller(&self) -> Result<BuildCacheController<TieredCacheAccess>, CliError> {
        let mut access = TieredCacheAccess::new(
            CasStore::new(&self.cache_dir),
            self.config.max_concurrent_transfers,
        )?;
        if let Some(remote) = &self.remote_dir {
            access = access.with_remote(Arc::new(CasStore::new(remote)));
        }
        tracing::debug!(access = ?access, "Opened build cache");
        Ok(BuildCacheController::new(self.config.controller.clone(), access)?)
    }
}

/// Result of one command, printed as text or as a JSON envelope
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Report {
    /// `store` finished
    Store {
        /// Cache key, hex
        key: String,
        /// Blobs written
        entries: u64,
        /// Bytes written
        size: u64,
        /// Remote tier outcome
        remote: String,
    },
    /// `load` found an entry
    Load {
        /// Cache key, hex
        key: String,
        /// Blobs delivered
        entries: u64,
        /// Build that stored the entry
        build_invocation_id: String,
        /// Execution time recorded with the entry
        execution_time_ms: u128,
        /// Hashes that could not be restored, by output name
        missing: BTreeMap<String, Vec<String>>,
        /// Remote tier outcome
        remote: String,
    },
    /// `load` found nothing
    Miss {
        /// Cache key, hex
        key: String,
    },
    /// Local cache summary
    Stats {
        /// Cache directory
        cache_dir: PathBuf,
        /// Blob count
        blobs: usize,
        /// Total bytes
        size: u64,
    },
}

impl Report {
    fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Store {
                key,
                entries,
                size,
                remote,
            } => writeln!(
                out,
                "stored {key}: {entries} new blobs, {size} bytes (remote: {remote})"
            ),
            Self::Load {
                key,
                entries,
                missing,
                remote,
                ..
            } => {
                writeln!(out, "restored {key}: {entries} blobs (remote: {remote})")?;
                for (property, hashes) in missing {
                    writeln!(out, "incomplete {property}: {} blobs missing", hashes.len())?;
                }
                Ok(())
            }
            Self::Miss { key } => writeln!(out, "miss {key}"),
            Self::Stats {
                cache_dir,
                blobs,
                size,
            } => writeln!(out, "{}: {blobs} blobs, {size} bytes", cache_dir.display()),
        }
    }

    /// Print to stdout
    ///
    /// # Errors
    ///
    /// Returns error if stdout cannot be written
    pub fn print(&self, json: bool) -> Result<(), CliError> {
        let mut out = io::stdout().lock();
        let written = if json {
            let line = serde_json::to_string(&OkEnvelope::new(self))
                .map_err(|e| CliError::other(format!("Cannot serialize result: {e}")))?;
            writeln!(out, "{line}")
        } else {
            self.write_text(&mut out)
        };
        written
            .and_then(|()| out.flush())
            .map_err(|e| CliError::other(format!("Cannot write to stdout: {e}")))
    }
}

/// Run `command` against the cache in `env`
///
/// # Errors
///
/// Returns error if arguments are invalid or the cache operation fails
pub fn execute(command: Commands, env: &Environment) -> Result<Report, CliError> {
    match command {
        Commands::Store {
            entity,
            execution_time_ms,
        } => store(&entity, Duration::from_millis(execution_time_ms), env),
        Commands::Load { entity } => load(&entity, env),
        Commands::Stats => stats(env),
    }
}

fn cache_key(args: &EntityArgs) -> Result<CacheKey, CliError> {
    match &args.key {
        Some(key) => key.parse::<ContentHash>().map_err(|e| {
            CliError::config_with_help(e.to_string(), "Pass --key as 64 hexadecimal digits")
        }),
        None => Ok(ContentHash::from_data(
            format!("{}:{}", args.entity_type, args.identity).as_bytes(),
        )),
    }
}

fn output_trees(args: &EntityArgs) -> Result<OutputTreeSet, CliError> {
    if args.dirs.is_empty() && args.files.is_empty() {
        return Err(CliError::config_with_help(
            "no outputs declared",
            "Declare outputs with --dir NAME=PATH or --file NAME=PATH",
        ));
    }
    let mut seen = std::collections::BTreeSet::new();
    let mut trees = OutputTreeSet::new(args.entity_type.clone(), args.identity.clone());
    for output in &args.dirs {
        if !seen.insert(output.name.as_str()) {
            return Err(CliError::config(format!("output '{}' declared twice", output.name)));
        }
        trees = trees.directory(output.name.clone(), output.path.clone());
    }
    for output in &args.files {
        if !seen.insert(output.name.as_str()) {
            return Err(CliError::config(format!("output '{}' declared twice", output.name)));
        }
        trees = trees.file(output.name.clone(), output.path.clone());
    }
    Ok(trees)
}

fn store(
    args: &EntityArgs,
    execution_time: Duration,
    env: &Environment,
) -> Result<Report, CliError> {
    let key = cache_key(args)?;
    let trees = output_trees(args)?;
    let controller = env.controller()?;

    let snapshots = trees
        .trees()
        .map(|(name, _, root)| Ok((name.to_string(), capture(root)?)))
        .collect::<Result<BTreeMap<_, _>, stowage_cache::Error>>()?;
    let StoreOutcome {
        entry_count,
        total_size,
        remote,
    } = controller.store(&key, &trees, &snapshots, execution_time)?;

    let remote = match remote {
        RemoteStoreOutcome::NotAttempted => "none".to_string(),
        RemoteStoreOutcome::Stored => "stored".to_string(),
        RemoteStoreOutcome::NotStored => "up to date".to_string(),
        RemoteStoreOutcome::Failed(error) => format!("failed: {error}"),
    };
    Ok(Report::Store {
        key: key.to_hex(),
        entries: entry_count,
        size: total_size,
        remote,
    })
}

fn load(args: &EntityArgs, env: &Environment) -> Result<Report, CliError> {
    let key = cache_key(args)?;
    let trees = output_trees(args)?;
    let controller = env.controller()?;

    let Some(LoadResult {
        artifact_entry_count,
        origin_metadata,
        missing_content,
        remote,
        ..
    }) = controller.load(&key, &trees)?
    else {
        return Ok(Report::Miss { key: key.to_hex() });
    };

    let remote = match remote {
        RemoteLoadOutcome::NotAttempted => "none".to_string(),
        RemoteLoadOutcome::Hit { downloaded_size } => format!("downloaded {downloaded_size} bytes"),
        RemoteLoadOutcome::Miss => "miss".to_string(),
        RemoteLoadOutcome::Failed(error) => format!("failed: {error}"),
    };
    let missing = missing_content
        .into_iter()
        .map(|(property, hashes)| (property, hashes.iter().map(ContentHash::to_hex).collect()))
        .collect();
    Ok(Report::Load {
        key: key.to_hex(),
        entries: artifact_entry_count,
        build_invocation_id: origin_metadata.build_invocation_id,
        execution_time_ms: origin_metadata.execution_time.as_millis(),
        missing,
        remote,
    })
}

fn stats(env: &Environment) -> Result<Report, CliError> {
    let store = CasStore::new(&env.cache_dir);
    Ok(Report::Stats {
        cache_dir: env.cache_dir.clone(),
        blobs: store.list()?.len(),
        size: store.total_size()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::NamedPath;
    use std::fs;
    use tempfile::TempDir;

    fn args(identity: &str, dirs: &[(&str, &Path)], files: &[(&str, &Path)]) -> EntityArgs {
        let named = |list: &[(&str, &Path)]| {
            list.iter()
                .map(|(name, path)| NamedPath {
                    name: (*name).to_string(),
                    path: path.to_path_buf(),
                })
                .collect()
        };
        EntityArgs {
            identity: identity.to_string(),
            entity_type: "task".to_string(),
            key: None,
            dirs: named(dirs),
            files: named(files),
        }
    }

    fn env(cache: &Path) -> Environment {
        Environment::resolve(StowageConfig::default(), Some(cache), None).unwrap()
    }

    #[test]
    fn test_key_defaults_to_identity_hash() {
        let a = cache_key(&args(":a", &[], &[])).unwrap();
        let b = cache_key(&args(":b", &[], &[])).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, ContentHash::from_data(b"task::a"));

        let mut explicit = args(":a", &[], &[]);
        explicit.key = Some(b.to_hex());
        assert_eq!(cache_key(&explicit).unwrap(), b);

        explicit.key = Some("not-hex".to_string());
        assert!(matches!(cache_key(&explicit), Err(CliError::Config { .. })));
    }

    #[test]
    fn test_outputs_are_required_and_unique() {
        assert!(output_trees(&args(":a", &[], &[])).is_err());
        let path = Path::new("/tmp/x");
        assert!(output_trees(&args(":a", &[("x", path)], &[("x", path)])).is_err());
        assert!(output_trees(&args(":a", &[("x", path)], &[("y", path)])).is_ok());
    }

    #[test]
    fn test_store_load_and_stats() {
        let work = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let out = work.path().join("dist");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("index.js"), b"console.log(1)").unwrap();
        let entity = args(":web:build", &[("dist", out.as_path())], &[]);
        let env = env(cache.path());

        let stored = store(&entity, Duration::from_millis(30), &env).unwrap();
        assert!(matches!(stored, Report::Store { entries: 2, .. }));

        fs::remove_dir_all(&out).unwrap();
        match load(&entity, &env).unwrap() {
            Report::Load {
                entries,
                execution_time_ms,
                missing,
                ..
            } => {
                assert_eq!(entries, 2);
                assert_eq!(execution_time_ms, 30);
                assert!(missing.is_empty());
            }
            other => panic!("expected a hit, got {other:?}"),
        }
        assert_eq!(fs::read(out.join("index.js")).unwrap(), b"console.log(1)");

        assert!(matches!(stats(&env).unwrap(), Report::Stats { blobs: 2, .. }));
    }

    #[test]
    fn test_load_miss() {
        let work = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let entity = args(":never", &[("out", work.path().join("out").as_path())], &[]);
        assert!(matches!(load(&entity, &env(cache.path())).unwrap(), Report::Miss { .. }));
    }

    #[test]
    fn test_text_report() {
        let mut out = Vec::new();
        Report::Miss {
            key: "abc".to_string(),
        }
        .write_text(&mut out)
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "miss abc\n");
    }
}
