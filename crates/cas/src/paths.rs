//! Default location of the local blob store

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Environment variable overriding the cache directory
pub const CACHE_DIR_ENV: &str = "STOWAGE_CACHE_DIR";

/// Nix build sandboxes point HOME here and it is never writable
const NIX_SANDBOX_HOME: &str = "/homeless-shelter";

/// Where a cache root may live, in order of preference
#[derive(Debug, Clone)]
struct RootCandidates {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

impl RootCandidates {
    fn from_env() -> Self {
        let non_empty = |name: &str| {
            std::env::var_os(name)
                .filter(|value| !value.to_string_lossy().trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            override_dir: non_empty(CACHE_DIR_ENV),
            xdg_cache_home: non_empty("XDG_CACHE_HOME"),
            os_cache_dir: dirs::cache_dir(),
            home_dir: dirs::home_dir(),
            temp_dir: std::env::temp_dir(),
        }
    }

    fn paths(self) -> impl Iterator<Item = PathBuf> {
        let override_dir = self.override_dir.filter(|p| !p.as_os_str().is_empty());
        override_dir
            .into_iter()
            .chain(self.xdg_cache_home.map(|dir| dir.join("stowage/cas")))
            .chain(self.os_cache_dir.map(|dir| dir.join("stowage/cas")))
            .chain(self.home_dir.map(|dir| dir.join(".stowage/cache/cas")))
            .chain([self.temp_dir.join("stowage/cache/cas")])
    }

    /// First candidate that exists, or can be created, and accepts writes
    fn resolve(self) -> Result<PathBuf> {
        let mut rejected = Vec::new();
        for path in self.paths() {
            if path.starts_with(NIX_SANDBOX_HOME) {
                rejected.push(format!("{}: Nix sandbox home", path.display()));
                continue;
            }
            match ensure_writable(&path) {
                Ok(()) => return Ok(path),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Cache candidate rejected");
                    rejected.push(format!("{}: {e}", path.display()));
                }
            }
        }
        Err(Error::configuration(format!(
            "no writable cache directory ({})",
            rejected.join("; ")
        )))
    }
}

fn ensure_writable(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    NamedTempFile::new_in(dir)?.close()
}

/// Resolve the default local blob store directory from the environment
///
/// # Errors
///
/// Returns error naming every rejected candidate if none is writable
pub fn default_cache_root() -> Result<PathBuf> {
    RootCandidates::from_env().resolve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn only_temp(temp_dir: &Path) -> RootCandidates {
        RootCandidates {
            override_dir: None,
            xdg_cache_home: None,
            os_cache_dir: None,
            home_dir: None,
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    #[test]
    fn nix_sandbox_home_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let candidates = RootCandidates {
            xdg_cache_home: Some(PathBuf::from("/homeless-shelter/.cache")),
            home_dir: Some(PathBuf::from("/homeless-shelter")),
            ..only_temp(tmp.path())
        };
        let dir = candidates.resolve().unwrap();
        assert_eq!(dir, tmp.path().join("stowage/cache/cas"));
    }

    #[test]
    fn override_comes_first() {
        let tmp = TempDir::new().unwrap();
        let override_dir = tmp.path().join("override");
        let candidates = RootCandidates {
            override_dir: Some(override_dir.clone()),
            xdg_cache_home: Some(tmp.path().join("xdg")),
            ..only_temp(tmp.path())
        };
        let dir = candidates.resolve().unwrap();
        assert_eq!(dir, override_dir);
        assert!(dir.is_dir());
    }

    #[test]
    fn empty_override_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let candidates = RootCandidates {
            override_dir: Some(PathBuf::new()),
            xdg_cache_home: Some(tmp.path().join("xdg")),
            ..only_temp(tmp.path())
        };
        assert_eq!(candidates.resolve().unwrap(), tmp.path().join("xdg/stowage/cas"));
    }

    #[test]
    fn unusable_candidates_are_named_in_the_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        let candidates = RootCandidates {
            home_dir: Some(PathBuf::from("/homeless-shelter")),
            ..only_temp(&blocker)
        };

        let message = candidates.resolve().unwrap_err().to_string();
        assert!(message.contains("Nix sandbox home"), "{message}");
        assert!(message.contains("not-a-dir/stowage/cache/cas"), "{message}");
    }

    #[test]
    fn resolve_leaves_no_scratch_files_behind() {
        let tmp = TempDir::new().unwrap();
        let dir = only_temp(tmp.path()).resolve().unwrap();
        assert_eq!(fs::read_dir(dir).unwrap().count(), 0);
    }
}
