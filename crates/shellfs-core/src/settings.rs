//! Runtime tunables for the VFS layer.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{OpContext, VfsError, VfsResult};

/// Seconds an idle connection survives before the sweeper frees it.
const DEFAULT_GC_TIMEOUT: u64 = 60;

/// Seconds a cached directory listing stays valid before the next access
/// forces a fresh load.
const DEFAULT_DIR_CACHE_TIMEOUT: u64 = 900;

/// Tunables, loadable from a small JSON file in the host's configuration
/// directory. Everything has a default, so embedders that never ship a
/// settings file get the stock behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VfsSettings {
    /// Idle timeout for superblock eviction, in seconds.
    pub gc_timeout_secs: u64,
    /// Validity window of a cached directory listing, in seconds.
    pub dir_cache_timeout_secs: u64,
}

impl Default for VfsSettings {
    fn default() -> Self {
        Self {
            gc_timeout_secs: DEFAULT_GC_TIMEOUT,
            dir_cache_timeout_secs: DEFAULT_DIR_CACHE_TIMEOUT,
        }
    }
}

impl VfsSettings {
    /// Load settings from a JSON file. A missing file is not an error
    /// and yields the defaults.
    pub fn load(path: &Path) -> VfsResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(VfsError::io(
                    err,
                    OpContext::new()
                        .with_op("settings")
                        .with_path(path.display().to_string()),
                ));
            }
        };
        serde_json::from_str(&text)
            .map_err(|err| VfsError::Invalid(format!("settings file {}: {err}", path.display())))
    }

    #[must_use]
    pub fn gc_timeout(&self) -> Duration {
        Duration::from_secs(self.gc_timeout_secs)
    }

    #[must_use]
    pub fn dir_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.dir_cache_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = VfsSettings::default();
        assert_eq!(settings.gc_timeout(), Duration::from_secs(60));
        assert_eq!(settings.dir_cache_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let settings = VfsSettings::load(Path::new("/nonexistent/vfs.json")).unwrap();
        assert_eq!(settings.gc_timeout_secs, DEFAULT_GC_TIMEOUT);
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfs.json");
        std::fs::write(&path, r#"{"gc_timeout_secs": 5}"#).unwrap();
        let settings = VfsSettings::load(&path).unwrap();
        assert_eq!(settings.gc_timeout_secs, 5);
        assert_eq!(settings.dir_cache_timeout_secs, DEFAULT_DIR_CACHE_TIMEOUT);
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfs.json");
        std::fs::write(&path, r#"{"bogus": 1}"#).unwrap();
        assert!(VfsSettings::load(&path).is_err());
    }
}
