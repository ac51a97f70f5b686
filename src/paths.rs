//! Path resolution for clusterforge
//!
//! # Environment Variables
//!
//! - `CLUSTERFORGE_CONFIG` - Cluster file to load when `--config` is not given
//! - `CLUSTERFORGE_WORK_DIR` - Override the artifact work directory
//!
//! # Path Resolution Priority
//!
//! For config_file():
//! 1. `--config` argument
//! 2. `CLUSTERFORGE_CONFIG` environment variable
//! 3. `cluster.toml` in the current directory
//!
//! For work_dir():
//! 1. `CLUSTERFORGE_WORK_DIR` environment variable
//! 2. `work_dir` from the cluster file
//! 3. Platform data directory: `~/.local/share/clusterforge` on Linux

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for the cluster file
pub const ENV_CONFIG: &str = "CLUSTERFORGE_CONFIG";

/// Environment variable for the work directory override
pub const ENV_WORK_DIR: &str = "CLUSTERFORGE_WORK_DIR";

/// Cluster file name looked up in the current directory
pub const DEFAULT_CONFIG_FILE: &str = "cluster.toml";

/// Resolve the cluster file to load.
pub fn config_file(arg: Option<&Path>) -> PathBuf {
    if let Some(path) = arg {
        return expand(&path.to_string_lossy());
    }

    if let Ok(file) = std::env::var(ENV_CONFIG) {
        let path = expand(&file);
        log::debug!("Using cluster file from {}: {}", ENV_CONFIG, path.display());
        return path;
    }

    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Resolve the work directory artifacts are cached under.
pub fn work_dir(configured: Option<&str>) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_WORK_DIR) {
        let path = expand(&dir);
        log::debug!("Using work dir from {}: {}", ENV_WORK_DIR, path.display());
        return Ok(path);
    }

    if let Some(dir) = configured {
        return Ok(expand(dir));
    }

    if let Some(data) = dirs::data_local_dir() {
        return Ok(data.join("clusterforge"));
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("share").join("clusterforge"))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, PoisonError};

    // Tests touching the same variables must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Run `f` with `key` set to `value`, restoring the previous value after.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    fn without_env_var<F, R>(key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::remove_var(key) };
        let result = f();
        if let Some(v) = original {
            // SAFETY: Tests run in isolation
            unsafe { env::set_var(key, v) };
        }
        result
    }

    #[test]
    fn test_config_file_argument_wins() {
        with_env_var(ENV_CONFIG, "/from/env.toml", || {
            let path = config_file(Some(Path::new("/from/arg.toml")));
            assert_eq!(path, PathBuf::from("/from/arg.toml"));
        });
    }

    #[test]
    fn test_config_file_env_override() {
        with_env_var(ENV_CONFIG, "/from/env.toml", || {
            assert_eq!(config_file(None), PathBuf::from("/from/env.toml"));
        });
    }

    #[test]
    fn test_config_file_default() {
        without_env_var(ENV_CONFIG, || {
            assert_eq!(config_file(None), PathBuf::from("cluster.toml"));
        });
    }

    #[test]
    fn test_work_dir_env_override() {
        with_env_var(ENV_WORK_DIR, "/srv/forge", || {
            assert_eq!(
                work_dir(Some("/configured")).unwrap(),
                PathBuf::from("/srv/forge")
            );
        });
    }

    #[test]
    fn test_work_dir_configured() {
        without_env_var(ENV_WORK_DIR, || {
            assert_eq!(
                work_dir(Some("/configured")).unwrap(),
                PathBuf::from("/configured")
            );
        });
    }

    #[test]
    fn test_work_dir_default_ends_with_clusterforge() {
        without_env_var(ENV_WORK_DIR, || {
            assert!(work_dir(None).unwrap().ends_with("clusterforge"));
        });
    }

    #[test]
    fn test_expand_with_tilde() {
        let result = expand("~/forge");
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home.join("forge"));
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand("/path/$NONEXISTENT_FORGE_VAR_12345/file");
        assert_eq!(
            result,
            PathBuf::from("/path/$NONEXISTENT_FORGE_VAR_12345/file")
        );
    }
}
