//! Runtime configuration
//!
//! The `KAI_*` environment overrides are read exactly once, at startup,
//! and frozen into a `Config` value handed to the runtime constructor.
//! Nothing consults the environment after that.

use std::env;
use std::path::PathBuf;

/// Storage root used when neither the config nor `KAI_ROOT` provides one.
pub const DEFAULT_STORAGE_ROOT: &str = "/tmp/kai";

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding `packages/` and `sandboxes/`.
    pub storage_path: PathBuf,
    /// Operator policy document. No policy engine is constructed when unset.
    pub policy_path: Option<PathBuf>,
    /// Default remote package index (HTTP(S) URL or local file path).
    pub index_url: Option<String>,
    /// Explicit `oras` binary. When unset the binary is resolved from PATH.
    pub oras_path: Option<PathBuf>,
}

impl Config {
    /// Build a config from the environment: `KAI_ROOT`, `KAI_POLICY` and
    /// `KAI_INDEX_URL`.
    pub fn from_env() -> Self {
        Self {
            storage_path: env::var_os("KAI_ROOT")
                .map(PathBuf::from)
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            policy_path: env::var_os("KAI_POLICY")
                .map(PathBuf::from)
                .filter(|p| !p.as_os_str().is_empty()),
            index_url: env::var("KAI_INDEX_URL").ok().filter(|u| !u.is_empty()),
            oras_path: None,
        }
    }

    /// Config rooted at an explicit storage directory, with everything
    /// else unset. The shape most tests and embedders want.
    pub fn with_storage(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            policy_path: None,
            index_url: None,
            oras_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_storage(DEFAULT_STORAGE_ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_storage_root() {
        let cfg = Config::default();
        assert_eq!(cfg.storage_path, PathBuf::from(DEFAULT_STORAGE_ROOT));
        assert!(cfg.policy_path.is_none());
        assert!(cfg.index_url.is_none());
    }

    #[test]
    fn test_env_override() {
        env::set_var("KAI_ROOT", "/var/lib/kai-test");
        let cfg = Config::from_env();
        env::remove_var("KAI_ROOT");
        assert_eq!(cfg.storage_path, PathBuf::from("/var/lib/kai-test"));
    }
}
