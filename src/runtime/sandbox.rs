//! Per-package sandboxes
//!
//! Each loaded package gets a directory tree under
//! `<storage>/sandboxes/<sanitised id>/` with a `bpffs/` mount point for
//! pin isolation. Exactly one sandbox exists per loaded package; removal
//! happens only when the package unloads.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use log::warn;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox root not configured")]
    RootUnconfigured,
    #[error("prepare sandbox directories for {package_id}: {source}")]
    Prepare {
        package_id: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub package_id: String,
    pub root: PathBuf,
    pub bpffs_path: PathBuf,
    pub uid_namespace: bool,
    pub created_at: SystemTime,
}

impl SandboxInfo {
    #[cfg(test)]
    pub(crate) fn for_tests(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            root: PathBuf::from("/tmp/kai-test-sandbox"),
            bpffs_path: PathBuf::from("/tmp/kai-test-sandbox/bpffs"),
            uid_namespace: true,
            created_at: SystemTime::now(),
        }
    }
}

pub struct SandboxManager {
    root: PathBuf,
    sandboxes: HashMap<String, SandboxInfo>,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sandboxes: HashMap::new(),
        }
    }

    /// Create the sandbox tree for a package, or hand back the existing
    /// record when the package already has one.
    pub fn ensure(&mut self, package_id: &str) -> Result<SandboxInfo, SandboxError> {
        if let Some(info) = self.sandboxes.get(package_id) {
            return Ok(info.clone());
        }
        if self.root.as_os_str().is_empty() {
            return Err(SandboxError::RootUnconfigured);
        }

        let base = self
            .root
            .join("sandboxes")
            .join(sanitize_sandbox_id(package_id));
        let bpffs = base.join("bpffs");
        fs::create_dir_all(&bpffs).map_err(|source| SandboxError::Prepare {
            package_id: package_id.to_string(),
            source,
        })?;

        let info = SandboxInfo {
            package_id: package_id.to_string(),
            root: base,
            bpffs_path: bpffs,
            // Prepared for user-namespace isolation.
            uid_namespace: true,
            created_at: SystemTime::now(),
        };
        self.sandboxes.insert(package_id.to_string(), info.clone());
        Ok(info)
    }

    /// Drop the record and delete the directory tree. Failures to delete
    /// are logged, not surfaced; unload must make forward progress.
    pub fn remove(&mut self, package_id: &str) {
        if let Some(info) = self.sandboxes.remove(package_id) {
            if let Err(err) = fs::remove_dir_all(&info.root) {
                warn!("remove sandbox {}: {err}", info.root.display());
            }
        }
    }

    pub fn contains(&self, package_id: &str) -> bool {
        self.sandboxes.contains_key(package_id)
    }

    pub fn sandbox_dir(&self, package_id: &str) -> PathBuf {
        self.root
            .join("sandboxes")
            .join(sanitize_sandbox_id(package_id))
    }
}

/// Package ids appear in filesystem paths; `/`, `@` and `:` become `_`.
fn sanitize_sandbox_id(package_id: &str) -> String {
    package_id
        .chars()
        .map(|c| match c {
            '/' | '@' | ':' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_sandbox_id() {
        assert_eq!(sanitize_sandbox_id("demo@1.0.0"), "demo_1.0.0");
        assert_eq!(sanitize_sandbox_id("org/pkg@2:1"), "org_pkg_2_1");
        assert_eq!(sanitize_sandbox_id("plain"), "plain");
    }

    #[test]
    fn test_ensure_creates_tree_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SandboxManager::new(dir.path());

        let first = manager.ensure("demo@1.0.0").unwrap();
        assert!(first.bpffs_path.is_dir());
        assert!(first.uid_namespace);
        assert!(first.root.ends_with("sandboxes/demo_1.0.0"));

        let second = manager.ensure("demo@1.0.0").unwrap();
        assert_eq!(first.root, second.root);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn test_remove_deletes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SandboxManager::new(dir.path());

        let info = manager.ensure("demo@1.0.0").unwrap();
        assert!(info.root.exists());

        manager.remove("demo@1.0.0");
        assert!(!manager.contains("demo@1.0.0"));
        assert!(!info.root.exists());

        // Removing an unknown package is a no-op.
        manager.remove("ghost@0.0.1");
    }

    #[test]
    fn test_unconfigured_root() {
        let mut manager = SandboxManager::new("");
        let err = manager.ensure("demo@1.0.0").unwrap_err();
        assert!(matches!(err, SandboxError::RootUnconfigured));
    }
}
