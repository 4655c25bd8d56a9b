//! On-disk package catalog
//!
//! The catalog is nothing more than the set of subdirectories of
//! `<storage>/packages` whose names parse as package ids. Install copies a
//! built package directory in (destination pre-cleared, so re-install is
//! idempotent); remove deletes the tree.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::manifest::PackageId;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("storage path not configured")]
    StorageUnconfigured,
    #[error("stat source {path}: {source}")]
    SourceStat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("source path must be a directory")]
    SourceNotDirectory,
    #[error("package manifest not found at {0}")]
    ManifestMissing(PathBuf),
    #[error("create storage directory: {0}")]
    CreateStorage(std::io::Error),
    #[error("clean destination: {0}")]
    CleanDestination(std::io::Error),
    #[error("copy package: {0}")]
    Copy(std::io::Error),
    #[error("remove package directory: {0}")]
    Remove(std::io::Error),
    #[error("read storage directory: {0}")]
    ReadStorage(std::io::Error),
}

/// A package residing in runtime storage, not necessarily loaded.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub package_id: String,
    pub path: PathBuf,
}

pub fn packages_root(storage: &Path) -> PathBuf {
    storage.join("packages")
}

/// Copy a built package directory into storage as `<id>`. The destination
/// is cleared first.
pub fn install(storage: &Path, id: &PackageId, source: &Path) -> Result<(), CatalogError> {
    if storage.as_os_str().is_empty() {
        return Err(CatalogError::StorageUnconfigured);
    }

    let meta = fs::metadata(source).map_err(|source_err| CatalogError::SourceStat {
        path: source.to_path_buf(),
        source: source_err,
    })?;
    if !meta.is_dir() {
        return Err(CatalogError::SourceNotDirectory);
    }

    let manifest = source.join("manifest.yaml");
    if !manifest.is_file() {
        return Err(CatalogError::ManifestMissing(manifest));
    }

    let root = packages_root(storage);
    fs::create_dir_all(&root).map_err(CatalogError::CreateStorage)?;

    let dest = root.join(id.to_string());
    if dest.exists() {
        fs::remove_dir_all(&dest).map_err(CatalogError::CleanDestination)?;
    }
    copy_dir(source, &dest).map_err(CatalogError::Copy)?;
    Ok(())
}

/// Delete the installed package directory. Missing directories are fine.
pub fn remove(storage: &Path, id: &PackageId) -> Result<(), CatalogError> {
    let dest = packages_root(storage).join(id.to_string());
    match fs::remove_dir_all(&dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CatalogError::Remove(err)),
    }
}

/// Enumerate storage. Entries whose names do not parse as package ids are
/// skipped; a missing packages directory yields an empty list.
pub fn list(storage: &Path) -> Result<Vec<InstalledPackage>, CatalogError> {
    let root = packages_root(storage);
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CatalogError::ReadStorage(err)),
    };

    let mut installed = Vec::new();
    for entry in entries {
        let entry = entry.map_err(CatalogError::ReadStorage)?;
        if !entry.file_type().map_err(CatalogError::ReadStorage)?.is_dir() {
            continue;
        }
        let dir_name = entry.file_name();
        let Some(dir_name) = dir_name.to_str() else {
            continue;
        };
        let Ok(id) = dir_name.parse::<PackageId>() else {
            continue;
        };
        installed.push(InstalledPackage {
            name: id.name,
            version: id.version,
            package_id: dir_name.to_string(),
            path: root.join(dir_name),
        });
    }
    installed.sort_by(|a, b| a.package_id.cmp(&b.package_id));
    Ok(installed)
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_package(dir: &Path) {
        fs::create_dir_all(dir.join("objs")).unwrap();
        fs::write(
            dir.join("manifest.yaml"),
            "metadata: {name: demo, version: \"1.0.0\"}\n",
        )
        .unwrap();
        fs::write(dir.join("objs/demo.o"), [0u8]).unwrap();
    }

    #[test]
    fn test_install_list_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        write_package(&source);
        let storage = tmp.path().join("storage");
        let id: PackageId = "demo@1.0.0".parse().unwrap();

        install(&storage, &id, &source).unwrap();
        assert!(storage
            .join("packages/demo@1.0.0/objs/demo.o")
            .is_file());

        let installed = list(&storage).unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].name, "demo");
        assert_eq!(installed[0].version, "1.0.0");
        assert_eq!(installed[0].package_id, "demo@1.0.0");

        remove(&storage, &id).unwrap();
        assert!(!storage.join("packages/demo@1.0.0").exists());
        assert!(list(&storage).unwrap().is_empty());
    }

    #[test]
    fn test_install_clears_stale_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        write_package(&source);
        let storage = tmp.path().join("storage");
        let id: PackageId = "demo@1.0.0".parse().unwrap();

        install(&storage, &id, &source).unwrap();
        let stale = storage.join("packages/demo@1.0.0/stale.o");
        fs::write(&stale, [1u8]).unwrap();

        install(&storage, &id, &source).unwrap();
        assert!(!stale.exists());
        assert!(storage.join("packages/demo@1.0.0/manifest.yaml").is_file());
    }

    #[test]
    fn test_install_requires_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("empty");
        fs::create_dir_all(&source).unwrap();
        let id: PackageId = "demo@1.0.0".parse().unwrap();

        let err = install(tmp.path(), &id, &source).unwrap_err();
        assert!(matches!(err, CatalogError::ManifestMissing(_)));
    }

    #[test]
    fn test_list_skips_foreign_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let root = packages_root(tmp.path());
        fs::create_dir_all(root.join("demo@1.0.0")).unwrap();
        fs::create_dir_all(root.join("no-version-here")).unwrap();
        fs::write(root.join("loose-file"), [0u8]).unwrap();

        let installed = list(tmp.path()).unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].package_id, "demo@1.0.0");
    }

    #[test]
    fn test_list_missing_storage_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list(&tmp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let id: PackageId = "ghost@0.0.1".parse().unwrap();
        remove(tmp.path(), &id).unwrap();
    }
}
