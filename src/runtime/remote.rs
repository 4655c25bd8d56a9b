//! Remote package index
//!
//! The index is a YAML document with a top-level `packages` list. It is
//! fetched over HTTP(S) when the location looks like a URL and read from
//! disk otherwise. Artifact pulls shell out to the `oras` CLI; the staging
//! directory is a `TempDir`, so it disappears on every exit path.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::info;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("recipe index URL not configured")]
    IndexUnconfigured,
    #[error("index fetch failed: {0}")]
    FetchStatus(reqwest::StatusCode),
    #[error("fetch index {url}: {source}")]
    Fetch {
        url: String,
        source: reqwest::Error,
    },
    #[error("read index {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse index: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("package {name}@{version} not found in index")]
    NotFound { name: String, version: String },
    #[error("package {name}@{version} missing OCI reference")]
    MissingOciRef { name: String, version: String },
    #[error("oras CLI not found in PATH")]
    OrasMissing,
    #[error("run oras: {0}")]
    OrasSpawn(std::io::Error),
    #[error("oras pull failed with status {0}")]
    OrasFailed(std::process::ExitStatus),
    #[error("pull cancelled")]
    Cancelled,
}

/// A package entry from the recipe index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotePackage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub source: RemoteSource,
    #[serde(default)]
    pub oci: OciRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSource {
    #[serde(default)]
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciRef {
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub digest: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub packages: Vec<RemotePackage>,
}

impl IndexDocument {
    pub fn find(&self, name: &str, version: &str) -> Result<&RemotePackage, RemoteError> {
        self.packages
            .iter()
            .find(|p| p.name == name && p.version == version)
            .ok_or_else(|| RemoteError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }
}

/// Fetch and parse the index document from a URL or a local path.
pub async fn load_index(location: &str) -> Result<IndexDocument, RemoteError> {
    let raw = if location.starts_with("http://") || location.starts_with("https://") {
        let response = reqwest::get(location)
            .await
            .map_err(|source| RemoteError::Fetch {
                url: location.to_string(),
                source,
            })?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(RemoteError::FetchStatus(response.status()));
        }
        response.text().await.map_err(|source| RemoteError::Fetch {
            url: location.to_string(),
            source,
        })?
    } else {
        tokio::fs::read_to_string(location)
            .await
            .map_err(|source| RemoteError::Read {
                path: PathBuf::from(location),
                source,
            })?
    };

    Ok(serde_yaml::from_str(&raw)?)
}

/// Resolve the `oras` binary: an explicit override first, then PATH.
pub fn find_oras(explicit: Option<&Path>) -> Result<PathBuf, RemoteError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(RemoteError::OrasMissing);
    }
    let path_var = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&path_var)
        .map(|dir| dir.join("oras"))
        .find(|candidate| candidate.is_file())
        .ok_or(RemoteError::OrasMissing)
}

/// `oras pull <ref>@<digest> -a -o <dest>` with output inherited. The
/// subprocess is killed if the caller cancels.
pub async fn oras_pull(
    oras: &Path,
    oci: &OciRef,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(), RemoteError> {
    let artifact = format!("{}@{}", oci.reference, oci.digest);
    info!("pulling {artifact}");

    let mut child = Command::new(oras)
        .arg("pull")
        .arg(&artifact)
        .arg("-a")
        .arg("-o")
        .arg(dest)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(RemoteError::OrasSpawn)?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(RemoteError::OrasSpawn)?;
            if status.success() {
                Ok(())
            } else {
                Err(RemoteError::OrasFailed(status))
            }
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            Err(RemoteError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
packages:
  - name: demo
    version: "1.0.0"
    license: Apache-2.0
    source:
      repo: https://example.invalid/demo.git
      ref: v1.0.0
    oci:
      ref: ghcr.io/example/demo
      digest: sha256:abcd
  - name: other
    version: "0.2.0"
"#;

    #[test]
    fn test_index_parse_and_find() {
        let doc: IndexDocument = serde_yaml::from_str(INDEX).unwrap();
        assert_eq!(doc.packages.len(), 2);

        let entry = doc.find("demo", "1.0.0").unwrap();
        assert_eq!(entry.license, "Apache-2.0");
        assert_eq!(entry.source.reference, "v1.0.0");
        assert_eq!(entry.oci.reference, "ghcr.io/example/demo");
        assert_eq!(entry.oci.digest, "sha256:abcd");

        let err = doc.find("demo", "2.0.0").unwrap_err();
        assert_eq!(err.to_string(), "package demo@2.0.0 not found in index");
    }

    #[test]
    fn test_index_entry_without_oci() {
        let doc: IndexDocument = serde_yaml::from_str(INDEX).unwrap();
        let entry = doc.find("other", "0.2.0").unwrap();
        assert!(entry.oci.reference.is_empty());
        assert!(entry.oci.digest.is_empty());
    }

    #[tokio::test]
    async fn test_load_index_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.yaml");
        std::fs::write(&path, INDEX).unwrap();

        let doc = load_index(path.to_str().unwrap()).await.unwrap();
        assert_eq!(doc.packages.len(), 2);
    }

    #[tokio::test]
    async fn test_load_index_missing_file() {
        let err = load_index("/nonexistent/kai-index.yaml").await.unwrap_err();
        assert!(matches!(err, RemoteError::Read { .. }));
    }

    #[test]
    fn test_find_oras_explicit_override() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("oras");
        std::fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();

        assert_eq!(find_oras(Some(&stub)).unwrap(), stub);
        assert!(matches!(
            find_oras(Some(&dir.path().join("missing"))),
            Err(RemoteError::OrasMissing)
        ));
    }
}
