//! Runtime orchestrator
//!
//! Owns the loaded-package registry and composes the loader, policy
//! engine, chain manager, attach manager and sandbox manager under a
//! single reader/writer lock. This is the `ToolRuntime` surface transports
//! call into; everything they see is an owned snapshot or a structured
//! error, never a reference into the registry.
//!
//! Lifecycle operations (load, attach, unload, install, remove, remote
//! install) serialise on the write half of the lock; listing and kernel
//! inspection take the read half. Long kernel syscalls run under the lock
//! by design.

pub mod catalog;
pub mod remote;
pub mod sandbox;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use aya::maps::RingBuf;
use log::{info, warn};
use serde::Serialize;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::attach::{AttachError, AttachManager, AttachOptions, HookTarget};
use crate::chain::{ChainError, ChainManager};
use crate::config::Config;
use crate::kcp::{KcpError, KernelProfile};
use crate::loader::{LoadError, LoadedPackage, Loader};
use crate::manifest::{InvalidPackageId, PackageId, PackageStatus};
use crate::metrics;
use crate::policy::{AttachCheck, PolicyEngine, PolicyError, PolicyReport};

pub use catalog::{CatalogError, InstalledPackage};
pub use remote::{RemoteError, RemotePackage};
pub use sandbox::{SandboxError, SandboxInfo, SandboxManager};

/// Events collected by `stream_events` exceed this count only when the
/// caller asks for more; zero falls back to it.
const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    InvalidId(#[from] InvalidPackageId),
    #[error("package {0} not loaded")]
    NotLoaded(String),
    #[error("map {0} not found")]
    MapNotFound(String),
    #[error("no programs available to attach")]
    NoPrograms,
    #[error("program definition for {0} missing")]
    ProgramDefMissing(String),
    #[error("entry program {0} not found")]
    EntryProgramMissing(String),
    #[error("load package {package_id}: {source}")]
    Load {
        package_id: String,
        source: LoadError,
    },
    #[error("prepare sandbox: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("initialise loader: {0}")]
    LoaderInit(LoadError),
    #[error("initialise policy engine: {0}")]
    PolicyInit(PolicyError),
    #[error("policy attach: {0}")]
    PolicyAttach(PolicyError),
    #[error("policy engine not configured")]
    PolicyUnconfigured,
    #[error("package identifier or manifest path required")]
    ValidationInput,
    #[error("read manifest: {0}")]
    Manifest(LoadError),
    #[error("wire chain: {0}")]
    Chain(#[from] ChainError),
    #[error("attach program: {0}")]
    Attach(#[from] AttachError),
    #[error("detect kernel: {0}")]
    Kernel(#[from] KcpError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("create ring buffer reader for {name}: {source}")]
    RingBuffer {
        name: String,
        source: aya::maps::MapError,
    },
    #[error("poll ring buffer: {0}")]
    EventPoll(std::io::Error),
    #[error("create staging directory: {0}")]
    Staging(std::io::Error),
}

/// Loads one package from a directory. The runtime depends on this
/// capability rather than the concrete loader.
pub trait PackageLoading: Send + Sync {
    fn load_package(&self, path: &Path) -> Result<LoadedPackage, LoadError>;
    fn profile(&self) -> &KernelProfile;
}

impl PackageLoading for Loader {
    fn load_package(&self, path: &Path) -> Result<LoadedPackage, LoadError> {
        Loader::load_package(self, path)
    }

    fn profile(&self) -> &KernelProfile {
        Loader::profile(self)
    }
}

/// Owned snapshot of a loaded package, safe to hand to transports.
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub package_id: String,
    pub status: PackageStatus,
    pub programs: Vec<String>,
    pub maps: Vec<String>,
    pub links: usize,
    pub chain_id: Option<String>,
    pub sandbox_root: Option<PathBuf>,
    pub loaded_at: SystemTime,
}

impl PackageSummary {
    fn of(package_id: &str, pkg: &LoadedPackage) -> Self {
        Self {
            package_id: package_id.to_string(),
            status: pkg.status,
            programs: pkg.program_ids(),
            maps: pkg.map_names(),
            links: pkg.links.len(),
            chain_id: pkg.chain_id.clone(),
            sandbox_root: pkg.sandbox.as_ref().map(|s| s.root.clone()),
            loaded_at: pkg.loaded_at,
        }
    }
}

/// One raw record pulled from a package's ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct RawEvent {
    pub raw: Vec<u8>,
    pub ts: SystemTime,
}

/// Input to `validate_package`: either an installed package id or an
/// explicit manifest path.
#[derive(Debug, Clone, Default)]
pub struct ValidationInput {
    pub package_id: Option<String>,
    pub manifest_path: Option<PathBuf>,
}

struct RuntimeState {
    packages: HashMap<String, LoadedPackage>,
    chains: ChainManager,
    sandboxes: SandboxManager,
    kernel: Option<KernelProfile>,
}

pub struct Runtime {
    config: Config,
    loader: Box<dyn PackageLoading>,
    attach: AttachManager,
    policy: Option<Arc<PolicyEngine>>,
    state: RwLock<RuntimeState>,
}

impl Runtime {
    /// Construct the runtime: build the policy engine when configured,
    /// probe the kernel through the loader, and start with an empty
    /// registry.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        let policy = match &config.policy_path {
            Some(path) => Some(Arc::new(
                PolicyEngine::from_file(path).map_err(RuntimeError::PolicyInit)?,
            )),
            None => None,
        };

        let loader = Loader::new(policy.clone()).map_err(RuntimeError::LoaderInit)?;
        let kernel = loader.profile().clone();
        Ok(Self::assemble(config, Box::new(loader), policy, Some(kernel)))
    }

    fn assemble(
        config: Config,
        loader: Box<dyn PackageLoading>,
        policy: Option<Arc<PolicyEngine>>,
        kernel: Option<KernelProfile>,
    ) -> Self {
        let sandboxes = SandboxManager::new(config.storage_path.clone());
        Self {
            config,
            loader,
            attach: AttachManager::new(),
            policy,
            state: RwLock::new(RuntimeState {
                packages: HashMap::new(),
                chains: ChainManager::new(),
                sandboxes,
                kernel,
            }),
        }
    }

    fn package_path(&self, name: &str, version: &str) -> PathBuf {
        let version = if version.is_empty() { "latest" } else { version };
        self.config
            .storage_path
            .join("packages")
            .join(format!("{name}@{version}"))
    }

    fn canonical_id(name: &str, version: &str) -> String {
        let version = if version.is_empty() { "latest" } else { version };
        format!("{name}@{version}")
    }

    /// Load a package from storage, or return the cached entry. A failed
    /// load leaves no registry entry, no kernel resources, and no sandbox
    /// directory behind.
    pub async fn load_package(
        &self,
        name: &str,
        version: &str,
    ) -> Result<PackageSummary, RuntimeError> {
        let mut state = self.state.write().await;

        let package_id = Self::canonical_id(name, version);
        if let Some(pkg) = state.packages.get(&package_id) {
            return Ok(PackageSummary::of(&package_id, pkg));
        }

        let path = self.package_path(name, version);
        let mut pkg = self
            .loader
            .load_package(&path)
            .map_err(|source| {
                metrics::LOAD_FAILURES.inc();
                RuntimeError::Load {
                    package_id: package_id.clone(),
                    source,
                }
            })?;

        // Kernel resources held by `pkg` roll back on drop if the sandbox
        // cannot be prepared.
        pkg.sandbox = Some(state.sandboxes.ensure(&package_id)?);

        info!(
            "loaded {package_id} ({} programs, {} maps)",
            pkg.programs.len(),
            pkg.maps.len()
        );
        metrics::PACKAGE_LOADS
            .with_label_values(&[package_id.as_str()])
            .inc();
        let summary = PackageSummary::of(&package_id, &pkg);
        state.packages.insert(package_id, pkg);
        metrics::LOADED_PACKAGES.set(state.packages.len() as f64);
        Ok(summary)
    }

    /// Wire the package's chain (when declared) and attach its entry
    /// program. On success the attach handle is appended to the package's
    /// links; error paths leave the links untouched.
    pub async fn attach_package(
        &self,
        package_id: &str,
        opts: AttachOptions,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;
        let RuntimeState {
            packages, chains, ..
        } = &mut *state;
        let pkg = packages
            .get_mut(package_id)
            .ok_or_else(|| RuntimeError::NotLoaded(package_id.to_string()))?;

        if let Some(policy) = &self.policy {
            let check = AttachCheck {
                package_id,
                manifest: &pkg.manifest,
                cgroup_path: opts.cgroup_path.as_deref(),
                interface: opts.interface.as_deref(),
                sandbox: pkg.sandbox.as_ref(),
            };
            policy
                .validate_attach(&check)
                .map_err(RuntimeError::PolicyAttach)?;
        }

        let chain_def = pkg.manifest.interface.chain.clone();
        if !chain_def.entry.is_empty() {
            chains.wire_chain(pkg, &chain_def)?;
        }

        let entry_id = if !chain_def.entry.is_empty() {
            chain_def.entry.clone()
        } else {
            pkg.manifest
                .interface
                .programs
                .first()
                .map(|p| p.id.clone())
                .ok_or(RuntimeError::NoPrograms)?
        };

        let entry_def = pkg
            .manifest
            .program(&entry_id)
            .cloned()
            .ok_or_else(|| RuntimeError::ProgramDefMissing(entry_id.clone()))?;
        let target = HookTarget::resolve(&entry_def, &opts)?;

        let program = pkg
            .program_mut(&entry_id)
            .ok_or_else(|| RuntimeError::EntryProgramMissing(entry_id.clone()))?;
        let handle = self.attach.attach_program(program, &target)?;

        pkg.links.push(handle);
        pkg.status = PackageStatus::Attached;
        info!("attached {package_id} via {entry_id}");
        metrics::PACKAGE_ATTACHES
            .with_label_values(&[package_id])
            .inc();
        Ok(())
    }

    /// Read up to `limit` records from the named ring buffer (zero means
    /// 100). The loop ends on the limit, on cancellation, or on a poll
    /// error; whatever was collected is returned either way.
    pub async fn stream_events(
        &self,
        package_id: &str,
        buffer_name: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawEvent>, RuntimeError> {
        let mut state = self.state.write().await;
        let pkg = state
            .packages
            .get_mut(package_id)
            .ok_or_else(|| RuntimeError::NotLoaded(package_id.to_string()))?;
        let map = pkg
            .map_mut(buffer_name)
            .ok_or_else(|| RuntimeError::MapNotFound(buffer_name.to_string()))?;

        let ring = RingBuf::try_from(map).map_err(|source| RuntimeError::RingBuffer {
            name: buffer_name.to_string(),
            source,
        })?;
        let mut poll =
            AsyncFd::with_interest(ring, Interest::READABLE).map_err(RuntimeError::EventPoll)?;

        let limit = if limit == 0 { DEFAULT_EVENT_LIMIT } else { limit };
        let mut events = Vec::with_capacity(limit.min(DEFAULT_EVENT_LIMIT));

        'collect: while events.len() < limit {
            let mut guard = tokio::select! {
                readable = poll.readable_mut() => match readable {
                    Ok(guard) => guard,
                    Err(_) => break 'collect,
                },
                _ = cancel.cancelled() => break 'collect,
            };

            while events.len() < limit {
                match guard.get_inner_mut().next() {
                    Some(record) => events.push(RawEvent {
                        raw: record.to_vec(),
                        ts: SystemTime::now(),
                    }),
                    None => break,
                }
            }
            guard.clear_ready();
        }

        metrics::EVENTS_STREAMED.inc_by(events.len() as f64);
        Ok(events)
    }

    /// Tear the package down in reverse order: links, chain, programs and
    /// maps, sandbox, registry entry. Individual handle failures are
    /// logged and skipped so unload always completes.
    pub async fn unload_package(&self, package_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;
        self.unload_locked(&mut state, package_id)
    }

    fn unload_locked(
        &self,
        state: &mut RuntimeState,
        package_id: &str,
    ) -> Result<(), RuntimeError> {
        let RuntimeState {
            packages,
            chains,
            sandboxes,
            ..
        } = state;
        let pkg = packages
            .get_mut(package_id)
            .ok_or_else(|| RuntimeError::NotLoaded(package_id.to_string()))?;

        for handle in pkg.links.drain(..) {
            if let Err(err) = self.attach.detach(handle) {
                warn!("detach link for {package_id}: {err}");
            }
        }
        if let Some(chain_id) = pkg.chain_id.take() {
            chains.delete_chain(&chain_id);
        }
        // Programs close with the objects that own them, then the maps.
        pkg.objects.clear();
        pkg.programs.clear();
        pkg.maps.clear();
        pkg.status = PackageStatus::Stopped;
        sandboxes.remove(package_id);
        packages.remove(package_id);

        info!("unloaded {package_id}");
        metrics::PACKAGE_UNLOADS
            .with_label_values(&[package_id])
            .inc();
        metrics::LOADED_PACKAGES.set(packages.len() as f64);
        Ok(())
    }

    /// Snapshot every loaded package.
    pub async fn list_packages(&self) -> Vec<PackageSummary> {
        let state = self.state.read().await;
        let mut list: Vec<PackageSummary> = state
            .packages
            .iter()
            .map(|(id, pkg)| PackageSummary::of(id, pkg))
            .collect();
        list.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        list
    }

    /// Copy a built package directory into runtime storage.
    pub async fn install_package(
        &self,
        package_id: &str,
        source: &Path,
    ) -> Result<(), RuntimeError> {
        let id: PackageId = package_id.parse()?;
        let _state = self.state.write().await;
        catalog::install(&self.config.storage_path, &id, source)?;
        info!("installed {id} from {}", source.display());
        Ok(())
    }

    /// Unload the package if it is loaded, then delete it from storage.
    pub async fn remove_package(&self, package_id: &str) -> Result<(), RuntimeError> {
        let id: PackageId = package_id.parse()?;
        let mut state = self.state.write().await;
        match self.unload_locked(&mut state, package_id) {
            Ok(()) | Err(RuntimeError::NotLoaded(_)) => {}
            Err(err) => return Err(err),
        }
        catalog::remove(&self.config.storage_path, &id)?;
        info!("removed {id}");
        Ok(())
    }

    /// Enumerate packages present in runtime storage.
    pub async fn list_installed_packages(&self) -> Result<Vec<InstalledPackage>, RuntimeError> {
        let _state = self.state.read().await;
        Ok(catalog::list(&self.config.storage_path)?)
    }

    /// Download and parse the recipe index.
    pub async fn list_remote_packages(
        &self,
        index_url: Option<&str>,
    ) -> Result<Vec<RemotePackage>, RuntimeError> {
        let url = self.resolve_index_url(index_url)?;
        let _state = self.state.read().await;
        let doc = remote::load_index(&url).await?;
        Ok(doc.packages)
    }

    /// Pull `name@version` through `oras` into a staging directory and
    /// install it. The staging directory is removed on every exit path.
    pub async fn install_from_remote(
        &self,
        index_url: Option<&str>,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let url = self.resolve_index_url(index_url)?;
        let _state = self.state.write().await;

        let doc = remote::load_index(&url).await?;
        let entry = doc.find(name, version)?;
        if entry.oci.reference.is_empty() || entry.oci.digest.is_empty() {
            return Err(RemoteError::MissingOciRef {
                name: name.to_string(),
                version: version.to_string(),
            }
            .into());
        }

        let oras = remote::find_oras(self.config.oras_path.as_deref())?;
        let staging = tempfile::tempdir().map_err(RuntimeError::Staging)?;
        remote::oras_pull(&oras, &entry.oci, staging.path(), cancel).await?;

        let id: PackageId = format!("{name}@{version}").parse()?;
        catalog::install(&self.config.storage_path, &id, staging.path())?;
        info!("installed {id} from {}", entry.oci.reference);
        Ok(())
    }

    /// Evaluate a manifest against the configured policy engine and return
    /// the structured report.
    pub async fn validate_package(
        &self,
        input: ValidationInput,
    ) -> Result<PolicyReport, RuntimeError> {
        let policy = self.policy.as_ref().ok_or(RuntimeError::PolicyUnconfigured)?;

        let manifest_path = match (&input.manifest_path, &input.package_id) {
            (Some(path), _) => path.clone(),
            (None, Some(package_id)) => {
                let id: PackageId = package_id.parse()?;
                self.package_path(&id.name, &id.version).join("manifest.yaml")
            }
            (None, None) => return Err(RuntimeError::ValidationInput),
        };

        let manifest =
            crate::loader::parse_manifest(&manifest_path).map_err(RuntimeError::Manifest)?;
        let package_path = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(policy.report_package(&package_path, &manifest))
    }

    /// Return the cached kernel profile, probing once if it is empty.
    pub async fn inspect_kernel(&self) -> Result<KernelProfile, RuntimeError> {
        {
            let state = self.state.read().await;
            if let Some(profile) = &state.kernel {
                return Ok(profile.clone());
            }
        }

        let profile = KernelProfile::detect()?;
        let mut state = self.state.write().await;
        Ok(state.kernel.get_or_insert(profile).clone())
    }

    fn resolve_index_url(&self, index_url: Option<&str>) -> Result<String, RuntimeError> {
        index_url
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.index_url.clone())
            .ok_or_else(|| RemoteError::IndexUnconfigured.into())
    }
}
