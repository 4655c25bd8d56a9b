//! KAI - kernel-attached observability runtime
//!
//! KAI turns declaratively described kernel-observability packages into
//! running, policy-checked eBPF programs. A package is a directory with a
//! YAML manifest plus compiled object files; the runtime discovers kernel
//! capabilities, validates the manifest against operator policy, loads the
//! bytecode, wires tail-call chains, attaches programs to kernel hooks,
//! prepares per-package sandboxes, streams events back from ring buffers,
//! and tears everything down without leaking kernel resources.
//!
//! # Modules
//!
//! - `manifest` - package manifest data model and identifiers
//! - `kcp` - one-shot kernel capability profile
//! - `policy` - operator policy engine
//! - `loader` - manifest parsing and eBPF program/map materialisation
//! - `chain` - tail-call chain wiring over program arrays
//! - `attach` - per-hook-type kernel attachment
//! - `runtime` - orchestrator, registry, catalog, sandboxes, remote index
//! - `config` - frozen process configuration (`KAI_*` overrides)
//! - `metrics` - Prometheus metrics
//!
//! # Quick Start
//!
//! ```ignore
//! use kai::{Config, Runtime};
//!
//! let runtime = Runtime::new(Config::from_env())?;
//! runtime.load_package("demo", "1.0.0").await?;
//! runtime.attach_package("demo@1.0.0", Default::default()).await?;
//! ```

pub mod attach;
pub mod chain;
pub mod config;
pub mod kcp;
pub mod loader;
pub mod manifest;
pub mod metrics;
pub mod policy;
pub mod runtime;

// Re-export the types transports interact with.
pub use attach::AttachOptions;
pub use config::Config;
pub use kcp::KernelProfile;
pub use manifest::{PackageId, PackageManifest, PackageStatus};
pub use policy::{PolicyEngine, PolicyReport};
pub use runtime::{
    InstalledPackage, PackageSummary, RawEvent, RemotePackage, Runtime, RuntimeError,
    ValidationInput,
};
