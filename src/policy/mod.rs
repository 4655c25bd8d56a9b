//! Operator policy engine
//!
//! Loads a YAML policy document and evaluates package manifests, on-disk
//! artifacts, and attach requests against it. Checks never short-circuit:
//! every breached rule produces its own violation, and the full list is
//! returned either structurally (`report_package`) or joined with `"; "`
//! in the error message for single-result callers.
//!
//! Absent lists behave permissively: an empty allow-list allows everything,
//! an empty deny-list denies nothing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::manifest::{MapDef, PackageManifest, ParameterDef};
use crate::runtime::sandbox::SandboxInfo;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("read policy config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse policy config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("{}", .0.join("; "))]
    Violations(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allowed_packages: Vec<String>,
    #[serde(default)]
    pub denied_packages: Vec<String>,
    #[serde(default)]
    pub allowed_attach_points: Vec<String>,
    #[serde(default)]
    pub denied_attach_points: Vec<String>,
    #[serde(default)]
    pub allowed_capabilities: Vec<String>,
    #[serde(default)]
    pub denied_capabilities: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub namespace_enforcement: NamespaceRules,
    #[serde(default)]
    pub signature_verification: SignatureRules,
    #[serde(default)]
    pub sandbox: SandboxRules,
}

/// Resource ceilings. Zero disables a limit. The event-rate, namespace and
/// sandbox-count fields are accepted for compatibility with existing
/// operator documents but carry no enforcement yet.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub max_programs_per_chain: usize,
    #[serde(default)]
    pub max_map_memory_mb: u64,
    #[serde(default)]
    pub max_program_size_bytes: u64,
    #[serde(default)]
    pub max_events_per_sec: u64,
    #[serde(default)]
    pub max_attach_namespaces: u64,
    #[serde(default)]
    pub max_concurrent_sandboxes: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamespaceRules {
    #[serde(default)]
    pub require_cgroup_filter: bool,
    #[serde(default)]
    pub default_scope: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureRules {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub trusted_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxRules {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub require_uid_namespace: bool,
    #[serde(default)]
    pub require_isolated_bpffs: bool,
}

/// Runtime context evaluated when a package asks to attach.
#[derive(Debug)]
pub struct AttachCheck<'a> {
    pub package_id: &'a str,
    pub manifest: &'a PackageManifest,
    pub cgroup_path: Option<&'a str>,
    pub interface: Option<&'a str>,
    pub sandbox: Option<&'a SandboxInfo>,
}

/// Structured policy evaluation result.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    pub package: String,
    pub violations: Vec<String>,
    pub passed: bool,
}

pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let data = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_yaml::from_str(&data).map_err(|source| PolicyError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { config })
    }

    pub fn from_config(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Manifest-level safety checks.
    pub fn validate_package(&self, manifest: &PackageManifest) -> Result<(), PolicyError> {
        into_result(self.collect_package_violations(manifest))
    }

    /// Filesystem rules (program object size caps).
    pub fn validate_artifacts(
        &self,
        package_path: &Path,
        manifest: &PackageManifest,
    ) -> Result<(), PolicyError> {
        into_result(self.collect_artifact_violations(package_path, manifest))
    }

    /// Namespace and sandbox constraints at attach time.
    pub fn validate_attach(&self, check: &AttachCheck<'_>) -> Result<(), PolicyError> {
        into_result(self.collect_attach_violations(check))
    }

    /// Structured report composing the manifest- and artifact-level checks.
    pub fn report_package(&self, package_path: &Path, manifest: &PackageManifest) -> PolicyReport {
        let mut violations = self.collect_package_violations(manifest);
        violations.extend(self.collect_artifact_violations(package_path, manifest));
        PolicyReport {
            package: manifest.metadata.name.clone(),
            passed: violations.is_empty(),
            violations,
        }
    }

    fn collect_package_violations(&self, manifest: &PackageManifest) -> Vec<String> {
        let mut violations = Vec::new();
        let name = &manifest.metadata.name;

        if !self.package_allowed(name) {
            violations.push(format!("package {name} not allowed by policy"));
        }
        if self.package_denied(name) {
            violations.push(format!("package {name} explicitly denied"));
        }

        for prog in &manifest.interface.programs {
            let tag = prog.attach_type.as_str();
            if self.config.denied_attach_points.iter().any(|d| d == tag) {
                violations.push(format!("attach point {tag} denied by policy"));
            } else if !self.attach_point_allowed(tag) {
                violations.push(format!("attach point {tag} not permitted"));
            }
        }

        let limit = self.config.limits.max_programs_per_chain;
        if limit > 0 && manifest.interface.programs.len() > limit {
            violations.push(format!(
                "too many programs ({} > {})",
                manifest.interface.programs.len(),
                limit
            ));
        }

        let max_mem = self.config.limits.max_map_memory_mb;
        if max_mem > 0 {
            let usage = estimate_map_memory(&manifest.interface.maps);
            if usage > max_mem * 1024 * 1024 {
                violations.push(format!("map memory usage {usage} exceeds {max_mem} MB"));
            }
        }

        if self.config.namespace_enforcement.require_cgroup_filter
            && !supports_cgroup_filter(&manifest.interface.parameters)
        {
            violations.push("package must expose cgroup filtering parameter".to_string());
        }

        for cap in &manifest.requirements.capabilities {
            if self.config.denied_capabilities.iter().any(|d| d == cap) {
                violations.push(format!("capability {cap} denied by policy"));
            }
            if !self.config.allowed_capabilities.is_empty()
                && !self.config.allowed_capabilities.iter().any(|a| a == cap)
            {
                violations.push(format!("capability {cap} not in allowlist"));
            }
        }

        for required in &self.config.required_capabilities {
            if !manifest
                .requirements
                .capabilities
                .iter()
                .any(|c| c == required)
            {
                violations.push(format!("capability {required} required by policy"));
            }
        }

        violations
    }

    fn collect_artifact_violations(
        &self,
        package_path: &Path,
        manifest: &PackageManifest,
    ) -> Vec<String> {
        let limit = self.config.limits.max_program_size_bytes;
        if limit == 0 || package_path.as_os_str().is_empty() {
            return Vec::new();
        }

        let mut violations = Vec::new();
        for prog in &manifest.interface.programs {
            let target = if Path::new(&prog.file).is_absolute() {
                PathBuf::from(&prog.file)
            } else {
                package_path.join(&prog.file)
            };
            match fs::metadata(&target) {
                Err(err) => violations.push(format!("stat program {}: {err}", prog.file)),
                Ok(meta) => {
                    let size = meta.len();
                    if size > limit {
                        violations.push(format!(
                            "program {} size {size} exceeds limit {limit} bytes",
                            prog.id
                        ));
                    }
                }
            }
        }
        violations
    }

    fn collect_attach_violations(&self, check: &AttachCheck<'_>) -> Vec<String> {
        let mut violations = Vec::new();

        if self.config.namespace_enforcement.require_cgroup_filter
            && check.cgroup_path.map_or(true, str::is_empty)
        {
            violations.push("attachment requires cgroup namespace per policy".to_string());
        }

        if self.config.sandbox.enabled {
            match check.sandbox {
                None => violations.push("sandbox metadata missing for attachment".to_string()),
                Some(sandbox) => {
                    if self.config.sandbox.require_uid_namespace && !sandbox.uid_namespace {
                        violations
                            .push("sandbox must enable UID namespace isolation".to_string());
                    }
                    if self.config.sandbox.require_isolated_bpffs
                        && sandbox.bpffs_path.as_os_str().is_empty()
                    {
                        violations.push("sandbox missing isolated bpffs mount".to_string());
                    }
                }
            }
        }

        violations
    }

    fn package_allowed(&self, name: &str) -> bool {
        self.config.allowed_packages.is_empty()
            || self
                .config
                .allowed_packages
                .iter()
                .any(|p| match_pattern(p, name))
    }

    fn package_denied(&self, name: &str) -> bool {
        self.config
            .denied_packages
            .iter()
            .any(|p| match_pattern(p, name))
    }

    fn attach_point_allowed(&self, tag: &str) -> bool {
        self.config.allowed_attach_points.is_empty()
            || self.config.allowed_attach_points.iter().any(|a| a == tag)
    }
}

fn into_result(violations: Vec<String>) -> Result<(), PolicyError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(PolicyError::Violations(violations))
    }
}

/// `*` matches everything, a trailing `*` matches by prefix, anything else
/// matches exactly.
fn match_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

fn supports_cgroup_filter(params: &[ParameterDef]) -> bool {
    params.iter().any(|p| p.name.contains("cgroup"))
}

/// Rough worst-case resident size: `(key + value) * max_entries` summed
/// across maps, using the schema's widths (4 bytes when unspecified).
fn estimate_map_memory(maps: &[MapDef]) -> u64 {
    maps.iter()
        .map(|m| {
            (u64::from(m.schema.key_size()) + u64::from(m.schema.value_size()))
                * u64::from(m.max_entries)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        AttachType, Interface, MapKind, Metadata, ProgramDef, Requirements, Schema,
    };

    fn program(attach_type: AttachType) -> ProgramDef {
        ProgramDef {
            id: "probe".to_string(),
            file: "probe.o".to_string(),
            section: "probe".to_string(),
            attach_type,
            attach_to: String::new(),
        }
    }

    fn parameter(name: &str) -> ParameterDef {
        ParameterDef {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn map_with_schema(key_type: &str, value_type: &str, max_entries: u32) -> MapDef {
        MapDef {
            name: "counts".to_string(),
            kind: MapKind::Hash,
            purpose: String::new(),
            max_entries,
            pin: None,
            schema: Schema {
                key_type: key_type.to_string(),
                value_type: value_type.to_string(),
                ..Default::default()
            },
            defaults: Default::default(),
        }
    }

    #[test]
    fn test_match_pattern() {
        let cases = [
            ("*", "anything", true),
            ("falco-*", "falco-syscalls", true),
            ("falco-*", "tracee-syscalls", false),
            ("tracee", "tracee", true),
            ("tracee", "tracee-x", false),
        ];
        for (pattern, value, want) in cases {
            assert_eq!(match_pattern(pattern, value), want, "({pattern}, {value})");
        }
    }

    #[test]
    fn test_supports_cgroup_filter() {
        assert!(supports_cgroup_filter(&[parameter("filter_by_cgroup")]));
        assert!(!supports_cgroup_filter(&[parameter("pid_filter")]));
        assert!(!supports_cgroup_filter(&[]));
    }

    #[test]
    fn test_estimate_map_memory() {
        // u32 key + u64 value, two entries.
        let usage = estimate_map_memory(&[map_with_schema("u32", "u64", 2)]);
        assert_eq!(usage, 24);

        // Unspecified schema falls back to 4-byte keys and values.
        let usage = estimate_map_memory(&[map_with_schema("", "", 10)]);
        assert_eq!(usage, (4 + 4) * 10);
    }

    #[test]
    fn test_validate_package_passes() {
        let engine = PolicyEngine::from_config(PolicyConfig {
            allowed_packages: vec!["falco-*".to_string()],
            allowed_attach_points: vec!["kprobe".to_string()],
            allowed_capabilities: vec!["CAP_BPF".to_string()],
            limits: Limits {
                max_programs_per_chain: 4,
                max_map_memory_mb: 1,
                max_program_size_bytes: 1024,
                ..Default::default()
            },
            namespace_enforcement: NamespaceRules {
                require_cgroup_filter: true,
                ..Default::default()
            },
            ..Default::default()
        });

        let manifest = PackageManifest {
            metadata: Metadata {
                name: "falco-syscalls".to_string(),
                ..Default::default()
            },
            interface: Interface {
                programs: vec![program(AttachType::Kprobe)],
                maps: vec![map_with_schema("u32", "u32", 1)],
                parameters: vec![parameter("filter_by_cgroup")],
                ..Default::default()
            },
            requirements: Requirements {
                capabilities: vec!["CAP_BPF".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        engine.validate_package(&manifest).unwrap();
    }

    #[test]
    fn test_denied_attach_point_message() {
        let engine = PolicyEngine::from_config(PolicyConfig {
            allowed_attach_points: vec!["tracepoint".to_string()],
            ..Default::default()
        });
        let manifest = PackageManifest {
            interface: Interface {
                programs: vec![program(AttachType::Kprobe)],
                ..Default::default()
            },
            ..Default::default()
        };

        let err = engine.validate_package(&manifest).unwrap_err();
        let PolicyError::Violations(violations) = &err else {
            panic!("expected violations, got {err}");
        };
        assert_eq!(violations, &vec!["attach point kprobe not permitted".to_string()]);
    }

    #[test]
    fn test_violations_are_complete() {
        let engine = PolicyEngine::from_config(PolicyConfig {
            allowed_packages: vec!["allowed-only".to_string()],
            denied_attach_points: vec!["xdp".to_string()],
            required_capabilities: vec!["CAP_BPF".to_string()],
            limits: Limits {
                max_programs_per_chain: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        let manifest = PackageManifest {
            metadata: Metadata {
                name: "other".to_string(),
                ..Default::default()
            },
            interface: Interface {
                programs: vec![program(AttachType::Xdp), program(AttachType::Kprobe)],
                ..Default::default()
            },
            ..Default::default()
        };

        let err = engine.validate_package(&manifest).unwrap_err();
        let PolicyError::Violations(violations) = err else {
            panic!("expected violations");
        };
        // One entry per breached rule: name allow-list, denied xdp,
        // program-count limit, missing required capability.
        assert_eq!(violations.len(), 4);
        assert!(violations.iter().any(|v| v.contains("not allowed")));
        assert!(violations.iter().any(|v| v.contains("xdp denied")));
        assert!(violations.iter().any(|v| v.contains("too many programs")));
        assert!(violations.iter().any(|v| v.contains("CAP_BPF required")));
    }

    #[test]
    fn test_validate_artifacts_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("probe.o"), vec![0u8; 8]).unwrap();

        let engine = PolicyEngine::from_config(PolicyConfig {
            limits: Limits {
                max_program_size_bytes: 4,
                ..Default::default()
            },
            ..Default::default()
        });
        let manifest = PackageManifest {
            interface: Interface {
                programs: vec![program(AttachType::Kprobe)],
                ..Default::default()
            },
            ..Default::default()
        };

        let err = engine.validate_artifacts(dir.path(), &manifest).unwrap_err();
        assert!(err.to_string().contains("size 8 exceeds limit 4"));
    }

    #[test]
    fn test_validate_attach() {
        let engine = PolicyEngine::from_config(PolicyConfig {
            namespace_enforcement: NamespaceRules {
                require_cgroup_filter: true,
                ..Default::default()
            },
            sandbox: SandboxRules {
                enabled: true,
                require_uid_namespace: true,
                require_isolated_bpffs: true,
            },
            ..Default::default()
        });
        let manifest = PackageManifest::default();

        let err = engine
            .validate_attach(&AttachCheck {
                package_id: "demo@1.0.0",
                manifest: &manifest,
                cgroup_path: None,
                interface: None,
                sandbox: None,
            })
            .unwrap_err();
        let PolicyError::Violations(violations) = err else {
            panic!("expected violations");
        };
        assert_eq!(violations.len(), 2);

        let sandbox = SandboxInfo::for_tests("demo@1.0.0");
        engine
            .validate_attach(&AttachCheck {
                package_id: "demo@1.0.0",
                manifest: &manifest,
                cgroup_path: Some("/sys/fs/cgroup/demo"),
                interface: None,
                sandbox: Some(&sandbox),
            })
            .unwrap();
    }

    #[test]
    fn test_report_package_structure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("probe.o"), vec![1u8; 8]).unwrap();

        let engine = PolicyEngine::from_config(PolicyConfig {
            allowed_packages: vec!["demo".to_string()],
            limits: Limits {
                max_program_size_bytes: 4,
                ..Default::default()
            },
            ..Default::default()
        });
        let manifest = PackageManifest {
            metadata: Metadata {
                name: "demo".to_string(),
                ..Default::default()
            },
            interface: Interface {
                programs: vec![program(AttachType::Kprobe)],
                ..Default::default()
            },
            ..Default::default()
        };

        let report = engine.report_package(dir.path(), &manifest);
        assert_eq!(report.package, "demo");
        assert!(!report.passed);
        assert!(!report.violations.is_empty());
    }

    #[test]
    fn test_config_accepts_full_document() {
        let yaml = r#"
allowed_packages: ["falco-*"]
denied_packages: ["legacy"]
allowed_attach_points: [kprobe, tracepoint]
limits:
  max_programs_per_chain: 8
  max_map_memory_mb: 64
  max_program_size_bytes: 1048576
  max_events_per_sec: 10000
namespace_enforcement:
  require_cgroup_filter: true
signature_verification:
  enabled: false
sandbox:
  enabled: true
  require_uid_namespace: true
  require_isolated_bpffs: true
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.limits.max_programs_per_chain, 8);
        assert!(config.sandbox.require_isolated_bpffs);
    }
}
