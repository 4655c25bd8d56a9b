//! Kernel Capability Profile
//!
//! A one-shot, best-effort probe of the running kernel: version, feature
//! matrix (BTF, CO-RE, ring buffers, tracefs, cgroup attach) and helper
//! availability. The probe runs once at loader construction and is cached
//! for the lifetime of the runtime; `verify` is the gate every package
//! requirement block passes through before anything touches the kernel.
//!
//! Missing probe inputs are soft negatives: a file we cannot read means
//! the feature is reported unsupported, not an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use serde::Serialize;

use crate::manifest::Requirements;

const BTF_SEARCH_PATHS: &[&str] = &[
    "/sys/kernel/btf/vmlinux",
    "/boot/vmlinux",
    "/usr/lib/modules/vmlinux",
];

#[derive(Debug, thiserror::Error)]
pub enum KcpError {
    #[error("kernel version not discoverable")]
    VersionUnavailable,
    #[error("kernel version {current} does not meet requirement {required}")]
    VersionTooOld { current: String, required: String },
    #[error("missing kernel feature: {0}")]
    MissingFeature(String),
    #[error("missing helper: {0}")]
    MissingHelper(String),
}

/// A single detected capability.
#[derive(Debug, Clone, Serialize)]
pub struct Feature {
    pub name: String,
    pub supported: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Cached kernel characteristics relevant to eBPF packages.
#[derive(Debug, Clone, Serialize)]
pub struct KernelProfile {
    pub version: String,
    pub features: BTreeMap<String, Feature>,
    pub helpers: BTreeMap<String, bool>,
    pub btf_paths: Vec<PathBuf>,
    pub unprivileged_bpf: bool,
}

impl KernelProfile {
    /// Probe the running kernel. Fails only when the kernel version cannot
    /// be discovered at all; every other input degrades gracefully.
    pub fn detect() -> Result<Self, KcpError> {
        let version = read_kernel_version()?;
        debug!("probing kernel {version}");

        let mut profile = Self {
            version,
            features: BTreeMap::new(),
            helpers: BTreeMap::new(),
            btf_paths: Vec::new(),
            unprivileged_bpf: false,
        };

        profile.detect_btf();
        profile.detect_tracing();
        profile.detect_ringbuf();
        profile.detect_cgroup_attach();
        profile.detect_helpers();
        profile.detect_unprivileged_state();
        Ok(profile)
    }

    /// Check a package's requirement block against this profile. The error
    /// identifies the first unmet element.
    pub fn verify(&self, req: &Requirements) -> Result<(), KcpError> {
        if !req.kernel.min_version.is_empty()
            && !version_gte(&self.version, &req.kernel.min_version)
        {
            return Err(KcpError::VersionTooOld {
                current: self.version.clone(),
                required: req.kernel.min_version.clone(),
            });
        }

        for feature in &req.kernel.features {
            if !self.feature_supported(feature) {
                return Err(KcpError::MissingFeature(feature.clone()));
            }
        }

        for helper in &req.kernel.helpers {
            if !self.helpers.get(helper).copied().unwrap_or(false) {
                return Err(KcpError::MissingHelper(helper.clone()));
            }
        }

        Ok(())
    }

    pub fn feature_supported(&self, name: &str) -> bool {
        self.features.get(name).map(|f| f.supported).unwrap_or(false)
    }

    fn set_feature(&mut self, name: &str, supported: bool, details: impl Into<String>) {
        self.features.insert(
            name.to_string(),
            Feature {
                name: name.to_string(),
                supported,
                details: details.into(),
            },
        );
    }

    fn detect_btf(&mut self) {
        let found: Vec<PathBuf> = BTF_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();
        let details = found
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let supported = !found.is_empty();
        self.btf_paths = found;
        self.set_feature("btf", supported, details);
        self.set_feature("core", supported, "requires BTF");
    }

    fn detect_tracing(&mut self) {
        let mut tracefs = Path::new("/sys/kernel/tracing");
        if !tracefs.exists() {
            tracefs = Path::new("/sys/kernel/debug/tracing");
        }
        self.set_feature("tracefs", tracefs.exists(), tracefs.display().to_string());
    }

    fn detect_ringbuf(&mut self) {
        let supported = version_gte(&self.version, "5.8");
        self.set_feature("ringbuf", supported, "requires kernel >= 5.8");
        if supported {
            self.helpers.insert("bpf_ringbuf_reserve".to_string(), true);
        }
    }

    fn detect_cgroup_attach(&mut self) {
        let supported = version_gte(&self.version, "4.10");
        self.set_feature("cgroup_skb", supported, "requires kernel >= 4.10");
    }

    fn detect_helpers(&mut self) {
        // Conservative baseline, gated by version where the helper is recent.
        self.helpers.insert("bpf_get_current_task".to_string(), true);
        self.helpers.insert("bpf_map_lookup_elem".to_string(), true);
        self.helpers.insert("bpf_tail_call".to_string(), true);
        self.helpers.insert(
            "bpf_probe_read_kernel".to_string(),
            version_gte(&self.version, "5.5"),
        );
    }

    fn detect_unprivileged_state(&mut self) {
        if let Ok(data) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_bpf_disabled") {
            self.unprivileged_bpf = data.trim() == "0";
        }
    }
}

fn read_kernel_version() -> Result<String, KcpError> {
    for path in ["/proc/sys/kernel/osrelease", "/proc/version"] {
        if let Ok(data) = std::fs::read_to_string(path) {
            return Ok(first_field(&data));
        }
    }
    if let Ok(output) = Command::new("uname").arg("-r").output() {
        if output.status.success() {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !version.is_empty() {
                return Ok(version);
            }
        }
    }
    Err(KcpError::VersionUnavailable)
}

fn first_field(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "0.0.0".to_string();
    }
    raw.split_whitespace()
        .next()
        .unwrap_or(raw)
        .to_string()
}

/// `current >= required` over `MAJOR.MINOR.PATCH`. Missing components
/// compare as zero, so `"5.10" >= "5.10.0"` but not `"5.10" >= "5.10.1"`.
/// The part after the first `-` (distro suffix) is ignored.
pub fn version_gte(current: &str, required: &str) -> bool {
    if required.is_empty() {
        return true;
    }
    let cv = parse_version(current);
    let rv = parse_version(required);
    for (c, r) in cv.iter().zip(rv.iter()) {
        if c > r {
            return true;
        }
        if c < r {
            return false;
        }
    }
    true
}

fn parse_version(v: &str) -> [u64; 3] {
    let mut out = [0u64; 3];
    let base = v.trim().split('-').next().unwrap_or("");
    for (slot, chunk) in out.iter_mut().zip(base.split('.')) {
        *slot = chunk.parse().unwrap_or(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::KernelRequirements;

    fn profile(version: &str) -> KernelProfile {
        let mut p = KernelProfile {
            version: version.to_string(),
            features: BTreeMap::new(),
            helpers: BTreeMap::new(),
            btf_paths: Vec::new(),
            unprivileged_bpf: false,
        };
        p.detect_ringbuf();
        p.detect_cgroup_attach();
        p.detect_helpers();
        p
    }

    fn requirements(min: &str, features: &[&str], helpers: &[&str]) -> Requirements {
        Requirements {
            kernel: KernelRequirements {
                min_version: min.to_string(),
                features: features.iter().map(|s| s.to_string()).collect(),
                helpers: helpers.iter().map(|s| s.to_string()).collect(),
            },
            capabilities: Vec::new(),
        }
    }

    #[test]
    fn test_version_gte_table() {
        let cases = [
            ("5.15.0", "5.8", true),
            ("5.15.0", "6.5", false),
            ("5.10", "5.10.0", true),
            ("5.10", "5.10.1", false),
            ("5.10.1", "5.10", true),
            ("6.1.0-rc3", "6.1", true),
            ("4.9", "4.10", false),
            ("", "1.0", false),
            ("5.4.0-91-generic", "5.4", true),
            ("abc", "0.0.0", true),
        ];
        for (current, required, want) in cases {
            assert_eq!(
                version_gte(current, required),
                want,
                "version_gte({current:?}, {required:?})"
            );
        }
    }

    #[test]
    fn test_version_gte_reflexive() {
        for v in ["5.8", "5.10.1", "6.1.0-rc3", ""] {
            assert!(version_gte(v, v), "version_gte({v:?}, {v:?})");
        }
    }

    #[test]
    fn test_version_gte_empty_requirement() {
        assert!(version_gte("0.0.0", ""));
    }

    #[test]
    fn test_verify_version_too_old() {
        let p = profile("5.15.0");
        let err = p.verify(&requirements("6.5", &[], &[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "kernel version 5.15.0 does not meet requirement 6.5"
        );
    }

    #[test]
    fn test_verify_missing_feature_and_helper() {
        let p = profile("5.15.0");
        let err = p.verify(&requirements("", &["btf"], &[])).unwrap_err();
        assert_eq!(err.to_string(), "missing kernel feature: btf");

        let err = p
            .verify(&requirements("", &[], &["bpf_loop"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing helper: bpf_loop");
    }

    #[test]
    fn test_verify_passes_on_supported_profile() {
        let p = profile("5.15.0");
        assert!(p.feature_supported("ringbuf"));
        p.verify(&requirements(
            "5.8",
            &["ringbuf", "cgroup_skb"],
            &["bpf_ringbuf_reserve", "bpf_probe_read_kernel"],
        ))
        .unwrap();
    }

    #[test]
    fn test_ringbuf_gate_below_5_8() {
        let p = profile("5.4.0");
        assert!(!p.feature_supported("ringbuf"));
        assert!(!p.helpers.contains_key("bpf_ringbuf_reserve"));
    }

    #[test]
    fn test_detect_on_host() {
        // Smoke test against the real machine: only asserts the probe runs
        // and yields a plausible version.
        let p = KernelProfile::detect().unwrap();
        assert!(!p.version.is_empty());
        assert!(p.features.contains_key("ringbuf"));
    }
}
