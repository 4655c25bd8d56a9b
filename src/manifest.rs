//! Package manifest data model
//!
//! A package is a directory containing a `manifest.yaml` plus the compiled
//! kernel object files it references. The manifest describes what the
//! package needs from the kernel, which programs and maps it materialises,
//! and how its tail-call chain (if any) is wired.
//!
//! Everything in this module is plain data: parsing happens through serde
//! and unknown attach-type or map-type tags are rejected at that point,
//! before any kernel resource is touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical package identifier, `name@version`.
///
/// Both halves must be non-empty and the `@` separator must appear exactly
/// once. `to_string()` is the exact inverse of `parse()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

/// Error raised for a malformed package identifier.
#[derive(Debug, thiserror::Error)]
#[error("invalid package identifier {0:?}")]
pub struct InvalidPackageId(pub String);

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl FromStr for PackageId {
    type Err = InvalidPackageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(version), None) if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(name, version))
            }
            _ => Err(InvalidPackageId(s.to_string())),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Attach-point tag. The set is closed: a manifest carrying any other tag
/// fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachType {
    Kprobe,
    Kretprobe,
    Tracepoint,
    RawTracepoint,
    Lsm,
    Xdp,
    Tc,
    Cgroup,
}

impl AttachType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachType::Kprobe => "kprobe",
            AttachType::Kretprobe => "kretprobe",
            AttachType::Tracepoint => "tracepoint",
            AttachType::RawTracepoint => "raw_tracepoint",
            AttachType::Lsm => "lsm",
            AttachType::Xdp => "xdp",
            AttachType::Tc => "tc",
            AttachType::Cgroup => "cgroup",
        }
    }
}

impl fmt::Display for AttachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map type tag, also a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Ringbuf,
    Hash,
    Array,
    PercpuArray,
    PerfEventArray,
    ProgArray,
}

/// Parsed `manifest.yaml`. `apiVersion`/`kind` are accepted but not
/// enforced; unknown top-level sections (e.g. `build`) are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default, rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub interface: Interface,
    #[serde(default)]
    pub policy: PackagePolicy,
}

impl PackageManifest {
    /// The manifest's own idea of its identity.
    pub fn package_id(&self) -> PackageId {
        PackageId::new(&self.metadata.name, &self.metadata.version)
    }

    pub fn program(&self, id: &str) -> Option<&ProgramDef> {
        self.interface.programs.iter().find(|p| p.id == id)
    }

    pub fn map(&self, name: &str) -> Option<&MapDef> {
        self.interface.maps.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub commit: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub kernel: KernelRequirements,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelRequirements {
    #[serde(default)]
    pub min_version: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub helpers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub programs: Vec<ProgramDef>,
    #[serde(default)]
    pub maps: Vec<MapDef>,
    #[serde(default)]
    pub chain: ChainDef,
    #[serde(default)]
    pub output: OutputDef,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDef {
    pub id: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub section: String,
    #[serde(rename = "type")]
    pub attach_type: AttachType,
    #[serde(default)]
    pub attach_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MapKind,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub defaults: std::collections::BTreeMap<String, serde_yaml::Value>,
}

/// Key/value layout description for a map. Either `value_type` names a
/// scalar, or `fields` describes a record whose size is the sum of its
/// field widths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub key_type: String,
    #[serde(default)]
    pub value_type: String,
}

impl Schema {
    pub fn key_size(&self) -> u32 {
        if self.key_type.is_empty() {
            4
        } else {
            type_size(&self.key_type)
        }
    }

    pub fn value_size(&self) -> u32 {
        if !self.value_type.is_empty() {
            return type_size(&self.value_type);
        }
        if self.fields.is_empty() {
            return 4;
        }
        self.fields.iter().map(|f| type_size(&f.kind)).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainDef {
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub prog_array: String,
    #[serde(default)]
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    pub index: u32,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputDef {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub sample_event: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterDef {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub map_key: serde_yaml::Value,
    #[serde(default)]
    pub default: serde_yaml::Value,
    #[serde(default)]
    pub optional: bool,
}

/// Per-package policy block. Parsed for operators; enforcement happens in
/// the operator-level policy engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagePolicy {
    #[serde(default)]
    pub attach_points: AttachPointsPolicy,
    #[serde(default)]
    pub namespaces: NamespacesPolicy,
    #[serde(default)]
    pub rate_limits: RateLimitsPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachPointsPolicy {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub denied: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespacesPolicy {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub default_filter: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitsPolicy {
    #[serde(default)]
    pub events_per_sec: u32,
    #[serde(default)]
    pub max_map_entries: u32,
}

/// Lifecycle state of a loaded package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Loaded,
    Attached,
    Running,
    Stopped,
    Error,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Loaded => "loaded",
            PackageStatus::Attached => "attached",
            PackageStatus::Running => "running",
            PackageStatus::Stopped => "stopped",
            PackageStatus::Error => "error",
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte width of a schema scalar type. `char[N]` resolves to N; anything
/// unrecognised falls back to 4.
pub fn type_size(t: &str) -> u32 {
    match t {
        "u8" => 1,
        "u16" => 2,
        "u32" => 4,
        "u64" => 8,
        other => char_array_len(other).unwrap_or(4),
    }
}

fn char_array_len(t: &str) -> Option<u32> {
    let n = t.strip_prefix("char[")?.strip_suffix(']')?;
    match n.parse::<u32>() {
        Ok(len) if len > 0 => Some(len),
        _ => Some(1),
    }
}

/// Kernel map names are capped at 15 bytes; longer names are truncated.
pub fn sanitize_map_name(name: &str) -> String {
    if name.len() <= 15 {
        name.to_string()
    } else {
        name[..15].to_string()
    }
}
