//! Package loader
//!
//! Turns a package directory into a `LoadedPackage`: parses the manifest,
//! clears it with the kernel profile and the policy engine, loads each
//! program's object file into the kernel, and materialises the manifest's
//! maps (adopting pinned maps, pinning fresh ones, applying declared
//! defaults).
//!
//! Kernel resources are owned by the values built here, so the cleanup
//! contract is structural: any error path drops everything created so far
//! and no partial package is ever observable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use aya::maps::{Array, HashMap as BpfHashMap, Map, MapData};
use aya::programs::{
    CgroupSkb, KProbe, Lsm, Program, RawTracePoint, SchedClassifier, TracePoint, Xdp,
};
use aya::{Btf, Ebpf};
use log::debug;

use crate::kcp::{KcpError, KernelProfile};
use crate::manifest::{
    sanitize_map_name, AttachType, MapDef, MapKind, PackageManifest, PackageStatus, ProgramDef,
    Schema,
};
use crate::policy::{PolicyEngine, PolicyError};
use crate::runtime::sandbox::SandboxInfo;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("kernel compatibility: {0}")]
    Kernel(#[from] KcpError),
    #[error("policy validation: {0}")]
    Policy(#[from] PolicyError),
    #[error("load object for program {id}: {source}")]
    Object {
        id: String,
        source: aya::EbpfError,
    },
    #[error("section {section} not found in {file}")]
    ProgramNotFound { section: String, file: String },
    #[error("load program {id}: {source}")]
    Program {
        id: String,
        source: aya::programs::ProgramError,
    },
    #[error("BTF unavailable, cannot load LSM program {0}")]
    BtfUnavailable(String),
    #[error("map {0} not present in any program object")]
    MapNotFound(String),
    #[error("prepare pin directory for map {name}: {source}")]
    PinDir {
        name: String,
        source: std::io::Error,
    },
    #[error("pin map {name}: {source}")]
    Pin {
        name: String,
        source: aya::pin::PinError,
    },
    #[error("parse default key {key:?} for map {map}: {reason}")]
    DefaultKey {
        map: String,
        key: String,
        reason: String,
    },
    #[error("encode default value for key {key:?} in map {map}: unsupported value")]
    DefaultValue { map: String, key: String },
    #[error("set default value for key {key:?} in map {map}: {source}")]
    DefaultInsert {
        map: String,
        key: String,
        source: aya::maps::MapError,
    },
    #[error("defaults not supported for {kind} map {name}")]
    DefaultUnsupportedMap { name: String, kind: &'static str },
}

/// A package brought into the runtime. Owns every kernel resource the
/// package created: the loaded objects (and with them the programs), the
/// materialised maps, and the attach links.
pub struct LoadedPackage {
    pub manifest: PackageManifest,
    pub(crate) objects: Vec<Ebpf>,
    pub(crate) programs: HashMap<String, ProgramRef>,
    pub(crate) maps: HashMap<String, Map>,
    pub links: Vec<crate::attach::AttachHandle>,
    pub chain_id: Option<String>,
    pub sandbox: Option<SandboxInfo>,
    pub status: PackageStatus,
    pub loaded_at: SystemTime,
}

/// Locates a program inside the object container that loaded it.
pub(crate) struct ProgramRef {
    pub object: usize,
    pub name: String,
}

impl LoadedPackage {
    pub(crate) fn new(manifest: PackageManifest) -> Self {
        Self {
            manifest,
            objects: Vec::new(),
            programs: HashMap::new(),
            maps: HashMap::new(),
            links: Vec::new(),
            chain_id: None,
            sandbox: None,
            status: PackageStatus::Loaded,
            loaded_at: SystemTime::now(),
        }
    }

    pub fn has_program(&self, id: &str) -> bool {
        self.programs.contains_key(id)
    }

    pub fn program(&self, id: &str) -> Option<&Program> {
        let loc = self.programs.get(id)?;
        self.objects.get(loc.object)?.programs().find_map(|(name, prog)| {
            if name == loc.name {
                Some(prog)
            } else {
                None
            }
        })
    }

    pub fn program_mut(&mut self, id: &str) -> Option<&mut Program> {
        let loc = self.programs.get(id)?;
        self.objects.get_mut(loc.object)?.program_mut(&loc.name)
    }

    pub fn program_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.programs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn map_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn map_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.get_mut(name)
    }

    /// Transfer ownership of a materialised map out of the package.
    pub(crate) fn take_map(&mut self, name: &str) -> Option<Map> {
        self.maps.remove(name)
    }
}

/// Loads packages from disk into the kernel.
pub struct Loader {
    profile: KernelProfile,
    policy: Option<Arc<PolicyEngine>>,
    btf: Option<Btf>,
}

impl Loader {
    /// Probes the kernel up front; the resulting profile is reused for
    /// every subsequent load.
    pub fn new(policy: Option<Arc<PolicyEngine>>) -> Result<Self, LoadError> {
        let profile = KernelProfile::detect()?;
        let btf = match Btf::from_sys_fs() {
            Ok(btf) => Some(btf),
            Err(err) => {
                debug!("system BTF unavailable: {err}");
                None
            }
        };
        Ok(Self {
            profile,
            policy,
            btf,
        })
    }

    pub fn profile(&self) -> &KernelProfile {
        &self.profile
    }

    /// Load the package at `package_path`. On any error every kernel
    /// resource created so far is released before returning.
    pub fn load_package(&self, package_path: &Path) -> Result<LoadedPackage, LoadError> {
        let manifest_path = package_path.join("manifest.yaml");
        let manifest = parse_manifest(&manifest_path)?;

        self.profile.verify(&manifest.requirements)?;

        if let Some(policy) = &self.policy {
            policy.validate_package(&manifest)?;
            policy.validate_artifacts(package_path, &manifest)?;
        }

        let mut loaded = LoadedPackage::new(manifest);

        for def in loaded.manifest.interface.programs.clone() {
            let (object, name) = self.load_program(package_path, &def)?;
            let index = loaded.objects.len();
            loaded.objects.push(object);
            loaded
                .programs
                .insert(def.id.clone(), ProgramRef { object: index, name });
        }

        for def in loaded.manifest.interface.maps.clone() {
            let map = materialise_map(&mut loaded.objects, &def)?;
            loaded.maps.insert(def.name.clone(), map);
        }

        loaded.loaded_at = SystemTime::now();
        loaded.status = PackageStatus::Loaded;
        Ok(loaded)
    }

    /// Load one program definition: open its object file, pick the program
    /// the manifest names, and load it into the kernel typed according to
    /// its attach tag.
    fn load_program(&self, base: &Path, def: &ProgramDef) -> Result<(Ebpf, String), LoadError> {
        let object_path = base.join(&def.file);
        let mut object = Ebpf::load_file(&object_path).map_err(|source| LoadError::Object {
            id: def.id.clone(),
            source,
        })?;

        let name = select_program(&object, def)?;
        let program = object
            .program_mut(&name)
            .ok_or_else(|| LoadError::ProgramNotFound {
                section: def.section.clone(),
                file: def.file.clone(),
            })?;

        self.load_into_kernel(program, def)?;
        debug!("loaded program {} from {}", def.id, object_path.display());
        Ok((object, name))
    }

    fn load_into_kernel(&self, program: &mut Program, def: &ProgramDef) -> Result<(), LoadError> {
        let prog_err = |source| LoadError::Program {
            id: def.id.clone(),
            source,
        };

        match def.attach_type {
            AttachType::Kprobe | AttachType::Kretprobe => {
                let p: &mut KProbe = program.try_into().map_err(prog_err)?;
                p.load().map_err(prog_err)
            }
            AttachType::Tracepoint => {
                let p: &mut TracePoint = program.try_into().map_err(prog_err)?;
                p.load().map_err(prog_err)
            }
            AttachType::RawTracepoint => {
                let p: &mut RawTracePoint = program.try_into().map_err(prog_err)?;
                p.load().map_err(prog_err)
            }
            AttachType::Lsm => {
                let btf = self
                    .btf
                    .as_ref()
                    .ok_or_else(|| LoadError::BtfUnavailable(def.id.clone()))?;
                let p: &mut Lsm = program.try_into().map_err(prog_err)?;
                p.load(&def.attach_to, btf).map_err(prog_err)
            }
            AttachType::Xdp => {
                let p: &mut Xdp = program.try_into().map_err(prog_err)?;
                p.load().map_err(prog_err)
            }
            AttachType::Tc => {
                let p: &mut SchedClassifier = program.try_into().map_err(prog_err)?;
                p.load().map_err(prog_err)
            }
            AttachType::Cgroup => {
                let p: &mut CgroupSkb = program.try_into().map_err(prog_err)?;
                p.load().map_err(prog_err)
            }
        }
    }
}

pub(crate) fn parse_manifest(path: &Path) -> Result<PackageManifest, LoadError> {
    let raw = fs::read_to_string(path).map_err(|source| LoadError::ManifestRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| LoadError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}

/// The manifest's `section` selects a program inside the object; the
/// program id is accepted as a fallback for objects whose function name
/// matches the id rather than the section tag.
fn select_program(object: &Ebpf, def: &ProgramDef) -> Result<String, LoadError> {
    for candidate in [def.section.as_str(), def.id.as_str()] {
        if !candidate.is_empty() && object.programs().any(|(name, _)| name == candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(LoadError::ProgramNotFound {
        section: def.section.clone(),
        file: def.file.clone(),
    })
}

/// Materialise one manifest map. A pinned map that already exists is
/// adopted as-is; otherwise ownership of the map is taken from the loaded
/// objects, it is pinned if requested, and declared defaults are applied.
fn materialise_map(objects: &mut [Ebpf], def: &MapDef) -> Result<Map, LoadError> {
    if let Some(pin) = &def.pin {
        if let Ok(data) = MapData::from_pin(pin) {
            debug!("adopted pinned map {} from {pin}", def.name);
            return Ok(wrap_map_data(def.kind, data));
        }
    }

    let mut map = take_map_from_objects(objects, &def.name)
        .ok_or_else(|| LoadError::MapNotFound(def.name.clone()))?;

    if let Some(pin) = &def.pin {
        if let Some(parent) = Path::new(pin).parent() {
            fs::create_dir_all(parent).map_err(|source| LoadError::PinDir {
                name: def.name.clone(),
                source,
            })?;
        }
        map_data_mut(&mut map)
            .ok_or_else(|| LoadError::MapNotFound(def.name.clone()))?
            .pin(pin)
            .map_err(|source| LoadError::Pin {
                name: def.name.clone(),
                source,
            })?;
    }

    // Ring buffers carry no key/value schema, so defaults do not apply.
    if !def.defaults.is_empty() && def.kind != MapKind::Ringbuf {
        apply_defaults(&mut map, def)?;
    }

    Ok(map)
}

/// Objects keep full ELF map names, while the kernel truncates names to 15
/// bytes; try both spellings before giving up.
fn take_map_from_objects(objects: &mut [Ebpf], name: &str) -> Option<Map> {
    let truncated = sanitize_map_name(name);
    for object in objects.iter_mut() {
        if let Some(map) = object.take_map(name) {
            return Some(map);
        }
        if truncated != name {
            if let Some(map) = object.take_map(&truncated) {
                return Some(map);
            }
        }
    }
    None
}

fn wrap_map_data(kind: MapKind, data: MapData) -> Map {
    match kind {
        MapKind::Ringbuf => Map::RingBuf(data),
        MapKind::Hash => Map::HashMap(data),
        MapKind::Array => Map::Array(data),
        MapKind::PercpuArray => Map::PerCpuArray(data),
        MapKind::PerfEventArray => Map::PerfEventArray(data),
        MapKind::ProgArray => Map::ProgramArray(data),
    }
}

fn map_data_mut(map: &mut Map) -> Option<&mut MapData> {
    match map {
        Map::Array(data)
        | Map::HashMap(data)
        | Map::PerCpuArray(data)
        | Map::PerfEventArray(data)
        | Map::ProgramArray(data)
        | Map::RingBuf(data) => Some(data),
        _ => None,
    }
}

fn apply_defaults(map: &mut Map, def: &MapDef) -> Result<(), LoadError> {
    for (key_str, value) in &def.defaults {
        let key = encode_map_key(key_str, &def.schema).map_err(|reason| LoadError::DefaultKey {
            map: def.name.clone(),
            key: key_str.clone(),
            reason,
        })?;
        let value =
            encode_map_value(value, &def.schema).ok_or_else(|| LoadError::DefaultValue {
                map: def.name.clone(),
                key: key_str.clone(),
            })?;

        insert_entry(map, def, key_str, key, value)?;
    }
    Ok(())
}

fn insert_entry(
    map: &mut Map,
    def: &MapDef,
    key_str: &str,
    key: Scalar,
    value: Scalar,
) -> Result<(), LoadError> {
    let insert_err = |source| LoadError::DefaultInsert {
        map: def.name.clone(),
        key: key_str.to_string(),
        source,
    };

    match def.kind {
        MapKind::Hash => hash_put(map, key, value).map_err(insert_err),
        MapKind::Array => {
            let Scalar::U32(index) = key else {
                return Err(LoadError::DefaultKey {
                    map: def.name.clone(),
                    key: key_str.to_string(),
                    reason: "array keys must be u32 indices".to_string(),
                });
            };
            array_set(map, index, value).map_err(insert_err)
        }
        MapKind::Ringbuf | MapKind::PercpuArray | MapKind::PerfEventArray | MapKind::ProgArray => {
            Err(LoadError::DefaultUnsupportedMap {
                name: def.name.clone(),
                kind: match def.kind {
                    MapKind::Ringbuf => "ringbuf",
                    MapKind::PercpuArray => "percpu_array",
                    MapKind::PerfEventArray => "perf_event_array",
                    _ => "prog_array",
                },
            })
        }
    }
}

/// Scalar widths the kernel insert path supports. Wider payloads (records,
/// long char arrays) are rejected, which fails the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scalar {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

pub(crate) fn encode_map_key(key: &str, schema: &Schema) -> Result<Scalar, String> {
    let parse = |width: &str| -> Result<u64, String> {
        key.parse::<u64>()
            .map_err(|_| format!("expected {width} integer"))
    };
    match schema.key_type.as_str() {
        "u8" => Ok(Scalar::U8(parse("u8")? as u8)),
        "u16" => Ok(Scalar::U16(parse("u16")? as u16)),
        "u64" => Ok(Scalar::U64(parse("u64")?)),
        // u32 is both the explicit and the default key encoding.
        "" | "u32" => Ok(Scalar::U32(parse("u32")? as u32)),
        other => match key.len() {
            1 => Ok(Scalar::U8(key.as_bytes()[0])),
            _ => Err(format!("unsupported key type {other}")),
        },
    }
}

pub(crate) fn encode_map_value(value: &serde_yaml::Value, schema: &Schema) -> Option<Scalar> {
    let width = schema.value_size();
    match value {
        serde_yaml::Value::Number(n) => {
            let n = n.as_u64()?;
            match width {
                1 => Some(Scalar::U8(n as u8)),
                2 => Some(Scalar::U16(n as u16)),
                8 => Some(Scalar::U64(n)),
                _ => Some(Scalar::U32(n as u32)),
            }
        }
        serde_yaml::Value::Bool(b) => Some(Scalar::U8(u8::from(*b))),
        serde_yaml::Value::String(s) => {
            let bytes = s.as_bytes();
            match bytes.len() {
                1 => Some(Scalar::U8(bytes[0])),
                2 => Some(Scalar::U16(u16::from_le_bytes(bytes.try_into().ok()?))),
                4 => Some(Scalar::U32(u32::from_le_bytes(bytes.try_into().ok()?))),
                8 => Some(Scalar::U64(u64::from_le_bytes(bytes.try_into().ok()?))),
                _ => None,
            }
        }
        _ => None,
    }
}

fn hash_put(map: &mut Map, key: Scalar, value: Scalar) -> Result<(), aya::maps::MapError> {
    use Scalar::*;
    match (key, value) {
        (U8(k), U8(v)) => put::<u8, u8>(map, k, v),
        (U8(k), U16(v)) => put::<u8, u16>(map, k, v),
        (U8(k), U32(v)) => put::<u8, u32>(map, k, v),
        (U8(k), U64(v)) => put::<u8, u64>(map, k, v),
        (U16(k), U8(v)) => put::<u16, u8>(map, k, v),
        (U16(k), U16(v)) => put::<u16, u16>(map, k, v),
        (U16(k), U32(v)) => put::<u16, u32>(map, k, v),
        (U16(k), U64(v)) => put::<u16, u64>(map, k, v),
        (U32(k), U8(v)) => put::<u32, u8>(map, k, v),
        (U32(k), U16(v)) => put::<u32, u16>(map, k, v),
        (U32(k), U32(v)) => put::<u32, u32>(map, k, v),
        (U32(k), U64(v)) => put::<u32, u64>(map, k, v),
        (U64(k), U8(v)) => put::<u64, u8>(map, k, v),
        (U64(k), U16(v)) => put::<u64, u16>(map, k, v),
        (U64(k), U32(v)) => put::<u64, u32>(map, k, v),
        (U64(k), U64(v)) => put::<u64, u64>(map, k, v),
    }
}

fn put<K, V>(map: &mut Map, key: K, value: V) -> Result<(), aya::maps::MapError>
where
    K: aya::Pod,
    V: aya::Pod,
{
    let mut hash: BpfHashMap<&mut MapData, K, V> = BpfHashMap::try_from(map)?;
    hash.insert(key, value, 0)
}

fn array_set(map: &mut Map, index: u32, value: Scalar) -> Result<(), aya::maps::MapError> {
    match value {
        Scalar::U8(v) => set::<u8>(map, index, v),
        Scalar::U16(v) => set::<u16>(map, index, v),
        Scalar::U32(v) => set::<u32>(map, index, v),
        Scalar::U64(v) => set::<u64>(map, index, v),
    }
}

fn set<V: aya::Pod>(map: &mut Map, index: u32, value: V) -> Result<(), aya::maps::MapError> {
    let mut array: Array<&mut MapData, V> = Array::try_from(map)?;
    array.set(index, value, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(key: &str, value: &str) -> Schema {
        Schema {
            key_type: key.to_string(),
            value_type: value.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_manifest_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_manifest(&dir.path().join("manifest.yaml")).unwrap_err();
        assert!(matches!(err, LoadError::ManifestRead { .. }));
    }

    #[test]
    fn test_parse_manifest_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        fs::write(&path, "metadata: [not, a, mapping").unwrap();
        let err = parse_manifest(&path).unwrap_err();
        assert!(matches!(err, LoadError::ManifestParse { .. }));
    }

    #[test]
    fn test_encode_map_key_scalars() {
        assert_eq!(encode_map_key("7", &schema("u32", "")), Ok(Scalar::U32(7)));
        assert_eq!(
            encode_map_key("512", &schema("u64", "")),
            Ok(Scalar::U64(512))
        );
        assert_eq!(encode_map_key("3", &schema("", "")), Ok(Scalar::U32(3)));
        assert!(encode_map_key("pid", &schema("u32", "")).is_err());
        assert!(encode_map_key("long-key", &schema("char[8]", "")).is_err());
    }

    #[test]
    fn test_encode_map_value_widths() {
        let s = schema("u32", "u64");
        assert_eq!(
            encode_map_value(&serde_yaml::Value::from(42u64), &s),
            Some(Scalar::U64(42))
        );

        let s = schema("u32", "u8");
        assert_eq!(
            encode_map_value(&serde_yaml::Value::from(1u64), &s),
            Some(Scalar::U8(1))
        );

        // A record value cannot be expressed as a scalar default.
        let s = schema("u32", "");
        let mapping: serde_yaml::Value = serde_yaml::from_str("{a: 1}").unwrap();
        assert_eq!(encode_map_value(&mapping, &s), None);
    }

    #[test]
    fn test_loaded_package_starts_empty() {
        let pkg = LoadedPackage::new(PackageManifest::default());
        assert_eq!(pkg.status, PackageStatus::Loaded);
        assert!(pkg.program_ids().is_empty());
        assert!(pkg.map_names().is_empty());
        assert!(pkg.links.is_empty());
        assert!(pkg.chain_id.is_none());
    }
}
