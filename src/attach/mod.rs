//! Hook attachment dispatcher
//!
//! Resolves a manifest program definition plus caller options into a
//! `HookTarget`, rejecting malformed targets before any kernel call, then
//! dispatches to the matching aya attachment primitive. The returned
//! `AttachHandle` owns the kernel link and releases it on detach or drop.

use std::fs::File;

use aya::programs::cgroup_skb::CgroupSkbLink;
use aya::programs::kprobe::KProbeLink;
use aya::programs::links::Link;
use aya::programs::lsm::LsmLink;
use aya::programs::raw_trace_point::RawTracePointLink;
use aya::programs::tc::{self, SchedClassifierLink, TcAttachType};
use aya::programs::trace_point::TracePointLink;
use aya::programs::xdp::{XdpFlags, XdpLink};
use aya::programs::{
    CgroupAttachMode, CgroupSkb, CgroupSkbAttachType, KProbe, Lsm, Program, RawTracePoint,
    SchedClassifier, TracePoint, Xdp,
};
use log::debug;

use crate::manifest::{AttachType, ProgramDef};

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("tracepoint must be in category/name form, got {0:?}")]
    MalformedTracepoint(String),
    #[error("interface required for {0} attach")]
    InterfaceRequired(&'static str),
    #[error("cgroup path required for cgroup attach")]
    CgroupRequired,
    #[error("open cgroup {path}: {source}")]
    CgroupOpen {
        path: String,
        source: std::io::Error,
    },
    #[error("attach {target}: {source}")]
    Program {
        target: String,
        source: aya::programs::ProgramError,
    },
    #[error("detach: {0}")]
    Detach(aya::programs::ProgramError),
}

/// Caller-supplied attachment context. Interpretation depends on the
/// program's attach-type tag.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub cgroup_path: Option<String>,
    pub interface: Option<String>,
}

/// Fully resolved attachment target. Construction validates everything
/// that can be validated without touching the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTarget {
    Kprobe { symbol: String },
    Kretprobe { symbol: String },
    Tracepoint { category: String, name: String },
    RawTracepoint { name: String },
    Lsm,
    Xdp { interface: String },
    Tc { interface: String },
    Cgroup { path: String },
}

impl HookTarget {
    pub fn resolve(def: &ProgramDef, opts: &AttachOptions) -> Result<Self, AttachError> {
        match def.attach_type {
            AttachType::Kprobe => Ok(HookTarget::Kprobe {
                symbol: def.attach_to.clone(),
            }),
            AttachType::Kretprobe => Ok(HookTarget::Kretprobe {
                symbol: def.attach_to.clone(),
            }),
            AttachType::Tracepoint => {
                let (category, name) = split_tracepoint(&def.attach_to)?;
                Ok(HookTarget::Tracepoint { category, name })
            }
            AttachType::RawTracepoint => Ok(HookTarget::RawTracepoint {
                name: def.attach_to.clone(),
            }),
            AttachType::Lsm => Ok(HookTarget::Lsm),
            AttachType::Xdp => Ok(HookTarget::Xdp {
                interface: required_interface(opts, "XDP")?,
            }),
            AttachType::Tc => Ok(HookTarget::Tc {
                interface: required_interface(opts, "TC")?,
            }),
            AttachType::Cgroup => match opts.cgroup_path.as_deref() {
                Some(path) if !path.is_empty() => Ok(HookTarget::Cgroup {
                    path: path.to_string(),
                }),
                _ => Err(AttachError::CgroupRequired),
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            HookTarget::Kprobe { symbol } => format!("kprobe {symbol}"),
            HookTarget::Kretprobe { symbol } => format!("kretprobe {symbol}"),
            HookTarget::Tracepoint { category, name } => format!("tracepoint {category}/{name}"),
            HookTarget::RawTracepoint { name } => format!("raw tracepoint {name}"),
            HookTarget::Lsm => "lsm hook".to_string(),
            HookTarget::Xdp { interface } => format!("xdp on {interface}"),
            HookTarget::Tc { interface } => format!("tc on {interface}"),
            HookTarget::Cgroup { path } => format!("cgroup {path}"),
        }
    }
}

fn required_interface(opts: &AttachOptions, kind: &'static str) -> Result<String, AttachError> {
    match opts.interface.as_deref() {
        Some(iface) if !iface.is_empty() => Ok(iface.to_string()),
        _ => Err(AttachError::InterfaceRequired(kind)),
    }
}

/// `category/name`, both halves non-empty, exactly one separator.
pub fn split_tracepoint(identifier: &str) -> Result<(String, String), AttachError> {
    let mut parts = identifier.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(category), Some(name), None) if !category.is_empty() && !name.is_empty() => {
            Ok((category.to_string(), name.to_string()))
        }
        _ => Err(AttachError::MalformedTracepoint(identifier.to_string())),
    }
}

/// Owned kernel attachment. Dropping the handle detaches the program.
pub enum AttachHandle {
    Kprobe(KProbeLink),
    Tracepoint(TracePointLink),
    RawTracepoint(RawTracePointLink),
    Lsm(LsmLink),
    Xdp(XdpLink),
    Tc(SchedClassifierLink),
    Cgroup(CgroupSkbLink),
}

impl AttachHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            AttachHandle::Kprobe(_) => "kprobe",
            AttachHandle::Tracepoint(_) => "tracepoint",
            AttachHandle::RawTracepoint(_) => "raw_tracepoint",
            AttachHandle::Lsm(_) => "lsm",
            AttachHandle::Xdp(_) => "xdp",
            AttachHandle::Tc(_) => "tc",
            AttachHandle::Cgroup(_) => "cgroup",
        }
    }
}

/// Dispatches resolved targets to kernel attachment primitives.
pub struct AttachManager;

impl AttachManager {
    pub fn new() -> Self {
        Self
    }

    pub fn attach_program(
        &self,
        program: &mut Program,
        target: &HookTarget,
    ) -> Result<AttachHandle, AttachError> {
        let wrap = |source| AttachError::Program {
            target: target.describe(),
            source,
        };

        debug!("attaching {}", target.describe());
        match target {
            HookTarget::Kprobe { symbol } | HookTarget::Kretprobe { symbol } => {
                let p: &mut KProbe = program.try_into().map_err(wrap)?;
                let link_id = p.attach(symbol, 0).map_err(wrap)?;
                Ok(AttachHandle::Kprobe(p.take_link(link_id).map_err(wrap)?))
            }
            HookTarget::Tracepoint { category, name } => {
                let p: &mut TracePoint = program.try_into().map_err(wrap)?;
                let link_id = p.attach(category, name).map_err(wrap)?;
                Ok(AttachHandle::Tracepoint(
                    p.take_link(link_id).map_err(wrap)?,
                ))
            }
            HookTarget::RawTracepoint { name } => {
                let p: &mut RawTracePoint = program.try_into().map_err(wrap)?;
                let link_id = p.attach(name).map_err(wrap)?;
                Ok(AttachHandle::RawTracepoint(
                    p.take_link(link_id).map_err(wrap)?,
                ))
            }
            HookTarget::Lsm => {
                let p: &mut Lsm = program.try_into().map_err(wrap)?;
                let link_id = p.attach().map_err(wrap)?;
                Ok(AttachHandle::Lsm(p.take_link(link_id).map_err(wrap)?))
            }
            HookTarget::Xdp { interface } => {
                let p: &mut Xdp = program.try_into().map_err(wrap)?;
                let link_id = p.attach(interface, XdpFlags::default()).map_err(wrap)?;
                Ok(AttachHandle::Xdp(p.take_link(link_id).map_err(wrap)?))
            }
            HookTarget::Tc { interface } => {
                // The clsact qdisc may already exist; that is fine.
                let _ = tc::qdisc_add_clsact(interface);
                let p: &mut SchedClassifier = program.try_into().map_err(wrap)?;
                let link_id = p
                    .attach(interface, TcAttachType::Ingress)
                    .map_err(wrap)?;
                Ok(AttachHandle::Tc(p.take_link(link_id).map_err(wrap)?))
            }
            HookTarget::Cgroup { path } => {
                let cgroup = File::open(path).map_err(|source| AttachError::CgroupOpen {
                    path: path.clone(),
                    source,
                })?;
                let p: &mut CgroupSkb = program.try_into().map_err(wrap)?;
                let link_id = p
                    .attach(cgroup, CgroupSkbAttachType::Egress, CgroupAttachMode::Single)
                    .map_err(wrap)?;
                Ok(AttachHandle::Cgroup(p.take_link(link_id).map_err(wrap)?))
            }
        }
    }

    /// Release a kernel attachment, surfacing the error if the kernel
    /// refuses.
    pub fn detach(&self, handle: AttachHandle) -> Result<(), AttachError> {
        match handle {
            AttachHandle::Kprobe(link) => link.detach().map_err(AttachError::Detach),
            AttachHandle::Tracepoint(link) => link.detach().map_err(AttachError::Detach),
            AttachHandle::RawTracepoint(link) => link.detach().map_err(AttachError::Detach),
            AttachHandle::Lsm(link) => link.detach().map_err(AttachError::Detach),
            AttachHandle::Xdp(link) => link.detach().map_err(AttachError::Detach),
            AttachHandle::Tc(link) => link.detach().map_err(AttachError::Detach),
            AttachHandle::Cgroup(link) => link.detach().map_err(AttachError::Detach),
        }
    }
}

impl Default for AttachManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(attach_type: AttachType, attach_to: &str) -> ProgramDef {
        ProgramDef {
            id: "p".to_string(),
            file: "p.o".to_string(),
            section: "p".to_string(),
            attach_type,
            attach_to: attach_to.to_string(),
        }
    }

    #[test]
    fn test_split_tracepoint() {
        assert_eq!(
            split_tracepoint("syscalls/sys_enter_openat").unwrap(),
            ("syscalls".to_string(), "sys_enter_openat".to_string())
        );
        for bad in ["", "syscalls", "/name", "cat/", "a/b/c", "/"] {
            let err = split_tracepoint(bad).unwrap_err();
            assert!(
                err.to_string().contains("category/name form"),
                "{bad:?}: {err}"
            );
        }
    }

    #[test]
    fn test_resolve_kprobe() {
        let target =
            HookTarget::resolve(&def(AttachType::Kprobe, "do_sys_open"), &AttachOptions::default())
                .unwrap();
        assert_eq!(
            target,
            HookTarget::Kprobe {
                symbol: "do_sys_open".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_tracepoint_rejects_bare_name() {
        let err = HookTarget::resolve(
            &def(AttachType::Tracepoint, "sys_enter"),
            &AttachOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AttachError::MalformedTracepoint(_)));
    }

    #[test]
    fn test_resolve_xdp_requires_interface() {
        let err = HookTarget::resolve(&def(AttachType::Xdp, ""), &AttachOptions::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "interface required for XDP attach");

        let target = HookTarget::resolve(
            &def(AttachType::Xdp, ""),
            &AttachOptions {
                interface: Some("eth0".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            target,
            HookTarget::Xdp {
                interface: "eth0".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_cgroup_requires_path() {
        let err = HookTarget::resolve(&def(AttachType::Cgroup, ""), &AttachOptions::default())
            .unwrap_err();
        assert!(matches!(err, AttachError::CgroupRequired));

        let empty = AttachOptions {
            cgroup_path: Some(String::new()),
            ..Default::default()
        };
        let err = HookTarget::resolve(&def(AttachType::Cgroup, ""), &empty).unwrap_err();
        assert!(matches!(err, AttachError::CgroupRequired));
    }
}
