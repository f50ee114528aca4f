use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Recognised annotation keys the executor reads or writes on a task.
///
/// The annotation map is a concession to the orchestrator's opaque
/// string-keyed scratch space; these are the only keys any component in
/// this crate family ever reads or writes.
pub mod annotation_keys {
    pub const ROOTFS: &str = "rootfs";
    pub const INIT_SYSTEM: &str = "init_system";
    pub const INIT_PATH: &str = "init_path";
}

/// The init system injected as PID 1 inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitSystem {
    None,
    Tini,
    DumbInit,
}

impl InitSystem {
    /// Absolute guest path of the init binary, or `None` for `InitSystem::None`.
    pub fn guest_path(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Tini => Some("/sbin/tini"),
            Self::DumbInit => Some("/sbin/dumb-init"),
        }
    }
}

impl std::fmt::Display for InitSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Tini => "tini",
            Self::DumbInit => "dumb_init",
        };
        write!(f, "{s}")
    }
}

/// A bind mount requested by the container spec, realised as an extra
/// Firecracker drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMount {
    /// Host-side path backing the mount (becomes `path_on_host`).
    pub source: String,
    /// In-guest mount point (used to derive `drive_id`).
    pub target: String,
    pub read_only: bool,
}

/// Resource reservations for the task, straight off the orchestrator's
/// scheduling decision.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub nano_cpus: u64,
    pub memory_bytes: u64,
}

/// One requested network attachment. The Network Manager assigns the
/// concrete TAP/IP; this struct only carries the orchestrator's intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// `"static"` or `"dhcp"`; only `"static"` triggers IP allocation.
    pub ip_mode: String,
    /// Bridge to attach to; empty means "the Network Manager's default".
    pub bridge: String,
}

/// The container descriptor carried by `task.spec.runtime` when the task is
/// a container workload (the only runtime kind this executor supports).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image_ref: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<ContainerMount>,
}

/// One orchestrator-scheduled unit of work.
///
/// `id` is the primary key across all four components. `annotations` is the
/// only field components are permitted to mutate (the Image Preparer writes
/// `rootfs`; everything else is read-only input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub service_id: String,
    pub runtime: ContainerSpec,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub network_attachments: Vec<NetworkAttachment>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl Task {
    /// Read an annotation, returning `None` if unset or the map is absent.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Set an annotation, initialising the map if this is the first write.
    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations.insert(key.to_string(), value.into());
    }

    /// The rootfs path set by the Image Preparer, if `prepare` has run.
    pub fn rootfs(&self) -> Option<&str> {
        self.annotation(annotation_keys::ROOTFS)
    }
}
