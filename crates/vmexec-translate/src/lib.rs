//! vmexec-translate: a pure function from a task + prepared artifacts to a
//! Firecracker boot-time JSON configuration document. No I/O, no locks — the
//! whole contract is `translate(task, config) -> Result<String, ExecutorError>`.

use serde_json::{Value, json};
use vmexec_core::error::ExecutorError;
use vmexec_core::task::{InitSystem, Task, annotation_keys};

const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on ip=dhcp";
const DEFAULT_VCPU_COUNT: u64 = 1;
const DEFAULT_MEM_SIZE_MIB: u64 = 512;
const QUEUE_SIZE: u32 = 256;

/// Host-specific inputs the translator needs but the task itself doesn't
/// carry (analogous to the Image Preparer's rootfs/init configuration).
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub kernel_image_path: String,
    pub initrd_path: Option<String>,
}

fn init_system_from_annotation(task: &Task) -> InitSystem {
    match task.annotation(annotation_keys::INIT_SYSTEM) {
        Some("tini") => InitSystem::Tini,
        Some("dumb_init") => InitSystem::DumbInit,
        _ => InitSystem::None,
    }
}

/// Builds the user-command section of `boot_args`: the tokens that follow
/// the kernel's literal `--` separator. When an init system is configured,
/// the command is wrapped so the init binary is PID 1 inside the guest —
/// `tini` needs its own `--` separator before the wrapped command,
/// `dumb-init` does not.
fn command_tokens(task: &Task, init_system: InitSystem) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(init_path) = init_system.guest_path() {
        tokens.push(init_path.to_string());
        if init_system == InitSystem::Tini {
            tokens.push("--".to_string());
        }
    }
    tokens.extend(task.runtime.command.iter().cloned());
    tokens.extend(task.runtime.args.iter().cloned());
    tokens
}

fn boot_args(task: &Task, init_system: InitSystem) -> String {
    let mut parts: Vec<String> = vec![BASE_BOOT_ARGS.to_string(), "--".to_string()];
    parts.extend(command_tokens(task, init_system));
    parts.join(" ")
}

fn machine_config(task: &Task) -> Value {
    let resources = &task.resources;
    let mem_size_mib = if resources.memory_bytes > 0 {
        resources.memory_bytes / 1024 / 1024
    } else {
        DEFAULT_MEM_SIZE_MIB
    };
    let vcpu_count = if resources.nano_cpus > 0 {
        (resources.nano_cpus / 1_000_000_000).max(1)
    } else {
        DEFAULT_VCPU_COUNT
    };
    json!({
        "vcpu_count": vcpu_count,
        "mem_size_mib": mem_size_mib,
        "ht_enabled": false,
    })
}

/// `eth<i>` / `tap-eth<i>`. The device name must match the one the Network
/// Manager actually creates (see `vmexec_core::naming::tap_name`) — using a
/// shared naming function here rather than re-deriving the string keeps the
/// translator's `host_dev_name` and the TAP device on the host in sync.
fn network_interfaces(task: &Task) -> Vec<Value> {
    task.network_attachments
        .iter()
        .enumerate()
        .map(|(i, _attachment)| {
            let iface_id = format!("eth{i}");
            let host_dev_name = vmexec_core::naming::tap_name(i);
            json!({
                "iface_id": iface_id,
                "host_dev_name": host_dev_name,
                "rx_queue_size": QUEUE_SIZE,
                "tx_queue_size": QUEUE_SIZE,
                "guest_mac": "",
            })
        })
        .collect()
}

fn mount_drive_id(target: &str) -> String {
    target.trim_start_matches('/').replace('/', "-")
}

fn drives(task: &Task, rootfs_path: &str) -> Vec<Value> {
    let mut entries = vec![json!({
        "drive_id": "rootfs",
        "is_root_device": true,
        "path_on_host": rootfs_path,
        "is_read_only": false,
    })];
    entries.extend(task.runtime.mounts.iter().map(|mount| {
        json!({
            "drive_id": mount_drive_id(&mount.target),
            "is_root_device": false,
            "path_on_host": mount.source,
            "is_read_only": mount.read_only,
        })
    }));
    entries
}

/// Produce the Firecracker boot-time JSON document for `task`. Pure: the
/// only inputs are `task` (in particular `task.annotations["rootfs"]`,
/// written by the Image Preparer) and `config`.
pub fn translate(task: &Task, config: &TranslatorConfig) -> Result<String, ExecutorError> {
    if task.runtime.image_ref.trim().is_empty() {
        return Err(ExecutorError::InvalidRuntime);
    }
    let rootfs_path = task.rootfs().ok_or(ExecutorError::MissingRootfs)?;
    let init_system = init_system_from_annotation(task);

    let mut boot_source = json!({
        "kernel_image_path": config.kernel_image_path,
        "boot_args": boot_args(task, init_system),
    });
    if let Some(initrd) = &config.initrd_path {
        boot_source["initrd_path"] = json!(initrd);
    }

    let document = json!({
        "boot_source": boot_source,
        "machine_config": machine_config(task),
        "network_interfaces": network_interfaces(task),
        "drives": drives(task, rootfs_path),
    });

    serde_json::to_string(&document).map_err(|e| ExecutorError::from(anyhow::anyhow!("serializing boot config: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vmexec_core::task::{ContainerMount, ContainerSpec, NetworkAttachment, ResourceLimits};

    use super::*;

    fn base_task() -> Task {
        Task {
            id: "t-1".to_string(),
            service_id: "svc".to_string(),
            runtime: ContainerSpec {
                image_ref: "nginx:latest".to_string(),
                command: vec!["/bin/sh".to_string()],
                args: vec!["-c".to_string(), "echo hi".to_string()],
                env: HashMap::new(),
                mounts: vec![],
            },
            resources: ResourceLimits {
                nano_cpus: 2_000_000_000,
                memory_bytes: 512 * 1024 * 1024,
            },
            network_attachments: vec![],
            annotations: HashMap::from([(annotation_keys::ROOTFS.to_string(), "/r.ext4".to_string())]),
        }
    }

    fn config() -> TranslatorConfig {
        TranslatorConfig {
            kernel_image_path: "/k".to_string(),
            initrd_path: None,
        }
    }

    #[test]
    fn test_boot_args_and_machine_config() {
        let task = base_task();
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            parsed["boot_source"]["boot_args"],
            "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on ip=dhcp -- /bin/sh -c echo hi"
        );
        assert_eq!(parsed["machine_config"]["vcpu_count"], 2);
        assert_eq!(parsed["machine_config"]["mem_size_mib"], 512);
        assert_eq!(parsed["drives"][0]["drive_id"], "rootfs");
        assert_eq!(parsed["drives"][0]["is_root_device"], true);
        assert_eq!(parsed["drives"][0]["path_on_host"], "/r.ext4");
    }

    #[test]
    fn test_init_wrapping_tini_inserts_separator() {
        let mut task = base_task();
        task.set_annotation(annotation_keys::INIT_SYSTEM, "tini");
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let args = parsed["boot_source"]["boot_args"].as_str().unwrap();
        assert!(args.ends_with("-- /sbin/tini -- /bin/sh -c echo hi"));
    }

    #[test]
    fn test_init_wrapping_dumb_init_has_no_extra_separator() {
        let mut task = base_task();
        task.set_annotation(annotation_keys::INIT_SYSTEM, "dumb_init");
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let args = parsed["boot_source"]["boot_args"].as_str().unwrap();
        assert!(args.ends_with("-- /sbin/dumb-init /bin/sh -c echo hi"));
    }

    #[test]
    fn test_no_init_system_is_unwrapped() {
        let task = base_task();
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let args = parsed["boot_source"]["boot_args"].as_str().unwrap();
        assert!(args.ends_with("-- /bin/sh -c echo hi"));
    }

    #[test]
    fn test_missing_rootfs_annotation_fails() {
        let mut task = base_task();
        task.annotations.remove(annotation_keys::ROOTFS);
        let err = translate(&task, &config()).unwrap_err();
        assert!(matches!(err, ExecutorError::MissingRootfs));
    }

    #[test]
    fn test_empty_image_ref_is_invalid_runtime() {
        let mut task = base_task();
        task.runtime.image_ref = String::new();
        let err = translate(&task, &config()).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRuntime));
    }

    #[test]
    fn test_network_interfaces_use_shared_tap_naming() {
        let mut task = base_task();
        task.network_attachments = vec![
            NetworkAttachment { ip_mode: "static".to_string(), bridge: String::new() },
            NetworkAttachment { ip_mode: "dhcp".to_string(), bridge: String::new() },
        ];
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let ifaces = parsed["network_interfaces"].as_array().unwrap();
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0]["iface_id"], "eth0");
        assert_eq!(ifaces[0]["host_dev_name"], "tap-eth0");
        assert_eq!(ifaces[1]["iface_id"], "eth1");
        assert_eq!(ifaces[1]["host_dev_name"], "tap-eth1");
    }

    #[test]
    fn test_mount_drives_derive_id_from_target() {
        let mut task = base_task();
        task.runtime.mounts = vec![ContainerMount {
            source: "/host/data".to_string(),
            target: "/var/lib/data".to_string(),
            read_only: true,
        }];
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let drives = parsed["drives"].as_array().unwrap();
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[1]["drive_id"], "var-lib-data");
        assert_eq!(drives[1]["path_on_host"], "/host/data");
        assert_eq!(drives[1]["is_read_only"], true);
    }

    #[test]
    fn test_default_resources_when_unset() {
        let mut task = base_task();
        task.resources = ResourceLimits::default();
        let out = translate(&task, &config()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["machine_config"]["vcpu_count"], 1);
        assert_eq!(parsed["machine_config"]["mem_size_mib"], 512);
    }
}
