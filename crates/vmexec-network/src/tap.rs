//! Per-attachment TAP device creation and teardown.

use anyhow::{Context, Result};
use vmexec_core::CommandRunner;

/// One TAP device created for a task's network attachment.
#[derive(Debug, Clone)]
pub struct TapRecord {
    pub task_id: String,
    pub iface_id: String,
    pub tap_name: String,
    pub bridge: String,
    /// Assigned IP, or empty if static allocation was not requested or the
    /// allocator failed (a warning is logged, the task still starts).
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub subnet: String,
}

impl TapRecord {
    /// The key this record is stored under in the manager's registry:
    /// `<task-id>-<tap-name>`, per the component contract.
    pub fn key(&self) -> String {
        format!("{}-{}", self.task_id, self.tap_name)
    }
}

/// Create one TAP device for attachment index `i` of `task_id`, attaching it
/// to `bridge`. Best-effort deletes the device on any failure past creation
/// so no half-created TAP is left behind.
#[allow(clippy::too_many_arguments)]
pub fn create_tap(
    runner: &dyn CommandRunner,
    task_id: &str,
    index: usize,
    bridge: &str,
    ip: String,
    netmask: String,
    gateway: String,
    subnet: String,
) -> Result<TapRecord> {
    let iface_id = format!("eth{index}");
    let tap_name = vmexec_core::naming::tap_name(index);

    let add = runner
        .run("ip", &["tuntap", "add", &tap_name, "mode", "tap"])
        .context("creating tap device")?;
    if !add.success() {
        anyhow::bail!("ip tuntap add {tap_name} mode tap failed: {}", add.stderr_str());
    }

    if let Err(e) = bring_up(runner, &tap_name) {
        let _ = delete_tap(runner, &tap_name);
        return Err(e);
    }

    if let Err(e) = enslave(runner, &tap_name, bridge) {
        let _ = delete_tap(runner, &tap_name);
        return Err(e);
    }

    Ok(TapRecord {
        task_id: task_id.to_string(),
        iface_id,
        tap_name,
        bridge: bridge.to_string(),
        ip,
        netmask,
        gateway,
        subnet,
    })
}

fn bring_up(runner: &dyn CommandRunner, tap_name: &str) -> Result<()> {
    let out = runner
        .run("ip", &["link", "set", tap_name, "up"])
        .context("bringing tap up")?;
    if !out.success() {
        anyhow::bail!("ip link set {tap_name} up failed: {}", out.stderr_str());
    }
    Ok(())
}

fn enslave(runner: &dyn CommandRunner, tap_name: &str, bridge: &str) -> Result<()> {
    let out = runner
        .run("ip", &["link", "set", tap_name, "master", bridge])
        .context("enslaving tap to bridge")?;
    if !out.success() {
        anyhow::bail!("ip link set {tap_name} master {bridge} failed: {}", out.stderr_str());
    }
    Ok(())
}

/// Best-effort delete; failures are not propagated since this is itself the
/// cleanup path for a failed create, or part of `cleanupNetwork`.
pub fn delete_tap(runner: &dyn CommandRunner, tap_name: &str) -> Result<()> {
    let out = runner.run("ip", &["link", "delete", tap_name]).context("deleting tap device")?;
    if !out.success() {
        tracing::warn!(tap_name, stderr = %out.stderr_str(), "failed to delete tap device");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmexec_core::mock::FakeCommandRunner;

    #[test]
    fn test_create_tap_happy_path() {
        let runner = FakeCommandRunner::new();
        let rec = create_tap(
            &runner,
            "t-1",
            0,
            "vmexec0",
            "10.240.0.2".to_string(),
            "255.255.255.0".to_string(),
            "10.240.0.1".to_string(),
            "10.240.0.0/24".to_string(),
        )
        .unwrap();
        assert_eq!(rec.tap_name, "tap-eth0");
        assert_eq!(rec.key(), "t-1-tap-eth0");
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.args == vec!["tuntap", "add", "tap-eth0", "mode", "tap"]));
        assert!(calls.iter().any(|c| c.args == vec!["link", "set", "tap-eth0", "master", "vmexec0"]));
    }

    #[test]
    fn test_create_tap_enslave_failure_deletes_device() {
        let runner = FakeCommandRunner::with_handler(std::sync::Arc::new(
            |program: &str, args: &[&str], _fs: &std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>| {
                if program == "ip" && args.contains(&"master") {
                    vmexec_core::CommandOutput { status: 1, stdout: Vec::new(), stderr: b"no such bridge".to_vec() }
                } else {
                    vmexec_core::CommandOutput { status: 0, stdout: Vec::new(), stderr: Vec::new() }
                }
            },
        ));
        let result = create_tap(
            &runner, "t-1", 0, "vmexec0",
            String::new(), String::new(), String::new(), String::new(),
        );
        assert!(result.is_err());
        assert!(runner.calls().iter().any(|c| c.args == vec!["link", "delete", "tap-eth0"]));
    }
}
