//! Host bridge and NAT setup, each idempotent and process-scoped-once.

use anyhow::{Context, Result};
use vmexec_core::CommandRunner;

/// `ip link show <bridge>` → create → (optional address) → up. "Address
/// exists" on the `ip addr add` step is tolerated as success, matching the
/// rest of the `ip` invocations in this component.
pub fn ensure_bridge(runner: &dyn CommandRunner, bridge: &str, bridge_ip: Option<&str>) -> Result<()> {
    let probe = runner
        .run("ip", &["link", "show", bridge])
        .context("probing bridge")?;
    if probe.success() {
        tracing::debug!(bridge, "bridge already exists");
        return Ok(());
    }

    let add = runner
        .run("ip", &["link", "add", bridge, "type", "bridge"])
        .context("creating bridge")?;
    if !add.success() {
        anyhow::bail!("ip link add {bridge} type bridge failed: {}", add.stderr_str());
    }

    if let Some(addr) = bridge_ip {
        let out = runner
            .run("ip", &["addr", "add", addr, "dev", bridge])
            .context("assigning bridge address")?;
        if !out.success() && !looks_like_exists(&out.stderr_str()) {
            anyhow::bail!("ip addr add {addr} dev {bridge} failed: {}", out.stderr_str());
        }
    }

    let up = runner
        .run("ip", &["link", "set", bridge, "up"])
        .context("bringing bridge up")?;
    if !up.success() {
        anyhow::bail!("ip link set {bridge} up failed: {}", up.stderr_str());
    }

    tracing::info!(bridge, "bridge configured");
    Ok(())
}

fn looks_like_exists(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("exist") || s.contains("already")
}

/// Enable forwarding and the three idempotent MASQUERADE/FORWARD rules. A
/// failure at any step is logged and surfaced: the caller decides whether to
/// leave the NAT-setup flag unset so a later task can retry.
pub fn setup_nat(runner: &dyn CommandRunner, bridge: &str, subnet: &str) -> Result<()> {
    let sysctl = runner
        .run("sysctl", &["-w", "net.ipv4.ip_forward=1"])
        .context("enabling ip_forward")?;
    if !sysctl.success() {
        anyhow::bail!("sysctl -w net.ipv4.ip_forward=1 failed: {}", sysctl.stderr_str());
    }

    ensure_iptables_rule(
        runner,
        &["-t", "nat", "-C", "POSTROUTING", "-s", subnet, "-j", "MASQUERADE"],
        &["-t", "nat", "-A", "POSTROUTING", "-s", subnet, "-j", "MASQUERADE"],
    )?;
    ensure_iptables_rule(
        runner,
        &["-C", "FORWARD", "-i", bridge, "-j", "ACCEPT"],
        &["-A", "FORWARD", "-i", bridge, "-j", "ACCEPT"],
    )?;
    ensure_iptables_rule(
        runner,
        &["-C", "FORWARD", "-o", bridge, "-j", "ACCEPT"],
        &["-A", "FORWARD", "-o", bridge, "-j", "ACCEPT"],
    )?;

    tracing::info!(bridge, subnet, "NAT configured");
    Ok(())
}

/// `-C` (check) first; only `-A` (append) if the rule is missing.
fn ensure_iptables_rule(runner: &dyn CommandRunner, check: &[&str], append: &[&str]) -> Result<()> {
    let check_out = runner.run("iptables", check).context("checking iptables rule")?;
    if check_out.success() {
        return Ok(());
    }
    let append_out = runner.run("iptables", append).context("appending iptables rule")?;
    if !append_out.success() {
        anyhow::bail!("iptables {} failed: {}", append.join(" "), append_out.stderr_str());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmexec_core::mock::FakeCommandRunner;

    #[test]
    fn test_ensure_bridge_probe_hit_skips_create() {
        let runner = FakeCommandRunner::with_handler(std::sync::Arc::new(
            |_program: &str, _args: &[&str], _fs: &std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>| {
                vmexec_core::CommandOutput { status: 0, stdout: Vec::new(), stderr: Vec::new() }
            },
        ));
        ensure_bridge(&runner, "vmexec0", None).unwrap();
        assert_eq!(runner.calls().iter().filter(|c| c.args.contains(&"add".to_string())).count(), 0);
    }

    #[test]
    fn test_ensure_bridge_probe_miss_creates_and_ups() {
        let runner = FakeCommandRunner::new();
        ensure_bridge(&runner, "vmexec0", Some("10.240.0.1/24")).unwrap();
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.args == vec!["link", "add", "vmexec0", "type", "bridge"]));
        assert!(calls.iter().any(|c| c.args == vec!["addr", "add", "10.240.0.1/24", "dev", "vmexec0"]));
        assert!(calls.iter().any(|c| c.args == vec!["link", "set", "vmexec0", "up"]));
    }

    #[test]
    fn test_setup_nat_appends_missing_rules() {
        let runner = FakeCommandRunner::new();
        setup_nat(&runner, "vmexec0", "10.240.0.0/24").unwrap();
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.program == "sysctl"));
        let appends: Vec<_> = calls.iter().filter(|c| c.program == "iptables" && c.args.contains(&"-A".to_string())).collect();
        assert_eq!(appends.len(), 3);
    }
}
