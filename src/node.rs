//! Node identity and resource reporting, the inbound half of the façade's
//! `describe() -> NodeDescription` contract (distinct from
//! `Executor::describe`, which reports per-task status).

use serde::Serialize;
use vmexec_core::CommandRunner;

/// Host resource totals, derived at call time rather than cached.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Resources {
    pub nano_cpus: u64,
    pub memory_bytes: u64,
}

/// What the orchestrator learns about this host via `describe()`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDescription {
    pub hostname: String,
    pub resources: Resources,
}

/// Collect `hostname`, vCPU count (`nproc`), and total memory
/// (`/proc/meminfo`) through `runner`, so tests can exercise this without
/// touching the real host. Unknown values default to zero/"unknown" rather
/// than failing — `describe()` must not error just because one probe did.
pub fn describe_node(runner: &dyn CommandRunner) -> NodeDescription {
    let hostname = runner
        .run("hostname", &[])
        .ok()
        .map(|out| out.stdout_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let vcpus: u64 = runner
        .run("nproc", &[])
        .ok()
        .and_then(|out| out.stdout_str().trim().parse().ok())
        .unwrap_or(0);

    let mem_mib: u64 = runner
        .run("sh", &["-c", "awk '/MemTotal/ {print int($2/1024)}' /proc/meminfo"])
        .ok()
        .and_then(|out| out.stdout_str().trim().parse().ok())
        .unwrap_or(0);

    NodeDescription {
        hostname,
        resources: Resources {
            nano_cpus: vcpus * 1_000_000_000,
            memory_bytes: mem_mib * 1024 * 1024,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use vmexec_core::CommandOutput;
    use vmexec_core::mock::FakeCommandRunner;

    use super::*;

    fn runner() -> FakeCommandRunner {
        FakeCommandRunner::with_handler(Arc::new(
            |program: &str, args: &[&str], _fs: &Mutex<std::collections::HashMap<String, Vec<u8>>>| match (program, args) {
                ("hostname", _) => CommandOutput { status: 0, stdout: b"worker-1\n".to_vec(), stderr: Vec::new() },
                ("nproc", _) => CommandOutput { status: 0, stdout: b"8\n".to_vec(), stderr: Vec::new() },
                ("sh", _) => CommandOutput { status: 0, stdout: b"16384\n".to_vec(), stderr: Vec::new() },
                _ => CommandOutput { status: 127, stdout: Vec::new(), stderr: Vec::new() },
            },
        ))
    }

    #[test]
    fn test_describe_node_reports_host_resources() {
        let node = describe_node(&runner());
        assert_eq!(node.hostname, "worker-1");
        assert_eq!(node.resources.nano_cpus, 8_000_000_000);
        assert_eq!(node.resources.memory_bytes, 16384 * 1024 * 1024);
    }

    #[test]
    fn test_describe_node_defaults_on_failed_probes() {
        let runner = FakeCommandRunner::with_handler(Arc::new(
            |_: &str, _: &[&str], _: &Mutex<std::collections::HashMap<String, Vec<u8>>>| CommandOutput {
                status: 127,
                stdout: Vec::new(),
                stderr: Vec::new(),
            },
        ));
        let node = describe_node(&runner);
        assert_eq!(node.hostname, "unknown");
        assert_eq!(node.resources.nano_cpus, 0);
    }
}
