//! The VM Instance state machine.
//!
//! `Stopped` and `Crashed` are terminal: nothing transitions out of them, and
//! a new task-id is required to start a new VM.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vmexec_core::task::InitSystem;

/// Internal lifecycle state of one VM Instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl VmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Orchestrator-visible status returned by `describe`, after the
/// internal-state-to-external-state mapping (and liveness downgrade) has
/// been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescribeState {
    New,
    Starting,
    Running,
    Complete,
    Failed,
    /// No VM Instance record exists for the task-id. Not an error.
    Orphaned,
}

/// Maps internal state to the orchestrator-visible value, per the component
/// contract. Does *not* apply the liveness downgrade — callers combine this
/// with a process-existence check for `Running`.
///
/// `Stopping` maps to `Starting` (still-transitional) rather than
/// `Complete`: deliberate, not a latent bug — see DESIGN.md.
pub fn describe_state(state: VmState) -> DescribeState {
    match state {
        VmState::New => DescribeState::New,
        VmState::Starting => DescribeState::Starting,
        VmState::Running => DescribeState::Running,
        VmState::Stopping => DescribeState::Starting,
        VmState::Stopped => DescribeState::Complete,
        VmState::Crashed => DescribeState::Failed,
    }
}

/// One Firecracker child process owned by the VMM Lifecycle Manager.
#[derive(Debug, Clone)]
pub struct VmInstance {
    pub task_id: String,
    /// 0 or negative means "not started".
    pub pid: i64,
    pub state: VmState,
    pub socket_path: PathBuf,
    pub init_system: InitSystem,
    pub grace_period_seconds: u64,
    pub created_at: String,
}

impl VmInstance {
    pub fn new(task_id: String, socket_path: PathBuf, init_system: InitSystem, grace_period_seconds: u64) -> Self {
        Self {
            task_id,
            pid: -1,
            state: VmState::New,
            socket_path,
            init_system,
            grace_period_seconds,
            created_at: vmexec_core::time::utc_now(),
        }
    }
}

/// A runtime-status snapshot returned alongside a [`DescribeState`]: an
/// opaque map (uptime-since-created plus the raw internal state) the
/// orchestrator may surface to operators without this crate committing to a
/// stable schema for it.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub internal_state: String,
    pub uptime_seconds: Option<u64>,
    pub pid: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_state_mapping() {
        assert_eq!(describe_state(VmState::New), DescribeState::New);
        assert_eq!(describe_state(VmState::Starting), DescribeState::Starting);
        assert_eq!(describe_state(VmState::Running), DescribeState::Running);
        assert_eq!(describe_state(VmState::Stopping), DescribeState::Starting);
        assert_eq!(describe_state(VmState::Stopped), DescribeState::Complete);
        assert_eq!(describe_state(VmState::Crashed), DescribeState::Failed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(VmState::Stopped.is_terminal());
        assert!(VmState::Crashed.is_terminal());
        assert!(!VmState::Running.is_terminal());
    }
}
