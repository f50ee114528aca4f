//! Structured audit trail of Executor lifecycle transitions.
//!
//! Not a persisted audit log: persistence and metrics sinks are out of
//! scope for this crate. Each transition is emitted as one homogeneous,
//! greppable record when scraped out of `tracing`'s JSON output.

/// One lifecycle transition the Executor façade reports on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Prepared,
    Started,
    Stopped,
    Terminated,
    Removed,
    Crashed,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prepared => "prepared",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Removed => "removed",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Emit one audit event for `task_id` at `tracing::info!`, with `detail` as
/// free-form context (e.g. a PID, or an error summary for `Crashed`).
pub fn log(task_id: &str, action: AuditAction, detail: Option<&str>) {
    tracing::info!(
        task_id,
        action = %action,
        detail = detail.unwrap_or(""),
        timestamp = %vmexec_core::time::utc_now(),
        "lifecycle transition"
    );
}
