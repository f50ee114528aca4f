use thiserror::Error;

/// Stable error kinds surfaced at the Executor façade boundary.
///
/// Internal component functions propagate with `anyhow::Result` and
/// `.context(...)` chains for human-readable diagnostics; at the façade edge
/// those are mapped into one of these variants so callers can match on kind
/// rather than parse strings.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// `start` called for a task-id that already has a VM Instance.
    #[error("VM instance already exists for task {task_id}")]
    AlreadyExists { task_id: String },
    /// `stop`/`start` on a task with no VM Instance, where the contract
    /// demands an error rather than the `ORPHANED` status value.
    #[error("no VM instance for task {task_id}")]
    NotFound { task_id: String },
    /// The `firecracker` binary could not be resolved on `PATH`.
    #[error("binary not found on PATH: {binary}")]
    BinaryNotFound { binary: String },
    /// The boot configuration document was rejected before spawn.
    #[error("invalid boot configuration: {reason}")]
    InvalidConfig { reason: String },
    /// The API socket never became ready within the readiness deadline.
    #[error("Firecracker API socket for task {task_id} never became ready")]
    ApiTimeout { task_id: String },
    /// The child process failed to spawn, or exited before configuration
    /// completed.
    #[error("failed to spawn Firecracker: {reason}")]
    SpawnFailed { reason: String },
    /// `task.spec.runtime` is not a container descriptor.
    #[error("task runtime is not a container descriptor")]
    InvalidRuntime,
    /// No container runtime (`docker`, `podman`) was found on `PATH`.
    #[error("no container runtime (docker, podman) on PATH")]
    NoContainerRuntime,
    /// OCI image extraction failed after exhausting every runtime.
    #[error("OCI image extraction failed: {reason}")]
    ExtractFailed { reason: String },
    /// `mkfs.ext4` failed while formatting the rootfs image.
    #[error("mkfs.ext4 failed: {reason}")]
    MkfsFailed { reason: String },
    /// The translator needs `task.annotations["rootfs"]` but it is absent.
    #[error("task.annotations[\"rootfs\"] is not set")]
    MissingRootfs,
    /// The IP allocator's subnet has no free addresses left.
    #[error("no free addresses left in subnet")]
    SubnetExhausted,
    /// A blocking wait was cancelled via its `CancelToken` before it
    /// resolved naturally. Not a failure of the underlying operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Anything else: filesystem errors, `ip`/`iptables` failures, and other
    /// resource-external errors that don't warrant their own variant.
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_display_includes_task_id() {
        let e = ExecutorError::NotFound {
            task_id: "t-1".to_string(),
        };
        assert!(e.to_string().contains("t-1"));
    }

    #[test]
    fn test_internal_wraps_anyhow_context() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("boom")).context("doing the thing");
        let e: ExecutorError = inner.unwrap_err().into();
        assert!(e.to_string().contains("doing the thing"));
        assert!(e.to_string().contains("boom"));
    }
}
