//! The six-step spawn protocol: resolve binary, choose socket path, spawn
//! with the boot config piped to stdin, poll for API readiness, optionally
//! configure in pieces, then hand back to the caller to commit the instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use vmexec_core::CommandRunner;
use vmexec_core::ProcessSpawner;
use vmexec_core::cancel::CancelToken;
use vmexec_core::error::ExecutorError;

use crate::client::FirecrackerApiClient;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READINESS_DEADLINE: Duration = Duration::from_secs(10);
const READINESS_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

pub const FIRECRACKER_BINARY: &str = "firecracker";

/// `<socket_dir>/<task-id>.sock`.
pub fn socket_path(socket_dir: &Path, task_id: &str) -> PathBuf {
    socket_dir.join(format!("{task_id}.sock"))
}

/// Resolve the `firecracker` binary on `PATH`. Step 1 of the spawn protocol.
pub fn resolve_binary(runner: &dyn CommandRunner) -> Result<(), ExecutorError> {
    if runner.which(FIRECRACKER_BINARY) {
        Ok(())
    } else {
        Err(ExecutorError::BinaryNotFound {
            binary: FIRECRACKER_BINARY.to_string(),
        })
    }
}

/// Spawn `firecracker --api-sock <socket_path> --config-file /dev/stdin`,
/// piping `boot_config_json` to its stdin. Returns the child's PID.
pub fn spawn_child(spawner: &dyn ProcessSpawner, socket_path: &Path, boot_config_json: &str) -> Result<u32, ExecutorError> {
    let socket_str = socket_path.to_string_lossy().into_owned();
    spawner
        .spawn(
            FIRECRACKER_BINARY,
            &["--api-sock", &socket_str, "--config-file", "/dev/stdin"],
            boot_config_json.as_bytes(),
        )
        .map_err(|e| ExecutorError::SpawnFailed { reason: format!("{e:#}") })
}

/// Poll every 100ms, deadline 10s, for `socket_path` to exist and respond to
/// `GET /`. On deadline, the caller is expected to kill the child. Also
/// returns early, as [`ExecutorError::Cancelled`], if `cancel` fires —
/// the caller kills the child in that case too.
pub async fn wait_for_api_ready(
    client: &dyn FirecrackerApiClient,
    socket_path: &Path,
    task_id: &str,
    cancel: &CancelToken,
) -> Result<(), ExecutorError> {
    let deadline = tokio::time::Instant::now() + READINESS_DEADLINE;
    loop {
        if client.probe_ready(socket_path, READINESS_REQUEST_TIMEOUT).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ExecutorError::ApiTimeout {
                task_id: task_id.to_string(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            _ = tokio::time::sleep(READINESS_POLL_INTERVAL) => {}
        }
    }
}

/// Issue `PUT /actions { "action_type": "InstanceStart" }`. Expects `204 No
/// Content`; any other status is mapped by the caller to
/// [`ExecutorError::SpawnFailed`] — a non-204 boot action is treated the
/// same as a spawn failure: kill and report.
pub async fn start_instance(client: &dyn FirecrackerApiClient, socket_path: &Path) -> Result<(), ExecutorError> {
    let status = client
        .put_json(
            socket_path,
            "/actions",
            &serde_json::json!({ "action_type": "InstanceStart" }),
            Duration::from_secs(5),
        )
        .await?;
    if status.as_u16() == 204 {
        Ok(())
    } else {
        Err(ExecutorError::SpawnFailed {
            reason: format!("InstanceStart returned status {status}"),
        })
    }
}
