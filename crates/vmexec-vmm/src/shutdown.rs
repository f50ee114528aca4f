//! The three-stairstep shutdown protocol: graceful, hard, force-kill. Each
//! stairstep runs to completion or times out before the next begins.

use std::path::Path;
use std::time::Duration;

use vmexec_core::ProcessSpawner;
use vmexec_core::cancel::CancelToken;
use vmexec_core::task::InitSystem;

use crate::client::FirecrackerApiClient;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
const HARD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of the whole escalation: the instance's terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Stopped,
    /// Force-kill itself failed; the instance is left in an unknown state.
    Crashed,
}

/// Drive the full escalation for a child at `pid`, with Firecracker's API
/// socket at `socket_path`. `grace_period` is the stair-1 wait (spec default
/// 10s, overridable per instance). If `cancel` fires mid-escalation, the
/// current stair is abandoned and the force-kill stair runs immediately —
/// a caller that gave up waiting still wants the child gone, not left
/// behind at whatever stair it was cancelled at.
pub async fn shutdown(
    spawner: &dyn ProcessSpawner,
    client: &dyn FirecrackerApiClient,
    pid: u32,
    socket_path: &Path,
    init_system: InitSystem,
    grace_period: Option<Duration>,
    cancel: &CancelToken,
) -> ShutdownOutcome {
    if matches!(init_system, InitSystem::Tini | InitSystem::DumbInit) {
        match try_graceful(spawner, pid, grace_period.unwrap_or(DEFAULT_GRACE_PERIOD), cancel).await {
            StairOutcome::Dead => return ShutdownOutcome::Stopped,
            StairOutcome::Cancelled => return force_kill(spawner, pid),
            StairOutcome::TimedOut => {}
        }
    }

    match try_hard(spawner, client, pid, socket_path, cancel).await {
        StairOutcome::Dead => return ShutdownOutcome::Stopped,
        StairOutcome::Cancelled => return force_kill(spawner, pid),
        StairOutcome::TimedOut => {}
    }

    force_kill(spawner, pid)
}

enum StairOutcome {
    Dead,
    TimedOut,
    Cancelled,
}

async fn try_graceful(spawner: &dyn ProcessSpawner, pid: u32, grace_period: Duration, cancel: &CancelToken) -> StairOutcome {
    if spawner.signal(pid, libc::SIGTERM).is_err() {
        return StairOutcome::TimedOut;
    }
    wait_until_dead(spawner, pid, grace_period, cancel).await
}

async fn try_hard(
    spawner: &dyn ProcessSpawner,
    client: &dyn FirecrackerApiClient,
    pid: u32,
    socket_path: &Path,
    cancel: &CancelToken,
) -> StairOutcome {
    let _ = client
        .put_json(
            socket_path,
            "/actions",
            &serde_json::json!({ "action_type": "SendCtrlAltDel" }),
            Duration::from_secs(2),
        )
        .await;
    wait_until_dead(spawner, pid, HARD_SHUTDOWN_TIMEOUT, cancel).await
}

/// The force-kill stair on its own, skipping the graceful and hard stairs
/// entirely. Used by the façade's `terminate` (as opposed to `stop`, which
/// always runs the full escalation).
pub fn force_kill(spawner: &dyn ProcessSpawner, pid: u32) -> ShutdownOutcome {
    match spawner.signal(pid, libc::SIGKILL) {
        Ok(()) => ShutdownOutcome::Stopped,
        Err(_) => ShutdownOutcome::Crashed,
    }
}

async fn wait_until_dead(spawner: &dyn ProcessSpawner, pid: u32, timeout: Duration, cancel: &CancelToken) -> StairOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !spawner.is_alive(pid) {
            return StairOutcome::Dead;
        }
        if tokio::time::Instant::now() >= deadline {
            return StairOutcome::TimedOut;
        }
        tokio::select! {
            _ = cancel.cancelled() => return StairOutcome::Cancelled,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmexec_core::mock::FakeProcessSpawner;

    #[tokio::test]
    async fn test_graceful_shutdown_succeeds_for_tini() {
        let spawner = FakeProcessSpawner::new();
        let pid = spawner.spawn("firecracker", &[], b"").unwrap();
        let client = crate::mock::FakeFirecrackerApiClient::ready_immediately();
        let outcome = shutdown(
            &spawner,
            &client,
            pid,
            Path::new("/x.sock"),
            InitSystem::Tini,
            Some(Duration::from_millis(50)),
            &CancelToken::new(),
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::Stopped);
        assert!(!client.was_put("/actions"), "graceful path should not need the hard stair");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_graceful_stair_without_init_system() {
        let spawner = FakeProcessSpawner::new().ignoring(&[libc::SIGTERM]);
        let pid = spawner.spawn("firecracker", &[], b"").unwrap();
        let client = crate::mock::FakeFirecrackerApiClient::ready_immediately();
        let outcome = shutdown(
            &spawner,
            &client,
            pid,
            Path::new("/x.sock"),
            InitSystem::None,
            Some(Duration::from_millis(50)),
            &CancelToken::new(),
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::Stopped);
        assert!(client.was_put("/actions"), "no init-system means the graceful stair is skipped entirely");
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_through_all_three_stairs() {
        let spawner = FakeProcessSpawner::new().ignoring(&[libc::SIGTERM]);
        let pid = spawner.spawn("firecracker", &[], b"").unwrap();
        let client = crate::mock::FakeFirecrackerApiClient::ready_immediately();
        let outcome = shutdown(
            &spawner,
            &client,
            pid,
            Path::new("/x.sock"),
            InitSystem::Tini,
            Some(Duration::from_millis(50)),
            &CancelToken::new(),
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::Stopped);
        assert!(client.was_put("/actions"));
        assert!(!spawner.is_alive(pid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_kill_failure_is_crashed() {
        struct DeadSignalSpawner;
        impl vmexec_core::ProcessSpawner for DeadSignalSpawner {
            fn spawn(&self, _: &str, _: &[&str], _: &[u8]) -> anyhow::Result<u32> {
                unreachable!()
            }
            fn signal(&self, _pid: u32, _signal: i32) -> anyhow::Result<()> {
                anyhow::bail!("no such process")
            }
            fn is_alive(&self, _pid: u32) -> bool {
                true
            }
        }
        let spawner = DeadSignalSpawner;
        let client = crate::mock::FakeFirecrackerApiClient::ready_immediately();
        let outcome = shutdown(&spawner, &client, 99999, Path::new("/x.sock"), InitSystem::None, None, &CancelToken::new()).await;
        assert_eq!(outcome, ShutdownOutcome::Crashed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_graceful_stair_jumps_to_force_kill() {
        let spawner = FakeProcessSpawner::new().ignoring(&[libc::SIGTERM]);
        let pid = spawner.spawn("firecracker", &[], b"").unwrap();
        let client = crate::mock::FakeFirecrackerApiClient::ready_immediately();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = shutdown(
            &spawner,
            &client,
            pid,
            Path::new("/x.sock"),
            InitSystem::Tini,
            Some(Duration::from_secs(10)),
            &cancel,
        )
        .await;
        assert_eq!(outcome, ShutdownOutcome::Stopped);
        assert!(!client.was_put("/actions"), "cancellation should force-kill directly, skipping the hard stair");
        assert!(!spawner.is_alive(pid));
    }
}
