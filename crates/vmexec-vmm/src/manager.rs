//! The VMM Lifecycle Manager's public contract: `start`, `stop`, `wait`,
//! `describe`, `remove`. Composes the spawn protocol, the shutdown
//! escalation, and the state machine behind a `task_id -> VmInstance`
//! registry.
//!
//! Thread-safety follows the "acquire, clone, release, do I/O, reacquire to
//! commit" discipline: the registry lock is never held across an `.await` or
//! a blocking subprocess call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, instrument, warn};
use vmexec_core::task::{InitSystem, Task, annotation_keys};
use vmexec_core::{CancelToken, CommandRunner, ExecutorError, ProcessSpawner};

use crate::client::FirecrackerApiClient;
use crate::shutdown::{self, ShutdownOutcome};
use crate::spawn;
use crate::state::{DescribeState, RuntimeStatus, VmInstance, VmState, describe_state};

const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 10;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn init_system_from_annotation(task: &Task) -> InitSystem {
    match task.annotation(annotation_keys::INIT_SYSTEM) {
        Some("tini") => InitSystem::Tini,
        Some("dumb_init") => InitSystem::DumbInit,
        _ => InitSystem::None,
    }
}

/// Owns every live Firecracker child process this host is responsible for.
pub struct VmmManager {
    runner: Arc<dyn CommandRunner>,
    spawner: Arc<dyn ProcessSpawner>,
    client: Arc<dyn FirecrackerApiClient>,
    socket_dir: PathBuf,
    instances: Mutex<HashMap<String, VmInstance>>,
}

impl VmmManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        spawner: Arc<dyn ProcessSpawner>,
        client: Arc<dyn FirecrackerApiClient>,
        socket_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            spawner,
            client,
            socket_dir,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Step 1-6 of the spawn protocol. Precondition: no VM Instance exists
    /// for `task.id` yet — a new task-id is required to retry after a
    /// failed or crashed attempt.
    #[instrument(skip(self, boot_config_json), fields(task_id = %task.id))]
    pub async fn start(&self, task: &Task, boot_config_json: &str, cancel: &CancelToken) -> Result<(), ExecutorError> {
        let socket_path = spawn::socket_path(&self.socket_dir, &task.id);
        let init_system = init_system_from_annotation(task);

        {
            let mut instances = self.instances.lock().unwrap();
            if instances.contains_key(&task.id) {
                return Err(ExecutorError::AlreadyExists { task_id: task.id.clone() });
            }
            let mut instance = VmInstance::new(task.id.clone(), socket_path.clone(), init_system, DEFAULT_GRACE_PERIOD_SECONDS);
            instance.state = VmState::Starting;
            instances.insert(task.id.clone(), instance);
        }

        if let Err(e) = spawn::resolve_binary(self.runner.as_ref()) {
            self.mark_crashed(&task.id);
            return Err(e);
        }

        let pid = match spawn::spawn_child(self.spawner.as_ref(), &socket_path, boot_config_json) {
            Ok(pid) => pid,
            Err(e) => {
                self.mark_crashed(&task.id);
                return Err(e);
            }
        };
        self.set_pid(&task.id, pid as i64);

        if let Err(e) = spawn::wait_for_api_ready(self.client.as_ref(), &socket_path, &task.id, cancel).await {
            warn!(task_id = %task.id, "API socket never became ready, killing child");
            let _ = self.spawner.signal(pid, libc::SIGKILL);
            self.mark_crashed(&task.id);
            return Err(e);
        }

        if let Err(e) = spawn::start_instance(self.client.as_ref(), &socket_path).await {
            warn!(task_id = %task.id, "InstanceStart failed, killing child");
            let _ = self.spawner.signal(pid, libc::SIGKILL);
            self.mark_crashed(&task.id);
            return Err(e);
        }

        self.mark_running(&task.id);
        info!(task_id = %task.id, pid, "VM instance running");
        Ok(())
    }

    /// The three-stairstep shutdown escalation. Precondition: a VM Instance
    /// exists for `task_id`. Idempotent if it is already terminal.
    #[instrument(skip(self))]
    pub async fn stop(&self, task_id: &str, cancel: &CancelToken) -> Result<(), ExecutorError> {
        let instance = self.get(task_id).ok_or_else(|| ExecutorError::NotFound {
            task_id: task_id.to_string(),
        })?;

        if instance.state.is_terminal() {
            return Ok(());
        }

        self.set_state(task_id, VmState::Stopping);

        let outcome = shutdown::shutdown(
            self.spawner.as_ref(),
            self.client.as_ref(),
            instance.pid as u32,
            &instance.socket_path,
            instance.init_system,
            Some(Duration::from_secs(instance.grace_period_seconds)),
            cancel,
        )
        .await;

        match outcome {
            ShutdownOutcome::Stopped => {
                self.set_state(task_id, VmState::Stopped);
                Ok(())
            }
            ShutdownOutcome::Crashed => {
                self.set_state(task_id, VmState::Crashed);
                Err(ExecutorError::from(anyhow::anyhow!("force-kill failed for task {task_id}")))
            }
        }
    }

    /// The force-kill path directly, skipping the graceful and hard stairs
    /// `stop` would otherwise run through. Precondition: a VM Instance
    /// exists for `task_id`. Idempotent if it is already terminal.
    #[instrument(skip(self))]
    pub async fn terminate(&self, task_id: &str) -> Result<(), ExecutorError> {
        let instance = self.get(task_id).ok_or_else(|| ExecutorError::NotFound {
            task_id: task_id.to_string(),
        })?;

        if instance.state.is_terminal() {
            return Ok(());
        }

        self.set_state(task_id, VmState::Stopping);
        match shutdown::force_kill(self.spawner.as_ref(), instance.pid as u32) {
            ShutdownOutcome::Stopped => {
                self.set_state(task_id, VmState::Stopped);
                Ok(())
            }
            ShutdownOutcome::Crashed => {
                self.set_state(task_id, VmState::Crashed);
                Err(ExecutorError::from(anyhow::anyhow!("force-kill failed for task {task_id}")))
            }
        }
    }

    /// Blocks until the child exits or `cancel` fires. A missing instance
    /// resolves immediately to `Orphaned`, never an error.
    pub async fn wait(&self, task_id: &str, cancel: &CancelToken) -> Result<DescribeState, ExecutorError> {
        loop {
            let Some(instance) = self.get(task_id) else {
                return Ok(DescribeState::Orphaned);
            };
            if instance.state.is_terminal() || !self.spawner.is_alive(instance.pid as u32) {
                if !instance.state.is_terminal() {
                    self.set_state(task_id, VmState::Stopped);
                }
                return Ok(self.describe(task_id).0);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Non-blocking status read. The only place internal state is inferred
    /// (via a liveness probe) rather than commanded: a stored `Running`
    /// whose process is actually gone downgrades to `Complete`.
    pub fn describe(&self, task_id: &str) -> (DescribeState, RuntimeStatus) {
        let Some(instance) = self.get(task_id) else {
            return (
                DescribeState::Orphaned,
                RuntimeStatus {
                    internal_state: "orphaned".to_string(),
                    uptime_seconds: None,
                    pid: None,
                },
            );
        };

        let mut effective_state = instance.state;
        if effective_state == VmState::Running && !self.spawner.is_alive(instance.pid as u32) {
            effective_state = VmState::Stopped;
            self.set_state(task_id, VmState::Stopped);
        }

        let status = RuntimeStatus {
            internal_state: effective_state.to_string(),
            uptime_seconds: vmexec_core::time::seconds_since(&instance.created_at),
            pid: if instance.pid > 0 { Some(instance.pid) } else { None },
        };
        (describe_state(effective_state), status)
    }

    /// Idempotent teardown: force-kill if still alive, then forget the
    /// instance. Never fails — best-effort by design, per the removal
    /// contract.
    pub fn remove(&self, task_id: &str) {
        if let Some(instance) = self.get(task_id) {
            if instance.pid > 0 && self.spawner.is_alive(instance.pid as u32) {
                let _ = self.spawner.signal(instance.pid as u32, libc::SIGKILL);
            }
            let _ = std::fs::remove_file(&instance.socket_path);
        }
        self.instances.lock().unwrap().remove(task_id);
    }

    fn get(&self, task_id: &str) -> Option<VmInstance> {
        self.instances.lock().unwrap().get(task_id).cloned()
    }

    fn set_state(&self, task_id: &str, state: VmState) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(task_id) {
            instance.state = state;
        }
    }

    fn set_pid(&self, task_id: &str, pid: i64) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(task_id) {
            instance.pid = pid;
        }
    }

    fn mark_crashed(&self, task_id: &str) {
        self.set_state(task_id, VmState::Crashed);
    }

    fn mark_running(&self, task_id: &str) {
        self.set_state(task_id, VmState::Running);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vmexec_core::mock::{FakeCommandRunner, FakeProcessSpawner};
    use vmexec_core::task::{ContainerSpec, ResourceLimits};

    use super::*;
    use crate::mock::FakeFirecrackerApiClient;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            service_id: "svc".to_string(),
            runtime: ContainerSpec {
                image_ref: "nginx:latest".to_string(),
                command: vec![],
                args: vec![],
                env: HashMap::new(),
                mounts: vec![],
            },
            resources: ResourceLimits::default(),
            network_attachments: vec![],
            annotations: HashMap::new(),
        }
    }

    fn manager_with(client: FakeFirecrackerApiClient) -> (VmmManager, Arc<FakeProcessSpawner>) {
        let runner = Arc::new(FakeCommandRunner::new().with_available(&[spawn::FIRECRACKER_BINARY]));
        let spawner = Arc::new(FakeProcessSpawner::new());
        let manager = VmmManager::new(runner, spawner.clone(), Arc::new(client), PathBuf::from("/tmp/vmexec-test"));
        (manager, spawner)
    }

    #[tokio::test]
    async fn test_start_then_describe_running() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        let (state, status) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Running);
        assert!(status.pid.is_some());
        assert!(status.uptime_seconds.is_some(), "a live instance reports uptime-since-created");
    }

    #[tokio::test]
    async fn test_describe_orphaned_reports_no_uptime() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let (state, status) = manager.describe("ghost");
        assert_eq!(state, DescribeState::Orphaned);
        assert!(status.uptime_seconds.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_already_exists() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        let err = manager.start(&task, "{}", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_start_missing_binary_marks_crashed() {
        let runner = Arc::new(FakeCommandRunner::new().with_available(&[]));
        let spawner = Arc::new(FakeProcessSpawner::new());
        let manager = VmmManager::new(
            runner,
            spawner,
            Arc::new(FakeFirecrackerApiClient::ready_immediately()),
            PathBuf::from("/tmp/vmexec-test"),
        );
        let task = sample_task("t-1");
        let err = manager.start(&task, "{}", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::BinaryNotFound { .. }));
        let (state, _) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_api_never_ready_kills_child_and_crashes() {
        let (manager, spawner) = manager_with(FakeFirecrackerApiClient::never_ready());
        let task = sample_task("t-1");
        let err = manager.start(&task, "{}", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ApiTimeout { .. }));
        let (state, _) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Failed);
        assert!(spawner.calls()[0].program == spawn::FIRECRACKER_BINARY);
    }

    #[tokio::test]
    async fn test_stop_missing_is_not_found() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let err = manager.stop("ghost", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_and_reaches_stopped() {
        let (manager, spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        manager.stop("t-1", &CancelToken::new()).await.unwrap();
        let (state, _) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Complete);
        let pid = manager.get("t-1").map(|i| i.pid as u32).unwrap();
        assert!(!spawner.is_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_once_terminal() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        manager.stop("t-1", &CancelToken::new()).await.unwrap();
        manager.stop("t-1", &CancelToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_missing_task_is_orphaned_not_error() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let cancel = CancelToken::new();
        let result = manager.wait("ghost", &cancel).await.unwrap();
        assert_eq!(result, DescribeState::Orphaned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_when_cancelled() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        // process stays alive throughout; only cancellation should unblock wait.
        let manager = Arc::new(manager);
        let cancel = CancelToken::new();
        let wait_handle = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.wait("t-1", &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = wait_handle.await.unwrap();
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_terminate_skips_graceful_and_hard_stairs() {
        let (manager, spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        let pid = manager.get("t-1").map(|i| i.pid as u32).unwrap();
        manager.terminate("t-1").await.unwrap();
        let (state, _) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Complete);
        assert!(!spawner.is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_missing_is_not_found() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let err = manager.terminate("ghost").await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_for_missing_task() {
        let (manager, _spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        manager.remove("ghost");
        manager.remove("ghost");
    }

    #[tokio::test]
    async fn test_remove_kills_live_instance() {
        let (manager, spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        let pid = manager.get("t-1").map(|i| i.pid as u32).unwrap();
        manager.remove("t-1");
        assert!(!spawner.is_alive(pid));
        let (state, _) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Orphaned);
    }

    #[tokio::test]
    async fn test_describe_downgrades_running_to_complete_when_process_gone() {
        let (manager, spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        let pid = manager.get("t-1").map(|i| i.pid as u32).unwrap();
        spawner.mark_dead(pid);
        let (state, status) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Complete);
        assert_eq!(status.internal_state, "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancelled_still_reaches_terminal_via_force_kill() {
        let (manager, spawner) = manager_with(FakeFirecrackerApiClient::ready_immediately());
        let task = sample_task("t-1");
        manager.start(&task, "{}", &CancelToken::new()).await.unwrap();
        let pid = manager.get("t-1").map(|i| i.pid as u32).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        manager.stop("t-1", &cancel).await.unwrap();

        let (state, _) = manager.describe("t-1");
        assert_eq!(state, DescribeState::Complete);
        assert!(!spawner.is_alive(pid));
    }
}
