//! The Executor façade: composes the Image Preparer, Network Manager, Task
//! Translator, and VMM Lifecycle Manager behind the orchestrator-agreed
//! lifecycle contract `prepare -> start -> wait -> stop -> remove`, plus
//! `describe`.
//!
//! Per the component ownership rules, the façade itself holds no VM
//! Instances, TAP Device Records, or Rootfs Artifacts — only task-ids — and
//! re-dispatches every call through the component that owns the relevant
//! state.

use std::sync::Arc;

use vmexec_core::task::Task;
use vmexec_core::{CancelToken, CommandRunner, ExecutorError, ProcessSpawner, RealCommandRunner, RealProcessSpawner};
use vmexec_image::ImagePreparer;
use vmexec_network::{IpAllocator, NetworkConfig, NetworkManager};
use vmexec_translate::TranslatorConfig;
use vmexec_vmm::{DescribeState, FirecrackerApiClient, RealFirecrackerApiClient, RuntimeStatus, VmmManager};

use crate::audit::{self, AuditAction};
use crate::config::ExecutorConfig;
use crate::node::{self, NodeDescription};

/// Composes the four components. Construct with [`Executor::new`] for a
/// real host, or [`Executor::from_components`] to inject fakes in tests.
pub struct Executor {
    preparer: ImagePreparer,
    network: NetworkManager,
    vmm: VmmManager,
    translator_config: TranslatorConfig,
    runner: Arc<dyn CommandRunner>,
}

impl Executor {
    /// Build an Executor backed by real external-binary calls, a real
    /// Firecracker API client, and real process spawning.
    pub fn new(config: &ExecutorConfig) -> Self {
        Self::from_components(Arc::new(RealCommandRunner), Arc::new(RealProcessSpawner), Arc::new(RealFirecrackerApiClient), config)
    }

    /// Build an Executor from injected components — the constructor tests
    /// use to drive the façade against the in-memory fakes.
    pub fn from_components(
        runner: Arc<dyn CommandRunner>,
        spawner: Arc<dyn ProcessSpawner>,
        client: Arc<dyn FirecrackerApiClient>,
        config: &ExecutorConfig,
    ) -> Self {
        let allocator = match (&config.subnet, &config.gateway) {
            (Some(subnet), Some(gateway)) => IpAllocator::new(subnet, gateway).ok(),
            _ => None,
        };

        let preparer = ImagePreparer::new(
            runner.clone(),
            config.rootfs_dir.clone(),
            config.init_system,
            config.init_binary_host_path.clone(),
        );

        let network = NetworkManager::new(
            runner.clone(),
            NetworkConfig {
                bridge_name: config.bridge_name.clone(),
                bridge_ip: config.bridge_ip.clone(),
                nat_enabled: config.nat_enabled,
                subnet: config.subnet.clone(),
            },
            allocator,
        );

        let vmm = VmmManager::new(runner.clone(), spawner, client, config.socket_dir.clone());

        let translator_config = TranslatorConfig {
            kernel_image_path: config.kernel_image_path.clone(),
            initrd_path: config.initrd_path.clone(),
        };

        Self { preparer, network, vmm, translator_config, runner }
    }

    /// `ImagePreparer.prepare` then `NetworkManager.prepareNetwork`, per the
    /// pipeline order in the component overview. On a network failure the
    /// rootfs artifact is left in place — it is content-addressed and
    /// reusable by a retried `prepare` call for the same task.
    pub fn prepare(&self, task: &mut Task, cancel: &CancelToken) -> Result<(), ExecutorError> {
        self.preparer.prepare(task, cancel)?;
        self.network.prepare_network(task, cancel)?;
        audit::log(&task.id, AuditAction::Prepared, None);
        Ok(())
    }

    /// `TaskTranslator.translate` then `VMM.start`. Precondition: `prepare`
    /// has already run for `task` (its `rootfs` annotation must be set).
    /// Blocks (up to the readiness deadline) waiting for the Firecracker API
    /// socket to come up; `cancel` unblocks that wait early.
    pub async fn start(&self, task: &Task, cancel: &CancelToken) -> Result<(), ExecutorError> {
        let boot_config_json = vmexec_translate::translate(task, &self.translator_config)?;
        let result = self.vmm.start(task, &boot_config_json, cancel).await;
        match &result {
            Ok(()) => audit::log(&task.id, AuditAction::Started, None),
            Err(e) => audit::log(&task.id, AuditAction::Crashed, Some(&e.to_string())),
        }
        result
    }

    /// Blocks until the VM exits or `cancel` fires.
    pub async fn wait(&self, task_id: &str, cancel: &CancelToken) -> Result<DescribeState, ExecutorError> {
        self.vmm.wait(task_id, cancel).await
    }

    /// `shutdown` in the external-interface naming: the full three-stairstep
    /// escalation (graceful, hard, force-kill). Blocks through as much of
    /// that escalation as it takes to reach a terminal state; `cancel`
    /// short-circuits the current stair straight to force-kill.
    pub async fn stop(&self, task_id: &str, cancel: &CancelToken) -> Result<(), ExecutorError> {
        let result = self.vmm.stop(task_id, cancel).await;
        match &result {
            Ok(()) => audit::log(task_id, AuditAction::Stopped, None),
            Err(e) => audit::log(task_id, AuditAction::Crashed, Some(&e.to_string())),
        }
        result
    }

    /// The force-kill path directly, skipping the graceful and hard stairs
    /// `stop` runs through — the external-interface contract's `terminate`.
    pub async fn terminate(&self, task_id: &str) -> Result<(), ExecutorError> {
        let result = self.vmm.terminate(task_id).await;
        match &result {
            Ok(()) => audit::log(task_id, AuditAction::Terminated, None),
            Err(e) => audit::log(task_id, AuditAction::Crashed, Some(&e.to_string())),
        }
        result
    }

    /// Non-blocking status read, mapped through the internal-to-external
    /// state machine and the liveness-downgrade rule.
    pub fn describe(&self, task_id: &str) -> (DescribeState, RuntimeStatus) {
        self.vmm.describe(task_id)
    }

    /// Best-effort teardown: `NetworkManager.cleanupNetwork` then
    /// `VMM.remove`. Idempotent and infallible, per the removal contract —
    /// a missing task is simply a no-op in both components.
    pub fn remove(&self, task: &Task) {
        self.network.cleanup_network(task);
        self.vmm.remove(&task.id);
        audit::log(&task.id, AuditAction::Removed, None);
    }

    /// `controller(task).update` in the external-interface listing. No
    /// mutable configuration surface is defined for a running VM Instance
    /// beyond what `prepare`/`start` already fix at boot time, so this is a
    /// liveness check: `Ok(())` for any task with a non-terminal instance,
    /// `NotFound` otherwise. Recorded as a resolved Open Question in
    /// DESIGN.md.
    pub fn update(&self, task_id: &str) -> Result<(), ExecutorError> {
        let (state, _) = self.vmm.describe(task_id);
        if state == DescribeState::Orphaned {
            return Err(ExecutorError::NotFound { task_id: task_id.to_string() });
        }
        Ok(())
    }

    /// `describe()` in the external-interface listing: node identity and
    /// host resources, as distinct from per-task `Executor::describe`.
    pub fn describe_node(&self) -> NodeDescription {
        node::describe_node(self.runner.as_ref())
    }

    /// Delete cached rootfs artifacts older than `keep_days`.
    pub fn cleanup_rootfs(&self, keep_days: u64) -> Result<(), ExecutorError> {
        self.preparer.cleanup(keep_days)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vmexec_core::mock::{FakeCommandRunner, FakeProcessSpawner};
    use vmexec_core::task::{ContainerSpec, NetworkAttachment, ResourceLimits};
    use vmexec_vmm::FakeFirecrackerApiClient;

    use super::*;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            service_id: "svc".to_string(),
            runtime: ContainerSpec {
                image_ref: "nginx:latest".to_string(),
                command: vec!["/bin/sh".to_string()],
                args: vec![],
                env: HashMap::new(),
                mounts: vec![],
            },
            resources: ResourceLimits::default(),
            network_attachments: vec![NetworkAttachment { ip_mode: "static".to_string(), bridge: String::new() }],
            annotations: HashMap::new(),
        }
    }

    fn executor(rootfs_dir: &std::path::Path) -> Executor {
        let runner = Arc::new(FakeCommandRunner::new().with_available(&["firecracker"]));
        let spawner = Arc::new(FakeProcessSpawner::new());
        let client = Arc::new(FakeFirecrackerApiClient::ready_immediately());
        let config = ExecutorConfig {
            rootfs_dir: rootfs_dir.to_path_buf(),
            socket_dir: rootfs_dir.to_path_buf(),
            ..ExecutorConfig::default()
        };
        Executor::from_components(runner, spawner, client, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle_prepare_start_stop_remove() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let mut task = sample_task("t-1");

        executor.prepare(&mut task, &CancelToken::new()).unwrap();
        assert!(task.rootfs().is_some());

        executor.start(&task, &CancelToken::new()).await.unwrap();
        let (state, _) = executor.describe("t-1");
        assert_eq!(state, DescribeState::Running);

        executor.stop("t-1", &CancelToken::new()).await.unwrap();
        let (state, _) = executor.describe("t-1");
        assert_eq!(state, DescribeState::Complete);

        executor.remove(&task);
        let (state, _) = executor.describe("t-1");
        assert_eq!(state, DescribeState::Orphaned);
    }

    #[tokio::test]
    async fn test_terminate_is_available_alongside_stop() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let mut task = sample_task("t-2");
        executor.prepare(&mut task, &CancelToken::new()).unwrap();
        executor.start(&task, &CancelToken::new()).await.unwrap();
        executor.terminate("t-2").await.unwrap();
        let (state, _) = executor.describe("t-2");
        assert_eq!(state, DescribeState::Complete);
    }

    #[tokio::test]
    async fn test_update_on_missing_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let err = executor.update("ghost").unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_on_running_task_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let mut task = sample_task("t-3");
        executor.prepare(&mut task, &CancelToken::new()).unwrap();
        executor.start(&task, &CancelToken::new()).await.unwrap();
        executor.update("t-3").unwrap();
    }

    #[test]
    fn test_describe_node_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let node = executor.describe_node();
        // The fake runner's default handler has no case for `hostname`
        // /`nproc`/`sh`, so these fall back to their documented defaults.
        assert_eq!(node.hostname, "unknown");
        assert_eq!(node.resources.nano_cpus, 0);
    }
}
