//! Public contract of the Image Preparer: `prepare` and `cleanup`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use tracing::instrument;
use vmexec_core::cancel::CancelToken;
use vmexec_core::error::ExecutorError;
use vmexec_core::task::{InitSystem, Task, annotation_keys};
use vmexec_core::CommandRunner;

use crate::pipeline;
use crate::sanitize::sanitize;

/// Idempotently turns a task's container image reference into an ext4
/// rootfs image on disk, recording its path on the task.
pub struct ImagePreparer {
    runner: Arc<dyn CommandRunner>,
    rootfs_dir: PathBuf,
    init_system: InitSystem,
    /// Host-side path of the init binary, required when `init_system` is
    /// not `InitSystem::None`.
    init_binary_host_path: Option<PathBuf>,
}

impl ImagePreparer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        rootfs_dir: impl Into<PathBuf>,
        init_system: InitSystem,
        init_binary_host_path: Option<PathBuf>,
    ) -> Self {
        Self {
            runner,
            rootfs_dir: rootfs_dir.into(),
            init_system,
            init_binary_host_path,
        }
    }

    pub fn rootfs_path_for(&self, image_ref: &str) -> PathBuf {
        self.rootfs_dir.join(format!("{}.ext4", sanitize(image_ref)))
    }

    /// See the component contract: validates the task's runtime, checks the
    /// content-addressed cache, and on a miss runs the full build pipeline.
    /// `cancel` is checked at entry and again before the (potentially slow)
    /// build step — there is no polling loop inside the build pipeline
    /// itself to interrupt mid-flight, only these two checkpoints.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn prepare(&self, task: &mut Task, cancel: &CancelToken) -> Result<(), ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        if task.runtime.image_ref.trim().is_empty() {
            return Err(ExecutorError::InvalidRuntime);
        }

        let rootfs_path = self.rootfs_path_for(&task.runtime.image_ref);
        std::fs::create_dir_all(&self.rootfs_dir)
            .context("creating rootfs cache directory")
            .map_err(ExecutorError::from)?;

        if !rootfs_path.exists() {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            tracing::info!(rootfs = %rootfs_path.display(), "rootfs cache miss, building");
            self.build(&task.runtime.image_ref, &rootfs_path)?;
        } else {
            tracing::debug!(rootfs = %rootfs_path.display(), "rootfs cache hit");
        }

        self.record_annotations(task, &rootfs_path);
        Ok(())
    }

    fn record_annotations(&self, task: &mut Task, rootfs_path: &std::path::Path) {
        task.set_annotation(annotation_keys::ROOTFS, rootfs_path.to_string_lossy().into_owned());
        task.set_annotation(annotation_keys::INIT_SYSTEM, self.init_system.to_string());
        if let Some(guest_path) = self.init_system.guest_path() {
            task.set_annotation(annotation_keys::INIT_PATH, guest_path);
        }
    }

    fn build(&self, image_ref: &str, rootfs_path: &std::path::Path) -> Result<(), ExecutorError> {
        let scratch = tempfile::tempdir()
            .context("creating scratch directory")
            .map_err(ExecutorError::from)?;

        pipeline::extract_oci_image(self.runner.as_ref(), image_ref, scratch.path())?;

        if let Some(guest_name) = self.init_system.guest_path().and_then(|p| p.rsplit('/').next()) {
            let host_path = self.init_binary_host_path.as_deref().ok_or_else(|| {
                ExecutorError::from(anyhow::anyhow!(
                    "init_system is {} but no init_binary_host_path was configured",
                    self.init_system
                ))
            })?;
            pipeline::inject_init_binary(scratch.path(), host_path, guest_name)
                .map_err(ExecutorError::from)?;
        }

        let raw_bytes = pipeline::directory_size_bytes(scratch.path()).map_err(ExecutorError::from)?;
        let size_mib = pipeline::size_with_headroom_mib(raw_bytes);

        // Build into a temp path beside the final one, then atomically
        // rename: a losing racer either sees the winner's finished file or
        // builds its own into an unobserved name, never a partial write.
        let tmp_path = rootfs_path.with_extension(format!("ext4.tmp-{}", std::process::id()));
        pipeline::create_sparse_file(self.runner.as_ref(), &tmp_path, size_mib)
            .map_err(ExecutorError::from)?;
        pipeline::format_ext4(self.runner.as_ref(), scratch.path(), &tmp_path)?;

        if !rootfs_path.exists() {
            std::fs::rename(&tmp_path, rootfs_path)
                .context("renaming built rootfs into place")
                .map_err(ExecutorError::from)?;
        } else {
            // A concurrent builder won the race; discard our copy.
            let _ = std::fs::remove_file(&tmp_path);
        }
        Ok(())
    }

    /// Delete cached rootfs artifacts under `rootfs_dir` whose modification
    /// time is older than `keep_days`.
    #[instrument(skip(self))]
    pub fn cleanup(&self, keep_days: u64) -> Result<(), ExecutorError> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(keep_days * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let entries = match std::fs::read_dir(&self.rootfs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ExecutorError::from(anyhow::Error::from(e))),
        };

        for entry in entries {
            let entry = entry.map_err(|e| ExecutorError::from(anyhow::Error::from(e)))?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("ext4") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::now());
            if modified < cutoff {
                tracing::info!(path = %entry.path().display(), "removing stale rootfs artifact");
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use vmexec_core::task::{ContainerSpec, ResourceLimits};
    use vmexec_core::mock::FakeCommandRunner;

    fn sample_task(image_ref: &str) -> Task {
        Task {
            id: "t-1".to_string(),
            service_id: "svc".to_string(),
            runtime: ContainerSpec {
                image_ref: image_ref.to_string(),
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

    #[test]
    fn test_prepare_rejects_empty_image_ref() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = ImagePreparer::new(
            Arc::new(FakeCommandRunner::new()),
            dir.path(),
            InitSystem::None,
            None,
        );
        let mut task = sample_task("");
        let err = preparer.prepare(&mut task, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRuntime));
    }

    #[test]
    fn test_prepare_cache_miss_builds_and_sets_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = ImagePreparer::new(
            Arc::new(FakeCommandRunner::new()),
            dir.path(),
            InitSystem::None,
            None,
        );
        let mut task = sample_task("nginx:latest");
        preparer.prepare(&mut task, &CancelToken::new()).unwrap();
        let rootfs = task.rootfs().unwrap();
        assert!(rootfs.ends_with("nginx-latest.ext4"));
        assert!(std::path::Path::new(rootfs).exists());
    }

    #[test]
    fn test_prepare_cache_hit_skips_container_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs_path = dir.path().join("nginx-latest.ext4");
        std::fs::write(&rootfs_path, b"already built").unwrap();

        let runner = Arc::new(FakeCommandRunner::new());
        let preparer = ImagePreparer::new(runner.clone(), dir.path(), InitSystem::None, None);
        let mut task = sample_task("nginx:latest");
        preparer.prepare(&mut task, &CancelToken::new()).unwrap();

        assert!(!runner.was_called("docker"));
        assert_eq!(
            std::fs::read(task.rootfs().unwrap()).unwrap(),
            b"already built"
        );
    }

    #[test]
    fn test_prepare_no_runtime_available() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeCommandRunner::new().with_available(&[]));
        let preparer = ImagePreparer::new(runner, dir.path(), InitSystem::None, None);
        let mut task = sample_task("nginx:latest");
        let err = preparer.prepare(&mut task, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecutorError::NoContainerRuntime));
    }

    #[test]
    fn test_prepare_injects_init_binary_into_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let fake_init = dir.path().join("fake-tini");
        std::fs::write(&fake_init, b"#!/bin/sh\n").unwrap();

        let preparer = ImagePreparer::new(
            Arc::new(FakeCommandRunner::new()),
            dir.path().join("rootfs"),
            InitSystem::Tini,
            Some(fake_init),
        );
        let mut task = sample_task("nginx:latest");
        preparer.prepare(&mut task, &CancelToken::new()).unwrap();
        assert_eq!(task.annotation(annotation_keys::INIT_PATH), Some("/sbin/tini"));
    }

    #[test]
    fn test_prepare_cancelled_before_build_is_not_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeCommandRunner::new());
        let preparer = ImagePreparer::new(runner.clone(), dir.path(), InitSystem::None, None);
        let mut task = sample_task("nginx:latest");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = preparer.prepare(&mut task, &cancel).unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(!runner.was_called("docker"));
    }

    #[test]
    fn test_cleanup_removes_stale_artifacts_only() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("old.ext4");
        let fresh = dir.path().join("new.ext4");
        std::fs::write(&stale, b"x").unwrap();
        std::fs::write(&fresh, b"x").unwrap();

        let old_time = SystemTime::now() - Duration::from_secs(40 * 24 * 60 * 60);
        std::fs::File::open(&stale)
            .unwrap()
            .set_modified(old_time)
            .unwrap();

        let preparer = ImagePreparer::new(Arc::new(FakeCommandRunner::new()), dir.path(), InitSystem::None, None);
        preparer.cleanup(30).unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_cleanup_on_missing_dir_is_a_noop() {
        let preparer = ImagePreparer::new(
            Arc::new(FakeCommandRunner::new()),
            "/nonexistent/vmexec-rootfs-dir",
            InitSystem::None,
            None,
        );
        preparer.cleanup(30).unwrap();
    }
}
