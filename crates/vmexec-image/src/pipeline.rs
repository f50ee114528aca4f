//! The cache-miss build pipeline: OCI image extraction, sizing, and ext4
//! formatting.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use vmexec_core::CommandRunner;
use vmexec_core::error::ExecutorError;
use vmexec_core::retry;

/// Container runtimes tried in order, first one found on `PATH` wins.
const RUNTIMES: &[&str] = &["docker", "podman"];

/// Extract `image_ref`'s filesystem into `scratch`, trying every available
/// container runtime in order. A runtime that's present but whose extraction
/// fails is not fatal: the next available runtime is tried before giving up.
/// Returns the runtime name that actually succeeded.
pub fn extract_oci_image(
    runner: &dyn CommandRunner,
    image_ref: &str,
    scratch: &Path,
) -> Result<&'static str, ExecutorError> {
    let available: Vec<&'static str> = RUNTIMES.iter().copied().filter(|rt| runner.which(rt)).collect();
    if available.is_empty() {
        return Err(ExecutorError::NoContainerRuntime);
    }

    let mut last_err = None;
    for runtime in available {
        match extract_with_runtime(runner, runtime, image_ref, scratch) {
            Ok(()) => return Ok(runtime),
            Err(e) => {
                tracing::warn!(runtime, error = %format!("{e:#}"), "image extraction failed, trying next runtime");
                last_err = Some(e);
            }
        }
    }

    Err(ExecutorError::ExtractFailed {
        reason: format!("{:#}", last_err.expect("available is non-empty")),
    })
}

fn extract_with_runtime(
    runner: &dyn CommandRunner,
    runtime: &str,
    image_ref: &str,
    scratch: &Path,
) -> Result<()> {
    let tar_path = scratch.join("fs.tar");
    let tar_path_str = tar_path.to_string_lossy().into_owned();

    let container_id = retry::retry(3, Duration::from_millis(200), "container create", || {
        let out = runner.run(runtime, &["create", image_ref, "/bin/true"])?;
        if !out.success() {
            bail!("{runtime} create failed: {}", out.stderr_str());
        }
        Ok(out.stdout_str().trim().to_string())
    })
    .context("creating container to extract filesystem")?;

    let export_result = (|| -> Result<()> {
        let out = runner.run(runtime, &["export", &container_id, "-o", &tar_path_str])?;
        if !out.success() {
            bail!("{runtime} export failed: {}", out.stderr_str());
        }
        Ok(())
    })();

    // rm always runs, even if export failed, so we don't leak a container.
    let _ = runner.run(runtime, &["rm", "-f", &container_id]);
    export_result.context("exporting container filesystem")?;

    let scratch_str = scratch.to_string_lossy().into_owned();
    let out = runner
        .run("tar", &["xf", &tar_path_str, "-C", &scratch_str])
        .context("unpacking container filesystem tar")?;
    if !out.success() {
        bail!("tar extraction failed: {}", out.stderr_str());
    }

    let _ = std::fs::remove_file(&tar_path);
    Ok(())
}

/// Sum the apparent size of every regular file under `dir`, recursively.
pub fn directory_size_bytes(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("reading directory {}", current.display()))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
            // Symlinks are not followed: their target may not exist inside
            // scratch, and mkfs.ext4 -d preserves them as-is regardless.
        }
    }
    Ok(total)
}

const MIB: u64 = 1024 * 1024;
const MIN_IMAGE_MIB: u64 = 100;
const HEADROOM_NUMERATOR: u64 = 120;
const HEADROOM_DENOMINATOR: u64 = 100;

/// Apply the 20% headroom and 100 MiB floor to a raw byte count, returning
/// a whole megabyte count.
pub fn size_with_headroom_mib(raw_bytes: u64) -> u64 {
    let with_headroom = raw_bytes.saturating_mul(HEADROOM_NUMERATOR) / HEADROOM_DENOMINATOR;
    let mib = with_headroom.div_ceil(MIB);
    mib.max(MIN_IMAGE_MIB)
}

/// Create a sparse file of `size_mib` megabytes at `path`.
pub fn create_sparse_file(runner: &dyn CommandRunner, path: &Path, size_mib: u64) -> Result<()> {
    let path_str = path.to_string_lossy().into_owned();
    let out = runner
        .run("truncate", &["-s", &format!("{size_mib}M"), &path_str])
        .context("creating sparse rootfs file")?;
    if !out.success() {
        bail!("truncate failed: {}", out.stderr_str());
    }
    Ok(())
}

/// Format `path` as ext4, seeded with the contents of `scratch`. Removes
/// `path` on failure so no partial artifact is left behind.
pub fn format_ext4(runner: &dyn CommandRunner, scratch: &Path, path: &Path) -> Result<(), ExecutorError> {
    let scratch_str = scratch.to_string_lossy().into_owned();
    let path_str = path.to_string_lossy().into_owned();

    let result = runner.run("mkfs.ext4", &["-d", &scratch_str, &path_str]);
    match result {
        Ok(out) if out.success() => Ok(()),
        Ok(out) => {
            let _ = std::fs::remove_file(path);
            Err(ExecutorError::MkfsFailed {
                reason: out.stderr_str(),
            })
        }
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(ExecutorError::MkfsFailed {
                reason: format!("{e:#}"),
            })
        }
    }
}

/// Copy the configured init binary into `<scratch>/sbin/<name>` and mark it
/// executable, per the init-injection contract (baked in at build time,
/// before `mkfs.ext4` runs).
pub fn inject_init_binary(scratch: &Path, host_init_path: &Path, guest_name: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let sbin = scratch.join("sbin");
    std::fs::create_dir_all(&sbin).context("creating scratch /sbin")?;
    let dest = sbin.join(guest_name);
    std::fs::copy(host_init_path, &dest)
        .with_context(|| format!("copying init binary from {}", host_init_path.display()))?;
    let mut perms = std::fs::metadata(&dest)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&dest, perms)?;
    Ok(())
}
