//! The external-binary-call testability boundary.
//!
//! Every `exec`-style invocation in this crate family — `ip`, `iptables`,
//! `mkfs.ext4`, `truncate`, `tar`, `docker`/`podman`, and the `firecracker`
//! binary itself — goes through [`CommandRunner`] (run-to-completion calls)
//! or [`ProcessSpawner`] (long-lived child processes the caller must signal
//! and reap). This is, per design, the single most important testability
//! boundary in the system: real implementations shell out for real, the
//! in-memory fakes used in tests never touch the host.

use std::io::Write as _;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Captured result of a run-to-completion external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Abstracts invocation of external utilities so the core can be tested
/// without real side effects.
pub trait CommandRunner: Send + Sync {
    /// Run `program args...` to completion, capturing stdout/stderr.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// True if `program` resolves on `PATH`. Used by the Image Preparer to
    /// pick the first available container runtime without treating a
    /// missing binary as a hard error.
    fn which(&self, program: &str) -> bool;
}

/// Abstracts spawning and controlling a long-lived child process: the
/// Firecracker binary itself, which must stay alive across many subsequent
/// API calls and eventually be signalled and reaped.
pub trait ProcessSpawner: Send + Sync {
    /// Spawn `program args...`, pipe `stdin_data` to its stdin then close
    /// it, inherit stdout/stderr to the parent. Returns the child's PID.
    fn spawn(&self, program: &str, args: &[&str], stdin_data: &[u8]) -> Result<u32>;

    /// Send `signal` (e.g. `libc::SIGTERM`, `libc::SIGKILL`) to `pid`.
    fn signal(&self, pid: u32, signal: i32) -> Result<()>;

    /// Zero-signal existence check: true iff the process is still alive.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to run: {program} {}", args.join(" ")))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn which(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Real [`ProcessSpawner`] backed by `std::process::Command` + `libc::kill`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealProcessSpawner;

impl ProcessSpawner for RealProcessSpawner {
    fn spawn(&self, program: &str, args: &[&str], stdin_data: &[u8]) -> Result<u32> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn: {program} {}", args.join(" ")))?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(stdin_data)
            .with_context(|| format!("failed to write boot config to stdin of: {program}"))?;

        let pid = child.id();
        // The caller tracks this process by PID from here on (signal/is_alive
        // go through libc::kill), but something still has to waitpid() it or
        // a naturally-exited child sits as a zombie that kill(pid, 0) still
        // reports alive. Hand the `Child` to a detached thread that blocks on
        // `wait()` until the kernel reaps it.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<()> {
        let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            anyhow::bail!("kill({pid}, {signal}) failed: {err}");
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
}
