//! In-memory fakes for [`crate::CommandRunner`] and [`crate::ProcessSpawner`].
//!
//! A shared, `Mutex`-guarded in-memory filesystem backs file-producing
//! commands (`mkfs.ext4`, `truncate`, `tar`), and a call log lets tests
//! assert which binaries were (or weren't) invoked — e.g. "no container
//! runtime was invoked on a cache hit". `truncate`/`mkfs.ext4` also write
//! their (empty/fake-content) output to the real path given: callers build
//! the produced artifact's final location with real `std::fs` calls
//! (existence checks, atomic rename) regardless of which `CommandRunner`
//! is behind the trait object, so the fake has to leave something there
//! too. Every component here takes its `CommandRunner`/`ProcessSpawner` by
//! constructor injection, so tests just build a `FakeCommandRunner` and
//! pass it in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::command::{CommandOutput, CommandRunner, ProcessSpawner};

/// One recorded invocation, for assertions like "docker was never called".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

type Handler = dyn Fn(&str, &[&str], &Mutex<HashMap<String, Vec<u8>>>) -> CommandOutput + Send + Sync;

/// An in-memory [`CommandRunner`] backed by a fake filesystem.
pub struct FakeCommandRunner {
    fs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
    handler: Arc<Handler>,
    available: Arc<Mutex<std::collections::HashSet<String>>>,
}

impl FakeCommandRunner {
    /// A runner whose default handler succeeds on every recognised
    /// binary in the external-binary table (`ip`, `iptables`, `mkfs.ext4`,
    /// `truncate`, `tar`, `docker`, `podman`, `sysctl`) and fails (exit 127)
    /// on anything else. `docker` is "on PATH" by default; use
    /// [`FakeCommandRunner::with_available`] to change that.
    pub fn new() -> Self {
        Self::with_handler(Arc::new(default_handler))
    }

    pub fn with_handler(handler: Arc<Handler>) -> Self {
        Self {
            fs: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            handler,
            available: Arc::new(Mutex::new(["docker".to_string()].into_iter().collect())),
        }
    }

    /// Override which binaries `which()` reports as present on `PATH`.
    pub fn with_available(self, programs: &[&str]) -> Self {
        *self.available.lock().unwrap() = programs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Pre-populate a fake file (used to simulate a cache-hit rootfs, or a
    /// pre-existing bridge/iptables-rule state file in higher-level tests).
    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.fs.lock().unwrap().insert(path.to_string(), content.to_vec());
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().unwrap().get(path).cloned()
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, program: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c.program == program)
    }

    fn record(&self, program: &str, args: &[&str]) {
        self.calls.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
    }
}

impl Default for FakeCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for FakeCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.record(program, args);
        Ok((self.handler)(program, args, &self.fs))
    }

    fn which(&self, program: &str) -> bool {
        self.available.lock().unwrap().contains(program)
    }
}

/// Default intercepts covering the external-binary table: idempotent
/// network commands, image-pipeline commands, and the filesystem ops they
/// imply, all succeeding with no real side effects.
fn default_handler(
    program: &str,
    args: &[&str],
    fs: &Mutex<HashMap<String, Vec<u8>>>,
) -> CommandOutput {
    let ok = |stdout: &str| CommandOutput {
        status: 0,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    };

    match program {
        "truncate" => {
            // truncate -s <N>M <path>
            if let Some(path) = args.last() {
                fs.lock().unwrap().entry(path.to_string()).or_default();
                let _ = std::fs::write(path, []);
            }
            ok("")
        }
        "mkfs.ext4" => {
            // -d <src-dir> <img>
            if let Some(path) = args.last() {
                fs.lock()
                    .unwrap()
                    .insert(path.to_string(), b"ext4-fake-image".to_vec());
                let _ = std::fs::write(path, b"ext4-fake-image");
            }
            ok("")
        }
        "docker" | "podman" => match args.first() {
            Some(&"create") => ok("fakecontainerid123"),
            Some(&"export") | Some(&"rm") => ok(""),
            _ => ok(""),
        },
        "tar" => ok(""),
        "ip" => {
            if args.contains(&"show") {
                // absent by default: callers opt in via with_file/custom handler
                CommandOutput {
                    status: 1,
                    stdout: Vec::new(),
                    stderr: b"Device does not exist".to_vec(),
                }
            } else {
                ok("")
            }
        }
        "iptables" => {
            // -C (check) fails by default so callers exercise the -A path;
            // -A (append) always succeeds.
            if args.contains(&"-C") {
                CommandOutput {
                    status: 1,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }
            } else {
                ok("")
            }
        }
        "sysctl" => ok(""),
        _ => CommandOutput {
            status: 127,
            stdout: Vec::new(),
            stderr: format!("fake runner: no handler for {program}").into_bytes(),
        },
    }
}

/// An in-memory [`ProcessSpawner`]: every spawn is assigned a synthetic PID
/// and tracked as "alive" until the test calls [`FakeProcessSpawner::kill_silently`]
/// or the test explicitly marks it dead, or `signal` is called with a signal
/// the fake is configured to honour.
pub struct FakeProcessSpawner {
    next_pid: Mutex<u32>,
    alive: Arc<Mutex<HashMap<u32, bool>>>,
    /// Signals this fake actually "honours" by marking the process dead.
    /// Used to simulate a child that ignores SIGTERM.
    honoured_signals: Vec<i32>,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl FakeProcessSpawner {
    pub fn new() -> Self {
        Self {
            next_pid: Mutex::new(1000),
            alive: Arc::new(Mutex::new(HashMap::new())),
            honoured_signals: vec![libc_sigterm(), libc_sigkill()],
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A spawner whose child ignores the given signals (still reports
    /// alive after receiving them) — used to exercise shutdown escalation.
    pub fn ignoring(mut self, signals: &[i32]) -> Self {
        self.honoured_signals.retain(|s| !signals.contains(s));
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mark_dead(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid, false);
    }
}

impl Default for FakeProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

fn libc_sigterm() -> i32 {
    15
}

fn libc_sigkill() -> i32 {
    9
}

impl ProcessSpawner for FakeProcessSpawner {
    fn spawn(&self, program: &str, args: &[&str], _stdin_data: &[u8]) -> Result<u32> {
        self.calls.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        let mut next = self.next_pid.lock().unwrap();
        let pid = *next;
        *next += 1;
        self.alive.lock().unwrap().insert(pid, true);
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<()> {
        let mut alive = self.alive.lock().unwrap();
        if !alive.get(&pid).copied().unwrap_or(false) {
            anyhow::bail!("signal to dead or unknown pid {pid}");
        }
        if self.honoured_signals.contains(&signal) {
            alive.insert(pid, false);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().get(&pid).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_runner_records_calls() {
        let runner = FakeCommandRunner::new();
        runner.run("ip", &["link", "add", "br0", "type", "bridge"]).unwrap();
        assert!(runner.was_called("ip"));
        assert!(!runner.was_called("docker"));
    }

    #[test]
    fn test_fake_runner_truncate_then_mkfs_populates_fs() {
        let runner = FakeCommandRunner::new();
        runner.run("truncate", &["-s", "100M", "/r.ext4"]).unwrap();
        runner.run("mkfs.ext4", &["-d", "/scratch", "/r.ext4"]).unwrap();
        assert!(runner.file("/r.ext4").is_some());
    }

    #[test]
    fn test_fake_runner_cache_hit_file_preexists() {
        let runner = FakeCommandRunner::new().with_file("/r/nginx-latest.ext4", b"cached");
        assert_eq!(runner.file("/r/nginx-latest.ext4"), Some(b"cached".to_vec()));
        assert!(!runner.was_called("docker"));
    }

    #[test]
    fn test_fake_spawner_signal_escalation() {
        let spawner = FakeProcessSpawner::new().ignoring(&[libc_sigterm()]);
        let pid = spawner.spawn("firecracker", &["--api-sock", "/s.sock"], b"{}").unwrap();
        assert!(spawner.is_alive(pid));
        spawner.signal(pid, libc_sigterm()).unwrap();
        assert!(spawner.is_alive(pid), "SIGTERM should be ignored");
        spawner.signal(pid, libc_sigkill()).unwrap();
        assert!(!spawner.is_alive(pid), "SIGKILL should always land");
    }
}
