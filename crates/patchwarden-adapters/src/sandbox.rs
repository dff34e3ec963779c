//! Sandboxed gate execution
//!
//! Runs one gate command with rlimits applied in the child only, inside its
//! own process group so a timeout can take down everything it spawned.
//!
//! Network denial shadows well-known network tools on `PATH` with shims that
//! exit 97. It is a guard rail against accidental downloads during gates,
//! not an isolation boundary: absolute paths, language-level sockets and
//! tools not on the list all still reach the network.

use crate::util::tail_chars;
use patchwarden_core::{ExitStatus, Quotas, SandboxError, SandboxOutput, SandboxRequest, SandboxRunner};
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const NETWORK_DENIED_EXIT: i32 = 97;
pub const NETWORK_DENIED_MESSAGE: &str = "patchwarden: network access disabled in sandbox";

pub const DEFAULT_NETWORK_TOOLS: [&str; 16] = [
    "curl", "wget", "nc", "ncat", "netcat", "ssh", "scp", "sftp", "rsync", "ftp", "telnet", "pip",
    "pip3", "apt", "apt-get", "apk",
];

const PROXY_VARS: [&str; 8] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "FTP_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
    "ftp_proxy",
];

const POLL_INTERVAL: Duration = Duration::from_millis(20);
// How long to wait for pipe readers once the process group is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub network_tools: Vec<String>,
    pub output_tail_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            network_tools: DEFAULT_NETWORK_TOOLS.iter().map(|s| s.to_string()).collect(),
            output_tail_bytes: 4096,
        }
    }
}

/// OS-process sandbox. Unix gets rlimits and process-group kills; other
/// platforms only get the wall-clock timeout.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    settings: SandboxSettings,
}

impl ProcessSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    fn network_shims(&self) -> Result<tempfile::TempDir, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("patchwarden-nonet-")
            .tempdir()
            .map_err(|e| SandboxError::Setup(format!("shim directory: {}", e)))?;
        let script = format!(
            "#!/bin/sh\necho '{}' >&2\nexit {}\n",
            NETWORK_DENIED_MESSAGE, NETWORK_DENIED_EXIT
        );
        for tool in &self.settings.network_tools {
            let path = dir.path().join(tool);
            fs::write(&path, &script)
                .map_err(|e| SandboxError::Setup(format!("shim '{}': {}", tool, e)))?;
            make_executable(&path)?;
        }
        Ok(dir)
    }
}

impl SandboxRunner for ProcessSandbox {
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput, SandboxError> {
        let (program, args) = request
            .command
            .program_and_args()
            .ok_or(SandboxError::EmptyCommand)?;

        let shims = if request.deny_network {
            Some(self.network_shims()?)
        } else {
            None
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &shims {
            let current = std::env::var_os("PATH").unwrap_or_default();
            cmd.env("PATH", prefixed_path(dir.path(), &current)?);
            for var in PROXY_VARS {
                cmd.env_remove(var);
            }
            cmd.env("PATCHWARDEN_NO_NET", "1");
        }
        confine(&mut cmd, &request.quotas);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Launch {
            program: program.clone(),
            source,
        })?;
        debug!(program = %program, pid = child.id(), "gate process started");

        let limit = self.settings.output_tail_bytes;
        let stdout_rx = child.stdout.take().map(|out| spawn_tail_reader(out, limit));
        let stderr_rx = child.stderr.take().map(|err| spawn_tail_reader(err, limit));

        let timeout = request.quotas.timeout();
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        timed_out = true;
                        kill_tree(&mut child);
                        match child.wait() {
                            Ok(status) => break status,
                            Err(source) => return Err(SandboxError::Wait { program, source }),
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    kill_tree(&mut child);
                    return Err(SandboxError::Wait { program, source });
                }
            }
        };
        // Background jobs left behind by the gate die with it.
        kill_group(child.id());

        let stdout_tail = collect_tail(stdout_rx, limit);
        let stderr_tail = collect_tail(stderr_rx, limit);
        let duration = start.elapsed();

        let status = if timed_out {
            warn!(program = %program, timeout_secs = request.quotas.timeout_seconds, "gate timed out");
            ExitStatus::TimedOut {
                after_secs: request.quotas.timeout_seconds,
            }
        } else {
            map_status(status, &stderr_tail)
        };

        Ok(SandboxOutput {
            status,
            stdout_tail,
            stderr_tail,
            duration,
        })
    }
}

fn prefixed_path(dir: &Path, current: &OsString) -> Result<OsString, SandboxError> {
    let mut paths = vec![dir.to_path_buf()];
    paths.extend(std::env::split_paths(current));
    std::env::join_paths(paths).map_err(|e| SandboxError::Setup(format!("PATH: {}", e)))
}

fn spawn_tail_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_tail(reader, limit));
    });
    rx
}

/// Read to EOF keeping only the last `limit` bytes.
fn read_tail<R: Read>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > limit.saturating_mul(2).max(chunk.len()) {
                    let excess = buf.len() - limit;
                    buf.drain(..excess);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
    }
    buf
}

fn collect_tail(rx: Option<mpsc::Receiver<Vec<u8>>>, limit: usize) -> String {
    let bytes = rx
        .and_then(|rx| rx.recv_timeout(READER_GRACE).ok())
        .unwrap_or_default();
    // The byte cut may split a character; re-trim by chars after lossy decode.
    tail_chars(&String::from_utf8_lossy(&bytes), limit)
}

fn map_status(status: std::process::ExitStatus, stderr_tail: &str) -> ExitStatus {
    if let Some(code) = status.code() {
        if code == NETWORK_DENIED_EXIT && stderr_tail.contains(NETWORK_DENIED_MESSAGE) {
            return ExitStatus::NetworkDenied;
        }
        return ExitStatus::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signaled { signal };
        }
    }
    ExitStatus::Exited { code: -1 }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SandboxError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| SandboxError::Setup(format!("chmod '{}': {}", path.display(), e)))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SandboxError> {
    Ok(())
}

#[cfg(unix)]
fn confine(cmd: &mut Command, quotas: &Quotas) {
    use std::os::unix::process::CommandExt;

    let limits = [
        (libc::RLIMIT_CPU, quotas.cpu_seconds),
        (libc::RLIMIT_AS, quotas.memory_bytes),
        (libc::RLIMIT_NPROC, quotas.max_processes),
        (libc::RLIMIT_NOFILE, quotas.max_open_files),
    ];

    cmd.process_group(0);
    // SAFETY: the hook only issues getrlimit/setrlimit, which are
    // async-signal-safe, and touches no memory shared with the parent.
    unsafe {
        cmd.pre_exec(move || {
            for (resource, value) in limits {
                let mut current = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                let mut wanted = value as libc::rlim_t;
                if libc::getrlimit(resource, &mut current) == 0 && current.rlim_max < wanted {
                    wanted = current.rlim_max;
                }
                let rlim = libc::rlimit {
                    rlim_cur: wanted,
                    rlim_max: wanted,
                };
                if libc::setrlimit(resource, &rlim) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn confine(_cmd: &mut Command, _quotas: &Quotas) {}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // The child leads its own group, so its pid is the group id.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
}
