//! Std adapters for fuzzlab.
//!
//! In clean-arch terms: this is where we touch the world. Child process
//! execution with a hard wall-clock ceiling, raw-output log artifacts, and
//! the pre-flight lookup of the fuzzer binary.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,

    /// Hard wall-clock ceiling; the child is killed when it fires.
    pub timeout: Option<Duration>,

    pub output_cap_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub wall: Duration,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("command argv must not be empty")]
    EmptyArgv,

    #[error("timeout is not supported on this platform")]
    TimeoutUnsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError>;
}

#[derive(Debug, Default, Clone)]
pub struct StdProcessRunner;

impl ProcessRunner for StdProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
        if spec.argv.is_empty() {
            return Err(AdapterError::EmptyArgv);
        }

        #[cfg(unix)]
        {
            return run_unix(spec);
        }

        #[cfg(not(unix))]
        {
            if spec.timeout.is_some() {
                return Err(AdapterError::TimeoutUnsupported);
            }
            run_portable(spec)
        }
    }
}

/// Resolve the external tool binary before any iteration runs, so a missing
/// tool fails fast instead of producing a batch of null observations.
pub fn resolve_tool(argv0: &str) -> anyhow::Result<PathBuf> {
    which::which(argv0).with_context(|| format!("fuzzer binary not found on PATH: {argv0}"))
}

#[cfg(not(unix))]
fn run_portable(spec: &CommandSpec) -> Result<RunResult, AdapterError> {
    use std::process::Command;

    let start = Instant::now();
    let mut cmd = Command::new(&spec.argv[0]);
    if spec.argv.len() > 1 {
        cmd.args(&spec.argv[1..]);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let out = cmd
        .output()
        .with_context(|| format!("failed to run {:?}", spec.argv))
        .map_err(AdapterError::Other)?;

    Ok(RunResult {
        wall: start.elapsed(),
        exit_code: out.status.code().unwrap_or(-1),
        timed_out: false,
        stdout: truncate(out.stdout, spec.output_cap_bytes),
        stderr: truncate(out.stderr, spec.output_cap_bytes),
    })
}

#[cfg(unix)]
fn run_unix(spec: &CommandSpec) -> Result<RunResult, AdapterError> {
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};
    use std::thread;

    let start = Instant::now();

    let mut cmd = Command::new(&spec.argv[0]);
    if spec.argv.len() > 1 {
        cmd.args(&spec.argv[1..]);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.argv))
        .map_err(AdapterError::Other)?;

    let pid = child.id() as libc::pid_t;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let cap = spec.output_cap_bytes;
    let out_handle = thread::spawn(move || read_with_cap(&mut stdout, cap));
    let err_handle = thread::spawn(move || read_with_cap(&mut stderr, cap));

    let (status_raw, timed_out) = waitpid_with_timeout(pid, spec.timeout)?;

    // The child has been reaped via waitpid; drop the handle without waiting.
    drop(child);

    let stdout = truncate(out_handle.join().unwrap_or_default(), cap);
    let stderr = truncate(err_handle.join().unwrap_or_default(), cap);

    let exit_status = std::process::ExitStatus::from_raw(status_raw);

    Ok(RunResult {
        wall: start.elapsed(),
        exit_code: exit_status.code().unwrap_or(-1),
        timed_out,
        stdout,
        stderr,
    })
}

#[cfg(unix)]
fn read_with_cap<R: std::io::Read>(reader: &mut R, cap: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 8192];

    loop {
        match reader.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let remaining = cap - buf.len();
                    let take = remaining.min(n);
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
            Err(_) => break,
        }
    }

    buf
}

#[cfg(unix)]
fn waitpid_with_timeout(
    pid: libc::pid_t,
    timeout: Option<Duration>,
) -> Result<(libc::c_int, bool), AdapterError> {
    let start = Instant::now();
    let mut status: libc::c_int = 0;
    let mut timed_out = false;

    loop {
        let options = if timeout.is_some() { libc::WNOHANG } else { 0 };

        let res = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, options) };

        if res == pid {
            break;
        }

        if res == 0 {
            // still running
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    timed_out = true;
                    unsafe {
                        libc::kill(pid, libc::SIGKILL);
                    }
                    // Reap it.
                    let res2 =
                        unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, 0) };
                    if res2 != pid {
                        return Err(AdapterError::Other(anyhow::anyhow!(
                            "waitpid after kill failed: {:?}",
                            std::io::Error::last_os_error()
                        )));
                    }
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        if res == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(AdapterError::Other(anyhow::anyhow!("waitpid failed: {err}")));
        }

        return Err(AdapterError::Other(anyhow::anyhow!(
            "waitpid returned unexpected pid: {res}"
        )));
    }

    Ok((status, timed_out))
}

fn truncate(mut bytes: Vec<u8>, cap: usize) -> Vec<u8> {
    if bytes.len() > cap {
        bytes.truncate(cap);
    }
    bytes
}

// ----------------------------
// Log artifacts
// ----------------------------

/// One execution's raw captured output, for audit. Never parsed back in.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exit_code: i32,
    pub execution_time: f64,
}

pub trait LogStore {
    /// Persist one execution's output under a path unique to
    /// (config, iteration), returning where it landed.
    fn persist(
        &self,
        config: &str,
        iteration: u32,
        entry: &LogEntry<'_>,
    ) -> anyhow::Result<PathBuf>;
}

/// Filesystem log store: `<root>/<config>_<iteration>.log` with labeled
/// sections, mirroring what a human reads when a run looks wrong.
#[derive(Debug, Clone)]
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LogStore for FsLogStore {
    fn persist(
        &self,
        config: &str,
        iteration: u32,
        entry: &LogEntry<'_>,
    ) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("create log dir {}", self.root.display()))?;

        let path = self.root.join(format!("{config}_{iteration}.log"));
        let body = format!(
            "STDOUT:\n{}\nSTDERR:\n{}\nEXIT_CODE: {}\nEXECUTION_TIME: {}\n",
            entry.stdout, entry.stderr, entry.exit_code, entry.execution_time
        );
        std::fs::write(&path, body).with_context(|| format!("write log {}", path.display()))?;
        Ok(path)
    }
}
