// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Subprocess execution: spawn, capture, timeout, terminate.
//!
//! The executor is the only place the service touches the OS process API.
//! Arguments are always passed as an argv vector, never through a shell.
use crate::types::{VmError, VmResult};
use crate::vmerr;
use encoding_rs::Encoding;
use std::{
    collections::HashMap,
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Grace window between the polite stop signal and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

tokio::task_local! {
    /// Cancellation token of the operation that owns the current task.
    /// The coordinator scopes it around long-running handlers so that
    /// locks, polls and subprocess waits all observe the same signal
    /// without threading a token through each call.
    pub static OP_CANCEL: CancellationToken;
}

/// The ambient operation token, if the current task runs under one.
pub fn current_cancel_token() -> Option<CancellationToken> {
    OP_CANCEL.try_with(|t| t.clone()).ok()
}

const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The binaries this service is allowed to run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Program {
    VBoxManage,
    PowerShell,
}

impl Program {
    fn label(&self) -> &'static str {
        match self {
            Self::VBoxManage => "vboxmanage",
            Self::PowerShell => "powershell",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: Program,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    /// Observed while the child runs; cancelling terminates the child the
    /// same way a timeout does.
    pub cancel: Option<CancellationToken>,
}

impl ExecRequest {
    pub fn new<I, S>(program: Program, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: crate::types::DEFAULT_WAIT_TIMEOUT,
            env: vec![],
            cancel: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin<S: Into<String>>(mut self, payload: S) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool { self.exit_code == Some(0) }
}

/// Seam between the adapters and the OS; tests substitute a scripted fake.
#[async_trait::async_trait]
pub trait Exec: Send + Sync {
    async fn exec(&self, req: ExecRequest) -> VmResult<ExecOutput>;
}

/// Real executor backed by `tokio::process`.
pub struct CommandExecutor {
    programs: HashMap<Program, std::path::PathBuf>,
    encoding: &'static Encoding,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            programs: HashMap::new(),
            encoding: encoding_rs::UTF_8,
        }
    }

    /// Registers the resolved path for a program. Unregistered programs
    /// fail with `BinaryNotFound`, which is what degraded mode relies on.
    pub fn program_path<P: Into<std::path::PathBuf>>(
        mut self,
        program: Program,
        path: P,
    ) -> Self {
        self.programs.insert(program, path.into());
        self
    }

    /// Sets the encoding used to decode captured output.
    pub fn encoding(mut self, encoding_name: &str) -> Self {
        self.encoding = Encoding::for_label(encoding_name.as_bytes())
            .unwrap_or(encoding_rs::UTF_8);
        self
    }

    fn decode(&self, bytes: &[u8]) -> String {
        self.encoding.decode(bytes).0.into_owned()
    }
}

impl Default for CommandExecutor {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl Exec for CommandExecutor {
    async fn exec(&self, req: ExecRequest) -> VmResult<ExecOutput> {
        let path = self.programs.get(&req.program).ok_or_else(|| {
            vmerr!(@e BinaryNotFound,
                "{} is not available on this host",
                req.program.label())
        })?;
        let timeout = req.timeout.max(MIN_TIMEOUT);

        let mut cmd = tokio::process::Command::new(path);
        cmd.args(&req.args)
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &req.env {
            cmd.env(k, v);
        }
        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW: no console flash on GUI hosts.
            cmd.creation_flags(0x0800_0000);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => vmerr!(@e BinaryNotFound,
                "{} not found at {:?}", req.program.label(), path),
            _ => vmerr!(@e HypervisorError,
                "failed to spawn {}: {}", req.program.label(), e),
        })?;

        if let Some(payload) = &req.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let payload = payload.clone();
                tokio::spawn(async move {
                    let _ = pipe.write_all(payload.as_bytes()).await;
                });
            }
        }

        // Both streams are drained concurrently with the wait so a chatty
        // child can never deadlock on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(p) = stdout_pipe.as_mut() {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(p) = stderr_pipe.as_mut() {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        });

        let cancel = req
            .cancel
            .clone()
            .or_else(current_cancel_token)
            .unwrap_or_default();
        let status = tokio::select! {
            r = child.wait() => Some(r.map_err(|e| {
                vmerr!(@e HypervisorError, "wait failed: {}", e)
            })?),
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.cancelled() => None,
        };

        let argv = redact_args(&req.args);
        match status {
            Some(status) => {
                let stdout = self.decode(&stdout_task.await.unwrap_or_default());
                let stderr = self.decode(&stderr_task.await.unwrap_or_default());
                let duration = started.elapsed();
                log::debug!(
                    "exec {} {:?}: exit={:?} in {:?}",
                    req.program.label(),
                    argv,
                    status.code(),
                    duration
                );
                Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    duration,
                })
            }
            None => {
                terminate(&mut child).await;
                let stdout = self.decode(&stdout_task.await.unwrap_or_default());
                let stderr = self.decode(&stderr_task.await.unwrap_or_default());
                let duration = started.elapsed();
                let details = serde_json::json!({
                    "stdout_partial": truncate(&stdout, 4096),
                    "stderr_partial": truncate(&stderr, 4096),
                    "elapsed_ms": duration.as_millis() as u64,
                });
                if cancel.is_cancelled() {
                    log::debug!(
                        "exec {} {:?}: cancelled after {:?}",
                        req.program.label(),
                        argv,
                        duration
                    );
                    Err(vmerr!(@e Cancelled, "subprocess cancelled")
                        .with_details(details))
                } else {
                    log::debug!(
                        "exec {} {:?}: timed out after {:?}",
                        req.program.label(),
                        argv,
                        duration
                    );
                    Err(vmerr!(@e Timeout,
                        "{} did not finish within {:?}",
                        req.program.label(),
                        timeout)
                    .with_details(details))
                }
            }
        }
    }
}

/// Polite stop first, hard kill once the grace window runs out.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    {
        // No graceful signal on Windows; the grace window still bounds how
        // long a wedged child can linger before the kill below.
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Values following password-style flags never reach the log.
fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for a in args {
        if redact_next {
            out.push("***".to_string());
            redact_next = false;
            continue;
        }
        let lower = a.to_ascii_lowercase();
        if lower.contains("password") || lower.contains("secret") {
            redact_next = lower.starts_with("--");
        }
        out.push(a.clone());
    }
    out
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_values() {
        let args: Vec<String> = ["guestcontrol", "vm", "--password", "hunter2", "run"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let redacted = redact_args(&args);
        assert_eq!(redacted[3], "***");
        assert_eq!(redacted[0], "guestcontrol");
        assert_eq!(redacted[4], "run");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.len() <= 3);
        assert!(s.starts_with(t));
    }

    #[tokio::test]
    async fn unregistered_program_is_binary_not_found() {
        let exec = CommandExecutor::new();
        let err = exec
            .exec(ExecRequest::new(Program::VBoxManage, ["list", "vms"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::BinaryNotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_terminates_and_returns_partial_output() {
        // Stand in a shell-less long sleeper for VBoxManage.
        let exec = CommandExecutor::new()
            .program_path(Program::VBoxManage, "/bin/sleep");
        let err = exec
            .exec(
                ExecRequest::new(Program::VBoxManage, ["30"])
                    .timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Timeout);
        assert!(err.details.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let exec = CommandExecutor::new()
            .program_path(Program::VBoxManage, "/bin/echo");
        let out = exec
            .exec(
                ExecRequest::new(Program::VBoxManage, ["hello"])
                    .timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let exec = CommandExecutor::new()
            .program_path(Program::VBoxManage, "/bin/sleep");
        let token = CancellationToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            t2.cancel();
        });
        let err = exec
            .exec(
                ExecRequest::new(Program::VBoxManage, ["30"])
                    .timeout(Duration::from_secs(30))
                    .cancel_token(token),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Cancelled);
    }
}
