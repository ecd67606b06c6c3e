// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::descriptor::{OutputMode, ProcessDescriptor};
use crate::error::SupervisorError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::SystemTime;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout};

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);

const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ProcessStatus {
    Running,
    Exited(i32),
    Killed(i32),
}

impl ProcessStatus {
    pub fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ProcessStatus::Killed(sig);
            }
        }
        ProcessStatus::Exited(-1)
    }

    pub fn success(self) -> bool {
        self == ProcessStatus::Exited(0)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited(code) => write!(f, "exit code {code}"),
            ProcessStatus::Killed(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// A live child process. Owned by exactly one supervisor.
pub struct ProcessHandle {
    name: String,
    child: Child,
    pid: u32,
    started_at: SystemTime,
    started: Instant,
    status: ProcessStatus,
    forwarders: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Validate the descriptor's paths and spawn the process.
    pub fn spawn(descriptor: &ProcessDescriptor) -> Result<Self, SupervisorError> {
        descriptor.check_executable()?;

        let (program, args) = descriptor.command();
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&descriptor.env)
            .current_dir(&descriptor.working_directory)
            .stdin(Stdio::null())
            .stdout(stdio_for(descriptor.stdout))
            .stderr(stdio_for(descriptor.stderr))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            app: descriptor.name.clone(),
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().unwrap_or(0);
        info!(
            "[{}] spawned (pid={pid}, cmd={program})",
            descriptor.name
        );

        let mut forwarders = Vec::new();
        if let Some(out) = child.stdout.take() {
            forwarders.push(forward(descriptor.name.clone(), out, tokio::io::stdout()));
        }
        if let Some(err) = child.stderr.take() {
            forwarders.push(forward(descriptor.name.clone(), err, tokio::io::stderr()));
        }

        Ok(Self {
            name: descriptor.name.clone(),
            child,
            pid,
            started_at: SystemTime::now(),
            started: Instant::now(),
            status: ProcessStatus::Running,
            forwarders,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    #[cfg(unix)]
    pub fn send_signal(&self, sig: nix::sys::signal::Signal) {
        if self.is_running() {
            send_signal(&self.name, self.pid, sig);
        }
    }

    /// Wait for the child to exit and reap it. Cancel-safe: dropping the future
    /// leaves the handle usable.
    pub async fn wait(&mut self) -> Result<ProcessStatus, SupervisorError> {
        if !self.is_running() {
            return Ok(self.status);
        }
        let status = self.child.wait().await.map_err(|e| SupervisorError::Spawn {
            app: self.name.clone(),
            program: format!("pid {}", self.pid),
            reason: format!("waiting on child: {e}"),
        })?;
        self.status = ProcessStatus::from_exit_status(status);
        info!("[{}] exited with {}", self.name, self.status);
        self.drain_forwarders().await;
        Ok(self.status)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Returns once the child is reaped.
    pub async fn terminate(&mut self, grace: Duration) -> ProcessStatus {
        if !self.is_running() {
            return self.status;
        }

        info!("[{}] sending SIGTERM", self.name);
        #[cfg(unix)]
        self.send_signal(nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match timeout(grace, self.wait()).await {
            Ok(Ok(status)) => return status,
            Ok(Err(e)) => warn!("{e}"),
            Err(_) => warn!(
                "[{}] stop timeout ({}ms) reached, sending SIGKILL",
                self.name,
                grace.as_millis()
            ),
        }
        self.kill().await
    }

    /// Forcefully kill and reap the child.
    pub async fn kill(&mut self) -> ProcessStatus {
        if !self.is_running() {
            return self.status;
        }
        if let Err(e) = self.child.start_kill() {
            warn!("[{}] failed to send SIGKILL: {e}", self.name);
        }
        match timeout(SIGKILL_TIMEOUT, self.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("{e}");
                self.status
            }
            Err(_) => {
                warn!("[{}] still running after SIGKILL, giving up", self.name);
                self.status
            }
        }
    }

    async fn drain_forwarders(&mut self) {
        for mut task in self.forwarders.drain(..) {
            if timeout(FORWARDER_DRAIN_TIMEOUT, &mut task).await.is_err() {
                // A grandchild may still hold the pipe open.
                debug!("[{}] output forwarder did not finish, aborting", self.name);
                task.abort();
            }
        }
    }
}

#[cfg(unix)]
pub(crate) fn send_signal(name: &str, pid: u32, sig: nix::sys::signal::Signal) {
    use nix::sys::signal;
    use nix::unistd::Pid;

    if pid == 0 {
        return;
    }
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        warn!("[{name}] failed to send {sig}: {e}");
    }
}

fn stdio_for(mode: OutputMode) -> Stdio {
    match mode {
        OutputMode::Forward => Stdio::piped(),
        OutputMode::Inherit => Stdio::inherit(),
        OutputMode::Null => Stdio::null(),
    }
}

fn forward<R, W>(name: String, mut from: R, mut to: W) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
            debug!("[{name}] output forwarding stopped: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::make_descriptor;

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let d = make_descriptor("/bin/sh", vec!["-c", "exit 7"]);
        let mut handle = ProcessHandle::spawn(&d).unwrap();
        assert!(handle.pid() > 0);
        assert!(handle.is_running());

        let status = handle.wait().await.unwrap();
        assert_eq!(status, ProcessStatus::Exited(7));
        assert!(!handle.is_running());
        assert_eq!(handle.wait().await.unwrap(), ProcessStatus::Exited(7));
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_binary() {
        let d = make_descriptor("/nonexistent/binary", vec![]);
        let err = ProcessHandle::spawn(&d).err().unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_spawn_with_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = make_descriptor(
            "/bin/sh",
            vec!["-c", "test \"$(pwd)\" = \"$EXPECTED_DIR\" && exit $MY_EXIT_CODE"],
        );
        let cwd = dir.path().canonicalize().unwrap();
        d.working_directory = cwd.clone();
        d.env.insert("MY_EXIT_CODE".to_string(), "42".to_string());
        d.env
            .insert("EXPECTED_DIR".to_string(), cwd.display().to_string());

        let mut handle = ProcessHandle::spawn(&d).unwrap();
        assert_eq!(handle.wait().await.unwrap(), ProcessStatus::Exited(42));
    }

    #[tokio::test]
    async fn test_forwarded_output_does_not_block_exit() {
        let mut d = make_descriptor("/bin/sh", vec!["-c", "echo out; echo err >&2"]);
        d.stdout = OutputMode::Forward;
        d.stderr = OutputMode::Forward;
        let mut handle = ProcessHandle::spawn(&d).unwrap();
        assert_eq!(handle.wait().await.unwrap(), ProcessStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_forwarder_aborted_when_grandchild_holds_pipe() {
        let mut d = make_descriptor("/bin/sh", vec!["-c", "sleep 5 & exit 0"]);
        d.stdout = OutputMode::Forward;
        let mut handle = ProcessHandle::spawn(&d).unwrap();
        let forwarders: Vec<_> = handle.forwarders.iter().map(|t| t.abort_handle()).collect();
        assert_eq!(forwarders.len(), 1);

        let started = Instant::now();
        assert_eq!(handle.wait().await.unwrap(), ProcessStatus::Exited(0));
        assert!(started.elapsed() < Duration::from_secs(4));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            forwarders.iter().all(|f| f.is_finished()),
            "forwarder must not outlive the reaped child"
        );
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let d = make_descriptor("/bin/sleep", vec!["60"]);
        let mut handle = ProcessHandle::spawn(&d).unwrap();
        let status = handle.terminate(Duration::from_secs(5)).await;
        assert_eq!(status, ProcessStatus::Killed(sigterm_number()));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let d = make_descriptor("/bin/sh", vec!["-c", "trap '' TERM; sleep 60"]);
        let mut handle = ProcessHandle::spawn(&d).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let status = handle.terminate(Duration::from_millis(300)).await;
        assert!(!status.success());
        assert!(!handle.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_exited_process_is_noop() {
        let d = make_descriptor("/bin/sh", vec!["-c", "exit 3"]);
        let mut handle = ProcessHandle::spawn(&d).unwrap();
        handle.wait().await.unwrap();
        assert_eq!(
            handle.terminate(Duration::from_secs(1)).await,
            ProcessStatus::Exited(3)
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Exited(1).to_string(), "exit code 1");
        assert_eq!(ProcessStatus::Killed(9).to_string(), "signal 9");
        assert!(ProcessStatus::Exited(0).success());
        assert!(!ProcessStatus::Killed(15).success());
    }

    fn sigterm_number() -> i32 {
        nix::sys::signal::Signal::SIGTERM as i32
    }
}
