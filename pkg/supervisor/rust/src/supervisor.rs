// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Lifecycle of one managed app.
//!
//! Each supervisor is a tokio task that owns its [`ProcessHandle`] and talks to
//! the outside world through a [`SupervisorHandle`]: commands go in over an mpsc
//! channel, status is published on a watch channel and every state transition is
//! broadcast as a [`LifecycleEvent`]. Exactly one child is alive at a time; a new
//! spawn only happens after the previous child has been reaped.

use crate::descriptor::ProcessDescriptor;
use crate::error::{Result, SupervisorError};
use crate::event::{EventDetail, EventSender, LifecycleEvent};
use crate::memory::{MemoryBreach, MemorySampler, MemoryWatcher, ProcfsSampler};
use crate::process::{ProcessHandle, ProcessStatus};
use crate::restart::{ExitInfo, RestartDecision, RestartState};
use crate::state::SupervisorState;
use crate::watch::{FileWatcher, FilesChanged};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL_CAPACITY: usize = 16;

type Reply = oneshot::Sender<SupervisorState>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Restart(Reply),
}

/// Point-in-time view of a supervisor, readable without blocking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub last_exit: Option<ProcessStatus>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            pid: None,
            started_at: None,
            restarts: 0,
            consecutive_failures: 0,
            last_exit: None,
        }
    }
}

/// Cloneable control handle for a running supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    /// Start the app. A no-op returning the current state if it is already
    /// starting or running; otherwise resolves after the first spawn attempt.
    pub async fn start(&self) -> Result<SupervisorState> {
        self.request(Command::Start).await
    }

    /// Stop the app and wait until it has been reaped.
    pub async fn stop(&self) -> Result<SupervisorState> {
        self.request(Command::Stop).await
    }

    /// Terminate and respawn without counting a failure.
    pub async fn restart(&self) -> Result<SupervisorState> {
        self.request(Command::Restart).await
    }

    async fn request(&self, make: fn(Reply) -> Command) -> Result<SupervisorState> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SupervisorError::Stopped(self.name.clone()))?;
        rx.await
            .map_err(|_| SupervisorError::Stopped(self.name.clone()))
    }

    /// Resolve once the published status satisfies `pred`.
    pub async fn wait_until<F>(&self, mut pred: F) -> SupervisorStatus
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(|s| pred(s)).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| rx.borrow().clone())
    }

    pub async fn wait_settled(&self) -> SupervisorState {
        self.wait_until(|s| s.state.is_settled()).await.state
    }

    /// SIGKILL the current child by PID, bypassing the supervisor task.
    pub fn force_kill(&self) {
        let Some(pid) = self.status.borrow().pid else {
            return;
        };
        warn!("[{}] force killing pid {pid}", self.name);
        #[cfg(unix)]
        crate::process::send_signal(&self.name, pid, nix::sys::signal::Signal::SIGKILL);
    }
}

enum Outcome {
    Exited(Result<ProcessStatus>),
    MemoryBreach(MemoryBreach),
    FilesChanged,
    Restart(Reply),
    Stop(Option<Reply>),
}

pub struct Supervisor {
    descriptor: Arc<ProcessDescriptor>,
    sampler: Arc<dyn MemorySampler>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SupervisorStatus>,
    events: EventSender,
    restart_state: RestartState,
}

impl Supervisor {
    /// Spawn the supervisor task for `descriptor`. The app stays idle until
    /// [`SupervisorHandle::start`] is called.
    pub fn spawn(descriptor: Arc<ProcessDescriptor>, events: EventSender) -> SupervisorHandle {
        Self::spawn_with_sampler(descriptor, events, Arc::new(ProcfsSampler))
    }

    pub fn spawn_with_sampler(
        descriptor: Arc<ProcessDescriptor>,
        events: EventSender,
        sampler: Arc<dyn MemorySampler>,
    ) -> SupervisorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let name = descriptor.name.clone();

        let supervisor = Supervisor {
            descriptor,
            sampler,
            commands: cmd_rx,
            status: status_tx,
            events,
            restart_state: RestartState::default(),
        };
        tokio::spawn(supervisor.run());

        SupervisorHandle {
            name,
            commands: cmd_tx,
            status: status_rx,
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    async fn run(mut self) {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Start(reply) | Command::Restart(reply) => {
                    self.restart_state.reset();
                    self.run_lifecycle(reply).await;
                }
                Command::Stop(reply) => {
                    let _ = reply.send(self.state());
                }
            }
        }
        debug!("[{}] supervisor task exiting", self.name());
    }

    /// Drive spawn -> monitor -> restart until the app settles in `Stopped` or
    /// `Failed`.
    async fn run_lifecycle(&mut self, reply: Reply) {
        let mut reply = Some(reply);
        self.transition(SupervisorState::Starting, None);

        loop {
            let mut handle = match ProcessHandle::spawn(&self.descriptor) {
                Ok(handle) => handle,
                Err(e) => {
                    error!("{e}");
                    let decision = self.descriptor.restart_policy.decide(
                        &ExitInfo::spawn_failure(),
                        &mut self.restart_state,
                        Instant::now(),
                    );
                    let detail = EventDetail::SpawnFailed {
                        reason: e.to_string(),
                    };
                    if self.follow(decision, detail, false, &mut reply).await {
                        self.count_restart();
                        continue;
                    }
                    return;
                }
            };

            let pid = handle.pid();
            let started_at = handle.started_at();
            self.status.send_modify(|s| {
                s.pid = Some(pid);
                s.started_at = Some(started_at);
            });
            self.transition(SupervisorState::Running, Some(EventDetail::Spawned { pid }));
            answer(&mut reply, SupervisorState::Running);

            let outcome = self.monitor(&mut handle).await;
            match outcome {
                Outcome::Exited(result) => {
                    let status = result.unwrap_or_else(|e| {
                        error!("{e}");
                        ProcessStatus::Exited(-1)
                    });
                    self.record_exit(status);
                    let exit = ExitInfo::exited(status, handle.uptime());
                    let decision = self.descriptor.restart_policy.decide(
                        &exit,
                        &mut self.restart_state,
                        Instant::now(),
                    );
                    if !self
                        .follow(decision, EventDetail::Exit { status }, true, &mut reply)
                        .await
                    {
                        return;
                    }
                }
                Outcome::MemoryBreach(breach) => {
                    let cause = EventDetail::MemoryBreach {
                        resident_bytes: breach.resident_bytes,
                        ceiling_bytes: breach.ceiling_bytes,
                    };
                    if !self.recycle(&mut handle, cause, &mut reply).await {
                        return;
                    }
                }
                Outcome::FilesChanged => {
                    if !self
                        .recycle(&mut handle, EventDetail::FilesChanged, &mut reply)
                        .await
                    {
                        return;
                    }
                }
                Outcome::Restart(r) => {
                    reply = Some(r);
                    if !self
                        .recycle(&mut handle, EventDetail::RestartRequested, &mut reply)
                        .await
                    {
                        return;
                    }
                }
                Outcome::Stop(r) => {
                    self.transition(SupervisorState::Stopping, Some(EventDetail::StopRequested));
                    let status = handle.terminate(self.descriptor.kill_timeout).await;
                    self.record_exit(status);
                    self.finish_stop(status, r, &mut reply);
                    return;
                }
            }
            self.count_restart();
        }
    }

    /// Terminate the current child for a restart that is not a failure. Returns
    /// false if a stop arrived meanwhile, in which case the app is left stopped.
    async fn recycle(
        &mut self,
        handle: &mut ProcessHandle,
        cause: EventDetail,
        reply: &mut Option<Reply>,
    ) -> bool {
        self.transition(SupervisorState::Stopping, Some(cause));
        let status = handle.terminate(self.descriptor.kill_timeout).await;
        self.record_exit(status);
        if let Some(stop) = self.queued_stop(reply) {
            self.finish_stop(status, stop, reply);
            return false;
        }
        self.transition(SupervisorState::Starting, Some(EventDetail::Exit { status }));
        true
    }

    /// Handle commands that queued up while no one was reading them. Returns
    /// `Some` if one of them was a stop (or every handle is gone).
    fn queued_stop(&mut self, reply: &mut Option<Reply>) -> Option<Option<Reply>> {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Start(r)) => {
                    let _ = r.send(SupervisorState::Starting);
                }
                Ok(Command::Restart(r)) => {
                    answer(reply, SupervisorState::Starting);
                    *reply = Some(r);
                }
                Ok(Command::Stop(r)) => return Some(Some(r)),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(None),
            }
        }
    }

    fn finish_stop(
        &mut self,
        status: ProcessStatus,
        stop: Option<Reply>,
        reply: &mut Option<Reply>,
    ) {
        self.transition(SupervisorState::Stopped, Some(EventDetail::Exit { status }));
        answer(reply, SupervisorState::Stopped);
        if let Some(r) = stop {
            let _ = r.send(SupervisorState::Stopped);
        }
    }

    /// Wait for whatever ends the current run. Watchers are cancelled and joined
    /// before returning so nothing samples a reaped PID.
    async fn monitor(&mut self, handle: &mut ProcessHandle) -> Outcome {
        let cancel = CancellationToken::new();
        let (breach_tx, mut breach_rx) = mpsc::channel(1);
        let (change_tx, mut change_rx) = mpsc::channel::<FilesChanged>(1);
        let mut watchers: Vec<JoinHandle<()>> = Vec::new();

        if let Some(ceiling) = self.descriptor.memory_ceiling_bytes {
            watchers.push(MemoryWatcher::spawn(
                self.name().to_string(),
                handle.pid(),
                ceiling,
                self.descriptor.memory_check_interval,
                Arc::clone(&self.sampler),
                breach_tx,
                cancel.clone(),
            ));
        }
        if self.descriptor.watch_enabled {
            watchers.push(FileWatcher::spawn(
                self.name().to_string(),
                self.descriptor.working_directory.clone(),
                self.descriptor.ignore_watch.clone(),
                self.descriptor.watch_interval,
                change_tx,
                cancel.clone(),
            ));
        }

        let stable = tokio::time::sleep(self.descriptor.restart_policy.stable_after);
        tokio::pin!(stable);
        let mut stable_reached = false;

        let outcome = loop {
            tokio::select! {
                result = handle.wait() => break Outcome::Exited(result),
                Some(breach) = breach_rx.recv() => break Outcome::MemoryBreach(breach),
                Some(_) = change_rx.recv() => break Outcome::FilesChanged,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Start(r)) => {
                        let _ = r.send(SupervisorState::Running);
                    }
                    Some(Command::Restart(r)) => break Outcome::Restart(r),
                    Some(Command::Stop(r)) => break Outcome::Stop(Some(r)),
                    None => break Outcome::Stop(None),
                },
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    if self.restart_state.consecutive_failures() > 0 {
                        info!("[{}] running stably, resetting failure counter", self.name());
                        self.restart_state.reset();
                        self.status.send_modify(|s| s.consecutive_failures = 0);
                    }
                }
            }
        };

        cancel.cancel();
        for watcher in watchers {
            let _ = watcher.await;
        }
        outcome
    }

    /// Apply a restart decision. Returns true if the caller should spawn again.
    async fn follow(
        &mut self,
        decision: RestartDecision,
        detail: EventDetail,
        spawned: bool,
        reply: &mut Option<Reply>,
    ) -> bool {
        match decision {
            RestartDecision::RestartNow => {
                self.transition(SupervisorState::Starting, Some(detail));
                true
            }
            RestartDecision::RestartAfter(delay) => {
                self.transition(SupervisorState::Starting, Some(detail));
                self.transition(
                    SupervisorState::Starting,
                    Some(EventDetail::Backoff {
                        delay_ms: delay.as_millis() as u64,
                    }),
                );
                answer(reply, SupervisorState::Starting);
                self.wait_backoff(delay, reply).await
            }
            RestartDecision::GiveUp if spawned && !self.descriptor.auto_restart() => {
                self.transition(SupervisorState::Stopped, Some(detail));
                answer(reply, SupervisorState::Stopped);
                false
            }
            RestartDecision::GiveUp => {
                let failures = self.restart_state.consecutive_failures();
                warn!(
                    "{}",
                    SupervisorError::CrashLoop {
                        app: self.name().to_string(),
                        failures,
                    }
                );
                self.transition(SupervisorState::Failed, Some(EventDetail::GaveUp { failures }));
                answer(reply, SupervisorState::Failed);
                false
            }
        }
    }

    /// Sleep out a backoff. A stop request cancels it without spawning.
    async fn wait_backoff(&mut self, delay: Duration, reply: &mut Option<Reply>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Start(r)) => {
                        let _ = r.send(SupervisorState::Starting);
                    }
                    Some(Command::Restart(r)) => {
                        answer(reply, SupervisorState::Starting);
                        *reply = Some(r);
                        return true;
                    }
                    Some(Command::Stop(r)) => {
                        self.transition(SupervisorState::Stopped, Some(EventDetail::StopRequested));
                        answer(reply, SupervisorState::Stopped);
                        let _ = r.send(SupervisorState::Stopped);
                        return false;
                    }
                    None => {
                        self.transition(SupervisorState::Stopped, None);
                        return false;
                    }
                },
            }
        }
    }

    fn record_exit(&mut self, status: ProcessStatus) {
        self.status.send_modify(|s| {
            s.pid = None;
            s.started_at = None;
            s.last_exit = Some(status);
        });
    }

    fn count_restart(&mut self) {
        self.status.send_modify(|s| s.restarts += 1);
    }

    fn transition(&mut self, next: SupervisorState, detail: Option<EventDetail>) {
        let prev = self.state();
        if !prev.can_transition_to(next) {
            warn!("[{}] unexpected transition {prev} -> {next}", self.name());
        }
        let failures = self.restart_state.consecutive_failures();
        self.status.send_modify(|s| {
            s.state = next;
            s.consecutive_failures = failures;
        });

        match &detail {
            Some(d) => info!("[{}] {prev} -> {next} ({d})", self.name()),
            None => info!("[{}] {prev} -> {next}", self.name()),
        }
        let _ = self.events.send(LifecycleEvent {
            app: self.name().to_string(),
            state: next,
            at: SystemTime::now(),
            detail,
        });
    }
}

fn answer(reply: &mut Option<Reply>, state: SupervisorState) {
    if let Some(r) = reply.take() {
        let _ = r.send(state);
    }
}
