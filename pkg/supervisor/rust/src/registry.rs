// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Named collection of supervisors.

use crate::descriptor::ProcessDescriptor;
use crate::error::{Result, SupervisorError};
use crate::event::{self, EventDetail, EventSender, LifecycleEvent};
use crate::memory::{MemorySampler, ProcfsSampler};
use crate::state::SupervisorState;
use crate::supervisor::{Supervisor, SupervisorHandle, SupervisorStatus};
use log::{debug, info, warn};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Duration, timeout};

/// How long to wait for a force-killed app to be reaped.
const FORCE_KILL_GRACE: Duration = Duration::from_secs(5);

/// Owns every supervisor, keyed by app name, in declaration order. Must be used
/// from within a tokio runtime.
pub struct Registry {
    supervisors: RwLock<Vec<SupervisorHandle>>,
    events: EventSender,
    sampler: Arc<dyn MemorySampler>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_sampler(Arc::new(ProcfsSampler))
    }

    pub fn with_sampler(sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            supervisors: RwLock::new(Vec::new()),
            events: event::channel(),
            sampler,
        }
    }

    pub fn from_descriptors(descriptors: Vec<ProcessDescriptor>) -> Result<Self> {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Register an app. It stays idle until started.
    pub fn insert(&self, descriptor: ProcessDescriptor) -> Result<SupervisorHandle> {
        let mut supervisors = self
            .supervisors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if supervisors.iter().any(|s| s.name() == descriptor.name) {
            return Err(SupervisorError::DuplicateName(descriptor.name));
        }
        debug!("registering {descriptor}");
        let handle = Supervisor::spawn_with_sampler(
            Arc::new(descriptor),
            self.events.clone(),
            Arc::clone(&self.sampler),
        );
        supervisors.push(handle.clone());
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Result<SupervisorHandle> {
        self.supervisors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    fn handles(&self) -> Vec<SupervisorHandle> {
        self.supervisors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.supervisors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start `name`. Already starting or running apps are left alone and their
    /// current state is returned.
    pub async fn start(&self, name: &str) -> Result<SupervisorState> {
        self.get(name)?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<SupervisorState> {
        self.get(name)?.stop().await
    }

    pub async fn restart(&self, name: &str) -> Result<SupervisorState> {
        self.get(name)?.restart().await
    }

    pub fn status(&self, name: &str) -> Result<SupervisorState> {
        Ok(self.get(name)?.state())
    }

    pub fn describe(&self, name: &str) -> Result<SupervisorStatus> {
        Ok(self.get(name)?.status())
    }

    /// `(name, state)` for every app in declaration order.
    pub fn list(&self) -> Vec<(String, SupervisorState)> {
        self.handles()
            .iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }

    /// Full status for every app in declaration order.
    pub fn snapshot(&self) -> Vec<(String, SupervisorStatus)> {
        self.handles()
            .iter()
            .map(|s| (s.name().to_string(), s.status()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Start every app sequentially in declaration order. Returns how many are
    /// running or retrying afterwards.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for handle in self.handles() {
            match handle.start().await {
                Ok(SupervisorState::Running | SupervisorState::Starting) => started += 1,
                Ok(state) => warn!("[{}] did not start: {state}", handle.name()),
                Err(e) => warn!("{e}"),
            }
        }
        started
    }

    /// Stop `name` and drop it from the registry.
    pub async fn remove(&self, name: &str) -> Result<SupervisorState> {
        let state = self.stop(name).await?;
        self.supervisors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.name() != name);
        info!("[{name}] removed");
        Ok(state)
    }

    /// Stop every app concurrently and wait for each to settle, bounded by
    /// `deadline`. Apps still running after that are sent SIGKILL. Returns the
    /// names of force-killed apps.
    pub async fn shutdown(&self, deadline: Duration) -> Vec<String> {
        let handles = self.handles();
        info!("stopping {} app(s)", handles.len());

        let mut stops = JoinSet::new();
        for handle in handles {
            let events = self.events.clone();
            stops.spawn(async move {
                match timeout(deadline, handle.stop()).await {
                    Ok(Ok(state)) => {
                        debug!("[{}] settled in {state}", handle.name());
                        None
                    }
                    Ok(Err(e)) => {
                        warn!("{e}");
                        None
                    }
                    Err(_) => {
                        warn!(
                            "{}",
                            SupervisorError::ShutdownTimeout(handle.name().to_string())
                        );
                        handle.force_kill();
                        let _ = events.send(LifecycleEvent {
                            app: handle.name().to_string(),
                            state: handle.state(),
                            at: SystemTime::now(),
                            detail: Some(EventDetail::ShutdownTimeout),
                        });
                        if timeout(FORCE_KILL_GRACE, handle.wait_settled())
                            .await
                            .is_err()
                        {
                            warn!("[{}] still not settled after SIGKILL", handle.name());
                        }
                        Some(handle.name().to_string())
                    }
                }
            });
        }

        let mut killed = Vec::new();
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok(Some(name)) => killed.push(name),
                Ok(None) => {}
                Err(e) => warn!("shutdown task failed: {e}"),
            }
        }
        killed.sort();
        info!("all apps stopped");
        killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::make_descriptor;

    fn named(name: &str, program: &str, args: Vec<&str>) -> ProcessDescriptor {
        let mut d = make_descriptor(program, args);
        d.name = name.to_string();
        d
    }

    fn sleeper(name: &str) -> ProcessDescriptor {
        named(name, "/bin/sleep", vec!["60"])
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        registry.insert(sleeper("web")).unwrap();
        let err = registry.insert(sleeper("web")).err().unwrap();
        assert!(matches!(err, SupervisorError::DuplicateName(n) if n == "web"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_name() {
        let registry = Registry::from_descriptors(vec![sleeper("web")]).unwrap();
        let err = registry.stop("nope").await.err().unwrap();
        assert!(matches!(err, SupervisorError::NotFound(n) if n == "nope"));
        assert_eq!(registry.status("web").unwrap(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_list_keeps_declaration_order() {
        let registry =
            Registry::from_descriptors(vec![sleeper("zeta"), sleeper("alpha"), sleeper("mid")])
                .unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let registry = Registry::from_descriptors(vec![sleeper("web")]).unwrap();
        assert_eq!(registry.start("web").await.unwrap(), SupervisorState::Running);
        let pid = registry.describe("web").unwrap().pid;
        assert_eq!(registry.start("web").await.unwrap(), SupervisorState::Running);
        assert_eq!(registry.describe("web").unwrap().pid, pid);

        assert!(registry.shutdown(Duration::from_secs(5)).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_all_and_shutdown() {
        let mut oneshot = named("oneshot", "/bin/sh", vec!["-c", "exit 0"]);
        oneshot.restart_policy.auto_restart = false;
        let registry =
            Registry::from_descriptors(vec![sleeper("one"), sleeper("two"), oneshot]).unwrap();
        let mut events = registry.subscribe();

        assert_eq!(registry.start_all().await, 3);
        let first = events.recv().await.unwrap();
        assert_eq!(first.app, "one", "apps start in declaration order");

        let killed = registry.shutdown(Duration::from_secs(5)).await;
        assert!(killed.is_empty());
        for (name, state) in registry.list() {
            assert!(state.is_settled(), "{name} should be settled, got {state}");
        }
        assert_eq!(registry.status("one").unwrap(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_start_all_counts_app_in_backoff() {
        let mut retrying = named("retrying", "/nonexistent/binary", vec![]);
        retrying.restart_policy.base_delay = Duration::from_secs(5);
        let mut gone = named("gone", "/nonexistent/binary", vec![]);
        gone.restart_policy.auto_restart = false;
        let registry = Registry::from_descriptors(vec![sleeper("up"), retrying, gone]).unwrap();

        assert_eq!(registry.start_all().await, 2);
        assert_eq!(registry.status("retrying").unwrap(), SupervisorState::Starting);
        assert_eq!(registry.status("gone").unwrap(), SupervisorState::Failed);

        assert!(registry.shutdown(Duration::from_secs(5)).await.is_empty());
        assert_eq!(registry.status("retrying").unwrap(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_force_kills_stubborn_app() {
        let mut stubborn = named("stubborn", "/bin/sh", vec!["-c", "trap '' TERM; sleep 60"]);
        stubborn.kill_timeout = Duration::from_secs(30);
        let registry = Registry::from_descriptors(vec![stubborn, sleeper("polite")]).unwrap();
        let mut events = registry.subscribe();

        registry.start_all().await;
        let pid = registry.describe("stubborn").unwrap().pid.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = tokio::time::Instant::now();
        let killed = registry.shutdown(Duration::from_millis(500)).await;
        assert_eq!(killed, vec!["stubborn".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(registry.status("stubborn").unwrap(), SupervisorState::Stopped);
        assert_eq!(registry.status("polite").unwrap(), SupervisorState::Stopped);

        #[cfg(unix)]
        assert!(
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err(),
            "stubborn child should be gone"
        );

        let mut saw_timeout = false;
        while let Ok(ev) = events.try_recv() {
            if ev.detail == Some(EventDetail::ShutdownTimeout) {
                assert_eq!(ev.app, "stubborn");
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = Registry::from_descriptors(vec![sleeper("web"), sleeper("worker")]).unwrap();
        registry.start("web").await.unwrap();
        assert_eq!(registry.remove("web").await.unwrap(), SupervisorState::Stopped);
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.status("web"),
            Err(SupervisorError::NotFound(_))
        ));
    }
}
