// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! JSON state file written by the daemon and read back by `dd-supervisord status`.

use crate::process::ProcessStatus;
use crate::registry::Registry;
use crate::state::SupervisorState;
use crate::supervisor::SupervisorStatus;
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub name: String,
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub uptime_secs: Option<u64>,
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub last_exit: Option<ProcessStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub written_at: String,
    pub apps: Vec<AppSnapshot>,
}

impl StateSnapshot {
    pub fn capture(statuses: Vec<(String, SupervisorStatus)>) -> Self {
        let now = SystemTime::now();
        let apps = statuses
            .into_iter()
            .map(|(name, s)| AppSnapshot {
                name,
                state: s.state,
                pid: s.pid,
                started_at: s.started_at.map(rfc3339),
                uptime_secs: s
                    .started_at
                    .and_then(|t| now.duration_since(t).ok())
                    .map(|d| d.as_secs()),
                restarts: s.restarts,
                consecutive_failures: s.consecutive_failures,
                last_exit: s.last_exit,
            })
            .collect();
        Self {
            written_at: rfc3339(now),
            apps,
        }
    }

    pub fn render_table(&self) -> String {
        let width = self
            .apps
            .iter()
            .map(|a| a.name.len())
            .max()
            .unwrap_or(0)
            .max("NAME".len());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<width$}  {:<8}  {:>8}  {:>8}  {:>8}  {:>8}  LAST EXIT",
            "NAME", "STATE", "PID", "UPTIME", "RESTARTS", "FAILURES"
        );
        for app in &self.apps {
            let _ = writeln!(
                out,
                "{:<width$}  {:<8}  {:>8}  {:>8}  {:>8}  {:>8}  {}",
                app.name,
                app.state.to_string(),
                app.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                app.uptime_secs.map_or_else(|| "-".to_string(), human_uptime),
                app.restarts,
                app.consecutive_failures,
                app.last_exit.map_or_else(|| "-".to_string(), |s| s.to_string()),
            );
        }
        let _ = write!(out, "written at {}", self.written_at);
        out
    }
}

fn rfc3339(t: SystemTime) -> String {
    OffsetDateTime::from(t).format(&Rfc3339).unwrap_or_default()
}

fn human_uptime(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s if s < 86400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86400, (s % 86400) / 3600),
    }
}

/// Write `snapshot` to `path` via a sibling temp file and rename, so readers
/// never observe a partial file.
pub fn write_atomic(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("serializing state snapshot")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn read(path: &Path) -> Result<StateSnapshot> {
    let contents =
        std::fs::read(path).with_context(|| format!("reading state file {}", path.display()))?;
    serde_json::from_slice(&contents)
        .with_context(|| format!("parsing state file {}", path.display()))
}

/// Rewrites the state file after every lifecycle event until cancelled.
pub struct StateWriter;

impl StateWriter {
    pub fn spawn(path: PathBuf, registry: Arc<Registry>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            persist(&path, &registry);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = events.recv() => match ev {
                        Ok(ev) => debug!("state file update after {ev}"),
                        Err(RecvError::Lagged(n)) => debug!("state writer skipped {n} events"),
                        Err(RecvError::Closed) => break,
                    },
                }
                // Coalesce bursts into a single write.
                while events.try_recv().is_ok() {}
                persist(&path, &registry);
            }
            persist(&path, &registry);
        })
    }
}

fn persist(path: &Path, registry: &Registry) {
    let snapshot = StateSnapshot::capture(registry.snapshot());
    if let Err(e) = write_atomic(path, &snapshot) {
        warn!("failed to write state file: {e:#}");
    }
}
