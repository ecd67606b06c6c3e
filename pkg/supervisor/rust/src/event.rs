// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::process::ProcessStatus;
use crate::state::SupervisorState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Capacity of the lifecycle event channel. Slow subscribers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub type EventSender = broadcast::Sender<LifecycleEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventDetail {
    Spawned { pid: u32 },
    Exit { status: ProcessStatus },
    SpawnFailed { reason: String },
    Backoff { delay_ms: u64 },
    MemoryBreach { resident_bytes: u64, ceiling_bytes: u64 },
    FilesChanged,
    GaveUp { failures: u32 },
    StopRequested,
    RestartRequested,
    ShutdownTimeout,
}

impl fmt::Display for EventDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDetail::Spawned { pid } => write!(f, "spawned pid {pid}"),
            EventDetail::Exit { status } => write!(f, "exited with {status}"),
            EventDetail::SpawnFailed { reason } => write!(f, "spawn failed: {reason}"),
            EventDetail::Backoff { delay_ms } => write!(f, "restarting in {delay_ms}ms"),
            EventDetail::MemoryBreach {
                resident_bytes,
                ceiling_bytes,
            } => write!(
                f,
                "memory {resident_bytes}B over ceiling {ceiling_bytes}B"
            ),
            EventDetail::FilesChanged => write!(f, "watched files changed"),
            EventDetail::GaveUp { failures } => {
                write!(f, "gave up after {failures} failures")
            }
            EventDetail::StopRequested => write!(f, "stop requested"),
            EventDetail::RestartRequested => write!(f, "restart requested"),
            EventDetail::ShutdownTimeout => write!(f, "shutdown timed out, killed"),
        }
    }
}

/// Emitted on every supervisor state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub app: String,
    pub state: SupervisorState,
    pub at: SystemTime,
    pub detail: Option<EventDetail>,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.app, self.state)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}
