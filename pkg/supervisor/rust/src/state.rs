// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// Declared, never started.
    Idle,
    /// Spawning, or waiting out a restart backoff.
    Starting,
    /// Child process is alive.
    Running,
    /// Termination sequence in progress.
    Stopping,
    /// Deliberately stopped, or exited with autorestart disabled.
    Stopped,
    /// Restart policy gave up.
    Failed,
}

impl SupervisorState {
    pub fn is_alive(self) -> bool {
        self == SupervisorState::Running
    }

    /// States a supervisor rests in until someone calls `start()` again.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            SupervisorState::Idle | SupervisorState::Stopped | SupervisorState::Failed
        )
    }

    pub(crate) fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Starting)
                | (Starting, Stopped)
                | (Starting, Failed)
                | (Running, Starting)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopping, Starting)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Stopping => write!(f, "stopping"),
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Failed => write!(f, "failed"),
        }
    }
}
