// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Restart decisions for exited processes.
//!
//! Every unrequested exit is recorded as a failure in a sliding window. Once the
//! number of failures inside the window exceeds `max_failures` the policy gives up,
//! otherwise the next spawn is delayed with exponential backoff capped at
//! `max_delay`. A process that stayed up for `stable_after` clears the window.

use crate::process::ProcessStatus;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_RESTARTS: u32 = 15;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(10);
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_RESTART_DELAY: Duration = Duration::from_secs(15);

const BACKOFF_BASE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub auto_restart: bool,
    /// Failures tolerated inside `window` before giving up.
    pub max_failures: u32,
    pub window: Duration,
    /// Uptime after which the failure counter is cleared.
    pub stable_after: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_failures: DEFAULT_MAX_RESTARTS,
            window: DEFAULT_RESTART_WINDOW,
            stable_after: DEFAULT_MIN_UPTIME,
            base_delay: DEFAULT_RESTART_DELAY,
            max_delay: DEFAULT_MAX_RESTART_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartAfter(Duration),
    GiveUp,
}

/// What the supervisor knows about a run that ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process could not be spawned at all.
    pub status: Option<ProcessStatus>,
    pub uptime: Duration,
}

impl ExitInfo {
    pub fn exited(status: ProcessStatus, uptime: Duration) -> Self {
        Self {
            status: Some(status),
            uptime,
        }
    }

    pub fn spawn_failure() -> Self {
        Self {
            status: None,
            uptime: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestartState {
    failures: VecDeque<Instant>,
    next_backoff: Duration,
}

impl RestartState {
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn next_backoff(&self) -> Duration {
        self.next_backoff
    }

    pub fn reset(&mut self) {
        self.failures.clear();
        self.next_backoff = Duration::ZERO;
    }
}

impl RestartPolicy {
    /// Decide what happens after an unrequested exit. Records the exit in `state`.
    pub fn decide(&self, exit: &ExitInfo, state: &mut RestartState, now: Instant) -> RestartDecision {
        if !self.auto_restart {
            return RestartDecision::GiveUp;
        }

        if exit.uptime >= self.stable_after {
            state.reset();
        }

        state.failures.push_back(now);
        while let Some(&oldest) = state.failures.front() {
            if now.saturating_duration_since(oldest) > self.window {
                state.failures.pop_front();
            } else {
                break;
            }
        }

        let failures = state.consecutive_failures();
        if failures > self.max_failures {
            state.next_backoff = Duration::ZERO;
            return RestartDecision::GiveUp;
        }

        let delay = self.backoff_for(failures);
        state.next_backoff = delay;
        if delay.is_zero() {
            RestartDecision::RestartNow
        } else {
            RestartDecision::RestartAfter(delay)
        }
    }

    /// `base_delay * 2^(failures-1)`, capped at `max_delay`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = BACKOFF_BASE.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
