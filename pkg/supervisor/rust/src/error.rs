// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating app declarations.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("app name must not be empty")]
    EmptyName,
    #[error("[{app}] script must not be empty")]
    EmptyScript { app: String },
    #[error("[{app}] invalid max_memory_restart {value:?}: {reason}")]
    InvalidMemory {
        app: String,
        value: String,
        reason: String,
    },
    #[error("[{app}] invalid duration for {field} {value:?}: {reason}")]
    InvalidDuration {
        app: String,
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("[{app}] unknown exec_mode {value:?} (expected fork or cluster)")]
    InvalidExecMode { app: String, value: String },
    #[error("[{app}] unknown output mode {value:?} (expected forward, inherit or null)")]
    InvalidOutputMode { app: String, value: String },
    #[error("[{app}] instances must be at least 1")]
    ZeroInstances { app: String },
    #[error("duplicate app name {0:?}")]
    DuplicateName(String),
}

/// Errors surfaced by supervisors and the registry.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("[{app}] failed to spawn {program}: {reason}")]
    Spawn {
        app: String,
        program: String,
        reason: String,
    },
    #[error("[{app}] crash loop: {failures} failures within the restart window")]
    CrashLoop { app: String, failures: u32 },
    #[error("app {0:?} not found")]
    NotFound(String),
    #[error("app {0:?} is already registered")]
    DuplicateName(String),
    #[error("[{0}] did not stop within the shutdown timeout")]
    ShutdownTimeout(String),
    #[error("[{0}] supervisor task is no longer running")]
    Stopped(String),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
