// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Single-host process supervisor: spawns declared apps, restarts them on exit
//! with backoff and crash-loop detection, and recycles them when they outgrow a
//! memory ceiling or their watched files change.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod memory;
pub mod persist;
pub mod process;
pub mod registry;
pub mod restart;
pub mod state;
pub mod supervisor;
pub mod watch;

pub use descriptor::ProcessDescriptor;
pub use error::{ConfigError, SupervisorError};
pub use event::{EventDetail, LifecycleEvent};
pub use process::{ProcessHandle, ProcessStatus};
pub use registry::Registry;
pub use restart::RestartPolicy;
pub use state::SupervisorState;
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorStatus};
