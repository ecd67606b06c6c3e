// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::SupervisorError;
use crate::restart::RestartPolicy;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying the instance index of a clustered app.
pub const INSTANCE_ENV_VAR: &str = "DD_SUPERVISOR_INSTANCE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Fork,
    Cluster { instances: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreter {
    /// Execute the binary directly.
    None,
    Program { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Pipe the stream and copy it to the supervisor's own stream.
    Forward,
    Inherit,
    Null,
}

impl OutputMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "forward" | "pipe" => Some(OutputMode::Forward),
            "inherit" => Some(OutputMode::Inherit),
            "null" | "none" => Some(OutputMode::Null),
            _ => None,
        }
    }
}

/// Immutable declaration of one managed app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub name: String,
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub env: BTreeMap<String, String>,
    pub interpreter: Interpreter,
    pub exec_mode: ExecMode,
    /// Index within a clustered app, `None` in fork mode.
    pub instance: Option<u32>,
    pub restart_policy: RestartPolicy,
    pub watch_enabled: bool,
    pub watch_interval: Duration,
    pub ignore_watch: Vec<String>,
    pub memory_ceiling_bytes: Option<u64>,
    pub memory_check_interval: Duration,
    pub kill_timeout: Duration,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

impl ProcessDescriptor {
    pub fn auto_restart(&self) -> bool {
        self.restart_policy.auto_restart
    }

    /// Program and argv to hand to the OS.
    pub fn command(&self) -> (String, Vec<String>) {
        let script = self.executable_path.to_string_lossy().into_owned();
        match &self.interpreter {
            Interpreter::None => (script, self.args.clone()),
            Interpreter::Program { program, args } => {
                let mut argv = args.clone();
                argv.push(script);
                argv.extend(self.args.iter().cloned());
                (program.clone(), argv)
            }
        }
    }

    /// Spawn-time validation of the paths this descriptor points at.
    pub fn check_executable(&self) -> Result<(), SupervisorError> {
        let fail = |reason: String| SupervisorError::Spawn {
            app: self.name.clone(),
            program: self.executable_path.display().to_string(),
            reason,
        };

        if !self.working_directory.is_dir() {
            return Err(fail(format!(
                "working directory {} does not exist",
                self.working_directory.display()
            )));
        }

        let meta = std::fs::metadata(&self.executable_path)
            .map_err(|e| fail(format!("cannot stat executable: {e}")))?;
        if !meta.is_file() {
            return Err(fail("not a regular file".to_string()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if self.interpreter == Interpreter::None && meta.permissions().mode() & 0o111 == 0 {
                return Err(fail("file is not executable".to_string()));
            }
        }

        Ok(())
    }

    /// Split a clustered descriptor into one descriptor per instance.
    /// Fork-mode descriptors are returned as-is.
    pub fn expand_instances(self) -> Vec<ProcessDescriptor> {
        let ExecMode::Cluster { instances } = self.exec_mode else {
            return vec![self];
        };
        (0..instances)
            .map(|i| {
                let mut d = self.clone();
                d.name = format!("{}-{i}", self.name);
                d.instance = Some(i);
                d.env.insert(INSTANCE_ENV_VAR.to_string(), i.to_string());
                d
            })
            .collect()
    }
}

impl fmt::Display for ProcessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (program, args) = self.command();
        write!(
            f,
            "{}: {} {} (cwd={}, autorestart={}, watch={}",
            self.name,
            program,
            args.join(" "),
            self.working_directory.display(),
            self.auto_restart(),
            self.watch_enabled,
        )?;
        if let Some(ceiling) = self.memory_ceiling_bytes {
            write!(f, ", max_memory={ceiling}B")?;
        }
        write!(f, ")")
    }
}
