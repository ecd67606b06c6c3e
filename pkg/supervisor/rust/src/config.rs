// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::descriptor::{ExecMode, Interpreter, OutputMode, ProcessDescriptor};
use crate::error::ConfigError;
use crate::memory::DEFAULT_MEMORY_CHECK_INTERVAL;
use crate::process::DEFAULT_KILL_TIMEOUT;
use crate::restart::RestartPolicy;
use crate::watch::DEFAULT_WATCH_INTERVAL;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/supervisor.yaml";

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * BYTES_PER_KB;
const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;
const BYTES_PER_TB: u64 = 1024 * BYTES_PER_GB;

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    "none".to_string()
}

/// `args` may be given as a single command line or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Args {
    Line(String),
    List(Vec<String>),
}

impl Default for Args {
    fn default() -> Self {
        Args::List(Vec::new())
    }
}

impl Args {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Args::Line(line) => line.split_whitespace().map(String::from).collect(),
            Args::List(list) => list,
        }
    }
}

/// A bare number or a string with a unit suffix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(u64),
    Text(String),
}

impl Quantity {
    fn raw(&self) -> String {
        match self {
            Quantity::Number(n) => n.to_string(),
            Quantity::Text(s) => s.clone(),
        }
    }
}

/// One app declaration as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "executable_path")]
    pub script: String,
    #[serde(default)]
    pub args: Args,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_true")]
    pub autorestart: bool,
    #[serde(default)]
    pub watch: bool,
    pub watch_interval: Option<Quantity>,
    #[serde(default)]
    pub ignore_watch: Vec<String>,
    pub max_memory_restart: Option<Quantity>,
    pub memory_check_interval: Option<Quantity>,
    pub exec_mode: Option<String>,
    pub instances: Option<u32>,
    pub max_restarts: Option<u32>,
    pub restart_window: Option<Quantity>,
    pub min_uptime: Option<Quantity>,
    pub restart_delay: Option<Quantity>,
    pub max_restart_delay: Option<Quantity>,
    pub kill_timeout: Option<Quantity>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,

    /// Directory of the file this app was declared in.
    #[serde(skip)]
    pub source_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Ecosystem {
    apps: Vec<AppConfig>,
}

pub fn config_path() -> PathBuf {
    std::env::var("DD_SUPERVISOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load app declarations from an ecosystem file or a directory of per-app files.
pub fn load(path: &Path) -> Result<Vec<AppConfig>, ConfigError> {
    if path.is_dir() {
        load_dir(path)
    } else {
        load_ecosystem(path)
    }
}

/// Parse a file with a top-level `apps:` sequence. Declaration order is kept.
pub fn load_ecosystem(path: &Path) -> Result<Vec<AppConfig>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let ecosystem: Ecosystem =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let source_dir = parent_dir(path);
    Ok(ecosystem
        .apps
        .into_iter()
        .map(|mut app| {
            app.source_dir = source_dir.clone();
            app
        })
        .collect())
}

/// Scan a directory for `*.yaml` files, one app per file, sorted by file name.
/// Apps without a `name` take the file stem. Files that fail to parse are logged
/// and skipped.
pub fn load_dir(dir: &Path) -> Result<Vec<AppConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut yaml_files: Vec<_> = entries
        .filter_map(|e| match e {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                warn!("skipping unreadable entry in {}: {e}", dir.display());
                None
            }
        })
        .filter(|path| {
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                debug!("skipping non-YAML file: {}", path.display());
            }
            is_yaml
        })
        .collect();
    yaml_files.sort();

    let mut apps = Vec::new();
    for path in yaml_files {
        match parse_app_file(&path) {
            Ok(app) => apps.push(app),
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }
    Ok(apps)
}

fn parse_app_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut app: AppConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if app.name.is_none() {
        app.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from);
    }
    app.source_dir = parent_dir(path);
    Ok(app)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Validate every app, expand clustered apps and reject duplicate names.
pub fn build_descriptors(apps: Vec<AppConfig>) -> Result<Vec<ProcessDescriptor>, ConfigError> {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::new();
    for app in apps {
        for descriptor in app.into_descriptor()?.expand_instances() {
            if !seen.insert(descriptor.name.clone()) {
                return Err(ConfigError::DuplicateName(descriptor.name));
            }
            descriptors.push(descriptor);
        }
    }
    Ok(descriptors)
}

impl AppConfig {
    pub fn into_descriptor(self) -> Result<ProcessDescriptor, ConfigError> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ConfigError::EmptyName)?
            .to_string();
        if self.script.trim().is_empty() {
            return Err(ConfigError::EmptyScript { app: name });
        }

        let duration = |field: &'static str, value: &Option<Quantity>, default: Duration| {
            value.as_ref().map_or(Ok(default), |q| {
                let raw = q.raw();
                parse_duration(&raw).map_err(|reason| ConfigError::InvalidDuration {
                    app: name.clone(),
                    field,
                    value: raw,
                    reason,
                })
            })
        };

        let defaults = RestartPolicy::default();
        let restart_policy = RestartPolicy {
            auto_restart: self.autorestart,
            max_failures: self.max_restarts.unwrap_or(defaults.max_failures),
            window: duration("restart_window", &self.restart_window, defaults.window)?,
            stable_after: duration("min_uptime", &self.min_uptime, defaults.stable_after)?,
            base_delay: duration("restart_delay", &self.restart_delay, defaults.base_delay)?,
            max_delay: duration(
                "max_restart_delay",
                &self.max_restart_delay,
                defaults.max_delay,
            )?,
        };

        let memory_ceiling_bytes = match &self.max_memory_restart {
            Some(q) => {
                let raw = q.raw();
                let ceiling = parse_memory(&raw).and_then(|bytes| match bytes {
                    0 => Err("memory ceiling must be greater than zero".to_string()),
                    bytes => Ok(bytes),
                });
                Some(ceiling.map_err(|reason| ConfigError::InvalidMemory {
                    app: name.clone(),
                    value: raw,
                    reason,
                })?)
            }
            None => None,
        };

        let exec_mode = match self.exec_mode.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("fork") | Some("fork_mode") => {
                if self.instances.is_some_and(|n| n > 1) {
                    warn!("[{name}] instances is ignored in fork mode");
                }
                ExecMode::Fork
            }
            Some("cluster") | Some("cluster_mode") => {
                let instances = self.instances.unwrap_or(1);
                if instances == 0 {
                    return Err(ConfigError::ZeroInstances { app: name.clone() });
                }
                ExecMode::Cluster { instances }
            }
            Some(other) => {
                return Err(ConfigError::InvalidExecMode {
                    app: name.clone(),
                    value: other.to_string(),
                });
            }
        };

        let output = |value: &Option<String>| match value {
            None => Ok(OutputMode::Forward),
            Some(v) => OutputMode::parse(v).ok_or_else(|| ConfigError::InvalidOutputMode {
                app: name.clone(),
                value: v.clone(),
            }),
        };
        let stdout = output(&self.stdout)?;
        let stderr = output(&self.stderr)?;

        let interpreter = match self.interpreter.trim() {
            none if none.is_empty() || none.eq_ignore_ascii_case("none") => Interpreter::None,
            program => Interpreter::Program {
                program: program.to_string(),
                args: self.interpreter_args.clone(),
            },
        };

        let working_directory = match &self.cwd {
            Some(cwd) => self.source_dir.join(cwd),
            None => self.source_dir.clone(),
        };
        let executable_path = working_directory.join(&self.script);

        Ok(ProcessDescriptor {
            executable_path,
            args: self.args.into_vec(),
            working_directory,
            env: self.env,
            interpreter,
            exec_mode,
            instance: None,
            restart_policy,
            watch_enabled: self.watch,
            watch_interval: duration("watch_interval", &self.watch_interval, DEFAULT_WATCH_INTERVAL)?,
            ignore_watch: self.ignore_watch,
            memory_ceiling_bytes,
            memory_check_interval: duration(
                "memory_check_interval",
                &self.memory_check_interval,
                DEFAULT_MEMORY_CHECK_INTERVAL,
            )?,
            kill_timeout: duration("kill_timeout", &self.kill_timeout, DEFAULT_KILL_TIMEOUT)?,
            stdout,
            stderr,
            name,
        })
    }
}

/// Parse a memory size to bytes.
/// Examples: "256M" -> 268435456, "1G" -> 1073741824, "512K" -> 524288, "1.5GB".
pub fn parse_memory(mem_str: &str) -> Result<u64, String> {
    let upper = mem_str.trim().to_uppercase();
    if upper.is_empty() {
        return Err("empty memory string".to_string());
    }
    let unit_str = upper
        .strip_suffix('B')
        .filter(|s| s.ends_with(['K', 'M', 'G', 'T']))
        .unwrap_or(&upper);

    let (value_str, multiplier) = if let Some(v) = unit_str.strip_suffix('K') {
        (v, BYTES_PER_KB)
    } else if let Some(v) = unit_str.strip_suffix('M') {
        (v, BYTES_PER_MB)
    } else if let Some(v) = unit_str.strip_suffix('G') {
        (v, BYTES_PER_GB)
    } else if let Some(v) = unit_str.strip_suffix('T') {
        (v, BYTES_PER_TB)
    } else {
        (unit_str.strip_suffix('B').unwrap_or(unit_str), 1_u64)
    };
    let value_str = value_str.trim();

    if let Ok(value) = value_str.parse::<u64>() {
        return value
            .checked_mul(multiplier)
            .ok_or_else(|| "memory value overflows".to_string());
    }
    let value: f64 = value_str
        .parse()
        .map_err(|e| format!("invalid memory value: {e}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err("memory value must be a positive number".to_string());
    }
    Ok((value * multiplier as f64) as u64)
}

/// Parse a duration. A bare number is milliseconds; otherwise `ms`, `s`, `m` or `h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let (value_str, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = value_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration: {e}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err("duration must be a positive number".to_string());
    }
    Duration::try_from_secs_f64(value * unit_ms / 1_000.0)
        .map_err(|e| format!("duration out of range: {e}"))
}
