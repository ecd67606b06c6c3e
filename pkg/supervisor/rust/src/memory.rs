// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Resident memory sampling for running processes.

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

fn proc_root() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        std::env::var("HOST_PROC")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/proc"))
    })
}

/// Source of resident memory readings.
pub trait MemorySampler: Send + Sync {
    /// Resident set size in bytes, or `None` if the process cannot be sampled
    /// (already exited, unsupported platform).
    fn resident_bytes(&self, pid: u32) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/<pid>/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsSampler;

impl MemorySampler for ProcfsSampler {
    fn resident_bytes(&self, pid: u32) -> Option<u64> {
        let path = proc_root().join(pid.to_string()).join("status");
        let contents = std::fs::read_to_string(path).ok()?;
        parse_vm_rss(&contents)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let multiplier = match fields.next() {
        Some("kB") | None => 1024,
        Some("mB") => 1024 * 1024,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

/// Emitted once per continuous over-ceiling episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBreach {
    pub pid: u32,
    pub resident_bytes: u64,
    pub ceiling_bytes: u64,
}

/// Edge detector: fires on the first sample over the ceiling and re-arms once a
/// sample is back under it. A failed sample counts as under.
#[derive(Debug)]
pub struct BreachDetector {
    ceiling_bytes: u64,
    over: bool,
}

impl BreachDetector {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            over: false,
        }
    }

    pub fn observe(&mut self, sample: Option<u64>) -> bool {
        let over = sample.is_some_and(|rss| rss > self.ceiling_bytes);
        let fired = over && !self.over;
        self.over = over;
        fired
    }
}

/// Periodic sampler attached to one running process.
pub struct MemoryWatcher;

impl MemoryWatcher {
    /// Sample `pid` every `every` until `cancel` fires, sending breaches on `tx`.
    pub fn spawn(
        name: String,
        pid: u32,
        ceiling_bytes: u64,
        every: Duration,
        sampler: Arc<dyn MemorySampler>,
        tx: mpsc::Sender<MemoryBreach>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut detector = BreachDetector::new(ceiling_bytes);
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let sample = sampler.resident_bytes(pid);
                debug!("[{name}] pid {pid} resident memory: {sample:?}");
                if detector.observe(sample) {
                    let resident_bytes = sample.unwrap_or_default();
                    info!(
                        "[{name}] memory ceiling breached (pid={pid}, rss={resident_bytes}, ceiling={ceiling_bytes})"
                    );
                    let breach = MemoryBreach {
                        pid,
                        resident_bytes,
                        ceiling_bytes,
                    };
                    if tx.send(breach).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const MB: u64 = 1024 * 1024;

    /// Replays scripted samples, then repeats the last one.
    pub(crate) struct ScriptedSampler {
        samples: Mutex<VecDeque<Option<u64>>>,
        last: Mutex<Option<u64>>,
    }

    impl ScriptedSampler {
        pub(crate) fn new(samples: Vec<Option<u64>>) -> Self {
            Self {
                samples: Mutex::new(samples.into()),
                last: Mutex::new(None),
            }
        }
    }

    impl MemorySampler for ScriptedSampler {
        fn resident_bytes(&self, _pid: u32) -> Option<u64> {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.samples.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        }
    }

    #[test]
    fn test_detector_fires_once_per_episode() {
        let mut d = BreachDetector::new(1024 * MB);
        assert!(!d.observe(Some(500 * MB)));
        assert!(d.observe(Some(1200 * MB)));
        assert!(!d.observe(Some(1300 * MB)));
        assert!(!d.observe(Some(1200 * MB)));
        assert!(!d.observe(Some(900 * MB)));
        assert!(d.observe(Some(1100 * MB)), "new episode fires again");
    }

    #[test]
    fn test_detector_ceiling_is_exclusive() {
        let mut d = BreachDetector::new(1024 * MB);
        assert!(!d.observe(Some(1024 * MB)));
        assert!(d.observe(Some(1024 * MB + 1)));
    }

    #[test]
    fn test_detector_sampling_failure_is_no_breach() {
        let mut d = BreachDetector::new(MB);
        assert!(!d.observe(None));
        assert!(d.observe(Some(2 * MB)));
        assert!(!d.observe(None));
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsleep\nVmPeak:\t    8000 kB\nVmRSS:\t    1536 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(1536 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkworker\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_sampler_self() {
        let rss = ProcfsSampler.resident_bytes(std::process::id());
        assert!(rss.is_some_and(|b| b > 0));
    }

    #[test]
    fn test_procfs_sampler_missing_pid() {
        assert_eq!(ProcfsSampler.resident_bytes(u32::MAX), None);
    }

    #[tokio::test]
    async fn test_watcher_emits_single_breach() {
        let sampler = Arc::new(ScriptedSampler::new(vec![
            Some(500 * MB),
            Some(1200 * MB),
            Some(1200 * MB),
            Some(1300 * MB),
        ]));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = MemoryWatcher::spawn(
            "w".into(),
            1,
            1024 * MB,
            Duration::from_millis(10),
            sampler,
            tx,
            cancel.clone(),
        );

        let breach = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(breach.resident_bytes, 1200 * MB);
        assert_eq!(breach.ceiling_bytes, 1024 * MB);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "no second breach while still over");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
