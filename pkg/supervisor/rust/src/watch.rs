// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Polling file watcher used for `watch: true` apps.

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

const ALWAYS_IGNORED: &[&str] = &[".git", "node_modules"];

/// Summary of a directory tree; any file added, removed, resized or touched
/// changes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fingerprint {
    files: u64,
    total_size: u64,
    newest: Option<SystemTime>,
}

pub fn fingerprint(root: &Path, ignore: &[String]) -> Fingerprint {
    let mut fp = Fingerprint::default();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        !ALWAYS_IGNORED.contains(&&*name) && !ignore.iter().any(|i| *i == name)
    });
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        fp.files += 1;
        fp.total_size += meta.len();
        if let Ok(modified) = meta.modified() {
            fp.newest = fp.newest.max(Some(modified));
        }
    }
    fp
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesChanged {
    pub root: PathBuf,
}

pub struct FileWatcher;

impl FileWatcher {
    /// Poll `root` every `every` until `cancel` fires. Sends one event per change
    /// observed between two polls.
    pub fn spawn(
        name: String,
        root: PathBuf,
        ignore: Vec<String>,
        every: Duration,
        tx: mpsc::Sender<FilesChanged>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = snapshot(&root, &ignore).await;
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let current = snapshot(&root, &ignore).await;
                if current == last {
                    continue;
                }
                debug!("[{name}] fingerprint changed: {last:?} -> {current:?}");
                last = current;
                info!("[{name}] change detected under {}", root.display());
                if tx.send(FilesChanged { root: root.clone() }).await.is_err() {
                    break;
                }
            }
        })
    }
}

async fn snapshot(root: &Path, ignore: &[String]) -> Fingerprint {
    let root = root.to_path_buf();
    let ignore = ignore.to_vec();
    tokio::task::spawn_blocking(move || fingerprint(&root, &ignore))
        .await
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_fingerprint_tracks_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = fingerprint(dir.path(), &[]);
        assert_eq!(empty.files, 0);

        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let one = fingerprint(dir.path(), &[]);
        assert_eq!(one.files, 1);
        assert_eq!(one.total_size, 5);
        assert_ne!(one, empty);

        fs::write(dir.path().join("a.txt"), "hello, world").unwrap();
        assert_ne!(fingerprint(dir.path(), &[]), one);
    }

    #[test]
    fn test_fingerprint_ignores_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        let before = fingerprint(dir.path(), &["logs".to_string()]);

        for ignored in ["logs", ".git", "node_modules"] {
            fs::create_dir(dir.path().join(ignored)).unwrap();
            fs::write(dir.path().join(ignored).join("x"), "noise").unwrap();
        }
        assert_eq!(fingerprint(dir.path(), &["logs".to_string()]), before);
    }

    #[tokio::test]
    async fn test_watcher_reports_change() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = FileWatcher::spawn(
            "w".into(),
            dir.path().to_path_buf(),
            vec![],
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "no change yet");

        fs::write(dir.path().join("new.txt"), "data").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.root, dir.path());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
