//! Configuration file watcher.
//!
//! Polls a file's modification time on a fixed interval and hands the new
//! content to a callback once per distinct timestamp. Poll ticks and manual
//! re-checks share one mutex, so a change is never reported twice and never
//! skipped.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// File state observed by a poll that detected a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub content: String,
}

pub struct ConfigWatcher {
    path: PathBuf,
    /// Last modification time that was delivered (or the startup baseline)
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigWatcher {
    /// Create a watcher whose baseline is the file's current modification
    /// time. The content loaded at startup is not reported as a change.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baseline = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self {
            path,
            last_modified: Mutex::new(baseline),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file and stat the handle; on a new modification time read
    /// it through the same handle and invoke `on_change`. Returns whether the
    /// callback ran.
    ///
    /// An unreadable file yields `Error::ConfigRead` and leaves the stored
    /// timestamp untouched, so the next check retries. So does a file whose
    /// timestamp moved while it was being read.
    pub async fn check<F>(&self, on_change: &F) -> Result<bool>
    where
        F: Fn(&ConfigSnapshot) -> Result<()>,
    {
        let mut last_modified = self.last_modified.lock().await;

        let mut file = File::open(&self.path)
            .await
            .map_err(|source| self.read_error(source))?;
        let modified = modified_time(&file)
            .await
            .map_err(|source| self.read_error(source))?;

        if *last_modified == Some(modified) {
            return Ok(false);
        }

        let mut content = String::new();
        file.read_to_string(&mut content)
            .await
            .map_err(|source| self.read_error(source))?;

        let settled = modified_time(&file)
            .await
            .map_err(|source| self.read_error(source))?;
        if settled != modified {
            tracing::debug!(path = %self.path.display(), "config file changed while being read");
            return Ok(false);
        }

        *last_modified = Some(modified);

        let snapshot = ConfigSnapshot {
            path: self.path.clone(),
            modified,
            content,
        };
        tracing::info!(path = %self.path.display(), "config file change detected");

        if let Err(e) = on_change(&snapshot) {
            tracing::warn!(path = %self.path.display(), error = %e, "config change callback failed");
        }
        Ok(true)
    }

    /// Poll on `interval` until the returned task is aborted.
    pub fn watch<F>(self, interval: Duration, on_change: F) -> JoinHandle<()>
    where
        F: Fn(&ConfigSnapshot) -> Result<()> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            tracing::info!(
                path = %self.path.display(),
                interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                "config watcher started"
            );

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = self.check(&on_change).await {
                    tracing::warn!(error = %e, "config poll failed, retrying on next tick");
                }
            }
        })
    }

    fn read_error(&self, source: std::io::Error) -> Error {
        Error::ConfigRead {
            path: self.path.clone(),
            source,
        }
    }
}

async fn modified_time(file: &File) -> std::io::Result<SystemTime> {
    file.metadata().await?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File as StdFile;
    use std::io::Write;
    use std::sync::{Arc, Mutex as StdMutex};

    fn write_with_mtime(path: &Path, content: &str, offset_secs: u64) {
        let mut file = StdFile::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset_secs))
            .unwrap();
    }

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&ConfigSnapshot) -> Result<()>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = move |snapshot: &ConfigSnapshot| -> Result<()> {
            sink.lock().unwrap().push(snapshot.content.clone());
            Ok(())
        };
        (seen, callback)
    }

    #[tokio::test]
    async fn startup_content_is_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let watcher = ConfigWatcher::new(&path);
        let (seen, callback) = recorder();

        assert!(!watcher.check(&callback).await.unwrap());
        assert!(!watcher.check(&callback).await.unwrap());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fires_once_per_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let watcher = ConfigWatcher::new(&path);
        let (seen, callback) = recorder();

        write_with_mtime(&path, "a = 2", 10);
        assert!(watcher.check(&callback).await.unwrap());
        assert!(!watcher.check(&callback).await.unwrap());
        assert!(!watcher.check(&callback).await.unwrap());

        write_with_mtime(&path, "a = 3", 20);
        assert!(watcher.check(&callback).await.unwrap());

        assert_eq!(*seen.lock().unwrap(), vec!["a = 2", "a = 3"]);
    }

    #[tokio::test]
    async fn snapshot_pairs_content_with_its_own_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let watcher = ConfigWatcher::new(&path);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = move |snapshot: &ConfigSnapshot| -> Result<()> {
            sink.lock().unwrap().push((snapshot.modified, snapshot.content.clone()));
            Ok(())
        };

        // Editors save by writing a new file and renaming it over the old one
        let staged = dir.path().join("app.toml.tmp");
        write_with_mtime(&staged, "a = 2", 7);
        std::fs::rename(&staged, &path).unwrap();
        assert!(watcher.check(&callback).await.unwrap());

        write_with_mtime(&path, "a = 3", 8);
        assert!(watcher.check(&callback).await.unwrap());
        assert!(!watcher.check(&callback).await.unwrap());

        let at = |offset: u64| SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(at(7), "a = 2".to_string()), (at(8), "a = 3".to_string())]
        );
    }

    #[tokio::test]
    async fn rapid_replacements_deliver_matching_content_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "gen = 0", 0);

        let watcher = ConfigWatcher::new(&path);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = move |snapshot: &ConfigSnapshot| -> Result<()> {
            sink.lock().unwrap().push((snapshot.modified, snapshot.content.clone()));
            Ok(())
        };

        let writer = {
            let dir = dir.path().to_path_buf();
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                let staged = dir.join("app.toml.tmp");
                for n in 1..=200u64 {
                    write_with_mtime(&staged, &format!("gen = {n}"), n);
                    std::fs::rename(&staged, &path).unwrap();
                }
            })
        };
        while !writer.is_finished() {
            watcher.check(&callback).await.unwrap();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        watcher.check(&callback).await.unwrap();

        let seen = seen.lock().unwrap();
        let epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut generations = Vec::new();
        for (modified, content) in seen.iter() {
            let n = modified.duration_since(epoch).unwrap().as_secs();
            assert_eq!(content, &format!("gen = {n}"));
            generations.push(n);
        }
        assert!(generations.windows(2).all(|w| w[0] < w[1]), "{generations:?}");
        assert_eq!(generations.last(), Some(&200));
    }

    #[tokio::test]
    async fn concurrent_checks_deliver_a_change_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let watcher = Arc::new(ConfigWatcher::new(&path));
        let (seen, callback) = recorder();
        let callback = Arc::new(callback);

        write_with_mtime(&path, "a = 2", 5);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let watcher = Arc::clone(&watcher);
            let callback = Arc::clone(&callback);
            tasks.push(tokio::spawn(async move {
                watcher.check(callback.as_ref()).await.unwrap()
            }));
        }

        let mut fired = 0;
        for task in tasks {
            if task.await.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_file_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let watcher = ConfigWatcher::new(&path);
        let (seen, callback) = recorder();

        std::fs::remove_file(&path).unwrap();
        let err = watcher.check(&callback).await.unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));

        write_with_mtime(&path, "a = 9", 30);
        assert!(watcher.check(&callback).await.unwrap());
        assert_eq!(*seen.lock().unwrap(), vec!["a = 9"]);
    }

    #[tokio::test]
    async fn callback_error_does_not_redeliver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let watcher = ConfigWatcher::new(&path);
        let calls = Arc::new(StdMutex::new(0));
        let counter = Arc::clone(&calls);
        let failing = move |_: &ConfigSnapshot| -> Result<()> {
            *counter.lock().unwrap() += 1;
            Err(Error::Config("rejected".to_string()))
        };

        write_with_mtime(&path, "broken", 1);
        assert!(watcher.check(&failing).await.unwrap());
        assert!(!watcher.check(&failing).await.unwrap());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn watch_task_polls_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        write_with_mtime(&path, "a = 1", 0);

        let (seen, callback) = recorder();
        let task = ConfigWatcher::new(&path).watch(Duration::from_millis(20), callback);

        write_with_mtime(&path, "a = 2", 40);
        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert_eq!(*seen.lock().unwrap(), vec!["a = 2"]);
    }
}
