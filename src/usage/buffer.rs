//! Durable local queue of usage records.
//!
//! One JSON file per record, named `{unix_millis:013}-{record_id}.json` so
//! lexical order is arrival order. Files are written under a temporary
//! name, synced, renamed, and the directory synced after the rename, so a
//! crash leaves either nothing or a whole record.
//! The flusher publishes the oldest batch and deletes it only after the
//! publisher accepted it; failures back off exponentially.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::publisher::UsagePublisher;
use super::UsageRecord;
use crate::error::RouterError;

const RECORD_EXT: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";

#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub interval: Duration,
    pub batch_size: usize,
    pub max_backoff: Duration,
    pub publish_timeout: Duration,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            max_backoff: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

pub struct UsageBuffer {
    dir: PathBuf,
    publisher: Arc<dyn UsagePublisher>,
    settings: FlushSettings,
    pending: AtomicUsize,
    wake: Notify,
    flush_lock: Mutex<()>,
}

fn is_record(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
}

/// Flush directory entries (creates, renames) in `dir` to disk.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), RouterError> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), RouterError> {
    Ok(())
}

impl UsageBuffer {
    /// Open (creating if needed) the queue directory. Records left by a
    /// previous run are kept and flushed; half-written temp files are removed.
    pub async fn open(
        dir: impl Into<PathBuf>,
        publisher: Arc<dyn UsagePublisher>,
        settings: FlushSettings,
    ) -> Result<Self, RouterError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut leftover = 0usize;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                tokio::fs::remove_file(&path).await?;
            } else if is_record(&path) {
                leftover += 1;
            }
        }

        if leftover > 0 {
            tracing::info!(
                dir = %dir.display(),
                pending = leftover,
                "found buffered usage records from a previous run"
            );
        }

        Ok(Self {
            dir,
            publisher,
            settings: FlushSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            pending: AtomicUsize::new(leftover),
            wake: Notify::new(),
            flush_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn publisher_name(&self) -> &'static str {
        self.publisher.name()
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably queue one record. Never publishes.
    pub async fn append(&self, record: &UsageRecord) -> Result<(), RouterError> {
        let name = format!(
            "{:013}-{}.{RECORD_EXT}",
            record.timestamp.timestamp_millis().max(0),
            record.record_id
        );
        let data = serde_json::to_vec(record)?;
        let final_path = self.dir.join(&name);
        let temp_path = self.dir.join(format!("{name}{TEMP_SUFFIX}"));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &final_path).await?;
        sync_dir(&self.dir).await?;

        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            record_id = %record.record_id,
            request_id = %record.request_id,
            pending,
            "usage record buffered"
        );
        if pending >= self.settings.batch_size {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Publish everything queued, oldest first. Stops at the first failed
    /// batch; that batch and everything after it stay queued.
    pub async fn flush(&self) -> Result<usize, RouterError> {
        let _guard = self.flush_lock.lock().await;
        let mut published = 0;
        loop {
            let (handled, sent) = self.flush_batch().await?;
            published += sent;
            if handled == 0 {
                return Ok(published);
            }
        }
    }

    /// Returns (files taken off the queue, records published).
    async fn flush_batch(&self) -> Result<(usize, usize), RouterError> {
        let paths = self.oldest(self.settings.batch_size).await?;
        if paths.is_empty() {
            return Ok((0, 0));
        }

        let mut records = Vec::with_capacity(paths.len());
        let mut record_paths = Vec::with_capacity(paths.len());
        let mut quarantined = 0;
        for path in &paths {
            match read_record(path).await {
                Ok(record) => {
                    records.push(record);
                    record_paths.push(path);
                }
                Err(e) => {
                    if self.quarantine(path, &e).await {
                        quarantined += 1;
                    }
                }
            }
        }

        if !records.is_empty() {
            let timeout = self.settings.publish_timeout;
            tokio::time::timeout(timeout, self.publisher.publish(&records))
                .await
                .map_err(|_| RouterError::DownstreamPublishFailed {
                    publisher: self.publisher.name(),
                    source: format!("publish timed out after {timeout:?}").into(),
                })??;

            for path in &record_paths {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => self.decrement(1),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.decrement(1),
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::debug!(
                publisher = self.publisher.name(),
                records = records.len(),
                "usage batch published"
            );
        }

        Ok((records.len() + quarantined, records.len()))
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<PathBuf>, RouterError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_record(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        paths.truncate(limit);
        Ok(paths)
    }

    async fn quarantine(&self, path: &Path, error: &RouterError) -> bool {
        let mut target = path.as_os_str().to_owned();
        target.push(CORRUPT_SUFFIX);
        tracing::error!(
            path = %path.display(),
            error = %error,
            "undecodable usage record moved aside"
        );
        match tokio::fs::rename(path, &target).await {
            Ok(()) => {
                self.decrement(1);
                true
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "failed to move undecodable usage record"
                );
                false
            }
        }
    }

    fn decrement(&self, n: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(n)));
    }

    /// Flusher loop; returns when `cancel` fires. Call [`flush`](Self::flush)
    /// afterwards to drain what is left.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.settings.interval;
        let mut delay = interval;

        loop {
            let backing_off = delay > interval;
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("usage flusher shutting down");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
                () = self.wake.notified(), if !backing_off => {}
            }

            match self.flush().await {
                Ok(published) => {
                    if backing_off {
                        tracing::info!(published, "usage pipeline recovered");
                    }
                    delay = interval;
                }
                Err(e) => {
                    delay = delay.saturating_mul(2).min(self.settings.max_backoff).max(interval);
                    tracing::warn!(
                        error = %e,
                        pending = self.pending(),
                        retry_in = ?delay,
                        "usage publish failed, records kept"
                    );
                }
            }
        }
    }
}

async fn read_record(path: &Path) -> Result<UsageRecord, RouterError> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}
