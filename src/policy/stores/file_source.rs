//! Seed-file policy store with SHA-256 change detection.
//!
//! [`FileStore`] implements [`PolicyStore`] over a YAML or JSON file of
//! the form `policies: [...]`. Subscriptions poll the file; when its
//! digest changes the new content is diffed per key against the last
//! parsed state and one [`ChangeEvent`] is emitted for every added,
//! modified or removed key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{parse_policy_str, sha256_hex};
use crate::error::RouterError;
use crate::policy::model::{PolicyKey, RoutingPolicy};
use crate::policy::{ChangeEvent, PolicyStore};

const EVENT_BUFFER: usize = 256;

pub struct FileStore {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileStore {
    #[must_use]
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<(String, HashMap<PolicyKey, RoutingPolicy>), RouterError> {
        read_snapshot(&self.path).await
    }
}

async fn read_snapshot(
    path: &Path,
) -> Result<(String, HashMap<PolicyKey, RoutingPolicy>), RouterError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RouterError::PolicyFileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            RouterError::Io(e)
        }
    })?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let file = parse_policy_str(ext, &content, &path.display().to_string())?;
    let policies = file.policies.into_iter().map(|p| (p.key(), p)).collect();
    Ok((sha256_hex(content.as_bytes()), policies))
}

/// Keys whose policy differs between two snapshots, in key order.
fn changed_keys(
    before: &HashMap<PolicyKey, RoutingPolicy>,
    after: &HashMap<PolicyKey, RoutingPolicy>,
) -> Vec<PolicyKey> {
    let mut keys: Vec<PolicyKey> = after
        .iter()
        .filter(|(key, policy)| before.get(*key) != Some(*policy))
        .map(|(key, _)| key.clone())
        .chain(before.keys().filter(|k| !after.contains_key(*k)).cloned())
        .collect();
    keys.sort();
    keys
}

#[async_trait]
impl PolicyStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn list(&self) -> Result<Vec<RoutingPolicy>, RouterError> {
        let (_, policies) = self.read().await?;
        let mut list: Vec<RoutingPolicy> = policies.into_values().collect();
        list.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(list)
    }

    async fn get(&self, key: &PolicyKey) -> Result<Option<RoutingPolicy>, RouterError> {
        let (_, mut policies) = self.read().await?;
        Ok(policies.remove(key))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChangeEvent>, RouterError> {
        let (mut digest, mut state) = self.read().await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let path = self.path.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = tx.closed() => return,
                }

                let (next_digest, next_state) = match read_snapshot(&path).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "policy file unreadable, keeping last state"
                        );
                        continue;
                    }
                };
                if next_digest == digest {
                    continue;
                }

                let keys = changed_keys(&state, &next_state);
                tracing::info!(path = %path.display(), changed = keys.len(), "policy file changed");
                digest = next_digest;
                state = next_state;

                for key in keys {
                    if tx.send(ChangeEvent { key }).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
