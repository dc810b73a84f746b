//! etcd-backed policy store.
//!
//! Policies live as JSON values under `policies/{org}/{model}`. Listing
//! uses a prefix range read, subscriptions use a prefix watch. A watch
//! stream error or close drops the subscription channel so the policy
//! source reconnects.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, WatchOptions};
use tokio::sync::mpsc;

use crate::error::RouterError;
use crate::policy::model::{PolicyKey, RoutingPolicy};
use crate::policy::{ChangeEvent, PolicyStore};

pub const KEY_PREFIX: &str = "policies/";

const EVENT_BUFFER: usize = 256;

pub struct EtcdStore {
    client: Client,
}

fn unavailable(e: etcd_client::Error) -> RouterError {
    RouterError::ConfigSourceUnavailable {
        store: "etcd",
        source: Box::new(e),
    }
}

/// `policies/{org}/{model}` for a key.
#[must_use]
pub fn key_path(key: &PolicyKey) -> String {
    format!("{KEY_PREFIX}{}/{}", key.organization_id, key.model)
}

/// Inverse of [`key_path`]; `None` for keys outside the policy prefix.
#[must_use]
pub fn parse_key_path(path: &str) -> Option<PolicyKey> {
    let rest = path.strip_prefix(KEY_PREFIX)?;
    let (org, model) = rest.split_once('/')?;
    if org.is_empty() || model.is_empty() {
        return None;
    }
    Some(PolicyKey::new(org, model))
}

fn decode(path: &str, value: &[u8]) -> Result<RoutingPolicy, RouterError> {
    serde_json::from_slice(value).map_err(|e| RouterError::PolicyParse {
        path: format!("etcd::{path}"),
        source: Box::new(e),
    })
}

impl EtcdStore {
    pub async fn connect(
        endpoints: &[String],
        connect_timeout: Duration,
    ) -> Result<Self, RouterError> {
        let options = ConnectOptions::new().with_connect_timeout(connect_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(unavailable)?;
        tracing::info!(endpoints = ?endpoints, "connected to etcd");
        Ok(Self { client })
    }

    /// Write a policy under its key path.
    pub async fn put(&self, policy: &RoutingPolicy) -> Result<(), RouterError> {
        let value = serde_json::to_vec(policy)?;
        self.client
            .clone()
            .put(key_path(&policy.key()), value, None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for EtcdStore {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn list(&self) -> Result<Vec<RoutingPolicy>, RouterError> {
        let resp = self
            .client
            .clone()
            .get(KEY_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let mut policies = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let path = kv.key_str().unwrap_or("<non-utf8>");
            match decode(path, kv.value()) {
                Ok(policy) => policies.push(policy),
                Err(e) => tracing::warn!(key = path, error = %e, "skipping undecodable policy"),
            }
        }
        Ok(policies)
    }

    async fn get(&self, key: &PolicyKey) -> Result<Option<RoutingPolicy>, RouterError> {
        let path = key_path(key);
        let resp = self
            .client
            .clone()
            .get(path.as_str(), None)
            .await
            .map_err(unavailable)?;
        resp.kvs()
            .first()
            .map(|kv| decode(&path, kv.value()))
            .transpose()
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChangeEvent>, RouterError> {
        let (mut watcher, mut stream) = self
            .client
            .clone()
            .watch(KEY_PREFIX, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            'watch: loop {
                let message = tokio::select! {
                    () = tx.closed() => break,
                    message = stream.message() => message,
                };

                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            tracing::warn!("etcd watch cancelled by server");
                            break;
                        }
                        for event in resp.events() {
                            let Some(key) = event
                                .kv()
                                .and_then(|kv| kv.key_str().ok())
                                .and_then(parse_key_path)
                            else {
                                continue;
                            };
                            if tx.send(ChangeEvent { key }).await.is_err() {
                                break 'watch;
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("etcd watch stream closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "etcd watch stream failed");
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(rx)
    }
}
