//! In-process policy store.
//!
//! For embedding the router in another process and for tests. Writes
//! notify every live subscriber. [`MemoryStore::set_available`] simulates
//! an outage: while unavailable every call fails and existing
//! subscriptions are dropped, as a lost connection would.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RouterError;
use crate::policy::model::{PolicyKey, RoutingPolicy};
use crate::policy::{ChangeEvent, PolicyStore};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
#[error("memory store is unavailable")]
struct Unavailable;

#[derive(Default)]
struct State {
    policies: HashMap<PolicyKey, RoutingPolicy>,
    available: bool,
    subscribers: Vec<mpsc::Sender<ChangeEvent>>,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                available: true,
                ..State::default()
            }),
        }
    }

    #[must_use]
    pub fn with_policies(policies: impl IntoIterator<Item = RoutingPolicy>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            state.policies = policies.into_iter().map(|p| (p.key(), p)).collect();
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `policy` as-is (no version check) and notify subscribers.
    pub fn put(&self, policy: RoutingPolicy) {
        let key = policy.key();
        let mut state = self.lock();
        state.policies.insert(key.clone(), policy);
        Self::notify_locked(&mut state, key);
    }

    pub fn delete(&self, key: &PolicyKey) {
        let mut state = self.lock();
        if state.policies.remove(key).is_some() {
            Self::notify_locked(&mut state, key.clone());
        }
    }

    /// Emit a change event without touching the data, as a replayed or
    /// duplicated watch event would.
    pub fn notify(&self, key: PolicyKey) {
        Self::notify_locked(&mut self.lock(), key);
    }

    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            state.subscribers.clear();
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    fn notify_locked(state: &mut State, key: PolicyKey) {
        state.subscribers.retain(|tx| {
            match tx.try_send(ChangeEvent { key: key.clone() }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(key = %key, "policy subscriber lagging, dropping change event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn check_available(state: &State) -> Result<(), RouterError> {
        if state.available {
            Ok(())
        } else {
            Err(RouterError::ConfigSourceUnavailable {
                store: "memory",
                source: Box::new(Unavailable),
            })
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self) -> Result<Vec<RoutingPolicy>, RouterError> {
        let state = self.lock();
        Self::check_available(&state)?;
        let mut list: Vec<RoutingPolicy> = state.policies.values().cloned().collect();
        list.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(list)
    }

    async fn get(&self, key: &PolicyKey) -> Result<Option<RoutingPolicy>, RouterError> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state.policies.get(key).cloned())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChangeEvent>, RouterError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::policy;

    #[tokio::test]
    async fn put_notifies_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe().await.unwrap();

        store.put(policy("acme", "m", 1, &[("b1", 1)]));
        assert_eq!(rx.recv().await.unwrap().key, PolicyKey::new("acme", "m"));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outage_fails_calls_and_closes_subscriptions() {
        let store = MemoryStore::with_policies([policy("acme", "m", 1, &[("b1", 1)])]);
        let mut rx = store.subscribe().await.unwrap();

        store.set_available(false);
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            store.list().await,
            Err(RouterError::ConfigSourceUnavailable { store: "memory", .. })
        ));
        assert!(store.subscribe().await.is_err());

        store.set_available(true);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_silent() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe().await.unwrap();
        store.delete(&PolicyKey::new("acme", "m"));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.subscriber_count(), 1);
    }
}
