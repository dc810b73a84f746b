//! Bounded log of recent routing decisions, newest last.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Decisions kept before the oldest is evicted.
pub const DEFAULT_DECISION_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub organization_id: String,
    pub model: String,
    /// Backend that served the request, or the last one tried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    /// `success`, or the error code of the failed dispatch.
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

pub struct DecisionLog {
    capacity: usize,
    entries: Mutex<VecDeque<RoutingDecision>>,
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(DEFAULT_DECISION_CAPACITY)
    }
}

impl DecisionLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, decision: RoutingDecision) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(decision);
    }

    /// Up to `limit` of the most recent decisions, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<RoutingDecision> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(n: usize) -> RoutingDecision {
        RoutingDecision {
            request_id: format!("req-{n}"),
            organization_id: "acme".into(),
            model: "m".into(),
            backend_id: Some("b1".into()),
            attempts: 1,
            latency_ms: 3,
            outcome: "success".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let log = DecisionLog::new(3);
        for n in 0..5 {
            log.push(decision(n));
        }
        assert_eq!(log.len(), 3);
        let ids: Vec<_> = log.recent(10).into_iter().map(|d| d.request_id).collect();
        assert_eq!(ids, vec!["req-2", "req-3", "req-4"]);
    }

    #[test]
    fn recent_returns_the_newest_entries() {
        let log = DecisionLog::default();
        assert!(log.is_empty());
        assert_eq!(log.capacity(), DEFAULT_DECISION_CAPACITY);
        for n in 0..DEFAULT_DECISION_CAPACITY + 1 {
            log.push(decision(n));
        }
        assert_eq!(log.len(), DEFAULT_DECISION_CAPACITY);

        let ids: Vec<_> = log.recent(2).into_iter().map(|d| d.request_id).collect();
        assert_eq!(ids, vec!["req-99", "req-100"]);
        assert!(log.recent(0).is_empty());
    }
}
