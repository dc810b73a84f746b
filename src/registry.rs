//! Backend registry: backend id to endpoint URI and per-backend timeout.
//!
//! Seeded from the static `BACKEND_ENDPOINTS` list and updated through the
//! admin API. Every registration replaces the whole table atomically so
//! dispatchers always read a consistent view.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use url::Url;

use crate::error::RouterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendEndpoint {
    pub id: String,
    pub uri: Url,
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
}

/// Whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(saturating_millis(*d))
}

impl BackendEndpoint {
    /// `{uri}{path}` with exactly one slash between them.
    #[must_use]
    pub fn join(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.uri.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn parse_uri(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid uri '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("uri '{raw}' has unsupported scheme '{other}'")),
    }
    if url.host_str().is_none() {
        return Err(format!("uri '{raw}' has no host"));
    }
    Ok(url)
}

/// Parse a comma-separated `id:uri` list. Each entry is split on the first
/// `:` only. Every malformed entry is reported.
pub fn parse_backend_list(
    list: &str,
    default_timeout: Duration,
) -> Result<Vec<BackendEndpoint>, RouterError> {
    let mut endpoints = Vec::new();
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((id, uri)) = entry.split_once(':') else {
            errors.push(format!("'{entry}': expected 'id:uri'"));
            continue;
        };
        let id = id.trim();
        if id.is_empty() {
            errors.push(format!("'{entry}': backend id cannot be empty"));
            continue;
        }
        if !seen.insert(id.to_string()) {
            errors.push(format!("'{entry}': duplicate backend id '{id}'"));
            continue;
        }
        match parse_uri(uri) {
            Ok(uri) => endpoints.push(BackendEndpoint {
                id: id.to_string(),
                uri,
                timeout: default_timeout,
            }),
            Err(e) => errors.push(format!("'{entry}': {e}")),
        }
    }

    if errors.is_empty() {
        Ok(endpoints)
    } else {
        Err(RouterError::InvalidBackendSpec(errors))
    }
}

type EndpointMap = HashMap<String, Arc<BackendEndpoint>>;

#[derive(Debug)]
pub struct BackendRegistry {
    entries: ArcSwap<EndpointMap>,
    default_timeout: Duration,
}

impl BackendRegistry {
    #[must_use]
    pub fn new(endpoints: Vec<BackendEndpoint>, default_timeout: Duration) -> Self {
        let map = endpoints
            .into_iter()
            .map(|e| (e.id.clone(), Arc::new(e)))
            .collect();
        Self {
            entries: ArcSwap::from_pointee(map),
            default_timeout,
        }
    }

    pub fn from_list(list: &str, default_timeout: Duration) -> Result<Self, RouterError> {
        Ok(Self::new(parse_backend_list(list, default_timeout)?, default_timeout))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<BackendEndpoint>> {
        self.entries.load().get(id).cloned()
    }

    /// All endpoints, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<BackendEndpoint>> {
        let mut list: Vec<_> = self.entries.load().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Register or replace a backend. Returns `true` when the id was new.
    pub fn register(
        &self,
        id: &str,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<(Arc<BackendEndpoint>, bool), RouterError> {
        let id = id.trim();
        if id.is_empty() || id.contains(',') || id.contains(':') {
            return Err(RouterError::InvalidBackendSpec(vec![format!(
                "'{id}': backend id must be non-empty and contain no ',' or ':'"
            )]));
        }
        let uri = parse_uri(uri).map_err(|e| RouterError::InvalidBackendSpec(vec![e]))?;
        let endpoint = Arc::new(BackendEndpoint {
            id: id.to_string(),
            uri,
            timeout: timeout.unwrap_or(self.default_timeout),
        });

        let previous = self.entries.rcu(|current| {
            let mut next = EndpointMap::clone(current);
            next.insert(endpoint.id.clone(), Arc::clone(&endpoint));
            next
        });
        let created = !previous.contains_key(id);
        tracing::info!(
            backend_id = %endpoint.id,
            uri = %endpoint.uri,
            timeout_ms = saturating_millis(endpoint.timeout),
            created,
            "backend registered"
        );
        Ok((endpoint, created))
    }
}
