//! Durable policy cache backed by a single SQLite file.
//!
//! Holds the last-known [`RoutingPolicy`] per `{org}:{model}` key in one
//! table, `routing_policies`. The database runs in WAL mode with full
//! synchronous commits so a crash never leaves a torn record. Every write
//! replaces a whole row. Lookups are exact; the global fallback lives in
//! the dispatcher.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use super::model::{PolicyKey, RoutingPolicy};
use crate::error::RouterError;

#[derive(Clone)]
pub struct PolicyCache {
    pool: SqlitePool,
}

impl PolicyCache {
    pub async fn open(path: &Path) -> Result<Self, RouterError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS routing_policies (\
                cache_key TEXT PRIMARY KEY, \
                version INTEGER NOT NULL, \
                policy_json TEXT NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;

        tracing::debug!(path = %path.display(), "policy cache opened");
        Ok(Self { pool })
    }

    pub async fn put(&self, policy: &RoutingPolicy) -> Result<(), RouterError> {
        let json = serde_json::to_string(policy)?;
        sqlx::query(
            "INSERT INTO routing_policies (cache_key, version, policy_json) VALUES (?, ?, ?) \
             ON CONFLICT(cache_key) DO UPDATE SET \
                version = excluded.version, \
                policy_json = excluded.policy_json",
        )
        .bind(policy.key().cache_key())
        .bind(version_column(policy.version))
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        organization_id: &str,
        model: &str,
    ) -> Result<Option<RoutingPolicy>, RouterError> {
        let key = PolicyKey::new(organization_id, model);
        let row: Option<(String,)> =
            sqlx::query_as("SELECT policy_json FROM routing_policies WHERE cache_key = ?")
                .bind(key.cache_key())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(json,)| decode(&key.cache_key(), &json))
            .transpose()
    }

    /// Every cached policy. Rows that no longer decode are skipped with a
    /// warning rather than failing the whole load.
    pub async fn load_all(&self) -> Result<Vec<RoutingPolicy>, RouterError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT cache_key, policy_json FROM routing_policies ORDER BY cache_key")
                .fetch_all(&self.pool)
                .await?;

        let mut policies = Vec::with_capacity(rows.len());
        for (key, json) in rows {
            match decode(&key, &json) {
                Ok(policy) => policies.push(policy),
                Err(e) => {
                    tracing::warn!(
                        cache_key = %key,
                        error = %e,
                        "skipping undecodable cached policy"
                    );
                }
            }
        }
        Ok(policies)
    }

    pub async fn remove(&self, key: &PolicyKey) -> Result<bool, RouterError> {
        let result = sqlx::query("DELETE FROM routing_policies WHERE cache_key = ?")
            .bind(key.cache_key())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically replace the whole table with `policies`.
    pub async fn replace_all(&self, policies: &[RoutingPolicy]) -> Result<(), RouterError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM routing_policies")
            .execute(&mut *tx)
            .await?;
        for policy in policies {
            let json = serde_json::to_string(policy)?;
            sqlx::query(
                "INSERT INTO routing_policies (cache_key, version, policy_json) VALUES (?, ?, ?)",
            )
            .bind(policy.key().cache_key())
            .bind(version_column(policy.version))
            .bind(json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// SQLite integers are signed 64-bit.
#[allow(clippy::cast_possible_wrap)]
const fn version_column(version: u64) -> i64 {
    version as i64
}

fn decode(key: &str, json: &str) -> Result<RoutingPolicy, RouterError> {
    serde_json::from_str(json).map_err(|e| RouterError::PolicyParse {
        path: format!("policy-cache::{key}"),
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::policy;

    #[tokio::test]
    async fn put_then_get_returns_identical_policy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::open(&dir.path().join("cache.db")).await.unwrap();

        let mut p = policy("acme", "gpt-lite", 3, &[("b1", 100)]);
        p.updated_at = chrono::Utc::now();
        cache.put(&p).await.unwrap();

        assert_eq!(cache.get("acme", "gpt-lite").await.unwrap(), Some(p));
        assert_eq!(cache.get("*", "gpt-lite").await.unwrap(), None);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let mut p = policy("acme", "gpt-lite", 3, &[("b1", 70), ("b2", 30)]);
        p.updated_at = chrono::Utc::now();
        {
            let cache = PolicyCache::open(&path).await.unwrap();
            cache.put(&p).await.unwrap();
            cache.close().await;
        }

        let reopened = PolicyCache::open(&path).await.unwrap();
        assert_eq!(reopened.get("acme", "gpt-lite").await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn put_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::open(&dir.path().join("cache.db")).await.unwrap();

        cache.put(&policy("acme", "m", 1, &[("b1", 1), ("b2", 1)])).await.unwrap();
        cache.put(&policy("acme", "m", 2, &[("b3", 1)])).await.unwrap();

        let stored = cache.get("acme", "m").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.backend_ids(), vec!["b3".to_string()]);
        assert_eq!(cache.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_all_drops_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::open(&dir.path().join("cache.db")).await.unwrap();

        cache.put(&policy("old", "m", 1, &[("b1", 1)])).await.unwrap();
        cache
            .replace_all(&[policy("acme", "m", 1, &[("b1", 1)]), policy("*", "m", 4, &[("b2", 1)])])
            .await
            .unwrap();

        let all = cache.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(cache.get("old", "m").await.unwrap().is_none());
        assert!(cache.remove(&PolicyKey::new("acme", "m")).await.unwrap());
        assert_eq!(cache.load_all().await.unwrap().len(), 1);
    }
}
