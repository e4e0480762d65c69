//! Caching layer: month statement lists, duplicate checks and matcher results,
//! namespaced per (org, month).
//!
//! Every read may miss and every backend failure is treated as a miss. Writes
//! register their key in the namespace index so one call drops the whole
//! (org, month) namespace.

use crate::config::CacheTtlConfig;
use crate::models::{MatchCandidate, MonthStatement, PropertyMatch, StatementMonth};
use crate::services::metrics::record_cache_lookup;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

const KEY_PREFIX: &str = "expense-import";

/// Raw key/value store with TTLs and namespace indexes.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    /// Store `value` under `key` for `ttl_secs` and record `key` in `index_key`.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
        index_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Delete every key recorded in `index_key`, then the index itself.
    async fn invalidate(&self, index_key: &str) -> Result<u64, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

// =============================================================================
// Redis backend
// =============================================================================

#[derive(Clone)]
pub struct RedisCache {
    _client: Client,
    manager: ConnectionManager,
    index_ttl_secs: u64,
}

impl RedisCache {
    /// `index_ttl_secs` must cover the longest entry TTL.
    pub async fn new(url: &str, index_ttl_secs: u64) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            index_ttl_secs,
        })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache: {}", e))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
        index_key: &str,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .ignore()
            .cmd("SADD")
            .arg(index_key)
            .arg(key)
            .ignore()
            .cmd("EXPIRE")
            .arg(index_key)
            .arg(self.index_ttl_secs.max(ttl_secs))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache: {}", e))
    }

    async fn invalidate(&self, index_key: &str) -> Result<u64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(index_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read cache index: {}", e))?;

        let mut del = redis::cmd("DEL");
        del.arg(index_key);
        for member in &members {
            del.arg(member);
        }
        let _: u64 = del
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to invalidate cache: {}", e))?;

        Ok(members.len() as u64)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

// =============================================================================
// In-process backend
// =============================================================================

#[derive(Default)]
struct MemoryCacheState {
    entries: HashMap<String, (String, Instant)>,
    indexes: HashMap<String, HashSet<String>>,
}

/// TTL map used when no Redis is configured.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<MemoryCacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryCacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state()
            .entries
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let now = Instant::now();
        let mut state = self.state();
        let hit = state
            .entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone());
        if hit.is_none() {
            state.entries.remove(key);
        }
        Ok(hit)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
        index_key: &str,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.state();
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        state
            .entries
            .insert(key.to_string(), (value.to_string(), expires));
        state
            .indexes
            .entry(index_key.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn invalidate(&self, index_key: &str) -> Result<u64, anyhow::Error> {
        let mut state = self.state();
        let members = state.indexes.remove(index_key).unwrap_or_default();
        for member in &members {
            state.entries.remove(member);
        }
        Ok(members.len() as u64)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

// =============================================================================
// Typed relations
// =============================================================================

/// Cache relations of the import pipeline.
#[derive(Debug, Clone, Copy)]
pub enum Relation {
    MonthStatements,
    ExistingExpense,
    PropertyMapping,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MonthStatements => "monthStatements",
            Self::ExistingExpense => "existingExpense",
            Self::PropertyMapping => "gptMapping",
        }
    }
}

/// SHA-256 over sorted identifiers and candidates sorted by id, hex encoded.
pub fn mapping_fingerprint(
    backend: &str,
    identifiers: &[String],
    candidates: &[MatchCandidate],
) -> String {
    let mut identifiers: Vec<&str> = identifiers.iter().map(|s| s.trim()).collect();
    identifiers.sort_unstable();
    identifiers.dedup();

    let mut candidates: Vec<&MatchCandidate> = candidates.iter().collect();
    candidates.sort_by_key(|c| c.property_id);

    let mut hasher = Sha256::new();
    hasher.update(backend.as_bytes());
    hasher.update([0u8]);
    for identifier in identifiers {
        hasher.update(identifier.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([1u8]);
    for candidate in candidates {
        hasher.update(candidate.property_id.as_bytes());
        hasher.update(candidate.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(candidate.address.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn pair_digest(vendor: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vendor.as_bytes());
    hasher.update([0u8]);
    hasher.update(description.as_bytes());
    hex::encode(hasher.finalize())
}

/// Typed, fail-open view over a [`CacheStore`].
#[derive(Clone)]
pub struct ImportCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtlConfig,
}

impl ImportCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtlConfig) -> Self {
        Self { store, ttls }
    }

    pub fn namespace(org_id: Uuid, month: StatementMonth) -> String {
        format!("{}:{}:{}", KEY_PREFIX, org_id, month)
    }

    fn index_key(org_id: Uuid, month: StatementMonth) -> String {
        format!("{}:keys", Self::namespace(org_id, month))
    }

    fn key(org_id: Uuid, month: StatementMonth, relation: Relation, suffix: &str) -> String {
        format!(
            "{}:{}:{}",
            Self::namespace(org_id, month),
            relation.as_str(),
            suffix
        )
    }

    async fn read<T: DeserializeOwned>(&self, relation: Relation, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    record_cache_lookup(relation.as_str(), "hit");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "Discarding undecodable cache entry");
                    record_cache_lookup(relation.as_str(), "error");
                    None
                }
            },
            Ok(None) => {
                record_cache_lookup(relation.as_str(), "miss");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Cache read failed, treating as miss");
                record_cache_lookup(relation.as_str(), "error");
                None
            }
        }
    }

    async fn write<T: Serialize>(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(key, &raw, ttl_secs, &Self::index_key(org_id, month))
            .await
        {
            tracing::warn!(error = %e, key = %key, "Cache write failed");
        }
    }

    pub async fn get_month_statements(
        &self,
        org_id: Uuid,
        month: StatementMonth,
    ) -> Option<Vec<MonthStatement>> {
        let key = Self::key(org_id, month, Relation::MonthStatements, "all");
        self.read(Relation::MonthStatements, &key).await
    }

    pub async fn put_month_statements(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        statements: &[MonthStatement],
    ) {
        let key = Self::key(org_id, month, Relation::MonthStatements, "all");
        self.write(org_id, month, &key, &statements, self.ttls.statements_ttl_secs)
            .await
    }

    pub async fn get_expense_exists(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        vendor: &str,
        description: &str,
    ) -> Option<bool> {
        let key = Self::key(
            org_id,
            month,
            Relation::ExistingExpense,
            &pair_digest(vendor, description),
        );
        self.read(Relation::ExistingExpense, &key).await
    }

    pub async fn put_expense_exists(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        vendor: &str,
        description: &str,
        exists: bool,
    ) {
        let key = Self::key(
            org_id,
            month,
            Relation::ExistingExpense,
            &pair_digest(vendor, description),
        );
        self.write(org_id, month, &key, &exists, self.ttls.expense_ttl_secs)
            .await
    }

    pub async fn get_mapping(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        fingerprint: &str,
    ) -> Option<BTreeMap<String, PropertyMatch>> {
        let key = Self::key(org_id, month, Relation::PropertyMapping, fingerprint);
        self.read(Relation::PropertyMapping, &key).await
    }

    pub async fn put_mapping(
        &self,
        org_id: Uuid,
        month: StatementMonth,
        fingerprint: &str,
        matches: &BTreeMap<String, PropertyMatch>,
    ) {
        let key = Self::key(org_id, month, Relation::PropertyMapping, fingerprint);
        self.write(org_id, month, &key, matches, self.ttls.mapping_ttl_secs)
            .await
    }

    /// Drop every entry of the (org, month) namespace.
    pub async fn invalidate(&self, org_id: Uuid, month: StatementMonth) {
        match self.store.invalidate(&Self::index_key(org_id, month)).await {
            Ok(removed) => tracing::debug!(
                org_id = %org_id,
                month = %month,
                removed = removed,
                "Cache namespace invalidated"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                org_id = %org_id,
                month = %month,
                "Cache invalidation failed"
            ),
        }
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, anyhow::Error> {
            Err(anyhow::anyhow!("connection refused"))
        }
        async fn set(&self, _: &str, _: &str, _: u64, _: &str) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("connection refused"))
        }
        async fn invalidate(&self, _: &str) -> Result<u64, anyhow::Error> {
            Err(anyhow::anyhow!("connection refused"))
        }
        async fn health_check(&self) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    fn month() -> StatementMonth {
        "2024-06".parse().unwrap()
    }

    fn statement(name: &str) -> MonthStatement {
        MonthStatement {
            statement_id: Uuid::new_v4(),
            property_id: Uuid::new_v4(),
            property_name: name.to_string(),
            address: None,
        }
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("k", "v", 0, "idx").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "v", 60, "idx").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn invalidation_drops_the_whole_namespace_only() {
        let store = Arc::new(MemoryCache::new());
        let cache = ImportCache::new(store.clone(), CacheTtlConfig::default());
        let org = Uuid::new_v4();
        let other_month: StatementMonth = "2024-07".parse().unwrap();

        cache
            .put_month_statements(org, month(), &[statement("Sunset Villa")])
            .await;
        cache
            .put_expense_exists(org, month(), "Acme", "Cleaning", true)
            .await;
        cache
            .put_month_statements(org, other_month, &[statement("Harbor Loft")])
            .await;

        cache.invalidate(org, month()).await;

        assert!(cache.get_month_statements(org, month()).await.is_none());
        assert!(cache
            .get_expense_exists(org, month(), "Acme", "Cleaning")
            .await
            .is_none());
        assert!(cache.get_month_statements(org, other_month).await.is_some());
    }

    #[tokio::test]
    async fn backend_failures_read_as_misses() {
        let cache = ImportCache::new(Arc::new(BrokenCache), CacheTtlConfig::default());
        let org = Uuid::new_v4();

        cache
            .put_expense_exists(org, month(), "Acme", "Cleaning", true)
            .await;
        assert_eq!(
            cache
                .get_expense_exists(org, month(), "Acme", "Cleaning")
                .await,
            None
        );
        cache.invalidate(org, month()).await;
    }

    #[test]
    fn fingerprint_ignores_input_order() {
        let a = MatchCandidate {
            property_id: Uuid::new_v4(),
            name: "Sunset Villa".to_string(),
            address: Some("1 Beach Rd".to_string()),
        };
        let b = MatchCandidate {
            property_id: Uuid::new_v4(),
            name: "Harbor Loft".to_string(),
            address: None,
        };
        let ids = vec!["Sunset Vila".to_string(), "Harbour Loft".to_string()];
        let reversed: Vec<String> = ids.iter().rev().cloned().collect();

        assert_eq!(
            mapping_fingerprint("llm", &ids, &[a.clone(), b.clone()]),
            mapping_fingerprint("llm", &reversed, &[b.clone(), a.clone()])
        );
        assert_ne!(
            mapping_fingerprint("llm", &ids, &[a.clone(), b.clone()]),
            mapping_fingerprint("similarity", &ids, &[a, b])
        );
    }

    #[test]
    fn keys_live_under_the_namespace() {
        let org = Uuid::nil();
        let key = ImportCache::key(org, month(), Relation::MonthStatements, "all");
        assert_eq!(
            key,
            "expense-import:00000000-0000-0000-0000-000000000000:2024-06:monthStatements:all"
        );
        assert_eq!(
            ImportCache::index_key(org, month()),
            "expense-import:00000000-0000-0000-0000-000000000000:2024-06:keys"
        );
    }
}
