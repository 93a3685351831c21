//! Process-global handle caches.
//!
//! Expensive client handles (SQL pools, HTTP sessions, NoSQL drivers) are
//! deduplicated behind two caches: a connection cache keyed by
//! `(connection_type, normalized_config)` and a session cache whose key
//! additionally includes the current thread id. The caches are the only
//! owners of a cached handle; callers must never close one directly and
//! instead route shutdown through [`close_all`].

use std::future::Future;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use sqlx::AnyPool;
use tracing::debug;

use crate::config::ConfigMap;
use crate::errors::Result;

/// A concurrent map of cache-key → handle.
///
/// Reads are lock-free (dashmap shards); insertions are serialized per shard.
pub struct HandleCache<T: Clone + Send + Sync + 'static> {
    name: &'static str,
    map: DashMap<String, T>,
}

impl<T: Clone + Send + Sync + 'static> HandleCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            map: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the cached handle for `key`, or builds one with `init`.
    ///
    /// With `reuse = false` both the lookup and the store are bypassed and a
    /// fresh handle is returned to the caller, who then owns its lifecycle.
    /// When two callers race on the same key, the first stored handle wins so
    /// equal config always resolves to the same handle afterwards.
    pub async fn get_or_try_init<F, Fut>(&self, key: &str, reuse: bool, init: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if reuse {
            if let Some(handle) = self.get(key) {
                // The key can embed credentials; log only the cache name.
                debug!(cache = self.name, "cache hit");
                return Ok(handle);
            }
        }

        let handle = init().await?;
        if !reuse {
            return Ok(handle);
        }

        let stored = self.map.entry(key.to_string()).or_insert(handle);
        Ok(stored.value().clone())
    }

    /// Drains every stored handle out of the cache.
    pub fn drain(&self) -> Vec<T> {
        let keys: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.map.remove(&k).map(|(_, v)| v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Connection cache for SQL engines (pools are internally thread-safe).
pub static SQL_ENGINES: Lazy<HandleCache<AnyPool>> = Lazy::new(|| HandleCache::new("sql_engines"));

/// Session cache for HTTP clients; keys include the calling thread id.
pub static HTTP_SESSIONS: Lazy<HandleCache<reqwest::Client>> =
    Lazy::new(|| HandleCache::new("http_sessions"));

/// Connection cache for MongoDB driver clients.
pub static MONGO_CLIENTS: Lazy<HandleCache<mongodb::Client>> =
    Lazy::new(|| HandleCache::new("mongo_clients"));

/// Canonical cache key: connection type plus the sorted `key=value` pairs of
/// the connection-identity fields. Volatile fields (timeouts, batch sizes)
/// must not be listed in `identity_fields`; secrets participate in identity
/// but the key is never logged verbatim.
pub fn normalized_key(connection_type: &str, config: &ConfigMap, identity_fields: &[&str]) -> String {
    let mut parts: Vec<String> = identity_fields
        .iter()
        .filter_map(|field| {
            config
                .get(*field)
                .map(|v| format!("{field}={}", canonical_value(v)))
        })
        .collect();
    parts.sort();
    format!("{connection_type}|{}", parts.join("|"))
}

/// Session-scoped variant of [`normalized_key`]: one handle per thread.
pub fn session_key(connection_type: &str, config: &ConfigMap, identity_fields: &[&str]) -> String {
    format!(
        "{}|{:?}",
        normalized_key(connection_type, config, identity_fields),
        std::thread::current().id()
    )
}

fn canonical_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Closes every cached handle and empties all caches.
///
/// SQL pools get an explicit `close().await`; HTTP sessions and driver
/// clients release their connections on drop.
pub async fn close_all() {
    let pools = SQL_ENGINES.drain();
    for pool in pools {
        pool.close().await;
    }

    let sessions = HTTP_SESSIONS.drain();
    drop(sessions);

    let clients = MONGO_CLIENTS.drain();
    for client in clients {
        client.shutdown().await;
    }

    debug!("handle caches closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(pairs: &[(&str, serde_json::Value)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_normalized_key_is_order_insensitive() {
        let a = config(&[("host", json!("h")), ("port", json!(5432)), ("user", json!("u"))]);
        let b = config(&[("user", json!("u")), ("host", json!("h")), ("port", json!(5432))]);
        let fields = ["host", "port", "user"];
        assert_eq!(
            normalized_key("postgres", &a, &fields),
            normalized_key("postgres", &b, &fields)
        );
    }

    #[test]
    fn test_normalized_key_ignores_non_identity_fields() {
        let a = config(&[("host", json!("h")), ("timeout_secs", json!(5))]);
        let b = config(&[("host", json!("h")), ("timeout_secs", json!(60))]);
        let fields = ["host"];
        assert_eq!(
            normalized_key("http", &a, &fields),
            normalized_key("http", &b, &fields)
        );
    }

    #[test]
    fn test_session_key_includes_thread() {
        let cfg = config(&[("base_url", json!("http://api"))]);
        let here = session_key("http", &cfg, &["base_url"]);
        let there = std::thread::spawn({
            let cfg = cfg.clone();
            move || session_key("http", &cfg, &["base_url"])
        })
        .join()
        .unwrap();
        assert_ne!(here, there);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_handle() {
        let cache: HandleCache<std::sync::Arc<String>> = HandleCache::new("test");
        let first = cache
            .get_or_try_init("k", true, || async { Ok(std::sync::Arc::new("h".to_string())) })
            .await
            .unwrap();
        let second = cache
            .get_or_try_init("k", true, || async {
                panic!("must not re-init on cache hit")
            })
            .await
            .unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_reuse_false_bypasses_lookup_and_store() {
        let cache: HandleCache<std::sync::Arc<String>> = HandleCache::new("test");
        let cached = cache
            .get_or_try_init("k", true, || async { Ok(std::sync::Arc::new("a".to_string())) })
            .await
            .unwrap();
        let fresh = cache
            .get_or_try_init("k", false, || async { Ok(std::sync::Arc::new("b".to_string())) })
            .await
            .unwrap();
        assert!(!std::sync::Arc::ptr_eq(&cached, &fresh));
        assert_eq!(cache.len(), 1);
        // The stored handle is untouched.
        assert_eq!(*cache.get("k").unwrap(), "a");
    }

    #[tokio::test]
    async fn test_close_all_empties_global_caches() {
        // Park a real pool in the engine cache, then close everything.
        let engine = crate::warehouse::DwEngine::connect("sqlite::memory:")
            .await
            .unwrap();
        assert!(!SQL_ENGINES.is_empty());
        assert!(engine.health_check().await.unwrap());

        close_all().await;
        // Other tests may repopulate the session caches concurrently; the
        // engine cache is only fed by this test within the lib binary.
        assert!(SQL_ENGINES.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties_cache() {
        let cache: HandleCache<i32> = HandleCache::new("test");
        cache
            .get_or_try_init("a", true, || async { Ok(1) })
            .await
            .unwrap();
        cache
            .get_or_try_init("b", true, || async { Ok(2) })
            .await
            .unwrap();
        let mut drained = cache.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(cache.is_empty());
    }
}
