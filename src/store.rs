//! Narrow interfaces for long-term memory and task memoization.
//!
//! Both are external collaborators from the engine's point of view: the loop
//! only threads a [`Store`] into node contexts and consults a [`Cache`]
//! before executing cacheable tasks. The in-memory implementations back tests
//! and single-process deployments.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::node::ChannelWrite;
use crate::types::NS_SEP;

/// Errors from store and cache backends.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("store backend error: {message}")]
    #[diagnostic(code(stepweave::store::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Cross-thread, namespaced key-value memory.
///
/// Implementations must be thread-safe; the engine may call them from any
/// task.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Value>>;
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()>;
    async fn delete(&self, namespace: &[String], key: &str) -> Result<()>;
    /// List `(key, value)` pairs under a namespace prefix.
    async fn search(&self, namespace_prefix: &[String]) -> Result<Vec<(String, Value)>>;
}

/// Task memoization keyed by the planner-derived cache key.
#[async_trait]
pub trait Cache: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<ChannelWrite>>>;
    async fn put(&self, key: &str, writes: Vec<ChannelWrite>, ttl: Option<Duration>) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

fn join_namespace(namespace: &[String]) -> String {
    namespace.join(NS_SEP)
}

/// Volatile in-process store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<FxHashMap<(String, String), Value>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Value>> {
        let map = self.inner.read().await;
        Ok(map.get(&(join_namespace(namespace), key.to_string())).cloned())
    }

    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()> {
        let mut map = self.inner.write().await;
        map.insert((join_namespace(namespace), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<()> {
        let mut map = self.inner.write().await;
        map.remove(&(join_namespace(namespace), key.to_string()));
        Ok(())
    }

    async fn search(&self, namespace_prefix: &[String]) -> Result<Vec<(String, Value)>> {
        let prefix = join_namespace(namespace_prefix);
        let map = self.inner.read().await;
        let mut out: Vec<(String, Value)> = map
            .iter()
            .filter(|((ns, _), _)| ns == &prefix || ns.starts_with(&format!("{prefix}{NS_SEP}")))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// Volatile in-process cache with TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    inner: RwLock<FxHashMap<String, (Option<Instant>, Vec<ChannelWrite>)>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<dyn Cache> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<ChannelWrite>>> {
        let map = self.inner.read().await;
        match map.get(key) {
            Some((deadline, writes)) => {
                if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    Ok(None)
                } else {
                    Ok(Some(writes.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, writes: Vec<ChannelWrite>, ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        let mut map = self.inner.write().await;
        map.insert(key.to_string(), (deadline, writes));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut map = self.inner.write().await;
        map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_namespaced_roundtrip() {
        let store = InMemoryStore::new();
        let ns = vec!["users".to_string(), "alice".to_string()];
        store.put(&ns, "profile", json!({"age": 30})).await.unwrap();
        assert_eq!(
            store.get(&ns, "profile").await.unwrap(),
            Some(json!({"age": 30}))
        );
        let hits = store.search(&[String::from("users")]).await.unwrap();
        assert_eq!(hits.len(), 1);
        store.delete(&ns, "profile").await.unwrap();
        assert_eq!(store.get(&ns, "profile").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_expires_entries() {
        let cache = InMemoryCache::new();
        cache
            .put("k", vec![("count".into(), json!(1))], Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache
            .put("k", vec![("count".into(), json!(1))], None)
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
    }
}
