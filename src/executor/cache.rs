//! Result cache for queries GUI clients repeat on every connection.
//!
//! Only queries listed as cacheable are stored. Storage is shared by every
//! connection to the same target, so introspection queries fired on connect
//! hit runops once per process lifetime.

use super::{QueryExecutor, ResultSet};
use crate::error::ProxyResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Backing store for cached results.
pub trait QueryStorage: Send + Sync {
    fn store(&self, query: &str, result: ResultSet);
    fn get(&self, query: &str) -> Option<ResultSet>;
}

/// Process-wide in-memory storage; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueryStorage {
    entries: Arc<DashMap<String, ResultSet>>,
}

impl InMemoryQueryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl QueryStorage for InMemoryQueryStorage {
    fn store(&self, query: &str, result: ResultSet) {
        self.entries.insert(query.to_string(), result);
    }

    fn get(&self, query: &str) -> Option<ResultSet> {
        self.entries.get(query).map(|entry| entry.value().clone())
    }
}

pub struct QueryCache<T, S> {
    executor: T,
    storage: S,
    queries_to_cache: Arc<HashSet<String>>,
}

impl<T, S> QueryCache<T, S> {
    pub fn new(executor: T, storage: S, queries_to_cache: Arc<HashSet<String>>) -> Self {
        Self {
            executor,
            storage,
            queries_to_cache,
        }
    }
}

#[async_trait]
impl<T, S> QueryExecutor for QueryCache<T, S>
where
    T: QueryExecutor,
    S: QueryStorage,
{
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        let key = query.trim();
        if let Some(result) = self.storage.get(key) {
            debug!(rows = result.rows.len(), "Serving query from cache");
            return Ok(Some(result));
        }

        let result = self.executor.query(query).await?;
        if let Some(result) = &result {
            if self.queries_to_cache.contains(key) {
                debug!(rows = result.rows.len(), "Caching query result");
                self.storage.store(key, result.clone());
            }
        }
        Ok(result)
    }
}
