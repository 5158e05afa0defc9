//! Per-connection executor construction.

use super::{
    InMemoryQueryStorage, QueryAccumulator, QueryCache, QueryExecutor, QueryFilter,
    QuerySanitizer, RunopsClient, RunopsSettings, TypedExecutor,
};
use crate::error::ProxyResult;
use crate::schema::DataTypeInfo;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// The full chain serving one client connection.
pub type RunopsPipeline = QueryCache<
    QuerySanitizer<QueryFilter<TypedExecutor<QueryAccumulator<RunopsClient>>>>,
    InMemoryQueryStorage,
>;

/// Creates a fresh executor for every accepted connection.
#[async_trait]
pub trait ExecutorFactory: Send + Sync + 'static {
    type Executor: QueryExecutor + 'static;

    async fn create(&self) -> ProxyResult<Self::Executor>;
}

/// Builds [`RunopsPipeline`]s for one target.
///
/// Result storage, the cacheable query set and the schema catalogue are shared
/// by every connection the factory creates.
pub struct PipelineFactory {
    settings: Arc<RunopsSettings>,
    target: String,
    type_discovery: bool,
    storage: InMemoryQueryStorage,
    cacheable: Arc<HashSet<String>>,
    schema: OnceCell<Arc<DataTypeInfo>>,
}

impl PipelineFactory {
    pub fn new(
        settings: Arc<RunopsSettings>,
        target: impl Into<String>,
        type_discovery: bool,
        cacheable: HashSet<String>,
    ) -> Self {
        Self {
            settings,
            target: target.into(),
            type_discovery,
            storage: InMemoryQueryStorage::new(),
            cacheable: Arc::new(cacheable),
            schema: OnceCell::new(),
        }
    }

    pub fn storage(&self) -> &InMemoryQueryStorage {
        &self.storage
    }

    /// Catalogue for the target, loaded by the first connection that needs it.
    async fn schema(&self) -> ProxyResult<Option<Arc<DataTypeInfo>>> {
        if !self.type_discovery {
            return Ok(None);
        }
        let schema = self
            .schema
            .get_or_try_init(|| async {
                let mut client = RunopsClient::new(self.settings.clone(), self.target.clone());
                DataTypeInfo::load(&mut client).await.map(Arc::new)
            })
            .await?;
        Ok(Some(schema.clone()))
    }
}

#[async_trait]
impl ExecutorFactory for PipelineFactory {
    type Executor = RunopsPipeline;

    async fn create(&self) -> ProxyResult<RunopsPipeline> {
        let schema = self.schema().await?;
        debug!(
            target_name = %self.target,
            typed = schema.is_some(),
            "Building query pipeline"
        );

        let client = RunopsClient::new(self.settings.clone(), self.target.clone());
        let executor = QueryAccumulator::new(client);
        let executor = TypedExecutor::new(executor, schema);
        let executor = QueryFilter::new(executor);
        let executor = QuerySanitizer::new(executor);
        Ok(QueryCache::new(
            executor,
            self.storage.clone(),
            self.cacheable.clone(),
        ))
    }
}
