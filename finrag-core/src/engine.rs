//! Assembled pipeline: store, index, ingestion and querying behind one handle.
//!
//! The CLI and the HTTP gateway both build an `Engine`; tests build one from
//! explicit parts with scripted providers.

use crate::chunker::Chunker;
use crate::config::RagConfig;
use crate::embeddings::{Embedder, create_embedder};
use crate::error::{RagError, StoreError};
use crate::index::{IndexStats, VectorIndex};
use crate::ingest::{IngestReport, Ingestor};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::Pipeline;
use crate::retriever::Retriever;
use crate::store::{SqliteStore, StoreCounts};
use crate::synthesizer::{GeneratorChain, Synthesizer};
use crate::tokens::TokenCounter;
use crate::types::{Document, QueryRecord, QueryRequest, QueryResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of checking the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Connected,
    Disconnected,
    /// Running without persistence.
    Disabled,
}

/// Liveness summary for `/api/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `healthy`, or `unhealthy` when the store cannot be reached.
    pub status: &'static str,
    pub database: DatabaseStatus,
    pub index_entries: usize,
    pub documents_processed: u64,
    pub embedding_model: String,
    pub providers: Vec<String>,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

/// Metrics plus index and store figures for `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub index: IndexStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreCounts>,
}

pub struct Engine {
    config: RagConfig,
    store: Option<SqliteStore>,
    index: Arc<VectorIndex>,
    metrics: Arc<PipelineMetrics>,
    ingestor: Ingestor,
    pipeline: Pipeline,
    providers: Vec<String>,
}

impl Engine {
    /// Build from configuration with the SQLite store at its configured path.
    pub fn open(config: RagConfig) -> Result<Self, RagError> {
        let path = config.store.resolve_path();
        info!(path = %path.display(), "Opening store");
        let store = SqliteStore::open(&path)?;
        Self::build(config, Some(store))
    }

    /// Build from configuration, optionally without persistence.
    pub fn build(config: RagConfig, store: Option<SqliteStore>) -> Result<Self, RagError> {
        let counter = TokenCounter::cl100k()?;
        let embedder = create_embedder(&config.embedding, &counter)?;
        let chain = GeneratorChain::from_config(&config.synthesis)?;
        Self::from_parts(config, store, embedder, chain)
    }

    /// Build around an explicit embedder and generator chain.
    ///
    /// With a store, every completed document whose embeddings match the
    /// embedder's model is loaded back into the index.
    pub fn from_parts(
        config: RagConfig,
        store: Option<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        chain: GeneratorChain,
    ) -> Result<Self, RagError> {
        config.validate()?;
        let counter = TokenCounter::cl100k()?;
        let metrics = Arc::new(PipelineMetrics::new(config.pipeline.latency_window));
        let index = Arc::new(VectorIndex::new(
            embedder.model_id(),
            embedder.dimensions(),
            config.index.clone(),
        ));
        let providers = chain
            .provider_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let chunker = Chunker::new(config.chunking.clone(), counter.clone())?
            .with_input_limit(config.embedding.max_input_tokens);
        let mut ingestor = Ingestor::new(
            chunker,
            Arc::clone(&embedder),
            Arc::clone(&index),
            config.retry.clone(),
            config.ingest.clone(),
            config.embedding.batch_size,
            Arc::clone(&metrics),
        )?;
        let retriever = Retriever::new(
            embedder,
            Arc::clone(&index),
            config.retrieval.clone(),
            config.retry.clone(),
        )?;
        let synthesizer = Synthesizer::new(chain, counter, config.synthesis.clone());
        let mut pipeline = Pipeline::new(
            retriever,
            synthesizer,
            config.pipeline.clone(),
            Arc::clone(&metrics),
        );

        if let Some(store) = &store {
            rehydrate(store, &index, &metrics)?;
            ingestor = ingestor.with_store(store.clone());
            ingestor.register(store.list_documents()?);
            pipeline = pipeline.with_query_log(Arc::new(store.clone()));
        }

        Ok(Self {
            config,
            store,
            index,
            metrics,
            ingestor,
            pipeline,
            providers,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> Option<&SqliteStore> {
        self.store.as_ref()
    }

    pub async fn ingest(&self, document: Document) -> Result<IngestReport, RagError> {
        self.ingestor.ingest(document).await
    }

    pub async fn ingest_many(&self, documents: Vec<Document>) -> Vec<Result<IngestReport, RagError>> {
        self.ingestor.ingest_many(documents).await
    }

    pub async fn delete_document(&self, id: Uuid) -> Result<usize, RagError> {
        self.ingestor.delete(id).await
    }

    /// Known documents, without their text.
    pub fn documents(&self) -> Vec<Document> {
        self.ingestor.documents()
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, RagError> {
        self.pipeline.query(request).await
    }

    /// Embed stored chunks lacking vectors from the current embedding model.
    pub async fn reembed(&self) -> Result<usize, RagError> {
        self.ingestor.reembed().await
    }

    pub async fn health(&self) -> HealthReport {
        let database = match self.store.clone() {
            None => DatabaseStatus::Disabled,
            Some(store) => match blocking(move || store.ping()).await {
                Ok(()) => DatabaseStatus::Connected,
                Err(e) => {
                    warn!(error = %e, "Store health check failed");
                    DatabaseStatus::Disconnected
                }
            },
        };
        HealthReport {
            status: if database == DatabaseStatus::Disconnected {
                "unhealthy"
            } else {
                "healthy"
            },
            database,
            index_entries: self.index.len(),
            documents_processed: self.metrics.documents_processed(),
            embedding_model: self.index.model_id().to_string(),
            providers: self.providers.clone(),
            uptime_secs: self.metrics.uptime_secs(),
            timestamp: Utc::now(),
        }
    }

    pub async fn stats(&self) -> Result<StatsReport, RagError> {
        let store = match &self.store {
            Some(store) => {
                let store = store.clone();
                Some(blocking(move || store.counts()).await?)
            }
            None => None,
        };
        Ok(StatsReport {
            metrics: self.metrics.snapshot(),
            index: self.index.stats(),
            store,
        })
    }

    /// Most recent queries first. Empty without a store.
    pub async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryRecord>, RagError> {
        let Some(store) = self.store.clone() else {
            return Ok(Vec::new());
        };
        Ok(blocking(move || store.recent_queries(limit)).await?)
    }
}

async fn blocking<T, F>(op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

fn rehydrate(
    store: &SqliteStore,
    index: &VectorIndex,
    metrics: &PipelineMetrics,
) -> Result<(), RagError> {
    let model_id = index.model_id().to_string();
    let stored = store.load_embeddings(&model_id)?;
    let loaded = stored.len();
    for entry in stored {
        index.upsert(Arc::new(entry.chunk), &entry.vector, &model_id)?;
    }

    let counts = store.counts()?;
    if counts.embeddings > loaded as u64 {
        warn!(
            stored = counts.embeddings,
            loaded,
            model = %model_id,
            "Some stored embeddings belong to another model or an unfinished document; run `finrag reembed` to index them"
        );
    }
    metrics.seed(counts.completed_documents, index.len() as u64);
    info!(
        documents = counts.completed_documents,
        chunks = index.len(),
        "Rehydrated index from store"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::embeddings::LocalEmbedder;
    use crate::generation::{Generator, MockGenerator};
    use std::time::Duration;

    const FILING: &str = "Item 7. Management's Discussion and Analysis\n\n\
        Apple revenue in fiscal 2023 was 383.3 billion dollars. Services revenue grew to a record. \
        iPhone revenue declined slightly compared with the prior year. Gross margin was 44.1 percent.";

    fn config() -> RagConfig {
        let mut config = RagConfig::default();
        config.chunking = ChunkingConfig {
            target_tokens_min: 20,
            target_tokens_max: 60,
            overlap_fraction: 0.1,
        };
        config.embedding.dimensions = 64;
        config
    }

    fn engine(store: Option<SqliteStore>) -> Engine {
        engine_with_model(store, "local-test")
    }

    fn engine_with_model(store: Option<SqliteStore>, model: &str) -> Engine {
        let counter = TokenCounter::cl100k().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(model, 64, counter));
        let chain = GeneratorChain::new(
            vec![Arc::new(MockGenerator::extractive("mock")) as Arc<dyn Generator>],
            Duration::from_secs(5),
            3,
            Duration::from_secs(30),
        );
        Engine::from_parts(config(), store, embedder, chain).unwrap()
    }

    #[tokio::test]
    async fn test_reopen_rehydrates_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finrag.db");

        let first = engine(Some(SqliteStore::open(&path).unwrap()));
        let report = first.ingest(Document::new("Apple", 2023, FILING)).await.unwrap();
        assert!(report.chunks > 0);
        drop(first);

        let second = engine(Some(SqliteStore::open(&path).unwrap()));
        assert_eq!(second.index().len(), report.chunks);
        assert_eq!(second.metrics().documents_processed(), 1);
        assert_eq!(second.documents().len(), 1);

        let response = second
            .query(&QueryRequest::new("Apple revenue 2023", 2023))
            .await
            .unwrap();
        assert!(!response.sources.is_empty());
        assert_eq!(second.recent_queries(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reembed_after_model_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finrag.db");

        let first = engine(Some(SqliteStore::open(&path).unwrap()));
        let report = first.ingest(Document::new("Apple", 2023, FILING)).await.unwrap();
        drop(first);

        let switched = engine_with_model(Some(SqliteStore::open(&path).unwrap()), "local-v2");
        assert!(switched.index().is_empty());
        assert_eq!(switched.reembed().await.unwrap(), report.chunks);
        assert_eq!(switched.index().len(), report.chunks);
        let chunks = switched.index().document_chunks(report.document_id);
        let seqs: Vec<usize> = chunks.iter().map(|c| c.sequence_index).collect();
        assert_eq!(seqs, (0..report.chunks).collect::<Vec<_>>());
        assert_eq!(switched.reembed().await.unwrap(), 0);
        let response = switched
            .query(&QueryRequest::new("Apple revenue 2023", 2023))
            .await
            .unwrap();
        assert!(!response.sources.is_empty());
        drop(switched);

        let reopened = engine_with_model(Some(SqliteStore::open(&path).unwrap()), "local-v2");
        assert_eq!(reopened.index().len(), report.chunks);
    }

    #[tokio::test]
    async fn test_reembed_without_store_is_noop() {
        let engine = engine(None);
        engine.ingest(Document::new("Apple", 2023, FILING)).await.unwrap();
        assert_eq!(engine.reembed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_store_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let engine = engine(Some(store.clone()));
        let health = engine.health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.database, DatabaseStatus::Connected);

        store.poison();
        let health = engine.health().await;
        assert_eq!(health.status, "unhealthy");
        assert_eq!(health.database, DatabaseStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_stats_include_store_counts() {
        let engine = engine(Some(SqliteStore::open_in_memory().unwrap()));
        engine.ingest(Document::new("Apple", 2023, FILING)).await.unwrap();

        let stats = engine.stats().await.unwrap();
        let store = stats.store.unwrap();
        assert_eq!(store.documents, 1);
        assert_eq!(store.chunks as usize, engine.index().len());
        assert_eq!(stats.index.live, engine.index().len());
    }

    #[tokio::test]
    async fn test_health_without_store() {
        let engine = engine(None);
        let health = engine.health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.database, DatabaseStatus::Disabled);
        assert_eq!(health.index_entries, 0);
        assert_eq!(health.providers, vec!["mock".to_string()]);
        assert!(engine.stats().await.unwrap().store.is_none());
    }
}
