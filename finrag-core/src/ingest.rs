//! Document ingestion: chunk, embed, index, persist.
//!
//! Documents are identified by company and fiscal year. Work on the same
//! document is serialized by a per-document async lock; different documents
//! proceed in parallel. Re-ingesting changed text replaces every chunk and
//! bumps the version; unchanged text is skipped. After an embedding model
//! change, `reembed` fills in vectors for stored chunks without re-chunking.

use crate::chunker::Chunker;
use crate::config::{IngestConfig, RetryConfig};
use crate::embeddings::Embedder;
use crate::error::{IndexError, PipelineError, RagError, StoreError};
use crate::index::VectorIndex;
use crate::metrics::PipelineMetrics;
use crate::retry::with_retry;
use crate::store::SqliteStore;
use crate::types::{Chunk, Document, DocumentStatus, Embedding};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Indexed,
    /// Same content hash as the completed version already indexed.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: Uuid,
    pub label: String,
    pub status: IngestStatus,
    pub chunks: usize,
    pub version: u32,
    pub elapsed_ms: u64,
}

pub struct Ingestor {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    store: Option<SqliteStore>,
    retry: RetryConfig,
    config: IngestConfig,
    batch_size: usize,
    metrics: Arc<PipelineMetrics>,
    /// Known documents by label, without their text.
    documents: Mutex<HashMap<String, Document>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        retry: RetryConfig,
        config: IngestConfig,
        batch_size: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, IndexError> {
        index.check_compatible(embedder.model_id(), embedder.dimensions())?;
        Ok(Self {
            chunker,
            embedder,
            index,
            store: None,
            retry,
            config,
            batch_size: batch_size.max(1),
            metrics,
            documents: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Persist documents, chunks and embeddings to `store`.
    pub fn with_store(mut self, store: SqliteStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Register documents already present, e.g. loaded from the store.
    pub fn register(&self, documents: impl IntoIterator<Item = Document>) {
        let mut known = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        for doc in documents {
            known.insert(doc.label(), doc);
        }
    }

    pub fn documents(&self) -> Vec<Document> {
        let known = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let mut docs: Vec<Document> = known.values().cloned().collect();
        docs.sort_by(|a, b| a.company.cmp(&b.company).then(a.year.cmp(&b.year)));
        docs
    }

    fn known(&self, label: &str) -> Option<Document> {
        let known = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        known.get(label).cloned()
    }

    fn remember(&self, document: &Document) {
        let mut stored = document.clone();
        stored.text = String::new();
        let mut known = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        known.insert(stored.label(), stored);
    }

    fn lock_for(&self, label: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(label.to_string()).or_default())
    }

    /// Run a store operation on the blocking pool. No-op without a store.
    async fn persist<F>(&self, op: F) -> Result<(), RagError>
    where
        F: FnOnce(&SqliteStore) -> Result<(), StoreError> + Send + 'static,
    {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        Ok(on_store(store, op).await?)
    }

    /// Ingest one document.
    ///
    /// On failure the document is marked `Failed` and none of its chunks stay
    /// searchable.
    pub async fn ingest(&self, document: Document) -> Result<IngestReport, RagError> {
        let started = Instant::now();
        let label = document.label();
        let lock = self.lock_for(&label);
        let _guard = lock.lock().await;

        let mut document = document;
        let mut replaced = None;
        if let Some(previous) = self.known(&label) {
            if previous.content_hash == document.content_hash
                && previous.status == DocumentStatus::Completed
            {
                info!(document = %label, "Document unchanged, skipping");
                return Ok(IngestReport {
                    document_id: previous.id,
                    label,
                    status: IngestStatus::Unchanged,
                    chunks: previous.chunk_count,
                    version: previous.version,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            if previous.status == DocumentStatus::Completed {
                replaced = Some(previous.chunk_count);
            }
            document.id = previous.id;
            document.version = previous.version + 1;
            document.created_at = previous.created_at;
        }

        document.status = DocumentStatus::Processing;
        document.chunk_count = 0;
        document.updated_at = Utc::now();
        let row = document.clone();
        self.persist(move |s| s.upsert_document(&row)).await?;
        info!(document = %label, version = document.version, "Ingesting document");

        match self.index_document(&mut document).await {
            Ok(chunks) => {
                self.remember(&document);
                if let Some(previous_chunks) = replaced {
                    self.metrics.record_document_removed(previous_chunks);
                }
                self.metrics.record_document(chunks);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(document = %label, chunks, elapsed_ms, "Document indexed");
                Ok(IngestReport {
                    document_id: document.id,
                    label,
                    status: IngestStatus::Indexed,
                    chunks,
                    version: document.version,
                    elapsed_ms,
                })
            }
            Err(e) => {
                warn!(document = %label, error = %e, "Ingestion failed");
                self.metrics.record_document_failed();
                if let Some(previous_chunks) = replaced {
                    self.metrics.record_document_removed(previous_chunks);
                }
                if let Err(cleanup) = self.index.remove_document(document.id) {
                    warn!(document = %label, error = %cleanup, "Failed to clear index entries");
                }
                document.status = DocumentStatus::Failed;
                document.chunk_count = 0;
                document.updated_at = Utc::now();
                self.remember(&document);
                let row = document.clone();
                if let Err(cleanup) = self
                    .persist(move |s| s.replace_chunks(&row, &[], &[]))
                    .await
                {
                    warn!(document = %label, error = %cleanup, "Failed to record failure");
                }
                Err(e)
            }
        }
    }

    /// Chunk, embed, index and persist. Returns the chunk count.
    async fn index_document(&self, document: &mut Document) -> Result<usize, RagError> {
        let drafts = self.chunker.chunk_document(&document.text)?;
        let chunks: Vec<Chunk> = drafts
            .into_iter()
            .map(|draft| Chunk::from_draft(document, draft))
            .collect();
        let degraded = chunks.iter().filter(|c| c.degraded).count();
        if degraded > 0 {
            warn!(document = %document.label(), degraded, "Chunked with word-level fallback");
        }

        let embeddings = self.embed_chunks(&chunks).await?;

        // Drop the previous version before inserting, in sequence order.
        self.index.remove_document(document.id)?;
        for (chunk, embedding) in chunks.iter().zip(&embeddings) {
            self.index
                .upsert(Arc::new(chunk.clone()), &embedding.vector, &embedding.model_id)?;
        }

        document.status = DocumentStatus::Completed;
        document.chunk_count = chunks.len();
        document.updated_at = Utc::now();
        let row = document.clone();
        let count = chunks.len();
        self.persist(move |s| s.replace_chunks(&row, &chunks, &embeddings))
            .await?;
        Ok(count)
    }

    /// Embed chunk texts in batches, retrying transient failures.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Embedding>, RagError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        let embedder = &self.embedder;
        for batch in texts.chunks(self.batch_size) {
            let batch_vectors =
                with_retry(&self.retry, || async move { embedder.embed(batch).await }).await?;
            debug!(batch = batch.len(), "Embedded batch");
            vectors.extend(batch_vectors);
        }

        let model_id = self.embedder.model_id().to_string();
        let now = Utc::now();
        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                chunk_id: chunk.id.clone(),
                vector,
                model_id: model_id.clone(),
                created_at: now,
            })
            .collect())
    }

    /// Embed stored chunks that have no embedding from the current model,
    /// persist the vectors and index the chunks.
    ///
    /// Returns the number of chunks embedded. No-op without a store.
    pub async fn reembed(&self) -> Result<usize, RagError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let model_id = self.embedder.model_id().to_string();
        let model = model_id.clone();
        let pending =
            on_store(store.clone(), move |s| s.documents_missing_embeddings(&model)).await?;
        if pending.is_empty() {
            info!(model = %model_id, "All stored chunks already embedded");
            return Ok(0);
        }

        let mut total = 0;
        for id in pending {
            let Some(document) = self.documents().into_iter().find(|d| d.id == id) else {
                continue;
            };
            let label = document.label();
            let lock = self.lock_for(&label);
            let _guard = lock.lock().await;

            // Re-read under the lock; a re-ingest may have replaced the chunks.
            let model = model_id.clone();
            let chunks =
                on_store(store.clone(), move |s| s.chunks_missing_embeddings(id, &model)).await?;
            if chunks.is_empty() {
                continue;
            }
            let embeddings = self.embed_chunks(&chunks).await?;
            let rows = embeddings.clone();
            on_store(store.clone(), move |s| s.upsert_embeddings(&rows)).await?;

            let count = chunks.len();
            for (chunk, embedding) in chunks.into_iter().zip(&embeddings) {
                self.index
                    .upsert(Arc::new(chunk), &embedding.vector, &embedding.model_id)?;
            }
            self.metrics.record_chunks_indexed(count);
            info!(document = %label, chunks = count, model = %model_id, "Re-embedded document");
            total += count;
        }
        Ok(total)
    }

    /// Ingest several documents with bounded parallelism.
    ///
    /// Results come back in completion order.
    pub async fn ingest_many(&self, documents: Vec<Document>) -> Vec<Result<IngestReport, RagError>> {
        futures::stream::iter(documents)
            .map(|doc| self.ingest(doc))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    /// Remove a document from the index and the store. Returns the chunks removed.
    pub async fn delete(&self, id: Uuid) -> Result<usize, RagError> {
        let Some(document) = self.documents().into_iter().find(|d| d.id == id) else {
            return Err(PipelineError::DocumentNotFound { id: id.to_string() }.into());
        };
        let label = document.label();
        let lock = self.lock_for(&label);
        let _guard = lock.lock().await;

        let removed = self.index.remove_document(id)?;
        self.persist(move |s| s.delete_document(id).map(|_| ()))
            .await?;
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&label);
        if document.status == DocumentStatus::Completed {
            self.metrics.record_document_removed(removed);
        }
        info!(document = %label, removed, "Deleted document");
        Ok(removed)
    }
}

async fn on_store<T, F>(store: SqliteStore, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, IndexConfig};
    use crate::embeddings::LocalEmbedder;
    use crate::tokens::TokenCounter;

    const DIMS: usize = 64;

    fn filing(topic: &str, sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("The {topic} segment reported figure number {i} for the fiscal year."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn ingestor(store: Option<SqliteStore>) -> (Ingestor, Arc<VectorIndex>) {
        let counter = TokenCounter::cl100k().unwrap();
        let chunker = Chunker::new(
            ChunkingConfig {
                target_tokens_min: 40,
                target_tokens_max: 80,
                overlap_fraction: 0.12,
            },
            counter.clone(),
        )
        .unwrap();
        let embedder = Arc::new(LocalEmbedder::new("local-hash-v1", DIMS, counter));
        let index = Arc::new(VectorIndex::new("local-hash-v1", DIMS, IndexConfig::default()));
        let ingestor = Ingestor::new(
            chunker,
            embedder,
            index.clone(),
            RetryConfig::default(),
            IngestConfig { concurrency: 2 },
            8,
            Arc::new(PipelineMetrics::default()),
        )
        .unwrap();
        let ingestor = match store {
            Some(store) => ingestor.with_store(store),
            None => ingestor,
        };
        (ingestor, index)
    }

    #[tokio::test]
    async fn test_ingest_indexes_and_persists() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (ingestor, index) = ingestor(Some(store.clone()));
        let report = ingestor
            .ingest(Document::new("Apple", 2023, filing("services", 30)))
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::Indexed);
        assert!(report.chunks > 1);
        assert_eq!(index.len(), report.chunks);
        let chunks = index.document_chunks(report.document_id);
        let seqs: Vec<usize> = chunks.iter().map(|c| c.sequence_index).collect();
        assert_eq!(seqs, (0..report.chunks).collect::<Vec<_>>());

        let stored = store.get_document(report.document_id).unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert_eq!(stored.chunk_count, report.chunks);
        assert_eq!(
            store.document_row_counts(report.document_id).unwrap(),
            (report.chunks as u64, report.chunks as u64)
        );
    }

    #[tokio::test]
    async fn test_reingest_unchanged_and_changed() {
        let (ingestor, index) = ingestor(None);
        let first = ingestor
            .ingest(Document::new("Apple", 2023, filing("services", 30)))
            .await
            .unwrap();
        let same = ingestor
            .ingest(Document::new("Apple", 2023, filing("services", 30)))
            .await
            .unwrap();
        assert_eq!(same.status, IngestStatus::Unchanged);
        assert_eq!(same.document_id, first.document_id);
        assert_eq!(index.len(), first.chunks);

        let changed = ingestor
            .ingest(Document::new("Apple", 2023, filing("wearables", 10)))
            .await
            .unwrap();
        assert_eq!(changed.status, IngestStatus::Indexed);
        assert_eq!(changed.document_id, first.document_id);
        assert_eq!(changed.version, 2);
        assert_eq!(index.len(), changed.chunks);
        assert!(
            index
                .document_chunks(first.document_id)
                .iter()
                .all(|c| c.text.contains("wearables"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_ingests_of_same_document_serialize() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (ingestor, index) = ingestor(Some(store.clone()));
        let (a, b) = tokio::join!(
            ingestor.ingest(Document::new("Apple", 2023, filing("services", 30))),
            ingestor.ingest(Document::new("Apple", 2023, filing("wearables", 12))),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.document_id, b.document_id);
        let mut versions = [a.version, b.version];
        versions.sort_unstable();
        assert_eq!(versions, [1, 2]);

        let last = if a.version == 2 { &a } else { &b };
        let topic = if a.version == 2 { "services" } else { "wearables" };
        let chunks = index.document_chunks(last.document_id);
        let seqs: Vec<usize> = chunks.iter().map(|c| c.sequence_index).collect();
        assert_eq!(seqs, (0..last.chunks).collect::<Vec<_>>());
        assert!(chunks.iter().all(|c| c.text.contains(topic)));
        assert_eq!(index.len(), last.chunks);

        let stored = store.get_document(last.document_id).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert_eq!(
            store.document_row_counts(last.document_id).unwrap(),
            (last.chunks as u64, last.chunks as u64)
        );
    }

    #[tokio::test]
    async fn test_empty_document_marked_failed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (ingestor, index) = ingestor(Some(store.clone()));
        let err = ingestor
            .ingest(Document::new("Apple", 2023, "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Chunk(_)));
        assert!(index.is_empty());
        let stored = store.find_document("Apple", 2023).unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn test_ingest_many_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (ingestor, index) = ingestor(Some(store.clone()));
        let docs = vec![
            Document::new("Apple", 2022, filing("iphone", 20)),
            Document::new("Apple", 2023, filing("services", 20)),
            Document::new("Microsoft", 2023, filing("cloud", 20)),
        ];
        let results = ingestor.ingest_many(docs).await;
        assert_eq!(results.len(), 3);
        let reports: Vec<IngestReport> = results.into_iter().map(Result::unwrap).collect();
        let total: usize = reports.iter().map(|r| r.chunks).sum();
        assert_eq!(index.len(), total);

        let target = reports.iter().find(|r| r.label == "Microsoft-2023").unwrap();
        let removed = ingestor.delete(target.document_id).await.unwrap();
        assert_eq!(removed, target.chunks);
        assert_eq!(index.len(), total - target.chunks);
        assert!(index.document_chunks(target.document_id).is_empty());
        assert!(store.get_document(target.document_id).unwrap().is_none());
        assert_eq!(store.document_row_counts(target.document_id).unwrap(), (0, 0));

        let err = ingestor.delete(target.document_id).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
