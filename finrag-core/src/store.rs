//! SQLite persistence for documents, chunks, embeddings and query history.
//!
//! Chunks reference documents and embeddings reference chunks with
//! `ON DELETE CASCADE`, so deleting a document row removes everything it owns.

use crate::error::StoreError;
use crate::pipeline::QueryLog;
use crate::types::{
    Chunk, ChunkId, Document, DocumentStatus, Embedding, QueryOutcome, QueryRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    company TEXT NOT NULL,
    year INTEGER NOT NULL,
    filing_date TEXT,
    source TEXT,
    content_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (company, year)
);
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    sequence_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    char_start INTEGER NOT NULL,
    char_end INTEGER NOT NULL,
    token_count INTEGER NOT NULL,
    section TEXT NOT NULL,
    subsection TEXT,
    oversized INTEGER NOT NULL DEFAULT 0,
    degraded INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, sequence_index);
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    model_id TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS query_history (
    id TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    year INTEGER NOT NULL,
    top_k INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    confidence REAL NOT NULL,
    sources_count INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const DOCUMENT_COLUMNS: &str = "id, company, year, filing_date, source, content_hash, status, \
                                version, chunk_count, created_at, updated_at";

/// Row counts across the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreCounts {
    pub documents: u64,
    pub completed_documents: u64,
    pub chunks: u64,
    pub embeddings: u64,
    pub queries: u64,
}

/// A chunk with its stored vector, used to rebuild the in-memory index.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Shared handle to one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(corrupt("embeddings", "vector blob length is not a multiple of 4"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn corrupt(table: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table: table.to_string(),
        reason: reason.into(),
    }
}

fn parse_uuid(table: &str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| corrupt(table, format!("bad id '{value}': {e}")))
}

fn parse_time(table: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("bad timestamp '{value}': {e}")))
}

struct DocumentRow {
    id: String,
    company: String,
    year: i32,
    filing_date: Option<String>,
    source: Option<String>,
    content_hash: String,
    status: String,
    version: u32,
    chunk_count: i64,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            company: row.get(1)?,
            year: row.get(2)?,
            filing_date: row.get(3)?,
            source: row.get(4)?,
            content_hash: row.get(5)?,
            status: row.get(6)?,
            version: row.get(7)?,
            chunk_count: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_document(self) -> Result<Document, StoreError> {
        let filing_date = self
            .filing_date
            .map(|d| {
                NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .map_err(|e| corrupt("documents", format!("bad filing date '{d}': {e}")))
            })
            .transpose()?;
        Ok(Document {
            id: parse_uuid("documents", &self.id)?,
            company: self.company,
            year: self.year,
            filing_date,
            source: self.source,
            text: String::new(),
            content_hash: self.content_hash,
            status: DocumentStatus::parse(&self.status)
                .ok_or_else(|| corrupt("documents", format!("bad status '{}'", self.status)))?,
            version: self.version,
            chunk_count: self.chunk_count.max(0) as usize,
            created_at: parse_time("documents", &self.created_at)?,
            updated_at: parse_time("documents", &self.updated_at)?,
        })
    }
}

const CHUNK_COLUMNS: &str = "c.id, c.document_id, d.company, d.year, c.sequence_index, c.text, \
                             c.char_start, c.char_end, c.token_count, c.section, c.subsection, \
                             c.oversized, c.degraded";

struct ChunkRow {
    id: String,
    document_id: String,
    company: String,
    year: i32,
    sequence_index: i64,
    text: String,
    char_start: i64,
    char_end: i64,
    token_count: i64,
    section: String,
    subsection: Option<String>,
    oversized: bool,
    degraded: bool,
}

impl ChunkRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            company: row.get(2)?,
            year: row.get(3)?,
            sequence_index: row.get(4)?,
            text: row.get(5)?,
            char_start: row.get(6)?,
            char_end: row.get(7)?,
            token_count: row.get(8)?,
            section: row.get(9)?,
            subsection: row.get(10)?,
            oversized: row.get(11)?,
            degraded: row.get(12)?,
        })
    }

    fn into_chunk(self) -> Result<Chunk, StoreError> {
        Ok(Chunk {
            id: ChunkId::from(self.id),
            document_id: parse_uuid("chunks", &self.document_id)?,
            company: self.company,
            year: self.year,
            sequence_index: self.sequence_index.max(0) as usize,
            text: self.text,
            char_span: self.char_start.max(0) as usize..self.char_end.max(0) as usize,
            token_count: self.token_count.max(0) as usize,
            section: self.section,
            subsection: self.subsection,
            oversized: self.oversized,
            degraded: self.degraded,
        })
    }
}

fn write_document(conn: &Connection, doc: &Document) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO documents (id, company, year, filing_date, source, content_hash, status,
                                version, chunk_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            company = excluded.company,
            year = excluded.year,
            filing_date = excluded.filing_date,
            source = excluded.source,
            content_hash = excluded.content_hash,
            status = excluded.status,
            version = excluded.version,
            chunk_count = excluded.chunk_count,
            updated_at = excluded.updated_at",
        params![
            doc.id.to_string(),
            doc.company,
            doc.year,
            doc.filing_date.map(|d| d.format("%Y-%m-%d").to_string()),
            doc.source,
            doc.content_hash,
            doc.status.as_str(),
            doc.version,
            doc.chunk_count as i64,
            doc.created_at.to_rfc3339(),
            doc.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Open (or create) a database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let open_err = |message: String| StoreError::Open {
            path: path.to_path_buf(),
            message,
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| open_err(e.to_string()))?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert or update a document row.
    pub fn upsert_document(&self, doc: &Document) -> Result<(), StoreError> {
        let conn = self.lock()?;
        write_document(&conn, doc)
    }

    pub fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id.to_string()],
            DocumentRow::from_row,
        )
        .optional()?
        .map(DocumentRow::into_document)
        .transpose()
    }

    /// The document stored for a company and fiscal year, if any.
    pub fn find_document(&self, company: &str, year: i32) -> Result<Option<Document>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE company = ?1 AND year = ?2"),
            params![company, year],
            DocumentRow::from_row,
        )
        .optional()?
        .map(DocumentRow::into_document)
        .transpose()
    }

    pub fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY company, year"
        ))?;
        let rows = stmt
            .query_map([], DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    /// Update a document's status and, when given, its chunk count.
    pub fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        chunk_count: Option<usize>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE documents
             SET status = ?2, chunk_count = COALESCE(?3, chunk_count), updated_at = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                chunk_count.map(|n| n as i64),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Replace a document's chunks and embeddings in one transaction.
    pub fn replace_chunks(
        &self,
        document: &Document,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_document(&tx, document)?;
        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document.id.to_string()],
        )?;
        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks (id, document_id, sequence_index, text, char_start, char_end,
                                     token_count, section, subsection, oversized, degraded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for chunk in chunks {
                insert_chunk.execute(params![
                    chunk.id.as_str(),
                    chunk.document_id.to_string(),
                    chunk.sequence_index as i64,
                    chunk.text,
                    chunk.char_span.start as i64,
                    chunk.char_span.end as i64,
                    chunk.token_count as i64,
                    chunk.section,
                    chunk.subsection,
                    chunk.oversized,
                    chunk.degraded,
                ])?;
            }
            let mut insert_embedding = tx.prepare(
                "INSERT INTO embeddings (chunk_id, model_id, dimensions, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for embedding in embeddings {
                insert_embedding.execute(params![
                    embedding.chunk_id.as_str(),
                    embedding.model_id,
                    embedding.vector.len() as i64,
                    encode_vector(&embedding.vector),
                    embedding.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            document_id = %document.id,
            chunks = chunks.len(),
            embeddings = embeddings.len(),
            "Stored chunks"
        );
        Ok(())
    }

    /// Delete a document and, by cascade, its chunks and embeddings.
    pub fn delete_document(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM documents WHERE id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Chunk and embedding rows held for one document.
    pub fn document_row_counts(&self, id: Uuid) -> Result<(u64, u64), StoreError> {
        let conn = self.lock()?;
        let chunks: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![id.to_string()],
            |r| r.get(0),
        )?;
        let embeddings: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings e JOIN chunks c ON c.id = e.chunk_id
             WHERE c.document_id = ?1",
            params![id.to_string()],
            |r| r.get(0),
        )?;
        Ok((chunks as u64, embeddings as u64))
    }

    /// Stored vectors for completed documents embedded by `model_id`.
    pub fn load_embeddings(&self, model_id: &str) -> Result<Vec<StoredVector>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS}, e.vector
             FROM embeddings e
             JOIN chunks c ON c.id = e.chunk_id
             JOIN documents d ON d.id = c.document_id
             WHERE e.model_id = ?1 AND d.status = 'completed'
             ORDER BY c.document_id, c.sequence_index"
        ))?;
        let rows = stmt
            .query_map(params![model_id], |r| {
                Ok((ChunkRow::from_row(r)?, r.get::<_, Vec<u8>>(13)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(row, blob)| {
                Ok(StoredVector {
                    chunk: row.into_chunk()?,
                    vector: decode_vector(&blob)?,
                })
            })
            .collect()
    }

    /// Completed documents with at least one chunk lacking a `model_id` embedding.
    pub fn documents_missing_embeddings(&self, model_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT d.id, d.company, d.year
             FROM documents d
             JOIN chunks c ON c.document_id = d.id
             LEFT JOIN embeddings e ON e.chunk_id = c.id
             WHERE d.status = 'completed' AND (e.chunk_id IS NULL OR e.model_id != ?1)
             ORDER BY d.company, d.year",
        )?;
        let ids = stmt
            .query_map(params![model_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter().map(|id| parse_uuid("documents", id)).collect()
    }

    /// A document's chunks that have no embedding from `model_id`, in sequence order.
    pub fn chunks_missing_embeddings(
        &self,
        document_id: Uuid,
        model_id: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS}
             FROM chunks c
             JOIN documents d ON d.id = c.document_id
             LEFT JOIN embeddings e ON e.chunk_id = c.id
             WHERE c.document_id = ?1 AND (e.chunk_id IS NULL OR e.model_id != ?2)
             ORDER BY c.sequence_index"
        ))?;
        let rows = stmt
            .query_map(params![document_id.to_string(), model_id], ChunkRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ChunkRow::into_chunk).collect()
    }

    /// Insert or replace embeddings in one transaction.
    pub fn upsert_embeddings(&self, embeddings: &[Embedding]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO embeddings (chunk_id, model_id, dimensions, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                    model_id = excluded.model_id,
                    dimensions = excluded.dimensions,
                    vector = excluded.vector,
                    created_at = excluded.created_at",
            )?;
            for embedding in embeddings {
                upsert.execute(params![
                    embedding.chunk_id.as_str(),
                    embedding.model_id,
                    embedding.vector.len() as i64,
                    encode_vector(&embedding.vector),
                    embedding.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(embeddings = embeddings.len(), "Upserted embeddings");
        Ok(())
    }

    /// Round-trip a trivial query to check the connection.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        };
        Ok(StoreCounts {
            documents: count("SELECT COUNT(*) FROM documents")?,
            completed_documents: count(
                "SELECT COUNT(*) FROM documents WHERE status = 'completed'",
            )?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
            embeddings: count("SELECT COUNT(*) FROM embeddings")?,
            queries: count("SELECT COUNT(*) FROM query_history")?,
        })
    }

    pub fn record_query(&self, record: &QueryRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO query_history (id, query, year, top_k, response_time_ms, confidence,
                                        sources_count, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.query,
                record.year,
                record.top_k as i64,
                record.response_time_ms as i64,
                record.confidence as f64,
                record.sources_count as i64,
                record.outcome.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent query records, newest first.
    pub fn recent_queries(&self, limit: usize) -> Result<Vec<QueryRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, query, year, top_k, response_time_ms, confidence, sources_count,
                    outcome, created_at
             FROM query_history ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i32>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, f64>(5)?,
                    r.get::<_, i64>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, query, year, top_k, ms, confidence, sources, outcome, created)| {
                let outcome = match outcome.as_str() {
                    "answered" => QueryOutcome::Answered,
                    "no_sources" => QueryOutcome::NoSources,
                    other => {
                        return Err(corrupt("query_history", format!("bad outcome '{other}'")));
                    }
                };
                Ok(QueryRecord {
                    id: parse_uuid("query_history", &id)?,
                    query,
                    year,
                    top_k: top_k.max(0) as usize,
                    response_time_ms: ms.max(0) as u64,
                    confidence: confidence as f32,
                    sources_count: sources.max(0) as usize,
                    outcome,
                    created_at: parse_time("query_history", &created)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl QueryLog for SqliteStore {
    async fn record(&self, record: &QueryRecord) -> Result<(), StoreError> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.record_query(&record))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
