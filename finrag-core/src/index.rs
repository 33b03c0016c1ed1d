//! In-memory HNSW vector index over chunk embeddings.
//!
//! Vectors are L2-normalized on write so similarity is a dot product.
//! Metadata filters are applied inside the graph traversal: nodes that fail
//! the filter are still used for navigation but never admitted to results.
//! Small filtered sets are scanned exactly, and a traversal that comes back
//! short is topped up by exact scan, so filtering never starves a query.

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::types::{Chunk, ChunkId, QueryFilters};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

const MAX_LEVEL: usize = 16;
/// Tombstone count above which a removal triggers a rebuild.
const COMPACT_MIN_TOMBSTONES: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// An entry with the same chunk id was superseded.
    Replaced,
    /// Identical vector and metadata were already present.
    Unchanged,
}

/// How a search was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    Exact,
    Graph,
    /// Graph traversal came back short and was completed by exact scan.
    GraphWithTopUp,
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Arc<Chunk>,
    pub similarity: f32,
}

impl SearchHit {
    pub fn chunk_id(&self) -> &ChunkId {
        &self.chunk.id
    }
}

/// Hits plus the strategy that produced them.
#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub strategy: SearchStrategy,
}

/// Point-in-time index counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct IndexStats {
    pub live: usize,
    pub tombstones: usize,
    pub max_level: usize,
}

/// Ranking order: similarity descending, then sequence index, then chunk id.
pub fn rank_order(a_sim: f32, a: &Chunk, b_sim: f32, b: &Chunk) -> Ordering {
    b_sim
        .total_cmp(&a_sim)
        .then_with(|| a.sequence_index.cmp(&b.sequence_index))
        .then_with(|| a.id.cmp(&b.id))
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    sim: f32,
    id: usize,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .total_cmp(&other.sim)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug)]
struct Node {
    chunk: Arc<Chunk>,
    vector: Vec<f32>,
    links: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Params {
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ml: f64,
}

#[derive(Debug)]
struct Graph {
    nodes: Vec<Node>,
    by_chunk: HashMap<ChunkId, usize>,
    entry: Option<usize>,
    max_level: usize,
    live: usize,
    rng: StdRng,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &[f32]) -> Result<Vec<f32>, IndexError> {
    if v.iter().any(|x| !x.is_finite()) {
        return Err(IndexError::InvalidVector {
            reason: "contains NaN or infinite components".into(),
        });
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return Err(IndexError::InvalidVector {
            reason: "zero-length vector".into(),
        });
    }
    Ok(v.iter().map(|x| x / norm).collect())
}

impl Graph {
    fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            by_chunk: HashMap::new(),
            entry: None,
            max_level: 0,
            live: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sim(&self, q: &[f32], id: usize) -> f32 {
        dot(q, &self.nodes[id].vector)
    }

    fn links(&self, id: usize, level: usize) -> &[usize] {
        self.nodes[id]
            .links
            .get(level)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn random_level(&mut self, ml: f64) -> usize {
        let u: f64 = 1.0 - self.rng.r#gen::<f64>();
        ((-u.ln() * ml).floor() as usize).min(MAX_LEVEL)
    }

    fn greedy_closest(&self, q: &[f32], mut ep: usize, level: usize) -> usize {
        let mut best = self.sim(q, ep);
        loop {
            let mut changed = false;
            for &n in self.links(ep, level) {
                let s = self.sim(q, n);
                if s > best {
                    best = s;
                    ep = n;
                    changed = true;
                }
            }
            if !changed {
                return ep;
            }
        }
    }

    /// Beam search on one layer. Only nodes passing `admit` enter the results.
    fn search_layer(
        &self,
        q: &[f32],
        entry: &[usize],
        ef: usize,
        level: usize,
        admit: &dyn Fn(usize) -> bool,
    ) -> Vec<Scored> {
        let mut visited: HashSet<usize> = entry.iter().copied().collect();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for &ep in entry {
            let s = Scored {
                sim: self.sim(q, ep),
                id: ep,
            };
            candidates.push(s);
            if admit(ep) {
                results.push(Reverse(s));
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(current) = candidates.pop() {
            if results.len() >= ef
                && let Some(Reverse(worst)) = results.peek()
                && current.sim < worst.sim
            {
                break;
            }
            for &n in self.links(current.id, level) {
                if !visited.insert(n) {
                    continue;
                }
                let s = Scored {
                    sim: self.sim(q, n),
                    id: n,
                };
                let worst = results.peek().map(|Reverse(w)| w.sim);
                if results.len() < ef || worst.is_none_or(|w| s.sim > w) {
                    candidates.push(s);
                    if admit(n) {
                        results.push(Reverse(s));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    fn prune(&mut self, n: usize, level: usize, m_max: usize) {
        let mut scored: Vec<Scored> = self.nodes[n].links[level]
            .iter()
            .map(|&x| Scored {
                sim: dot(&self.nodes[n].vector, &self.nodes[x].vector),
                id: x,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(m_max);
        self.nodes[n].links[level] = scored.into_iter().map(|s| s.id).collect();
    }

    fn insert(&mut self, chunk: Arc<Chunk>, vector: Vec<f32>, p: &Params) -> usize {
        let level = self.random_level(p.ml);
        let id = self.nodes.len();
        self.by_chunk.insert(chunk.id.clone(), id);
        self.nodes.push(Node {
            chunk,
            vector,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.live += 1;

        let Some(mut ep) = self.entry else {
            self.entry = Some(id);
            self.max_level = level;
            return id;
        };

        let q = self.nodes[id].vector.clone();
        for l in ((level + 1)..=self.max_level).rev() {
            ep = self.greedy_closest(&q, ep, l);
        }

        let mut eps = vec![ep];
        for l in (0..=level.min(self.max_level)).rev() {
            let found = {
                let nodes = &self.nodes;
                self.search_layer(&q, &eps, p.ef_construction, l, &|n| {
                    n != id && !nodes[n].deleted
                })
            };
            let m_max = if l == 0 { p.m_max0 } else { p.m };
            let neighbors: Vec<usize> = found.iter().take(p.m).map(|s| s.id).collect();
            for &n in &neighbors {
                self.nodes[n].links[l].push(id);
                if self.nodes[n].links[l].len() > m_max {
                    self.prune(n, l, m_max);
                }
            }
            self.nodes[id].links[l] = neighbors;
            if !found.is_empty() {
                eps = found.iter().map(|s| s.id).collect();
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(id);
        }
        id
    }

    fn tombstone(&mut self, id: usize) {
        let node = &mut self.nodes[id];
        if !node.deleted {
            node.deleted = true;
            self.by_chunk.remove(&node.chunk.id);
            self.live -= 1;
        }
    }

    /// Reinsert every live node into a fresh graph.
    fn rebuild(&mut self, p: &Params) {
        let live: Vec<(Arc<Chunk>, Vec<f32>)> = self
            .nodes
            .drain(..)
            .filter(|n| !n.deleted)
            .map(|n| (n.chunk, n.vector))
            .collect();
        self.by_chunk.clear();
        self.entry = None;
        self.max_level = 0;
        self.live = 0;
        for (chunk, vector) in live {
            self.insert(chunk, vector, p);
        }
    }

    fn exact(&self, q: &[f32], allowed: &[usize]) -> Vec<Scored> {
        allowed
            .iter()
            .map(|&id| Scored {
                sim: self.sim(q, id),
                id,
            })
            .collect()
    }

    fn search(
        &self,
        q: &[f32],
        filters: &QueryFilters,
        k: usize,
        ef: usize,
    ) -> (Vec<Scored>, SearchStrategy) {
        if k == 0 || self.live == 0 {
            return (Vec::new(), SearchStrategy::Exact);
        }
        let allowed: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted && filters.matches(&n.chunk))
            .map(|(id, _)| id)
            .collect();

        let ef = ef.max(k);
        let Some(mut ep) = self.entry else {
            return (self.exact(q, &allowed), SearchStrategy::Exact);
        };
        if allowed.len() <= ef {
            return (self.exact(q, &allowed), SearchStrategy::Exact);
        }

        let mut mask = vec![false; self.nodes.len()];
        for &id in &allowed {
            mask[id] = true;
        }
        for l in (1..=self.max_level).rev() {
            ep = self.greedy_closest(q, ep, l);
        }
        let mut found = self.search_layer(q, &[ep], ef, 0, &|n| mask[n]);

        let want = k.min(allowed.len());
        if found.len() < want {
            let have: HashSet<usize> = found.iter().map(|s| s.id).collect();
            found.extend(
                self.exact(q, &allowed)
                    .into_iter()
                    .filter(|s| !have.contains(&s.id)),
            );
            return (found, SearchStrategy::GraphWithTopUp);
        }
        (found, SearchStrategy::Graph)
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Thread-safe vector index bound to one embedding model.
///
/// Searches take a read lock and writes take a write lock, so queries can run
/// while ingestion upserts; a search sees the index as of when it started.
#[derive(Debug)]
pub struct VectorIndex {
    model_id: String,
    dimensions: usize,
    config: IndexConfig,
    params: Params,
    graph: RwLock<Graph>,
}

impl VectorIndex {
    pub fn new(model_id: impl Into<String>, dimensions: usize, config: IndexConfig) -> Self {
        let m = config.m.max(2);
        let params = Params {
            m,
            m_max0: m * 2,
            ef_construction: config.ef_construction.max(m),
            ml: 1.0 / (m as f64).ln(),
        };
        Self {
            model_id: model_id.into(),
            dimensions,
            graph: RwLock::new(Graph::new(config.seed)),
            config,
            params,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn ef_search(&self) -> usize {
        self.config.ef_search
    }

    /// Check that vectors from `model_id` with `dimensions` may be used here.
    pub fn check_compatible(&self, model_id: &str, dimensions: usize) -> Result<(), IndexError> {
        if model_id != self.model_id {
            return Err(IndexError::ModelMismatch {
                expected: self.model_id.clone(),
                actual: model_id.to_string(),
            });
        }
        if dimensions != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: dimensions,
            });
        }
        Ok(())
    }

    /// Insert or replace the vector for a chunk.
    pub fn upsert(
        &self,
        chunk: Arc<Chunk>,
        vector: &[f32],
        model_id: &str,
    ) -> Result<UpsertOutcome, IndexError> {
        self.check_compatible(model_id, vector.len())?;
        let vector = normalize(vector)?;
        let mut graph = self.graph.write().map_err(|_| IndexError::Poisoned)?;

        let outcome = match graph.by_chunk.get(&chunk.id).copied() {
            Some(existing) => {
                let node = &graph.nodes[existing];
                if node.vector == vector && *node.chunk == *chunk {
                    return Ok(UpsertOutcome::Unchanged);
                }
                graph.tombstone(existing);
                UpsertOutcome::Replaced
            }
            None => UpsertOutcome::Inserted,
        };
        graph.insert(chunk, vector, &self.params);
        Ok(outcome)
    }

    /// Remove every chunk of a document. Returns how many were removed.
    pub fn remove_document(&self, document_id: Uuid) -> Result<usize, IndexError> {
        let mut graph = self.graph.write().map_err(|_| IndexError::Poisoned)?;
        let ids: Vec<usize> = graph
            .by_chunk
            .values()
            .copied()
            .filter(|&id| graph.nodes[id].chunk.document_id == document_id)
            .collect();
        for &id in &ids {
            graph.tombstone(id);
        }

        let tombstones = graph.nodes.len() - graph.live;
        if graph.live == 0 || (tombstones >= COMPACT_MIN_TOMBSTONES && tombstones > graph.live) {
            debug!(live = graph.live, tombstones, "Compacting vector index");
            graph.rebuild(&self.params);
        }
        if !ids.is_empty() {
            info!(%document_id, removed = ids.len(), "Removed document from index");
        }
        Ok(ids.len())
    }

    /// Top-`k` chunks by cosine similarity using the default beam width.
    pub fn search(
        &self,
        query: &[f32],
        filters: &QueryFilters,
        k: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        Ok(self
            .search_with_ef(query, filters, k, self.config.ef_search)?
            .hits)
    }

    /// Top-`k` search with an explicit beam width. Larger `ef` trades latency for recall.
    ///
    /// Returns every matching chunk when fewer than `k` pass the filters.
    pub fn search_with_ef(
        &self,
        query: &[f32],
        filters: &QueryFilters,
        k: usize,
        ef: usize,
    ) -> Result<SearchResults, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        let q = normalize(query)?;
        let graph = self.graph.read().map_err(|_| IndexError::Poisoned)?;
        let (scored, strategy) = graph.search(&q, filters, k, ef.max(1));

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .map(|s| SearchHit {
                chunk: Arc::clone(&graph.nodes[s.id].chunk),
                similarity: s.sim.clamp(-1.0, 1.0),
            })
            .collect();
        drop(graph);

        hits.sort_by(|a, b| rank_order(a.similarity, &a.chunk, b.similarity, &b.chunk));
        hits.truncate(k);
        debug!(k, returned = hits.len(), ?strategy, "Index search");
        Ok(SearchResults { hits, strategy })
    }

    /// Live chunks belonging to a document, in sequence order.
    pub fn document_chunks(&self, document_id: Uuid) -> Vec<Arc<Chunk>> {
        let Ok(graph) = self.graph.read() else {
            return Vec::new();
        };
        let mut chunks: Vec<Arc<Chunk>> = graph
            .by_chunk
            .values()
            .map(|&id| &graph.nodes[id].chunk)
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.sequence_index);
        chunks
    }

    pub fn len(&self) -> usize {
        self.graph.read().map(|g| g.live).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        self.graph
            .read()
            .map(|g| IndexStats {
                live: g.live,
                tombstones: g.nodes.len() - g.live,
                max_level: g.max_level,
            })
            .unwrap_or(IndexStats {
                live: 0,
                tombstones: 0,
                max_level: 0,
            })
    }
}
