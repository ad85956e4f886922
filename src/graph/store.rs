//! SQLite-backed vector store with two named collections.
//!
//! Documents are embedded with a deterministic feature-hashing embedder
//! (fixed 128 dimensions, L2-normalized) and scanned brute-force with
//! cosine distance. Collections are rebuilt by drop-and-recreate; upserts
//! run in batches of at most 300 rows per transaction.

use anyhow::{Context, Result};
use buildsmith_models::{ContextRecord, NodeRecord};
use rusqlite::{Connection, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// Embedding dimensionality.
pub const EMBED_DIM: usize = 128;

/// Maximum rows per upsert transaction.
const BATCH_SIZE: usize = 300;

/// Collection holding per-node documents.
pub const NODES_COLLECTION: &str = "nodes";
/// Collection holding service/community context summaries.
pub const CONTEXTS_COLLECTION: &str = "contexts";

/// A generic record to upsert into a collection.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    pub metadata: Value,
}

/// One kNN hit.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub document: String,
    /// Cosine distance in [0, 2]; 0 = identical direction.
    pub distance: f64,
    pub metadata: Value,
}

/// Metadata equality filter: the named key must hold one of the values.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    pub key: String,
    pub any_of: Vec<String>,
}

impl MetadataFilter {
    pub fn eq(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            any_of: vec![value.to_string()],
        }
    }

    pub fn one_of(key: &str, values: Vec<String>) -> Self {
        Self {
            key: key.to_string(),
            any_of: values,
        }
    }

    fn matches(&self, metadata: &Value) -> bool {
        let Some(actual) = metadata.get(&self.key) else {
            return false;
        };
        let text = match actual {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.any_of.iter().any(|v| *v == text)
    }
}

/// SQLite-backed collections of embedded documents.
pub struct VectorStore {
    conn: Mutex<Connection>,
}

impl VectorStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open vector store: {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory vector store")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS vector_records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                document TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_vr_collection
                ON vector_records(collection);
            ",
        )
        .context("Failed to create vector store schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("vector store lock poisoned")
    }

    // ------------------------------------------------------------------
    // Generic collection API
    // ------------------------------------------------------------------

    /// Upsert records, batched at 300 rows per transaction.
    pub fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let mut conn = self.lock();
        for chunk in records.chunks(BATCH_SIZE) {
            let tx = conn.transaction().context("Failed to begin upsert transaction")?;
            for record in chunk {
                let embedding = embed(&record.document);
                tx.execute(
                    "INSERT INTO vector_records (collection, id, document, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(collection, id) DO UPDATE SET
                        document = excluded.document,
                        metadata = excluded.metadata,
                        embedding = excluded.embedding",
                    params![
                        collection,
                        record.id,
                        record.document,
                        record.metadata.to_string(),
                        embedding_bytes(&embedding),
                    ],
                )
                .context("Failed to upsert vector record")?;
            }
            tx.commit().context("Failed to commit upsert transaction")?;
        }
        Ok(())
    }

    /// Filtered kNN by cosine distance, ascending.
    pub fn query(
        &self,
        collection: &str,
        query_text: &str,
        n_results: usize,
        filters: &[MetadataFilter],
    ) -> Result<Vec<QueryHit>> {
        let query_vec = embed(query_text);
        if norm(&query_vec) == 0.0 {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, document, metadata, embedding
                 FROM vector_records WHERE collection = ?1",
            )
            .context("Failed to prepare vector query")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .context("Failed to scan vector records")?;

        let mut hits: Vec<QueryHit> = Vec::new();
        for row in rows {
            let (id, document, metadata_raw, embedding_raw) = row?;
            let metadata: Value = serde_json::from_str(&metadata_raw).unwrap_or(Value::Null);
            if !filters.iter().all(|f| f.matches(&metadata)) {
                continue;
            }
            let Some(candidate) = embedding_from_bytes(&embedding_raw) else {
                continue;
            };
            if candidate.len() != query_vec.len() {
                continue;
            }
            let distance = cosine_distance(&query_vec, &candidate);
            hits.push(QueryHit {
                id,
                document,
                distance,
                metadata,
            });
        }

        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(n_results);
        Ok(hits)
    }

    /// Fetch a single record by id.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<QueryHit>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, document, metadata FROM vector_records
                 WHERE collection = ?1 AND id = ?2",
            )
            .context("Failed to prepare get")?;
        let mut rows = stmt
            .query_map(params![collection, id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to get vector record")?;
        match rows.next() {
            Some(row) => {
                let (id, document, metadata_raw) = row?;
                Ok(Some(QueryHit {
                    id,
                    document,
                    distance: 0.0,
                    metadata: serde_json::from_str(&metadata_raw).unwrap_or(Value::Null),
                }))
            }
            None => Ok(None),
        }
    }

    /// Drop every record in the collection (drop-and-recreate semantics).
    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        self.lock()
            .execute(
                "DELETE FROM vector_records WHERE collection = ?1",
                params![collection],
            )
            .context("Failed to delete collection")?;
        Ok(())
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM vector_records WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .context("Failed to count collection")?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Node / context conveniences
    // ------------------------------------------------------------------

    pub fn upsert_nodes(&self, records: &[NodeRecord]) -> Result<()> {
        let generic: Vec<VectorRecord> = records
            .iter()
            .map(|r| VectorRecord {
                id: r.id.clone(),
                document: r.document.clone(),
                metadata: serde_json::json!({
                    "node_id": r.id,
                    "node_type": r.node_type,
                    "service_name": r.service_name,
                    "language": r.language,
                    "community_id": r.community_id,
                    "pagerank": r.pagerank,
                }),
            })
            .collect();
        self.upsert(NODES_COLLECTION, &generic)
    }

    pub fn upsert_contexts(&self, records: &[ContextRecord]) -> Result<()> {
        let generic: Vec<VectorRecord> = records
            .iter()
            .map(|r| VectorRecord {
                id: r.id.clone(),
                document: r.document.clone(),
                metadata: serde_json::json!({
                    "context_type": r.context_type,
                    "service_name": r.service_name,
                    "community_id": r.community_id,
                    "node_count": r.node_count,
                    "edge_count": r.edge_count,
                }),
            })
            .collect();
        self.upsert(CONTEXTS_COLLECTION, &generic)
    }

    pub fn query_nodes(
        &self,
        query_text: &str,
        n_results: usize,
        node_types: Option<&[String]>,
        service_name: Option<&str>,
    ) -> Result<Vec<QueryHit>> {
        let mut filters = Vec::new();
        if let Some(types) = node_types
            && !types.is_empty()
        {
            filters.push(MetadataFilter::one_of("node_type", types.to_vec()));
        }
        if let Some(svc) = service_name
            && !svc.is_empty()
        {
            filters.push(MetadataFilter::eq("service_name", svc));
        }
        self.query(NODES_COLLECTION, query_text, n_results, &filters)
    }

    pub fn delete_all_nodes(&self) -> Result<()> {
        self.delete_collection(NODES_COLLECTION)
    }

    pub fn delete_all_contexts(&self) -> Result<()> {
        self.delete_collection(CONTEXTS_COLLECTION)
    }

    pub fn node_count(&self) -> Result<usize> {
        self.count(NODES_COLLECTION)
    }

    pub fn context_count(&self) -> Result<usize> {
        self.count(CONTEXTS_COLLECTION)
    }
}

// ----------------------------------------------------------------------
// Embedding
// ----------------------------------------------------------------------

/// Deterministic feature-hashing embedding: tokens hashed into a fixed
/// number of buckets with a sign bit, then L2-normalized.
pub fn embed(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; EMBED_DIM];
    for token in tokenize(text) {
        let h = fnv1a(token.as_bytes());
        let bucket = (h % EMBED_DIM as u64) as usize;
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign;
    }
    let n = norm(&vec);
    if n > 0.0 {
        for v in vec.iter_mut() {
            *v /= n as f32;
        }
    }
    vec
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na * nb)
}

fn embedding_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, document: &str, metadata: Value) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            document: document.to_string(),
            metadata,
        }
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let a = embed("File: src/auth/login.py. Language: python.");
        let b = embed("File: src/auth/login.py. Language: python.");
        assert_eq!(a, b);
        let n = norm(&a);
        assert!((n - 1.0).abs() < 1.0e-5);
    }

    #[test]
    fn identical_documents_have_zero_distance() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert("nodes", &[record("a", "login handler for auth", Value::Null)])
            .unwrap();
        let hits = store.query("nodes", "login handler for auth", 5, &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance < 1.0e-6);
    }

    #[test]
    fn closer_documents_rank_first() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(
                "nodes",
                &[
                    record("auth", "authentication login token session user", Value::Null),
                    record("orders", "order checkout cart payment invoice", Value::Null),
                ],
            )
            .unwrap();
        let hits = store
            .query("nodes", "user login authentication", 2, &[])
            .unwrap();
        assert_eq!(hits[0].id, "auth");
    }

    #[test]
    fn metadata_filters_restrict_results() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert_nodes(&[
                NodeRecord {
                    id: "file::a".to_string(),
                    document: "File: a.".to_string(),
                    node_type: "file".to_string(),
                    service_name: "auth-service".to_string(),
                    language: "python".to_string(),
                    community_id: 0,
                    pagerank: 0.1,
                },
                NodeRecord {
                    id: "service::auth".to_string(),
                    document: "Service: auth.".to_string(),
                    node_type: "service".to_string(),
                    service_name: "auth-service".to_string(),
                    language: String::new(),
                    community_id: 0,
                    pagerank: 0.5,
                },
            ])
            .unwrap();

        let only_services = store
            .query_nodes("auth", 10, Some(&["service".to_string()]), None)
            .unwrap();
        assert_eq!(only_services.len(), 1);
        assert_eq!(only_services[0].id, "service::auth");

        let by_service = store
            .query_nodes("auth", 10, None, Some("auth-service"))
            .unwrap();
        assert_eq!(by_service.len(), 2);
    }

    #[test]
    fn upsert_replaces_existing_records() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert("nodes", &[record("x", "old document", Value::Null)])
            .unwrap();
        store
            .upsert("nodes", &[record("x", "new document", Value::Null)])
            .unwrap();
        assert_eq!(store.count("nodes").unwrap(), 1);
        let hit = store.get("nodes", "x").unwrap().unwrap();
        assert_eq!(hit.document, "new document");
    }

    #[test]
    fn delete_collection_clears_only_that_collection() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert("nodes", &[record("a", "doc", Value::Null)])
            .unwrap();
        store
            .upsert("contexts", &[record("b", "ctx", Value::Null)])
            .unwrap();
        store.delete_collection("nodes").unwrap();
        assert_eq!(store.count("nodes").unwrap(), 0);
        assert_eq!(store.count("contexts").unwrap(), 1);
    }

    #[test]
    fn large_batches_are_chunked() {
        let store = VectorStore::open_in_memory().unwrap();
        let records: Vec<VectorRecord> = (0..750)
            .map(|i| record(&format!("n{i}"), &format!("document number {i}"), Value::Null))
            .collect();
        store.upsert("nodes", &records).unwrap();
        assert_eq!(store.count("nodes").unwrap(), 750);
    }
}
