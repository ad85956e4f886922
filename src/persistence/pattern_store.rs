//! Semantic storage of violation patterns and fix examples.
//!
//! Backed by the same vector store machinery as the knowledge graph, with
//! two collections: `violation_patterns` and `fix_examples`. Best-effort
//! degraded mode: if the backing store cannot be opened, every method is
//! a silent no-op.

use buildsmith_models::Violation;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;

use crate::graph::store::{MetadataFilter, QueryHit, VectorStore, VectorRecord};

/// Cosine-distance ceiling under which two patterns count as the same.
const SIMILARITY_THRESHOLD: f64 = 0.3;

const VIOLATIONS_COLLECTION: &str = "violation_patterns";
const FIXES_COLLECTION: &str = "fix_examples";

/// A stored pattern returned from a similarity lookup.
#[derive(Debug, Clone)]
pub struct PatternHit {
    pub id: String,
    pub document: String,
    pub metadata: Value,
    pub distance: f64,
}

impl From<QueryHit> for PatternHit {
    fn from(hit: QueryHit) -> Self {
        Self {
            id: hit.id,
            document: hit.document,
            metadata: hit.metadata,
            distance: hit.distance,
        }
    }
}

/// Semantic pattern storage with crash-isolated methods.
pub struct PatternStore {
    store: Option<VectorStore>,
}

impl PatternStore {
    pub fn open(path: &Path) -> Self {
        match VectorStore::open(path) {
            Ok(store) => Self { store: Some(store) },
            Err(e) => {
                warn!("PatternStore init failed (degraded mode): {e:#}");
                Self { store: None }
            }
        }
    }

    pub fn open_in_memory() -> Self {
        match VectorStore::open_in_memory() {
            Ok(store) => Self { store: Some(store) },
            Err(e) => {
                warn!("PatternStore init failed (degraded mode): {e:#}");
                Self { store: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    /// Store or update a violation pattern. The id is derived from the
    /// scan code and a digest of the message, so repeats of the same
    /// pattern increment `run_count` instead of multiplying records.
    pub fn add_violation_pattern(
        &self,
        violation: &Violation,
        tech_stack: &str,
        code_context: &str,
        was_fixed: bool,
    ) {
        let Some(store) = &self.store else { return };

        let document = if code_context.is_empty() {
            violation.message.clone()
        } else {
            format!("{} | {}", violation.message, code_context)
        };
        let pattern_id = format!("{}::{}", violation.code, digest(&violation.message));

        let run_count = match store.get(VIOLATIONS_COLLECTION, &pattern_id) {
            Ok(Some(existing)) => {
                existing
                    .metadata
                    .get("run_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    + 1
            }
            Ok(None) => 1,
            Err(e) => {
                warn!("PatternStore.add_violation_pattern lookup failed: {e:#}");
                1
            }
        };

        let record = VectorRecord {
            id: pattern_id,
            document,
            metadata: json!({
                "scan_code": violation.code,
                "severity": violation.severity,
                "tech_stack": tech_stack,
                "was_fixed": if was_fixed { 1 } else { 0 },
                "run_count": run_count,
            }),
        };
        if let Err(e) = store.upsert(VIOLATIONS_COLLECTION, &[record]) {
            warn!("PatternStore.add_violation_pattern failed: {e:#}");
        }
    }

    /// Violation patterns semantically similar to `message`, filtered by
    /// tech stack, keeping only hits within the similarity threshold.
    pub fn find_similar_patterns(
        &self,
        message: &str,
        tech_stack: &str,
        limit: usize,
    ) -> Vec<PatternHit> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.query(
            VIOLATIONS_COLLECTION,
            message,
            limit,
            &[MetadataFilter::eq("tech_stack", tech_stack)],
        ) {
            Ok(hits) => hits
                .into_iter()
                .filter(|h| h.distance <= SIMILARITY_THRESHOLD)
                .map(PatternHit::from)
                .collect(),
            Err(e) => {
                warn!("PatternStore.find_similar_patterns failed: {e:#}");
                Vec::new()
            }
        }
    }

    /// Store a fix example (diff plus description) for a scan code.
    pub fn add_fix_example(&self, diff: &str, description: &str, scan_code: &str, tech_stack: &str) {
        let Some(store) = &self.store else { return };
        let document = format!("{diff}\n{description}");
        let record = VectorRecord {
            id: format!("{scan_code}::{}", digest(&document)),
            document,
            metadata: json!({
                "scan_code": scan_code,
                "tech_stack": tech_stack,
                "success": 1,
            }),
        };
        if let Err(e) = store.upsert(FIXES_COLLECTION, &[record]) {
            warn!("PatternStore.add_fix_example failed: {e:#}");
        }
    }

    /// Fix examples recorded for a scan code and tech stack.
    pub fn find_fix_examples(
        &self,
        scan_code: &str,
        tech_stack: &str,
        limit: usize,
    ) -> Vec<PatternHit> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.query(
            FIXES_COLLECTION,
            &format!("Fix for {scan_code}"),
            limit,
            &[
                MetadataFilter::eq("scan_code", scan_code),
                MetadataFilter::eq("tech_stack", tech_stack),
            ],
        ) {
            Ok(hits) => hits.into_iter().map(PatternHit::from).collect(),
            Err(e) => {
                warn!("PatternStore.find_fix_examples failed: {e:#}");
                Vec::new()
            }
        }
    }
}

/// Stable content digest for pattern ids (32 hex chars).
fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}
