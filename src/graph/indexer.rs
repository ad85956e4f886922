//! Five-phase build pipeline for the knowledge graph.
//!
//! Phases:
//!   1. Load source data (service map, domain model, contracts, prior
//!      snapshot) with independently guarded reads
//!   2. Build the base graph (files, symbols, services, dependency edges)
//!   3. Attach contracts, endpoints, events, and domain entities
//!   4. Compute PageRank and communities, embed node/context records
//!   5. Derive service-level edges and persist a snapshot row
//!
//! Every phase is fault-tolerant: individual failures accumulate into the
//! result's `errors` list instead of aborting the build.

use anyhow::{Context, Result};
use buildsmith_models::{
    ContextRecord, DomainModel, EdgeKind, GraphBuildResult, NodeKind, NodeRecord, ServiceMap,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info};

use crate::graph::knowledge::{Attrs, KnowledgeGraph};
use crate::graph::store::VectorStore;

/// Source relation strings mapped onto edge kinds; `uses` is a weaker
/// form of `calls`.
fn map_relation(relation: &str) -> EdgeKind {
    match relation {
        "calls" | "uses" => EdgeKind::Calls,
        "inherits" => EdgeKind::Inherits,
        "implements" => EdgeKind::Implements,
        _ => EdgeKind::Imports,
    }
}

/// Suffixes stripped when matching symbols to domain entities.
const SYMBOL_SUFFIXES: [&str; 7] = [
    "Service",
    "Model",
    "Schema",
    "Entity",
    "Repository",
    "Controller",
    "Handler",
];

/// Shared-utility path fragments skipped when deriving service edges.
const SHARED_UTILITY_PATTERNS: [&str; 5] = ["shared/", "common/", "utils/", "lib/", "helpers/"];

// ----------------------------------------------------------------------
// Source data
// ----------------------------------------------------------------------

/// One symbol row from the code-intelligence store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SymbolRow {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub symbol_name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub line_start: u32,
    #[serde(default)]
    pub line_end: u32,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub docstring: String,
}

/// One symbol-to-symbol dependency row.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DependencyRow {
    #[serde(default)]
    pub source_symbol_id: String,
    #[serde(default)]
    pub target_symbol_id: String,
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub target_file: String,
    #[serde(default)]
    pub line: u32,
}

/// One registered contract.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: String,
}

/// Declared endpoint handler within a service interface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointDecl {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub handler: String,
}

/// Runtime-provided interface of one service (name-only events).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceInterface {
    #[serde(default)]
    pub endpoints: Vec<EndpointDecl>,
    #[serde(default)]
    pub events_published: Vec<String>,
    #[serde(default)]
    pub events_consumed: Vec<String>,
}

/// Everything phase 1 loads for graph construction.
#[derive(Debug, Clone, Default)]
pub struct SourceData {
    pub existing_graph_json: Option<String>,
    pub symbols: Vec<SymbolRow>,
    pub dependency_edges: Vec<DependencyRow>,
    pub service_map: Option<ServiceMap>,
    pub domain_model: Option<DomainModel>,
    pub contracts: Vec<ContractRow>,
    pub service_interfaces: BTreeMap<String, ServiceInterface>,
    pub errors: Vec<String>,
}

impl SourceData {
    /// Load source data from pipeline artifacts. Each read is guarded
    /// independently; failures accumulate into `errors`.
    pub fn load(
        service_map_path: Option<&Path>,
        domain_model_path: Option<&Path>,
        contracts_dir: Option<&Path>,
        service_interfaces: BTreeMap<String, ServiceInterface>,
    ) -> Self {
        let mut source = SourceData {
            service_interfaces,
            ..SourceData::default()
        };

        if let Some(path) = service_map_path {
            match read_json::<ServiceMap>(path) {
                Ok(map) => source.service_map = Some(map),
                Err(e) => source.errors.push(format!("Failed to load service map: {e:#}")),
            }
        }

        if let Some(path) = domain_model_path {
            match read_json::<DomainModel>(path) {
                Ok(model) => source.domain_model = Some(model),
                Err(e) => source.errors.push(format!("Failed to load domain model: {e:#}")),
            }
        }

        if let Some(dir) = contracts_dir {
            match read_contracts_dir(dir) {
                Ok(contracts) => source.contracts = contracts,
                Err(e) => source.errors.push(format!("Failed to load contracts: {e:#}")),
            }
        }

        source
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Read every non-deprecated `{service}.json` contract in the registry.
fn read_contracts_dir(dir: &Path) -> Result<Vec<ContractRow>> {
    let mut contracts = Vec::new();
    if !dir.exists() {
        return Ok(contracts);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read contracts dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    for path in paths {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if stem == "stubs" {
            continue;
        }
        let spec: Value = match read_json(&path) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let contract_type = if spec.get("asyncapi").is_some() {
            "asyncapi"
        } else {
            "openapi"
        };
        let status = spec
            .get("info")
            .and_then(|i| i.get("x-status"))
            .and_then(Value::as_str)
            .unwrap_or("active")
            .to_string();
        if status == "deprecated" {
            continue;
        }
        contracts.push(ContractRow {
            id: stem.clone(),
            contract_type: contract_type.to_string(),
            version: spec
                .get("info")
                .and_then(|i| i.get("version"))
                .and_then(Value::as_str)
                .unwrap_or("1.0.0")
                .to_string(),
            service_name: stem,
            spec,
            status,
        });
    }
    Ok(contracts)
}

// ----------------------------------------------------------------------
// Snapshot database
// ----------------------------------------------------------------------

/// A persisted snapshot row.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub graph_json: String,
    pub node_count: usize,
    pub edge_count: usize,
    pub community_count: usize,
    pub services_indexed: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// SQLite store for graph snapshots.
pub struct GraphDb {
    conn: Mutex<Connection>,
}

impl GraphDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open graph database: {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory graph database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .lock()
            .expect("graph db lock poisoned")
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS graph_snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    snapshot_data TEXT NOT NULL,
                    node_count INTEGER NOT NULL DEFAULT 0,
                    edge_count INTEGER NOT NULL DEFAULT 0,
                    community_count INTEGER NOT NULL DEFAULT 0,
                    services_indexed TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );
                ",
            )
            .context("Failed to create graph snapshot schema")?;
        Ok(())
    }

    pub fn insert_snapshot(&self, row: &SnapshotRow) -> Result<()> {
        self.conn
            .lock()
            .expect("graph db lock poisoned")
            .execute(
                "INSERT INTO graph_snapshots
                    (snapshot_data, node_count, edge_count, community_count,
                     services_indexed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.graph_json,
                    row.node_count as i64,
                    row.edge_count as i64,
                    row.community_count as i64,
                    serde_json::to_string(&row.services_indexed)?,
                    row.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert graph snapshot")?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<SnapshotRow>> {
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT snapshot_data, node_count, edge_count, community_count,
                        services_indexed, created_at
                 FROM graph_snapshots ORDER BY id DESC LIMIT 1",
            )
            .context("Failed to prepare snapshot query")?;
        let mut rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query latest snapshot")?;
        match rows.next() {
            Some(row) => {
                let (graph_json, nodes, edges, communities, services_raw, created_raw) = row?;
                Ok(Some(SnapshotRow {
                    graph_json,
                    node_count: nodes as usize,
                    edge_count: edges as usize,
                    community_count: communities as usize,
                    services_indexed: serde_json::from_str(&services_raw).unwrap_or_default(),
                    created_at: DateTime::parse_from_rfc3339(&created_raw)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }))
            }
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------
// Indexer
// ----------------------------------------------------------------------

/// Builds the unified knowledge graph from cross-service data sources.
pub struct GraphRagIndexer {
    kg: Arc<RwLock<KnowledgeGraph>>,
    store: Arc<VectorStore>,
    db: Arc<GraphDb>,
}

impl GraphRagIndexer {
    pub fn new(kg: Arc<RwLock<KnowledgeGraph>>, store: Arc<VectorStore>, db: Arc<GraphDb>) -> Self {
        Self { kg, store, db }
    }

    pub fn db(&self) -> &GraphDb {
        &self.db
    }

    /// Execute the full five-phase build.
    pub fn build(&self, source: &SourceData) -> GraphBuildResult {
        let started = Instant::now();
        let mut errors: Vec<String> = source.errors.clone();

        info!("Phase 1/5: loading existing data");
        // The seed graph comes from the external code-intelligence store;
        // our own snapshot table is write-only output here.
        let prior_graph = source.existing_graph_json.clone();

        info!("Phase 2/5: building base graph");
        errors.extend(self.build_base_graph(source, prior_graph.as_deref()));

        info!("Phase 3/5: adding contracts and entity nodes");
        errors.extend(self.add_contract_and_entity_nodes(source));

        info!("Phase 4/5: computing metrics and embedding");
        let communities = {
            let (phase_errors, communities) = self.compute_metrics_and_embed();
            errors.extend(phase_errors);
            communities
        };

        info!("Phase 5/5: deriving service edges and persisting snapshot");
        errors.extend(self.persist_snapshot());

        let kg = self.kg.read().expect("graph lock poisoned");
        let result = GraphBuildResult {
            success: errors.is_empty(),
            node_count: kg.node_count(),
            edge_count: kg.edge_count(),
            node_types: count_by_attr(&kg, "node_type"),
            edge_types: count_edge_types(&kg),
            community_count: communities,
            build_time_ms: started.elapsed().as_millis() as u64,
            services_indexed: collect_services(&kg),
            errors,
        };
        info!(
            "Graph build complete: {} nodes, {} edges, {} communities, {} errors in {}ms",
            result.node_count,
            result.edge_count,
            result.community_count,
            result.errors.len(),
            result.build_time_ms
        );
        result
    }

    // ------------------------------------------------------------------
    // Phase 2
    // ------------------------------------------------------------------

    fn build_base_graph(&self, source: &SourceData, prior_graph: Option<&str>) -> Vec<String> {
        let mut errors = Vec::new();
        let mut kg = self.kg.write().expect("graph lock poisoned");
        kg.clear();

        // Seed from the prior snapshot when present.
        if let Some(raw) = prior_graph
            && let Err(e) = kg.from_json(raw)
        {
            errors.push(format!("Failed to seed from prior snapshot: {e:#}"));
            kg.clear();
        }
        // File nodes from the snapshot keep a conservative default type.
        let untyped: Vec<String> = kg
            .nodes()
            .filter(|(_, attrs)| !attrs.contains_key("node_type"))
            .map(|(id, _)| id.to_string())
            .collect();
        for id in untyped {
            kg.set_attr(&id, "node_type", json!("file"));
        }

        // Attach service names to file nodes from the symbol table.
        let mut symbols_by_file: BTreeMap<&str, Vec<&SymbolRow>> = BTreeMap::new();
        for sym in &source.symbols {
            symbols_by_file.entry(sym.file_path.as_str()).or_default().push(sym);
        }
        for (file_path, syms) in &symbols_by_file {
            let file_node = format!("file::{file_path}");
            if kg.contains(&file_node)
                && let Some(svc) = syms.first().map(|s| s.service_name.as_str())
                && !svc.is_empty()
            {
                kg.set_attr(&file_node, "service_name", json!(svc));
            }
        }

        // Service nodes plus CONTAINS_FILE edges.
        if let Some(map) = &source.service_map {
            for service in &map.services {
                if service.service_id.is_empty() {
                    continue;
                }
                let svc_node = format!("service::{}", service.service_id);
                kg.add_node(
                    &svc_node,
                    [
                        ("node_type".to_string(), json!(NodeKind::Service.as_str())),
                        ("service_name".to_string(), json!(service.service_id)),
                        ("domain".to_string(), json!(service.domain)),
                        ("stack".to_string(), json!(service.stack.to_string())),
                        ("estimated_loc".to_string(), json!(service.estimated_loc)),
                    ]
                    .into_iter()
                    .collect(),
                );
                let matching_files: Vec<String> = kg
                    .nodes()
                    .filter(|(_, attrs)| {
                        attrs.get("node_type").and_then(Value::as_str) == Some("file")
                            && attrs.get("service_name").and_then(Value::as_str)
                                == Some(service.service_id.as_str())
                    })
                    .map(|(id, _)| id.to_string())
                    .collect();
                for file_node in matching_files {
                    kg.add_edge(&svc_node, &file_node, EdgeKind::ContainsFile.as_str(), Attrs::new());
                }
            }
        }

        // Symbol nodes and DEFINES_SYMBOL edges.
        for sym in &source.symbols {
            if sym.file_path.is_empty() || sym.symbol_name.is_empty() {
                continue;
            }
            let sym_node = format!("symbol::{}::{}", sym.file_path, sym.symbol_name);
            kg.add_node(
                &sym_node,
                [
                    ("node_type".to_string(), json!("symbol")),
                    ("file_path".to_string(), json!(sym.file_path)),
                    ("symbol_name".to_string(), json!(sym.symbol_name)),
                    ("kind".to_string(), json!(sym.kind)),
                    ("language".to_string(), json!(sym.language)),
                    ("service_name".to_string(), json!(sym.service_name)),
                    ("line_start".to_string(), json!(sym.line_start)),
                    ("line_end".to_string(), json!(sym.line_end)),
                    ("signature".to_string(), json!(sym.signature)),
                    ("docstring".to_string(), json!(sym.docstring)),
                ]
                .into_iter()
                .collect(),
            );
            let file_node = format!("file::{}", sym.file_path);
            if !kg.contains(&file_node) {
                kg.add_node(
                    &file_node,
                    [
                        ("node_type".to_string(), json!("file")),
                        ("file_path".to_string(), json!(sym.file_path)),
                        ("language".to_string(), json!(sym.language)),
                        ("service_name".to_string(), json!(sym.service_name)),
                    ]
                    .into_iter()
                    .collect(),
                );
            }
            kg.add_edge(&file_node, &sym_node, "DEFINES_SYMBOL", Attrs::new());
        }

        // Symbol-to-symbol edges from the dependency table.
        for dep in &source.dependency_edges {
            if dep.source_symbol_id.is_empty() || dep.target_symbol_id.is_empty() {
                continue;
            }
            let src = format!("symbol::{}", dep.source_symbol_id);
            let tgt = format!("symbol::{}", dep.target_symbol_id);
            if !kg.contains(&src) {
                kg.add_node(&src, [("node_type".to_string(), json!("symbol"))].into_iter().collect());
            }
            if !kg.contains(&tgt) {
                kg.add_node(&tgt, [("node_type".to_string(), json!("symbol"))].into_iter().collect());
            }
            let relation = map_relation(&dep.relation);
            kg.add_edge(
                &src,
                &tgt,
                relation.as_str(),
                [
                    ("source_file".to_string(), json!(dep.source_file)),
                    ("target_file".to_string(), json!(dep.target_file)),
                    ("line".to_string(), json!(dep.line)),
                ]
                .into_iter()
                .collect(),
            );
        }

        errors
    }

    // ------------------------------------------------------------------
    // Phase 3
    // ------------------------------------------------------------------

    fn add_contract_and_entity_nodes(&self, source: &SourceData) -> Vec<String> {
        let mut errors = Vec::new();
        let mut kg = self.kg.write().expect("graph lock poisoned");

        // Contracts, endpoints, events.
        for contract in &source.contracts {
            let contract_node = format!("contract::{}", contract.id);
            kg.add_node(
                &contract_node,
                [
                    ("node_type".to_string(), json!("contract")),
                    ("contract_id".to_string(), json!(contract.id)),
                    ("contract_type".to_string(), json!(contract.contract_type)),
                    ("version".to_string(), json!(contract.version)),
                    ("service_name".to_string(), json!(contract.service_name)),
                    ("status".to_string(), json!(contract.status)),
                ]
                .into_iter()
                .collect(),
            );
            let svc_node = format!("service::{}", contract.service_name);
            if kg.contains(&svc_node) {
                kg.add_edge(&svc_node, &contract_node, "PROVIDES_CONTRACT", Attrs::new());
            }
            if let Err(e) = parse_contract_spec(&mut kg, &contract_node, contract) {
                errors.push(format!(
                    "Failed to parse contract spec for {}: {e:#}",
                    contract.service_name
                ));
            }
        }

        // Domain entities.
        if let Some(model) = &source.domain_model {
            for entity in &model.entities {
                if entity.name.is_empty() {
                    continue;
                }
                let entity_node = format!("domain_entity::{}", entity.name.to_lowercase());
                let fields_json = serde_json::to_string(&entity.fields).unwrap_or_else(|_| "[]".into());
                let fields_summary = entity
                    .fields
                    .iter()
                    .take(10)
                    .map(|f| f.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                kg.add_node(
                    &entity_node,
                    [
                        ("node_type".to_string(), json!("domain_entity")),
                        ("entity_name".to_string(), json!(entity.name)),
                        ("description".to_string(), json!(entity.description)),
                        ("owning_service".to_string(), json!(entity.owning_service)),
                        ("fields_summary".to_string(), json!(fields_summary)),
                        ("fields_json".to_string(), json!(fields_json)),
                    ]
                    .into_iter()
                    .collect(),
                );

                if !entity.owning_service.is_empty() {
                    let svc_node = format!("service::{}", entity.owning_service);
                    if kg.contains(&svc_node) {
                        kg.add_edge(&svc_node, &entity_node, "OWNS_ENTITY", Attrs::new());
                    }
                }

                for rel in &entity.relationships {
                    if rel.target.is_empty() {
                        continue;
                    }
                    let target_node = format!("domain_entity::{}", rel.target.to_lowercase());
                    kg.add_edge(
                        &entity_node,
                        &target_node,
                        "DOMAIN_RELATIONSHIP",
                        [
                            ("relationship_type".to_string(), json!(rel.relationship_type)),
                            ("cardinality".to_string(), json!(rel.cardinality)),
                        ]
                        .into_iter()
                        .collect(),
                    );
                }

                for ref_svc in &entity.referenced_by {
                    let ref_node = format!("service::{ref_svc}");
                    if kg.contains(&ref_node) {
                        kg.add_edge(&ref_node, &entity_node, "REFERENCES_ENTITY", Attrs::new());
                    }
                }
            }
        }

        match_symbols_to_entities(&mut kg);
        add_service_interface_events(&mut kg, &source.service_interfaces);
        match_handlers_to_endpoints(&mut kg, &source.service_interfaces);

        errors
    }

    // ------------------------------------------------------------------
    // Phase 4
    // ------------------------------------------------------------------

    fn compute_metrics_and_embed(&self) -> (Vec<String>, usize) {
        let mut errors = Vec::new();

        let (pageranks, communities) = {
            let kg = self.kg.read().expect("graph lock poisoned");
            (kg.compute_pagerank(), kg.compute_communities(1.0))
        };

        {
            let mut kg = self.kg.write().expect("graph lock poisoned");
            for (node, pr) in &pageranks {
                kg.set_attr(node, "pagerank", json!(pr));
            }
            for (idx, community) in communities.iter().enumerate() {
                for node in community {
                    kg.set_attr(node, "community_id", json!(idx as i64));
                }
            }
        }

        let kg = self.kg.read().expect("graph lock poisoned");

        let node_records: Vec<NodeRecord> = kg
            .nodes()
            .map(|(id, attrs)| NodeRecord {
                id: id.to_string(),
                document: build_node_document(id, attrs),
                node_type: attrs
                    .get("node_type")
                    .and_then(Value::as_str)
                    .unwrap_or("file")
                    .to_string(),
                service_name: attr_string(attrs, "service_name"),
                language: attr_string(attrs, "language"),
                community_id: attrs.get("community_id").and_then(Value::as_i64).unwrap_or(-1),
                pagerank: attrs.get("pagerank").and_then(Value::as_f64).unwrap_or(0.0),
            })
            .collect();

        if let Err(e) = self.store.delete_all_nodes() {
            errors.push(format!("Failed to clear nodes collection: {e:#}"));
        }
        if !node_records.is_empty()
            && let Err(e) = self.store.upsert_nodes(&node_records)
        {
            errors.push(format!("Failed to upsert node records: {e:#}"));
        }
        debug!("Upserted {} node records", node_records.len());

        let context_records = build_context_records(&kg, &communities);
        if let Err(e) = self.store.delete_all_contexts() {
            errors.push(format!("Failed to clear contexts collection: {e:#}"));
        }
        if !context_records.is_empty()
            && let Err(e) = self.store.upsert_contexts(&context_records)
        {
            errors.push(format!("Failed to upsert context records: {e:#}"));
        }
        debug!("Upserted {} context records", context_records.len());

        (errors, communities.len())
    }

    // ------------------------------------------------------------------
    // Phase 5
    // ------------------------------------------------------------------

    fn persist_snapshot(&self) -> Vec<String> {
        let mut errors = Vec::new();

        derive_service_edges(&mut self.kg.write().expect("graph lock poisoned"));

        let kg = self.kg.read().expect("graph lock poisoned");
        match kg.to_json() {
            Ok(graph_json) => {
                let row = SnapshotRow {
                    graph_json,
                    node_count: kg.node_count(),
                    edge_count: kg.edge_count(),
                    community_count: count_communities(&kg),
                    services_indexed: collect_services(&kg),
                    created_at: Utc::now(),
                };
                if let Err(e) = self.db.insert_snapshot(&row) {
                    errors.push(format!("Failed to persist snapshot: {e:#}"));
                }
            }
            Err(e) => errors.push(format!("Failed to serialize graph: {e:#}")),
        }

        errors
    }
}

// ----------------------------------------------------------------------
// Phase 3 helpers
// ----------------------------------------------------------------------

fn parse_contract_spec(
    kg: &mut KnowledgeGraph,
    contract_node: &str,
    contract: &ContractRow,
) -> Result<()> {
    let service_name = &contract.service_name;
    match contract.contract_type.as_str() {
        "openapi" => {
            let paths = contract
                .spec
                .get("paths")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (path, methods) in paths {
                let Some(methods) = methods.as_object() else { continue };
                for (method, operation) in methods {
                    if method.starts_with("x-") || method == "parameters" {
                        continue;
                    }
                    let method_upper = method.to_uppercase();
                    let endpoint_node = format!("endpoint::{service_name}::{method_upper}::{path}");
                    let summary = operation
                        .get("summary")
                        .or_else(|| operation.get("description"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    kg.add_node(
                        &endpoint_node,
                        [
                            ("node_type".to_string(), json!("endpoint")),
                            ("service_name".to_string(), json!(service_name)),
                            ("method".to_string(), json!(method_upper)),
                            ("path".to_string(), json!(path)),
                            ("summary".to_string(), json!(summary)),
                        ]
                        .into_iter()
                        .collect(),
                    );
                    kg.add_edge(contract_node, &endpoint_node, "EXPOSES_ENDPOINT", Attrs::new());
                }
            }
        }
        "asyncapi" => {
            let channels = contract
                .spec
                .get("channels")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let svc_node = format!("service::{service_name}");
            for (channel_name, channel_def) in channels {
                let Some(channel_def) = channel_def.as_object() else { continue };
                // Events have shared identity: no service qualifier.
                let event_node = format!("event::{channel_name}");
                kg.add_node(
                    &event_node,
                    [
                        ("node_type".to_string(), json!("event")),
                        ("event_name".to_string(), json!(channel_name)),
                        ("channel".to_string(), json!(channel_name)),
                    ]
                    .into_iter()
                    .collect(),
                );
                if !kg.contains(&svc_node) {
                    continue;
                }
                let has_publish = channel_def.contains_key("publish");
                let has_subscribe = channel_def.contains_key("subscribe");
                if has_publish || has_subscribe {
                    if has_publish {
                        kg.add_edge(&svc_node, &event_node, "PUBLISHES_EVENT", Attrs::new());
                    }
                    if has_subscribe {
                        kg.add_edge(&svc_node, &event_node, "CONSUMES_EVENT", Attrs::new());
                    }
                } else {
                    // Ambiguous channel: default to publish.
                    kg.add_edge(&svc_node, &event_node, "PUBLISHES_EVENT", Attrs::new());
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Match symbols to domain entities by normalized-name equality after
/// stripping common suffixes; matches gain IMPLEMENTS_ENTITY edges.
fn match_symbols_to_entities(kg: &mut KnowledgeGraph) {
    let entity_lookup: HashMap<String, String> = kg
        .nodes()
        .filter(|(_, attrs)| attrs.get("node_type").and_then(Value::as_str) == Some("domain_entity"))
        .filter_map(|(id, attrs)| {
            attrs
                .get("entity_name")
                .and_then(Value::as_str)
                .map(|name| (name.to_lowercase(), id.to_string()))
        })
        .collect();
    if entity_lookup.is_empty() {
        return;
    }

    let matches: Vec<(String, String)> = kg
        .nodes()
        .filter(|(_, attrs)| attrs.get("node_type").and_then(Value::as_str) == Some("symbol"))
        .filter(|(_, attrs)| {
            matches!(
                attrs.get("kind").and_then(Value::as_str),
                Some("class") | Some("interface") | Some("type")
            )
        })
        .filter_map(|(id, attrs)| {
            let symbol_name = attrs.get("symbol_name").and_then(Value::as_str)?;
            let mut stripped = symbol_name;
            for suffix in SYMBOL_SUFFIXES {
                if let Some(prefix) = stripped.strip_suffix(suffix)
                    && !prefix.is_empty()
                {
                    stripped = prefix;
                    break;
                }
            }
            entity_lookup
                .get(&stripped.to_lowercase())
                .map(|entity| (id.to_string(), entity.clone()))
        })
        .collect();

    for (symbol_node, entity_node) in matches {
        kg.add_edge(&symbol_node, &entity_node, "IMPLEMENTS_ENTITY", Attrs::new());
    }
}

/// Merge runtime-provided service-interface events (name-only).
fn add_service_interface_events(
    kg: &mut KnowledgeGraph,
    interfaces: &BTreeMap<String, ServiceInterface>,
) {
    for (service_name, interface) in interfaces {
        let svc_node = format!("service::{service_name}");
        for event_name in &interface.events_published {
            if event_name.is_empty() {
                continue;
            }
            let event_node = format!("event::{event_name}");
            if !kg.contains(&event_node) {
                kg.add_node(
                    &event_node,
                    [
                        ("node_type".to_string(), json!("event")),
                        ("event_name".to_string(), json!(event_name)),
                        ("channel".to_string(), json!(event_name)),
                    ]
                    .into_iter()
                    .collect(),
                );
            }
            if kg.contains(&svc_node) {
                kg.add_edge(&svc_node, &event_node, "PUBLISHES_EVENT", Attrs::new());
            }
        }
        for event_name in &interface.events_consumed {
            if event_name.is_empty() {
                continue;
            }
            let event_node = format!("event::{event_name}");
            if !kg.contains(&event_node) {
                kg.add_node(
                    &event_node,
                    [
                        ("node_type".to_string(), json!("event")),
                        ("event_name".to_string(), json!(event_name)),
                        ("channel".to_string(), json!(event_name)),
                    ]
                    .into_iter()
                    .collect(),
                );
            }
            if kg.contains(&svc_node) {
                kg.add_edge(&svc_node, &event_node, "CONSUMES_EVENT", Attrs::new());
            }
        }
    }
}

/// Match endpoint handlers to symbol nodes by `(service, handler)` or the
/// short name after the final separator; matches gain HANDLES_ENDPOINT
/// edges and the endpoint records its `handler_symbol`.
fn match_handlers_to_endpoints(
    kg: &mut KnowledgeGraph,
    interfaces: &BTreeMap<String, ServiceInterface>,
) {
    if interfaces.is_empty() {
        return;
    }

    let mut symbol_lookup: HashMap<(String, String), String> = HashMap::new();
    for (id, attrs) in kg.nodes() {
        if attrs.get("node_type").and_then(Value::as_str) != Some("symbol") {
            continue;
        }
        let svc = attr_string(attrs, "service_name");
        let name = attr_string(attrs, "symbol_name");
        if svc.is_empty() || name.is_empty() {
            continue;
        }
        symbol_lookup.insert((svc.clone(), name.clone()), id.to_string());
        let short = name.rsplit("::").next().unwrap_or(&name).to_string();
        symbol_lookup.entry((svc, short)).or_insert_with(|| id.to_string());
    }

    let mut wires: Vec<(String, String)> = Vec::new();
    for (service_name, interface) in interfaces {
        for ep in &interface.endpoints {
            if ep.handler.is_empty() || ep.method.is_empty() || ep.path.is_empty() {
                continue;
            }
            let method = ep.method.to_uppercase();
            let endpoint_node = format!("endpoint::{service_name}::{method}::{}", ep.path);
            if !kg.contains(&endpoint_node) {
                continue;
            }
            let short = ep.handler.rsplit('.').next().unwrap_or(&ep.handler);
            let symbol = symbol_lookup
                .get(&(service_name.clone(), ep.handler.clone()))
                .or_else(|| symbol_lookup.get(&(service_name.clone(), short.to_string())));
            if let Some(symbol_node) = symbol {
                wires.push((symbol_node.clone(), endpoint_node));
            }
        }
    }

    for (symbol_node, endpoint_node) in wires {
        kg.add_edge(&symbol_node, &endpoint_node, "HANDLES_ENDPOINT", Attrs::new());
        kg.set_attr(&endpoint_node, "handler_symbol", json!(symbol_node));
    }
}

// ----------------------------------------------------------------------
// Phase 5 helpers
// ----------------------------------------------------------------------

fn is_shared_utility(file_path: &str) -> bool {
    let normalized = file_path.replace('\\', "/").to_lowercase();
    SHARED_UTILITY_PATTERNS.iter().any(|p| normalized.contains(p))
}

/// Derive SERVICE_CALLS edges from cross-service file imports: at most
/// one edge per ordered service pair, carrying the first discoverable
/// `via_endpoint` (possibly empty).
fn derive_service_edges(kg: &mut KnowledgeGraph) {
    let mut pairs: BTreeMap<(String, String), String> = BTreeMap::new();

    for edge in kg.edges() {
        if edge.relation != "IMPORTS" {
            continue;
        }
        let src_service = kg.attr_str(&edge.source, "service_name");
        let tgt_service = kg.attr_str(&edge.target, "service_name");
        if src_service.is_empty() || tgt_service.is_empty() || src_service == tgt_service {
            continue;
        }

        let src_file = non_empty_or(kg.attr_str(&edge.source, "file_path"), &edge.source);
        let tgt_file = non_empty_or(kg.attr_str(&edge.target, "file_path"), &edge.target);
        if is_shared_utility(&src_file) || is_shared_utility(&tgt_file) {
            continue;
        }

        let pair = (src_service, tgt_service);
        let via = pairs.entry(pair).or_default();
        if !via.is_empty() {
            continue;
        }
        // First discoverable endpoint wins.
        for out in kg.out_edges(&edge.target) {
            if out.relation == "HANDLES_ENDPOINT" {
                *via = out.target;
                break;
            }
        }
    }

    for ((src_svc, tgt_svc), via_endpoint) in pairs {
        let src_node = format!("service::{src_svc}");
        let tgt_node = format!("service::{tgt_svc}");
        if kg.contains(&src_node) && kg.contains(&tgt_node) {
            kg.add_edge(
                &src_node,
                &tgt_node,
                EdgeKind::ServiceCalls.as_str(),
                [("via_endpoint".to_string(), json!(via_endpoint))]
                    .into_iter()
                    .collect(),
            );
        }
    }
}

// ----------------------------------------------------------------------
// Documents & counts
// ----------------------------------------------------------------------

fn attr_string(attrs: &Attrs, key: &str) -> String {
    attrs
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() { fallback.to_string() } else { value }
}

/// Type-specific semantic-text rendering of one node.
pub fn build_node_document(node_id: &str, attrs: &Attrs) -> String {
    match attrs.get("node_type").and_then(Value::as_str).unwrap_or("") {
        "file" => {
            let path = non_empty_or(
                attr_string(attrs, "file_path"),
                node_id.trim_start_matches("file::"),
            );
            format!(
                "File: {path}. Language: {}. Service: {}.",
                attr_string(attrs, "language"),
                attr_string(attrs, "service_name")
            )
        }
        "symbol" => format!(
            "Symbol: {} ({}) in {}. Signature: {}. Service: {}.",
            attr_string(attrs, "symbol_name"),
            attr_string(attrs, "kind"),
            attr_string(attrs, "file_path"),
            attr_string(attrs, "signature"),
            attr_string(attrs, "service_name")
        ),
        "service" => format!(
            "Service: {}. Domain: {}. Description: {}. Stack: {}.",
            attr_string(attrs, "service_name"),
            attr_string(attrs, "domain"),
            attr_string(attrs, "description"),
            non_empty_or(attr_string(attrs, "stack"), "[]")
        ),
        "contract" => format!(
            "Contract: {} v{} for {}. Status: {}.",
            attr_string(attrs, "contract_type"),
            attr_string(attrs, "version"),
            attr_string(attrs, "service_name"),
            attr_string(attrs, "status")
        ),
        "endpoint" => format!(
            "Endpoint: {} {} on {}.",
            attr_string(attrs, "method"),
            attr_string(attrs, "path"),
            attr_string(attrs, "service_name")
        ),
        "domain_entity" => format!(
            "Domain Entity: {}. Description: {}. Owned by: {}. Fields: {}.",
            attr_string(attrs, "entity_name"),
            attr_string(attrs, "description"),
            attr_string(attrs, "owning_service"),
            attr_string(attrs, "fields_summary")
        ),
        "event" => format!(
            "Event: {} on channel {}.",
            attr_string(attrs, "event_name"),
            attr_string(attrs, "channel")
        ),
        _ => format!("Node: {node_id}."),
    }
}

/// Context records: one per service, one per community.
fn build_context_records(kg: &KnowledgeGraph, communities: &[HashSet<String>]) -> Vec<ContextRecord> {
    let mut records = Vec::new();

    let service_nodes: Vec<(String, Attrs)> = kg
        .nodes()
        .filter(|(_, attrs)| attrs.get("node_type").and_then(Value::as_str) == Some("service"))
        .map(|(id, attrs)| (id.to_string(), attrs.clone()))
        .collect();

    for (_, svc_attrs) in &service_nodes {
        let svc_name = attr_string(svc_attrs, "service_name");
        let in_service: HashSet<String> = kg
            .nodes()
            .filter(|(_, attrs)| attr_string(attrs, "service_name") == svc_name)
            .map(|(id, _)| id.to_string())
            .collect();
        let edge_count = kg
            .edges()
            .iter()
            .filter(|e| in_service.contains(&e.source) || in_service.contains(&e.target))
            .count();

        let document = format!(
            "Service: {svc_name}. Domain: {}. Description: {}. Stack: {}. \
             Contains {} nodes and {} edges.",
            attr_string(svc_attrs, "domain"),
            attr_string(svc_attrs, "description"),
            non_empty_or(attr_string(svc_attrs, "stack"), "[]"),
            in_service.len(),
            edge_count
        );

        records.push(ContextRecord {
            id: format!("ctx::service::{svc_name}"),
            document,
            context_type: "service".to_string(),
            service_name: svc_name,
            community_id: svc_attrs.get("community_id").and_then(Value::as_i64).unwrap_or(-1),
            node_count: in_service.len(),
            edge_count,
        });
    }

    for (idx, community) in communities.iter().enumerate() {
        if community.is_empty() {
            continue;
        }
        let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut services: HashSet<String> = HashSet::new();
        for node in community {
            if let Some(attrs) = kg.get_node(node) {
                *type_counts
                    .entry(non_empty_or(attr_string(attrs, "node_type"), "unknown"))
                    .or_insert(0) += 1;
                let svc = attr_string(attrs, "service_name");
                if !svc.is_empty() {
                    services.insert(svc);
                }
            }
        }
        let edge_count = kg
            .edges()
            .iter()
            .filter(|e| community.contains(&e.source) && community.contains(&e.target))
            .count();

        let types_summary = type_counts
            .iter()
            .map(|(t, c)| format!("{c} {t}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sorted_services: Vec<&String> = services.iter().collect();
        sorted_services.sort();
        let services_summary = if sorted_services.is_empty() {
            "none".to_string()
        } else {
            sorted_services
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        records.push(ContextRecord {
            id: format!("ctx::community::{idx}"),
            document: format!(
                "Community {idx}: {} nodes, {edge_count} edges. Node types: {types_summary}. \
                 Services: {services_summary}.",
                community.len()
            ),
            context_type: "community".to_string(),
            service_name: String::new(),
            community_id: idx as i64,
            node_count: community.len(),
            edge_count,
        });
    }

    records
}

fn count_by_attr(kg: &KnowledgeGraph, key: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (_, attrs) in kg.nodes() {
        *counts
            .entry(non_empty_or(attr_string(attrs, key), "unknown"))
            .or_insert(0) += 1;
    }
    counts
}

fn count_edge_types(kg: &KnowledgeGraph) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for edge in kg.edges() {
        *counts.entry(edge.relation).or_insert(0) += 1;
    }
    counts
}

fn collect_services(kg: &KnowledgeGraph) -> Vec<String> {
    let mut services: Vec<String> = kg
        .nodes()
        .filter(|(_, attrs)| attrs.get("node_type").and_then(Value::as_str) == Some("service"))
        .map(|(_, attrs)| attr_string(attrs, "service_name"))
        .filter(|s| !s.is_empty())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    services.sort();
    services
}

fn count_communities(kg: &KnowledgeGraph) -> usize {
    kg.nodes()
        .filter_map(|(_, attrs)| attrs.get("community_id").and_then(Value::as_i64))
        .filter(|c| *c >= 0)
        .collect::<HashSet<_>>()
        .len()
}
