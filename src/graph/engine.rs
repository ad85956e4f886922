//! Read-path query engine over the knowledge graph.
//!
//! Implements the six read tools behind the MCP surface (the seventh,
//! `build_knowledge_graph`, lives in the indexer). Every method returns a
//! serializable result struct; callers encode tool failures as
//! `{"success": false, "error": ...}` payloads.
//!
//! The undirected projection is expensive to rebuild, so it is cached
//! lazily and invalidated only through [`GraphRagEngine::refresh_undirected_cache`],
//! which consumers must call after any indexer run.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::graph::assembler::{
    ConsumedEndpoint, ConsumedEvent, ContextAssembler, OwnedEntity, ProvidedEndpoint,
    PublishedEvent, ReferencedEntity,
};
use crate::graph::knowledge::{
    KnowledgeGraph, UndirectedAdjacency, bfs_distances, shortest_path_in,
};
use crate::graph::store::VectorStore;

/// Default hybrid-search weights.
pub const DEFAULT_SEMANTIC_WEIGHT: f64 = 0.6;
pub const DEFAULT_GRAPH_WEIGHT: f64 = 0.4;

/// Distance rank assigned to nodes unreachable from the ego center.
const UNREACHABLE_DISTANCE: usize = 999;

// ----------------------------------------------------------------------
// Result types
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceContext {
    pub service_name: String,
    pub provided_endpoints: Vec<ProvidedEndpoint>,
    pub consumed_endpoints: Vec<ConsumedEndpoint>,
    pub events_published: Vec<PublishedEvent>,
    pub events_consumed: Vec<ConsumedEvent>,
    pub owned_entities: Vec<OwnedEntity>,
    pub referenced_entities: Vec<ReferencedEntity>,
    pub depends_on: Vec<String>,
    pub depended_on_by: Vec<String>,
    pub context_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Neighborhood {
    pub center_node: Value,
    pub nodes: Vec<Value>,
    pub edges: Vec<Value>,
    pub total_nodes_in_neighborhood: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchHit {
    pub node_id: String,
    pub score: f64,
    pub semantic_score: f64,
    pub graph_score: f64,
    /// Graph distance to the anchor; -1 when PageRank was the signal.
    pub distance: i64,
    pub document: String,
    pub node_type: String,
    pub attributes: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HybridSearchResult {
    pub results: Vec<SearchHit>,
    pub query: String,
    pub anchor_node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImpactedService {
    pub service_name: String,
    pub impact_count: usize,
    pub impact_paths: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImpactedContract {
    pub contract_id: String,
    pub service_name: String,
    pub endpoints_affected: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImpactedEntity {
    pub entity_name: String,
    pub owning_service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrossServiceImpact {
    pub source_node: String,
    pub source_service: String,
    pub impacted_services: Vec<ImpactedService>,
    pub impacted_contracts: Vec<ImpactedContract>,
    pub impacted_entities: Vec<ImpactedEntity>,
    pub total_impacted_nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MisplacedFile {
    pub file: String,
    pub declared_service: String,
    pub community_service: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceCoupling {
    pub service_a: String,
    pub service_b: String,
    pub cross_edges: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BoundaryValidation {
    pub communities_detected: usize,
    pub services_declared: usize,
    pub alignment_score: f64,
    pub misplaced_files: Vec<MisplacedFile>,
    pub isolated_files: Vec<String>,
    pub service_coupling: Vec<ServiceCoupling>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventEntry {
    pub event_name: String,
    pub channel: String,
    pub publishers: Vec<String>,
    pub consumers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventValidation {
    pub orphaned_events: Vec<EventEntry>,
    pub unmatched_consumers: Vec<EventEntry>,
    pub matched_events: Vec<EventEntry>,
    pub total_events: usize,
    pub match_rate: f64,
}

// ----------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------

/// Synchronous query engine over a consistent graph snapshot.
pub struct GraphRagEngine {
    kg: Arc<RwLock<KnowledgeGraph>>,
    store: Arc<VectorStore>,
    assembler: ContextAssembler,
    cached_undirected: Mutex<Option<Arc<UndirectedAdjacency>>>,
}

impl GraphRagEngine {
    pub fn new(kg: Arc<RwLock<KnowledgeGraph>>, store: Arc<VectorStore>) -> Self {
        Self {
            kg,
            store,
            assembler: ContextAssembler::default(),
            cached_undirected: Mutex::new(None),
        }
    }

    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    /// Rebuild the cached undirected projection. Must be called after any
    /// graph mutation (i.e. after every indexer run).
    pub fn refresh_undirected_cache(&self) {
        let adj = self.kg.read().expect("graph lock poisoned").undirected_adjacency();
        *self.cached_undirected.lock().expect("cache lock poisoned") = Some(Arc::new(adj));
    }

    fn undirected(&self) -> Arc<UndirectedAdjacency> {
        let mut guard = self.cached_undirected.lock().expect("cache lock poisoned");
        match guard.as_ref() {
            Some(adj) => adj.clone(),
            None => {
                let adj = Arc::new(
                    self.kg.read().expect("graph lock poisoned").undirected_adjacency(),
                );
                *guard = Some(adj.clone());
                adj
            }
        }
    }

    // ==================================================================
    // Tool 2: get_service_context
    // ==================================================================

    pub fn get_service_context(&self, service_name: &str) -> ServiceContext {
        let kg = self.kg.read().expect("graph lock poisoned");
        let service_node = format!("service::{service_name}");

        if !kg.contains(&service_node) {
            return ServiceContext {
                service_name: service_name.to_string(),
                error: Some("Service not found in knowledge graph".to_string()),
                ..ServiceContext::default()
            };
        }

        // Provided endpoints: PROVIDES_CONTRACT -> EXPOSES_ENDPOINT
        let mut provided_endpoints = Vec::new();
        for contract_edge in kg.out_edges(&service_node) {
            if contract_edge.relation != "PROVIDES_CONTRACT" {
                continue;
            }
            let contract_node = &contract_edge.target;
            for ep_edge in kg.out_edges(contract_node) {
                if ep_edge.relation != "EXPOSES_ENDPOINT" {
                    continue;
                }
                provided_endpoints.push(ProvidedEndpoint {
                    method: kg.attr_str(&ep_edge.target, "method"),
                    path: kg.attr_str(&ep_edge.target, "path"),
                    handler: kg.attr_str(&ep_edge.target, "handler_symbol"),
                    contract_id: kg.attr_str(contract_node, "contract_id"),
                });
            }
        }

        // Consumed endpoints: outgoing SERVICE_CALLS with via_endpoint
        let mut consumed_endpoints = Vec::new();
        for edge in kg.out_edges(&service_node) {
            if edge.relation != "SERVICE_CALLS" {
                continue;
            }
            let via = edge
                .attrs
                .get("via_endpoint")
                .and_then(Value::as_str)
                .unwrap_or("");
            if !via.is_empty() && kg.contains(via) {
                consumed_endpoints.push(ConsumedEndpoint {
                    method: kg.attr_str(via, "method"),
                    path: kg.attr_str(via, "path"),
                    provider_service: kg.attr_str(&edge.target, "service_name"),
                });
            }
        }

        // Events published / consumed
        let mut events_published = Vec::new();
        let mut events_consumed = Vec::new();
        for edge in kg.out_edges(&service_node) {
            match edge.relation.as_str() {
                "PUBLISHES_EVENT" => events_published.push(PublishedEvent {
                    event_name: kg.attr_str(&edge.target, "event_name"),
                    channel: kg.attr_str(&edge.target, "channel"),
                }),
                "CONSUMES_EVENT" => {
                    let publisher = kg
                        .in_edges(&edge.target)
                        .into_iter()
                        .find(|e| e.relation == "PUBLISHES_EVENT")
                        .map(|e| kg.attr_str(&e.source, "service_name"))
                        .unwrap_or_default();
                    events_consumed.push(ConsumedEvent {
                        event_name: kg.attr_str(&edge.target, "event_name"),
                        publisher_service: publisher,
                    });
                }
                _ => {}
            }
        }

        // Owned / referenced entities with field lists from fields_json
        let mut owned_entities = Vec::new();
        let mut referenced_entities = Vec::new();
        for edge in kg.out_edges(&service_node) {
            let fields = parse_fields_json(&kg.attr_str(&edge.target, "fields_json"));
            match edge.relation.as_str() {
                "OWNS_ENTITY" => owned_entities.push(OwnedEntity {
                    name: kg.attr_str(&edge.target, "entity_name"),
                    fields,
                }),
                "REFERENCES_ENTITY" => referenced_entities.push(ReferencedEntity {
                    name: kg.attr_str(&edge.target, "entity_name"),
                    owning_service: kg.attr_str(&edge.target, "owning_service"),
                    fields,
                }),
                _ => {}
            }
        }

        // Service dependency topology over SERVICE_CALLS
        let mut depends_on: Vec<String> = Vec::new();
        let mut depended_on_by: Vec<String> = Vec::new();
        for edge in kg.out_edges(&service_node) {
            if edge.relation == "SERVICE_CALLS" && kg.attr_str(&edge.target, "node_type") == "service"
            {
                let svc = kg.attr_str(&edge.target, "service_name");
                if !svc.is_empty() && !depends_on.contains(&svc) {
                    depends_on.push(svc);
                }
            }
        }
        for edge in kg.in_edges(&service_node) {
            if edge.relation == "SERVICE_CALLS" && kg.attr_str(&edge.source, "node_type") == "service"
            {
                let svc = kg.attr_str(&edge.source, "service_name");
                if !svc.is_empty() && !depended_on_by.contains(&svc) {
                    depended_on_by.push(svc);
                }
            }
        }

        let context_text = self.assembler.assemble_service_context(
            service_name,
            &provided_endpoints,
            &consumed_endpoints,
            &events_published,
            &events_consumed,
            &owned_entities,
            &referenced_entities,
            &depends_on,
            &depended_on_by,
        );

        ServiceContext {
            service_name: service_name.to_string(),
            provided_endpoints,
            consumed_endpoints,
            events_published,
            events_consumed,
            owned_entities,
            referenced_entities,
            depends_on,
            depended_on_by,
            context_text,
            error: None,
        }
    }

    // ==================================================================
    // Tool 3: query_graph_neighborhood
    // ==================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn query_graph_neighborhood(
        &self,
        node_id: &str,
        radius: usize,
        undirected: bool,
        filter_node_types: &str,
        filter_edge_types: &str,
        max_nodes: usize,
    ) -> Neighborhood {
        let kg = self.kg.read().expect("graph lock poisoned");

        if !kg.contains(node_id) {
            return Neighborhood::default();
        }

        let (subgraph, distances) = kg.ego_subgraph(node_id, radius.max(1), undirected);

        // Node type filter; the center node is always retained.
        let allowed_types = parse_csv(filter_node_types);
        let keep: Vec<String> = subgraph
            .node_ids()
            .filter(|n| {
                *n == node_id
                    || allowed_types.is_empty()
                    || allowed_types.contains(&kg.attr_str(n, "node_type"))
            })
            .map(str::to_string)
            .collect();
        let subgraph = subgraph.induced_subgraph(keep.iter().map(String::as_str));

        // Edge type filter.
        let allowed_edges = parse_csv(filter_edge_types);
        let edges: Vec<_> = subgraph
            .edges()
            .into_iter()
            .filter(|e| allowed_edges.is_empty() || allowed_edges.contains(&e.relation))
            .collect();

        // Rank by (distance from center, -pagerank).
        let mut ranked: Vec<String> = subgraph.node_ids().map(str::to_string).collect();
        ranked.sort_by(|a, b| {
            let da = distances.get(a).copied().unwrap_or(UNREACHABLE_DISTANCE);
            let db = distances.get(b).copied().unwrap_or(UNREACHABLE_DISTANCE);
            da.cmp(&db)
                .then_with(|| {
                    kg.attr_f64(b, "pagerank")
                        .partial_cmp(&kg.attr_f64(a, "pagerank"))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.cmp(b))
        });

        let total = ranked.len();
        let truncated = total > max_nodes;
        ranked.truncate(max_nodes);
        let final_set: HashSet<&str> = ranked.iter().map(String::as_str).collect();

        let nodes = ranked
            .iter()
            .map(|id| node_json(&kg, id))
            .collect::<Vec<_>>();
        let edges = edges
            .into_iter()
            .filter(|e| final_set.contains(e.source.as_str()) && final_set.contains(e.target.as_str()))
            .map(|e| {
                let mut obj = serde_json::Map::new();
                obj.insert("source".to_string(), json!(e.source));
                obj.insert("target".to_string(), json!(e.target));
                obj.insert("relation".to_string(), json!(e.relation));
                for (k, v) in e.attrs {
                    obj.entry(k).or_insert(v);
                }
                Value::Object(obj)
            })
            .collect();

        Neighborhood {
            center_node: node_json(&kg, node_id),
            nodes,
            edges,
            total_nodes_in_neighborhood: total,
            truncated,
        }
    }

    // ==================================================================
    // Tool 4: hybrid_search
    // ==================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn hybrid_search(
        &self,
        query: &str,
        n_results: usize,
        anchor_node_id: &str,
        node_types: &str,
        service_name: &str,
        semantic_weight: f64,
        graph_weight: f64,
    ) -> HybridSearchResult {
        let parsed_types: Vec<String> = parse_csv(node_types).into_iter().collect();
        let semantic_hits = self
            .store
            .query_nodes(
                query,
                n_results * 3,
                if parsed_types.is_empty() { None } else { Some(&parsed_types) },
                if service_name.is_empty() { None } else { Some(service_name) },
            )
            .unwrap_or_default();

        if semantic_hits.is_empty() {
            return HybridSearchResult {
                results: Vec::new(),
                query: query.to_string(),
                anchor_node_id: anchor_node_id.to_string(),
            };
        }

        let kg = self.kg.read().expect("graph lock poisoned");

        struct Candidate {
            node_id: String,
            document: String,
            semantic_score: f64,
            graph_score: f64,
            distance: i64,
        }

        let mut candidates: Vec<Candidate> = semantic_hits
            .into_iter()
            .map(|hit| Candidate {
                semantic_score: (1.0 - hit.distance).max(0.0),
                node_id: hit.id,
                document: hit.document,
                graph_score: 0.0,
                distance: -1,
            })
            .collect();

        if !anchor_node_id.is_empty() && kg.contains(anchor_node_id) {
            let adj = self.undirected();
            let path_lengths = bfs_distances(&adj, anchor_node_id);
            let max_distance = path_lengths.values().copied().max().unwrap_or(1).max(1);
            for c in candidates.iter_mut() {
                let dist = path_lengths
                    .get(&c.node_id)
                    .copied()
                    .unwrap_or(max_distance + 1);
                c.distance = dist as i64;
                c.graph_score = 1.0 - (dist as f64 / (max_distance as f64 + 1.0));
            }
        } else {
            let max_pr = kg
                .node_ids()
                .map(|n| kg.attr_f64(n, "pagerank"))
                .fold(0.0f64, f64::max)
                .max(f64::MIN_POSITIVE);
            for c in candidates.iter_mut() {
                c.graph_score = kg.attr_f64(&c.node_id, "pagerank") / max_pr;
                c.distance = -1;
            }
        }

        let mut scored: Vec<(f64, Candidate)> = candidates
            .into_iter()
            .map(|c| {
                let score = semantic_weight * c.semantic_score + graph_weight * c.graph_score;
                (score, c)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n_results);

        let results = scored
            .into_iter()
            .map(|(score, c)| SearchHit {
                node_type: kg.attr_str(&c.node_id, "node_type"),
                attributes: kg
                    .get_node(&c.node_id)
                    .map(|attrs| Value::Object(attrs.clone().into_iter().collect()))
                    .unwrap_or(Value::Null),
                node_id: c.node_id,
                score,
                semantic_score: c.semantic_score,
                graph_score: c.graph_score,
                distance: c.distance,
                document: c.document,
            })
            .collect();

        HybridSearchResult {
            results,
            query: query.to_string(),
            anchor_node_id: anchor_node_id.to_string(),
        }
    }

    // ==================================================================
    // Tool 5: find_cross_service_impact
    // ==================================================================

    pub fn find_cross_service_impact(&self, node_id: &str, max_depth: usize) -> CrossServiceImpact {
        let kg = self.kg.read().expect("graph lock poisoned");

        if !kg.contains(node_id) {
            return CrossServiceImpact {
                source_node: node_id.to_string(),
                ..CrossServiceImpact::default()
            };
        }

        let descendants = kg.descendants(node_id, max_depth);
        let ancestors = kg.ancestors(node_id, max_depth);
        let all_impacted: HashSet<String> = descendants.union(&ancestors).cloned().collect();

        let source_service = kg.attr_str(node_id, "service_name");

        // Group by service, excluding the source's own service.
        let mut by_service: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for n in &all_impacted {
            let svc = kg.attr_str(n, "service_name");
            if !svc.is_empty() && svc != source_service {
                by_service.entry(svc).or_default().push(n.clone());
            }
        }

        // Impacted contracts with their exposed endpoints.
        let mut impacted_contracts = Vec::new();
        let mut contract_nodes: Vec<&String> = all_impacted
            .iter()
            .filter(|n| kg.attr_str(n, "node_type") == "contract")
            .collect();
        contract_nodes.sort();
        for contract in contract_nodes {
            let endpoints_affected: Vec<String> = kg
                .out_edges(contract)
                .into_iter()
                .filter(|e| e.relation == "EXPOSES_ENDPOINT")
                .map(|e| {
                    let path = kg.attr_str(&e.target, "path");
                    if path.is_empty() { e.target } else { path }
                })
                .collect();
            let contract_id = kg.attr_str(contract, "contract_id");
            impacted_contracts.push(ImpactedContract {
                contract_id: if contract_id.is_empty() {
                    contract.clone()
                } else {
                    contract_id
                },
                service_name: kg.attr_str(contract, "service_name"),
                endpoints_affected,
            });
        }

        // Impacted domain entities.
        let mut impacted_entities: Vec<ImpactedEntity> = all_impacted
            .iter()
            .filter(|n| kg.attr_str(n, "node_type") == "domain_entity")
            .map(|n| {
                let name = kg.attr_str(n, "entity_name");
                ImpactedEntity {
                    entity_name: if name.is_empty() { n.clone() } else { name },
                    owning_service: kg.attr_str(n, "owning_service"),
                }
            })
            .collect();
        impacted_entities.sort_by(|a, b| a.entity_name.cmp(&b.entity_name));

        // One representative shortest path per impacted service; services
        // without a findable path get an empty path list, not an error.
        let adj = self.undirected();
        let impacted_services = by_service
            .into_iter()
            .map(|(svc, nodes)| {
                let mut paths = Vec::new();
                let svc_node = format!("service::{svc}");
                if kg.contains(&svc_node)
                    && let Some(path) = shortest_path_in(&adj, node_id, &svc_node)
                {
                    paths.push(path);
                }
                ImpactedService {
                    service_name: svc,
                    impact_count: nodes.len(),
                    impact_paths: paths,
                }
            })
            .collect();

        CrossServiceImpact {
            source_node: node_id.to_string(),
            source_service,
            impacted_services,
            impacted_contracts,
            impacted_entities,
            total_impacted_nodes: all_impacted.len(),
        }
    }

    // ==================================================================
    // Tool 6: validate_service_boundaries
    // ==================================================================

    pub fn validate_service_boundaries(&self, resolution: f64) -> BoundaryValidation {
        let kg = self.kg.read().expect("graph lock poisoned");

        let file_nodes: Vec<String> = kg
            .node_ids()
            .filter(|n| kg.attr_str(n, "node_type") == "file")
            .map(str::to_string)
            .collect();

        if file_nodes.is_empty() {
            return BoundaryValidation {
                alignment_score: 1.0,
                ..BoundaryValidation::default()
            };
        }

        let file_subgraph = kg.induced_subgraph(file_nodes.iter().map(String::as_str));
        let communities = file_subgraph.compute_communities(resolution);

        // Dominant service per community by simple majority; ties resolve
        // to the lexicographically smallest service for determinism.
        let dominant_of: Vec<String> = communities
            .iter()
            .map(|community| {
                let mut counts: BTreeMap<String, usize> = BTreeMap::new();
                for node in community {
                    let svc = kg.attr_str(node, "service_name");
                    if !svc.is_empty() {
                        *counts.entry(svc).or_insert(0) += 1;
                    }
                }
                counts
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                    .map(|(svc, _)| svc)
                    .unwrap_or_default()
            })
            .collect();

        let mut misplaced = Vec::new();
        for (i, community) in communities.iter().enumerate() {
            let dominant = &dominant_of[i];
            if dominant.is_empty() {
                continue;
            }
            let total_in_community = community.len();
            let same_service = community
                .iter()
                .filter(|n| kg.attr_str(n, "service_name") == *dominant)
                .count();
            let confidence = if total_in_community > 0 {
                same_service as f64 / total_in_community as f64
            } else {
                0.0
            };
            let mut members: Vec<&String> = community.iter().collect();
            members.sort();
            for node in members {
                let declared = kg.attr_str(node, "service_name");
                if !declared.is_empty() && declared != *dominant {
                    let file = kg.attr_str(node, "file_path");
                    misplaced.push(MisplacedFile {
                        file: if file.is_empty() { node.clone() } else { file },
                        declared_service: declared,
                        community_service: dominant.clone(),
                        confidence: round3(confidence),
                    });
                }
            }
        }

        let services_declared = file_nodes
            .iter()
            .map(|n| kg.attr_str(n, "service_name"))
            .filter(|s| !s.is_empty())
            .collect::<HashSet<_>>()
            .len();

        let mut isolated_files: Vec<String> = file_nodes
            .iter()
            .filter(|n| file_subgraph.undirected_degree(n) == 0)
            .map(|n| {
                let file = kg.attr_str(n, "file_path");
                if file.is_empty() { n.clone() } else { file }
            })
            .collect();
        isolated_files.sort();

        let total_files = file_nodes.len();
        let alignment_score = (total_files - misplaced.len()) as f64 / total_files as f64;

        // Cross-service coupling over every edge in the graph.
        let mut coupling: BTreeMap<(String, String), usize> = BTreeMap::new();
        for edge in kg.edges() {
            let u_svc = kg.attr_str(&edge.source, "service_name");
            let v_svc = kg.attr_str(&edge.target, "service_name");
            if !u_svc.is_empty() && !v_svc.is_empty() && u_svc != v_svc {
                let pair = if u_svc < v_svc { (u_svc, v_svc) } else { (v_svc, u_svc) };
                *coupling.entry(pair).or_insert(0) += 1;
            }
        }
        let mut service_coupling: Vec<ServiceCoupling> = coupling
            .into_iter()
            .map(|((a, b), count)| ServiceCoupling {
                service_a: a,
                service_b: b,
                cross_edges: count,
            })
            .collect();
        service_coupling.sort_by(|a, b| {
            b.cross_edges
                .cmp(&a.cross_edges)
                .then_with(|| a.service_a.cmp(&b.service_a))
        });

        BoundaryValidation {
            communities_detected: communities.len(),
            services_declared,
            alignment_score: round4(alignment_score),
            misplaced_files: misplaced,
            isolated_files,
            service_coupling,
        }
    }

    // ==================================================================
    // Tool 7: check_cross_service_events
    // ==================================================================

    pub fn check_cross_service_events(&self, service_name: &str) -> EventValidation {
        let kg = self.kg.read().expect("graph lock poisoned");

        let mut event_nodes: Vec<String> = kg
            .node_ids()
            .filter(|n| kg.attr_str(n, "node_type") == "event")
            .map(str::to_string)
            .collect();
        event_nodes.sort();

        // Event nodes use shared identity and carry no service qualifier;
        // a service filter inspects the connected publisher/consumer edges.
        if !service_name.is_empty() {
            event_nodes.retain(|n| {
                kg.in_edges(n).iter().any(|e| {
                    matches!(e.relation.as_str(), "PUBLISHES_EVENT" | "CONSUMES_EVENT")
                        && kg.attr_str(&e.source, "service_name") == service_name
                })
            });
        }

        let mut matched = Vec::new();
        let mut orphaned = Vec::new();
        let mut unmatched = Vec::new();

        for event_node in &event_nodes {
            let mut publishers = Vec::new();
            let mut consumers = Vec::new();
            for edge in kg.in_edges(event_node) {
                match edge.relation.as_str() {
                    "PUBLISHES_EVENT" => publishers.push(kg.attr_str(&edge.source, "service_name")),
                    "CONSUMES_EVENT" => consumers.push(kg.attr_str(&edge.source, "service_name")),
                    _ => {}
                }
            }
            publishers.sort();
            consumers.sort();

            let entry = EventEntry {
                event_name: kg.attr_str(event_node, "event_name"),
                channel: kg.attr_str(event_node, "channel"),
                publishers: publishers.clone(),
                consumers: consumers.clone(),
            };

            match (!publishers.is_empty(), !consumers.is_empty()) {
                (true, true) => matched.push(entry),
                (true, false) => orphaned.push(entry),
                (false, true) => unmatched.push(entry),
                (false, false) => {}
            }
        }

        let total = event_nodes.len();
        let match_rate = if total > 0 {
            matched.len() as f64 / total as f64
        } else {
            1.0
        };

        EventValidation {
            orphaned_events: orphaned,
            unmatched_consumers: unmatched,
            matched_events: matched,
            total_events: total,
            match_rate: round4(match_rate),
        }
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn parse_csv(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_fields_json(raw: &str) -> Vec<Value> {
    serde_json::from_str::<Vec<Value>>(raw).unwrap_or_default()
}

fn node_json(kg: &KnowledgeGraph, id: &str) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("id".to_string(), json!(id));
    if let Some(attrs) = kg.get_node(id) {
        for (k, v) in attrs {
            obj.insert(k.clone(), v.clone());
        }
    }
    Value::Object(obj)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}
