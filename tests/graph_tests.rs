//! Indexer-to-engine integration over a realistic three-service corpus,
//! plus the graph-level invariants.

use buildsmith_models::{DomainEntity, EdgeKind, ServiceInfo, ServiceMap};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use buildsmith::graph::engine::GraphRagEngine;
use buildsmith::graph::indexer::{
    ContractRow, DependencyRow, EndpointDecl, GraphDb, GraphRagIndexer, ServiceInterface,
    SourceData, SymbolRow,
};
use buildsmith::graph::knowledge::KnowledgeGraph;
use buildsmith::graph::store::VectorStore;

struct Harness {
    kg: Arc<RwLock<KnowledgeGraph>>,
    engine: GraphRagEngine,
    indexer: GraphRagIndexer,
}

fn harness() -> Harness {
    let kg = Arc::new(RwLock::new(KnowledgeGraph::new()));
    let store = Arc::new(VectorStore::open_in_memory().unwrap());
    let db = Arc::new(GraphDb::open_in_memory().unwrap());
    Harness {
        kg: kg.clone(),
        engine: GraphRagEngine::new(kg.clone(), store.clone()),
        indexer: GraphRagIndexer::new(kg, store, db),
    }
}

/// Three services: auth publishes user.registered (nobody consumes),
/// order publishes order.created, notification consumes it. Order's
/// checkout symbol calls auth's login symbol across service lines.
fn commerce_source() -> SourceData {
    let mut source = SourceData::default();

    source.service_map = Some(ServiceMap {
        services: vec![
            ServiceInfo::named("auth-service"),
            ServiceInfo::named("order-service"),
            ServiceInfo::named("notification-service"),
        ],
    });

    source.symbols = vec![
        SymbolRow {
            file_path: "auth/login.py".into(),
            symbol_name: "login_user".into(),
            kind: "function".into(),
            language: "python".into(),
            service_name: "auth-service".into(),
            signature: "def login_user(email, password)".into(),
            ..SymbolRow::default()
        },
        SymbolRow {
            file_path: "auth/models.py".into(),
            symbol_name: "UserModel".into(),
            kind: "class".into(),
            language: "python".into(),
            service_name: "auth-service".into(),
            ..SymbolRow::default()
        },
        SymbolRow {
            file_path: "orders/checkout.py".into(),
            symbol_name: "create_order".into(),
            kind: "function".into(),
            language: "python".into(),
            service_name: "order-service".into(),
            ..SymbolRow::default()
        },
    ];

    source.dependency_edges = vec![DependencyRow {
        source_symbol_id: "orders/checkout.py::create_order".into(),
        target_symbol_id: "auth/login.py::login_user".into(),
        relation: "calls".into(),
        source_file: "orders/checkout.py".into(),
        target_file: "auth/login.py".into(),
        line: 42,
    }];

    source.contracts = vec![
        ContractRow {
            id: "auth-service".into(),
            contract_type: "openapi".into(),
            version: "1.0.0".into(),
            service_name: "auth-service".into(),
            status: "active".into(),
            spec: json!({
                "openapi": "3.0.0",
                "paths": {
                    "/login": {"post": {"summary": "Log a user in"}},
                    "/users/{id}": {"get": {"summary": "Fetch a user"}}
                }
            }),
        },
        ContractRow {
            id: "order-service-events".into(),
            contract_type: "asyncapi".into(),
            version: "1.0.0".into(),
            service_name: "order-service".into(),
            status: "active".into(),
            spec: json!({
                "asyncapi": "2.0.0",
                "channels": {"order.created": {"publish": {}}}
            }),
        },
    ];

    source.domain_model = Some(buildsmith_models::DomainModel {
        entities: vec![DomainEntity {
            name: "User".into(),
            description: "An account holder".into(),
            owning_service: "auth-service".into(),
            referenced_by: vec!["order-service".into()],
            ..DomainEntity::default()
        }],
    });

    let mut interfaces = BTreeMap::new();
    interfaces.insert(
        "auth-service".to_string(),
        ServiceInterface {
            endpoints: vec![EndpointDecl {
                method: "post".into(),
                path: "/login".into(),
                handler: "login_user".into(),
            }],
            events_published: vec!["user.registered".into()],
            events_consumed: vec![],
        },
    );
    interfaces.insert(
        "notification-service".to_string(),
        ServiceInterface {
            endpoints: vec![],
            events_published: vec![],
            events_consumed: vec!["order.created".into()],
        },
    );
    source.service_interfaces = interfaces;
    source
}

#[test]
fn scenario_event_reconciliation() {
    let h = harness();
    let result = h.indexer.build(&commerce_source());
    assert!(result.success, "errors: {:?}", result.errors);
    h.engine.refresh_undirected_cache();

    let events = h.engine.check_cross_service_events("");
    assert_eq!(events.total_events, 2);
    assert_eq!(events.matched_events.len(), 1);
    assert_eq!(events.matched_events[0].event_name, "order.created");
    assert_eq!(events.orphaned_events.len(), 1);
    assert_eq!(events.orphaned_events[0].event_name, "user.registered");
    assert_eq!(events.match_rate, 0.5);
}

#[test]
fn every_edge_uses_the_declared_vocabulary() {
    let h = harness();
    h.indexer.build(&commerce_source());
    let kg = h.kg.read().unwrap();
    for edge in kg.edges() {
        assert!(
            EdgeKind::parse(&edge.relation).is_some(),
            "edge relation {} not in vocabulary",
            edge.relation
        );
        assert_eq!(
            edge.attrs.get("relation").and_then(|v| v.as_str()),
            Some(edge.relation.as_str()),
            "edge must carry its relation attribute"
        );
    }
}

#[test]
fn handler_matching_wires_handles_endpoint() {
    let h = harness();
    h.indexer.build(&commerce_source());
    let kg = h.kg.read().unwrap();

    let endpoint = "endpoint::auth-service::POST::/login";
    assert!(kg.contains(endpoint));
    let handler = kg.attr_str(endpoint, "handler_symbol");
    assert_eq!(handler, "symbol::auth/login.py::login_user");
    let incoming: Vec<_> = kg
        .in_edges(endpoint)
        .into_iter()
        .filter(|e| e.relation == "HANDLES_ENDPOINT")
        .collect();
    assert_eq!(incoming.len(), 1);
}

#[test]
fn service_calls_derived_from_cross_service_file_imports() {
    let h = harness();
    let mut source = commerce_source();
    // Seed graph from the code-intelligence store: a file-level import
    // from order-service into auth-service.
    source.existing_graph_json = Some(
        json!({
            "directed": true,
            "multigraph": true,
            "nodes": [
                {"id": "file::orders/checkout.py", "node_type": "file",
                 "file_path": "orders/checkout.py"},
                {"id": "file::auth/login.py", "node_type": "file",
                 "file_path": "auth/login.py"},
            ],
            "edges": [
                {"source": "file::orders/checkout.py",
                 "target": "file::auth/login.py", "key": "IMPORTS"},
            ],
        })
        .to_string(),
    );
    h.indexer.build(&source);

    let kg = h.kg.read().unwrap();
    let service_calls: Vec<_> = kg
        .out_edges("service::order-service")
        .into_iter()
        .filter(|e| e.relation == "SERVICE_CALLS")
        .collect();
    assert_eq!(service_calls.len(), 1);
    assert_eq!(service_calls[0].target, "service::auth-service");
    assert!(
        service_calls[0].attrs.contains_key("via_endpoint"),
        "SERVICE_CALLS must carry via_endpoint"
    );
}

#[test]
fn referenced_entities_appear_in_service_context() {
    let h = harness();
    h.indexer.build(&commerce_source());
    h.engine.refresh_undirected_cache();

    let context = h.engine.get_service_context("order-service");
    assert!(context.error.is_none());
    assert_eq!(context.referenced_entities.len(), 1);
    assert_eq!(context.referenced_entities[0].name, "User");
    assert_eq!(context.referenced_entities[0].owning_service, "auth-service");

    let auth = h.engine.get_service_context("auth-service");
    assert_eq!(auth.owned_entities.len(), 1);
    assert_eq!(auth.events_published.len(), 1);
    assert!(auth.context_text.contains("## Graph RAG Context: auth-service"));
}

#[test]
fn hybrid_search_finds_indexed_symbols() {
    let h = harness();
    h.indexer.build(&commerce_source());
    h.engine.refresh_undirected_cache();

    let result = h.engine.hybrid_search("login user function", 5, "", "symbol", "", 0.6, 0.4);
    assert!(!result.results.is_empty());
    assert!(
        result
            .results
            .iter()
            .any(|hit| hit.node_id == "symbol::auth/login.py::login_user"),
        "expected the login symbol among {:?}",
        result.results.iter().map(|r| &r.node_id).collect::<Vec<_>>()
    );
    for hit in &result.results {
        assert_eq!(hit.node_type, "symbol");
        assert!(hit.score >= 0.0);
    }
}

#[test]
fn cross_service_impact_spans_symbol_dependencies() {
    let h = harness();
    h.indexer.build(&commerce_source());
    h.engine.refresh_undirected_cache();

    let impact = h
        .engine
        .find_cross_service_impact("symbol::auth/login.py::login_user", 3);
    assert_eq!(impact.source_service, "auth-service");
    assert!(
        impact
            .impacted_services
            .iter()
            .any(|s| s.service_name == "order-service"),
        "order-service should be impacted: {:?}",
        impact.impacted_services
    );
    assert!(impact.total_impacted_nodes > 0);
}

#[test]
fn neighborhood_truncation_reports_pre_truncation_total() {
    let h = harness();
    h.indexer.build(&commerce_source());

    let hood = h
        .engine
        .query_graph_neighborhood("service::auth-service", 2, true, "", "", 3);
    assert!(hood.total_nodes_in_neighborhood > 3);
    assert!(hood.truncated);
    assert_eq!(hood.nodes.len(), 3);
    assert_eq!(hood.center_node["id"], json!("service::auth-service"));
}

#[test]
fn boundary_validation_over_indexed_files() {
    let h = harness();
    h.indexer.build(&commerce_source());
    let boundaries = h.engine.validate_service_boundaries(1.0);
    // Files in this corpus barely interconnect; what matters is that the
    // computation is well-formed and deterministic.
    assert!(boundaries.alignment_score >= 0.0 && boundaries.alignment_score <= 1.0);
    let again = h.engine.validate_service_boundaries(1.0);
    assert_eq!(boundaries.misplaced_files.len(), again.misplaced_files.len());
    assert_eq!(boundaries.communities_detected, again.communities_detected);
}

#[test]
fn graph_json_round_trip_preserves_everything() {
    let h = harness();
    let result = h.indexer.build(&commerce_source());

    let kg = h.kg.read().unwrap();
    let raw = kg.to_json().unwrap();
    let mut restored = KnowledgeGraph::new();
    restored.from_json(&raw).unwrap();

    assert_eq!(restored.node_count(), result.node_count);
    assert_eq!(restored.edge_count(), result.edge_count);
    // Attribute spot checks survive the round trip.
    assert_eq!(
        restored.attr_str("symbol::auth/login.py::login_user", "signature"),
        "def login_user(email, password)"
    );
    assert_eq!(
        restored.attr_str("domain_entity::user", "owning_service"),
        "auth-service"
    );
}
