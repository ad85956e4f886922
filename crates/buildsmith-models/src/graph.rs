//! Knowledge-graph record shapes shared between indexer, engine, and store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Types of nodes in the knowledge graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Symbol,
    Service,
    Contract,
    Endpoint,
    DomainEntity,
    Event,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Symbol => "symbol",
            NodeKind::Service => "service",
            NodeKind::Contract => "contract",
            NodeKind::Endpoint => "endpoint",
            NodeKind::DomainEntity => "domain_entity",
            NodeKind::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(NodeKind::File),
            "symbol" => Some(NodeKind::Symbol),
            "service" => Some(NodeKind::Service),
            "contract" => Some(NodeKind::Contract),
            "endpoint" => Some(NodeKind::Endpoint),
            "domain_entity" => Some(NodeKind::DomainEntity),
            "event" => Some(NodeKind::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Types of edges in the knowledge graph.
///
/// Every edge stores a `relation` attribute equal to its kind string so
/// that serialized multigraph edges stay self-describing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    ContainsFile,
    DefinesSymbol,
    Imports,
    Calls,
    Inherits,
    Implements,
    ProvidesContract,
    ExposesEndpoint,
    HandlesEndpoint,
    OwnsEntity,
    ReferencesEntity,
    ImplementsEntity,
    PublishesEvent,
    ConsumesEvent,
    ServiceCalls,
    DomainRelationship,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 16] = [
        EdgeKind::ContainsFile,
        EdgeKind::DefinesSymbol,
        EdgeKind::Imports,
        EdgeKind::Calls,
        EdgeKind::Inherits,
        EdgeKind::Implements,
        EdgeKind::ProvidesContract,
        EdgeKind::ExposesEndpoint,
        EdgeKind::HandlesEndpoint,
        EdgeKind::OwnsEntity,
        EdgeKind::ReferencesEntity,
        EdgeKind::ImplementsEntity,
        EdgeKind::PublishesEvent,
        EdgeKind::ConsumesEvent,
        EdgeKind::ServiceCalls,
        EdgeKind::DomainRelationship,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::ContainsFile => "CONTAINS_FILE",
            EdgeKind::DefinesSymbol => "DEFINES_SYMBOL",
            EdgeKind::Imports => "IMPORTS",
            EdgeKind::Calls => "CALLS",
            EdgeKind::Inherits => "INHERITS",
            EdgeKind::Implements => "IMPLEMENTS",
            EdgeKind::ProvidesContract => "PROVIDES_CONTRACT",
            EdgeKind::ExposesEndpoint => "EXPOSES_ENDPOINT",
            EdgeKind::HandlesEndpoint => "HANDLES_ENDPOINT",
            EdgeKind::OwnsEntity => "OWNS_ENTITY",
            EdgeKind::ReferencesEntity => "REFERENCES_ENTITY",
            EdgeKind::ImplementsEntity => "IMPLEMENTS_ENTITY",
            EdgeKind::PublishesEvent => "PUBLISHES_EVENT",
            EdgeKind::ConsumesEvent => "CONSUMES_EVENT",
            EdgeKind::ServiceCalls => "SERVICE_CALLS",
            EdgeKind::DomainRelationship => "DOMAIN_RELATIONSHIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of building/rebuilding the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GraphBuildResult {
    pub success: bool,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub edge_count: usize,
    #[serde(default)]
    pub node_types: BTreeMap<String, usize>,
    #[serde(default)]
    pub edge_types: BTreeMap<String, usize>,
    #[serde(default)]
    pub community_count: usize,
    #[serde(default)]
    pub build_time_ms: u64,
    #[serde(default)]
    pub services_indexed: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A record to upsert into the `nodes` vector collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub document: String,
    pub node_type: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default = "default_community")]
    pub community_id: i64,
    #[serde(default)]
    pub pagerank: f64,
}

fn default_community() -> i64 {
    -1
}

/// A record to upsert into the `contexts` vector collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextRecord {
    pub id: String,
    pub document: String,
    /// Either `"service"` or `"community"`.
    pub context_type: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default = "default_community")]
    pub community_id: i64,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub edge_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_kind_roundtrips_through_strings() {
        for kind in EdgeKind::ALL {
            assert_eq!(EdgeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EdgeKind::parse("NOT_AN_EDGE"), None);
    }

    #[test]
    fn node_kind_parse_matches_display() {
        for kind in [
            NodeKind::File,
            NodeKind::Symbol,
            NodeKind::Service,
            NodeKind::Contract,
            NodeKind::Endpoint,
            NodeKind::DomainEntity,
            NodeKind::Event,
        ] {
            assert_eq!(NodeKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn edge_kind_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&EdgeKind::ProvidesContract).unwrap();
        assert_eq!(json, "\"PROVIDES_CONTRACT\"");
    }

    #[test]
    fn node_record_defaults() {
        let record: NodeRecord = serde_json::from_str(
            r#"{"id": "file::src/a.py", "document": "File: src/a.py.", "node_type": "file"}"#,
        )
        .unwrap();
        assert_eq!(record.community_id, -1);
        assert_eq!(record.pagerank, 0.0);
    }
}
