//! Stdio JSON-RPC server exposing the Graph RAG tools.
//!
//! Requests are newline-delimited JSON-RPC 2.0. Tool failures are
//! encoded inside the result payload as `{"success": false, "error":
//! ...}` rather than transport-level faults; only malformed requests get
//! a JSON-RPC error object. CPU-bound tool work runs on a blocking
//! thread so the reader task keeps draining stdin.

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use crate::graph::engine::{DEFAULT_GRAPH_WEIGHT, DEFAULT_SEMANTIC_WEIGHT};
use crate::graph::indexer::{GraphRagIndexer, ServiceInterface, SourceData};
use crate::graph::GraphRagEngine;

/// Reuse window for `force_rebuild=false` snapshot hits.
const SNAPSHOT_REUSE_SECS: i64 = 300;

/// The seven tools served over the wire.
pub const TOOL_NAMES: [&str; 7] = [
    "build_knowledge_graph",
    "get_service_context",
    "query_graph_neighborhood",
    "hybrid_search",
    "find_cross_service_impact",
    "validate_service_boundaries",
    "check_cross_service_events",
];

/// Artifact locations the indexer loads from.
#[derive(Debug, Clone, Default)]
pub struct ServerPaths {
    pub service_map: Option<PathBuf>,
    pub domain_model: Option<PathBuf>,
    pub contracts_dir: Option<PathBuf>,
}

/// The Graph RAG MCP server.
pub struct McpServer {
    engine: Arc<GraphRagEngine>,
    indexer: Arc<GraphRagIndexer>,
    paths: ServerPaths,
}

impl McpServer {
    pub fn new(engine: Arc<GraphRagEngine>, indexer: Arc<GraphRagIndexer>, paths: ServerPaths) -> Self {
        Self {
            engine,
            indexer,
            paths,
        }
    }

    /// Serve requests from stdin until EOF.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        info!("Graph RAG MCP server listening on stdio");
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let server = self.clone();
            let response =
                tokio::task::spawn_blocking(move || server.handle_line(&line)).await?;
            stdout.write_all(response.to_string().as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok(())
    }

    fn handle_line(&self, line: &str) -> Value {
        match serde_json::from_str::<Value>(line) {
            Ok(request) => self.handle_request(&request),
            Err(e) => json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": {"code": -32700, "message": format!("Parse error: {e}")},
            }),
        }
    }

    /// Handle one JSON-RPC request synchronously.
    pub fn handle_request(&self, request: &Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");

        match method {
            "initialize" => rpc_result(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "buildsmith-graph-rag", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {"tools": {}},
                }),
            ),
            "tools/list" => rpc_result(
                id,
                json!({
                    "tools": TOOL_NAMES
                        .iter()
                        .map(|name| json!({"name": name}))
                        .collect::<Vec<_>>(),
                }),
            ),
            "tools/call" => {
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let args = params.get("arguments").cloned().unwrap_or(json!({}));
                rpc_result(id, self.call_tool(name, &args))
            }
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("Method not found: {method}")},
            }),
        }
    }

    /// Dispatch one tool call. Failures are payload-level.
    pub fn call_tool(&self, name: &str, args: &Value) -> Value {
        let result = match name {
            "build_knowledge_graph" => self.tool_build(args),
            "get_service_context" => {
                let service = str_arg(args, "service_name");
                serde_json::to_value(self.engine.get_service_context(&service))
                    .map_err(|e| e.to_string())
            }
            "query_graph_neighborhood" => serde_json::to_value(self.engine.query_graph_neighborhood(
                &str_arg(args, "node_id"),
                usize_arg(args, "radius", 2),
                args.get("undirected").and_then(Value::as_bool).unwrap_or(true),
                &str_arg(args, "filter_node_types"),
                &str_arg(args, "filter_edge_types"),
                usize_arg(args, "max_nodes", 50),
            ))
            .map_err(|e| e.to_string()),
            "hybrid_search" => serde_json::to_value(self.engine.hybrid_search(
                &str_arg(args, "query"),
                usize_arg(args, "n_results", 10),
                &str_arg(args, "anchor_node_id"),
                &str_arg(args, "node_types"),
                &str_arg(args, "service_name"),
                f64_arg(args, "semantic_weight", DEFAULT_SEMANTIC_WEIGHT),
                f64_arg(args, "graph_weight", DEFAULT_GRAPH_WEIGHT),
            ))
            .map_err(|e| e.to_string()),
            "find_cross_service_impact" => serde_json::to_value(self.engine.find_cross_service_impact(
                &str_arg(args, "node_id"),
                usize_arg(args, "max_depth", 3),
            ))
            .map_err(|e| e.to_string()),
            "validate_service_boundaries" => serde_json::to_value(
                self.engine
                    .validate_service_boundaries(f64_arg(args, "resolution", 1.0)),
            )
            .map_err(|e| e.to_string()),
            "check_cross_service_events" => serde_json::to_value(
                self.engine
                    .check_cross_service_events(&str_arg(args, "service_name")),
            )
            .map_err(|e| e.to_string()),
            other => Err(format!("Unknown tool: {other}")),
        };

        match result {
            Ok(value) => value,
            Err(error) => json!({"success": false, "error": error}),
        }
    }

    fn tool_build(&self, args: &Value) -> Result<Value, String> {
        let force_rebuild = args
            .get("force_rebuild")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        if !force_rebuild
            && let Ok(Some(row)) = self.indexer.db().latest_snapshot()
        {
            let age = (Utc::now() - row.created_at).num_seconds();
            if age < SNAPSHOT_REUSE_SECS {
                return Ok(json!({
                    "success": true,
                    "cached": true,
                    "node_count": row.node_count,
                    "edge_count": row.edge_count,
                    "community_count": row.community_count,
                    "services_indexed": row.services_indexed,
                }));
            }
        }

        let interfaces: BTreeMap<String, ServiceInterface> = args
            .get("service_interfaces_json")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let source = SourceData::load(
            self.paths.service_map.as_deref(),
            self.paths.domain_model.as_deref(),
            self.paths.contracts_dir.as_deref(),
            interfaces,
        );
        let result = self.indexer.build(&source);
        self.engine.refresh_undirected_cache();
        serde_json::to_value(&result).map_err(|e| e.to_string())
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn usize_arg(args: &Value, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn f64_arg(args: &Value, key: &str, default: f64) -> f64 {
    args.get(key).and_then(Value::as_f64).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::indexer::GraphDb;
    use crate::graph::knowledge::KnowledgeGraph;
    use crate::graph::store::VectorStore;
    use buildsmith_models::{ServiceInfo, ServiceMap};
    use std::sync::RwLock;

    fn server_with_artifacts(dir: &std::path::Path) -> McpServer {
        let map = ServiceMap {
            services: vec![
                ServiceInfo::named("auth-service"),
                ServiceInfo::named("order-service"),
            ],
        };
        let map_path = dir.join("service_map.json");
        std::fs::write(&map_path, serde_json::to_string(&map).unwrap()).unwrap();

        let kg = Arc::new(RwLock::new(KnowledgeGraph::new()));
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let db = Arc::new(GraphDb::open_in_memory().unwrap());
        let engine = Arc::new(GraphRagEngine::new(kg.clone(), store.clone()));
        let indexer = Arc::new(GraphRagIndexer::new(kg, store, db));
        McpServer::new(
            engine,
            indexer,
            ServerPaths {
                service_map: Some(map_path),
                domain_model: None,
                contracts_dir: None,
            },
        )
    }

    #[test]
    fn tools_list_names_all_seven() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_artifacts(dir.path());
        let response = server.handle_request(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }));
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 7);
    }

    #[test]
    fn build_then_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_artifacts(dir.path());

        let build = server.call_tool("build_knowledge_graph", &json!({}));
        assert_eq!(build["success"], json!(true));
        assert_eq!(build["node_count"], json!(2));

        let context = server.call_tool(
            "get_service_context",
            &json!({"service_name": "auth-service"}),
        );
        assert_eq!(context["service_name"], json!("auth-service"));
        assert!(context.get("error").is_none());
    }

    #[test]
    fn unknown_tool_is_a_payload_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_artifacts(dir.path());
        let result = server.call_tool("no_such_tool", &json!({}));
        assert_eq!(result["success"], json!(false));
        assert!(result["error"].as_str().unwrap().contains("no_such_tool"));
    }

    #[test]
    fn malformed_method_is_a_jsonrpc_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_artifacts(dir.path());
        let response = server.handle_request(&json!({
            "jsonrpc": "2.0", "id": 7, "method": "bogus/method"
        }));
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["id"], json!(7));
    }

    #[test]
    fn stale_check_reuses_fresh_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_artifacts(dir.path());

        // First build persists a snapshot.
        server.call_tool("build_knowledge_graph", &json!({}));
        // Second call with force_rebuild=false hits the cache.
        let cached = server.call_tool("build_knowledge_graph", &json!({"force_rebuild": false}));
        assert_eq!(cached["cached"], json!(true));
        assert_eq!(cached["node_count"], json!(2));
    }

    #[test]
    fn event_check_over_rpc_payload() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_artifacts(dir.path());
        server.call_tool("build_knowledge_graph", &json!({}));
        let result = server.call_tool("check_cross_service_events", &json!({}));
        assert_eq!(result["total_events"], json!(0));
        assert_eq!(result["match_rate"], json!(1.0));
    }
}
