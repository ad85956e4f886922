//! MCP tool surface: seven knowledge-graph tools over stdio JSON-RPC.

pub mod server;

pub use server::{McpServer, ServerPaths};
