//! Knowledge-graph subsystem ("Graph RAG"): typed multigraph, metrics,
//! vector store, five-phase indexer, and the seven-tool query engine.

pub mod assembler;
pub mod engine;
pub mod indexer;
pub mod knowledge;
pub mod louvain;
pub mod pagerank;
pub mod store;

pub use assembler::ContextAssembler;
pub use engine::GraphRagEngine;
pub use indexer::{GraphRagIndexer, SourceData};
pub use knowledge::KnowledgeGraph;
pub use store::VectorStore;
