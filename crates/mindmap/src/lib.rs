use thiserror::Error;

mod graph;
pub use graph::*;
mod commands;
pub use commands::*;
mod reconcile;
pub use reconcile::*;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MindmapError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("node already exists: {0}")]
    NodeExists(NodeId),
    #[error("edge already exists: {0}")]
    EdgeExists(EdgeId),
    #[error("edge {edge} references missing node {node}")]
    DanglingEdge { edge: EdgeId, node: NodeId },
    #[error("history empty: {0}")]
    HistoryEmpty(&'static str),
    #[error("no free edge id after {0} attempts")]
    IdSpaceExhausted(usize),
}
