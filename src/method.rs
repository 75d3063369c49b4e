//! Per-method analysis pipeline: decode, partition, connect.

use jclassfile::constant_pool::ConstantPool;
use tracing::debug;

use crate::cfg::{ControlFlowGraph, ExceptionHandler};
use crate::dominators::DomTree;
use crate::error::Result;
use crate::stream::{InsnStream, LineNumber};

/// Decoded view of one method body: the instruction stream and its
/// control-flow graph, built together so block ranges always index into
/// the stream they were cut from.
pub struct MethodAnalysis {
    stream: InsnStream,
    cfg: ControlFlowGraph,
}

impl MethodAnalysis {
    pub fn build(
        code: &[u8],
        constant_pool: &[ConstantPool],
        handlers: &[ExceptionHandler],
        lines: &[LineNumber],
    ) -> Result<Self> {
        let stream = InsnStream::decode(code, constant_pool, lines)?;
        let cfg = ControlFlowGraph::build(&stream, handlers)?;
        debug!(
            instructions = stream.len(),
            blocks = cfg.len(),
            "analyzed method body"
        );
        Ok(Self { stream, cfg })
    }

    pub fn stream(&self) -> &InsnStream {
        &self.stream
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    /// Dominator tree over the graph, computed on demand.
    pub fn dominator_tree(&self) -> DomTree {
        DomTree::dominators(&self.cfg)
    }

    /// Post-dominator tree over the graph, computed on demand.
    pub fn post_dominator_tree(&self) -> DomTree {
        DomTree::post_dominators(&self.stream, &self.cfg)
    }
}
