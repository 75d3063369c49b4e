//! Dominator and post-dominator trees over a control-flow graph.

use std::collections::BTreeSet;

use tracing::debug;

use crate::cfg::ControlFlowGraph;
use crate::opcodes;
use crate::stream::InsnStream;

/// One node of a [`DomTree`]. `block` is the graph block index the node
/// stands for, or `None` for the synthetic exit root of a post-dominator
/// tree.
#[derive(Clone, Debug)]
pub struct DomNode {
    block: Option<usize>,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl DomNode {
    pub fn block(&self) -> Option<usize> {
        self.block
    }

    /// Immediate dominator, as a node index. `None` for the root and for
    /// blocks the analysis never reached.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Immediately dominated nodes, in block order.
    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

/// Dominator tree computed by iterated dataflow set intersection.
///
/// Node indices coincide with block indices; a post-dominator tree carries
/// one extra node after the blocks, the synthetic exit that roots it.
/// Blocks unreachable from the root are left parentless and answer `false`
/// to [`DomTree::contains`].
pub struct DomTree {
    nodes: Vec<DomNode>,
    root: usize,
}

impl DomTree {
    /// Dominator tree rooted at the entry block.
    pub fn dominators(cfg: &ControlFlowGraph) -> Self {
        if cfg.is_empty() {
            return Self {
                nodes: Vec::new(),
                root: 0,
            };
        }
        let successors: Vec<Vec<usize>> = cfg
            .blocks()
            .iter()
            .map(|block| block.successors().to_vec())
            .collect();
        let predecessors: Vec<Vec<usize>> = cfg
            .blocks()
            .iter()
            .map(|block| block.predecessors().to_vec())
            .collect();
        let tree = Self::solve(0, &successors, &predecessors, cfg.len(), cfg.len());
        debug!(nodes = tree.nodes.len(), "built dominator tree");
        tree
    }

    /// Post-dominator tree rooted at a synthetic exit node.
    ///
    /// The exit node is appended after the block nodes and collects an edge
    /// from every block whose last instruction leaves the method, so methods
    /// with several returns still post-dominate through a single root.
    pub fn post_dominators(stream: &InsnStream, cfg: &ControlFlowGraph) -> Self {
        if cfg.is_empty() {
            return Self {
                nodes: Vec::new(),
                root: 0,
            };
        }
        let exit = cfg.len();
        // Reversed edges: walk from the exit back through predecessors.
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); exit + 1];
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); exit + 1];
        for (index, block) in cfg.blocks().iter().enumerate() {
            successors[index] = block.predecessors().to_vec();
            predecessors[index] = block.successors().to_vec();
            let leaves_method = stream
                .get(block.end_index() - 1)
                .is_some_and(|insn| {
                    opcodes::is_exit(insn.opcode()) || insn.opcode() == opcodes::RET
                });
            if leaves_method {
                successors[exit].push(index);
                predecessors[index].push(exit);
            }
        }
        let tree = Self::solve(exit, &successors, &predecessors, exit + 1, exit);
        debug!(nodes = tree.nodes.len(), "built post-dominator tree");
        tree
    }

    fn solve(
        root: usize,
        successors: &[Vec<usize>],
        predecessors: &[Vec<usize>],
        node_count: usize,
        block_count: usize,
    ) -> Self {
        let reachable = reach(root, successors, node_count);
        let everything: BTreeSet<usize> = (0..node_count).filter(|n| reachable[*n]).collect();

        let mut dominators: Vec<BTreeSet<usize>> = (0..node_count)
            .map(|node| {
                if node == root {
                    BTreeSet::from([root])
                } else if reachable[node] {
                    everything.clone()
                } else {
                    BTreeSet::new()
                }
            })
            .collect();

        // Fixed point: dom(n) = {n} union the intersection over reachable
        // predecessors.
        let mut changed = true;
        while changed {
            changed = false;
            for node in 0..node_count {
                if node == root || !reachable[node] {
                    continue;
                }
                let mut merged: Option<BTreeSet<usize>> = None;
                for pred in &predecessors[node] {
                    if !reachable[*pred] {
                        continue;
                    }
                    merged = Some(match merged {
                        None => dominators[*pred].clone(),
                        Some(set) => set.intersection(&dominators[*pred]).copied().collect(),
                    });
                }
                let mut next = merged.unwrap_or_default();
                next.insert(node);
                if next != dominators[node] {
                    dominators[node] = next;
                    changed = true;
                }
            }
        }

        // The immediate dominator is the strict dominator closest to the
        // node, the one whose own set is largest.
        let mut nodes: Vec<DomNode> = (0..node_count)
            .map(|node| DomNode {
                block: if node < block_count { Some(node) } else { None },
                parent: None,
                children: Vec::new(),
            })
            .collect();
        for node in 0..node_count {
            if node == root || !reachable[node] {
                continue;
            }
            let parent = dominators[node]
                .iter()
                .filter(|candidate| **candidate != node)
                .max_by_key(|candidate| dominators[**candidate].len())
                .copied();
            nodes[node].parent = parent;
        }
        for node in 0..node_count {
            if let Some(parent) = nodes[node].parent {
                nodes[parent].children.push(node);
            }
        }

        Self { nodes, root }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root node index: the entry block, or the synthetic exit for a
    /// post-dominator tree.
    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, index: usize) -> Option<&DomNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[DomNode] {
        &self.nodes
    }

    /// Immediate dominator of a node.
    pub fn parent(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).and_then(|node| node.parent)
    }

    pub fn children(&self, index: usize) -> &[usize] {
        self.nodes
            .get(index)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the node was reachable from the root and so takes part in
    /// the tree.
    pub fn contains(&self, index: usize) -> bool {
        index == self.root
            || self
                .nodes
                .get(index)
                .is_some_and(|node| node.parent.is_some())
    }

    /// Whether `dominator` lies on every path from the root to `node`.
    /// Every node dominates itself.
    pub fn dominates(&self, dominator: usize, node: usize) -> bool {
        if !self.contains(dominator) || !self.contains(node) {
            return false;
        }
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == dominator {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }
}

fn reach(root: usize, successors: &[Vec<usize>], node_count: usize) -> Vec<bool> {
    let mut reachable = vec![false; node_count];
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if reachable[node] {
            continue;
        }
        reachable[node] = true;
        for successor in &successors[node] {
            if !reachable[*successor] {
                stack.push(*successor);
            }
        }
    }
    reachable
}
