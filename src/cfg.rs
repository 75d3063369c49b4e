//! Basic-block partitioning and flow-edge construction.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{Error, Result};
use crate::insn::{Insn, Operand};
use crate::opcodes;
use crate::stream::InsnStream;

/// One entry of a method's exception table. `end_pc` is exclusive; a
/// `catch_type` of `None` is a catch-all (finally-style) handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub catch_type: Option<String>,
}

/// Exception catcher applicable to a block: declared catch type (or
/// catch-all) and the handler block it transfers to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Catcher {
    pub catch_type: Option<String>,
    pub handler: usize,
}

/// Maximal straight-line run of instructions, identified by its position in
/// the owning [`ControlFlowGraph`].
#[derive(Clone, Debug)]
pub struct FlowBlock {
    start_index: usize,
    end_index: usize,
    start_offset: u32,
    end_offset: u32,
    successors: Vec<usize>,
    predecessors: Vec<usize>,
    catchers: Vec<Catcher>,
}

impl FlowBlock {
    /// First instruction of the block, as a sequence index.
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    /// One past the last instruction of the block.
    pub fn end_index(&self) -> usize {
        self.end_index
    }

    pub fn start_offset(&self) -> u32 {
        self.start_offset
    }

    /// Exclusive byte-offset bound of the block.
    pub fn end_offset(&self) -> u32 {
        self.end_offset
    }

    /// Successor block indices, normal control edges first, exception edges
    /// after them.
    pub fn successors(&self) -> &[usize] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[usize] {
        &self.predecessors
    }

    pub fn catchers(&self) -> &[Catcher] {
        &self.catchers
    }

    /// Instruction slice backing this block.
    pub fn instructions<'a>(&self, stream: &'a InsnStream) -> &'a [Insn] {
        stream.slice(self.start_index, self.end_index)
    }
}

/// Control-flow graph of one method: the block partition plus an
/// offset-keyed block lookup.
#[derive(Debug)]
pub struct ControlFlowGraph {
    blocks: Vec<FlowBlock>,
    by_offset: BTreeMap<u32, usize>,
}

impl ControlFlowGraph {
    /// Partition the stream into blocks and connect them.
    ///
    /// Successor lists are fully built before predecessors are derived as
    /// the transpose, so the mutual-edge invariant holds by construction.
    pub fn build(stream: &InsnStream, handlers: &[ExceptionHandler]) -> Result<Self> {
        if stream.is_empty() {
            return Ok(Self {
                blocks: Vec::new(),
                by_offset: BTreeMap::new(),
            });
        }

        let boundaries = collect_boundaries(stream, handlers)?;
        let mut blocks = partition(stream, &boundaries);
        let by_offset: BTreeMap<u32, usize> = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.start_offset, index))
            .collect();

        connect_successors(stream, &mut blocks, &by_offset)?;
        connect_exception_edges(&mut blocks, &by_offset, handlers)?;
        // Transpose only after every successor edge exists.
        connect_predecessors(&mut blocks);

        let edges: usize = blocks.iter().map(|block| block.successors.len()).sum();
        debug!(blocks = blocks.len(), edges, "built control flow graph");
        Ok(Self { blocks, by_offset })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in byte-offset order.
    pub fn blocks(&self) -> &[FlowBlock] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&FlowBlock> {
        self.blocks.get(index)
    }

    /// Entry block of the method.
    pub fn entry(&self) -> Option<&FlowBlock> {
        self.blocks.first()
    }

    /// Block starting exactly at `offset`.
    pub fn block_at(&self, offset: u32) -> Option<&FlowBlock> {
        self.by_offset
            .get(&offset)
            .and_then(|index| self.blocks.get(*index))
    }

    pub fn block_index_at(&self, offset: u32) -> Option<usize> {
        self.by_offset.get(&offset).copied()
    }

    /// Successor starting offsets for a block, in edge order.
    pub fn successor_offsets(&self, block: &FlowBlock) -> Vec<u32> {
        block
            .successors
            .iter()
            .filter_map(|index| self.blocks.get(*index))
            .map(|successor| successor.start_offset)
            .collect()
    }

    /// Predecessor starting offsets for a block, in edge order.
    pub fn predecessor_offsets(&self, block: &FlowBlock) -> Vec<u32> {
        block
            .predecessors
            .iter()
            .filter_map(|index| self.blocks.get(*index))
            .map(|predecessor| predecessor.start_offset)
            .collect()
    }
}

/// Collect block-leader sequence indices: method entry, jump and switch
/// targets, the instruction after every terminator, and the bounds of every
/// protected region and handler.
fn collect_boundaries(stream: &InsnStream, handlers: &[ExceptionHandler]) -> Result<BTreeSet<usize>> {
    let mut boundaries = BTreeSet::new();
    boundaries.insert(0);

    for insn in stream.iter() {
        for target in jump_targets(insn) {
            boundaries.insert(target_index(stream, target)?);
        }
        if opcodes::is_terminator(insn.opcode()) {
            let next = insn.offset() + stream.byte_len(insn.seq()).unwrap_or(0);
            if next < stream.code_len() {
                boundaries.insert(target_index(stream, next)?);
            }
        }
    }

    for handler in handlers {
        boundaries.insert(target_index(stream, handler.handler_pc)?);
        boundaries.insert(target_index(stream, handler.start_pc)?);
    }

    Ok(boundaries)
}

/// Pair consecutive boundaries into half-open block ranges.
fn partition(stream: &InsnStream, boundaries: &BTreeSet<usize>) -> Vec<FlowBlock> {
    let mut starts: Vec<usize> = boundaries.iter().copied().collect();
    starts.push(stream.len());
    starts.dedup();

    starts
        .windows(2)
        .map(|window| {
            let (start_index, end_index) = (window[0], window[1]);
            let start_offset = stream
                .get(start_index)
                .map(|insn| insn.offset())
                .unwrap_or(stream.code_len());
            let end_offset = stream
                .get(end_index)
                .map(|insn| insn.offset())
                .unwrap_or(stream.code_len());
            FlowBlock {
                start_index,
                end_index,
                start_offset,
                end_offset,
                successors: Vec::new(),
                predecessors: Vec::new(),
                catchers: Vec::new(),
            }
        })
        .collect()
}

fn connect_successors(
    stream: &InsnStream,
    blocks: &mut [FlowBlock],
    by_offset: &BTreeMap<u32, usize>,
) -> Result<()> {
    let block_count = blocks.len();
    for index in 0..block_count {
        let last = match stream.get(blocks[index].end_index - 1) {
            Some(insn) => insn,
            None => continue,
        };
        let opcode = last.opcode();
        let mut successors = Vec::new();

        if opcodes::is_switch(opcode) {
            for target in jump_targets(last) {
                push_edge(&mut successors, block_index(by_offset, target)?);
            }
        } else if opcodes::is_jump(opcode) {
            if !opcodes::is_unconditional_jump(opcode) {
                push_edge(
                    &mut successors,
                    fall_through(index, block_count, blocks[index].end_offset)?,
                );
            }
            for target in jump_targets(last) {
                push_edge(&mut successors, block_index(by_offset, target)?);
            }
        } else if !opcodes::is_terminator(opcode) {
            push_edge(
                &mut successors,
                fall_through(index, block_count, blocks[index].end_offset)?,
            );
        }
        // Returns, throws, and ret leave no normal successor edges.

        blocks[index].successors = successors;
    }
    Ok(())
}

/// Every block whose byte range intersects a protected region gets an edge
/// to the region's handler, on top of its normal control edges.
fn connect_exception_edges(
    blocks: &mut [FlowBlock],
    by_offset: &BTreeMap<u32, usize>,
    handlers: &[ExceptionHandler],
) -> Result<()> {
    for handler in handlers {
        let handler_block = block_index(by_offset, handler.handler_pc)?;
        for block in blocks.iter_mut() {
            if block.start_offset < handler.end_pc && block.end_offset > handler.start_pc {
                push_edge(&mut block.successors, handler_block);
                block.catchers.push(Catcher {
                    catch_type: handler.catch_type.clone(),
                    handler: handler_block,
                });
            }
        }
    }
    Ok(())
}

fn connect_predecessors(blocks: &mut [FlowBlock]) {
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
    for (index, block) in blocks.iter().enumerate() {
        for successor in &block.successors {
            if !predecessors[*successor].contains(&index) {
                predecessors[*successor].push(index);
            }
        }
    }
    for (block, preds) in blocks.iter_mut().zip(predecessors) {
        block.predecessors = preds;
    }
}

/// Absolute control-transfer targets encoded by an instruction, switch
/// cases before the default.
fn jump_targets(insn: &Insn) -> Vec<u32> {
    match insn.operand() {
        Operand::Jump { target } => vec![*target],
        Operand::TableSwitch(table) => {
            let mut targets = table.targets.clone();
            targets.push(table.default_target);
            targets
        }
        Operand::LookupSwitch(lookup) => {
            let mut targets: Vec<u32> = lookup.pairs.iter().map(|(_, target)| *target).collect();
            targets.push(lookup.default_target);
            targets
        }
        _ => Vec::new(),
    }
}

/// A control-transfer target must land exactly on a decoded instruction.
fn target_index(stream: &InsnStream, offset: u32) -> Result<usize> {
    if !stream.has_offset(offset) {
        return Err(Error::Structural { offset });
    }
    stream.normalize_index(offset)
}

fn block_index(
    by_offset: &BTreeMap<u32, usize>,
    offset: u32,
) -> Result<usize> {
    by_offset
        .get(&offset)
        .copied()
        .ok_or(Error::Structural { offset })
}

fn fall_through(index: usize, block_count: usize, end_offset: u32) -> Result<usize> {
    if index + 1 < block_count {
        Ok(index + 1)
    } else {
        // Control would run off the end of the method.
        Err(Error::Structural { offset: end_offset })
    }
}

/// Duplicate targets collapse to a single edge reference.
fn push_edge(successors: &mut Vec<usize>, target: usize) {
    if !successors.contains(&target) {
        successors.push(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jclassfile::constant_pool::ConstantPool;

    fn pool() -> Vec<ConstantPool> {
        vec![ConstantPool::Utf8 {
            value: String::new(),
        }]
    }

    fn stream_of(code: &[u8]) -> InsnStream {
        InsnStream::decode(code, &pool(), &[]).expect("decode")
    }

    // 0: iload_1, 1: ifeq -> 6, 4: iconst_1, 5: istore_2, 6: return
    fn branchy_code() -> Vec<u8> {
        vec![0x1b, 0x99, 0x00, 0x05, 0x04, 0x3d, 0xb1]
    }

    #[test]
    fn straight_line_method_is_one_block() {
        let stream = stream_of(&[0x04, 0x3c, 0xb1]);
        let cfg = ControlFlowGraph::build(&stream, &[]).expect("cfg");

        assert_eq!(cfg.len(), 1);
        let entry = cfg.entry().expect("entry");
        assert_eq!(entry.start_index(), 0);
        assert_eq!(entry.end_index(), 3);
        assert!(entry.successors().is_empty());
        assert!(entry.predecessors().is_empty());
    }

    #[test]
    fn conditional_branch_produces_fall_through_then_target() {
        let stream = stream_of(&branchy_code());
        let cfg = ControlFlowGraph::build(&stream, &[]).expect("cfg");

        assert_eq!(cfg.len(), 3);
        let entry = cfg.entry().expect("entry");
        let fall_through = cfg.block_index_at(4).expect("fall-through block");
        let target = cfg.block_index_at(6).expect("target block");
        assert_eq!(entry.successors(), &[fall_through, target]);
        assert_eq!(cfg.successor_offsets(entry), vec![4, 6]);
    }

    #[test]
    fn partition_is_contiguous_and_complete() {
        let stream = stream_of(&branchy_code());
        let cfg = ControlFlowGraph::build(&stream, &[]).expect("cfg");

        let mut covered = 0;
        for block in cfg.blocks() {
            assert_eq!(block.start_index(), covered);
            assert!(block.end_index() > block.start_index());
            covered = block.end_index();
        }
        assert_eq!(covered, stream.len());
    }

    #[test]
    fn successor_and_predecessor_lists_are_mutual() {
        let stream = stream_of(&branchy_code());
        let cfg = ControlFlowGraph::build(&stream, &[]).expect("cfg");

        for (index, block) in cfg.blocks().iter().enumerate() {
            for successor in block.successors() {
                let other = cfg.block(*successor).expect("successor");
                assert!(
                    other.predecessors().contains(&index),
                    "missing reverse edge {index} -> {successor}"
                );
            }
            for predecessor in block.predecessors() {
                let other = cfg.block(*predecessor).expect("predecessor");
                assert!(
                    other.successors().contains(&index),
                    "missing forward edge {predecessor} -> {index}"
                );
            }
        }
    }

    #[test]
    fn goto_produces_single_edge_and_no_fall_through() {
        // 0: goto -> 4, 3: nop (unreachable), 4: return
        let stream = stream_of(&[0xa7, 0x00, 0x04, 0x00, 0xb1]);
        let cfg = ControlFlowGraph::build(&stream, &[]).expect("cfg");

        let entry = cfg.entry().expect("entry");
        let target = cfg.block_index_at(4).expect("target");
        assert_eq!(entry.successors(), &[target]);
    }

    #[test]
    fn switch_collapses_duplicate_targets() {
        // 0: iconst_1
        // 1: tableswitch default -> 28, cases {1 -> 28, 2 -> 32}
        let mut code = vec![0x04, 0xaa, 0x00, 0x00];
        code.extend_from_slice(&27i32.to_be_bytes()); // default -> 28
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&27i32.to_be_bytes()); // case 1 -> 28
        code.extend_from_slice(&31i32.to_be_bytes()); // case 2 -> 32
        code.extend_from_slice(&[0xb1, 0x00, 0x00, 0x00, 0xb1, 0x00, 0x00, 0x00, 0xb1]);

        let stream = stream_of(&code);
        let cfg = ControlFlowGraph::build(&stream, &[]).expect("cfg");

        let switch_block = cfg.block_at(0).expect("switch block");
        let case_one = cfg.block_index_at(28).expect("case block");
        let case_two = cfg.block_index_at(32).expect("case block");
        assert_eq!(switch_block.successors(), &[case_one, case_two]);
    }

    #[test]
    fn protected_region_connects_every_covered_block_to_the_handler() {
        // Region [0, 7) spans three blocks; handler at 7.
        // 0: iload_1, 1: ifeq -> 5, 4: iconst_1(block2 leader? no: 4), ...
        // 0: iload_1
        // 1: ifeq -> 6
        // 4: iconst_1
        // 5: istore_2
        // 6: return
        // 7: astore_3 (handler)
        // 8: return
        let code = vec![0x1b, 0x99, 0x00, 0x05, 0x04, 0x3d, 0xb1, 0x4e, 0xb1];
        let stream = stream_of(&code);
        let handlers = [ExceptionHandler {
            start_pc: 0,
            end_pc: 7,
            handler_pc: 7,
            catch_type: Some("java/io/IOException".to_string()),
        }];
        let cfg = ControlFlowGraph::build(&stream, &handlers).expect("cfg");

        let handler_index = cfg.block_index_at(7).expect("handler block");
        let covered: Vec<&FlowBlock> = cfg
            .blocks()
            .iter()
            .filter(|block| block.start_offset() < 7)
            .collect();
        assert_eq!(covered.len(), 3);
        for block in covered {
            assert!(
                block.successors().contains(&handler_index),
                "block at {} missing exception edge",
                block.start_offset()
            );
            assert_eq!(
                block.catchers(),
                &[Catcher {
                    catch_type: Some("java/io/IOException".to_string()),
                    handler: handler_index,
                }]
            );
        }
        let handler_block = cfg.block(handler_index).expect("handler");
        assert_eq!(handler_block.predecessors().len(), 3);
    }

    #[test]
    fn jump_into_an_operand_is_a_structural_error() {
        // 0: sipush 7, 3: goto -> 2 (middle of the sipush operand)
        let stream = stream_of(&[0x11, 0x00, 0x07, 0xa7, 0xff, 0xff]);
        let err = ControlFlowGraph::build(&stream, &[]).expect_err("bad target");
        assert!(matches!(err, Error::Structural { offset: 2 }));
    }

    #[test]
    fn handler_offset_mismatch_is_a_structural_error() {
        let stream = stream_of(&[0x04, 0x3c, 0xb1]);
        let handlers = [ExceptionHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 1,
            catch_type: None,
        }];
        // Offset 1 is istore_1, a valid start, so this build succeeds; an
        // offset inside the method that no instruction starts at must not.
        ControlFlowGraph::build(&stream, &handlers).expect("valid handler");

        let stream = stream_of(&[0x11, 0x00, 0x07, 0xb1]);
        let handlers = [ExceptionHandler {
            start_pc: 0,
            end_pc: 3,
            handler_pc: 2,
            catch_type: None,
        }];
        let err = ControlFlowGraph::build(&stream, &handlers).expect_err("bad handler");
        assert!(matches!(err, Error::Structural { offset: 2 }));
    }
}
