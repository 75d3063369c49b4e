//! Instruction stream: the owned decode-order sequence plus the
//! offset-to-sequence-index translation layer.

use std::collections::BTreeMap;

use jclassfile::constant_pool::ConstantPool;
use tracing::debug;

use crate::decode;
use crate::error::{Error, Result};
use crate::insn::Insn;

/// Source-line table entry: first byte offset covered by a line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineNumber {
    pub start_pc: u32,
    pub line: u32,
}

/// Ordered, randomly indexable sequence of decoded instructions.
///
/// Insertion order is byte order. The stream also owns the mapping from
/// byte offsets to compact sequence indices, covering every instruction
/// start plus one sentinel offset for end-of-method. The two coordinate
/// systems differ once variable-length or wide-prefixed instructions are
/// involved, which is why jump targets and exception-table bounds must be
/// translated through [`InsnStream::normalize_index`].
pub struct InsnStream {
    instructions: Vec<Insn>,
    offsets: BTreeMap<u32, usize>,
    lines: BTreeMap<u32, u32>,
    code_len: u32,
}

impl InsnStream {
    /// Decode a method body into a stream.
    ///
    /// `lines` is the class file's line-number table for this method and may
    /// be empty; lookups through it are best-effort.
    pub fn decode(
        code: &[u8],
        constant_pool: &[ConstantPool],
        lines: &[LineNumber],
    ) -> Result<Self> {
        let mut instructions = decode::parse(code, constant_pool)?;

        let line_table: BTreeMap<u32, u32> = lines
            .iter()
            .map(|entry| (entry.start_pc, entry.line))
            .collect();
        let mut offsets = BTreeMap::new();
        for insn in &mut instructions {
            offsets.insert(insn.offset, insn.seq);
            insn.line = line_table
                .range(..=insn.offset)
                .next_back()
                .map(|(_, line)| *line);
        }
        // End-of-method sentinel, used as the exclusive bound of the last
        // block range.
        offsets.insert(code.len() as u32, instructions.len());

        debug!(
            instructions = instructions.len(),
            code_len = code.len(),
            "decoded instruction stream"
        );
        Ok(Self {
            instructions,
            offsets,
            lines: line_table,
            code_len: code.len() as u32,
        })
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Random access by sequence index.
    pub fn get(&self, seq: usize) -> Option<&Insn> {
        self.instructions.get(seq)
    }

    pub fn first(&self) -> Option<&Insn> {
        self.instructions.first()
    }

    pub fn last(&self) -> Option<&Insn> {
        self.instructions.last()
    }

    /// Iterate in byte order.
    pub fn iter(&self) -> impl Iterator<Item = &Insn> {
        self.instructions.iter()
    }

    /// Instruction slice for a half-open sequence-index range.
    pub fn slice(&self, start: usize, end: usize) -> &[Insn] {
        &self.instructions[start..end]
    }

    /// Instruction whose first byte is exactly `offset`.
    pub fn at_offset(&self, offset: u32) -> Option<&Insn> {
        self.offsets
            .get(&offset)
            .and_then(|seq| self.instructions.get(*seq))
    }

    /// Whether `offset` is a registered instruction start or the sentinel.
    pub fn has_offset(&self, offset: u32) -> bool {
        self.offsets.contains_key(&offset)
    }

    /// Translate a byte offset to a sequence index.
    ///
    /// Exact instruction starts (and the end-of-method sentinel) resolve
    /// directly. Any other offset falls back to the index recorded for
    /// `offset - 1`, which covers exclusive upper bounds expressed as one
    /// byte past the final instruction of a range. An offset that misses
    /// both is a caller contract violation.
    pub fn normalize_index(&self, offset: u32) -> Result<usize> {
        if let Some(seq) = self.offsets.get(&offset) {
            return Ok(*seq);
        }
        offset
            .checked_sub(1)
            .and_then(|previous| self.offsets.get(&previous))
            .copied()
            .ok_or(Error::Lookup { offset })
    }

    /// Successor in decode order.
    pub fn next_of(&self, insn: &Insn) -> Option<&Insn> {
        insn.next().and_then(|seq| self.instructions.get(seq))
    }

    /// Predecessor in decode order.
    pub fn prev_of(&self, insn: &Insn) -> Option<&Insn> {
        insn.prev().and_then(|seq| self.instructions.get(seq))
    }

    /// Encoded byte length of one instruction, derived from the distance to
    /// the next registered offset.
    pub fn byte_len(&self, seq: usize) -> Option<u32> {
        let insn = self.instructions.get(seq)?;
        let next_offset = match self.instructions.get(seq + 1) {
            Some(next) => next.offset,
            None => self.code_len,
        };
        Some(next_offset - insn.offset)
    }

    /// Total bytecode length of the method.
    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    /// Best-effort source line for a byte offset.
    pub fn line_at(&self, offset: u32) -> Option<u32> {
        self.lines.range(..=offset).next_back().map(|(_, line)| *line)
    }

    /// Sequence indices grouped by the source line they were compiled from.
    pub fn group_by_lines(&self) -> BTreeMap<u32, Vec<usize>> {
        let mut grouped: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for insn in &self.instructions {
            if let Some(line) = insn.line {
                grouped.entry(line).or_default().push(insn.seq);
            }
        }
        grouped
    }
}

impl<'a> IntoIterator for &'a InsnStream {
    type Item = &'a Insn;
    type IntoIter = std::slice::Iter<'a, Insn>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Vec<ConstantPool> {
        vec![ConstantPool::Utf8 {
            value: String::new(),
        }]
    }

    // 0: iconst_1, 1: istore_1, 2: wide istore 256, 6: sipush 7, 9: return
    fn mixed_width_code() -> Vec<u8> {
        vec![0x04, 0x3c, 0xc4, 0x36, 0x01, 0x00, 0x11, 0x00, 0x07, 0xb1]
    }

    #[test]
    fn byte_lengths_sum_to_code_length() {
        let code = mixed_width_code();
        let stream = InsnStream::decode(&code, &pool(), &[]).expect("decode");

        let total: u32 = (0..stream.len())
            .map(|seq| stream.byte_len(seq).expect("length"))
            .sum();
        assert_eq!(total, stream.code_len());
        assert_eq!(total, code.len() as u32);
    }

    #[test]
    fn chain_visits_every_instruction_in_both_directions() {
        let code = mixed_width_code();
        let stream = InsnStream::decode(&code, &pool(), &[]).expect("decode");

        let mut forward = Vec::new();
        let mut cursor = stream.first();
        while let Some(insn) = cursor {
            forward.push(insn.offset());
            cursor = stream.next_of(insn);
        }
        assert_eq!(forward, vec![0, 1, 2, 6, 9]);
        assert!(forward.windows(2).all(|pair| pair[0] < pair[1]));

        let mut backward = Vec::new();
        let mut cursor = stream.last();
        while let Some(insn) = cursor {
            backward.push(insn.offset());
            cursor = stream.prev_of(insn);
        }
        backward.reverse();
        assert_eq!(backward, forward);
    }

    #[test]
    fn normalize_resolves_starts_fallback_and_sentinel() {
        let code = mixed_width_code();
        let stream = InsnStream::decode(&code, &pool(), &[]).expect("decode");

        // Exact starts.
        assert_eq!(stream.normalize_index(0).expect("start"), 0);
        assert_eq!(stream.normalize_index(2).expect("wide start"), 2);
        assert_eq!(stream.normalize_index(6).expect("sipush"), 3);
        // One past a start falls back to the instruction before it.
        assert_eq!(stream.normalize_index(3).expect("fallback"), 2);
        // End-of-method sentinel.
        assert!(stream.has_offset(10));
        assert_eq!(stream.normalize_index(10).expect("sentinel"), 5);
        // Inside the wide operand, past the fallback window.
        let err = stream.normalize_index(5).expect_err("interior offset");
        assert!(matches!(err, Error::Lookup { offset: 5 }));
    }

    #[test]
    fn wide_instruction_reachable_from_original_offset() {
        let code = mixed_width_code();
        let stream = InsnStream::decode(&code, &pool(), &[]).expect("decode");

        let seq = stream.normalize_index(2).expect("wide offset");
        let insn = stream.get(seq).expect("wide insn");
        assert_eq!(insn.opcode(), crate::opcodes::ISTORE);
        assert_eq!(insn.operand(), &crate::insn::Operand::Local(256));
    }

    #[test]
    fn lines_are_assigned_from_the_table() {
        let code = mixed_width_code();
        let lines = [
            LineNumber {
                start_pc: 0,
                line: 10,
            },
            LineNumber {
                start_pc: 6,
                line: 12,
            },
        ];
        let stream = InsnStream::decode(&code, &pool(), &lines).expect("decode");

        assert_eq!(stream.get(0).expect("insn").line(), Some(10));
        assert_eq!(stream.get(2).expect("insn").line(), Some(10));
        assert_eq!(stream.get(3).expect("insn").line(), Some(12));
        assert_eq!(stream.line_at(9), Some(12));

        let grouped = stream.group_by_lines();
        assert_eq!(grouped[&10], vec![0, 1, 2]);
        assert_eq!(grouped[&12], vec![3, 4]);
    }

    #[test]
    fn empty_method_body_yields_empty_stream() {
        let stream = InsnStream::decode(&[], &pool(), &[]).expect("decode");
        assert!(stream.is_empty());
        assert_eq!(stream.normalize_index(0).expect("sentinel"), 0);
    }
}
