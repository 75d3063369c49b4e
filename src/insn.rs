//! Decoded instruction records.

use std::fmt;

use crate::opcodes;

/// Symbolic reference to a field or method: owner class, name, descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    /// `owner.name descriptor` key, matching the classfile naming scheme.
    pub fn key(&self) -> String {
        format!("{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Decoded tableswitch payload. Case keys run from `low` to `high`
/// inclusive; `targets[i]` is the absolute offset for key `low + i`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSwitch {
    pub low: i32,
    pub high: i32,
    pub default_target: u32,
    pub targets: Vec<u32>,
}

impl TableSwitch {
    pub fn keys(&self) -> impl Iterator<Item = i32> + '_ {
        self.low..=self.high
    }

    /// Absolute target for a case key, when it is inside the table range.
    pub fn target_for(&self, key: i32) -> Option<u32> {
        if key < self.low || key > self.high {
            return None;
        }
        self.targets.get((key - self.low) as usize).copied()
    }
}

/// Decoded lookupswitch payload: sparse `(match value, absolute target)`
/// pairs in ascending match order plus the default target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LookupSwitch {
    pub default_target: u32,
    pub pairs: Vec<(i32, u32)>,
}

impl LookupSwitch {
    pub fn target_for(&self, key: i32) -> Option<u32> {
        self.pairs
            .iter()
            .find(|(match_value, _)| *match_value == key)
            .map(|(_, target)| *target)
    }
}

/// Operand variants, one per opcode family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    /// No operand bytes carry meaning for consumers.
    None,
    /// Constant-pool index loaded by the ldc family.
    ConstantPool(u16),
    /// Signed immediate pushed by bipush/sipush, or the newarray type code.
    Int(i32),
    /// Local variable slot, widened to u16 for wide-prefixed forms.
    Local(u16),
    /// Local increment: slot plus signed delta.
    Increment { var: u16, delta: i16 },
    /// Absolute jump target offset within the method.
    Jump { target: u32 },
    /// Field reference resolved through the constant pool.
    Field(MemberRef),
    /// Method reference resolved through the constant pool.
    Method(MemberRef),
    /// invokedynamic call site: name, descriptor, bootstrap-method index.
    InvokeDynamic {
        name: String,
        descriptor: String,
        bootstrap: u16,
    },
    /// Class type reference; `dimensions` is set for multianewarray.
    Type {
        name: String,
        dimensions: Option<u8>,
    },
    TableSwitch(TableSwitch),
    LookupSwitch(LookupSwitch),
}

/// One decoded instruction, owned by its [`InsnStream`](crate::InsnStream).
///
/// Neighbor links are sequence indices into the owning stream rather than
/// direct references, so the doubly linked decode order carries no
/// ownership cycles.
#[derive(Clone, Debug)]
pub struct Insn {
    pub(crate) seq: usize,
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
    pub(crate) operand: Operand,
    pub(crate) line: Option<u32>,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl Insn {
    /// Position in the owning stream's decode order.
    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Byte offset of the first byte of this instruction.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// Source line recorded for this offset, when the class carries one.
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Sequence index of the previous instruction in decode order.
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }

    /// Sequence index of the next instruction in decode order.
    pub fn next(&self) -> Option<usize> {
        self.next
    }

    pub fn mnemonic(&self) -> &'static str {
        opcodes::mnemonic(self.opcode)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::ConstantPool(index) => write!(f, " (pool: {index})"),
            Operand::Int(value) => write!(f, " (operand: {value})"),
            Operand::Local(var) => write!(f, " (var: {var})"),
            Operand::Increment { var, delta } => write!(f, " (var: {var}, incr: {delta})"),
            Operand::Jump { target } => write!(f, " (target: {target})"),
            Operand::Field(member) | Operand::Method(member) => write!(f, " ({})", member.key()),
            Operand::InvokeDynamic {
                name,
                descriptor,
                bootstrap,
            } => write!(f, " ({name}{descriptor}, bootstrap: {bootstrap})"),
            Operand::Type { name, dimensions } => match dimensions {
                Some(dims) => write!(f, " (type: {name}, dims: {dims})"),
                None => write!(f, " (type: {name})"),
            },
            Operand::TableSwitch(table) => write!(
                f,
                " (low: {}, high: {}, default: {}, targets: {:?})",
                table.low, table.high, table.default_target, table.targets
            ),
            Operand::LookupSwitch(lookup) => write!(
                f,
                " (default: {}, pairs: {:?})",
                lookup.default_target, lookup.pairs
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(opcode: u8, operand: Operand) -> Insn {
        Insn {
            seq: 0,
            offset: 0,
            opcode,
            operand,
            line: None,
            prev: None,
            next: None,
        }
    }

    #[test]
    fn display_shows_mnemonic_and_operand() {
        let jump = insn(crate::opcodes::GOTO, Operand::Jump { target: 14 });
        assert_eq!(jump.to_string(), "goto (target: 14)");

        let plain = insn(crate::opcodes::NOP, Operand::None);
        assert_eq!(plain.to_string(), "nop");

        let iinc = insn(crate::opcodes::IINC, Operand::Increment { var: 2, delta: -1 });
        assert_eq!(iinc.to_string(), "iinc (var: 2, incr: -1)");
    }

    #[test]
    fn table_switch_maps_keys_to_targets() {
        let table = TableSwitch {
            low: 1,
            high: 2,
            default_target: 40,
            targets: vec![20, 30],
        };
        assert_eq!(table.target_for(1), Some(20));
        assert_eq!(table.target_for(2), Some(30));
        assert_eq!(table.target_for(3), None);
        assert_eq!(table.keys().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn member_key_concatenates_owner_name_descriptor() {
        let member = MemberRef {
            owner: "java/io/PrintStream".to_string(),
            name: "println".to_string(),
            descriptor: "(Ljava/lang/String;)V".to_string(),
        };
        assert_eq!(
            member.key(),
            "java/io/PrintStream.println(Ljava/lang/String;)V"
        );
    }
}
