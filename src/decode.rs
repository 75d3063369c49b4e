//! Instruction decoder: converts a method's raw bytecode into typed records.

use jclassfile::constant_pool::ConstantPool;

use crate::error::{Error, Result};
use crate::insn::{Insn, LookupSwitch, MemberRef, Operand, TableSwitch};
use crate::opcodes;

/// Decode a full method body in one linear pass.
///
/// Produces one [`Insn`] per opcode occurrence with prev/next links set in
/// decode order. Any truncated operand or wrong-kind constant-pool entry
/// fails the whole method.
pub(crate) fn parse(code: &[u8], constant_pool: &[ConstantPool]) -> Result<Vec<Insn>> {
    let mut instructions: Vec<Insn> = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let start = offset as u32;
        let length = opcode_length(code, offset)?;
        if offset + length > code.len() {
            return Err(Error::decode(start, "instruction extends past end of code"));
        }

        let (opcode, operand) = decode_operand(code, offset, opcode, constant_pool)?;

        let seq = instructions.len();
        let prev = seq.checked_sub(1);
        if let Some(previous) = prev {
            instructions[previous].next = Some(seq);
        }
        instructions.push(Insn {
            seq,
            offset: start,
            opcode,
            operand,
            line: None,
            prev,
            next: None,
        });
        offset += length;
    }
    Ok(instructions)
}

/// Decode the operand for one opcode occurrence.
///
/// Returns the effective opcode as well, since a wide prefix re-decodes the
/// following opcode with widened operand widths.
fn decode_operand(
    code: &[u8],
    offset: usize,
    opcode: u8,
    pool: &[ConstantPool],
) -> Result<(u8, Operand)> {
    let start = offset as u32;
    let operand = match opcode {
        opcodes::LDC => {
            let index = u16::from(read_u8(code, offset + 1)?);
            pool_entry(pool, index, start)?;
            Operand::ConstantPool(index)
        }
        opcodes::LDC_W | opcodes::LDC2_W => {
            let index = read_u16(code, offset + 1)?;
            pool_entry(pool, index, start)?;
            Operand::ConstantPool(index)
        }
        opcodes::BIPUSH => Operand::Int(i32::from(read_i8(code, offset + 1)?)),
        opcodes::SIPUSH => Operand::Int(i32::from(read_i16(code, offset + 1)?)),
        opcodes::NEWARRAY => Operand::Int(i32::from(read_u8(code, offset + 1)?)),
        _ if opcodes::is_compact_local(opcode) => {
            Operand::Local(opcodes::compact_local_index(opcode))
        }
        _ if opcodes::is_local_var(opcode) => {
            Operand::Local(u16::from(read_u8(code, offset + 1)?))
        }
        _ if opcodes::is_jump(opcode) => {
            let relative = if opcodes::is_wide_jump(opcode) {
                i64::from(read_i32(code, offset + 1)?)
            } else {
                i64::from(read_i16(code, offset + 1)?)
            };
            Operand::Jump {
                target: absolute_target(start, relative)?,
            }
        }
        opcodes::IINC => Operand::Increment {
            var: u16::from(read_u8(code, offset + 1)?),
            delta: i16::from(read_i8(code, offset + 2)?),
        },
        _ if opcodes::is_field_access(opcode) => {
            let index = read_u16(code, offset + 1)?;
            Operand::Field(resolve_field_ref(pool, index, start)?)
        }
        _ if opcodes::is_invoke(opcode) => {
            let index = read_u16(code, offset + 1)?;
            let interface = opcode == opcodes::INVOKEINTERFACE;
            Operand::Method(resolve_method_ref(pool, index, interface, start)?)
        }
        opcodes::INVOKEDYNAMIC => {
            let index = read_u16(code, offset + 1)?;
            let (name, descriptor, bootstrap) = resolve_invoke_dynamic(pool, index, start)?;
            Operand::InvokeDynamic {
                name,
                descriptor,
                bootstrap,
            }
        }
        _ if opcodes::is_type_reference(opcode) => {
            let index = read_u16(code, offset + 1)?;
            let name = resolve_class_name(pool, index, start)?;
            let dimensions = if opcode == opcodes::MULTIANEWARRAY {
                Some(read_u8(code, offset + 3)?)
            } else {
                None
            };
            Operand::Type { name, dimensions }
        }
        opcodes::TABLESWITCH => Operand::TableSwitch(decode_tableswitch(code, offset)?),
        opcodes::LOOKUPSWITCH => Operand::LookupSwitch(decode_lookupswitch(code, offset)?),
        opcodes::WIDE => return decode_wide(code, offset),
        _ => Operand::None,
    };
    Ok((opcode, operand))
}

/// Re-decode the opcode following a wide prefix with widened operand widths.
/// The produced instruction keeps the prefix's byte offset.
fn decode_wide(code: &[u8], offset: usize) -> Result<(u8, Operand)> {
    let start = offset as u32;
    let widened = read_u8(code, offset + 1)?;
    let operand = match widened {
        opcodes::IINC => Operand::Increment {
            var: read_u16(code, offset + 2)?,
            delta: read_i16(code, offset + 4)?,
        },
        _ if opcodes::is_local_var(widened) && !opcodes::is_compact_local(widened) => {
            Operand::Local(read_u16(code, offset + 2)?)
        }
        _ => {
            return Err(Error::decode(
                start,
                format!("wide prefix on non-widenable opcode 0x{widened:02x}"),
            ));
        }
    };
    Ok((widened, operand))
}

fn decode_tableswitch(code: &[u8], offset: usize) -> Result<TableSwitch> {
    let start = offset as u32;
    let base = offset + 1 + padding(offset);
    let default_rel = read_i32(code, base)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .filter(|v| *v >= 0)
        .ok_or_else(|| Error::decode(start, "invalid tableswitch range"))?;

    let mut targets = Vec::with_capacity(count as usize);
    let mut cursor = base + 12;
    for _ in 0..count {
        let relative = read_i32(code, cursor)?;
        targets.push(absolute_target(start, i64::from(relative))?);
        cursor += 4;
    }
    Ok(TableSwitch {
        low,
        high,
        default_target: absolute_target(start, i64::from(default_rel))?,
        targets,
    })
}

fn decode_lookupswitch(code: &[u8], offset: usize) -> Result<LookupSwitch> {
    let start = offset as u32;
    let base = offset + 1 + padding(offset);
    let default_rel = read_i32(code, base)?;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        return Err(Error::decode(start, "invalid lookupswitch pair count"));
    }

    let mut pairs = Vec::with_capacity(npairs as usize);
    let mut cursor = base + 8;
    for _ in 0..npairs {
        let match_value = read_i32(code, cursor)?;
        let relative = read_i32(code, cursor + 4)?;
        pairs.push((match_value, absolute_target(start, i64::from(relative))?));
        cursor += 8;
    }
    Ok(LookupSwitch {
        default_target: absolute_target(start, i64::from(default_rel))?,
        pairs,
    })
}

/// Total encoded length of the instruction starting at `offset`.
fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        0xbe | 0xbf => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        _ => {
            return Err(Error::decode(
                offset as u32,
                format!("unsupported opcode 0x{opcode:02x}"),
            ));
        }
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .filter(|v| *v >= 0)
        .ok_or_else(|| Error::decode(offset as u32, "invalid tableswitch range"))?;
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        return Err(Error::decode(offset as u32, "invalid lookupswitch pairs"));
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let widened = read_u8(code, offset + 1)?;
    if widened == opcodes::IINC { Ok(6) } else { Ok(4) }
}

/// Pad bytes between a switch opcode and its first 4-byte-aligned operand,
/// measured from the start of the method.
fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn absolute_target(start: u32, relative: i64) -> Result<u32> {
    let target = i64::from(start) + relative;
    u32::try_from(target)
        .map_err(|_| Error::decode(start, format!("jump target {target} out of range")))
}

fn read_u8(code: &[u8], offset: usize) -> Result<u8> {
    code.get(offset)
        .copied()
        .ok_or_else(|| Error::decode(offset as u32, "bytecode u8 out of bounds"))
}

fn read_i8(code: &[u8], offset: usize) -> Result<i8> {
    Ok(read_u8(code, offset)? as i8)
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .ok_or_else(|| Error::decode(offset as u32, "bytecode u16 out of bounds"))?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    let value = read_u16(code, offset)?;
    Ok(i16::from_be_bytes(value.to_be_bytes()))
}

fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .ok_or_else(|| Error::decode(offset as u32, "bytecode u32 out of bounds"))?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}

fn pool_entry<'a>(pool: &'a [ConstantPool], index: u16, at: u32) -> Result<&'a ConstantPool> {
    pool.get(index as usize)
        .ok_or_else(|| Error::decode(at, format!("missing constant pool entry {index}")))
}

fn resolve_utf8(pool: &[ConstantPool], index: u16, at: u32) -> Result<String> {
    match pool_entry(pool, index, at)? {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => Err(Error::decode(
            at,
            format!("constant pool entry {index} is not utf8"),
        )),
    }
}

fn resolve_class_name(pool: &[ConstantPool], index: u16, at: u32) -> Result<String> {
    match pool_entry(pool, index, at)? {
        ConstantPool::Class { name_index } => resolve_utf8(pool, *name_index, at),
        _ => Err(Error::decode(
            at,
            format!("constant pool entry {index} is not a class"),
        )),
    }
}

fn resolve_name_and_type(pool: &[ConstantPool], index: u16, at: u32) -> Result<(String, String)> {
    match pool_entry(pool, index, at)? {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => Ok((
            resolve_utf8(pool, *name_index, at)?,
            resolve_utf8(pool, *descriptor_index, at)?,
        )),
        _ => Err(Error::decode(
            at,
            format!("constant pool entry {index} is not a name-and-type"),
        )),
    }
}

fn resolve_field_ref(pool: &[ConstantPool], index: u16, at: u32) -> Result<MemberRef> {
    match pool_entry(pool, index, at)? {
        ConstantPool::Fieldref {
            class_index,
            name_and_type_index,
        } => member_ref(pool, *class_index, *name_and_type_index, at),
        _ => Err(Error::decode(
            at,
            format!("constant pool entry {index} is not a field reference"),
        )),
    }
}

fn resolve_method_ref(
    pool: &[ConstantPool],
    index: u16,
    interface: bool,
    at: u32,
) -> Result<MemberRef> {
    match pool_entry(pool, index, at)? {
        ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => member_ref(pool, *class_index, *name_and_type_index, at),
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        } if !interface => member_ref(pool, *class_index, *name_and_type_index, at),
        _ => Err(Error::decode(
            at,
            format!("constant pool entry {index} is not a method reference"),
        )),
    }
}

fn resolve_invoke_dynamic(
    pool: &[ConstantPool],
    index: u16,
    at: u32,
) -> Result<(String, String, u16)> {
    match pool_entry(pool, index, at)? {
        ConstantPool::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            let (name, descriptor) = resolve_name_and_type(pool, *name_and_type_index, at)?;
            Ok((name, descriptor, *bootstrap_method_attr_index))
        }
        _ => Err(Error::decode(
            at,
            format!("constant pool entry {index} is not an invokedynamic call site"),
        )),
    }
}

fn member_ref(
    pool: &[ConstantPool],
    class_index: u16,
    name_and_type_index: u16,
    at: u32,
) -> Result<MemberRef> {
    let owner = resolve_class_name(pool, class_index, at)?;
    let (name, descriptor) = resolve_name_and_type(pool, name_and_type_index, at)?;
    Ok(MemberRef {
        owner,
        name,
        descriptor,
    })
}
