//! JVM opcode constants and family classification.

pub const NOP: u8 = 0x00;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const ILOAD: u8 = 0x15;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const ALOAD_3: u8 = 0x2d;
pub const ISTORE: u8 = 0x36;
pub const ASTORE: u8 = 0x3a;
pub const ISTORE_0: u8 = 0x3b;
pub const ASTORE_3: u8 = 0x4e;
pub const IINC: u8 = 0x84;
pub const IFEQ: u8 = 0x99;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const INSTANCEOF: u8 = 0xc1;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// Loads a constant-pool entry (ldc family).
pub fn is_constant_load(opcode: u8) -> bool {
    matches!(opcode, LDC | LDC_W | LDC2_W)
}

/// Pushes an immediate integer (bipush, sipush, newarray type code).
pub fn is_int_push(opcode: u8) -> bool {
    matches!(opcode, BIPUSH | SIPUSH | NEWARRAY)
}

/// Reads or writes a local variable slot, including ret.
pub fn is_local_var(opcode: u8) -> bool {
    matches!(opcode, ILOAD..=ALOAD_3 | ISTORE..=ASTORE_3 | RET)
}

/// Compact load/store form with the slot index encoded in the opcode.
pub fn is_compact_local(opcode: u8) -> bool {
    matches!(opcode, ILOAD_0..=ALOAD_3 | ISTORE_0..=ASTORE_3)
}

/// Slot index encoded in a compact load/store opcode (iload_0 = 0, ...).
pub fn compact_local_index(opcode: u8) -> u16 {
    debug_assert!(is_compact_local(opcode));
    let base = if opcode >= ISTORE_0 { ISTORE_0 } else { ILOAD_0 };
    u16::from((opcode - base) % 4)
}

/// Conditional or unconditional jump, including the wide goto/jsr forms.
pub fn is_jump(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=JSR | IFNULL | IFNONNULL | GOTO_W | JSR_W)
}

pub fn is_unconditional_jump(opcode: u8) -> bool {
    matches!(opcode, GOTO | JSR | GOTO_W | JSR_W)
}

pub fn is_wide_jump(opcode: u8) -> bool {
    matches!(opcode, GOTO_W | JSR_W)
}

pub fn is_switch(opcode: u8) -> bool {
    matches!(opcode, TABLESWITCH | LOOKUPSWITCH)
}

pub fn is_field_access(opcode: u8) -> bool {
    matches!(opcode, GETSTATIC..=PUTFIELD)
}

pub fn is_invoke(opcode: u8) -> bool {
    matches!(opcode, INVOKEVIRTUAL..=INVOKEINTERFACE)
}

/// References a class type (anewarray, checkcast, multianewarray).
pub fn is_type_reference(opcode: u8) -> bool {
    matches!(opcode, ANEWARRAY | CHECKCAST | MULTIANEWARRAY)
}

/// Leaves the method: any return form or athrow.
pub fn is_exit(opcode: u8) -> bool {
    matches!(opcode, IRETURN..=RETURN | ATHROW)
}

/// Control does not fall through past this instruction.
pub fn is_terminator(opcode: u8) -> bool {
    is_jump(opcode) || is_switch(opcode) || is_exit(opcode) || opcode == RET
}

/// Mnemonic for an opcode, or "illegal" for bytes outside the defined set.
pub fn mnemonic(opcode: u8) -> &'static str {
    MNEMONICS
        .get(opcode as usize)
        .copied()
        .unwrap_or("illegal")
}

const MNEMONICS: [&str; 202] = [
    "nop", "aconst_null", "iconst_m1", "iconst_0", "iconst_1", "iconst_2", "iconst_3", "iconst_4",
    "iconst_5", "lconst_0", "lconst_1", "fconst_0", "fconst_1", "fconst_2", "dconst_0", "dconst_1",
    "bipush", "sipush", "ldc", "ldc_w", "ldc2_w", "iload", "lload", "fload", "dload", "aload",
    "iload_0", "iload_1", "iload_2", "iload_3", "lload_0", "lload_1", "lload_2", "lload_3",
    "fload_0", "fload_1", "fload_2", "fload_3", "dload_0", "dload_1", "dload_2", "dload_3",
    "aload_0", "aload_1", "aload_2", "aload_3", "iaload", "laload", "faload", "daload", "aaload",
    "baload", "caload", "saload", "istore", "lstore", "fstore", "dstore", "astore", "istore_0",
    "istore_1", "istore_2", "istore_3", "lstore_0", "lstore_1", "lstore_2", "lstore_3", "fstore_0",
    "fstore_1", "fstore_2", "fstore_3", "dstore_0", "dstore_1", "dstore_2", "dstore_3", "astore_0",
    "astore_1", "astore_2", "astore_3", "iastore", "lastore", "fastore", "dastore", "aastore",
    "bastore", "castore", "sastore", "pop", "pop2", "dup", "dup_x1", "dup_x2", "dup2", "dup2_x1",
    "dup2_x2", "swap", "iadd", "ladd", "fadd", "dadd", "isub", "lsub", "fsub", "dsub", "imul",
    "lmul", "fmul", "dmul", "idiv", "ldiv", "fdiv", "ddiv", "irem", "lrem", "frem", "drem", "ineg",
    "lneg", "fneg", "dneg", "ishl", "lshl", "ishr", "lshr", "iushr", "lushr", "iand", "land",
    "ior", "lor", "ixor", "lxor", "iinc", "i2l", "i2f", "i2d", "l2i", "l2f", "l2d", "f2i", "f2l",
    "f2d", "d2i", "d2l", "d2f", "i2b", "i2c", "i2s", "lcmp", "fcmpl", "fcmpg", "dcmpl", "dcmpg",
    "ifeq", "ifne", "iflt", "ifge", "ifgt", "ifle", "if_icmpeq", "if_icmpne", "if_icmplt",
    "if_icmpge", "if_icmpgt", "if_icmple", "if_acmpeq", "if_acmpne", "goto", "jsr", "ret",
    "tableswitch", "lookupswitch", "ireturn", "lreturn", "freturn", "dreturn", "areturn", "return",
    "getstatic", "putstatic", "getfield", "putfield", "invokevirtual", "invokespecial",
    "invokestatic", "invokeinterface", "invokedynamic", "new", "newarray", "anewarray",
    "arraylength", "athrow", "checkcast", "instanceof", "monitorenter", "monitorexit", "wide",
    "multianewarray", "ifnull", "ifnonnull", "goto_w", "jsr_w",
];
