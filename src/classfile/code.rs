//! Code attribute model and instruction stream codec.
//!
//! Rewriting works on a decoded instruction list where every branch
//! target is an index into that list; the encoder assigns byte offsets
//! back (iterating until switch padding stabilizes) and refuses methods
//! whose rewritten branches would no longer fit a 16-bit offset.

use std::collections::HashMap;

use super::{AttributeInfo, ClassFileError, Reader, Writer};

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const LCONST_0: u8 = 0x09;
    pub const FCONST_0: u8 = 0x0b;
    pub const DCONST_0: u8 = 0x0e;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const LLOAD_0: u8 = 0x1e;
    pub const FLOAD_0: u8 = 0x22;
    pub const DLOAD_0: u8 = 0x26;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3a;
    pub const ISTORE_0: u8 = 0x3b;
    pub const LSTORE_0: u8 = 0x3f;
    pub const FSTORE_0: u8 = 0x43;
    pub const DSTORE_0: u8 = 0x47;
    pub const ASTORE_0: u8 = 0x4b;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const IINC: u8 = 0x84;
    pub const IFEQ: u8 = 0x99;
    pub const IF_ICMPGE: u8 = 0xa2;
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
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

/// Operand byte count per opcode; -1 marks the variable-length ones
/// (wide, tableswitch, lookupswitch) and -2 unusable opcodes.
const OPERAND_LEN: [i8; 256] = build_operand_len();

const fn build_operand_len() -> [i8; 256] {
    let mut t = [0i8; 256];
    t[0x10] = 1; // bipush
    t[0x11] = 2; // sipush
    t[0x12] = 1; // ldc
    t[0x13] = 2; // ldc_w
    t[0x14] = 2; // ldc2_w
    let mut i = 0x15; // iload..aload
    while i <= 0x19 {
        t[i] = 1;
        i += 1;
    }
    i = 0x36; // istore..astore
    while i <= 0x3a {
        t[i] = 1;
        i += 1;
    }
    t[0x84] = 2; // iinc
    i = 0x99; // ifeq..jsr: 2-byte branch offsets, handled specially
    while i <= 0xa8 {
        t[i] = 2;
        i += 1;
    }
    t[0xa9] = 1; // ret
    t[0xaa] = -1; // tableswitch
    t[0xab] = -1; // lookupswitch
    i = 0xb2; // getstatic..invokestatic
    while i <= 0xb8 {
        t[i] = 2;
        i += 1;
    }
    t[0xb9] = 4; // invokeinterface
    t[0xba] = 4; // invokedynamic
    t[0xbb] = 2; // new
    t[0xbc] = 1; // newarray
    t[0xbd] = 2; // anewarray
    t[0xc0] = 2; // checkcast
    t[0xc1] = 2; // instanceof
    t[0xc4] = -1; // wide
    t[0xc5] = 3; // multianewarray
    t[0xc6] = 2; // ifnull
    t[0xc7] = 2; // ifnonnull
    t[0xc8] = 4; // goto_w
    t[0xc9] = 4; // jsr_w
    i = 0xca; // breakpoint and reserved range
    while i <= 0xff {
        t[i] = -2;
        i += 1;
    }
    t
}

fn is_branch16(opcode: u8) -> bool {
    (0x99..=0xa8).contains(&opcode) || opcode == op::IFNULL || opcode == op::IFNONNULL
}

pub fn is_return(opcode: u8) -> bool {
    (op::IRETURN..=op::RETURN).contains(&opcode)
}

/// One decoded instruction; branch targets are instruction indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Plain { opcode: u8, operands: Vec<u8> },
    Branch { opcode: u8, target: usize },
    BranchW { opcode: u8, target: usize },
    TableSwitch {
        default: usize,
        low: i32,
        high: i32,
        targets: Vec<usize>,
    },
    LookupSwitch {
        default: usize,
        pairs: Vec<(i32, usize)>,
    },
}

impl Insn {
    pub fn opcode(&self) -> u8 {
        match self {
            Insn::Plain { opcode, .. } => *opcode,
            Insn::Branch { opcode, .. } => *opcode,
            Insn::BranchW { opcode, .. } => *opcode,
            Insn::TableSwitch { .. } => op::TABLESWITCH,
            Insn::LookupSwitch { .. } => op::LOOKUPSWITCH,
        }
    }

    pub fn plain(opcode: u8) -> Insn {
        Insn::Plain {
            opcode,
            operands: Vec::new(),
        }
    }

    pub fn with_u16(opcode: u8, operand: u16) -> Insn {
        Insn::Plain {
            opcode,
            operands: operand.to_be_bytes().to_vec(),
        }
    }

    /// Load/store of a local slot, picking the short form when possible.
    pub fn local(base_short: u8, base: u8, slot: u16) -> Insn {
        if slot < 4 {
            Insn::plain(base_short + slot as u8)
        } else if slot <= 0xff {
            Insn::Plain {
                opcode: base,
                operands: vec![slot as u8],
            }
        } else {
            let mut operands = vec![base];
            operands.extend_from_slice(&slot.to_be_bytes());
            Insn::Plain {
                opcode: op::WIDE,
                operands,
            }
        }
    }

    fn size_at(&self, offset: u32) -> u32 {
        match self {
            Insn::Plain { operands, .. } => 1 + operands.len() as u32,
            Insn::Branch { .. } => 3,
            Insn::BranchW { .. } => 5,
            Insn::TableSwitch { targets, .. } => {
                let pad = (4 - (offset + 1) % 4) % 4;
                1 + pad + 12 + 4 * targets.len() as u32
            }
            Insn::LookupSwitch { pairs, .. } => {
                let pad = (4 - (offset + 1) % 4) % 4;
                1 + pad + 8 + 8 * pairs.len() as u32
            }
        }
    }
}

fn wide_operand_len(code: &[u8], pos: usize) -> Result<usize, ClassFileError> {
    match code.get(pos) {
        Some(&o) if o == op::IINC => Ok(5),
        Some(_) => Ok(3),
        None => Err(ClassFileError::UnexpectedEof),
    }
}

/// Decode a code array. Returns the instruction list plus the mapping
/// from byte offset to instruction index; the code length maps to
/// `insns.len()` so exclusive range ends stay representable.
pub fn decode(code: &[u8]) -> Result<(Vec<Insn>, HashMap<u32, usize>), ClassFileError> {
    // First pass: instruction boundaries.
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    while pos < code.len() {
        offsets.push(pos as u32);
        let opcode = code[pos];
        let size = match OPERAND_LEN[opcode as usize] {
            -2 => {
                return Err(ClassFileError::InvalidCode(format!(
                    "unsupported opcode {opcode:#x} at {pos}"
                )))
            }
            -1 => match opcode {
                op::WIDE => 1 + wide_operand_len(code, pos + 1)?,
                op::TABLESWITCH => {
                    let pad = (4 - (pos + 1) % 4) % 4;
                    let base = pos + 1 + pad;
                    let low = read_i32(code, base + 4)?;
                    let high = read_i32(code, base + 8)?;
                    if high < low {
                        return Err(ClassFileError::InvalidCode("tableswitch bounds".into()));
                    }
                    1 + pad + 12 + 4 * (high - low + 1) as usize
                }
                op::LOOKUPSWITCH => {
                    let pad = (4 - (pos + 1) % 4) % 4;
                    let base = pos + 1 + pad;
                    let npairs = read_i32(code, base + 4)?;
                    if npairs < 0 {
                        return Err(ClassFileError::InvalidCode("lookupswitch npairs".into()));
                    }
                    1 + pad + 8 + 8 * npairs as usize
                }
                _ => unreachable!(),
            },
            n => 1 + n as usize,
        };
        pos += size;
    }
    if pos != code.len() {
        return Err(ClassFileError::InvalidCode(
            "instruction overruns code array".into(),
        ));
    }

    let mut index_of: HashMap<u32, usize> = HashMap::with_capacity(offsets.len() + 1);
    for (i, off) in offsets.iter().enumerate() {
        index_of.insert(*off, i);
    }
    index_of.insert(code.len() as u32, offsets.len());

    let target_index = |from: u32, delta: i64| -> Result<usize, ClassFileError> {
        let target = from as i64 + delta;
        u32::try_from(target)
            .ok()
            .and_then(|t| index_of.get(&t).copied())
            .ok_or_else(|| ClassFileError::InvalidCode(format!("branch to {target} misses")))
    };

    // Second pass: build instructions with index-space targets.
    let mut insns = Vec::with_capacity(offsets.len());
    for &off in &offsets {
        let pos = off as usize;
        let opcode = code[pos];
        let insn = if is_branch16(opcode) {
            let delta = read_i16(code, pos + 1)? as i64;
            Insn::Branch {
                opcode,
                target: target_index(off, delta)?,
            }
        } else if opcode == op::GOTO_W || opcode == op::JSR_W {
            let delta = read_i32(code, pos + 1)? as i64;
            Insn::BranchW {
                opcode,
                target: target_index(off, delta)?,
            }
        } else if opcode == op::TABLESWITCH {
            let pad = (4 - (pos + 1) % 4) % 4;
            let base = pos + 1 + pad;
            let default = target_index(off, read_i32(code, base)? as i64)?;
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            let mut targets = Vec::with_capacity((high - low + 1) as usize);
            for k in 0..(high - low + 1) as usize {
                targets.push(target_index(off, read_i32(code, base + 12 + 4 * k)? as i64)?);
            }
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            }
        } else if opcode == op::LOOKUPSWITCH {
            let pad = (4 - (pos + 1) % 4) % 4;
            let base = pos + 1 + pad;
            let default = target_index(off, read_i32(code, base)? as i64)?;
            let npairs = read_i32(code, base + 4)? as usize;
            let mut pairs = Vec::with_capacity(npairs);
            for k in 0..npairs {
                let key = read_i32(code, base + 8 + 8 * k)?;
                let target = target_index(off, read_i32(code, base + 12 + 8 * k)? as i64)?;
                pairs.push((key, target));
            }
            Insn::LookupSwitch { default, pairs }
        } else {
            let size = match opcode {
                op::WIDE => 1 + wide_operand_len(code, pos + 1)?,
                _ => 1 + OPERAND_LEN[opcode as usize] as usize,
            };
            Insn::Plain {
                opcode,
                operands: code[pos + 1..pos + size].to_vec(),
            }
        };
        insns.push(insn);
    }
    Ok((insns, index_of))
}

fn read_i16(code: &[u8], pos: usize) -> Result<i16, ClassFileError> {
    code.get(pos..pos + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .ok_or(ClassFileError::UnexpectedEof)
}

fn read_i32(code: &[u8], pos: usize) -> Result<i32, ClassFileError> {
    code.get(pos..pos + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ClassFileError::UnexpectedEof)
}

/// Encode an instruction list. Returns the code bytes and the byte
/// offset of each instruction, with one extra trailing entry holding the
/// total code length.
pub fn encode(insns: &[Insn]) -> Result<(Vec<u8>, Vec<u32>), ClassFileError> {
    // Offsets feed switch padding which feeds offsets; iterate to a fixed
    // point (padding shifts by at most 3 bytes per round, this settles in
    // a couple of iterations).
    let mut offsets = vec![0u32; insns.len() + 1];
    let mut converged = false;
    for _ in 0..32 {
        let mut off = 0u32;
        let mut changed = false;
        for (i, insn) in insns.iter().enumerate() {
            if offsets[i] != off {
                offsets[i] = off;
                changed = true;
            }
            off += insn.size_at(off);
        }
        if offsets[insns.len()] != off {
            offsets[insns.len()] = off;
            changed = true;
        }
        if !changed {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(ClassFileError::InvalidCode(
            "offset assignment did not converge".into(),
        ));
    }

    let mut out = Vec::with_capacity(offsets[insns.len()] as usize);
    for (i, insn) in insns.iter().enumerate() {
        let off = offsets[i];
        debug_assert_eq!(off as usize, out.len());
        match insn {
            Insn::Plain { opcode, operands } => {
                out.push(*opcode);
                out.extend_from_slice(operands);
            }
            Insn::Branch { opcode, target } => {
                let delta = offsets[*target] as i64 - off as i64;
                let delta16 =
                    i16::try_from(delta).map_err(|_| ClassFileError::BranchOutOfRange)?;
                out.push(*opcode);
                out.extend_from_slice(&delta16.to_be_bytes());
            }
            Insn::BranchW { opcode, target } => {
                let delta = offsets[*target] as i64 - off as i64;
                out.push(*opcode);
                out.extend_from_slice(&(delta as i32).to_be_bytes());
            }
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                out.push(op::TABLESWITCH);
                while out.len() % 4 != 0 {
                    out.push(0);
                }
                out.extend_from_slice(&((offsets[*default] as i64 - off as i64) as i32).to_be_bytes());
                out.extend_from_slice(&low.to_be_bytes());
                out.extend_from_slice(&high.to_be_bytes());
                for t in targets {
                    out.extend_from_slice(&((offsets[*t] as i64 - off as i64) as i32).to_be_bytes());
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                out.push(op::LOOKUPSWITCH);
                while out.len() % 4 != 0 {
                    out.push(0);
                }
                out.extend_from_slice(&((offsets[*default] as i64 - off as i64) as i32).to_be_bytes());
                out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                for (key, t) in pairs {
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&((offsets[*t] as i64 - off as i64) as i32).to_be_bytes());
                }
            }
        }
    }
    Ok((out, offsets))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// A parsed Code attribute; sub-attributes stay raw until the rewriter
/// needs them.
#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<RawHandler>,
    pub attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<CodeAttribute, ClassFileError> {
        let mut r = Reader::new(info);
        let max_stack = r.read_u2()?;
        let max_locals = r.read_u2()?;
        let code_len = r.read_u4()? as usize;
        let code = r.read_bytes(code_len)?.to_vec();
        let handler_count = r.read_u2()? as usize;
        let mut exception_table = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            exception_table.push(RawHandler {
                start_pc: r.read_u2()?,
                end_pc: r.read_u2()?,
                handler_pc: r.read_u2()?,
                catch_type: r.read_u2()?,
            });
        }
        let attribute_count = r.read_u2()? as usize;
        let mut attributes = Vec::with_capacity(attribute_count);
        for _ in 0..attribute_count {
            attributes.push(AttributeInfo::parse(&mut r)?);
        }
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    /// Serialize back to attribute payload form (without the enclosing
    /// attribute name/length header).
    pub fn write(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u2(self.max_stack);
        w.u2(self.max_locals);
        w.u4(self.code.len() as u32);
        w.bytes(&self.code);
        w.u2(self.exception_table.len() as u16);
        for h in &self.exception_table {
            w.u2(h.start_pc);
            w.u2(h.end_pc);
            w.u2(h.handler_pc);
            w.u2(h.catch_type);
        }
        w.u2(self.attributes.len() as u16);
        for attribute in &self.attributes {
            attribute.write(&mut w);
        }
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_reencodes_straight_line_code() {
        // iconst_1; istore_1; iload_1; ireturn
        let code = vec![0x04, 0x3c, 0x1b, 0xac];
        let (insns, index_of) = decode(&code).unwrap();
        assert_eq!(insns.len(), 4);
        assert_eq!(index_of[&0], 0);
        assert_eq!(index_of[&4], 4);
        let (out, offsets) = encode(&insns).unwrap();
        assert_eq!(out, code);
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn branch_targets_survive_insertion() {
        // 0: iload_1        (offset 0)
        // 1: ifeq -> 4      (offset 1)
        // 2: iconst_1       (offset 4)
        // 3: ireturn        (offset 5)
        // 4: iconst_0       (offset 6)
        // 5: ireturn        (offset 7)
        let code = vec![0x1b, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
        let (mut insns, _) = decode(&code).unwrap();
        assert_eq!(insns[1], Insn::Branch { opcode: op::IFEQ, target: 4 });

        // Insert two nops before index 4 and fix the branch by hand the
        // way the rewriter's retarget map does.
        insns.insert(4, Insn::plain(op::NOP));
        insns.insert(4, Insn::plain(op::NOP));
        if let Insn::Branch { target, .. } = &mut insns[1] {
            *target = 4;
        }
        let (out, _) = decode_encode_round(&insns);
        let (reparsed, _) = decode(&out).unwrap();
        assert_eq!(reparsed[1], Insn::Branch { opcode: op::IFEQ, target: 4 });
        assert_eq!(reparsed[4], Insn::plain(op::NOP));
    }

    fn decode_encode_round(insns: &[Insn]) -> (Vec<u8>, Vec<u32>) {
        encode(insns).unwrap()
    }

    #[test]
    fn tableswitch_padding_reflows() {
        // A tableswitch preceded by a variable number of nops must keep
        // its 4-byte alignment through re-encoding.
        for leading in 0..4usize {
            let mut insns = vec![Insn::plain(op::NOP); leading];
            insns.push(Insn::plain(0x1b)); // iload_1
            let switch_index = insns.len();
            insns.push(Insn::TableSwitch {
                default: switch_index + 1,
                low: 0,
                high: 1,
                targets: vec![switch_index + 1, switch_index + 2],
            });
            insns.push(Insn::plain(op::NOP));
            insns.push(Insn::plain(op::RETURN));
            let (out, offsets) = encode(&insns).unwrap();
            let (reparsed, _) = decode(&out).unwrap();
            assert_eq!(reparsed.len(), insns.len(), "leading={leading}");
            match &reparsed[switch_index] {
                Insn::TableSwitch { targets, .. } => {
                    assert_eq!(targets, &vec![switch_index + 1, switch_index + 2])
                }
                other => panic!("expected tableswitch, got {other:?}"),
            }
            assert_eq!(offsets[offsets.len() - 1] as usize, out.len());
        }
    }

    #[test]
    fn rejects_branches_that_overflow_i16() {
        let mut insns = vec![Insn::Branch {
            opcode: op::GOTO,
            target: 40_000,
        }];
        for _ in 0..40_000 {
            insns.push(Insn::plain(op::NOP));
        }
        insns.push(Insn::plain(op::RETURN));
        assert!(matches!(
            encode(&insns),
            Err(ClassFileError::BranchOutOfRange)
        ));
    }

    #[test]
    fn local_access_picks_compact_forms() {
        assert_eq!(Insn::local(op::ILOAD_0, op::ILOAD, 2), Insn::plain(0x1c));
        assert_eq!(
            Insn::local(op::ALOAD_0, op::ALOAD, 7),
            Insn::Plain {
                opcode: op::ALOAD,
                operands: vec![7]
            }
        );
        assert_eq!(
            Insn::local(op::ILOAD_0, op::ILOAD, 300),
            Insn::Plain {
                opcode: op::WIDE,
                operands: vec![op::ILOAD, 0x01, 0x2c]
            }
        );
    }

    #[test]
    fn code_attribute_round_trips() {
        let attr = CodeAttribute {
            max_stack: 2,
            max_locals: 3,
            code: vec![0x03, 0xac],
            exception_table: vec![RawHandler {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: 0,
            }],
            attributes: vec![],
        };
        let bytes = attr.write();
        let reparsed = CodeAttribute::parse(&bytes).unwrap();
        assert_eq!(reparsed.max_stack, 2);
        assert_eq!(reparsed.max_locals, 3);
        assert_eq!(reparsed.code, attr.code);
        assert_eq!(reparsed.exception_table, attr.exception_table);
    }
}
