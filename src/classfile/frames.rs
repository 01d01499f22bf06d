//! StackMapTable decoding and re-encoding.
//!
//! Frames are decoded into full (uncompressed) form with instruction-index
//! positions so the rewriter can shift code freely; the encoder picks the
//! tightest compressed entry kind that still expresses each frame.

use std::collections::HashMap;

use super::pool::ConstantPool;
use super::{ClassFileError, Reader, Writer};
use crate::desc::JavaType;

const ITEM_TOP: u8 = 0;
const ITEM_INTEGER: u8 = 1;
const ITEM_FLOAT: u8 = 2;
const ITEM_DOUBLE: u8 = 3;
const ITEM_LONG: u8 = 4;
const ITEM_NULL: u8 = 5;
const ITEM_UNINITIALIZED_THIS: u8 = 6;
const ITEM_OBJECT: u8 = 7;
const ITEM_UNINITIALIZED: u8 = 8;

/// A verification type; object names are held as strings so frames stay
/// meaningful while the constant pool is being extended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Internal class name (or array descriptor).
    Object(String),
    /// The instruction index of the `new` that produced the value.
    Uninitialized(usize),
}

impl VType {
    /// Local-variable slots this entry covers.
    pub fn slots(&self) -> u16 {
        match self {
            VType::Double | VType::Long => 2,
            _ => 1,
        }
    }

    /// Verification type corresponding to a descriptor type.
    pub fn of(ty: &JavaType) -> VType {
        match ty {
            JavaType::Boolean
            | JavaType::Byte
            | JavaType::Char
            | JavaType::Short
            | JavaType::Int => VType::Integer,
            JavaType::Long => VType::Long,
            JavaType::Float => VType::Float,
            JavaType::Double => VType::Double,
            JavaType::Object(name) => VType::Object(name.clone()),
            JavaType::Array(_) => VType::Object(ty.descriptor()),
        }
    }
}

/// One uncompressed frame, positioned by instruction index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub at: usize,
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

/// Implicit entry frame for a method: receiver (if any) then parameters.
pub fn initial_locals(class_internal: &str, params: &[JavaType], is_static: bool) -> Vec<VType> {
    let mut locals = Vec::with_capacity(params.len() + 1);
    if !is_static {
        locals.push(VType::Object(class_internal.to_string()));
    }
    locals.extend(params.iter().map(VType::of));
    locals
}

fn parse_vtype(
    r: &mut Reader<'_>,
    pool: &ConstantPool,
    index_of: &HashMap<u32, usize>,
) -> Result<VType, ClassFileError> {
    Ok(match r.read_u1()? {
        ITEM_TOP => VType::Top,
        ITEM_INTEGER => VType::Integer,
        ITEM_FLOAT => VType::Float,
        ITEM_DOUBLE => VType::Double,
        ITEM_LONG => VType::Long,
        ITEM_NULL => VType::Null,
        ITEM_UNINITIALIZED_THIS => VType::UninitializedThis,
        ITEM_OBJECT => VType::Object(pool.class_name(r.read_u2()?)?.to_string()),
        ITEM_UNINITIALIZED => {
            let offset = r.read_u2()? as u32;
            let index = index_of.get(&offset).copied().ok_or_else(|| {
                ClassFileError::InvalidStackMap(format!(
                    "uninitialized entry points at {offset}, not an instruction"
                ))
            })?;
            VType::Uninitialized(index)
        }
        other => {
            return Err(ClassFileError::InvalidStackMap(format!(
                "unknown verification type tag {other}"
            )))
        }
    })
}

fn write_vtype(
    w: &mut Writer,
    v: &VType,
    pool: &mut ConstantPool,
    offsets: &[u32],
) -> Result<(), ClassFileError> {
    match v {
        VType::Top => w.u1(ITEM_TOP),
        VType::Integer => w.u1(ITEM_INTEGER),
        VType::Float => w.u1(ITEM_FLOAT),
        VType::Double => w.u1(ITEM_DOUBLE),
        VType::Long => w.u1(ITEM_LONG),
        VType::Null => w.u1(ITEM_NULL),
        VType::UninitializedThis => w.u1(ITEM_UNINITIALIZED_THIS),
        VType::Object(name) => {
            let index = pool.ensure_class(name);
            w.u1(ITEM_OBJECT);
            w.u2(index);
        }
        VType::Uninitialized(index) => {
            let offset = offsets
                .get(*index)
                .copied()
                .ok_or_else(|| ClassFileError::InvalidStackMap("uninitialized index".into()))?;
            w.u1(ITEM_UNINITIALIZED);
            w.u2(offset as u16);
        }
    }
    Ok(())
}

/// Decode a StackMapTable attribute payload to full frames.
///
/// `initial_locals` seeds the implicit frame the compressed deltas build
/// on; `index_of` maps byte offsets of the accompanying code array to
/// instruction indices.
pub fn parse_stack_map(
    info: &[u8],
    pool: &ConstantPool,
    index_of: &HashMap<u32, usize>,
    initial_locals: &[VType],
) -> Result<Vec<Frame>, ClassFileError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()? as usize;
    let mut frames = Vec::with_capacity(count);
    let mut locals: Vec<VType> = initial_locals.to_vec();
    let mut offset: u32 = 0;
    for i in 0..count {
        let frame_type = r.read_u1()?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u32, Vec::new()),
            64..=127 => {
                let stack = vec![parse_vtype(&mut r, pool, index_of)?];
                ((frame_type - 64) as u32, stack)
            }
            247 => {
                let delta = r.read_u2()? as u32;
                let stack = vec![parse_vtype(&mut r, pool, index_of)?];
                (delta, stack)
            }
            248..=250 => {
                let k = (251 - frame_type) as usize;
                if locals.len() < k {
                    return Err(ClassFileError::InvalidStackMap("chop underflow".into()));
                }
                locals.truncate(locals.len() - k);
                (r.read_u2()? as u32, Vec::new())
            }
            251 => (r.read_u2()? as u32, Vec::new()),
            252..=254 => {
                let delta = r.read_u2()? as u32;
                for _ in 0..(frame_type - 251) {
                    locals.push(parse_vtype(&mut r, pool, index_of)?);
                }
                (delta, Vec::new())
            }
            255 => {
                let delta = r.read_u2()? as u32;
                let local_count = r.read_u2()? as usize;
                let mut new_locals = Vec::with_capacity(local_count);
                for _ in 0..local_count {
                    new_locals.push(parse_vtype(&mut r, pool, index_of)?);
                }
                let stack_count = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(stack_count);
                for _ in 0..stack_count {
                    stack.push(parse_vtype(&mut r, pool, index_of)?);
                }
                locals = new_locals;
                (delta, stack)
            }
            other => {
                return Err(ClassFileError::InvalidStackMap(format!(
                    "reserved frame type {other}"
                )))
            }
        };
        offset = if i == 0 { delta } else { offset + delta + 1 };
        let at = index_of.get(&offset).copied().ok_or_else(|| {
            ClassFileError::InvalidStackMap(format!("frame at {offset}, not an instruction"))
        })?;
        frames.push(Frame {
            at,
            locals: locals.clone(),
            stack,
        });
    }
    Ok(frames)
}

/// Encode full frames back to a StackMapTable payload, choosing the
/// tightest entry kind for each frame. Frames must be sorted by position
/// and unique per instruction.
pub fn encode_stack_map(
    frames: &[Frame],
    offsets: &[u32],
    pool: &mut ConstantPool,
    initial_locals: &[VType],
) -> Result<Vec<u8>, ClassFileError> {
    let mut w = Writer::new();
    w.u2(frames.len() as u16);
    let mut prev_locals = initial_locals;
    let mut prev_offset: Option<u32> = None;
    for frame in frames {
        let offset = offsets
            .get(frame.at)
            .copied()
            .ok_or_else(|| ClassFileError::InvalidStackMap("frame index".into()))?;
        let delta = match prev_offset {
            None => offset,
            Some(prev) => {
                if offset <= prev {
                    return Err(ClassFileError::InvalidStackMap(
                        "frames out of order".into(),
                    ));
                }
                offset - prev - 1
            }
        };

        let same_locals = frame.locals == prev_locals;
        if same_locals && frame.stack.is_empty() {
            if delta <= 63 {
                w.u1(delta as u8);
            } else {
                w.u1(251);
                w.u2(delta as u16);
            }
        } else if same_locals && frame.stack.len() == 1 {
            if delta <= 63 {
                w.u1(64 + delta as u8);
            } else {
                w.u1(247);
                w.u2(delta as u16);
            }
            write_vtype(&mut w, &frame.stack[0], pool, offsets)?;
        } else if frame.stack.is_empty()
            && frame.locals.len() < prev_locals.len()
            && prev_locals.len() - frame.locals.len() <= 3
            && prev_locals[..frame.locals.len()] == frame.locals[..]
        {
            let k = prev_locals.len() - frame.locals.len();
            w.u1(251 - k as u8);
            w.u2(delta as u16);
        } else if frame.stack.is_empty()
            && frame.locals.len() > prev_locals.len()
            && frame.locals.len() - prev_locals.len() <= 3
            && frame.locals[..prev_locals.len()] == prev_locals[..]
        {
            let k = frame.locals.len() - prev_locals.len();
            w.u1(251 + k as u8);
            w.u2(delta as u16);
            for v in &frame.locals[prev_locals.len()..] {
                write_vtype(&mut w, v, pool, offsets)?;
            }
        } else {
            w.u1(255);
            w.u2(delta as u16);
            w.u2(frame.locals.len() as u16);
            for v in &frame.locals {
                write_vtype(&mut w, v, pool, offsets)?;
            }
            w.u2(frame.stack.len() as u16);
            for v in &frame.stack {
                write_vtype(&mut w, v, pool, offsets)?;
            }
        }

        prev_locals = &frame.locals;
        prev_offset = Some(offset);
    }
    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_map(n: usize) -> HashMap<u32, usize> {
        // One instruction per byte offset keeps the tests readable.
        (0..=n).map(|i| (i as u32, i)).collect()
    }

    fn offsets(n: usize) -> Vec<u32> {
        (0..=n as u32).collect()
    }

    #[test]
    fn same_chop_append_round_trip() {
        let initial = vec![VType::Object("com/x/A".into()), VType::Integer];
        let frames = vec![
            Frame {
                at: 4,
                locals: initial.clone(),
                stack: vec![],
            },
            Frame {
                at: 10,
                // append two
                locals: vec![
                    VType::Object("com/x/A".into()),
                    VType::Integer,
                    VType::Long,
                    VType::Float,
                ],
                stack: vec![],
            },
            Frame {
                at: 20,
                // chop one
                locals: vec![
                    VType::Object("com/x/A".into()),
                    VType::Integer,
                    VType::Long,
                ],
                stack: vec![],
            },
            Frame {
                at: 30,
                // same locals, one stack item
                locals: vec![
                    VType::Object("com/x/A".into()),
                    VType::Integer,
                    VType::Long,
                ],
                stack: vec![VType::Object("java/lang/Throwable".into())],
            },
        ];

        let mut pool = ConstantPool::new();
        let encoded =
            encode_stack_map(&frames, &offsets(64), &mut pool, &initial).unwrap();
        // SAME, APPEND(2), CHOP(1), SAME_LOCALS_1 respectively.
        assert_eq!(encoded[2], 4);
        assert_eq!(encoded[3], 253);
        let decoded =
            parse_stack_map(&encoded, &pool, &identity_map(64), &initial).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn long_deltas_use_extended_forms() {
        let initial = vec![VType::Integer];
        let frames = vec![
            Frame {
                at: 100,
                locals: initial.clone(),
                stack: vec![],
            },
            Frame {
                at: 300,
                locals: initial.clone(),
                stack: vec![VType::Null],
            },
        ];
        let mut pool = ConstantPool::new();
        let encoded =
            encode_stack_map(&frames, &offsets(400), &mut pool, &initial).unwrap();
        assert_eq!(encoded[2], 251); // same_frame_extended
        assert_eq!(encoded[5], 247); // same_locals_1_stack_item_extended
        let decoded =
            parse_stack_map(&encoded, &pool, &identity_map(400), &initial).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn full_frames_cover_everything_else() {
        let initial = vec![VType::Object("com/x/A".into())];
        let frames = vec![Frame {
            at: 8,
            locals: vec![
                VType::Object("com/x/A".into()),
                VType::Top,
                VType::Double,
                VType::Uninitialized(3),
            ],
            stack: vec![VType::Integer, VType::Integer],
        }];
        let mut pool = ConstantPool::new();
        let encoded = encode_stack_map(&frames, &offsets(16), &mut pool, &initial).unwrap();
        assert_eq!(encoded[2], 255);
        let decoded = parse_stack_map(&encoded, &pool, &identity_map(16), &initial).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn rejects_out_of_order_frames() {
        let initial = vec![VType::Integer];
        let frames = vec![
            Frame {
                at: 10,
                locals: initial.clone(),
                stack: vec![],
            },
            Frame {
                at: 5,
                locals: initial.clone(),
                stack: vec![],
            },
        ];
        let mut pool = ConstantPool::new();
        assert!(encode_stack_map(&frames, &offsets(16), &mut pool, &initial).is_err());
    }
}
