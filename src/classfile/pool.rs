//! Constant pool model.
//!
//! Entries round-trip byte-exact (Utf8 payloads are kept as raw bytes, so
//! modified-UTF-8 oddities survive untouched). The `ensure_*` methods
//! intern the symbolic references the rewriter introduces, appending to
//! the pool only when an equal entry does not already exist.

use std::fmt;

use super::{ClassFileError, Reader, Writer};

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name: u16 },
    Str { utf8: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType { descriptor: u16 },
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
}

impl Const {
    /// Longs and doubles take two pool slots.
    fn width(&self) -> usize {
        match self {
            Const::Long(_) | Const::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    // entries[0] is unused; a wide entry is followed by a None filler.
    entries: Vec<Option<Const>>,
}

impl fmt::Display for ConstantPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "constant pool ({} slots)", self.entries.len())
    }
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![None],
        }
    }

    pub fn parse(r: &mut Reader<'_>) -> Result<ConstantPool, ClassFileError> {
        let count = r.read_u2()? as usize;
        let mut entries: Vec<Option<Const>> = Vec::with_capacity(count);
        entries.push(None);
        while entries.len() < count {
            let tag = r.read_u1()?;
            let entry = match tag {
                TAG_UTF8 => {
                    let len = r.read_u2()? as usize;
                    Const::Utf8(r.read_bytes(len)?.to_vec())
                }
                TAG_INTEGER => Const::Integer(r.read_u4()? as i32),
                TAG_FLOAT => Const::Float(r.read_u4()?),
                TAG_LONG => {
                    let hi = r.read_u4()? as u64;
                    let lo = r.read_u4()? as u64;
                    Const::Long(((hi << 32) | lo) as i64)
                }
                TAG_DOUBLE => {
                    let hi = r.read_u4()? as u64;
                    let lo = r.read_u4()? as u64;
                    Const::Double((hi << 32) | lo)
                }
                TAG_CLASS => Const::Class { name: r.read_u2()? },
                TAG_STRING => Const::Str { utf8: r.read_u2()? },
                TAG_FIELDREF => Const::FieldRef {
                    class: r.read_u2()?,
                    name_and_type: r.read_u2()?,
                },
                TAG_METHODREF => Const::MethodRef {
                    class: r.read_u2()?,
                    name_and_type: r.read_u2()?,
                },
                TAG_INTERFACE_METHODREF => Const::InterfaceMethodRef {
                    class: r.read_u2()?,
                    name_and_type: r.read_u2()?,
                },
                TAG_NAME_AND_TYPE => Const::NameAndType {
                    name: r.read_u2()?,
                    descriptor: r.read_u2()?,
                },
                TAG_METHOD_HANDLE => Const::MethodHandle {
                    kind: r.read_u1()?,
                    reference: r.read_u2()?,
                },
                TAG_METHOD_TYPE => Const::MethodType {
                    descriptor: r.read_u2()?,
                },
                TAG_DYNAMIC => Const::Dynamic {
                    bootstrap: r.read_u2()?,
                    name_and_type: r.read_u2()?,
                },
                TAG_INVOKE_DYNAMIC => Const::InvokeDynamic {
                    bootstrap: r.read_u2()?,
                    name_and_type: r.read_u2()?,
                },
                TAG_MODULE => Const::Module { name: r.read_u2()? },
                TAG_PACKAGE => Const::Package { name: r.read_u2()? },
                other => return Err(ClassFileError::InvalidConstantTag(other)),
            };
            let width = entry.width();
            entries.push(Some(entry));
            if width == 2 {
                entries.push(None);
            }
        }
        Ok(ConstantPool { entries })
    }

    pub fn write(&self, w: &mut Writer) {
        w.u2(self.entries.len() as u16);
        for entry in self.entries.iter().flatten() {
            match entry {
                Const::Utf8(bytes) => {
                    w.u1(TAG_UTF8);
                    w.u2(bytes.len() as u16);
                    w.bytes(bytes);
                }
                Const::Integer(v) => {
                    w.u1(TAG_INTEGER);
                    w.u4(*v as u32);
                }
                Const::Float(v) => {
                    w.u1(TAG_FLOAT);
                    w.u4(*v);
                }
                Const::Long(v) => {
                    w.u1(TAG_LONG);
                    w.u4((*v as u64 >> 32) as u32);
                    w.u4(*v as u32);
                }
                Const::Double(v) => {
                    w.u1(TAG_DOUBLE);
                    w.u4((v >> 32) as u32);
                    w.u4(*v as u32);
                }
                Const::Class { name } => {
                    w.u1(TAG_CLASS);
                    w.u2(*name);
                }
                Const::Str { utf8 } => {
                    w.u1(TAG_STRING);
                    w.u2(*utf8);
                }
                Const::FieldRef {
                    class,
                    name_and_type,
                } => {
                    w.u1(TAG_FIELDREF);
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                Const::MethodRef {
                    class,
                    name_and_type,
                } => {
                    w.u1(TAG_METHODREF);
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                Const::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => {
                    w.u1(TAG_INTERFACE_METHODREF);
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                Const::NameAndType { name, descriptor } => {
                    w.u1(TAG_NAME_AND_TYPE);
                    w.u2(*name);
                    w.u2(*descriptor);
                }
                Const::MethodHandle { kind, reference } => {
                    w.u1(TAG_METHOD_HANDLE);
                    w.u1(*kind);
                    w.u2(*reference);
                }
                Const::MethodType { descriptor } => {
                    w.u1(TAG_METHOD_TYPE);
                    w.u2(*descriptor);
                }
                Const::Dynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    w.u1(TAG_DYNAMIC);
                    w.u2(*bootstrap);
                    w.u2(*name_and_type);
                }
                Const::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    w.u1(TAG_INVOKE_DYNAMIC);
                    w.u2(*bootstrap);
                    w.u2(*name_and_type);
                }
                Const::Module { name } => {
                    w.u1(TAG_MODULE);
                    w.u2(*name);
                }
                Const::Package { name } => {
                    w.u1(TAG_PACKAGE);
                    w.u2(*name);
                }
            }
        }
    }

    pub fn get(&self, index: u16) -> Result<&Const, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantIndex(index))
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            Const::Utf8(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| ClassFileError::InvalidUtf8)
            }
            _ => Err(ClassFileError::InvalidConstantIndex(index)),
        }
    }

    /// Internal name of the class behind a CONSTANT_Class entry.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            Const::Class { name } => self.utf8(*name),
            _ => Err(ClassFileError::InvalidConstantIndex(index)),
        }
    }

    fn push(&mut self, entry: Const) -> u16 {
        if self.entries.is_empty() {
            self.entries.push(None);
        }
        let index = self.entries.len() as u16;
        let width = entry.width();
        self.entries.push(Some(entry));
        if width == 2 {
            self.entries.push(None);
        }
        index
    }

    fn find(&self, wanted: &Const) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.as_ref() == Some(wanted))
            .map(|i| i as u16)
    }

    fn ensure(&mut self, entry: Const) -> u16 {
        match self.find(&entry) {
            Some(index) => index,
            None => self.push(entry),
        }
    }

    pub fn ensure_utf8(&mut self, text: &str) -> u16 {
        self.ensure(Const::Utf8(text.as_bytes().to_vec()))
    }

    pub fn ensure_integer(&mut self, value: i32) -> u16 {
        self.ensure(Const::Integer(value))
    }

    pub fn ensure_class(&mut self, internal_name: &str) -> u16 {
        let name = self.ensure_utf8(internal_name);
        self.ensure(Const::Class { name })
    }

    pub fn ensure_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.ensure_utf8(name);
        let descriptor = self.ensure_utf8(descriptor);
        self.ensure(Const::NameAndType { name, descriptor })
    }

    pub fn ensure_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.ensure_class(class);
        let name_and_type = self.ensure_name_and_type(name, descriptor);
        self.ensure(Const::FieldRef {
            class,
            name_and_type,
        })
    }

    pub fn ensure_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.ensure_class(class);
        let name_and_type = self.ensure_name_and_type(name, descriptor);
        self.ensure(Const::MethodRef {
            class,
            name_and_type,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_reuses_existing_entries() {
        let mut pool = ConstantPool::new();
        let a = pool.ensure_class("java/lang/Throwable");
        let b = pool.ensure_class("java/lang/Throwable");
        assert_eq!(a, b);
        let f1 = pool.ensure_field_ref("com/x/Ev", "value", "I");
        let f2 = pool.ensure_field_ref("com/x/Ev", "value", "I");
        assert_eq!(f1, f2);
        let f3 = pool.ensure_field_ref("com/x/Ev", "value", "J");
        assert_ne!(f1, f3);
    }

    #[test]
    fn wide_entries_take_two_slots() {
        let mut pool = ConstantPool::new();
        let l = pool.push(Const::Long(42));
        let next = pool.ensure_utf8("after");
        assert_eq!(next, l + 2);
        assert!(matches!(pool.get(l), Ok(Const::Long(42))));
        assert!(pool.get(l + 1).is_err());
    }

    #[test]
    fn pool_round_trips_through_bytes() {
        let mut pool = ConstantPool::new();
        pool.ensure_utf8("Hello");
        pool.push(Const::Long(-1));
        pool.push(Const::Double(f64::to_bits(1.5)));
        pool.ensure_method_ref("com/x/A", "m", "()V");

        let mut w = Writer::new();
        pool.write(&mut w);
        let bytes = w.finish();
        let mut r = Reader::new(&bytes);
        let reparsed = ConstantPool::parse(&mut r).unwrap();
        assert_eq!(reparsed.slot_count(), pool.slot_count());
        assert_eq!(reparsed.utf8(1).unwrap(), "Hello");
    }
}
