//! JVM type and method descriptor handling.
//!
//! Everything downstream of the probe document speaks descriptor syntax:
//! the validator checks it, the rewriter matches methods by it and sizes
//! locals from it, and the event generator types its fields with it.

use std::fmt;

/// A field/parameter/return type as encoded in a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JavaType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Internal (slash-separated) class name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<JavaType>),
}

impl JavaType {
    pub const STRING: &'static str = "java/lang/String";
    pub const THREAD: &'static str = "java/lang/Thread";
    pub const CLASS: &'static str = "java/lang/Class";

    pub fn object(internal_name: &str) -> JavaType {
        JavaType::Object(internal_name.to_string())
    }

    /// Number of local-variable slots a value of this type occupies.
    pub fn slot_width(&self) -> u16 {
        match self {
            JavaType::Long | JavaType::Double => 2,
            _ => 1,
        }
    }

    /// The descriptor string for this type, e.g. `[Ljava/lang/String;`.
    pub fn descriptor(&self) -> String {
        match self {
            JavaType::Boolean => "Z".to_string(),
            JavaType::Byte => "B".to_string(),
            JavaType::Char => "C".to_string(),
            JavaType::Short => "S".to_string(),
            JavaType::Int => "I".to_string(),
            JavaType::Long => "J".to_string(),
            JavaType::Float => "F".to_string(),
            JavaType::Double => "D".to_string(),
            JavaType::Object(name) => format!("L{name};"),
            JavaType::Array(elem) => format!("[{}", elem.descriptor()),
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, JavaType::Object(_) | JavaType::Array(_))
    }

    /// Types a JFR event field can carry without conversion: primitives
    /// plus String, Thread and Class.
    pub fn is_recordable(&self) -> bool {
        match self {
            JavaType::Object(name) => {
                name == Self::STRING || name == Self::THREAD || name == Self::CLASS
            }
            JavaType::Array(_) => false,
            _ => true,
        }
    }
}

impl fmt::Display for JavaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor())
    }
}

/// A parsed method descriptor; `ret` is `None` for void.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDesc {
    pub params: Vec<JavaType>,
    pub ret: Option<JavaType>,
}

impl MethodDesc {
    /// Total local slots taken by the receiver (if any) plus the formal
    /// parameters, i.e. the first free slot in an unmodified frame.
    pub fn arg_slots(&self, is_static: bool) -> u16 {
        let recv = if is_static { 0 } else { 1 };
        self.params.iter().map(JavaType::slot_width).sum::<u16>() + recv
    }

    /// Local slot index of parameter `index`, counting the receiver.
    pub fn param_slot(&self, index: usize, is_static: bool) -> Option<u16> {
        if index >= self.params.len() {
            return None;
        }
        let mut slot = if is_static { 0 } else { 1 };
        for p in &self.params[..index] {
            slot += p.slot_width();
        }
        Some(slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorError {
    pub input: String,
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid descriptor '{}'", self.input)
    }
}

impl std::error::Error for DescriptorError {}

fn parse_type(chars: &mut std::str::Chars<'_>, input: &str) -> Result<JavaType, DescriptorError> {
    let err = || DescriptorError {
        input: input.to_string(),
    };
    match chars.next().ok_or_else(err)? {
        'Z' => Ok(JavaType::Boolean),
        'B' => Ok(JavaType::Byte),
        'C' => Ok(JavaType::Char),
        'S' => Ok(JavaType::Short),
        'I' => Ok(JavaType::Int),
        'J' => Ok(JavaType::Long),
        'F' => Ok(JavaType::Float),
        'D' => Ok(JavaType::Double),
        'L' => {
            let mut name = String::new();
            loop {
                match chars.next().ok_or_else(err)? {
                    ';' => break,
                    c => name.push(c),
                }
            }
            if name.is_empty() {
                return Err(err());
            }
            Ok(JavaType::Object(name))
        }
        '[' => Ok(JavaType::Array(Box::new(parse_type(chars, input)?))),
        _ => Err(err()),
    }
}

/// Parse a single field/type descriptor such as `I` or `[Ljava/lang/String;`.
pub fn parse_type_descriptor(input: &str) -> Result<JavaType, DescriptorError> {
    let mut chars = input.chars();
    let ty = parse_type(&mut chars, input)?;
    if chars.next().is_some() {
        return Err(DescriptorError {
            input: input.to_string(),
        });
    }
    Ok(ty)
}

/// Parse a method descriptor such as `(Ljava/lang/String;J)I`.
pub fn parse_method_descriptor(input: &str) -> Result<MethodDesc, DescriptorError> {
    let err = || DescriptorError {
        input: input.to_string(),
    };
    let mut chars = input.chars();
    if chars.next() != Some('(') {
        return Err(err());
    }
    let mut params = Vec::new();
    loop {
        // Peek for the closing paren without consuming a type char.
        match chars.clone().next() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => params.push(parse_type(&mut chars, input)?),
            None => return Err(err()),
        }
    }
    let ret = if chars.as_str() == "V" {
        chars.next();
        None
    } else {
        Some(parse_type(&mut chars, input)?)
    };
    if chars.next().is_some() {
        return Err(err());
    }
    Ok(MethodDesc { params, ret })
}

/// `com.company.Project` -> `com/company/Project`.
pub fn internal_name(canonical: &str) -> String {
    canonical.replace('.', "/")
}

/// `com/company/Project` -> `com.company.Project`.
pub fn canonical_name(internal: &str) -> String {
    internal.replace('/', ".")
}

/// Strip characters that cannot appear in a Java identifier; used when
/// deriving a synthesized class name from a probe id like `demo.event1`.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            out.push(c);
        }
    }
    if out
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
    {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitives_and_void() {
        let d = parse_method_descriptor("()V").unwrap();
        assert!(d.params.is_empty());
        assert!(d.ret.is_none());

        let d = parse_method_descriptor("(IJZ)D").unwrap();
        assert_eq!(
            d.params,
            vec![JavaType::Int, JavaType::Long, JavaType::Boolean]
        );
        assert_eq!(d.ret, Some(JavaType::Double));
    }

    #[test]
    fn parses_objects_and_arrays() {
        let d = parse_method_descriptor("([[Lcom/company/project/MyClass;)[D").unwrap();
        assert_eq!(
            d.params[0],
            JavaType::Array(Box::new(JavaType::Array(Box::new(JavaType::object(
                "com/company/project/MyClass"
            )))))
        );
        assert_eq!(d.ret, Some(JavaType::Array(Box::new(JavaType::Double))));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "()", "not a valid descriptor", "(L;)V", "(I", "()VV", "(Q)V"] {
            assert!(parse_method_descriptor(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn descriptor_round_trip() {
        for desc in ["(Ljava/lang/String;J)I", "()[[D", "([Lcom/a/B;II)V"] {
            let parsed = parse_method_descriptor(desc).unwrap();
            let mut rebuilt = String::from("(");
            for p in &parsed.params {
                rebuilt.push_str(&p.descriptor());
            }
            rebuilt.push(')');
            match &parsed.ret {
                Some(t) => rebuilt.push_str(&t.descriptor()),
                None => rebuilt.push('V'),
            }
            assert_eq!(rebuilt, desc);
        }
    }

    #[test]
    fn param_slots_account_for_receiver_and_wide_types() {
        let d = parse_method_descriptor("(JI)V").unwrap();
        assert_eq!(d.param_slot(0, false), Some(1));
        assert_eq!(d.param_slot(1, false), Some(3));
        assert_eq!(d.param_slot(0, true), Some(0));
        assert_eq!(d.arg_slots(false), 4);
        assert_eq!(d.param_slot(2, true), None);
    }

    #[test]
    fn recordable_types() {
        assert!(JavaType::Int.is_recordable());
        assert!(JavaType::object("java/lang/String").is_recordable());
        assert!(!JavaType::object("java/util/List").is_recordable());
        assert!(!JavaType::Array(Box::new(JavaType::Int)).is_recordable());
    }

    #[test]
    fn sanitizes_probe_ids() {
        assert_eq!(sanitize_identifier("demo.event1"), "demoevent1");
        assert_eq!(sanitize_identifier("1bad"), "_1bad");
        assert_eq!(sanitize_identifier("ok_id$x"), "ok_id$x");
    }
}
