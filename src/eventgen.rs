//! Event type synthesis.
//!
//! Each probe gets a minimal `jdk.jfr.Event` subclass: one public field
//! per surviving capture, class-level metadata annotations, and a default
//! constructor. The rewriter instantiates it at the splice points and
//! calls the inherited `commit()`.

use std::fmt;

use crate::classfile::code::op;
use crate::classfile::{
    AttributeInfo, ClassFile, ConstantPool, MemberInfo, Writer, ACC_PUBLIC, ACC_SUPER,
    ACC_SYNTHETIC,
};
use crate::desc::JavaType;
use crate::probe::ProbeDescriptor;

pub const EVENT_BASE: &str = "jdk/jfr/Event";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The sanitized prefix + id reduced to nothing usable.
    InvalidClassName { name: String },
    /// Two captures map to the same event field name.
    DuplicateField { name: String },
    /// Another probe already owns this synthesized class name.
    NameCollision { name: String },
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::InvalidClassName { name } => {
                write!(f, "cannot derive a valid event class name from '{name}'")
            }
            GenerationError::DuplicateField { name } => {
                write!(f, "duplicate event field name '{name}'")
            }
            GenerationError::NameCollision { name } => {
                write!(f, "event class name '{name}' already belongs to another probe")
            }
        }
    }
}

impl std::error::Error for GenerationError {}

/// One field of the synthesized event type, already resolved to the type
/// actually written at the splice point.
#[derive(Debug, Clone)]
pub struct EventField {
    pub name: String,
    pub ty: JavaType,
    pub label: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedClass {
    /// Internal name of the synthesized type.
    pub class_name: String,
    pub bytes: Vec<u8>,
}

// element_value of kind String.
fn annotation_string(pool: &mut ConstantPool, w: &mut Writer, value: &str) {
    w.u1(b's');
    w.u2(pool.ensure_utf8(value));
}

fn annotation(pool: &mut ConstantPool, type_descriptor: &str, value: Option<&dyn Fn(&mut ConstantPool, &mut Writer)>) -> Vec<u8> {
    let mut w = Writer::new();
    w.u2(pool.ensure_utf8(type_descriptor));
    match value {
        None => w.u2(0),
        Some(write_value) => {
            w.u2(1);
            w.u2(pool.ensure_utf8("value"));
            write_value(pool, &mut w);
        }
    }
    w.finish()
}

fn annotations_attribute(pool: &mut ConstantPool, annotations: Vec<Vec<u8>>) -> AttributeInfo {
    let name_index = pool.ensure_utf8("RuntimeVisibleAnnotations");
    let mut w = Writer::new();
    w.u2(annotations.len() as u16);
    for a in &annotations {
        w.bytes(a);
    }
    AttributeInfo {
        name_index,
        info: w.finish(),
    }
}

fn class_annotations(pool: &mut ConstantPool, descriptor: &ProbeDescriptor) -> AttributeInfo {
    let mut annotations = Vec::new();

    let label = descriptor.label.clone();
    annotations.push(annotation(
        pool,
        "Ljdk/jfr/Label;",
        Some(&|p: &mut ConstantPool, w: &mut Writer| annotation_string(p, w, &label)),
    ));
    let name = crate::desc::canonical_name(&descriptor.event_class_name);
    annotations.push(annotation(
        pool,
        "Ljdk/jfr/Name;",
        Some(&|p: &mut ConstantPool, w: &mut Writer| annotation_string(p, w, &name)),
    ));
    if let Some(description) = descriptor.description.clone() {
        annotations.push(annotation(
            pool,
            "Ljdk/jfr/Description;",
            Some(&|p: &mut ConstantPool, w: &mut Writer| {
                annotation_string(p, w, &description)
            }),
        ));
    }
    if let Some(path) = descriptor.path.clone() {
        // @Category takes an array of path segments.
        let segments: Vec<String> = path.split('/').map(str::to_string).collect();
        annotations.push(annotation(
            pool,
            "Ljdk/jfr/Category;",
            Some(&move |p: &mut ConstantPool, w: &mut Writer| {
                w.u1(b'[');
                w.u2(segments.len() as u16);
                for segment in &segments {
                    annotation_string(p, w, segment);
                }
            }),
        ));
    }
    let stacktrace = descriptor.emission.record_stack_trace;
    annotations.push(annotation(
        pool,
        "Ljdk/jfr/StackTrace;",
        Some(&move |p: &mut ConstantPool, w: &mut Writer| {
            w.u1(b'Z');
            w.u2(p.ensure_integer(stacktrace as i32));
        }),
    ));
    annotations_attribute(pool, annotations)
}

fn field_annotations(pool: &mut ConstantPool, field: &EventField) -> Option<AttributeInfo> {
    let mut annotations = Vec::new();
    if let Some(label) = field.label.clone() {
        annotations.push(annotation(
            pool,
            "Ljdk/jfr/Label;",
            Some(&move |p: &mut ConstantPool, w: &mut Writer| annotation_string(p, w, &label)),
        ));
    }
    if let Some(description) = field.description.clone() {
        annotations.push(annotation(
            pool,
            "Ljdk/jfr/Description;",
            Some(&move |p: &mut ConstantPool, w: &mut Writer| {
                annotation_string(p, w, &description)
            }),
        ));
    }
    if annotations.is_empty() {
        return None;
    }
    Some(annotations_attribute(pool, annotations))
}

fn default_constructor(pool: &mut ConstantPool) -> MemberInfo {
    let super_init = pool.ensure_method_ref(EVENT_BASE, "<init>", "()V");
    let mut code = Writer::new();
    code.u2(1); // max_stack
    code.u2(1); // max_locals
    let body = [
        op::ALOAD_0,
        op::INVOKESPECIAL,
        (super_init >> 8) as u8,
        super_init as u8,
        op::RETURN,
    ];
    code.u4(body.len() as u32);
    code.bytes(&body);
    code.u2(0); // exception table
    code.u2(0); // attributes
    MemberInfo {
        access_flags: ACC_PUBLIC,
        name_index: pool.ensure_utf8("<init>"),
        descriptor_index: pool.ensure_utf8("()V"),
        attributes: vec![AttributeInfo {
            name_index: pool.ensure_utf8("Code"),
            info: code.finish(),
        }],
    }
}

/// Synthesize the event class for a probe. `major` should match the host
/// class being instrumented so cross-verification never sees a newer
/// version than its surroundings.
pub fn generate(
    descriptor: &ProbeDescriptor,
    fields: &[EventField],
    major: u16,
) -> Result<GeneratedClass, GenerationError> {
    let class_name = descriptor.event_class_name.clone();
    let simple = class_name.rsplit('/').next().unwrap_or("");
    if simple.is_empty()
        || simple
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(true)
    {
        return Err(GenerationError::InvalidClassName { name: class_name });
    }
    for (i, field) in fields.iter().enumerate() {
        if fields[..i].iter().any(|f| f.name == field.name) {
            return Err(GenerationError::DuplicateField {
                name: field.name.clone(),
            });
        }
    }

    let mut pool = ConstantPool::new();
    let this_class = pool.ensure_class(&class_name);
    let super_class = pool.ensure_class(EVENT_BASE);

    let mut members = Vec::with_capacity(fields.len());
    for field in fields {
        let attributes = field_annotations(&mut pool, field).into_iter().collect();
        members.push(MemberInfo {
            access_flags: ACC_PUBLIC,
            name_index: pool.ensure_utf8(&field.name),
            descriptor_index: pool.ensure_utf8(&field.ty.descriptor()),
            attributes,
        });
    }

    let constructor = default_constructor(&mut pool);
    let class_attributes = vec![class_annotations(&mut pool, descriptor)];

    let class = ClassFile {
        minor: 0,
        major: major.max(52), // jdk.jfr exists from 9 (52 is safe floor)
        pool,
        access_flags: ACC_PUBLIC | ACC_SUPER | ACC_SYNTHETIC,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: members,
        methods: vec![constructor],
        attributes: class_attributes,
    };

    Ok(GeneratedClass {
        class_name,
        bytes: class.to_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{EmissionPolicy, MatchStateCell, MethodRef};

    fn descriptor() -> ProbeDescriptor {
        ProbeDescriptor {
            id: "demo.event1".to_string(),
            class_name: "com.company.Demo".to_string(),
            method: MethodRef {
                name: "work".to_string(),
                descriptor: "(I)I".to_string(),
            },
            label: "Demo Event".to_string(),
            description: Some("demo".to_string()),
            path: Some("demo/probes".to_string()),
            emission: EmissionPolicy {
                record_stack_trace: true,
                ..EmissionPolicy::default()
            },
            captures: Vec::new(),
            match_state: MatchStateCell::default(),
            event_class_name: "__TraceEventdemoevent1".to_string(),
            allow_to_string: false,
            allow_converter: false,
        }
    }

    fn fields() -> Vec<EventField> {
        vec![
            EventField {
                name: "arg0".to_string(),
                ty: JavaType::Int,
                label: Some("param 0".to_string()),
                description: None,
            },
            EventField {
                name: "returnValue".to_string(),
                ty: JavaType::object("java/lang/String"),
                label: None,
                description: None,
            },
        ]
    }

    #[test]
    fn generated_class_reparses_with_expected_shape() {
        let generated = generate(&descriptor(), &fields(), 55).unwrap();
        let class = ClassFile::parse(&generated.bytes).unwrap();
        assert_eq!(class.class_name().unwrap(), "__TraceEventdemoevent1");
        assert_eq!(class.super_class_name().unwrap(), Some(EVENT_BASE));
        assert_eq!(class.fields.len(), 2);
        assert_eq!(class.find_field("arg0"), Some(("I", ACC_PUBLIC)));
        assert_eq!(
            class.find_field("returnValue"),
            Some(("Ljava/lang/String;", ACC_PUBLIC))
        );
        assert!(class.find_method("<init>", "()V").is_some());
        assert_eq!(class.major, 55);
        // Class metadata annotations present.
        let annotations = class.attributes.iter().any(|a| {
            class
                .pool
                .utf8(a.name_index)
                .map(|n| n == "RuntimeVisibleAnnotations")
                .unwrap_or(false)
        });
        assert!(annotations);
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let mut fs = fields();
        fs[1].name = "arg0".to_string();
        assert!(matches!(
            generate(&descriptor(), &fs, 52),
            Err(GenerationError::DuplicateField { .. })
        ));
    }

    #[test]
    fn generation_is_deterministic() {
        let a = generate(&descriptor(), &fields(), 52).unwrap();
        let b = generate(&descriptor(), &fields(), 52).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }
}
