//! The classfile rewriter: splices capture-and-emit instrumentation into
//! matched methods at class-load/redefinition time.
//!
//! Everything here is best-effort per probe and per method: a method that
//! cannot be rewritten is left untouched, a capture that cannot be
//! resolved is dropped, and the class always loads.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::classfile::code::{self, op, CodeAttribute, Insn, RawHandler};
use crate::classfile::frames::{self, Frame, VType};
use crate::classfile::{AttributeInfo, ClassFile, ClassFileError, Reader, Writer, ACC_STATIC};
use crate::desc::{self, DescriptorError, JavaType, MethodDesc};
use crate::eventgen::{self, EventField, GeneratedClass};
use crate::expr::FieldExpr;
use crate::probe::{Capture, MatchState, ProbeDescriptor};
use crate::registry::TransformRegistry;

const STRING_VALUE_OF_DESC: &str = "(Ljava/lang/Object;)Ljava/lang/String;";
const THROWABLE: &str = "java/lang/Throwable";

// Emission keeps at most the event reference, a dup of it, and a wide
// value above whatever the method already had on the stack.
const EMISSION_STACK: u16 = 4;

/// A user converter resolved to its static entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterSpec {
    /// Internal name of the class declaring the entry point.
    pub owner: String,
    pub method: String,
    /// Full method descriptor, e.g. `(J)Ljava/lang/String;`.
    pub descriptor: String,
}

impl ConverterSpec {
    fn return_type(&self) -> Result<JavaType, DescriptorError> {
        let parsed = desc::parse_method_descriptor(&self.descriptor)?;
        parsed.ret.ok_or(DescriptorError {
            input: self.descriptor.clone(),
        })
    }
}

/// Converter class name -> entry point, populated by the host. A name
/// that is absent here soft-disables that one capture's conversion.
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    specs: RwLock<HashMap<String, ConverterSpec>>,
}

impl ConverterRegistry {
    pub fn register(&self, converter_class: &str, spec: ConverterSpec) {
        self.specs
            .write()
            .expect("converter lock poisoned")
            .insert(converter_class.to_string(), spec);
    }

    pub fn resolve(&self, converter_class: &str) -> Option<ConverterSpec> {
        self.specs
            .read()
            .expect("converter lock poisoned")
            .get(converter_class)
            .cloned()
    }
}

/// Outcome of one `transform` call.
#[derive(Debug)]
pub enum Transformed {
    /// Nothing to do; the caller keeps its original bytes.
    Unchanged,
    Rewritten {
        bytecode: Vec<u8>,
        /// Event types the host must define to the same loader before or
        /// with the rewritten class.
        event_classes: Vec<Arc<GeneratedClass>>,
    },
}

impl Transformed {
    pub fn bytecode(&self) -> Option<&[u8]> {
        match self {
            Transformed::Unchanged => None,
            Transformed::Rewritten { bytecode, .. } => Some(bytecode),
        }
    }
}

#[derive(Debug)]
enum RewriteError {
    Class(ClassFileError),
    Descriptor(DescriptorError),
    /// Constructors and class initializers are not instrumented.
    Constructor,
    /// No Code attribute (abstract or native method).
    NoCode,
    CodeTooLarge,
    /// Event type synthesis failed; the probe is inert.
    Generation(eventgen::GenerationError),
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::Class(e) => write!(f, "{e}"),
            RewriteError::Descriptor(e) => write!(f, "{e}"),
            RewriteError::Constructor => write!(f, "constructors are not instrumented"),
            RewriteError::NoCode => write!(f, "method has no code"),
            RewriteError::CodeTooLarge => write!(f, "rewritten code exceeds 65535 bytes"),
            RewriteError::Generation(e) => write!(f, "event type generation failed: {e}"),
        }
    }
}

impl From<ClassFileError> for RewriteError {
    fn from(e: ClassFileError) -> Self {
        RewriteError::Class(e)
    }
}

impl From<DescriptorError> for RewriteError {
    fn from(e: DescriptorError) -> Self {
        RewriteError::Descriptor(e)
    }
}

/// Where an entry capture's raw value comes from.
#[derive(Debug, Clone)]
enum ValueSource {
    Param { slot: u16 },
    InstanceField { name: String, descriptor: String },
    StaticField { name: String, descriptor: String },
    This,
}

#[derive(Debug, Clone)]
struct EntrySite {
    source: ValueSource,
    raw: JavaType,
    stored: JavaType,
    convert: Option<ConverterSpec>,
    stringify: bool,
    slot: u16,
    field_name: String,
}

#[derive(Debug, Clone)]
struct ReturnSite {
    raw: JavaType,
    stored: JavaType,
    convert: Option<ConverterSpec>,
    stringify: bool,
    field_name: String,
}

struct MethodPlan {
    entries: Vec<EntrySite>,
    ret: Option<ReturnSite>,
    event_fields: Vec<EventField>,
    /// First slot past the original frame; capture slots start here.
    scratch_ret_slot: Option<u16>,
    throwable_slot: Option<u16>,
    new_max_locals: u16,
    needs_handler: bool,
    emit_on_return: bool,
}

/// The engine component the host's class-loading hook calls into.
pub struct Transformer {
    registry: Arc<TransformRegistry>,
    converters: ConverterRegistry,
    event_types: Mutex<HashMap<(String, String), Arc<GeneratedClass>>>,
}

impl Transformer {
    pub fn new(registry: Arc<TransformRegistry>) -> Transformer {
        Transformer {
            registry,
            converters: ConverterRegistry::default(),
            event_types: Mutex::new(HashMap::new()),
        }
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    /// Rewrite `bytecode` according to the registry's pending descriptors
    /// for `class_name`. Classes with no pending work return `Unchanged`
    /// without even parsing. `loader` is an opaque identity used to key
    /// the generated-event-type cache.
    pub fn transform(&self, loader: &str, class_name: &str, bytecode: &[u8]) -> Transformed {
        if !self.registry.has_pending(class_name) {
            return Transformed::Unchanged;
        }
        let descriptors = match self.registry.descriptors_for(class_name) {
            Some(d) => d,
            None => return Transformed::Unchanged,
        };

        let mut class = match ClassFile::parse(bytecode) {
            Ok(c) => c,
            Err(e) => {
                warn!(class = class_name, error = %e, "unparseable classfile; left unchanged");
                return Transformed::Unchanged;
            }
        };

        let mut changed = false;
        let mut event_classes = Vec::new();
        for descriptor in &descriptors {
            let method_index =
                match class.find_method(&descriptor.method.name, &descriptor.method.descriptor) {
                    Some(i) => i,
                    None => {
                        descriptor.match_state.set(MatchState::MatchNotFound);
                        debug!(
                            probe = %descriptor.id,
                            class = class_name,
                            method = %descriptor.method.name,
                            "no method with matching name and descriptor"
                        );
                        continue;
                    }
                };
            descriptor.match_state.set(MatchState::MatchFound);

            match self.instrument_method(loader, &mut class, method_index, descriptor) {
                Ok(event_class) => {
                    changed = true;
                    if !event_classes
                        .iter()
                        .any(|e: &Arc<GeneratedClass>| e.class_name == event_class.class_name)
                    {
                        event_classes.push(event_class);
                    }
                }
                Err(e) => {
                    warn!(
                        probe = %descriptor.id,
                        class = class_name,
                        method = %descriptor.method.name,
                        error = %e,
                        "method left unmodified"
                    );
                }
            }
        }

        if !changed {
            return Transformed::Unchanged;
        }
        Transformed::Rewritten {
            bytecode: class.to_bytes(),
            event_classes,
        }
    }

    /// Look up or synthesize the event type for a descriptor. The cache
    /// is keyed by loader so unrelated loaders get independent types, and
    /// the lock makes concurrent first-use define the type exactly once.
    fn event_type_for(
        &self,
        loader: &str,
        descriptor: &ProbeDescriptor,
        fields: &[EventField],
        major: u16,
    ) -> Result<Arc<GeneratedClass>, eventgen::GenerationError> {
        let key = (loader.to_string(), descriptor.id.clone());
        let mut cache = self.event_types.lock().expect("event type cache poisoned");
        if let Some(existing) = cache.get(&key) {
            return Ok(Arc::clone(existing));
        }
        // Two ids can sanitize to the same class name; defining the
        // second would break the first's field references.
        if cache.iter().any(|((l, _), g)| {
            l == loader && g.class_name == descriptor.event_class_name
        }) {
            return Err(eventgen::GenerationError::NameCollision {
                name: descriptor.event_class_name.clone(),
            });
        }
        let generated = Arc::new(eventgen::generate(descriptor, fields, major)?);
        cache.insert(key, Arc::clone(&generated));
        Ok(generated)
    }

    fn instrument_method(
        &self,
        loader: &str,
        class: &mut ClassFile,
        method_index: usize,
        descriptor: &ProbeDescriptor,
    ) -> Result<Arc<GeneratedClass>, RewriteError> {
        let class_internal = class.class_name()?.to_string();
        let method_name = class
            .pool
            .utf8(class.methods[method_index].name_index)?
            .to_string();
        if method_name == "<init>" || method_name == "<clinit>" {
            return Err(RewriteError::Constructor);
        }
        let is_static = class.methods[method_index].is_static();
        let code_pos = class.methods[method_index]
            .attributes
            .iter()
            .position(|a| {
                class
                    .pool
                    .utf8(a.name_index)
                    .map(|n| n == "Code")
                    .unwrap_or(false)
            })
            .ok_or(RewriteError::NoCode)?;
        let code_attr =
            CodeAttribute::parse(&class.methods[method_index].attributes[code_pos].info)?;
        let md = desc::parse_method_descriptor(&descriptor.method.descriptor)?;

        let plan = self.plan_captures(class, descriptor, &md, is_static, &code_attr)?;
        let event_class = self
            .event_type_for(loader, descriptor, &plan.event_fields, class.major)
            .map_err(RewriteError::Generation)?;

        let new_code = splice(
            class,
            &class_internal,
            &code_attr,
            &md,
            is_static,
            descriptor,
            &plan,
        )?;
        class.methods[method_index].attributes[code_pos].info = new_code;
        Ok(event_class)
    }

    /// Resolve the descriptor's capture list against the concrete method,
    /// dropping (with a warning) anything that cannot be captured.
    fn plan_captures(
        &self,
        class: &ClassFile,
        descriptor: &ProbeDescriptor,
        md: &MethodDesc,
        is_static: bool,
        code_attr: &CodeAttribute,
    ) -> Result<MethodPlan, RewriteError> {
        let class_internal = class.class_name()?.to_string();
        let mut entries = Vec::new();
        let mut ret = None;
        let mut event_fields = Vec::new();
        let mut next_slot = code_attr.max_locals;

        for (position, capture) in descriptor.captures.iter().enumerate() {
            let field_name = capture.field_name(position);
            match capture {
                Capture::Parameter { index, attrs } => {
                    let index = *index as usize;
                    let (slot, raw) = match (md.param_slot(index, is_static), md.params.get(index))
                    {
                        (Some(slot), Some(ty)) => (slot, ty.clone()),
                        _ => {
                            warn!(
                                probe = %descriptor.id,
                                index,
                                "parameter index out of range; capture dropped"
                            );
                            continue;
                        }
                    };
                    let Some((stored, convert, stringify)) =
                        self.conversion_for(descriptor, attrs.converter.as_deref(), &raw)
                    else {
                        debug!(probe = %descriptor.id, index, "parameter type not recordable; capture dropped");
                        continue;
                    };
                    entries.push(EntrySite {
                        source: ValueSource::Param { slot },
                        raw,
                        stored: stored.clone(),
                        convert,
                        stringify,
                        slot: next_slot,
                        field_name: field_name.clone(),
                    });
                    next_slot += stored.slot_width();
                    event_fields.push(EventField {
                        name: field_name,
                        ty: stored,
                        label: attrs.name.clone(),
                        description: attrs.description.clone(),
                    });
                }
                Capture::Return { attrs } => {
                    let Some(raw) = md.ret.clone() else {
                        debug!(probe = %descriptor.id, "void method; return capture dropped");
                        continue;
                    };
                    let Some((stored, convert, stringify)) =
                        self.conversion_for(descriptor, attrs.converter.as_deref(), &raw)
                    else {
                        debug!(probe = %descriptor.id, "return type not recordable; capture dropped");
                        continue;
                    };
                    event_fields.push(EventField {
                        name: field_name.clone(),
                        ty: stored.clone(),
                        label: attrs.name.clone(),
                        description: attrs.description.clone(),
                    });
                    ret = Some(ReturnSite {
                        raw,
                        stored,
                        convert,
                        stringify,
                        field_name,
                    });
                }
                Capture::Field { expression, attrs } => {
                    let Some((source, raw)) =
                        resolve_field_expression(class, &class_internal, expression, is_static)
                    else {
                        warn!(
                            probe = %descriptor.id,
                            expression,
                            "field expression not resolvable against this class; capture dropped"
                        );
                        continue;
                    };
                    let Some((stored, convert, stringify)) =
                        self.conversion_for(descriptor, attrs.converter.as_deref(), &raw)
                    else {
                        debug!(probe = %descriptor.id, expression, "field type not recordable; capture dropped");
                        continue;
                    };
                    entries.push(EntrySite {
                        source,
                        raw,
                        stored: stored.clone(),
                        convert,
                        stringify,
                        slot: next_slot,
                        field_name: field_name.clone(),
                    });
                    next_slot += stored.slot_width();
                    event_fields.push(EventField {
                        name: field_name,
                        ty: stored,
                        label: attrs.name.clone(),
                        description: attrs.description.clone(),
                    });
                }
            }
        }

        let emit_on_return = !descriptor.emission.emit_only_on_exception;
        let needs_handler =
            descriptor.emission.emit_only_on_exception || descriptor.emission.record_exception;

        let scratch_ret_slot = match (&ret, emit_on_return, &md.ret) {
            (Some(_), true, Some(raw)) => {
                let slot = next_slot;
                next_slot += raw.slot_width();
                Some(slot)
            }
            _ => None,
        };
        let throwable_slot = if needs_handler {
            let slot = next_slot;
            next_slot += 1;
            Some(slot)
        } else {
            None
        };

        Ok(MethodPlan {
            entries,
            ret,
            event_fields,
            scratch_ret_slot,
            throwable_slot,
            new_max_locals: next_slot,
            needs_handler,
            emit_on_return,
        })
    }

    /// Decide how a raw captured type reaches its event field: through a
    /// registered converter, unchanged, stringified, or not at all.
    fn conversion_for(
        &self,
        descriptor: &ProbeDescriptor,
        converter: Option<&str>,
        raw: &JavaType,
    ) -> Option<(JavaType, Option<ConverterSpec>, bool)> {
        if let Some(name) = converter {
            if descriptor.allow_converter {
                if let Some(spec) = self.converters.resolve(name) {
                    match spec.return_type() {
                        Ok(stored) => return Some((stored, Some(spec), false)),
                        Err(e) => {
                            warn!(converter = name, error = %e, "malformed converter descriptor; using raw value")
                        }
                    }
                } else {
                    warn!(converter = name, "converter not registered; using raw value");
                }
            } else {
                debug!(converter = name, "converters disabled by configuration");
            }
        }
        if raw.is_recordable() {
            return Some((raw.clone(), None, false));
        }
        if descriptor.allow_to_string {
            return Some((JavaType::object(JavaType::STRING), None, true));
        }
        None
    }
}

/// Resolve a field expression against the class being rewritten. Anything
/// needing another class's layout (outer classes, superclasses, foreign
/// statics) is unresolvable here and the capture is dropped by the caller.
fn resolve_field_expression(
    class: &ClassFile,
    class_internal: &str,
    expression: &str,
    method_is_static: bool,
) -> Option<(ValueSource, JavaType)> {
    let parsed = FieldExpr::parse(expression).ok()?;
    let canonical = desc::canonical_name(class_internal);
    let simple = canonical.rsplit('.').next().unwrap_or(&canonical);

    let own_field = |name: &str| -> Option<(ValueSource, JavaType)> {
        let (descriptor, access) = class.find_field(name)?;
        let ty = desc::parse_type_descriptor(descriptor).ok()?;
        if access & ACC_STATIC != 0 {
            Some((
                ValueSource::StaticField {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                },
                ty,
            ))
        } else if method_is_static {
            None
        } else {
            Some((
                ValueSource::InstanceField {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                },
                ty,
            ))
        }
    };

    match parsed {
        FieldExpr::This => {
            if method_is_static {
                return None;
            }
            Some((ValueSource::This, JavaType::object(class_internal)))
        }
        FieldExpr::ThisField { chain } => {
            if chain.len() != 1 {
                return None;
            }
            if method_is_static {
                return None;
            }
            let (descriptor, access) = class.find_field(&chain[0])?;
            if access & ACC_STATIC != 0 {
                return None;
            }
            Some((
                ValueSource::InstanceField {
                    name: chain[0].clone(),
                    descriptor: descriptor.to_string(),
                },
                desc::parse_type_descriptor(descriptor).ok()?,
            ))
        }
        FieldExpr::QualifiedThis { qualifier, chain } => {
            // Only `Self.this...`; an actual outer-class reference would
            // need the outer class's layout.
            let q = qualifier.join(".");
            if q != canonical && q != simple {
                return None;
            }
            if chain.is_empty() {
                if method_is_static {
                    return None;
                }
                return Some((ValueSource::This, JavaType::object(class_internal)));
            }
            if chain.len() != 1 || method_is_static {
                return None;
            }
            own_field(&chain[0]).filter(|(s, _)| matches!(s, ValueSource::InstanceField { .. }))
        }
        FieldExpr::SuperField { .. } => None,
        FieldExpr::Path { chain } => {
            if chain.len() == 1 {
                return own_field(&chain[0]);
            }
            // TYPE.FIELD with TYPE naming this class, simple or qualified.
            let (type_part, field) = chain.split_at(chain.len() - 1);
            let type_name = type_part.join(".");
            if type_name != canonical && type_name != simple {
                return None;
            }
            let (descriptor, access) = class.find_field(&field[0])?;
            if access & ACC_STATIC == 0 {
                return None;
            }
            Some((
                ValueSource::StaticField {
                    name: field[0].clone(),
                    descriptor: descriptor.to_string(),
                },
                desc::parse_type_descriptor(descriptor).ok()?,
            ))
        }
    }
}

fn load_insn(ty: &JavaType, slot: u16) -> Insn {
    match ty {
        JavaType::Long => Insn::local(op::LLOAD_0, op::LLOAD, slot),
        JavaType::Float => Insn::local(op::FLOAD_0, op::FLOAD, slot),
        JavaType::Double => Insn::local(op::DLOAD_0, op::DLOAD, slot),
        JavaType::Object(_) | JavaType::Array(_) => Insn::local(op::ALOAD_0, op::ALOAD, slot),
        _ => Insn::local(op::ILOAD_0, op::ILOAD, slot),
    }
}

fn store_insn(ty: &JavaType, slot: u16) -> Insn {
    match ty {
        JavaType::Long => Insn::local(op::LSTORE_0, op::LSTORE, slot),
        JavaType::Float => Insn::local(op::FSTORE_0, op::FSTORE, slot),
        JavaType::Double => Insn::local(op::DSTORE_0, op::DSTORE, slot),
        JavaType::Object(_) | JavaType::Array(_) => Insn::local(op::ASTORE_0, op::ASTORE, slot),
        _ => Insn::local(op::ISTORE_0, op::ISTORE, slot),
    }
}

/// Constant-pool references the splice emits, interned once up front.
struct EmissionRefs {
    event_class: u16,
    event_init: u16,
    event_commit: u16,
    string_value_of: u16,
    /// Event field ref per entry site, same order as `plan.entries`.
    field_refs: Vec<u16>,
    ret_field_ref: Option<u16>,
    converter_refs: HashMap<String, u16>,
    /// Field refs against the target class, keyed by (name, descriptor).
    target_field_refs: HashMap<(String, String), u16>,
}

fn intern_refs(
    class: &mut ClassFile,
    class_internal: &str,
    descriptor: &ProbeDescriptor,
    plan: &MethodPlan,
) -> EmissionRefs {
    let pool = &mut class.pool;
    let event_name = descriptor.event_class_name.clone();
    let event_class = pool.ensure_class(&event_name);
    let event_init = pool.ensure_method_ref(&event_name, "<init>", "()V");
    let event_commit = pool.ensure_method_ref(&event_name, "commit", "()V");
    let string_value_of =
        pool.ensure_method_ref(JavaType::STRING, "valueOf", STRING_VALUE_OF_DESC);

    let mut converter_refs = HashMap::new();
    let mut target_field_refs = HashMap::new();
    let mut field_refs = Vec::with_capacity(plan.entries.len());
    for site in &plan.entries {
        field_refs.push(pool.ensure_field_ref(
            &event_name,
            &site.field_name,
            &site.stored.descriptor(),
        ));
        if let Some(spec) = &site.convert {
            let r = pool.ensure_method_ref(&spec.owner, &spec.method, &spec.descriptor);
            converter_refs.insert(spec.owner.clone() + &spec.descriptor, r);
        }
        match &site.source {
            ValueSource::InstanceField { name, descriptor }
            | ValueSource::StaticField { name, descriptor } => {
                let r = pool.ensure_field_ref(class_internal, name, descriptor);
                target_field_refs.insert((name.clone(), descriptor.clone()), r);
            }
            _ => {}
        }
    }
    let ret_field_ref = plan.ret.as_ref().map(|r| {
        if let Some(spec) = &r.convert {
            let cref = pool.ensure_method_ref(&spec.owner, &spec.method, &spec.descriptor);
            converter_refs.insert(spec.owner.clone() + &spec.descriptor, cref);
        }
        pool.ensure_field_ref(&event_name, &r.field_name, &r.stored.descriptor())
    });

    EmissionRefs {
        event_class,
        event_init,
        event_commit,
        string_value_of,
        field_refs,
        ret_field_ref,
        converter_refs,
        target_field_refs,
    }
}

fn converter_call(refs: &EmissionRefs, spec: &ConverterSpec) -> Insn {
    let key = spec.owner.clone() + &spec.descriptor;
    Insn::with_u16(op::INVOKESTATIC, refs.converter_refs[&key])
}

/// Entry preamble: evaluate every entry capture into its dedicated slot.
/// Straight-line by construction, so no frames are needed inside it.
fn preamble_insns(plan: &MethodPlan, refs: &EmissionRefs) -> Vec<Insn> {
    let mut insns = Vec::new();
    for site in &plan.entries {
        match &site.source {
            ValueSource::Param { slot } => insns.push(load_insn(&site.raw, *slot)),
            ValueSource::This => insns.push(Insn::plain(op::ALOAD_0)),
            ValueSource::InstanceField { name, descriptor } => {
                let key = (name.clone(), descriptor.clone());
                insns.push(Insn::plain(op::ALOAD_0));
                insns.push(Insn::with_u16(op::GETFIELD, refs.target_field_refs[&key]));
            }
            ValueSource::StaticField { name, descriptor } => {
                let key = (name.clone(), descriptor.clone());
                insns.push(Insn::with_u16(op::GETSTATIC, refs.target_field_refs[&key]));
            }
        }
        if let Some(spec) = &site.convert {
            insns.push(converter_call(refs, spec));
        } else if site.stringify {
            insns.push(Insn::with_u16(op::INVOKESTATIC, refs.string_value_of));
        }
        insns.push(store_insn(&site.stored, site.slot));
    }
    insns
}

/// Emission block: construct the event, populate it from the capture
/// slots (plus the return value when present), commit. Straight-line.
fn emission_insns(
    plan: &MethodPlan,
    refs: &EmissionRefs,
    include_return: bool,
) -> Vec<Insn> {
    let mut insns = Vec::new();
    let spill = include_return && plan.scratch_ret_slot.is_some();
    let ret = plan.ret.as_ref();
    if spill {
        let r = ret.expect("scratch slot implies return site");
        insns.push(store_insn(&r.raw, plan.scratch_ret_slot.expect("spill")));
    }
    insns.push(Insn::with_u16(op::NEW, refs.event_class));
    insns.push(Insn::plain(op::DUP));
    insns.push(Insn::with_u16(op::INVOKESPECIAL, refs.event_init));
    for (site, field_ref) in plan.entries.iter().zip(&refs.field_refs) {
        insns.push(Insn::plain(op::DUP));
        insns.push(load_insn(&site.stored, site.slot));
        insns.push(Insn::with_u16(op::PUTFIELD, *field_ref));
    }
    if spill {
        let r = ret.expect("checked above");
        let slot = plan.scratch_ret_slot.expect("spill");
        insns.push(Insn::plain(op::DUP));
        insns.push(load_insn(&r.raw, slot));
        if let Some(spec) = &r.convert {
            insns.push(converter_call(refs, spec));
        } else if r.stringify {
            insns.push(Insn::with_u16(op::INVOKESTATIC, refs.string_value_of));
        }
        insns.push(Insn::with_u16(
            op::PUTFIELD,
            refs.ret_field_ref.expect("return field ref"),
        ));
    }
    insns.push(Insn::with_u16(op::INVOKEVIRTUAL, refs.event_commit));
    if spill {
        let r = ret.expect("checked above");
        insns.push(load_insn(&r.raw, plan.scratch_ret_slot.expect("spill")));
    }
    insns
}

fn splice(
    class: &mut ClassFile,
    class_internal: &str,
    code_attr: &CodeAttribute,
    md: &MethodDesc,
    is_static: bool,
    descriptor: &ProbeDescriptor,
    plan: &MethodPlan,
) -> Result<Vec<u8>, RewriteError> {
    let (old_insns, index_of) = code::decode(&code_attr.code)?;
    let old_len = old_insns.len();

    // Exception table and stack map move to index space first.
    let idx = |pc: u16| -> Result<usize, RewriteError> {
        index_of
            .get(&(pc as u32))
            .copied()
            .ok_or_else(|| ClassFileError::InvalidCode(format!("pc {pc} misses")).into())
    };
    let mut handlers: Vec<(usize, usize, usize, u16)> = Vec::new();
    for h in &code_attr.exception_table {
        handlers.push((idx(h.start_pc)?, idx(h.end_pc)?, idx(h.handler_pc)?, h.catch_type));
    }

    let initial_locals = frames::initial_locals(class_internal, &md.params, is_static);
    let stack_map_attr = code_attr
        .attributes
        .iter()
        .position(|a| attr_name_is(class, a, "StackMapTable"));
    let mut old_frames = match stack_map_attr {
        Some(pos) => frames::parse_stack_map(
            &code_attr.attributes[pos].info,
            &class.pool,
            &index_of,
            &initial_locals,
        )?,
        None => Vec::new(),
    };

    let refs = intern_refs(class, class_internal, descriptor, plan);

    // Assemble: preamble, then each original instruction with emission
    // blocks spliced ahead of every return site. References to an
    // original index land on the block inserted before it, so branches to
    // a return take the emission path too.
    let preamble = preamble_insns(plan, &refs);
    let mut new_insns: Vec<Insn> = preamble;
    let mut retarget = vec![0usize; old_len + 1];
    let mut original_positions = Vec::with_capacity(old_len);
    for (i, insn) in old_insns.iter().enumerate() {
        retarget[i] = new_insns.len();
        if plan.emit_on_return && code::is_return(insn.opcode()) {
            new_insns.extend(emission_insns(plan, &refs, true));
        }
        original_positions.push(new_insns.len());
        new_insns.push(insn.clone());
    }
    retarget[old_len] = new_insns.len();

    // Patch branch targets of the original instructions.
    for &pos in &original_positions {
        match &mut new_insns[pos] {
            Insn::Branch { target, .. } | Insn::BranchW { target, .. } => {
                *target = retarget[*target];
            }
            Insn::TableSwitch {
                default, targets, ..
            } => {
                *default = retarget[*default];
                for t in targets {
                    *t = retarget[*t];
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                *default = retarget[*default];
                for (_, t) in pairs {
                    *t = retarget[*t];
                }
            }
            Insn::Plain { .. } => {}
        }
    }

    // Existing handler ranges follow their instructions into the new
    // index space (range ends sit before any block inserted at them, the
    // same position the splice gives the target itself).
    for (start, end, handler, _) in &mut handlers {
        *start = retarget[*start];
        *end = retarget[*end];
        *handler = retarget[*handler];
    }

    // Exceptional exit path: one catch-all handler appended at the end.
    let handler_at = if plan.needs_handler {
        let handler_at = new_insns.len();
        let throw_slot = plan.throwable_slot.expect("handler implies throwable slot");
        new_insns.push(store_insn(&JavaType::object(THROWABLE), throw_slot));
        new_insns.extend(emission_insns(plan, &refs, false));
        new_insns.push(load_insn(&JavaType::object(THROWABLE), throw_slot));
        new_insns.push(Insn::plain(op::ATHROW));
        handlers.push((retarget[0], handler_at, handler_at, 0));
        Some(handler_at)
    } else {
        None
    };

    let (new_code, new_offsets) = code::encode(&new_insns)?;
    if new_code.len() > u16::MAX as usize {
        return Err(RewriteError::CodeTooLarge);
    }

    // Regenerate the stack map: original frames keep their shape with the
    // capture slots appended past the old frame, plus one full frame at
    // the handler entry.
    let capture_tail: Vec<VType> = plan.entries.iter().map(|s| VType::of(&s.stored)).collect();
    for frame in &mut old_frames {
        frame.at = retarget[frame.at];
        extend_locals(&mut frame.locals, code_attr.max_locals, &capture_tail);
        for v in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
            if let VType::Uninitialized(i) = v {
                *i = retarget[*i];
            }
        }
    }
    if let Some(at) = handler_at {
        // The original body may recycle its slots arbitrarily, so the
        // handler declares them all as Top; only the capture slots,
        // definitely assigned in the preamble, carry types.
        let mut locals = Vec::new();
        extend_locals(&mut locals, code_attr.max_locals, &capture_tail);
        old_frames.push(Frame {
            at,
            locals,
            stack: vec![VType::Object(THROWABLE.to_string())],
        });
    }

    let mut new_attributes = Vec::with_capacity(code_attr.attributes.len() + 1);
    let mut wrote_stack_map = false;
    for (i, attribute) in code_attr.attributes.iter().enumerate() {
        if Some(i) == stack_map_attr {
            if !old_frames.is_empty() {
                let info = frames::encode_stack_map(
                    &old_frames,
                    &new_offsets,
                    &mut class.pool,
                    &initial_locals,
                )?;
                new_attributes.push(AttributeInfo {
                    name_index: attribute.name_index,
                    info,
                });
            }
            wrote_stack_map = true;
        } else if attr_name_is(class, attribute, "LineNumberTable") {
            if let Some(info) =
                remap_line_numbers(&attribute.info, &index_of, &retarget, &new_offsets)
            {
                new_attributes.push(AttributeInfo {
                    name_index: attribute.name_index,
                    info,
                });
            }
        } else if attr_name_is(class, attribute, "LocalVariableTable")
            || attr_name_is(class, attribute, "LocalVariableTypeTable")
        {
            if let Some(info) =
                remap_local_variables(&attribute.info, &index_of, &retarget, &new_offsets)
            {
                new_attributes.push(AttributeInfo {
                    name_index: attribute.name_index,
                    info,
                });
            }
        } else {
            new_attributes.push(attribute.clone());
        }
    }
    if !wrote_stack_map && !old_frames.is_empty() && class.major >= crate::classfile::MAJOR_WITH_FRAMES {
        let name_index = class.pool.ensure_utf8("StackMapTable");
        let info = frames::encode_stack_map(
            &old_frames,
            &new_offsets,
            &mut class.pool,
            &initial_locals,
        )?;
        new_attributes.push(AttributeInfo { name_index, info });
    }

    let new_attr = CodeAttribute {
        max_stack: code_attr.max_stack.saturating_add(EMISSION_STACK),
        max_locals: plan.new_max_locals,
        code: new_code,
        exception_table: handlers
            .iter()
            .map(|(s, e, h, c)| RawHandler {
                start_pc: new_offsets[*s] as u16,
                end_pc: new_offsets[*e] as u16,
                handler_pc: new_offsets[*h] as u16,
                catch_type: *c,
            })
            .collect(),
        attributes: new_attributes,
    };
    Ok(new_attr.write())
}

fn attr_name_is(class: &ClassFile, attribute: &AttributeInfo, name: &str) -> bool {
    class
        .pool
        .utf8(attribute.name_index)
        .map(|n| n == name)
        .unwrap_or(false)
}

/// Pad a frame's locals with Top up to the original register file, then
/// append the capture slot types.
fn extend_locals(locals: &mut Vec<VType>, orig_max_locals: u16, tail: &[VType]) {
    let mut slots: u16 = locals.iter().map(VType::slots).sum();
    while slots < orig_max_locals {
        locals.push(VType::Top);
        slots += 1;
    }
    locals.extend_from_slice(tail);
}

fn remap_pc(
    pc: u32,
    index_of: &HashMap<u32, usize>,
    retarget: &[usize],
    new_offsets: &[u32],
) -> Option<u32> {
    let index = *index_of.get(&pc)?;
    Some(new_offsets[retarget[index]])
}

fn remap_line_numbers(
    info: &[u8],
    index_of: &HashMap<u32, usize>,
    retarget: &[usize],
    new_offsets: &[u32],
) -> Option<Vec<u8>> {
    let mut r = Reader::new(info);
    let count = r.read_u2().ok()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let start_pc = r.read_u2().ok()?;
        let line = r.read_u2().ok()?;
        if let Some(pc) = remap_pc(start_pc as u32, index_of, retarget, new_offsets) {
            entries.push((pc as u16, line));
        }
    }
    let mut w = Writer::new();
    w.u2(entries.len() as u16);
    for (pc, line) in entries {
        w.u2(pc);
        w.u2(line);
    }
    Some(w.finish())
}

fn remap_local_variables(
    info: &[u8],
    index_of: &HashMap<u32, usize>,
    retarget: &[usize],
    new_offsets: &[u32],
) -> Option<Vec<u8>> {
    let mut r = Reader::new(info);
    let count = r.read_u2().ok()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let start_pc = r.read_u2().ok()?;
        let length = r.read_u2().ok()?;
        let name_index = r.read_u2().ok()?;
        let descriptor_index = r.read_u2().ok()?;
        let index = r.read_u2().ok()?;
        let new_start = remap_pc(start_pc as u32, index_of, retarget, new_offsets);
        let new_end = remap_pc(start_pc as u32 + length as u32, index_of, retarget, new_offsets);
        if let (Some(start), Some(end)) = (new_start, new_end) {
            if end >= start {
                entries.push((start as u16, (end - start) as u16, name_index, descriptor_index, index));
            }
        }
    }
    let mut w = Writer::new();
    w.u2(entries.len() as u16);
    for (start, length, name_index, descriptor_index, index) in entries {
        w.u2(start);
        w.u2(length);
        w.u2(name_index);
        w.u2(descriptor_index);
        w.u2(index);
    }
    Some(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ConstantPool, MemberInfo, ACC_PUBLIC, ACC_SUPER};

    fn class_with_fields() -> ClassFile {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class("com/x/Demo");
        let super_class = pool.ensure_class("java/lang/Object");
        let field = |pool: &mut ConstantPool, name: &str, descriptor: &str, access: u16| {
            MemberInfo {
                access_flags: access,
                name_index: pool.ensure_utf8(name),
                descriptor_index: pool.ensure_utf8(descriptor),
                attributes: Vec::new(),
            }
        };
        let count = field(&mut pool, "count", "I", ACC_PUBLIC);
        let total = field(&mut pool, "TOTAL", "J", ACC_PUBLIC | ACC_STATIC);
        ClassFile {
            minor: 0,
            major: 55,
            pool,
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: vec![count, total],
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    fn descriptor() -> ProbeDescriptor {
        ProbeDescriptor {
            id: "t".to_string(),
            class_name: "com.x.Demo".to_string(),
            method: crate::probe::MethodRef {
                name: "work".to_string(),
                descriptor: "()V".to_string(),
            },
            label: "T".to_string(),
            description: None,
            path: None,
            emission: Default::default(),
            captures: Vec::new(),
            match_state: Default::default(),
            event_class_name: "__TraceEventt".to_string(),
            allow_to_string: false,
            allow_converter: false,
        }
    }

    #[test]
    fn resolves_classfile_local_expressions() {
        let class = class_with_fields();
        let resolve = |expr: &str, is_static: bool| {
            resolve_field_expression(&class, "com/x/Demo", expr, is_static)
        };

        assert!(matches!(
            resolve("this", false),
            Some((ValueSource::This, JavaType::Object(_)))
        ));
        assert!(resolve("this", true).is_none());

        assert!(matches!(
            resolve("this.count", false),
            Some((ValueSource::InstanceField { .. }, JavaType::Int))
        ));
        assert!(matches!(
            resolve("count", false),
            Some((ValueSource::InstanceField { .. }, JavaType::Int))
        ));
        // Instance field from a static method resolves to nothing.
        assert!(resolve("count", true).is_none());

        // Statics work from both contexts, simple and qualified.
        assert!(matches!(
            resolve("TOTAL", true),
            Some((ValueSource::StaticField { .. }, JavaType::Long))
        ));
        assert!(matches!(
            resolve("Demo.TOTAL", false),
            Some((ValueSource::StaticField { .. }, JavaType::Long))
        ));
        assert!(matches!(
            resolve("com.x.Demo.TOTAL", true),
            Some((ValueSource::StaticField { .. }, JavaType::Long))
        ));

        // Qualified this against the class itself collapses to this.
        assert!(matches!(
            resolve("Demo.this", false),
            Some((ValueSource::This, _))
        ));
        assert!(matches!(
            resolve("Demo.this.count", false),
            Some((ValueSource::InstanceField { .. }, _))
        ));

        // Anything needing another class's layout is unresolvable here.
        assert!(resolve("super.count", false).is_none());
        assert!(resolve("Outer.this.count", false).is_none());
        assert!(resolve("com.elsewhere.Other.FIELD", false).is_none());
        assert!(resolve("missing", false).is_none());
    }

    #[test]
    fn conversion_policy_ladder() {
        let transformer = Transformer::new(Arc::new(TransformRegistry::new()));
        let mut d = descriptor();

        // Primitives and String pass through.
        assert_eq!(
            transformer.conversion_for(&d, None, &JavaType::Int),
            Some((JavaType::Int, None, false))
        );
        // Arbitrary objects are dropped unless toString is allowed.
        let list = JavaType::object("java/util/List");
        assert_eq!(transformer.conversion_for(&d, None, &list), None);
        d.allow_to_string = true;
        assert_eq!(
            transformer.conversion_for(&d, None, &list),
            Some((JavaType::object(JavaType::STRING), None, true))
        );
    }

    #[test]
    fn converters_resolve_through_the_registry() {
        let transformer = Transformer::new(Arc::new(TransformRegistry::new()));
        let mut d = descriptor();
        d.allow_converter = true;

        // Unregistered converter falls back to the raw value.
        assert_eq!(
            transformer.conversion_for(&d, Some("com.x.Conv"), &JavaType::Long),
            Some((JavaType::Long, None, false))
        );

        let spec = ConverterSpec {
            owner: "com/x/Conv".to_string(),
            method: "convert".to_string(),
            descriptor: "(J)Ljava/lang/String;".to_string(),
        };
        transformer.converters().register("com.x.Conv", spec.clone());
        assert_eq!(
            transformer.conversion_for(&d, Some("com.x.Conv"), &JavaType::Long),
            Some((JavaType::object(JavaType::STRING), Some(spec), false))
        );

        // Converters disabled by configuration are ignored entirely.
        d.allow_converter = false;
        assert_eq!(
            transformer.conversion_for(&d, Some("com.x.Conv"), &JavaType::Long),
            Some((JavaType::Long, None, false))
        );
    }
}
