//! The transform registry: the authoritative store of probe descriptors
//! keyed by target class.
//!
//! The store is a copy-on-write snapshot behind an `RwLock<Arc<_>>`:
//! mutations build a complete replacement map and swap it under the write
//! lock, so a concurrent reader sees either the old or the new state,
//! never a half-merged one. `has_pending` runs on every class load in the
//! process and must stay cheap.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::desc;
use crate::probe::{
    Capture, CaptureAttrs, EmissionPolicy, GlobalConfig, MethodRef, MatchStateCell,
    ProbeDescriptor,
};
use crate::validate::{validate_probe_document, DocumentError};
use crate::xml::{Element, XmlWriter};

#[derive(Default)]
struct Snapshot {
    config: GlobalConfig,
    by_class: HashMap<String, Vec<Arc<ProbeDescriptor>>>,
}

pub struct TransformRegistry {
    state: RwLock<Arc<Snapshot>>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        TransformRegistry::new()
    }
}

impl TransformRegistry {
    pub fn new() -> TransformRegistry {
        TransformRegistry {
            state: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Ingest a full probe document, replacing the previous contents
    /// wholesale. Probes sharing an id collapse to the first occurrence
    /// (first-wins; the duplicate is logged and dropped). On error the
    /// prior state is untouched.
    pub fn replace_all(
        &self,
        document: &str,
    ) -> Result<Vec<Arc<ProbeDescriptor>>, DocumentError> {
        validate_probe_document(document)?;
        let root = Element::parse(document).map_err(|e| DocumentError::MalformedDocument {
            reason: e.to_string(),
        })?;

        let config = parse_global_config(&root);
        let mut by_class: HashMap<String, Vec<Arc<ProbeDescriptor>>> = HashMap::new();
        let mut seen_ids = HashSet::new();
        let mut stored = Vec::new();

        if let Some(events) = root.child("events") {
            for event in events.children_named("event") {
                let descriptor = Arc::new(parse_event(event, &config)?);
                if !seen_ids.insert(descriptor.id.clone()) {
                    warn!(
                        id = %descriptor.id,
                        "duplicate probe id in document; keeping the first occurrence"
                    );
                    continue;
                }
                by_class
                    .entry(descriptor.class_name.clone())
                    .or_default()
                    .push(Arc::clone(&descriptor));
                stored.push(descriptor);
            }
        }

        let snapshot = Arc::new(Snapshot { config, by_class });
        *self.state.write().expect("registry lock poisoned") = snapshot;
        Ok(stored)
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.state.read().expect("registry lock poisoned"))
    }

    /// O(1) membership query; accepts dotted or internal class names.
    pub fn has_pending(&self, class_name: &str) -> bool {
        let key = desc::canonical_name(class_name);
        self.snapshot().by_class.contains_key(&key)
    }

    pub fn descriptors_for(&self, class_name: &str) -> Option<Vec<Arc<ProbeDescriptor>>> {
        let key = desc::canonical_name(class_name);
        self.snapshot().by_class.get(&key).cloned()
    }

    /// Atomically empty the store, returning every class name that had at
    /// least one descriptor.
    pub fn clear_all(&self) -> Vec<String> {
        let mut guard = self.state.write().expect("registry lock poisoned");
        let mut names: Vec<String> = guard.by_class.keys().cloned().collect();
        names.sort();
        *guard = Arc::new(Snapshot {
            config: guard.config.clone(),
            by_class: HashMap::new(),
        });
        names
    }

    pub fn class_names(&self) -> HashSet<String> {
        self.snapshot().by_class.keys().cloned().collect()
    }

    pub fn global_config(&self) -> GlobalConfig {
        self.snapshot().config.clone()
    }

    /// Every stored descriptor, grouped by class, in document order.
    pub fn all_descriptors(&self) -> Vec<Arc<ProbeDescriptor>> {
        let snapshot = self.snapshot();
        let mut classes: Vec<&String> = snapshot.by_class.keys().collect();
        classes.sort();
        classes
            .into_iter()
            .flat_map(|c| snapshot.by_class[c].iter().cloned())
            .collect()
    }

    /// Serialize the current contents back to probe-document form. The
    /// output of this re-validates for any document that was accepted.
    pub fn serialize_document(&self) -> String {
        let snapshot = self.snapshot();
        let mut w = XmlWriter::new();
        w.open("agent");
        w.open("config");
        w.leaf("classprefix", &desc::canonical_name(&snapshot.config.class_prefix));
        w.leaf("allowtostring", bool_str(snapshot.config.allow_to_string));
        w.leaf("allowconverter", bool_str(snapshot.config.allow_converter));
        w.close();
        w.open("events");
        let mut classes: Vec<&String> = snapshot.by_class.keys().collect();
        classes.sort();
        for class in classes {
            for descriptor in &snapshot.by_class[class] {
                write_event(&mut w, descriptor);
            }
        }
        w.close();
        w.close();
        w.finish()
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

fn parse_global_config(root: &Element) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    if let Some(element) = root.child("config") {
        if let Some(prefix) = element.child_text("classprefix") {
            if !prefix.is_empty() {
                config.class_prefix = prefix.to_string();
            }
        }
        if let Some(v) = element.child_text("allowtostring") {
            config.allow_to_string = v == "true";
        }
        if let Some(v) = element.child_text("allowconverter") {
            config.allow_converter = v == "true";
        }
    }
    config
}

fn parse_capture_attrs(element: &Element) -> CaptureAttrs {
    let non_empty = |name: &str| {
        element
            .child_text(name)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };
    CaptureAttrs {
        name: non_empty("name"),
        description: non_empty("description"),
        content_type: non_empty("contenttype"),
        relation_key: non_empty("relationkey"),
        converter: non_empty("converter"),
    }
}

fn parse_event(event: &Element, config: &GlobalConfig) -> Result<ProbeDescriptor, DocumentError> {
    // The document passed validation; anything missing here is a logic
    // error in the validator, surfaced as a malformed-document error
    // rather than a panic.
    let structural = |what: &str| DocumentError::MalformedDocument {
        reason: format!("event is missing {what}"),
    };

    let id = event.attr("id").ok_or_else(|| structural("its id"))?.to_string();
    let label = event
        .child_text("label")
        .or_else(|| event.child_text("name"))
        .ok_or_else(|| structural("its label"))?
        .to_string();
    let class_name = event
        .child_text("class")
        .ok_or_else(|| structural("its class"))?
        .to_string();
    let method_element = event.child("method").ok_or_else(|| structural("its method"))?;
    let method = MethodRef {
        name: method_element
            .child_text("name")
            .ok_or_else(|| structural("its method name"))?
            .to_string(),
        descriptor: method_element
            .child_text("descriptor")
            .ok_or_else(|| structural("its method descriptor"))?
            .to_string(),
    };

    let mut captures = Vec::new();
    if let Some(parameters) = method_element.child("parameters") {
        for parameter in parameters.children_named("parameter") {
            let index: u32 = parameter
                .attr("index")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| structural("a parameter index"))?;
            captures.push(Capture::Parameter {
                index,
                attrs: parse_capture_attrs(parameter),
            });
        }
    }
    if let Some(returnvalue) = method_element.child("returnvalue") {
        captures.push(Capture::Return {
            attrs: parse_capture_attrs(returnvalue),
        });
    }
    if let Some(fields) = event.child("fields") {
        for field in fields.children_named("field") {
            let expression = field
                .child_text("expression")
                .ok_or_else(|| structural("a field expression"))?
                .to_string();
            captures.push(Capture::Field {
                expression,
                attrs: parse_capture_attrs(field),
            });
        }
    }

    let event_config = event.child("config");
    let emission = EmissionPolicy {
        location: Default::default(),
        record_stack_trace: event.child_text("stacktrace") == Some("true"),
        emit_only_on_exception: event_config
            .and_then(|c| c.child_text("emitonexception"))
            == Some("true"),
        record_exception: event_config
            .and_then(|c| c.child_text("recordexception"))
            == Some("true"),
    };

    let event_class_name = ProbeDescriptor::event_class_name(config, &id);
    Ok(ProbeDescriptor {
        id,
        class_name,
        method,
        label,
        description: event.child_text("description").map(str::to_string),
        path: event.child_text("path").map(str::to_string),
        emission,
        captures,
        match_state: MatchStateCell::default(),
        event_class_name,
        allow_to_string: config.allow_to_string,
        allow_converter: config.allow_converter,
    })
}

fn write_capture_attrs(w: &mut XmlWriter, attrs: &CaptureAttrs) {
    if let Some(v) = &attrs.name {
        w.leaf("name", v);
    }
    if let Some(v) = &attrs.description {
        w.leaf("description", v);
    }
    if let Some(v) = &attrs.content_type {
        w.leaf("contenttype", v);
    }
    if let Some(v) = &attrs.relation_key {
        w.leaf("relationkey", v);
    }
    if let Some(v) = &attrs.converter {
        w.leaf("converter", v);
    }
}

fn write_event(w: &mut XmlWriter, descriptor: &ProbeDescriptor) {
    w.open_with("event", &[("id", &descriptor.id)]);
    w.leaf("label", &descriptor.label);
    if let Some(v) = &descriptor.description {
        w.leaf("description", v);
    }
    if let Some(v) = &descriptor.path {
        w.leaf("path", v);
    }
    w.leaf("stacktrace", bool_str(descriptor.emission.record_stack_trace));
    w.leaf("class", &descriptor.class_name);
    w.open("method");
    w.leaf("name", &descriptor.method.name);
    w.leaf("descriptor", &descriptor.method.descriptor);

    let parameters: Vec<_> = descriptor
        .captures
        .iter()
        .filter_map(|c| match c {
            Capture::Parameter { index, attrs } => Some((index, attrs)),
            _ => None,
        })
        .collect();
    if !parameters.is_empty() {
        w.open("parameters");
        for (index, attrs) in parameters {
            w.open_with("parameter", &[("index", &index.to_string())]);
            write_capture_attrs(w, attrs);
            w.close();
        }
        w.close();
    }
    if let Some(Capture::Return { attrs }) = descriptor.return_capture() {
        w.open("returnvalue");
        write_capture_attrs(w, attrs);
        w.close();
    }
    w.close();

    w.leaf("location", "WRAP");
    let fields: Vec<_> = descriptor
        .captures
        .iter()
        .filter_map(|c| match c {
            Capture::Field { expression, attrs } => Some((expression, attrs)),
            _ => None,
        })
        .collect();
    if !fields.is_empty() {
        w.open("fields");
        for (expression, attrs) in fields {
            w.open("field");
            write_capture_attrs(w, attrs);
            w.leaf("expression", expression);
            w.close();
        }
        w.close();
    }
    w.open("config");
    w.leaf(
        "emitonexception",
        bool_str(descriptor.emission.emit_only_on_exception),
    );
    w.leaf(
        "recordexception",
        bool_str(descriptor.emission.record_exception),
    );
    w.close();
    w.close();
}
