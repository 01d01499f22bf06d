//! In-memory probe model: one `ProbeDescriptor` per instrumentation
//! request, built from a validated probe document.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Serialize, Serializer};

use crate::desc;

/// Target method identity. Matching is exact string equality on both the
/// name and the descriptor; there is no overload resolution by
/// assignability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodRef {
    pub name: String,
    pub descriptor: String,
}

/// Metadata shared by every captured value shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureAttrs {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content_type: Option<String>,
    pub relation_key: Option<String>,
    pub converter: Option<String>,
}

/// One captured value of a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Capture {
    /// A formal parameter by 0-based index; the receiver is not index 0.
    Parameter { index: u32, attrs: CaptureAttrs },
    /// The method's return value; at most one per probe.
    Return { attrs: CaptureAttrs },
    /// An object/class field named by a capture expression.
    Field { expression: String, attrs: CaptureAttrs },
}

impl Capture {
    pub fn attrs(&self) -> &CaptureAttrs {
        match self {
            Capture::Parameter { attrs, .. } => attrs,
            Capture::Return { attrs } => attrs,
            Capture::Field { attrs, .. } => attrs,
        }
    }

    /// The event field name this capture writes to: the declared name
    /// sanitized to an identifier, or a positional fallback.
    pub fn field_name(&self, position: usize) -> String {
        let declared = self.attrs().name.as_deref().unwrap_or("");
        let sanitized = desc::sanitize_identifier(declared);
        if !sanitized.is_empty() {
            return lower_first(&sanitized);
        }
        match self {
            Capture::Parameter { index, .. } => format!("arg{index}"),
            Capture::Return { .. } => "returnValue".to_string(),
            Capture::Field { .. } => format!("field{position}"),
        }
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Where instrumentation is spliced. Only whole-method wrapping (entry
/// plus every exit path) is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Location {
    #[default]
    Wrap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmissionPolicy {
    pub location: Location,
    /// Emit (then rethrow) when the method unwinds with an exception.
    pub record_exception: bool,
    pub record_stack_trace: bool,
    /// Suppress emission on normal return; emit only on exceptional exit.
    pub emit_only_on_exception: bool,
}

/// Whether a descriptor has been matched against a loaded class yet.
/// Re-evaluated on every (re)transformation of the target class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchState {
    Unresolved,
    MatchFound,
    MatchNotFound,
}

/// Lock-free holder for `MatchState`, shared through `Arc<ProbeDescriptor>`.
#[derive(Debug, Default)]
pub struct MatchStateCell(AtomicU8);

impl MatchStateCell {
    pub fn get(&self) -> MatchState {
        match self.0.load(Ordering::Acquire) {
            1 => MatchState::MatchFound,
            2 => MatchState::MatchNotFound,
            _ => MatchState::Unresolved,
        }
    }

    pub fn set(&self, state: MatchState) {
        let v = match state {
            MatchState::Unresolved => 0,
            MatchState::MatchFound => 1,
            MatchState::MatchNotFound => 2,
        };
        self.0.store(v, Ordering::Release);
    }
}

impl Serialize for MatchStateCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

/// Document-scoped configuration applied to every probe it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalConfig {
    /// Prefix for every synthesized event type name, so generated classes
    /// can never collide with the target program's own.
    pub class_prefix: String,
    /// Allowing toString() fallbacks for arbitrary objects is opt-in.
    pub allow_to_string: bool,
    /// Allowing user converters is opt-in.
    pub allow_converter: bool,
}

impl Default for GlobalConfig {
    fn default() -> GlobalConfig {
        GlobalConfig {
            class_prefix: "__TraceEvent".to_string(),
            allow_to_string: false,
            allow_converter: false,
        }
    }
}

/// The resolved, in-memory form of one probe.
#[derive(Debug, Serialize)]
pub struct ProbeDescriptor {
    /// Globally unique key; also the merge/collision key on re-ingest.
    pub id: String,
    /// Target class, dotted canonical form (`com.company.Project`).
    pub class_name: String,
    pub method: MethodRef,
    pub label: String,
    pub description: Option<String>,
    pub path: Option<String>,
    pub emission: EmissionPolicy,
    /// Document order is preserved; it defines event field order.
    pub captures: Vec<Capture>,
    pub match_state: MatchStateCell,
    /// Internal name of the synthesized event type for this probe.
    pub event_class_name: String,
    pub allow_to_string: bool,
    pub allow_converter: bool,
}

impl ProbeDescriptor {
    /// Derive the synthesized event type name from the configured prefix
    /// and the probe id, reduced to a valid binary class name.
    pub fn event_class_name(config: &GlobalConfig, id: &str) -> String {
        let sanitized = desc::sanitize_identifier(id);
        format!("{}{}", desc::internal_name(&config.class_prefix), sanitized)
    }

    /// Target class in internal (slash) form.
    pub fn internal_class_name(&self) -> String {
        desc::internal_name(&self.class_name)
    }

    pub fn return_capture(&self) -> Option<&Capture> {
        self.captures
            .iter()
            .find(|c| matches!(c, Capture::Return { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_state_round_trips_through_the_cell() {
        let cell = MatchStateCell::default();
        assert_eq!(cell.get(), MatchState::Unresolved);
        cell.set(MatchState::MatchFound);
        assert_eq!(cell.get(), MatchState::MatchFound);
        cell.set(MatchState::MatchNotFound);
        assert_eq!(cell.get(), MatchState::MatchNotFound);
    }

    #[test]
    fn event_class_names_are_prefixed_and_sanitized() {
        let config = GlobalConfig::default();
        assert_eq!(
            ProbeDescriptor::event_class_name(&config, "demo.event1"),
            "__TraceEventdemoevent1"
        );
        let custom = GlobalConfig {
            class_prefix: "com.company.Probe".to_string(),
            ..GlobalConfig::default()
        };
        assert_eq!(
            ProbeDescriptor::event_class_name(&custom, "x-1"),
            "com/company/Probex1"
        );
    }

    #[test]
    fn capture_field_names_fall_back_positionally() {
        let unnamed = Capture::Parameter {
            index: 2,
            attrs: CaptureAttrs::default(),
        };
        assert_eq!(unnamed.field_name(0), "arg2");

        let named = Capture::Field {
            expression: "this.count".to_string(),
            attrs: CaptureAttrs {
                name: Some("Current Count".to_string()),
                ..CaptureAttrs::default()
            },
        };
        assert_eq!(named.field_name(3), "currentCount");
    }
}
