//! Controller-facing facade tying the validator, registry, rewriter and
//! event generator together. The management surface (JMX or otherwise)
//! talks to this; the host's class-loading hook talks to
//! [`Transformer::transform`] directly.

use std::sync::Arc;

use anyhow::Result;

use crate::probe::ProbeDescriptor;
use crate::registry::TransformRegistry;
use crate::rewrite::Transformer;

pub struct InstrumentationEngine {
    registry: Arc<TransformRegistry>,
    transformer: Transformer,
}

impl Default for InstrumentationEngine {
    fn default() -> Self {
        InstrumentationEngine::new()
    }
}

impl InstrumentationEngine {
    pub fn new() -> InstrumentationEngine {
        let registry = Arc::new(TransformRegistry::new());
        let transformer = Transformer::new(Arc::clone(&registry));
        InstrumentationEngine {
            registry,
            transformer,
        }
    }

    /// Ingest a probe document, replacing the current probe set. Fails
    /// loudly and leaves the prior state untouched on any document error.
    pub fn define_probes(&self, document: &str) -> Result<Vec<Arc<ProbeDescriptor>>> {
        Ok(self.registry.replace_all(document)?)
    }

    /// The current probe set, serialized back to document form.
    pub fn retrieve_probes(&self) -> String {
        self.registry.serialize_document()
    }

    pub fn retrieve_current_transforms(&self) -> Vec<Arc<ProbeDescriptor>> {
        self.registry.all_descriptors()
    }

    /// JSON rendering of the current descriptors, match states included.
    pub fn retrieve_current_transforms_json(&self) -> String {
        let descriptors = self.registry.all_descriptors();
        let view: Vec<&ProbeDescriptor> = descriptors.iter().map(|d| &**d).collect();
        serde_json::to_string_pretty(&view).unwrap_or_else(|_| "[]".to_string())
    }

    /// Drop every probe; returns the classes that had pending work so the
    /// controller can trigger their retransformation.
    pub fn clear_all(&self) -> Vec<String> {
        self.registry.clear_all()
    }

    pub fn registry(&self) -> &Arc<TransformRegistry> {
        &self.registry
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }
}
