//! classweave - dynamic instrumentation engine for the JVM.
//!
//! Given a running program and a declarative set of probe definitions,
//! classweave rewrites the bytecode of matched methods at class-load or
//! redefinition time so each invocation emits a structured trace event
//! carrying selected parameters, the return value and object/class field
//! state. The synthesized event record types are generated on demand, one
//! per probe.
//!
//! # Modules
//!
//! - [`validate`] - probe document validation
//! - [`registry`] - the live class -> descriptor store
//! - [`rewrite`] - the classfile rewriter invoked on every class load
//! - [`eventgen`] - per-probe event type synthesis
//! - [`engine`] - the facade the management surface drives
//!
//! # Example
//!
//! ```no_run
//! use classweave::engine::InstrumentationEngine;
//!
//! let engine = InstrumentationEngine::new();
//! engine.define_probes(r#"<agent><events>
//!     <event id="demo.event">
//!         <label>Demo</label>
//!         <class>com.company.Demo</class>
//!         <method><name>work</name><descriptor>(I)I</descriptor></method>
//!     </event>
//! </events></agent>"#).expect("valid probe document");
//!
//! // Wired into the host's class-loading hook:
//! // engine.transformer().transform(loader_id, class_name, bytecode)
//! ```

pub mod classfile;
pub mod desc;
pub mod engine;
pub mod eventgen;
pub mod expr;
pub mod probe;
pub mod registry;
pub mod rewrite;
pub mod validate;
pub mod xml;

pub use engine::InstrumentationEngine;
pub use probe::{Capture, MatchState, ProbeDescriptor};
pub use registry::TransformRegistry;
pub use rewrite::{Transformed, Transformer};
pub use validate::{validate_probe_document, DocumentError};
