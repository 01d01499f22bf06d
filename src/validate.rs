//! Probe document validation.
//!
//! `validate_probe_document` is a pure function over the document text:
//! it either accepts the document or reports the first structural or
//! semantic problem found. The registry is only ever fed documents that
//! already passed here, so ingest can stay permissive.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::desc;
use crate::expr::FieldExpr;
use crate::xml::Element;

// One or more dot-separated identifiers; a single '$' may join an
// outer/inner class pair in the final segment.
static CLASS_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*(\$[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("class name pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Not well-formed probe XML at all: unparseable markup, wrong root
    /// element, or a structurally required element/attribute missing.
    MalformedDocument { reason: String },
    /// A target class name outside the FQCN grammar (or absent).
    InvalidClassName { value: String },
    /// A method descriptor that is absent or does not parse.
    InvalidDescriptor { value: String },
    /// A field capture expression outside the expression grammar.
    InvalidExpression { value: String },
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::MalformedDocument { reason } => {
                write!(f, "malformed probe document: {reason}")
            }
            DocumentError::InvalidClassName { value } => {
                write!(f, "invalid target class name '{value}'")
            }
            DocumentError::InvalidDescriptor { value } => {
                write!(f, "invalid method descriptor '{value}'")
            }
            DocumentError::InvalidExpression { value } => {
                write!(f, "invalid field expression '{value}'")
            }
        }
    }
}

impl std::error::Error for DocumentError {}

fn malformed(reason: impl Into<String>) -> DocumentError {
    DocumentError::MalformedDocument {
        reason: reason.into(),
    }
}

pub fn is_valid_class_name(name: &str) -> bool {
    CLASS_NAME_RE.is_match(name)
}

fn check_bool(element: &Element, name: &str) -> Result<(), DocumentError> {
    if let Some(text) = element.child_text(name) {
        if text != "true" && text != "false" {
            return Err(malformed(format!("<{name}> must be 'true' or 'false'")));
        }
    }
    Ok(())
}

/// Validate a probe document. Pure; no side effects.
pub fn validate_probe_document(document: &str) -> Result<(), DocumentError> {
    let root = Element::parse(document).map_err(|e| malformed(e.to_string()))?;
    if root.name != "agent" {
        return Err(malformed(format!(
            "expected <agent> document root, found <{}>",
            root.name
        )));
    }

    if let Some(config) = root.child("config") {
        check_bool(config, "allowtostring")?;
        check_bool(config, "allowconverter")?;
    }

    if let Some(events) = root.child("events") {
        for event in events.children_named("event") {
            validate_event(event)?;
        }
    }
    Ok(())
}

fn validate_event(event: &Element) -> Result<(), DocumentError> {
    let id = event
        .attr("id")
        .ok_or_else(|| malformed("<event> is missing its id attribute"))?;
    if id.trim().is_empty() {
        return Err(malformed("<event> id attribute is empty"));
    }

    // <label>, with <name> accepted as an alias.
    if event.child_text("label").is_none() && event.child_text("name").is_none() {
        return Err(malformed(format!("event '{id}' has no <label>")));
    }

    let class_name = event.child_text("class").unwrap_or("");
    if !is_valid_class_name(class_name) {
        return Err(DocumentError::InvalidClassName {
            value: class_name.to_string(),
        });
    }

    let method = event
        .child("method")
        .ok_or_else(|| malformed(format!("event '{id}' has no <method>")))?;
    if method.child_text("name").map(str::trim).unwrap_or("").is_empty() {
        return Err(malformed(format!("event '{id}' method has no <name>")));
    }
    let descriptor = method.child_text("descriptor").unwrap_or("");
    if desc::parse_method_descriptor(descriptor).is_err() {
        return Err(DocumentError::InvalidDescriptor {
            value: descriptor.to_string(),
        });
    }

    if let Some(parameters) = method.child("parameters") {
        for parameter in parameters.children_named("parameter") {
            let index = parameter
                .attr("index")
                .ok_or_else(|| malformed("<parameter> is missing its index attribute"))?;
            if index.parse::<u32>().is_err() {
                return Err(malformed(format!(
                    "<parameter> index '{index}' is not a non-negative integer"
                )));
            }
        }
    }
    if method.children_named("returnvalue").count() > 1 {
        return Err(malformed(format!(
            "event '{id}' declares more than one <returnvalue>"
        )));
    }

    if let Some(location) = event.child_text("location") {
        if location != "WRAP" {
            return Err(malformed(format!("unsupported <location> '{location}'")));
        }
    }
    check_bool(event, "stacktrace")?;
    if let Some(config) = event.child("config") {
        check_bool(config, "emitonexception")?;
        check_bool(config, "recordexception")?;
    }

    if let Some(fields) = event.child("fields") {
        for field in fields.children_named("field") {
            let expression = field.child_text("expression").unwrap_or("");
            if FieldExpr::parse(expression).is_err() {
                return Err(DocumentError::InvalidExpression {
                    value: expression.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(probe: &str) -> String {
        format!("<agent><events>{probe}</events></agent>")
    }

    const MINIMAL: &str = r#"<event id="demo.event2">
        <label>Event 2</label>
        <class>org.company.project.MyDemoClass</class>
        <method>
            <name>targetFunction</name>
            <descriptor>(Ljava/lang/String;)V</descriptor>
        </method>
    </event>"#;

    #[test]
    fn accepts_a_minimal_probe() {
        validate_probe_document(&wrap(MINIMAL)).unwrap();
    }

    #[test]
    fn accepts_a_fully_populated_probe() {
        let probe = r#"<event id="demo.event1">
            <label>Event 1</label>
            <class>com.company.project.MyDemoClass</class>
            <description>demo event #1</description>
            <path>demo</path>
            <stacktrace>true</stacktrace>
            <method>
                <name>targetFunction</name>
                <descriptor>(Ljava/lang/String;)I</descriptor>
                <parameters>
                    <parameter index="0">
                        <name>param 0</name>
                        <description>the first parameter</description>
                        <contenttype>None</contenttype>
                        <relationkey>http://project.company.com/relation_id/parameter#0</relationkey>
                        <converter>com.company.project.MyConverter</converter>
                    </parameter>
                </parameters>
                <returnvalue>
                    <name>returnValue</name>
                    <description>the return value</description>
                    <contenttype>None</contenttype>
                    <converter>com.company.project.MyConverter</converter>
                </returnvalue>
            </method>
            <location>WRAP</location>
            <fields>
                <field>
                    <name>count</name>
                    <description>current value of 'count'</description>
                    <expression>com.company.product.MyClass.this</expression>
                    <contenttype>None</contenttype>
                    <relationkey>http://project.company.com/relation_id/field#0</relationkey>
                    <converter>com.company.project.MyConverter</converter>
                </field>
            </fields>
            <config><emitonexception>true</emitonexception></config>
        </event>"#;
        validate_probe_document(&wrap(probe)).unwrap();
    }

    #[test]
    fn rejects_empty_and_non_xml_input() {
        assert!(matches!(
            validate_probe_document(""),
            Err(DocumentError::MalformedDocument { .. })
        ));
        assert!(matches!(
            validate_probe_document("This is not an XML string"),
            Err(DocumentError::MalformedDocument { .. })
        ));
    }

    #[test]
    fn accepts_valid_class_names() {
        for class in [
            "MyClass",
            "pkg_name.MyClass",
            "com.company.project.MyClass",
            "MyClass$MyInnerClass",
        ] {
            let probe = MINIMAL.replace("org.company.project.MyDemoClass", class);
            validate_probe_document(&wrap(&probe)).unwrap();
        }
    }

    #[test]
    fn rejects_missing_or_bad_class_names() {
        let no_class = r#"<event id="e"><label>x</label><method>
            <name>f</name><descriptor>()V</descriptor></method></event>"#;
        assert!(matches!(
            validate_probe_document(&wrap(no_class)),
            Err(DocumentError::InvalidClassName { .. })
        ));

        for bad in ["not a valid full-qualified-class-name", "com..a", "1Bad", "a.$b"] {
            let probe = MINIMAL.replace("org.company.project.MyDemoClass", bad);
            assert!(
                matches!(
                    validate_probe_document(&wrap(&probe)),
                    Err(DocumentError::InvalidClassName { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn accepts_valid_descriptors() {
        for descriptor in [
            "()D",
            "()V",
            "(Ljava/lang/String;)V",
            "(Ljava/lang/String;J)I",
            "([Lcom/company/project/MyClass;)V",
            "([[Lcom/company/project/MyClass;)V",
            "()[D",
            "()[[D",
        ] {
            let probe = MINIMAL.replace("(Ljava/lang/String;)V", descriptor);
            validate_probe_document(&wrap(&probe)).unwrap();
        }
    }

    #[test]
    fn rejects_missing_or_bad_descriptors() {
        let no_descriptor = r#"<event id="e"><label>x</label>
            <class>org.company.project.MyDemoClass</class>
            <method><name>f</name></method></event>"#;
        assert!(matches!(
            validate_probe_document(&wrap(no_descriptor)),
            Err(DocumentError::InvalidDescriptor { .. })
        ));

        let probe = MINIMAL.replace("(Ljava/lang/String;)V", "not a valid descriptor");
        assert!(matches!(
            validate_probe_document(&wrap(&probe)),
            Err(DocumentError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn validates_field_expressions() {
        let template = r#"<event id="e"><label>x</label>
            <class>org.company.project.MyDemoClass</class>
            <method><name>f</name><descriptor>()V</descriptor></method>
            <fields><field><name>v</name><expression>EXPR</expression></field></fields>
        </event>"#;

        for good in [
            "this",
            "this.field",
            "MyClass.this.field",
            "field",
            "super.field",
            "STATIC_FIELD",
        ] {
            validate_probe_document(&wrap(&template.replace("EXPR", good))).unwrap();
        }
        for bad in ["", "this..f", "a b"] {
            assert!(
                matches!(
                    validate_probe_document(&wrap(&template.replace("EXPR", bad))),
                    Err(DocumentError::InvalidExpression { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn rejects_structural_gaps() {
        // No id attribute.
        let probe = MINIMAL.replace(" id=\"demo.event2\"", "");
        assert!(matches!(
            validate_probe_document(&wrap(&probe)),
            Err(DocumentError::MalformedDocument { .. })
        ));
        // Wrong document root.
        assert!(matches!(
            validate_probe_document("<probes></probes>"),
            Err(DocumentError::MalformedDocument { .. })
        ));
        // Bad boolean.
        let probe = MINIMAL.replace("</event>", "<stacktrace>yes</stacktrace></event>");
        assert!(matches!(
            validate_probe_document(&wrap(&probe)),
            Err(DocumentError::MalformedDocument { .. })
        ));
    }

    #[test]
    fn an_agent_document_with_no_events_is_valid() {
        validate_probe_document("<agent><events/></agent>").unwrap();
        validate_probe_document("<agent/>").unwrap();
    }
}
