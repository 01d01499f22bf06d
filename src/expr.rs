//! Field-capture expressions: a restricted subset of Java primary
//! expressions (no array accesses, no method calls).
//!
//! ```text
//! Expression -> this
//!             | TypeName . this (. identifier)*
//!             | super . identifier (. identifier)*
//!             | TypeName . super . identifier (. identifier)*
//!             | identifier (. identifier)*        // field chain or TYPE.FIELD
//! identifier -> [A-Za-z_][A-Za-z0-9_]*
//! ```
//!
//! Parsing is pure syntax; which names denote types versus fields is only
//! decidable against a concrete class, so that resolution lives in the
//! rewriter and degrades softly there.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError {
    pub expression: String,
    pub reason: String,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid expression '{}': {}", self.expression, self.reason)
    }
}

impl std::error::Error for ExprError {}

/// A syntactically valid capture expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldExpr {
    /// `this`
    This,
    /// `this.f` or `this.f.g`
    ThisField { chain: Vec<String> },
    /// `Outer.this` / `pkg.Outer.this.f` — qualifier is the TypeName tokens.
    QualifiedThis {
        qualifier: Vec<String>,
        chain: Vec<String>,
    },
    /// `super.f` or `Outer.super.f`
    SuperField {
        qualifier: Vec<String>,
        chain: Vec<String>,
    },
    /// `f`, `f.g`, `TYPE.FIELD`, `com.pkg.Type.FIELD` — which prefix (if
    /// any) names a type is resolved later against the target class.
    Path { chain: Vec<String> },
}

impl FieldExpr {
    pub fn parse(expression: &str) -> Result<FieldExpr, ExprError> {
        let err = |reason: &str| ExprError {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        if expression.trim().is_empty() {
            return Err(err("empty expression"));
        }
        let tokens: Vec<&str> = expression.trim().split('.').collect();
        for t in &tokens {
            if !is_identifier_or_keyword(t) {
                return Err(err("expected an identifier"));
            }
        }

        // Locate 'this'/'super'; the grammar allows at most one keyword,
        // preceded only by plain identifiers (a TypeName).
        let keyword_at = tokens.iter().position(|t| *t == "this" || *t == "super");
        match keyword_at {
            None => Ok(FieldExpr::Path {
                chain: tokens.iter().map(|t| t.to_string()).collect(),
            }),
            Some(i) => {
                if tokens[i + 1..].iter().any(|t| *t == "this" || *t == "super") {
                    return Err(err("'this'/'super' may appear only once"));
                }
                let qualifier: Vec<String> = tokens[..i].iter().map(|t| t.to_string()).collect();
                let chain: Vec<String> = tokens[i + 1..].iter().map(|t| t.to_string()).collect();
                if tokens[i] == "super" {
                    if chain.is_empty() {
                        return Err(err("'super' must be followed by a field name"));
                    }
                    Ok(FieldExpr::SuperField { qualifier, chain })
                } else if qualifier.is_empty() {
                    if chain.is_empty() {
                        Ok(FieldExpr::This)
                    } else {
                        Ok(FieldExpr::ThisField { chain })
                    }
                } else {
                    Ok(FieldExpr::QualifiedThis { qualifier, chain })
                }
            }
        }
    }
}

fn is_identifier_or_keyword(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_reference_grammar() {
        assert_eq!(FieldExpr::parse("this").unwrap(), FieldExpr::This);
        assert_eq!(
            FieldExpr::parse("this.field").unwrap(),
            FieldExpr::ThisField {
                chain: vec!["field".into()]
            }
        );
        assert_eq!(
            FieldExpr::parse("MyClass.this.field").unwrap(),
            FieldExpr::QualifiedThis {
                qualifier: vec!["MyClass".into()],
                chain: vec!["field".into()]
            }
        );
        assert_eq!(
            FieldExpr::parse("field").unwrap(),
            FieldExpr::Path {
                chain: vec!["field".into()]
            }
        );
        assert_eq!(
            FieldExpr::parse("super.field").unwrap(),
            FieldExpr::SuperField {
                qualifier: vec![],
                chain: vec!["field".into()]
            }
        );
        assert_eq!(
            FieldExpr::parse("STATIC_FIELD").unwrap(),
            FieldExpr::Path {
                chain: vec!["STATIC_FIELD".into()]
            }
        );
        // Qualified this with no trailing field, as in the reference tests.
        assert!(FieldExpr::parse("com.company.product.MyClass.this").is_ok());
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            " ",
            "this..field",
            ".field",
            "field.",
            "1bad",
            "a b",
            "super",
            "this.super.x",
            "a.this.b.super",
        ] {
            assert!(FieldExpr::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
