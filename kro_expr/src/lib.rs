//! The expression engine is treated as an external collaborator: this crate
//! only depends on two capabilities, compiling an expression to get its
//! referenced root identifiers and evaluating it against an environment.
//! Nothing upstream of the `ExpressionEngine` trait may assume a particular
//! expression language beyond the `${ ... }` delimiter convention.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub mod cel;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("failed to compile expression {expr:?}: {message}")]
    Compile { expr: String, message: String },
    #[error("failed to evaluate expression {expr:?}: {message}")]
    Eval { expr: String, message: String },
    #[error("expression {expr:?} references unbound identifier {ident:?}")]
    UnboundIdentifier { expr: String, ident: String },
}

/// An environment binds root identifiers (`schema`, or a resource id) to a
/// JSON value an expression can read fields from.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    bindings: BTreeMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, root: impl Into<String>, value: Value) -> &mut Self {
        self.bindings.insert(root.into(), value);
        self
    }

    pub fn get(&self, root: &str) -> Option<&Value> {
        self.bindings.get(root)
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

/// A compiled expression: cheap to evaluate repeatedly against different
/// environments, and able to report which root identifiers it depends on
/// without evaluating.
pub trait CompiledExpr: Send + Sync {
    /// Root identifiers referenced by the expression (e.g. `schema`, or
    /// another resource's id). Used by the graph builder to derive
    /// dependency edges; only the root is needed; deeper path segments are
    /// irrelevant to dependency computation.
    fn references(&self) -> &[String];

    fn eval(&self, env: &Environment) -> Result<Value, ExprError>;
}

/// The capability boundary the rest of this workspace depends on. A
/// concrete evaluator (see [`cel::CelEngine`]) implements this without the
/// caller needing to know the expression syntax.
pub trait ExpressionEngine: Send + Sync {
    fn compile(&self, expr: &str) -> Result<Arc<dyn CompiledExpr>, ExprError>;
}

/// One `${ ... }` occurrence or literal run of text within a templated
/// string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Expression(String),
}

/// Whether a field's text is a single bare `${ ... }` (its value is
/// replaced wholesale by the expression result, which may be any type) or a
/// concatenation of literal text and one or more expressions (result must be
/// scalar-coercible, since it's interpolated into a string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Standalone,
    Concatenated,
}

/// Splits a template string on `${ ... }` delimiters. Does not parse the
/// contents of an expression — only finds its boundaries — since expression
/// syntax is the evaluator's business, not this scanner's.
pub fn scan(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after_open = &rest[start + 2..];
        match after_open.find('}') {
            Some(end) => {
                segments.push(Segment::Expression(after_open[..end].trim().to_string()));
                rest = &after_open[end + 1..];
            }
            None => {
                // Unterminated `${`; treat the remainder as literal text
                // rather than panicking on malformed input.
                segments.push(Segment::Literal(rest[start..].to_string()));
                rest = "";
                break;
            }
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    segments
}

/// Classifies a scanned template: standalone iff it is exactly one
/// expression segment with no surrounding literal text.
pub fn classify(segments: &[Segment]) -> FieldShape {
    match segments {
        [Segment::Expression(_)] => FieldShape::Standalone,
        _ => FieldShape::Concatenated,
    }
}

/// True if the template contains at least one expression segment.
pub fn has_expression(segments: &[Segment]) -> bool {
    segments.iter().any(|s| matches!(s, Segment::Expression(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_has_no_expression_segments() {
        let segments = scan("just-a-name");
        assert_eq!(segments, vec![Segment::Literal("just-a-name".into())]);
        assert!(!has_expression(&segments));
    }

    #[test]
    fn bare_expression_is_standalone() {
        let segments = scan("${schema.spec.name}");
        assert_eq!(segments, vec![Segment::Expression("schema.spec.name".into())]);
        assert_eq!(classify(&segments), FieldShape::Standalone);
    }

    #[test]
    fn mixed_text_and_expression_is_concatenated() {
        let segments = scan("prefix-${schema.spec.name}-suffix");
        assert_eq!(
            segments,
            vec![
                Segment::Literal("prefix-".into()),
                Segment::Expression("schema.spec.name".into()),
                Segment::Literal("-suffix".into()),
            ]
        );
        assert_eq!(classify(&segments), FieldShape::Concatenated);
    }

    #[test]
    fn multiple_expressions_are_concatenated() {
        let segments = scan("${a.x}${b.y}");
        assert_eq!(classify(&segments), FieldShape::Concatenated);
    }

    #[test]
    fn unterminated_delimiter_is_treated_as_literal() {
        let segments = scan("oops-${unterminated");
        assert!(!has_expression(&segments));
    }
}
