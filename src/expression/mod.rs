// SPDX-License-Identifier: MIT

//! The `{{ }}` expression language
//!
//! Any string field of a run configuration may embed expressions:
//! - `{{ fetch.output.body.items[0] }}`
//! - `Hello {{ upper(request.query.name) }}`
//! - `{{ score.output > 0.8 ? 'accept' : 'review' }}`
//!
//! Guard lists (`skipCondition`, `preflightCheck.validations`, `expr`) hold
//! bare expressions; braces around them are accepted and ignored.

mod ast;
mod evaluator;
mod functions;
mod parser;
mod template;

pub use ast::{BinaryOp, Expression, Literal, Reference, UnaryOp};
pub use evaluator::{is_truthy, number, to_text, Evaluator, Scope, RESERVED_ROOTS};
pub use functions::{Function, FunctionRegistry};
pub use parser::{parse, parse_guard};
pub use template::{Segment, Template};

use crate::error::ExpressionError;

/// References made by every `{{ }}` block in a template string
pub fn scan_template(input: &str) -> Result<Vec<Reference>, ExpressionError> {
    let mut refs = Vec::new();
    if input.contains("{{") {
        for expr in Template::parse(input)?.expressions() {
            expr.references(&mut refs);
        }
    }
    Ok(refs)
}

/// References made by a bare guard expression
pub fn scan_guard(input: &str) -> Result<Vec<Reference>, ExpressionError> {
    let mut refs = Vec::new();
    parse_guard(input)?.references(&mut refs);
    Ok(refs)
}

/// Whether a root identifier is one of the built-in namespaces
pub fn is_reserved_root(name: &str) -> bool {
    RESERVED_ROOTS.contains(&name)
}
