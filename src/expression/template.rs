// SPDX-License-Identifier: MIT

//! Template splitting: literal text interleaved with `{{ expr }}` blocks

use super::ast::Expression;
use super::parser::parse;
use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Expr(Expression),
}

/// A parsed template string
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Split `input` into text and parsed expressions
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let body_start = start + 2;
            let end = find_close(&rest[body_start..]).ok_or_else(|| {
                ExpressionError::syntax(input, "unclosed '{{' in template")
            })?;
            let body = &rest[body_start..body_start + end];
            segments.push(Segment::Expr(parse(body)?));
            rest = &rest[body_start + end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Plain text with no expression blocks
    pub fn is_literal(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|s| matches!(s, Segment::Expr(_)))
    }

    /// The expression when the template is a single block, allowing
    /// surrounding whitespace
    pub fn single_expression(&self) -> Option<&Expression> {
        let mut found = None;
        for segment in &self.segments {
            match segment {
                Segment::Text(t) if t.trim().is_empty() => {}
                Segment::Text(_) => return None,
                Segment::Expr(e) => {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(e);
                }
            }
        }
        found
    }

    pub fn expressions(&self) -> impl Iterator<Item = &Expression> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(e) => Some(e),
            Segment::Text(_) => None,
        })
    }
}

/// Offset of the `}}` closing a block, skipping quoted strings
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}
