// SPDX-License-Identifier: MIT

//! Abstract Syntax Tree for `{{ }}` expressions

/// An expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    /// `[a, b, c]`
    Array(Vec<Expression>),
    /// Bare identifier at the root of a path
    Ident(String),
    /// `base.field`
    Member(Box<Expression>, String),
    /// `base[index]`
    Index(Box<Expression>, Box<Expression>),
    /// `name(args…)`
    Call(String, Vec<Expression>),
    Unary(UnaryOp, Box<Expression>),
    Binary(Box<Expression>, BinaryOp, Box<Expression>),
    /// `cond ? then : else`
    Ternary(Box<Expression>, Box<Expression>, Box<Expression>),
}

/// A reference found by static scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Identifier at a path root, e.g. `fetch` in `fetch.output.body`
    Root(String),
    /// Literal argument of `output('id')`
    Output(String),
}

impl Reference {
    pub fn name(&self) -> &str {
        match self {
            Reference::Root(n) | Reference::Output(n) => n,
        }
    }
}

impl Expression {
    /// Collect every root identifier and `output('…')` target in the tree
    pub fn references(&self, out: &mut Vec<Reference>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Array(items) => items.iter().for_each(|e| e.references(out)),
            Expression::Ident(name) => out.push(Reference::Root(name.clone())),
            Expression::Member(base, _) => base.references(out),
            Expression::Index(base, index) => {
                base.references(out);
                index.references(out);
            }
            Expression::Call(name, args) => {
                if name == "output" {
                    if let Some(Expression::Literal(Literal::String(id))) = args.first() {
                        out.push(Reference::Output(id.clone()));
                    }
                }
                args.iter().for_each(|e| e.references(out));
            }
            Expression::Unary(_, inner) => inner.references(out),
            Expression::Binary(left, _, right) => {
                left.references(out);
                right.references(out);
            }
            Expression::Ternary(cond, then, otherwise) => {
                cond.references(out);
                then.references(out);
                otherwise.references(out);
            }
        }
    }

    /// Render a dotted path for error messages, when the node is one
    pub fn path(&self) -> Option<String> {
        match self {
            Expression::Ident(name) => Some(name.clone()),
            Expression::Member(base, field) => Some(format!("{}.{}", base.path()?, field)),
            Expression::Index(base, index) => match index.as_ref() {
                Expression::Literal(Literal::Number(n)) => Some(format!("{}[{}]", base.path()?, n)),
                Expression::Literal(Literal::String(s)) => {
                    Some(format!("{}['{}']", base.path()?, s))
                }
                _ => Some(format!("{}[…]", base.path()?)),
            },
            _ => None,
        }
    }
}

/// Literal values in expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring, array element, or object key
    Contains,
    And,
    Or,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::Div => write!(f, "/"),
            BinaryOp::Rem => write!(f, "%"),
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::NotEq => write!(f, "!="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Gte => write!(f, ">="),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Lte => write!(f, "<="),
            BinaryOp::Contains => write!(f, "contains"),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}
