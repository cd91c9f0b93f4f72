//! Expression parser
//!
//! Tokenizes the text between `{{` and `}}` and builds an [`Expression`]
//! by precedence climbing. From loosest to tightest binding:
//! ternary, `||`/`or`, `&&`/`and`, comparisons and `contains`,
//! `+ -`, `* / %`, unary `! - not`, then member access, indexing and calls.

use super::ast::{BinaryOp, Expression, Literal, UnaryOp};
use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    AndAnd,
    OrOr,
}

/// Parse a bare expression (no surrounding braces)
pub fn parse(input: &str) -> Result<Expression, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::syntax(input, "empty expression"));
    }
    let mut parser = Parser {
        source: input,
        tokens,
        pos: 0,
    };
    let expr = parser.ternary()?;
    if let Some(tok) = parser.peek() {
        return Err(parser.error(format!("unexpected token {:?}", tok)));
    }
    Ok(expr)
}

/// Parse a guard expression, tolerating an optional `{{ }}` wrapper
pub fn parse_guard(input: &str) -> Result<Expression, ExpressionError> {
    let trimmed = input.trim();
    match trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        Some(inner) if !inner.contains("{{") => parse(inner),
        _ => parse(trimmed),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                match chars[i] {
                    '\\' if i + 1 < chars.len() => {
                        value.push(match chars[i + 1] {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    ch if ch == quote => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    ch => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(ExpressionError::syntax(input, "unterminated string literal"));
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                // `rows.output[0].name` style paths never start with a digit,
                // so a dot followed by a non-digit ends the number
                if chars[i] == '.' && !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
                    break;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ExpressionError::syntax(input, format!("bad number '{}'", text)))?;
            tokens.push(Token::Number(n));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Lte, 2),
            ('>', Some('=')) => (Token::Gte, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Bang, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            _ => {
                return Err(ExpressionError::syntax(
                    input,
                    format!("unexpected character '{}'", c),
                ))
            }
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", expected)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::syntax(self.source, message)
    }

    fn ternary(&mut self) -> Result<Expression, ExpressionError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.ternary()?;
            return Ok(Expression::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) || self.eat_keyword("or") {
            let right = self.and()?;
            left = Expression::Binary(Box::new(left), BinaryOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.comparison()?;
        while self.eat(&Token::AndAnd) || self.eat_keyword("and") {
            let right = self.comparison()?;
            left = Expression::Binary(Box::new(left), BinaryOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Lte) => BinaryOp::Lte,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Gte) => BinaryOp::Gte,
                Some(Token::Ident(w)) if w == "contains" => BinaryOp::Contains,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expression::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expression::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expression::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression, ExpressionError> {
        if self.eat(&Token::Bang) || self.eat_keyword("not") {
            let inner = self.unary()?;
            return Ok(Expression::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expression::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expression, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(field)) => {
                        expr = Expression::Member(Box::new(expr), field);
                    }
                    // `items.0` reads like an index
                    Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                        expr = Expression::Index(
                            Box::new(expr),
                            Box::new(Expression::Literal(Literal::Number(n))),
                        );
                    }
                    _ => return Err(self.error("expected field name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.ternary()?;
                self.expect(Token::RBracket)?;
                expr = Expression::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expression, ExpressionError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expression::Literal(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Expression::Literal(Literal::String(s))),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expression::Array(items))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expression::Literal(Literal::Boolean(true))),
                "false" => Ok(Expression::Literal(Literal::Boolean(false))),
                "null" | "nil" => Ok(Expression::Literal(Literal::Null)),
                _ if self.eat(&Token::LParen) => {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    Ok(Expression::Call(name, args))
                }
                _ => Ok(Expression::Ident(name)),
            },
            Some(tok) => Err(self.error(format!("unexpected token {:?}", tok))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}
