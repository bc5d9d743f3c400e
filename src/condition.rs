use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, Result};

/// Boolean formula over named checklist node results.
///
/// Grammar (keywords case-insensitive):
/// ```text
/// expr   := or
/// or     := and ( 'or' and )*
/// and    := unary ( 'and' unary )*
/// unary  := 'not' unary | atom
/// atom   := '(' expr ')' | IDENT
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum CondExpr {
    Ident(String),
    Not(Box<CondExpr>),
    And(Vec<CondExpr>),
    Or(Vec<CondExpr>),
}

static CONDITION_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w\s()]+$").expect("condition shape regex"));

/// Cheap shape check run before tokenising: identifiers, parentheses and
/// whitespace only.
pub fn validate_condition_shape(source: &str) -> Result<()> {
    if source.trim().is_empty() {
        return Err(EngineError::parsing("condition is empty"));
    }
    if !CONDITION_SHAPE.is_match(source) {
        return Err(EngineError::parsing(format!(
            "condition contains unsupported symbols: {}",
            source
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Ident(String),
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut ident = String::new();
    let flush = |ident: &mut String, tokens: &mut Vec<Token>| {
        if ident.is_empty() {
            return;
        }
        let token = match ident.to_ascii_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Ident(std::mem::take(ident)),
        };
        ident.clear();
        tokens.push(token);
    };
    for ch in source.chars() {
        match ch {
            '(' => {
                flush(&mut ident, &mut tokens);
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut ident, &mut tokens);
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => flush(&mut ident, &mut tokens),
            c => ident.push(c),
        }
    }
    flush(&mut ident, &mut tokens);
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<CondExpr> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().expect("single or-term"))
        } else {
            Ok(CondExpr::Or(terms))
        }
    }

    fn parse_and(&mut self) -> Result<CondExpr> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().expect("single and-term"))
        } else {
            Ok(CondExpr::And(terms))
        }
    }

    fn parse_unary(&mut self) -> Result<CondExpr> {
        match self.advance() {
            Some(Token::Not) => Ok(CondExpr::Not(Box::new(self.parse_unary()?))),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(EngineError::parsing("condition has an unclosed parenthesis")),
                }
            }
            Some(Token::Ident(name)) => Ok(CondExpr::Ident(name)),
            Some(other) => Err(EngineError::parsing(format!(
                "condition has a misplaced token: {:?}",
                other
            ))),
            None => Err(EngineError::parsing("condition ends unexpectedly")),
        }
    }
}

/// Parse a condition into its AST. Built once per checklist at ruleset build
/// time; evaluation afterwards is allocation-free.
pub fn parse_condition(source: &str) -> Result<CondExpr> {
    validate_condition_shape(source)?;
    let mut parser = Parser {
        tokens: tokenize(source),
        position: 0,
    };
    let expr = parser.parse_or()?;
    if parser.position != parser.tokens.len() {
        return Err(EngineError::parsing(format!(
            "condition has trailing tokens after position {}",
            parser.position
        )));
    }
    Ok(expr)
}

impl CondExpr {
    /// Pure boolean evaluation over the gathered node results. Unknown
    /// identifiers evaluate to false.
    pub fn evaluate(&self, results: &HashMap<String, bool>) -> bool {
        match self {
            CondExpr::Ident(name) => results.get(name).copied().unwrap_or(false),
            CondExpr::Not(inner) => !inner.evaluate(results),
            CondExpr::And(terms) => terms.iter().all(|t| t.evaluate(results)),
            CondExpr::Or(terms) => terms.iter().any(|t| t.evaluate(results)),
        }
    }

    /// Every identifier referenced by the formula, used by validation to
    /// cross-check node ids.
    pub fn idents(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_idents(&mut out);
        out
    }

    fn collect_idents<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            CondExpr::Ident(name) => out.push(name),
            CondExpr::Not(inner) => inner.collect_idents(out),
            CondExpr::And(terms) | CondExpr::Or(terms) => {
                for term in terms {
                    term.collect_idents(out);
                }
            }
        }
    }
}
