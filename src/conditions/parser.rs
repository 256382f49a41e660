//! Parser for the buy/sell Boolean expression language.
//!
//! Grammar (the complete language — anything else is rejected):
//!
//! ```text
//! Expr   := Or
//! Or     := And ('or' And)*
//! And    := Not ('and' Not)*
//! Not    := 'not' Not | Atom
//! Atom   := IDENT | '(' Expr ')'
//! ```
//!
//! Identifiers name sub-conditions. Attribute access, calls, arithmetic and
//! literals other than condition ids are parse errors, never evaluated.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprNode {
    Ident(String),
    Not(Box<ExprNode>),
    And(Box<ExprNode>, Box<ExprNode>),
    Or(Box<ExprNode>, Box<ExprNode>),
}

impl ExprNode {
    /// All identifiers referenced by this expression.
    pub fn idents(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_idents(&mut out);
        out
    }

    fn collect_idents<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ExprNode::Ident(name) => out.push(name),
            ExprNode::Not(inner) => inner.collect_idents(out),
            ExprNode::And(a, b) | ExprNode::Or(a, b) => {
                a.collect_idents(out);
                b.collect_idents(out);
            }
        }
    }

    /// Evaluate with a truth lookup for each identifier. Unknown identifiers
    /// evaluate to false (a missing condition can never admit a stock).
    pub fn eval(&self, lookup: &dyn Fn(&str) -> bool) -> bool {
        match self {
            ExprNode::Ident(name) => lookup(name),
            ExprNode::Not(inner) => !inner.eval(lookup),
            ExprNode::And(a, b) => a.eval(lookup) && b.eval(lookup),
            ExprNode::Or(a, b) => a.eval(lookup) || b.eval(lookup),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push((Token::LParen, i));
            i += 1;
        } else if c == ')' {
            tokens.push((Token::RParen, i));
            i += 1;
        } else if c.is_ascii_alphanumeric() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_alphanumeric() || c == '_' {
                    i += 1;
                } else {
                    break;
                }
            }
            let word = &input[start..i];
            let token = match word.to_ascii_lowercase().as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                _ => Token::Ident(word.to_string()),
            };
            tokens.push((token, start));
        } else {
            return Err(ParseError {
                message: format!("unexpected character '{c}'"),
                position: i,
            });
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.input_len, |(_, p)| *p)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<ExprNode, ParseError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = ExprNode::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprNode, ParseError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = ExprNode::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<ExprNode, ParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(ExprNode::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<ExprNode, ParseError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Ident(name)) => Ok(ExprNode::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError {
                        message: "expected ')'".into(),
                        position: self.position(),
                    }),
                }
            }
            other => Err(ParseError {
                message: format!("expected condition id or '(', found {other:?}"),
                position,
            }),
        }
    }
}

/// Parse an expression, rejecting anything outside the grammar.
pub fn parse(input: &str) -> Result<ExprNode, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError {
            message: "empty expression".into(),
            position: 0,
        });
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        input_len: input.len(),
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError {
            message: "trailing tokens after expression".into(),
            position: parser.position(),
        });
    }
    Ok(expr)
}
