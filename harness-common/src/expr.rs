//! Boolean attribute expressions used to select tests.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | IDENT | STRING
//! ```
//!
//! A bare identifier (`[A-Za-z_][A-Za-z0-9_]*`) matches an attribute exactly.
//! A double-quoted string is a glob where `*` matches any run of characters;
//! `\"`, `\\` and `\*` escape.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        offset: usize,
    },

    #[error("empty expression")]
    Empty,

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Ident(String),
    Str(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Not => "'!'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Ident(s) => format!("identifier {s:?}"),
            Token::Str(s) => format!("string {s:?}"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, ch) = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '!' => {
                tokens.push((Token::Not, offset));
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1).map(|(_, c)| *c) != Some(ch) {
                    return Err(ExprError::UnexpectedChar { ch, offset });
                }
                tokens.push((if ch == '&' { Token::And } else { Token::Or }, offset));
                i += 2;
            }
            '"' => {
                // Escapes of '*' and '\\' survive into the text so the glob
                // compiler can tell a literal star from a wildcard.
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, c)) = chars.get(i) else {
                        return Err(ExprError::UnterminatedString(offset));
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            let Some(&(_, next)) = chars.get(i) else {
                                return Err(ExprError::UnterminatedString(offset));
                            };
                            i += 1;
                            if next == '*' || next == '\\' {
                                text.push('\\');
                            }
                            text.push(next);
                        }
                        other => text.push(other),
                    }
                }
                tokens.push((Token::Str(text), offset));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((Token::Ident(ident), offset));
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, offset }),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Exact(String),
    Glob(Regex),
}

impl Node {
    fn eval(&self, attrs: &[String]) -> bool {
        match self {
            Node::And(a, b) => a.eval(attrs) && b.eval(attrs),
            Node::Or(a, b) => a.eval(attrs) || b.eval(attrs),
            Node::Not(n) => !n.eval(attrs),
            Node::Exact(s) => attrs.iter().any(|a| a == s),
            Node::Glob(re) => attrs.iter().any(|a| re.is_match(a)),
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn unexpected(&self, expected: &'static str) -> ExprError {
        match self.tokens.get(self.pos) {
            Some((tok, offset)) => ExprError::UnexpectedToken {
                found: tok.describe(),
                expected,
                offset: *offset,
            },
            None => ExprError::UnexpectedToken {
                found: "end of input".to_string(),
                expected,
                offset: self.end,
            },
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            node = Node::Or(Box::new(node), Box::new(self.parse_and()?));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            node = Node::And(Box::new(node), Box::new(self.parse_unary()?));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let node = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.unexpected("')'"));
                }
                self.pos += 1;
                Ok(node)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Node::Exact(name))
            }
            Some(Token::Str(text)) => {
                self.pos += 1;
                compile_glob(&text)
            }
            _ => Err(self.unexpected("attribute, string or '('")),
        }
    }
}

fn compile_glob(text: &str) -> Result<Node, ExprError> {
    let mut pattern = String::from("^");
    let mut literal = String::new();
    let mut wildcard = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    literal.push(next);
                }
            }
            '*' => {
                wildcard = true;
                pattern.push_str(&regex::escape(&literal));
                literal.clear();
                pattern.push_str(".*");
            }
            other => literal.push(other),
        }
    }
    if !wildcard {
        return Ok(Node::Exact(literal));
    }
    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');
    Regex::new(&pattern)
        .map(Node::Glob)
        .map_err(|source| ExprError::Pattern {
            pattern: text.to_string(),
            source,
        })
}

/// A parsed attribute expression.
#[derive(Debug, Clone)]
pub struct AttrExpr {
    source: String,
    root: Node,
}

impl AttrExpr {
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: input.len(),
        };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.unexpected("'&&', '||' or end of input"));
        }
        Ok(Self {
            source: input.to_string(),
            root,
        })
    }

    /// True when the expression holds for an entity carrying `attrs`.
    pub fn matches(&self, attrs: &[String]) -> bool {
        self.root.eval(attrs)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}
