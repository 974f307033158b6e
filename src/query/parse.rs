//! Recursive-descent parser for the boolean query language.
//!
//! ```text
//! Disjunct := Conjunct ('|' Conjunct)*
//! Conjunct := Atom+
//! Atom     := NAME '=' NAME '..'            prefix
//!           | NAME ':' NAME                 word in attribute
//!           | NAME                          word anywhere
//!           | NAME '=' '[' NAME? ':' NAME? ']'  range
//!           | NAME '=' NAME?                exact match
//!           | '<' NUMBER '>' NAME ('..' NAME)*  proximity
//!           | '(' Disjunct ')' | '~' Atom
//! ```
//!
//! A NAME is a run of ASCII letters and digits, or a double-quoted string in
//! which `\\` and `\"` escape themselves.

use crate::error::{FramedexError, Result};

/// Characters of context quoted in parse errors.
const CONTEXT_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNode {
    Or(Vec<QueryNode>),
    And(Vec<QueryNode>),
    Not(Box<QueryNode>),
    Prefix { attr: String, prefix: String },
    AttrWord { attr: String, word: String },
    AnyWord(String),
    Range { attr: String, low: String, high: String },
    Match { attr: String, value: String },
    Proximate { limit: usize, words: Vec<String> },
}

impl QueryNode {
    /// True for nodes that compile to a single filter.
    pub fn is_atom(&self) -> bool {
        !matches!(self, Self::Or(_) | Self::And(_) | Self::Not(_))
    }
}

/// Parse a complete query string. Trailing unparsed text is an error.
pub fn parse_query(text: &str) -> Result<QueryNode> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        cursor: 0,
    };
    let node = parser.disjunct()?;
    if parser.cursor != parser.chars.len() {
        return Err(parser.error("text not all consumed"));
    }
    Ok(node)
}

struct Parser {
    chars: Vec<char>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.cursor).copied()
    }

    fn at_end(&self) -> bool {
        self.cursor >= self.chars.len()
    }

    fn looking_at(&self, token: &str) -> bool {
        token
            .chars()
            .enumerate()
            .all(|(i, ch)| self.chars.get(self.cursor + i) == Some(&ch))
    }

    fn error(&self, expected: &str) -> FramedexError {
        let context: String = self
            .chars
            .iter()
            .skip(self.cursor)
            .take(CONTEXT_CHARS)
            .collect();
        FramedexError::invalid_query(format!("{expected} at {}: {context:?}", self.cursor))
    }

    fn expect(&mut self, token: char, expected: &str) -> Result<()> {
        if self.peek() != Some(token) {
            return Err(self.error(expected));
        }
        self.cursor += 1;
        Ok(())
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.cursor += 1;
        }
    }

    fn number(&mut self) -> Result<Option<usize>> {
        let start = self.cursor;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.cursor += 1;
        }
        if start == self.cursor {
            return Ok(None);
        }
        let digits: String = self.chars[start..self.cursor].iter().collect();
        digits
            .parse()
            .map(Some)
            .map_err(|_| self.error("proximity limit out of range"))
    }

    fn name(&mut self) -> Result<Option<String>> {
        let start = self.cursor;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.cursor += 1;
        }
        if start < self.cursor {
            return Ok(Some(self.chars[start..self.cursor].iter().collect()));
        }
        if self.peek() != Some('"') {
            return Ok(None);
        }
        self.cursor += 1;
        let mut out = String::new();
        while let Some(ch) = self.peek() {
            if ch == '"' {
                self.cursor += 1;
                return Ok(Some(out));
            }
            if ch == '\\' && matches!(self.chars.get(self.cursor + 1), Some('\\' | '"')) {
                self.cursor += 1;
            }
            if let Some(escaped) = self.peek() {
                out.push(escaped);
            }
            self.cursor += 1;
        }
        self.cursor = start;
        Err(self.error("couldn't close quotes"))
    }

    fn required_name(&mut self, expected: &str) -> Result<String> {
        self.name()?.ok_or_else(|| self.error(expected))
    }

    fn disjunct(&mut self) -> Result<QueryNode> {
        let mut items = Vec::new();
        while !self.at_end() {
            items.push(self.conjunct()?);
            self.skip_ws();
            if self.peek() == Some('|') {
                self.cursor += 1;
            } else {
                break;
            }
        }
        collapse(items, QueryNode::Or).ok_or_else(|| self.error("empty disjunct is not permitted"))
    }

    fn conjunct(&mut self) -> Result<QueryNode> {
        let mut items = Vec::new();
        loop {
            items.push(self.atom()?);
            self.skip_ws();
            if self.at_end() || matches!(self.peek(), Some('|' | ')')) {
                break;
            }
        }
        collapse(items, QueryNode::And).ok_or_else(|| self.error("empty conjunct is not permitted"))
    }

    fn atom(&mut self) -> Result<QueryNode> {
        self.skip_ws();
        let Some(first) = self.peek() else {
            return Err(self.error("cannot find atom past end of string"));
        };
        match first {
            '<' => self.proximity(),
            '~' => {
                self.cursor += 1;
                self.skip_ws();
                Ok(QueryNode::Not(Box::new(self.atom()?)))
            }
            '(' => {
                self.cursor += 1;
                self.skip_ws();
                let inner = self.disjunct()?;
                self.skip_ws();
                self.expect(')', r#"expect "(" DISJUNCT ")", looking for ")""#)?;
                Ok(inner)
            }
            _ => self.named(),
        }
    }

    fn proximity(&mut self) -> Result<QueryNode> {
        const SHAPE: &str = r#"expect "<" NUMBER ">" NAME ( ".." NAME )*"#;
        self.cursor += 1;
        let limit = self.number()?.ok_or_else(|| self.error(SHAPE))?;
        self.skip_ws();
        self.expect('>', SHAPE)?;
        let mut words = Vec::new();
        loop {
            self.skip_ws();
            words.push(self.required_name(SHAPE)?);
            self.skip_ws();
            if self.looking_at("..") {
                self.cursor += 2;
            } else {
                break;
            }
        }
        Ok(QueryNode::Proximate { limit, words })
    }

    fn named(&mut self) -> Result<QueryNode> {
        let attr = self.required_name("expected name")?;
        self.skip_ws();
        match self.peek() {
            Some(':') => {
                self.cursor += 1;
                self.skip_ws();
                let word = self.required_name(r#"expect NAME ":" NAME"#)?;
                Ok(QueryNode::AttrWord { attr, word })
            }
            Some('=') => {
                self.cursor += 1;
                if self.peek() == Some('[') {
                    return self.range(attr);
                }
                self.skip_ws();
                let Some(value) = self.name()? else {
                    return Ok(QueryNode::Match {
                        attr,
                        value: String::new(),
                    });
                };
                if self.looking_at("..") {
                    self.cursor += 2;
                    return Ok(QueryNode::Prefix {
                        attr,
                        prefix: value,
                    });
                }
                Ok(QueryNode::Match { attr, value })
            }
            _ => Ok(QueryNode::AnyWord(attr)),
        }
    }

    fn range(&mut self, attr: String) -> Result<QueryNode> {
        const SHAPE: &str = r#"expect NAME "=" "[" NAME ":" NAME "]""#;
        self.cursor += 1;
        self.skip_ws();
        let low = self.name()?.unwrap_or_default();
        self.skip_ws();
        self.expect(':', SHAPE)?;
        self.skip_ws();
        let high = self.name()?.unwrap_or_default();
        self.skip_ws();
        self.expect(']', SHAPE)?;
        Ok(QueryNode::Range { attr, low, high })
    }
}

fn collapse(mut items: Vec<QueryNode>, wrap: fn(Vec<QueryNode>) -> QueryNode) -> Option<QueryNode> {
    match items.len() {
        0 => None,
        1 => items.pop(),
        _ => Some(wrap(items)),
    }
}
