//! Bracket alternation: `I [eat|like] [|hot]dogs` expands to every combination.

use std::ops::Range;

use pipescript_types::{ParseError, ParseErrorKind};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    /// Each option is a `Group`.
    Choice(Vec<Node>),
    Group(Vec<Node>),
}

impl Node {
    fn count(&self) -> usize {
        match self {
            Node::Text(_) => 1,
            Node::Choice(options) => options
                .iter()
                .fold(0usize, |acc, o| acc.saturating_add(o.count())),
            Node::Group(parts) => parts
                .iter()
                .fold(1usize, |acc, p| acc.saturating_mul(p.count())),
        }
    }

    fn expand(&self) -> Vec<String> {
        match self {
            Node::Text(text) => vec![text.clone()],
            Node::Choice(options) => options.iter().flat_map(Node::expand).collect(),
            Node::Group(parts) => {
                // The first part varies fastest.
                let mut acc = vec![String::new()];
                for part in parts {
                    let suffixes = part.expand();
                    acc = suffixes
                        .iter()
                        .flat_map(|suffix| acc.iter().map(move |prefix| format!("{prefix}{suffix}")))
                        .collect();
                }
                acc
            }
        }
    }

    fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self {
            Node::Text(text) => text.clone(),
            Node::Choice(options) => {
                let total = self.count();
                let mut pick = rng.random_range(0..total.max(1));
                for option in options {
                    let weight = option.count();
                    if pick < weight {
                        return option.random(rng);
                    }
                    pick -= weight;
                }
                String::new()
            }
            Node::Group(parts) => parts.iter().map(|p| p.random(rng)).collect(),
        }
    }
}

/// A parsed bracket expression.
///
/// `~[`, `~|` and `~]` produce a literal `[`, `|` or `]`. Other `~`s are kept
/// as they are, so escapes meant for the templated string grammar survive.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceTree {
    root: Node,
    random: bool,
}

impl ChoiceTree {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Self::parse_protected(text, &[], false)
    }

    /// Parse with flag support: a leading `[?]` means only one random
    /// expansion is produced.
    pub fn parse_with_flags(text: &str) -> Result<Self, ParseError> {
        Self::parse_protected(text, &[], true)
    }

    /// Parse `text`, treating each byte range in `protected` as opaque literal text.
    pub fn parse_protected(
        text: &str,
        protected: &[Range<usize>],
        parse_flags: bool,
    ) -> Result<Self, ParseError> {
        let (random, start) = if parse_flags && text.starts_with("[?]") {
            (true, 3)
        } else {
            (false, 0)
        };
        let mut parser = TreeParser {
            text,
            pos: start,
            protected,
        };
        let root = parser.group(0)?;
        Ok(Self { root, random })
    }

    /// Number of distinct expansions.
    pub fn count(&self) -> usize {
        self.root.count()
    }

    pub fn is_random(&self) -> bool {
        self.random
    }

    /// Every expansion in order, or a single random one if the `[?]` flag was given.
    pub fn expand(&self) -> Vec<String> {
        if self.random {
            vec![self.root.random(&mut rand::rng())]
        } else {
            self.root.expand()
        }
    }

    pub fn random_with<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.root.random(rng)
    }
}

struct TreeParser<'a> {
    text: &'a str,
    pos: usize,
    protected: &'a [Range<usize>],
}

impl TreeParser<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn error(&self, offset: usize, message: &str, kind: ParseErrorKind) -> ParseError {
        ParseError::new(self.text, offset, message, kind)
    }

    /// Parse a sequence of text and choices, stopping before `|`, `]` or the end.
    fn group(&mut self, depth: usize) -> Result<Node, ParseError> {
        let mut parts = Vec::new();
        let mut text = String::new();

        while let Some(c) = self.peek() {
            if let Some(span) = self.protected.iter().find(|r| r.start == self.pos) {
                text.push_str(&self.text[span.clone()]);
                self.pos = span.end;
                continue;
            }
            match c {
                '~' => {
                    let next = self.text[self.pos + 1..].chars().next();
                    match next {
                        Some(e @ ('[' | '|' | ']')) => {
                            text.push(e);
                            self.pos += 2;
                        }
                        Some('~') => {
                            text.push_str("~~");
                            self.pos += 2;
                        }
                        _ => {
                            text.push('~');
                            self.pos += 1;
                        }
                    }
                }
                '[' => {
                    if !text.is_empty() {
                        parts.push(Node::Text(std::mem::take(&mut text)));
                    }
                    parts.push(self.choice(depth + 1)?);
                }
                '|' | ']' if depth == 0 => {
                    return Err(self.error(
                        self.pos,
                        &format!("Unexpected `{c}` outside of brackets"),
                        ParseErrorKind::InvalidSyntax,
                    ));
                }
                '|' | ']' => break,
                c => {
                    text.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }

        if !text.is_empty() || parts.is_empty() {
            parts.push(Node::Text(text));
        }
        Ok(Node::Group(parts))
    }

    fn choice(&mut self, depth: usize) -> Result<Node, ParseError> {
        let open = self.pos;
        self.pos += 1;
        let mut options = vec![self.group(depth)?];
        loop {
            match self.peek() {
                Some('|') => {
                    self.pos += 1;
                    options.push(self.group(depth)?);
                }
                Some(']') => {
                    self.pos += 1;
                    return Ok(Node::Choice(options));
                }
                _ => {
                    return Err(self.error(open, "Expected `]`", ParseErrorKind::Unclosed));
                }
            }
        }
    }
}
