//! Balanced-delimiter scanner for SavedVariables documents.
//!
//! This is not a Lua parser. It recognizes the shapes the WoW client writes
//! (`Name = { ... }` assignments holding nested table constructors with
//! scalar leaves) and records, for every `{ ... }` region, its exact byte
//! range, nesting depth, the key it was opened under, and its direct entries.
//! Quoted strings, long brackets and comments are lexed out before delimiter
//! counting so braces inside them never move a span boundary.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::layout::ByteRange;

pub type SpanId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    Index(i64),
}

impl Key {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Key::Name(name) => Some(name),
            Key::Index(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => f.write_str(name),
            Key::Index(index) => write!(f, "[{index}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Table(SpanId),
    Str(String),
    Number(String),
    Bool(bool),
    Nil,
    /// Anything the scanner does not model; kept only as its byte range.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    /// True for array-style elements that carry no explicit key.
    pub positional: bool,
    pub key_range: Option<ByteRange>,
    pub value: Value,
    pub value_range: ByteRange,
    /// From the key (or the value, for positional elements) to the value end.
    pub range: ByteRange,
    /// Offset just past the trailing `,` or `;`, when present.
    pub separator_end: Option<usize>,
}

impl Entry {
    pub fn table(&self) -> Option<SpanId> {
        match self.value {
            Value::Table(id) => Some(id),
            _ => None,
        }
    }

    pub fn end_with_separator(&self) -> usize {
        self.separator_end.unwrap_or(self.range.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// From `{` through the matching `}`.
    pub range: ByteRange,
    pub depth: usize,
    pub key: Key,
    pub parent: Option<SpanId>,
    pub children: Vec<SpanId>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("unterminated string starting at byte {offset}")]
    UnterminatedString { offset: usize },
    #[error("unterminated long comment starting at byte {offset}")]
    UnterminatedComment { offset: usize },
    #[error("unexpected {found} at byte {offset}, expected {expected}")]
    Unexpected {
        offset: usize,
        found: String,
        expected: &'static str,
    },
    #[error("unbalanced '}}' at byte {offset}")]
    UnbalancedClose { offset: usize },
    #[error("table `{path}` opened at byte {offset} is never closed")]
    Unclosed { path: String, offset: usize },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error("invalid escape `{escape}` at byte {offset}")]
    InvalidEscape { offset: usize, escape: String },
}

/// Raw document text plus every table span discovered in it.
#[derive(Debug, Clone)]
pub struct Document {
    text: String,
    spans: Vec<Span>,
    globals: Vec<Entry>,
}

impl Document {
    pub fn scan(text: impl Into<String>) -> Result<Self, ScanError> {
        let text = text.into();
        let tokens = Lexer::new(&text).tokenize()?;
        let (spans, globals) = Builder::new(&tokens).build(&text)?;
        debug!(
            bytes = text.len(),
            spans = spans.len(),
            globals = globals.len(),
            "scanned document"
        );
        Ok(Self {
            text,
            spans,
            globals,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn span(&self, id: SpanId) -> &Span {
        &self.spans[id]
    }

    pub fn slice(&self, range: ByteRange) -> &str {
        &self.text[range.start..range.end]
    }

    /// Top-level `Name = value` assignments, in document order.
    pub fn globals(&self) -> &[Entry] {
        &self.globals
    }

    pub fn global(&self, name: &str) -> Option<&Entry> {
        self.globals
            .iter()
            .find(|entry| entry.key.as_name() == Some(name))
    }

    pub fn entry(&self, span: SpanId, key: &str) -> Option<&Entry> {
        self.spans[span]
            .entries
            .iter()
            .find(|entry| !entry.positional && entry.key.as_name() == Some(key))
    }

    pub fn child_table(&self, span: SpanId, key: &str) -> Option<SpanId> {
        self.entry(span, key).and_then(Entry::table)
    }

    /// Resolves a literal key path (global name first) to its table span.
    pub fn lookup(&self, path: &[&str]) -> Option<SpanId> {
        let (first, rest) = path.split_first()?;
        let mut current = self.global(first)?.table()?;
        for key in rest {
            current = self.child_table(current, key)?;
        }
        Some(current)
    }

    pub fn key_path(&self, span: SpanId) -> Vec<Key> {
        let mut keys = Vec::new();
        let mut current = Some(span);
        while let Some(id) = current {
            keys.push(self.spans[id].key.clone());
            current = self.spans[id].parent;
        }
        keys.reverse();
        keys
    }

    pub fn key_path_string(&self, span: SpanId) -> String {
        join_keys(&self.key_path(span))
    }

    /// Leading whitespace of the line holding `offset`, if nothing but
    /// whitespace precedes `offset` on that line.
    pub fn line_indent(&self, offset: usize) -> Option<&str> {
        let line_start = line_start(&self.text, offset);
        let prefix = &self.text[line_start..offset];
        prefix
            .bytes()
            .all(|b| b == b' ' || b == b'\t')
            .then_some(prefix)
    }

    /// Leading whitespace of the line holding `offset`, regardless of what follows it.
    pub fn leading_indent(&self, offset: usize) -> &str {
        let start = line_start(&self.text, offset);
        let line = &self.text[start..];
        let width = line
            .bytes()
            .take_while(|&b| b == b' ' || b == b'\t')
            .count();
        &line[..width]
    }

    /// Byte range to delete so an entry disappears together with its
    /// separator, trailing comment and line break when it owns whole lines.
    pub fn removal_range(&self, entry: &Entry) -> ByteRange {
        let bytes = self.text.as_bytes();
        let mut end = entry.end_with_separator();

        if self.line_indent(entry.range.start).is_none() {
            return ByteRange::new(entry.range.start, end);
        }

        let mut cursor = end;
        while cursor < bytes.len() && (bytes[cursor] == b' ' || bytes[cursor] == b'\t') {
            cursor += 1;
        }
        if self.text[cursor..].starts_with("--") && !self.text[cursor..].starts_with("--[") {
            while cursor < bytes.len() && bytes[cursor] != b'\n' {
                cursor += 1;
            }
        }
        if cursor < bytes.len() && bytes[cursor] == b'\r' {
            cursor += 1;
        }
        if cursor < bytes.len() && bytes[cursor] == b'\n' {
            end = cursor + 1;
        } else if cursor == bytes.len() {
            end = cursor;
        } else {
            return ByteRange::new(entry.range.start, entry.end_with_separator());
        }

        ByteRange::new(line_start(&self.text, entry.range.start), end)
    }
}

pub fn join_keys(keys: &[Key]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn line_start(text: &str, offset: usize) -> usize {
    text[..offset].rfind('\n').map_or(0, |i| i + 1)
}

// --- Lexing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Assign,
    Separator,
    Str,
    Number,
    Name,
    Minus,
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    range: ByteRange,
    /// Decoded string contents, number text or identifier.
    text: String,
}

impl Token {
    fn describe(&self) -> String {
        match self.kind {
            TokenKind::Str => format!("string {:?}", self.text),
            TokenKind::Name | TokenKind::Number | TokenKind::Other => {
                format!("`{}`", self.text)
            }
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::Separator => format!("'{}'", self.text),
            TokenKind::Minus => "'-'".to_string(),
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ScanError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn next_token(&mut self) -> Result<Option<Token>, ScanError> {
        self.skip_trivia()?;
        let Some(b) = self.peek_at(0) else {
            return Ok(None);
        };
        let start = self.pos;

        let simple = |kind, len: usize, lexer: &mut Self| {
            lexer.pos += len;
            Token {
                kind,
                range: ByteRange::new(start, start + len),
                text: lexer.src[start..start + len].to_string(),
            }
        };

        let token = match b {
            b'{' => simple(TokenKind::LBrace, 1, self),
            b'}' => simple(TokenKind::RBrace, 1, self),
            b']' => simple(TokenKind::RBracket, 1, self),
            b',' | b';' => simple(TokenKind::Separator, 1, self),
            b'=' if self.peek_at(1) == Some(b'=') => simple(TokenKind::Other, 2, self),
            b'=' => simple(TokenKind::Assign, 1, self),
            b'-' => simple(TokenKind::Minus, 1, self),
            b'"' | b'\'' => self.quoted_string(b)?,
            b'[' => match self.long_bracket_level() {
                Some(level) => {
                    let text = self.long_bracket_body(level, start, false)?;
                    Token {
                        kind: TokenKind::Str,
                        range: ByteRange::new(start, self.pos),
                        text,
                    }
                }
                None => simple(TokenKind::LBracket, 1, self),
            },
            b'0'..=b'9' => self.number(),
            b'.' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => self.number(),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while matches!(self.peek_at(0), Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_'))
                {
                    self.pos += 1;
                }
                Token {
                    kind: TokenKind::Name,
                    range: ByteRange::new(start, self.pos),
                    text: self.src[start..self.pos].to_string(),
                }
            }
            _ => {
                let width = self.src[start..]
                    .chars()
                    .next()
                    .map_or(1, char::len_utf8);
                simple(TokenKind::Other, width, self)
            }
        };

        Ok(Some(token))
    }

    fn skip_trivia(&mut self) -> Result<(), ScanError> {
        loop {
            match self.peek_at(0) {
                Some(b' ' | b'\t' | b'\r' | b'\n') => self.pos += 1,
                // UTF-8 byte order mark
                Some(0xEF) if self.src[self.pos..].starts_with('\u{feff}') => self.pos += 3,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    let start = self.pos;
                    self.pos += 2;
                    if self.peek_at(0) == Some(b'[')
                        && let Some(level) = self.long_bracket_level()
                    {
                        self.long_bracket_body(level, start, true)?;
                    } else {
                        while let Some(b) = self.peek_at(0) {
                            if b == b'\n' {
                                break;
                            }
                            self.pos += 1;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// If the cursor sits on `[` `=`* `[`, returns the number of `=`.
    fn long_bracket_level(&self) -> Option<usize> {
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        (self.peek_at(1 + level) == Some(b'[')).then_some(level)
    }

    fn long_bracket_body(
        &mut self,
        level: usize,
        start: usize,
        comment: bool,
    ) -> Result<String, ScanError> {
        self.pos += level + 2;
        if self.peek_at(0) == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek_at(0) == Some(b'\n') {
            self.pos += 1;
        }
        let close = format!("]{}]", "=".repeat(level));
        match self.src[self.pos..].find(&close) {
            Some(rel) => {
                let body = self.src[self.pos..self.pos + rel].to_string();
                self.pos += rel + close.len();
                Ok(body)
            }
            None if comment => Err(ScanError::UnterminatedComment { offset: start }),
            None => Err(ScanError::UnterminatedString { offset: start }),
        }
    }

    /// Escape text runs from `start` up to the cursor.
    fn invalid_escape(&self, start: usize) -> ScanError {
        let end = (start..=self.pos)
            .rev()
            .find(|&i| self.src.is_char_boundary(i))
            .unwrap_or(start);
        ScanError::InvalidEscape {
            offset: start,
            escape: self.src[start..end].to_string(),
        }
    }

    fn quoted_string(&mut self, quote: u8) -> Result<Token, ScanError> {
        let start = self.pos;
        self.pos += 1;
        let mut out: Vec<u8> = Vec::new();

        loop {
            let Some(b) = self.peek_at(0) else {
                return Err(ScanError::UnterminatedString { offset: start });
            };
            match b {
                b'\n' => return Err(ScanError::UnterminatedString { offset: start }),
                b'\\' => {
                    let escape_start = self.pos;
                    self.pos += 1;
                    let Some(esc) = self.peek_at(0) else {
                        return Err(ScanError::UnterminatedString { offset: start });
                    };
                    self.pos += 1;
                    match esc {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'\n' => out.push(b'\n'),
                        b'\r' => {
                            if self.peek_at(0) == Some(b'\n') {
                                self.pos += 1;
                            }
                            out.push(b'\n');
                        }
                        b'0'..=b'9' => {
                            let mut value = u32::from(esc - b'0');
                            for _ in 0..2 {
                                match self.peek_at(0) {
                                    Some(d @ b'0'..=b'9') => {
                                        value = value * 10 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            let byte = u8::try_from(value)
                                .map_err(|_| self.invalid_escape(escape_start))?;
                            out.push(byte);
                        }
                        b'x' => {
                            let digits = self
                                .src
                                .get(self.pos..self.pos + 2)
                                .filter(|d| d.bytes().all(|b| b.is_ascii_hexdigit()));
                            let Some(digits) = digits else {
                                return Err(self.invalid_escape(escape_start));
                            };
                            let byte = u8::from_str_radix(digits, 16)
                                .map_err(|_| self.invalid_escape(escape_start))?;
                            out.push(byte);
                            self.pos += 2;
                        }
                        b'z' => {
                            while let Some(b' ' | b'\t' | b'\r' | b'\n') = self.peek_at(0) {
                                self.pos += 1;
                            }
                        }
                        b'\\' | b'"' | b'\'' => out.push(esc),
                        _ => return Err(self.invalid_escape(escape_start)),
                    }
                }
                _ if b == quote => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }

        Ok(Token {
            kind: TokenKind::Str,
            range: ByteRange::new(start, self.pos),
            text: String::from_utf8_lossy(&out).into_owned(),
        })
    }

    fn number(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.peek_at(0) {
            let exponent_sign = (b == b'+' || b == b'-')
                && matches!(self.bytes.get(self.pos - 1), Some(b'e' | b'E'))
                && !self.src[start..self.pos].starts_with("0x");
            if b.is_ascii_alphanumeric() || b == b'.' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Number,
            range: ByteRange::new(start, self.pos),
            text: self.src[start..self.pos].to_string(),
        }
    }
}

// --- Structure ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Value,
    After,
}

#[derive(Debug)]
struct Pending {
    phase: Phase,
    start: usize,
    key: Option<Key>,
    positional: bool,
    key_range: Option<ByteRange>,
    value: Option<(Value, ByteRange)>,
}

impl Pending {
    fn idle() -> Self {
        Self {
            phase: Phase::Start,
            start: 0,
            key: None,
            positional: false,
            key_range: None,
            value: None,
        }
    }
}

#[derive(Debug)]
struct Frame {
    /// `None` for the top-level statement list.
    span: Option<SpanId>,
    pending: Pending,
    next_position: i64,
}

struct Builder<'t> {
    tokens: &'t [Token],
    index: usize,
    spans: Vec<Span>,
    globals: Vec<Entry>,
    frames: Vec<Frame>,
}

impl<'t> Builder<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self {
            tokens,
            index: 0,
            spans: Vec::new(),
            globals: Vec::new(),
            frames: vec![Frame {
                span: None,
                pending: Pending::idle(),
                next_position: 1,
            }],
        }
    }

    fn peek(&self, ahead: usize) -> Option<&'t Token> {
        self.tokens.get(self.index + ahead)
    }

    fn frame(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn build(mut self, text: &str) -> Result<(Vec<Span>, Vec<Entry>), ScanError> {
        while let Some(token) = self.peek(0) {
            let at_top = self.frames.len() == 1;
            match self.frame().pending.phase {
                Phase::Start if at_top => self.statement_start(token)?,
                Phase::Start => self.entry_start(token)?,
                Phase::Value => self.value(token)?,
                Phase::After => self.after_value(token, at_top)?,
            }
        }

        if self.frames.len() > 1 {
            let open = self.frames.last().and_then(|f| f.span).unwrap_or(0);
            let path = {
                let mut keys = Vec::new();
                let mut current = Some(open);
                while let Some(id) = current {
                    keys.push(self.spans[id].key.clone());
                    current = self.spans[id].parent;
                }
                keys.reverse();
                join_keys(&keys)
            };
            return Err(ScanError::Unclosed {
                path,
                offset: self.spans[open].range.start,
            });
        }
        match self.frames[0].pending.phase {
            Phase::Start => {}
            Phase::After => self.finish_entry(None),
            Phase::Value => return Err(ScanError::UnexpectedEof { expected: "a value" }),
        }

        debug_assert!(self.spans.iter().all(|s| s.range.end <= text.len()));
        Ok((self.spans, self.globals))
    }

    fn unexpected(token: &Token, expected: &'static str) -> ScanError {
        ScanError::Unexpected {
            offset: token.range.start,
            found: token.describe(),
            expected,
        }
    }

    fn statement_start(&mut self, token: &'t Token) -> Result<(), ScanError> {
        match token.kind {
            TokenKind::Separator => {
                self.index += 1;
                Ok(())
            }
            TokenKind::Name => {
                let Some(assign) = self.peek(1) else {
                    return Err(ScanError::UnexpectedEof { expected: "'='" });
                };
                if assign.kind != TokenKind::Assign {
                    return Err(Self::unexpected(assign, "'='"));
                }
                let pending = &mut self.frame().pending;
                pending.phase = Phase::Value;
                pending.start = token.range.start;
                pending.key = Some(Key::Name(token.text.clone()));
                pending.positional = false;
                pending.key_range = Some(token.range);
                self.index += 2;
                Ok(())
            }
            TokenKind::RBrace => Err(ScanError::UnbalancedClose {
                offset: token.range.start,
            }),
            _ => Err(Self::unexpected(token, "a global assignment")),
        }
    }

    fn entry_start(&mut self, token: &'t Token) -> Result<(), ScanError> {
        match token.kind {
            TokenKind::RBrace => {
                self.close_table(token);
                Ok(())
            }
            TokenKind::Separator => Err(Self::unexpected(token, "a table entry")),
            TokenKind::LBracket => {
                let key_token = self
                    .peek(1)
                    .ok_or(ScanError::UnexpectedEof { expected: "a key" })?;
                let (key, consumed) = match key_token.kind {
                    TokenKind::Str => (Key::Name(key_token.text.clone()), 1),
                    TokenKind::Number => (number_key(&key_token.text), 1),
                    TokenKind::Minus => {
                        let digits = self
                            .peek(2)
                            .filter(|t| t.kind == TokenKind::Number)
                            .ok_or_else(|| Self::unexpected(key_token, "a key"))?;
                        (number_key(&format!("-{}", digits.text)), 2)
                    }
                    TokenKind::Name if matches!(key_token.text.as_str(), "true" | "false") => {
                        (Key::Name(key_token.text.clone()), 1)
                    }
                    _ => return Err(Self::unexpected(key_token, "a key")),
                };
                let close = self
                    .peek(1 + consumed)
                    .ok_or(ScanError::UnexpectedEof { expected: "']'" })?;
                if close.kind != TokenKind::RBracket {
                    return Err(Self::unexpected(close, "']'"));
                }
                let assign = self
                    .peek(2 + consumed)
                    .ok_or(ScanError::UnexpectedEof { expected: "'='" })?;
                if assign.kind != TokenKind::Assign {
                    return Err(Self::unexpected(assign, "'='"));
                }
                let pending = &mut self.frame().pending;
                pending.phase = Phase::Value;
                pending.start = token.range.start;
                pending.key = Some(key);
                pending.positional = false;
                pending.key_range = Some(ByteRange::new(token.range.start, close.range.end));
                self.index += 3 + consumed;
                Ok(())
            }
            TokenKind::Name if self.peek(1).map(|t| t.kind) == Some(TokenKind::Assign) => {
                let pending = &mut self.frame().pending;
                pending.phase = Phase::Value;
                pending.start = token.range.start;
                pending.key = Some(Key::Name(token.text.clone()));
                pending.positional = false;
                pending.key_range = Some(token.range);
                self.index += 2;
                Ok(())
            }
            _ => {
                let frame = self.frame();
                let position = frame.next_position;
                frame.next_position += 1;
                frame.pending.phase = Phase::Value;
                frame.pending.start = token.range.start;
                frame.pending.key = Some(Key::Index(position));
                frame.pending.positional = true;
                frame.pending.key_range = None;
                Ok(())
            }
        }
    }

    fn value(&mut self, token: &'t Token) -> Result<(), ScanError> {
        let (value, range, consumed) = match token.kind {
            TokenKind::LBrace => {
                self.open_table(token);
                return Ok(());
            }
            TokenKind::Str => (Value::Str(token.text.clone()), token.range, 1),
            TokenKind::Number => (Value::Number(token.text.clone()), token.range, 1),
            TokenKind::Minus => match self.peek(1) {
                Some(next) if next.kind == TokenKind::Number => (
                    Value::Number(format!("-{}", next.text)),
                    ByteRange::new(token.range.start, next.range.end),
                    2,
                ),
                _ => self.opaque_value(token),
            },
            TokenKind::Name => match token.text.as_str() {
                "true" => (Value::Bool(true), token.range, 1),
                "false" => (Value::Bool(false), token.range, 1),
                "nil" => (Value::Nil, token.range, 1),
                _ => self.opaque_value(token),
            },
            TokenKind::RBrace | TokenKind::Separator | TokenKind::Assign => {
                return Err(Self::unexpected(token, "a value"));
            }
            _ => self.opaque_value(token),
        };
        self.index += consumed;
        let pending = &mut self.frame().pending;
        pending.value = Some((value, range));
        pending.phase = Phase::After;
        Ok(())
    }

    /// Consumes an expression the scanner does not model, up to the next
    /// separator or closing brace at this level.
    fn opaque_value(&self, first: &Token) -> (Value, ByteRange, usize) {
        let mut consumed = 0;
        let mut end = first.range.end;
        while let Some(token) = self.peek(consumed) {
            if matches!(
                token.kind,
                TokenKind::Separator | TokenKind::RBrace | TokenKind::LBrace
            ) {
                break;
            }
            if consumed > 0 && self.frames.len() == 1 && token.kind == TokenKind::Name {
                // next top-level statement
                if self.peek(consumed + 1).map(|t| t.kind) == Some(TokenKind::Assign) {
                    break;
                }
            }
            end = token.range.end;
            consumed += 1;
        }
        (
            Value::Other,
            ByteRange::new(first.range.start, end),
            consumed.max(1),
        )
    }

    fn after_value(&mut self, token: &'t Token, at_top: bool) -> Result<(), ScanError> {
        match token.kind {
            TokenKind::Separator => {
                self.finish_entry(Some(token.range.end));
                self.index += 1;
                Ok(())
            }
            TokenKind::RBrace if !at_top => {
                self.finish_entry(None);
                self.close_table(token);
                Ok(())
            }
            TokenKind::RBrace => Err(ScanError::UnbalancedClose {
                offset: token.range.start,
            }),
            TokenKind::Name if at_top => {
                self.finish_entry(None);
                Ok(())
            }
            _ => Err(Self::unexpected(token, "',' or '}'")),
        }
    }

    fn open_table(&mut self, token: &Token) {
        let depth = self.frames.len() - 1;
        let parent = self.frames.last().and_then(|f| f.span);
        let key = self
            .frame()
            .pending
            .key
            .clone()
            .unwrap_or(Key::Index(0));
        let id = self.spans.len();
        self.spans.push(Span {
            range: ByteRange::new(token.range.start, token.range.start),
            depth,
            key,
            parent,
            children: Vec::new(),
            entries: Vec::new(),
        });
        if let Some(parent) = parent {
            self.spans[parent].children.push(id);
        }
        self.frames.push(Frame {
            span: Some(id),
            pending: Pending::idle(),
            next_position: 1,
        });
        self.index += 1;
    }

    fn close_table(&mut self, token: &Token) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let Some(id) = frame.span else {
            return;
        };
        self.spans[id].range.end = token.range.end;
        let range = self.spans[id].range;
        let pending = &mut self.frame().pending;
        pending.value = Some((Value::Table(id), range));
        pending.phase = Phase::After;
        self.index += 1;
    }

    fn finish_entry(&mut self, separator_end: Option<usize>) {
        let frame = self.frame();
        let pending = std::mem::replace(&mut frame.pending, Pending::idle());
        let span = frame.span;
        let (Some(key), Some((value, value_range))) = (pending.key, pending.value) else {
            return;
        };
        let entry = Entry {
            key,
            positional: pending.positional,
            key_range: pending.key_range,
            value,
            value_range,
            range: ByteRange::new(pending.start, value_range.end),
            separator_end,
        };
        match span {
            Some(id) => self.spans[id].entries.push(entry),
            None => self.globals.push(entry),
        }
    }
}

fn number_key(text: &str) -> Key {
    text.parse::<i64>()
        .map(Key::Index)
        .unwrap_or_else(|_| Key::Name(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\nTradeSkillMasterDB = {\n\t[\"profiles\"] = {\n\t\t[\"Default\"] = {\n\t\t\t[\"groups\"] = {\n\t\t\t\t[\"Weapons\"] = {\n\t\t\t\t},\n\t\t\t},\n\t\t},\n\t},\n}\nOtherDB = nil\n";

    #[test]
    fn finds_nested_spans_by_key_path() {
        let doc = Document::scan(SAMPLE).expect("scan");
        let groups = doc
            .lookup(&["TradeSkillMasterDB", "profiles", "Default", "groups"])
            .expect("groups span");
        let span = doc.span(groups);
        assert_eq!(span.depth, 3);
        assert!(doc.slice(span.range).starts_with('{'));
        assert!(doc.slice(span.range).ends_with('}'));
        assert_eq!(span.entries.len(), 1);
        assert_eq!(span.entries[0].key, Key::Name("Weapons".to_string()));
        assert_eq!(
            doc.key_path_string(groups),
            "TradeSkillMasterDB.profiles.Default.groups"
        );
        assert!(doc.global("OtherDB").is_some());
    }

    #[test]
    fn ignores_braces_inside_strings_and_comments() {
        let text = "X = {\n\t[\"a}{\"] = \"}}}\", -- }\n\t--[[ { ]]\n\t[\"b\"] = [==[ { ]==],\n\t['c\\'}'] = {\n\t},\n}\n";
        let doc = Document::scan(text).expect("scan");
        let root = doc.lookup(&["X"]).expect("root");
        let span = doc.span(root);
        assert_eq!(span.range, ByteRange::new(4, text.len() - 1));
        let keys: Vec<_> = span.entries.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["a}{", "b", "c'}"]);
        assert_eq!(span.entries[0].value, Value::Str("}}}".to_string()));
        assert!(doc.child_table(root, "c'}").is_some());
    }

    #[test]
    fn tolerates_bare_keys_and_missing_trailing_comma() {
        let text = "X = { a = 1, b = { 1, 2 }; [3] = -4 }";
        let doc = Document::scan(text).expect("scan");
        let root = doc.lookup(&["X"]).expect("root");
        let entries = &doc.span(root).entries;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].key, Key::Index(3));
        assert_eq!(entries[2].value, Value::Number("-4".to_string()));
        assert_eq!(entries[2].separator_end, None);
        let b = doc.child_table(root, "b").expect("b");
        let items = &doc.span(b).entries;
        assert!(items.iter().all(|e| e.positional));
        assert_eq!(items[1].key, Key::Index(2));
    }

    #[test]
    fn reports_unclosed_table_with_its_path() {
        let text = "X = {\n\t[\"a\"] = {\n\t\t[\"b\"] = {\n\t},\n}\n";
        let err = Document::scan(text).expect_err("unbalanced");
        match err {
            ScanError::Unclosed { path, .. } => assert_eq!(path, "X"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn reports_stray_closing_brace() {
        let err = Document::scan("X = {\n}\n}\n").expect_err("unbalanced");
        assert!(matches!(err, ScanError::UnbalancedClose { offset: 8 }));
    }

    #[test]
    fn reports_unterminated_string() {
        let err = Document::scan("X = { \"abc }").expect_err("string");
        assert!(matches!(err, ScanError::UnterminatedString { offset: 6 }));
    }

    #[test]
    fn decodes_hex_and_whitespace_skip_escapes() {
        let doc = Document::scan("X = { \"\\x41\\z  \n  B\\065\" }").expect("scan");
        let root = doc.lookup(&["X"]).expect("root");
        assert_eq!(doc.span(root).entries[0].value, Value::Str("ABA".to_string()));
    }

    #[test]
    fn rejects_out_of_range_and_unknown_escapes() {
        let err = Document::scan("X = { \"a\\300\" }").expect_err("decimal escape");
        match err {
            ScanError::InvalidEscape { offset, escape } => {
                assert_eq!(offset, 8);
                assert_eq!(escape, "\\300");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let err = Document::scan("X = { \"\\xZ1\" }").expect_err("hex escape");
        assert!(matches!(err, ScanError::InvalidEscape { offset: 7, .. }));
        let err = Document::scan("X = { \"\\q\" }").expect_err("unknown escape");
        assert!(matches!(err, ScanError::InvalidEscape { offset: 7, .. }));
    }

    #[test]
    fn removal_range_covers_whole_lines() {
        let text = "X = {\n\t[\"a\"] = 1,\n\t[\"b\"] = 2, -- [2]\n}\n";
        let doc = Document::scan(text).expect("scan");
        let root = doc.lookup(&["X"]).expect("root");
        let b = doc.entry(root, "b").expect("b").clone();
        let range = doc.removal_range(&b);
        assert_eq!(doc.slice(range), "\t[\"b\"] = 2, -- [2]\n");
    }
}
