//! Import clause scanner.
//!
//! Finds module specifiers in JavaScript source without a full parse and
//! reports the byte span of each specifier, so callers can splice in a new
//! value while leaving every other byte untouched.
//!
//! Recognized forms:
//!
//! - `import x from "m"`, `import { a } from "m"`, `import * as ns from "m"`
//! - `import "m"`
//! - `export { a } from "m"`, `export * from "m"`, `export * as ns from "m"`
//! - `import("m")` with a single plain string literal
//!
//! Comments, strings, template literals and regular expression literals are
//! skipped, so specifiers that only appear inside them are never reported.

/// Syntactic form an import clause was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import ... from "m"`.
    Static,
    /// `import "m"`.
    SideEffect,
    /// `export ... from "m"`.
    ExportFrom,
    /// `import("m")`.
    Dynamic,
}

impl ImportKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::SideEffect => "side_effect",
            Self::ExportFrom => "export_from",
            Self::Dynamic => "dynamic",
        }
    }
}

/// One module specifier occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportClause {
    /// Specifier text between the quotes.
    pub specifier: String,
    pub kind: ImportKind,
    /// Byte offset of the first specifier byte (just after the opening quote).
    pub start: usize,
    /// Byte offset of the closing quote.
    pub end: usize,
    /// Quote character used in the source.
    pub quote: char,
    /// `import type` / `export type`, erased by the compiler.
    pub type_only: bool,
}

/// Scan `source` for import clauses, in source order.
///
/// Every occurrence is reported; the same specifier imported twice yields
/// two clauses with distinct spans.
#[must_use]
pub fn scan_import_clauses(source: &str) -> Vec<ImportClause> {
    let mut scanner = Scanner {
        src: source.as_bytes(),
        text: source,
        pos: 0,
        out: Vec::new(),
    };
    scanner.run();
    scanner.out
}

struct Scanner<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    out: Vec<ImportClause>,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Keywords after which `/` starts a regular expression, not a division.
const REGEX_PRECEDING_KEYWORDS: &[&[u8]] = &[
    b"return", b"typeof", b"instanceof", b"in", b"of", b"new", b"delete", b"void", b"throw",
    b"case", b"do", b"else", b"yield", b"await",
];

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn run(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b'/' if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                b'/' if self.regex_allowed() => self.skip_regex(),
                b'\'' | b'"' => {
                    self.skip_string();
                }
                b'`' => self.skip_template(),
                b'i' if self.at_keyword("import") => {
                    self.pos += 6;
                    self.scan_import();
                }
                b'e' if self.at_keyword("export") => {
                    self.pos += 6;
                    self.scan_export();
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Keyword at `pos` with word boundaries on both sides. A preceding `.`
    /// also disqualifies it (`obj.import`).
    fn at_keyword(&self, kw: &str) -> bool {
        let kw = kw.as_bytes();
        if !self.src[self.pos..].starts_with(kw) {
            return false;
        }
        if self.pos > 0 {
            let prev = self.src[self.pos - 1];
            if is_ident_byte(prev) || prev == b'.' {
                return false;
            }
        }
        !matches!(self.src.get(self.pos + kw.len()), Some(&b) if is_ident_byte(b))
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while self.pos < self.src.len() {
            if self.src[self.pos] == b'*' && self.peek_at(1) == Some(b'/') {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                _ => return,
            }
        }
    }

    /// Read a `'` or `"` literal at `pos`. Returns the content span and
    /// leaves `pos` after the closing quote. Unterminated literals (newline
    /// or EOF) return `None`.
    fn read_string(&mut self) -> Option<(usize, usize, char)> {
        let quote = self.peek()?;
        let start = self.pos + 1;
        let mut i = start;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' => i += 2,
                b'\n' => {
                    self.pos = i;
                    return None;
                }
                b if b == quote => {
                    self.pos = i + 1;
                    return Some((start, i, quote as char));
                }
                _ => i += 1,
            }
        }
        self.pos = self.src.len();
        None
    }

    fn skip_string(&mut self) {
        let _ = self.read_string();
    }

    fn skip_template(&mut self) {
        self.pos += 1;
        while let Some(b) = self.peek() {
            match b {
                b'\\' => self.pos += 2,
                b'`' => {
                    self.pos += 1;
                    return;
                }
                b'$' if self.peek_at(1) == Some(b'{') => {
                    self.pos += 2;
                    self.skip_braced(1);
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Skip until `depth` unmatched `}` have been consumed.
    fn skip_braced(&mut self, mut depth: usize) {
        while let Some(b) = self.peek() {
            match b {
                b'{' => {
                    depth += 1;
                    self.pos += 1;
                }
                b'}' => {
                    depth -= 1;
                    self.pos += 1;
                    if depth == 0 {
                        return;
                    }
                }
                b'\'' | b'"' => self.skip_string(),
                b'`' => self.skip_template(),
                b'/' if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                b'/' if self.regex_allowed() => self.skip_regex(),
                _ => self.pos += 1,
            }
        }
    }

    /// Whether a `/` at `pos` opens a regular expression literal, judged by
    /// the previous non-whitespace token.
    fn regex_allowed(&self) -> bool {
        let before = &self.src[..self.pos];
        let Some(last) = before.iter().rposition(|b| !b.is_ascii_whitespace()) else {
            return true;
        };
        let prev = before[last];
        if is_ident_byte(prev) {
            let start = before[..=last]
                .iter()
                .rposition(|&b| !is_ident_byte(b))
                .map_or(0, |i| i + 1);
            let word = &before[start..=last];
            let is_member = start > 0 && before[start - 1] == b'.';
            return !is_member && REGEX_PRECEDING_KEYWORDS.contains(&word);
        }
        !matches!(prev, b')' | b']' | b'\'' | b'"' | b'`')
    }

    /// Skip a regular expression literal and its flags. Stops at a newline
    /// when the literal is unterminated.
    fn skip_regex(&mut self) {
        self.pos += 1;
        let mut in_class = false;
        while let Some(b) = self.peek() {
            match b {
                b'\\' => self.pos += 2,
                b'\n' => return,
                b'[' => {
                    in_class = true;
                    self.pos += 1;
                }
                b']' => {
                    in_class = false;
                    self.pos += 1;
                }
                b'/' if !in_class => {
                    self.pos += 1;
                    while matches!(self.peek(), Some(b) if is_ident_byte(b)) {
                        self.pos += 1;
                    }
                    return;
                }
                _ => self.pos += 1,
            }
        }
    }

    fn push(&mut self, span: (usize, usize, char), kind: ImportKind, type_only: bool) {
        let (start, end, quote) = span;
        self.out.push(ImportClause {
            specifier: self.text[start..end].to_string(),
            kind,
            start,
            end,
            quote,
            type_only,
        });
    }

    fn at_quote(&self) -> bool {
        matches!(self.peek(), Some(b'\'' | b'"'))
    }

    /// Expect `from "m"` at `pos` (after trivia).
    fn read_from_clause(&mut self) -> Option<(usize, usize, char)> {
        self.skip_trivia();
        if !self.at_keyword("from") {
            return None;
        }
        self.pos += 4;
        self.skip_trivia();
        if !self.at_quote() {
            return None;
        }
        self.read_string()
    }

    fn scan_import(&mut self) {
        self.skip_trivia();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                self.skip_trivia();
                if !self.at_quote() {
                    return;
                }
                if let Some(span) = self.read_string() {
                    self.skip_trivia();
                    if matches!(self.peek(), Some(b')' | b',')) {
                        self.push(span, ImportKind::Dynamic, false);
                    }
                }
            }
            Some(b'\'' | b'"') => {
                if let Some(span) = self.read_string() {
                    self.push(span, ImportKind::SideEffect, false);
                }
            }
            Some(b) if is_ident_byte(b) || b == b'{' || b == b'*' => {
                let type_only = self.eat_type_modifier();
                if self.skip_import_bindings() {
                    if let Some(span) = self.read_from_clause() {
                        self.push(span, ImportKind::Static, type_only);
                    }
                }
            }
            _ => {}
        }
    }

    /// Consume a leading `type` modifier. `import type from "m"` and
    /// `import type, { a } from "m"` bind a default named `type` instead.
    fn eat_type_modifier(&mut self) -> bool {
        if !self.at_keyword("type") {
            return false;
        }
        let save = self.pos;
        self.pos += 4;
        self.skip_trivia();
        if self.at_keyword("from") || self.peek() == Some(b',') {
            self.pos = save;
            return false;
        }
        true
    }

    /// Skip the binding list of a static import up to (not including) `from`.
    /// Returns `false` on anything that cannot appear in a binding list.
    fn skip_import_bindings(&mut self) -> bool {
        loop {
            self.skip_trivia();
            match self.peek() {
                None => return false,
                Some(b'{') => {
                    self.pos += 1;
                    self.skip_braced(1);
                }
                Some(b',' | b'*') => self.pos += 1,
                Some(_) if self.at_keyword("from") => return true,
                Some(b) if is_ident_byte(b) => {
                    while matches!(self.peek(), Some(b) if is_ident_byte(b)) {
                        self.pos += 1;
                    }
                }
                Some(_) => return false,
            }
        }
    }

    fn scan_export(&mut self) {
        self.skip_trivia();
        let mut type_only = false;
        if self.at_keyword("type") {
            self.pos += 4;
            self.skip_trivia();
            type_only = true;
        }

        match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                self.skip_trivia();
                if self.at_keyword("as") {
                    self.pos += 2;
                    self.skip_trivia();
                    if self.at_quote() {
                        self.skip_string();
                    } else {
                        while matches!(self.peek(), Some(b) if is_ident_byte(b)) {
                            self.pos += 1;
                        }
                    }
                }
            }
            Some(b'{') => {
                self.pos += 1;
                self.skip_braced(1);
            }
            _ => return,
        }

        if let Some(span) = self.read_from_clause() {
            self.push(span, ImportKind::ExportFrom, type_only);
        }
    }
}
