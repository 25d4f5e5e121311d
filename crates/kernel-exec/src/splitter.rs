//! Splitting scripts into top-level code units.
//!
//! A unit is one top-level statement together with everything that belongs
//! to it: its indented body, decorators, continuation clauses
//! (`elif`/`else`/`except`/`finally`), bracketed or backslash continuation
//! lines, and triple-quoted strings spanning lines.

use rustpython_parser::{ast, Parse};

use crate::unit::{CodeUnit, UnitKind};

/// Script could not be split because it is not well formed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    /// 1-based line where the problem was detected.
    pub line: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Turns script text into ordered code units.
pub trait Splitter: Send + Sync {
    fn split(&self, script: &str) -> Result<Vec<CodeUnit>, SyntaxError>;
}

/// Line-oriented splitter for Python source.
///
/// Unit boundaries come from a scanner that tracks brackets, strings and
/// indentation, which also gives precise messages for unbalanced source.
/// The whole script is then parsed once, so a syntax error anywhere
/// rejects it before any unit runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonSplitter;

const CLAUSE_KEYWORDS: [&str; 4] = ["elif", "else", "except", "finally"];

const STATEMENT_KEYWORDS: [&str; 24] = [
    "assert", "async", "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "nonlocal", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

impl Splitter for PythonSplitter {
    fn split(&self, script: &str) -> Result<Vec<CodeUnit>, SyntaxError> {
        let lines: Vec<&str> = script
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();

        let mut scanner = Scanner::default();
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut current: Option<Span> = None;

        for (i, line) in lines.iter().enumerate() {
            let lineno = i + 1;

            if scanner.continues() {
                if let Some(span) = current.as_mut() {
                    span.end = lineno;
                }
                scanner.scan_line(line, lineno)?;
                continue;
            }

            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indented = trimmed.len() != line.len();
            let clause = starts_with_keyword(trimmed, &CLAUSE_KEYWORDS);

            match current.as_mut() {
                Some(span) if indented || clause || span.awaiting_definition => {
                    span.end = lineno;
                    if !indented {
                        span.awaiting_definition = trimmed.starts_with('@');
                    }
                }
                _ if indented => return Err(SyntaxError::new(lineno, "unexpected indent")),
                None if clause => return Err(SyntaxError::new(lineno, "invalid syntax")),
                _ => {
                    if let Some(span) = current.take() {
                        spans.push((span.start, span.end));
                    }
                    current = Some(Span {
                        start: lineno,
                        end: lineno,
                        awaiting_definition: trimmed.starts_with('@'),
                    });
                }
            }

            scanner.scan_line(line, lineno)?;
        }

        scanner.finish(lines.len())?;
        if let Some(span) = current {
            if span.awaiting_definition {
                return Err(SyntaxError::new(
                    span.end,
                    "decorator must be followed by a function or class definition",
                ));
            }
            spans.push((span.start, span.end));
        }
        check_syntax(script)?;

        Ok(spans
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let source = lines[start - 1..end].join("\n");
                let kind = classify(&source);
                CodeUnit {
                    index,
                    line_start: start,
                    line_end: end,
                    source,
                    kind,
                }
            })
            .collect())
    }
}

struct Span {
    start: usize,
    end: usize,
    /// Last top-level line was a decorator; the definition is still to come.
    awaiting_definition: bool,
}

#[derive(Debug, Clone, Copy)]
struct OpenString {
    quote: char,
    triple: bool,
    line: usize,
}

/// Carries bracket and string state from one line to the next.
#[derive(Debug, Default)]
struct Scanner {
    brackets: Vec<(char, usize)>,
    string: Option<OpenString>,
    backslash: bool,
}

impl Scanner {
    /// Next line belongs to the current logical line.
    fn continues(&self) -> bool {
        !self.brackets.is_empty() || self.string.is_some() || self.backslash
    }

    fn scan_line(&mut self, line: &str, lineno: usize) -> Result<(), SyntaxError> {
        let chars: Vec<char> = line.chars().collect();
        self.backslash = false;

        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];

            if let Some(open) = self.string {
                if c == '\\' {
                    if i + 1 == chars.len() {
                        self.backslash = true;
                    }
                    i += 2;
                    continue;
                }
                if c == open.quote && (!open.triple || is_triple(&chars, i, c)) {
                    self.string = None;
                    i += if open.triple { 3 } else { 1 };
                    continue;
                }
                i += 1;
                continue;
            }

            match c {
                '#' => break,
                '"' | '\'' => {
                    let triple = is_triple(&chars, i, c);
                    self.string = Some(OpenString {
                        quote: c,
                        triple,
                        line: lineno,
                    });
                    i += if triple { 3 } else { 1 };
                    continue;
                }
                '(' | '[' | '{' => self.brackets.push((c, lineno)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match self.brackets.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, _)) => {
                            return Err(SyntaxError::new(
                                lineno,
                                format!(
                                    "closing parenthesis '{}' does not match opening parenthesis '{}'",
                                    c, open
                                ),
                            ))
                        }
                        None => {
                            return Err(SyntaxError::new(lineno, format!("unmatched '{}'", c)))
                        }
                    }
                }
                '\\' if i + 1 == chars.len() => self.backslash = true,
                _ => {}
            }
            i += 1;
        }

        if let Some(open) = self.string {
            if !open.triple && !self.backslash {
                return Err(SyntaxError::new(open.line, "unterminated string literal"));
            }
        }
        Ok(())
    }

    fn finish(&self, last_line: usize) -> Result<(), SyntaxError> {
        if let Some(open) = self.string {
            let message = if open.triple {
                "unterminated triple-quoted string literal"
            } else {
                "unterminated string literal"
            };
            return Err(SyntaxError::new(open.line, message));
        }
        if let Some((c, line)) = self.brackets.last() {
            return Err(SyntaxError::new(*line, format!("'{}' was never closed", c)));
        }
        if self.backslash {
            return Err(SyntaxError::new(
                last_line,
                "unexpected EOF while parsing line continuation",
            ));
        }
        Ok(())
    }
}

fn check_syntax(script: &str) -> Result<(), SyntaxError> {
    ast::Suite::parse(script, "<script>")
        .map(|_| ())
        .map_err(|err| {
            let offset = usize::from(err.offset).min(script.len());
            let line = script.as_bytes()[..offset]
                .iter()
                .filter(|&&b| b == b'\n')
                .count()
                + 1;
            SyntaxError::new(line, err.error.to_string())
        })
}

fn is_triple(chars: &[char], i: usize, quote: char) -> bool {
    chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote)
}

fn leading_word(text: &str) -> &str {
    let end = text
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    &text[..end]
}

fn starts_with_keyword(text: &str, keywords: &[&str]) -> bool {
    keywords.contains(&leading_word(text))
}

fn classify(source: &str) -> UnitKind {
    if let Some(text) = markdown_literal(source) {
        return UnitKind::MarkdownLiteral { text };
    }
    if is_expression(source) {
        UnitKind::Expression
    } else {
        UnitKind::Statement
    }
}

/// Heuristic: no statement keyword and no top-level assignment,
/// annotation, block colon or semicolon.
fn is_expression(source: &str) -> bool {
    let first = source.trim_start();
    if first.starts_with('@') || starts_with_keyword(first, &STATEMENT_KEYWORDS) {
        return false;
    }
    let is_lambda = leading_word(first) == "lambda";

    let masked = top_level_chars(source);
    let mut i = 0;
    while i < masked.len() {
        let c = masked[i];
        let prev = if i > 0 { masked[i - 1] } else { ' ' };
        let next = masked.get(i + 1).copied().unwrap_or(' ');
        match c {
            ';' => return false,
            ':' if !is_lambda => return false,
            '=' if next == '=' => {
                i += 2;
                continue;
            }
            '=' if prev == '!' => {}
            '=' if prev == '<' || prev == '>' => {
                // `<<=` and `>>=` assign, `<=` and `>=` compare
                if i >= 2 && masked[i - 2] == prev {
                    return false;
                }
            }
            '=' => return false,
            _ => {}
        }
        i += 1;
    }
    true
}

/// Source with strings, comments and bracketed text blanked out, so that
/// only top-level tokens remain visible.
fn top_level_chars(source: &str) -> Vec<char> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = Vec::with_capacity(chars.len());
    let mut depth = 0usize;
    let mut string: Option<(char, bool)> = None;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if let Some((quote, triple)) = string {
            if c == '\\' {
                out.push(' ');
                i += 1;
                if i < chars.len() {
                    out.push(' ');
                    i += 1;
                }
                continue;
            }
            if c == quote && (!triple || is_triple(&chars, i, c)) {
                let width = if triple { 3 } else { 1 };
                out.extend(std::iter::repeat(' ').take(width));
                string = None;
                i += width;
                continue;
            }
            out.push(' ');
            i += 1;
            continue;
        }

        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '"' | '\'' => {
                let triple = is_triple(&chars, i, c);
                let width = if triple { 3 } else { 1 };
                out.extend(std::iter::repeat(' ').take(width));
                string = Some((c, triple));
                i += width;
                continue;
            }
            '(' | '[' | '{' => {
                depth += 1;
                out.push(' ');
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                out.push(' ');
            }
            _ if depth > 0 => out.push(' '),
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// The decoded text of a unit that is nothing but one plain string literal.
///
/// Raw and `u` prefixes are accepted. f-strings and bytes are left to the
/// kernel, as is anything followed by more tokens.
fn markdown_literal(source: &str) -> Option<String> {
    let text = source.trim();
    let prefix_len = text
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    let raw = match text[..prefix_len].to_ascii_lowercase().as_str() {
        "" | "u" => false,
        "r" => true,
        _ => return None,
    };

    let body = &text[prefix_len..];
    let quote = body.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let triple_delim: String = std::iter::repeat(quote).take(3).collect();
    let delim = if body.starts_with(&triple_delim) {
        triple_delim
    } else {
        quote.to_string()
    };

    let inner = &body[delim.len()..];
    let mut close = None;
    let mut iter = inner.char_indices();
    while let Some((pos, c)) = iter.next() {
        if c == '\\' {
            iter.next();
            continue;
        }
        if inner[pos..].starts_with(&delim) {
            close = Some(pos);
            break;
        }
    }
    let close = close?;
    if close + delim.len() != inner.len() {
        return None;
    }

    let content = &inner[..close];
    let decoded = if raw {
        content.to_string()
    } else {
        unescape(content)
    };
    Some(decoded.trim().to_string())
}

fn unescape(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\n') => {}
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some(q @ ('\\' | '\'' | '"')) => out.push(q),
            Some(kind @ ('x' | 'u' | 'U')) => {
                let width = match kind {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = chars.by_ref().take(width).collect();
                match u32::from_str_radix(&digits, 16)
                    .ok()
                    .and_then(char::from_u32)
                {
                    Some(decoded) if digits.len() == width => out.push(decoded),
                    _ => {
                        out.push('\\');
                        out.push(kind);
                        out.push_str(&digits);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
