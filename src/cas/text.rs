//! # Engine Text Helpers
//!
//! Small string utilities shared by the protocol codec, the key/value parser and
//! the state machinery. The engine's textual syntax is only ever split on
//! structure after string literals have been masked, so commas, brackets and
//! semicolons inside strings never confuse the splitter.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\[STR:(\d+)\]").unwrap();
}

/// Converts a host string into an engine string literal.
///
/// Backslashes and double quotes are escaped, and the result is wrapped in
/// double quotes.
pub fn to_engine_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Inverse of [`to_engine_string`]. Returns `None` when the input is not a
/// quoted engine string.
pub fn from_engine_string(literal: &str) -> Option<String> {
    let inner = literal.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Text whose string literals have been replaced by `[STR:n]` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedText {
    masked: String,
    strings: Vec<String>,
}

impl MaskedText {
    /// Masks every double-quoted string literal in `source`.
    ///
    /// The stored literal keeps its escape sequences, so restoring it with
    /// quotes reproduces the original source byte for byte. An unterminated
    /// literal is masked up to the end of the input.
    pub fn new(source: &str) -> Self {
        let mut masked = String::with_capacity(source.len());
        let mut strings = Vec::new();
        let mut chars = source.chars();

        while let Some(c) = chars.next() {
            if c != '"' {
                masked.push(c);
                continue;
            }
            let mut literal = String::new();
            while let Some(inner) = chars.next() {
                match inner {
                    '\\' => {
                        literal.push(inner);
                        if let Some(escaped) = chars.next() {
                            literal.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => literal.push(inner),
                }
            }
            masked.push_str(&placeholder(strings.len()));
            strings.push(literal);
        }

        Self { masked, strings }
    }

    pub fn masked(&self) -> &str {
        &self.masked
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn has_strings(&self) -> bool {
        !self.strings.is_empty()
    }

    /// Puts the masked literals back into `fragment`.
    ///
    /// With `quoted` the literals come back as engine strings; without, only
    /// their (unescaped) contents are inserted.
    pub fn restore(&self, fragment: &str, quoted: bool) -> String {
        // One pass, so placeholder text inside a restored literal stays as is.
        PLACEHOLDER
            .replace_all(fragment, |caps: &Captures| {
                let literal = caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| self.strings.get(index));
                match literal {
                    Some(literal) if quoted => format!("\"{}\"", literal),
                    Some(literal) => from_engine_string(&format!("\"{}\"", literal))
                        .unwrap_or_else(|| literal.clone()),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

fn placeholder(index: usize) -> String {
    format!("[STR:{}]", index)
}

/// Splits `source` on `separator` at bracket depth zero.
///
/// Parentheses, square brackets and braces all nest. Double-quoted strings are
/// skipped, although callers normally mask them first. Items are trimmed and
/// empty items are kept so that argument counts stay honest.
pub fn split_top_level(source: &str, separator: char) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth: i32 = 0;
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in source.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            c if c == separator && depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !items.is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// Splits an engine list literal `[a, b, ...]` into its top-level items.
///
/// Input without surrounding brackets is split as is.
pub fn split_list(source: &str) -> Vec<String> {
    let trimmed = source.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    if inner.trim().is_empty() {
        return Vec::new();
    }
    split_top_level(inner, ',')
}

/// Finds the index of the parenthesis closing the one at `open`.
pub fn matching_paren(source: &str, open: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    for (offset, b) in bytes[open..].iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Removes `/* ... */` comments. An unterminated comment runs to the end.
pub fn remove_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}
