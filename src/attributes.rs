//! Parsing for event attribute strings.
//!
//! Attributes are stored as `NAME=VALUE;NAME=VALUE`. Any part may be double-quoted, in which
//! case `;` and `=` lose their meaning and `""` stands for a single quote character.

use std::iter::Peekable;
use std::str::Chars;

use serde::Serialize;

use crate::err::{EtwError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAttribute {
    pub name: String,
    pub value: String,
}

/// Copies unescaped text until an unquoted terminator. Returns the terminator that stopped
/// the scan, or `None` at end of input.
fn scan_until(
    input: &mut Peekable<Chars<'_>>,
    out: &mut String,
    is_end: impl Fn(char) -> bool,
) -> Option<char> {
    while let Some(ch) = input.next() {
        if is_end(ch) {
            return Some(ch);
        }

        if ch != '"' {
            out.push(ch);
            continue;
        }

        // Quoted region.
        while let Some(ch) = input.next() {
            if ch != '"' {
                out.push(ch);
            } else if input.peek() == Some(&'"') {
                out.push('"');
                input.next();
            } else {
                break;
            }
        }
    }
    None
}

/// Iterates `(name, value)` pairs, including pairs where both are empty.
struct AttributeScanner<'a> {
    input: Peekable<Chars<'a>>,
}

impl<'a> AttributeScanner<'a> {
    fn new(attributes: &'a str) -> Self {
        AttributeScanner {
            input: attributes.chars().peekable(),
        }
    }
}

impl Iterator for AttributeScanner<'_> {
    type Item = EventAttribute;

    fn next(&mut self) -> Option<EventAttribute> {
        self.input.peek()?;

        let mut name = String::new();
        let terminator = scan_until(&mut self.input, &mut name, |ch| ch == '=' || ch == ';');

        let mut value = String::new();
        if terminator == Some('=') {
            scan_until(&mut self.input, &mut value, |ch| ch == ';');
        }

        Some(EventAttribute { name, value })
    }
}

/// Returns the unescaped value of the first attribute named exactly `name`.
pub fn find_event_attribute(attributes: &str, name: &str) -> Result<String> {
    AttributeScanner::new(attributes)
        .find(|attr| attr.name == name)
        .map(|attr| attr.value)
        .ok_or(EtwError::NotFound)
}

/// Splits an attribute string into its unescaped name/value pairs.
///
/// Pairs whose name and value are both empty (e.g. from `;;`) are skipped.
pub fn split_event_attributes(attributes: &str) -> Vec<EventAttribute> {
    AttributeScanner::new(attributes)
        .filter(|attr| !attr.name.is_empty() || !attr.value.is_empty())
        .collect()
}
