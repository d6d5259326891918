use std::fmt::Write;

use crate::value_render::ValueKind;

/// Minimal JSON writer that appends to an output `String`.
///
/// Responsibilities:
/// - Escapes strings in place without building intermediates
/// - Honors the compact (`,` and `:`) or spaced (`, ` and `: `) separator style
/// - Exposes tiny helpers for common tokens to keep callsites terse
pub(crate) struct JsonWriter<'o> {
    out: &'o mut String,
    spaced: bool,
}

impl<'o> JsonWriter<'o> {
    #[inline]
    pub(crate) fn new(out: &'o mut String, spaced: bool) -> Self {
        Self { out, spaced }
    }

    #[inline]
    pub(crate) fn write_str(&mut self, s: &str) {
        self.out.push_str(s);
    }

    /// Writes a JSON-escaped string surrounded by quotes.
    pub(crate) fn write_quoted_str(&mut self, s: &str) {
        self.out.push('"');
        escape_into(self.out, s);
        self.out.push('"');
    }

    /// Writes text that is known not to need escaping surrounded by quotes.
    #[inline]
    pub(crate) fn write_clean_str(&mut self, s: &str) {
        self.out.push('"');
        self.out.push_str(s);
        self.out.push('"');
    }

    /// Writes rendered value text, quoting and escaping it as its kind requires.
    pub(crate) fn write_value(&mut self, text: &str, kind: ValueKind) {
        match kind {
            ValueKind::Literal => self.write_str(text),
            ValueKind::CleanString => self.write_clean_str(text),
            ValueKind::EscapableString => self.write_quoted_str(text),
        }
    }

    #[inline]
    pub(crate) fn write_u64(&mut self, n: u64) {
        let _ = write!(self.out, "{}", n);
    }

    #[inline]
    pub(crate) fn colon(&mut self) {
        self.out.push_str(if self.spaced { ": " } else { ":" });
    }

    #[inline]
    pub(crate) fn comma(&mut self) {
        self.out.push_str(if self.spaced { ", " } else { "," });
    }

    #[inline]
    pub(crate) fn open_object(&mut self) {
        self.out.push('{');
    }

    #[inline]
    pub(crate) fn close_object(&mut self) {
        self.out.push('}');
    }

    #[inline]
    pub(crate) fn open_array(&mut self) {
        self.out.push('[');
    }

    #[inline]
    pub(crate) fn close_array(&mut self) {
        self.out.push(']');
    }

    #[inline]
    pub(crate) fn write_key(&mut self, key: &str) {
        self.write_quoted_str(key);
        self.colon();
    }

    /// Writes `"key":` preceded by a comma unless this is the first member.
    pub(crate) fn member(&mut self, first: &mut bool, key: &str) {
        if !*first {
            self.comma();
        }
        *first = false;
        self.write_key(key);
    }

    pub(crate) fn member_u64(&mut self, first: &mut bool, key: &str, n: u64) {
        self.member(first, key);
        self.write_u64(n);
    }

    pub(crate) fn member_quoted(&mut self, first: &mut bool, key: &str, s: &str) {
        self.member(first, key);
        self.write_quoted_str(s);
    }

    pub(crate) fn member_clean(&mut self, first: &mut bool, key: &str, s: &str) {
        self.member(first, key);
        self.write_clean_str(s);
    }
}

/// Appends `s` with JSON string escapes applied, without the surrounding quotes.
pub(crate) fn escape_into(out: &mut String, s: &str) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut run_start = 0;
    for (i, ch) in s.char_indices() {
        let escaped: &str = match ch {
            '"' => "\\\"",
            '\\' => "\\\\",
            '\u{8}' => "\\b",
            '\t' => "\\t",
            '\n' => "\\n",
            '\u{c}' => "\\f",
            '\r' => "\\r",
            '\0'..='\u{1f}' => "",
            _ => continue,
        };

        out.push_str(&s[run_start..i]);
        run_start = i + ch.len_utf8();

        if escaped.is_empty() {
            let b = ch as u8;
            out.push_str("\\u00");
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        } else {
            out.push_str(escaped);
        }
    }
    out.push_str(&s[run_start..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn escaped(s: &str) -> String {
        let mut out = String::new();
        JsonWriter::new(&mut out, false).write_quoted_str(s);
        out
    }

    #[test]
    fn test_escapes_quotes_and_controls() {
        assert_eq!(escaped(r#"a"b"#), r#""a\"b""#);
        assert_eq!(escaped("back\\slash"), r#""back\\slash""#);
        assert_eq!(escaped("\u{8}\t\n\u{c}\r"), r#""\b\t\n\f\r""#);
        assert_eq!(escaped("\u{1}\u{1f}"), r#""\u0001\u001F""#);
        assert_eq!(escaped("caf\u{e9}"), "\"caf\u{e9}\"");
    }

    #[test]
    fn test_separator_styles() {
        let mut out = String::new();
        let mut w = JsonWriter::new(&mut out, true);
        let mut first = true;
        w.open_object();
        w.member_u64(&mut first, "a", 1);
        w.member_clean(&mut first, "b", "0x2");
        w.close_object();
        assert_eq!(out, r#"{"a": 1, "b": "0x2"}"#);

        let mut out = String::new();
        let mut w = JsonWriter::new(&mut out, false);
        let mut first = true;
        w.open_object();
        w.member_u64(&mut first, "a", 1);
        w.member_quoted(&mut first, "b", "x\"y");
        w.close_object();
        assert_eq!(out, r#"{"a":1,"b":"x\"y"}"#);
    }

    #[test]
    fn test_value_kinds() {
        let mut out = String::new();
        let mut w = JsonWriter::new(&mut out, false);
        w.open_array();
        w.write_value("12", ValueKind::Literal);
        w.comma();
        w.write_value("inf", ValueKind::CleanString);
        w.comma();
        w.write_value("a\"", ValueKind::EscapableString);
        w.close_array();
        assert_eq!(out, r#"[12,"inf","a\""]"#);
    }
}
