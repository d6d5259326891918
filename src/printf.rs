//! The `%N!fmt!` mini-grammar used by message templates.
//!
//! A clause is a C `printf` conversion without the leading `%`: up to five distinct flags
//! (`-+ #0`), an optional width of at most four digits, an optional precision of at most four
//! digits, an ignored length modifier, and a conversion character. `*` is accepted for width
//! and precision and then ignored.
//!
//! The clause is parsed once and then rendered against whatever value the referenced field
//! holds. A value whose type does not suit the conversion is rendered as a string using the
//! flags and width of the clause, but never its precision (`%.3g` applied to a string must
//! not truncate it).

use std::fmt::Write;

const MAX_DIGITS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Category {
    Character,
    Integer,
    Float,
    String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    left: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    zero: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedPrintf {
    consumed: usize,
    flags: Flags,
    width: usize,
    precision: Option<usize>,
    specifier: u8,
    category: Category,
}

impl ParsedPrintf {
    /// Parses a clause at the start of `format`. Check [`consumed`](Self::consumed) for
    /// success.
    pub(crate) fn parse(format: &str) -> ParsedPrintf {
        let bytes = format.as_bytes();
        let at = |i: usize| bytes.get(i).copied().unwrap_or(0);

        let mut parsed = ParsedPrintf {
            consumed: 0,
            flags: Flags::default(),
            width: 0,
            precision: None,
            specifier: 0,
            category: Category::String,
        };

        let mut i = 0;
        loop {
            match at(i) {
                b'-' => parsed.flags.left = true,
                b'+' => parsed.flags.plus = true,
                b' ' => parsed.flags.space = true,
                b'#' => parsed.flags.alternate = true,
                b'0' => parsed.flags.zero = true,
                _ => break,
            }
            i += 1;
        }

        match at(i) {
            b'1'..=b'9' => {
                let (value, next) = read_digits(bytes, i);
                parsed.width = value;
                i = next;
            }
            b'*' => i += 1,
            _ => {}
        }

        if at(i) == b'.' {
            i += 1;
            if at(i).is_ascii_digit() {
                let (value, next) = read_digits(bytes, i);
                parsed.precision = Some(value);
                i = next;
            } else {
                if at(i) == b'*' {
                    i += 1;
                }
                parsed.precision = Some(0);
            }
        }

        match at(i) {
            b'h' | b'l' => {
                i += 1;
                if at(i) == at(i - 1) {
                    i += 1;
                }
            }
            b'I' => {
                i += 1;
                if (at(i) == b'6' && at(i + 1) == b'4') || (at(i) == b'3' && at(i + 1) == b'2') {
                    i += 2;
                }
            }
            b'j' | b'z' | b't' | b'L' | b'w' => i += 1,
            _ => {}
        }

        let category = match at(i) {
            b'c' | b'C' => Category::Character,
            b'd' | b'i' | b'o' | b'u' | b'x' | b'X' | b'p' => Category::Integer,
            b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => Category::Float,
            b's' | b'S' | b'Z' => Category::String,
            _ => return parsed,
        };

        parsed.specifier = at(i);
        parsed.category = category;
        parsed.consumed = i + 1;
        parsed
    }

    /// Number of bytes of the clause, or 0 if it is not a valid conversion.
    pub(crate) fn consumed(&self) -> usize {
        self.consumed
    }

    pub(crate) fn category(&self) -> Category {
        self.category
    }

    /// A bare `s` conversion: the value can be rendered without any padding logic.
    pub(crate) fn is_plain_string(&self) -> bool {
        self.category == Category::String
            && self.flags == Flags::default()
            && self.width == 0
            && self.precision.is_none()
    }

    pub(crate) fn write_char(&self, out: &mut String, ch: char) {
        let mut body = [0u8; 4];
        self.pad(out, "", ch.encode_utf8(&mut body), false);
    }

    /// Renders an integer of `bits` width (8, 16, 32 or 64). `p` renders as `X`.
    pub(crate) fn write_int(&self, out: &mut String, value: u64, bits: u32) {
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let value = value & mask;

        let mut sign = "";
        let mut prefix = "";
        let mut digits = match self.specifier {
            b'd' | b'i' => {
                let shift = 64 - bits.min(64);
                let signed = ((value << shift) as i64) >> shift;
                if signed < 0 {
                    sign = "-";
                } else if self.flags.plus {
                    sign = "+";
                } else if self.flags.space {
                    sign = " ";
                }
                signed.unsigned_abs().to_string()
            }
            b'o' => format!("{:o}", value),
            b'x' => format!("{:x}", value),
            _ if self.specifier == b'u' => value.to_string(),
            _ => format!("{:X}", value),
        };

        if let Some(precision) = self.precision {
            if precision == 0 && value == 0 {
                digits.clear();
            }
            if digits.len() < precision {
                digits.insert_str(0, &"0".repeat(precision - digits.len()));
            }
        }

        if self.flags.alternate && value != 0 {
            match self.specifier {
                b'x' => prefix = "0x",
                b'X' | b'p' => prefix = "0X",
                _ => {}
            }
        }
        if self.flags.alternate && self.specifier == b'o' && !digits.starts_with('0') {
            digits.insert(0, '0');
        }

        let mut lead = String::with_capacity(3);
        lead.push_str(sign);
        lead.push_str(prefix);
        let zero_pad = self.flags.zero && self.precision.is_none();
        self.pad(out, &lead, &digits, zero_pad);
    }

    pub(crate) fn write_float(&self, out: &mut String, value: f64) {
        let upper = self.specifier.is_ascii_uppercase();
        let sign = if value.is_sign_negative() && !value.is_nan() {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        };

        if !value.is_finite() {
            let text = match (value.is_nan(), upper) {
                (true, false) => "nan",
                (true, true) => "NAN",
                (false, false) => "inf",
                (false, true) => "INF",
            };
            self.pad(out, sign, text, false);
            return;
        }

        let magnitude = value.abs();
        let alternate = self.flags.alternate;
        let (lead, body) = match self.specifier.to_ascii_lowercase() {
            b'f' => ("", fixed(magnitude, self.precision.unwrap_or(6), alternate)),
            b'e' => ("", scientific(magnitude, self.precision.unwrap_or(6), alternate, upper)),
            b'a' => (
                if upper { "0X" } else { "0x" },
                hex_float(magnitude, self.precision, alternate, upper),
            ),
            _ => ("", general(magnitude, self.precision.unwrap_or(6), alternate, upper)),
        };

        let lead = format!("{}{}", sign, lead);
        self.pad(out, &lead, &body, self.flags.zero);
    }

    /// Renders `value` with this clause's flags and width. Precision only applies when the
    /// clause itself is a string conversion.
    pub(crate) fn write_str(&self, out: &mut String, value: &str) {
        let truncated = match self.precision {
            Some(precision) if self.category == Category::String => {
                match value.char_indices().nth(precision) {
                    Some((end, _)) => &value[..end],
                    None => value,
                }
            }
            _ => value,
        };
        self.pad(out, "", truncated, false);
    }

    fn pad(&self, out: &mut String, lead: &str, body: &str, zero_pad: bool) {
        let len = lead.chars().count() + body.chars().count();
        let fill = self.width.saturating_sub(len);

        if self.flags.left {
            out.push_str(lead);
            out.push_str(body);
            out.extend(std::iter::repeat_n(' ', fill));
        } else if zero_pad {
            out.push_str(lead);
            out.extend(std::iter::repeat_n('0', fill));
            out.push_str(body);
        } else {
            out.extend(std::iter::repeat_n(' ', fill));
            out.push_str(lead);
            out.push_str(body);
        }
    }
}

fn read_digits(bytes: &[u8], start: usize) -> (usize, usize) {
    let mut value = 0usize;
    let mut i = start;
    while i < bytes.len() && bytes[i].is_ascii_digit() && i - start < MAX_DIGITS {
        value = value * 10 + usize::from(bytes[i] - b'0');
        i += 1;
    }
    (value, i)
}

fn fixed(value: f64, precision: usize, alternate: bool) -> String {
    let mut s = format!("{:.*}", precision, value);
    if alternate && precision == 0 {
        s.push('.');
    }
    s
}

/// Splits Rust's `1.5e3` into mantissa and exponent.
fn split_exponent(s: &str) -> (&str, i32) {
    match s.split_once('e') {
        Some((mantissa, exp)) => (mantissa, exp.parse().unwrap_or(0)),
        None => (s, 0),
    }
}

fn push_c_exponent(out: &mut String, exp: i32, upper: bool) {
    out.push(if upper { 'E' } else { 'e' });
    out.push(if exp < 0 { '-' } else { '+' });
    let _ = write!(out, "{:02}", exp.unsigned_abs());
}

fn scientific(value: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let rust = format!("{:.*e}", precision, value);
    let (mantissa, exp) = split_exponent(&rust);
    let mut s = String::with_capacity(mantissa.len() + 5);
    s.push_str(mantissa);
    if alternate && precision == 0 {
        s.push('.');
    }
    push_c_exponent(&mut s, exp, upper);
    s
}

fn strip_fraction_zeros(s: &mut String) {
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
}

fn general(value: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let precision = precision.max(1);

    let rounded = format!("{:.*e}", precision - 1, value);
    let (_, exp) = split_exponent(&rounded);

    if exp >= -4 && (exp as i64) < precision as i64 {
        let decimals = (precision as i64 - 1 - exp as i64) as usize;
        let mut s = format!("{:.*}", decimals, value);
        if alternate {
            if !s.contains('.') {
                s.push('.');
            }
        } else {
            strip_fraction_zeros(&mut s);
        }
        s
    } else {
        let (mantissa, exp) = split_exponent(&rounded);
        let mut s = mantissa.to_string();
        if alternate {
            if !s.contains('.') {
                s.push('.');
            }
        } else {
            strip_fraction_zeros(&mut s);
        }
        push_c_exponent(&mut s, exp, upper);
        s
    }
}

/// `%a` without the `0x` prefix.
fn hex_float(value: f64, precision: Option<usize>, alternate: bool, upper: bool) -> String {
    const FRACTION_DIGITS: usize = 13;

    let bits = value.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);

    let (mut lead, mut exp) = match (biased, fraction) {
        (0, 0) => (0u64, 0),
        (0, _) => (0, -1022),
        _ => (1, biased - 1023),
    };

    let mut digits = format!("{:013x}", fraction);
    match precision {
        Some(p) if p < FRACTION_DIGITS => {
            let shift = ((FRACTION_DIGITS - p) * 4) as u32;
            let full = (lead << 52) | fraction;
            let rounded = (full + (1u64 << (shift - 1))) >> shift;
            lead = rounded >> (p * 4);
            let kept = rounded & ((1u64 << (p * 4)) - 1);
            digits = if p == 0 {
                String::new()
            } else {
                format!("{:0width$x}", kept, width = p)
            };
            if lead > 1 && biased != 0 {
                lead = 1;
                exp += 1;
            }
        }
        Some(p) => digits.extend(std::iter::repeat_n('0', p - FRACTION_DIGITS)),
        None => {
            let trimmed = digits.trim_end_matches('0').len();
            digits.truncate(trimmed);
        }
    }

    let mut s = String::with_capacity(digits.len() + 8);
    let _ = write!(s, "{}", lead);
    if !digits.is_empty() || alternate {
        s.push('.');
    }
    s.push_str(&digits);
    if upper {
        s.make_ascii_uppercase();
    }
    s.push(if upper { 'P' } else { 'p' });
    let _ = write!(s, "{:+}", exp);
    s
}

/// C `%g` with the default precision of 6.
pub(crate) fn format_general(value: f64) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }

    let body = general(value.abs(), 6, false, false);
    if value.is_sign_negative() {
        format!("-{}", body)
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn int(clause: &str, value: u64, bits: u32) -> String {
        let p = ParsedPrintf::parse(clause);
        assert_eq!(p.category(), Category::Integer, "{}", clause);
        let mut out = String::new();
        p.write_int(&mut out, value, bits);
        out
    }

    fn float(clause: &str, value: f64) -> String {
        let p = ParsedPrintf::parse(clause);
        assert_eq!(p.category(), Category::Float, "{}", clause);
        let mut out = String::new();
        p.write_float(&mut out, value);
        out
    }

    #[test]
    fn test_parse_consumes_clause() {
        assert_eq!(ParsedPrintf::parse("08x!rest").consumed(), 3);
        assert_eq!(ParsedPrintf::parse("-+ #0 12.3I64d!").consumed(), 14);
        assert_eq!(ParsedPrintf::parse("lld!").consumed(), 3);
        assert_eq!(ParsedPrintf::parse("*.*hs!").consumed(), 5);
        assert_eq!(ParsedPrintf::parse("ws!").consumed(), 2);
    }

    #[test]
    fn test_parse_rejects_invalid_clauses() {
        assert_eq!(ParsedPrintf::parse("n!").consumed(), 0);
        assert_eq!(ParsedPrintf::parse("12345d!").consumed(), 0);
        assert_eq!(ParsedPrintf::parse(".12345f!").consumed(), 0);
        assert_eq!(ParsedPrintf::parse("").consumed(), 0);
        assert_eq!(ParsedPrintf::parse("S").consumed(), 1);
    }

    #[test]
    fn test_plain_string() {
        assert!(ParsedPrintf::parse("s!").is_plain_string());
        assert!(ParsedPrintf::parse("ls!").is_plain_string());
        assert!(!ParsedPrintf::parse("10s!").is_plain_string());
        assert!(!ParsedPrintf::parse("d!").is_plain_string());
    }

    #[test]
    fn test_integers() {
        assert_eq!(int("08x", 0xbeef, 32), "0000beef");
        assert_eq!(int("04X", 0x1a, 32), "001A");
        assert_eq!(int("d", 0xff, 8), "-1");
        assert_eq!(int("u", 0xff, 8), "255");
        assert_eq!(int("+d", 5, 32), "+5");
        assert_eq!(int("-5d|", 42, 32), "42   ");
        assert_eq!(int("#x", 255, 64), "0xff");
        assert_eq!(int("#o", 8, 32), "010");
        assert_eq!(int("p", 0xabc, 64), "ABC");
        assert_eq!(int(".0d", 0, 32), "");
        assert_eq!(int("08.3d", 7, 32), "     007");
        assert_eq!(int("lld", u64::MAX, 64), "-1");
    }

    #[test]
    fn test_floats() {
        assert_eq!(float("f", 1.5), "1.500000");
        assert_eq!(float(".2f", 3.14159), "3.14");
        assert_eq!(float("e", 12345.678), "1.234568e+04");
        assert_eq!(float("E", 0.00012), "1.200000E-04");
        assert_eq!(float("g", 100000.0), "100000");
        assert_eq!(float("g", 1_000_000.0), "1e+06");
        assert_eq!(float(".3g", 3.14159), "3.14");
        assert_eq!(float("08.2f", -1.5), "-0001.50");
        assert_eq!(float("f", f64::INFINITY), "inf");
        assert_eq!(float("a", 1.0), "0x1p+0");
        assert_eq!(float("A", -2.5), "-0X1.4P+1");
    }

    #[test]
    fn test_general_default() {
        assert_eq!(format_general(1.2), "1.2");
        assert_eq!(format_general(45.0), "45");
        assert_eq!(format_general(0.0001), "0.0001");
        assert_eq!(format_general(0.00001), "1e-05");
        assert_eq!(format_general(1234567.0), "1.23457e+06");
        assert_eq!(format_general(-0.5), "-0.5");
        assert_eq!(format_general(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn test_string_fallback_drops_numeric_precision() {
        let mut out = String::new();
        ParsedPrintf::parse("8.3g").write_str(&mut out, "abcdef");
        assert_eq!(out, "  abcdef");

        out.clear();
        ParsedPrintf::parse("-6.2s").write_str(&mut out, "abcdef");
        assert_eq!(out, "ab    ");
    }

    #[test]
    fn test_char() {
        let mut out = String::new();
        ParsedPrintf::parse("3c").write_char(&mut out, 'x');
        assert_eq!(out, "  x");
    }
}
