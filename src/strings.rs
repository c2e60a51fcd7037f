//! Number <-> string conversions.
//!
//! Integer numerals accept decimal, hex (`0x`), binary (`0b`) and octal
//! (leading `0`) forms with an optional sign and `_` digit separators.
//! Hex and binary numerals use the full unsigned range and wrap into the
//! signed domain when the high bit is set; decimal and octal numerals must
//! fit the signed range. Float numerals accept decimal or hex mantissas
//! with signed exponents; overflow and underflow are reported separately.

use crate::value::Value;

/// Outcome flag of a float conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumFlag {
    Exact,
    /// Magnitude too large: the result is an infinity.
    Overflow,
    /// Magnitude too small: the result collapsed to zero.
    Underflow,
}

fn digit_value(c: u8) -> Option<u64> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u64),
        b'a'..=b'f' => Some((c - b'a') as u64 + 10),
        b'A'..=b'F' => Some((c - b'A') as u64 + 10),
        _ => None,
    }
}

/// Parse an integer numeral. Returns `None` when the text is not a valid
/// integer (including range overflow, which the caller may retry as float).
fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    let bytes = s.as_bytes();
    let mut pos = 0;
    let mut negative = false;
    if let Some(&c) = bytes.first() {
        if c == b'+' || c == b'-' {
            negative = c == b'-';
            pos = 1;
        }
    }
    let (base, digits_start) = match bytes.get(pos) {
        Some(b'0') => match bytes.get(pos + 1) {
            Some(b'x') | Some(b'X') => (16u64, pos + 2),
            Some(b'b') | Some(b'B') => (2u64, pos + 2),
            Some(_) => (8u64, pos + 1),
            None => return Some(0),
        },
        Some(_) => (10u64, pos),
        None => return None,
    };
    let mut value: u64 = 0;
    let mut any = base == 8; // the leading octal 0 already counts as a digit
    for &c in &bytes[digits_start..] {
        let d = digit_value(c)?;
        if d >= base {
            return None;
        }
        value = value.checked_mul(base)?.checked_add(d)?;
        any = true;
    }
    if !any {
        return None;
    }
    let lim = 1u64 << 63;
    let wraps = base == 16 || base == 2;
    if value >= lim {
        // only hex and binary may wrap into the signed domain
        if !wraps && !(negative && value == lim) {
            return None;
        }
    }
    Some(if negative {
        0u64.wrapping_sub(value) as i64
    } else {
        value as i64
    })
}

/// Remove `_` separators outside the fractional part; reject misplaced ones.
fn strip_separators(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut in_fraction = false;
    let mut prev_digit = false;
    for c in s.chars() {
        match c {
            '.' => {
                in_fraction = true;
                out.push(c);
                prev_digit = false;
            }
            'e' | 'E' | 'p' | 'P' => {
                in_fraction = false;
                out.push(c);
                prev_digit = false;
            }
            '_' => {
                if in_fraction || !prev_digit {
                    return None;
                }
                prev_digit = false;
            }
            _ => {
                prev_digit = c.is_ascii_alphanumeric();
                out.push(c);
            }
        }
    }
    if s.ends_with('_') {
        return None;
    }
    Some(out)
}

/// Parse a hex float: `0x` mantissa, optional `.` fraction, optional
/// `p`-exponent (a decimal power of two).
fn parse_hex_float(s: &str) -> Option<f64> {
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let rest = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    let mut mantissa = 0f64;
    let mut scale = 1f64;
    let mut seen = false;
    let mut chars = rest.bytes().peekable();
    while let Some(&c) = chars.peek() {
        match digit_value(c) {
            Some(d) if d < 16 => {
                mantissa = mantissa * 16.0 + d as f64;
                seen = true;
                chars.next();
            }
            _ => break,
        }
    }
    if chars.peek() == Some(&b'.') {
        chars.next();
        while let Some(&c) = chars.peek() {
            match digit_value(c) {
                Some(d) if d < 16 => {
                    scale /= 16.0;
                    mantissa += d as f64 * scale;
                    seen = true;
                    chars.next();
                }
                _ => break,
            }
        }
    }
    if !seen {
        return None;
    }
    let mut exp = 0i32;
    match chars.peek() {
        Some(b'p') | Some(b'P') => {
            chars.next();
            let mut exp_neg = false;
            match chars.peek() {
                Some(b'-') => {
                    exp_neg = true;
                    chars.next();
                }
                Some(b'+') => {
                    chars.next();
                }
                _ => {}
            }
            let mut any = false;
            while let Some(&c) = chars.peek() {
                match c {
                    b'0'..=b'9' => {
                        exp = exp.saturating_mul(10).saturating_add((c - b'0') as i32);
                        any = true;
                        chars.next();
                    }
                    _ => break,
                }
            }
            if !any {
                return None;
            }
            if exp_neg {
                exp = -exp;
            }
        }
        None => {}
        _ => return None,
    }
    if chars.next().is_some() {
        return None;
    }
    let v = mantissa * 2f64.powi(exp);
    Some(if negative { -v } else { v })
}

fn parse_float(s: &str) -> Option<(f64, NumFlag)> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let lowered = s.to_ascii_lowercase();
    if lowered.contains("nan") || lowered.contains("inf") {
        return None; // numerals never spell special values
    }
    let clean = strip_separators(s)?;
    if let Some(v) = parse_hex_float(&clean) {
        let flag = if v.is_infinite() {
            NumFlag::Overflow
        } else {
            NumFlag::Exact
        };
        return Some((v, flag));
    }
    let v: f64 = clean.parse().ok()?;
    let flag = if v.is_infinite() {
        NumFlag::Overflow
    } else if v == 0.0 && clean.bytes().any(|c| (b'1'..=b'9').contains(&c)) {
        NumFlag::Underflow
    } else {
        NumFlag::Exact
    };
    Some((v, flag))
}

/// Convert a numeral to a number value: integer forms first, then floats.
pub fn str_to_number(s: &str) -> Option<(Value, NumFlag)> {
    let stripped = strip_separators(s.trim_matches(|c: char| c.is_ascii_whitespace()))?;
    if let Some(i) = parse_int(&stripped) {
        return Some((Value::Int(i), NumFlag::Exact));
    }
    parse_float(s).map(|(f, flag)| (Value::Float(f), flag))
}

/// Format an integer.
pub fn int_to_string(i: i64) -> String {
    i.to_string()
}

/// Format a float with round-trip precision, appending `.0` when the
/// decimal form has no fractional character.
pub fn float_to_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let mut s = format!("{f}");
    if s.bytes().all(|c| c == b'-' || c.is_ascii_digit()) {
        s.push_str(".0");
    }
    s
}

/// Format any number value.
pub fn number_to_string(v: Value) -> Option<String> {
    match v {
        Value::Int(i) => Some(int_to_string(i)),
        Value::Float(f) => Some(float_to_string(f)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_integers() {
        assert_eq!(str_to_number("42"), Some((Value::Int(42), NumFlag::Exact)));
        assert_eq!(str_to_number("-7"), Some((Value::Int(-7), NumFlag::Exact)));
        assert_eq!(str_to_number(" +13 "), Some((Value::Int(13), NumFlag::Exact)));
        assert_eq!(
            str_to_number("1_000_000"),
            Some((Value::Int(1_000_000), NumFlag::Exact))
        );
    }

    #[test]
    fn test_based_integers() {
        assert_eq!(str_to_number("0xff"), Some((Value::Int(255), NumFlag::Exact)));
        assert_eq!(str_to_number("0b1010"), Some((Value::Int(10), NumFlag::Exact)));
        assert_eq!(str_to_number("0755"), Some((Value::Int(493), NumFlag::Exact)));
        assert_eq!(str_to_number("0"), Some((Value::Int(0), NumFlag::Exact)));
    }

    #[test]
    fn test_hex_wraps_into_signed_domain() {
        assert_eq!(
            str_to_number("0xffffffffffffffff"),
            Some((Value::Int(-1), NumFlag::Exact))
        );
        assert_eq!(
            str_to_number("0x8000000000000000"),
            Some((Value::Int(i64::MIN), NumFlag::Exact))
        );
        // decimal out of range falls through to float
        assert_eq!(
            str_to_number("9223372036854775808"),
            Some((Value::Float(9.223372036854776e18), NumFlag::Exact))
        );
    }

    #[test]
    fn test_int_min_decimal() {
        assert_eq!(
            str_to_number("-9223372036854775808"),
            Some((Value::Int(i64::MIN), NumFlag::Exact))
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(
            str_to_number("3.5"),
            Some((Value::Float(3.5), NumFlag::Exact))
        );
        assert_eq!(
            str_to_number("-2.5e2"),
            Some((Value::Float(-250.0), NumFlag::Exact))
        );
        assert_eq!(
            str_to_number("0x1p4"),
            Some((Value::Float(16.0), NumFlag::Exact))
        );
        assert_eq!(
            str_to_number("0x1.8p1"),
            Some((Value::Float(3.0), NumFlag::Exact))
        );
    }

    #[test]
    fn test_overflow_and_underflow_reported() {
        assert_eq!(
            str_to_number("1e999"),
            Some((Value::Float(f64::INFINITY), NumFlag::Overflow))
        );
        let (v, flag) = str_to_number("1e-999").unwrap();
        assert_eq!(v, Value::Float(0.0));
        assert_eq!(flag, NumFlag::Underflow);
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(str_to_number(""), None);
        assert_eq!(str_to_number("abc"), None);
        assert_eq!(str_to_number("1.2.3"), None);
        assert_eq!(str_to_number("nan"), None);
        assert_eq!(str_to_number("1__0"), None);
        assert_eq!(str_to_number("1.5_0"), None); // no separators in fractions
        assert_eq!(str_to_number("0x"), None);
    }

    #[test]
    fn test_integer_formatting() {
        assert_eq!(int_to_string(0), "0");
        assert_eq!(int_to_string(-42), "-42");
        assert_eq!(int_to_string(i64::MIN), "-9223372036854775808");
    }

    #[test]
    fn test_float_formatting_appends_point_zero() {
        assert_eq!(float_to_string(1.0), "1.0");
        assert_eq!(float_to_string(-3.0), "-3.0");
        assert_eq!(float_to_string(1.5), "1.5");
        assert_eq!(float_to_string(f64::INFINITY), "inf");
        assert_eq!(float_to_string(f64::NAN), "nan");
    }
}
