//! The Lua 5.3 numeric tower.
//!
//! Numbers are either 64-bit integers or 64-bit floats. This module holds the
//! conversion rules between the two representations and between numbers and
//! strings, which the dispatcher and the baselib both lean on.

use crate::{
    error::{LuaError, RunResult},
    value::LuaValue,
};

/// Largest float with an exact i64 representation boundary (2^63).
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Formats a float the way `tostring` prints it.
///
/// Uses shortest round-trip formatting with a `.0` suffix for integral
/// values, so `17.0` prints as `"17.0"` and `0.1` as `"0.1"`.
#[must_use]
pub fn float_to_display(value: f64) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan".to_owned() } else { "nan".to_owned() };
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf".to_owned() } else { "inf".to_owned() };
    }
    let mut buffer = ryu::Buffer::new();
    buffer.format(value).to_owned()
}

/// Converts a float to an integer iff the conversion is exact.
#[must_use]
pub fn float_to_exact_int(value: f64) -> Option<i64> {
    if value.fract() == 0.0 && value >= -TWO_POW_63 && value < TWO_POW_63 {
        Some(value as i64)
    } else {
        None
    }
}

/// Orders an integer against a float exactly, without converting the
/// integer to a float first (which would lose precision above 2^53).
///
/// Floats at or beyond ±2^63 are outside the integer range, so they order
/// strictly against every integer; inside the range, the float's floor is
/// exactly representable and decides the comparison. `None` marks NaN,
/// which compares false against everything.
#[must_use]
pub fn int_float_order(int: i64, float: f64) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    if float.is_nan() {
        return None;
    }
    if float >= TWO_POW_63 {
        return Some(Ordering::Less);
    }
    if float < -TWO_POW_63 {
        return Some(Ordering::Greater);
    }
    let floor = float.floor();
    match int.cmp(&(floor as i64)) {
        // Equal floors: a fractional part makes the float the larger one.
        Ordering::Equal if float > floor => Some(Ordering::Less),
        other => Some(other),
    }
}

/// Exact equality of an integer and a float across representations.
#[must_use]
pub fn int_float_eq(int: i64, float: f64) -> bool {
    float_to_exact_int(float) == Some(int)
}

/// Produces the integer representation of a number, as bitwise operators
/// require it.
///
/// Integers pass through; floats must be exactly integral.
pub fn int_representation(value: &LuaValue) -> RunResult<i64> {
    match value {
        LuaValue::Integer(i) => Ok(*i),
        LuaValue::Float(f) => {
            float_to_exact_int(*f).ok_or_else(|| LuaError::conversion("number has no integer representation"))
        }
        other => Err(LuaError::illegal_op(format!(
            "attempt to perform bitwise operation on a {} value",
            other.type_name()
        ))),
    }
}

/// Parses a byte string as a Lua number literal.
///
/// Accepts what `tonumber` accepts: optional surrounding ASCII space, an
/// optional sign, decimal integers and floats, and hexadecimal integers and
/// floats (`0x` prefix, optional `p` exponent). Hexadecimal integers wrap
/// into the i64 range like the reference implementation.
#[must_use]
pub fn parse_number(bytes: &[u8]) -> Option<LuaValue> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.trim_matches(|c: char| c.is_ascii_whitespace());
    if text.is_empty() {
        return None;
    }
    let (negative, digits) = match text.as_bytes()[0] {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.len() >= 2 && (digits.starts_with("0x") || digits.starts_with("0X")) {
        return parse_hex(&digits[2..], negative);
    }
    // Guard against Rust's "inf"/"nan" acceptance: Lua numerals start with a
    // digit or a dot.
    let first = *digits.as_bytes().first()?;
    if !(first.is_ascii_digit() || first == b'.') {
        return None;
    }
    if let Ok(int) = digits.parse::<i64>() {
        return Some(LuaValue::Integer(if negative { int.wrapping_neg() } else { int }));
    }
    let float: f64 = digits.parse().ok()?;
    Some(LuaValue::Float(if negative { -float } else { float }))
}

/// Parses the part of a hexadecimal numeral after the `0x` prefix.
fn parse_hex(digits: &str, negative: bool) -> Option<LuaValue> {
    if digits.is_empty() {
        return None;
    }
    let bytes = digits.as_bytes();
    let is_float = bytes.iter().any(|&b| b == b'.' || b == b'p' || b == b'P');
    if !is_float {
        let mut acc: u64 = 0;
        for &b in bytes {
            let digit = (b as char).to_digit(16)?;
            acc = acc.wrapping_mul(16).wrapping_add(u64::from(digit));
        }
        let int = acc as i64;
        return Some(LuaValue::Integer(if negative { int.wrapping_neg() } else { int }));
    }
    // Hexadecimal float: mantissa in hex, optional binary exponent.
    let (mantissa_text, exponent) = match bytes.iter().position(|&b| b == b'p' || b == b'P') {
        Some(pos) => {
            let exp: i32 = digits[pos + 1..].parse().ok()?;
            (&digits[..pos], exp)
        }
        None => (digits, 0),
    };
    let mut mantissa = 0.0f64;
    let mut seen_digit = false;
    let mut frac_scale: Option<f64> = None;
    for &b in mantissa_text.as_bytes() {
        if b == b'.' {
            if frac_scale.is_some() {
                return None;
            }
            frac_scale = Some(1.0);
            continue;
        }
        let digit = (b as char).to_digit(16)? as f64;
        seen_digit = true;
        match frac_scale {
            None => mantissa = mantissa * 16.0 + digit,
            Some(ref mut scale) => {
                *scale /= 16.0;
                mantissa += digit * *scale;
            }
        }
    }
    if !seen_digit {
        return None;
    }
    let value = mantissa * (exponent as f64).exp2() * if negative { -1.0 } else { 1.0 };
    Some(LuaValue::Float(value))
}

/// `tonumber` semantics: numbers pass through, strings parse, all else nil.
#[must_use]
pub fn coerce_to_number(value: &LuaValue) -> Option<LuaValue> {
    match value {
        LuaValue::Integer(_) | LuaValue::Float(_) => Some(value.clone()),
        LuaValue::Str(s) => parse_number(s.as_bytes()),
        _ => None,
    }
}

/// Coerces a value to a float, as string operands of arithmetic do.
#[must_use]
pub fn coerce_to_float(value: &LuaValue) -> Option<f64> {
    match coerce_to_number(value)? {
        LuaValue::Integer(i) => Some(i as f64),
        LuaValue::Float(f) => Some(f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_integers_parse_as_integers() {
        assert!(matches!(parse_number(b"42"), Some(LuaValue::Integer(42))));
        assert!(matches!(parse_number(b"  -7  "), Some(LuaValue::Integer(-7))));
    }

    #[test]
    fn hex_integers_parse_and_wrap() {
        assert!(matches!(parse_number(b"0x10"), Some(LuaValue::Integer(16))));
        assert!(matches!(parse_number(b"0XFF"), Some(LuaValue::Integer(255))));
        // Wraps rather than overflowing, like the reference implementation.
        assert!(matches!(
            parse_number(b"0xFFFFFFFFFFFFFFFF"),
            Some(LuaValue::Integer(-1))
        ));
    }

    #[test]
    fn floats_parse_with_exponents() {
        assert!(matches!(parse_number(b"3.5"), Some(LuaValue::Float(f)) if f == 3.5));
        assert!(matches!(parse_number(b"1e2"), Some(LuaValue::Float(f)) if f == 100.0));
        assert!(matches!(parse_number(b"0x1p4"), Some(LuaValue::Float(f)) if f == 16.0));
        assert!(matches!(parse_number(b"0x1.8p1"), Some(LuaValue::Float(f)) if f == 3.0));
    }

    #[test]
    fn non_numerals_are_rejected(){
        assert!(parse_number(b"").is_none());
        assert!(parse_number(b"inf").is_none());
        assert!(parse_number(b"nan").is_none());
        assert!(parse_number(b"12abc").is_none());
        assert!(parse_number(b"--3").is_none());
    }

    #[test]
    fn exact_float_to_int_boundaries() {
        assert_eq!(float_to_exact_int(3.0), Some(3));
        assert_eq!(float_to_exact_int(3.5), None);
        assert_eq!(float_to_exact_int(-9.223_372_036_854_776e18), Some(i64::MIN));
        assert_eq!(float_to_exact_int(9.3e18), None);
    }

    #[test]
    fn float_display_keeps_a_decimal_point() {
        assert_eq!(float_to_display(17.0), "17.0");
        assert_eq!(float_to_display(0.1), "0.1");
        assert_eq!(float_to_display(f64::INFINITY), "inf");
    }

    #[test]
    fn int_float_order_is_exact_at_the_boundaries() {
        use std::cmp::Ordering;
        // 2^63 as a float sits just past the largest integer.
        assert_eq!(int_float_order(i64::MAX, TWO_POW_63), Some(Ordering::Less));
        assert_eq!(int_float_order(i64::MIN, -TWO_POW_63), Some(Ordering::Equal));
        // A lossy cast would call these equal.
        assert_eq!(int_float_order(i64::MAX, 9.2233720368547758e18), Some(Ordering::Less));
        assert_eq!(int_float_order(i64::MAX - 1024, (i64::MAX - 1023) as f64), Some(Ordering::Less));
        assert_eq!(int_float_order(i64::MAX, (i64::MAX - 1023) as f64), Some(Ordering::Greater));
        assert_eq!(int_float_order(3, 3.5), Some(Ordering::Less));
        assert_eq!(int_float_order(4, 3.5), Some(Ordering::Greater));
        assert_eq!(int_float_order(3, 3.0), Some(Ordering::Equal));
        assert_eq!(int_float_order(0, f64::INFINITY), Some(Ordering::Less));
        assert_eq!(int_float_order(0, f64::NEG_INFINITY), Some(Ordering::Greater));
        assert_eq!(int_float_order(0, f64::NAN), None);
    }

    #[test]
    fn int_float_equality_is_exact() {
        assert!(int_float_eq(3, 3.0));
        assert!(!int_float_eq(3, 3.5));
        assert!(!int_float_eq(i64::MAX, TWO_POW_63));
        assert!(int_float_eq(i64::MIN, -TWO_POW_63));
        assert!(!int_float_eq(0, f64::NAN));
    }
}
