//! Numeric literal parsing.
//!
//! Integers are decimal or `0x`-hex with optional sign and `_` separators.
//! Floats are decimal, hex-float (`0x1.8p3`), `inf` or `nan[:0x<payload>]`.
//! Every float parser returns the exact IEEE-754 bit pattern; hex-floats
//! round half to even and are rejected when they would round to infinity.

use std::fmt::Write as _;

use crate::trap::ParseError;

pub type Result<T> = std::result::Result<T, ParseError>;

/// Lexical class of a literal token, as decided by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralType {
    Int,
    Float,
    Hexfloat,
    Infinity,
    Nan,
}

/// Whether a leading sign is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseIntType {
    UnsignedOnly,
    SignedAndUnsigned,
}

// ── Integers ──────────────────────────────────────────────────────────────────

fn split_sign(s: &str) -> (Option<bool>, &str) {
    match s.as_bytes().first() {
        Some(b'-') => (Some(true), &s[1..]),
        Some(b'+') => (Some(false), &s[1..]),
        _ => (None, s),
    }
}

/// Unsigned decimal or hex magnitude with overflow detection.
pub fn parse_uint64(s: &str) -> Result<u64> {
    let (digits, radix) = match s.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    let mut value: u64 = 0;
    let mut prev_digit = false;
    for c in digits.chars() {
        if c == '_' {
            if !prev_digit {
                return Err(ParseError::Malformed);
            }
            prev_digit = false;
            continue;
        }
        let d = c.to_digit(radix).ok_or(ParseError::Malformed)?;
        value = value
            .checked_mul(radix as u64)
            .and_then(|v| v.checked_add(d as u64))
            .ok_or(ParseError::OutOfRange)?;
        prev_digit = true;
    }
    // Also rejects an empty body and a trailing separator.
    if !prev_digit {
        return Err(ParseError::Malformed);
    }
    Ok(value)
}

/// Parses a 64-bit integer. Negative values are returned two's-complement.
pub fn parse_int64(s: &str, parse_type: ParseIntType) -> Result<u64> {
    let (sign, body) = split_sign(s);
    if sign.is_some() && parse_type == ParseIntType::UnsignedOnly {
        return Err(ParseError::Malformed);
    }
    let magnitude = parse_uint64(body)?;
    if sign == Some(true) {
        if magnitude > 1 << 63 {
            return Err(ParseError::OutOfRange);
        }
        Ok(magnitude.wrapping_neg())
    } else {
        Ok(magnitude)
    }
}

/// Parses a 32-bit integer. Accepts `-2^31 ..= 2^32-1`.
pub fn parse_int32(s: &str, parse_type: ParseIntType) -> Result<u32> {
    let (sign, body) = split_sign(s);
    if sign.is_some() && parse_type == ParseIntType::UnsignedOnly {
        return Err(ParseError::Malformed);
    }
    let magnitude = parse_uint64(body)?;
    if sign == Some(true) {
        if magnitude > 1 << 31 {
            return Err(ParseError::OutOfRange);
        }
        Ok((magnitude as u32).wrapping_neg())
    } else {
        u32::try_from(magnitude).map_err(|_| ParseError::OutOfRange)
    }
}

// ── Float formats ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Format {
    sig_bits: u32,
    exp_bits: u32,
}

const F32: Format = Format { sig_bits: 23, exp_bits: 8 };
const F64: Format = Format { sig_bits: 52, exp_bits: 11 };

impl Format {
    fn bias(self) -> i64 {
        (1 << (self.exp_bits - 1)) - 1
    }
    fn min_normal_exp(self) -> i64 {
        1 - self.bias()
    }
    fn sign_bit(self) -> u64 {
        1 << (self.sig_bits + self.exp_bits)
    }
    fn sig_mask(self) -> u64 {
        (1 << self.sig_bits) - 1
    }
    fn exp_field_max(self) -> u64 {
        (1 << self.exp_bits) - 1
    }
    fn inf(self) -> u64 {
        self.exp_field_max() << self.sig_bits
    }
    fn quiet_bit(self) -> u64 {
        1 << (self.sig_bits - 1)
    }
    fn sign(self, neg: bool) -> u64 {
        if neg {
            self.sign_bit()
        } else {
            0
        }
    }
}

/// Splits off the leading run of `radix` digits and separators.
fn split_digits(s: &str, radix: u32) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|&(_, c)| c != '_' && !c.is_digit(radix))
        .map_or(s.len(), |(i, _)| i);
    s.split_at(end)
}

/// A digit run must be non-empty with separators only between digits.
fn check_digits(run: &str) -> Result<()> {
    if run.is_empty() || run.starts_with('_') || run.ends_with('_') || run.contains("__") {
        return Err(ParseError::Malformed);
    }
    Ok(())
}

fn parse_exponent(s: &str) -> Result<i64> {
    let (sign, body) = split_sign(s);
    let (digits, rest) = split_digits(body, 10);
    check_digits(digits)?;
    if !rest.is_empty() {
        return Err(ParseError::Malformed);
    }
    // Anything past this saturates to zero or overflows regardless.
    const CLAMP: i64 = 1 << 20;
    let mut value: i64 = 0;
    for d in digits.chars().filter_map(|c| c.to_digit(10)) {
        value = (value * 10 + d as i64).min(CLAMP);
    }
    Ok(if sign == Some(true) { -value } else { value })
}

fn parse_hex(format: Format, neg: bool, body: &str) -> Result<u64> {
    let (int_digits, rest) = split_digits(body, 16);
    check_digits(int_digits)?;
    let (frac_digits, rest) = match rest.strip_prefix('.') {
        Some(after_dot) => {
            let (frac, rest) = split_digits(after_dot, 16);
            if !frac.is_empty() {
                check_digits(frac)?;
            }
            (frac, rest)
        }
        None => ("", rest),
    };
    let exp_value = match rest.strip_prefix(['p', 'P']) {
        Some(exp) => parse_exponent(exp)?,
        None if rest.is_empty() => 0,
        None => return Err(ParseError::Malformed),
    };

    // Keep at most 64 significant bits; dropped non-zero digits are sticky.
    let mut significand: u64 = 0;
    let mut exponent: i64 = 0;
    let mut sticky = false;
    let mut push_digit = |d: u32, fractional: bool| {
        if significand >> 60 == 0 {
            significand = (significand << 4) | d as u64;
            if fractional {
                exponent -= 4;
            }
        } else {
            sticky |= d != 0;
            if !fractional {
                exponent += 4;
            }
        }
    };
    for d in int_digits.chars().filter_map(|c| c.to_digit(16)) {
        push_digit(d, false);
    }
    for d in frac_digits.chars().filter_map(|c| c.to_digit(16)) {
        push_digit(d, true);
    }
    round_to_format(format, neg, significand, exponent + exp_value, sticky)
}

/// Rounds `significand * 2^exponent` (plus a sticky remainder) to the target
/// format, half to even.
fn round_to_format(format: Format, neg: bool, significand: u64, exponent: i64, sticky: bool) -> Result<u64> {
    let sign = format.sign(neg);
    if significand == 0 {
        return Ok(sign);
    }
    let sig_bits = format.sig_bits as i64;
    let msb = 63 - significand.leading_zeros() as i64;
    let mut exp = msb + exponent;
    if exp > format.bias() {
        return Err(ParseError::OutOfRange);
    }
    let lsb = exp.max(format.min_normal_exp()) - sig_bits;
    let shift = lsb - exponent;

    let mut q = if shift <= 0 {
        significand << -shift
    } else if shift > 64 {
        0
    } else {
        let wide = significand as u128;
        let q = (wide >> shift) as u64;
        let rem = wide & ((1u128 << shift) - 1);
        let half = 1u128 << (shift - 1);
        if rem > half || (rem == half && (sticky || q & 1 == 1)) {
            q + 1
        } else {
            q
        }
    };

    if exp < format.min_normal_exp() {
        // Subnormal; a carry into bit sig_bits yields the smallest normal.
        return Ok(sign | q);
    }
    if q >> (format.sig_bits + 1) != 0 {
        q >>= 1;
        exp += 1;
        if exp > format.bias() {
            return Err(ParseError::OutOfRange);
        }
    }
    Ok(sign | ((exp + format.bias()) as u64) << format.sig_bits | (q & format.sig_mask()))
}

fn parse_decimal(format: Format, neg: bool, body: &str) -> Result<u64> {
    let (int_digits, rest) = split_digits(body, 10);
    check_digits(int_digits)?;
    let (frac_digits, rest) = match rest.strip_prefix('.') {
        Some(after_dot) => {
            let (frac, rest) = split_digits(after_dot, 10);
            if !frac.is_empty() {
                check_digits(frac)?;
            }
            (frac, rest)
        }
        None => ("", rest),
    };
    let exp_text = match rest.strip_prefix(['e', 'E']) {
        Some(exp) => {
            let (_, digits) = split_sign(exp);
            let (run, tail) = split_digits(digits, 10);
            check_digits(run)?;
            if !tail.is_empty() {
                return Err(ParseError::Malformed);
            }
            exp
        }
        None if rest.is_empty() => "0",
        None => return Err(ParseError::Malformed),
    };

    let mut text = String::with_capacity(body.len() + 4);
    if neg {
        text.push('-');
    }
    text.extend(int_digits.chars().filter(|&c| c != '_'));
    if !frac_digits.is_empty() {
        text.push('.');
        text.extend(frac_digits.chars().filter(|&c| c != '_'));
    }
    text.push('e');
    text.extend(exp_text.chars().filter(|&c| c != '_'));

    let bits = if format.sig_bits == F32.sig_bits {
        let v: f32 = text.parse().map_err(|_| ParseError::Malformed)?;
        if v.is_infinite() {
            return Err(ParseError::OutOfRange);
        }
        v.to_bits() as u64
    } else {
        let v: f64 = text.parse().map_err(|_| ParseError::Malformed)?;
        if v.is_infinite() {
            return Err(ParseError::OutOfRange);
        }
        v.to_bits()
    };
    Ok(bits)
}

fn parse_number(format: Format, s: &str) -> Result<u64> {
    let (sign, body) = split_sign(s);
    let neg = sign == Some(true);
    match body.strip_prefix("0x") {
        Some(hex) => parse_hex(format, neg, hex),
        None => parse_decimal(format, neg, body),
    }
}

fn parse_nan(format: Format, s: &str) -> Result<u64> {
    let (sign, body) = split_sign(s);
    let rest = body.strip_prefix("nan").ok_or(ParseError::Malformed)?;
    let payload = if rest.is_empty() {
        format.quiet_bit()
    } else {
        let hex = rest.strip_prefix(":0x").ok_or(ParseError::Malformed)?;
        let payload = parse_uint64(&format!("0x{hex}"))?;
        // A zero payload would encode infinity.
        if payload == 0 || payload > format.sig_mask() {
            return Err(ParseError::OutOfRange);
        }
        payload
    };
    Ok(format.sign(sign == Some(true)) | format.inf() | payload)
}

fn parse_infinity(format: Format, s: &str) -> Result<u64> {
    let (sign, body) = split_sign(s);
    match body {
        "inf" | "infinity" => Ok(format.sign(sign == Some(true)) | format.inf()),
        _ => Err(ParseError::Malformed),
    }
}

fn parse_with(format: Format, literal_type: LiteralType, s: &str) -> Result<u64> {
    match literal_type {
        LiteralType::Nan => parse_nan(format, s),
        LiteralType::Infinity => parse_infinity(format, s),
        LiteralType::Int | LiteralType::Float | LiteralType::Hexfloat => parse_number(format, s),
    }
}

/// Parses an `f32` literal into its bit pattern.
pub fn parse_float(literal_type: LiteralType, s: &str) -> Result<u32> {
    parse_with(F32, literal_type, s).map(|bits| bits as u32)
}

/// Parses an `f64` literal into its bit pattern.
pub fn parse_double(literal_type: LiteralType, s: &str) -> Result<u64> {
    parse_with(F64, literal_type, s)
}

// ── Canonical hex output ──────────────────────────────────────────────────────

fn write_hex(format: Format, bits: u64) -> String {
    let mut out = String::new();
    if bits & format.sign_bit() != 0 {
        out.push('-');
    }
    let exp_field = (bits >> format.sig_bits) & format.exp_field_max();
    let sig = bits & format.sig_mask();

    if exp_field == format.exp_field_max() {
        if sig == 0 {
            out.push_str("inf");
        } else if sig == format.quiet_bit() {
            out.push_str("nan");
        } else {
            let _ = write!(out, "nan:0x{sig:x}");
        }
        return out;
    }
    if exp_field == 0 && sig == 0 {
        out.push_str("0x0p+0");
        return out;
    }

    let (exp, sig) = if exp_field == 0 {
        // Normalize the subnormal so the leading one becomes implicit.
        let lz = sig.leading_zeros() - (64 - format.sig_bits);
        let shifted = (sig << (lz + 1)) & format.sig_mask();
        (format.min_normal_exp() - (lz as i64 + 1), shifted)
    } else {
        (exp_field as i64 - format.bias(), sig)
    };

    out.push_str("0x1");
    if sig != 0 {
        let digits = format.sig_bits.div_ceil(4);
        let aligned = sig << (digits * 4 - format.sig_bits);
        let text = format!("{:0width$x}", aligned, width = digits as usize);
        out.push('.');
        out.push_str(text.trim_end_matches('0'));
    }
    let _ = write!(out, "p{}{}", if exp < 0 { '-' } else { '+' }, exp.abs());
    out
}

/// Canonical hex-float text of an `f32` bit pattern.
pub fn write_float_hex(bits: u32) -> String {
    write_hex(F32, bits as u64)
}

/// Canonical hex-float text of an `f64` bit pattern.
pub fn write_double_hex(bits: u64) -> String {
    write_hex(F64, bits)
}
