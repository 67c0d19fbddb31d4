//! Bit-exact numeric semantics for the VM.
//!
//! Floats are handled as raw bit patterns so NaN payloads are preserved or
//! quieted exactly as Wasm requires. Float-to-int truncation uses bit-pattern
//! range tables, which sidesteps rounding in the range comparison itself.

use crate::trap::{Result, Trap};

macro_rules! float_semantics {
    ($module:ident, $float:ty, $bits:ty, sign = $sign:expr, inf = $inf:expr, quiet_bit = $quiet:expr) => {
        pub mod $module {
            pub const SIGN_BIT: $bits = $sign;
            pub const INF: $bits = $inf;
            pub const QUIET_BIT: $bits = $quiet;
            pub const QUIET_NAN: $bits = $inf | $quiet;

            #[inline]
            pub fn is_nan(bits: $bits) -> bool {
                bits & !SIGN_BIT > INF
            }

            /// Quiet NaN with an all-zero payload, either sign.
            pub fn is_canonical_nan(bits: $bits) -> bool {
                bits & !SIGN_BIT == QUIET_NAN
            }

            /// Any NaN with the quiet bit set.
            pub fn is_arithmetic_nan(bits: $bits) -> bool {
                bits & QUIET_NAN == QUIET_NAN
            }

            #[inline]
            fn quieted(bits: $bits) -> $bits {
                if is_nan(bits) {
                    bits | QUIET_BIT
                } else {
                    bits
                }
            }

            /// Applies a rounding/sqrt operation, quieting a NaN result.
            #[inline]
            pub fn unary(bits: $bits, op: fn($float) -> $float) -> $bits {
                quieted(op(<$float>::from_bits(bits)).to_bits())
            }

            #[inline]
            pub fn binary(a: $bits, b: $bits, op: fn($float, $float) -> $float) -> $bits {
                op(<$float>::from_bits(a), <$float>::from_bits(b)).to_bits()
            }

            #[inline]
            pub fn compare(a: $bits, b: $bits, op: fn(&$float, &$float) -> bool) -> bool {
                op(&<$float>::from_bits(a), &<$float>::from_bits(b))
            }

            pub fn nearest(x: $float) -> $float {
                x.round_ties_even()
            }

            pub fn abs(bits: $bits) -> $bits {
                bits & !SIGN_BIT
            }

            pub fn neg(bits: $bits) -> $bits {
                bits ^ SIGN_BIT
            }

            pub fn copysign(a: $bits, b: $bits) -> $bits {
                (a & !SIGN_BIT) | (b & SIGN_BIT)
            }

            pub fn min(a: $bits, b: $bits) -> $bits {
                if is_nan(a) {
                    return a | QUIET_BIT;
                }
                if is_nan(b) {
                    return b | QUIET_BIT;
                }
                if (a | b) & !SIGN_BIT == 0 {
                    // -0 wins
                    return a | b;
                }
                <$float>::from_bits(a).min(<$float>::from_bits(b)).to_bits()
            }

            pub fn max(a: $bits, b: $bits) -> $bits {
                if is_nan(a) {
                    return a | QUIET_BIT;
                }
                if is_nan(b) {
                    return b | QUIET_BIT;
                }
                if (a | b) & !SIGN_BIT == 0 {
                    // +0 wins
                    return a & b;
                }
                <$float>::from_bits(a).max(<$float>::from_bits(b)).to_bits()
            }
        }
    };
}

float_semantics!(f32_bits, f32, u32, sign = 0x8000_0000, inf = 0x7f80_0000, quiet_bit = 0x0040_0000);
float_semantics!(
    f64_bits,
    f64,
    u64,
    sign = 0x8000_0000_0000_0000,
    inf = 0x7ff0_0000_0000_0000,
    quiet_bit = 0x0008_0000_0000_0000
);

// ── Truncation ────────────────────────────────────────────────────────────────

const F32_NEG_ZERO: u32 = 0x8000_0000;
const F64_NEG_ZERO: u64 = 0x8000_0000_0000_0000;

macro_rules! trunc {
    ($name:ident, $bits:ty, $float:ty, $int:ty, $is_nan:path, |$b:ident| $in_range:expr) => {
        pub fn $name($b: $bits) -> Result<$int> {
            if $is_nan($b) {
                return Err(Trap::InvalidConversionToInteger);
            }
            if !($in_range) {
                return Err(Trap::IntegerOverflow);
            }
            Ok(<$float>::from_bits($b) as $int)
        }
    };
}

trunc!(i32_trunc_f32_s, u32, f32, i32, f32_bits::is_nan,
    |b| b < 0x4f00_0000 || (b >= F32_NEG_ZERO && b <= 0xcf00_0000));
trunc!(i32_trunc_f32_u, u32, f32, u32, f32_bits::is_nan,
    |b| b < 0x4f80_0000 || (b >= F32_NEG_ZERO && b < 0xbf80_0000));
trunc!(i64_trunc_f32_s, u32, f32, i64, f32_bits::is_nan,
    |b| b < 0x5f00_0000 || (b >= F32_NEG_ZERO && b <= 0xdf00_0000));
trunc!(i64_trunc_f32_u, u32, f32, u64, f32_bits::is_nan,
    |b| b < 0x5f80_0000 || (b >= F32_NEG_ZERO && b < 0xbf80_0000));
trunc!(i32_trunc_f64_s, u64, f64, i32, f64_bits::is_nan,
    |b| b < 0x41e0_0000_0000_0000 || (b >= F64_NEG_ZERO && b < 0xc1e0_0000_0020_0000));
trunc!(i32_trunc_f64_u, u64, f64, u32, f64_bits::is_nan,
    |b| b < 0x41f0_0000_0000_0000 || (b >= F64_NEG_ZERO && b < 0xbff0_0000_0000_0000));
trunc!(i64_trunc_f64_s, u64, f64, i64, f64_bits::is_nan,
    |b| b < 0x43e0_0000_0000_0000 || (b >= F64_NEG_ZERO && b <= 0xc3e0_0000_0000_0000));
trunc!(i64_trunc_f64_u, u64, f64, u64, f64_bits::is_nan,
    |b| b < 0x43f0_0000_0000_0000 || (b >= F64_NEG_ZERO && b < 0xbff0_0000_0000_0000));

// ── Float width conversion ────────────────────────────────────────────────────

/// `f32.demote_f64`. Values just above `f32::MAX` clamp to it.
pub fn f32_demote_f64(bits: u64) -> u32 {
    let in_range = bits <= 0x47ef_ffff_e000_0000 || (bits >= F64_NEG_ZERO && bits <= 0xc7ef_ffff_e000_0000);
    if in_range {
        return (f64::from_bits(bits) as f32).to_bits();
    }
    if bits > 0x47ef_ffff_e000_0000 && bits < 0x47ef_ffff_f000_0000 {
        return f32::MAX.to_bits();
    }
    if bits > 0xc7ef_ffff_e000_0000 && bits < 0xc7ef_ffff_f000_0000 {
        return (-f32::MAX).to_bits();
    }
    let sign = ((bits >> 32) as u32) & f32_bits::SIGN_BIT;
    let mut result = sign | f32_bits::INF;
    if f64_bits::is_nan(bits) {
        result |= f32_bits::QUIET_BIT | ((bits >> 29) as u32 & 0x007f_ffff);
    }
    result
}

/// `f64.promote_f32`. A NaN keeps its payload and becomes quiet.
pub fn f64_promote_f32(bits: u32) -> u64 {
    if f32_bits::is_nan(bits) {
        let sign = ((bits & f32_bits::SIGN_BIT) as u64) << 32;
        let payload = ((bits & 0x007f_ffff) as u64) << 29;
        return sign | f64_bits::QUIET_NAN | payload;
    }
    (f32::from_bits(bits) as f64).to_bits()
}

// ── Integer division ──────────────────────────────────────────────────────────

macro_rules! int_division {
    ($div_s:ident, $rem_s:ident, $div_u:ident, $rem_u:ident, $signed:ty, $unsigned:ty) => {
        pub fn $div_s(a: $signed, b: $signed) -> Result<$signed> {
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if a == <$signed>::MIN && b == -1 {
                return Err(Trap::IntegerOverflow);
            }
            Ok(a / b)
        }

        /// `MIN % -1` is 0, not a trap.
        pub fn $rem_s(a: $signed, b: $signed) -> Result<$signed> {
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            Ok(a.wrapping_rem(b))
        }

        pub fn $div_u(a: $unsigned, b: $unsigned) -> Result<$unsigned> {
            a.checked_div(b).ok_or(Trap::IntegerDivideByZero)
        }

        pub fn $rem_u(a: $unsigned, b: $unsigned) -> Result<$unsigned> {
            a.checked_rem(b).ok_or(Trap::IntegerDivideByZero)
        }
    };
}

int_division!(i32_div_s, i32_rem_s, i32_div_u, i32_rem_u, i32, u32);
int_division!(i64_div_s, i64_rem_s, i64_div_u, i64_rem_u, i64, u64);
