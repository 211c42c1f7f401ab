// SPDX-License-Identifier: Apache-2.0

//! Host floating-point coupling.
//!
//! Guest FPU arithmetic runs on host `f32`/`f64`. The host rounding mode is
//! never switched: round-to-nearest results come straight from the
//! hardware, directed roundings are applied in software where the ISA
//! observes them (integer conversions), and the RISC-V exception flags are
//! computed explicitly per operation and accumulated into `fcsr` by the
//! caller. NaN outputs are canonicalized as the ISA requires.

// fcsr accrued-exception bits.
pub const FFLAG_NX: u32 = 1 << 0;
pub const FFLAG_UF: u32 = 1 << 1;
pub const FFLAG_OF: u32 = 1 << 2;
pub const FFLAG_DZ: u32 = 1 << 3;
pub const FFLAG_NV: u32 = 1 << 4;

// Rounding modes (frm encoding).
pub const RM_RNE: u32 = 0;
pub const RM_RTZ: u32 = 1;
pub const RM_RDN: u32 = 2;
pub const RM_RUP: u32 = 3;
pub const RM_RMM: u32 = 4;

const CANONICAL_NAN32: u32 = 0x7FC0_0000;
const CANONICAL_NAN64: u64 = 0x7FF8_0000_0000_0000;

/// Box an f32 bit pattern into a 64-bit register image.
#[inline]
pub fn nan_box(bits: u32) -> u64 {
    0xFFFF_FFFF_0000_0000 | bits as u64
}

/// Unbox a register image into an f32; improperly boxed values read as the
/// canonical NaN.
#[inline]
pub fn unbox32(reg: u64) -> f32 {
    if reg >> 32 == 0xFFFF_FFFF {
        f32::from_bits(reg as u32)
    } else {
        f32::from_bits(CANONICAL_NAN32)
    }
}

#[inline]
pub fn box32(v: f32) -> u64 {
    nan_box(if v.is_nan() { CANONICAL_NAN32 } else { v.to_bits() })
}

#[inline]
pub fn box64(v: f64) -> u64 {
    if v.is_nan() { CANONICAL_NAN64 } else { v.to_bits() }
}

/// Round to an integral value under a RISC-V rounding mode.
pub fn round_rm(v: f64, rm: u32) -> f64 {
    match rm {
        RM_RTZ => v.trunc(),
        RM_RDN => v.floor(),
        RM_RUP => v.ceil(),
        RM_RMM => v.round(),
        _ => {
            // Nearest, ties to even.
            let floor = v.floor();
            let diff = v - floor;
            if diff > 0.5 {
                floor + 1.0
            } else if diff < 0.5 {
                floor
            } else if (floor / 2.0).fract() == 0.0 {
                floor
            } else {
                floor + 1.0
            }
        }
    }
}

macro_rules! fp_width {
    ($m:ident, $t:ty, $b:ty, $mant_bits:expr, $canonical:expr) => {
        pub mod $m {
            use super::*;

            pub fn is_snan(v: $t) -> bool {
                let bits = v.to_bits();
                let quiet = 1 as $b << ($mant_bits - 1);
                v.is_nan() && bits & quiet == 0
            }

            fn canonical() -> $t {
                <$t>::from_bits($canonical)
            }

            fn flags_result(r: $t, invalid: bool, operands_finite: bool) -> u32 {
                let mut flags = if invalid { FFLAG_NV } else { 0 };
                if r.is_infinite() && operands_finite {
                    flags |= FFLAG_OF | FFLAG_NX;
                }
                if r != 0.0 && r.is_subnormal() {
                    flags |= FFLAG_UF | FFLAG_NX;
                }
                flags
            }

            fn bin_flags(a: $t, b: $t, r: $t) -> u32 {
                let invalid = is_snan(a)
                    || is_snan(b)
                    || (r.is_nan() && !a.is_nan() && !b.is_nan());
                flags_result(r, invalid, a.is_finite() && b.is_finite())
            }

            pub fn add(a: $t, b: $t) -> ($t, u32) {
                let r = a + b;
                (r, bin_flags(a, b, r))
            }

            pub fn sub(a: $t, b: $t) -> ($t, u32) {
                let r = a - b;
                (r, bin_flags(a, b, r))
            }

            pub fn mul(a: $t, b: $t) -> ($t, u32) {
                let r = a * b;
                (r, bin_flags(a, b, r))
            }

            pub fn div(a: $t, b: $t) -> ($t, u32) {
                let r = a / b;
                let mut flags = bin_flags(a, b, r);
                if b == 0.0 && !a.is_nan() && a != 0.0 && a.is_finite() {
                    // x/0 for finite non-zero x: divide-by-zero, not
                    // overflow.
                    flags = (flags & !(FFLAG_OF | FFLAG_NX)) | FFLAG_DZ;
                }
                (r, flags)
            }

            pub fn sqrt(a: $t) -> ($t, u32) {
                let r = a.sqrt();
                let invalid = is_snan(a) || (!a.is_nan() && a < 0.0);
                (r, if invalid { FFLAG_NV } else { 0 })
            }

            /// Fused multiply-add `a * b + c`, single rounding on the host.
            pub fn fma(a: $t, b: $t, c: $t) -> ($t, u32) {
                let r = a.mul_add(b, c);
                let inf_times_zero = (a.is_infinite() && b == 0.0)
                    || (a == 0.0 && b.is_infinite());
                let invalid = is_snan(a)
                    || is_snan(b)
                    || is_snan(c)
                    || inf_times_zero
                    || (r.is_nan() && !a.is_nan() && !b.is_nan() && !c.is_nan());
                let finite = a.is_finite() && b.is_finite() && c.is_finite();
                (r, flags_result(r, invalid, finite))
            }

            /// minimumNumber semantics: NaNs lose, -0 orders below +0.
            pub fn min(a: $t, b: $t) -> ($t, u32) {
                let flags = if is_snan(a) || is_snan(b) { FFLAG_NV } else { 0 };
                let r = match (a.is_nan(), b.is_nan()) {
                    (true, true) => canonical(),
                    (true, false) => b,
                    (false, true) => a,
                    (false, false) => {
                        if a == 0.0 && b == 0.0 {
                            if a.is_sign_negative() { a } else { b }
                        } else if a < b {
                            a
                        } else {
                            b
                        }
                    }
                };
                (r, flags)
            }

            pub fn max(a: $t, b: $t) -> ($t, u32) {
                let flags = if is_snan(a) || is_snan(b) { FFLAG_NV } else { 0 };
                let r = match (a.is_nan(), b.is_nan()) {
                    (true, true) => canonical(),
                    (true, false) => b,
                    (false, true) => a,
                    (false, false) => {
                        if a == 0.0 && b == 0.0 {
                            if a.is_sign_positive() { a } else { b }
                        } else if a > b {
                            a
                        } else {
                            b
                        }
                    }
                };
                (r, flags)
            }

            /// Quiet equality: only signaling NaNs raise NV.
            pub fn feq(a: $t, b: $t) -> (bool, u32) {
                let flags = if is_snan(a) || is_snan(b) { FFLAG_NV } else { 0 };
                (a == b, flags)
            }

            /// Signaling comparisons: any NaN raises NV.
            pub fn flt(a: $t, b: $t) -> (bool, u32) {
                let flags = if a.is_nan() || b.is_nan() { FFLAG_NV } else { 0 };
                (a < b, flags)
            }

            pub fn fle(a: $t, b: $t) -> (bool, u32) {
                let flags = if a.is_nan() || b.is_nan() { FFLAG_NV } else { 0 };
                (a <= b, flags)
            }

            /// FCLASS bit per the unprivileged ISA.
            pub fn classify(v: $t) -> u64 {
                let bit = if v.is_nan() {
                    if is_snan(v) { 8 } else { 9 }
                } else if v.is_infinite() {
                    if v.is_sign_negative() { 0 } else { 7 }
                } else if v == 0.0 {
                    if v.is_sign_negative() { 3 } else { 4 }
                } else if v.is_subnormal() {
                    if v.is_sign_negative() { 2 } else { 5 }
                } else if v.is_sign_negative() {
                    1
                } else {
                    6
                };
                1u64 << bit
            }
        }
    };
}

fp_width!(s, f32, u32, 23, 0x7FC0_0000u32);
fp_width!(d, f64, u64, 52, 0x7FF8_0000_0000_0000u64);

/// Convert to a signed integer of `bits` width under `rm`, saturating and
/// raising NV on NaN or out-of-range, NX on inexact.
pub fn to_signed(v: f64, rm: u32, bits: u32) -> (i64, u32) {
    let max = if bits == 64 { i64::MAX } else { (1i64 << (bits - 1)) - 1 };
    let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
    if v.is_nan() {
        return (max, FFLAG_NV);
    }
    let r = round_rm(v, rm);
    // The negative bound is a power of two and exactly representable; the
    // positive one is not, so compare against the exclusive limit.
    if r < min as f64 {
        return (min, FFLAG_NV);
    }
    if r >= 2f64.powi(bits as i32 - 1) {
        return (max, FFLAG_NV);
    }
    (r as i64, if r != v { FFLAG_NX } else { 0 })
}

/// Convert to an unsigned integer of `bits` width under `rm`.
pub fn to_unsigned(v: f64, rm: u32, bits: u32) -> (u64, u32) {
    let max_excl = 2f64.powi(bits as i32);
    let all_ones = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    if v.is_nan() {
        return (all_ones, FFLAG_NV);
    }
    let r = round_rm(v, rm);
    if r < 0.0 {
        return (0, FFLAG_NV);
    }
    if r >= max_excl {
        return (all_ones, FFLAG_NV);
    }
    (r as u64, if r != v { FFLAG_NX } else { 0 })
}

/// NX flag for an integer that didn't survive the float conversion.
pub fn int_to_f32(v: i64) -> (f32, u32) {
    let r = v as f32;
    let rf = r as f64;
    let exact = rf >= -(2f64.powi(63)) && rf < 2f64.powi(63) && rf as i64 == v;
    (r, if exact { 0 } else { FFLAG_NX })
}

pub fn uint_to_f32(v: u64) -> (f32, u32) {
    let r = v as f32;
    let rf = r as f64;
    let exact = rf >= 0.0 && rf < 2f64.powi(64) && rf as u64 == v;
    (r, if exact { 0 } else { FFLAG_NX })
}

pub fn int_to_f64(v: i64) -> (f64, u32) {
    let r = v as f64;
    let exact = r >= -(2f64.powi(63)) && r < 2f64.powi(63) && r as i64 == v;
    (r, if exact { 0 } else { FFLAG_NX })
}

pub fn uint_to_f64(v: u64) -> (f64, u32) {
    let r = v as f64;
    let exact = r >= 0.0 && r < 2f64.powi(64) && r as u64 == v;
    (r, if exact { 0 } else { FFLAG_NX })
}

/// f64 -> f32 demotion with flag reporting.
pub fn demote(v: f64) -> (f32, u32) {
    let r = v as f32;
    let mut flags = if d::is_snan(v) { FFLAG_NV } else { 0 };
    if r.is_infinite() && v.is_finite() {
        flags |= FFLAG_OF | FFLAG_NX;
    } else if !v.is_nan() && r as f64 != v {
        flags |= FFLAG_NX;
        if r != 0.0 && r.is_subnormal() {
            flags |= FFLAG_UF;
        }
    }
    (r, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_boxing_round_trip() {
        let v = 1.5f32;
        assert_eq!(unbox32(box32(v)), v);
        // Improperly boxed: reads as canonical NaN.
        assert!(unbox32(v.to_bits() as u64).is_nan());
    }

    #[test]
    fn divide_by_zero_flag() {
        let (r, flags) = d::div(1.0, 0.0);
        assert!(r.is_infinite());
        assert_eq!(flags, FFLAG_DZ);
        let (r, flags) = d::div(0.0, 0.0);
        assert!(r.is_nan());
        assert_eq!(flags & FFLAG_NV, FFLAG_NV);
    }

    #[test]
    fn min_max_nan_and_zero_rules() {
        let (r, flags) = s::min(f32::NAN, 2.0);
        assert_eq!(r, 2.0);
        assert_eq!(flags, 0);
        let (r, _) = s::min(-0.0f32, 0.0f32);
        assert!(r.is_sign_negative());
        let (r, _) = s::max(-0.0f32, 0.0f32);
        assert!(r.is_sign_positive());
        let snan = f32::from_bits(0x7F80_0001);
        let (_, flags) = s::min(snan, 1.0);
        assert_eq!(flags, FFLAG_NV);
    }

    #[test]
    fn rounding_modes() {
        assert_eq!(round_rm(2.5, RM_RNE), 2.0);
        assert_eq!(round_rm(3.5, RM_RNE), 4.0);
        assert_eq!(round_rm(-1.5, RM_RTZ), -1.0);
        assert_eq!(round_rm(-1.5, RM_RDN), -2.0);
        assert_eq!(round_rm(-1.5, RM_RUP), -1.0);
        assert_eq!(round_rm(2.5, RM_RMM), 3.0);
    }

    #[test]
    fn conversions_saturate() {
        let (v, flags) = to_signed(f64::NAN, RM_RNE, 32);
        assert_eq!(v as i32, i32::MAX);
        assert_eq!(flags, FFLAG_NV);
        let (v, flags) = to_signed(3e10, RM_RNE, 32);
        assert_eq!(v as i32, i32::MAX);
        assert_eq!(flags, FFLAG_NV);
        let (v, flags) = to_unsigned(-1.0, RM_RNE, 32);
        assert_eq!(v, 0);
        assert_eq!(flags, FFLAG_NV);
        let (v, flags) = to_signed(2.5, RM_RTZ, 32);
        assert_eq!(v, 2);
        assert_eq!(flags, FFLAG_NX);
    }

    #[test]
    fn classify_covers_the_table() {
        assert_eq!(d::classify(f64::NEG_INFINITY), 1 << 0);
        assert_eq!(d::classify(-1.0), 1 << 1);
        assert_eq!(d::classify(-0.0), 1 << 3);
        assert_eq!(d::classify(0.0), 1 << 4);
        assert_eq!(d::classify(1.0), 1 << 6);
        assert_eq!(d::classify(f64::INFINITY), 1 << 7);
        assert_eq!(d::classify(f64::NAN), 1 << 9);
        assert_eq!(s::classify(f32::from_bits(0x7F80_0001)), 1 << 8);
    }
}
