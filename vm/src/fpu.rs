//! Floating point register file and host-arithmetic helpers
//!
//! Each register is a tagged 64 bit slot carrying both a single and a double
//! interpretation; the `is_double` tag only drives display, the semantic
//! width always comes from the executing instruction.
//!
//! The host FPU's exception flags are not observable from safe Rust, so the
//! accrued `fflags` bits are derived from operand and result classification
//! instead. Arithmetic results that come out NaN are written back as the
//! architectural canonical NaN.

use riscv::csr::{FFLAG_DZ, FFLAG_NV, FFLAG_NX, FFLAG_OF, FFLAG_UF};

pub const CANONICAL_NAN_F32: u32 = 0x7fc0_0000;
pub const CANONICAL_NAN_F64: u64 = 0x7ff8_0000_0000_0000;

/// One floating point register.
#[derive(Debug, Copy, Clone, Default)]
pub struct FpReg {
    pub bits: u64,
    /// Advisory display tag; never gates arithmetic.
    pub is_double: bool,
}

/// The 32 entry floating point register file.
#[derive(Debug, Copy, Clone)]
pub struct FpRegisters {
    regs: [FpReg; 32],
}

impl FpRegisters {
    pub fn new() -> Self {
        FpRegisters {
            regs: [FpReg::default(); 32],
        }
    }

    pub fn reg(&self, r: u8) -> FpReg {
        self.regs[r as usize & 31]
    }

    pub fn f32(&self, r: u8) -> f32 {
        f32::from_bits(self.regs[r as usize & 31].bits as u32)
    }

    pub fn f64(&self, r: u8) -> f64 {
        f64::from_bits(self.regs[r as usize & 31].bits)
    }

    pub fn f32_bits(&self, r: u8) -> u32 {
        self.regs[r as usize & 31].bits as u32
    }

    pub fn f64_bits(&self, r: u8) -> u64 {
        self.regs[r as usize & 31].bits
    }

    /// Store an arithmetic single result, canonicalizing NaNs.
    pub fn set_f32(&mut self, r: u8, value: f32) {
        let bits = if value.is_nan() {
            CANONICAL_NAN_F32
        } else {
            value.to_bits()
        };
        self.set_f32_bits(r, bits);
    }

    /// Store an arithmetic double result, canonicalizing NaNs.
    pub fn set_f64(&mut self, r: u8, value: f64) {
        let bits = if value.is_nan() {
            CANONICAL_NAN_F64
        } else {
            value.to_bits()
        };
        self.set_f64_bits(r, bits);
    }

    /// Store raw single bits (loads and moves keep NaN payloads).
    pub fn set_f32_bits(&mut self, r: u8, bits: u32) {
        self.regs[r as usize & 31] = FpReg {
            bits: bits as u64,
            is_double: false,
        };
    }

    /// Store raw double bits (loads and moves keep NaN payloads).
    pub fn set_f64_bits(&mut self, r: u8, bits: u64) {
        self.regs[r as usize & 31] = FpReg {
            bits,
            is_double: true,
        };
    }

    pub fn snapshot(&self) -> [FpReg; 32] {
        self.regs
    }
}

impl Default for FpRegisters {
    fn default() -> Self {
        Self::new()
    }
}

fn is_snan_f64(v: f64) -> bool {
    v.is_nan() && v.to_bits() & (1 << 51) == 0
}

fn is_snan_f32(v: f32) -> bool {
    v.is_nan() && v.to_bits() & (1 << 22) == 0
}

macro_rules! arith_flags {
    ($name:ident, $ty:ty, $snan:ident) => {
        /// Derive the accrued flags of an arithmetic operation from its
        /// operands and result.
        pub fn $name(operands: &[$ty], result: $ty) -> u64 {
            let mut flags = 0;

            if operands.iter().any(|v| $snan(*v)) {
                flags |= FFLAG_NV;
            }
            if result.is_nan() && !operands.iter().any(|v| v.is_nan()) {
                // an invalid operation manufactured the NaN
                flags |= FFLAG_NV;
            }
            if result.is_infinite() && operands.iter().all(|v| v.is_finite()) {
                flags |= FFLAG_OF | FFLAG_NX;
            }
            if result != 0.0 && result.is_subnormal() {
                flags |= FFLAG_UF | FFLAG_NX;
            }

            flags
        }
    };
}

arith_flags!(arith_flags_f64, f64, is_snan_f64);
arith_flags!(arith_flags_f32, f32, is_snan_f32);

/// Flags of a division, which additionally reports divide-by-zero.
pub fn div_flags_f64(a: f64, b: f64, result: f64) -> u64 {
    let mut flags = arith_flags_f64(&[a, b], result);
    if b == 0.0 && a.is_finite() && a != 0.0 {
        flags |= FFLAG_DZ;
        flags &= !(FFLAG_OF | FFLAG_NX);
    }
    flags
}

pub fn div_flags_f32(a: f32, b: f32, result: f32) -> u64 {
    let mut flags = arith_flags_f32(&[a, b], result);
    if b == 0.0 && a.is_finite() && a != 0.0 {
        flags |= FFLAG_DZ;
        flags &= !(FFLAG_OF | FFLAG_NX);
    }
    flags
}

pub fn sqrt_flags_f64(a: f64, result: f64) -> u64 {
    if a < 0.0 {
        FFLAG_NV
    } else {
        arith_flags_f64(&[a], result)
    }
}

pub fn sqrt_flags_f32(a: f32, result: f32) -> u64 {
    if a < 0.0 {
        FFLAG_NV
    } else {
        arith_flags_f32(&[a], result)
    }
}

macro_rules! float_to_int {
    ($name:ident, $float:ty, $int:ty) => {
        /// Convert with RISC-V saturation: NaN and overflow clamp to the
        /// nearest representable bound and raise NV, inexact truncation
        /// raises NX.
        pub fn $name(value: $float) -> ($int, u64) {
            if value.is_nan() {
                return (<$int>::MAX, FFLAG_NV);
            }

            let truncated = value.trunc();
            if truncated < <$int>::MIN as $float {
                return (<$int>::MIN, FFLAG_NV);
            }
            if truncated >= -(<$int>::MIN as $float) && <$int>::MIN != 0 {
                return (<$int>::MAX, FFLAG_NV);
            }
            if <$int>::MIN == 0 && truncated >= <$int>::MAX as $float + 1.0 {
                return (<$int>::MAX, FFLAG_NV);
            }

            let flags = if truncated != value { FFLAG_NX } else { 0 };
            (truncated as $int, flags)
        }
    };
}

float_to_int!(f64_to_i32, f64, i32);
float_to_int!(f64_to_u32, f64, u32);
float_to_int!(f64_to_i64, f64, i64);
float_to_int!(f64_to_u64, f64, u64);

pub fn f32_to_i32(value: f32) -> (i32, u64) {
    f64_to_i32(value as f64)
}

pub fn f32_to_u32(value: f32) -> (u32, u64) {
    f64_to_u32(value as f64)
}

pub fn f32_to_i64(value: f32) -> (i64, u64) {
    f64_to_i64(value as f64)
}

pub fn f32_to_u64(value: f32) -> (u64, u64) {
    f64_to_u64(value as f64)
}

/// NX detection for integer to float conversions: exact iff the result
/// converts back to the operand.
pub fn int_to_float_flags(value: i128, result: f64) -> u64 {
    if result.is_finite() && result.fract() == 0.0 && result as i128 == value {
        0
    } else {
        FFLAG_NX
    }
}

macro_rules! min_max {
    ($min:ident, $max:ident, $ty:ty, $snan:ident, $canonical:expr, $from_bits:path) => {
        /// RISC-V minimum: NaNs lose, two NaNs produce the canonical NaN,
        /// and -0.0 orders below +0.0. Signaling operands raise NV.
        pub fn $min(a: $ty, b: $ty) -> ($ty, u64) {
            let flags = if $snan(a) || $snan(b) { FFLAG_NV } else { 0 };
            let result = match (a.is_nan(), b.is_nan()) {
                (true, true) => $from_bits($canonical),
                (true, false) => b,
                (false, true) => a,
                (false, false) => {
                    if a == 0.0 && b == 0.0 {
                        if a.is_sign_negative() {
                            a
                        } else {
                            b
                        }
                    } else {
                        a.min(b)
                    }
                }
            };
            (result, flags)
        }

        /// RISC-V maximum, mirror of the minimum rules.
        pub fn $max(a: $ty, b: $ty) -> ($ty, u64) {
            let flags = if $snan(a) || $snan(b) { FFLAG_NV } else { 0 };
            let result = match (a.is_nan(), b.is_nan()) {
                (true, true) => $from_bits($canonical),
                (true, false) => b,
                (false, true) => a,
                (false, false) => {
                    if a == 0.0 && b == 0.0 {
                        if a.is_sign_positive() {
                            a
                        } else {
                            b
                        }
                    } else {
                        a.max(b)
                    }
                }
            };
            (result, flags)
        }
    };
}

min_max!(
    fmin_f64,
    fmax_f64,
    f64,
    is_snan_f64,
    CANONICAL_NAN_F64,
    f64::from_bits
);
min_max!(
    fmin_f32,
    fmax_f32,
    f32,
    is_snan_f32,
    CANONICAL_NAN_F32,
    f32::from_bits
);

macro_rules! fclass {
    ($name:ident, $ty:ty, $snan:ident) => {
        /// The ten-category classification of the FCLASS instructions.
        pub fn $name(value: $ty) -> u64 {
            if value.is_nan() {
                return if $snan(value) { 1 << 8 } else { 1 << 9 };
            }
            let negative = value.is_sign_negative();
            let bit = if value.is_infinite() {
                if negative {
                    0
                } else {
                    7
                }
            } else if value == 0.0 {
                if negative {
                    3
                } else {
                    4
                }
            } else if value.is_subnormal() {
                if negative {
                    2
                } else {
                    5
                }
            } else if negative {
                1
            } else {
                6
            };
            1 << bit
        }
    };
}

fclass!(fclass_f64, f64, is_snan_f64);
fclass!(fclass_f32, f32, is_snan_f32);

/// Comparison flags: FLT/FLE signal on any NaN operand, FEQ only on
/// signaling NaNs.
pub fn compare_flags_f64(a: f64, b: f64, signaling: bool) -> u64 {
    let invalid = if signaling {
        a.is_nan() || b.is_nan()
    } else {
        is_snan_f64(a) || is_snan_f64(b)
    };
    if invalid {
        FFLAG_NV
    } else {
        0
    }
}

pub fn compare_flags_f32(a: f32, b: f32, signaling: bool) -> u64 {
    let invalid = if signaling {
        a.is_nan() || b.is_nan()
    } else {
        is_snan_f32(a) || is_snan_f32(b)
    };
    if invalid {
        FFLAG_NV
    } else {
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_tag_is_advisory() {
        let mut regs = FpRegisters::new();
        regs.set_f64(1, 2.5);
        assert!(regs.reg(1).is_double);

        // reading the single view still works on the raw bits
        regs.set_f32(1, 1.5);
        assert!(!regs.reg(1).is_double);
        assert_eq!(regs.f32(1), 1.5);
    }

    #[test]
    fn test_nan_canonicalization() {
        let mut regs = FpRegisters::new();
        regs.set_f32(0, f32::NAN);
        assert_eq!(regs.f32_bits(0), CANONICAL_NAN_F32);
        regs.set_f64(0, f64::NAN);
        assert_eq!(regs.f64_bits(0), CANONICAL_NAN_F64);

        // loads keep payloads untouched
        regs.set_f64_bits(0, 0x7ff8_0000_0000_1234);
        assert_eq!(regs.f64_bits(0), 0x7ff8_0000_0000_1234);
    }

    #[test]
    fn test_invalid_operation_flags() {
        let r = f64::INFINITY - f64::INFINITY;
        assert_eq!(
            arith_flags_f64(&[f64::INFINITY, f64::INFINITY], r) & FFLAG_NV,
            FFLAG_NV
        );

        // quiet NaN in, NaN out is not an invalid operation
        let r = f64::NAN + 1.0;
        assert_eq!(arith_flags_f64(&[f64::NAN, 1.0], r), 0);
    }

    #[test]
    fn test_division_by_zero_flag() {
        let r = 1.0f64 / 0.0;
        assert_eq!(div_flags_f64(1.0, 0.0, r), FFLAG_DZ);
        // zero over zero is invalid, not divide-by-zero
        let r = 0.0f64 / 0.0;
        assert_eq!(div_flags_f64(0.0, 0.0, r) & FFLAG_NV, FFLAG_NV);
    }

    #[test]
    fn test_float_to_int_saturation() {
        assert_eq!(f64_to_i32(f64::NAN), (i32::MAX, FFLAG_NV));
        assert_eq!(f64_to_i32(3.0e10), (i32::MAX, FFLAG_NV));
        assert_eq!(f64_to_i32(-3.0e10), (i32::MIN, FFLAG_NV));
        assert_eq!(f64_to_i32(-2.5), (-2, FFLAG_NX));
        assert_eq!(f64_to_i32(7.0), (7, 0));

        assert_eq!(f64_to_u32(-1.0), (u32::MIN, FFLAG_NV));
        assert_eq!(f64_to_u32(-0.5), (0, FFLAG_NX));
        assert_eq!(f64_to_u64(1.8446744073709552e20), (u64::MAX, FFLAG_NV));
        assert_eq!(f64_to_i64(-9.3e18), (i64::MIN, FFLAG_NV));
    }

    #[test]
    fn test_min_max_nan_rules() {
        let (r, flags) = fmin_f64(f64::NAN, 2.0);
        assert_eq!((r, flags), (2.0, 0));

        let (r, _) = fmax_f64(f64::NAN, f64::NAN);
        assert_eq!(r.to_bits(), CANONICAL_NAN_F64);

        let (r, _) = fmin_f64(0.0, -0.0);
        assert!(r.is_sign_negative());
        let (r, _) = fmax_f64(0.0, -0.0);
        assert!(r.is_sign_positive());
    }

    #[test]
    fn test_fclass_categories() {
        assert_eq!(fclass_f64(f64::NEG_INFINITY), 1 << 0);
        assert_eq!(fclass_f64(-1.0), 1 << 1);
        assert_eq!(fclass_f64(-0.0), 1 << 3);
        assert_eq!(fclass_f64(0.0), 1 << 4);
        assert_eq!(fclass_f64(1.0), 1 << 6);
        assert_eq!(fclass_f64(f64::INFINITY), 1 << 7);
        assert_eq!(fclass_f64(f64::NAN), 1 << 9);
        assert_eq!(fclass_f32(f32::from_bits(0x7f80_0001)), 1 << 8);
    }

    #[test]
    fn test_int_to_float_exactness() {
        assert_eq!(int_to_float_flags(7, 7.0), 0);
        // 2^53 + 1 is not representable in f64
        let big = (1i128 << 53) + 1;
        assert_eq!(int_to_float_flags(big, big as f64), FFLAG_NX);
    }
}
