//! AArch64 ISA definitions: immediate constants.
//!
//! Each immediate format is a small newtype with a `maybe_from_*` constructor
//! that fails when the value does not fit, and a `bits` method producing the
//! field for encoding. Instruction selection asks the constructor first and
//! falls back to materializing the value in a register when it gets `None`.

use smallvec::SmallVec;

/// A 12-bit unsigned immediate for ADD/SUB/CMP, optionally shifted left 12.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Imm12 {
    /// Unshifted 12-bit payload.
    pub bits: u16,
    /// Whether the payload is shifted left by 12 bits.
    pub shift12: bool,
}

impl Imm12 {
    /// Compute an Imm12 from a u64 constant, if possible.
    pub fn maybe_from_u64(value: u64) -> Option<Imm12> {
        if value < 0x1000 {
            Some(Imm12 {
                bits: value as u16,
                shift12: false,
            })
        } else if value < 0x100_0000 && (value & 0xfff) == 0 {
            Some(Imm12 {
                bits: (value >> 12) as u16,
                shift12: true,
            })
        } else {
            None
        }
    }

    pub fn zero() -> Imm12 {
        Imm12 {
            bits: 0,
            shift12: false,
        }
    }

    /// The represented value.
    pub fn value(&self) -> u64 {
        let v = u64::from(self.bits);
        if self.shift12 {
            v << 12
        } else {
            v
        }
    }

    /// Bits for the shift field.
    pub fn shift_bits(&self) -> u32 {
        u32::from(self.shift12)
    }

    /// Bits for the 12-bit field.
    pub fn imm_bits(&self) -> u32 {
        u32::from(self.bits)
    }
}

/// A 9-bit signed offset for unscaled loads and stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SImm9 {
    pub value: i16,
}

impl SImm9 {
    pub fn maybe_from_i64(value: i64) -> Option<SImm9> {
        if (-256..=255).contains(&value) {
            Some(SImm9 {
                value: value as i16,
            })
        } else {
            None
        }
    }

    /// Bits for encoding.
    pub fn bits(&self) -> u32 {
        (self.value as u32) & 0x1ff
    }
}

/// An unsigned 12-bit offset scaled by the access size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UImm12Scaled {
    /// The byte offset.
    pub value: u32,
    /// Access size in bytes; must divide `value`.
    pub scale: u32,
}

impl UImm12Scaled {
    pub fn maybe_from_i64(value: i64, scale: u32) -> Option<UImm12Scaled> {
        debug_assert!(scale.is_power_of_two());
        let limit = 4095 * i64::from(scale);
        if value >= 0 && value <= limit && (value % i64::from(scale)) == 0 {
            Some(UImm12Scaled {
                value: value as u32,
                scale,
            })
        } else {
            None
        }
    }

    /// Bits for encoding (the scaled index).
    pub fn bits(&self) -> u32 {
        (self.value / self.scale) & 0xfff
    }
}

/// A signed, scaled 7-bit offset for register-pair loads and stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SImm7Scaled {
    /// The byte offset.
    pub value: i32,
    pub scale: u32,
}

impl SImm7Scaled {
    pub fn maybe_from_i64(value: i64, scale: u32) -> Option<SImm7Scaled> {
        debug_assert!(scale.is_power_of_two());
        let scale_i = i64::from(scale);
        let lower = -64 * scale_i;
        let upper = 63 * scale_i;
        if value >= lower && value <= upper && (value % scale_i) == 0 {
            Some(SImm7Scaled {
                value: value as i32,
                scale,
            })
        } else {
            None
        }
    }

    /// Bits for encoding.
    pub fn bits(&self) -> u32 {
        ((self.value / self.scale as i32) as u32) & 0x7f
    }
}

/// One 16-bit chunk of a MOVZ/MOVK wide-move sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveWideConst {
    pub bits: u16,
    /// Half-word index, 0..=3 (shift = 16 * index).
    pub shift: u8,
}

impl MoveWideConst {
    /// A single MOVZ representing `value`, if one 16-bit chunk suffices.
    pub fn maybe_from_u64(value: u64) -> Option<MoveWideConst> {
        for shift in 0..4u8 {
            let masked = value & (0xffff << (16 * shift));
            if masked == value {
                return Some(MoveWideConst {
                    bits: (value >> (16 * shift)) as u16,
                    shift,
                });
            }
        }
        None
    }

    /// Decompose `value` into the MOVZ + MOVK chunks needed to materialize
    /// it. Zero chunks after the first are skipped.
    pub fn sequence_for(value: u64) -> SmallVec<[MoveWideConst; 4]> {
        let mut chunks = SmallVec::new();
        for shift in 0..4u8 {
            let bits = ((value >> (16 * shift)) & 0xffff) as u16;
            if bits != 0 || (shift == 0 && chunks.is_empty() && value == 0) {
                chunks.push(MoveWideConst { bits, shift });
            }
        }
        if chunks.is_empty() {
            chunks.push(MoveWideConst { bits: 0, shift: 0 });
        }
        chunks
    }

    pub fn value_bits(&self) -> u32 {
        u32::from(self.bits)
    }

    pub fn shift_bits(&self) -> u32 {
        u32::from(self.shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imm12_ranges() {
        assert_eq!(
            Imm12::maybe_from_u64(4095),
            Some(Imm12 {
                bits: 4095,
                shift12: false
            })
        );
        assert_eq!(Imm12::maybe_from_u64(4096).unwrap().value(), 4096);
        assert!(Imm12::maybe_from_u64(4096).unwrap().shift12);
        assert_eq!(Imm12::maybe_from_u64(4097), None);
        assert_eq!(Imm12::maybe_from_u64(0x1000_0000), None);
    }

    #[test]
    fn simm9_range() {
        assert!(SImm9::maybe_from_i64(-256).is_some());
        assert!(SImm9::maybe_from_i64(255).is_some());
        assert!(SImm9::maybe_from_i64(256).is_none());
        assert_eq!(SImm9::maybe_from_i64(-1).unwrap().bits(), 0x1ff);
    }

    #[test]
    fn uimm12_scaled_alignment() {
        assert_eq!(UImm12Scaled::maybe_from_i64(16, 8).unwrap().bits(), 2);
        assert!(UImm12Scaled::maybe_from_i64(12, 8).is_none());
        assert!(UImm12Scaled::maybe_from_i64(8 * 4095, 8).is_some());
        assert!(UImm12Scaled::maybe_from_i64(8 * 4096, 8).is_none());
    }

    #[test]
    fn simm7_scaled_range() {
        assert!(SImm7Scaled::maybe_from_i64(-512, 8).is_some());
        assert!(SImm7Scaled::maybe_from_i64(504, 8).is_some());
        assert!(SImm7Scaled::maybe_from_i64(512, 8).is_none());
    }

    #[test]
    fn move_wide_sequences() {
        assert_eq!(
            MoveWideConst::maybe_from_u64(0xffff),
            Some(MoveWideConst { bits: 0xffff, shift: 0 })
        );
        assert_eq!(
            MoveWideConst::maybe_from_u64(0xffff_0000),
            Some(MoveWideConst {
                bits: 0xffff,
                shift: 1
            })
        );
        assert_eq!(MoveWideConst::maybe_from_u64(0x1_0001), None);
        let seq = MoveWideConst::sequence_for(0x0001_0002_0003_0004);
        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0], MoveWideConst { bits: 4, shift: 0 });
        assert_eq!(seq[3], MoveWideConst { bits: 1, shift: 3 });
        assert_eq!(MoveWideConst::sequence_for(0).len(), 1);
    }
}
