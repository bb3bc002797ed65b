//! The `VarType` lattice.
//!
//! Every value the compiler reasons about carries a `VarType`: a bit-flag
//! encoding combining one *base* (integer, float, string, object, ...) with at
//! most a couple of *container* flags (pointer-to, vec, list, pair, quad, ...)
//! and the `CONST` modifier. The packed-lane value types (`PAIR`, `FPAIR`,
//! `QUAD`, `FQUAD`) describe 32-bit lanes inside a single 64- or 128-bit NEON
//! register; everything else is one 64-bit word.

use std::fmt;

/// A variable/expression type, encoded as bit flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarType(u32);

impl VarType {
    // Base types occupy the low byte.
    pub const UNKNOWN: Self = Self(0);
    pub const INTEGER: Self = Self(1 << 0);
    pub const FLOAT: Self = Self(1 << 1);
    pub const STRING: Self = Self(1 << 2);
    pub const OBJECT: Self = Self(1 << 3);
    pub const ANY: Self = Self(1 << 4);
    pub const NOTUSED: Self = Self(1 << 5);

    // Containers.
    pub const POINTER_TO: Self = Self(1 << 8);
    pub const VEC: Self = Self(1 << 9);
    pub const LIST: Self = Self(1 << 10);
    pub const TABLE: Self = Self(1 << 11);
    pub const PAIR: Self = Self(1 << 12);
    pub const PAIRS: Self = Self(1 << 13);
    pub const FPAIR: Self = Self(1 << 14);
    pub const FPAIRS: Self = Self(1 << 15);
    pub const QUAD: Self = Self(1 << 16);
    pub const FQUAD: Self = Self(1 << 17);
    pub const OCT: Self = Self(1 << 18);
    pub const FOCT: Self = Self(1 << 19);
    pub const LIST_NODE: Self = Self(1 << 20);

    // Modifiers.
    pub const CONST: Self = Self(1 << 24);

    const BASE_MASK: u32 = 0xff;
    const CONTAINER_MASK: u32 = 0x00ff_ff00;

    /// Combine two type flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if every flag in `flags` is present.
    pub const fn contains(self, flags: Self) -> bool {
        (self.0 & flags.0) == flags.0
    }

    /// The base component alone, with containers and modifiers stripped.
    pub const fn base(self) -> Self {
        Self(self.0 & Self::BASE_MASK)
    }

    /// The container component alone.
    pub const fn container(self) -> Self {
        Self(self.0 & Self::CONTAINER_MASK)
    }

    /// Strip the `CONST` modifier.
    pub const fn without_const(self) -> Self {
        Self(self.0 & !Self::CONST.0)
    }

    /// True for scalar FLOAT values that live in a D register. Packed float
    /// lane types (`FPAIR`, `FQUAD`) are moved through X registers and are
    /// deliberately not included.
    pub const fn is_float(self) -> bool {
        self.base().0 == Self::FLOAT.0 && self.container().0 == 0
    }

    /// True when a value of this type lives in the FP/SIMD register file:
    /// scalar floats and the 128-bit packed types. The 64-bit packed types
    /// (`PAIR`, `FPAIR`) travel in general registers and only visit the
    /// vector unit for arithmetic.
    pub const fn uses_fp_register(self) -> bool {
        self.is_float() || self.0 & (Self::QUAD.0 | Self::FQUAD.0) != 0
    }

    /// True for the packed-lane value types that NEON arithmetic applies to.
    pub const fn is_packed(self) -> bool {
        self.0 & (Self::PAIR.0 | Self::FPAIR.0 | Self::QUAD.0 | Self::FQUAD.0 | Self::OCT.0 | Self::FOCT.0)
            != 0
    }

    /// True for any of the list shapes (including `CONST` lists).
    pub const fn is_list(self) -> bool {
        self.0 & Self::LIST.0 != 0
    }

    /// The element type produced by `HD` on a value of this type.
    pub fn list_element_type(self) -> Self {
        if self.contains(Self::FLOAT) {
            Self::FLOAT
        } else if self.contains(Self::ANY) {
            Self::ANY
        } else {
            Self::INTEGER
        }
    }

    /// A pointer to this type.
    #[must_use]
    pub const fn pointer_to(self) -> Self {
        self.with(Self::POINTER_TO)
    }

    /// The name `TYPE(expr)` folds to during inference.
    pub fn type_name(self) -> &'static str {
        if self.contains(Self::CONST) {
            return self.without_const().type_name_inner();
        }
        self.type_name_inner()
    }

    fn type_name_inner(self) -> &'static str {
        match self {
            t if t.contains(Self::POINTER_TO) && t.contains(Self::VEC) && t.contains(Self::FLOAT) => {
                "POINTER TO FLOAT VEC"
            }
            t if t.contains(Self::POINTER_TO) && t.contains(Self::VEC) => "POINTER TO VEC",
            t if t.contains(Self::POINTER_TO) && t.contains(Self::LIST) => "POINTER TO LIST",
            t if t.contains(Self::POINTER_TO) && t.contains(Self::STRING) => "POINTER TO STRING",
            t if t.contains(Self::POINTER_TO) && t.contains(Self::TABLE) => "POINTER TO TABLE",
            t if t.contains(Self::POINTER_TO) && t.contains(Self::OBJECT) => "POINTER TO OBJECT",
            t if t.contains(Self::POINTER_TO) => "POINTER",
            t if t.contains(Self::PAIRS) => "PAIRS",
            t if t.contains(Self::FPAIRS) => "FPAIRS",
            t if t.contains(Self::PAIR) => "PAIR",
            t if t.contains(Self::FPAIR) => "FPAIR",
            t if t.contains(Self::QUAD) => "QUAD",
            t if t.contains(Self::FQUAD) => "FQUAD",
            t if t.contains(Self::OCT) => "OCT",
            t if t.contains(Self::FOCT) => "FOCT",
            t if t.contains(Self::LIST_NODE) => "LIST NODE",
            t if t.contains(Self::LIST) && t.contains(Self::FLOAT) => "FLOAT LIST",
            t if t.contains(Self::LIST) => "LIST",
            t if t.contains(Self::VEC) && t.contains(Self::FLOAT) => "FLOAT VEC",
            t if t.contains(Self::VEC) => "VEC",
            t if t.contains(Self::TABLE) && t.contains(Self::FLOAT) => "FLOAT TABLE",
            t if t.contains(Self::TABLE) => "TABLE",
            t if t.base() == Self::FLOAT => "FLOAT",
            t if t.base() == Self::STRING => "STRING",
            t if t.base() == Self::OBJECT => "OBJECT",
            t if t.base() == Self::ANY => "ANY",
            t if t.base() == Self::NOTUSED => "NOTUSED",
            t if t.base() == Self::INTEGER => "INTEGER",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for VarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VarType({})", self.type_name())
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_and_container_split() {
        let t = VarType::FLOAT.with(VarType::VEC).with(VarType::POINTER_TO);
        assert_eq!(t.base(), VarType::FLOAT);
        assert!(t.contains(VarType::VEC));
        assert!(t.contains(VarType::POINTER_TO));
        assert!(!t.is_float());
    }

    #[test]
    fn packed_types() {
        assert!(VarType::INTEGER.with(VarType::PAIR).is_packed());
        assert!(VarType::FLOAT.with(VarType::FQUAD).is_packed());
        assert!(!VarType::INTEGER.is_packed());
        assert!(VarType::FLOAT.is_float());
        assert!(VarType::FLOAT.with(VarType::FQUAD).uses_fp_register());
        assert!(!VarType::INTEGER.with(VarType::PAIR).uses_fp_register());
    }

    #[test]
    fn const_is_orthogonal() {
        let t = VarType::INTEGER.with(VarType::LIST).with(VarType::CONST);
        assert!(t.contains(VarType::CONST));
        assert_eq!(t.without_const(), VarType::INTEGER.with(VarType::LIST));
        assert_eq!(t.type_name(), "LIST");
    }

    #[test]
    fn element_types() {
        assert_eq!(
            VarType::FLOAT.with(VarType::LIST).list_element_type(),
            VarType::FLOAT
        );
        assert_eq!(
            VarType::INTEGER.with(VarType::LIST).list_element_type(),
            VarType::INTEGER
        );
        assert_eq!(VarType::ANY.with(VarType::LIST).list_element_type(), VarType::ANY);
    }
}
