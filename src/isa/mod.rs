//! Target ISA definitions. AArch64 is the only supported target.

pub mod aarch64;
