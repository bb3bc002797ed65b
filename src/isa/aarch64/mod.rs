//! AArch64 ISA definitions: registers, immediates, instructions, encodings.

pub mod emit;
pub mod imms;
pub mod inst;
pub mod regs;

pub use inst::Inst;
pub use regs::{dreg, vreg, xreg, Reg, RegClass};
