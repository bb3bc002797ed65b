//! AArch64 ISA definitions: the instruction enum and assembly printing.
//!
//! Each variant carries fully-resolved operands except for branch and
//! address targets, which stay symbolic (label names). The binary encoding
//! lives in `emit`; label-dependent fields encode as zero with a relocation
//! entry attached for the external writer.

use super::imms::{Imm12, MoveWideConst};
use super::regs::Reg;
use crate::stream::Reloc;

use smallvec::SmallVec;

use std::fmt::Write as _;

/// Integer ALU operations with a three-register form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ALUOp {
    Add,
    Sub,
    Mul,
    SDiv,
    And,
    Orr,
    Eor,
    Lsl,
    Lsr,
    Asr,
}

impl ALUOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::SDiv => "sdiv",
            Self::And => "and",
            Self::Orr => "orr",
            Self::Eor => "eor",
            Self::Lsl => "lsl",
            Self::Lsr => "lsr",
            Self::Asr => "asr",
        }
    }
}

/// Scalar double-precision FPU operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FPUOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
}

impl FPUOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::FAdd => "fadd",
            Self::FSub => "fsub",
            Self::FMul => "fmul",
            Self::FDiv => "fdiv",
        }
    }
}

/// NEON vector operations over packed 32-bit lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VecOp {
    Add,
    Sub,
    Mul,
    FAdd,
    FSub,
    FMul,
    FDiv,
    SMin,
    SMax,
    FMin,
    FMax,
    AddP,
    FAddP,
    SMinP,
    SMaxP,
    FMinP,
    FMaxP,
}

impl VecOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::FAdd => "fadd",
            Self::FSub => "fsub",
            Self::FMul => "fmul",
            Self::FDiv => "fdiv",
            Self::SMin => "smin",
            Self::SMax => "smax",
            Self::FMin => "fmin",
            Self::FMax => "fmax",
            Self::AddP => "addp",
            Self::FAddP => "faddp",
            Self::SMinP => "sminp",
            Self::SMaxP => "smaxp",
            Self::FMinP => "fminp",
            Self::FMaxP => "fmaxp",
        }
    }
}

/// Vector arrangements used by the packed value types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VecArr {
    /// Two 32-bit lanes in a 64-bit register (`.2s`).
    S2,
    /// Four 32-bit lanes in a 128-bit register (`.4s`).
    S4,
}

impl VecArr {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::S2 => ".2s",
            Self::S4 => ".4s",
        }
    }

    pub fn q_bit(self) -> u32 {
        match self {
            Self::S2 => 0,
            Self::S4 => 1,
        }
    }
}

/// Condition codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Ge,
    Lt,
    Gt,
    Le,
}

impl Cond {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
        }
    }

    /// Encoding bits.
    pub fn bits(self) -> u32 {
        match self {
            Self::Eq => 0b0000,
            Self::Ne => 0b0001,
            Self::Ge => 0b1010,
            Self::Lt => 0b1011,
            Self::Gt => 0b1100,
            Self::Le => 0b1101,
        }
    }

    pub fn invert(self) -> Cond {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Ge => Self::Lt,
            Self::Lt => Self::Ge,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
        }
    }
}

/// A base-plus-immediate-offset memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemArg {
    pub base: Reg,
    pub offset: i32,
}

impl MemArg {
    pub fn base_only(base: Reg) -> Self {
        Self { base, offset: 0 }
    }

    pub fn offset(base: Reg, offset: i32) -> Self {
        Self { base, offset }
    }

    fn print(&self) -> String {
        let base = base_reg_name(self.base);
        if self.offset == 0 {
            format!("[{base}]")
        } else {
            format!("[{base}, #{}]", self.offset)
        }
    }
}

/// Encoding 31 in a base-register position means SP, not XZR.
fn base_reg_name(reg: Reg) -> String {
    if reg.is_int() && reg.hw_enc() == 31 {
        "sp".to_string()
    } else {
        reg.to_string()
    }
}

/// One AArch64 instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    AluRRR {
        op: ALUOp,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    AluRRImm12 {
        op: ALUOp,
        rd: Reg,
        rn: Reg,
        imm: Imm12,
    },
    CmpRR {
        rn: Reg,
        rm: Reg,
    },
    CmpImm {
        rn: Reg,
        imm: Imm12,
    },
    /// `cset`/`csetm`: materialize a condition as 0/1 or 0/-1.
    CSet {
        rd: Reg,
        cond: Cond,
        /// `csetm` form producing all-ones for true, matching the source
        /// language's -1 truth value.
        mask: bool,
    },
    MovZ {
        rd: Reg,
        imm: MoveWideConst,
    },
    MovK {
        rd: Reg,
        imm: MoveWideConst,
    },
    MovRR {
        rd: Reg,
        rm: Reg,
        /// Exempt from duplicate-MOV suppression.
        nopeep: bool,
    },
    Mvn {
        rd: Reg,
        rm: Reg,
    },
    Ldr {
        rt: Reg,
        mem: MemArg,
        is32: bool,
    },
    Str {
        rt: Reg,
        mem: MemArg,
        is32: bool,
    },
    Stp {
        rt: Reg,
        rt2: Reg,
        base: Reg,
        offset: i32,
    },
    Ldp {
        rt: Reg,
        rt2: Reg,
        base: Reg,
        offset: i32,
    },
    /// `stp rt, rt2, [base, #offset]!`
    StpPre {
        rt: Reg,
        rt2: Reg,
        base: Reg,
        offset: i32,
    },
    /// `ldp rt, rt2, [base], #offset`
    LdpPost {
        rt: Reg,
        rt2: Reg,
        base: Reg,
        offset: i32,
    },
    Adrp {
        rd: Reg,
        label: String,
    },
    /// `add rd, rn, :lo12:label`
    AddLo12 {
        rd: Reg,
        rn: Reg,
        label: String,
    },
    /// `movz rd, #:abs_g0_nc:label` — low 16 bits of an absolute address.
    MovZLabel {
        rd: Reg,
        label: String,
    },
    /// `movk rd, #:abs_g1_nc:label, lsl #16` — high 16 bits.
    MovKLabel {
        rd: Reg,
        label: String,
    },
    B {
        target: String,
    },
    CondBr {
        cond: Cond,
        target: String,
    },
    Bl {
        target: String,
    },
    Blr {
        rn: Reg,
    },
    BrReg {
        rn: Reg,
    },
    Ret,
    /// Signed integer to double.
    Scvtf {
        rd: Reg,
        rn: Reg,
    },
    /// Double to signed integer, truncating.
    Fcvtzs {
        rd: Reg,
        rn: Reg,
    },
    /// `fmov dN, xM`
    FMovToFpu {
        rd: Reg,
        rn: Reg,
    },
    /// `fmov xN, dM`
    FMovFromFpu {
        rd: Reg,
        rn: Reg,
    },
    /// `fmov dN, dM`
    FMovFF {
        rd: Reg,
        rn: Reg,
    },
    FpuRRR {
        op: FPUOp,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    FpuCmp {
        rn: Reg,
        rm: Reg,
    },
    FpuNeg {
        rd: Reg,
        rn: Reg,
    },
    VecRRR {
        op: VecOp,
        arr: VecArr,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    /// Broadcast a general register into every lane.
    VecDup {
        rd: Reg,
        rn: Reg,
        arr: VecArr,
    },
    /// `ld2 {v<t>.2s, v<t+1>.2s}, [rn]` — de-interleaving structure load.
    Ld2 {
        rt: u8,
        arr: VecArr,
        rn: Reg,
    },
    /// `mov v<rd>.d[lane], rn`
    MovToVecLane {
        rd: Reg,
        lane: u8,
        rn: Reg,
    },
    /// `mov rd, v<rn>.d[lane]`
    MovFromVecLane {
        rd: Reg,
        rn: Reg,
        lane: u8,
    },
    Ubfx {
        rd: Reg,
        rn: Reg,
        lsb: u8,
        width: u8,
    },
    /// Left shift by a constant (UBFM alias).
    LslImm {
        rd: Reg,
        rn: Reg,
        shift: u8,
    },
    /// Vector lane conversion, signed int to float.
    VecScvtf {
        rd: Reg,
        rn: Reg,
        arr: VecArr,
    },
    /// `csel rd, rn, rm, cond`
    Csel {
        rd: Reg,
        rn: Reg,
        rm: Reg,
        cond: Cond,
    },
    /// 128-bit load into a Q register.
    Ldr128 {
        rt: Reg,
        mem: MemArg,
    },
    /// 128-bit store from a Q register.
    Str128 {
        rt: Reg,
        mem: MemArg,
    },
    /// `fcvt sN, dM` — double to single.
    FcvtSD {
        rd: Reg,
        rn: Reg,
    },
    /// `fcvt dN, sM` — single to double.
    FcvtDS {
        rd: Reg,
        rn: Reg,
    },
    /// `fmov wN, sM`
    FMovWS {
        rd: Reg,
        rn: Reg,
    },
    /// `fmov sN, wM`
    FMovSW {
        rd: Reg,
        rn: Reg,
    },
    Nop,
}

impl Inst {
    /// Convenience constructor for a plain register move.
    pub fn mov(rd: Reg, rm: Reg) -> Inst {
        Inst::MovRR {
            rd,
            rm,
            nopeep: false,
        }
    }

    /// The MOVZ/MOVK sequence materializing `value` into `rd`.
    pub fn load_constant(rd: Reg, value: u64) -> SmallVec<[Inst; 4]> {
        let chunks = MoveWideConst::sequence_for(value);
        let mut insts = SmallVec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i == 0 {
                insts.push(Inst::MovZ { rd, imm: chunk });
            } else {
                insts.push(Inst::MovK { rd, imm: chunk });
            }
        }
        insts
    }

    /// The symbolic branch/address target and relocation kind, when the
    /// instruction has one.
    pub fn reloc(&self) -> Option<(String, Reloc)> {
        match self {
            Inst::B { target } => Some((target.clone(), Reloc::BranchPcrel26)),
            Inst::Bl { target } => Some((target.clone(), Reloc::BlPcrel26)),
            Inst::CondBr { target, .. } => Some((target.clone(), Reloc::CondBrPcrel19)),
            Inst::Adrp { label, .. } => Some((label.clone(), Reloc::AdrpPcrel21)),
            Inst::AddLo12 { label, .. } => Some((label.clone(), Reloc::AddLo12)),
            Inst::MovZLabel { label, .. } => Some((label.clone(), Reloc::AbsLo16)),
            Inst::MovKLabel { label, .. } => Some((label.clone(), Reloc::AbsHi16)),
            _ => None,
        }
    }

    pub fn is_nopeep(&self) -> bool {
        matches!(self, Inst::MovRR { nopeep: true, .. })
    }

    /// Assembly text.
    pub fn print(&self) -> String {
        let mut s = String::new();
        self.print_into(&mut s);
        s
    }

    fn print_into(&self, s: &mut String) {
        match self {
            Inst::AluRRR { op, rd, rn, rm } => {
                let rn_name = if matches!(op, ALUOp::Sub | ALUOp::Add) && rn.hw_enc() == 31 {
                    "xzr".to_string()
                } else {
                    rn.to_string()
                };
                let _ = write!(s, "{} {}, {}, {}", op.mnemonic(), rd, rn_name, rm);
            }
            Inst::AluRRImm12 { op, rd, rn, imm } => {
                let _ = write!(
                    s,
                    "{} {}, {}, #{}",
                    op.mnemonic(),
                    rd,
                    base_reg_name(*rn),
                    imm.value()
                );
            }
            Inst::CmpRR { rn, rm } => {
                let _ = write!(s, "cmp {rn}, {rm}");
            }
            Inst::CmpImm { rn, imm } => {
                let _ = write!(s, "cmp {}, #{}", rn, imm.value());
            }
            Inst::CSet { rd, cond, mask } => {
                let mnemonic = if *mask { "csetm" } else { "cset" };
                let _ = write!(s, "{} {}, {}", mnemonic, rd, cond.mnemonic());
            }
            Inst::MovZ { rd, imm } => {
                if imm.shift == 0 {
                    let _ = write!(s, "movz {}, #{}", rd, imm.bits);
                } else {
                    let _ = write!(s, "movz {}, #{}, lsl #{}", rd, imm.bits, imm.shift * 16);
                }
            }
            Inst::MovK { rd, imm } => {
                if imm.shift == 0 {
                    let _ = write!(s, "movk {}, #{}", rd, imm.bits);
                } else {
                    let _ = write!(s, "movk {}, #{}, lsl #{}", rd, imm.bits, imm.shift * 16);
                }
            }
            Inst::MovRR { rd, rm, .. } => {
                let _ = write!(s, "mov {rd}, {rm}");
            }
            Inst::Mvn { rd, rm } => {
                let _ = write!(s, "mvn {rd}, {rm}");
            }
            Inst::Ldr { rt, mem, is32 } => {
                let rt_name = load_store_reg_name(*rt, *is32);
                let mnemonic = if mem.offset < 0 { "ldur" } else { "ldr" };
                let _ = write!(s, "{} {}, {}", mnemonic, rt_name, mem.print());
            }
            Inst::Str { rt, mem, is32 } => {
                let rt_name = load_store_reg_name(*rt, *is32);
                let mnemonic = if mem.offset < 0 { "stur" } else { "str" };
                let _ = write!(s, "{} {}, {}", mnemonic, rt_name, mem.print());
            }
            Inst::Stp { rt, rt2, base, offset } => {
                let _ = write!(
                    s,
                    "stp {}, {}, [{}, #{}]",
                    print_lr_fp(*rt),
                    print_lr_fp(*rt2),
                    base_reg_name(*base),
                    offset
                );
            }
            Inst::Ldp { rt, rt2, base, offset } => {
                let _ = write!(
                    s,
                    "ldp {}, {}, [{}, #{}]",
                    print_lr_fp(*rt),
                    print_lr_fp(*rt2),
                    base_reg_name(*base),
                    offset
                );
            }
            Inst::StpPre { rt, rt2, base, offset } => {
                let _ = write!(
                    s,
                    "stp {}, {}, [{}, #{}]!",
                    print_lr_fp(*rt),
                    print_lr_fp(*rt2),
                    base_reg_name(*base),
                    offset
                );
            }
            Inst::LdpPost { rt, rt2, base, offset } => {
                let _ = write!(
                    s,
                    "ldp {}, {}, [{}], #{}",
                    print_lr_fp(*rt),
                    print_lr_fp(*rt2),
                    base_reg_name(*base),
                    offset
                );
            }
            Inst::Adrp { rd, label } => {
                let _ = write!(s, "adrp {rd}, {label}");
            }
            Inst::AddLo12 { rd, rn, label } => {
                let _ = write!(s, "add {rd}, {rn}, :lo12:{label}");
            }
            Inst::MovZLabel { rd, label } => {
                let _ = write!(s, "movz {rd}, #:abs_g0_nc:{label}");
            }
            Inst::MovKLabel { rd, label } => {
                let _ = write!(s, "movk {rd}, #:abs_g1_nc:{label}, lsl #16");
            }
            Inst::B { target } => {
                let _ = write!(s, "b {target}");
            }
            Inst::CondBr { cond, target } => {
                let _ = write!(s, "b.{} {}", cond.mnemonic(), target);
            }
            Inst::Bl { target } => {
                let _ = write!(s, "bl {target}");
            }
            Inst::Blr { rn } => {
                let _ = write!(s, "blr {rn}");
            }
            Inst::BrReg { rn } => {
                let _ = write!(s, "br {rn}");
            }
            Inst::Ret => s.push_str("ret"),
            Inst::Scvtf { rd, rn } => {
                let _ = write!(s, "scvtf {rd}, {rn}");
            }
            Inst::Fcvtzs { rd, rn } => {
                let _ = write!(s, "fcvtzs {rd}, {rn}");
            }
            Inst::FMovToFpu { rd, rn } => {
                let _ = write!(s, "fmov {rd}, {rn}");
            }
            Inst::FMovFromFpu { rd, rn } => {
                let _ = write!(s, "fmov {rd}, {rn}");
            }
            Inst::FMovFF { rd, rn } => {
                let _ = write!(s, "fmov {rd}, {rn}");
            }
            Inst::FpuRRR { op, rd, rn, rm } => {
                let _ = write!(s, "{} {}, {}, {}", op.mnemonic(), rd, rn, rm);
            }
            Inst::FpuCmp { rn, rm } => {
                let _ = write!(s, "fcmp {rn}, {rm}");
            }
            Inst::FpuNeg { rd, rn } => {
                let _ = write!(s, "fneg {rd}, {rn}");
            }
            Inst::VecRRR { op, arr, rd, rn, rm } => {
                let a = arr.suffix();
                let _ = write!(
                    s,
                    "{} {}{}, {}{}, {}{}",
                    op.mnemonic(),
                    rd.v_name(),
                    a,
                    rn.v_name(),
                    a,
                    rm.v_name(),
                    a
                );
            }
            Inst::VecDup { rd, rn, arr } => {
                let _ = write!(s, "dup {}{}, {}", rd.v_name(), arr.suffix(), rn.w_name());
            }
            Inst::Ld2 { rt, arr, rn } => {
                let a = arr.suffix();
                let _ = write!(
                    s,
                    "ld2 {{v{}{}, v{}{}}}, [{}]",
                    rt,
                    a,
                    rt + 1,
                    a,
                    base_reg_name(*rn)
                );
            }
            Inst::MovToVecLane { rd, lane, rn } => {
                let _ = write!(s, "mov {}.d[{}], {}", rd.v_name(), lane, rn);
            }
            Inst::MovFromVecLane { rd, rn, lane } => {
                let _ = write!(s, "mov {}, {}.d[{}]", rd, rn.v_name(), lane);
            }
            Inst::Ubfx { rd, rn, lsb, width } => {
                let _ = write!(s, "ubfx {rd}, {rn}, #{lsb}, #{width}");
            }
            Inst::LslImm { rd, rn, shift } => {
                let _ = write!(s, "lsl {rd}, {rn}, #{shift}");
            }
            Inst::VecScvtf { rd, rn, arr } => {
                let a = arr.suffix();
                let _ = write!(s, "scvtf {}{}, {}{}", rd.v_name(), a, rn.v_name(), a);
            }
            Inst::Csel { rd, rn, rm, cond } => {
                let _ = write!(s, "csel {}, {}, {}, {}", rd, rn, rm, cond.mnemonic());
            }
            Inst::Ldr128 { rt, mem } => {
                let _ = write!(s, "ldr q{}, {}", rt.hw_enc(), mem.print());
            }
            Inst::Str128 { rt, mem } => {
                let _ = write!(s, "str q{}, {}", rt.hw_enc(), mem.print());
            }
            Inst::FcvtSD { rd, rn } => {
                let _ = write!(s, "fcvt s{}, {}", rd.hw_enc(), rn);
            }
            Inst::FcvtDS { rd, rn } => {
                let _ = write!(s, "fcvt {}, s{}", rd, rn.hw_enc());
            }
            Inst::FMovWS { rd, rn } => {
                let _ = write!(s, "fmov {}, s{}", rd.w_name(), rn.hw_enc());
            }
            Inst::FMovSW { rd, rn } => {
                let _ = write!(s, "fmov s{}, {}", rd.hw_enc(), rn.w_name());
            }
            Inst::Nop => s.push_str("nop"),
        }
    }
}

fn load_store_reg_name(rt: Reg, is32: bool) -> String {
    if rt.is_float() {
        rt.to_string()
    } else if is32 {
        rt.w_name()
    } else {
        rt.to_string()
    }
}

/// x29/x30 print as `fp`/`lr` in pair loads and stores, following the
/// conventional prologue spelling.
fn print_lr_fp(reg: Reg) -> String {
    if reg.is_int() {
        match reg.hw_enc() {
            29 => return "x29".to_string(),
            30 => return "x30".to_string(),
            _ => {}
        }
    }
    reg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::regs::{dreg, xreg};

    #[test]
    fn printing() {
        assert_eq!(
            Inst::AluRRR {
                op: ALUOp::Add,
                rd: xreg(0),
                rn: xreg(1),
                rm: xreg(2)
            }
            .print(),
            "add x0, x1, x2"
        );
        assert_eq!(
            Inst::Ldr {
                rt: xreg(0),
                mem: MemArg::offset(xreg(0), 8),
                is32: false
            }
            .print(),
            "ldr x0, [x0, #8]"
        );
        assert_eq!(Inst::Ret.print(), "ret");
        assert_eq!(
            Inst::CondBr {
                cond: Cond::Gt,
                target: "f_ForExit_4".into()
            }
            .print(),
            "b.gt f_ForExit_4"
        );
        assert_eq!(
            Inst::VecRRR {
                op: VecOp::Add,
                arr: VecArr::S2,
                rd: dreg(0),
                rn: dreg(0),
                rm: dreg(1)
            }
            .print(),
            "add v0.2s, v0.2s, v1.2s"
        );
        assert_eq!(
            Inst::Str {
                rt: xreg(1),
                mem: MemArg::offset(xreg(29), -16),
                is32: false
            }
            .print(),
            "stur x1, [x29, #-16]"
        );
    }

    #[test]
    fn load_constant_sequences() {
        let insts = Inst::load_constant(xreg(9), 1);
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].print(), "movz x9, #1");
        let insts = Inst::load_constant(xreg(9), 0x0001_0000_0002);
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].print(), "movz x9, #2");
        assert_eq!(insts[1].print(), "movk x9, #1, lsl #32");
    }

    #[test]
    fn cond_inversion() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Le.invert(), Cond::Gt);
        assert_eq!(Cond::Lt.invert(), Cond::Ge);
    }

    #[test]
    fn relocs() {
        assert_eq!(
            Inst::Bl {
                target: "veneer_WRITES".into()
            }
            .reloc(),
            Some(("veneer_WRITES".to_string(), Reloc::BlPcrel26))
        );
        assert_eq!(Inst::Ret.reloc(), None);
    }
}
