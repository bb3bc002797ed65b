//! AArch64 ISA: binary code emission.
//!
//! `Inst::encode` produces the 32-bit instruction word. Fields that depend on
//! a label (branch offsets, page offsets, absolute address halves) encode as
//! zero; the relocation entry attached to the stream entry tells the external
//! writer which bits to patch.

use super::imms::{SImm7Scaled, SImm9, UImm12Scaled};
use super::inst::{ALUOp, FPUOp, Inst, VecArr, VecOp};
use super::regs::{Reg, RegClass};

pub(crate) fn machreg_to_gpr(m: Reg) -> u32 {
    debug_assert_eq!(m.class(), RegClass::Int);
    u32::from(m.hw_enc() & 31)
}

pub(crate) fn machreg_to_vec(m: Reg) -> u32 {
    debug_assert_eq!(m.class(), RegClass::Float);
    u32::from(m.hw_enc() & 31)
}

fn machreg_to_gpr_or_vec(m: Reg) -> u32 {
    u32::from(m.hw_enc() & 31)
}

pub(crate) fn enc_arith_rrr(bits_31_21: u32, bits_15_10: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (bits_31_21 << 21)
        | (bits_15_10 << 10)
        | machreg_to_gpr(rd)
        | (machreg_to_gpr(rn) << 5)
        | (machreg_to_gpr(rm) << 16)
}

fn enc_arith_rr_imm12(bits_31_24: u32, immshift: u32, imm12: u32, rn: Reg, rd: Reg) -> u32 {
    (bits_31_24 << 24)
        | (immshift << 22)
        | (imm12 << 10)
        | (machreg_to_gpr(rn) << 5)
        | machreg_to_gpr(rd)
}

fn enc_arith_rrrr(top11: u32, rm: Reg, bit15: u32, ra: u32, rn: Reg, rd: Reg) -> u32 {
    (top11 << 21)
        | (machreg_to_gpr(rm) << 16)
        | (bit15 << 15)
        | (ra << 10)
        | (machreg_to_gpr(rn) << 5)
        | machreg_to_gpr(rd)
}

fn enc_move_wide(op_31_23: u32, shift: u32, bits: u32, rd: Reg) -> u32 {
    (op_31_23 << 23) | (shift << 21) | (bits << 5) | machreg_to_gpr(rd)
}

fn enc_ldst_uimm12(op_31_22: u32, uimm12: UImm12Scaled, rn: Reg, rd: Reg) -> u32 {
    (op_31_22 << 22)
        | (0b1 << 24)
        | (uimm12.bits() << 10)
        | (machreg_to_gpr(rn) << 5)
        | machreg_to_gpr_or_vec(rd)
}

fn enc_ldst_simm9(op_31_22: u32, simm9: SImm9, op_11_10: u32, rn: Reg, rd: Reg) -> u32 {
    (op_31_22 << 22)
        | (simm9.bits() << 12)
        | (op_11_10 << 10)
        | (machreg_to_gpr(rn) << 5)
        | machreg_to_gpr_or_vec(rd)
}

fn enc_ldst_pair(op_31_22: u32, simm7: SImm7Scaled, rn: Reg, rt: Reg, rt2: Reg) -> u32 {
    (op_31_22 << 22)
        | (simm7.bits() << 15)
        | (machreg_to_gpr_or_vec(rt2) << 10)
        | (machreg_to_gpr(rn) << 5)
        | machreg_to_gpr_or_vec(rt)
}

/// Pair opcodes differ between X and D registers (the V bit and opc field).
fn pair_opcode(int_op: u32, rt: Reg) -> u32 {
    if rt.class() == RegClass::Float {
        // opc=01, V=1 for 64-bit FP pairs.
        (int_op & !(0b11 << 8)) | (0b01 << 8) | (1 << 4)
    } else {
        int_op
    }
}

fn enc_vec_rrr(base_2s: u32, arr: VecArr, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    base_2s
        | (arr.q_bit() << 30)
        | (machreg_to_vec(rm) << 16)
        | (machreg_to_vec(rn) << 5)
        | machreg_to_vec(rd)
}

fn enc_fpu_rrr(base: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    base | (machreg_to_vec(rm) << 16) | (machreg_to_vec(rn) << 5) | machreg_to_vec(rd)
}

/// Base words for the `.2s` arrangement of each vector op (Q=0).
fn vec_op_base(op: VecOp) -> u32 {
    match op {
        VecOp::Add => 0x0EA0_8400,
        VecOp::Sub => 0x2EA0_8400,
        VecOp::Mul => 0x0EA0_9C00,
        VecOp::FAdd => 0x0E20_D400,
        VecOp::FSub => 0x0EA0_D400,
        VecOp::FMul => 0x2E20_DC00,
        VecOp::FDiv => 0x2E20_FC00,
        VecOp::SMin => 0x0EA0_6C00,
        VecOp::SMax => 0x0EA0_6400,
        VecOp::FMin => 0x0EA0_F400,
        VecOp::FMax => 0x0E20_F400,
        VecOp::AddP => 0x0EA0_BC00,
        VecOp::FAddP => 0x2E20_D400,
        VecOp::SMinP => 0x0EA0_AC00,
        VecOp::SMaxP => 0x0EA0_A400,
        VecOp::FMinP => 0x2EA0_F400,
        VecOp::FMaxP => 0x2E20_F400,
    }
}

impl Inst {
    /// Encode this instruction into its 32-bit word. Label-dependent fields
    /// are zero, to be patched via the attached relocation.
    pub fn encode(&self) -> u32 {
        match self {
            &Inst::AluRRR { op, rd, rn, rm } => match op {
                ALUOp::Add => enc_arith_rrr(0b10001011_000, 0, rd, rn, rm),
                ALUOp::Sub => enc_arith_rrr(0b11001011_000, 0, rd, rn, rm),
                ALUOp::And => enc_arith_rrr(0b10001010_000, 0, rd, rn, rm),
                ALUOp::Orr => enc_arith_rrr(0b10101010_000, 0, rd, rn, rm),
                ALUOp::Eor => enc_arith_rrr(0b11001010_000, 0, rd, rn, rm),
                ALUOp::Mul => enc_arith_rrrr(0b10011011_000, rm, 0, 31, rn, rd),
                ALUOp::SDiv => enc_arith_rrr(0b10011010_110, 0b000011, rd, rn, rm),
                ALUOp::Lsl => enc_arith_rrr(0b10011010_110, 0b001000, rd, rn, rm),
                ALUOp::Lsr => enc_arith_rrr(0b10011010_110, 0b001001, rd, rn, rm),
                ALUOp::Asr => enc_arith_rrr(0b10011010_110, 0b001010, rd, rn, rm),
            },
            &Inst::AluRRImm12 { op, rd, rn, imm } => {
                let bits_31_24 = match op {
                    ALUOp::Add => 0b1001_0001,
                    ALUOp::Sub => 0b1101_0001,
                    _ => panic!("unsupported immediate ALU op {op:?}"),
                };
                enc_arith_rr_imm12(bits_31_24, imm.shift_bits(), imm.imm_bits(), rn, rd)
            }
            &Inst::CmpRR { rn, rm } => {
                // subs xzr, rn, rm
                (0b11101011_000 << 21)
                    | (machreg_to_gpr(rm) << 16)
                    | (machreg_to_gpr(rn) << 5)
                    | 31
            }
            &Inst::CmpImm { rn, imm } => {
                // subs xzr, rn, #imm
                (0b1111_0001 << 24)
                    | (imm.shift_bits() << 22)
                    | (imm.imm_bits() << 10)
                    | (machreg_to_gpr(rn) << 5)
                    | 31
            }
            &Inst::CSet { rd, cond, mask } => {
                let inv = cond.invert().bits();
                if mask {
                    // csinv rd, xzr, xzr, inv(cond)
                    (0b11011010_100 << 21)
                        | (31 << 16)
                        | (inv << 12)
                        | (31 << 5)
                        | machreg_to_gpr(rd)
                } else {
                    // csinc rd, xzr, xzr, inv(cond)
                    (0b10011010_100 << 21)
                        | (31 << 16)
                        | (inv << 12)
                        | (0b01 << 10)
                        | (31 << 5)
                        | machreg_to_gpr(rd)
                }
            }
            &Inst::MovZ { rd, imm } => {
                enc_move_wide(0b1_10_100101, imm.shift_bits(), imm.value_bits(), rd)
            }
            &Inst::MovK { rd, imm } => {
                enc_move_wide(0b1_11_100101, imm.shift_bits(), imm.value_bits(), rd)
            }
            &Inst::MovZLabel { rd, .. } => enc_move_wide(0b1_10_100101, 0, 0, rd),
            &Inst::MovKLabel { rd, .. } => enc_move_wide(0b1_11_100101, 1, 0, rd),
            &Inst::MovRR { rd, rm, .. } => {
                // orr rd, xzr, rm
                (0b10101010_000 << 21)
                    | (machreg_to_gpr(rm) << 16)
                    | (31 << 5)
                    | machreg_to_gpr(rd)
            }
            &Inst::Mvn { rd, rm } => {
                // orn rd, xzr, rm
                (0b10101010_001 << 21)
                    | (machreg_to_gpr(rm) << 16)
                    | (31 << 5)
                    | machreg_to_gpr(rd)
            }
            &Inst::Ldr { rt, mem, is32 } => {
                let (op_scaled, op_unscaled, scale) = load_opcodes(rt, is32, true);
                encode_ldst(op_scaled, op_unscaled, scale, rt, mem.base, mem.offset)
            }
            &Inst::Str { rt, mem, is32 } => {
                let (op_scaled, op_unscaled, scale) = load_opcodes(rt, is32, false);
                encode_ldst(op_scaled, op_unscaled, scale, rt, mem.base, mem.offset)
            }
            &Inst::Stp { rt, rt2, base, offset } => {
                let simm7 = SImm7Scaled::maybe_from_i64(i64::from(offset), 8)
                    .expect("STP offset out of range");
                enc_ldst_pair(pair_opcode(0b10_101_0_010_0, rt), simm7, base, rt, rt2)
            }
            &Inst::Ldp { rt, rt2, base, offset } => {
                let simm7 = SImm7Scaled::maybe_from_i64(i64::from(offset), 8)
                    .expect("LDP offset out of range");
                enc_ldst_pair(pair_opcode(0b10_101_0_010_1, rt), simm7, base, rt, rt2)
            }
            &Inst::StpPre { rt, rt2, base, offset } => {
                let simm7 = SImm7Scaled::maybe_from_i64(i64::from(offset), 8)
                    .expect("STP offset out of range");
                enc_ldst_pair(pair_opcode(0b10_101_0_011_0, rt), simm7, base, rt, rt2)
            }
            &Inst::LdpPost { rt, rt2, base, offset } => {
                let simm7 = SImm7Scaled::maybe_from_i64(i64::from(offset), 8)
                    .expect("LDP offset out of range");
                enc_ldst_pair(pair_opcode(0b10_101_0_001_1, rt), simm7, base, rt, rt2)
            }
            &Inst::Adrp { rd, .. } => 0x9000_0000 | machreg_to_gpr(rd),
            &Inst::AddLo12 { rd, rn, .. } => {
                enc_arith_rr_imm12(0b1001_0001, 0, 0, rn, rd)
            }
            Inst::B { .. } => 0x1400_0000,
            Inst::Bl { .. } => 0x9400_0000,
            Inst::CondBr { cond, .. } => 0x5400_0000 | cond.bits(),
            &Inst::Blr { rn } => 0xD63F_0000 | (machreg_to_gpr(rn) << 5),
            &Inst::BrReg { rn } => 0xD61F_0000 | (machreg_to_gpr(rn) << 5),
            Inst::Ret => 0xD65F_03C0,
            &Inst::Scvtf { rd, rn } => {
                0x9E62_0000 | (machreg_to_gpr(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::Fcvtzs { rd, rn } => {
                0x9E78_0000 | (machreg_to_vec(rn) << 5) | machreg_to_gpr(rd)
            }
            &Inst::FMovToFpu { rd, rn } => {
                0x9E67_0000 | (machreg_to_gpr(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::FMovFromFpu { rd, rn } => {
                0x9E66_0000 | (machreg_to_vec(rn) << 5) | machreg_to_gpr(rd)
            }
            &Inst::FMovFF { rd, rn } => {
                0x1E60_4000 | (machreg_to_vec(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::FpuRRR { op, rd, rn, rm } => {
                let base = match op {
                    FPUOp::FAdd => 0x1E60_2800,
                    FPUOp::FSub => 0x1E60_3800,
                    FPUOp::FMul => 0x1E60_0800,
                    FPUOp::FDiv => 0x1E60_1800,
                };
                enc_fpu_rrr(base, rd, rn, rm)
            }
            &Inst::FpuCmp { rn, rm } => {
                0x1E60_2000 | (machreg_to_vec(rm) << 16) | (machreg_to_vec(rn) << 5)
            }
            &Inst::FpuNeg { rd, rn } => {
                0x1E61_4000 | (machreg_to_vec(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::VecRRR { op, arr, rd, rn, rm } => {
                enc_vec_rrr(vec_op_base(op), arr, rd, rn, rm)
            }
            &Inst::VecDup { rd, rn, arr } => {
                // dup vd.<arr>, wn; imm5 = 0b00100 selects S lanes.
                0x0E04_0C00
                    | (arr.q_bit() << 30)
                    | (machreg_to_gpr(rn) << 5)
                    | machreg_to_vec(rd)
            }
            &Inst::Ld2 { rt, arr, rn } => {
                // ld2 {vt.<arr>, vt+1.<arr>}, [rn]; size=10 for S lanes.
                0x0C40_8800 | (arr.q_bit() << 30) | (machreg_to_gpr(rn) << 5) | u32::from(rt & 31)
            }
            &Inst::MovToVecLane { rd, lane, rn } => {
                // ins vd.d[lane], xn; imm5 = lane:1000.
                let imm5 = (u32::from(lane) << 4) | 0b1000;
                0x4E00_1C00 | (imm5 << 16) | (machreg_to_gpr(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::MovFromVecLane { rd, rn, lane } => {
                // umov xd, vn.d[lane]
                let imm5 = (u32::from(lane) << 4) | 0b1000;
                0x4E00_3C00 | (imm5 << 16) | (machreg_to_vec(rn) << 5) | machreg_to_gpr(rd)
            }
            &Inst::Ubfx { rd, rn, lsb, width } => {
                let immr = u32::from(lsb);
                let imms = u32::from(lsb + width - 1);
                0xD340_0000 | (immr << 16) | (imms << 10) | (machreg_to_gpr(rn) << 5)
                    | machreg_to_gpr(rd)
            }
            &Inst::LslImm { rd, rn, shift } => {
                // ubfm rd, rn, #((64 - shift) % 64), #(63 - shift)
                let immr = (64 - u32::from(shift)) % 64;
                let imms = 63 - u32::from(shift);
                0xD340_0000 | (immr << 16) | (imms << 10) | (machreg_to_gpr(rn) << 5)
                    | machreg_to_gpr(rd)
            }
            &Inst::VecScvtf { rd, rn, arr } => {
                0x0E21_D800
                    | (arr.q_bit() << 30)
                    | (machreg_to_vec(rn) << 5)
                    | machreg_to_vec(rd)
            }
            &Inst::Csel { rd, rn, rm, cond } => {
                (0b10011010_100 << 21)
                    | (machreg_to_gpr(rm) << 16)
                    | (cond.bits() << 12)
                    | (machreg_to_gpr(rn) << 5)
                    | machreg_to_gpr(rd)
            }
            &Inst::Ldr128 { rt, mem } => {
                let uimm12 = UImm12Scaled::maybe_from_i64(i64::from(mem.offset), 16)
                    .expect("Q-register load offset out of range");
                0x3DC0_0000
                    | (uimm12.bits() << 10)
                    | (machreg_to_gpr(mem.base) << 5)
                    | machreg_to_vec(rt)
            }
            &Inst::Str128 { rt, mem } => {
                let uimm12 = UImm12Scaled::maybe_from_i64(i64::from(mem.offset), 16)
                    .expect("Q-register store offset out of range");
                0x3D80_0000
                    | (uimm12.bits() << 10)
                    | (machreg_to_gpr(mem.base) << 5)
                    | machreg_to_vec(rt)
            }
            &Inst::FcvtSD { rd, rn } => {
                0x1E62_4000 | (machreg_to_vec(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::FcvtDS { rd, rn } => {
                0x1E22_C000 | (machreg_to_vec(rn) << 5) | machreg_to_vec(rd)
            }
            &Inst::FMovWS { rd, rn } => {
                0x1E26_0000 | (machreg_to_vec(rn) << 5) | machreg_to_gpr(rd)
            }
            &Inst::FMovSW { rd, rn } => {
                0x1E27_0000 | (machreg_to_gpr(rn) << 5) | machreg_to_vec(rd)
            }
            Inst::Nop => 0xD503_201F,
        }
    }
}

/// (scaled opcode bits 31..22, unscaled opcode bits 31..22, access bytes).
fn load_opcodes(rt: Reg, is32: bool, is_load: bool) -> (u32, u32, u32) {
    match (rt.class(), is32, is_load) {
        (RegClass::Int, false, true) => (0b11_111_0_01_01, 0b11_111_0_00_01, 8),
        (RegClass::Int, false, false) => (0b11_111_0_01_00, 0b11_111_0_00_00, 8),
        (RegClass::Int, true, true) => (0b10_111_0_01_01, 0b10_111_0_00_01, 4),
        (RegClass::Int, true, false) => (0b10_111_0_01_00, 0b10_111_0_00_00, 4),
        (RegClass::Float, _, true) => (0b11_111_1_01_01, 0b11_111_1_00_01, 8),
        (RegClass::Float, _, false) => (0b11_111_1_01_00, 0b11_111_1_00_00, 8),
    }
}

fn encode_ldst(op_scaled: u32, op_unscaled: u32, scale: u32, rt: Reg, base: Reg, offset: i32) -> u32 {
    if let Some(uimm12) = UImm12Scaled::maybe_from_i64(i64::from(offset), scale) {
        // The scaled opcode already carries bit 24; mask it out of the
        // op field before the helper re-adds it.
        enc_ldst_uimm12(op_scaled & !(1 << 2), uimm12, base, rt)
    } else if let Some(simm9) = SImm9::maybe_from_i64(i64::from(offset)) {
        enc_ldst_simm9(op_unscaled, simm9, 0b00, base, rt)
    } else {
        panic!("load/store offset {offset} out of range; frame too large");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::imms::Imm12;
    use crate::isa::aarch64::inst::{Cond, MemArg};
    use crate::isa::aarch64::regs::{dreg, xreg};

    #[test]
    fn known_words() {
        assert_eq!(Inst::Ret.encode(), 0xD65F03C0);
        assert_eq!(
            Inst::AluRRR {
                op: ALUOp::Add,
                rd: xreg(0),
                rn: xreg(1),
                rm: xreg(2)
            }
            .encode(),
            0x8B020020
        );
        assert_eq!(
            Inst::Ldr {
                rt: xreg(0),
                mem: MemArg::offset(xreg(0), 8),
                is32: false
            }
            .encode(),
            0xF9400400
        );
        assert_eq!(
            Inst::MovZ {
                rd: xreg(0),
                imm: crate::isa::aarch64::imms::MoveWideConst { bits: 1, shift: 0 }
            }
            .encode(),
            0xD2800020
        );
        assert_eq!(
            Inst::CmpImm {
                rn: xreg(0),
                imm: Imm12::maybe_from_u64(3).unwrap()
            }
            .encode(),
            0xF1000C1F
        );
        assert_eq!(
            Inst::CondBr {
                cond: Cond::Eq,
                target: "x".into()
            }
            .encode(),
            0x54000000
        );
        assert_eq!(Inst::Bl { target: "f".into() }.encode(), 0x94000000);
        assert_eq!(Inst::Nop.encode(), 0xD503201F);
    }

    #[test]
    fn fmov_directions_differ() {
        let to_fpu = Inst::FMovToFpu {
            rd: dreg(0),
            rn: xreg(1),
        }
        .encode();
        let from_fpu = Inst::FMovFromFpu {
            rd: xreg(1),
            rn: dreg(0),
        }
        .encode();
        assert_ne!(to_fpu, from_fpu);
    }

    #[test]
    fn vector_add_2s_vs_4s() {
        let two = Inst::VecRRR {
            op: VecOp::Add,
            arr: VecArr::S2,
            rd: dreg(0),
            rn: dreg(1),
            rm: dreg(2),
        }
        .encode();
        let four = Inst::VecRRR {
            op: VecOp::Add,
            arr: VecArr::S4,
            rd: dreg(0),
            rn: dreg(1),
            rm: dreg(2),
        }
        .encode();
        assert_eq!(two, 0x0EA28420);
        assert_eq!(four, two | (1 << 30));
    }

    #[test]
    fn negative_offsets_use_unscaled_form() {
        let word = Inst::Str {
            rt: xreg(1),
            mem: MemArg::offset(xreg(29), -16),
            is32: false,
        }
        .encode();
        // stur x1, [x29, #-16]
        assert_eq!(word >> 22, 0b11_111_0_00_00);
    }
}
