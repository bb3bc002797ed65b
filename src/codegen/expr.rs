//! Expression code generation.
//!
//! Every `emit_expr` call returns the register holding the result; the
//! caller releases it when done. Scalar integers travel in X registers,
//! scalar floats in D registers, the 64-bit packed types (PAIR, FPAIR) in X
//! registers that visit the vector unit for arithmetic, and the 128-bit
//! packed types (QUAD, FQUAD) in V registers throughout.
//!
//! Binary operations evaluate the left operand first; when the right operand
//! performs a call, the left result moves into a reserved callee-saved
//! temporary so the call cannot clobber it. Small integer immediates take
//! the immediate instruction forms; wider constants materialize through
//! MOVZ/MOVK. Short-circuit AND/OR compile to branches with a materialized
//! 0/-1 result, never to bitwise operations.

use crate::analysis::evaluate_constant_expression;
use crate::analysis::infer::expr_contains_call;
use crate::ast::{AllocKind, BinOp, Expr, Stmt, UnOp};
use crate::isa::aarch64::imms::Imm12;
use crate::isa::aarch64::inst::{ALUOp, Cond, FPUOp, Inst, MemArg, VecArr, VecOp};
use crate::isa::aarch64::regs::{dreg, xreg, zero_reg, Reg, RegClass};
use crate::regalloc::AllocationMap;
use crate::result::{CompileError, CompileResult};
use crate::stream::Segment;
use crate::types::VarType;

use super::CodeGenerator;

impl CodeGenerator<'_> {
    /// Generate code for `expr`, returning the result register.
    pub(crate) fn emit_expr(
        &mut self,
        expr: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        match expr {
            Expr::Number(n) => self.emit_int_constant(*n),
            Expr::CharLit(c) => self.emit_int_constant(*c as i64),
            Expr::Boolean(b) => self.emit_int_constant(if *b { -1 } else { 0 }),

            Expr::Float(f) => {
                let label = self.data.add_float_literal(*f);
                let addr = self.scratch.acquire_int()?;
                self.load_label_address(&label, addr);
                let dest = self.scratch.acquire_float()?;
                self.emit(Inst::Ldr {
                    rt: dest,
                    mem: MemArg::base_only(addr),
                    is32: false,
                });
                self.scratch.release(addr);
                Ok(dest)
            }

            Expr::StringLit(s) => {
                let label = self.data.add_string_literal(s);
                let dest = self.scratch.acquire_int()?;
                self.load_label_address(&label, dest);
                Ok(dest)
            }

            Expr::Variable(name) => {
                if name == "SELF" {
                    return self.load_variable("_this", allocation);
                }
                self.load_variable(name, allocation)
            }

            Expr::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs, allocation),
            Expr::Unary { op, operand } => self.emit_unary(*op, operand, allocation),

            Expr::Call { func, args } => {
                let result = self.lower_call(func, args, allocation)?;
                result.ok_or_else(|| {
                    CompileError::CodegenInvariant(
                        "call in expression position produced no result".to_string(),
                    )
                })
            }

            Expr::SuperMethodCall { member, args } => {
                let member = member.clone();
                let args = args.clone();
                self.lower_super_call(&member, &args, allocation)
            }

            Expr::MemberAccess { object, member } => {
                self.emit_member_load(object, member, allocation)
            }

            Expr::VectorAccess { vector, index } => {
                let elem_float = {
                    let vt = self.expr_ty(vector, allocation);
                    vt.contains(VarType::FLOAT) && !vt.contains(VarType::FPAIRS)
                };
                self.emit_element_load(vector, index, allocation, 8, elem_float)
            }
            Expr::FloatVectorIndirection { vector, index } => {
                self.emit_element_load(vector, index, allocation, 8, true)
            }
            Expr::CharIndirection { string, index } => {
                self.emit_char_load(string, index, allocation)
            }

            Expr::Conditional {
                condition,
                then_expr,
                else_expr,
            } => self.emit_conditional(condition, then_expr, else_expr, allocation),

            Expr::Valof(body) => self.emit_inline_valof(body, allocation, false),
            Expr::FloatValof(body) => self.emit_inline_valof(body, allocation, true),

            Expr::Alloc { kind, size } => {
                let size_reg = self.emit_expr(size, allocation)?;
                if size_reg != xreg(0) {
                    self.emit(Inst::mov(xreg(0), size_reg));
                }
                self.scratch.release(size_reg);
                let callee = match kind {
                    AllocKind::FVec => "FGETVEC",
                    _ => "GETVEC",
                };
                self.emit_call_to(callee);
                self.scratch.invalidate_caller_saved();
                let dest = self.scratch.acquire_int()?;
                self.emit(Inst::mov(dest, xreg(0)));
                Ok(dest)
            }

            Expr::Table { entries, is_float } => {
                let label = if *is_float {
                    let values: Vec<f64> = entries
                        .iter()
                        .map(|e| match e {
                            Expr::Float(f) => *f,
                            other => evaluate_constant_expression(
                                other,
                                &self.analyzer.manifests,
                            )
                            .unwrap_or(0) as f64,
                        })
                        .collect();
                    self.data.add_float_table_literal(values)
                } else {
                    let values: Vec<i64> = entries
                        .iter()
                        .map(|e| {
                            evaluate_constant_expression(e, &self.analyzer.manifests)
                                .unwrap_or(0)
                        })
                        .collect();
                    self.data.add_table_literal(values)
                };
                let dest = self.scratch.acquire_int()?;
                self.load_label_address(&label, dest);
                Ok(dest)
            }

            Expr::List { items, .. } => {
                let label = self.data.add_list_literal(items, &self.analyzer.manifests);
                let dest = self.scratch.acquire_int()?;
                self.load_label_address(&label, dest);
                Ok(dest)
            }

            Expr::Pair { first, second } => self.emit_pair_literal(first, second, allocation),
            Expr::FPair { first, second } => self.emit_fpair_literal(first, second, allocation),
            Expr::Quad { elements } => self.emit_quad_literal(elements, allocation, false),
            Expr::FQuad { elements } => self.emit_quad_literal(elements, allocation, true),

            Expr::New { class_name, args } => {
                let class_name = class_name.clone();
                let args = args.clone();
                self.lower_new(&class_name, &args, allocation)
            }
        }
    }

    fn emit_int_constant(&mut self, value: i64) -> CompileResult<Reg> {
        let dest = self.scratch.acquire_int()?;
        if value >= 0 {
            let insts = Inst::load_constant(dest, value as u64);
            self.emit_all(&insts);
        } else {
            // Negative: materialize the magnitude and negate. The common
            // case (-1, boolean truth) is a single pair.
            let insts = Inst::load_constant(dest, value.unsigned_abs());
            self.emit_all(&insts);
            self.emit(Inst::AluRRR {
                op: ALUOp::Sub,
                rd: dest,
                rn: zero_reg(),
                rm: dest,
            });
        }
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Binary operations

    fn emit_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        if matches!(op, BinOp::LogAnd | BinOp::LogOr) {
            return self.emit_short_circuit(op, lhs, rhs, allocation);
        }

        let lt = self.expr_ty(lhs, allocation);
        let rt = self.expr_ty(rhs, allocation);

        if op.is_comparison() {
            return self.emit_comparison(op, lhs, rhs, lt, rt, allocation);
        }
        if lt.is_packed() || rt.is_packed() {
            return self.emit_packed_arith(op, lhs, rhs, lt, rt, allocation);
        }
        if lt == VarType::FLOAT || rt == VarType::FLOAT {
            return self.emit_float_arith(op, lhs, rhs, lt, rt, allocation);
        }

        // Recognize the lane-unpack shapes and emit UBFX directly.
        if op == BinOp::BitAnd {
            if let Expr::Number(0xffff_ffff) = rhs {
                let value = self.emit_expr(lhs, allocation)?;
                let dest = self.result_reg(value)?;
                self.emit(Inst::Ubfx {
                    rd: dest,
                    rn: value,
                    lsb: 0,
                    width: 32,
                });
                return Ok(dest);
            }
        }
        if op == BinOp::Lsr {
            if let Expr::Number(shift @ 1..=63) = rhs {
                let shift = *shift as u8;
                let value = self.emit_expr(lhs, allocation)?;
                let dest = self.result_reg(value)?;
                self.emit(Inst::Ubfx {
                    rd: dest,
                    rn: value,
                    lsb: shift,
                    width: 64 - shift,
                });
                return Ok(dest);
            }
        }

        let mut left = self.emit_expr(lhs, allocation)?;
        // Preserve the left result across a call in the right operand.
        if expr_contains_call(rhs) {
            let temp = self.scratch.acquire_callee_temp()?;
            self.emit(Inst::mov(temp, left));
            self.scratch.release(left);
            left = temp;
        }

        // Immediate form for small constants on the right.
        if let Expr::Number(n) = rhs {
            if (0..=4095).contains(n) && matches!(op, BinOp::Add | BinOp::Sub) {
                let dest = self.result_reg(left)?;
                self.emit(Inst::AluRRImm12 {
                    op: if op == BinOp::Add { ALUOp::Add } else { ALUOp::Sub },
                    rd: dest,
                    rn: left,
                    imm: Imm12::maybe_from_u64(*n as u64).unwrap(),
                });
                return Ok(dest);
            }
        }

        let right = self.emit_expr(rhs, allocation)?;
        let dest = self.result_reg(left)?;
        match op {
            BinOp::Add => self.emit_alu(ALUOp::Add, dest, left, right),
            BinOp::Sub => self.emit_alu(ALUOp::Sub, dest, left, right),
            BinOp::Mul => self.emit_alu(ALUOp::Mul, dest, left, right),
            BinOp::Div => self.emit_alu(ALUOp::SDiv, dest, left, right),
            BinOp::Rem => {
                // q = l / r; dest = l - q * r
                let quotient = self.scratch.acquire_int()?;
                self.emit_alu(ALUOp::SDiv, quotient, left, right);
                self.emit_alu(ALUOp::Mul, quotient, quotient, right);
                self.emit_alu(ALUOp::Sub, dest, left, quotient);
                self.scratch.release(quotient);
            }
            BinOp::BitAnd => self.emit_alu(ALUOp::And, dest, left, right),
            BinOp::BitOr => self.emit_alu(ALUOp::Orr, dest, left, right),
            BinOp::Xor => self.emit_alu(ALUOp::Eor, dest, left, right),
            BinOp::Lsl => self.emit_alu(ALUOp::Lsl, dest, left, right),
            BinOp::Lsr => self.emit_alu(ALUOp::Lsr, dest, left, right),
            _ => unreachable!("comparison handled above"),
        }
        self.scratch.release(right);
        if left != dest {
            self.scratch.release(left);
        }
        Ok(dest)
    }

    fn emit_alu(&mut self, op: ALUOp, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(Inst::AluRRR { op, rd, rn, rm });
    }

    /// Result destination: reuse the left operand's register when the
    /// scratch pool manages it, otherwise acquire a fresh one.
    fn result_reg(&mut self, left: Reg) -> CompileResult<Reg> {
        if self.scratch.is_managed(left) {
            Ok(left)
        } else {
            self.scratch.acquire_int()
        }
    }

    // ------------------------------------------------------------------
    // Comparisons

    fn emit_comparison(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        lt: VarType,
        rt: VarType,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let cond = match op {
            BinOp::Eq => Cond::Eq,
            BinOp::Ne => Cond::Ne,
            BinOp::Lt => Cond::Lt,
            BinOp::Le => Cond::Le,
            BinOp::Gt => Cond::Gt,
            BinOp::Ge => Cond::Ge,
            _ => unreachable!(),
        };

        // 128-bit packed equality: both lanes must match.
        if lt.contains(VarType::QUAD)
            || lt.contains(VarType::FQUAD)
            || rt.contains(VarType::QUAD)
            || rt.contains(VarType::FQUAD)
        {
            return self.emit_quad_equality(cond, lhs, rhs, allocation);
        }

        if lt == VarType::FLOAT || rt == VarType::FLOAT {
            let left = self.float_operand(lhs, allocation)?;
            let right = self.float_operand(rhs, allocation)?;
            self.emit(Inst::FpuCmp {
                rn: left,
                rm: right,
            });
            self.scratch.release(left);
            self.scratch.release(right);
            let dest = self.scratch.acquire_int()?;
            self.emit(Inst::CSet {
                rd: dest,
                cond,
                mask: true,
            });
            return Ok(dest);
        }

        // Integer and 64-bit packed compare: one CMP. PAIR equality is a
        // single 64-bit compare of the packed words.
        let mut left = self.emit_expr(lhs, allocation)?;
        if expr_contains_call(rhs) {
            let temp = self.scratch.acquire_callee_temp()?;
            self.emit(Inst::mov(temp, left));
            self.scratch.release(left);
            left = temp;
        }
        if let Expr::Number(n) = rhs {
            if (0..=4095).contains(n) {
                self.emit(Inst::CmpImm {
                    rn: left,
                    imm: Imm12::maybe_from_u64(*n as u64).unwrap(),
                });
                self.scratch.release(left);
                let dest = self.scratch.acquire_int()?;
                self.emit(Inst::CSet {
                    rd: dest,
                    cond,
                    mask: true,
                });
                return Ok(dest);
            }
        }
        let right = self.emit_expr(rhs, allocation)?;
        self.emit(Inst::CmpRR {
            rn: left,
            rm: right,
        });
        self.scratch.release(left);
        self.scratch.release(right);
        let dest = self.scratch.acquire_int()?;
        self.emit(Inst::CSet {
            rd: dest,
            cond,
            mask: true,
        });
        Ok(dest)
    }

    fn emit_quad_equality(
        &mut self,
        cond: Cond,
        lhs: &Expr,
        rhs: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let left = self.emit_expr(lhs, allocation)?;
        let right = self.emit_expr(rhs, allocation)?;
        let a = self.scratch.acquire_int()?;
        let b = self.scratch.acquire_int()?;
        let dest = self.scratch.acquire_int()?;
        // Lane 0.
        self.emit(Inst::MovFromVecLane {
            rd: a,
            rn: left,
            lane: 0,
        });
        self.emit(Inst::MovFromVecLane {
            rd: b,
            rn: right,
            lane: 0,
        });
        self.emit(Inst::CmpRR { rn: a, rm: b });
        self.emit(Inst::CSet {
            rd: dest,
            cond: Cond::Eq,
            mask: true,
        });
        // Lane 1.
        self.emit(Inst::MovFromVecLane {
            rd: a,
            rn: left,
            lane: 1,
        });
        self.emit(Inst::MovFromVecLane {
            rd: b,
            rn: right,
            lane: 1,
        });
        self.emit(Inst::CmpRR { rn: a, rm: b });
        self.emit(Inst::CSet {
            rd: a,
            cond: Cond::Eq,
            mask: true,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::And,
            rd: dest,
            rn: dest,
            rm: a,
        });
        if cond == Cond::Ne {
            self.emit(Inst::Mvn { rd: dest, rm: dest });
        }
        self.scratch.release(a);
        self.scratch.release(b);
        self.scratch.release(left);
        self.scratch.release(right);
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Short-circuit AND / OR

    fn emit_short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let short_label = self.stream.new_label("sc_short_");
        let done_label = self.stream.new_label("sc_done_");
        let dest = self.scratch.acquire_int()?;
        // AND shorts to 0 on a false operand; OR shorts to -1 on a true one.
        let (short_cond, short_value) = match op {
            BinOp::LogAnd => (Cond::Eq, 0i64),
            BinOp::LogOr => (Cond::Ne, -1i64),
            _ => unreachable!(),
        };

        let left = self.emit_expr(lhs, allocation)?;
        self.emit(Inst::CmpRR {
            rn: left,
            rm: zero_reg(),
        });
        self.scratch.release(left);
        self.emit(Inst::CondBr {
            cond: short_cond,
            target: short_label.clone(),
        });

        let right = self.emit_expr(rhs, allocation)?;
        self.emit(Inst::CmpRR {
            rn: right,
            rm: zero_reg(),
        });
        self.scratch.release(right);
        self.emit(Inst::CSet {
            rd: dest,
            cond: Cond::Ne,
            mask: true,
        });
        self.emit(Inst::B {
            target: done_label.clone(),
        });

        self.stream.define_label(&short_label, Segment::Text);
        if short_value == 0 {
            self.emit(Inst::mov(dest, zero_reg()));
        } else {
            let insts = Inst::load_constant(dest, 1);
            self.emit_all(&insts);
            self.emit(Inst::AluRRR {
                op: ALUOp::Sub,
                rd: dest,
                rn: zero_reg(),
                rm: dest,
            });
        }
        self.stream.define_label(&done_label, Segment::Text);
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Float arithmetic

    fn float_operand(
        &mut self,
        expr: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let value = self.emit_expr(expr, allocation)?;
        if value.class() == RegClass::Float {
            return Ok(value);
        }
        // INT -> FLOAT promotion.
        let dest = self.scratch.acquire_float()?;
        self.emit(Inst::Scvtf {
            rd: dest,
            rn: value,
        });
        self.scratch.release(value);
        Ok(dest)
    }

    fn emit_float_arith(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        lt: VarType,
        rt: VarType,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let left = self.float_operand(lhs, allocation)?;
        let right = self.float_operand(rhs, allocation)?;
        let dest = if self.scratch.is_managed(left) {
            left
        } else {
            self.scratch.acquire_float()?
        };
        let fpu_op = match op {
            BinOp::Add => FPUOp::FAdd,
            BinOp::Sub => FPUOp::FSub,
            BinOp::Mul => FPUOp::FMul,
            BinOp::Div | BinOp::Rem => FPUOp::FDiv,
            other => {
                return Err(CompileError::CodegenInvariant(format!(
                    "operator {other:?} is not defined on FLOAT operands"
                )));
            }
        };
        self.emit(Inst::FpuRRR {
            op: fpu_op,
            rd: dest,
            rn: left,
            rm: right,
        });
        self.scratch.release(right);
        if left != dest {
            self.scratch.release(left);
        }
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Packed (PAIR / FPAIR / QUAD / FQUAD) arithmetic

    fn emit_packed_arith(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        lt: VarType,
        rt: VarType,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let result_ty = {
            // Reuse the inference promotion table shape.
            let is128 = lt.contains(VarType::QUAD)
                || lt.contains(VarType::FQUAD)
                || rt.contains(VarType::QUAD)
                || rt.contains(VarType::FQUAD);
            let is_float = lt.contains(VarType::FPAIR)
                || lt.contains(VarType::FQUAD)
                || rt.contains(VarType::FPAIR)
                || rt.contains(VarType::FQUAD)
                || lt == VarType::FLOAT
                || rt == VarType::FLOAT;
            match (is128, is_float) {
                (false, false) => VarType::INTEGER.with(VarType::PAIR),
                (false, true) => VarType::FLOAT.with(VarType::FPAIR),
                (true, false) => VarType::INTEGER.with(VarType::QUAD),
                (true, true) => VarType::FLOAT.with(VarType::FQUAD),
            }
        };
        let arr = if result_ty.contains(VarType::QUAD) || result_ty.contains(VarType::FQUAD) {
            VecArr::S4
        } else {
            VecArr::S2
        };
        let float_lanes =
            result_ty.contains(VarType::FPAIR) || result_ty.contains(VarType::FQUAD);

        // Bring both operands into vector registers, broadcasting scalars.
        let scalar_on_left = !lt.is_packed();
        let (va, vb) = if scalar_on_left {
            // The broadcast scalar keeps its source-order position so the
            // non-commutative operations stay correct.
            let vector = self.packed_operand(rhs, allocation)?;
            let scalar = self.broadcast_scalar(lhs, lt, arr, float_lanes, allocation)?;
            (scalar, vector)
        } else {
            let vector = self.packed_operand(lhs, allocation)?;
            let scalar_or_vector = if rt.is_packed() {
                self.packed_operand(rhs, allocation)?
            } else {
                self.broadcast_scalar(rhs, rt, arr, float_lanes, allocation)?
            };
            (vector, scalar_or_vector)
        };

        // Integer lanes promote to float lanes when the result is a float
        // pack.
        let (va, vb) = if float_lanes {
            (
                self.promote_lanes(va, lt, arr)?,
                self.promote_lanes(vb, rt, arr)?,
            )
        } else {
            (va, vb)
        };

        let vec_op = match (op, float_lanes) {
            (BinOp::Add, false) => VecOp::Add,
            (BinOp::Sub, false) => VecOp::Sub,
            (BinOp::Mul, false) => VecOp::Mul,
            (BinOp::Add, true) => VecOp::FAdd,
            (BinOp::Sub, true) => VecOp::FSub,
            (BinOp::Mul, true) => VecOp::FMul,
            (BinOp::Div, true) => VecOp::FDiv,
            (other, _) => {
                return Err(CompileError::CodegenInvariant(format!(
                    "operator {other:?} is not defined on packed values"
                )));
            }
        };
        let dest_v = self.scratch.acquire_float()?;
        self.emit(Inst::VecRRR {
            op: vec_op,
            arr,
            rd: dest_v,
            rn: va,
            rm: vb,
        });
        self.scratch.release(va);
        self.scratch.release(vb);

        if arr == VecArr::S2 {
            // 64-bit packs travel in general registers.
            let dest = self.scratch.acquire_int()?;
            self.emit(Inst::FMovFromFpu {
                rd: dest,
                rn: dest_v,
            });
            self.scratch.release(dest_v);
            Ok(dest)
        } else {
            Ok(dest_v)
        }
    }

    /// Move a packed operand into a vector register. PAIR/FPAIR values
    /// arrive in X registers; QUAD/FQUAD are already in V registers.
    fn packed_operand(
        &mut self,
        expr: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let value = self.emit_expr(expr, allocation)?;
        if value.class() == RegClass::Float {
            return Ok(value);
        }
        let dest = self.scratch.acquire_float()?;
        self.emit(Inst::FMovToFpu {
            rd: dest,
            rn: value,
        });
        self.scratch.release(value);
        Ok(dest)
    }

    /// Broadcast a scalar operand into every lane with DUP.
    fn broadcast_scalar(
        &mut self,
        expr: &Expr,
        ty: VarType,
        arr: VecArr,
        float_lanes: bool,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let value = self.emit_expr(expr, allocation)?;
        let dest = self.scratch.acquire_float()?;
        if float_lanes && ty == VarType::FLOAT {
            // Narrow the double to f32, move to a lane, and broadcast from
            // the general register.
            let narrow = self.scratch.acquire_float()?;
            self.emit(Inst::FcvtSD {
                rd: narrow,
                rn: value,
            });
            let bits = self.scratch.acquire_int()?;
            self.emit(Inst::FMovWS {
                rd: bits,
                rn: narrow,
            });
            self.emit(Inst::VecDup {
                rd: dest,
                rn: bits,
                arr,
            });
            self.scratch.release(bits);
            self.scratch.release(narrow);
        } else {
            self.emit(Inst::VecDup {
                rd: dest,
                rn: value,
                arr,
            });
            if float_lanes {
                // Integer scalar against float lanes: convert after the
                // broadcast.
                self.emit(Inst::VecScvtf {
                    rd: dest,
                    rn: dest,
                    arr,
                });
            }
        }
        self.scratch.release(value);
        Ok(dest)
    }

    /// Convert integer lanes to float lanes in place when needed.
    fn promote_lanes(&mut self, v: Reg, ty: VarType, arr: VecArr) -> CompileResult<Reg> {
        let has_int_lanes = ty.contains(VarType::PAIR) || ty.contains(VarType::QUAD);
        if has_int_lanes && !ty.contains(VarType::FPAIR) && !ty.contains(VarType::FQUAD) {
            self.emit(Inst::VecScvtf {
                rd: v,
                rn: v,
                arr,
            });
        }
        Ok(v)
    }

    // ------------------------------------------------------------------
    // Unary operations

    fn emit_unary(
        &mut self,
        op: UnOp,
        operand: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        match op {
            UnOp::Neg => {
                let ty = self.expr_ty(operand, allocation);
                let value = self.emit_expr(operand, allocation)?;
                if ty == VarType::FLOAT {
                    let dest = if self.scratch.is_managed(value) {
                        value
                    } else {
                        self.scratch.acquire_float()?
                    };
                    self.emit(Inst::FpuNeg {
                        rd: dest,
                        rn: value,
                    });
                    return Ok(dest);
                }
                let dest = self.result_reg(value)?;
                self.emit(Inst::AluRRR {
                    op: ALUOp::Sub,
                    rd: dest,
                    rn: zero_reg(),
                    rm: value,
                });
                if value != dest {
                    self.scratch.release(value);
                }
                Ok(dest)
            }
            UnOp::LogNot => {
                let value = self.emit_expr(operand, allocation)?;
                self.emit(Inst::CmpRR {
                    rn: value,
                    rm: zero_reg(),
                });
                self.scratch.release(value);
                let dest = self.scratch.acquire_int()?;
                self.emit(Inst::CSet {
                    rd: dest,
                    cond: Cond::Eq,
                    mask: true,
                });
                Ok(dest)
            }
            UnOp::BitNot => {
                let value = self.emit_expr(operand, allocation)?;
                let dest = self.result_reg(value)?;
                self.emit(Inst::Mvn {
                    rd: dest,
                    rm: value,
                });
                if value != dest {
                    self.scratch.release(value);
                }
                Ok(dest)
            }
            UnOp::AddrOf => self.emit_address_of(operand, allocation),
            UnOp::Deref => {
                let addr = self.emit_expr(operand, allocation)?;
                let dest = self.result_reg(addr)?;
                self.emit(Inst::Ldr {
                    rt: dest,
                    mem: MemArg::base_only(addr),
                    is32: false,
                });
                if addr != dest {
                    self.scratch.release(addr);
                }
                Ok(dest)
            }
            UnOp::Head => {
                let elem_ty = self.expr_ty(operand, allocation).list_element_type();
                let node = self.emit_expr(operand, allocation)?;
                if node != xreg(0) {
                    self.emit(Inst::mov(xreg(0), node));
                }
                self.scratch.release(node);
                let callee = if elem_ty == VarType::FLOAT {
                    "BCPL_LIST_GET_HEAD_AS_FLOAT"
                } else {
                    "BCPL_LIST_GET_HEAD_AS_INT"
                };
                self.emit_call_to(callee);
                self.scratch.invalidate_caller_saved();
                if elem_ty == VarType::FLOAT {
                    let dest = self.scratch.acquire_float()?;
                    self.emit(Inst::FMovFF {
                        rd: dest,
                        rn: dreg(0),
                    });
                    Ok(dest)
                } else {
                    let dest = self.scratch.acquire_int()?;
                    self.emit(Inst::mov(dest, xreg(0)));
                    Ok(dest)
                }
            }
            UnOp::Tail | UnOp::Rest => {
                let node = self.emit_expr(operand, allocation)?;
                if node != xreg(0) {
                    self.emit(Inst::mov(xreg(0), node));
                }
                self.scratch.release(node);
                let callee = if op == UnOp::Tail {
                    "BCPL_LIST_GET_TAIL"
                } else {
                    "BCPL_LIST_GET_REST"
                };
                self.emit_call_to(callee);
                self.scratch.invalidate_caller_saved();
                let dest = self.scratch.acquire_int()?;
                self.emit(Inst::mov(dest, xreg(0)));
                Ok(dest)
            }
            UnOp::Length => {
                let ty = self.expr_ty(operand, allocation);
                let base = self.emit_expr(operand, allocation)?;
                let dest = self.result_reg(base)?;
                // Lists keep their length in the header; vectors, tables and
                // strings lead with a length word.
                let offset = if ty.is_list() { 24 } else { 0 };
                self.emit(Inst::Ldr {
                    rt: dest,
                    mem: MemArg::offset(base, offset),
                    is32: false,
                });
                if base != dest {
                    self.scratch.release(base);
                }
                Ok(dest)
            }
            UnOp::IntToFloat => {
                let value = self.emit_expr(operand, allocation)?;
                if value.class() == RegClass::Float {
                    return Ok(value);
                }
                let dest = self.scratch.acquire_float()?;
                self.emit(Inst::Scvtf {
                    rd: dest,
                    rn: value,
                });
                self.scratch.release(value);
                Ok(dest)
            }
            UnOp::FloatToInt => {
                let value = self.emit_expr(operand, allocation)?;
                if value.class() == RegClass::Int {
                    return Ok(value);
                }
                let dest = self.scratch.acquire_int()?;
                self.emit(Inst::Fcvtzs {
                    rd: dest,
                    rn: value,
                });
                self.scratch.release(value);
                Ok(dest)
            }
            UnOp::TypeOf => {
                // Statically folded to a string literal naming the type.
                let name = self.expr_ty(operand, allocation).type_name();
                let label = self.data.add_string_literal(name);
                let dest = self.scratch.acquire_int()?;
                self.load_label_address(&label, dest);
                Ok(dest)
            }
        }
    }

    fn emit_address_of(
        &mut self,
        operand: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        match operand {
            Expr::Variable(name) => {
                if let Some(word) = self.data.global_word_offset(name) {
                    let dest = self.scratch.acquire_int()?;
                    let base = crate::isa::aarch64::regs::data_base_reg();
                    self.emit_address_of_offset(dest, base, (word * 8) as i32);
                    return Ok(dest);
                }
                // Every local has a frame slot; flush the register home so
                // the address observes the current value.
                let offset = self.flush_to_slot(name, allocation)?;
                let dest = self.scratch.acquire_int()?;
                let fp = self.frame_pointer();
                self.emit_address_of_offset(dest, fp, offset);
                Ok(dest)
            }
            Expr::VectorAccess { vector, index } => {
                let (addr, _) = self.emit_element_address(vector, index, allocation, 8)?;
                Ok(addr)
            }
            other => Err(CompileError::CodegenInvariant(format!(
                "cannot take the address of {:?}",
                std::mem::discriminant(other)
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Memory accesses

    /// Element address: `base + 8 + index * scale`, with the optional bounds
    /// check against the leading length word.
    pub(crate) fn emit_element_address(
        &mut self,
        vector: &Expr,
        index: &Expr,
        allocation: &AllocationMap,
        scale: i32,
    ) -> CompileResult<(Reg, Reg)> {
        let base = self.emit_expr(vector, allocation)?;
        let index_reg = self.emit_expr(index, allocation)?;

        if self.flags.bounds_checking_enabled {
            let len = self.scratch.acquire_int()?;
            self.emit(Inst::Ldr {
                rt: len,
                mem: MemArg::base_only(base),
                is32: false,
            });
            self.emit(Inst::CmpRR {
                rn: index_reg,
                rm: len,
            });
            self.scratch.release(len);
            let label = self.bounds_error_label();
            self.emit(Inst::CondBr {
                cond: Cond::Ge,
                target: label,
            });
        }

        let addr = self.scratch.acquire_int()?;
        let shift = match scale {
            8 => 3,
            4 => 2,
            _ => unreachable!("unsupported element scale"),
        };
        self.emit(Inst::LslImm {
            rd: addr,
            rn: index_reg,
            shift,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: addr,
            rn: addr,
            rm: base,
        });
        self.scratch.release(index_reg);
        if self.scratch.is_managed(base) {
            self.scratch.release(base);
        }
        Ok((addr, base))
    }

    fn emit_element_load(
        &mut self,
        vector: &Expr,
        index: &Expr,
        allocation: &AllocationMap,
        scale: i32,
        is_float: bool,
    ) -> CompileResult<Reg> {
        let (addr, _) = self.emit_element_address(vector, index, allocation, scale)?;
        let dest = if is_float {
            self.scratch.acquire_float()?
        } else {
            self.scratch.acquire_int()?
        };
        self.emit(Inst::Ldr {
            rt: dest,
            mem: MemArg::offset(addr, 8),
            is32: false,
        });
        self.scratch.release(addr);
        Ok(dest)
    }

    fn emit_char_load(
        &mut self,
        string: &Expr,
        index: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let base = self.emit_expr(string, allocation)?;
        let index_reg = self.emit_expr(index, allocation)?;
        let addr = self.scratch.acquire_int()?;
        self.emit(Inst::LslImm {
            rd: addr,
            rn: index_reg,
            shift: 2,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: addr,
            rn: addr,
            rm: base,
        });
        self.scratch.release(index_reg);
        if self.scratch.is_managed(base) {
            self.scratch.release(base);
        }
        let dest = self.scratch.acquire_int()?;
        self.emit(Inst::Ldr {
            rt: dest,
            mem: MemArg::offset(addr, 8),
            is32: true,
        });
        self.scratch.release(addr);
        Ok(dest)
    }

    pub(crate) fn emit_member_load(
        &mut self,
        object: &Expr,
        member: &str,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let class = self.expr_class(object).ok_or_else(|| {
            CompileError::CodegenInvariant(format!(
                "cannot determine the class of the object in .{member}"
            ))
        })?;
        let offset = self.member_offset_in(&class, member)?;
        let member_ty = self
            .classes
            .get_class(&class)
            .and_then(|e| e.member_variables.get(member))
            .map(|m| m.ty)
            .unwrap_or(VarType::INTEGER);
        let obj = self.emit_expr(object, allocation)?;
        let dest = if member_ty.is_float() {
            self.scratch.acquire_float()?
        } else {
            self.scratch.acquire_int()?
        };
        self.emit(Inst::Ldr {
            rt: dest,
            mem: MemArg::offset(obj, offset),
            is32: false,
        });
        if self.scratch.is_managed(obj) {
            self.scratch.release(obj);
        }
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Assignments

    pub(crate) fn emit_assignment(
        &mut self,
        target: &Expr,
        value: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let value_reg = self.emit_expr(value, allocation)?;
        match target {
            Expr::Variable(name) => {
                let name = if name == "SELF" { "_this" } else { name };
                self.store_variable(name, value_reg, allocation)?;
            }
            Expr::MemberAccess { object, member } => {
                let class = self.expr_class(object).ok_or_else(|| {
                    CompileError::CodegenInvariant(format!(
                        "cannot determine the class of the object in .{member} assignment"
                    ))
                })?;
                let offset = self.member_offset_in(&class, member)?;
                let obj = self.emit_expr(object, allocation)?;
                self.emit(Inst::Str {
                    rt: value_reg,
                    mem: MemArg::offset(obj, offset),
                    is32: false,
                });
                if self.scratch.is_managed(obj) {
                    self.scratch.release(obj);
                }
            }
            Expr::VectorAccess { vector, index }
            | Expr::FloatVectorIndirection { vector, index } => {
                let (addr, _) = self.emit_element_address(vector, index, allocation, 8)?;
                self.emit(Inst::Str {
                    rt: value_reg,
                    mem: MemArg::offset(addr, 8),
                    is32: false,
                });
                self.scratch.release(addr);
            }
            Expr::CharIndirection { string, index } => {
                let base = self.emit_expr(string, allocation)?;
                let index_reg = self.emit_expr(index, allocation)?;
                let addr = self.scratch.acquire_int()?;
                self.emit(Inst::LslImm {
                    rd: addr,
                    rn: index_reg,
                    shift: 2,
                });
                self.emit(Inst::AluRRR {
                    op: ALUOp::Add,
                    rd: addr,
                    rn: addr,
                    rm: base,
                });
                self.scratch.release(index_reg);
                if self.scratch.is_managed(base) {
                    self.scratch.release(base);
                }
                self.emit(Inst::Str {
                    rt: value_reg,
                    mem: MemArg::offset(addr, 8),
                    is32: true,
                });
                self.scratch.release(addr);
            }
            Expr::Unary {
                op: UnOp::Deref,
                operand,
            } => {
                let addr = self.emit_expr(operand, allocation)?;
                self.emit(Inst::Str {
                    rt: value_reg,
                    mem: MemArg::base_only(addr),
                    is32: false,
                });
                if self.scratch.is_managed(addr) {
                    self.scratch.release(addr);
                }
            }
            other => {
                return Err(CompileError::CodegenInvariant(format!(
                    "unsupported assignment target {:?}",
                    std::mem::discriminant(other)
                )));
            }
        }
        self.scratch.release(value_reg);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conditional expressions and inline VALOF

    fn emit_conditional(
        &mut self,
        condition: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let else_label = self.stream.new_label("cond_else_");
        let done_label = self.stream.new_label("cond_done_");
        let is_float = self.expr_ty(then_expr, allocation) == VarType::FLOAT;
        let dest = if is_float {
            self.scratch.acquire_float()?
        } else {
            self.scratch.acquire_int()?
        };

        let cond_reg = self.emit_expr(condition, allocation)?;
        self.emit(Inst::CmpRR {
            rn: cond_reg,
            rm: zero_reg(),
        });
        self.scratch.release(cond_reg);
        self.emit(Inst::CondBr {
            cond: Cond::Eq,
            target: else_label.clone(),
        });

        let then_val = self.emit_expr(then_expr, allocation)?;
        self.move_into(dest, then_val);
        self.scratch.release(then_val);
        self.emit(Inst::B {
            target: done_label.clone(),
        });

        self.stream.define_label(&else_label, Segment::Text);
        let else_val = self.emit_expr(else_expr, allocation)?;
        self.move_into(dest, else_val);
        self.scratch.release(else_val);
        self.stream.define_label(&done_label, Segment::Text);
        Ok(dest)
    }

    pub(crate) fn move_into(&mut self, dest: Reg, src: Reg) {
        if dest == src {
            return;
        }
        match (dest.class(), src.class()) {
            (RegClass::Int, RegClass::Int) => self.emit(Inst::mov(dest, src)),
            (RegClass::Float, RegClass::Float) => self.emit(Inst::FMovFF { rd: dest, rn: src }),
            (RegClass::Float, RegClass::Int) => self.emit(Inst::FMovToFpu { rd: dest, rn: src }),
            (RegClass::Int, RegClass::Float) => {
                self.emit(Inst::FMovFromFpu { rd: dest, rn: src })
            }
        }
    }

    /// Expression-position VALOF bodies are emitted inline: straight-line
    /// statements plus branching control flow, with `RESULTIS` depositing
    /// into the result register and jumping to the shared done label. Loops
    /// inside an expression VALOF never reach here; function-body VALOFs go
    /// through the CFG instead.
    fn emit_inline_valof(
        &mut self,
        body: &Stmt,
        allocation: &AllocationMap,
        is_float: bool,
    ) -> CompileResult<Reg> {
        let done_label = self.stream.new_label("valof_done_");
        let dest = if is_float {
            self.scratch.acquire_float()?
        } else {
            self.scratch.acquire_int()?
        };
        self.emit_valof_stmt(body, allocation, dest, &done_label)?;
        self.stream.define_label(&done_label, Segment::Text);
        Ok(dest)
    }

    fn emit_valof_stmt(
        &mut self,
        stmt: &Stmt,
        allocation: &AllocationMap,
        dest: Reg,
        done_label: &str,
    ) -> CompileResult<()> {
        match stmt {
            Stmt::Compound(stmts) | Stmt::Block { statements: stmts, .. } => {
                for s in stmts {
                    self.emit_valof_stmt(s, allocation, dest, done_label)?;
                }
                Ok(())
            }
            Stmt::Resultis(expr) => {
                let value = self.emit_expr(expr, allocation)?;
                self.move_into(dest, value);
                self.scratch.release(value);
                self.emit(Inst::B {
                    target: done_label.to_string(),
                });
                Ok(())
            }
            Stmt::If { condition, then_branch } => {
                let skip = self.stream.new_label("valof_skip_");
                let cond_reg = self.emit_expr(condition, allocation)?;
                self.emit(Inst::CmpRR {
                    rn: cond_reg,
                    rm: zero_reg(),
                });
                self.scratch.release(cond_reg);
                self.emit(Inst::CondBr {
                    cond: Cond::Eq,
                    target: skip.clone(),
                });
                self.emit_valof_stmt(then_branch, allocation, dest, done_label)?;
                self.stream.define_label(&skip, Segment::Text);
                Ok(())
            }
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => {
                let else_label = self.stream.new_label("valof_else_");
                let join_label = self.stream.new_label("valof_join_");
                let cond_reg = self.emit_expr(condition, allocation)?;
                self.emit(Inst::CmpRR {
                    rn: cond_reg,
                    rm: zero_reg(),
                });
                self.scratch.release(cond_reg);
                self.emit(Inst::CondBr {
                    cond: Cond::Eq,
                    target: else_label.clone(),
                });
                self.emit_valof_stmt(then_branch, allocation, dest, done_label)?;
                self.emit(Inst::B {
                    target: join_label.clone(),
                });
                self.stream.define_label(&else_label, Segment::Text);
                self.emit_valof_stmt(else_branch, allocation, dest, done_label)?;
                self.stream.define_label(&join_label, Segment::Text);
                Ok(())
            }
            Stmt::Assignment { .. } | Stmt::RoutineCall { .. } | Stmt::Free(_) => {
                self.emit_stmt(stmt, allocation)
            }
            other => Err(CompileError::CodegenInvariant(format!(
                "statement {:?} is not supported inside an expression VALOF",
                std::mem::discriminant(other)
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Packed literals

    fn emit_pair_literal(
        &mut self,
        first: &Expr,
        second: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let a = evaluate_constant_expression(first, &self.analyzer.manifests);
        let b = evaluate_constant_expression(second, &self.analyzer.manifests);
        if let (Some(a), Some(b)) = (a, b) {
            let label = self.data.add_pair_literal(a, b);
            let addr = self.scratch.acquire_int()?;
            self.load_label_address(&label, addr);
            let dest = self.result_reg(addr)?;
            self.emit(Inst::Ldr {
                rt: dest,
                mem: MemArg::base_only(addr),
                is32: false,
            });
            return Ok(dest);
        }
        // Runtime construction: mask the low lane, shift the high lane in.
        let first_reg = self.emit_expr(first, allocation)?;
        let dest = self.result_reg(first_reg)?;
        self.emit(Inst::Ubfx {
            rd: dest,
            rn: first_reg,
            lsb: 0,
            width: 32,
        });
        if first_reg != dest {
            self.scratch.release(first_reg);
        }
        let second_reg = self.emit_expr(second, allocation)?;
        let shifted = self.scratch.acquire_int()?;
        self.emit(Inst::LslImm {
            rd: shifted,
            rn: second_reg,
            shift: 32,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Orr,
            rd: dest,
            rn: dest,
            rm: shifted,
        });
        self.scratch.release(shifted);
        self.scratch.release(second_reg);
        Ok(dest)
    }

    fn emit_fpair_literal(
        &mut self,
        first: &Expr,
        second: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        if let (Expr::Float(a), Expr::Float(b)) = (first, second) {
            let bits_a = (*a as f32).to_bits() as i64;
            let bits_b = (*b as f32).to_bits() as i64;
            let label = self.data.add_pair_literal(bits_a, bits_b);
            let addr = self.scratch.acquire_int()?;
            self.load_label_address(&label, addr);
            let dest = self.result_reg(addr)?;
            self.emit(Inst::Ldr {
                rt: dest,
                mem: MemArg::base_only(addr),
                is32: false,
            });
            return Ok(dest);
        }
        // Runtime: narrow each operand to f32 bits and pack as a pair.
        let lo = self.fpair_lane_bits(first, allocation)?;
        let dest = self.result_reg(lo)?;
        self.emit(Inst::Ubfx {
            rd: dest,
            rn: lo,
            lsb: 0,
            width: 32,
        });
        if lo != dest {
            self.scratch.release(lo);
        }
        let hi = self.fpair_lane_bits(second, allocation)?;
        let shifted = self.scratch.acquire_int()?;
        self.emit(Inst::LslImm {
            rd: shifted,
            rn: hi,
            shift: 32,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Orr,
            rd: dest,
            rn: dest,
            rm: shifted,
        });
        self.scratch.release(shifted);
        self.scratch.release(hi);
        Ok(dest)
    }

    /// f32 bit pattern of a lane expression, in a general register.
    fn fpair_lane_bits(
        &mut self,
        expr: &Expr,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let value = self.emit_expr(expr, allocation)?;
        let double = if value.class() == RegClass::Float {
            value
        } else {
            let d = self.scratch.acquire_float()?;
            self.emit(Inst::Scvtf { rd: d, rn: value });
            self.scratch.release(value);
            d
        };
        let narrow = self.scratch.acquire_float()?;
        self.emit(Inst::FcvtSD {
            rd: narrow,
            rn: double,
        });
        self.scratch.release(double);
        let bits = self.scratch.acquire_int()?;
        self.emit(Inst::FMovWS {
            rd: bits,
            rn: narrow,
        });
        self.scratch.release(narrow);
        Ok(bits)
    }

    fn emit_quad_literal(
        &mut self,
        elements: &[Expr],
        allocation: &AllocationMap,
        is_float: bool,
    ) -> CompileResult<Reg> {
        let constants: Vec<Option<i64>> = elements
            .iter()
            .map(|e| {
                if is_float {
                    match e {
                        Expr::Float(f) => Some((*f as f32).to_bits() as i64),
                        _ => None,
                    }
                } else {
                    evaluate_constant_expression(e, &self.analyzer.manifests)
                }
            })
            .collect();
        if constants.iter().all(Option::is_some) && constants.len() == 4 {
            let values: Vec<i64> = constants.into_iter().map(Option::unwrap).collect();
            let label = self
                .data
                .add_quad_literal([values[0], values[1], values[2], values[3]]);
            let addr = self.scratch.acquire_int()?;
            self.load_label_address(&label, addr);
            let dest = self.scratch.acquire_float()?;
            self.emit(Inst::Ldr128 {
                rt: dest,
                mem: MemArg::base_only(addr),
            });
            self.scratch.release(addr);
            return Ok(dest);
        }

        // Runtime construction: pack lanes pairwise, then insert each 64-bit
        // half into the vector register.
        let lo_pair = if is_float {
            self.emit_fpair_literal(&elements[0], &elements[1], allocation)?
        } else {
            self.emit_pair_literal(&elements[0], &elements[1], allocation)?
        };
        let hi_pair = if is_float {
            self.emit_fpair_literal(&elements[2], &elements[3], allocation)?
        } else {
            self.emit_pair_literal(&elements[2], &elements[3], allocation)?
        };
        let dest = self.scratch.acquire_float()?;
        self.emit(Inst::MovToVecLane {
            rd: dest,
            lane: 0,
            rn: lo_pair,
        });
        self.emit(Inst::MovToVecLane {
            rd: dest,
            lane: 1,
            rn: hi_pair,
        });
        self.scratch.release(lo_pair);
        self.scratch.release(hi_pair);
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Reduction loop bodies

    /// Scalar elementwise reduction body:
    /// `result!idx := op(left!idx, right!idx)`.
    pub(crate) fn emit_reduction_loop(
        &mut self,
        red: &crate::ast::ReductionLoopStmt,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let left_base = self.load_variable(&red.left_name, allocation)?;
        let right_base = self.load_variable(&red.right_name, allocation)?;
        let result_base = self.load_variable(&red.result_name, allocation)?;
        let index = self.load_variable(&red.index_name, allocation)?;

        let addr = self.scratch.acquire_int()?;
        let a = self.scratch.acquire_int()?;
        let b = self.scratch.acquire_int()?;

        self.emit(Inst::LslImm {
            rd: addr,
            rn: index,
            shift: 3,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: a,
            rn: addr,
            rm: left_base,
        });
        self.emit(Inst::Ldr {
            rt: a,
            mem: MemArg::offset(a, 8),
            is32: false,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: b,
            rn: addr,
            rm: right_base,
        });
        self.emit(Inst::Ldr {
            rt: b,
            mem: MemArg::offset(b, 8),
            is32: false,
        });

        match red.op {
            crate::ast::ReductionOp::Sum => {
                self.emit(Inst::AluRRR {
                    op: ALUOp::Add,
                    rd: a,
                    rn: a,
                    rm: b,
                });
            }
            crate::ast::ReductionOp::Min | crate::ast::ReductionOp::Max => {
                let cond = if red.op == crate::ast::ReductionOp::Min {
                    Cond::Le
                } else {
                    Cond::Ge
                };
                self.emit(Inst::CmpRR { rn: a, rm: b });
                self.emit(Inst::Csel {
                    rd: a,
                    rn: a,
                    rm: b,
                    cond,
                });
            }
        }

        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: b,
            rn: addr,
            rm: result_base,
        });
        self.emit(Inst::Str {
            rt: a,
            mem: MemArg::offset(b, 8),
            is32: false,
        });

        self.scratch.release(addr);
        self.scratch.release(a);
        self.scratch.release(b);
        self.scratch.release(left_base);
        self.scratch.release(right_base);
        self.scratch.release(result_base);
        self.scratch.release(index);
        Ok(())
    }

    /// NEON pairwise-reduction body. The `vld2_deinterleave_*` intrinsics
    /// split a chunk of packed pairs into lane vectors, apply the vector op,
    /// and horizontally reduce to one scalar pair; the plain `vpmin`/`vpmax`
    /// /`vpadd`/`faddp` forms halve the input with one horizontal op.
    pub(crate) fn emit_pairwise_loop(
        &mut self,
        red: &crate::ast::PairwiseReductionLoopStmt,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let input_base = self.load_variable(&red.vector_name, allocation)?;
        let result_base = self.load_variable(&red.result_name, allocation)?;
        let index = self.load_variable(&red.index_name, allocation)?;

        let addr = self.scratch.acquire_int()?;
        // Two packed pairs per chunk: 16 bytes.
        self.emit(Inst::LslImm {
            rd: addr,
            rn: index,
            shift: 4,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: addr,
            rn: addr,
            rm: input_base,
        });
        self.emit(Inst::AluRRImm12 {
            op: ALUOp::Add,
            rd: addr,
            rn: addr,
            imm: Imm12::maybe_from_u64(8).unwrap(),
        });

        let is_float =
            red.intrinsic_name.contains("faddp") || red.intrinsic_name.ends_with("_f32");
        let deinterleave = red.intrinsic_name.starts_with("vld2_deinterleave");
        let (op, horizontal) = match (red.op, is_float) {
            (crate::ast::ReductionOp::Min, false) => (VecOp::SMin, VecOp::SMinP),
            (crate::ast::ReductionOp::Max, false) => (VecOp::SMax, VecOp::SMaxP),
            (crate::ast::ReductionOp::Sum, false) => (VecOp::Add, VecOp::AddP),
            (crate::ast::ReductionOp::Min, true) => (VecOp::FMin, VecOp::FMinP),
            (crate::ast::ReductionOp::Max, true) => (VecOp::FMax, VecOp::FMaxP),
            (crate::ast::ReductionOp::Sum, true) => (VecOp::FAdd, VecOp::FAddP),
        };

        // v0/v1 are call-clobbered lane accumulators local to the body.
        let v0 = dreg(0);
        let v1 = dreg(1);
        if deinterleave {
            self.emit(Inst::Ld2 {
                rt: 0,
                arr: VecArr::S2,
                rn: addr,
            });
        } else {
            self.emit(Inst::Ldr {
                rt: v0,
                mem: MemArg::base_only(addr),
                is32: false,
            });
            self.emit(Inst::Ldr {
                rt: v1,
                mem: MemArg::offset(addr, 8),
                is32: false,
            });
        }
        self.emit(Inst::VecRRR {
            op,
            arr: VecArr::S2,
            rd: v0,
            rn: v0,
            rm: v1,
        });
        if deinterleave {
            self.emit(Inst::VecRRR {
                op: horizontal,
                arr: VecArr::S2,
                rd: v0,
                rn: v0,
                rm: v0,
            });
        }

        // Store one scalar pair per chunk.
        let out = self.scratch.acquire_int()?;
        self.emit(Inst::LslImm {
            rd: out,
            rn: index,
            shift: 3,
        });
        self.emit(Inst::AluRRR {
            op: ALUOp::Add,
            rd: out,
            rn: out,
            rm: result_base,
        });
        self.emit(Inst::Str {
            rt: v0,
            mem: MemArg::offset(out, 8),
            is32: false,
        });
        self.scratch.release(out);
        self.scratch.release(addr);
        self.scratch.release(input_base);
        self.scratch.release(result_base);
        self.scratch.release(index);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Static typing for codegen decisions

    /// Syntactic type of an expression, from literals, symbol types and
    /// function signatures. Mirrors the analyzer's inference outcome without
    /// mutating analyzer state.
    pub(crate) fn expr_ty(&self, expr: &Expr, allocation: &AllocationMap) -> VarType {
        match expr {
            Expr::Number(_) | Expr::CharLit(_) | Expr::Boolean(_) => VarType::INTEGER,
            Expr::Float(_) => VarType::FLOAT,
            Expr::StringLit(_) => VarType::STRING.pointer_to(),
            Expr::Variable(name) => {
                if name == "_this" || name == "SELF" {
                    return VarType::OBJECT.pointer_to();
                }
                if let Some(interval) = allocation.get(name) {
                    if interval.var_type != VarType::UNKNOWN {
                        return interval.var_type;
                    }
                }
                self.symbols
                    .lookup_in_function(&self.function, name)
                    .map(|s| s.ty)
                    .filter(|t| *t != VarType::UNKNOWN)
                    .unwrap_or_else(|| self.analyzer.get_variable_type(&self.function, name))
            }
            Expr::Binary { op, lhs, rhs } => {
                if op.is_comparison() || matches!(op, BinOp::LogAnd | BinOp::LogOr) {
                    return VarType::INTEGER;
                }
                let lt = self.expr_ty(lhs, allocation);
                let rt = self.expr_ty(rhs, allocation);
                promote_types(lt, rt)
            }
            Expr::Unary { op, operand } => match op {
                UnOp::IntToFloat => VarType::FLOAT,
                UnOp::FloatToInt | UnOp::Length | UnOp::LogNot | UnOp::BitNot => VarType::INTEGER,
                UnOp::AddrOf => self.expr_ty(operand, allocation).pointer_to(),
                UnOp::Deref => VarType::INTEGER,
                UnOp::Head => self.expr_ty(operand, allocation).list_element_type(),
                UnOp::Tail | UnOp::Rest => self.expr_ty(operand, allocation),
                UnOp::TypeOf => VarType::STRING.pointer_to(),
                UnOp::Neg => self.expr_ty(operand, allocation),
            },
            Expr::Call { func, .. } => match func.as_ref() {
                Expr::Variable(name) => match name.as_str() {
                    "BCPL_LIST_GET_HEAD_AS_FLOAT" => VarType::FLOAT,
                    _ => self
                        .analyzer
                        .metrics_for(name)
                        .map(|m| m.return_type)
                        .unwrap_or(VarType::INTEGER),
                },
                Expr::MemberAccess { object, member } => self
                    .expr_class(object)
                    .and_then(|class| self.classes.find_method(&class, member))
                    .map(|m| m.return_type)
                    .unwrap_or(VarType::INTEGER),
                _ => VarType::INTEGER,
            },
            Expr::SuperMethodCall { member, .. } => self
                .current_class
                .as_ref()
                .and_then(|class| self.classes.get_class(class))
                .map(|entry| entry.parent_name.clone())
                .and_then(|parent| self.classes.find_method(&parent, member))
                .map(|m| m.return_type)
                .unwrap_or(VarType::INTEGER),
            Expr::MemberAccess { object, member } => self
                .expr_class(object)
                .and_then(|class| self.classes.get_class(&class))
                .and_then(|entry| entry.member_variables.get(member))
                .map(|m| {
                    if m.ty == VarType::UNKNOWN {
                        VarType::INTEGER
                    } else {
                        m.ty
                    }
                })
                .unwrap_or(VarType::INTEGER),
            Expr::VectorAccess { vector, .. } => {
                let vt = self.expr_ty(vector, allocation);
                if vt.contains(VarType::PAIRS) {
                    VarType::INTEGER.with(VarType::PAIR)
                } else if vt.contains(VarType::FPAIRS) {
                    VarType::FLOAT.with(VarType::FPAIR)
                } else if vt.contains(VarType::FLOAT) {
                    VarType::FLOAT
                } else {
                    VarType::INTEGER
                }
            }
            Expr::CharIndirection { .. } => VarType::INTEGER,
            Expr::FloatVectorIndirection { .. } => VarType::FLOAT,
            Expr::Conditional { then_expr, .. } => self.expr_ty(then_expr, allocation),
            Expr::Valof(_) => VarType::INTEGER,
            Expr::FloatValof(_) => VarType::FLOAT,
            Expr::Alloc { kind, .. } => match kind {
                AllocKind::Vec => VarType::INTEGER.with(VarType::VEC).pointer_to(),
                AllocKind::FVec => VarType::FLOAT.with(VarType::VEC).pointer_to(),
                AllocKind::Pairs => VarType::INTEGER.with(VarType::PAIRS).pointer_to(),
                AllocKind::FPairs => VarType::FLOAT.with(VarType::FPAIRS).pointer_to(),
                AllocKind::Str => VarType::STRING.pointer_to(),
            },
            Expr::Table { is_float, .. } => {
                let base = if *is_float {
                    VarType::FLOAT
                } else {
                    VarType::INTEGER
                };
                base.with(VarType::TABLE).pointer_to().with(VarType::CONST)
            }
            Expr::List { .. } => VarType::INTEGER.with(VarType::LIST).pointer_to(),
            Expr::Pair { .. } => VarType::INTEGER.with(VarType::PAIR),
            Expr::FPair { .. } => VarType::FLOAT.with(VarType::FPAIR),
            Expr::Quad { .. } => VarType::INTEGER.with(VarType::QUAD),
            Expr::FQuad { .. } => VarType::FLOAT.with(VarType::FQUAD),
            Expr::New { .. } => VarType::OBJECT.pointer_to(),
        }
    }

    /// The class of the object an expression denotes, for member offsets.
    pub(crate) fn expr_class(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Variable(name) if name == "_this" || name == "SELF" => {
                self.current_class.clone()
            }
            Expr::Variable(name) => self
                .symbols
                .lookup_in_function(&self.function, name)
                .and_then(|s| s.class_name.clone()),
            Expr::New { class_name, .. } => Some(class_name.clone()),
            Expr::Call { func, .. } => match func.as_ref() {
                Expr::Variable(name) => self
                    .analyzer
                    .metrics_for(name)
                    .and_then(|m| m.return_class.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// The arithmetic promotion lattice, shared with the analyzer's rules.
fn promote_types(lt: VarType, rt: VarType) -> VarType {
    let l_packed = lt.is_packed();
    let r_packed = rt.is_packed();
    if l_packed || r_packed {
        let is128 = lt.contains(VarType::QUAD)
            || lt.contains(VarType::FQUAD)
            || rt.contains(VarType::QUAD)
            || rt.contains(VarType::FQUAD);
        let is_float = lt.contains(VarType::FPAIR)
            || lt.contains(VarType::FQUAD)
            || rt.contains(VarType::FPAIR)
            || rt.contains(VarType::FQUAD)
            || lt == VarType::FLOAT
            || rt == VarType::FLOAT;
        return match (is128, is_float) {
            (false, false) => VarType::INTEGER.with(VarType::PAIR),
            (false, true) => VarType::FLOAT.with(VarType::FPAIR),
            (true, false) => VarType::INTEGER.with(VarType::QUAD),
            (true, true) => VarType::FLOAT.with(VarType::FQUAD),
        };
    }
    if lt == VarType::FLOAT || rt == VarType::FLOAT {
        VarType::FLOAT
    } else {
        VarType::INTEGER
    }
}
