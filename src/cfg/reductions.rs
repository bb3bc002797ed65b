//! Reduction lowering: MIN / MAX / SUM.
//!
//! The elementwise form `result := OP(left, right)` walks two equal-length
//! vectors and writes an output vector; over PAIRS/FPAIRS collections the
//! loop body is the NEON-specialized `PairwiseReductionLoop`, which VLD2-
//! deinterleaves a chunk of packed pairs, applies the vector op, and
//! horizontally reduces (`vpmin`/`vpmax`/`vpadd`) down to one scalar pair per
//! chunk. The pairwise form `result := PAIRWISE_OP(input)` halves a single
//! vector with the matching horizontal op; its result vector is sized
//! `LEN(input)/2`.

use crate::ast::{
    BinOp, Expr, PairwiseReductionLoopStmt, PairwiseReductionStmt, ReductionLoopStmt,
    ReductionOp, ReductionStmt, Stmt, UnOp,
};
use crate::types::VarType;

use super::builder::CfgBuilder;

use log::trace;

impl CfgBuilder<'_> {
    pub(crate) fn lower_reduction(&mut self, red: &ReductionStmt) {
        let collection_ty = self.collection_type(&red.left);
        let packed = collection_ty.contains(VarType::PAIRS)
            || collection_ty.contains(VarType::FPAIRS);
        trace!(
            "lowering {} reduction in {} ({})",
            red.op.name(),
            self.function,
            if packed { "NEON" } else { "scalar" }
        );

        let left = self.reduction_operand("_reduce_left_", &red.left, collection_ty);
        let right = self.reduction_operand("_reduce_right_", &red.right, collection_ty);

        let len = self.new_temp("_reduce_len_");
        self.register_temp(&len, VarType::INTEGER);
        self.append(Stmt::assign(
            Expr::var(len.clone()),
            Expr::unary(UnOp::Length, Expr::var(left.clone())),
        ));

        // NEON chunks cover two packed pairs per iteration.
        let chunks = self.new_temp("_reduce_chunks_");
        self.register_temp(&chunks, VarType::INTEGER);
        let chunk_expr = if packed {
            Expr::binary(BinOp::Div, Expr::var(len.clone()), Expr::number(2))
        } else {
            Expr::var(len.clone())
        };
        self.append(Stmt::assign(Expr::var(chunks.clone()), chunk_expr));

        // Result vector: two words per element, PAIRS layout.
        self.register_temp(&red.result, collection_ty);
        self.append(Stmt::assign(
            Expr::var(red.result.clone()),
            Expr::call(
                "GETVEC",
                vec![Expr::binary(
                    BinOp::Mul,
                    Expr::var(len),
                    Expr::number(2),
                )],
            ),
        ));

        let index = self.new_temp("_reduce_idx_");
        self.register_temp(&index, VarType::INTEGER);
        self.append(Stmt::assign(Expr::var(index.clone()), Expr::number(0)));

        let body_stmt = if packed {
            // Two packed pairs per chunk: four 32-bit lanes.
            let suffix = if collection_ty.contains(VarType::FPAIRS) {
                "_f32"
            } else {
                ""
            };
            Stmt::PairwiseReductionLoop(PairwiseReductionLoopStmt {
                vector_name: left,
                result_name: red.result.clone(),
                index_name: index.clone(),
                intrinsic_name: format!("vld2_deinterleave_{}{}", red.op.name(), suffix),
                arrangement: ".4s".to_string(),
                op: red.op,
            })
        } else {
            Stmt::ReductionLoop(ReductionLoopStmt {
                left_name: left,
                right_name: right,
                result_name: red.result.clone(),
                index_name: index.clone(),
                chunk_count_name: chunks.clone(),
                op: red.op,
            })
        };
        self.reduction_loop_shape(&index, &chunks, body_stmt);
    }

    pub(crate) fn lower_pairwise_reduction(&mut self, red: &PairwiseReductionStmt) {
        let collection_ty = self.collection_type(&red.input);
        let is_float = collection_ty.contains(VarType::FPAIRS)
            || collection_ty.contains(VarType::FLOAT);

        let input = self.reduction_operand("_pairwise_input_", &red.input, collection_ty);

        let len = self.new_temp("_pairwise_len_");
        self.register_temp(&len, VarType::INTEGER);
        self.append(Stmt::assign(
            Expr::var(len.clone()),
            Expr::unary(UnOp::Length, Expr::var(input.clone())),
        ));

        // Halving reducer: result vector is LEN(input)/2.
        let chunks = self.new_temp("_pairwise_chunks_");
        self.register_temp(&chunks, VarType::INTEGER);
        self.append(Stmt::assign(
            Expr::var(chunks.clone()),
            Expr::binary(BinOp::Div, Expr::var(len), Expr::number(2)),
        ));
        self.register_temp(&red.result, collection_ty);
        self.append(Stmt::assign(
            Expr::var(red.result.clone()),
            Expr::call("GETVEC", vec![Expr::var(chunks.clone())]),
        ));

        let index = self.new_temp("_pairwise_idx_");
        self.register_temp(&index, VarType::INTEGER);
        self.append(Stmt::assign(Expr::var(index.clone()), Expr::number(0)));

        let intrinsic = match (red.op, is_float) {
            (ReductionOp::Min, false) => "vpmin",
            (ReductionOp::Min, true) => "vpmin_f32",
            (ReductionOp::Max, false) => "vpmax",
            (ReductionOp::Max, true) => "vpmax_f32",
            (ReductionOp::Sum, true) => "faddp",
            (ReductionOp::Sum, false) => "vpadd",
        };
        let body_stmt = Stmt::PairwiseReductionLoop(PairwiseReductionLoopStmt {
            vector_name: input,
            result_name: red.result.clone(),
            index_name: index.clone(),
            intrinsic_name: intrinsic.to_string(),
            arrangement: ".2s".to_string(),
            op: red.op,
        });
        self.reduction_loop_shape(&index, &chunks, body_stmt);
    }

    /// Copy a reduction operand into a temp unless it is already a simple
    /// variable.
    fn reduction_operand(&mut self, prefix: &str, expr: &Expr, ty: VarType) -> String {
        match expr {
            Expr::Variable(name) => name.clone(),
            other => {
                let temp = self.new_temp(prefix);
                self.register_temp(&temp, ty);
                self.append(Stmt::assign(Expr::var(temp.clone()), other.clone()));
                temp
            }
        }
    }

    /// Emit the shared header/body/increment/exit shape around `body_stmt`:
    /// `IF idx < chunks GOTO body`, increment by one, back edge to header.
    fn reduction_loop_shape(&mut self, index: &str, chunks: &str, body_stmt: Stmt) {
        let pre = self.ensure_block();
        let header = self.cfg.create_block("ReduceHeader_");
        let body_block = self.cfg.create_block("ReduceBody_");
        let increment_block = self.cfg.create_block("ReduceIncrement_");
        let exit_block = self.cfg.create_block("ReduceExit_");

        self.cfg.add_edge(pre, header);
        self.cfg.block_mut(header).is_loop_header = true;
        self.cfg.block_mut(header).loop_variable = Some(index.to_string());
        self.cfg.block_mut(header).add_statement(Stmt::ConditionalBranch {
            condition: Expr::binary(
                BinOp::Lt,
                Expr::var(index.to_string()),
                Expr::var(chunks.to_string()),
            ),
            branch_on_false: false,
        });
        self.cfg.add_edge(header, body_block);
        self.cfg.add_edge(header, exit_block);

        self.cfg.block_mut(body_block).add_statement(body_stmt);
        self.cfg.add_edge(body_block, increment_block);

        self.cfg.block_mut(increment_block).is_increment_block = true;
        self.cfg.block_mut(increment_block).loop_variable = Some(index.to_string());
        self.cfg.block_mut(increment_block).add_statement(Stmt::assign(
            Expr::var(index.to_string()),
            Expr::binary(BinOp::Add, Expr::var(index.to_string()), Expr::number(1)),
        ));
        self.cfg.add_edge(increment_block, header);

        self.current = Some(exit_block);
    }
}
