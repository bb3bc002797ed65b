//! FOREACH lowering.
//!
//! Vector-shaped collections (VEC, TABLE, STRING) get an index loop; lists
//! get a cursor loop over node pointers; the destructuring form additionally
//! unpacks the node's packed 64-bit value into its two 32-bit lanes.
//!
//! Three folds keep the common cases cheap: an empty collection literal
//! elides the whole loop, a simple-variable collection is used in place
//! instead of being copied to a temporary, and a collection with a known
//! constant size compares the index against an immediate with no length
//! temporary at all.

use crate::analysis::consteval::evaluate_constant_expression;
use crate::ast::{AllocKind, BinOp, Expr, ForEachStmt, Stmt, UnOp};
use crate::types::VarType;

use super::builder::CfgBuilder;

use log::trace;

impl CfgBuilder<'_> {
    pub(crate) fn lower_foreach(&mut self, node: &ForEachStmt) {
        if is_empty_collection_literal(&node.collection, &self.analyzer.manifests) {
            trace!("FOREACH over empty literal elided in {}", self.function);
            return;
        }
        let collection_ty = self.collection_type(&node.collection);
        if node.vars.len() == 2 {
            self.lower_destructuring_list_foreach(node);
        } else if collection_ty.is_list() {
            self.lower_list_foreach(node, collection_ty);
        } else {
            self.lower_vector_foreach(node, collection_ty);
        }
    }

    /// Best-effort static type of a FOREACH collection expression.
    pub(crate) fn collection_type(&self, expr: &Expr) -> VarType {
        match expr {
            Expr::Variable(name) => self
                .symbols
                .lookup_in_function(&self.function, name)
                .map(|s| s.ty)
                .filter(|t| *t != VarType::UNKNOWN)
                .unwrap_or_else(|| {
                    self.analyzer.get_variable_type(&self.function, name)
                }),
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
                base.with(VarType::TABLE).pointer_to()
            }
            Expr::List { items, is_const } => {
                let any_float = items.iter().any(|i| matches!(i, Expr::Float(_)));
                let base = if any_float {
                    VarType::FLOAT
                } else {
                    VarType::INTEGER
                };
                let mut ty = base.with(VarType::LIST).pointer_to();
                if *is_const {
                    ty = ty.with(VarType::CONST);
                }
                ty
            }
            Expr::StringLit(_) => VarType::STRING.pointer_to(),
            _ => VarType::INTEGER.with(VarType::VEC).pointer_to(),
        }
    }

    // ------------------------------------------------------------------
    // Vector / table / string FOREACH

    fn lower_vector_foreach(&mut self, node: &ForEachStmt, collection_ty: VarType) {
        let loop_var = node.vars[0].clone();

        // Reuse a simple variable directly; copy anything else into a temp.
        let vec_name = match &node.collection {
            Expr::Variable(name) => name.clone(),
            other => {
                let temp = self.new_temp("_forEach_vec_");
                self.register_temp(&temp, collection_ty);
                self.append(Stmt::assign(Expr::var(temp.clone()), other.clone()));
                temp
            }
        };

        // Known constant lengths fold into an immediate compare.
        let const_len = match &node.collection {
            Expr::Table { entries, .. } => Some(entries.len() as i64),
            Expr::Alloc { size, .. } => {
                evaluate_constant_expression(size, &self.analyzer.manifests)
            }
            Expr::Variable(name) => self.constant_vector_sizes.get(name).copied(),
            _ => None,
        };
        let len_operand = match const_len {
            Some(n) => Expr::Number(n),
            None => {
                let temp = self.new_temp("_forEach_len_");
                self.register_temp(&temp, VarType::INTEGER);
                self.append(Stmt::assign(
                    Expr::var(temp.clone()),
                    Expr::unary(UnOp::Length, Expr::var(vec_name.clone())),
                ));
                Expr::var(temp)
            }
        };

        let idx = self.new_temp("_forEach_idx_");
        self.register_temp(&idx, VarType::INTEGER);
        self.append(Stmt::assign(Expr::var(idx.clone()), Expr::number(0)));

        let pre = self.ensure_block();
        let header = self.cfg.create_block("ForEachHeader_");
        let body_block = self.cfg.create_block("ForEachBody_");
        let increment_block = self.cfg.create_block("ForEachIncrement_");
        let exit_block = self.cfg.create_block("ForEachExit_");

        self.cfg.add_edge(pre, header);
        self.cfg.block_mut(header).is_loop_header = true;
        self.cfg.block_mut(header).loop_variable = Some(idx.clone());
        self.cfg.block_mut(header).add_statement(Stmt::ConditionalBranch {
            condition: Expr::binary(BinOp::Lt, Expr::var(idx.clone()), len_operand),
            branch_on_false: false,
        });
        self.cfg.add_edge(header, body_block);
        self.cfg.add_edge(header, exit_block);

        self.break_targets.push((exit_block, self.scope_depth()));
        self.loop_targets.push((increment_block, self.scope_depth()));

        self.current = Some(body_block);
        let element = if collection_ty.contains(VarType::STRING) {
            Expr::CharIndirection {
                string: Box::new(Expr::var(vec_name.clone())),
                index: Box::new(Expr::var(idx.clone())),
            }
        } else if collection_ty.contains(VarType::FLOAT)
            && !collection_ty.contains(VarType::FPAIRS)
        {
            Expr::FloatVectorIndirection {
                vector: Box::new(Expr::var(vec_name.clone())),
                index: Box::new(Expr::var(idx.clone())),
            }
        } else {
            Expr::VectorAccess {
                vector: Box::new(Expr::var(vec_name.clone())),
                index: Box::new(Expr::var(idx.clone())),
            }
        };
        self.append(Stmt::assign(Expr::var(loop_var), element));
        self.lower_stmt(&node.body);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, increment_block);
        }

        self.cfg.block_mut(increment_block).is_increment_block = true;
        self.cfg.block_mut(increment_block).loop_variable = Some(idx.clone());
        self.cfg.block_mut(increment_block).add_statement(Stmt::assign(
            Expr::var(idx.clone()),
            Expr::binary(BinOp::Add, Expr::var(idx), Expr::number(1)),
        ));
        self.cfg.add_edge(increment_block, header);

        self.loop_targets.pop();
        self.break_targets.pop();
        self.current = Some(exit_block);
    }

    // ------------------------------------------------------------------
    // List FOREACH

    fn lower_list_foreach(&mut self, node: &ForEachStmt, collection_ty: VarType) {
        let loop_var = node.vars[0].clone();
        let cursor = self.start_list_cursor(&node.collection, collection_ty);
        let (header, body_block, advance_block, exit_block) = self.list_loop_shape(&cursor);

        self.current = Some(body_block);
        // HD dispatches to the FLOAT or ANY runtime variant from the element
        // type the analyzer bound to the loop variable.
        self.append(Stmt::assign(
            Expr::var(loop_var),
            Expr::unary(UnOp::Head, Expr::var(cursor.clone())),
        ));
        self.lower_stmt(&node.body);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, advance_block);
        }
        self.finish_list_loop(&cursor, header, advance_block);
        self.loop_targets.pop();
        self.break_targets.pop();
        self.current = Some(exit_block);
    }

    // ------------------------------------------------------------------
    // Destructuring FOREACH over a pairs list

    fn lower_destructuring_list_foreach(&mut self, node: &ForEachStmt) {
        let collection_ty = self.collection_type(&node.collection);
        let cursor = self.start_list_cursor(&node.collection, collection_ty);
        let (header, body_block, advance_block, exit_block) = self.list_loop_shape(&cursor);

        self.current = Some(body_block);
        let packed = self.new_temp("_forEach_pack_");
        self.register_temp(&packed, VarType::INTEGER.with(VarType::PAIR));
        self.append(Stmt::assign(
            Expr::var(packed.clone()),
            Expr::unary(UnOp::Head, Expr::var(cursor.clone())),
        ));
        // Unpack the 64-bit node value: X = bits 0..32, Y = bits 32..64.
        // The code generator recognizes these shapes and emits UBFX.
        self.append(Stmt::assign(
            Expr::var(node.vars[0].clone()),
            Expr::binary(
                BinOp::BitAnd,
                Expr::var(packed.clone()),
                Expr::Number(0xffff_ffff),
            ),
        ));
        self.append(Stmt::assign(
            Expr::var(node.vars[1].clone()),
            Expr::binary(BinOp::Lsr, Expr::var(packed), Expr::Number(32)),
        ));
        self.lower_stmt(&node.body);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, advance_block);
        }
        self.finish_list_loop(&cursor, header, advance_block);
        self.loop_targets.pop();
        self.break_targets.pop();
        self.current = Some(exit_block);
    }

    // ------------------------------------------------------------------
    // Shared list-loop plumbing

    /// Materialize the cursor temp, pointing at the collection's first node.
    fn start_list_cursor(&mut self, collection: &Expr, collection_ty: VarType) -> String {
        let source = match collection {
            Expr::Variable(name) => name.clone(),
            other => {
                let temp = self.new_temp("_forEach_head_");
                self.register_temp(&temp, collection_ty);
                self.append(Stmt::assign(Expr::var(temp.clone()), other.clone()));
                temp
            }
        };
        let cursor = self.new_temp("_forEach_cursor_");
        self.register_temp(
            &cursor,
            VarType::ANY.with(VarType::LIST_NODE).pointer_to(),
        );
        self.append(Stmt::assign(Expr::var(cursor.clone()), Expr::var(source)));
        cursor
    }

    /// Create header/body/advance/exit and wire the header compare
    /// (`cursor ~= 0`). Pushes break/loop targets; the caller pops them.
    fn list_loop_shape(
        &mut self,
        cursor: &str,
    ) -> (super::BlockId, super::BlockId, super::BlockId, super::BlockId) {
        let pre = self.ensure_block();
        let header = self.cfg.create_block("ForEachHeader_");
        let body_block = self.cfg.create_block("ForEachBody_");
        let advance_block = self.cfg.create_block("ForEachAdvance_");
        let exit_block = self.cfg.create_block("ForEachExit_");

        self.cfg.add_edge(pre, header);
        self.cfg.block_mut(header).is_loop_header = true;
        self.cfg.block_mut(header).add_statement(Stmt::ConditionalBranch {
            condition: Expr::binary(
                BinOp::Ne,
                Expr::var(cursor.to_string()),
                Expr::number(0),
            ),
            branch_on_false: false,
        });
        self.cfg.add_edge(header, body_block);
        self.cfg.add_edge(header, exit_block);

        self.break_targets.push((exit_block, self.scope_depth()));
        self.loop_targets.push((advance_block, self.scope_depth()));
        (header, body_block, advance_block, exit_block)
    }

    /// Fill the advance block: `cursor := TL!(cursor)` and the back edge.
    fn finish_list_loop(
        &mut self,
        cursor: &str,
        header: super::BlockId,
        advance_block: super::BlockId,
    ) {
        self.cfg.block_mut(advance_block).add_statement(Stmt::assign(
            Expr::var(cursor.to_string()),
            Expr::unary(UnOp::Rest, Expr::var(cursor.to_string())),
        ));
        self.cfg.add_edge(advance_block, header);
    }
}

/// True for collection literals that are statically empty; the whole loop is
/// elided for these.
fn is_empty_collection_literal(
    expr: &Expr,
    manifests: &crate::fx::FxHashMap<String, i64>,
) -> bool {
    match expr {
        Expr::Table { entries, .. } => entries.is_empty(),
        Expr::List { items, .. } => items.is_empty(),
        Expr::Alloc { size, .. } => {
            evaluate_constant_expression(size, manifests) == Some(0)
        }
        _ => false,
    }
}
