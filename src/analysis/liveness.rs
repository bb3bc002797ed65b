//! Iterative live-variable analysis on the CFG.
//!
//! Per block, `USE` holds variables read before any write and `DEF` the
//! variables written. The fixed point iterates `IN = USE ∪ (OUT − DEF)`,
//! `OUT = ∪ successors.IN` over the blocks in post-order until nothing
//! changes. Only function-local variables and parameters participate;
//! globals, manifests and function names are filtered out through the symbol
//! table.

use crate::ast::{Expr, Stmt};
use crate::cfg::{BlockId, ControlFlowGraph};
use crate::fx::{FxHashMap, FxHashSet};
use crate::symbols::{SymbolKind, SymbolTable};

use log::trace;

/// Liveness results for one CFG.
#[derive(Debug, Default)]
pub struct Liveness {
    pub live_in: FxHashMap<BlockId, FxHashSet<String>>,
    pub live_out: FxHashMap<BlockId, FxHashSet<String>>,
    pub use_sets: FxHashMap<BlockId, FxHashSet<String>>,
    pub def_sets: FxHashMap<BlockId, FxHashSet<String>>,
}

impl Liveness {
    pub fn live_in(&self, block: BlockId) -> Option<&FxHashSet<String>> {
        self.live_in.get(&block)
    }

    pub fn live_out(&self, block: BlockId) -> Option<&FxHashSet<String>> {
        self.live_out.get(&block)
    }
}

/// Run the analysis over `cfg`.
pub fn analyze(cfg: &ControlFlowGraph, symbols: &SymbolTable) -> Liveness {
    let mut result = Liveness::default();
    let is_local = |name: &str| -> bool {
        if name == "_this" {
            return true;
        }
        matches!(
            symbols.lookup_in_function(&cfg.function_name, name),
            Some(sym) if matches!(sym.kind, SymbolKind::LocalVar | SymbolKind::Parameter)
        )
    };

    // Block-local USE/DEF.
    for block in cfg.blocks() {
        let mut uses = FxHashSet::default();
        let mut defs: FxHashSet<String> = FxHashSet::default();
        for stmt in &block.statements {
            let (reads, writes) = statement_vars(stmt);
            for name in reads {
                if is_local(&name) && !defs.contains(&name) {
                    uses.insert(name);
                }
            }
            for name in writes {
                if is_local(&name) {
                    defs.insert(name);
                }
            }
        }
        result.use_sets.insert(block.id, uses);
        result.def_sets.insert(block.id, defs);
        result.live_in.insert(block.id, FxHashSet::default());
        result.live_out.insert(block.id, FxHashSet::default());
    }

    // Backward fixed point; post-order converges fastest.
    let mut order = cfg.blocks_in_rpo();
    order.reverse();
    loop {
        let mut changed = false;
        for &id in &order {
            let mut out = FxHashSet::default();
            for &succ in &cfg.block(id).successors {
                if let Some(succ_in) = result.live_in.get(&succ) {
                    out.extend(succ_in.iter().cloned());
                }
            }
            let mut live_in = result.use_sets[&id].clone();
            for name in &out {
                if !result.def_sets[&id].contains(name) {
                    live_in.insert(name.clone());
                }
            }
            if out != result.live_out[&id] {
                result.live_out.insert(id, out);
                changed = true;
            }
            if live_in != result.live_in[&id] {
                result.live_in.insert(id, live_in);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    trace!("liveness converged for {}", cfg.function_name);
    result
}

/// Variables read and written by one statement. Cloned control-flow headers
/// include their nested bodies, which over-approximates reads conservatively
/// in exactly the way the header's branch evaluation does.
pub fn statement_vars(stmt: &Stmt) -> (Vec<String>, Vec<String>) {
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    collect_stmt(stmt, &mut reads, &mut writes);
    (reads, writes)
}

fn collect_stmt(stmt: &Stmt, reads: &mut Vec<String>, writes: &mut Vec<String>) {
    match stmt {
        Stmt::Assignment { lhs, rhs } => {
            for value in rhs {
                collect_expr(value, reads);
            }
            for target in lhs {
                match target {
                    Expr::Variable(name) => writes.push(name.clone()),
                    // Writing through memory reads the base and index.
                    other => collect_expr(other, reads),
                }
            }
        }
        Stmt::RoutineCall { routine, args } => {
            collect_expr(routine, reads);
            for arg in args {
                collect_expr(arg, reads);
            }
        }
        Stmt::If { condition, then_branch } => {
            collect_expr(condition, reads);
            collect_stmt(then_branch, reads, writes);
        }
        Stmt::Unless { condition, body } => {
            collect_expr(condition, reads);
            collect_stmt(body, reads, writes);
        }
        Stmt::Test {
            condition,
            then_branch,
            else_branch,
        } => {
            collect_expr(condition, reads);
            collect_stmt(then_branch, reads, writes);
            collect_stmt(else_branch, reads, writes);
        }
        Stmt::While { condition, body } | Stmt::Until { condition, body } => {
            collect_expr(condition, reads);
            collect_stmt(body, reads, writes);
        }
        Stmt::Repeat { body, condition, .. } => {
            collect_stmt(body, reads, writes);
            if let Some(cond) = condition {
                collect_expr(cond, reads);
            }
        }
        Stmt::For(f) => {
            reads.push(f.unique_loop_variable_name.clone());
            collect_expr(&f.start, reads);
            collect_expr(&f.end, reads);
            if let Some(step) = &f.step {
                collect_expr(step, reads);
            }
            collect_stmt(&f.body, reads, writes);
        }
        Stmt::ForEach(f) => {
            collect_expr(&f.collection, reads);
            for var in &f.vars {
                writes.push(var.clone());
            }
            collect_stmt(&f.body, reads, writes);
        }
        Stmt::Switchon {
            expr,
            cases,
            default_body,
        } => {
            collect_expr(expr, reads);
            for case in cases {
                for s in &case.body {
                    collect_stmt(s, reads, writes);
                }
            }
            if let Some(default) = default_body {
                for s in default {
                    collect_stmt(s, reads, writes);
                }
            }
        }
        Stmt::Goto { target } => collect_expr(target, reads),
        Stmt::Resultis(expr) | Stmt::Free(expr) => collect_expr(expr, reads),
        Stmt::Compound(stmts) => {
            for s in stmts {
                collect_stmt(s, reads, writes);
            }
        }
        Stmt::Block { statements, .. } => {
            for s in statements {
                collect_stmt(s, reads, writes);
            }
        }
        Stmt::Defer(inner) => collect_stmt(inner, reads, writes),
        Stmt::ConditionalBranch { condition, .. } => collect_expr(condition, reads),
        Stmt::Reduction(red) => {
            collect_expr(&red.left, reads);
            collect_expr(&red.right, reads);
            writes.push(red.result.clone());
        }
        Stmt::PairwiseReduction(red) => {
            collect_expr(&red.input, reads);
            writes.push(red.result.clone());
        }
        Stmt::ReductionLoop(r) => {
            reads.push(r.left_name.clone());
            reads.push(r.right_name.clone());
            reads.push(r.result_name.clone());
            reads.push(r.index_name.clone());
            reads.push(r.chunk_count_name.clone());
        }
        Stmt::PairwiseReductionLoop(r) => {
            reads.push(r.vector_name.clone());
            reads.push(r.result_name.clone());
            reads.push(r.index_name.clone());
        }
        Stmt::Break
        | Stmt::Loop
        | Stmt::Finish
        | Stmt::Endcase
        | Stmt::Return
        | Stmt::LabelTarget(_)
        | Stmt::Retain { .. }
        | Stmt::Remanage { .. } => {}
    }
}

fn collect_expr(expr: &Expr, reads: &mut Vec<String>) {
    match expr {
        Expr::Variable(name) => reads.push(name.clone()),
        Expr::Binary { lhs, rhs, .. } => {
            collect_expr(lhs, reads);
            collect_expr(rhs, reads);
        }
        Expr::Unary { operand, .. } => collect_expr(operand, reads),
        Expr::Call { func, args } => {
            collect_expr(func, reads);
            for arg in args {
                collect_expr(arg, reads);
            }
        }
        Expr::MemberAccess { object, .. } => collect_expr(object, reads),
        Expr::SuperMethodCall { args, .. } => {
            reads.push("_this".to_string());
            for arg in args {
                collect_expr(arg, reads);
            }
        }
        Expr::VectorAccess { vector, index }
        | Expr::CharIndirection {
            string: vector,
            index,
        }
        | Expr::FloatVectorIndirection { vector, index } => {
            collect_expr(vector, reads);
            collect_expr(index, reads);
        }
        Expr::Conditional {
            condition,
            then_expr,
            else_expr,
        } => {
            collect_expr(condition, reads);
            collect_expr(then_expr, reads);
            collect_expr(else_expr, reads);
        }
        Expr::Valof(body) | Expr::FloatValof(body) => {
            let mut writes = Vec::new();
            collect_stmt(body, reads, &mut writes);
        }
        Expr::Alloc { size, .. } => collect_expr(size, reads),
        Expr::Table { entries, .. } => {
            for e in entries {
                collect_expr(e, reads);
            }
        }
        Expr::List { items, .. } => {
            for item in items {
                collect_expr(item, reads);
            }
        }
        Expr::Pair { first, second } | Expr::FPair { first, second } => {
            collect_expr(first, reads);
            collect_expr(second, reads);
        }
        Expr::Quad { elements } | Expr::FQuad { elements } => {
            for e in elements {
                collect_expr(e, reads);
            }
        }
        Expr::New { args, .. } => {
            for arg in args {
                collect_expr(arg, reads);
            }
        }
        Expr::Number(_)
        | Expr::Float(_)
        | Expr::StringLit(_)
        | Expr::CharLit(_)
        | Expr::Boolean(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::Symbol;
    use crate::types::VarType;

    fn local(table: &mut SymbolTable, func: &str, name: &str) {
        table.declare(Symbol::new(name, SymbolKind::LocalVar, VarType::INTEGER).in_function(func));
    }

    #[test]
    fn straight_line_use_def() {
        let mut symbols = SymbolTable::new();
        local(&mut symbols, "f", "a");
        local(&mut symbols, "f", "b");
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        // b := a + 1 — a is used, b is defined.
        cfg.block_mut(entry).add_statement(Stmt::assign(
            Expr::var("b"),
            Expr::binary(crate::ast::BinOp::Add, Expr::var("a"), Expr::number(1)),
        ));
        let liveness = analyze(&cfg, &symbols);
        assert!(liveness.use_sets[&entry].contains("a"));
        assert!(!liveness.use_sets[&entry].contains("b"));
        assert!(liveness.def_sets[&entry].contains("b"));
        assert!(liveness.live_in[&entry].contains("a"));
    }

    #[test]
    fn loop_carried_variable_is_live_around_the_backedge() {
        let mut symbols = SymbolTable::new();
        local(&mut symbols, "f", "i");
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        let header = cfg.create_block("Header_");
        let body = cfg.create_block("Body_");
        let exit = cfg.create_block("Exit_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(entry)
            .add_statement(Stmt::assign(Expr::var("i"), Expr::number(0)));
        cfg.block_mut(header).add_statement(Stmt::ConditionalBranch {
            condition: Expr::binary(crate::ast::BinOp::Lt, Expr::var("i"), Expr::number(10)),
            branch_on_false: false,
        });
        cfg.block_mut(body).add_statement(Stmt::assign(
            Expr::var("i"),
            Expr::binary(crate::ast::BinOp::Add, Expr::var("i"), Expr::number(1)),
        ));
        cfg.add_edge(entry, header);
        cfg.add_edge(header, body);
        cfg.add_edge(header, exit);
        cfg.add_edge(body, header);
        let liveness = analyze(&cfg, &symbols);
        assert!(liveness.live_in[&header].contains("i"));
        assert!(liveness.live_out[&body].contains("i"));
        assert!(liveness.live_out[&entry].contains("i"));
    }

    #[test]
    fn globals_do_not_participate() {
        let mut symbols = SymbolTable::new();
        symbols.declare(Symbol::new("G", SymbolKind::GlobalVar, VarType::INTEGER));
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(entry)
            .add_statement(Stmt::call("WRITEN", vec![Expr::var("G")]));
        let liveness = analyze(&cfg, &symbols);
        assert!(liveness.use_sets[&entry].is_empty());
    }
}
