//! Live-interval construction.
//!
//! Statements are numbered in reverse post-order, one index per statement
//! plus one extra index at each block boundary so ranges never coalesce
//! across blocks. A variable's interval per block runs from its first to its
//! last appearance, stretched to the block start when it is live-in and to
//! the block end when it is live-out; per-block ranges merge into one global
//! interval. Class methods get a synthetic `_this` interval covering the
//! whole function.
//!
//! Call-site indices are recorded into the function metrics in the same
//! numbering space, which is what makes the allocator's call-crossing test
//! meaningful.

use crate::ast::{Expr, Stmt, UnOp};
use crate::cfg::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::isa::aarch64::Reg;
use crate::symbols::SymbolTable;
use crate::types::VarType;

use super::analyzer::AnalyzerState;
use super::infer::expr_contains_call;
use super::liveness::{statement_vars, Liveness};

use log::trace;

/// The lifetime of a variable in instruction-index space, plus its
/// allocation result. After allocation exactly one of `assigned_register` /
/// `is_spilled` holds.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveInterval {
    pub var_name: String,
    pub start_point: i32,
    pub end_point: i32,
    pub var_type: VarType,
    pub is_spilled: bool,
    pub assigned_register: Option<Reg>,
    pub stack_offset: Option<i32>,
}

impl LiveInterval {
    pub fn new(name: impl Into<String>, start: i32, end: i32, ty: VarType) -> Self {
        Self {
            var_name: name.into(),
            start_point: start,
            end_point: end,
            var_type: ty,
            is_spilled: false,
            assigned_register: None,
            stack_offset: None,
        }
    }

    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        !(self.end_point < other.start_point || other.end_point < self.start_point)
    }
}

/// Build the intervals for one function, sorted by start point, and record
/// its call sites into the analyzer metrics.
pub fn build_intervals(
    cfg: &ControlFlowGraph,
    liveness: &Liveness,
    symbols: &SymbolTable,
    analyzer: &mut AnalyzerState,
) -> Vec<LiveInterval> {
    let function = cfg.function_name.clone();
    let mut interval_map: FxHashMap<String, LiveInterval> = FxHashMap::default();
    let mut call_sites: Vec<u32> = Vec::new();
    let mut position: i32 = 0;

    for id in cfg.blocks_in_rpo() {
        let block = cfg.block(id);
        let block_start = position;
        let block_end = position + block.statements.len() as i32;

        // Pass 1: first and last appearance of every variable in the block.
        let mut block_lifespans: FxHashMap<String, (i32, i32)> = FxHashMap::default();
        for (i, stmt) in block.statements.iter().enumerate() {
            let at = position + i as i32;
            if stmt_contains_call(stmt) {
                call_sites.push(at as u32);
            }
            let (reads, writes) = statement_vars(stmt);
            for name in reads.into_iter().chain(writes) {
                block_lifespans
                    .entry(name)
                    .and_modify(|(_, last)| *last = at)
                    .or_insert((at, at));
            }
        }

        // Pass 2: merge block-local ranges with the liveness sets.
        let empty = Default::default();
        let live_in = liveness.live_in(id).unwrap_or(&empty);
        let live_out = liveness.live_out(id).unwrap_or(&empty);
        let mut names: Vec<&String> = block_lifespans.keys().collect();
        names.extend(live_in.iter());
        names.extend(live_out.iter());
        names.sort();
        names.dedup();

        for name in names {
            let mut start = -1;
            let mut end = -1;
            if let Some(&(first, last)) = block_lifespans.get(name) {
                start = first;
                end = last;
            }
            if live_in.contains(name) {
                start = block_start;
            }
            if live_out.contains(name) {
                end = block_end;
            }
            if start < 0 {
                continue;
            }
            let participates = name == "_this"
                || matches!(
                    symbols.lookup_in_function(&function, name),
                    Some(sym) if matches!(
                        sym.kind,
                        crate::symbols::SymbolKind::LocalVar | crate::symbols::SymbolKind::Parameter
                    )
                );
            if !participates {
                continue;
            }
            match interval_map.get_mut(name.as_str()) {
                Some(interval) => {
                    interval.start_point = interval.start_point.min(start);
                    interval.end_point = interval.end_point.max(end);
                }
                None => {
                    let ty = symbols
                        .lookup_in_function(&function, name)
                        .map(|s| s.ty)
                        .filter(|t| *t != VarType::UNKNOWN)
                        .unwrap_or(VarType::INTEGER);
                    interval_map.insert(
                        name.clone(),
                        LiveInterval::new(name.clone(), start, end, ty),
                    );
                }
            }
        }

        // One extra index between blocks.
        position = block_end + 1;
    }

    // Class methods always carry `_this`, spanning the whole function.
    if function.contains("::") && !interval_map.contains_key("_this") {
        trace!("injecting _this interval for method {function}");
        interval_map.insert(
            "_this".to_string(),
            LiveInterval::new("_this", 0, position, VarType::OBJECT.pointer_to()),
        );
    }

    call_sites.sort_unstable();
    call_sites.dedup();
    if let Some(metrics) = analyzer.metrics_mut(&function) {
        metrics.call_sites = call_sites;
    }

    let mut intervals: Vec<LiveInterval> = interval_map.into_values().collect();
    intervals.sort_by(|a, b| {
        a.start_point
            .cmp(&b.start_point)
            .then_with(|| a.var_name.cmp(&b.var_name))
    });
    trace!("{} intervals for {function}", intervals.len());
    intervals
}

/// True when executing the statement performs a call: direct calls, method
/// and SUPER calls, NEW, allocation primitives, and the list primitives that
/// lower to runtime calls.
pub(crate) fn stmt_contains_call(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::RoutineCall { .. } => true,
        Stmt::Assignment { lhs, rhs } => {
            lhs.iter().any(expr_calls) || rhs.iter().any(expr_calls)
        }
        Stmt::Resultis(expr) | Stmt::Free(expr) => expr_calls(expr),
        Stmt::Reduction(_) | Stmt::PairwiseReduction(_) => true,
        // Header clones evaluate only their condition at this point.
        Stmt::If { condition, .. }
        | Stmt::Unless { condition, .. }
        | Stmt::Test { condition, .. }
        | Stmt::While { condition, .. }
        | Stmt::Until { condition, .. }
        | Stmt::ConditionalBranch { condition, .. } => expr_calls(condition),
        _ => false,
    }
}

pub(crate) fn expr_calls(expr: &Expr) -> bool {
    if expr_contains_call(expr) {
        return true;
    }
    // HD/TL/TL!/LEN on lists resolve through the runtime.
    match expr {
        Expr::Unary { op, operand } => {
            matches!(op, UnOp::Head | UnOp::Tail | UnOp::Rest) || expr_calls(operand)
        }
        Expr::Binary { lhs, rhs, .. } => expr_calls(lhs) || expr_calls(rhs),
        Expr::Alloc { .. } | Expr::List { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::liveness;
    use crate::symbols::{Symbol, SymbolKind};

    fn setup() -> (ControlFlowGraph, SymbolTable, AnalyzerState) {
        let mut symbols = SymbolTable::new();
        for name in ["a", "b"] {
            symbols.declare(
                Symbol::new(name, SymbolKind::LocalVar, VarType::INTEGER).in_function("f"),
            );
        }
        let cfg = ControlFlowGraph::new("f");
        let mut analyzer = AnalyzerState::new();
        analyzer
            .function_metrics
            .insert("f".to_string(), {
                let mut m = crate::analysis::FunctionMetrics::new("f");
                m.variable_types.insert("a".into(), VarType::INTEGER);
                m.variable_types.insert("b".into(), VarType::INTEGER);
                m
            });
        (cfg, symbols, analyzer)
    }

    #[test]
    fn intervals_cover_first_to_last_use() {
        let (mut cfg, symbols, mut analyzer) = setup();
        let entry = cfg.create_block("Entry_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(entry)
            .add_statement(Stmt::assign(Expr::var("a"), Expr::number(1)));
        cfg.block_mut(entry)
            .add_statement(Stmt::assign(Expr::var("b"), Expr::number(2)));
        cfg.block_mut(entry).add_statement(Stmt::assign(
            Expr::var("b"),
            Expr::binary(crate::ast::BinOp::Add, Expr::var("b"), Expr::var("a")),
        ));
        let live = liveness::analyze(&cfg, &symbols);
        let intervals = build_intervals(&cfg, &live, &symbols, &mut analyzer);
        let a = intervals.iter().find(|i| i.var_name == "a").unwrap();
        let b = intervals.iter().find(|i| i.var_name == "b").unwrap();
        assert_eq!((a.start_point, a.end_point), (0, 2));
        assert_eq!((b.start_point, b.end_point), (1, 2));
        // Sorted by start point.
        assert!(intervals.windows(2).all(|w| w[0].start_point <= w[1].start_point));
    }

    #[test]
    fn call_sites_recorded_in_interval_numbering() {
        let (mut cfg, symbols, mut analyzer) = setup();
        let entry = cfg.create_block("Entry_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(entry)
            .add_statement(Stmt::assign(Expr::var("a"), Expr::number(1)));
        cfg.block_mut(entry)
            .add_statement(Stmt::call("WRITEN", vec![Expr::var("a")]));
        let live = liveness::analyze(&cfg, &symbols);
        build_intervals(&cfg, &live, &symbols, &mut analyzer);
        assert_eq!(analyzer.get_call_sites_for("f"), &[1]);
    }

    #[test]
    fn methods_get_a_this_interval() {
        let mut symbols = SymbolTable::new();
        let mut analyzer = AnalyzerState::new();
        analyzer.function_metrics.insert(
            "Point::getX".to_string(),
            crate::analysis::FunctionMetrics::new("Point::getX"),
        );
        let mut cfg = ControlFlowGraph::new("Point::getX");
        let entry = cfg.create_block("Entry_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(entry)
            .add_statement(Stmt::Resultis(Expr::number(0)));
        let live = liveness::analyze(&cfg, &symbols);
        let intervals = build_intervals(&cfg, &live, &mut symbols, &mut analyzer);
        let this = intervals.iter().find(|i| i.var_name == "_this").unwrap();
        assert_eq!(this.start_point, 0);
        assert!(this.end_point >= 1);
    }
}
