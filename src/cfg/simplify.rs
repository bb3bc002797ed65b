//! CFG simplification: branch-chain elimination and unreachable-block
//! removal.
//!
//! A block that carries no statements and exactly one successor exists only
//! to jump somewhere else; every predecessor can branch to its target
//! directly. After redirection, blocks no longer reachable from the entry are
//! tombstoned. Runs between CFG construction and liveness, on the semantic
//! graph rather than on emitted text, so switch fans and loop back edges are
//! handled uniformly.

use crate::fx::FxHashMap;

use super::{BlockId, ControlFlowGraph};

use log::{debug, trace};

/// Run the simplification pass over every CFG.
pub fn simplify_all(cfgs: &mut FxHashMap<String, ControlFlowGraph>) {
    for cfg in cfgs.values_mut() {
        simplify_cfg(cfg);
    }
}

/// Simplify a single CFG in place.
pub fn simplify_cfg(cfg: &mut ControlFlowGraph) {
    let mut eliminated = 0usize;
    let mut redirected = 0usize;

    // Iterate to a fixed point: bypassing one chain can expose another.
    loop {
        let mut changed = false;
        for id in cfg.block_ids() {
            let Some(target) = jump_only_target(cfg, id) else {
                continue;
            };
            // Redirect every edge into `id` straight to its target.
            for pred in cfg.block_ids() {
                if pred == id {
                    continue;
                }
                let block = cfg.block_mut(pred);
                let mut touched = false;
                for succ in &mut block.successors {
                    if *succ == id {
                        *succ = target;
                        touched = true;
                    }
                }
                if touched {
                    redirected += 1;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Remove blocks the entry can no longer reach. Labeled blocks stay: a
    // resolved GOTO edge keeps them reachable, and unreachable labels were
    // already rejected.
    let reachable = reachable_from_entry(cfg);
    for id in cfg.block_ids() {
        let block = cfg.block(id);
        if !reachable.contains(&id) && !block.is_entry && !block.is_exit {
            trace!("removing unreachable block {}", block.name);
            cfg.mark_removed(id);
            eliminated += 1;
        }
    }

    if eliminated > 0 || redirected > 0 {
        debug!(
            "simplified {}: {} blocks removed, {} edges redirected",
            cfg.function_name, eliminated, redirected
        );
    }
}

/// If `id` is an empty forwarding block, the block it forwards to.
fn jump_only_target(cfg: &ControlFlowGraph, id: BlockId) -> Option<BlockId> {
    let block = cfg.block(id);
    if block.is_entry || block.is_exit || block.label_name.is_some() {
        return None;
    }
    if !block.statements.is_empty() {
        return None;
    }
    match block.successors.as_slice() {
        [target] if *target != id => Some(*target),
        _ => None,
    }
}

fn reachable_from_entry(cfg: &ControlFlowGraph) -> Vec<BlockId> {
    let mut reachable = Vec::new();
    let Some(entry) = cfg.entry_block else {
        return reachable;
    };
    let mut stack = vec![entry];
    while let Some(id) = stack.pop() {
        if reachable.contains(&id) {
            continue;
        }
        reachable.push(id);
        for &succ in &cfg.block(id).successors {
            if !reachable.contains(&succ) {
                stack.push(succ);
            }
        }
    }
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Stmt};

    #[test]
    fn bypasses_empty_forwarding_block() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        let hop = cfg.create_block("Join_");
        let tail = cfg.create_block("BB_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(entry)
            .add_statement(Stmt::call("WRITES", vec![Expr::number(1)]));
        cfg.block_mut(tail)
            .add_statement(Stmt::call("WRITES", vec![Expr::number(2)]));
        cfg.add_edge(entry, hop);
        cfg.add_edge(hop, tail);

        simplify_cfg(&mut cfg);

        assert_eq!(cfg.block(entry).successors, vec![tail]);
        assert!(cfg.block(hop).is_removed());
        assert_eq!(cfg.live_block_count(), 2);
    }

    #[test]
    fn keeps_blocks_with_statements() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        let mid = cfg.create_block("BB_");
        let tail = cfg.create_block("BB_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(mid)
            .add_statement(Stmt::call("WRITES", vec![]));
        cfg.add_edge(entry, mid);
        cfg.add_edge(mid, tail);

        simplify_cfg(&mut cfg);

        assert_eq!(cfg.block(entry).successors, vec![mid]);
        assert!(!cfg.block(mid).is_removed());
    }

    #[test]
    fn removes_unreachable_islands() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        let island = cfg.create_block("BB_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.block_mut(island)
            .add_statement(Stmt::call("WRITES", vec![]));

        simplify_cfg(&mut cfg);

        assert!(cfg.block(island).is_removed());
        assert!(!cfg.block(entry).is_removed());
    }
}
