//! Control-flow graphs of basic blocks.
//!
//! One CFG is built per function, routine or method (methods are keyed by
//! mangled name). Blocks own clones of the AST statements they execute;
//! control-flow statements live in the block that *tests* them (loop headers
//! hold their cloned loop node, switch headers their cloned `SWITCHON`), and
//! the block epilogue emitted by the code generator turns the successor list
//! into branches.
//!
//! Only successor edges are stored. Predecessors are a derived index rebuilt
//! on demand, so an edge update can never leave the two directions
//! disagreeing.

pub mod builder;
pub mod loops;
pub mod reductions;
pub mod simplify;

use crate::ast::Stmt;
use crate::fx::FxHashMap;

/// An opaque reference to a basic block within one CFG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A maximal straight-line statement sequence with a single entry.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Unique name, also used as the block's label in the emitted code.
    pub name: String,
    /// The user label naming this block, when it is a `GOTO` target.
    pub label_name: Option<String>,
    pub statements: Vec<Stmt>,
    pub successors: Vec<BlockId>,
    pub is_entry: bool,
    pub is_exit: bool,
    pub is_loop_header: bool,
    pub is_increment_block: bool,
    pub loop_variable: Option<String>,
    /// Tombstone set by the simplification pass; removed blocks are skipped
    /// by every iterator.
    removed: bool,
}

impl BasicBlock {
    pub fn add_statement(&mut self, stmt: Stmt) {
        debug_assert!(
            !self.ends_with_control_flow(),
            "appending a statement after a terminator in {}",
            self.name
        );
        self.statements.push(stmt);
    }

    /// True if the block already ends in an unconditional control transfer.
    pub fn ends_with_control_flow(&self) -> bool {
        self.statements.last().map_or(false, Stmt::is_terminator)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// The control-flow graph of one function.
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub function_name: String,
    blocks: Vec<BasicBlock>,
    name_to_id: FxHashMap<String, BlockId>,
    pub entry_block: Option<BlockId>,
    pub exit_block: Option<BlockId>,
    block_id_counter: u32,
}

impl ControlFlowGraph {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            blocks: Vec::new(),
            name_to_id: FxHashMap::default(),
            entry_block: None,
            exit_block: None,
            block_id_counter: 0,
        }
    }

    /// Create and register a new block named `{function}_{prefix}{n}`.
    pub fn create_block(&mut self, prefix: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let name = format!("{}_{}{}", self.function_name, prefix, self.block_id_counter);
        self.block_id_counter += 1;
        self.name_to_id.insert(name.clone(), id);
        self.blocks.push(BasicBlock {
            id,
            name,
            label_name: None,
            statements: Vec::new(),
            successors: Vec::new(),
            is_entry: false,
            is_exit: false,
            is_loop_header: false,
            is_increment_block: false,
            loop_variable: None,
            removed: false,
        });
        id
    }

    /// Add a control-flow edge. Only the successor list is updated; the
    /// predecessor view is derived, so there is no second structure to keep
    /// in sync.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        let succs = &mut self.blocks[from.index()].successors;
        succs.push(to);
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.name_to_id.get(name).copied()
    }

    /// All live blocks, in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().filter(|b| !b.removed)
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| !b.removed)
            .map(|b| b.id)
            .collect()
    }

    pub fn live_block_count(&self) -> usize {
        self.blocks.iter().filter(|b| !b.removed).count()
    }

    pub(crate) fn mark_removed(&mut self, id: BlockId) {
        self.blocks[id.index()].removed = true;
    }

    /// Rebuild the predecessor index from the successor lists.
    pub fn predecessors(&self) -> FxHashMap<BlockId, Vec<BlockId>> {
        let mut preds: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for block in self.blocks() {
            for &succ in &block.successors {
                let entry = preds.entry(succ).or_default();
                if !entry.contains(&block.id) {
                    entry.push(block.id);
                }
            }
        }
        preds
    }

    /// Blocks in reverse post-order from the entry block. Unreachable blocks
    /// are appended afterward in creation order so analyses still see them.
    pub fn blocks_in_rpo(&self) -> Vec<BlockId> {
        let mut postorder = Vec::new();
        let mut visited = vec![false; self.blocks.len()];
        if let Some(entry) = self.entry_block {
            self.postorder_visit(entry, &mut visited, &mut postorder);
        }
        postorder.reverse();
        for block in self.blocks() {
            if !visited[block.id.index()] {
                postorder.push(block.id);
            }
        }
        postorder
    }

    fn postorder_visit(&self, id: BlockId, visited: &mut [bool], out: &mut Vec<BlockId>) {
        if visited[id.index()] || self.blocks[id.index()].removed {
            return;
        }
        visited[id.index()] = true;
        let succs = self.blocks[id.index()].successors.clone();
        for succ in succs {
            self.postorder_visit(succ, visited, out);
        }
        out.push(id);
    }

    /// The stable block order used by the code generator: the entry block
    /// first, then the rest alphabetically by block name.
    pub fn blocks_in_emission_order(&self) -> Vec<BlockId> {
        let mut rest: Vec<&BasicBlock> = self
            .blocks()
            .filter(|b| Some(b.id) != self.entry_block)
            .collect();
        rest.sort_by(|a, b| a.name.cmp(&b.name));
        let mut order = Vec::with_capacity(rest.len() + 1);
        if let Some(entry) = self.entry_block {
            order.push(entry);
        }
        order.extend(rest.into_iter().map(|b| b.id));
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    fn diamond() -> (ControlFlowGraph, [BlockId; 4]) {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.create_block("Entry_");
        let then_block = cfg.create_block("Then_");
        let else_block = cfg.create_block("Else_");
        let join = cfg.create_block("Join_");
        cfg.entry_block = Some(entry);
        cfg.block_mut(entry).is_entry = true;
        cfg.add_edge(entry, then_block);
        cfg.add_edge(entry, else_block);
        cfg.add_edge(then_block, join);
        cfg.add_edge(else_block, join);
        (cfg, [entry, then_block, else_block, join])
    }

    #[test]
    fn names_are_function_scoped_and_unique() {
        let mut cfg = ControlFlowGraph::new("main");
        let a = cfg.create_block("BB_");
        let b = cfg.create_block("BB_");
        assert_eq!(cfg.block(a).name, "main_BB_0");
        assert_eq!(cfg.block(b).name, "main_BB_1");
        assert_eq!(cfg.block_by_name("main_BB_1"), Some(b));
    }

    #[test]
    fn derived_predecessors() {
        let (cfg, [entry, then_block, else_block, join]) = diamond();
        let preds = cfg.predecessors();
        assert!(preds.get(&entry).is_none());
        assert_eq!(preds[&then_block], vec![entry]);
        assert_eq!(preds[&else_block], vec![entry]);
        let mut join_preds = preds[&join].clone();
        join_preds.sort();
        assert_eq!(join_preds, vec![then_block, else_block]);
    }

    #[test]
    fn rpo_starts_at_entry_and_ends_at_join() {
        let (cfg, [entry, _, _, join]) = diamond();
        let rpo = cfg.blocks_in_rpo();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], entry);
        assert_eq!(*rpo.last().unwrap(), join);
    }

    #[test]
    fn terminator_detection() {
        let (mut cfg, [entry, ..]) = diamond();
        assert!(!cfg.block(entry).ends_with_control_flow());
        cfg.block_mut(entry).statements.push(Stmt::Resultis(Expr::number(1)));
        assert!(cfg.block(entry).ends_with_control_flow());
    }

    #[test]
    fn emission_order_is_entry_then_alphabetical() {
        let (cfg, [entry, ..]) = diamond();
        let order = cfg.blocks_in_emission_order();
        assert_eq!(order[0], entry);
        let names: Vec<&str> = order[1..]
            .iter()
            .map(|id| cfg.block(*id).name.as_str())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
