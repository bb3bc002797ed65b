//! Lowering of AST statements into basic blocks.
//!
//! One builder instance runs per function. Sequential statements append to
//! the current block; control-flow statements create header/body/join blocks
//! and wire edges, leaving the tested statement as the last statement of the
//! header so the code generator's block epilogue can find the condition.
//!
//! Scope bookkeeping lives here too: block statements push a variable list,
//! and every early exit (RETURN, BREAK, LOOP, ENDCASE, FINISH, GOTO) walks
//! the open scopes in reverse emitting cleanup before its terminator. Under
//! SAMM the cleanup is one `HeapManager_exit_scope` call per open scope;
//! otherwise it is the legacy `BCPL_FREE_LIST`/`FREEVEC`/`RELEASE` sequence
//! for owning locals. The two strategies never mix within one compilation.

use crate::analysis::analyzer::is_allocation_expr;
use crate::analysis::consteval::evaluate_constant_expression;
use crate::analysis::AnalyzerState;
use crate::ast::{Decl, Expr, ForStmt, Program, RepeatKind, Stmt};
use crate::classes::mangle_method;
use crate::fx::FxHashMap;
use crate::result::{CompileError, CompileResult, SemanticError};
use crate::settings::Flags;
use crate::symbols::{Symbol, SymbolKind, SymbolTable};
use crate::types::VarType;

use super::{BlockId, ControlFlowGraph};

use log::{debug, trace};

/// Build one CFG per function, routine and method in the program.
pub fn build_cfgs(
    program: &Program,
    analyzer: &mut AnalyzerState,
    symbols: &mut SymbolTable,
    flags: &Flags,
) -> CompileResult<FxHashMap<String, ControlFlowGraph>> {
    let mut cfgs = FxHashMap::default();
    let mut errors: Vec<SemanticError> = Vec::new();

    for decl in &program.declarations {
        match decl {
            Decl::Function(func) => {
                let cfg = build_function(
                    &func.name,
                    Some(&func.body),
                    None,
                    analyzer,
                    symbols,
                    flags,
                    &mut errors,
                )?;
                cfgs.insert(func.name.clone(), cfg);
            }
            Decl::Routine(routine) => {
                let cfg = build_function(
                    &routine.name,
                    None,
                    Some(&routine.body),
                    analyzer,
                    symbols,
                    flags,
                    &mut errors,
                )?;
                cfgs.insert(routine.name.clone(), cfg);
            }
            Decl::Class(class) => {
                for member in &class.members {
                    match &member.declaration {
                        Decl::Function(func) => {
                            let mangled = mangle_method(&class.name, &func.name);
                            let cfg = build_function(
                                &mangled,
                                Some(&func.body),
                                None,
                                analyzer,
                                symbols,
                                flags,
                                &mut errors,
                            )?;
                            cfgs.insert(mangled, cfg);
                        }
                        Decl::Routine(routine) => {
                            let mangled = mangle_method(&class.name, &routine.name);
                            let cfg = build_function(
                                &mangled,
                                None,
                                Some(&routine.body),
                                analyzer,
                                symbols,
                                flags,
                                &mut errors,
                            )?;
                            cfgs.insert(mangled, cfg);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    if !errors.is_empty() {
        return Err(CompileError::Rejected(errors));
    }
    Ok(cfgs)
}

fn build_function(
    name: &str,
    expr_body: Option<&Expr>,
    stmt_body: Option<&Stmt>,
    analyzer: &mut AnalyzerState,
    symbols: &mut SymbolTable,
    flags: &Flags,
    errors: &mut Vec<SemanticError>,
) -> CompileResult<ControlFlowGraph> {
    debug!("building CFG for {name}");
    // Allocation-free leaf functions skip the SAMM scope protocol entirely.
    let samm_active = flags.samm_enabled
        && analyzer
            .metrics_for(name)
            .map(|m| !(m.is_leaf && !m.performs_heap_allocation))
            .unwrap_or(true);

    let mut builder = CfgBuilder {
        analyzer,
        symbols,
        flags,
        function: name.to_string(),
        cfg: ControlFlowGraph::new(name),
        current: None,
        break_targets: Vec::new(),
        loop_targets: Vec::new(),
        endcase_targets: Vec::new(),
        label_blocks: FxHashMap::default(),
        unresolved_gotos: Vec::new(),
        scope_stack: Vec::new(),
        samm_depth: 0,
        deferred: Vec::new(),
        temp_counter: 0,
        constant_vector_sizes: FxHashMap::default(),
        samm_active,
        errors,
    };
    builder.build(expr_body, stmt_body)?;
    Ok(builder.cfg)
}

pub(crate) struct CfgBuilder<'a> {
    pub(crate) analyzer: &'a mut AnalyzerState,
    pub(crate) symbols: &'a mut SymbolTable,
    #[allow(dead_code)]
    pub(crate) flags: &'a Flags,
    pub(crate) function: String,
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) current: Option<BlockId>,
    /// (target, scope depth at loop entry) for BREAK.
    pub(crate) break_targets: Vec<(BlockId, usize)>,
    /// (target, scope depth at loop entry) for LOOP.
    pub(crate) loop_targets: Vec<(BlockId, usize)>,
    /// (target, scope depth at switch entry) for ENDCASE.
    pub(crate) endcase_targets: Vec<(BlockId, usize)>,
    label_blocks: FxHashMap<String, BlockId>,
    unresolved_gotos: Vec<(BlockId, String)>,
    /// Variables declared per open block scope, in declaration order.
    scope_stack: Vec<Vec<String>>,
    samm_depth: usize,
    deferred: Vec<Stmt>,
    pub(crate) temp_counter: u32,
    /// Known constant element counts of vector-typed locals, tracked on
    /// VEC-initializer assignments so FOREACH can fold the length.
    pub(crate) constant_vector_sizes: FxHashMap<String, i64>,
    samm_active: bool,
    errors: &'a mut Vec<SemanticError>,
}

impl<'a> CfgBuilder<'a> {
    fn build(&mut self, expr_body: Option<&Expr>, stmt_body: Option<&Stmt>) -> CompileResult<()> {
        let entry = self.cfg.create_block("Entry_");
        self.cfg.block_mut(entry).is_entry = true;
        self.cfg.entry_block = Some(entry);
        let exit = self.cfg.create_block("Exit_");
        self.cfg.block_mut(exit).is_exit = true;
        self.cfg.exit_block = Some(exit);
        self.current = Some(entry);

        // The function body itself is one SAMM scope.
        if self.samm_active {
            self.append(Stmt::call("HeapManager_enter_scope", vec![]));
            self.samm_depth = 1;
        }

        let body_stmt;
        let body: &Stmt = match (expr_body, stmt_body) {
            (Some(Expr::Valof(inner)), _) | (Some(Expr::FloatValof(inner)), _) => inner,
            (Some(other), _) => {
                body_stmt = Stmt::Resultis(other.clone());
                &body_stmt
            }
            (None, Some(stmt)) => stmt,
            (None, None) => {
                return Err(CompileError::Structural(format!(
                    "function {} has no body",
                    self.function
                )));
            }
        };
        self.lower_stmt(body);

        // Normal fall-through reaches the exit block.
        if let Some(current) = self.current {
            self.emit_scope_cleanup_to_depth(0);
            self.cfg.add_edge(current, exit);
        }

        self.insert_defer_cleanup(exit);
        self.resolve_gotos();
        self.validate_block_structure()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Block plumbing

    pub(crate) fn ensure_block(&mut self) -> BlockId {
        match self.current {
            Some(id) => id,
            None => {
                // Statements after a terminator open a fresh (unreachable
                // unless labeled) block.
                let id = self.cfg.create_block("BB_");
                self.current = Some(id);
                id
            }
        }
    }

    pub(crate) fn append(&mut self, stmt: Stmt) {
        let id = self.ensure_block();
        self.cfg.block_mut(id).add_statement(stmt);
    }

    /// Terminate the current block with `stmt` and an edge to `target`.
    fn terminate_with_edge(&mut self, stmt: Stmt, target: BlockId) {
        let id = self.ensure_block();
        self.cfg.block_mut(id).add_statement(stmt);
        self.cfg.add_edge(id, target);
        self.current = None;
    }

    pub(crate) fn new_temp(&mut self, prefix: &str) -> String {
        let name = format!("{}{}", prefix, self.temp_counter);
        self.temp_counter += 1;
        name
    }

    /// Register a synthesized temporary with both the symbol table and the
    /// analyzer metrics so liveness and allocation see it.
    pub(crate) fn register_temp(&mut self, name: &str, ty: VarType) {
        self.symbols
            .declare(Symbol::new(name, SymbolKind::LocalVar, ty).in_function(&self.function));
        if let Some(m) = self.analyzer.metrics_mut(&self.function) {
            m.variable_types.insert(name.to_string(), ty);
        }
    }

    pub(crate) fn error(&mut self, message: impl Into<String>) {
        self.errors
            .push(SemanticError::new(Some(&self.function), message));
    }

    // ------------------------------------------------------------------
    // Statement dispatch

    pub(crate) fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.lower_stmt(s);
                }
            }

            Stmt::Block {
                declarations,
                statements,
            } => self.lower_block(declarations, statements),

            Stmt::Assignment { lhs, rhs } => {
                self.track_constant_vector_sizes(lhs, rhs);
                self.append(stmt.clone());
            }

            Stmt::RoutineCall { .. } | Stmt::Free(_) => self.append(stmt.clone()),

            Stmt::Retain { names } => {
                for name in names {
                    self.symbols.set_owns_heap_memory(&self.function, name, false);
                }
            }
            Stmt::Remanage { names } => {
                for name in names {
                    self.symbols.set_owns_heap_memory(&self.function, name, true);
                }
            }

            Stmt::If { condition, then_branch } => {
                self.lower_if(condition, then_branch, stmt)
            }
            Stmt::Unless { condition, body } => self.lower_if(condition, body, stmt),

            Stmt::Test {
                then_branch,
                else_branch,
                ..
            } => self.lower_test(stmt, then_branch, else_branch),

            Stmt::While { body, .. } | Stmt::Until { body, .. } => {
                self.lower_while_shaped(stmt, body)
            }

            Stmt::Repeat {
                body,
                kind,
                condition,
            } => self.lower_repeat(body, *kind, condition.as_ref()),

            Stmt::For(for_stmt) => self.lower_for(for_stmt),
            Stmt::ForEach(foreach) => self.lower_foreach(foreach),

            Stmt::Switchon {
                expr,
                cases,
                default_body,
            } => self.lower_switchon(stmt, expr, cases, default_body.as_ref()),

            Stmt::Goto { target } => self.lower_goto(target),

            Stmt::Break => {
                let Some(&(target, depth)) = self.break_targets.last() else {
                    self.error("BREAK outside of a loop");
                    return;
                };
                self.emit_scope_cleanup_to_depth(depth);
                self.terminate_with_edge(Stmt::Break, target);
            }
            Stmt::Loop => {
                let Some(&(target, depth)) = self.loop_targets.last() else {
                    self.error("LOOP outside of a loop");
                    return;
                };
                self.emit_scope_cleanup_to_depth(depth);
                self.terminate_with_edge(Stmt::Loop, target);
            }
            Stmt::Endcase => {
                let Some(&(target, depth)) = self.endcase_targets.last() else {
                    self.error("ENDCASE outside of SWITCHON");
                    return;
                };
                self.emit_scope_cleanup_to_depth(depth);
                self.terminate_with_edge(Stmt::Endcase, target);
            }

            Stmt::Return => {
                self.emit_scope_cleanup_to_depth(0);
                let exit = self.cfg.exit_block.unwrap();
                self.terminate_with_edge(Stmt::Return, exit);
            }
            Stmt::Resultis(_) => {
                self.emit_scope_cleanup_to_depth(0);
                let exit = self.cfg.exit_block.unwrap();
                self.terminate_with_edge(stmt.clone(), exit);
            }
            Stmt::Finish => {
                self.emit_scope_cleanup_to_depth(0);
                let exit = self.cfg.exit_block.unwrap();
                self.terminate_with_edge(Stmt::Finish, exit);
            }

            Stmt::Defer(inner) => {
                // Deferred work runs at function exit, LIFO.
                self.deferred.push((**inner).clone());
            }

            Stmt::LabelTarget(name) => self.lower_label_target(name),

            Stmt::Reduction(red) => self.lower_reduction(red),
            Stmt::PairwiseReduction(red) => self.lower_pairwise_reduction(red),

            Stmt::ConditionalBranch { .. }
            | Stmt::ReductionLoop(_)
            | Stmt::PairwiseReductionLoop(_) => {
                // Internal nodes are only ever created by this pass.
                self.append(stmt.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Structured statements

    fn lower_block(&mut self, declarations: &[Decl], statements: &[Stmt]) {
        self.symbols.enter_scope();
        self.scope_stack.push(Vec::new());
        if self.samm_active {
            self.append(Stmt::call("HeapManager_enter_scope", vec![]));
            self.samm_depth += 1;
        }

        for decl in declarations {
            if let Decl::Let(let_decl) = decl {
                for (i, name) in let_decl.names.iter().enumerate() {
                    let ty = self
                        .analyzer
                        .metrics_for(&self.function)
                        .and_then(|m| m.variable_types.get(name).copied())
                        .unwrap_or(if let_decl.is_float {
                            VarType::FLOAT
                        } else {
                            VarType::INTEGER
                        });
                    let init = let_decl.initializers.get(i).and_then(|o| o.as_ref());
                    let owns = init.map(is_allocation_expr).unwrap_or(false);
                    let mut sym = Symbol::new(name, SymbolKind::LocalVar, ty)
                        .in_function(&self.function);
                    sym.owns_heap_memory = owns;
                    if let Some(Expr::New { class_name, .. }) = init {
                        sym = sym.with_class(class_name.clone());
                    }
                    self.symbols.declare(sym);
                    self.scope_stack.last_mut().unwrap().push(name.clone());
                    if let Some(init) = init {
                        let assign = Stmt::assign(Expr::var(name.clone()), init.clone());
                        if let Stmt::Assignment { lhs, rhs } = &assign {
                            self.track_constant_vector_sizes(lhs, rhs);
                        }
                        self.append(assign);
                    }
                }
            }
        }

        for s in statements {
            self.lower_stmt(s);
        }

        // Normal fall-through: clean up this scope's owning locals, in
        // reverse declaration order.
        if self.current.is_some() {
            if self.samm_active {
                self.append(Stmt::call("HeapManager_exit_scope", vec![]));
            } else {
                let vars = self.scope_stack.last().cloned().unwrap_or_default();
                self.emit_legacy_cleanup_for(&vars);
            }
        }
        if self.samm_active {
            self.samm_depth -= 1;
        }
        self.scope_stack.pop();
        self.symbols.exit_scope();
    }

    fn lower_if(&mut self, _condition: &Expr, then_branch: &Stmt, original: &Stmt) {
        let cond_block = self.ensure_block();
        // The header holds the cloned statement; the epilogue reads its
        // condition.
        self.cfg.block_mut(cond_block).add_statement(original.clone());
        let then_block = self.cfg.create_block("Then_");
        let join_block = self.cfg.create_block("Join_");
        self.cfg.add_edge(cond_block, then_block);
        self.cfg.add_edge(cond_block, join_block);

        self.current = Some(then_block);
        self.lower_stmt(then_branch);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, join_block);
        }
        self.current = Some(join_block);
    }

    fn lower_test(&mut self, original: &Stmt, then_branch: &Stmt, else_branch: &Stmt) {
        let cond_block = self.ensure_block();
        self.cfg.block_mut(cond_block).add_statement(original.clone());
        let then_block = self.cfg.create_block("Then_");
        let else_block = self.cfg.create_block("Else_");
        let join_block = self.cfg.create_block("Join_");
        self.cfg.add_edge(cond_block, then_block);
        self.cfg.add_edge(cond_block, else_block);

        self.current = Some(then_block);
        self.lower_stmt(then_branch);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, join_block);
        }
        self.current = Some(else_block);
        self.lower_stmt(else_branch);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, join_block);
        }
        self.current = Some(join_block);
    }

    fn lower_while_shaped(&mut self, original: &Stmt, body: &Stmt) {
        let pre = self.ensure_block();
        let header = self.cfg.create_block("WhileHeader_");
        self.cfg.add_edge(pre, header);
        self.cfg.block_mut(header).add_statement(original.clone());
        self.cfg.block_mut(header).is_loop_header = true;

        let body_block = self.cfg.create_block("WhileBody_");
        let exit_block = self.cfg.create_block("WhileExit_");
        self.cfg.add_edge(header, body_block);
        self.cfg.add_edge(header, exit_block);

        self.break_targets.push((exit_block, self.scope_depth()));
        self.loop_targets.push((header, self.scope_depth()));
        self.current = Some(body_block);
        self.lower_stmt(body);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, header);
        }
        self.loop_targets.pop();
        self.break_targets.pop();
        self.current = Some(exit_block);
    }

    fn lower_repeat(&mut self, body: &Stmt, kind: RepeatKind, condition: Option<&Expr>) {
        let pre = self.ensure_block();
        let body_block = self.cfg.create_block("RepeatBody_");
        let exit_block = self.cfg.create_block("RepeatExit_");
        self.cfg.add_edge(pre, body_block);

        match kind {
            RepeatKind::Forever => {
                self.break_targets.push((exit_block, self.scope_depth()));
                self.loop_targets.push((body_block, self.scope_depth()));
                self.current = Some(body_block);
                self.lower_stmt(body);
                if let Some(current) = self.current {
                    self.cfg.add_edge(current, body_block);
                }
            }
            RepeatKind::While | RepeatKind::Until => {
                let header = self.cfg.create_block("RepeatHeader_");
                self.cfg.block_mut(header).is_loop_header = true;
                self.break_targets.push((exit_block, self.scope_depth()));
                self.loop_targets.push((header, self.scope_depth()));
                self.current = Some(body_block);
                self.lower_stmt(body);
                if let Some(current) = self.current {
                    self.cfg.add_edge(current, header);
                }
                let cond = condition.cloned().unwrap_or(Expr::Number(0));
                self.cfg.block_mut(header).add_statement(Stmt::ConditionalBranch {
                    condition: cond,
                    branch_on_false: false,
                });
                match kind {
                    // REPEAT..WHILE: branch back while the condition holds.
                    RepeatKind::While => {
                        self.cfg.add_edge(header, body_block);
                        self.cfg.add_edge(header, exit_block);
                    }
                    // REPEAT..UNTIL uses edge order [exit, back] so the
                    // epilogue emits `b.ne exit; b body`.
                    RepeatKind::Until => {
                        self.cfg.add_edge(header, exit_block);
                        self.cfg.add_edge(header, body_block);
                    }
                    RepeatKind::Forever => unreachable!(),
                }
            }
        }
        self.loop_targets.pop();
        self.break_targets.pop();
        self.current = Some(exit_block);
    }

    fn lower_switchon(
        &mut self,
        original: &Stmt,
        _expr: &Expr,
        cases: &[crate::ast::SwitchCase],
        default_body: Option<&Vec<Stmt>>,
    ) {
        let header = self.ensure_block();
        // Fold the case labels into the header clone so the epilogue can
        // emit immediate compares.
        let mut folded = original.clone();
        if let Stmt::Switchon { cases, .. } = &mut folded {
            for case in cases.iter_mut() {
                if let Some(value) =
                    evaluate_constant_expression(&case.value, &self.analyzer.manifests)
                {
                    case.value = Expr::Number(value);
                }
                // Bodies live in their own blocks; the header keeps labels only.
                case.body = Vec::new();
            }
        }
        self.cfg.block_mut(header).add_statement(folded);

        let join = self.cfg.create_block("EndcaseJoin_");
        self.endcase_targets.push((join, self.scope_depth()));

        let case_blocks: Vec<BlockId> = (0..cases.len())
            .map(|_| self.cfg.create_block("Case_"))
            .collect();
        let default_block = default_body.map(|_| self.cfg.create_block("Default_"));

        for &case_block in &case_blocks {
            self.cfg.add_edge(header, case_block);
        }
        match default_block {
            Some(block) => self.cfg.add_edge(header, block),
            None => self.cfg.add_edge(header, join),
        }

        // Case bodies fall through to the next case, matching the source
        // language; ENDCASE exits to the join.
        for (i, case) in cases.iter().enumerate() {
            self.current = Some(case_blocks[i]);
            for s in &case.body {
                self.lower_stmt(s);
            }
            if let Some(current) = self.current {
                let next = case_blocks
                    .get(i + 1)
                    .copied()
                    .or(default_block)
                    .unwrap_or(join);
                self.cfg.add_edge(current, next);
            }
        }
        if let (Some(block), Some(body)) = (default_block, default_body) {
            self.current = Some(block);
            for s in body {
                self.lower_stmt(s);
            }
            if let Some(current) = self.current {
                self.cfg.add_edge(current, join);
            }
        }

        self.endcase_targets.pop();
        self.current = Some(join);
    }

    fn lower_goto(&mut self, target: &Expr) {
        let target_label = match target {
            Expr::Variable(name) => name.clone(),
            _ => {
                log::warn!("computed GOTO in {}; conservative lowering", self.function);
                self.append(Stmt::Goto {
                    target: target.clone(),
                });
                self.current = None;
                return;
            }
        };
        let goto_block = self.ensure_block();
        self.cfg.block_mut(goto_block).add_statement(Stmt::Goto {
            target: Expr::Variable(target_label.clone()),
        });
        if let Some(&label_block) = self.label_blocks.get(&target_label) {
            self.cfg.add_edge(goto_block, label_block);
        } else {
            self.unresolved_gotos.push((goto_block, target_label));
        }
        self.current = None;
    }

    fn lower_label_target(&mut self, name: &str) {
        let label_block = self.cfg.create_block("Label_");
        self.cfg.block_mut(label_block).label_name = Some(name.to_string());
        if let Some(current) = self.current {
            self.cfg.add_edge(current, label_block);
        }
        self.label_blocks.insert(name.to_string(), label_block);
        self.current = Some(label_block);
    }

    fn lower_for(&mut self, for_stmt: &ForStmt) {
        let var = for_stmt.unique_loop_variable_name.clone();
        self.register_temp(&var, VarType::INTEGER);

        // Init block: loop_var := start.
        self.append(Stmt::assign(Expr::var(var.clone()), for_stmt.start.clone()));
        let init_block = self.ensure_block();

        let header = self.cfg.create_block("ForHeader_");
        self.cfg.add_edge(init_block, header);
        let body_block = self.cfg.create_block("ForBody_");
        let increment_block = self.cfg.create_block("ForIncrement_");
        let exit_block = self.cfg.create_block("ForExit_");

        self.break_targets.push((exit_block, self.scope_depth()));
        self.loop_targets.push((increment_block, self.scope_depth()));

        // The header holds the cloned For node, annotated with folded end
        // metadata so the epilogue can pick CMP-immediate.
        let mut header_clone = for_stmt.clone();
        if let Some(value) =
            evaluate_constant_expression(&for_stmt.end, &self.analyzer.manifests)
        {
            header_clone.is_end_expr_constant = true;
            header_clone.constant_end_value = value;
        }
        header_clone.body = Box::new(Stmt::Compound(Vec::new()));
        self.cfg
            .block_mut(header)
            .add_statement(Stmt::For(header_clone));
        self.cfg.block_mut(header).is_loop_header = true;
        self.cfg.block_mut(header).loop_variable = Some(var.clone());

        self.cfg.add_edge(header, body_block);
        self.cfg.add_edge(header, exit_block);

        self.current = Some(body_block);
        self.lower_stmt(&for_stmt.body);
        if let Some(current) = self.current {
            self.cfg.add_edge(current, increment_block);
        }

        // Increment block: loop_var := loop_var + step (default 1).
        let step = for_stmt.step.clone().unwrap_or(Expr::Number(1));
        self.cfg.block_mut(increment_block).is_increment_block = true;
        self.cfg.block_mut(increment_block).loop_variable = Some(var.clone());
        self.cfg.block_mut(increment_block).add_statement(Stmt::assign(
            Expr::var(var.clone()),
            Expr::binary(crate::ast::BinOp::Add, Expr::var(var), step),
        ));
        self.cfg.add_edge(increment_block, header);

        self.loop_targets.pop();
        self.break_targets.pop();
        self.current = Some(exit_block);
        trace!("FOR lowered into header/body/increment/exit");
    }

    // ------------------------------------------------------------------
    // Scope cleanup

    /// The current cleanup depth: SAMM scopes when SAMM is active, open
    /// block scopes otherwise.
    pub(crate) fn scope_depth(&self) -> usize {
        if self.samm_active {
            self.samm_depth
        } else {
            self.scope_stack.len()
        }
    }

    /// Emit cleanup for every scope deeper than `target_depth`, innermost
    /// first, without closing the builder's own bookkeeping (the scopes stay
    /// open for the code that follows the early exit).
    pub(crate) fn emit_scope_cleanup_to_depth(&mut self, target_depth: usize) {
        if self.samm_active {
            let open = self.samm_depth.saturating_sub(target_depth);
            for _ in 0..open {
                self.append(Stmt::call("HeapManager_exit_scope", vec![]));
            }
            return;
        }
        // Legacy cleanup: walk open block scopes innermost-first.
        let scopes: Vec<Vec<String>> = self
            .scope_stack
            .iter()
            .skip(target_depth)
            .rev()
            .cloned()
            .collect();
        for vars in scopes {
            self.emit_legacy_cleanup_for(&vars);
        }
    }

    /// Free the owning locals of one scope, in reverse declaration order.
    fn emit_legacy_cleanup_for(&mut self, vars: &[String]) {
        for name in vars.iter().rev() {
            let Some(sym) = self.symbols.lookup_in_function(&self.function, name) else {
                continue;
            };
            if !sym.owns_heap_memory {
                continue;
            }
            let ty = sym.ty;
            let cleanup = if ty.is_list() {
                Stmt::call("BCPL_FREE_LIST", vec![Expr::var(name.clone())])
            } else if ty.base() == VarType::OBJECT && ty.contains(VarType::POINTER_TO) {
                Stmt::RoutineCall {
                    routine: Expr::member(Expr::var(name.clone()), "RELEASE"),
                    args: Vec::new(),
                }
            } else {
                Stmt::call("FREEVEC", vec![Expr::var(name.clone())])
            };
            self.append(cleanup);
        }
    }

    // ------------------------------------------------------------------
    // Constant-size vector tracking

    fn track_constant_vector_sizes(&mut self, lhs: &[Expr], rhs: &[Expr]) {
        for (target, value) in lhs.iter().zip(rhs.iter()) {
            let Expr::Variable(name) = target else { continue };
            match value {
                Expr::Alloc { size, .. } => {
                    if let Some(n) =
                        evaluate_constant_expression(size, &self.analyzer.manifests)
                    {
                        self.constant_vector_sizes.insert(name.clone(), n);
                    } else {
                        self.constant_vector_sizes.remove(name);
                    }
                }
                Expr::Table { entries, .. } => {
                    self.constant_vector_sizes
                        .insert(name.clone(), entries.len() as i64);
                }
                _ => {
                    self.constant_vector_sizes.remove(name);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // DEFER, GOTO resolution, validation

    /// Rewire every predecessor of the exit block through a cleanup block
    /// that runs deferred statements in LIFO order.
    fn insert_defer_cleanup(&mut self, exit: BlockId) {
        if self.deferred.is_empty() {
            return;
        }
        let cleanup = self.cfg.create_block("DeferCleanup_");
        for id in self.cfg.block_ids() {
            if id == cleanup {
                continue;
            }
            let block = self.cfg.block_mut(id);
            for succ in &mut block.successors {
                if *succ == exit {
                    *succ = cleanup;
                }
            }
        }
        let deferred: Vec<Stmt> = self.deferred.drain(..).rev().collect();
        for stmt in deferred {
            self.cfg.block_mut(cleanup).add_statement(stmt);
        }
        self.cfg.add_edge(cleanup, exit);
    }

    fn resolve_gotos(&mut self) {
        let unresolved = std::mem::take(&mut self.unresolved_gotos);
        for (goto_block, label) in unresolved {
            match self.label_blocks.get(&label) {
                Some(&target) => self.cfg.add_edge(goto_block, target),
                None => self.error(format!("GOTO target label {label} was never defined")),
            }
        }
    }

    /// Reject degenerate graphs the code generator cannot emit.
    fn validate_block_structure(&self) -> CompileResult<()> {
        for block in self.cfg.blocks() {
            if block.successors.len() == 1
                && block.successors[0] == block.id
                && block.statements.is_empty()
            {
                return Err(CompileError::Structural(format!(
                    "block {} forms an empty infinite self-loop",
                    block.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, FunctionDecl, LetDecl, RoutineDecl};
    use crate::classes::ClassTable;

    fn routine(name: &str, body: Stmt) -> Program {
        Program::new(vec![Decl::Routine(RoutineDecl {
            name: name.into(),
            parameters: vec![],
            body,
            is_virtual: false,
            is_final: false,
        })])
    }

    fn build(program: &mut Program, flags: &Flags) -> FxHashMap<String, ControlFlowGraph> {
        let mut analyzer = AnalyzerState::new();
        let mut symbols = SymbolTable::new();
        let classes = ClassTable::new();
        analyzer.run(program, &mut symbols, &classes).unwrap();
        build_cfgs(program, &mut analyzer, &mut symbols, flags).unwrap()
    }

    fn no_samm() -> Flags {
        Flags {
            samm_enabled: false,
            ..Flags::default()
        }
    }

    #[test]
    fn if_builds_diamond_without_else() {
        let mut program = routine(
            "f",
            Stmt::If {
                condition: Expr::var("c"),
                then_branch: Box::new(Stmt::call("WRITES", vec![Expr::number(1)])),
            },
        );
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["f"];
        // entry (holds IF), then, join, exit
        let entry = cfg.entry_block.unwrap();
        assert_eq!(cfg.block(entry).successors.len(), 2);
        assert!(matches!(
            cfg.block(entry).statements.last(),
            Some(Stmt::If { .. })
        ));
    }

    #[test]
    fn for_loop_shape_and_constant_end() {
        let mut program = routine(
            "f",
            Stmt::For(ForStmt {
                loop_variable: "i".into(),
                unique_loop_variable_name: "i".into(),
                start: Expr::number(1),
                end: Expr::number(3),
                step: None,
                body: Box::new(Stmt::call("WRITEN", vec![Expr::var("i")])),
                is_end_expr_constant: false,
                constant_end_value: 0,
            }),
        );
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["f"];
        let header = cfg
            .blocks()
            .find(|b| b.is_loop_header)
            .expect("loop header exists");
        match header.statements.last() {
            Some(Stmt::For(f)) => {
                assert!(f.is_end_expr_constant);
                assert_eq!(f.constant_end_value, 3);
            }
            other => panic!("unexpected header statement: {other:?}"),
        }
        assert_eq!(header.successors.len(), 2);
        let increment = cfg
            .blocks()
            .find(|b| b.is_increment_block)
            .expect("increment block exists");
        assert_eq!(increment.successors, vec![header.id]);
        assert_eq!(increment.loop_variable.as_deref(), Some("i"));
    }

    #[test]
    fn repeat_until_uses_exit_first_edge_order() {
        let mut program = routine(
            "f",
            Stmt::Repeat {
                body: Box::new(Stmt::call("WRITES", vec![Expr::number(1)])),
                kind: RepeatKind::Until,
                condition: Some(Expr::binary(
                    BinOp::Eq,
                    Expr::var("x"),
                    Expr::number(0),
                )),
            },
        );
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["f"];
        let header = cfg
            .blocks()
            .find(|b| {
                matches!(
                    b.statements.last(),
                    Some(Stmt::ConditionalBranch { .. })
                )
            })
            .expect("repeat header exists");
        let exit_name = &cfg.block(header.successors[0]).name;
        let back_name = &cfg.block(header.successors[1]).name;
        assert!(exit_name.contains("RepeatExit_"), "got {exit_name}");
        assert!(back_name.contains("RepeatBody_"), "got {back_name}");
    }

    #[test]
    fn return_routes_to_exit_block() {
        let mut program = routine(
            "f",
            Stmt::Compound(vec![Stmt::Return, Stmt::call("WRITES", vec![])]),
        );
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["f"];
        let exit = cfg.exit_block.unwrap();
        let preds = cfg.predecessors();
        assert!(preds[&exit].iter().any(|p| *p == cfg.entry_block.unwrap()));
    }

    #[test]
    fn samm_wraps_blocks_with_scope_calls() {
        let mut program = Program::new(vec![Decl::Routine(RoutineDecl {
            name: "f".into(),
            parameters: vec![],
            body: Stmt::Block {
                declarations: vec![Decl::Let(LetDecl {
                    names: vec!["v".into()],
                    initializers: vec![Some(Expr::Alloc {
                        kind: crate::ast::AllocKind::Vec,
                        size: Box::new(Expr::number(8)),
                    })],
                    is_float: false,
                })],
                statements: vec![],
            },
            is_virtual: false,
            is_final: false,
        })]);
        let cfgs = build(&mut program, &Flags::default());
        let cfg = &cfgs["f"];
        let all_calls: Vec<String> = cfg
            .blocks()
            .flat_map(|b| b.statements.iter())
            .filter_map(|s| match s {
                Stmt::RoutineCall {
                    routine: Expr::Variable(name),
                    ..
                } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert!(all_calls.contains(&"HeapManager_enter_scope".to_string()));
        assert!(all_calls.contains(&"HeapManager_exit_scope".to_string()));
        assert!(!all_calls.contains(&"FREEVEC".to_string()));
    }

    #[test]
    fn legacy_cleanup_frees_owning_vec() {
        let mut program = Program::new(vec![Decl::Routine(RoutineDecl {
            name: "f".into(),
            parameters: vec![],
            body: Stmt::Block {
                declarations: vec![Decl::Let(LetDecl {
                    names: vec!["v".into()],
                    initializers: vec![Some(Expr::Alloc {
                        kind: crate::ast::AllocKind::Vec,
                        size: Box::new(Expr::number(8)),
                    })],
                    is_float: false,
                })],
                statements: vec![],
            },
            is_virtual: false,
            is_final: false,
        })]);
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["f"];
        let has_freevec = cfg.blocks().flat_map(|b| b.statements.iter()).any(|s| {
            matches!(
                s,
                Stmt::RoutineCall { routine: Expr::Variable(name), .. } if name == "FREEVEC"
            )
        });
        assert!(has_freevec);
    }

    #[test]
    fn defer_runs_lifo_before_exit() {
        let mut program = routine(
            "f",
            Stmt::Compound(vec![
                Stmt::Defer(Box::new(Stmt::call("WRITEN", vec![Expr::number(1)]))),
                Stmt::Defer(Box::new(Stmt::call("WRITEN", vec![Expr::number(2)]))),
                Stmt::call("WRITES", vec![]),
            ]),
        );
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["f"];
        let cleanup = cfg
            .blocks()
            .find(|b| b.name.contains("DeferCleanup_"))
            .expect("defer cleanup block exists");
        // LIFO: the second deferred call comes first.
        let args: Vec<i64> = cleanup
            .statements
            .iter()
            .filter_map(|s| match s {
                Stmt::RoutineCall { args, .. } => match args.first() {
                    Some(Expr::Number(n)) => Some(*n),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(args, vec![2, 1]);
        assert_eq!(cleanup.successors, vec![cfg.exit_block.unwrap()]);
    }

    #[test]
    fn unresolved_goto_is_rejected() {
        let mut program = routine(
            "f",
            Stmt::Goto {
                target: Expr::var("nowhere"),
            },
        );
        let mut analyzer = AnalyzerState::new();
        let mut symbols = SymbolTable::new();
        let classes = ClassTable::new();
        analyzer.run(&program, &mut symbols, &classes).unwrap();
        let result = build_cfgs(&mut program, &mut analyzer, &mut symbols, &no_samm());
        assert!(matches!(result, Err(CompileError::Rejected(_))));
    }

    #[test]
    fn function_value_body_becomes_resultis() {
        let mut program = Program::new(vec![Decl::Function(FunctionDecl {
            name: "g".into(),
            parameters: vec!["a".into()],
            body: Expr::binary(BinOp::Add, Expr::var("a"), Expr::number(1)),
            is_float_function: false,
            is_virtual: false,
            is_final: false,
        })]);
        let cfgs = build(&mut program, &no_samm());
        let cfg = &cfgs["g"];
        let has_resultis = cfg
            .blocks()
            .flat_map(|b| b.statements.iter())
            .any(|s| matches!(s, Stmt::Resultis(_)));
        assert!(has_resultis);
    }
}
