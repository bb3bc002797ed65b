//! The AST analyzer.
//!
//! Two passes plus propagation. Pass 1 walks top-level declarations and
//! collects function signatures and preliminary return types. Pass 2 walks
//! every body, inferring expression types, collecting per-function metrics
//! (leaf-ness, heap allocation, call-preserving expressions), recognizing
//! trivial accessors, and accumulating semantic errors. Afterward the call
//! graph is iterated to a fixed point so heap allocation propagates from
//! callee to caller, and parameters that were never given a type are
//! resolved from context.
//!
//! The analyzer is plain state passed by reference; there is no process-wide
//! instance. `reset` restores the initial state for reuse across
//! compilations.

use crate::ast::{Decl, Expr, ForEachStmt, Program, Stmt, UnOp};
use crate::classes::{mangle_method, ClassTable};
use crate::fx::{FxHashMap, FxHashSet};
use crate::result::{CompileError, CompileResult, SemanticError};
use crate::symbols::{Symbol, SymbolKind, SymbolTable};
use crate::types::VarType;

use log::{debug, trace};

/// List-mutating runtime helpers; calling one on a `CONST` list is an error.
pub(crate) const LIST_MUTATORS: &[&str] = &["APND", "LPND", "SPND", "FPND"];

/// Per-function summary produced by the analyzer and consumed by the CFG
/// builder, the register allocator and the code generator.
#[derive(Clone, Debug)]
pub struct FunctionMetrics {
    /// Mangled name for methods, plain name otherwise.
    pub name: String,
    /// Declared parameters, in ABI order (`_this` excluded; see `class_name`).
    pub parameters: Vec<String>,
    pub parameter_types: FxHashMap<String, VarType>,
    /// Types of every local the analyzer saw, including synthesized temps.
    pub variable_types: FxHashMap<String, VarType>,
    pub return_type: VarType,
    /// Class of objects returned by this function, when statically known.
    pub return_class: Option<String>,
    /// Virtual instruction count (statement count), used for call-site
    /// indexing in the live-interval numbering space.
    pub instruction_count: u32,
    pub is_leaf: bool,
    pub performs_heap_allocation: bool,
    pub required_callee_saved_regs: usize,
    /// Callee-saved temporaries the expression generator will claim to keep a
    /// left operand alive across a call in the right operand.
    pub required_callee_saved_temps: usize,
    pub has_call_preserving_expressions: bool,
    pub max_live_variables: usize,
    pub is_trivial_accessor: bool,
    pub is_trivial_setter: bool,
    /// Accessed member for trivial accessors/setters; the sentinel
    /// `_this_ptr` marks an identity accessor returning the object itself.
    pub accessed_member_name: String,
    /// For trivial setters, which parameter is stored.
    pub setter_parameter_index: usize,
    /// Statement indices (in interval numbering) that contain a call. Filled
    /// in by the live-interval pass, consumed by the allocator.
    pub call_sites: Vec<u32>,
    pub accesses_globals: bool,
    /// Direct callees, for the leaf/allocation fixed point.
    pub callees: Vec<String>,
    /// The declaring class for methods.
    pub class_name: Option<String>,
}

impl FunctionMetrics {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            parameter_types: FxHashMap::default(),
            variable_types: FxHashMap::default(),
            return_type: VarType::INTEGER,
            return_class: None,
            instruction_count: 0,
            is_leaf: true,
            performs_heap_allocation: false,
            required_callee_saved_regs: 0,
            required_callee_saved_temps: 0,
            has_call_preserving_expressions: false,
            max_live_variables: 0,
            is_trivial_accessor: false,
            is_trivial_setter: false,
            accessed_member_name: String::new(),
            setter_parameter_index: 0,
            call_sites: Vec::new(),
            accesses_globals: false,
            callees: Vec::new(),
            class_name: None,
        }
    }

    pub fn is_method(&self) -> bool {
        self.class_name.is_some()
    }
}

/// All analyzer outputs for one compilation.
#[derive(Debug, Default)]
pub struct AnalyzerState {
    pub function_metrics: FxHashMap<String, FunctionMetrics>,
    pub manifests: FxHashMap<String, i64>,
    pub semantic_errors: Vec<SemanticError>,
    pub(crate) current_function: String,
    pub(crate) current_class: Option<String>,
    /// Names referenced in the current function body; used to find unused
    /// parameters.
    pub(crate) used_names: FxHashSet<String>,
    /// Type of the most recent `RESULTIS` expression; read by the `VALOF`
    /// inference rule.
    pub(crate) last_resultis_type: Option<VarType>,
}

impl AnalyzerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the initial state; called at the start of every compilation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn metrics_for(&self, function: &str) -> Option<&FunctionMetrics> {
        self.function_metrics.get(function)
    }

    pub fn metrics_mut(&mut self, function: &str) -> Option<&mut FunctionMetrics> {
        self.function_metrics.get_mut(function)
    }

    pub fn get_variable_type(&self, function: &str, name: &str) -> VarType {
        self.function_metrics
            .get(function)
            .and_then(|m| {
                m.variable_types
                    .get(name)
                    .or_else(|| m.parameter_types.get(name))
            })
            .copied()
            .unwrap_or(VarType::UNKNOWN)
    }

    pub fn get_call_sites_for(&self, function: &str) -> &[u32] {
        self.function_metrics
            .get(function)
            .map(|m| m.call_sites.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn error(&mut self, message: impl Into<String>) {
        let function = if self.current_function.is_empty() {
            None
        } else {
            Some(self.current_function.as_str())
        };
        self.semantic_errors.push(SemanticError::new(function, message));
    }

    /// Run both passes and the propagation step. Returns `Rejected` when any
    /// semantic error was collected.
    pub fn run(
        &mut self,
        program: &Program,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) -> CompileResult<()> {
        self.discover_signatures(program, symbols)?;
        self.analyze_bodies(program, symbols, classes)?;
        self.infer_parameter_types(program, symbols);
        self.detect_trivial_bodies(program, symbols, classes);
        self.propagate_leaf_and_allocation();
        if !self.semantic_errors.is_empty() {
            return Err(CompileError::Rejected(self.semantic_errors.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pass 1: signature discovery

    fn discover_signatures(
        &mut self,
        program: &Program,
        symbols: &mut SymbolTable,
    ) -> CompileResult<()> {
        for decl in &program.declarations {
            match decl {
                Decl::Function(func) => {
                    self.register_function(
                        &func.name,
                        &func.parameters,
                        function_return_type(func.is_float_function, &func.body),
                        None,
                        symbols,
                        SymbolKind::Function,
                    );
                }
                Decl::Routine(routine) => {
                    self.register_function(
                        &routine.name,
                        &routine.parameters,
                        VarType::INTEGER,
                        None,
                        symbols,
                        SymbolKind::Routine,
                    );
                }
                Decl::Class(class) => {
                    for member in &class.members {
                        match &member.declaration {
                            Decl::Function(func) => {
                                let mangled = mangle_method(&class.name, &func.name);
                                self.register_function(
                                    &mangled,
                                    &func.parameters,
                                    function_return_type(func.is_float_function, &func.body),
                                    Some(class.name.clone()),
                                    symbols,
                                    SymbolKind::Function,
                                );
                            }
                            Decl::Routine(routine) => {
                                let mangled = mangle_method(&class.name, &routine.name);
                                self.register_function(
                                    &mangled,
                                    &routine.parameters,
                                    VarType::INTEGER,
                                    Some(class.name.clone()),
                                    symbols,
                                    SymbolKind::Routine,
                                );
                            }
                            _ => {}
                        }
                    }
                }
                Decl::Manifest { name, value } => {
                    self.manifests.insert(name.clone(), *value);
                    let mut sym = Symbol::new(name, SymbolKind::Manifest, VarType::INTEGER);
                    sym.location = crate::symbols::Location::Absolute(*value);
                    symbols.declare(sym);
                }
                Decl::Global { name, .. } | Decl::Static { name, .. } => {
                    symbols.declare(Symbol::new(name, SymbolKind::GlobalVar, VarType::UNKNOWN));
                }
                Decl::Let(let_decl) => {
                    // Top-level LET: one writable global word per name.
                    for name in &let_decl.names {
                        let ty = if let_decl.is_float {
                            VarType::FLOAT
                        } else {
                            VarType::UNKNOWN
                        };
                        symbols.declare(Symbol::new(name, SymbolKind::GlobalVar, ty));
                    }
                }
            }
        }
        Ok(())
    }

    fn register_function(
        &mut self,
        name: &str,
        parameters: &[String],
        return_type: VarType,
        class_name: Option<String>,
        symbols: &mut SymbolTable,
        kind: SymbolKind,
    ) {
        trace!("signature: {name} -> {return_type}");
        let mut metrics = FunctionMetrics::new(name);
        metrics.parameters = parameters.to_vec();
        metrics.return_type = return_type;
        metrics.class_name = class_name.clone();
        for param in parameters {
            metrics.parameter_types.insert(param.clone(), VarType::UNKNOWN);
            symbols.declare(
                Symbol::new(param, SymbolKind::Parameter, VarType::UNKNOWN).in_function(name),
            );
        }
        if let Some(class) = &class_name {
            // `_this` is uniformly a pointer to the current class; it is not
            // inferred from context.
            metrics.parameter_types.insert(
                "_this".to_string(),
                VarType::OBJECT.pointer_to(),
            );
            symbols.declare(
                Symbol::new("_this", SymbolKind::Parameter, VarType::OBJECT.pointer_to())
                    .in_function(name)
                    .with_class(class.clone()),
            );
        }
        let mut sym = Symbol::new(name, kind, return_type);
        if let Some(class) = class_name {
            sym = sym.with_class(class);
        }
        symbols.declare(sym);
        self.function_metrics.insert(name.to_string(), metrics);
    }

    // ------------------------------------------------------------------
    // Pass 2: body walk

    fn analyze_bodies(
        &mut self,
        program: &Program,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) -> CompileResult<()> {
        for decl in &program.declarations {
            match decl {
                Decl::Function(func) => {
                    self.analyze_function_body(&func.name, None, Some(&func.body), None, symbols, classes)?;
                }
                Decl::Routine(routine) => {
                    self.analyze_function_body(
                        &routine.name,
                        None,
                        None,
                        Some(&routine.body),
                        symbols,
                        classes,
                    )?;
                }
                Decl::Class(class) => {
                    for member in &class.members {
                        match &member.declaration {
                            Decl::Function(func) => {
                                let mangled = mangle_method(&class.name, &func.name);
                                self.analyze_function_body(
                                    &mangled,
                                    Some(&class.name),
                                    Some(&func.body),
                                    None,
                                    symbols,
                                    classes,
                                )?;
                            }
                            Decl::Routine(routine) => {
                                let mangled = mangle_method(&class.name, &routine.name);
                                self.analyze_function_body(
                                    &mangled,
                                    Some(&class.name),
                                    None,
                                    Some(&routine.body),
                                    symbols,
                                    classes,
                                )?;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn analyze_function_body(
        &mut self,
        name: &str,
        class: Option<&str>,
        expr_body: Option<&Expr>,
        stmt_body: Option<&Stmt>,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) -> CompileResult<()> {
        debug!("analyzing body of {name}");
        self.current_function = name.to_string();
        self.current_class = class.map(str::to_string);
        self.used_names.clear();

        symbols.enter_scope();
        if let Some(body) = expr_body {
            let inferred = self.infer_expr(body, symbols, classes);
            let metrics = self.function_metrics.get_mut(name).unwrap();
            if metrics.return_type == VarType::UNKNOWN {
                metrics.return_type = inferred;
            }
        }
        if let Some(body) = stmt_body {
            self.analyze_stmt(body, symbols, classes);
        }
        symbols.exit_scope();

        // Unused parameters take the NOTUSED type and are skipped by the
        // prologue move sequence.
        let metrics = self.function_metrics.get_mut(name).unwrap();
        let params = metrics.parameters.clone();
        for param in &params {
            if !self.used_names.contains(param) {
                metrics.parameter_types.insert(param.clone(), VarType::NOTUSED);
                symbols.set_type(name, param, VarType::NOTUSED);
            }
        }
        let metrics = self.function_metrics.get_mut(name).unwrap();
        metrics.max_live_variables = metrics
            .variable_types
            .len()
            .max(metrics.parameters.len());

        self.current_function = String::new();
        self.current_class = None;
        Ok(())
    }

    pub(crate) fn analyze_stmt(
        &mut self,
        stmt: &Stmt,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) {
        self.bump_instruction_count();
        match stmt {
            Stmt::Assignment { lhs, rhs } => {
                for (target, value) in lhs.iter().zip(rhs.iter()) {
                    let value_ty = self.infer_expr(value, symbols, classes);
                    self.check_assignment_target(target, symbols, classes);
                    if let Expr::Variable(name) = target {
                        let current = self.current_function.clone();
                        let known = self.get_variable_type(&current, name);
                        if known == VarType::UNKNOWN && value_ty != VarType::UNKNOWN {
                            if let Some(m) = self.function_metrics.get_mut(&current) {
                                m.variable_types.insert(name.clone(), value_ty);
                            }
                            symbols.set_type(&current, name, value_ty);
                        }
                    }
                }
            }
            Stmt::RoutineCall { routine, args } => {
                self.check_const_list_mutation(routine, args, symbols, classes);
                let call = Expr::Call {
                    func: Box::new(routine.clone()),
                    args: args.clone(),
                };
                self.infer_expr(&call, symbols, classes);
            }
            Stmt::If { condition, then_branch } => {
                self.infer_expr(condition, symbols, classes);
                self.analyze_stmt(then_branch, symbols, classes);
            }
            Stmt::Unless { condition, body } => {
                self.infer_expr(condition, symbols, classes);
                self.analyze_stmt(body, symbols, classes);
            }
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => {
                self.infer_expr(condition, symbols, classes);
                self.analyze_stmt(then_branch, symbols, classes);
                self.analyze_stmt(else_branch, symbols, classes);
            }
            Stmt::While { condition, body } | Stmt::Until { condition, body } => {
                self.infer_expr(condition, symbols, classes);
                self.analyze_stmt(body, symbols, classes);
            }
            Stmt::Repeat { body, condition, .. } => {
                self.analyze_stmt(body, symbols, classes);
                if let Some(cond) = condition {
                    self.infer_expr(cond, symbols, classes);
                }
            }
            Stmt::For(for_stmt) => {
                self.infer_expr(&for_stmt.start, symbols, classes);
                self.infer_expr(&for_stmt.end, symbols, classes);
                if let Some(step) = &for_stmt.step {
                    self.infer_expr(step, symbols, classes);
                }
                self.declare_local(
                    &for_stmt.unique_loop_variable_name,
                    VarType::INTEGER,
                    symbols,
                );
                self.analyze_stmt(&for_stmt.body, symbols, classes);
            }
            Stmt::ForEach(foreach) => {
                let collection_ty = self.infer_expr(&foreach.collection, symbols, classes);
                self.check_foreach_collection(foreach, collection_ty);
                for (i, var) in foreach.vars.iter().enumerate() {
                    let ty = foreach_element_type(collection_ty, foreach.vars.len(), i);
                    self.declare_local(var, ty, symbols);
                }
                self.analyze_stmt(&foreach.body, symbols, classes);
            }
            Stmt::Switchon {
                expr,
                cases,
                default_body,
            } => {
                self.infer_expr(expr, symbols, classes);
                let manifests = self.manifests.clone();
                for case in cases {
                    if super::consteval::evaluate_constant_expression(&case.value, &manifests)
                        .is_none()
                    {
                        self.error("CASE label expression is not a compile-time constant");
                    }
                    for s in &case.body {
                        self.analyze_stmt(s, symbols, classes);
                    }
                }
                if let Some(default) = default_body {
                    for s in default {
                        self.analyze_stmt(s, symbols, classes);
                    }
                }
            }
            Stmt::Goto { target } => {
                if !matches!(target, Expr::Variable(_)) {
                    // Computed GOTO: warned, not rejected.
                    log::warn!(
                        "computed GOTO in {}; emitting conservative code",
                        self.current_function
                    );
                }
                self.infer_expr(target, symbols, classes);
            }
            Stmt::Resultis(expr) => {
                let ty = self.infer_expr(expr, symbols, classes);
                self.last_resultis_type = Some(ty);
                let current = self.current_function.clone();
                if let Expr::New { class_name, .. } = expr {
                    if let Some(m) = self.function_metrics.get_mut(&current) {
                        m.return_class = Some(class_name.clone());
                    }
                }
                if let Some(m) = self.function_metrics.get_mut(&current) {
                    if m.return_type == VarType::UNKNOWN {
                        m.return_type = ty;
                    }
                }
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.analyze_stmt(s, symbols, classes);
                }
            }
            Stmt::Block {
                declarations,
                statements,
            } => {
                symbols.enter_scope();
                for decl in declarations {
                    self.analyze_block_decl(decl, symbols, classes);
                }
                for s in statements {
                    self.analyze_stmt(s, symbols, classes);
                }
                symbols.exit_scope();
            }
            Stmt::Defer(inner) => self.analyze_stmt(inner, symbols, classes),
            Stmt::LabelTarget(name) => {
                let current = self.current_function.clone();
                symbols.declare(
                    Symbol::new(name, SymbolKind::Label, VarType::INTEGER).in_function(&current),
                );
            }
            Stmt::Free(expr) => {
                self.infer_expr(expr, symbols, classes);
                self.mark_not_leaf();
            }
            Stmt::Retain { names } => {
                let current = self.current_function.clone();
                for name in names {
                    symbols.set_owns_heap_memory(&current, name, false);
                }
            }
            Stmt::Remanage { names } => {
                let current = self.current_function.clone();
                for name in names {
                    symbols.set_owns_heap_memory(&current, name, true);
                }
            }
            Stmt::Reduction(red) => {
                self.infer_expr(&red.left, symbols, classes);
                self.infer_expr(&red.right, symbols, classes);
                self.declare_local(&red.result, VarType::PAIRS.pointer_to(), symbols);
                self.mark_not_leaf();
                self.mark_allocates();
            }
            Stmt::PairwiseReduction(red) => {
                let input_ty = self.infer_expr(&red.input, symbols, classes);
                let result_ty = if input_ty.contains(VarType::FPAIRS) {
                    VarType::FPAIRS.pointer_to()
                } else {
                    VarType::PAIRS.pointer_to()
                };
                self.declare_local(&red.result, result_ty, symbols);
                self.mark_not_leaf();
                self.mark_allocates();
            }
            Stmt::Break
            | Stmt::Loop
            | Stmt::Finish
            | Stmt::Endcase
            | Stmt::Return
            | Stmt::ConditionalBranch { .. }
            | Stmt::ReductionLoop(_)
            | Stmt::PairwiseReductionLoop(_) => {}
        }
    }

    fn analyze_block_decl(&mut self, decl: &Decl, symbols: &mut SymbolTable, classes: &ClassTable) {
        match decl {
            Decl::Let(let_decl) => {
                for (i, name) in let_decl.names.iter().enumerate() {
                    let init = let_decl.initializers.get(i).and_then(|o| o.as_ref());
                    let mut ty = if let_decl.is_float {
                        VarType::FLOAT
                    } else {
                        VarType::UNKNOWN
                    };
                    let mut owns = false;
                    let mut class_name = None;
                    if let Some(init) = init {
                        let init_ty = self.infer_expr(init, symbols, classes);
                        if ty == VarType::UNKNOWN {
                            ty = init_ty;
                        }
                        owns = is_allocation_expr(init);
                        if let Expr::New { class_name: c, .. } = init {
                            class_name = Some(c.clone());
                        } else if let Some(callee) = init.direct_callee() {
                            class_name = self
                                .function_metrics
                                .get(callee)
                                .and_then(|m| m.return_class.clone());
                        }
                    }
                    let current = self.current_function.clone();
                    let mut sym =
                        Symbol::new(name, SymbolKind::LocalVar, ty).in_function(&current);
                    sym.owns_heap_memory = owns;
                    if let Some(class) = class_name {
                        sym = sym.with_class(class);
                    }
                    symbols.declare(sym);
                    if let Some(m) = self.function_metrics.get_mut(&current) {
                        m.variable_types.insert(name.clone(), ty);
                    }
                }
            }
            Decl::Manifest { name, value } => {
                self.manifests.insert(name.clone(), *value);
                let mut sym = Symbol::new(name, SymbolKind::Manifest, VarType::INTEGER);
                sym.location = crate::symbols::Location::Absolute(*value);
                symbols.declare(sym);
            }
            other => {
                self.error(format!(
                    "declaration kind {:?} is not permitted inside a block",
                    std::mem::discriminant(other)
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // Parameter type inference

    fn infer_parameter_types(&mut self, program: &Program, symbols: &mut SymbolTable) {
        let mut updates: Vec<(String, String, VarType)> = Vec::new();
        for decl in &program.declarations {
            match decl {
                Decl::Function(func) => {
                    self.collect_param_updates(&func.name, &func.parameters, Some(&func.body), None, &mut updates);
                }
                Decl::Routine(routine) => {
                    self.collect_param_updates(
                        &routine.name,
                        &routine.parameters,
                        None,
                        Some(&routine.body),
                        &mut updates,
                    );
                }
                Decl::Class(class) => {
                    for member in &class.members {
                        match &member.declaration {
                            Decl::Function(func) => {
                                let mangled = mangle_method(&class.name, &func.name);
                                self.collect_param_updates(
                                    &mangled,
                                    &func.parameters,
                                    Some(&func.body),
                                    None,
                                    &mut updates,
                                );
                            }
                            Decl::Routine(routine) => {
                                let mangled = mangle_method(&class.name, &routine.name);
                                self.collect_param_updates(
                                    &mangled,
                                    &routine.parameters,
                                    None,
                                    Some(&routine.body),
                                    &mut updates,
                                );
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        for (function, param, ty) in updates {
            if let Some(m) = self.function_metrics.get_mut(&function) {
                m.parameter_types.insert(param.clone(), ty);
            }
            symbols.set_type(&function, &param, ty);
        }
    }

    fn collect_param_updates(
        &mut self,
        function: &str,
        parameters: &[String],
        expr_body: Option<&Expr>,
        stmt_body: Option<&Stmt>,
        updates: &mut Vec<(String, String, VarType)>,
    ) {
        let Some(metrics) = self.function_metrics.get(function) else {
            return;
        };
        let return_type = metrics.return_type;
        for param in parameters {
            let current = metrics
                .parameter_types
                .get(param)
                .copied()
                .unwrap_or(VarType::UNKNOWN);
            if current != VarType::UNKNOWN {
                continue;
            }
            let mut found = None;
            if let Some(body) = expr_body {
                found = param_type_from_expr(body, param, return_type, metrics);
            }
            if found.is_none() {
                if let Some(body) = stmt_body {
                    found = param_type_from_stmt(body, param, return_type, metrics);
                }
            }
            // A used parameter with no contextual evidence defaults to the
            // machine word.
            let ty = found.unwrap_or(VarType::INTEGER);
            updates.push((function.to_string(), param.clone(), ty));
        }
    }

    // ------------------------------------------------------------------
    // Leaf / allocation fixed point

    fn propagate_leaf_and_allocation(&mut self) {
        loop {
            let mut changed = false;
            let names: Vec<String> = self.function_metrics.keys().cloned().collect();
            for name in &names {
                let callees = self.function_metrics[name].callees.clone();
                let mut allocates = self.function_metrics[name].performs_heap_allocation;
                for callee in &callees {
                    if let Some(callee_metrics) = self.function_metrics.get(callee) {
                        if callee_metrics.performs_heap_allocation {
                            allocates = true;
                        }
                    }
                }
                let metrics = self.function_metrics.get_mut(name).unwrap();
                if allocates && !metrics.performs_heap_allocation {
                    metrics.performs_heap_allocation = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Small helpers used by the inference module

    pub(crate) fn bump_instruction_count(&mut self) {
        let current = self.current_function.clone();
        if let Some(m) = self.function_metrics.get_mut(&current) {
            m.instruction_count += 1;
        }
    }

    pub(crate) fn mark_not_leaf(&mut self) {
        let current = self.current_function.clone();
        if let Some(m) = self.function_metrics.get_mut(&current) {
            m.is_leaf = false;
        }
    }

    pub(crate) fn mark_allocates(&mut self) {
        let current = self.current_function.clone();
        if let Some(m) = self.function_metrics.get_mut(&current) {
            m.performs_heap_allocation = true;
        }
    }

    pub(crate) fn record_callee(&mut self, callee: &str) {
        let current = self.current_function.clone();
        if let Some(m) = self.function_metrics.get_mut(&current) {
            if !m.callees.iter().any(|c| c == callee) {
                m.callees.push(callee.to_string());
            }
        }
    }

    pub(crate) fn declare_local(&mut self, name: &str, ty: VarType, symbols: &mut SymbolTable) {
        let current = self.current_function.clone();
        symbols.declare(Symbol::new(name, SymbolKind::LocalVar, ty).in_function(&current));
        if let Some(m) = self.function_metrics.get_mut(&current) {
            m.variable_types.insert(name.to_string(), ty);
        }
    }

    fn check_const_list_mutation(
        &mut self,
        routine: &Expr,
        args: &[Expr],
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) {
        if let Expr::Variable(name) = routine {
            if LIST_MUTATORS.contains(&name.as_str()) {
                if let Some(first) = args.first() {
                    let ty = self.infer_expr(first, symbols, classes);
                    if ty.is_list() && ty.contains(VarType::CONST) {
                        self.error(format!("mutating call {name} on a CONST list"));
                    }
                }
            }
        }
    }

    fn check_assignment_target(
        &mut self,
        target: &Expr,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) {
        // Inference performs visibility checking on member accesses.
        self.infer_expr(target, symbols, classes);
    }

    fn check_foreach_collection(&mut self, foreach: &ForEachStmt, collection_ty: VarType) {
        if collection_ty.contains(VarType::POINTER_TO)
            && collection_ty.base() == VarType::ANY
            && !collection_ty.is_list()
            && foreach.vars.len() == 1
        {
            log::warn!(
                "FOREACH over POINTER TO ANY in {}; element type is ANY",
                self.current_function
            );
        }
    }
}

/// Preliminary return type from the declaration shape alone.
fn function_return_type(is_float_function: bool, body: &Expr) -> VarType {
    if is_float_function || matches!(body, Expr::FloatValof(_)) {
        VarType::FLOAT
    } else {
        VarType::INTEGER
    }
}

/// True for the allocation primitives that make a `LET` own heap memory.
pub(crate) fn is_allocation_expr(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Alloc { .. } | Expr::List { .. } | Expr::Table { .. } | Expr::New { .. }
    )
}

/// Element type bound to a FOREACH loop variable.
fn foreach_element_type(collection: VarType, var_count: usize, index: usize) -> VarType {
    if var_count == 2 {
        // Destructuring FOREACH unpacks the two 32-bit lanes.
        let _ = index;
        return VarType::INTEGER;
    }
    if collection.is_list() {
        collection.list_element_type()
    } else if collection.contains(VarType::PAIRS) {
        VarType::INTEGER.with(VarType::PAIR)
    } else if collection.contains(VarType::FPAIRS) {
        VarType::FLOAT.with(VarType::FPAIR)
    } else if collection.contains(VarType::FLOAT) {
        VarType::FLOAT
    } else if collection.base() == VarType::ANY {
        VarType::ANY
    } else {
        VarType::INTEGER
    }
}

// ----------------------------------------------------------------------
// Contextual parameter typing

fn known_scalar(ty: VarType) -> Option<VarType> {
    if ty == VarType::INTEGER || ty == VarType::FLOAT {
        Some(ty)
    } else {
        None
    }
}

fn param_type_from_expr(
    expr: &Expr,
    param: &str,
    return_type: VarType,
    metrics: &FunctionMetrics,
) -> Option<VarType> {
    match expr {
        Expr::Binary { op: _, lhs, rhs } => {
            let lhs_is_param = matches!(lhs.as_ref(), Expr::Variable(v) if v == param);
            let rhs_is_param = matches!(rhs.as_ref(), Expr::Variable(v) if v == param);
            if lhs_is_param {
                if let Some(ty) = known_scalar(shallow_type(rhs, metrics)) {
                    return Some(ty);
                }
            }
            if rhs_is_param {
                if let Some(ty) = known_scalar(shallow_type(lhs, metrics)) {
                    return Some(ty);
                }
            }
            param_type_from_expr(lhs, param, return_type, metrics)
                .or_else(|| param_type_from_expr(rhs, param, return_type, metrics))
        }
        Expr::Unary { operand, op } => match op {
            UnOp::IntToFloat if matches!(operand.as_ref(), Expr::Variable(v) if v == param) => {
                Some(VarType::INTEGER)
            }
            _ => param_type_from_expr(operand, param, return_type, metrics),
        },
        Expr::Call { func, args } => {
            let mut found = param_type_from_expr(func, param, return_type, metrics);
            for arg in args {
                if found.is_some() {
                    break;
                }
                found = param_type_from_expr(arg, param, return_type, metrics);
            }
            found
        }
        Expr::Valof(body) | Expr::FloatValof(body) => {
            param_type_from_stmt(body, param, return_type, metrics)
        }
        Expr::Conditional {
            condition,
            then_expr,
            else_expr,
        } => param_type_from_expr(condition, param, return_type, metrics)
            .or_else(|| param_type_from_expr(then_expr, param, return_type, metrics))
            .or_else(|| param_type_from_expr(else_expr, param, return_type, metrics)),
        _ => None,
    }
}

fn param_type_from_stmt(
    stmt: &Stmt,
    param: &str,
    return_type: VarType,
    metrics: &FunctionMetrics,
) -> Option<VarType> {
    match stmt {
        Stmt::Resultis(expr) => {
            // The declared return type dominates when the parameter is
            // returned directly.
            if matches!(expr, Expr::Variable(v) if v == param) {
                return known_scalar(return_type);
            }
            param_type_from_expr(expr, param, return_type, metrics)
        }
        Stmt::Assignment { lhs, rhs } => {
            for (target, value) in lhs.iter().zip(rhs.iter()) {
                if matches!(value, Expr::Variable(v) if v == param) {
                    if let Expr::Variable(target_name) = target {
                        if let Some(ty) = metrics
                            .variable_types
                            .get(target_name)
                            .copied()
                            .and_then(known_scalar)
                        {
                            return Some(ty);
                        }
                    }
                }
                if let Some(ty) = param_type_from_expr(value, param, return_type, metrics) {
                    return Some(ty);
                }
            }
            None
        }
        Stmt::If { condition, then_branch } => {
            param_type_from_expr(condition, param, return_type, metrics)
                .or_else(|| param_type_from_stmt(then_branch, param, return_type, metrics))
        }
        Stmt::Unless { condition, body } => {
            param_type_from_expr(condition, param, return_type, metrics)
                .or_else(|| param_type_from_stmt(body, param, return_type, metrics))
        }
        Stmt::Test {
            condition,
            then_branch,
            else_branch,
        } => param_type_from_expr(condition, param, return_type, metrics)
            .or_else(|| param_type_from_stmt(then_branch, param, return_type, metrics))
            .or_else(|| param_type_from_stmt(else_branch, param, return_type, metrics)),
        Stmt::While { condition, body } | Stmt::Until { condition, body } => {
            param_type_from_expr(condition, param, return_type, metrics)
                .or_else(|| param_type_from_stmt(body, param, return_type, metrics))
        }
        Stmt::Repeat { body, condition, .. } => {
            param_type_from_stmt(body, param, return_type, metrics).or_else(|| {
                condition
                    .as_ref()
                    .and_then(|c| param_type_from_expr(c, param, return_type, metrics))
            })
        }
        Stmt::For(for_stmt) => param_type_from_expr(&for_stmt.start, param, return_type, metrics)
            .or_else(|| param_type_from_expr(&for_stmt.end, param, return_type, metrics))
            .or_else(|| param_type_from_stmt(&for_stmt.body, param, return_type, metrics)),
        Stmt::Compound(stmts) => stmts
            .iter()
            .find_map(|s| param_type_from_stmt(s, param, return_type, metrics)),
        Stmt::Block {
            declarations,
            statements,
        } => declarations
            .iter()
            .find_map(|d| match d {
                Decl::Let(let_decl) => let_decl
                    .initializers
                    .iter()
                    .flatten()
                    .find_map(|init| param_type_from_expr(init, param, return_type, metrics)),
                _ => None,
            })
            .or_else(|| {
                statements
                    .iter()
                    .find_map(|s| param_type_from_stmt(s, param, return_type, metrics))
            }),
        Stmt::RoutineCall { args, .. } => args
            .iter()
            .find_map(|a| param_type_from_expr(a, param, return_type, metrics)),
        _ => None,
    }
}

/// A cheap, non-recursive type guess used only for parameter context.
fn shallow_type(expr: &Expr, metrics: &FunctionMetrics) -> VarType {
    match expr {
        Expr::Number(_) | Expr::CharLit(_) | Expr::Boolean(_) => VarType::INTEGER,
        Expr::Float(_) => VarType::FLOAT,
        Expr::Variable(name) => metrics
            .variable_types
            .get(name)
            .or_else(|| metrics.parameter_types.get(name))
            .copied()
            .unwrap_or(VarType::UNKNOWN),
        _ => VarType::UNKNOWN,
    }
}
