//! ARM64 code generation.
//!
//! The generator walks each function's CFG in a stable order (entry block
//! first, then alphabetical by block name), emitting into the shared
//! instruction stream. Register homes come from the precomputed linear-scan
//! allocation; the three reserved scratch registers plus any pre-reserved
//! callee-saved temporaries are the only registers the expression generator
//! hands out itself.
//!
//! Functions the analyzer marked as trivial accessors or setters skip frames
//! entirely: one load or store against `x0` and `ret`.

pub mod calls;
pub mod expr;

use crate::analysis::accessors::THIS_PTR_SENTINEL;
use crate::analysis::AnalyzerState;
use crate::ast::{Decl, Expr, ForStmt, Program, Stmt};
use crate::cfg::{BasicBlock, BlockId, ControlFlowGraph};
use crate::classes::{mangle_method, ClassTable};
use crate::data::{DataGenerator, DATA_SEGMENT_BASE_LABEL};
use crate::frame::CallFrameManager;
use crate::fx::FxHashMap;
use crate::isa::aarch64::imms::Imm12;
use crate::isa::aarch64::inst::{ALUOp, Cond, Inst, MemArg};
use crate::isa::aarch64::regs::{
    data_base_reg, dreg, fp_reg, is_callee_saved, xreg, zero_reg, Reg, RegClass,
};
use crate::regalloc::AllocationMap;
use crate::result::{CompileError, CompileResult};
use crate::settings::Flags;
use crate::stream::{InstructionStream, Segment};
use crate::symbols::{Location, SymbolTable};
use crate::types::VarType;
use crate::veneer::VeneerManager;

use log::{debug, trace};

/// Drive code generation for the whole program: veneers first, then every
/// function in declaration order, then the static data sections.
pub struct CodeGenerator<'a> {
    pub(crate) flags: &'a Flags,
    pub(crate) analyzer: &'a AnalyzerState,
    pub(crate) symbols: &'a mut SymbolTable,
    pub(crate) classes: &'a ClassTable,
    pub(crate) data: &'a mut DataGenerator,
    pub(crate) stream: &'a mut InstructionStream,
    pub(crate) veneers: &'a VeneerManager,
    pub(crate) allocations: &'a FxHashMap<String, AllocationMap>,

    // Per-function state.
    pub(crate) function: String,
    pub(crate) current_class: Option<String>,
    pub(crate) frame: CallFrameManager,
    pub(crate) epilogue_label: String,
    pub(crate) bounds_label: Option<String>,
    pub(crate) data_base_loaded: bool,
    pub(crate) scratch: ScratchPool,
    pub(crate) return_type: VarType,
}

impl<'a> CodeGenerator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: &'a Flags,
        analyzer: &'a AnalyzerState,
        symbols: &'a mut SymbolTable,
        classes: &'a ClassTable,
        data: &'a mut DataGenerator,
        stream: &'a mut InstructionStream,
        veneers: &'a VeneerManager,
        allocations: &'a FxHashMap<String, AllocationMap>,
    ) -> Self {
        Self {
            flags,
            analyzer,
            symbols,
            classes,
            data,
            stream,
            veneers,
            allocations,
            function: String::new(),
            current_class: None,
            frame: CallFrameManager::new(""),
            epilogue_label: String::new(),
            bounds_label: None,
            data_base_loaded: false,
            scratch: ScratchPool::default(),
            return_type: VarType::INTEGER,
        }
    }

    /// Generate code for every function in the program, walking the CFG map.
    /// Globals are registered first so any function body can address them.
    pub fn generate_program(
        &mut self,
        program: &Program,
        cfgs: &FxHashMap<String, ControlFlowGraph>,
    ) -> CompileResult<()> {
        self.veneers.emit(self.stream, self.flags);

        for decl in &program.declarations {
            match decl {
                Decl::Let(let_decl) => {
                    // Top-level LETs become initialized global words.
                    for (i, name) in let_decl.names.iter().enumerate() {
                        let initial = let_decl
                            .initializers
                            .get(i)
                            .and_then(|o| o.as_ref())
                            .and_then(|e| {
                                crate::analysis::evaluate_constant_expression(
                                    e,
                                    &self.analyzer.manifests,
                                )
                            })
                            .unwrap_or(0);
                        self.register_global(name, initial);
                    }
                }
                Decl::Global { name, initializer } | Decl::Static { name, initializer } => {
                    let initial = initializer
                        .as_ref()
                        .and_then(|e| {
                            crate::analysis::evaluate_constant_expression(
                                e,
                                &self.analyzer.manifests,
                            )
                        })
                        .unwrap_or(0);
                    self.register_global(name, initial);
                }
                _ => {}
            }
        }

        for decl in &program.declarations {
            match decl {
                Decl::Function(func) => {
                    self.generate_function(&func.name, None, cfgs)?;
                }
                Decl::Routine(routine) => {
                    self.generate_function(&routine.name, None, cfgs)?;
                }
                Decl::Class(class) => {
                    for member in &class.members {
                        match &member.declaration {
                            Decl::Function(f) => {
                                let mangled = mangle_method(&class.name, &f.name);
                                self.generate_function(&mangled, Some(&class.name), cfgs)?;
                            }
                            Decl::Routine(r) => {
                                let mangled = mangle_method(&class.name, &r.name);
                                self.generate_function(&mangled, Some(&class.name), cfgs)?;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        self.data.generate_rodata_section(self.stream, self.classes);
        self.data.generate_data_section(self.stream);
        Ok(())
    }

    fn register_global(&mut self, name: &str, initial: i64) {
        self.data.add_global_variable(name, initial);
        let word = self.data.global_word_offset(name).unwrap();
        self.symbols.set_location("", name, Location::DataWord(word));
    }

    // ------------------------------------------------------------------
    // Function generation

    fn generate_function(
        &mut self,
        name: &str,
        class: Option<&str>,
        cfgs: &FxHashMap<String, ControlFlowGraph>,
    ) -> CompileResult<()> {
        debug!("generating code for {name}");
        let metrics = self
            .analyzer
            .metrics_for(name)
            .ok_or_else(|| {
                CompileError::CodegenInvariant(format!("no metrics for function {name}"))
            })?
            .clone();

        self.function = name.to_string();
        self.current_class = class.map(str::to_string);
        self.return_type = metrics.return_type;
        self.data_base_loaded = false;
        self.bounds_label = None;

        // Fast path: trivial accessors and setters get no frame at all.
        if metrics.is_trivial_accessor {
            self.emit_trivial_accessor(&metrics)?;
            return Ok(());
        }
        if metrics.is_trivial_setter {
            self.emit_trivial_setter(&metrics)?;
            return Ok(());
        }

        let cfg = cfgs.get(name).ok_or_else(|| {
            CompileError::CodegenInvariant(format!("no CFG for declared function {name}"))
        })?;
        let allocation = self.allocations.get(name).cloned().unwrap_or_default();

        // Build the frame: every parameter and local gets a slot, spilled
        // intervals included, so the frame size is final before the
        // prologue.
        self.frame = CallFrameManager::new(name);
        for param in &metrics.parameters {
            let ty = metrics
                .parameter_types
                .get(param)
                .copied()
                .unwrap_or(VarType::INTEGER);
            self.frame.add_slot(param, ty);
        }
        if metrics.is_method() {
            self.frame.add_slot("_this", VarType::OBJECT.pointer_to());
        }
        let mut local_names: Vec<&String> = metrics.variable_types.keys().collect();
        local_names.sort();
        for local in local_names {
            self.frame.add_slot(local, metrics.variable_types[local]);
        }
        for interval in allocation.values() {
            if interval.is_spilled {
                self.frame.add_spill_slot(&interval.var_name, interval.var_type);
            }
            if let Some(reg) = interval.assigned_register {
                if is_callee_saved(reg) {
                    self.frame.note_callee_saved(reg);
                }
            }
        }
        if metrics.accesses_globals {
            self.frame.note_callee_saved(data_base_reg());
        }

        // Reserve callee-saved temporaries for call-preserving expressions.
        let used_regs: Vec<Reg> = allocation
            .values()
            .filter_map(|i| i.assigned_register)
            .collect();
        let mut callee_temps = Vec::new();
        for n in 19..=28u8 {
            if callee_temps.len() >= metrics.required_callee_saved_temps {
                break;
            }
            let candidate = xreg(n);
            if candidate != data_base_reg() && !used_regs.contains(&candidate) {
                self.frame.note_callee_saved(candidate);
                callee_temps.push(candidate);
            }
        }
        self.scratch = ScratchPool::new(&used_regs, callee_temps);
        self.frame.finalize();

        // Late-bind the frame offsets into the symbol table.
        let slot_updates: Vec<(String, i32)> = metrics
            .parameters
            .iter()
            .chain(metrics.variable_types.keys())
            .filter_map(|n| self.frame.offset_of(n).ok().map(|off| (n.clone(), off)))
            .collect();
        for (slot_name, offset) in slot_updates {
            self.symbols
                .set_location(name, &slot_name, Location::StackOffset(offset));
        }

        self.epilogue_label = format!("{name}_epilogue");

        // Prologue.
        self.stream.define_label(name, Segment::Text);
        let prologue = self.frame.prologue();
        self.stream.push_insts(&prologue, Segment::Text);

        self.emit_parameter_moves(&metrics, &allocation)?;

        if metrics.accesses_globals {
            self.emit_data_base_load();
        }

        // Block loop.
        let order = cfg.blocks_in_emission_order();
        for id in order {
            self.emit_block(cfg, id, &allocation)?;
        }

        // Bounds-error stub, when the body used it.
        if let Some(label) = self.bounds_label.take() {
            self.stream.define_label(&label, Segment::Text);
            self.emit(Inst::Bl {
                target: crate::veneer::veneer_label("BCPL_BOUNDS_ERROR"),
            });
        }

        // Shared epilogue.
        self.stream
            .define_label(&self.epilogue_label.clone(), Segment::Text);
        let epilogue = self.frame.epilogue();
        self.stream.push_insts(&epilogue, Segment::Text);
        Ok(())
    }

    fn emit_trivial_accessor(&mut self, metrics: &crate::analysis::FunctionMetrics) -> CompileResult<()> {
        self.stream.define_label(&self.function.clone(), Segment::Text);
        if metrics.accessed_member_name == THIS_PTR_SENTINEL {
            // The object pointer is already in x0.
            self.emit(Inst::Ret);
            return Ok(());
        }
        let offset = self.member_offset(&metrics.accessed_member_name)?;
        // Float members return in d0 per the ABI; everything else in x0.
        let rt = if self.member_is_float(&metrics.accessed_member_name) {
            dreg(0)
        } else {
            xreg(0)
        };
        self.emit(Inst::Ldr {
            rt,
            mem: MemArg::offset(xreg(0), offset),
            is32: false,
        });
        self.emit(Inst::Ret);
        Ok(())
    }

    fn member_is_float(&self, member: &str) -> bool {
        let class = self.current_class.as_deref().unwrap_or("");
        self.classes
            .get_class(class)
            .and_then(|entry| entry.member_variables.get(member))
            .map(|info| info.ty.is_float())
            .unwrap_or(false)
    }

    fn emit_trivial_setter(&mut self, metrics: &crate::analysis::FunctionMetrics) -> CompileResult<()> {
        self.stream.define_label(&self.function.clone(), Segment::Text);
        let offset = self.member_offset(&metrics.accessed_member_name)?;
        // `_this` arrives in x0; the stored parameter follows it.
        let src = xreg(1 + metrics.setter_parameter_index as u8);
        self.emit(Inst::Str {
            rt: src,
            mem: MemArg::offset(xreg(0), offset),
            is32: false,
        });
        self.emit(Inst::Ret);
        Ok(())
    }

    pub(crate) fn member_offset(&self, member: &str) -> CompileResult<i32> {
        let class = self.current_class.as_deref().unwrap_or("");
        self.member_offset_in(class, member)
    }

    pub(crate) fn member_offset_in(&self, class: &str, member: &str) -> CompileResult<i32> {
        self.classes
            .get_class(class)
            .and_then(|entry| entry.member_variables.get(member))
            .map(|info| info.offset as i32)
            .ok_or_else(|| {
                CompileError::CodegenInvariant(format!("unknown member {class}.{member}"))
            })
    }

    /// Prologue parameter shuffles: each register-passed parameter moves from
    /// its arrival register to its allocated home (or spill slot). NOTUSED
    /// parameters are skipped.
    fn emit_parameter_moves(
        &mut self,
        metrics: &crate::analysis::FunctionMetrics,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let mut names: Vec<String> = Vec::new();
        if metrics.is_method() {
            names.push("_this".to_string());
        }
        names.extend(metrics.parameters.iter().cloned());

        let mut int_position = 0u8;
        let mut float_position = 0u8;
        for name in names {
            let ty = metrics
                .parameter_types
                .get(&name)
                .copied()
                .unwrap_or(VarType::INTEGER);
            let is_float = ty.uses_fp_register();
            let src = if is_float {
                let r = dreg(float_position);
                float_position += 1;
                r
            } else {
                let r = xreg(int_position);
                int_position += 1;
                r
            };
            if src.hw_enc() >= 8 {
                // Past the register-argument window; stack args are out of
                // scope for this ABI subset.
                continue;
            }
            if ty == VarType::NOTUSED {
                continue;
            }
            match allocation.get(&name) {
                Some(interval) if interval.is_spilled => {
                    let mem = self.frame.slot_mem(&name)?;
                    self.emit(Inst::Str {
                        rt: src,
                        mem,
                        is32: false,
                    });
                }
                Some(interval) => {
                    let home = interval.assigned_register.ok_or_else(|| {
                        CompileError::CodegenInvariant(format!(
                            "parameter {name} has neither register nor spill slot"
                        ))
                    })?;
                    if home != src {
                        // Float homes stay in the FP file; an integer MOV
                        // here would cross register files.
                        if is_float {
                            self.emit(Inst::FMovFF { rd: home, rn: src });
                        } else {
                            self.emit(Inst::MovRR {
                                rd: home,
                                rm: src,
                                nopeep: true,
                            });
                        }
                    }
                }
                None => {
                    // Never used; nothing to move.
                }
            }
        }
        Ok(())
    }

    /// Materialize the data segment base into x28.
    fn emit_data_base_load(&mut self) {
        if self.flags.jit_mode {
            let insts = Inst::load_constant(data_base_reg(), self.flags.data_segment_base_addr);
            self.stream.push_insts(&insts, Segment::Text);
        } else {
            self.emit(Inst::Adrp {
                rd: data_base_reg(),
                label: DATA_SEGMENT_BASE_LABEL.to_string(),
            });
            self.emit(Inst::AddLo12 {
                rd: data_base_reg(),
                rn: data_base_reg(),
                label: DATA_SEGMENT_BASE_LABEL.to_string(),
            });
        }
        self.data_base_loaded = true;
    }

    // ------------------------------------------------------------------
    // Block emission

    fn emit_block(
        &mut self,
        cfg: &ControlFlowGraph,
        id: BlockId,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let block = cfg.block(id);
        trace!("emitting block {}", block.name);
        self.stream.define_label(&block.name, Segment::Text);

        let header_kind = block_header_statement(block);
        let body_statements = if header_kind.is_some() {
            &block.statements[..block.statements.len() - 1]
        } else {
            &block.statements[..]
        };

        self.scratch.reset();
        for stmt in body_statements {
            self.emit_stmt(stmt, allocation)?;
            self.scratch.reset();
        }

        self.emit_block_epilogue(cfg, block, allocation)?;
        Ok(())
    }

    fn emit_block_epilogue(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let succs = &block.successors;
        match succs.len() {
            0 => {
                self.emit(Inst::B {
                    target: self.epilogue_label.clone(),
                });
                Ok(())
            }
            1 => {
                if succs[0] == block.id {
                    return Err(CompileError::CodegenInvariant(format!(
                        "block {} branches to itself",
                        block.name
                    )));
                }
                self.emit(Inst::B {
                    target: cfg.block(succs[0]).name.clone(),
                });
                Ok(())
            }
            _ if matches!(block.statements.last(), Some(Stmt::Switchon { .. })) => {
                self.emit_switch_epilogue(cfg, block, allocation)
            }
            2 => self.emit_two_way_epilogue(cfg, block, allocation),
            _ => self.emit_switch_epilogue(cfg, block, allocation),
        }
    }

    fn emit_two_way_epilogue(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let taken = cfg.block(block.successors[0]).name.clone();
        let fallthrough = cfg.block(block.successors[1]).name.clone();
        let last = block.statements.last().ok_or_else(|| {
            CompileError::CodegenInvariant(format!(
                "two-successor block {} has no branch statement",
                block.name
            ))
        })?;

        // FOR headers compare the loop variable directly.
        if let Stmt::For(for_stmt) = last {
            return self.emit_for_header(for_stmt, allocation, &taken, &fallthrough);
        }

        let (condition, branch_when_true) = match last {
            Stmt::If { condition, .. } => (condition, true),
            Stmt::Unless { condition, .. } => (condition, false),
            Stmt::Test { condition, .. } => (condition, true),
            Stmt::While { condition, .. } => (condition, true),
            Stmt::Until { condition, .. } => (condition, false),
            Stmt::ConditionalBranch { condition, .. } => (condition, true),
            other => {
                return Err(CompileError::CodegenInvariant(format!(
                    "block {} ends in {:?}, which cannot branch two ways",
                    block.name,
                    std::mem::discriminant(other)
                )));
            }
        };

        let cond_reg = self.emit_expr(condition, allocation)?;
        self.emit(Inst::CmpRR {
            rn: cond_reg,
            rm: zero_reg(),
        });
        self.scratch.release(cond_reg);
        let cond = if branch_when_true { Cond::Ne } else { Cond::Eq };
        self.emit(Inst::CondBr {
            cond,
            target: taken,
        });
        self.emit(Inst::B {
            target: fallthrough,
        });
        Ok(())
    }

    /// FOR header: compare the loop variable against the end bound, exiting
    /// on greater-than. A constant bound that fits 12 bits becomes a
    /// CMP-immediate; anything else loads into a temporary first.
    fn emit_for_header(
        &mut self,
        for_stmt: &ForStmt,
        allocation: &AllocationMap,
        body_target: &str,
        exit_target: &str,
    ) -> CompileResult<()> {
        let var_reg = self.load_variable(&for_stmt.unique_loop_variable_name, allocation)?;
        if for_stmt.is_end_expr_constant
            && (0..=4095).contains(&for_stmt.constant_end_value)
        {
            self.emit(Inst::CmpImm {
                rn: var_reg,
                imm: Imm12::maybe_from_u64(for_stmt.constant_end_value as u64).unwrap(),
            });
        } else if for_stmt.is_end_expr_constant {
            let temp = self.scratch.acquire_int()?;
            let insts = Inst::load_constant(temp, for_stmt.constant_end_value as u64);
            self.stream.push_insts(&insts, Segment::Text);
            self.emit(Inst::CmpRR {
                rn: var_reg,
                rm: temp,
            });
            self.scratch.release(temp);
        } else {
            let end_reg = self.emit_expr(&for_stmt.end, allocation)?;
            self.emit(Inst::CmpRR {
                rn: var_reg,
                rm: end_reg,
            });
            self.scratch.release(end_reg);
        }
        self.scratch.release(var_reg);
        self.emit(Inst::CondBr {
            cond: Cond::Gt,
            target: exit_target.to_string(),
        });
        self.emit(Inst::B {
            target: body_target.to_string(),
        });
        Ok(())
    }

    /// SWITCHON header: evaluate once, CMP/B.EQ per case, then branch to the
    /// default (when present) or the join.
    fn emit_switch_epilogue(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        let last = block.statements.last();
        let Some(Stmt::Switchon { expr, cases, .. }) = last else {
            return Err(CompileError::CodegenInvariant(format!(
                "block {} has {} successors but is not a SWITCHON header",
                block.name,
                block.successors.len()
            )));
        };

        let value_reg = self.emit_expr(expr, allocation)?;
        for (i, case) in cases.iter().enumerate() {
            let case_value = match &case.value {
                Expr::Number(n) => *n,
                other => crate::analysis::evaluate_constant_expression(
                    other,
                    &self.analyzer.manifests,
                )
                .ok_or_else(|| {
                    CompileError::CodegenInvariant(
                        "non-constant CASE label survived analysis".to_string(),
                    )
                })?,
            };
            if (0..=4095).contains(&case_value) {
                self.emit(Inst::CmpImm {
                    rn: value_reg,
                    imm: Imm12::maybe_from_u64(case_value as u64).unwrap(),
                });
            } else {
                let temp = self.scratch.acquire_int()?;
                let insts = Inst::load_constant(temp, case_value as u64);
                self.stream.push_insts(&insts, Segment::Text);
                self.emit(Inst::CmpRR {
                    rn: value_reg,
                    rm: temp,
                });
                self.scratch.release(temp);
            }
            let target = cfg.block(block.successors[i]).name.clone();
            self.emit(Inst::CondBr {
                cond: Cond::Eq,
                target,
            });
        }
        self.scratch.release(value_reg);
        // The final successor is the default block or the join.
        let fallback = cfg
            .block(*block.successors.last().unwrap())
            .name
            .clone();
        self.emit(Inst::B { target: fallback });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statement emission

    pub(crate) fn emit_stmt(
        &mut self,
        stmt: &Stmt,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        match stmt {
            Stmt::Assignment { lhs, rhs } => {
                for (target, value) in lhs.iter().zip(rhs.iter()) {
                    self.emit_assignment(target, value, allocation)?;
                }
                Ok(())
            }
            Stmt::RoutineCall { routine, args } => {
                let result = self.lower_call(routine, args, allocation)?;
                if let Some(reg) = result {
                    self.scratch.release(reg);
                }
                Ok(())
            }
            Stmt::Resultis(expr) => {
                let value = self.emit_expr(expr, allocation)?;
                if self.return_type.uses_fp_register() {
                    if value.class() == RegClass::Float {
                        if value != dreg(0) {
                            self.emit(Inst::FMovFF {
                                rd: dreg(0),
                                rn: value,
                            });
                        }
                    } else {
                        self.emit(Inst::FMovToFpu {
                            rd: dreg(0),
                            rn: value,
                        });
                    }
                } else if value.class() == RegClass::Float {
                    self.emit(Inst::FMovFromFpu {
                        rd: xreg(0),
                        rn: value,
                    });
                } else if value != xreg(0) {
                    self.emit(Inst::mov(xreg(0), value));
                }
                self.scratch.release(value);
                Ok(())
            }
            // Break/Loop/Endcase/Return terminate their block; the branch
            // comes from the block's single successor edge.
            Stmt::Break | Stmt::Loop | Stmt::Endcase | Stmt::Return | Stmt::Finish => Ok(()),
            Stmt::Goto { target } => self.emit_goto(target),
            Stmt::Free(expr) => {
                let arg = self.emit_expr(expr, allocation)?;
                if arg != xreg(0) {
                    self.emit(Inst::mov(xreg(0), arg));
                }
                self.scratch.release(arg);
                self.emit_call_to("FREEVEC");
                Ok(())
            }
            Stmt::ReductionLoop(red) => self.emit_reduction_loop(red, allocation),
            Stmt::PairwiseReductionLoop(red) => self.emit_pairwise_loop(red, allocation),
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.emit_stmt(s, allocation)?;
                }
                Ok(())
            }
            Stmt::LabelTarget(_) | Stmt::Retain { .. } | Stmt::Remanage { .. } => Ok(()),
            other => Err(CompileError::CodegenInvariant(format!(
                "statement {:?} reached the code generator without lowering",
                std::mem::discriminant(other)
            ))),
        }
    }

    fn emit_goto(&mut self, target: &Expr) -> CompileResult<()> {
        match target {
            Expr::Variable(_) => {
                // The builder resolved the label to a successor edge; the
                // block epilogue emits the branch.
                Ok(())
            }
            _ => Err(CompileError::CodegenInvariant(
                "computed GOTO target is not a label".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Shared emission helpers

    pub(crate) fn emit(&mut self, inst: Inst) {
        self.stream.push_inst(&inst, Segment::Text);
    }

    pub(crate) fn emit_all(&mut self, insts: &[Inst]) {
        self.stream.push_insts(insts, Segment::Text);
    }

    /// Branch-and-link to a runtime or local function by name, routing
    /// external names through their veneer.
    pub(crate) fn emit_call_to(&mut self, name: &str) {
        let target = if self.veneers.is_external(name) {
            crate::veneer::veneer_label(name)
        } else {
            name.to_string()
        };
        self.emit(Inst::Bl { target });
    }

    /// The home register of `name`, loading spilled values and globals into
    /// scratch.
    pub(crate) fn load_variable(
        &mut self,
        name: &str,
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        if let Some(interval) = allocation.get(name) {
            if let Some(reg) = interval.assigned_register {
                return Ok(reg);
            }
            // Spilled: reload from the frame slot.
            let dest = if interval.var_type.uses_fp_register() {
                self.scratch.acquire_float()?
            } else {
                self.scratch.acquire_int()?
            };
            let mem = self.frame.slot_mem(name)?;
            self.emit(Inst::Ldr {
                rt: dest,
                mem,
                is32: false,
            });
            return Ok(dest);
        }
        if let Some(word) = self.data.global_word_offset(name) {
            let dest = self.scratch.acquire_int()?;
            self.emit(Inst::Ldr {
                rt: dest,
                mem: MemArg::offset(data_base_reg(), (word * 8) as i32),
                is32: false,
            });
            return Ok(dest);
        }
        if let Some(&value) = self.analyzer.manifests.get(name) {
            let dest = self.scratch.acquire_int()?;
            let insts = Inst::load_constant(dest, value as u64);
            self.emit_all(&insts);
            return Ok(dest);
        }
        // A local the allocator never saw (dead store target): use its slot.
        if self.frame.has_slot(name) {
            let dest = self.scratch.acquire_int()?;
            let mem = self.frame.slot_mem(name)?;
            self.emit(Inst::Ldr {
                rt: dest,
                mem,
                is32: false,
            });
            return Ok(dest);
        }
        Err(CompileError::CodegenInvariant(format!(
            "no home for variable {name} in {}",
            self.function
        )))
    }

    /// Store `value` into the home of `name`.
    pub(crate) fn store_variable(
        &mut self,
        name: &str,
        value: Reg,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        if let Some(interval) = allocation.get(name) {
            if let Some(home) = interval.assigned_register {
                match (home.class(), value.class()) {
                    (RegClass::Int, RegClass::Int) => {
                        if home != value {
                            self.emit(Inst::mov(home, value));
                        }
                    }
                    (RegClass::Float, RegClass::Float) => {
                        if home != value {
                            self.emit(Inst::FMovFF { rd: home, rn: value });
                        }
                    }
                    (RegClass::Float, RegClass::Int) => {
                        self.emit(Inst::FMovToFpu { rd: home, rn: value });
                    }
                    (RegClass::Int, RegClass::Float) => {
                        self.emit(Inst::FMovFromFpu { rd: home, rn: value });
                    }
                }
                return Ok(());
            }
            let mem = self.frame.slot_mem(name)?;
            self.emit(Inst::Str {
                rt: value,
                mem,
                is32: false,
            });
            return Ok(());
        }
        if let Some(word) = self.data.global_word_offset(name) {
            self.emit(Inst::Str {
                rt: value,
                mem: MemArg::offset(data_base_reg(), (word * 8) as i32),
                is32: false,
            });
            return Ok(());
        }
        if self.frame.has_slot(name) {
            let mem = self.frame.slot_mem(name)?;
            self.emit(Inst::Str {
                rt: value,
                mem,
                is32: false,
            });
            return Ok(());
        }
        Err(CompileError::CodegenInvariant(format!(
            "no home for assignment target {name} in {}",
            self.function
        )))
    }

    /// Materialize the address of `label` into a register: `adrp`+`add`
    /// statically, absolute `movz`/`movk` under the JIT.
    pub(crate) fn load_label_address(&mut self, label: &str, dest: Reg) {
        if self.flags.jit_mode {
            self.emit(Inst::MovZLabel {
                rd: dest,
                label: label.to_string(),
            });
            self.emit(Inst::MovKLabel {
                rd: dest,
                label: label.to_string(),
            });
        } else {
            self.emit(Inst::Adrp {
                rd: dest,
                label: label.to_string(),
            });
            self.emit(Inst::AddLo12 {
                rd: dest,
                rn: dest,
                label: label.to_string(),
            });
        }
    }

    /// The per-function bounds-error stub label, created on first use.
    pub(crate) fn bounds_error_label(&mut self) -> String {
        if self.bounds_label.is_none() {
            self.bounds_label = Some(format!("{}_bounds_error", self.function));
        }
        self.bounds_label.clone().unwrap()
    }

    /// Address-of support: every local has a frame slot, so flushing the
    /// register home to the slot first makes `@v` meaningful.
    pub(crate) fn flush_to_slot(
        &mut self,
        name: &str,
        allocation: &AllocationMap,
    ) -> CompileResult<i32> {
        if let Some(interval) = allocation.get(name) {
            if let Some(home) = interval.assigned_register {
                let mem = self.frame.slot_mem(name)?;
                self.emit(Inst::Str {
                    rt: home,
                    mem,
                    is32: false,
                });
            }
        }
        self.frame.offset_of(name)
    }

    /// Compute an address `base + offset` into `dest`, handling negative
    /// frame offsets.
    pub(crate) fn emit_address_of_offset(&mut self, dest: Reg, base: Reg, offset: i32) {
        let op = if offset < 0 { ALUOp::Sub } else { ALUOp::Add };
        let magnitude = offset.unsigned_abs() as u64;
        match Imm12::maybe_from_u64(magnitude) {
            Some(imm) => self.emit(Inst::AluRRImm12 {
                op,
                rd: dest,
                rn: base,
                imm,
            }),
            None => {
                let insts = Inst::load_constant(dest, magnitude);
                self.emit_all(&insts);
                self.emit(Inst::AluRRR {
                    op,
                    rd: dest,
                    rn: base,
                    rm: dest,
                });
            }
        }
    }

    pub(crate) fn frame_pointer(&self) -> Reg {
        fp_reg()
    }
}

/// The control-flow statement a block's epilogue consumes, when its last
/// statement is one.
fn block_header_statement(block: &BasicBlock) -> Option<&Stmt> {
    if block.successors.len() < 2 {
        return None;
    }
    match block.statements.last() {
        Some(
            stmt @ (Stmt::If { .. }
            | Stmt::Unless { .. }
            | Stmt::Test { .. }
            | Stmt::While { .. }
            | Stmt::Until { .. }
            | Stmt::For(_)
            | Stmt::Switchon { .. }
            | Stmt::ConditionalBranch { .. }),
        ) => Some(stmt),
        _ => None,
    }
}

// ----------------------------------------------------------------------
// Scratch register pool

/// The registers the expression generator may hand out: the three reserved
/// caller-saved scratch registers, any callee-saved temporaries reserved for
/// call-preserving expressions, and the caller-saved FP registers the
/// allocator left unused.
#[derive(Debug, Default)]
pub(crate) struct ScratchPool {
    int_regs: Vec<(Reg, bool)>,
    float_regs: Vec<(Reg, bool)>,
    /// Callee-saved temporaries, handed out only for values that must
    /// survive a call.
    callee_temps: Vec<(Reg, bool)>,
}

impl ScratchPool {
    fn new(used_by_allocation: &[Reg], callee_temps: Vec<Reg>) -> Self {
        let int_regs = crate::isa::aarch64::regs::scratch_candidates()
            .into_iter()
            .take(crate::isa::aarch64::regs::RESERVED_SCRATCH_COUNT)
            .map(|r| (r, false))
            .collect();
        // Caller-saved FP registers not claimed by the allocator.
        let float_regs = (16..=23u8)
            .map(dreg)
            .filter(|r| !used_by_allocation.contains(r))
            .map(|r| (r, false))
            .collect();
        Self {
            int_regs,
            float_regs,
            callee_temps: callee_temps.into_iter().map(|r| (r, false)).collect(),
        }
    }

    pub(crate) fn reset(&mut self) {
        for slot in self
            .int_regs
            .iter_mut()
            .chain(&mut self.float_regs)
            .chain(&mut self.callee_temps)
        {
            slot.1 = false;
        }
    }

    pub(crate) fn acquire_int(&mut self) -> CompileResult<Reg> {
        for slot in &mut self.int_regs {
            if !slot.1 {
                slot.1 = true;
                return Ok(slot.0);
            }
        }
        // Fall back to an idle callee temp under pressure.
        for slot in &mut self.callee_temps {
            if !slot.1 {
                slot.1 = true;
                return Ok(slot.0);
            }
        }
        Err(CompileError::CodegenInvariant(
            "expression too deep: scratch register pool exhausted".to_string(),
        ))
    }

    pub(crate) fn acquire_float(&mut self) -> CompileResult<Reg> {
        for slot in &mut self.float_regs {
            if !slot.1 {
                slot.1 = true;
                return Ok(slot.0);
            }
        }
        Err(CompileError::CodegenInvariant(
            "expression too deep: FP scratch pool exhausted".to_string(),
        ))
    }

    /// A callee-saved temporary for a value that must survive a call.
    pub(crate) fn acquire_callee_temp(&mut self) -> CompileResult<Reg> {
        for slot in &mut self.callee_temps {
            if !slot.1 {
                slot.1 = true;
                return Ok(slot.0);
            }
        }
        Err(CompileError::CodegenInvariant(
            "no callee-saved temporary reserved for call-preserving expression".to_string(),
        ))
    }

    /// True when `reg` belongs to this pool and may be used as a result
    /// destination in place.
    pub(crate) fn is_managed(&self, reg: Reg) -> bool {
        self.int_regs
            .iter()
            .chain(&self.float_regs)
            .chain(&self.callee_temps)
            .any(|slot| slot.0 == reg)
    }

    /// Release a previously acquired scratch register. Registers the pool
    /// does not manage (variable homes, argument registers) are ignored.
    pub(crate) fn release(&mut self, reg: Reg) {
        for slot in self
            .int_regs
            .iter_mut()
            .chain(&mut self.float_regs)
            .chain(&mut self.callee_temps)
        {
            if slot.0 == reg {
                slot.1 = false;
                return;
            }
        }
    }

    /// Caller-saved scratch contents die at calls: mark those slots free so
    /// later reads regenerate their values. Callee temps survive untouched.
    pub(crate) fn invalidate_caller_saved(&mut self) {
        for slot in self.int_regs.iter_mut().chain(&mut self.float_regs) {
            if !is_callee_saved(slot.0) {
                slot.1 = false;
            }
        }
    }
}
