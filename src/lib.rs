//! BCPL code generation library.
//!
//! This crate is the middle- and back-end of a compiler for a BCPL dialect
//! with object-oriented extensions, targeting AArch64. Given an
//! already-parsed AST it runs class layout, semantic analysis, CFG
//! construction, liveness and linear-scan register allocation, and emits a
//! relocatable instruction stream plus read-only and writable data sections.
//! The lexer/parser in front and the object writer / JIT loader behind are
//! external collaborators; the runtime library is invoked by name only.
//!
//! The pipeline is fully synchronous and driven by [`compile`]:
//!
//! ```text
//! AST -> class pass -> analyzer -> CFG builder -> simplify
//!     -> liveness -> intervals -> linear scan
//!     -> code generator -> { .text, .rodata, .data }
//! ```

#![allow(clippy::new_without_default)]

pub mod analysis;
pub mod ast;
pub mod cfg;
pub mod class_pass;
pub mod classes;
pub mod codegen;
pub mod data;
pub mod frame;
mod fx;
pub mod isa;
pub mod regalloc;
pub mod result;
pub mod settings;
pub mod stream;
pub mod symbols;
pub mod types;
pub mod veneer;

use analysis::{intervals, liveness, AnalyzerState};
use ast::Program;
use cfg::builder::build_cfgs;
use cfg::simplify::simplify_all;
use class_pass::ClassPass;
use classes::ClassTable;
use codegen::CodeGenerator;
use data::DataGenerator;
use fx::FxHashMap;
use isa::aarch64::regs::{allocatable_float_regs, allocatable_int_regs, data_base_reg};
use regalloc::AllocationMap;
use result::{CompileError, CompileResult};
use settings::Flags;
use stream::InstructionStream;
use symbols::SymbolTable;
use veneer::VeneerManager;

pub use result::SemanticError;
pub use settings::Flags as CompileFlags;

/// The output of a successful compilation: the instruction stream with its
/// `.text`, `.rodata` and `.data` entries, ready for the external object
/// writer or JIT loader.
#[derive(Debug)]
pub struct CompiledProgram {
    pub stream: InstructionStream,
}

impl CompiledProgram {
    /// Assembly listing of the text segment, labels included.
    pub fn text_listing(&self) -> Vec<String> {
        self.stream.listing(stream::Segment::Text)
    }
}

/// Compile one program end to end.
///
/// The AST is taken by mutable reference because the class pass injects
/// synthesized constructors, destructor chaining and member initializers
/// into it before analysis. On failure no partial output is produced.
pub fn compile(program: &mut Program, flags: &Flags) -> CompileResult<CompiledProgram> {
    if flags.jit_mode && flags.data_segment_base_addr == 0 {
        return Err(CompileError::Structural(
            "JIT mode requires a non-zero data segment base address".to_string(),
        ));
    }

    let mut symbols = SymbolTable::new();
    let mut classes = ClassTable::new();
    ClassPass::new(&mut classes, &mut symbols, flags).run(program)?;

    let mut analyzer = AnalyzerState::new();
    analyzer.reset();
    analyzer.run(program, &mut symbols, &classes)?;

    let mut cfgs = build_cfgs(program, &mut analyzer, &mut symbols, flags)?;
    simplify_all(&mut cfgs);

    // Liveness, intervals and register allocation, one function at a time,
    // in deterministic name order. Results are cached for the code
    // generator.
    let mut allocations: FxHashMap<String, AllocationMap> = FxHashMap::default();
    let mut names: Vec<String> = cfgs.keys().cloned().collect();
    names.sort();
    for name in &names {
        let cfg = &cfgs[name];
        let live = liveness::analyze(cfg, &symbols);
        let function_intervals = intervals::build_intervals(cfg, &live, &symbols, &mut analyzer);

        let mut int_regs = allocatable_int_regs();
        let accesses_globals = analyzer
            .metrics_for(name)
            .map(|m| m.accesses_globals)
            .unwrap_or(false);
        if accesses_globals {
            // x28 doubles as the data-segment base in this function.
            int_regs.retain(|r| *r != data_base_reg());
        }
        let allocation = regalloc::allocate(
            &function_intervals,
            &int_regs,
            &allocatable_float_regs(),
            analyzer.get_call_sites_for(name),
            name,
            flags.trace_enabled,
        )?;
        if let Some(metrics) = analyzer.metrics_mut(name) {
            metrics.required_callee_saved_regs = allocation
                .values()
                .filter_map(|i| i.assigned_register)
                .filter(|r| isa::aarch64::regs::is_callee_saved(*r))
                .count();
        }
        allocations.insert(name.clone(), allocation);
    }

    let veneers = VeneerManager::scan(program, flags);
    let mut stream = InstructionStream::new();
    let mut data = DataGenerator::new();
    let mut generator = CodeGenerator::new(
        flags,
        &analyzer,
        &mut symbols,
        &classes,
        &mut data,
        &mut stream,
        &veneers,
        &allocations,
    );
    generator.generate_program(program, &cfgs)?;

    Ok(CompiledProgram { stream })
}
