//! Veneer layout for externally-resolved callees.
//!
//! Before any function body is emitted, the external scanner walks the
//! program and collects every callee name that is not defined locally. One
//! 16-byte trampoline per name is laid out at the front of the code buffer:
//! an absolute address materialization (`adrp`+`add` statically, `movz`/
//! `movk` under the JIT) followed by `br x16` and a `nop` pad. Local `bl`s
//! target the stable `veneer_<name>` label, so every call site encodes a
//! short PC-relative offset regardless of how large the emitted program
//! grows; relocations against the real external address live only in the
//! veneer body.

use crate::ast::{Decl, Expr, Program, Stmt, UnOp};
use crate::fx::FxHashSet;
use crate::isa::aarch64::inst::Inst;
use crate::isa::aarch64::regs::veneer_scratch_reg;
use crate::settings::Flags;
use crate::stream::{InstructionStream, Segment};

use std::collections::BTreeSet;

use log::debug;

/// The label a call to external `name` branches to.
pub fn veneer_label(name: &str) -> String {
    format!("veneer_{name}")
}

#[derive(Debug, Default)]
pub struct VeneerManager {
    /// Externally-resolved names, in stable (sorted) order.
    externals: BTreeSet<String>,
}

impl VeneerManager {
    /// Scan `program` for external callees, including the runtime entry
    /// points that later passes inject (SAMM scope calls, reduction
    /// allocation, list primitives, bounds stubs).
    pub fn scan(program: &Program, flags: &Flags) -> Self {
        let mut locals = FxHashSet::default();
        for decl in &program.declarations {
            match decl {
                Decl::Function(f) => {
                    locals.insert(f.name.clone());
                }
                Decl::Routine(r) => {
                    locals.insert(r.name.clone());
                }
                Decl::Class(class) => {
                    for member in &class.members {
                        match &member.declaration {
                            Decl::Function(f) => {
                                locals.insert(crate::classes::mangle_method(&class.name, &f.name));
                            }
                            Decl::Routine(r) => {
                                locals.insert(crate::classes::mangle_method(&class.name, &r.name));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        let mut scanner = Scanner {
            locals: &locals,
            externals: BTreeSet::new(),
            flags,
        };
        for decl in &program.declarations {
            scanner.scan_decl(decl);
        }
        if flags.samm_enabled {
            scanner.externals.insert("HeapManager_enter_scope".into());
            scanner.externals.insert("HeapManager_exit_scope".into());
        }
        if flags.bounds_checking_enabled {
            scanner.externals.insert("BCPL_BOUNDS_ERROR".into());
        }
        debug!("{} external callees need veneers", scanner.externals.len());
        Self {
            externals: scanner.externals,
        }
    }

    pub fn externals(&self) -> impl Iterator<Item = &String> {
        self.externals.iter()
    }

    pub fn is_external(&self, name: &str) -> bool {
        self.externals.contains(name)
    }

    /// Lay out one trampoline per external name. Must run before any
    /// function body so the veneers sit at a known offset from the buffer
    /// base.
    pub fn emit(&self, stream: &mut InstructionStream, flags: &Flags) {
        let scratch = veneer_scratch_reg();
        for name in &self.externals {
            stream.define_label(&veneer_label(name), Segment::Text);
            if flags.jit_mode {
                stream.push_inst(
                    &Inst::MovZLabel {
                        rd: scratch,
                        label: name.clone(),
                    },
                    Segment::Text,
                );
                stream.push_inst(
                    &Inst::MovKLabel {
                        rd: scratch,
                        label: name.clone(),
                    },
                    Segment::Text,
                );
            } else {
                stream.push_inst(
                    &Inst::Adrp {
                        rd: scratch,
                        label: name.clone(),
                    },
                    Segment::Text,
                );
                stream.push_inst(
                    &Inst::AddLo12 {
                        rd: scratch,
                        rn: scratch,
                        label: name.clone(),
                    },
                    Segment::Text,
                );
            }
            stream.push_inst(&Inst::BrReg { rn: scratch }, Segment::Text);
            // Pad each trampoline to 16 bytes.
            stream.push_inst(&Inst::Nop, Segment::Text);
        }
    }
}

struct Scanner<'a> {
    locals: &'a FxHashSet<String>,
    externals: BTreeSet<String>,
    flags: &'a Flags,
}

impl Scanner<'_> {
    fn note_callee(&mut self, name: &str) {
        if !self.locals.contains(name) {
            self.externals.insert(name.to_string());
        }
    }

    fn scan_decl(&mut self, decl: &Decl) {
        match decl {
            Decl::Function(f) => self.scan_expr(&f.body),
            Decl::Routine(r) => self.scan_stmt(&r.body),
            Decl::Class(class) => {
                for member in &class.members {
                    self.scan_decl(&member.declaration);
                }
            }
            Decl::Let(let_decl) => {
                for init in let_decl.initializers.iter().flatten() {
                    self.scan_expr(init);
                }
            }
            Decl::Global { initializer, .. } | Decl::Static { initializer, .. } => {
                if let Some(init) = initializer {
                    self.scan_expr(init);
                }
            }
            Decl::Manifest { .. } => {}
        }
    }

    fn scan_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::RoutineCall { routine, args } => {
                if let Expr::Variable(name) = routine {
                    self.note_callee(name);
                } else {
                    self.scan_expr(routine);
                }
                for arg in args {
                    self.scan_expr(arg);
                }
            }
            Stmt::Assignment { lhs, rhs } => {
                for e in lhs.iter().chain(rhs) {
                    self.scan_expr(e);
                }
            }
            Stmt::If { condition, then_branch } => {
                self.scan_expr(condition);
                self.scan_stmt(then_branch);
            }
            Stmt::Unless { condition, body } => {
                self.scan_expr(condition);
                self.scan_stmt(body);
            }
            Stmt::Test {
                condition,
                then_branch,
                else_branch,
            } => {
                self.scan_expr(condition);
                self.scan_stmt(then_branch);
                self.scan_stmt(else_branch);
            }
            Stmt::While { condition, body } | Stmt::Until { condition, body } => {
                self.scan_expr(condition);
                self.scan_stmt(body);
            }
            Stmt::Repeat { body, condition, .. } => {
                self.scan_stmt(body);
                if let Some(c) = condition {
                    self.scan_expr(c);
                }
            }
            Stmt::For(f) => {
                self.scan_expr(&f.start);
                self.scan_expr(&f.end);
                if let Some(step) = &f.step {
                    self.scan_expr(step);
                }
                self.scan_stmt(&f.body);
            }
            Stmt::ForEach(f) => {
                self.scan_expr(&f.collection);
                self.scan_stmt(&f.body);
                // List traversal resolves through the runtime.
                self.note_callee("BCPL_LIST_GET_HEAD_AS_INT");
                self.note_callee("BCPL_LIST_GET_HEAD_AS_FLOAT");
                self.note_callee("BCPL_LIST_GET_REST");
            }
            Stmt::Switchon {
                expr,
                cases,
                default_body,
            } => {
                self.scan_expr(expr);
                for case in cases {
                    for s in &case.body {
                        self.scan_stmt(s);
                    }
                }
                if let Some(default) = default_body {
                    for s in default {
                        self.scan_stmt(s);
                    }
                }
            }
            Stmt::Resultis(e) => self.scan_expr(e),
            Stmt::Free(e) => {
                self.note_callee("FREEVEC");
                self.scan_expr(e);
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.scan_stmt(s);
                }
            }
            Stmt::Block {
                declarations,
                statements,
            } => {
                for d in declarations {
                    self.scan_decl(d);
                }
                for s in statements {
                    self.scan_stmt(s);
                }
                if !self.flags.samm_enabled {
                    // Legacy scope cleanup may free lists and vectors.
                    self.note_callee("FREEVEC");
                    self.note_callee("BCPL_FREE_LIST");
                }
            }
            Stmt::Defer(inner) => self.scan_stmt(inner),
            Stmt::Goto { target } => self.scan_expr(target),
            Stmt::Reduction(red) => {
                self.note_callee("GETVEC");
                self.scan_expr(&red.left);
                self.scan_expr(&red.right);
            }
            Stmt::PairwiseReduction(red) => {
                self.note_callee("GETVEC");
                self.scan_expr(&red.input);
            }
            _ => {}
        }
    }

    fn scan_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Call { func, args } => {
                if let Expr::Variable(name) = func.as_ref() {
                    self.note_callee(name);
                } else {
                    self.scan_expr(func);
                }
                for arg in args {
                    self.scan_expr(arg);
                }
            }
            Expr::New { args, .. } => {
                self.note_callee("OBJECT_HEAP_ALLOC");
                for arg in args {
                    self.scan_expr(arg);
                }
            }
            Expr::Alloc { kind, size } => {
                let callee = match kind {
                    crate::ast::AllocKind::FVec => "FGETVEC",
                    _ => "GETVEC",
                };
                self.note_callee(callee);
                self.scan_expr(size);
            }
            Expr::List { items, .. } => {
                for item in items {
                    self.scan_expr(item);
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.scan_expr(lhs);
                self.scan_expr(rhs);
            }
            Expr::Unary { op, operand } => {
                match op {
                    UnOp::Head => {
                        self.note_callee("BCPL_LIST_GET_HEAD_AS_INT");
                        self.note_callee("BCPL_LIST_GET_HEAD_AS_FLOAT");
                    }
                    UnOp::Tail => self.note_callee("BCPL_LIST_GET_TAIL"),
                    UnOp::Rest => self.note_callee("BCPL_LIST_GET_REST"),
                    _ => {}
                }
                self.scan_expr(operand);
            }
            Expr::MemberAccess { object, .. } => self.scan_expr(object),
            Expr::SuperMethodCall { args, .. } => {
                for arg in args {
                    self.scan_expr(arg);
                }
            }
            Expr::VectorAccess { vector, index }
            | Expr::CharIndirection {
                string: vector,
                index,
            }
            | Expr::FloatVectorIndirection { vector, index } => {
                self.scan_expr(vector);
                self.scan_expr(index);
            }
            Expr::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                self.scan_expr(condition);
                self.scan_expr(then_expr);
                self.scan_expr(else_expr);
            }
            Expr::Valof(body) | Expr::FloatValof(body) => self.scan_stmt(body),
            Expr::Table { entries, .. } => {
                for e in entries {
                    self.scan_expr(e);
                }
            }
            Expr::Pair { first, second } | Expr::FPair { first, second } => {
                self.scan_expr(first);
                self.scan_expr(second);
            }
            Expr::Quad { elements } | Expr::FQuad { elements } => {
                for e in elements {
                    self.scan_expr(e);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::RoutineDecl;

    fn program_calling(name: &str) -> Program {
        Program::new(vec![Decl::Routine(RoutineDecl {
            name: "start".into(),
            parameters: vec![],
            body: Stmt::call(name, vec![Expr::number(1)]),
            is_virtual: false,
            is_final: false,
        })])
    }

    #[test]
    fn local_callees_get_no_veneer() {
        let mut program = program_calling("helper");
        program.declarations.push(Decl::Routine(RoutineDecl {
            name: "helper".into(),
            parameters: vec![],
            body: Stmt::Compound(vec![]),
            is_virtual: false,
            is_final: false,
        }));
        let flags = Flags {
            samm_enabled: false,
            ..Flags::default()
        };
        let veneers = VeneerManager::scan(&program, &flags);
        assert!(!veneers.is_external("helper"));
        assert!(!veneers.is_external("start"));
    }

    #[test]
    fn external_callees_get_stable_trampolines() {
        let flags = Flags {
            samm_enabled: false,
            ..Flags::default()
        };
        let program = program_calling("WRITEN");
        let veneers = VeneerManager::scan(&program, &flags);
        assert!(veneers.is_external("WRITEN"));
        let mut stream = InstructionStream::new();
        veneers.emit(&mut stream, &flags);
        let body = stream.listing_after_label("veneer_WRITEN");
        assert_eq!(body.len(), 4);
        assert!(body[0].starts_with("adrp x16"));
        assert!(body[1].starts_with("add x16"));
        assert_eq!(body[2], "br x16");
        assert_eq!(body[3], "nop");
    }

    #[test]
    fn jit_mode_uses_absolute_materialization() {
        let flags = Flags {
            jit_mode: true,
            data_segment_base_addr: 0x10000,
            samm_enabled: false,
            ..Flags::default()
        };
        let program = program_calling("WRITES");
        let veneers = VeneerManager::scan(&program, &flags);
        let mut stream = InstructionStream::new();
        veneers.emit(&mut stream, &flags);
        let body = stream.listing_after_label("veneer_WRITES");
        assert!(body[0].starts_with("movz x16"));
        assert!(body[1].starts_with("movk x16"));
        assert_eq!(body[2], "br x16");
    }

    #[test]
    fn samm_scope_calls_are_always_external() {
        let program = program_calling("WRITES");
        let veneers = VeneerManager::scan(&program, &Flags::default());
        assert!(veneers.is_external("HeapManager_enter_scope"));
        assert!(veneers.is_external("HeapManager_exit_scope"));
    }
}
