//! Expression type inference.
//!
//! `infer_expr` answers a `VarType` for any expression, dispatching on the
//! node kind. It also performs the bookkeeping that rides along with seeing
//! an expression: marking the enclosing function non-leaf at calls, marking
//! heap allocation at allocation primitives, recording used names, and
//! collecting semantic errors for packed-type misuse and visibility
//! violations.

use crate::ast::{AllocKind, BinOp, Expr, UnOp};
use crate::classes::ClassTable;
use crate::symbols::SymbolTable;
use crate::types::VarType;

use super::analyzer::AnalyzerState;

/// The packed-lane kinds NEON arithmetic applies to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PackedKind {
    Pair,
    FPair,
    Quad,
    FQuad,
}

impl PackedKind {
    pub(crate) fn of(ty: VarType) -> Option<Self> {
        if ty.contains(VarType::PAIR) {
            Some(Self::Pair)
        } else if ty.contains(VarType::FPAIR) {
            Some(Self::FPair)
        } else if ty.contains(VarType::QUAD) {
            Some(Self::Quad)
        } else if ty.contains(VarType::FQUAD) {
            Some(Self::FQuad)
        } else {
            None
        }
    }

    pub(crate) fn ty(self) -> VarType {
        match self {
            Self::Pair => VarType::INTEGER.with(VarType::PAIR),
            Self::FPair => VarType::FLOAT.with(VarType::FPAIR),
            Self::Quad => VarType::INTEGER.with(VarType::QUAD),
            Self::FQuad => VarType::FLOAT.with(VarType::FQUAD),
        }
    }

    /// The kind produced when a scalar operand is broadcast against `self`.
    fn with_scalar(self, scalar: VarType) -> Self {
        let is_float = scalar == VarType::FLOAT;
        match (self, is_float) {
            (Self::Pair, true) => Self::FPair,
            (Self::Quad, true) => Self::FQuad,
            (kind, _) => kind,
        }
    }
}

/// Runtime entry points that allocate; a direct call to one makes the caller
/// an allocating function just like the language-level primitives do.
const ALLOCATING_RUNTIME: &[&str] = &[
    "GETVEC",
    "FGETVEC",
    "OBJECT_HEAP_ALLOC",
    "BCPL_LIST_CREATE_EMPTY",
    "BCPL_CONCAT_LISTS",
];

impl AnalyzerState {
    /// Infer the type of `expr`, recording metrics and semantic errors as a
    /// side effect.
    pub fn infer_expr(
        &mut self,
        expr: &Expr,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) -> VarType {
        match expr {
            Expr::Number(_) | Expr::CharLit(_) | Expr::Boolean(_) => VarType::INTEGER,
            Expr::Float(_) => VarType::FLOAT,
            Expr::StringLit(_) => VarType::STRING.pointer_to(),

            Expr::Variable(name) => self.infer_variable(name, symbols),

            Expr::Binary { op, lhs, rhs } => {
                let lt = self.infer_expr(lhs, symbols, classes);
                let rt = self.infer_expr(rhs, symbols, classes);
                self.note_call_preserving(rhs);
                self.infer_binary(*op, lt, rt)
            }

            Expr::Unary { op, operand } => {
                let ot = self.infer_expr(operand, symbols, classes);
                self.infer_unary(*op, ot)
            }

            Expr::Call { func, args } => {
                for arg in args {
                    self.infer_expr(arg, symbols, classes);
                }
                self.note_call_bearing_args(args);
                self.infer_call(func, symbols, classes)
            }

            Expr::MemberAccess { object, member } => {
                self.infer_member_access(object, member, symbols, classes)
            }

            Expr::SuperMethodCall { member, args } => {
                for arg in args {
                    self.infer_expr(arg, symbols, classes);
                }
                self.infer_super_call(member, classes)
            }

            Expr::VectorAccess { vector, index } => {
                let vt = self.infer_expr(vector, symbols, classes);
                self.infer_expr(index, symbols, classes);
                if vt.contains(VarType::PAIRS) {
                    VarType::INTEGER.with(VarType::PAIR)
                } else if vt.contains(VarType::FPAIRS) {
                    VarType::FLOAT.with(VarType::FPAIR)
                } else if vt.contains(VarType::FLOAT) {
                    VarType::FLOAT
                } else if vt.base() == VarType::ANY {
                    VarType::ANY
                } else {
                    VarType::INTEGER
                }
            }

            Expr::CharIndirection { string, index } => {
                self.infer_expr(string, symbols, classes);
                self.infer_expr(index, symbols, classes);
                VarType::INTEGER
            }

            Expr::FloatVectorIndirection { vector, index } => {
                self.infer_expr(vector, symbols, classes);
                self.infer_expr(index, symbols, classes);
                VarType::FLOAT
            }

            Expr::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                self.infer_expr(condition, symbols, classes);
                let tt = self.infer_expr(then_expr, symbols, classes);
                let et = self.infer_expr(else_expr, symbols, classes);
                if tt == et {
                    tt
                } else if (tt == VarType::FLOAT && et == VarType::INTEGER)
                    || (tt == VarType::INTEGER && et == VarType::FLOAT)
                {
                    VarType::FLOAT
                } else {
                    tt
                }
            }

            Expr::Valof(body) => {
                self.last_resultis_type = None;
                self.analyze_stmt(body, symbols, classes);
                self.last_resultis_type.unwrap_or(VarType::INTEGER)
            }
            Expr::FloatValof(body) => {
                self.last_resultis_type = None;
                self.analyze_stmt(body, symbols, classes);
                VarType::FLOAT
            }

            Expr::Alloc { kind, size } => {
                self.infer_expr(size, symbols, classes);
                self.mark_allocates();
                match kind {
                    AllocKind::Vec => VarType::INTEGER.with(VarType::VEC).pointer_to(),
                    AllocKind::FVec => VarType::FLOAT.with(VarType::VEC).pointer_to(),
                    AllocKind::Pairs => VarType::INTEGER.with(VarType::PAIRS).pointer_to(),
                    AllocKind::FPairs => VarType::FLOAT.with(VarType::FPAIRS).pointer_to(),
                    AllocKind::Str => VarType::STRING.pointer_to(),
                }
            }

            Expr::Table { entries, is_float } => {
                for e in entries {
                    self.infer_expr(e, symbols, classes);
                }
                self.mark_allocates();
                let base = if *is_float {
                    VarType::FLOAT
                } else {
                    VarType::INTEGER
                };
                base.with(VarType::TABLE).pointer_to().with(VarType::CONST)
            }

            Expr::List { items, is_const } => {
                let mut any_float = false;
                let mut any_other = false;
                for item in items {
                    let it = self.infer_expr(item, symbols, classes);
                    match it.base() {
                        VarType::FLOAT => any_float = true,
                        VarType::INTEGER => {}
                        _ => any_other = true,
                    }
                }
                self.mark_allocates();
                let base = if any_other {
                    VarType::ANY
                } else if any_float {
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

            Expr::Pair { first, second } => {
                self.infer_expr(first, symbols, classes);
                self.infer_expr(second, symbols, classes);
                VarType::INTEGER.with(VarType::PAIR)
            }
            Expr::FPair { first, second } => {
                self.infer_expr(first, symbols, classes);
                self.infer_expr(second, symbols, classes);
                VarType::FLOAT.with(VarType::FPAIR)
            }
            Expr::Quad { elements } => {
                for e in elements {
                    self.infer_expr(e, symbols, classes);
                }
                VarType::INTEGER.with(VarType::QUAD)
            }
            Expr::FQuad { elements } => {
                for e in elements {
                    self.infer_expr(e, symbols, classes);
                }
                VarType::FLOAT.with(VarType::FQUAD)
            }

            Expr::New { class_name, args } => {
                for arg in args {
                    self.infer_expr(arg, symbols, classes);
                }
                self.note_call_bearing_args(args);
                self.mark_not_leaf();
                self.mark_allocates();
                if !classes.class_exists(class_name) {
                    self.error(format!("unknown class {class_name} in NEW"));
                }
                // The CREATE chain runs through the constructed class.
                self.record_callee(&crate::classes::mangle_method(class_name, "CREATE"));
                VarType::OBJECT.pointer_to()
            }
        }
    }

    fn infer_variable(&mut self, name: &str, symbols: &SymbolTable) -> VarType {
        self.used_names.insert(name.to_string());
        if name == "_this" || name == "SELF" {
            return VarType::OBJECT.pointer_to();
        }
        if symbols.is_global(name) {
            let current = self.current_function.clone();
            if let Some(m) = self.function_metrics.get_mut(&current) {
                m.accesses_globals = true;
            }
        }
        if let Some(sym) = symbols.lookup(name) {
            if sym.ty != VarType::UNKNOWN {
                return sym.ty;
            }
        }
        let current = self.current_function.clone();
        if let Some(sym) = symbols.lookup_in_function(&current, name) {
            if sym.ty != VarType::UNKNOWN {
                return sym.ty;
            }
        }
        if self.manifests.contains_key(name) {
            return VarType::INTEGER;
        }
        self.get_variable_type(&current, name)
    }

    pub(crate) fn infer_binary(&mut self, op: BinOp, lt: VarType, rt: VarType) -> VarType {
        let lp = PackedKind::of(lt);
        let rp = PackedKind::of(rt);

        if op.is_comparison() {
            if op.is_ordering() && (lp.is_some() || rp.is_some()) {
                self.error("ordering comparison is not defined on PAIR/QUAD values");
            } else if matches!(op, BinOp::Eq | BinOp::Ne) && (lp.is_some() || rp.is_some()) && lp != rp {
                self.error("type mismatch in equality comparison of packed values");
            }
            return VarType::INTEGER;
        }

        if matches!(op, BinOp::LogAnd | BinOp::LogOr) {
            return VarType::INTEGER;
        }

        match (lp, rp) {
            (Some(a), Some(b)) if a == b => a.ty(),
            (Some(a), Some(_)) => {
                self.error("mixed packed types in arithmetic");
                a.ty()
            }
            (Some(a), None) => a.with_scalar(rt).ty(),
            (None, Some(b)) => b.with_scalar(lt).ty(),
            (None, None) => {
                if lt == VarType::FLOAT || rt == VarType::FLOAT {
                    VarType::FLOAT
                } else {
                    VarType::INTEGER
                }
            }
        }
    }

    fn infer_unary(&mut self, op: UnOp, ot: VarType) -> VarType {
        match op {
            UnOp::AddrOf => ot.pointer_to(),
            UnOp::Deref => {
                if ot.contains(VarType::POINTER_TO) {
                    let base = ot.base();
                    if base == VarType::UNKNOWN {
                        VarType::INTEGER
                    } else {
                        base
                    }
                } else {
                    VarType::INTEGER
                }
            }
            UnOp::Head => ot.list_element_type(),
            UnOp::Tail | UnOp::Rest => ot,
            UnOp::Length => VarType::INTEGER,
            UnOp::IntToFloat => VarType::FLOAT,
            UnOp::FloatToInt => VarType::INTEGER,
            // TYPE(e) is folded to a string literal naming the inferred type.
            UnOp::TypeOf => VarType::STRING.pointer_to(),
            UnOp::Neg => {
                if ot == VarType::FLOAT || ot.is_packed() {
                    ot
                } else {
                    VarType::INTEGER
                }
            }
            UnOp::LogNot | UnOp::BitNot => VarType::INTEGER,
        }
    }

    fn infer_call(
        &mut self,
        func: &Expr,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) -> VarType {
        match func {
            Expr::Variable(name) => {
                self.mark_not_leaf();
                self.record_callee(name);
                if ALLOCATING_RUNTIME.contains(&name.as_str()) {
                    self.mark_allocates();
                }
                if let Some(metrics) = self.function_metrics.get(name) {
                    return metrics.return_type;
                }
                match name.as_str() {
                    "BCPL_LIST_GET_HEAD_AS_FLOAT" => VarType::FLOAT,
                    _ => VarType::INTEGER,
                }
            }
            Expr::MemberAccess { object, member } => {
                self.mark_not_leaf();
                let class = self.expr_class_name(object, symbols);
                self.infer_expr(object, symbols, classes);
                if let Some(class_name) = class {
                    if let Some(method) = classes.find_method(&class_name, member) {
                        self.check_visibility(&class_name, method.visibility, classes);
                        self.record_callee(&method.qualified_name.clone());
                        return method.return_type;
                    }
                }
                VarType::INTEGER
            }
            Expr::SuperMethodCall { member, args } => {
                let args = args.clone();
                for arg in &args {
                    self.infer_expr(arg, symbols, classes);
                }
                self.infer_super_call(member, classes)
            }
            other => {
                // Indirect call through a computed address.
                self.infer_expr(other, symbols, classes);
                self.mark_not_leaf();
                VarType::INTEGER
            }
        }
    }

    fn infer_super_call(&mut self, member: &str, classes: &ClassTable) -> VarType {
        self.mark_not_leaf();
        let Some(current_class) = self.current_class.clone() else {
            self.error("SUPER used outside a method");
            return VarType::INTEGER;
        };
        let parent = classes
            .get_class(&current_class)
            .map(|e| e.parent_name.clone())
            .unwrap_or_default();
        if parent.is_empty() {
            self.error(format!("SUPER used in class {current_class} which has no parent"));
            return VarType::INTEGER;
        }
        match classes.find_method(&parent, member) {
            Some(method) => {
                self.record_callee(&method.qualified_name.clone());
                method.return_type
            }
            None => {
                self.error(format!("parent class {parent} has no method {member}"));
                VarType::INTEGER
            }
        }
    }

    fn infer_member_access(
        &mut self,
        object: &Expr,
        member: &str,
        symbols: &mut SymbolTable,
        classes: &ClassTable,
    ) -> VarType {
        self.infer_expr(object, symbols, classes);
        let Some(class_name) = self.expr_class_name(object, symbols) else {
            return VarType::ANY;
        };
        let Some(entry) = classes.get_class(&class_name) else {
            self.error(format!("unknown class {class_name} in member access"));
            return VarType::ANY;
        };
        if let Some(info) = entry.member_variables.get(member) {
            self.check_visibility(&class_name, info.visibility, classes);
            return if info.ty == VarType::UNKNOWN {
                VarType::INTEGER
            } else {
                info.ty
            };
        }
        if let Some(method) = classes.find_method(&class_name, member) {
            self.check_visibility(&class_name, method.visibility, classes);
            return method.return_type;
        }
        self.error(format!("class {class_name} has no member {member}"));
        VarType::ANY
    }

    fn check_visibility(
        &mut self,
        class_name: &str,
        visibility: crate::ast::Visibility,
        classes: &ClassTable,
    ) {
        let from = self.current_class.clone();
        if !classes.member_accessible(class_name, visibility, from.as_deref()) {
            self.error(format!(
                "member of class {class_name} is not accessible from {}",
                from.as_deref().unwrap_or("a free function")
            ));
        }
    }

    /// The class of objects an expression denotes, when statically known.
    pub(crate) fn expr_class_name(&self, expr: &Expr, symbols: &SymbolTable) -> Option<String> {
        match expr {
            Expr::Variable(name) if name == "_this" || name == "SELF" => {
                self.current_class.clone()
            }
            Expr::Variable(name) => {
                if let Some(sym) = symbols.lookup(name) {
                    if sym.class_name.is_some() {
                        return sym.class_name.clone();
                    }
                }
                symbols
                    .lookup_in_function(&self.current_function, name)
                    .and_then(|s| s.class_name.clone())
            }
            Expr::New { class_name, .. } => Some(class_name.clone()),
            Expr::Call { .. } => expr
                .direct_callee()
                .and_then(|callee| self.function_metrics.get(callee))
                .and_then(|m| m.return_class.clone()),
            _ => None,
        }
    }

    /// Arguments that themselves call must be parked in a callee-saved
    /// temporary before the argument registers are written; method calls and
    /// NEW additionally park the receiver.
    fn note_call_bearing_args(&mut self, args: &[Expr]) {
        if args.iter().any(expr_contains_call) {
            let current = self.current_function.clone();
            if let Some(m) = self.function_metrics.get_mut(&current) {
                m.has_call_preserving_expressions = true;
                m.required_callee_saved_temps = m.required_callee_saved_temps.max(1);
            }
        }
    }

    /// Track expressions whose right operand performs a call while the left
    /// result is live; those need a callee-saved temporary at codegen time.
    fn note_call_preserving(&mut self, rhs: &Expr) {
        if expr_contains_call(rhs) {
            let depth = 1 + usize::from(nested_call_preserving(rhs));
            let current = self.current_function.clone();
            if let Some(m) = self.function_metrics.get_mut(&current) {
                m.has_call_preserving_expressions = true;
                m.required_callee_saved_temps = m.required_callee_saved_temps.max(depth.min(2));
            }
        }
    }
}

pub(crate) fn expr_contains_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } | Expr::SuperMethodCall { .. } | Expr::New { .. } => true,
        Expr::Binary { lhs, rhs, .. } => expr_contains_call(lhs) || expr_contains_call(rhs),
        Expr::Unary { operand, .. } => expr_contains_call(operand),
        Expr::MemberAccess { object, .. } => expr_contains_call(object),
        Expr::VectorAccess { vector, index }
        | Expr::CharIndirection {
            string: vector,
            index,
        }
        | Expr::FloatVectorIndirection { vector, index } => {
            expr_contains_call(vector) || expr_contains_call(index)
        }
        Expr::Conditional {
            condition,
            then_expr,
            else_expr,
        } => {
            expr_contains_call(condition)
                || expr_contains_call(then_expr)
                || expr_contains_call(else_expr)
        }
        Expr::Pair { first, second } | Expr::FPair { first, second } => {
            expr_contains_call(first) || expr_contains_call(second)
        }
        Expr::Quad { elements } | Expr::FQuad { elements } => {
            elements.iter().any(expr_contains_call)
        }
        _ => false,
    }
}

fn nested_call_preserving(expr: &Expr) -> bool {
    match expr {
        Expr::Binary { rhs, .. } => expr_contains_call(rhs),
        _ => false,
    }
}
