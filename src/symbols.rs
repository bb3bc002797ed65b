//! Scoped symbol table.
//!
//! Two views share one store: a scope *stack* used while a pass walks nested
//! blocks (inner scopes shadow outer ones), and a persistent per-function map
//! that survives scope exit so later passes (intervals, register allocation,
//! code generation) can ask for a variable's type or location by
//! `(function, name)` long after the declaring block closed.

use crate::fx::FxHashMap;
use crate::types::VarType;

/// What kind of thing a name is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    GlobalVar,
    LocalVar,
    Parameter,
    Manifest,
    Function,
    Routine,
    Label,
}

/// Where a symbol's value lives once layout decisions are made. Starts as
/// `None` and is bound late: stack offsets once the frame is built, data-word
/// indices once the data generator lays out globals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    None,
    /// Frame-pointer-relative byte offset.
    StackOffset(i32),
    /// Compile-time constant value (manifests).
    Absolute(i64),
    /// Word index into the data segment, relative to `L__data_segment_base`.
    DataWord(usize),
}

/// A named entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub ty: VarType,
    pub scope_level: u32,
    /// The enclosing function or mangled method name; empty for globals.
    pub function_context: String,
    /// For methods and `_this`: the class the symbol belongs to.
    pub class_name: Option<String>,
    pub location: Location,
    /// Whether automatic cleanup is responsible for this variable's heap
    /// allocation. Defaults on for `LET`s initialized from allocation
    /// expressions; flipped by `RETAIN`/`REMANAGE`.
    pub owns_heap_memory: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, ty: VarType) -> Self {
        Self {
            name: name.into(),
            kind,
            ty,
            scope_level: 0,
            function_context: String::new(),
            class_name: None,
            location: Location::None,
            owns_heap_memory: false,
        }
    }

    pub fn in_function(mut self, function: impl Into<String>) -> Self {
        self.function_context = function.into();
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class_name = Some(class.into());
        self
    }
}

/// The symbol table. Created once per compilation and appended to by the
/// class pass, the analyzer and the CFG builder; never mutated retroactively
/// except for late location binding.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Active scope stack; index 0 is the global scope.
    scopes: Vec<FxHashMap<String, Symbol>>,
    /// Persistent store: function name -> variable name -> symbol.
    function_symbols: FxHashMap<String, FxHashMap<String, Symbol>>,
    /// Persistent global scope.
    globals: FxHashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![FxHashMap::default()],
            function_symbols: FxHashMap::default(),
            globals: FxHashMap::default(),
        }
    }

    /// Current nesting depth; the global scope is level 0.
    pub fn scope_level(&self) -> u32 {
        (self.scopes.len() - 1) as u32
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn exit_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "unbalanced scope exit");
        self.scopes.pop();
    }

    /// Declare `symbol` in the innermost scope. At most one symbol may exist
    /// per (name, scope) pair; re-declaration in the same scope replaces the
    /// earlier binding, which only happens for compiler-synthesized
    /// temporaries with unique names.
    pub fn declare(&mut self, mut symbol: Symbol) {
        symbol.scope_level = self.scope_level();
        if !symbol.function_context.is_empty() {
            self.function_symbols
                .entry(symbol.function_context.clone())
                .or_default()
                .insert(symbol.name.clone(), symbol.clone());
        } else {
            self.globals.insert(symbol.name.clone(), symbol.clone());
        }
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(symbol.name.clone(), symbol);
    }

    /// Innermost visible binding for `name`.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.get(name) {
                return Some(sym);
            }
        }
        self.globals.get(name)
    }

    /// Persistent lookup by function context, falling back to globals. This
    /// is the view the interval pass and code generator use.
    pub fn lookup_in_function(&self, function: &str, name: &str) -> Option<&Symbol> {
        if let Some(syms) = self.function_symbols.get(function) {
            if let Some(sym) = syms.get(name) {
                return Some(sym);
            }
        }
        self.globals.get(name)
    }

    /// All persistent symbols of one function, in no particular order.
    pub fn function_symbols(&self, function: &str) -> impl Iterator<Item = &Symbol> {
        self.function_symbols
            .get(function)
            .into_iter()
            .flat_map(|m| m.values())
    }

    pub fn is_global(&self, name: &str) -> bool {
        matches!(
            self.globals.get(name),
            Some(Symbol {
                kind: SymbolKind::GlobalVar,
                ..
            })
        )
    }

    pub fn global_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.globals.values()
    }

    /// Late-bind a variable's type once inference resolves it.
    pub fn set_type(&mut self, function: &str, name: &str, ty: VarType) {
        if let Some(sym) = self
            .function_symbols
            .get_mut(function)
            .and_then(|m| m.get_mut(name))
        {
            sym.ty = ty;
        }
        for scope in self.scopes.iter_mut().rev() {
            if let Some(sym) = scope.get_mut(name) {
                sym.ty = ty;
                return;
            }
        }
    }

    /// Late-bind a location (stack offset or data-segment word index).
    pub fn set_location(&mut self, function: &str, name: &str, location: Location) {
        if function.is_empty() {
            if let Some(sym) = self.globals.get_mut(name) {
                sym.location = location;
            }
            return;
        }
        if let Some(sym) = self
            .function_symbols
            .get_mut(function)
            .and_then(|m| m.get_mut(name))
        {
            sym.location = location;
        }
    }

    /// Flip heap ownership for `RETAIN`/`REMANAGE` and allocation-initialized
    /// `LET`s.
    pub fn set_owns_heap_memory(&mut self, function: &str, name: &str, owns: bool) {
        if let Some(sym) = self
            .function_symbols
            .get_mut(function)
            .and_then(|m| m.get_mut(name))
        {
            sym.owns_heap_memory = owns;
        }
        for scope in self.scopes.iter_mut().rev() {
            if let Some(sym) = scope.get_mut(name) {
                sym.owns_heap_memory = owns;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_and_persistence() {
        let mut table = SymbolTable::new();
        table.declare(Symbol::new("x", SymbolKind::GlobalVar, VarType::INTEGER));
        table.enter_scope();
        table.declare(
            Symbol::new("x", SymbolKind::LocalVar, VarType::FLOAT).in_function("f"),
        );
        assert_eq!(table.lookup("x").unwrap().kind, SymbolKind::LocalVar);
        table.exit_scope();
        assert_eq!(table.lookup("x").unwrap().kind, SymbolKind::GlobalVar);
        // The local survives in the persistent per-function view.
        let sym = table.lookup_in_function("f", "x").unwrap();
        assert_eq!(sym.ty, VarType::FLOAT);
    }

    #[test]
    fn late_location_binding() {
        let mut table = SymbolTable::new();
        table.declare(Symbol::new("v", SymbolKind::LocalVar, VarType::INTEGER).in_function("f"));
        table.set_location("f", "v", Location::StackOffset(-16));
        assert_eq!(
            table.lookup_in_function("f", "v").unwrap().location,
            Location::StackOffset(-16)
        );
    }
}
