//! Class discovery and layout finalization.
//!
//! Runs in two phases over the program. *Discovery* registers every class
//! name and parent link. *Finalization* resolves each class recursively:
//! parent layouts first, then own members (variables get the next 8-byte
//! offset, methods get vtable slots), then synthesis of the `CREATE`/`RELEASE`
//! routines the user did not write, and finally injection of member
//! initializers and `SUPER` chaining into the constructor and destructor
//! bodies. The pass mutates the AST: synthesized routines become ordinary
//! class members so every later pass sees one uniform shape.

use crate::ast::{
    ClassDecl, ClassMember, Decl, Expr, Program, RoutineDecl, Stmt, Visibility,
};
use crate::classes::{
    mangle_method, simple_method_name, ClassMemberInfo, ClassMethodInfo, ClassTable,
};
use crate::fx::FxHashSet;
use crate::result::{CompileError, CompileResult};
use crate::settings::Flags;
use crate::symbols::{Symbol, SymbolKind, SymbolTable};
use crate::types::VarType;

use log::{debug, trace};

pub struct ClassPass<'a> {
    classes: &'a mut ClassTable,
    symbols: &'a mut SymbolTable,
    flags: &'a Flags,
}

impl<'a> ClassPass<'a> {
    pub fn new(classes: &'a mut ClassTable, symbols: &'a mut SymbolTable, flags: &'a Flags) -> Self {
        Self {
            classes,
            symbols,
            flags,
        }
    }

    pub fn run(&mut self, program: &mut Program) -> CompileResult<()> {
        self.discover_classes(program);
        self.finalize_layouts(program)?;
        if self.flags.trace_enabled {
            self.validate_all_class_layouts()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Discovery

    fn discover_classes(&mut self, program: &Program) {
        for decl in &program.declarations {
            if let Decl::Class(class) = decl {
                trace!(
                    "discovered class {}{}",
                    class.name,
                    if class.parent_class_name.is_empty() {
                        String::new()
                    } else {
                        format!(" (extends {})", class.parent_class_name)
                    }
                );
                if !self.classes.class_exists(&class.name) {
                    self.classes.add_class(&class.name, &class.parent_class_name);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Finalization

    fn finalize_layouts(&mut self, program: &mut Program) -> CompileResult<()> {
        let class_indices: Vec<(String, usize)> = program
            .declarations
            .iter()
            .enumerate()
            .filter_map(|(i, d)| match d {
                Decl::Class(c) => Some((c.name.clone(), i)),
                _ => None,
            })
            .collect();

        let mut resolution_path = FxHashSet::default();
        for (name, _) in &class_indices {
            let finalized = self
                .classes
                .get_class(name)
                .map(|e| e.is_layout_finalized)
                .unwrap_or(false);
            if !finalized {
                self.finalize_class_layout(program, &class_indices, name, &mut resolution_path)?;
            }
        }
        Ok(())
    }

    fn finalize_class_layout(
        &mut self,
        program: &mut Program,
        class_indices: &[(String, usize)],
        class_name: &str,
        resolution_path: &mut FxHashSet<String>,
    ) -> CompileResult<()> {
        if resolution_path.contains(class_name) {
            return Err(CompileError::ClassLayout(format!(
                "circular inheritance detected involving class {class_name}"
            )));
        }
        resolution_path.insert(class_name.to_string());

        let already_done = match self.classes.get_class(class_name) {
            Some(entry) => entry.is_layout_finalized,
            None => {
                resolution_path.remove(class_name);
                return Ok(());
            }
        };
        if already_done {
            resolution_path.remove(class_name);
            return Ok(());
        }

        // Step 1: resolve the parent first and inherit its finalized layout.
        let parent_name = self
            .classes
            .get_class(class_name)
            .map(|e| e.parent_name.clone())
            .unwrap_or_default();
        let mut current_offset = 8u64;
        if !parent_name.is_empty() {
            if !self.classes.class_exists(&parent_name) {
                return Err(CompileError::ClassLayout(format!(
                    "parent class not found: {parent_name} (extended by {class_name})"
                )));
            }
            let parent_done = self
                .classes
                .get_class(&parent_name)
                .map(|e| e.is_layout_finalized)
                .unwrap_or(false);
            if !parent_done {
                self.finalize_class_layout(program, class_indices, &parent_name, resolution_path)?;
            }
            let (vars, methods, blueprint, simple, size) = {
                let parent = self.classes.get_class(&parent_name).unwrap();
                (
                    parent.member_variables.clone(),
                    parent.member_methods.clone(),
                    parent.vtable_blueprint.clone(),
                    parent.simple_name_to_method.clone(),
                    parent.instance_size,
                )
            };
            let entry = self.classes.get_class_mut(class_name).unwrap();
            entry.member_variables = vars;
            entry.member_methods = methods;
            entry.vtable_blueprint = blueprint;
            entry.simple_name_to_method = simple;
            current_offset = size.max(8);
        }

        // Step 2: reserve vtable slots 0 (CREATE) and 1 (RELEASE).
        {
            let entry = self.classes.get_class_mut(class_name).unwrap();
            if entry.vtable_blueprint.len() < 2 {
                entry.vtable_blueprint.resize(2, String::new());
            }
        }

        // Step 3: this class's own members.
        let decl_index = class_indices
            .iter()
            .find(|(n, _)| n == class_name)
            .map(|(_, i)| *i)
            .ok_or_else(|| {
                CompileError::ClassLayout(format!("class {class_name} has no AST node"))
            })?;
        let mut has_user_defined_release = false;
        let members: Vec<(Decl, Visibility)> = match &program.declarations[decl_index] {
            Decl::Class(c) => c
                .members
                .iter()
                .map(|m| (m.declaration.clone(), m.visibility))
                .collect(),
            _ => Vec::new(),
        };
        for (decl, visibility) in &members {
            match decl {
                Decl::Let(let_decl) => {
                    for name in &let_decl.names {
                        let exists = self
                            .classes
                            .get_class(class_name)
                            .map(|e| e.member_variables.contains_key(name))
                            .unwrap_or(false);
                        if !exists {
                            let ty = if let_decl.is_float {
                                VarType::FLOAT
                            } else {
                                VarType::UNKNOWN
                            };
                            let entry = self.classes.get_class_mut(class_name).unwrap();
                            entry.add_member_variable(ClassMemberInfo {
                                name: name.clone(),
                                ty,
                                offset: current_offset,
                                visibility: *visibility,
                            });
                            trace!(
                                "member variable {class_name}.{name} at offset {current_offset}"
                            );
                            current_offset += 8;
                        }
                    }
                }
                Decl::Function(func) => {
                    let ret = if func.is_float_function {
                        VarType::FLOAT
                    } else {
                        VarType::INTEGER
                    };
                    self.process_method(
                        class_name,
                        &func.name,
                        ret,
                        func.parameters.len(),
                        func.is_virtual,
                        func.is_final,
                        *visibility,
                        SymbolKind::Function,
                    )?;
                }
                Decl::Routine(routine) => {
                    if routine.name == "RELEASE" {
                        has_user_defined_release = true;
                    }
                    self.process_method(
                        class_name,
                        &routine.name,
                        VarType::INTEGER,
                        routine.parameters.len(),
                        routine.is_virtual,
                        routine.is_final,
                        *visibility,
                        SymbolKind::Routine,
                    )?;
                }
                _ => {}
            }
        }

        // Step 4: chain the superclass destructor behind a user RELEASE.
        if has_user_defined_release {
            if let Decl::Class(class_node) = &mut program.declarations[decl_index] {
                inject_superclass_release_calls(class_node, &parent_name, self.flags);
            }
        }

        // Step 5: synthesize CREATE / RELEASE defaults for empty slots.
        let slot0_empty = self.classes.get_class(class_name).unwrap().vtable_blueprint[0].is_empty();
        if slot0_empty {
            self.process_method(
                class_name,
                "CREATE",
                VarType::INTEGER,
                0,
                false,
                false,
                Visibility::Public,
                SymbolKind::Routine,
            )?;
            if let Decl::Class(class_node) = &mut program.declarations[decl_index] {
                class_node.members.push(ClassMember {
                    declaration: Decl::Routine(RoutineDecl {
                        name: "CREATE".into(),
                        parameters: Vec::new(),
                        body: Stmt::Compound(Vec::new()),
                        is_virtual: false,
                        is_final: false,
                    }),
                    visibility: Visibility::Public,
                });
            }
        }

        let slot1_empty = self.classes.get_class(class_name).unwrap().vtable_blueprint[1].is_empty();
        if slot1_empty {
            self.process_method(
                class_name,
                "RELEASE",
                VarType::INTEGER,
                0,
                false,
                false,
                Visibility::Public,
                SymbolKind::Routine,
            )?;
            let body = if self.flags.samm_enabled {
                // SAMM owns cleanup; an empty RELEASE avoids double frees.
                debug!("skipping RELEASE body synthesis for {class_name}: SAMM active");
                Stmt::Compound(Vec::new())
            } else if !parent_name.is_empty() {
                Stmt::Compound(vec![super_call_stmt("RELEASE", Vec::new())])
            } else {
                Stmt::Compound(vec![Stmt::call(
                    "OBJECT_HEAP_FREE",
                    vec![Expr::var("_this")],
                )])
            };
            if let Decl::Class(class_node) = &mut program.declarations[decl_index] {
                class_node.members.push(ClassMember {
                    declaration: Decl::Routine(RoutineDecl {
                        name: "RELEASE".into(),
                        parameters: Vec::new(),
                        body,
                        is_virtual: false,
                        is_final: false,
                    }),
                    visibility: Visibility::Public,
                });
            }
        }

        // Step 6: member initializers and SUPER.CREATE chaining.
        if let Decl::Class(class_node) = &mut program.declarations[decl_index] {
            inject_initializers(class_node, &parent_name);
        }

        {
            let entry = self.classes.get_class_mut(class_name).unwrap();
            entry.instance_size = entry.instance_size.max(current_offset);
            entry.is_layout_finalized = true;
        }
        debug!("finalized class {class_name}");
        resolution_path.remove(class_name);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_method(
        &mut self,
        class_name: &str,
        method_name: &str,
        return_type: VarType,
        param_count: usize,
        is_virtual: bool,
        is_final: bool,
        visibility: Visibility,
        kind: SymbolKind,
    ) -> CompileResult<()> {
        let qualified = mangle_method(class_name, method_name);
        let mut info = ClassMethodInfo {
            name: method_name.to_string(),
            qualified_name: qualified.clone(),
            vtable_slot: 0,
            return_type,
            is_virtual,
            is_final,
            visibility,
            parameters: vec![VarType::UNKNOWN; param_count],
        };

        match method_name {
            "CREATE" => {
                info.vtable_slot = 0;
                let entry = self.classes.get_class_mut(class_name).unwrap();
                entry.vtable_blueprint[0] = qualified.clone();
            }
            "RELEASE" => {
                info.vtable_slot = 1;
                let entry = self.classes.get_class_mut(class_name).unwrap();
                entry.vtable_blueprint[1] = qualified.clone();
            }
            _ => {
                // Overrides keep the parent's slot; new methods append.
                let parent_slot = self
                    .classes
                    .find_method(class_name, method_name)
                    .map(|m| (m.vtable_slot, m.is_final));
                match parent_slot {
                    Some((_, true)) => {
                        return Err(CompileError::ClassLayout(format!(
                            "cannot override final method {method_name} in class {class_name}"
                        )));
                    }
                    Some((slot, false)) => {
                        info.vtable_slot = slot;
                        let entry = self.classes.get_class_mut(class_name).unwrap();
                        entry.vtable_blueprint[slot] = qualified.clone();
                        trace!("{qualified} overrides parent slot {slot}");
                    }
                    None => {
                        let entry = self.classes.get_class_mut(class_name).unwrap();
                        info.vtable_slot = entry.vtable_blueprint.len();
                        entry.vtable_blueprint.push(qualified.clone());
                        trace!("{qualified} assigned new slot {}", info.vtable_slot);
                    }
                }
            }
        }

        let entry = self.classes.get_class_mut(class_name).unwrap();
        entry.add_member_method(info);
        self.symbols.declare(
            Symbol::new(qualified, kind, return_type).with_class(class_name),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Validation (only when tracing is on)

    fn validate_all_class_layouts(&self) -> CompileResult<()> {
        for name in self.classes.class_names_sorted() {
            let entry = self.classes.get_class(&name).unwrap();
            if !entry.is_layout_finalized {
                continue;
            }
            for (member, info) in &entry.member_variables {
                if info.offset < 8 {
                    return Err(CompileError::ClassLayout(format!(
                        "member {member} in class {name} overlaps the vtable word (offset {})",
                        info.offset
                    )));
                }
                if info.offset + 8 > entry.instance_size {
                    return Err(CompileError::ClassLayout(format!(
                        "class {name} instance size {} too small for member {member}",
                        entry.instance_size
                    )));
                }
            }
            if !entry.parent_name.is_empty() {
                let parent = self.classes.get_class(&entry.parent_name).ok_or_else(|| {
                    CompileError::ClassLayout(format!("parent class not found: {}", entry.parent_name))
                })?;
                if entry.instance_size < parent.instance_size {
                    return Err(CompileError::ClassLayout(format!(
                        "class {name} is smaller than its parent {}",
                        entry.parent_name
                    )));
                }
                for (member, parent_info) in &parent.member_variables {
                    match entry.member_variables.get(member) {
                        Some(info) if info.offset == parent_info.offset => {}
                        Some(_) => {
                            return Err(CompileError::ClassLayout(format!(
                                "member {member} moved between {} and {name}",
                                entry.parent_name
                            )));
                        }
                        None => {
                            return Err(CompileError::ClassLayout(format!(
                                "parent member {member} missing from derived class {name}"
                            )));
                        }
                    }
                }
                for (slot, qualified) in parent.vtable_blueprint.iter().enumerate() {
                    if qualified.is_empty() {
                        continue;
                    }
                    let simple = simple_method_name(qualified);
                    if let Some(own) = entry.local_method(simple) {
                        if own.vtable_slot != slot {
                            return Err(CompileError::ClassLayout(format!(
                                "override of {simple} in {name} does not keep parent slot {slot}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build a `SUPER.method(args)` call statement.
fn super_call_stmt(member: &str, args: Vec<Expr>) -> Stmt {
    Stmt::RoutineCall {
        routine: Expr::SuperMethodCall {
            member: member.to_string(),
            args,
        },
        args: Vec::new(),
    }
}

fn is_super_call(stmt: &Stmt, member: Option<&str>) -> bool {
    match stmt {
        Stmt::RoutineCall {
            routine: Expr::SuperMethodCall { member: m, .. },
            ..
        } => member.map_or(true, |want| m == want),
        _ => false,
    }
}

/// Append the destructor chain to a user-written RELEASE: base classes free
/// the object, derived classes delegate upward. Skipped entirely under SAMM.
fn inject_superclass_release_calls(class_node: &mut ClassDecl, parent_name: &str, flags: &Flags) {
    if flags.samm_enabled {
        debug!(
            "skipping RELEASE chaining for {}: SAMM is active",
            class_node.name
        );
        return;
    }
    for member in &mut class_node.members {
        if let Decl::Routine(routine) = &mut member.declaration {
            if routine.name == "RELEASE" {
                let appended = if parent_name.is_empty() {
                    Stmt::call("OBJECT_HEAP_FREE", vec![Expr::var("SELF")])
                } else {
                    super_call_stmt("RELEASE", Vec::new())
                };
                match &mut routine.body {
                    Stmt::Compound(stmts) | Stmt::Block { statements: stmts, .. } => {
                        stmts.push(appended);
                    }
                    other => {
                        let old = std::mem::replace(other, Stmt::Compound(Vec::new()));
                        *other = Stmt::Compound(vec![old, appended]);
                    }
                }
                return;
            }
        }
    }
}

/// Move member initializers to the top of CREATE (ahead of any user-written
/// `SUPER.CREATE`), then append a default `SUPER.CREATE(params...)` when the
/// class has a parent and the user did not chain explicitly.
fn inject_initializers(class_node: &mut ClassDecl, parent_name: &str) {
    let mut initializers = Vec::new();
    for member in &class_node.members {
        if let Decl::Let(let_decl) = &member.declaration {
            for (i, name) in let_decl.names.iter().enumerate() {
                if let Some(Some(init)) = let_decl.initializers.get(i) {
                    initializers.push(Stmt::assign(
                        Expr::member(Expr::var("_this"), name.clone()),
                        init.clone(),
                    ));
                }
            }
        }
    }

    let create = class_node.members.iter_mut().find_map(|m| {
        if let Decl::Routine(routine) = &mut m.declaration {
            if routine.name == "CREATE" {
                return Some(routine);
            }
        }
        None
    });
    let Some(create) = create else { return };

    if !matches!(create.body, Stmt::Compound(_) | Stmt::Block { .. }) {
        let old = std::mem::replace(&mut create.body, Stmt::Compound(Vec::new()));
        create.body = Stmt::Compound(vec![old]);
    }
    let params = create.parameters.clone();
    let stmts = match &mut create.body {
        Stmt::Compound(stmts) | Stmt::Block { statements: stmts, .. } => stmts,
        _ => unreachable!(),
    };

    let insert_pos = stmts
        .iter()
        .position(|s| is_super_call(s, None))
        .unwrap_or(0);
    let init_count = initializers.len();
    for (i, init) in initializers.into_iter().enumerate() {
        stmts.insert(insert_pos + i, init);
    }

    if !parent_name.is_empty() {
        let has_super_create = stmts.iter().any(|s| is_super_call(s, Some("CREATE")));
        if !has_super_create {
            let args = params.into_iter().map(Expr::Variable).collect();
            stmts.insert(insert_pos + init_count, super_call_stmt("CREATE", args));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionDecl, LetDecl};

    fn class(name: &str, parent: &str, members: Vec<ClassMember>) -> Decl {
        Decl::Class(ClassDecl {
            name: name.into(),
            parent_class_name: parent.into(),
            members,
        })
    }

    fn member(decl: Decl) -> ClassMember {
        ClassMember {
            declaration: decl,
            visibility: Visibility::Public,
        }
    }

    fn let_member(name: &str, init: Option<Expr>) -> ClassMember {
        member(Decl::Let(LetDecl {
            names: vec![name.into()],
            initializers: vec![init],
            is_float: false,
        }))
    }

    fn run_pass(program: &mut Program, flags: &Flags) -> (ClassTable, CompileResult<()>) {
        let mut classes = ClassTable::new();
        let mut symbols = SymbolTable::new();
        let result = ClassPass::new(&mut classes, &mut symbols, flags).run(program);
        (classes, result)
    }

    #[test]
    fn base_class_layout() {
        let mut program = Program::new(vec![class(
            "Point",
            "",
            vec![
                let_member("x", None),
                let_member("y", None),
                member(Decl::Function(FunctionDecl {
                    name: "getX".into(),
                    parameters: vec![],
                    body: Expr::Valof(Box::new(Stmt::Resultis(Expr::member(
                        Expr::var("_this"),
                        "x",
                    )))),
                    is_float_function: false,
                    is_virtual: false,
                    is_final: false,
                })),
            ],
        )]);
        let (classes, result) = run_pass(&mut program, &Flags::default());
        result.unwrap();
        let entry = classes.get_class("Point").unwrap();
        assert_eq!(entry.member_variables["x"].offset, 8);
        assert_eq!(entry.member_variables["y"].offset, 16);
        assert_eq!(entry.instance_size, 24);
        assert_eq!(entry.vtable_blueprint[0], "Point::CREATE");
        assert_eq!(entry.vtable_blueprint[1], "Point::RELEASE");
        assert_eq!(entry.member_methods["Point::getX"].vtable_slot, 2);
    }

    #[test]
    fn inherited_layout_and_override_slots() {
        let mut program = Program::new(vec![
            class(
                "Shape",
                "",
                vec![
                    let_member("area_cache", None),
                    member(Decl::Function(FunctionDecl {
                        name: "area".into(),
                        parameters: vec![],
                        body: Expr::Valof(Box::new(Stmt::Resultis(Expr::number(0)))),
                        is_float_function: false,
                        is_virtual: true,
                        is_final: false,
                    })),
                ],
            ),
            class(
                "Circle",
                "Shape",
                vec![
                    let_member("radius", None),
                    member(Decl::Function(FunctionDecl {
                        name: "area".into(),
                        parameters: vec![],
                        body: Expr::Valof(Box::new(Stmt::Resultis(Expr::number(3)))),
                        is_float_function: false,
                        is_virtual: true,
                        is_final: false,
                    })),
                ],
            ),
        ]);
        let (classes, result) = run_pass(&mut program, &Flags::default());
        result.unwrap();
        let shape = classes.get_class("Shape").unwrap();
        let circle = classes.get_class("Circle").unwrap();
        assert!(circle.instance_size >= shape.instance_size);
        assert_eq!(
            circle.member_variables["area_cache"].offset,
            shape.member_variables["area_cache"].offset
        );
        // The override occupies the parent's slot.
        assert_eq!(
            circle.member_methods["Circle::area"].vtable_slot,
            shape.member_methods["Shape::area"].vtable_slot
        );
        assert_eq!(
            circle.vtable_blueprint[shape.member_methods["Shape::area"].vtable_slot],
            "Circle::area"
        );
    }

    #[test]
    fn circular_inheritance_is_fatal() {
        let mut program = Program::new(vec![class("A", "B", vec![]), class("B", "A", vec![])]);
        let (_, result) = run_pass(&mut program, &Flags::default());
        assert!(matches!(result, Err(CompileError::ClassLayout(_))));
    }

    #[test]
    fn final_override_is_fatal() {
        let mut program = Program::new(vec![
            class(
                "A",
                "",
                vec![member(Decl::Routine(RoutineDecl {
                    name: "shut".into(),
                    parameters: vec![],
                    body: Stmt::Compound(vec![]),
                    is_virtual: true,
                    is_final: true,
                }))],
            ),
            class(
                "B",
                "A",
                vec![member(Decl::Routine(RoutineDecl {
                    name: "shut".into(),
                    parameters: vec![],
                    body: Stmt::Compound(vec![]),
                    is_virtual: true,
                    is_final: false,
                }))],
            ),
        ]);
        let (_, result) = run_pass(&mut program, &Flags::default());
        assert!(matches!(result, Err(CompileError::ClassLayout(_))));
    }

    #[test]
    fn user_release_gets_super_chain_without_samm() {
        let flags = Flags {
            samm_enabled: false,
            ..Flags::default()
        };
        let mut program = Program::new(vec![
            class("A", "", vec![]),
            class(
                "B",
                "A",
                vec![member(Decl::Routine(RoutineDecl {
                    name: "RELEASE".into(),
                    parameters: vec![],
                    body: Stmt::Compound(vec![Stmt::call("do_cleanup", vec![])]),
                    is_virtual: false,
                    is_final: false,
                }))],
            ),
        ]);
        let (_, result) = run_pass(&mut program, &flags);
        result.unwrap();
        let release = program
            .declarations
            .iter()
            .find_map(|d| match d {
                Decl::Class(c) if c.name == "B" => c.members.iter().find_map(|m| {
                    if let Decl::Routine(r) = &m.declaration {
                        (r.name == "RELEASE").then_some(r)
                    } else {
                        None
                    }
                }),
                _ => None,
            })
            .unwrap();
        match &release.body {
            Stmt::Compound(stmts) => {
                assert_eq!(stmts.len(), 2);
                assert!(is_super_call(&stmts[1], Some("RELEASE")));
            }
            other => panic!("unexpected RELEASE body: {other:?}"),
        }
    }

    #[test]
    fn user_release_untouched_under_samm() {
        let mut program = Program::new(vec![class(
            "A",
            "",
            vec![member(Decl::Routine(RoutineDecl {
                name: "RELEASE".into(),
                parameters: vec![],
                body: Stmt::Compound(vec![Stmt::call("do_cleanup", vec![])]),
                is_virtual: false,
                is_final: false,
            }))],
        )]);
        let (_, result) = run_pass(&mut program, &Flags::default());
        result.unwrap();
        let release = program
            .declarations
            .iter()
            .find_map(|d| match d {
                Decl::Class(c) => c.members.iter().find_map(|m| {
                    if let Decl::Routine(r) = &m.declaration {
                        (r.name == "RELEASE").then_some(r)
                    } else {
                        None
                    }
                }),
                _ => None,
            })
            .unwrap();
        match &release.body {
            Stmt::Compound(stmts) => assert_eq!(stmts.len(), 1),
            other => panic!("unexpected RELEASE body: {other:?}"),
        }
    }

    #[test]
    fn create_gets_initializers_then_super_create() {
        let mut program = Program::new(vec![
            class("Base", "", vec![]),
            class(
                "Derived",
                "Base",
                vec![
                    let_member("count", Some(Expr::number(7))),
                    member(Decl::Routine(RoutineDecl {
                        name: "CREATE".into(),
                        parameters: vec!["n".into()],
                        body: Stmt::Compound(vec![Stmt::assign(
                            Expr::member(Expr::var("_this"), "count"),
                            Expr::var("n"),
                        )]),
                        is_virtual: false,
                        is_final: false,
                    })),
                ],
            ),
        ]);
        let (_, result) = run_pass(&mut program, &Flags::default());
        result.unwrap();
        let create = program
            .declarations
            .iter()
            .find_map(|d| match d {
                Decl::Class(c) if c.name == "Derived" => c.members.iter().find_map(|m| {
                    if let Decl::Routine(r) = &m.declaration {
                        (r.name == "CREATE").then_some(r)
                    } else {
                        None
                    }
                }),
                _ => None,
            })
            .unwrap();
        match &create.body {
            Stmt::Compound(stmts) => {
                // initializer, synthesized SUPER.CREATE(n), user statement
                assert_eq!(stmts.len(), 3);
                assert!(matches!(&stmts[0], Stmt::Assignment { .. }));
                assert!(is_super_call(&stmts[1], Some("CREATE")));
            }
            other => panic!("unexpected CREATE body: {other:?}"),
        }
    }
}
