//! Trivial accessor and setter recognition.
//!
//! A method whose whole body is `RESULTIS self.m` (or bare `RESULTIS m` where
//! `m` is an unshadowed class member, or `RESULTIS SELF`) compiles to a
//! single load plus `RET` with no frame at all; the symmetric single-store
//! pattern marks a trivial setter. Detection runs once after the body walk
//! and stores its result in the function metrics, where the code generator's
//! fast path picks it up.

use crate::ast::{Decl, Expr, Program, Stmt};
use crate::classes::{mangle_method, ClassTable};
use crate::symbols::SymbolTable;

use super::analyzer::AnalyzerState;

/// Sentinel member name for identity accessors returning the object pointer.
pub const THIS_PTR_SENTINEL: &str = "_this_ptr";

impl AnalyzerState {
    pub(crate) fn detect_trivial_bodies(
        &mut self,
        program: &Program,
        _symbols: &SymbolTable,
        classes: &ClassTable,
    ) {
        for decl in &program.declarations {
            let Decl::Class(class) = decl else { continue };
            for member in &class.members {
                match &member.declaration {
                    Decl::Function(func) => {
                        let mangled = mangle_method(&class.name, &func.name);
                        let params: Vec<String> = self
                            .function_metrics
                            .get(&mangled)
                            .map(|m| m.parameters.clone())
                            .unwrap_or_default();
                        if let Some(member_name) =
                            identify_trivial_accessor(&func.body, &class.name, &params, classes)
                        {
                            log::debug!("{mangled} is a trivial accessor of {member_name}");
                            if let Some(m) = self.function_metrics.get_mut(&mangled) {
                                m.is_trivial_accessor = true;
                                m.accessed_member_name = member_name;
                            }
                        }
                    }
                    Decl::Routine(routine) => {
                        let mangled = mangle_method(&class.name, &routine.name);
                        let params: Vec<String> = self
                            .function_metrics
                            .get(&mangled)
                            .map(|m| m.parameters.clone())
                            .unwrap_or_default();
                        if let Some((member_name, param_index)) =
                            identify_trivial_setter(&routine.body, &class.name, &params, classes)
                        {
                            log::debug!(
                                "{mangled} is a trivial setter of {member_name} from parameter {param_index}"
                            );
                            if let Some(m) = self.function_metrics.get_mut(&mangled) {
                                m.is_trivial_setter = true;
                                m.accessed_member_name = member_name;
                                m.setter_parameter_index = param_index;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Strip a `VALOF`/`FLOATVALOF` wrapper and a single enclosing block, and
/// return the lone statement, if the body has exactly that shape.
fn single_statement(body: &Expr) -> Option<&Stmt> {
    let inner = match body {
        Expr::Valof(stmt) | Expr::FloatValof(stmt) => stmt.as_ref(),
        _ => return None,
    };
    single_statement_of_stmt(inner)
}

fn single_statement_of_stmt(stmt: &Stmt) -> Option<&Stmt> {
    match stmt {
        Stmt::Block {
            declarations,
            statements,
        } if declarations.is_empty() && statements.len() == 1 => Some(&statements[0]),
        Stmt::Compound(statements) if statements.len() == 1 => {
            single_statement_of_stmt(&statements[0]).or(Some(&statements[0]))
        }
        Stmt::Resultis(_) | Stmt::Assignment { .. } => Some(stmt),
        _ => None,
    }
}

fn is_self_ref(expr: &Expr) -> bool {
    matches!(expr, Expr::Variable(name) if name == "_this" || name == "SELF")
}

/// The accessed member name when `body` is a trivial accessor, or the
/// `_this_ptr` sentinel for identity accessors.
pub(crate) fn identify_trivial_accessor(
    body: &Expr,
    class_name: &str,
    parameters: &[String],
    classes: &ClassTable,
) -> Option<String> {
    let stmt = single_statement(body)?;
    let Stmt::Resultis(expr) = stmt else {
        return None;
    };
    match expr {
        Expr::MemberAccess { object, member } if is_self_ref(object) => Some(member.clone()),
        Expr::Variable(name) if name == "_this" || name == "SELF" => {
            Some(THIS_PTR_SENTINEL.to_string())
        }
        Expr::Variable(name) => {
            // A bare member name counts only when nothing local shadows it;
            // with a single-statement body the only candidates are
            // parameters.
            if parameters.iter().any(|p| p == name) {
                return None;
            }
            let entry = classes.get_class(class_name)?;
            if entry.member_variables.contains_key(name) {
                Some(name.clone())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// `(member, parameter index)` when `body` is a trivial setter.
pub(crate) fn identify_trivial_setter(
    body: &Stmt,
    class_name: &str,
    parameters: &[String],
    classes: &ClassTable,
) -> Option<(String, usize)> {
    let stmt = single_statement_of_stmt(body)?;
    let Stmt::Assignment { lhs, rhs } = stmt else {
        return None;
    };
    if lhs.len() != 1 || rhs.len() != 1 {
        return None;
    }
    let param_index = match &rhs[0] {
        Expr::Variable(name) => parameters.iter().position(|p| p == name)?,
        _ => return None,
    };
    match &lhs[0] {
        Expr::MemberAccess { object, member } if is_self_ref(object) => {
            Some((member.clone(), param_index))
        }
        Expr::Variable(name) => {
            if parameters.iter().any(|p| p == name) {
                return None;
            }
            let entry = classes.get_class(class_name)?;
            if entry.member_variables.contains_key(name) {
                Some((name.clone(), param_index))
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Visibility;
    use crate::classes::ClassMemberInfo;
    use crate::types::VarType;

    fn classes_with_member(class: &str, member: &str) -> ClassTable {
        let mut table = ClassTable::new();
        table.add_class(class, "");
        table.get_class_mut(class).unwrap().add_member_variable(ClassMemberInfo {
            name: member.into(),
            ty: VarType::INTEGER,
            offset: 8,
            visibility: Visibility::Public,
        });
        table
    }

    #[test]
    fn recognizes_member_accessor() {
        let classes = classes_with_member("Point", "x");
        let body = Expr::Valof(Box::new(Stmt::Resultis(Expr::member(
            Expr::var("_this"),
            "x",
        ))));
        assert_eq!(
            identify_trivial_accessor(&body, "Point", &[], &classes),
            Some("x".to_string())
        );
    }

    #[test]
    fn recognizes_bare_member_and_identity() {
        let classes = classes_with_member("Point", "x");
        let bare = Expr::Valof(Box::new(Stmt::Block {
            declarations: vec![],
            statements: vec![Stmt::Resultis(Expr::var("x"))],
        }));
        assert_eq!(
            identify_trivial_accessor(&bare, "Point", &[], &classes),
            Some("x".to_string())
        );
        let identity = Expr::Valof(Box::new(Stmt::Resultis(Expr::var("SELF"))));
        assert_eq!(
            identify_trivial_accessor(&identity, "Point", &[], &classes),
            Some(THIS_PTR_SENTINEL.to_string())
        );
    }

    #[test]
    fn parameter_shadow_defeats_accessor() {
        let classes = classes_with_member("Point", "x");
        let body = Expr::Valof(Box::new(Stmt::Resultis(Expr::var("x"))));
        assert_eq!(
            identify_trivial_accessor(&body, "Point", &["x".to_string()], &classes),
            None
        );
    }

    #[test]
    fn recognizes_setter() {
        let classes = classes_with_member("Point", "x");
        let body = Stmt::Compound(vec![Stmt::assign(
            Expr::member(Expr::var("_this"), "x"),
            Expr::var("v"),
        )]);
        assert_eq!(
            identify_trivial_setter(&body, "Point", &["v".to_string()], &classes),
            Some(("x".to_string(), 0))
        );
    }

    #[test]
    fn bigger_bodies_are_not_trivial() {
        let classes = classes_with_member("Point", "x");
        let body = Expr::Valof(Box::new(Stmt::Compound(vec![
            Stmt::call("WRITES", vec![Expr::StringLit("hi".into())]),
            Stmt::Resultis(Expr::member(Expr::var("_this"), "x")),
        ])));
        assert_eq!(identify_trivial_accessor(&body, "Point", &[], &classes), None);
    }
}
