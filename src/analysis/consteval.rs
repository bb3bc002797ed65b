//! Compile-time evaluation of constant integer expressions.
//!
//! `SWITCHON` case labels and table sizes must fold to integers at compile
//! time. The evaluator recognizes integer literals, `MANIFEST` references,
//! the four integer arithmetic operators, and bitwise/logical OR; anything
//! else makes the expression non-constant. Evaluation is pure: the same AST
//! always yields the same answer, regardless of invocation order.

use crate::ast::{BinOp, Expr, UnOp};
use crate::fx::FxHashMap;

/// Fold `expr` to an integer if it is a compile-time constant.
pub fn evaluate_constant_expression(expr: &Expr, manifests: &FxHashMap<String, i64>) -> Option<i64> {
    match expr {
        Expr::Number(n) => Some(*n),
        Expr::CharLit(c) => Some(*c as i64),
        Expr::Boolean(b) => Some(if *b { -1 } else { 0 }),
        Expr::Variable(name) => manifests.get(name).copied(),
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => evaluate_constant_expression(operand, manifests).map(|v| v.wrapping_neg()),
        Expr::Binary { op, lhs, rhs } => {
            let l = evaluate_constant_expression(lhs, manifests)?;
            let r = evaluate_constant_expression(rhs, manifests)?;
            match op {
                BinOp::Add => Some(l.wrapping_add(r)),
                BinOp::Sub => Some(l.wrapping_sub(r)),
                BinOp::Mul => Some(l.wrapping_mul(r)),
                BinOp::Div => {
                    if r == 0 {
                        None
                    } else {
                        Some(l.wrapping_div(r))
                    }
                }
                BinOp::BitOr | BinOp::LogOr => Some(l | r),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifests() -> FxHashMap<String, i64> {
        let mut m = FxHashMap::default();
        m.insert("LIMIT".to_string(), 32);
        m
    }

    #[test]
    fn folds_arithmetic_over_manifests() {
        let expr = Expr::binary(
            BinOp::Add,
            Expr::var("LIMIT"),
            Expr::binary(BinOp::Mul, Expr::number(2), Expr::number(3)),
        );
        assert_eq!(evaluate_constant_expression(&expr, &manifests()), Some(38));
    }

    #[test]
    fn folds_or() {
        let expr = Expr::binary(BinOp::BitOr, Expr::number(0x10), Expr::number(0x01));
        assert_eq!(evaluate_constant_expression(&expr, &manifests()), Some(0x11));
    }

    #[test]
    fn rejects_non_constants() {
        let expr = Expr::binary(BinOp::Add, Expr::var("runtime_var"), Expr::number(1));
        assert_eq!(evaluate_constant_expression(&expr, &manifests()), None);
        let call = Expr::call("f", vec![]);
        assert_eq!(evaluate_constant_expression(&call, &manifests()), None);
    }

    #[test]
    fn division_by_zero_is_not_constant() {
        let expr = Expr::binary(BinOp::Div, Expr::number(4), Expr::number(0));
        assert_eq!(evaluate_constant_expression(&expr, &manifests()), None);
    }

    #[test]
    fn evaluation_is_pure() {
        let expr = Expr::binary(BinOp::Sub, Expr::var("LIMIT"), Expr::number(1));
        let m = manifests();
        let first = evaluate_constant_expression(&expr, &m);
        let second = evaluate_constant_expression(&expr, &m);
        assert_eq!(first, second);
        assert_eq!(first, Some(31));
    }
}
