//! Constant expression evaluator
//!
//! Recursive fold over the expression tree, closed over literals, unary
//! and binary arithmetic, short-circuiting `&&`/`||`, the ternary
//! operator, casts (value-preserving), `sizeof`, comma, and enum
//! constants. All arithmetic is signed 64-bit with wrap. Division or
//! modulus by zero is reported and fails the evaluation; questionable
//! shift amounts warn but still fold.
//!
//! Callers may rely on the result only when `Some` is returned, and
//! re-evaluation of a successful expression always yields the same value.

use crate::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use crate::diag::Diagnostics;
use crate::symbols::{SymbolKind, SymbolTable};
use crate::types::TypeTable;

/// Evaluate `expr` as an integer constant expression.
pub fn eval(
    expr: &Expr,
    types: &TypeTable,
    symbols: Option<&SymbolTable>,
    diags: &mut Diagnostics,
) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit { value, .. } => Some(*value as i64),
        ExprKind::CharLit(value) => Some(*value),
        ExprKind::Ident { name, sym } => {
            let symbols = symbols?;
            let id = sym.or_else(|| symbols.lookup(name))?;
            let symbol = symbols.symbol(id);
            if symbol.kind == SymbolKind::EnumConstant {
                Some(symbol.enum_value)
            } else {
                None
            }
        }
        ExprKind::Unary { op, operand } => {
            let v = eval(operand, types, symbols, diags)?;
            match op {
                UnaryOp::Plus => Some(v),
                UnaryOp::Neg => Some(v.wrapping_neg()),
                UnaryOp::LogNot => Some((v == 0) as i64),
                UnaryOp::BitNot => Some(!v),
                _ => None,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            // Short-circuit operators do not evaluate the dead side.
            match op {
                BinaryOp::LogAnd => {
                    let l = eval(lhs, types, symbols, diags)?;
                    if l == 0 {
                        return Some(0);
                    }
                    return Some((eval(rhs, types, symbols, diags)? != 0) as i64);
                }
                BinaryOp::LogOr => {
                    let l = eval(lhs, types, symbols, diags)?;
                    if l != 0 {
                        return Some(1);
                    }
                    return Some((eval(rhs, types, symbols, diags)? != 0) as i64);
                }
                _ => {}
            }
            let l = eval(lhs, types, symbols, diags)?;
            let r = eval(rhs, types, symbols, diags)?;
            match op {
                BinaryOp::Add => Some(l.wrapping_add(r)),
                BinaryOp::Sub => Some(l.wrapping_sub(r)),
                BinaryOp::Mul => Some(l.wrapping_mul(r)),
                BinaryOp::Div | BinaryOp::Mod => {
                    if r == 0 {
                        diags.error_at(&expr.loc, "division by zero in constant expression");
                        return None;
                    }
                    if *op == BinaryOp::Div {
                        Some(l.wrapping_div(r))
                    } else {
                        Some(l.wrapping_rem(r))
                    }
                }
                BinaryOp::Shl | BinaryOp::Shr => {
                    if !(0..64).contains(&r) {
                        diags.warn(
                            "shift-range",
                            &expr.loc,
                            format!("shift amount {} is out of range", r),
                        );
                    }
                    if *op == BinaryOp::Shl {
                        Some(l.wrapping_shl(r as u32))
                    } else {
                        Some(l.wrapping_shr(r as u32))
                    }
                }
                BinaryOp::Lt => Some((l < r) as i64),
                BinaryOp::Gt => Some((l > r) as i64),
                BinaryOp::Le => Some((l <= r) as i64),
                BinaryOp::Ge => Some((l >= r) as i64),
                BinaryOp::Eq => Some((l == r) as i64),
                BinaryOp::Ne => Some((l != r) as i64),
                BinaryOp::BitAnd => Some(l & r),
                BinaryOp::BitXor => Some(l ^ r),
                BinaryOp::BitOr => Some(l | r),
                BinaryOp::LogAnd | BinaryOp::LogOr => unreachable!("handled above"),
            }
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            let c = eval(cond, types, symbols, diags)?;
            if c != 0 {
                eval(then_expr, types, symbols, diags)
            } else {
                eval(else_expr, types, symbols, diags)
            }
        }
        // Value-preserving; range adjustment by the cast type is left to
        // code generation.
        ExprKind::Cast { operand, .. } | ExprKind::ImplicitCast { operand, .. } => {
            eval(operand, types, symbols, diags)
        }
        ExprKind::SizeofType(ty) => types.size_of(*ty).map(|s| s as i64),
        ExprKind::SizeofExpr(e) => {
            let ty = e.ty?;
            types.size_of(ty).map(|s| s as i64)
        }
        ExprKind::Comma { lhs, rhs } => {
            eval(lhs, types, symbols, diags)?;
            eval(rhs, types, symbols, diags)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceLoc;
    use crate::lexer::IntSuffix;
    use crate::types::TargetLayout;
    use std::rc::Rc;

    fn loc() -> SourceLoc {
        SourceLoc::new(Rc::from("t.c"), 1, 1)
    }

    fn int(v: u64) -> Expr {
        Expr::new(
            ExprKind::IntLit {
                value: v,
                suffix: IntSuffix::default(),
                decimal: true,
            },
            loc(),
        )
    }

    fn bin(op: BinaryOp, l: Expr, r: Expr) -> Expr {
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(l),
                rhs: Box::new(r),
            },
            loc(),
        )
    }

    #[test]
    fn test_arithmetic_folding() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        // 2 + 3 * 4
        let e = bin(BinaryOp::Add, int(2), bin(BinaryOp::Mul, int(3), int(4)));
        assert_eq!(eval(&e, &types, None, &mut diags), Some(14));
        // Re-evaluation is stable.
        assert_eq!(eval(&e, &types, None, &mut diags), Some(14));
    }

    #[test]
    fn test_division_by_zero_fails() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        let e = bin(BinaryOp::Div, int(1), int(0));
        assert_eq!(eval(&e, &types, None, &mut diags), None);
        assert!(diags.contains("division by zero"));
    }

    #[test]
    fn test_short_circuit_skips_dead_side() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        // 0 && (1/0) folds without reporting the division.
        let e = bin(
            BinaryOp::LogAnd,
            int(0),
            bin(BinaryOp::Div, int(1), int(0)),
        );
        assert_eq!(eval(&e, &types, None, &mut diags), Some(0));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_shift_range_warns_but_folds() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        let e = bin(BinaryOp::Shl, int(1), int(70));
        assert!(eval(&e, &types, None, &mut diags).is_some());
        assert!(diags.contains("out of range"));
    }

    #[test]
    fn test_sizeof_type() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        let e = Expr::new(ExprKind::SizeofType(types.int()), loc());
        assert_eq!(eval(&e, &types, None, &mut diags), Some(4));
    }

    #[test]
    fn test_cast_preserves_value() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        let e = Expr::new(
            ExprKind::Cast {
                to: types.char_ty(),
                operand: Box::new(int(300)),
            },
            loc(),
        );
        assert_eq!(eval(&e, &types, None, &mut diags), Some(300));
    }

    #[test]
    fn test_ternary_and_comma() {
        let types = TypeTable::new(TargetLayout::lp64());
        let mut diags = Diagnostics::new(false, false, false);
        let e = Expr::new(
            ExprKind::Ternary {
                cond: Box::new(int(1)),
                then_expr: Box::new(int(7)),
                else_expr: Box::new(int(9)),
            },
            loc(),
        );
        assert_eq!(eval(&e, &types, None, &mut diags), Some(7));
        let e = Expr::new(
            ExprKind::Comma {
                lhs: Box::new(int(1)),
                rhs: Box::new(int(2)),
            },
            loc(),
        );
        assert_eq!(eval(&e, &types, None, &mut diags), Some(2));
    }
}
