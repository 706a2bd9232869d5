// Structural helpers over expressions shared by the interpreter and passes.
//
//   free_vars        — variables a function body references but does not bind
//   ExplicitLetList  — the let-chain of an A-normal-form body, flattened

use std::collections::HashSet;

use crate::ir::expr::{Expr, ExprKind, Function, Var};

/// Free variables of `func`, in order of first occurrence.
///
/// Parameters, let-bound variables and the parameters of nested functions are
/// bound; everything else referenced through `ExprKind::Var` is free.
pub fn free_vars(func: &Function) -> Vec<Var> {
    let mut collector = FreeVarCollector::default();
    for p in func.params() {
        collector.bound.insert(p.clone());
    }
    collector.visit(func.body());
    collector.free
}

#[derive(Default)]
struct FreeVarCollector {
    bound: HashSet<Var>,
    seen: HashSet<Var>,
    free: Vec<Var>,
}

impl FreeVarCollector {
    fn visit(&mut self, expr: &Expr) {
        match expr.kind() {
            ExprKind::Var(v) => {
                if !self.bound.contains(v) && self.seen.insert(v.clone()) {
                    self.free.push(v.clone());
                }
            }
            ExprKind::GlobalVar(_) | ExprKind::Op(_) | ExprKind::Constant(_) => {}
            ExprKind::Function(f) => {
                let added: Vec<Var> = f
                    .params()
                    .iter()
                    .filter(|p| self.bound.insert((*p).clone()))
                    .cloned()
                    .collect();
                self.visit(f.body());
                for p in added {
                    self.bound.remove(&p);
                }
            }
            ExprKind::Call { op, args } => {
                self.visit(op);
                for a in args {
                    self.visit(a);
                }
            }
            ExprKind::Let { var, value, body } => {
                self.visit(value);
                let added = self.bound.insert(var.clone());
                self.visit(body);
                if added {
                    self.bound.remove(var);
                }
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.visit(cond);
                self.visit(then_branch);
                self.visit(else_branch);
            }
            ExprKind::Tuple(fields) => {
                for f in fields {
                    self.visit(f);
                }
            }
            ExprKind::TupleGetItem { tuple, .. } => self.visit(tuple),
            ExprKind::RefCreate(e) | ExprKind::RefRead(e) => self.visit(e),
            ExprKind::RefWrite { reference, value } => {
                self.visit(reference);
                self.visit(value);
            }
        }
    }
}

/// The let-chain `let v0 = e0; let v1 = e1; ...; ret` of an ANF body.
#[derive(Debug, Clone)]
pub struct ExplicitLetList {
    pub vars: Vec<Var>,
    pub exprs: Vec<Expr>,
    pub ret: Expr,
}

impl ExplicitLetList {
    pub fn new(body: &Expr) -> Self {
        let mut vars = Vec::new();
        let mut exprs = Vec::new();
        let mut cur = body.clone();
        while let ExprKind::Let { var, value, body } = cur.kind() {
            vars.push(var.clone());
            exprs.push(value.clone());
            let next = body.clone();
            cur = next;
        }
        ExplicitLetList {
            vars,
            exprs,
            ret: cur,
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Rebuild the nested let expression.
    pub fn assemble(&self) -> Expr {
        self.vars
            .iter()
            .zip(&self.exprs)
            .rev()
            .fold(self.ret.clone(), |body, (var, value)| {
                Expr::let_(var, value.clone(), body)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_vars_skip_bound() {
        let x = Var::new("x", None);
        let y = Var::new("y", None);
        let z = Var::new("z", None);
        // fn(x) { let y = z; (x, y, z, w) }
        let w = Var::new("w", None);
        let body = Expr::let_(
            &y,
            Expr::var(&z),
            Expr::tuple(vec![Expr::var(&x), Expr::var(&y), Expr::var(&z), Expr::var(&w)]),
        );
        let f = Function::new(vec![x], body);
        assert_eq!(free_vars(&f), vec![z, w]);
    }

    #[test]
    fn test_nested_function_params_are_bound() {
        let a = Var::new("a", None);
        let b = Var::new("b", None);
        let inner = Function::new(vec![a.clone()], Expr::tuple(vec![Expr::var(&a), Expr::var(&b)]));
        let outer = Function::new(vec![], Expr::func(inner));
        assert_eq!(free_vars(&outer), vec![b]);
    }

    #[test]
    fn test_let_list_roundtrip() {
        let a = Var::new("a", None);
        let b = Var::new("b", None);
        let body = Expr::let_(
            &a,
            Expr::constant(1i64),
            Expr::let_(&b, Expr::var(&a), Expr::var(&b)),
        );
        let ell = ExplicitLetList::new(&body);
        assert_eq!(ell.vars, vec![a, b.clone()]);
        assert_eq!(ell.ret.as_var(), Some(&b));
        let rebuilt = ExplicitLetList::new(&ell.assemble());
        assert_eq!(rebuilt.vars, ell.vars);
    }
}
