// Type inference — bottom-up type annotation of ember IR
//
// Every node's type is computed from its already annotated children and
// never from its consumers. An Incomplete input makes the node Incomplete,
// except where unification (If branches, annotated lets) can fill it in.
//
//   Var            environment entry, else annotation, else Incomplete
//   GlobalVar      type of the module function, inferred once and cached
//   Op             the op's function type, rules carried as constraints
//   Function       params from annotations, return from the body
//   Call (op)      the op's single type rule over values or reified types
//   Call (other)   the callee's declared return type, not instantiated
//   Constant       the embedded value's type
//   Let            value type (unified with the annotation) flows to body
//   If             both branches unified
//   Tuple / TupleGetItem / Ref*   structural
//
// The input IR is never mutated: a fresh annotated copy is returned.

use std::collections::{HashMap, HashSet};

use ember_core::ir::{Expr, ExprKind, FuncType, Function, GlobalVar, IrModule, Type, Var};
use ember_core::op::{CallValues, Op};
use ember_core::{Device, Error, Result, Value};
use tracing::{debug, trace};

use super::unify::unify;

/// Annotate every function of `module`, returning a new module.
pub fn infer_type(module: &IrModule) -> Result<IrModule> {
    let mut inferencer = TypeInferencer::new(Some(module));
    let mut out = IrModule::new();
    for (gv, _) in module.functions() {
        let func = inferencer.infer_global(gv)?;
        out.add(gv.clone(), func);
    }
    Ok(out)
}

/// Annotate a single expression; globals resolve through `module`.
pub fn infer_expr_type(expr: &Expr, module: Option<&IrModule>) -> Result<Expr> {
    TypeInferencer::new(module).infer(expr)
}

/// Inference state for one module.
pub struct TypeInferencer<'m> {
    module: Option<&'m IrModule>,
    env: HashMap<Var, Type>,
    globals: HashMap<GlobalVar, (Function, Type)>,
    in_progress: HashSet<GlobalVar>,
}

impl<'m> TypeInferencer<'m> {
    pub fn new(module: Option<&'m IrModule>) -> Self {
        TypeInferencer {
            module,
            env: HashMap::new(),
            globals: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Return an annotated copy of `expr`.
    pub fn infer(&mut self, expr: &Expr) -> Result<Expr> {
        match expr.kind() {
            ExprKind::Var(var) => {
                let ty = self.var_type(var);
                Ok(Expr::with_checked_type(ExprKind::Var(var.clone()), ty))
            }
            ExprKind::GlobalVar(gv) => {
                let ty = self.global_type(gv)?;
                Ok(Expr::with_checked_type(ExprKind::GlobalVar(gv.clone()), ty))
            }
            ExprKind::Op(op) => Ok(Expr::with_checked_type(ExprKind::Op(op.clone()), op.func_type())),
            ExprKind::Function(func) => {
                let (func, ty) = self.infer_function(func)?;
                Ok(Expr::with_checked_type(ExprKind::Function(func), ty))
            }
            ExprKind::Call { op, args } => {
                let op = self.infer(op)?;
                let args = args
                    .iter()
                    .map(|a| self.infer(a))
                    .collect::<Result<Vec<_>>>()?;
                let ty = self.call_type(&op, &args)?;
                Ok(Expr::with_checked_type(ExprKind::Call { op, args }, ty))
            }
            ExprKind::Constant(value) => Ok(Expr::with_checked_type(
                ExprKind::Constant(value.clone()),
                value.type_of(),
            )),
            ExprKind::Let { .. } => self.infer_let(expr),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.infer(cond)?;
                let then_branch = self.infer(then_branch)?;
                let else_branch = self.infer(else_branch)?;
                let ty = unify(&then_branch.ty(), &else_branch.ty())?;
                Ok(Expr::with_checked_type(
                    ExprKind::If {
                        cond,
                        then_branch,
                        else_branch,
                    },
                    ty,
                ))
            }
            ExprKind::Tuple(fields) => {
                let fields = fields
                    .iter()
                    .map(|f| self.infer(f))
                    .collect::<Result<Vec<_>>>()?;
                let ty = if fields.iter().any(|f| f.ty().is_incomplete()) {
                    Type::Incomplete
                } else {
                    Type::Tuple(fields.iter().map(Expr::ty).collect())
                };
                Ok(Expr::with_checked_type(ExprKind::Tuple(fields), ty))
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let tuple = self.infer(tuple)?;
                let ty = match tuple.ty() {
                    Type::Incomplete => Type::Incomplete,
                    Type::Tuple(fields) => {
                        if *index < 0 || *index as usize >= fields.len() {
                            return Err(Error::IndexOutOfRange {
                                index: *index,
                                size: fields.len(),
                            });
                        }
                        fields[*index as usize].clone()
                    }
                    other => {
                        return Err(Error::TypeMismatch {
                            expected: "Tuple",
                            got: type_kind(&other),
                        })
                    }
                };
                Ok(Expr::with_checked_type(
                    ExprKind::TupleGetItem {
                        tuple,
                        index: *index,
                    },
                    ty,
                ))
            }
            ExprKind::RefCreate(value) => {
                let value = self.infer(value)?;
                let ty = match value.ty() {
                    Type::Incomplete => Type::Incomplete,
                    inner => Type::Ref(Box::new(inner)),
                };
                Ok(Expr::with_checked_type(ExprKind::RefCreate(value), ty))
            }
            ExprKind::RefRead(reference) => {
                let reference = self.infer(reference)?;
                let ty = match reference.ty() {
                    Type::Incomplete => Type::Incomplete,
                    Type::Ref(inner) => *inner,
                    other => {
                        return Err(Error::TypeMismatch {
                            expected: "Ref",
                            got: type_kind(&other),
                        })
                    }
                };
                Ok(Expr::with_checked_type(ExprKind::RefRead(reference), ty))
            }
            ExprKind::RefWrite { reference, value } => {
                let reference = self.infer(reference)?;
                let value = self.infer(value)?;
                if let Type::Ref(inner) = reference.ty() {
                    unify(&inner, &value.ty())?;
                }
                Ok(Expr::with_checked_type(
                    ExprKind::RefWrite { reference, value },
                    Type::unit(),
                ))
            }
        }
    }

    fn var_type(&self, var: &Var) -> Type {
        self.env
            .get(var)
            .or_else(|| var.annotation())
            .cloned()
            .unwrap_or_default()
    }

    /// Infer (once) and return the annotated module function `gv`.
    pub fn infer_global(&mut self, gv: &GlobalVar) -> Result<Function> {
        if let Some((func, _)) = self.globals.get(gv) {
            return Ok(func.clone());
        }
        let func = self.lookup_global(gv)?;
        self.in_progress.insert(gv.clone());
        let result = self.infer_function(&func);
        self.in_progress.remove(gv);
        let (func, ty) = result?;
        debug!(function = %gv, ty = %ty, "inferred");
        self.globals.insert(gv.clone(), (func.clone(), ty));
        Ok(func)
    }

    fn global_type(&mut self, gv: &GlobalVar) -> Result<Type> {
        if let Some((_, ty)) = self.globals.get(gv) {
            return Ok(ty.clone());
        }
        if self.in_progress.contains(gv) {
            // recursive reference: only the written signature is known
            return Ok(self.lookup_global(gv)?.declared_type());
        }
        self.infer_global(gv)?;
        Ok(self
            .globals
            .get(gv)
            .map(|(_, ty)| ty.clone())
            .unwrap_or_default())
    }

    fn lookup_global(&self, gv: &GlobalVar) -> Result<Function> {
        let module = self.module.ok_or_else(|| Error::UnknownGlobal {
            name: gv.name().to_string(),
        })?;
        Ok(module.lookup(gv)?.clone())
    }

    fn infer_function(&mut self, func: &Function) -> Result<(Function, Type)> {
        let mut args = Vec::with_capacity(func.params().len());
        for p in func.params() {
            let ty = p.annotation().cloned().unwrap_or_default();
            self.env.insert(p.clone(), ty.clone());
            args.push(ty);
        }
        let body = self.infer(func.body())?;
        let ret = match func.ret_type() {
            Some(declared) => unify(declared, &body.ty())?,
            None => body.ty(),
        };
        let ty = Type::Func(FuncType {
            type_params: func.type_params().to_vec(),
            args,
            ret: Box::new(ret),
            constraints: vec![],
        });
        let func = Function::with_signature(
            func.params().to_vec(),
            body,
            func.ret_type().cloned(),
            func.type_params().to_vec(),
        );
        Ok((func, ty))
    }

    // Let chains are walked iteratively and rebuilt from the innermost body out.
    fn infer_let(&mut self, expr: &Expr) -> Result<Expr> {
        let mut bindings = Vec::new();
        let mut cur = expr;
        while let ExprKind::Let { var, value, body } = cur.kind() {
            let value = self.infer(value)?;
            let ty = match var.annotation() {
                Some(annotation) => unify(annotation, &value.ty())?,
                None => value.ty(),
            };
            trace!(var = %var, ty = %ty, "let");
            self.env.insert(var.clone(), ty);
            bindings.push((var.clone(), value));
            cur = body;
        }
        let mut body = self.infer(cur)?;
        while let Some((var, value)) = bindings.pop() {
            let ty = body.ty();
            body = Expr::with_checked_type(ExprKind::Let { var, value, body }, ty);
        }
        Ok(body)
    }

    fn call_type(&self, callee: &Expr, args: &[Expr]) -> Result<Type> {
        if let ExprKind::Op(op) = callee.kind() {
            return op_call_type(op, args);
        }
        match callee.ty() {
            Type::Incomplete => Ok(Type::Incomplete),
            // type parameters in the return type are left uninstantiated
            Type::Func(ft) => Ok(*ft.ret),
            other => Err(Error::NotCallable {
                kind: type_kind(&other),
            }),
        }
    }
}

fn op_call_type(op: &Op, args: &[Expr]) -> Result<Type> {
    let rules = op.type_rules();
    if rules.len() != 1 {
        return Err(Error::msg(format!(
            "operator {} must declare exactly one type rule, found {}",
            op.name(),
            rules.len()
        )));
    }
    if args.iter().any(|a| a.ty().is_incomplete()) {
        return Ok(Type::Incomplete);
    }
    let values = args
        .iter()
        .map(|a| match a.kind() {
            ExprKind::Constant(value) => value.clone(),
            _ => Value::from_type(&a.ty()),
        })
        .collect();
    let call = CallValues::new(Value::Op(op.clone()), op.convert_args(values)?, Device::default());
    rules[0].apply(&call)
}

fn type_kind(ty: &Type) -> &'static str {
    match ty {
        Type::Incomplete => "Incomplete",
        Type::Tensor(_) => "Tensor",
        Type::Tuple(_) => "Tuple",
        Type::Func(_) => "Func",
        Type::Ref(_) => "Ref",
        Type::Param(_) => "Param",
        Type::Constraint(_) => "Constraint",
    }
}
