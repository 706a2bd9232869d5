// Expressions — the A-normal-form IR evaluated by the interpreter
//
// Every node is an immutable, reference-counted `Expr`. Passes never mutate a
// node in place: type inference builds an annotated copy through
// `Expr::with_checked_type`.
//
// Variables are compared by identity (a process-unique id), never by name.
// Two `Var`s with the same name hint are different variables.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::binding::ReleaseGuard;
use crate::ir::ty::{Type, TypeVar};
use crate::op::Op;
use crate::value::Value;

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

// Var

/// A local variable: let-bound, a function parameter, or a managed variable
/// created by the binding table.
#[derive(Clone)]
pub struct Var(Arc<VarNode>);

struct VarNode {
    id: u64,
    name_hint: Arc<str>,
    annotation: Option<Type>,
    // drops the binding-table entry together with the last handle
    _release: Option<ReleaseGuard>,
}

impl Var {
    pub fn new(name_hint: impl Into<Arc<str>>, annotation: Option<Type>) -> Self {
        Var(Arc::new(VarNode {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            name_hint: name_hint.into(),
            annotation,
            _release: None,
        }))
    }

    /// Allocate the id a managed variable will use, before its guard exists.
    pub(crate) fn reserve_id() -> u64 {
        NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn managed(id: u64, name_hint: &str, release: ReleaseGuard) -> Self {
        Var(Arc::new(VarNode {
            id,
            name_hint: name_hint.into(),
            annotation: None,
            _release: Some(release),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name_hint(&self) -> &str {
        &self.0.name_hint
    }

    pub fn annotation(&self) -> Option<&Type> {
        self.0.annotation.as_ref()
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Var {}

impl PartialOrd for Var {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Var {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl std::hash::Hash for Var {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}#{}", self.0.name_hint, self.0.id)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0.name_hint)
    }
}

/// A module-level function name. Compared by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalVar(Arc<str>);

impl GlobalVar {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        GlobalVar(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

// Function

/// A function literal: parameters, body and optional declared signature.
#[derive(Clone)]
pub struct Function(Arc<FunctionNode>);

pub struct FunctionNode {
    pub params: Vec<Var>,
    pub body: Expr,
    pub ret_type: Option<Type>,
    pub type_params: Vec<TypeVar>,
}

impl Function {
    pub fn new(params: Vec<Var>, body: Expr) -> Self {
        Function(Arc::new(FunctionNode {
            params,
            body,
            ret_type: None,
            type_params: vec![],
        }))
    }

    pub fn with_signature(
        params: Vec<Var>,
        body: Expr,
        ret_type: Option<Type>,
        type_params: Vec<TypeVar>,
    ) -> Self {
        Function(Arc::new(FunctionNode {
            params,
            body,
            ret_type,
            type_params,
        }))
    }

    pub fn params(&self) -> &[Var] {
        &self.0.params
    }

    pub fn body(&self) -> &Expr {
        &self.0.body
    }

    pub fn ret_type(&self) -> Option<&Type> {
        self.0.ret_type.as_ref()
    }

    pub fn type_params(&self) -> &[TypeVar] {
        &self.0.type_params
    }

    /// The signature as written: unannotated parts are `Incomplete`.
    pub fn declared_type(&self) -> Type {
        Type::Func(crate::ir::ty::FuncType {
            type_params: self.0.type_params.clone(),
            args: self
                .0
                .params
                .iter()
                .map(|p| p.annotation().cloned().unwrap_or_default())
                .collect(),
            ret: Box::new(self.0.ret_type.clone().unwrap_or_default()),
            constraints: vec![],
        })
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("params", &self.0.params)
            .field("ret_type", &self.0.ret_type)
            .finish_non_exhaustive()
    }
}

// Expr

#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

pub struct ExprNode {
    pub kind: ExprKind,
    pub checked_type: Option<Type>,
}

/// One case per IR node kind.
pub enum ExprKind {
    Var(Var),
    GlobalVar(GlobalVar),
    Op(Op),
    Function(Function),
    Call { op: Expr, args: Vec<Expr> },
    Constant(Value),
    Let { var: Var, value: Expr, body: Expr },
    If { cond: Expr, then_branch: Expr, else_branch: Expr },
    Tuple(Vec<Expr>),
    TupleGetItem { tuple: Expr, index: i64 },
    RefCreate(Expr),
    RefRead(Expr),
    RefWrite { reference: Expr, value: Expr },
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Var(_) => "Var",
            ExprKind::GlobalVar(_) => "GlobalVar",
            ExprKind::Op(_) => "Op",
            ExprKind::Function(_) => "Function",
            ExprKind::Call { .. } => "Call",
            ExprKind::Constant(_) => "Constant",
            ExprKind::Let { .. } => "Let",
            ExprKind::If { .. } => "If",
            ExprKind::Tuple(_) => "Tuple",
            ExprKind::TupleGetItem { .. } => "TupleGetItem",
            ExprKind::RefCreate(_) => "RefCreate",
            ExprKind::RefRead(_) => "RefRead",
            ExprKind::RefWrite { .. } => "RefWrite",
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Expr(Arc::new(ExprNode {
            kind,
            checked_type: None,
        }))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn checked_type(&self) -> Option<&Type> {
        self.0.checked_type.as_ref()
    }

    /// The checked type, or `Incomplete` for un-inferred nodes.
    pub fn ty(&self) -> Type {
        self.0.checked_type.clone().unwrap_or_default()
    }

    /// Same node kind, annotated with `ty`.
    pub fn with_checked_type(kind: ExprKind, ty: Type) -> Self {
        Expr(Arc::new(ExprNode {
            kind,
            checked_type: Some(ty),
        }))
    }

    pub fn as_var(&self) -> Option<&Var> {
        match &self.0.kind {
            ExprKind::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // Builders

    pub fn var(v: &Var) -> Self {
        Expr::new(ExprKind::Var(v.clone()))
    }

    pub fn global(gv: &GlobalVar) -> Self {
        Expr::new(ExprKind::GlobalVar(gv.clone()))
    }

    pub fn op(op: &Op) -> Self {
        Expr::new(ExprKind::Op(op.clone()))
    }

    pub fn func(f: Function) -> Self {
        Expr::new(ExprKind::Function(f))
    }

    pub fn call(op: Expr, args: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Call { op, args })
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::new(ExprKind::Constant(value.into()))
    }

    pub fn let_(var: &Var, value: Expr, body: Expr) -> Self {
        Expr::new(ExprKind::Let {
            var: var.clone(),
            value,
            body,
        })
    }

    pub fn if_(cond: Expr, then_branch: Expr, else_branch: Expr) -> Self {
        Expr::new(ExprKind::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    pub fn tuple(fields: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Tuple(fields))
    }

    pub fn tuple_get_item(tuple: Expr, index: i64) -> Self {
        Expr::new(ExprKind::TupleGetItem { tuple, index })
    }

    pub fn ref_create(value: Expr) -> Self {
        Expr::new(ExprKind::RefCreate(value))
    }

    pub fn ref_read(reference: Expr) -> Self {
        Expr::new(ExprKind::RefRead(reference))
    }

    pub fn ref_write(reference: Expr, value: Expr) -> Self {
        Expr::new(ExprKind::RefWrite { reference, value })
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        Expr::var(v)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            ExprKind::Var(v) => write!(f, "{v:?}"),
            ExprKind::GlobalVar(g) => write!(f, "{g}"),
            ExprKind::Op(op) => write!(f, "Op({})", op.name()),
            ExprKind::Call { op, args } => write!(f, "Call({op:?}, {args:?})"),
            ExprKind::Constant(v) => write!(f, "Constant({v:?})"),
            ExprKind::Tuple(fields) => write!(f, "Tuple({fields:?})"),
            ExprKind::TupleGetItem { tuple, index } => write!(f, "{tuple:?}.{index}"),
            other => write!(f, "{}(..)", other.name()),
        }
    }
}
