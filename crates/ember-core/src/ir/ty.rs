// Types — the static type language of the IR
//
// Tensor types carry dependent shape information: each dimension is either a
// fixed extent, a symbolic variable that stands for one unknown extent, or
// `Any` (no information at all). Two symbolic dimensions denote the same
// extent only if they are the very same `SymVar`.
//
// `Incomplete` means "not determined yet". It is absorbed by unification and
// propagated upward by inference.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::Result;
use crate::op::CallValues;

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed)
}

// Dimensions

/// A symbolic shape dimension. Identity is the object, not the name.
#[derive(Clone)]
pub struct SymVar {
    id: u64,
    name: Arc<str>,
}

impl SymVar {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        SymVar {
            id: next_id(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for SymVar {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SymVar {}

impl std::hash::Hash for SymVar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for SymVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}#{}", self.name, self.id)
    }
}

/// One dimension of a tensor type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(usize),
    Symbolic(SymVar),
    Any,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Symbolic(s) => write!(f, "?{}", s.name()),
            Dim::Any => write!(f, "?"),
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Fixed(n)
    }
}

impl From<&SymVar> for Dim {
    fn from(s: &SymVar) -> Self {
        Dim::Symbolic(s.clone())
    }
}

// Tensor and function types

/// Shape + element type of a tensor. Rank 0 doubles as the type of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Vec<Dim>,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: Vec<Dim>, dtype: DType) -> Self {
        TensorType { shape, dtype }
    }

    /// Tensor type whose dimensions are all fixed.
    pub fn fixed(dims: &[usize], dtype: DType) -> Self {
        TensorType {
            shape: dims.iter().map(|&d| Dim::Fixed(d)).collect(),
            dtype,
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        TensorType {
            shape: vec![],
            dtype,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor[(")?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "), {}]", self.dtype)
    }
}

/// A type parameter of a polymorphic function.
#[derive(Clone)]
pub struct TypeVar {
    id: u64,
    name: Arc<str>,
}

impl TypeVar {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        TypeVar {
            id: next_id(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for TypeVar {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeVar {}

impl std::hash::Hash for TypeVar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for TypeVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Signature of a type rule: computes an operator's output type from its
/// (schema-converted) arguments, which are values or reified types.
pub type TypeRuleFn = dyn Fn(&CallValues) -> Result<Type> + Send + Sync;

/// A named type-inference rule attached to an operator's function type.
///
/// Two constraints are equal only if they are the same rule object.
#[derive(Clone)]
pub struct TypeConstraint(Arc<ConstraintNode>);

struct ConstraintNode {
    name: String,
    rule: Box<TypeRuleFn>,
}

impl TypeConstraint {
    pub fn new(
        name: impl Into<String>,
        rule: impl Fn(&CallValues) -> Result<Type> + Send + Sync + 'static,
    ) -> Self {
        TypeConstraint(Arc::new(ConstraintNode {
            name: name.into(),
            rule: Box::new(rule),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Run the rule.
    pub fn apply(&self, call: &CallValues) -> Result<Type> {
        (self.0.rule)(call)
    }
}

impl PartialEq for TypeConstraint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeConstraint {}

impl fmt::Debug for TypeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeConstraint({})", self.0.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub type_params: Vec<TypeVar>,
    pub args: Vec<Type>,
    pub ret: Box<Type>,
    pub constraints: Vec<Type>,
}

impl FuncType {
    pub fn new(args: Vec<Type>, ret: Type) -> Self {
        FuncType {
            type_params: vec![],
            args,
            ret: Box::new(ret),
            constraints: vec![],
        }
    }
}

// Type

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Type {
    #[default]
    Incomplete,
    Tensor(TensorType),
    Tuple(Vec<Type>),
    Func(FuncType),
    Ref(Box<Type>),
    Param(TypeVar),
    Constraint(TypeConstraint),
}

impl Type {
    pub fn unit() -> Self {
        Type::Tuple(vec![])
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Type::Incomplete)
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Replace type parameters according to `map`.
    pub fn substitute(&self, map: &HashMap<TypeVar, Type>) -> Type {
        match self {
            Type::Param(tv) => map.get(tv).cloned().unwrap_or_else(|| self.clone()),
            Type::Tuple(fields) => Type::Tuple(fields.iter().map(|t| t.substitute(map)).collect()),
            Type::Ref(inner) => Type::Ref(Box::new(inner.substitute(map))),
            Type::Func(ft) => {
                // parameters bound by this function shadow the substitution
                let inner: HashMap<TypeVar, Type> = map
                    .iter()
                    .filter(|(k, _)| !ft.type_params.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Type::Func(FuncType {
                    type_params: ft.type_params.clone(),
                    args: ft.args.iter().map(|t| t.substitute(&inner)).collect(),
                    ret: Box::new(ft.ret.substitute(&inner)),
                    constraints: ft.constraints.iter().map(|t| t.substitute(&inner)).collect(),
                })
            }
            Type::Incomplete | Type::Tensor(_) | Type::Constraint(_) => self.clone(),
        }
    }
}

impl From<TensorType> for Type {
    fn from(t: TensorType) -> Self {
        Type::Tensor(t)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Incomplete => write!(f, "?"),
            Type::Tensor(t) => write!(f, "{t}"),
            Type::Tuple(fields) => {
                write!(f, "(")?;
                for (i, t) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                if fields.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Type::Func(ft) => {
                write!(f, "fn")?;
                if !ft.type_params.is_empty() {
                    let names: Vec<&str> = ft.type_params.iter().map(TypeVar::name).collect();
                    write!(f, "<{}>", names.join(", "))?;
                }
                write!(f, "(")?;
                for (i, t) in ft.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ") -> {}", ft.ret)?;
                if !ft.constraints.is_empty() {
                    let names: Vec<String> = ft.constraints.iter().map(|c| c.to_string()).collect();
                    write!(f, " where {}", names.join(", "))?;
                }
                Ok(())
            }
            Type::Ref(inner) => write!(f, "ref({inner})"),
            Type::Param(tv) => write!(f, "{}", tv.name()),
            Type::Constraint(c) => write!(f, "{}", c.name()),
        }
    }
}
