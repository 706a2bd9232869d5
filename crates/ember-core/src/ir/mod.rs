//! The intermediate representation: expressions, types and modules.
//!
//! Programs are written in A-normal form: every intermediate computation is
//! bound by a `Let`, so evaluation order is explicit in the let-chain.

mod expr;
mod module;
pub mod ty;
mod visit;

pub use expr::{Expr, ExprKind, ExprNode, Function, FunctionNode, GlobalVar, Var};
pub use module::IrModule;
pub use ty::{Dim, FuncType, SymVar, TensorType, Type, TypeConstraint, TypeVar};
pub use visit::{free_vars, ExplicitLetList};
