//! # ember
//!
//! A tree-walking interpreter, type inference and liveness analysis for the
//! ember A-normal-form tensor IR.
//!
//! This is the top-level crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use ember::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `ember-core` | IR, types, values, binding table, operator and resource contracts |
//! | `ember-cpu` | Host memory/stream/communicator pools and reference operators |
//! | `ember` | Interpreter, type inference, liveness analysis |
//!
//! ## Modules
//!
//! - [`exec`] — Interpreter, runtime and symbol table
//! - [`pass`] — Type inference, unification, liveness analysis

/// Re-export core types.
pub use ember_core::{
    BindingEntry, BindingTable, DType, Device, DeviceKind, Error, ErrorKind, GradTape,
    HostObject, Layout, Result, Shape, TensorValue, TupleValue, Value, WithDType,
};

/// Re-export the IR.
pub mod ir {
    pub use ember_core::ir::*;
}

/// Re-export operator definitions and dispatch.
pub mod op {
    pub use ember_core::op::*;
}

/// Re-export the host operator set and pools.
pub mod cpu {
    pub use ember_cpu::*;
}

/// Interpreter — evaluates IR against a runtime.
pub mod exec;

/// Static passes — type inference and liveness analysis.
pub mod pass;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::exec::{interpret, Interpreter, Runtime, RuntimeConfig};
    pub use crate::ir::{Dim, Expr, Function, GlobalVar, IrModule, TensorType, Type, Var};
    pub use crate::pass::{infer_expr_type, infer_type, unify, LivenessAnalyzer};
    pub use crate::{BindingTable, DType, Device, Error, Result, TensorValue, Value};
}
