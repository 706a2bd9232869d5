// Passes — static analyses over ember IR
//
//   type_infer  — bottom-up type annotation with incomplete-type propagation
//   unify       — structural unification over shape-carrying types
//   liveness    — per-tensor liveness and mandatory sharing for memory planning

pub mod liveness;
pub mod type_infer;
pub mod unify;

pub use liveness::LivenessAnalyzer;
pub use type_infer::{infer_expr_type, infer_type, TypeInferencer};
pub use unify::unify;
