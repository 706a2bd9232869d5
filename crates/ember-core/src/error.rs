use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur while evaluating or analysing ember IR.
///
/// Every variant is fatal to the call that produced it: evaluation and
/// inference stop immediately and no partial result is returned. The only
/// recoverable condition in the crate family (closures inside liveness
/// sensitive positions) is reported through `LivenessAnalyzer::is_success`
/// and never through this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A variable was referenced with no binding in scope or in the binding table.
    #[error("could not find variable binding for {name}")]
    UnboundVariable { name: String },

    /// A global function name is not present in the module.
    #[error("global `{name}` is not defined in the module")]
    UnknownGlobal { name: String },

    /// The callee of a call expression is neither a closure nor an operator.
    #[error("value of kind {kind} is not callable")]
    NotCallable { kind: &'static str },

    /// A value had a different variant than the operation requires.
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// Tuple projection outside of `0..size`.
    #[error("tuple index out of range: index {index}, size {size}")]
    IndexOutOfRange { index: i64, size: usize },

    /// Closure invoked with the wrong number of arguments.
    #[error("arity mismatch: function takes {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// No executable implementation registered for an operator on a device.
    #[error("cannot dispatch {op}@{device}")]
    NoImplementation { op: String, device: String },

    /// `de_tuple` reached a value that has no host representation.
    #[error("cannot de-tuple value of kind {kind}")]
    CannotDeTuple { kind: &'static str },

    /// Two types could not be unified.
    #[error("unable to unify `{lhs}` and `{rhs}`")]
    Unification { lhs: String, rhs: String },

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Tensor data was read before any memory was attached to it.
    #[error("tensor has no backing memory")]
    Unallocated,

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Referencing something that has no binding.
    Lookup,
    /// Calling, projecting or dispatching on a value of the wrong kind.
    Type,
    /// Incompatible types during inference.
    Unification,
    /// Everything else: layout, allocation and backend failures.
    Internal,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnboundVariable { .. } | Error::UnknownGlobal { .. } => ErrorKind::Lookup,
            Error::NotCallable { .. }
            | Error::TypeMismatch { .. }
            | Error::IndexOutOfRange { .. }
            | Error::ArityMismatch { .. }
            | Error::NoImplementation { .. }
            | Error::CannotDeTuple { .. } => ErrorKind::Type,
            Error::Unification { .. } => ErrorKind::Unification,
            Error::ShapeMismatch { .. }
            | Error::DTypeMismatch { .. }
            | Error::DimOutOfRange { .. }
            | Error::Unallocated
            | Error::Msg(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience Result type used throughout ember.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
