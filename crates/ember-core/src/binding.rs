// Binding table — registry of managed variables
//
// A managed variable is a `Var` created by the table itself and bound either
// to a concrete value (optionally with a gradient tape) or to a deferred
// expression. The interpreter falls back to this table when a variable is not
// in lexical scope.
//
// LIFETIME:
//
//   The table never keeps a variable alive. Each managed `Var` owns a release
//   guard holding a weak reference to the table; when the last handle to the
//   `Var` drops, the guard removes the entry. The removed entry is dropped
//   after the lock is released, because dropping it can release other managed
//   variables (e.g. a tape's gradient variable) which lock the table again.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::ir::{Expr, Var};
use crate::value::{ClosureValue, Value};

/// Reverse-mode bookkeeping attached to a concrete binding.
pub struct GradTape {
    /// Managed variable that accumulates the gradient.
    pub grad: Var,
    /// Closure computing this value's gradient contribution.
    pub backward: Option<ClosureValue>,
    /// Tapes of the values this one was computed from.
    pub prev_tapes: Vec<Arc<GradTape>>,
}

impl GradTape {
    pub fn new(grad: Var) -> Self {
        GradTape {
            grad,
            backward: None,
            prev_tapes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for GradTape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradTape")
            .field("grad", &self.grad)
            .field("has_backward", &self.backward.is_some())
            .field("prev_tapes", &self.prev_tapes.len())
            .finish()
    }
}

/// What a managed variable is bound to.
#[derive(Debug, Clone)]
pub enum BindingEntry {
    /// A concrete value.
    NDArray {
        value: Value,
        tape: Option<Arc<GradTape>>,
    },
    /// An unevaluated expression.
    Symbol { expr: Expr },
}

impl BindingEntry {
    pub fn kind_name(&self) -> &'static str {
        match self {
            BindingEntry::NDArray { .. } => "ndarray binding",
            BindingEntry::Symbol { .. } => "symbol binding",
        }
    }
}

struct TableInner {
    entries: Mutex<HashMap<u64, BindingEntry>>,
}

/// Removes a variable's entry from its table when dropped.
pub(crate) struct ReleaseGuard {
    table: Weak<TableInner>,
    id: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            // the guard on `entries` is released at the end of this statement
            let removed = table.entries.lock().remove(&self.id);
            trace!(var = self.id, found = removed.is_some(), "release binding");
            drop(removed);
        }
    }
}

/// Thread-safe registry of managed variables.
#[derive(Clone)]
pub struct BindingTable {
    inner: Arc<TableInner>,
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingTable {
    pub fn new() -> Self {
        BindingTable {
            inner: Arc::new(TableInner {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The process-wide table.
    pub fn global() -> &'static BindingTable {
        static GLOBAL: OnceLock<BindingTable> = OnceLock::new();
        GLOBAL.get_or_init(BindingTable::new)
    }

    fn bind(&self, entry: BindingEntry, name_hint: &str) -> Var {
        let id = Var::reserve_id();
        let guard = ReleaseGuard {
            table: Arc::downgrade(&self.inner),
            id,
        };
        let var = Var::managed(id, name_hint, guard);
        trace!(var = id, name = name_hint, kind = entry.kind_name(), "bind");
        self.inner.entries.lock().insert(id, entry);
        var
    }

    /// Bind a concrete value to a fresh managed variable.
    pub fn bind_ndarray(&self, value: Value, tape: Option<Arc<GradTape>>, name_hint: &str) -> Var {
        self.bind(BindingEntry::NDArray { value, tape }, name_hint)
    }

    /// Bind a deferred expression to a fresh managed variable.
    pub fn bind_symbol(&self, expr: Expr, name_hint: &str) -> Var {
        self.bind(BindingEntry::Symbol { expr }, name_hint)
    }

    /// The entry bound to `var`, if any.
    pub fn lookup(&self, var: &Var) -> Option<BindingEntry> {
        self.inner.entries.lock().get(&var.id()).cloned()
    }

    /// The concrete value bound to `var`.
    pub fn lookup_value(&self, var: &Var) -> Result<Value> {
        match self.lookup(var) {
            Some(BindingEntry::NDArray { value, .. }) => Ok(value),
            Some(other) => Err(Error::TypeMismatch {
                expected: "ndarray binding",
                got: other.kind_name(),
            }),
            None => Err(Error::UnboundVariable {
                name: var.to_string(),
            }),
        }
    }

    /// The gradient tape of a concrete binding.
    pub fn tape(&self, var: &Var) -> Result<Option<Arc<GradTape>>> {
        match self.lookup(var) {
            Some(BindingEntry::NDArray { tape, .. }) => Ok(tape),
            Some(other) => Err(Error::TypeMismatch {
                expected: "ndarray binding",
                got: other.kind_name(),
            }),
            None => Err(Error::UnboundVariable {
                name: var.to_string(),
            }),
        }
    }

    /// Attach (or detach) a gradient tape. Idempotent.
    ///
    /// A new tape gets a gradient variable named `d<name>` bound to `NoGrad`.
    pub fn set_requires_grad(&self, var: &Var, requires_grad: bool) -> Result<()> {
        let has_tape = self.tape(var)?.is_some();
        if requires_grad == has_tape {
            return Ok(());
        }
        if !requires_grad {
            let removed = match self.inner.entries.lock().get_mut(&var.id()) {
                Some(BindingEntry::NDArray { tape, .. }) => tape.take(),
                _ => None,
            };
            drop(removed);
            return Ok(());
        }
        // bind the gradient variable without holding the lock
        let grad = self.bind_ndarray(Value::NoGrad, None, &format!("d{}", var.name_hint()));
        let mut fresh = Some(Arc::new(GradTape::new(grad)));
        {
            let mut entries = self.inner.entries.lock();
            if let Some(BindingEntry::NDArray { tape, .. }) = entries.get_mut(&var.id()) {
                if tape.is_none() {
                    *tape = fresh.take();
                }
            }
        }
        // a racing caller attached a tape first; ours is discarded here
        drop(fresh);
        Ok(())
    }

    /// Number of live managed variables.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
