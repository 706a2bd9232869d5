// Symbol table — lexical scoping for the interpreter
//
// Each variable maps to a stack of values; the top is the binding in scope.
// Scopes are opened through guards that pop exactly what they pushed when
// dropped, so an early return through `?` leaves the table as it was.
//
//   AddVar      — one binding (a `Let`)
//   LocalFrame  — many bindings at once (a closure call's params + captures)

use std::cell::RefCell;
use std::collections::HashMap;

use ember_core::ir::Var;
use ember_core::Value;
use tracing::trace;

#[derive(Default)]
pub struct SymbolTable {
    table: RefCell<HashMap<Var, Vec<Value>>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `var` to `value` until the returned guard drops.
    #[must_use = "the binding is removed when the guard drops"]
    pub fn add_var(&self, var: &Var, value: Value) -> AddVar<'_> {
        self.push(var, value);
        AddVar {
            st: self,
            var: var.clone(),
        }
    }

    /// Bind every `(var, value)` pair until the returned guard drops.
    #[must_use = "the frame is removed when the guard drops"]
    pub fn local_frame(&self, frame: Vec<(Var, Value)>) -> LocalFrame<'_> {
        trace!(size = frame.len(), "push frame");
        let mut vars = Vec::with_capacity(frame.len());
        for (var, value) in frame {
            self.push(&var, value);
            vars.push(var);
        }
        LocalFrame { st: self, vars }
    }

    /// The innermost binding of `var`.
    pub fn find(&self, var: &Var) -> Option<Value> {
        self.table
            .borrow()
            .get(var)
            .and_then(|stack| stack.last().cloned())
    }

    /// How many bindings of `var` are stacked.
    pub fn depth(&self, var: &Var) -> usize {
        self.table.borrow().get(var).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.table.borrow_mut().clear();
    }

    fn push(&self, var: &Var, value: Value) {
        self.table
            .borrow_mut()
            .entry(var.clone())
            .or_default()
            .push(value);
    }

    fn pop(&self, var: &Var) {
        let mut table = self.table.borrow_mut();
        if let Some(stack) = table.get_mut(var) {
            stack.pop();
            if stack.is_empty() {
                table.remove(var);
            }
        }
    }
}

pub struct AddVar<'a> {
    st: &'a SymbolTable,
    var: Var,
}

impl Drop for AddVar<'_> {
    fn drop(&mut self) {
        self.st.pop(&self.var);
    }
}

pub struct LocalFrame<'a> {
    st: &'a SymbolTable,
    vars: Vec<Var>,
}

impl Drop for LocalFrame<'_> {
    fn drop(&mut self) {
        for var in self.vars.iter().rev() {
            self.st.pop(var);
        }
        trace!(size = self.vars.len(), "pop frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadowing_restores_outer() {
        let st = SymbolTable::new();
        let x = Var::new("x", None);
        let _outer = st.add_var(&x, Value::int(1));
        {
            let _inner = st.add_var(&x, Value::int(2));
            assert_eq!(st.find(&x), Some(Value::int(2)));
            assert_eq!(st.depth(&x), 2);
        }
        assert_eq!(st.find(&x), Some(Value::int(1)));
    }

    #[test]
    fn test_frame_pops_everything() {
        let st = SymbolTable::new();
        let a = Var::new("a", None);
        let b = Var::new("b", None);
        {
            let _frame = st.local_frame(vec![(a.clone(), Value::int(1)), (b.clone(), Value::int(2))]);
            assert_eq!(st.find(&b), Some(Value::int(2)));
        }
        assert!(st.is_empty());
        assert_eq!(st.find(&a), None);
    }

    #[test]
    fn test_guard_pops_on_early_exit() {
        fn fails(st: &SymbolTable, x: &Var) -> Result<(), ()> {
            let _g = st.add_var(x, Value::Void);
            Err(())
        }
        let st = SymbolTable::new();
        let x = Var::new("x", None);
        assert!(fails(&st, &x).is_err());
        assert!(st.is_empty());
    }
}
