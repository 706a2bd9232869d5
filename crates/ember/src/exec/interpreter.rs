// Interpreter — tree-walking evaluator over the ANF IR
//
// One case per node kind. Arguments and tuple fields are evaluated strictly
// left to right; `If` evaluates exactly one branch. Scoping goes through the
// symbol table's guards, so every early `?` return restores the table.
//
// PRIMITIVE DISPATCH (invoke_primitive):
//
//   1. declare            output shape/dtype/device, before anything runs
//   2. allocate           memory for every output tensor that has none
//   3. resolve            an executable OpEnv from the dispatch registry
//   4. request            workspace, then streams, then communicators
//   5. execute
//   6. wait               on every acquired stream
//   7. free workspace     it only lives for one execution
//   8. pin                the OpEnv onto the output
//
// A declare step that marks the call `computed` ends dispatch after step 1.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ember_core::ir::{free_vars, Expr, ExprKind, Function, IrModule, Var};
use ember_core::op::{CallArgs, CallValues, Requests, Resources};
use ember_core::value::{ClosureValue, PinnedResource, RefValue};
use ember_core::{BindingEntry, Device, Error, Result, Value};
use tracing::{debug, trace};

use super::runtime::Runtime;
use super::symbol_table::{AddVar, SymbolTable};

/// Evaluation context: a runtime, the current module and a symbol table.
pub struct Interpreter {
    runtime: Runtime,
    module: RefCell<Option<IrModule>>,
    st: SymbolTable,
}

impl Interpreter {
    pub fn new(runtime: Runtime) -> Self {
        Interpreter {
            runtime,
            module: RefCell::new(None),
            st: SymbolTable::new(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Evaluate `expr` with `module` providing the globals.
    ///
    /// The module and symbol table are reset afterwards, whether or not
    /// evaluation succeeded.
    pub fn interpret(&self, expr: &Expr, module: Option<&IrModule>) -> Result<Value> {
        *self.module.borrow_mut() = module.cloned();
        let result = self.eval(expr);
        self.reset();
        result
    }

    /// Forget the current module and any leftover bindings.
    pub fn reset(&self) {
        self.module.borrow_mut().take();
        self.st.clear();
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr.kind() {
            ExprKind::Var(var) => self.lookup_var(var),
            ExprKind::GlobalVar(gv) => {
                let func = {
                    let module = self.module.borrow();
                    let module = module.as_ref().ok_or_else(|| Error::UnknownGlobal {
                        name: gv.name().to_string(),
                    })?;
                    module.lookup(gv)?.clone()
                };
                self.make_closure(&func)
            }
            // kept as the operator itself, not wrapped in a closure
            ExprKind::Op(op) => Ok(Value::Op(op.clone())),
            ExprKind::Function(func) => self.make_closure(func),
            ExprKind::Call { op, args } => self.eval_call(op, args),
            ExprKind::Constant(value) => Ok(value.clone()),
            ExprKind::Let { .. } => self.eval_let(expr),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval(cond)?.as_bool()? {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            ExprKind::Tuple(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.eval(field)?);
                }
                Ok(Value::tuple(values))
            }
            ExprKind::TupleGetItem { tuple, index } => self.eval(tuple)?.as_tuple()?.get(*index),
            ExprKind::RefCreate(value) => Ok(Value::Ref(RefValue::new(self.eval(value)?))),
            ExprKind::RefRead(reference) => Ok(self.eval(reference)?.as_ref_cell()?.get()),
            ExprKind::RefWrite { reference, value } => {
                let cell = self.eval(reference)?;
                let value = self.eval(value)?;
                cell.as_ref_cell()?.set(value);
                Ok(Value::unit())
            }
        }
    }

    fn lookup_var(&self, var: &Var) -> Result<Value> {
        if let Some(value) = self.st.find(var) {
            return Ok(value);
        }
        match self.runtime.bindings().lookup(var) {
            Some(BindingEntry::NDArray { value, .. }) => Ok(value),
            Some(BindingEntry::Symbol { expr }) => self.eval(&expr),
            None => Err(Error::UnboundVariable {
                name: var.to_string(),
            }),
        }
    }

    /// Capture exactly the function's free variables.
    fn make_closure(&self, func: &Function) -> Result<Value> {
        let mut env = HashMap::new();
        for var in free_vars(func) {
            let value = self.lookup_var(&var)?;
            env.insert(var, value);
        }
        Ok(Value::Closure(ClosureValue::new(func.clone(), env)))
    }

    // Let chains are walked iteratively; the guards unwind together.
    fn eval_let(&self, expr: &Expr) -> Result<Value> {
        let mut guards: Vec<AddVar<'_>> = Vec::new();
        let mut cur = expr;
        while let ExprKind::Let { var, value, body } = cur.kind() {
            let value = self.eval(value)?;
            guards.push(self.st.add_var(var, value));
            cur = body;
        }
        let result = self.eval(cur);
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        result
    }

    fn eval_call(&self, op: &Expr, args: &[Expr]) -> Result<Value> {
        let callee = self.eval(op)?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        let device = self.runtime.config().device;
        match &callee {
            Value::Closure(_) => {
                self.invoke_closure(CallValues::new(callee, CallArgs::List(values), device))
            }
            Value::Op(op) => {
                let args = op.convert_args(values)?;
                self.invoke_primitive(CallValues::new(callee.clone(), args, device))
            }
            other => Err(Error::NotCallable {
                kind: other.kind_name(),
            }),
        }
    }

    /// Apply a closure to its (already evaluated) arguments.
    pub fn invoke_closure(&self, call: CallValues) -> Result<Value> {
        let closure = call.callee.as_closure()?;
        let args = call.arg_list()?;
        let func = closure.func();
        if func.params().len() != args.len() {
            return Err(Error::ArityMismatch {
                expected: func.params().len(),
                got: args.len(),
            });
        }
        let mut frame: Vec<(Var, Value)> = func
            .params()
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        frame.extend(closure.env().iter().map(|(k, v)| (k.clone(), v.clone())));
        let _frame = self.st.local_frame(frame);
        self.eval(func.body())
    }

    /// Run an operator call through the eight dispatch steps.
    pub fn invoke_primitive(&self, mut call: CallValues) -> Result<Value> {
        let op = call.callee.as_op()?.clone();

        op.declare(&mut call)?;
        let out = call.output()?.clone();
        if call.computed {
            debug!(op = op.name(), "computed at declare");
            return Ok(out);
        }

        self.allocate_outputs(&out)?;

        let env = self.runtime.dispatch().resolve(&op, &call)?;
        let requests = env.requests();
        debug!(
            op = op.name(),
            device = %call.device,
            implementation = env.name(),
            workspace = requests.workspace.len(),
            streams = requests.stream.len(),
            distributed = requests.distributed,
            "invoke primitive"
        );
        let mut resources = self.fulfill(&requests, call.device)?;

        env.execute(&call, &resources)?;

        for stream in &resources.streams {
            stream.wait()?;
        }

        resources.workspace.clear();

        let pinned: PinnedResource = env;
        out.set_pinned_if_empty(&pinned);
        Ok(out)
    }

    fn allocate_outputs(&self, out: &Value) -> Result<()> {
        for tensor in out.tensors() {
            if tensor.is_allocated() {
                continue;
            }
            let nbytes = tensor.layout().compact_bytes(tensor.dtype());
            let memory = self.runtime.memory().alloc(tensor.device(), nbytes)?;
            tensor.set_memory(memory)?;
        }
        Ok(())
    }

    fn fulfill(&self, requests: &Requests, device: Device) -> Result<Resources> {
        let mut resources = Resources::default();
        for &nbytes in &requests.workspace {
            trace!(nbytes, "workspace");
            resources
                .workspace
                .push(self.runtime.memory().alloc(device, nbytes)?);
        }
        for req in &requests.stream {
            let tag = req.tag.unwrap_or(self.runtime.config().default_stream_tag);
            trace!(%tag, index = req.index, "stream");
            resources
                .streams
                .push(self.runtime.streams().acquire(device, tag, req.index)?);
        }
        for _ in 0..requests.distributed {
            trace!("communicator");
            resources.communicators.push(self.runtime.comms().current()?);
        }
        Ok(resources)
    }
}

// Thread-local entry points

thread_local! {
    static INTERPRETER: RefCell<Option<Rc<Interpreter>>> = const { RefCell::new(None) };
}

fn current() -> Rc<Interpreter> {
    INTERPRETER.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(|| Rc::new(Interpreter::new(Runtime::host())))
            .clone()
    })
}

/// Replace this thread's interpreter with one running on `runtime`.
pub fn set_thread_runtime(runtime: Runtime) {
    INTERPRETER.with(|slot| *slot.borrow_mut() = Some(Rc::new(Interpreter::new(runtime))));
}

/// Evaluate `expr` on this thread's interpreter.
pub fn interpret(expr: &Expr, module: Option<&IrModule>) -> Result<Value> {
    current().interpret(expr, module)
}

/// Dispatch an operator call on this thread's interpreter.
pub fn invoke_primitive(call: CallValues) -> Result<Value> {
    let interp = current();
    let result = interp.invoke_primitive(call);
    interp.reset();
    result
}

/// Apply a closure on this thread's interpreter.
pub fn invoke_closure(call: CallValues) -> Result<Value> {
    let interp = current();
    let result = interp.invoke_closure(call);
    interp.reset();
    result
}
