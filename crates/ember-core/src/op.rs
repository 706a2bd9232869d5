// Operators — definitions, calling convention and dispatch
//
// An operator is identified by its `OpDef`. The definition knows how to:
//
//   schema      — turn the raw argument list into a structured record
//   declare     — fix the output's shape/dtype/device before execution
//   type rules  — compute the output type from (reified) argument types
//   in-place    — which outputs must share storage with which arguments
//
// Executable implementations are registered separately in a
// `DispatchRegistry`, per (operator, device kind), with a priority. An
// implementation is an `OpEnv`: it declares the transient resources it needs
// and then executes against them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::comm::Communicator;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};
use crate::ir::{FuncType, Type, TypeConstraint};
use crate::memory::Memory;
use crate::stream::{Stream, StreamTag};
use crate::value::Value;

// Arguments

/// A structured, operator-specific argument record.
pub trait OpArgs: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Arguments of a call: raw (closures, schema-less ops) or converted.
#[derive(Debug, Clone)]
pub enum CallArgs {
    List(Vec<Value>),
    Schema(Arc<dyn OpArgs>),
}

/// Per-invocation record: callee, arguments, target device and output slot.
#[derive(Debug, Clone)]
pub struct CallValues {
    pub callee: Value,
    pub args: CallArgs,
    pub device: Device,
    pub out: Option<Value>,
    /// Set by `declare` when the output is already fully computed.
    pub computed: bool,
}

impl CallValues {
    pub fn new(callee: Value, args: CallArgs, device: Device) -> Self {
        CallValues {
            callee,
            args,
            device,
            out: None,
            computed: false,
        }
    }

    /// The raw argument list.
    pub fn arg_list(&self) -> Result<&[Value]> {
        match &self.args {
            CallArgs::List(values) => Ok(values),
            CallArgs::Schema(_) => Err(Error::TypeMismatch {
                expected: "argument list",
                got: "schema arguments",
            }),
        }
    }

    /// The structured argument record, downcast to `T`.
    pub fn args_as<T: OpArgs + 'static>(&self) -> Result<&T> {
        match &self.args {
            CallArgs::Schema(args) => args.as_any().downcast_ref::<T>().ok_or_else(|| {
                Error::msg(format!(
                    "unexpected argument record {:?} for {}",
                    args,
                    std::any::type_name::<T>()
                ))
            }),
            CallArgs::List(_) => Err(Error::TypeMismatch {
                expected: "schema arguments",
                got: "argument list",
            }),
        }
    }

    pub fn output(&self) -> Result<&Value> {
        self.out
            .as_ref()
            .ok_or_else(|| Error::msg("call has no declared output"))
    }
}

// Operator definitions

pub type SchemaFn = dyn Fn(&[Value]) -> Result<Arc<dyn OpArgs>> + Send + Sync;
pub type DeclareFn = dyn Fn(&mut CallValues) -> Result<()> + Send + Sync;

/// Everything known about an operator independent of any device.
pub struct OpDef {
    name: String,
    schema: Option<Box<SchemaFn>>,
    declare: Option<Box<DeclareFn>>,
    type_rules: Vec<TypeConstraint>,
    inplace: Vec<(usize, usize)>,
}

impl OpDef {
    pub fn new(name: impl Into<String>) -> Self {
        OpDef {
            name: name.into(),
            schema: None,
            declare: None,
            type_rules: Vec::new(),
            inplace: Vec::new(),
        }
    }

    pub fn with_schema(
        mut self,
        schema: impl Fn(&[Value]) -> Result<Arc<dyn OpArgs>> + Send + Sync + 'static,
    ) -> Self {
        self.schema = Some(Box::new(schema));
        self
    }

    pub fn with_declare(
        mut self,
        declare: impl Fn(&mut CallValues) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.declare = Some(Box::new(declare));
        self
    }

    pub fn with_type_rule(
        mut self,
        name: impl Into<String>,
        rule: impl Fn(&CallValues) -> Result<Type> + Send + Sync + 'static,
    ) -> Self {
        self.type_rules.push(TypeConstraint::new(name, rule));
        self
    }

    /// Output field `out` must live in the storage of argument `arg`.
    pub fn with_inplace(mut self, out: usize, arg: usize) -> Self {
        self.inplace.push((out, arg));
        self
    }
}

/// Shared handle to an operator definition. Compared by name.
#[derive(Clone)]
pub struct Op(Arc<OpDef>);

impl Op {
    pub fn new(def: OpDef) -> Self {
        Op(Arc::new(def))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn type_rules(&self) -> &[TypeConstraint] {
        &self.0.type_rules
    }

    pub fn inplace(&self) -> &[(usize, usize)] {
        &self.0.inplace
    }

    /// Convert raw arguments through the operator's schema, if it has one.
    pub fn convert_args(&self, args: Vec<Value>) -> Result<CallArgs> {
        match &self.0.schema {
            Some(schema) => Ok(CallArgs::Schema(schema(&args)?)),
            None => Ok(CallArgs::List(args)),
        }
    }

    /// Run the declare step: populate `call.out` (and maybe `call.device`).
    pub fn declare(&self, call: &mut CallValues) -> Result<()> {
        match &self.0.declare {
            Some(declare) => declare(call),
            None => Err(Error::msg(format!("operator {} has no declare step", self.name()))),
        }
    }

    /// The operator's type: opaque arguments, rules carried as constraints.
    pub fn func_type(&self) -> Type {
        Type::Func(FuncType {
            type_params: vec![],
            args: vec![],
            ret: Box::new(Type::Incomplete),
            constraints: self.0.type_rules.iter().cloned().map(Type::Constraint).collect(),
        })
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}

impl Eq for Op {}

impl std::hash::Hash for Op {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.name.hash(state)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op({})", self.0.name)
    }
}

/// Name → operator lookup.
#[derive(Default)]
pub struct OpRegistry {
    ops: RwLock<HashMap<String, Op>>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: OpDef) -> Op {
        let op = Op::new(def);
        self.ops.write().insert(op.name().to_string(), op.clone());
        op
    }

    pub fn get(&self, name: &str) -> Result<Op> {
        self.ops
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::msg(format!("operator {name} is not registered")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// Executable instances

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    /// `None` means the runtime's default tag.
    pub tag: Option<StreamTag>,
    pub index: usize,
}

/// Transient resources an `OpEnv` needs for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requests {
    /// Workspace sizes in bytes.
    pub workspace: Vec<usize>,
    pub stream: Vec<StreamRequest>,
    /// Number of communicator handles.
    pub distributed: usize,
}

/// Fulfilled requests, in request order.
#[derive(Default)]
pub struct Resources {
    pub workspace: Vec<Arc<Memory>>,
    pub streams: Vec<Arc<dyn Stream>>,
    pub communicators: Vec<Arc<dyn Communicator>>,
}

/// An executable operator instance resolved for one call signature.
///
/// After execution the instance is pinned onto the output value, so anything
/// it owns lives as long as the output does.
pub trait OpEnv: Send + Sync {
    fn name(&self) -> &str;

    fn requests(&self) -> Requests {
        Requests::default()
    }

    /// Compute `call.out`, whose memory is already allocated.
    fn execute(&self, call: &CallValues, resources: &Resources) -> Result<()>;
}

pub type EnvMaker = dyn Fn(&CallValues) -> Result<Option<Arc<dyn OpEnv>>> + Send + Sync;

struct Candidate {
    priority: i32,
    name: String,
    maker: Box<EnvMaker>,
}

/// (operator, device kind) → implementations, highest priority first.
#[derive(Default)]
pub struct DispatchRegistry {
    table: RwLock<HashMap<(String, DeviceKind), Vec<Candidate>>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation. A maker may return `None` to decline a
    /// particular call, letting lower-priority implementations try.
    pub fn register(
        &self,
        op: &str,
        device: DeviceKind,
        priority: i32,
        name: impl Into<String>,
        maker: impl Fn(&CallValues) -> Result<Option<Arc<dyn OpEnv>>> + Send + Sync + 'static,
    ) {
        let mut table = self.table.write();
        let list = table.entry((op.to_string(), device)).or_default();
        list.push(Candidate {
            priority,
            name: name.into(),
            maker: Box::new(maker),
        });
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Resolve an executable instance for `call`.
    pub fn resolve(&self, op: &Op, call: &CallValues) -> Result<Arc<dyn OpEnv>> {
        let table = self.table.read();
        if let Some(list) = table.get(&(op.name().to_string(), call.device.kind)) {
            for candidate in list {
                if let Some(env) = (candidate.maker)(call)? {
                    tracing::trace!(op = op.name(), implementation = %candidate.name, "resolved");
                    return Ok(env);
                }
            }
        }
        Err(Error::NoImplementation {
            op: op.name().to_string(),
            device: call.device.to_string(),
        })
    }

    /// Names of the implementations registered for `op` on `device`.
    pub fn implementations(&self, op: &str, device: DeviceKind) -> Vec<String> {
        self.table
            .read()
            .get(&(op.to_string(), device))
            .map(|l| l.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }
}
