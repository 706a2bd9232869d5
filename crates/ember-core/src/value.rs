// Value — runtime values produced and consumed by the interpreter
//
// Values are cheap to clone: every heap-backed variant is a shared handle.
// Ownership is acyclic. The only back-reference is the pinned resource slot
// on tensors and tuples, which points at the operator environment that
// produced the value (never at another value).
//
// PINNED RESOURCES:
//
//   An operator environment may own memory that its output still refers to.
//   Pinning the environment onto the output keeps that memory alive for as
//   long as the output lives. The slot is written at most once; a value
//   extracted from a container inherits the container's resource if it has
//   none of its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::device::Device;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::ir::{Function, TensorType, Type, Var};
use crate::layout::Layout;
use crate::memory::Memory;
use crate::op::{Op, OpEnv};
use crate::shape::Shape;

/// Resource whose lifetime is extended to match a value's.
pub type PinnedResource = Arc<dyn OpEnv>;

// Tensor

/// A tensor: device, element type, layout and (once allocated) its memory.
#[derive(Clone)]
pub struct TensorValue(Arc<TensorInner>);

struct TensorInner {
    device: Device,
    dtype: DType,
    layout: Layout,
    data: OnceLock<Arc<Memory>>,
    pinned: OnceLock<PinnedResource>,
}

impl TensorValue {
    /// A contiguous tensor with no memory attached yet.
    pub fn empty(device: Device, dtype: DType, shape: impl Into<Shape>) -> Self {
        TensorValue(Arc::new(TensorInner {
            device,
            dtype,
            layout: Layout::contiguous(shape.into()),
            data: OnceLock::new(),
            pinned: OnceLock::new(),
        }))
    }

    /// A tensor backed by existing memory.
    pub fn from_memory(dtype: DType, layout: Layout, memory: Arc<Memory>) -> Self {
        let data = OnceLock::new();
        let device = memory.device();
        let _ = data.set(memory);
        TensorValue(Arc::new(TensorInner {
            device,
            dtype,
            layout,
            data,
            pinned: OnceLock::new(),
        }))
    }

    /// Host tensor filled from `f64` data, converted to `dtype`.
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != data.len() {
            return Err(Error::msg(format!(
                "{} elements cannot fill shape {}",
                data.len(),
                shape
            )));
        }
        let width = dtype.size_in_bytes();
        let mut bytes = vec![0u8; data.len() * width];
        for (chunk, &v) in bytes.chunks_exact_mut(width).zip(data) {
            dtype.write_f64(chunk, v);
        }
        let memory = Arc::new(Memory::new(Device::cpu(), bytes));
        Ok(TensorValue::from_memory(dtype, Layout::contiguous(shape), memory))
    }

    /// Host tensor from typed data.
    pub fn from_slice<T: WithDType>(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        let as_f64: Vec<f64> = data.iter().map(|&v| WithDType::to_f64(v)).collect();
        Self::from_f64_slice(&as_f64, shape, T::DTYPE)
    }

    pub fn device(&self) -> Device {
        self.0.device
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn layout(&self) -> &Layout {
        &self.0.layout
    }

    pub fn shape(&self) -> &Shape {
        self.0.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.0.layout.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.0.layout.elem_count()
    }

    pub fn is_allocated(&self) -> bool {
        self.0.data.get().is_some()
    }

    pub fn memory(&self) -> Option<&Arc<Memory>> {
        self.0.data.get()
    }

    /// Attach backing memory. Fails if the tensor already has some.
    pub fn set_memory(&self, memory: Arc<Memory>) -> Result<()> {
        self.0
            .data
            .set(memory)
            .map_err(|_| Error::msg("tensor memory is already attached"))
    }

    pub fn pinned(&self) -> Option<&PinnedResource> {
        self.0.pinned.get()
    }

    /// Pin `resource` unless something is already pinned.
    pub fn set_pinned_if_empty(&self, resource: &PinnedResource) {
        let _ = self.0.pinned.set(resource.clone());
    }

    /// Elements in logical order, converted to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let memory = self.memory().ok_or(Error::Unallocated)?;
        let bytes = memory.read();
        let width = self.dtype().size_in_bytes();
        self.layout()
            .strided_indices()
            .map(|i| {
                let start = i * width;
                bytes
                    .get(start..start + width)
                    .map(|b| self.dtype().read_f64(b))
                    .ok_or_else(|| Error::msg("tensor layout exceeds its memory"))
            })
            .collect()
    }

    /// Overwrite every element (logical order) from `data`.
    pub fn write_f64(&self, data: &[f64]) -> Result<()> {
        if data.len() != self.elem_count() {
            return Err(Error::msg(format!(
                "cannot write {} elements into tensor of shape {}",
                data.len(),
                self.shape()
            )));
        }
        let memory = self.memory().ok_or(Error::Unallocated)?;
        let mut bytes = memory.write();
        let width = self.dtype().size_in_bytes();
        for (i, &v) in self.layout().strided_indices().zip(data) {
            let start = i * width;
            let slot = bytes
                .get_mut(start..start + width)
                .ok_or_else(|| Error::msg("tensor layout exceeds its memory"))?;
            self.dtype().write_f64(slot, v);
        }
        Ok(())
    }

    /// Fully fixed tensor type of this tensor.
    pub fn tensor_type(&self) -> TensorType {
        TensorType::fixed(self.dims(), self.dtype())
    }

    pub fn ptr_eq(&self, other: &TensorValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, {}, {}{})",
            self.shape(),
            self.dtype(),
            self.device(),
            if self.is_allocated() { "" } else { ", unallocated" }
        )
    }
}

// Tuple

#[derive(Clone)]
pub struct TupleValue(Arc<TupleInner>);

struct TupleInner {
    fields: Vec<Value>,
    pinned: OnceLock<PinnedResource>,
}

impl TupleValue {
    pub fn new(fields: Vec<Value>) -> Self {
        TupleValue(Arc::new(TupleInner {
            fields,
            pinned: OnceLock::new(),
        }))
    }

    pub fn fields(&self) -> &[Value] {
        &self.0.fields
    }

    pub fn len(&self) -> usize {
        self.0.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.fields.is_empty()
    }

    pub fn pinned(&self) -> Option<&PinnedResource> {
        self.0.pinned.get()
    }

    pub fn set_pinned_if_empty(&self, resource: &PinnedResource) {
        let _ = self.0.pinned.set(resource.clone());
    }

    /// Field `index`, inheriting this tuple's pinned resource.
    pub fn get(&self, index: i64) -> Result<Value> {
        let size = self.len();
        if index < 0 || index as usize >= size {
            return Err(Error::IndexOutOfRange { index, size });
        }
        let field = self.0.fields[index as usize].clone();
        if let Some(p) = self.pinned() {
            field.set_pinned_if_empty(p);
        }
        Ok(field)
    }
}

// Closure

/// A function together with the values of its free variables.
#[derive(Clone)]
pub struct ClosureValue(Arc<ClosureInner>);

struct ClosureInner {
    func: Function,
    env: HashMap<Var, Value>,
}

impl ClosureValue {
    pub fn new(func: Function, env: HashMap<Var, Value>) -> Self {
        ClosureValue(Arc::new(ClosureInner { func, env }))
    }

    pub fn func(&self) -> &Function {
        &self.0.func
    }

    pub fn env(&self) -> &HashMap<Var, Value> {
        &self.0.env
    }
}

// Ref

/// A single mutable cell.
#[derive(Clone)]
pub struct RefValue(Arc<RwLock<Value>>);

impl RefValue {
    pub fn new(value: Value) -> Self {
        RefValue(Arc::new(RwLock::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.read().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.write() = value;
    }

    pub fn ptr_eq(&self, other: &RefValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// Scalars

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntValue {
    pub dtype: DType,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatValue {
    pub dtype: DType,
    pub value: f64,
}

// Value

#[derive(Clone)]
pub enum Value {
    Tensor(TensorValue),
    Tuple(TupleValue),
    Closure(ClosureValue),
    Ref(RefValue),
    Int(IntValue),
    Float(FloatValue),
    Bool(bool),
    Str(Arc<str>),
    Op(Op),
    Void,
    NoGrad,
    TensorType(TensorType),
}

impl Value {
    pub fn int(value: i64) -> Self {
        Value::Int(IntValue {
            dtype: DType::I64,
            value,
        })
    }

    pub fn float(value: f64) -> Self {
        Value::Float(FloatValue {
            dtype: DType::F64,
            value,
        })
    }

    pub fn tuple(fields: Vec<Value>) -> Self {
        Value::Tuple(TupleValue::new(fields))
    }

    /// The empty tuple.
    pub fn unit() -> Self {
        Value::tuple(vec![])
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "Tensor",
            Value::Tuple(_) => "Tuple",
            Value::Closure(_) => "Closure",
            Value::Ref(_) => "Ref",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::Str(_) => "String",
            Value::Op(_) => "Op",
            Value::Void => "Void",
            Value::NoGrad => "NoGrad",
            Value::TensorType(_) => "TensorType",
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::TypeMismatch {
            expected,
            got: self.kind_name(),
        }
    }

    pub fn as_tensor(&self) -> Result<&TensorValue> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(other.mismatch("Tensor")),
        }
    }

    pub fn as_tuple(&self) -> Result<&TupleValue> {
        match self {
            Value::Tuple(t) => Ok(t),
            other => Err(other.mismatch("Tuple")),
        }
    }

    pub fn as_closure(&self) -> Result<&ClosureValue> {
        match self {
            Value::Closure(c) => Ok(c),
            other => Err(other.mismatch("Closure")),
        }
    }

    pub fn as_ref_cell(&self) -> Result<&RefValue> {
        match self {
            Value::Ref(r) => Ok(r),
            other => Err(other.mismatch("Ref")),
        }
    }

    pub fn as_op(&self) -> Result<&Op> {
        match self {
            Value::Op(op) => Ok(op),
            other => Err(other.mismatch("Op")),
        }
    }

    /// Boolean scalar data: a `Bool`, or a rank-0 bool tensor.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Tensor(t) if t.dtype() == DType::Bool && t.elem_count() == 1 => {
                Ok(t.to_f64_vec()?[0] != 0.0)
            }
            other => Err(other.mismatch("Bool")),
        }
    }

    /// Numeric scalar data from a scalar or a single-element tensor.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(i.value as f64),
            Value::Float(f) => Ok(f.value),
            Value::Bool(b) => Ok(*b as u8 as f64),
            Value::Tensor(t) if t.elem_count() == 1 => Ok(t.to_f64_vec()?[0]),
            other => Err(other.mismatch("scalar")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(i.value),
            Value::Bool(b) => Ok(*b as i64),
            Value::Tensor(t) if t.elem_count() == 1 && !t.dtype().is_float() => {
                Ok(t.to_f64_vec()?[0] as i64)
            }
            other => Err(other.mismatch("Int")),
        }
    }

    pub fn pinned(&self) -> Option<&PinnedResource> {
        match self {
            Value::Tensor(t) => t.pinned(),
            Value::Tuple(t) => t.pinned(),
            _ => None,
        }
    }

    /// Pin `resource` on tensors and tuples that have nothing pinned yet.
    pub fn set_pinned_if_empty(&self, resource: &PinnedResource) {
        match self {
            Value::Tensor(t) => t.set_pinned_if_empty(resource),
            Value::Tuple(t) => t.set_pinned_if_empty(resource),
            _ => {}
        }
    }

    /// Every tensor reachable through tuples, in field order.
    pub fn tensors(&self) -> Vec<TensorValue> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors(&self, out: &mut Vec<TensorValue>) {
        match self {
            Value::Tensor(t) => out.push(t.clone()),
            Value::Tuple(t) => t.fields().iter().for_each(|f| f.collect_tensors(out)),
            _ => {}
        }
    }

    /// Static type of this value.
    ///
    /// Scalars are typed as rank-0 tensors of their dtype so that constants
    /// and computed values share one type language.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Tensor(t) => Type::Tensor(t.tensor_type()),
            Value::Int(i) => Type::Tensor(TensorType::scalar(i.dtype)),
            Value::Float(f) => Type::Tensor(TensorType::scalar(f.dtype)),
            Value::Bool(_) => Type::Tensor(TensorType::scalar(DType::Bool)),
            Value::Tuple(t) => Type::Tuple(t.fields().iter().map(Value::type_of).collect()),
            Value::TensorType(tt) => Type::Tensor(tt.clone()),
            Value::Closure(c) => c.func().declared_type(),
            Value::Op(op) => op.func_type(),
            Value::Ref(r) => Type::Ref(Box::new(r.get().type_of())),
            Value::Void => Type::unit(),
            Value::Str(_) | Value::NoGrad => Type::Incomplete,
        }
    }

    /// The tensor type of a tensor, scalar or reified tensor type.
    ///
    /// Type rules use this to treat concrete arguments and type-only
    /// arguments uniformly.
    pub fn tensor_type(&self) -> Result<TensorType> {
        match self.type_of() {
            Type::Tensor(tt) => Ok(tt),
            _ => Err(self.mismatch("Tensor")),
        }
    }

    /// Reify a type as a value (tensor types become `TensorType` values).
    pub fn from_type(ty: &Type) -> Value {
        match ty {
            Type::Tensor(tt) => Value::TensorType(tt.clone()),
            Type::Tuple(fields) => Value::tuple(fields.iter().map(Value::from_type).collect()),
            _ => Value::Void,
        }
    }

    /// Convert into the nested host-facing form.
    ///
    /// Tensors, scalars and `NoGrad` pass through; tuples become lists whose
    /// fields inherit the tuple's pinned resource. Anything else has no host
    /// form.
    pub fn de_tuple(&self) -> Result<HostObject> {
        match self {
            Value::Tensor(t) => Ok(HostObject::Tensor(t.clone())),
            Value::Int(i) => Ok(HostObject::Int(i.value)),
            Value::Float(f) => Ok(HostObject::Float(f.value)),
            Value::Bool(b) => Ok(HostObject::Bool(*b)),
            Value::NoGrad => Ok(HostObject::NoGrad),
            Value::Tuple(t) => {
                let mut out = Vec::with_capacity(t.len());
                for i in 0..t.len() {
                    out.push(t.get(i as i64)?.de_tuple()?);
                }
                Ok(HostObject::List(out))
            }
            other => Err(Error::CannotDeTuple {
                kind: other.kind_name(),
            }),
        }
    }
}

/// Host-facing view of a value produced by [`Value::de_tuple`].
#[derive(Debug, Clone)]
pub enum HostObject {
    Tensor(TensorValue),
    Int(i64),
    Float(f64),
    Bool(bool),
    NoGrad,
    List(Vec<HostObject>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(t) => write!(f, "{t:?}"),
            Value::Tuple(t) => f.debug_tuple("").field(&t.fields()).finish(),
            Value::Closure(c) => write!(f, "Closure({:?})", c.func().params()),
            Value::Ref(r) => write!(f, "Ref({:?})", r.get()),
            Value::Int(i) => write!(f, "{}{}", i.value, i.dtype),
            Value::Float(x) => write!(f, "{}{}", x.value, x.dtype),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Op(op) => write!(f, "Op({})", op.name()),
            Value::Void => write!(f, "Void"),
            Value::NoGrad => write!(f, "NoGrad"),
            Value::TensorType(tt) => write!(f, "{tt}"),
        }
    }
}

/// Structural equality: tensors compare by dtype, shape and contents;
/// closures and refs by identity of what they wrap.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => {
                a.ptr_eq(b)
                    || (a.dtype() == b.dtype()
                        && a.shape() == b.shape()
                        && matches!((a.to_f64_vec(), b.to_f64_vec()), (Ok(x), Ok(y)) if x == y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => a.fields() == b.fields(),
            (Value::Closure(a), Value::Closure(b)) => {
                a.func().ptr_eq(b.func()) && a.env() == b.env()
            }
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Op(a), Value::Op(b)) => a == b,
            (Value::Void, Value::Void) | (Value::NoGrad, Value::NoGrad) => true,
            (Value::TensorType(a), Value::TensorType(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.into())
    }
}

impl From<TensorValue> for Value {
    fn from(t: TensorValue) -> Self {
        Value::Tensor(t)
    }
}

impl From<TensorType> for Value {
    fn from(tt: TensorType) -> Self {
        Value::TensorType(tt)
    }
}

impl From<Op> for Value {
    fn from(op: Op) -> Self {
        Value::Op(op)
    }
}
