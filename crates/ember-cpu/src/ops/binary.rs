use std::sync::Arc;

use ember_core::ir::{Dim, TensorType, Type};
use ember_core::op::{CallValues, DispatchRegistry, OpDef, OpEnv, Resources};
use ember_core::{DeviceKind, Error, Result, Shape, TensorValue, Value};
use rayon::prelude::*;

use super::args::BinaryArgs;
use super::HOST_PRIORITY;

pub(super) fn add_def() -> OpDef {
    OpDef::new("add")
        .with_schema(BinaryArgs::schema)
        .with_declare(declare_add)
        .with_type_rule("BroadcastRel", broadcast_rel)
}

pub(super) fn add_inplace_def() -> OpDef {
    OpDef::new("add_inplace")
        .with_schema(BinaryArgs::schema)
        .with_declare(declare_add_inplace)
        .with_type_rule("InplaceBroadcastRel", inplace_broadcast_rel)
        .with_inplace(0, 0)
}

fn operands(call: &CallValues) -> Result<(&TensorValue, &TensorValue)> {
    let args = call.args_as::<BinaryArgs>()?;
    let (x1, x2) = (args.x1.as_tensor()?, args.x2.as_tensor()?);
    if x1.dtype() != x2.dtype() {
        return Err(Error::DTypeMismatch {
            expected: x1.dtype(),
            got: x2.dtype(),
        });
    }
    Ok((x1, x2))
}

fn declare_add(call: &mut CallValues) -> Result<()> {
    let (x1, x2) = operands(call)?;
    let shape = Shape::broadcast_shape(x1.shape(), x2.shape())?;
    let device = x1.device();
    let out = TensorValue::empty(device, x1.dtype(), shape);
    call.device = device;
    call.out = Some(Value::Tensor(out));
    Ok(())
}

fn declare_add_inplace(call: &mut CallValues) -> Result<()> {
    let (x1, x2) = operands(call)?;
    let shape = Shape::broadcast_shape(x1.shape(), x2.shape())?;
    if &shape != x1.shape() {
        return Err(Error::ShapeMismatch {
            expected: x1.shape().clone(),
            got: shape,
        });
    }
    let device = x1.device();
    let out = Value::Tensor(x1.clone());
    call.device = device;
    call.out = Some(out);
    Ok(())
}

/// Broadcast two tensor types, aligned from the right.
///
/// A fixed 1 yields to the other side, equal dims are kept, and anything
/// undecidable (differing symbols, `Any`) becomes `Any`.
pub(super) fn broadcast_type(lhs: &TensorType, rhs: &TensorType) -> Result<TensorType> {
    let fail = || Error::Unification {
        lhs: lhs.to_string(),
        rhs: rhs.to_string(),
    };
    if lhs.dtype != rhs.dtype {
        return Err(fail());
    }
    let rank = lhs.rank().max(rhs.rank());
    let one = Dim::Fixed(1);
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let l = lhs.shape.iter().rev().nth(i).unwrap_or(&one);
        let r = rhs.shape.iter().rev().nth(i).unwrap_or(&one);
        let d = match (l, r) {
            _ if l == r => l.clone(),
            (Dim::Fixed(1), other) | (other, Dim::Fixed(1)) => other.clone(),
            (Dim::Fixed(_), Dim::Fixed(_)) => return Err(fail()),
            _ => Dim::Any,
        };
        dims.push(d);
    }
    dims.reverse();
    Ok(TensorType::new(dims, lhs.dtype))
}

fn broadcast_rel(call: &CallValues) -> Result<Type> {
    let args = call.args_as::<BinaryArgs>()?;
    let out = broadcast_type(&args.x1.tensor_type()?, &args.x2.tensor_type()?)?;
    Ok(Type::Tensor(out))
}

fn inplace_broadcast_rel(call: &CallValues) -> Result<Type> {
    let args = call.args_as::<BinaryArgs>()?;
    let x1 = args.x1.tensor_type()?;
    broadcast_type(&x1, &args.x2.tensor_type()?)?;
    Ok(Type::Tensor(x1))
}

/// Expand `data` (contiguous, `in_dims`) to `out_dims` by broadcasting.
pub(super) fn broadcast_gather(data: &[f64], in_dims: &[usize], out_dims: &[usize]) -> Vec<f64> {
    let n: usize = out_dims.iter().product();
    let offset = out_dims.len() - in_dims.len();
    let in_strides = Shape::from(in_dims).stride_contiguous();
    (0..n)
        .into_par_iter()
        .map(|mut lin| {
            let mut src = 0;
            for d in (0..out_dims.len()).rev() {
                let coord = lin % out_dims[d];
                lin /= out_dims[d];
                if d >= offset && in_dims[d - offset] != 1 {
                    src += coord * in_strides[d - offset];
                }
            }
            data[src]
        })
        .collect()
}

/// Serves both `add` and `add_inplace`: for the latter the output is `x1`.
struct AddEnv {
    name: &'static str,
}

impl OpEnv for AddEnv {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, call: &CallValues, _resources: &Resources) -> Result<()> {
        let (x1, x2) = operands(call)?;
        let out = call.output()?.as_tensor()?;
        let a = broadcast_gather(&x1.to_f64_vec()?, x1.dims(), out.dims());
        let b = broadcast_gather(&x2.to_f64_vec()?, x2.dims(), out.dims());
        let sum: Vec<f64> = a.par_iter().zip(b.par_iter()).map(|(x, y)| x + y).collect();
        out.write_f64(&sum)
    }
}

pub(super) fn install(dispatch: &DispatchRegistry) {
    dispatch.register("add", DeviceKind::Cpu, HOST_PRIORITY, "cpu.add", |_| {
        Ok(Some(Arc::new(AddEnv { name: "cpu.add" }) as Arc<dyn OpEnv>))
    });
    dispatch.register(
        "add_inplace",
        DeviceKind::Cpu,
        HOST_PRIORITY,
        "cpu.add_inplace",
        |_| Ok(Some(Arc::new(AddEnv { name: "cpu.add_inplace" }) as Arc<dyn OpEnv>)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ir::SymVar;
    use ember_core::DType;

    #[test]
    fn test_broadcast_gather() {
        // [[1], [2]] -> [[1, 1, 1], [2, 2, 2]]
        let out = broadcast_gather(&[1.0, 2.0], &[2, 1], &[2, 3]);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        let row = broadcast_gather(&[1.0, 2.0, 3.0], &[3], &[2, 3]);
        assert_eq!(row, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_broadcast_type() {
        let n = SymVar::new("n");
        let lhs = TensorType::new(vec![Dim::from(&n), Dim::Fixed(1)], DType::F32);
        let rhs = TensorType::fixed(&[4], DType::F32);
        let out = broadcast_type(&lhs, &rhs).unwrap();
        assert_eq!(out.shape, vec![Dim::from(&n), Dim::Fixed(4)]);

        let bad = TensorType::fixed(&[3], DType::F32);
        assert!(matches!(
            broadcast_type(&rhs, &bad),
            Err(Error::Unification { .. })
        ));
        let other_dtype = TensorType::fixed(&[4], DType::F64);
        assert!(broadcast_type(&rhs, &other_dtype).is_err());
    }
}
