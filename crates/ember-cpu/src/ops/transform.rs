use std::sync::Arc;

use ember_core::ir::{Dim, TensorType, Type};
use ember_core::op::{CallValues, DispatchRegistry, OpDef, OpEnv, Resources};
use ember_core::{DType, DeviceKind, Error, Result, TensorValue, Value};

use super::args::{SplitArgs, UnaryArgs};
use super::HOST_PRIORITY;

pub(super) fn split_def() -> OpDef {
    OpDef::new("split")
        .with_schema(SplitArgs::schema)
        .with_declare(declare_split)
        .with_type_rule("SplitRel", split_rel)
}

pub(super) fn shape_def() -> OpDef {
    OpDef::new("shape")
        .with_schema(UnaryArgs::schema)
        .with_declare(declare_shape)
        .with_type_rule("ShapeRel", shape_rel)
}

// split: equal sections along axis 0

fn section_rows(rows: usize, sections: usize) -> Result<usize> {
    if rows % sections != 0 {
        return Err(Error::msg(format!(
            "split: axis 0 of size {rows} is not divisible into {sections} sections"
        )));
    }
    Ok(rows / sections)
}

fn declare_split(call: &mut CallValues) -> Result<()> {
    let args = call.args_as::<SplitArgs>()?;
    let x = args.x.as_tensor()?.clone();
    let sections = args.sections()?;
    let mut dims = x.dims().to_vec();
    let rows = dims.first().copied().ok_or(Error::DimOutOfRange { dim: 0, rank: 0 })?;
    dims[0] = section_rows(rows, sections)?;
    let fields = (0..sections)
        .map(|_| Value::Tensor(TensorValue::empty(x.device(), x.dtype(), dims.clone())))
        .collect();
    call.device = x.device();
    call.out = Some(Value::tuple(fields));
    Ok(())
}

fn split_rel(call: &CallValues) -> Result<Type> {
    let args = call.args_as::<SplitArgs>()?;
    let x = args.x.tensor_type()?;
    let sections = args.sections()?;
    let mut shape = x.shape.clone();
    let rows = match shape.first() {
        Some(Dim::Fixed(rows)) => Dim::Fixed(section_rows(*rows, sections)?),
        Some(_) => Dim::Any,
        None => return Err(Error::DimOutOfRange { dim: 0, rank: 0 }),
    };
    shape[0] = rows;
    let field = Type::Tensor(TensorType::new(shape, x.dtype));
    Ok(Type::Tuple(vec![field; sections]))
}

struct SplitEnv;

impl OpEnv for SplitEnv {
    fn name(&self) -> &str {
        "cpu.split"
    }

    fn execute(&self, call: &CallValues, _resources: &Resources) -> Result<()> {
        let x = call.args_as::<SplitArgs>()?.x.as_tensor()?;
        let out = call.output()?.as_tuple()?;
        let data = x.to_f64_vec()?;
        let per_field = data.len() / out.len().max(1);
        for (field, chunk) in out.fields().iter().zip(data.chunks(per_field.max(1))) {
            field.as_tensor()?.write_f64(chunk)?;
        }
        Ok(())
    }
}

// shape: the dims of x as a u32 vector, produced at declare time

fn declare_shape(call: &mut CallValues) -> Result<()> {
    let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?.clone();
    let dims: Vec<f64> = x.dims().iter().map(|&d| d as f64).collect();
    let out = TensorValue::from_f64_slice(&dims, dims.len(), DType::U32)?;
    call.device = out.device();
    call.out = Some(Value::Tensor(out));
    call.computed = true;
    Ok(())
}

fn shape_rel(call: &CallValues) -> Result<Type> {
    let x = call.args_as::<UnaryArgs>()?.x.tensor_type()?;
    Ok(Type::Tensor(TensorType::fixed(&[x.rank()], DType::U32)))
}

pub(super) fn install(dispatch: &DispatchRegistry) {
    dispatch.register("split", DeviceKind::Cpu, HOST_PRIORITY, "cpu.split", |_| {
        Ok(Some(Arc::new(SplitEnv) as Arc<dyn OpEnv>))
    });
}
