use std::sync::Arc;

use ember_core::ir::Type;
use ember_core::op::{CallValues, DispatchRegistry, OpDef, OpEnv, Resources};
use ember_core::{DeviceKind, Result, TensorValue, Value};
use rayon::prelude::*;

use super::args::UnaryArgs;
use super::HOST_PRIORITY;

pub(super) fn relu_def() -> OpDef {
    OpDef::new("relu")
        .with_schema(UnaryArgs::schema)
        .with_declare(declare_unary)
        .with_type_rule("UnaryIdentity", unary_identity)
}

/// Output has the input's shape, dtype and device.
pub(super) fn declare_unary(call: &mut CallValues) -> Result<()> {
    let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?.clone();
    call.device = x.device();
    call.out = Some(Value::Tensor(TensorValue::empty(
        x.device(),
        x.dtype(),
        x.shape().clone(),
    )));
    Ok(())
}

/// Output type equals the input type.
pub(super) fn unary_identity(call: &CallValues) -> Result<Type> {
    Ok(Type::Tensor(call.args_as::<UnaryArgs>()?.x.tensor_type()?))
}

struct ReluEnv;

impl OpEnv for ReluEnv {
    fn name(&self) -> &str {
        "cpu.relu"
    }

    fn execute(&self, call: &CallValues, _resources: &Resources) -> Result<()> {
        let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?;
        let data = x.to_f64_vec()?;
        let out: Vec<f64> = data.par_iter().map(|v| v.max(0.0)).collect();
        call.output()?.as_tensor()?.write_f64(&out)
    }
}

pub(super) fn install(dispatch: &DispatchRegistry) {
    dispatch.register("relu", DeviceKind::Cpu, HOST_PRIORITY, "cpu.relu", |_| {
        Ok(Some(Arc::new(ReluEnv) as Arc<dyn OpEnv>))
    });
}
