use std::sync::Arc;

use ember_core::ir::{TensorType, Type};
use ember_core::op::{CallValues, DispatchRegistry, OpDef, OpEnv, Requests, Resources};
use ember_core::{DeviceKind, Error, Result, Shape, TensorValue, Value};
use rayon::prelude::*;

use super::args::UnaryArgs;
use super::HOST_PRIORITY;

/// Elements reduced per partial sum.
const CHUNK: usize = 1024;

pub(super) fn sum_def() -> OpDef {
    OpDef::new("sum")
        .with_schema(UnaryArgs::schema)
        .with_declare(declare_sum)
        .with_type_rule("ReduceRel", reduce_rel)
}

fn declare_sum(call: &mut CallValues) -> Result<()> {
    let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?.clone();
    call.device = x.device();
    call.out = Some(Value::Tensor(TensorValue::empty(
        x.device(),
        x.dtype(),
        Shape::from(()),
    )));
    Ok(())
}

fn reduce_rel(call: &CallValues) -> Result<Type> {
    let x = call.args_as::<UnaryArgs>()?.x.tensor_type()?;
    Ok(Type::Tensor(TensorType::scalar(x.dtype)))
}

/// Two-level sum: per-chunk partials go to the workspace, then get folded.
struct SumEnv {
    chunks: usize,
}

impl OpEnv for SumEnv {
    fn name(&self) -> &str {
        "cpu.sum"
    }

    fn requests(&self) -> Requests {
        Requests {
            workspace: vec![self.chunks * std::mem::size_of::<f64>()],
            ..Requests::default()
        }
    }

    fn execute(&self, call: &CallValues, resources: &Resources) -> Result<()> {
        let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?;
        let workspace = resources
            .workspace
            .first()
            .ok_or_else(|| Error::msg("sum: workspace was not provided"))?;
        let data = x.to_f64_vec()?;
        let partials: Vec<f64> = data.par_chunks(CHUNK).map(|c| c.iter().sum()).collect();

        let total = {
            let mut bytes = workspace.write();
            for (slot, p) in bytes.chunks_exact_mut(8).zip(&partials) {
                slot.copy_from_slice(&p.to_le_bytes());
            }
            bytes
                .chunks_exact(8)
                .take(partials.len())
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .sum::<f64>()
        };
        call.output()?.as_tensor()?.write_f64(&[total])
    }
}

pub(super) fn install(dispatch: &DispatchRegistry) {
    dispatch.register("sum", DeviceKind::Cpu, HOST_PRIORITY, "cpu.sum", |call| {
        let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?;
        let chunks = x.elem_count().div_ceil(CHUNK).max(1);
        Ok(Some(Arc::new(SumEnv { chunks }) as Arc<dyn OpEnv>))
    });
}
