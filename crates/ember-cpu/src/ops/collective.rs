use std::sync::Arc;

use ember_core::op::{CallValues, DispatchRegistry, OpDef, OpEnv, Requests, Resources, StreamRequest};
use ember_core::stream::StreamTag;
use ember_core::{DeviceKind, Error, Result, TensorValue, Value};

use super::args::{StreamArgs, UnaryArgs};
use super::unary::{declare_unary, unary_identity};
use super::HOST_PRIORITY;

pub(super) fn stream_sync_def() -> OpDef {
    OpDef::new("stream_sync")
        .with_schema(StreamArgs::schema)
        .with_declare(declare_stream_sync)
        .with_type_rule("StreamSyncRel", |call: &CallValues| {
            Ok(ember_core::ir::Type::Tensor(
                call.args_as::<StreamArgs>()?.x.tensor_type()?,
            ))
        })
}

pub(super) fn all_reduce_def() -> OpDef {
    OpDef::new("all_reduce")
        .with_schema(UnaryArgs::schema)
        .with_declare(declare_unary)
        .with_type_rule("UnaryIdentity", unary_identity)
}

fn stream_tag(value: &Value) -> Result<StreamTag> {
    match value.as_i64()? {
        0 => Ok(StreamTag::Compute),
        1 => Ok(StreamTag::Copy),
        2 => Ok(StreamTag::Communicate),
        other => Err(Error::msg(format!("unknown stream tag {other}"))),
    }
}

// The output is `x` itself: it already has memory, so nothing is allocated.
fn declare_stream_sync(call: &mut CallValues) -> Result<()> {
    let x: TensorValue = call.args_as::<StreamArgs>()?.x.as_tensor()?.clone();
    call.device = x.device();
    call.out = Some(Value::Tensor(x));
    Ok(())
}

struct StreamSyncEnv {
    tag: Option<StreamTag>,
}

impl OpEnv for StreamSyncEnv {
    fn name(&self) -> &str {
        "cpu.stream_sync"
    }

    fn requests(&self) -> Requests {
        Requests {
            stream: vec![StreamRequest {
                tag: self.tag,
                index: 0,
            }],
            ..Requests::default()
        }
    }

    fn execute(&self, _call: &CallValues, resources: &Resources) -> Result<()> {
        resources.streams.iter().try_for_each(|s| s.wait())
    }
}

struct AllReduceEnv;

impl OpEnv for AllReduceEnv {
    fn name(&self) -> &str {
        "cpu.all_reduce"
    }

    fn requests(&self) -> Requests {
        Requests {
            stream: vec![StreamRequest {
                tag: Some(StreamTag::Communicate),
                index: 0,
            }],
            distributed: 1,
            ..Requests::default()
        }
    }

    fn execute(&self, call: &CallValues, resources: &Resources) -> Result<()> {
        let x = call.args_as::<UnaryArgs>()?.x.as_tensor()?;
        let comm = resources
            .communicators
            .first()
            .ok_or_else(|| Error::msg("all_reduce: no communicator was provided"))?;
        let mut data = x.to_f64_vec()?;
        comm.all_reduce_f64(&mut data)?;
        call.output()?.as_tensor()?.write_f64(&data)
    }
}

pub(super) fn install(dispatch: &DispatchRegistry) {
    dispatch.register(
        "stream_sync",
        DeviceKind::Cpu,
        HOST_PRIORITY,
        "cpu.stream_sync",
        |call| {
            let tag = match &call.args_as::<StreamArgs>()?.stream_tag {
                Some(v) => Some(stream_tag(v)?),
                None => None,
            };
            Ok(Some(Arc::new(StreamSyncEnv { tag }) as Arc<dyn OpEnv>))
        },
    );
    dispatch.register(
        "all_reduce",
        DeviceKind::Cpu,
        HOST_PRIORITY,
        "cpu.all_reduce",
        |_| Ok(Some(Arc::new(AllReduceEnv) as Arc<dyn OpEnv>)),
    );
}
