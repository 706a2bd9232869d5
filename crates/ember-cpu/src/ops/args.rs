use std::any::Any;
use std::sync::Arc;

use ember_core::op::OpArgs;
use ember_core::{Error, Result, Value};

fn expect_arity(op: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(Error::msg(format!(
            "{op} takes {expected} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

macro_rules! op_args {
    ($name:ident) => {
        impl OpArgs for $name {
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

#[derive(Debug, Clone)]
pub struct UnaryArgs {
    pub x: Value,
}

op_args!(UnaryArgs);

impl UnaryArgs {
    pub fn schema(args: &[Value]) -> Result<Arc<dyn OpArgs>> {
        expect_arity("unary op", args, 1)?;
        Ok(Arc::new(UnaryArgs { x: args[0].clone() }))
    }
}

#[derive(Debug, Clone)]
pub struct BinaryArgs {
    pub x1: Value,
    pub x2: Value,
}

op_args!(BinaryArgs);

impl BinaryArgs {
    pub fn schema(args: &[Value]) -> Result<Arc<dyn OpArgs>> {
        expect_arity("binary op", args, 2)?;
        Ok(Arc::new(BinaryArgs {
            x1: args[0].clone(),
            x2: args[1].clone(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SplitArgs {
    pub x: Value,
    pub sections: Value,
}

op_args!(SplitArgs);

impl SplitArgs {
    pub fn schema(args: &[Value]) -> Result<Arc<dyn OpArgs>> {
        expect_arity("split", args, 2)?;
        Ok(Arc::new(SplitArgs {
            x: args[0].clone(),
            sections: args[1].clone(),
        }))
    }

    /// The number of sections; must be a positive constant.
    pub fn sections(&self) -> Result<usize> {
        match &self.sections {
            Value::Int(i) if i.value > 0 => Ok(i.value as usize),
            Value::Int(i) => Err(Error::msg(format!(
                "split needs a positive section count, got {}",
                i.value
            ))),
            other => Err(Error::TypeMismatch {
                expected: "Int",
                got: other.kind_name(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamArgs {
    pub x: Value,
    /// Optional stream tag index (0 compute, 1 copy, 2 communicate).
    pub stream_tag: Option<Value>,
}

op_args!(StreamArgs);

impl StreamArgs {
    pub fn schema(args: &[Value]) -> Result<Arc<dyn OpArgs>> {
        match args {
            [x] => Ok(Arc::new(StreamArgs {
                x: x.clone(),
                stream_tag: None,
            })),
            [x, tag] => Ok(Arc::new(StreamArgs {
                x: x.clone(),
                stream_tag: Some(tag.clone()),
            })),
            _ => Err(Error::msg(format!(
                "stream_sync takes 1 or 2 arguments, got {}",
                args.len()
            ))),
        }
    }
}
