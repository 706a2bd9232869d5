//! # ember-cpu
//!
//! Host implementations of the resources the ember interpreter consumes,
//! and a reference operator set:
//!
//! - [`HostMemoryPool`] — size-bucketed caching allocator with statistics
//! - [`HostStreamPool`] — host streams keyed by (device, tag, index)
//! - [`LocalCommRegistry`] — single-process communicator
//! - [`ops`] — reference operators with declare steps, type rules and kernels

pub mod comm;
pub mod ops;
pub mod pool;
pub mod stream;

pub use comm::{LocalCommRegistry, LocalCommunicator};
pub use pool::{HostMemoryPool, PoolStats};
pub use stream::{HostStream, HostStreamPool};

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ir::{Dim, TensorType, Type};
    use ember_core::op::{CallArgs, CallValues, DispatchRegistry, Resources};
    use ember_core::{DType, Device, TensorValue, Value};

    fn call(op: &str, args: Vec<Value>) -> CallValues {
        let op = ops::get(op).unwrap();
        let args = op.convert_args(args).unwrap();
        CallValues::new(Value::Op(op), args, Device::cpu())
    }

    #[test]
    fn test_every_op_has_one_type_rule() {
        for name in ops::registry().names() {
            assert_eq!(ops::get(&name).unwrap().type_rules().len(), 1, "{name}");
        }
    }

    #[test]
    fn test_relu_declare_and_execute() {
        let x = TensorValue::from_slice(&[-1.0f32, 2.0, -3.0, 4.0], (2, 2)).unwrap();
        let mut c = call("relu", vec![Value::Tensor(x)]);
        let op = c.callee.as_op().unwrap().clone();
        op.declare(&mut c).unwrap();
        let out = c.output().unwrap().as_tensor().unwrap().clone();
        assert_eq!(out.dims(), &[2, 2]);
        assert!(!out.is_allocated());

        out.set_memory(std::sync::Arc::new(ember_core::memory::Memory::new(
            Device::cpu(),
            vec![0; 16],
        )))
        .unwrap();
        let dispatch = DispatchRegistry::new();
        ops::install(&dispatch);
        let env = dispatch.resolve(&op, &c).unwrap();
        env.execute(&c, &Resources::default()).unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_type_rules_accept_reified_types() {
        let n = ember_core::ir::SymVar::new("n");
        let ty = TensorType::new(vec![Dim::from(&n), Dim::Fixed(3)], DType::F32);
        let c = call("shape", vec![Value::TensorType(ty.clone())]);
        let rule = &c.callee.as_op().unwrap().type_rules()[0];
        assert_eq!(
            rule.apply(&c).unwrap(),
            Type::Tensor(TensorType::fixed(&[2], DType::U32))
        );

        let c = call("split", vec![Value::TensorType(ty), Value::int(2)]);
        let rule = &c.callee.as_op().unwrap().type_rules()[0];
        let expected = Type::Tensor(TensorType::new(vec![Dim::Any, Dim::Fixed(3)], DType::F32));
        assert_eq!(rule.apply(&c).unwrap(), Type::Tuple(vec![expected.clone(), expected]));
    }

    #[test]
    fn test_shape_is_computed_at_declare() {
        let x = TensorValue::from_slice(&[0.0f32; 6], (2, 3)).unwrap();
        let mut c = call("shape", vec![Value::Tensor(x)]);
        let op = c.callee.as_op().unwrap().clone();
        op.declare(&mut c).unwrap();
        assert!(c.computed);
        let out = c.output().unwrap().as_tensor().unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![2.0, 3.0]);
        assert_eq!(out.dtype(), DType::U32);
    }

    #[test]
    fn test_split_rejects_uneven_sections() {
        let x = TensorValue::from_slice(&[0.0f32; 3], 3).unwrap();
        let mut c = call("split", vec![Value::Tensor(x), Value::int(2)]);
        let op = c.callee.as_op().unwrap().clone();
        assert!(op.declare(&mut c).is_err());
        assert!(matches!(c.args, CallArgs::Schema(_)));
    }
}
