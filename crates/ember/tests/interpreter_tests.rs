// Interpreter tests — evaluation semantics, primitive dispatch and resources

use std::sync::Arc;

use ember::cpu::{ops, HostMemoryPool, HostStreamPool, LocalCommRegistry};
use ember::exec::{Interpreter, Runtime, RuntimeConfig};
use ember::ir::{Expr, Function, GlobalVar, IrModule, Var};
use ember::op::{CallArgs, CallValues, DispatchRegistry};
use ember::prelude::*;
use ember::ErrorKind;
use ember_core::stream::StreamTag;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Helpers

fn host() -> Interpreter {
    Interpreter::new(Runtime::host().with_bindings(BindingTable::new()))
}

fn eval(expr: &Expr) -> Result<Value> {
    host().interpret(expr, None)
}

fn op(name: &str) -> Expr {
    Expr::op(&ops::get(name).unwrap())
}

fn tensor(data: &[f32], shape: &[usize]) -> TensorValue {
    TensorValue::from_slice(data, shape.to_vec()).unwrap()
}

struct Pools {
    memory: Arc<HostMemoryPool>,
    streams: Arc<HostStreamPool>,
    comms: Arc<LocalCommRegistry>,
}

fn instrumented(config: RuntimeConfig) -> (Interpreter, Pools) {
    let pools = Pools {
        memory: Arc::new(HostMemoryPool::new(true)),
        streams: Arc::new(HostStreamPool::new()),
        comms: Arc::new(LocalCommRegistry::new()),
    };
    let dispatch = DispatchRegistry::new();
    ops::install(&dispatch);
    let runtime = Runtime::new(
        pools.memory.clone(),
        pools.streams.clone(),
        pools.comms.clone(),
        Arc::new(dispatch),
        config,
    )
    .with_bindings(BindingTable::new());
    (Interpreter::new(runtime), pools)
}

// Node kinds

#[test]
fn test_tuple_get_item_end_to_end() {
    let e = Expr::tuple_get_item(
        Expr::tuple(vec![
            Expr::constant(1i64),
            Expr::constant(2i64),
            Expr::constant(3i64),
        ]),
        1,
    );
    assert_eq!(eval(&e).unwrap(), Value::int(2));
}

#[test]
fn test_tuple_get_item_bounds() {
    let tuple = Expr::tuple(vec![
        Expr::constant(10i64),
        Expr::constant(11i64),
        Expr::constant(12i64),
    ]);
    for i in -3..6i64 {
        let got = eval(&Expr::tuple_get_item(tuple.clone(), i));
        if (0..3).contains(&i) {
            assert_eq!(got.unwrap(), Value::int(10 + i));
        } else {
            assert!(
                matches!(got, Err(Error::IndexOutOfRange { index, size: 3 }) if index == i),
                "index {i}"
            );
        }
    }
}

#[test]
fn test_if_skips_untaken_branch() {
    // the else branch would fail if it were evaluated
    let bad = Expr::tuple_get_item(Expr::tuple(vec![]), 0);
    let e = Expr::if_(Expr::constant(true), Expr::constant(10i64), bad.clone());
    assert_eq!(eval(&e).unwrap(), Value::int(10));

    let unbound = Var::new("unbound", None);
    let e = Expr::if_(Expr::constant(false), Expr::var(&unbound), Expr::constant(20i64));
    assert_eq!(eval(&e).unwrap(), Value::int(20));

    let e = Expr::if_(Expr::constant(false), Expr::constant(10i64), bad);
    assert!(eval(&e).is_err());
}

#[test]
fn test_if_untaken_branch_has_no_side_effects() {
    let r = Var::new("r", None);
    let u = Var::new("u", None);
    let e = Expr::let_(
        &r,
        Expr::ref_create(Expr::constant(0i64)),
        Expr::let_(
            &u,
            Expr::if_(
                Expr::constant(false),
                Expr::ref_write(Expr::var(&r), Expr::constant(1i64)),
                Expr::tuple(vec![]),
            ),
            Expr::ref_read(Expr::var(&r)),
        ),
    );
    assert_eq!(eval(&e).unwrap(), Value::int(0));
}

#[test]
fn test_if_requires_boolean() {
    let e = Expr::if_(
        Expr::constant("yes"),
        Expr::constant(1i64),
        Expr::constant(2i64),
    );
    assert!(matches!(eval(&e), Err(Error::TypeMismatch { .. })));
}

#[test]
fn test_ref_cells() {
    let r = Var::new("r", None);
    let w = Var::new("w", None);
    let e = Expr::let_(
        &r,
        Expr::ref_create(Expr::constant(1i64)),
        Expr::let_(
            &w,
            Expr::ref_write(Expr::var(&r), Expr::constant(2i64)),
            Expr::tuple(vec![Expr::var(&w), Expr::ref_read(Expr::var(&r))]),
        ),
    );
    assert_eq!(
        eval(&e).unwrap(),
        Value::tuple(vec![Value::unit(), Value::int(2)])
    );
}

// Scoping

#[test]
fn test_inner_let_shadows() {
    let x = Var::new("x", None);
    let e = Expr::let_(
        &x,
        Expr::constant(1i64),
        Expr::let_(&x, Expr::constant(2i64), Expr::var(&x)),
    );
    assert_eq!(eval(&e).unwrap(), Value::int(2));
}

#[test]
fn test_shadow_restored_after_scope() {
    let x = Var::new("x", None);
    let e = Expr::let_(
        &x,
        Expr::constant("A"),
        Expr::tuple(vec![
            Expr::let_(&x, Expr::constant("B"), Expr::var(&x)),
            Expr::var(&x),
        ]),
    );
    assert_eq!(
        eval(&e).unwrap(),
        Value::tuple(vec![Value::from("B"), Value::from("A")])
    );
}

// Closures

#[test]
fn test_closure_captures_and_applies() {
    let y = Var::new("y", None);
    let p = Var::new("p", None);
    let f = Var::new("f", None);
    let func = Function::new(
        vec![p.clone()],
        Expr::tuple(vec![Expr::var(&p), Expr::var(&y)]),
    );
    let e = Expr::let_(
        &y,
        Expr::constant(5i64),
        Expr::let_(
            &f,
            Expr::func(func),
            // y is rebound, the closure keeps the captured value
            Expr::let_(
                &y,
                Expr::constant(6i64),
                Expr::call(Expr::var(&f), vec![Expr::constant(1i64)]),
            ),
        ),
    );
    assert_eq!(
        eval(&e).unwrap(),
        Value::tuple(vec![Value::int(1), Value::int(5)])
    );
}

#[test]
fn test_closure_arity_mismatch() {
    let a = Var::new("a", None);
    let b = Var::new("b", None);
    let func = Function::new(vec![a.clone(), b], Expr::var(&a));
    for n in [0usize, 1, 3] {
        let args = (0..n).map(|i| Expr::constant(i as i64)).collect();
        let e = Expr::call(Expr::func(func.clone()), args);
        assert!(
            matches!(eval(&e), Err(Error::ArityMismatch { expected: 2, got }) if got == n),
            "{n} arguments"
        );
    }
}

#[test]
fn test_calling_a_scalar_fails() {
    let e = Expr::call(Expr::constant(1i64), vec![]);
    assert!(matches!(eval(&e), Err(Error::NotCallable { kind: "Int" })));
}

#[test]
fn test_global_function_call() {
    let p = Var::new("p", None);
    let gv = GlobalVar::new("pair");
    let mut module = IrModule::new();
    module.add(
        gv.clone(),
        Function::new(vec![p.clone()], Expr::tuple(vec![Expr::var(&p), Expr::var(&p)])),
    );
    let e = Expr::call(Expr::global(&gv), vec![Expr::constant(4i64)]);
    assert_eq!(
        host().interpret(&e, Some(&module)).unwrap(),
        Value::tuple(vec![Value::int(4), Value::int(4)])
    );
    assert!(matches!(
        host().interpret(&Expr::global(&GlobalVar::new("missing")), Some(&module)),
        Err(Error::UnknownGlobal { .. })
    ));
}

#[test]
fn test_op_literal_is_not_wrapped() {
    let v = eval(&op("relu")).unwrap();
    assert_eq!(v.as_op().unwrap().name(), "relu");
}

// Binding table fallback

#[test]
fn test_var_falls_back_to_binding_table() {
    let table = BindingTable::new();
    let interp = Interpreter::new(Runtime::host().with_bindings(table.clone()));
    let a = table.bind_ndarray(Value::int(3), None, "a");
    let s = table.bind_symbol(Expr::tuple(vec![Expr::var(&a), Expr::constant(4i64)]), "s");

    assert_eq!(interp.interpret(&Expr::var(&a), None).unwrap(), Value::int(3));
    assert_eq!(
        interp.interpret(&Expr::var(&s), None).unwrap(),
        Value::tuple(vec![Value::int(3), Value::int(4)])
    );

    let unbound = Var::new("nowhere", None);
    let err = interp.interpret(&Expr::var(&unbound), None).unwrap_err();
    assert!(matches!(err, Error::UnboundVariable { .. }));
    assert_eq!(err.kind(), ErrorKind::Lookup);
}

#[test]
fn test_symbol_table_shadows_binding_table() {
    let table = BindingTable::new();
    let interp = Interpreter::new(Runtime::host().with_bindings(table.clone()));
    let a = table.bind_ndarray(Value::int(3), None, "a");
    let e = Expr::let_(&a, Expr::constant(9i64), Expr::var(&a));
    assert_eq!(interp.interpret(&e, None).unwrap(), Value::int(9));
}

// Primitive dispatch

#[test]
fn test_relu_dispatch_pins_output() {
    let x = tensor(&[-1.0, 2.0, -3.0, 4.0], &[2, 2]);
    let e = Expr::call(op("relu"), vec![Expr::constant(x)]);
    let out = eval(&e).unwrap();
    let t = out.as_tensor().unwrap();
    assert_eq!(t.dims(), &[2, 2]);
    assert_eq!(t.to_f64_vec().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
    assert_eq!(out.pinned().map(|p| p.name().to_string()).as_deref(), Some("cpu.relu"));
}

#[test]
fn test_broadcast_add() {
    let a = tensor(&[1.0, 2.0], &[2, 1]);
    let b = tensor(&[10.0, 20.0, 30.0], &[3]);
    let e = Expr::call(op("add"), vec![Expr::constant(a), Expr::constant(b)]);
    let out = eval(&e).unwrap();
    let t = out.as_tensor().unwrap();
    assert_eq!(t.dims(), &[2, 3]);
    assert_eq!(
        t.to_f64_vec().unwrap(),
        vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]
    );
}

#[test]
fn test_split_fields_inherit_pin() {
    let x = tensor(&[1.0, 2.0, 3.0, 4.0], &[4]);
    let t = Var::new("t", None);
    let e = Expr::let_(
        &t,
        Expr::call(op("split"), vec![Expr::constant(x), Expr::constant(2i64)]),
        Expr::tuple_get_item(Expr::var(&t), 1),
    );
    let field = eval(&e).unwrap();
    assert_eq!(field.as_tensor().unwrap().to_f64_vec().unwrap(), vec![3.0, 4.0]);
    assert_eq!(
        field.pinned().map(|p| p.name().to_string()).as_deref(),
        Some("cpu.split")
    );
}

#[test]
fn test_computed_op_skips_dispatch() {
    let runtime = Runtime::new(
        Arc::new(HostMemoryPool::new(true)),
        Arc::new(HostStreamPool::new()),
        Arc::new(LocalCommRegistry::new()),
        // nothing registered
        Arc::new(DispatchRegistry::new()),
        RuntimeConfig::default(),
    )
    .with_bindings(BindingTable::new());
    let interp = Interpreter::new(runtime);
    let x = tensor(&[0.0; 6], &[2, 3]);

    let shape = Expr::call(op("shape"), vec![Expr::constant(x.clone())]);
    let out = interp.interpret(&shape, None).unwrap();
    assert_eq!(out.as_tensor().unwrap().to_f64_vec().unwrap(), vec![2.0, 3.0]);
    assert!(out.pinned().is_none());

    let relu = Expr::call(op("relu"), vec![Expr::constant(x)]);
    let err = interp.interpret(&relu, None).unwrap_err();
    assert!(matches!(err, Error::NoImplementation { .. }));
    assert_eq!(err.to_string(), "cannot dispatch relu@cpu(0)");
}

#[test]
fn test_workspace_released_after_execution() {
    let (interp, pools) = instrumented(RuntimeConfig::default());
    let x = tensor(&[1.0, 2.0, 3.0], &[3]);
    let e = Expr::call(op("sum"), vec![Expr::constant(x)]);
    let out = interp.interpret(&e, None).unwrap();
    assert_eq!(out.as_f64().unwrap(), 6.0);

    // output (4 bytes) is still held; the 8 byte workspace is back in the pool
    let stats = pools.memory.stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.cached_buffers, 1);
    assert_eq!(stats.cached_bytes, 8);

    drop(out);
    assert_eq!(pools.memory.stats().cached_buffers, 2);
}

#[test]
fn test_inplace_output_is_not_reallocated() {
    let (interp, pools) = instrumented(RuntimeConfig::default());
    let x = tensor(&[1.0, 2.0], &[2]);
    let e = Expr::call(
        op("add_inplace"),
        vec![Expr::constant(x.clone()), Expr::constant(tensor(&[1.0, 1.0], &[2]))],
    );
    let out = interp.interpret(&e, None).unwrap();
    assert!(out.as_tensor().unwrap().ptr_eq(&x));
    assert_eq!(x.to_f64_vec().unwrap(), vec![2.0, 3.0]);
    assert_eq!(pools.memory.stats().misses, 0);
}

#[test]
fn test_streams_are_waited_on() {
    let (interp, pools) = instrumented(RuntimeConfig::default());
    let x = tensor(&[1.0], &[1]);
    let e = Expr::call(
        op("stream_sync"),
        vec![Expr::constant(x.clone()), Expr::constant(1i64)],
    );
    let out = interp.interpret(&e, None).unwrap();
    assert!(out.as_tensor().unwrap().ptr_eq(&x));
    let copy = pools
        .streams
        .get(Device::cpu(), StreamTag::Copy, 0)
        .expect("copy stream acquired");
    // once by the kernel, once by the interpreter after execution
    assert_eq!(copy.waits(), 2);
}

#[test]
fn test_default_stream_tag_from_config() {
    let config = RuntimeConfig::default().with_stream_tag(StreamTag::Communicate);
    let (interp, pools) = instrumented(config);
    let e = Expr::call(op("stream_sync"), vec![Expr::constant(tensor(&[1.0], &[1]))]);
    interp.interpret(&e, None).unwrap();
    assert!(pools
        .streams
        .get(Device::cpu(), StreamTag::Communicate, 0)
        .is_some());
    assert!(pools.streams.get(Device::cpu(), StreamTag::Compute, 0).is_none());
}

#[test]
fn test_all_reduce_acquires_communicator() {
    let (interp, pools) = instrumented(RuntimeConfig::default());
    let e = Expr::call(
        op("all_reduce"),
        vec![Expr::constant(tensor(&[1.0, 2.0], &[2]))],
    );
    let out = interp.interpret(&e, None).unwrap();
    assert_eq!(out.as_tensor().unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0]);
    assert_eq!(pools.comms.handed_out(), 1);
    assert_eq!(pools.streams.total_waits(), 1);
}

#[test]
fn test_declare_overrides_config_device() {
    let config = RuntimeConfig::default().with_device(Device::cuda(0));
    let (interp, _pools) = instrumented(config);
    // declare moves the call to the input's device, so host calls still work
    let e = Expr::call(op("relu"), vec![Expr::constant(tensor(&[1.0], &[1]))]);
    assert!(interp.interpret(&e, None).is_ok());
}

// Thread-local entry points

#[test]
fn test_thread_local_entry_points() {
    ember::exec::set_thread_runtime(Runtime::host().with_bindings(BindingTable::new()));
    let e = Expr::tuple_get_item(Expr::tuple(vec![Expr::constant(true)]), 0);
    assert_eq!(ember::exec::interpret(&e, None).unwrap(), Value::Bool(true));

    let relu = ops::get("relu").unwrap();
    let args = relu
        .convert_args(vec![Value::Tensor(tensor(&[-2.0, 2.0], &[2]))])
        .unwrap();
    let out = ember::exec::invoke_primitive(CallValues::new(Value::Op(relu), args, Device::cpu()))
        .unwrap();
    assert_eq!(out.as_tensor().unwrap().to_f64_vec().unwrap(), vec![0.0, 2.0]);

    let p = Var::new("p", None);
    let closure = ember::exec::interpret(
        &Expr::func(Function::new(vec![p.clone()], Expr::var(&p))),
        None,
    )
    .unwrap();
    let out = ember::exec::invoke_closure(CallValues::new(
        closure,
        CallArgs::List(vec![Value::int(8)]),
        Device::cpu(),
    ))
    .unwrap();
    assert_eq!(out, Value::int(8));
}

// Determinism

fn random_expr(rng: &mut StdRng, depth: usize, scope: &mut Vec<Var>) -> Expr {
    let choice = if depth == 0 { rng.gen_range(0..4) } else { rng.gen_range(0..8) };
    match choice {
        0 => Expr::constant(rng.gen_range(-100i64..100)),
        1 => Expr::constant(rng.gen_range(-1.0f64..1.0)),
        2 => Expr::constant(rng.gen_bool(0.5)),
        3 if scope.is_empty() => Expr::constant(0i64),
        3 => Expr::var(&scope[rng.gen_range(0..scope.len())]),
        4 => {
            let n = rng.gen_range(0..4);
            Expr::tuple((0..n).map(|_| random_expr(rng, depth - 1, scope)).collect())
        }
        5 => {
            // shadow an existing variable half of the time
            let var = if scope.is_empty() || rng.gen_bool(0.5) {
                Var::new("v", None)
            } else {
                scope[rng.gen_range(0..scope.len())].clone()
            };
            let value = random_expr(rng, depth - 1, scope);
            scope.push(var.clone());
            let body = random_expr(rng, depth - 1, scope);
            scope.pop();
            Expr::let_(&var, value, body)
        }
        6 => Expr::if_(
            Expr::constant(rng.gen_bool(0.5)),
            random_expr(rng, depth - 1, scope),
            random_expr(rng, depth - 1, scope),
        ),
        _ => {
            let n = rng.gen_range(1..4);
            let fields = (0..n).map(|_| random_expr(rng, depth - 1, scope)).collect();
            Expr::tuple_get_item(Expr::tuple(fields), rng.gen_range(0..n as i64))
        }
    }
}

#[test]
fn test_interpretation_is_deterministic() {
    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let e = random_expr(&mut rng, 5, &mut Vec::new());
        let interp = host();
        let first = interp.interpret(&e, None).unwrap();
        let second = interp.interpret(&e, None).unwrap();
        let fresh = host().interpret(&e, None).unwrap();
        assert_eq!(first, second, "seed {seed}");
        assert_eq!(first, fresh, "seed {seed}");
    }
}
