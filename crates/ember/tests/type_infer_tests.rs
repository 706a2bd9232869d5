// Type inference tests — annotation, incomplete propagation and unification laws

use ember::cpu::ops;
use ember::ir::{
    Dim, Expr, ExprKind, FuncType, Function, GlobalVar, IrModule, SymVar, TensorType, Type, TypeVar,
    Var,
};
use ember::op::{CallValues, Op, OpDef};
use ember::pass::{infer_expr_type, infer_type, unify};
use ember::prelude::*;

fn f32_tensor(dims: Vec<Dim>) -> Type {
    Type::Tensor(TensorType::new(dims, DType::F32))
}

fn op(name: &str) -> Expr {
    Expr::op(&ops::get(name).unwrap())
}

fn func_ret(ty: &Type) -> Type {
    match ty {
        Type::Func(ft) => (*ft.ret).clone(),
        other => panic!("expected a function type, got {other}"),
    }
}

// A spread of types used by the unification laws.
fn sample_types() -> Vec<Type> {
    let n = SymVar::new("n");
    let m = SymVar::new("m");
    let a = TypeVar::new("A");
    vec![
        Type::Incomplete,
        f32_tensor(vec![]),
        f32_tensor(vec![Dim::Fixed(2), Dim::Fixed(3)]),
        f32_tensor(vec![Dim::from(&n), Dim::Fixed(3)]),
        f32_tensor(vec![Dim::from(&m), Dim::Fixed(3)]),
        f32_tensor(vec![Dim::Fixed(4), Dim::Fixed(3)]),
        Type::Tensor(TensorType::fixed(&[2, 3], DType::I64)),
        Type::Tuple(vec![]),
        Type::Tuple(vec![f32_tensor(vec![Dim::Fixed(2)]), Type::Incomplete]),
        Type::Tuple(vec![f32_tensor(vec![Dim::Fixed(2)])]),
        Type::Func(FuncType::new(vec![f32_tensor(vec![])], f32_tensor(vec![]))),
        Type::Func(FuncType {
            type_params: vec![a.clone()],
            args: vec![Type::Param(a.clone())],
            ret: Box::new(Type::Param(a.clone())),
            constraints: vec![],
        }),
        Type::Ref(Box::new(f32_tensor(vec![Dim::Fixed(2)]))),
        Type::Param(a),
    ]
}

// Unification laws

#[test]
fn test_unify_is_idempotent() {
    for t in sample_types() {
        assert_eq!(unify(&t, &t).unwrap(), t, "{t}");
    }
}

#[test]
fn test_incomplete_is_identity() {
    for t in sample_types() {
        assert_eq!(unify(&Type::Incomplete, &t).unwrap(), t, "{t}");
        assert_eq!(unify(&t, &Type::Incomplete).unwrap(), t, "{t}");
    }
}

#[test]
fn test_unify_failure_is_symmetric() {
    let types = sample_types();
    for a in &types {
        for b in &types {
            assert_eq!(
                unify(a, b).is_err(),
                unify(b, a).is_err(),
                "unify({a}, {b})"
            );
        }
    }
}

#[test]
fn test_unify_error_names_both_types() {
    let a = f32_tensor(vec![Dim::Fixed(2)]);
    let b = f32_tensor(vec![Dim::Fixed(3)]);
    match unify(&a, &b) {
        Err(Error::Unification { lhs, rhs }) => {
            assert_eq!(lhs, a.to_string());
            assert_eq!(rhs, b.to_string());
        }
        other => panic!("expected a unification error, got {other:?}"),
    }
}

#[test]
fn test_any_dim_is_not_narrowed() {
    // broadcasting two unrelated symbols yields Any; an annotation cannot fix it
    let n = SymVar::new("n");
    let m = SymVar::new("m");
    let x = Var::new("x", Some(f32_tensor(vec![Dim::from(&n)])));
    let y = Var::new("y", Some(f32_tensor(vec![Dim::from(&m)])));
    let z = Var::new("z", Some(f32_tensor(vec![Dim::Fixed(3)])));
    let body = Expr::let_(
        &z,
        Expr::call(op("add"), vec![Expr::var(&x), Expr::var(&y)]),
        Expr::var(&z),
    );
    let f = infer_expr_type(&Expr::func(Function::new(vec![x, y], body)), None).unwrap();
    assert_eq!(func_ret(&f.ty()), f32_tensor(vec![Dim::Any]));
}

// Inference

#[test]
fn test_op_call_uses_type_rule() {
    let n = SymVar::new("n");
    let x = Var::new("x", Some(f32_tensor(vec![Dim::from(&n), Dim::Fixed(3)])));
    let y = Var::new("y", None);
    let body = Expr::let_(
        &y,
        Expr::call(op("relu"), vec![Expr::var(&x)]),
        Expr::call(op("shape"), vec![Expr::var(&y)]),
    );
    let f = infer_expr_type(&Expr::func(Function::new(vec![x], body)), None).unwrap();
    assert_eq!(
        func_ret(&f.ty()),
        Type::Tensor(TensorType::fixed(&[2], DType::U32))
    );
}

#[test]
fn test_constant_arguments_reach_the_rule() {
    let x = Var::new("x", Some(f32_tensor(vec![Dim::Fixed(4), Dim::Fixed(2)])));
    let body = Expr::call(op("split"), vec![Expr::var(&x), Expr::constant(2i64)]);
    let f = infer_expr_type(&Expr::func(Function::new(vec![x], body)), None).unwrap();
    let field = f32_tensor(vec![Dim::Fixed(2), Dim::Fixed(2)]);
    assert_eq!(func_ret(&f.ty()), Type::Tuple(vec![field.clone(), field]));
}

#[test]
fn test_incomplete_argument_makes_call_incomplete() {
    let x = Var::new("x", None);
    let body = Expr::call(op("relu"), vec![Expr::var(&x)]);
    let f = infer_expr_type(&Expr::func(Function::new(vec![x], body)), None).unwrap();
    assert!(func_ret(&f.ty()).is_incomplete());
}

#[test]
fn test_op_must_have_exactly_one_rule() {
    let none = Op::new(OpDef::new("no_rule"));
    let two = Op::new(
        OpDef::new("two_rules")
            .with_type_rule("First", |_: &CallValues| Ok(Type::unit()))
            .with_type_rule("Second", |_: &CallValues| Ok(Type::unit())),
    );
    for bad in [none, two] {
        let e = Expr::call(Expr::op(&bad), vec![Expr::constant(1i64)]);
        assert!(infer_expr_type(&e, None).is_err(), "{}", bad.name());
    }
}

#[test]
fn test_every_node_is_annotated() {
    let x = Var::new("x", Some(f32_tensor(vec![Dim::Fixed(2)])));
    let t = Var::new("t", None);
    let body = Expr::let_(
        &t,
        Expr::tuple(vec![Expr::var(&x), Expr::constant(1i64)]),
        Expr::tuple_get_item(Expr::var(&t), 0),
    );
    let f = infer_expr_type(&Expr::func(Function::new(vec![x], body)), None).unwrap();
    let ExprKind::Function(func) = f.kind() else {
        panic!("expected a function");
    };
    let ExprKind::Let { value, body, .. } = func.body().kind() else {
        panic!("expected a let");
    };
    assert_eq!(
        value.checked_type(),
        Some(&Type::Tuple(vec![
            f32_tensor(vec![Dim::Fixed(2)]),
            Type::Tensor(TensorType::scalar(DType::I64)),
        ]))
    );
    assert_eq!(body.checked_type(), Some(&f32_tensor(vec![Dim::Fixed(2)])));
}

#[test]
fn test_if_branches_unify() {
    let n = SymVar::new("n");
    let x = Var::new("x", Some(f32_tensor(vec![Dim::from(&n)])));
    let c = Expr::constant(TensorValue::from_slice(&[1.0f32, 2.0], 2).unwrap());
    let e = Expr::func(Function::new(
        vec![x.clone()],
        Expr::if_(Expr::constant(true), Expr::var(&x), c),
    ));
    let f = infer_expr_type(&e, None).unwrap();
    assert_eq!(func_ret(&f.ty()), f32_tensor(vec![Dim::Fixed(2)]));

    let mismatched = Expr::if_(
        Expr::constant(true),
        Expr::constant(1i64),
        Expr::tuple(vec![]),
    );
    assert!(matches!(
        infer_expr_type(&mismatched, None),
        Err(Error::Unification { .. })
    ));
}

#[test]
fn test_closure_call_uses_declared_return() {
    let p = Var::new("p", Some(f32_tensor(vec![Dim::Fixed(3)])));
    let f = Var::new("f", None);
    let callee = Function::with_signature(
        vec![p.clone()],
        Expr::var(&p),
        Some(f32_tensor(vec![Dim::Fixed(3)])),
        vec![],
    );
    let arg = TensorValue::from_slice(&[0.0f32; 3], 3).unwrap();
    let e = Expr::let_(
        &f,
        Expr::func(callee),
        Expr::call(Expr::var(&f), vec![Expr::constant(arg)]),
    );
    let got = infer_expr_type(&e, None).unwrap();
    assert_eq!(got.ty(), f32_tensor(vec![Dim::Fixed(3)]));
}

#[test]
fn test_generic_return_is_not_instantiated() {
    let a = TypeVar::new("A");
    let p = Var::new("p", Some(Type::Param(a.clone())));
    let id = Function::with_signature(vec![p.clone()], Expr::var(&p), None, vec![a.clone()]);
    let e = Expr::call(Expr::func(id), vec![Expr::constant(1i64)]);
    assert_eq!(infer_expr_type(&e, None).unwrap().ty(), Type::Param(a));
}

#[test]
fn test_infer_module() {
    let n = SymVar::new("n");
    let x = Var::new("x", Some(f32_tensor(vec![Dim::from(&n)])));
    let y = Var::new("y", Some(f32_tensor(vec![Dim::from(&n)])));
    let main = GlobalVar::new("main");
    let helper = GlobalVar::new("helper");

    let mut module = IrModule::new();
    module.add(
        main.clone(),
        Function::new(
            vec![x.clone()],
            Expr::call(Expr::global(&helper), vec![Expr::var(&x)]),
        ),
    );
    module.add(
        helper.clone(),
        Function::new(
            vec![y.clone()],
            Expr::call(op("add"), vec![Expr::var(&y), Expr::var(&y)]),
        ),
    );

    let inferred = infer_type(&module).unwrap();
    assert_eq!(inferred.len(), 2);
    let body = inferred.lookup(&main).unwrap().body();
    assert_eq!(body.ty(), f32_tensor(vec![Dim::from(&n)]));
    // the input module is left untouched
    assert!(module.lookup(&main).unwrap().body().checked_type().is_none());
}

#[test]
fn test_recursive_global_uses_declared_signature() {
    let x = Var::new("x", Some(f32_tensor(vec![])));
    let gv = GlobalVar::new("loop");
    let mut module = IrModule::new();
    module.add(
        gv.clone(),
        Function::with_signature(
            vec![x.clone()],
            Expr::if_(
                Expr::constant(true),
                Expr::var(&x),
                Expr::call(Expr::global(&gv), vec![Expr::var(&x)]),
            ),
            Some(f32_tensor(vec![])),
            vec![],
        ),
    );
    let inferred = infer_type(&module).unwrap();
    assert_eq!(
        inferred.lookup(&gv).unwrap().body().ty(),
        f32_tensor(vec![])
    );
}

#[test]
fn test_missing_global() {
    let e = Expr::global(&GlobalVar::new("nope"));
    assert!(matches!(
        infer_expr_type(&e, Some(&IrModule::new())),
        Err(Error::UnknownGlobal { .. })
    ));
}
