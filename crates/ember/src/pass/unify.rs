// Unification — reconcile two partially known types
//
// Incomplete on either side yields the other side. Otherwise:
//
//   Tensor × Tensor   equal dtype and rank, then per dimension:
//                       Fixed(a)    × Fixed(b)     a == b
//                       Symbolic(s) × Fixed(n)     Fixed(n)
//                       Symbolic(s) × Symbolic(t)  only if s is t
//                       Any         × d            Any
//   Tuple × Tuple     pointwise, equal field count
//   Func × Func       align type params, substitute, then unify the return
//                     type, each argument and each constraint
//   anything else     structural equality
//
// Every failure is an `Error::Unification` naming both sides.

use std::collections::HashMap;

use ember_core::ir::{Dim, FuncType, TensorType, Type};
use ember_core::{Error, Result};

/// Unify `lhs` with `rhs`, returning the most specific common type.
pub fn unify(lhs: &Type, rhs: &Type) -> Result<Type> {
    match (lhs, rhs) {
        (Type::Incomplete, _) => Ok(rhs.clone()),
        (_, Type::Incomplete) => Ok(lhs.clone()),
        (Type::Tensor(a), Type::Tensor(b)) => unify_tensor(a, b).map(Type::Tensor),
        (Type::Tuple(a), Type::Tuple(b)) => {
            if a.len() != b.len() {
                return Err(mismatch(lhs, rhs));
            }
            let fields = a
                .iter()
                .zip(b)
                .map(|(x, y)| unify(x, y))
                .collect::<Result<Vec<_>>>()?;
            Ok(Type::Tuple(fields))
        }
        (Type::Func(a), Type::Func(b)) => unify_func(a, b)
            .map(Type::Func)
            .map_err(|_| mismatch(lhs, rhs)),
        (Type::Ref(a), Type::Ref(b)) => Ok(Type::Ref(Box::new(unify(a, b)?))),
        _ if lhs == rhs => Ok(lhs.clone()),
        _ => Err(mismatch(lhs, rhs)),
    }
}

fn mismatch(lhs: &impl std::fmt::Display, rhs: &impl std::fmt::Display) -> Error {
    Error::Unification {
        lhs: lhs.to_string(),
        rhs: rhs.to_string(),
    }
}

fn unify_tensor(a: &TensorType, b: &TensorType) -> Result<TensorType> {
    if a.dtype != b.dtype || a.rank() != b.rank() {
        return Err(mismatch(a, b));
    }
    let shape = a
        .shape
        .iter()
        .zip(&b.shape)
        .map(|(x, y)| unify_dim(x, y).ok_or_else(|| mismatch(a, b)))
        .collect::<Result<Vec<_>>>()?;
    Ok(TensorType::new(shape, a.dtype))
}

fn unify_dim(a: &Dim, b: &Dim) -> Option<Dim> {
    match (a, b) {
        (Dim::Any, _) | (_, Dim::Any) => Some(Dim::Any),
        (Dim::Fixed(x), Dim::Fixed(y)) => (x == y).then(|| a.clone()),
        (Dim::Symbolic(_), Dim::Fixed(_)) => Some(b.clone()),
        (Dim::Fixed(_), Dim::Symbolic(_)) => Some(a.clone()),
        (Dim::Symbolic(x), Dim::Symbolic(y)) => (x == y).then(|| a.clone()),
    }
}

fn unify_func(a: &FuncType, b: &FuncType) -> Result<FuncType> {
    if a.args.len() != b.args.len() || a.constraints.len() != b.constraints.len() {
        return Err(mismatch(&Type::Func(a.clone()), &Type::Func(b.clone())));
    }

    // The longer parameter list keeps its names; unmatched extra parameters
    // on either side are filled with Incomplete.
    let n = a.type_params.len().max(b.type_params.len());
    let mut lhs_map = HashMap::new();
    let mut rhs_map = HashMap::new();
    let mut type_params = Vec::with_capacity(n);
    for i in 0..n {
        match (a.type_params.get(i), b.type_params.get(i)) {
            (Some(x), Some(y)) => {
                rhs_map.insert(y.clone(), Type::Param(x.clone()));
                type_params.push(x.clone());
            }
            (Some(x), None) => {
                lhs_map.insert(x.clone(), Type::Incomplete);
            }
            (None, Some(y)) => {
                rhs_map.insert(y.clone(), Type::Incomplete);
            }
            (None, None) => unreachable!(),
        }
    }

    let a = substituted(a, &lhs_map);
    let b = substituted(b, &rhs_map);

    let ret = unify(&a.ret, &b.ret)?;
    let args = a
        .args
        .iter()
        .zip(&b.args)
        .map(|(x, y)| unify(x, y))
        .collect::<Result<Vec<_>>>()?;
    let constraints = a
        .constraints
        .iter()
        .zip(&b.constraints)
        .map(|(x, y)| unify(x, y))
        .collect::<Result<Vec<_>>>()?;
    Ok(FuncType {
        type_params,
        args,
        ret: Box::new(ret),
        constraints,
    })
}

// Substitute inside the body of `ft` without its own binders shadowing `map`.
fn substituted(ft: &FuncType, map: &HashMap<ember_core::ir::TypeVar, Type>) -> FuncType {
    FuncType {
        type_params: vec![],
        args: ft.args.iter().map(|t| t.substitute(map)).collect(),
        ret: Box::new(ft.ret.substitute(map)),
        constraints: ft.constraints.iter().map(|t| t.substitute(map)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ir::{SymVar, TypeVar};
    use ember_core::DType;

    fn t(dims: Vec<Dim>) -> Type {
        Type::Tensor(TensorType::new(dims, DType::F32))
    }

    #[test]
    fn test_symbolic_adopts_fixed() {
        let n = SymVar::new("n");
        let got = unify(&t(vec![Dim::from(&n), Dim::Fixed(3)]), &t(vec![Dim::Fixed(2), Dim::Fixed(3)]))
            .unwrap();
        assert_eq!(got, t(vec![Dim::Fixed(2), Dim::Fixed(3)]));
    }

    #[test]
    fn test_distinct_symbols_fail() {
        let n = SymVar::new("n");
        let m = SymVar::new("n");
        assert!(unify(&t(vec![Dim::from(&n)]), &t(vec![Dim::from(&m)])).is_err());
        assert!(unify(&t(vec![Dim::from(&n)]), &t(vec![Dim::from(&n)])).is_ok());
    }

    #[test]
    fn test_any_dim_stays_any() {
        let n = SymVar::new("n");
        assert_eq!(
            unify(&t(vec![Dim::Any, Dim::Any]), &t(vec![Dim::Fixed(4), Dim::from(&n)])).unwrap(),
            t(vec![Dim::Any, Dim::Any])
        );
        assert_eq!(
            unify(&t(vec![Dim::Fixed(3)]), &t(vec![Dim::Any])).unwrap(),
            t(vec![Dim::Any])
        );
    }

    #[test]
    fn test_dtype_and_rank_must_match() {
        let f16 = Type::Tensor(TensorType::fixed(&[2], DType::F16));
        assert!(unify(&t(vec![Dim::Fixed(2)]), &f16).is_err());
        assert!(unify(&t(vec![Dim::Fixed(2)]), &t(vec![Dim::Fixed(2), Dim::Fixed(1)])).is_err());
    }

    #[test]
    fn test_tuple_arity() {
        let a = Type::Tuple(vec![t(vec![])]);
        let b = Type::Tuple(vec![t(vec![]), t(vec![])]);
        let err = unify(&a, &b).unwrap_err();
        assert!(matches!(err, Error::Unification { .. }));
    }

    #[test]
    fn test_func_renames_type_params() {
        let a = TypeVar::new("A");
        let b = TypeVar::new("B");
        let fa = FuncType {
            type_params: vec![a.clone()],
            args: vec![Type::Param(a.clone())],
            ret: Box::new(Type::Param(a.clone())),
            constraints: vec![],
        };
        let fb = FuncType {
            type_params: vec![b.clone()],
            args: vec![Type::Param(b.clone())],
            ret: Box::new(Type::Param(b)),
            constraints: vec![],
        };
        let got = unify(&Type::Func(fa.clone()), &Type::Func(fb)).unwrap();
        assert_eq!(got, Type::Func(fa));
    }

    #[test]
    fn test_func_extra_params_become_incomplete() {
        let a = TypeVar::new("A");
        let fa = FuncType {
            type_params: vec![a.clone()],
            args: vec![Type::Param(a)],
            ret: Box::new(t(vec![])),
            constraints: vec![],
        };
        let fb = FuncType::new(vec![t(vec![Dim::Fixed(2)])], t(vec![]));
        let got = unify(&Type::Func(fa), &Type::Func(fb)).unwrap();
        assert_eq!(got, Type::Func(FuncType::new(vec![t(vec![Dim::Fixed(2)])], t(vec![]))));
    }

    #[test]
    fn test_func_arity_mismatch() {
        let fa = FuncType::new(vec![t(vec![])], t(vec![]));
        let fb = FuncType::new(vec![], t(vec![]));
        assert!(unify(&Type::Func(fa), &Type::Func(fb)).is_err());
    }
}
