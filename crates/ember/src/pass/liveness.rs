// Liveness analysis — which tensor allocations are live at each line
//
// Plain liveness assumes one variable is one storage unit. Here a variable
// may hold a tuple of independently allocated tensors, so the analysis runs
// over synthetic per-tensor variables ("fake" vars, named t_<n>) instead:
//
//   let %a1 = batch_norm(%x, ...)     %a1 = {t_0, t_1, t_2}
//   let %a2 = %a1.0                   %a2 = {t_0}
//   let %a3 = add(%a2, %a2)           %a3 = {t_3}
//   let %a4 = (%a2, %a3)              %a4 = {t_0, t_3}
//
// FORWARD: in program order, compute the fake vars every original variable
// contains (`vset`) and, for tuple-typed variables, one entry per field
// (`vtuple`).
//
// BACKWARD: in reverse order, per line l with let variable v:
//
//   live_in(l) = (live_out(l) - vset[v]) ∪ used(l)
//
// where live_out(l) is the next line's live_in, and the function's return
// value is live after the last line.
//
// SHARING: operators that write an output into an argument's storage force
// the two fake vars into one union-find class; a class's live lines are the
// union of its members' live lines.
//
// Closure invocations inside a branch, closure invocations producing a
// tuple and reference cells are not supported. They mark the analysis as
// failed instead of returning an error: callers fall back to a plan with no
// sharing.

use std::collections::{BTreeSet, HashMap};

use ember_core::ir::{free_vars, ExplicitLetList, Expr, ExprKind, Function, Type, Var};
use tracing::{debug, warn};

type VSet = BTreeSet<Var>;

/// Reason the analysis cannot handle a function.
#[derive(Debug, Clone, Copy)]
struct Unsupported(&'static str);

type Step<T> = std::result::Result<T, Unsupported>;

/// Tensor liveness over one A-normal-form function.
///
/// The function should be type-inferred: fake vars for parameters and call
/// results are created from checked types. Untyped values count as a single
/// tensor.
pub struct LivenessAnalyzer {
    func: Function,
    ran: bool,
    failure: Option<&'static str>,
    /// Original (and helper) variable -> fake vars it contains.
    vset: HashMap<Var, VSet>,
    /// Tuple-typed variable -> one helper variable per field.
    vtuple: HashMap<Var, Vec<Var>>,
    /// Line (let variable) -> fake vars live before it.
    live: HashMap<Var, VSet>,
    /// Union-find root -> lines where its class is live.
    inv_live: HashMap<Var, VSet>,
    parent: HashMap<Var, Var>,
    /// Fake var -> the line that allocates it; parameters have none.
    defined_at: HashMap<Var, Var>,
    originals: Vec<Var>,
    mandatory: Vec<(Var, Var)>,
    labels: HashMap<&'static str, usize>,
    current_line: Option<Var>,
    branch_depth: usize,
}

impl LivenessAnalyzer {
    pub fn new(func: &Function) -> Self {
        LivenessAnalyzer {
            func: func.clone(),
            ran: false,
            failure: None,
            vset: HashMap::new(),
            vtuple: HashMap::new(),
            live: HashMap::new(),
            inv_live: HashMap::new(),
            parent: HashMap::new(),
            defined_at: HashMap::new(),
            originals: Vec::new(),
            mandatory: Vec::new(),
            labels: HashMap::new(),
            current_line: None,
            branch_depth: 0,
        }
    }

    /// Run both passes and apply the mandatory sharing. Runs at most once.
    pub fn run(&mut self) {
        if self.ran {
            return;
        }
        self.ran = true;
        if let Err(Unsupported(reason)) = self.analyze() {
            warn!(reason, "liveness analysis failed, memory sharing disabled");
            self.failure = Some(reason);
            return;
        }
        debug!(
            fake_vars = self.parent.len(),
            lines = self.live.len(),
            mandatory = self.mandatory.len(),
            "liveness analysis done"
        );
    }

    /// Whether the analysis produced usable results.
    pub fn is_success(&self) -> bool {
        self.ran && self.failure.is_none()
    }

    /// The reason the analysis failed, if it did.
    pub fn failure(&self) -> Option<&'static str> {
        self.failure
    }

    /// Original variable -> the fake tensor vars it contains.
    /// Empty when the analysis failed.
    pub fn results(&self) -> HashMap<Var, VSet> {
        if !self.is_success() {
            return HashMap::new();
        }
        self.originals
            .iter()
            .filter_map(|v| self.vset.get(v).map(|s| (v.clone(), s.clone())))
            .collect()
    }

    /// Lines (let variables) where `fake`'s sharing class is live.
    pub fn live_lines(&self, fake: &Var) -> Option<&VSet> {
        self.inv_live.get(&self.root(fake)?)
    }

    /// Fake vars live on entry to `line`.
    pub fn live_in(&self, line: &Var) -> Option<&VSet> {
        self.live.get(line)
    }

    /// The fake var of `var`, if it contains exactly one.
    pub fn tensor_var(&self, var: &Var) -> Option<Var> {
        let set = self.vset.get(var)?;
        if set.len() != 1 {
            return None;
        }
        set.iter().next().cloned()
    }

    /// Every fake var created by the analysis.
    pub fn fake_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.parent.keys().cloned().collect();
        vars.sort();
        vars
    }

    /// Root of `x`'s class, compressing the path on the way.
    pub fn find(&mut self, x: &Var) -> Option<Var> {
        let root = self.root(x)?;
        let mut cur = x.clone();
        while cur != root {
            let next = self.parent.insert(cur, root.clone())?;
            cur = next;
        }
        Some(root)
    }

    /// Merge the classes of `x` and `y`. Returns the new root (`y`'s).
    pub fn unite(&mut self, x: &Var, y: &Var) -> Option<Var> {
        let fx = self.find(x)?;
        let fy = self.find(y)?;
        if fx == fy {
            return Some(fy);
        }
        self.parent.insert(fx.clone(), fy.clone());
        let lines = self.inv_live.remove(&fx).unwrap_or_default();
        self.inv_live.entry(fy.clone()).or_default().extend(lines);
        Some(fy)
    }

    /// Whether the classes of `x` and `y` are ever live at the same line.
    pub fn intersect(&self, x: &Var, y: &Var) -> bool {
        match (self.live_lines(x), self.live_lines(y)) {
            (Some(sx), Some(sy)) => !sx.is_disjoint(sy),
            _ => false,
        }
    }

    /// (output, argument) fake var pairs forced to share storage.
    pub fn mandatory_shares(&self) -> &[(Var, Var)] {
        &self.mandatory
    }

    fn root(&self, x: &Var) -> Option<Var> {
        let mut cur = x;
        loop {
            let next = self.parent.get(cur)?;
            if next == cur {
                return Some(cur.clone());
            }
            cur = next;
        }
    }

    fn analyze(&mut self) -> Step<()> {
        let func = self.func.clone();
        for p in func.params() {
            let ty = p.annotation().cloned().unwrap_or_default();
            let created = self.create_from_type(&ty);
            self.init(p, &created);
            self.originals.push(p.clone());
        }
        self.forward_body(func.body())?;
        self.backward_body(func.body(), VSet::new());

        for fake in self.parent.keys() {
            self.inv_live.insert(fake.clone(), VSet::new());
        }
        for (line, set) in &self.live {
            for fake in set {
                if let Some(lines) = self.inv_live.get_mut(fake) {
                    lines.insert(line.clone());
                }
            }
        }
        for (fake, line) in &self.defined_at {
            if let Some(lines) = self.inv_live.get_mut(fake) {
                lines.insert(line.clone());
            }
        }

        for (out, arg) in self.mandatory.clone() {
            self.unite(&out, &arg);
        }
        Ok(())
    }

    // Variable creation

    fn fresh(&mut self, label: &'static str) -> Var {
        let n = self.labels.entry(label).or_insert(0);
        let var = Var::new(format!("{label}_{n}"), None);
        *n += 1;
        var
    }

    fn create_tensor(&mut self) -> Var {
        let t = self.fresh("t");
        self.vset.insert(t.clone(), VSet::from([t.clone()]));
        self.parent.insert(t.clone(), t.clone());
        if let Some(line) = &self.current_line {
            self.defined_at.insert(t.clone(), line.clone());
        }
        t
    }

    fn create_null(&mut self) -> Var {
        let n = self.fresh("n");
        self.vset.insert(n.clone(), VSet::new());
        n
    }

    fn create_set(&mut self, set: VSet) -> Var {
        let ms = self.fresh("ms");
        self.vset.insert(ms.clone(), set);
        ms
    }

    fn create_from_type(&mut self, ty: &Type) -> Var {
        match ty {
            Type::Tuple(fields) => {
                let fields: Vec<Var> = fields.iter().map(|f| self.create_from_type(f)).collect();
                let set = self.union_of(&fields);
                let tup = self.create_set(set);
                self.vtuple.insert(tup.clone(), fields);
                tup
            }
            Type::Func(_) | Type::Constraint(_) | Type::Ref(_) => self.create_null(),
            Type::Tensor(_) | Type::Incomplete | Type::Param(_) => self.create_tensor(),
        }
    }

    fn set_of(&self, var: &Var) -> VSet {
        self.vset.get(var).cloned().unwrap_or_default()
    }

    fn union_of(&self, vars: &[Var]) -> VSet {
        vars.iter().flat_map(|v| self.set_of(v)).collect()
    }

    /// Give `to` the contents (and tuple structure) of `from`.
    fn init(&mut self, to: &Var, from: &Var) {
        if let Some(fields) = self.vtuple.get(from).cloned() {
            self.vtuple.insert(to.clone(), fields);
        }
        let set = self.set_of(from);
        self.vset.insert(to.clone(), set);
    }

    fn closure_set(&self, func: &Function) -> VSet {
        self.union_of(&free_vars(func))
    }

    // Forward pass

    /// Analyze a let-chain; returns a variable holding its result's contents.
    fn forward_body(&mut self, body: &Expr) -> Step<Var> {
        let ell = ExplicitLetList::new(body);
        for (var, expr) in ell.vars.iter().zip(&ell.exprs) {
            self.forward_line(var, expr)?;
            self.originals.push(var.clone());
        }
        match ell.ret.kind() {
            ExprKind::Var(v) => Ok(v.clone()),
            _ => {
                let ret = self.fresh("r");
                self.forward_line(&ret, &ell.ret)?;
                Ok(ret)
            }
        }
    }

    fn forward_line(&mut self, var: &Var, expr: &Expr) -> Step<()> {
        let outer = self.current_line.replace(var.clone());
        let result = self.forward_expr(var, expr);
        self.current_line = outer;
        result
    }

    fn forward_expr(&mut self, var: &Var, expr: &Expr) -> Step<()> {
        match expr.kind() {
            ExprKind::Var(y) => self.init(var, y),
            ExprKind::Constant(_) | ExprKind::Op(_) | ExprKind::GlobalVar(_) => {
                self.vset.insert(var.clone(), VSet::new());
            }
            ExprKind::Function(f) => {
                let set = self.closure_set(f);
                self.vset.insert(var.clone(), set);
            }
            ExprKind::Call { op, args } => {
                if !args.iter().all(is_atom) {
                    return Err(Unsupported("call operand not in A-normal form"));
                }
                let ty = expr.ty();
                match op.kind() {
                    ExprKind::Op(op) => {
                        let out = self.create_from_type(&ty);
                        self.init(var, &out);
                        for &(out_idx, arg_idx) in op.inplace() {
                            self.record_share(&out, out_idx, args.get(arg_idx));
                        }
                    }
                    _ => {
                        if self.branch_depth > 0 {
                            return Err(Unsupported("closure invocation inside a branch"));
                        }
                        if matches!(ty, Type::Tuple(_)) {
                            return Err(Unsupported("closure invocation producing a tuple"));
                        }
                        let out = self.create_from_type(&ty);
                        self.init(var, &out);
                    }
                }
            }
            ExprKind::Tuple(fields) => {
                let mut vars = Vec::with_capacity(fields.len());
                for field in fields {
                    vars.push(self.atom_var(field)?);
                }
                let set = self.union_of(&vars);
                self.vset.insert(var.clone(), set);
                self.vtuple.insert(var.clone(), vars);
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let tuple = self.atom_var(tuple)?;
                let field = usize::try_from(*index)
                    .ok()
                    .and_then(|i| self.vtuple.get(&tuple)?.get(i).cloned());
                self.init(var, field.as_ref().unwrap_or(&tuple));
            }
            ExprKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.branch_depth += 1;
                let branches = self.forward_branches(then_branch, else_branch);
                self.branch_depth -= 1;
                let (then_ret, else_ret) = branches?;
                let merged = self.merge_branches(&then_ret, &else_ret);
                self.init(var, &merged);
            }
            ExprKind::Let { .. } => {
                let ret = self.forward_body(expr)?;
                self.init(var, &ret);
            }
            ExprKind::RefCreate(_) | ExprKind::RefRead(_) | ExprKind::RefWrite { .. } => {
                return Err(Unsupported("reference cells"));
            }
        }
        Ok(())
    }

    fn forward_branches(&mut self, then_branch: &Expr, else_branch: &Expr) -> Step<(Var, Var)> {
        Ok((self.forward_body(then_branch)?, self.forward_body(else_branch)?))
    }

    fn record_share(&mut self, out: &Var, out_idx: usize, arg: Option<&Expr>) {
        let out_field = match self.vtuple.get(out) {
            Some(fields) => fields.get(out_idx).cloned(),
            None => (out_idx == 0).then(|| out.clone()),
        };
        let arg = arg.and_then(Expr::as_var);
        if let (Some(o), Some(a)) = (out_field, arg) {
            if let (Some(to), Some(ta)) = (self.tensor_var(&o), self.tensor_var(a)) {
                self.mandatory.push((to, ta));
            }
        }
    }

    /// Contents of an If: union of both branches, tuple fields pointwise.
    fn merge_branches(&mut self, a: &Var, b: &Var) -> Var {
        let fields = match (self.vtuple.get(a).cloned(), self.vtuple.get(b).cloned()) {
            (Some(fa), Some(fb)) if fa.len() == fb.len() => Some(
                fa.iter()
                    .zip(&fb)
                    .map(|(x, y)| self.merge_branches(x, y))
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };
        let set = self.union_of(&[a.clone(), b.clone()]);
        let merged = self.create_set(set);
        if let Some(fields) = fields {
            self.vtuple.insert(merged.clone(), fields);
        }
        merged
    }

    fn atom_var(&mut self, e: &Expr) -> Step<Var> {
        match e.kind() {
            ExprKind::Var(v) => Ok(v.clone()),
            ExprKind::Constant(_) | ExprKind::Op(_) | ExprKind::GlobalVar(_) => Ok(self.create_null()),
            ExprKind::Function(f) => {
                let set = self.closure_set(f);
                Ok(self.create_set(set))
            }
            _ => Err(Unsupported("operand not in A-normal form")),
        }
    }

    // Backward pass

    /// Fill `live` for every line of `body`; returns the live-in of its first
    /// line (or of the return value, for a body without lines).
    fn backward_body(&mut self, body: &Expr, live_out: VSet) -> VSet {
        let ell = ExplicitLetList::new(body);
        let mut live = live_out;
        live.extend(self.used(&ell.ret));
        for (var, expr) in ell.vars.iter().zip(&ell.exprs).rev() {
            let mut remain = live;
            for t in self.set_of(var) {
                remain.remove(&t);
            }
            let live_in = match expr.kind() {
                ExprKind::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    let mut live_in = self.backward_body(then_branch, remain.clone());
                    live_in.extend(self.backward_body(else_branch, remain));
                    live_in.extend(self.used(cond));
                    live_in
                }
                ExprKind::Let { .. } => self.backward_body(expr, remain),
                _ => {
                    let mut live_in = remain;
                    live_in.extend(self.used(expr));
                    live_in
                }
            };
            self.live.insert(var.clone(), live_in.clone());
            live = live_in;
        }
        live
    }

    /// Fake vars whose values `expr` reads.
    fn used(&self, expr: &Expr) -> VSet {
        match expr.kind() {
            ExprKind::Var(v) => self.set_of(v),
            ExprKind::Function(f) => self.closure_set(f),
            ExprKind::Call { op, args } => {
                let mut set = self.used(op);
                for a in args {
                    set.extend(self.used(a));
                }
                set
            }
            ExprKind::Tuple(fields) => fields.iter().flat_map(|f| self.used(f)).collect(),
            ExprKind::TupleGetItem { tuple, index } => {
                let field = tuple.as_var().and_then(|t| {
                    let i = usize::try_from(*index).ok()?;
                    self.vtuple.get(t)?.get(i).cloned()
                });
                match field {
                    Some(f) => self.set_of(&f),
                    None => self.used(tuple),
                }
            }
            ExprKind::Constant(_)
            | ExprKind::Op(_)
            | ExprKind::GlobalVar(_)
            | ExprKind::If { .. }
            | ExprKind::Let { .. }
            | ExprKind::RefCreate(_)
            | ExprKind::RefRead(_)
            | ExprKind::RefWrite { .. } => VSet::new(),
        }
    }
}

fn is_atom(e: &Expr) -> bool {
    matches!(
        e.kind(),
        ExprKind::Var(_)
            | ExprKind::Constant(_)
            | ExprKind::Op(_)
            | ExprKind::GlobalVar(_)
            | ExprKind::Function(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ir::TensorType;
    use ember_core::DType;

    fn tensor() -> Type {
        Type::Tensor(TensorType::fixed(&[4], DType::F32))
    }

    #[test]
    fn test_fake_var_names() {
        let x = Var::new("x", Some(Type::Tuple(vec![tensor(), tensor()])));
        let f = Function::new(vec![x.clone()], Expr::var(&x));
        let mut la = LivenessAnalyzer::new(&f);
        la.run();
        assert!(la.is_success());
        let names: Vec<String> = la.fake_vars().iter().map(|v| v.name_hint().to_string()).collect();
        assert_eq!(names, vec!["t_0", "t_1"]);
        assert_eq!(la.results()[&x].len(), 2);
        assert!(la.tensor_var(&x).is_none());
    }

    #[test]
    fn test_ref_cells_fail() {
        let x = Var::new("x", Some(tensor()));
        let r = Var::new("r", None);
        let f = Function::new(
            vec![x.clone()],
            Expr::let_(&r, Expr::ref_create(Expr::var(&x)), Expr::var(&r)),
        );
        let mut la = LivenessAnalyzer::new(&f);
        la.run();
        assert!(!la.is_success());
        assert_eq!(la.failure(), Some("reference cells"));
        assert!(la.results().is_empty());
    }

    #[test]
    fn test_not_run_is_not_success() {
        let x = Var::new("x", None);
        let la = LivenessAnalyzer::new(&Function::new(vec![x.clone()], Expr::var(&x)));
        assert!(!la.is_success());
    }
}
