//! Partially solved systems.
//!
//! Some dependent variables of a system often have closed forms: a conserved total, or
//! the analytic solution of the first link of a decay chain. A [`PartiallySolvedSystem`]
//! replaces them by their closed forms, integrates the remaining (free) variables, and
//! reconstructs the removed ones from every sample afterwards.
//!
//! Closed forms may use the initial values, so the reduced system takes the initial
//! point as extra parameters: the inner parameters followed by `x0, y0_0, .., y0_{n-1}`.
//! Those are filled in automatically when a problem is integrated.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use symode::{partial::PartiallySolvedSystem, system::SymbolicSystem};
//!
//! let chain = SymbolicSystem::from_callback(
//!     |_x, y, p| vec![-&p[0] * &y[0], &p[0] * &y[0] - &p[1] * &y[1], &p[1] * &y[1]],
//!     3,
//!     2,
//! )
//! .unwrap();
//! // the total is conserved, so the last variable follows from the other two
//! let reduced = PartiallySolvedSystem::new(Arc::new(chain), |s| {
//!     let total = &s.y0[0] + &s.y0[1] + &s.y0[2];
//!     [(s.dep[2].clone(), total - &s.dep[0] - &s.dep[1])]
//! })
//! .unwrap();
//! assert_eq!(reduced.free_ny(), 2);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::{
    errors::SystemError,
    expr::Expr,
    model::{OdeModel, Prepared},
    system::{SymbolView, SymbolicSystem, SystemBuilder},
    types::CompiledFunction,
};

/// Symbols handed to the closed-form builder of a [`PartiallySolvedSystem`].
pub struct InitialSymbols<'a> {
    /// Initial value of the independent variable.
    pub x0: &'a Expr,
    /// Initial values of the dependent variables.
    pub y0: SymbolView<'a>,
    /// Parameters of the inner system.
    pub p: SymbolView<'a>,
    /// Independent variable.
    pub x: &'a Expr,
    /// Dependent variables of the inner system.
    pub dep: SymbolView<'a>,
}

/// An inner model with some dependent variables replaced by closed forms.
pub struct PartiallySolvedSystem {
    inner: Arc<dyn OdeModel>,
    system: SymbolicSystem,
    init_indep: Expr,
    init_dep: Vec<Expr>,
    /// Inner positions of the integrated variables
    free: Vec<usize>,
    /// Inner positions of the removed variables, with their closed forms
    removed: Vec<(usize, Expr)>,
    /// Closed forms of the removed variables, over the reduced layout
    reconstruct: CompiledFunction,
}

impl fmt::Debug for PartiallySolvedSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartiallySolvedSystem")
            .field("removed", &self.removed)
            .field("system", &self.system)
            .field("inner", &self.inner)
            .finish()
    }
}

impl PartiallySolvedSystem {
    /// Reduces `inner` by the closed forms `builder` returns, as `(dep symbol, expression)`.
    ///
    /// # Errors
    /// - `ConfigurationError` if a key is not a dependent symbol of `inner`, is given
    ///   twice, or an expression uses an unknown symbol
    /// - `CyclicSubstitutionError` if closed forms depend on each other in a cycle
    pub fn new<F, I>(inner: Arc<dyn OdeModel>, builder: F) -> Result<Self, SystemError>
    where
        F: FnOnce(&InitialSymbols<'_>) -> I,
        I: IntoIterator<Item = (Expr, Expr)>,
    {
        let base = inner.symbolic();
        let backend = base.backend().clone();
        let x_name = base
            .indep()
            .as_var()
            .ok_or_else(|| SystemError::config("independent variable is not a symbol"))?;
        let dep_names: Vec<&str> = base.dep().iter().filter_map(Expr::as_var).collect();

        let init_indep = Expr::var(format!("{x_name}_init"));
        let init_dep: Vec<Expr> = dep_names.iter().map(|n| Expr::var(format!("{n}_init"))).collect();
        for symbol in std::iter::once(&init_indep).chain(&init_dep) {
            if let Some(name) = symbol.as_var().filter(|n| base.layout().contains_key(*n)) {
                return Err(SystemError::config(format!(
                    "symbol {name:?} clashes with the initial-value symbols"
                )));
            }
        }

        let pairs: Vec<(Expr, Expr)> = {
            let symbols = InitialSymbols {
                x0: &init_indep,
                y0: SymbolView::new("initial value", &init_dep, base.names()),
                p: SymbolView::new("parameter", base.params(), base.param_names()),
                x: base.indep(),
                dep: SymbolView::new("dependent variable", base.dep(), base.names()),
            };
            let pairs = builder(&symbols).into_iter().collect();
            symbols.y0.check()?;
            symbols.p.check()?;
            symbols.dep.check()?;
            pairs
        };

        let label = |i: usize| match base.names() {
            Some(names) => names[i].clone(),
            None => dep_names[i].to_string(),
        };

        let mut subs: Vec<(usize, Expr)> = Vec::with_capacity(pairs.len());
        for (key, expr) in pairs {
            let i = key
                .as_var()
                .and_then(|k| dep_names.iter().position(|n| *n == k))
                .ok_or_else(|| SystemError::config(format!("{key} is not a dependent variable")))?;
            if subs.iter().any(|(j, _)| *j == i) {
                return Err(SystemError::config(format!("{} is substituted twice", label(i))));
            }
            let known = |s: &String| {
                base.layout().contains_key(s)
                    || std::iter::once(&init_indep)
                        .chain(&init_dep)
                        .any(|e| e.as_var() == Some(s.as_str()))
            };
            if let Some(unknown) = expr.free_symbols().into_iter().find(|s| !known(s)) {
                return Err(SystemError::config(format!(
                    "closed form of {} uses undeclared symbol {unknown:?}",
                    label(i)
                )));
            }
            subs.push((i, expr));
        }

        let order = closure_order(&subs, &dep_names).map_err(|cycle| {
            SystemError::CyclicSubstitutionError(cycle.into_iter().map(|k| label(subs[k].0)).collect())
        })?;
        let mut closed: HashMap<String, Expr> = HashMap::new();
        for k in order {
            let (i, expr) = &subs[k];
            closed.insert(dep_names[*i].to_string(), backend.substitute(expr, &closed));
        }
        let mut removed: Vec<(usize, Expr)> = subs
            .iter()
            .map(|(i, _)| (*i, closed[dep_names[*i]].clone()))
            .collect();
        removed.sort_by_key(|(i, _)| *i);

        let free: Vec<usize> = (0..base.ny()).filter(|i| !closed.contains_key(dep_names[*i])).collect();
        let exprs: Vec<Expr> = free
            .iter()
            .map(|&i| backend.substitute(&base.exprs()[i], &closed))
            .collect();
        let dep: Vec<Expr> = free.iter().map(|&i| base.dep()[i].clone()).collect();
        let params: Vec<Expr> = base
            .params()
            .iter()
            .chain(std::iter::once(&init_indep))
            .chain(&init_dep)
            .cloned()
            .collect();
        let roots = base.roots().iter().map(|r| backend.substitute(r, &closed)).collect();

        let mut builder = SystemBuilder::new().roots(roots).backend(backend.clone());
        if base.names().is_some() {
            builder = builder.names(free.iter().map(|&i| label(i)));
        }
        if let Some(names) = base.param_names() {
            let init_names = std::iter::once(format!("{x_name}_init"))
                .chain((0..base.ny()).map(|i| format!("{}_init", label(i))));
            builder = builder.param_names(names.iter().cloned().chain(init_names));
        }
        let system = builder.from_parts(base.indep().clone(), dep, params, exprs)?;

        let closed_forms: Vec<Expr> = removed.iter().map(|(_, e)| e.clone()).collect();
        let reconstruct = backend.compile(&closed_forms, system.layout())?;

        log::debug!(
            "partially solved system: {} of {} variables removed, {} integrated",
            removed.len(),
            base.ny(),
            free.len()
        );

        Ok(Self {
            inner,
            system,
            init_indep,
            init_dep,
            free,
            removed,
            reconstruct,
        })
    }

    /// The reduced system that is integrated.
    pub fn system(&self) -> &SymbolicSystem {
        &self.system
    }

    pub fn inner(&self) -> &Arc<dyn OdeModel> {
        &self.inner
    }

    /// Number of integrated (free) variables.
    pub fn free_ny(&self) -> usize {
        self.free.len()
    }

    /// Labels of the free variables: their names if declared, their symbols otherwise.
    pub fn free_names(&self) -> Vec<String> {
        self.system
            .dep()
            .iter()
            .enumerate()
            .map(|(i, s)| match self.system.names() {
                Some(names) => names[i].clone(),
                None => s.to_string(),
            })
            .collect()
    }

    /// Symbols of the initial dependent values.
    pub fn init_dep(&self) -> &[Expr] {
        &self.init_dep
    }

    /// Symbol of the initial independent value.
    pub fn init_indep(&self) -> &Expr {
        &self.init_indep
    }

    /// Closed form of a removed variable, by name or by symbol.
    pub fn substitution(&self, name: &str) -> Option<&Expr> {
        let base = self.inner.symbolic();
        let i = base
            .names()
            .and_then(|names| names.iter().position(|n| n == name))
            .or_else(|| base.dep().iter().position(|s| s.as_var() == Some(name)))?;
        self.removed.iter().find(|(j, _)| *j == i).map(|(_, e)| e)
    }
}

/// Order in which substitutions can be closed, dependencies first.
///
/// Fails with the indices along a cycle, the first one repeated at the end.
fn closure_order(subs: &[(usize, Expr)], dep_names: &[&str]) -> Result<Vec<usize>, Vec<usize>> {
    let deps: Vec<Vec<usize>> = subs
        .iter()
        .map(|(_, expr)| {
            (0..subs.len())
                .filter(|&k| expr.contains_var(dep_names[subs[k].0]))
                .collect()
        })
        .collect();

    fn visit(
        k: usize,
        deps: &[Vec<usize>],
        done: &mut HashSet<usize>,
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), Vec<usize>> {
        if done.contains(&k) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|&p| p == k) {
            let mut cycle = path[start..].to_vec();
            cycle.push(k);
            return Err(cycle);
        }
        path.push(k);
        for &d in &deps[k] {
            visit(d, deps, done, path, order)?;
        }
        path.pop();
        done.insert(k);
        order.push(k);
        Ok(())
    }

    let mut done = HashSet::new();
    let mut order = Vec::with_capacity(subs.len());
    for k in 0..subs.len() {
        visit(k, &deps, &mut done, &mut Vec::new(), &mut order)?;
    }
    Ok(order)
}

impl OdeModel for PartiallySolvedSystem {
    fn symbolic(&self) -> &SymbolicSystem {
        &self.system
    }

    fn ny(&self) -> usize {
        self.inner.ny()
    }

    fn nparams(&self) -> usize {
        self.inner.nparams()
    }

    fn names(&self) -> Option<&[String]> {
        self.inner.names()
    }

    fn param_names(&self) -> Option<&[String]> {
        self.inner.param_names()
    }

    fn lower_bounds(&self) -> Option<&[f64]> {
        self.inner.lower_bounds()
    }

    fn upper_bounds(&self) -> Option<&[f64]> {
        self.inner.upper_bounds()
    }

    fn pre_process(&self, x: &[f64], y0: &[f64], params: &[f64]) -> Result<Prepared, SystemError> {
        let Prepared { x, y0, mut params } = self.inner.pre_process(x, y0, params)?;
        params.push(x[0]);
        params.extend_from_slice(&y0);
        let y0 = self.free.iter().map(|&i| y0[i]).collect();
        Ok(Prepared { x, y0, params })
    }

    fn post_process(
        &self,
        x: &[f64],
        y: &[Vec<f64>],
        params: &[f64],
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>), SystemError> {
        let ny = self.inner.symbolic().ny();
        let mut values = vec![0.0; self.removed.len()];
        let mut full = Vec::with_capacity(y.len());
        for (&xi, yi) in x.iter().zip(y) {
            let input = self.system.input(xi, yi, params)?;
            (self.reconstruct)(&input, &mut values);
            let mut row = vec![0.0; ny];
            for (&i, v) in self.free.iter().zip(yi) {
                row[i] = *v;
            }
            for ((i, _), v) in self.removed.iter().zip(&values) {
                row[*i] = *v;
            }
            full.push(row);
        }
        let inner_np = self.inner.symbolic().nparams();
        self.inner.post_process(x, &full, &params[..inner_np.min(params.len())])
    }
}
