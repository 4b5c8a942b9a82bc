//! Symbolic ODE systems.
//!
//! A [`SymbolicSystem`] holds one right-hand-side expression per dependent variable,
//! written over the independent variable, the dependent variables and the parameters.
//! Everything else is derived from it: the dense and banded Jacobian, compiled
//! evaluation functions and the numeric Jacobian handed to integrators.
//!
//! # Features
//!
//! - Construction from explicit `(symbol, rhs)` pairs, from a callback or from strings
//! - Optional names for dependent variables and parameters
//! - Bounds, root expressions and first-step hints
//! - Jacobian derived on demand and cached
//! - Banded Jacobian extraction
//! - Lazily compiled evaluation through the injected [`SymbolicBackend`]
//!
//! # Example
//!
//! ```
//! use symode::system::SymbolicSystem;
//!
//! // A --k0--> B --k1--> C
//! let system = SymbolicSystem::from_callback(
//!     |_x, y, p| vec![-&p[0] * &y[0], &p[0] * &y[0] - &p[1] * &y[1], &p[1] * &y[1]],
//!     3,
//!     2,
//! )
//! .unwrap();
//!
//! let mut dydx = [0.0; 3];
//! system.eval_rhs(0.0, &[1.0, 0.0, 0.0], &[4.0, 3.0], &mut dydx).unwrap();
//! assert_eq!(dydx, [-4.0, 4.0, 0.0]);
//! ```

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::Index;
use std::sync::{Arc, OnceLock};

use colored::Colorize;
use itertools::Itertools;
use nalgebra::DMatrix;

use crate::{
    backend::{default_backend, SymbolicBackend},
    convert::parse,
    errors::SystemError,
    expr::Expr,
    types::{CompiledFunction, FirstStepFactory, Layout},
};

/// Placeholder handed out for invalid symbol lookups inside callbacks.
static MISSING: Expr = Expr::Const(0.0);

/// Right-hand sides returned by a callback.
#[derive(Debug, Clone)]
pub enum Rhs {
    /// One expression per dependent variable, in order.
    Ordered(Vec<Expr>),
    /// Expressions keyed by dependent-variable name.
    Named(HashMap<String, Expr>),
}

impl From<Vec<Expr>> for Rhs {
    fn from(exprs: Vec<Expr>) -> Self {
        Rhs::Ordered(exprs)
    }
}

impl From<HashMap<String, Expr>> for Rhs {
    fn from(exprs: HashMap<String, Expr>) -> Self {
        Rhs::Named(exprs)
    }
}

/// Read-only view on a list of symbols, indexable by position or by name.
///
/// Lookups never panic. An unknown name, a name lookup when no names are declared, or an
/// index out of range is recorded and yields a placeholder; the construction that handed
/// out the view then fails with [`SystemError::ConfigurationError`].
pub struct SymbolView<'a> {
    kind: &'static str,
    symbols: &'a [Expr],
    names: Option<&'a [String]>,
    misses: RefCell<Vec<String>>,
}

impl<'a> SymbolView<'a> {
    pub(crate) fn new(kind: &'static str, symbols: &'a [Expr], names: Option<&'a [String]>) -> Self {
        Self {
            kind,
            symbols,
            names,
            misses: RefCell::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Expr> {
        self.symbols.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'a, Expr> {
        self.symbols.iter()
    }

    pub fn as_slice(&self) -> &'a [Expr] {
        self.symbols
    }

    fn miss(&self, what: String) -> &Expr {
        self.misses.borrow_mut().push(what);
        &MISSING
    }

    /// Fails if any lookup through this view was invalid.
    pub(crate) fn check(&self) -> Result<(), SystemError> {
        let misses = self.misses.borrow();
        if misses.is_empty() {
            return Ok(());
        }
        Err(SystemError::config(format!(
            "invalid {} lookup: {}",
            self.kind,
            misses.iter().join(", ")
        )))
    }
}

impl Index<usize> for SymbolView<'_> {
    type Output = Expr;

    fn index(&self, index: usize) -> &Expr {
        match self.symbols.get(index) {
            Some(symbol) => symbol,
            None => self.miss(format!("index {index} out of range ({} declared)", self.len())),
        }
    }
}

impl Index<&str> for SymbolView<'_> {
    type Output = Expr;

    fn index(&self, name: &str) -> &Expr {
        let Some(names) = self.names else {
            return self.miss(format!("{name:?} requested but no names are declared"));
        };
        match names.iter().position(|n| n == name) {
            Some(i) => &self.symbols[i],
            None => self.miss(format!("unknown name {name:?}")),
        }
    }
}

/// First-step hint of a system.
#[derive(Clone)]
pub enum FirstStep {
    /// Expression over the system's symbols, evaluated at the initial point.
    Expr(Expr),
    /// Numeric heuristic called with `(x0, y0, params)`.
    Factory(FirstStepFactory),
}

impl fmt::Debug for FirstStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirstStep::Expr(expr) => write!(f, "FirstStep::Expr({expr})"),
            FirstStep::Factory(_) => f.write_str("FirstStep::Factory(..)"),
        }
    }
}

/// Optional settings of a [`SymbolicSystem`], consumed by one of the `from_*` methods.
#[derive(Default)]
pub struct SystemBuilder {
    names: Option<Vec<String>>,
    param_names: Option<Vec<String>>,
    indep: Option<String>,
    params: Option<Vec<Expr>>,
    lower_bounds: Option<Vec<f64>>,
    upper_bounds: Option<Vec<f64>>,
    roots: Vec<Expr>,
    first_step: Option<FirstStep>,
    band: Option<(usize, usize)>,
    backend: Option<Arc<dyn SymbolicBackend>>,
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the dependent variables, one per variable.
    pub fn names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Names of the parameters, one per parameter.
    pub fn param_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.param_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Symbol of the independent variable, `x` unless set.
    pub fn indep(mut self, name: impl Into<String>) -> Self {
        self.indep = Some(name.into());
        self
    }

    /// Explicit parameter symbols for [`SystemBuilder::from_pairs`].
    pub fn params(mut self, params: Vec<Expr>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn lower_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.lower_bounds = Some(bounds);
        self
    }

    pub fn upper_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.upper_bounds = Some(bounds);
        self
    }

    /// Root (event) expressions; a sign change of any of them is reported.
    pub fn roots(mut self, roots: Vec<Expr>) -> Self {
        self.roots = roots;
        self
    }

    pub fn first_step_expr(mut self, expr: Expr) -> Self {
        self.first_step = Some(FirstStep::Expr(expr));
        self
    }

    pub fn first_step_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.first_step = Some(FirstStep::Factory(Arc::new(factory)));
        self
    }

    /// Lower and upper bandwidth of the Jacobian.
    pub fn band(mut self, ml: usize, mu: usize) -> Self {
        self.band = Some((ml, mu));
        self
    }

    pub fn backend(mut self, backend: Arc<dyn SymbolicBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Builds a system from a callback.
    ///
    /// The callback receives the independent variable and views on the `ny` dependent
    /// variables (`y_0`, `y_1`, ...) and `nparams` parameters (`p_0`, ...). Views can be
    /// indexed by position, or by name when names were declared.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the callback returns a number of expressions other than `ny`
    /// - `ConfigurationError` for by-name access without declared names, or unknown names
    pub fn from_callback<F, R>(self, callback: F, ny: usize, nparams: usize) -> Result<SymbolicSystem, SystemError>
    where
        F: FnOnce(&Expr, &SymbolView<'_>, &SymbolView<'_>) -> R,
        R: Into<Rhs>,
    {
        validate_names(self.names.as_deref(), ny, "dependent variable")?;
        validate_names(self.param_names.as_deref(), nparams, "parameter")?;

        let indep = Expr::var(self.indep.as_deref().unwrap_or("x"));
        let dep: Vec<Expr> = (0..ny).map(|i| Expr::var(format!("y_{i}"))).collect();
        let params: Vec<Expr> = (0..nparams).map(|i| Expr::var(format!("p_{i}"))).collect();

        let rhs = {
            let y = SymbolView::new("dependent variable", &dep, self.names.as_deref());
            let p = SymbolView::new("parameter", &params, self.param_names.as_deref());
            let rhs = callback(&indep, &y, &p).into();
            y.check()?;
            p.check()?;
            rhs
        };

        let exprs = match rhs {
            Rhs::Ordered(exprs) => exprs,
            Rhs::Named(mut by_name) => {
                let names = self.names.as_deref().ok_or_else(|| {
                    SystemError::config("callback returned named expressions, but no names are declared")
                })?;
                if by_name.len() != ny {
                    return Err(SystemError::dimension("callback output", ny, by_name.len()));
                }
                names
                    .iter()
                    .map(|name| {
                        by_name.remove(name).ok_or_else(|| {
                            SystemError::config(format!("callback output misses {name:?}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        if exprs.len() != ny {
            return Err(SystemError::dimension("callback output", ny, exprs.len()));
        }

        self.from_parts(indep, dep, params, exprs)
    }

    /// Builds a system from `(dependent symbol, rhs)` pairs.
    ///
    /// Parameters are the explicit [`SystemBuilder::params`] if given, otherwise the
    /// remaining free symbols sorted by name.
    pub fn from_pairs(mut self, pairs: Vec<(Expr, Expr)>) -> Result<SymbolicSystem, SystemError> {
        let indep = Expr::var(self.indep.as_deref().unwrap_or("x"));
        let (dep, exprs): (Vec<Expr>, Vec<Expr>) = pairs.into_iter().unzip();
        let params = match self.params.take() {
            Some(params) => params,
            None => {
                let bound: HashSet<&str> = dep
                    .iter()
                    .filter_map(Expr::as_var)
                    .chain(indep.as_var())
                    .collect();
                let free: BTreeSet<String> = exprs
                    .iter()
                    .chain(&self.roots)
                    .flat_map(Expr::free_symbols)
                    .filter(|s| !bound.contains(s.as_str()))
                    .collect();
                free.into_iter().map(Expr::Var).collect()
            }
        };
        self.from_parts(indep, dep, params, exprs)
    }

    /// Builds a system by parsing one right-hand side per string.
    ///
    /// Identifiers resolve against the declared names, then the canonical symbols `x`,
    /// `y_i` and `p_i`. The number of dependent variables is the number of strings.
    pub fn from_strings(self, rhs: &[&str], nparams: usize) -> Result<SymbolicSystem, SystemError> {
        let ny = rhs.len();
        validate_names(self.names.as_deref(), ny, "dependent variable")?;
        validate_names(self.param_names.as_deref(), nparams, "parameter")?;

        let indep = Expr::var(self.indep.as_deref().unwrap_or("x"));
        let dep: Vec<Expr> = (0..ny).map(|i| Expr::var(format!("y_{i}"))).collect();
        let params: Vec<Expr> = (0..nparams).map(|i| Expr::var(format!("p_{i}"))).collect();

        let exprs = {
            let lookup = |name: &str| -> Option<Expr> {
                let by_name = |names: &Option<Vec<String>>, symbols: &[Expr]| {
                    names
                        .as_ref()
                        .and_then(|names| names.iter().position(|n| n == name))
                        .map(|i| symbols[i].clone())
                };
                by_name(&self.names, &dep)
                    .or_else(|| by_name(&self.param_names, &params))
                    .or_else(|| {
                        std::iter::once(&indep)
                            .chain(&dep)
                            .chain(&params)
                            .find(|s| s.as_var() == Some(name))
                            .cloned()
                    })
            };
            rhs.iter()
                .map(|text| parse(text, &lookup))
                .collect::<Result<Vec<_>, _>>()?
        };

        self.from_parts(indep, dep, params, exprs)
    }

    /// Builds a system from its symbols and right-hand sides.
    ///
    /// This is the constructor every other path ends in; all validation happens here.
    pub fn from_parts(
        self,
        indep: Expr,
        dep: Vec<Expr>,
        params: Vec<Expr>,
        exprs: Vec<Expr>,
    ) -> Result<SymbolicSystem, SystemError> {
        let ny = dep.len();
        if exprs.len() != ny {
            return Err(SystemError::dimension("right-hand sides", ny, exprs.len()));
        }
        validate_names(self.names.as_deref(), ny, "dependent variable")?;
        validate_names(self.param_names.as_deref(), params.len(), "parameter")?;
        for (what, bounds) in [("lower bounds", &self.lower_bounds), ("upper bounds", &self.upper_bounds)] {
            if let Some(bounds) = bounds {
                if bounds.len() != ny {
                    return Err(SystemError::dimension(what, ny, bounds.len()));
                }
            }
        }
        if let (Some(lower), Some(upper)) = (&self.lower_bounds, &self.upper_bounds) {
            if let Some(i) = (0..ny).find(|&i| lower[i] > upper[i]) {
                return Err(SystemError::config(format!(
                    "lower bound {} exceeds upper bound {} of variable {i}",
                    lower[i], upper[i]
                )));
            }
        }

        let mut layout = Layout::new();
        for (slot, symbol) in std::iter::once(&indep).chain(&dep).chain(&params).enumerate() {
            let name = symbol
                .as_var()
                .ok_or_else(|| SystemError::config(format!("{symbol} is not a symbol")))?;
            if layout.insert(name.to_string(), slot as u32).is_some() {
                return Err(SystemError::config(format!("symbol {name:?} declared twice")));
            }
        }

        let first_step_expr = match &self.first_step {
            Some(FirstStep::Expr(expr)) => Some(expr),
            _ => None,
        };
        for expr in exprs.iter().chain(&self.roots).chain(first_step_expr) {
            if let Some(unknown) = expr.free_symbols().into_iter().find(|s| !layout.contains_key(s)) {
                return Err(SystemError::config(format!(
                    "expression {expr} uses undeclared symbol {unknown:?}"
                )));
            }
        }

        Ok(SymbolicSystem {
            indep,
            dep,
            params,
            exprs,
            names: self.names,
            param_names: self.param_names,
            lower_bounds: self.lower_bounds,
            upper_bounds: self.upper_bounds,
            roots: self.roots,
            first_step: self.first_step,
            band: self.band,
            backend: self.backend.unwrap_or_else(default_backend),
            layout,
            jacobian: OnceLock::new(),
            rhs_fn: OnceLock::new(),
            jac_fn: OnceLock::new(),
            roots_fn: OnceLock::new(),
            first_step_fn: OnceLock::new(),
        })
    }
}

fn validate_names(names: Option<&[String]>, expected: usize, what: &'static str) -> Result<(), SystemError> {
    let Some(names) = names else {
        return Ok(());
    };
    if names.len() != expected {
        return Err(SystemError::config(format!(
            "{} {what} names declared for {expected} {what}s",
            names.len()
        )));
    }
    if let Some(dup) = names.iter().duplicates().next() {
        return Err(SystemError::config(format!("duplicate {what} name {dup:?}")));
    }
    Ok(())
}

/// Packs a dense square matrix into banded storage.
///
/// Row `r` holds the diagonal with offset `r - mu` (row index minus column index):
/// `banded[r][c] = dense[c + r - mu][c]`, `zero` where that row falls outside the matrix.
pub fn pack_banded<T: Clone>(dense: &[Vec<T>], ml: usize, mu: usize, zero: T) -> Vec<Vec<T>> {
    let n = dense.len();
    (0..ml + mu + 1)
        .map(|r| {
            (0..n)
                .map(|c| {
                    (c + r)
                        .checked_sub(mu)
                        .filter(|&row| row < n)
                        .map_or_else(|| zero.clone(), |row| dense[row][c].clone())
                })
                .collect()
        })
        .collect()
}

fn cached<'a>(
    cell: &'a OnceLock<CompiledFunction>,
    build: impl FnOnce() -> Result<CompiledFunction, SystemError>,
) -> Result<&'a CompiledFunction, SystemError> {
    if let Some(f) = cell.get() {
        return Ok(f);
    }
    let f = build()?;
    Ok(cell.get_or_init(|| f))
}

/// A system of first-order ODEs `dy/dx = f(x, y, p)` in symbolic form.
///
/// Immutable after construction; derived data is computed lazily and cached, so a
/// system can be shared between threads behind an `Arc`.
pub struct SymbolicSystem {
    indep: Expr,
    dep: Vec<Expr>,
    params: Vec<Expr>,
    exprs: Vec<Expr>,
    names: Option<Vec<String>>,
    param_names: Option<Vec<String>>,
    lower_bounds: Option<Vec<f64>>,
    upper_bounds: Option<Vec<f64>>,
    roots: Vec<Expr>,
    first_step: Option<FirstStep>,
    band: Option<(usize, usize)>,
    backend: Arc<dyn SymbolicBackend>,
    /// Input slots: `x`, then the dependent variables, then the parameters
    layout: Layout,
    jacobian: OnceLock<Vec<Vec<Expr>>>,
    rhs_fn: OnceLock<CompiledFunction>,
    jac_fn: OnceLock<CompiledFunction>,
    roots_fn: OnceLock<CompiledFunction>,
    first_step_fn: OnceLock<CompiledFunction>,
}

impl SymbolicSystem {
    /// Starts a [`SystemBuilder`].
    pub fn builder() -> SystemBuilder {
        SystemBuilder::new()
    }

    /// Creates a system from `(dependent symbol, rhs)` pairs with default settings.
    ///
    /// # Example
    /// ```
    /// # use symode::{expr::Expr, system::SymbolicSystem};
    /// let y = Expr::var("y");
    /// let system = SymbolicSystem::new(vec![(y.clone(), -Expr::var("k") * y)]).unwrap();
    /// assert_eq!(system.params(), &[Expr::var("k")]);
    /// ```
    pub fn new(pairs: Vec<(Expr, Expr)>) -> Result<Self, SystemError> {
        SystemBuilder::new().from_pairs(pairs)
    }

    /// Creates a system from a callback with default settings.
    ///
    /// See [`SystemBuilder::from_callback`].
    pub fn from_callback<F, R>(callback: F, ny: usize, nparams: usize) -> Result<Self, SystemError>
    where
        F: FnOnce(&Expr, &SymbolView<'_>, &SymbolView<'_>) -> R,
        R: Into<Rhs>,
    {
        SystemBuilder::new().from_callback(callback, ny, nparams)
    }

    pub fn exprs(&self) -> &[Expr] {
        &self.exprs
    }

    pub fn dep(&self) -> &[Expr] {
        &self.dep
    }

    pub fn params(&self) -> &[Expr] {
        &self.params
    }

    pub fn indep(&self) -> &Expr {
        &self.indep
    }

    pub fn ny(&self) -> usize {
        self.dep.len()
    }

    pub fn nparams(&self) -> usize {
        self.params.len()
    }

    pub fn names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }

    pub fn param_names(&self) -> Option<&[String]> {
        self.param_names.as_deref()
    }

    pub fn lower_bounds(&self) -> Option<&[f64]> {
        self.lower_bounds.as_deref()
    }

    pub fn upper_bounds(&self) -> Option<&[f64]> {
        self.upper_bounds.as_deref()
    }

    pub fn roots(&self) -> &[Expr] {
        &self.roots
    }

    pub fn first_step_hint(&self) -> Option<&FirstStep> {
        self.first_step.as_ref()
    }

    pub fn band(&self) -> Option<(usize, usize)> {
        self.band
    }

    pub fn backend(&self) -> &Arc<dyn SymbolicBackend> {
        &self.backend
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Symbol of the dependent variable called `name`.
    ///
    /// # Errors
    /// `ConfigurationError` if no names are declared or `name` is unknown.
    pub fn dep_by_name(&self, name: &str) -> Result<&Expr, SystemError> {
        lookup(self.names(), &self.dep, name, "dependent variable")
    }

    /// Symbol of the parameter called `name`.
    ///
    /// # Errors
    /// `ConfigurationError` if no parameter names are declared or `name` is unknown.
    pub fn param_by_name(&self, name: &str) -> Result<&Expr, SystemError> {
        lookup(self.param_names(), &self.params, name, "parameter")
    }

    /// Dense Jacobian `J[i][j] = d rhs_i / d y_j`, derived once and cached.
    pub fn jacobian(&self) -> &[Vec<Expr>] {
        self.jacobian.get_or_init(|| {
            log::debug!(
                "deriving {0}x{0} jacobian with {1}",
                self.ny(),
                self.backend.name()
            );
            self.exprs
                .iter()
                .map(|rhs| {
                    self.dep
                        .iter()
                        .filter_map(Expr::as_var)
                        .map(|wrt| self.backend.differentiate(rhs, wrt))
                        .collect()
                })
                .collect()
        })
    }

    /// Jacobian in banded storage with `ml + mu + 1` rows and `ny` columns.
    ///
    /// Row `r` holds the diagonal with offset `r - mu`; positions outside the matrix are
    /// zero. See [`pack_banded`].
    pub fn banded_jacobian(&self, ml: usize, mu: usize) -> Vec<Vec<Expr>> {
        pack_banded(self.jacobian(), ml, mu, Expr::Const(0.0))
    }

    /// Builds the input buffer `[x, y.., p..]` of the compiled functions.
    pub(crate) fn input(&self, x: f64, y: &[f64], p: &[f64]) -> Result<Vec<f64>, SystemError> {
        if y.len() != self.ny() {
            return Err(SystemError::dimension("dependent variables", self.ny(), y.len()));
        }
        if p.len() != self.nparams() {
            return Err(SystemError::dimension("parameters", self.nparams(), p.len()));
        }
        let mut input = Vec::with_capacity(1 + y.len() + p.len());
        input.push(x);
        input.extend_from_slice(y);
        input.extend_from_slice(p);
        Ok(input)
    }

    /// Compiled right-hand side, reading the `[x, y.., p..]` input buffer.
    pub fn rhs_function(&self) -> Result<&CompiledFunction, SystemError> {
        cached(&self.rhs_fn, || self.backend.compile(&self.exprs, &self.layout))
    }

    /// Compiled dense Jacobian, written row-major into an `ny * ny` buffer.
    pub fn jacobian_function(&self) -> Result<&CompiledFunction, SystemError> {
        cached(&self.jac_fn, || {
            let flat: Vec<Expr> = self.jacobian().iter().flatten().cloned().collect();
            self.backend.compile(&flat, &self.layout)
        })
    }

    /// Compiled root expressions.
    pub fn roots_function(&self) -> Result<&CompiledFunction, SystemError> {
        cached(&self.roots_fn, || self.backend.compile(&self.roots, &self.layout))
    }

    /// Evaluates the right-hand side into `out`.
    pub fn eval_rhs(&self, x: f64, y: &[f64], p: &[f64], out: &mut [f64]) -> Result<(), SystemError> {
        if out.len() != self.ny() {
            return Err(SystemError::dimension("output buffer", self.ny(), out.len()));
        }
        let input = self.input(x, y, p)?;
        (self.rhs_function()?)(&input, out);
        Ok(())
    }

    /// Evaluates the dense Jacobian.
    pub fn eval_jacobian(&self, x: f64, y: &[f64], p: &[f64]) -> Result<Vec<Vec<f64>>, SystemError> {
        let input = self.input(x, y, p)?;
        let n = self.ny();
        let mut flat = vec![0.0; n * n];
        (self.jacobian_function()?)(&input, &mut flat);
        Ok(flat.chunks(n.max(1)).take(n).map(<[f64]>::to_vec).collect())
    }

    /// Evaluates the Jacobian in banded storage, see [`SymbolicSystem::banded_jacobian`].
    pub fn banded_jacobian_values(
        &self,
        x: f64,
        y: &[f64],
        p: &[f64],
        ml: usize,
        mu: usize,
    ) -> Result<Vec<Vec<f64>>, SystemError> {
        Ok(pack_banded(&self.eval_jacobian(x, y, p)?, ml, mu, 0.0))
    }

    /// Evaluates the root expressions.
    pub fn eval_roots(&self, x: f64, y: &[f64], p: &[f64]) -> Result<Vec<f64>, SystemError> {
        let input = self.input(x, y, p)?;
        let mut out = vec![0.0; self.roots.len()];
        if !self.roots.is_empty() {
            (self.roots_function()?)(&input, &mut out);
        }
        Ok(out)
    }

    /// First step suggested by the system's hint, if it has one.
    pub fn first_step(&self, x0: f64, y0: &[f64], p: &[f64]) -> Result<Option<f64>, SystemError> {
        match &self.first_step {
            None => Ok(None),
            Some(FirstStep::Factory(factory)) => Ok(Some(factory(x0, y0, p))),
            Some(FirstStep::Expr(expr)) => {
                let input = self.input(x0, y0, p)?;
                let f = cached(&self.first_step_fn, || {
                    self.backend.compile(std::slice::from_ref(expr), &self.layout)
                })?;
                let mut out = [0.0];
                f(&input, &mut out);
                Ok(Some(out[0]))
            }
        }
    }

    /// Whether the Jacobian is structurally singular.
    ///
    /// The Jacobian is evaluated at a generic point and its numerical rank is compared
    /// with the number of dependent variables.
    pub fn jacobian_singular(&self) -> Result<bool, SystemError> {
        let n = self.ny();
        if n == 0 {
            return Ok(false);
        }
        // irrational offsets keep accidental cancellations unlikely
        let generic = |i: usize, offset: f64| 0.5 + ((i as f64 + offset) * 0.618_033_988_75).fract();
        let y: Vec<f64> = (0..n).map(|i| generic(i, 0.3)).collect();
        let p: Vec<f64> = (0..self.nparams()).map(|i| generic(i, 0.7)).collect();
        let jac = self.eval_jacobian(generic(0, 0.1), &y, &p)?;

        let entries: Vec<f64> = jac.into_iter().flatten().collect();
        if let Some(bad) = entries.iter().find(|v| !v.is_finite()) {
            return Err(SystemError::config(format!(
                "jacobian is not finite at a generic point ({bad})"
            )));
        }
        let scale = entries.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if scale == 0.0 {
            return Ok(true);
        }
        let matrix = DMatrix::from_row_slice(n, n, &entries);
        Ok(matrix.rank(scale * 1e-10) < n)
    }
}

fn lookup<'a>(
    names: Option<&[String]>,
    symbols: &'a [Expr],
    name: &str,
    what: &str,
) -> Result<&'a Expr, SystemError> {
    let names = names.ok_or_else(|| {
        SystemError::config(format!("{what} {name:?} requested by name, but no names are declared"))
    })?;
    names
        .iter()
        .position(|n| n == name)
        .map(|i| &symbols[i])
        .ok_or_else(|| SystemError::config(format!("unknown {what} name {name:?}")))
}

impl fmt::Debug for SymbolicSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Backend".cyan(), self.backend.name())?;
        writeln!(f, "    {}: {:?}", "Names".cyan(), self.names)?;
        writeln!(f, "    {}: {:?}", "Parameter names".cyan(), self.param_names)?;
        writeln!(f, "    {}: [{}]", "Parameters".cyan(), self.params.iter().join(", "))?;
        writeln!(f, "    {}:", "Equations".cyan())?;
        for line in self.to_string().lines() {
            writeln!(f, "        {line}")?;
        }
        if !self.roots.is_empty() {
            writeln!(f, "    {}: [{}]", "Roots".cyan(), self.roots.iter().join(", "))?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for SymbolicSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (symbol, rhs)) in self.dep.iter().zip(&self.exprs).enumerate() {
            let label = match self.names() {
                Some(names) => names[i].clone(),
                None => symbol.to_string(),
            };
            writeln!(f, "d{label}/d{} = {rhs}", self.indep)?;
        }
        Ok(())
    }
}
