//! Variable transforms.
//!
//! A [`TransformedSystem`] integrates an inner model in new coordinates
//! `u_i = f_i(y_i)` and `x̄ = g(x)`. Its right-hand side is derived symbolically with
//! the chain rule,
//!
//! ```text
//! du_i/dx̄ = f_i'(y_i) · rhs_i(x, y) / g'(x)    at y = f⁻¹(u), x = g⁻¹(x̄)
//! ```
//!
//! and keeps the symbol names of the inner system, so by-name access keeps working.
//! Initial values and output points are mapped forward before integration; samples are
//! mapped back afterwards.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use symode::{system::SymbolicSystem, transform::{Transform, TransformedSystem}};
//!
//! let decay = SymbolicSystem::from_callback(|_x, y, p| vec![-&p[0] * &y[0]], 1, 1).unwrap();
//! let logsys = TransformedSystem::new(Arc::new(decay), Some(Transform::log_exp()), None).unwrap();
//!
//! // d ln(y)/dx = -k everywhere
//! let mut du = [0.0];
//! logsys.system().eval_rhs(0.0, &[2.0f64.ln()], &[3.0], &mut du).unwrap();
//! assert!((du[0] + 3.0).abs() < 1e-12);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{
    errors::SystemError,
    expr::Expr,
    model::{OdeModel, Prepared},
    system::{SymbolView, SymbolicSystem, SystemBuilder},
    types::CompiledFunction,
};

/// Builds an expression from the expression of the variable being transformed.
pub type ExprMap = Arc<dyn Fn(Expr) -> Expr + Send + Sync>;

/// A pair of mutually inverse scalar maps, given as expression builders.
#[derive(Clone)]
pub struct Transform {
    name: String,
    forward: ExprMap,
    inverse: ExprMap,
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let probe = Expr::var("v");
        f.debug_struct("Transform")
            .field("name", &self.name)
            .field("forward", &format_args!("{}", self.forward(probe.clone())))
            .field("inverse", &format_args!("{}", self.inverse(probe)))
            .finish()
    }
}

impl Transform {
    /// A custom transform. `inverse(forward(v))` must equal `v` on the valid domain.
    pub fn new<F, I>(name: impl Into<String>, forward: F, inverse: I) -> Self
    where
        F: Fn(Expr) -> Expr + Send + Sync + 'static,
        I: Fn(Expr) -> Expr + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            forward: Arc::new(forward),
            inverse: Arc::new(inverse),
        }
    }

    pub fn identity() -> Self {
        Self::new("identity", |v| v, |u| u)
    }

    /// `u = ln(v)`, `v = exp(u)`.
    pub fn log_exp() -> Self {
        Self::new("log", Expr::ln, Expr::exp)
    }

    /// `u = ln(a·v + b)`, `v = (exp(u) - b) / a`.
    pub fn log_exp_scaled(a: f64, b: f64) -> Self {
        Self::new(
            format!("log({a}·v + {b})"),
            move |v| (a * v + b).ln(),
            move |u| (u.exp() - b) / a,
        )
    }

    /// `u = s·v`, `v = u / s`.
    pub fn scaling(s: f64) -> Self {
        Self::new(format!("scale({s})"), move |v| s * v, move |u| u / s)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forward(&self, v: Expr) -> Expr {
        (self.forward)(v)
    }

    pub fn inverse(&self, u: Expr) -> Expr {
        (self.inverse)(u)
    }
}

/// An inner model integrated in transformed coordinates.
pub struct TransformedSystem {
    inner: Arc<dyn OdeModel>,
    dep: Vec<Transform>,
    indep: Transform,
    system: SymbolicSystem,
    /// `f_i(y_i)` over the inner layout
    dep_forward: CompiledFunction,
    /// `f_i⁻¹(u_i)` over the transformed layout
    dep_inverse: CompiledFunction,
    indep_forward: CompiledFunction,
    indep_inverse: CompiledFunction,
}

impl fmt::Debug for TransformedSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformedSystem")
            .field("dep", &self.dep.iter().map(Transform::name).collect::<Vec<_>>())
            .field("indep", &self.indep.name())
            .field("system", &self.system)
            .field("inner", &self.inner)
            .finish()
    }
}

impl TransformedSystem {
    /// Applies the same transform to every dependent variable. `None` means identity.
    pub fn new(
        inner: Arc<dyn OdeModel>,
        dep: Option<Transform>,
        indep: Option<Transform>,
    ) -> Result<Self, SystemError> {
        let ny = inner.symbolic().ny();
        let dep = dep.unwrap_or_else(Transform::identity);
        Self::with_transforms(inner, vec![dep; ny], indep.unwrap_or_else(Transform::identity))
    }

    /// One transform per internal dependent variable of `inner`.
    pub fn with_transforms(
        inner: Arc<dyn OdeModel>,
        dep: Vec<Transform>,
        indep: Transform,
    ) -> Result<Self, SystemError> {
        let base = inner.symbolic();
        if dep.len() != base.ny() {
            return Err(SystemError::dimension("dependent transforms", base.ny(), dep.len()));
        }
        let backend = base.backend().clone();
        let x = base.indep();
        let x_name = symbol_name(x)?;

        let mut back = HashMap::new();
        for (symbol, transform) in base.dep().iter().zip(&dep) {
            back.insert(symbol_name(symbol)?.to_string(), transform.inverse(symbol.clone()));
        }
        back.insert(x_name.to_string(), indep.inverse(x.clone()));

        let g_prime = backend.differentiate(&indep.forward(x.clone()), x_name);
        let mut exprs = Vec::with_capacity(base.ny());
        for ((rhs, symbol), transform) in base.exprs().iter().zip(base.dep()).zip(&dep) {
            let f_prime = backend.differentiate(&transform.forward(symbol.clone()), symbol_name(symbol)?);
            exprs.push(backend.substitute(&(f_prime * rhs / &g_prime), &back));
        }
        let roots = base.roots().iter().map(|r| backend.substitute(r, &back)).collect();

        let mut builder = SystemBuilder::new().roots(roots).backend(backend.clone());
        if let Some(names) = base.names() {
            builder = builder.names(names.iter().cloned());
        }
        if let Some(names) = base.param_names() {
            builder = builder.param_names(names.iter().cloned());
        }
        if let Some((ml, mu)) = base.band() {
            builder = builder.band(ml, mu);
        }
        let system = builder.from_parts(x.clone(), base.dep().to_vec(), base.params().to_vec(), exprs)?;

        let forward: Vec<Expr> = base
            .dep()
            .iter()
            .zip(&dep)
            .map(|(s, t)| t.forward(s.clone()))
            .collect();
        let inverse: Vec<Expr> = base
            .dep()
            .iter()
            .zip(&dep)
            .map(|(s, t)| t.inverse(s.clone()))
            .collect();
        let dep_forward = backend.compile(&forward, base.layout())?;
        let dep_inverse = backend.compile(&inverse, system.layout())?;
        let indep_forward = backend.compile(&[indep.forward(x.clone())], base.layout())?;
        let indep_inverse = backend.compile(&[indep.inverse(x.clone())], system.layout())?;

        log::debug!(
            "transformed {} variables with [{}], independent variable with {}",
            base.ny(),
            dep.iter().map(Transform::name).collect::<Vec<_>>().join(", "),
            indep.name()
        );

        Ok(Self {
            inner,
            dep,
            indep,
            system,
            dep_forward,
            dep_inverse,
            indep_forward,
            indep_inverse,
        })
    }

    /// The system in transformed coordinates.
    pub fn system(&self) -> &SymbolicSystem {
        &self.system
    }

    pub fn inner(&self) -> &Arc<dyn OdeModel> {
        &self.inner
    }

    pub fn dep_transforms(&self) -> &[Transform] {
        &self.dep
    }

    pub fn indep_transform(&self) -> &Transform {
        &self.indep
    }
}

fn symbol_name(symbol: &Expr) -> Result<&str, SystemError> {
    symbol
        .as_var()
        .ok_or_else(|| SystemError::config(format!("{symbol} is not a symbol")))
}

fn ensure_finite(value: f64, from: f64, context: impl FnOnce() -> String) -> Result<f64, SystemError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SystemError::TransformDomainError {
            value: from,
            context: context(),
        })
    }
}

impl OdeModel for TransformedSystem {
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
        let Prepared { x, y0, params } = self.inner.pre_process(x, y0, params)?;
        let mut input = self.inner.symbolic().input(x[0], &y0, &params)?;

        let mut u0 = vec![0.0; y0.len()];
        (self.dep_forward)(&input, &mut u0);
        for (i, (&u, &y)) in u0.iter().zip(&y0).enumerate() {
            ensure_finite(u, y, || format!("forward {} of initial value {i}", self.dep[i].name()))?;
        }

        let mut out = [0.0];
        let mut xs = Vec::with_capacity(x.len());
        for &xi in &x {
            input[0] = xi;
            (self.indep_forward)(&input, &mut out);
            xs.push(ensure_finite(out[0], xi, || {
                format!("forward {} of the independent variable", self.indep.name())
            })?);
        }

        Ok(Prepared { x: xs, y0: u0, params })
    }

    fn post_process(
        &self,
        x: &[f64],
        y: &[Vec<f64>],
        params: &[f64],
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>), SystemError> {
        let mut xs = Vec::with_capacity(x.len());
        let mut ys = Vec::with_capacity(y.len());
        let mut out = [0.0];
        for (&xi, ui) in x.iter().zip(y) {
            let input = self.system.input(xi, ui, params)?;
            (self.indep_inverse)(&input, &mut out);
            xs.push(ensure_finite(out[0], xi, || {
                format!("inverse {} of the independent variable", self.indep.name())
            })?);

            let mut yi = vec![0.0; ui.len()];
            (self.dep_inverse)(&input, &mut yi);
            for (k, (&v, &u)) in yi.iter().zip(ui).enumerate() {
                ensure_finite(v, u, || format!("inverse {} of variable {k}", self.dep[k].name()))?;
            }
            ys.push(yi);
        }
        self.inner.post_process(&xs, &ys, params)
    }
}

/// Creates transformed systems with one transform shared by all dependent variables.
#[derive(Debug, Clone)]
pub struct SymmetricFactory {
    dep: Option<Transform>,
    indep: Option<Transform>,
}

/// A factory applying `dep` to every dependent variable and `indep` to the independent one.
pub fn symmetricsys(dep: Option<Transform>, indep: Option<Transform>) -> SymmetricFactory {
    SymmetricFactory { dep, indep }
}

impl SymmetricFactory {
    /// Wraps an existing model.
    pub fn from_other(&self, inner: Arc<dyn OdeModel>) -> Result<TransformedSystem, SystemError> {
        TransformedSystem::new(inner, self.dep.clone(), self.indep.clone())
    }

    /// Builds the untransformed system from a callback, then wraps it.
    pub fn from_callback<F, R>(&self, callback: F, ny: usize, nparams: usize) -> Result<TransformedSystem, SystemError>
    where
        F: FnOnce(&Expr, &SymbolView<'_>, &SymbolView<'_>) -> R,
        R: Into<crate::system::Rhs>,
    {
        self.from_builder(SystemBuilder::new(), callback, ny, nparams)
    }

    /// Like [`SymmetricFactory::from_callback`], with names, bounds or a backend set on `builder`.
    pub fn from_builder<F, R>(
        &self,
        builder: SystemBuilder,
        callback: F,
        ny: usize,
        nparams: usize,
    ) -> Result<TransformedSystem, SystemError>
    where
        F: FnOnce(&Expr, &SymbolView<'_>, &SymbolView<'_>) -> R,
        R: Into<crate::system::Rhs>,
    {
        let inner = builder.from_callback(callback, ny, nparams)?;
        self.from_other(Arc::new(inner))
    }
}

/// Linear rescaling of the dependent and independent variables.
///
/// Integrates `u_i = s_i · y_i` over `x̄ = s_x · x`, which helps when variables differ by
/// many orders of magnitude.
#[derive(Debug)]
pub struct ScaledSystem {
    transformed: TransformedSystem,
    dep_scaling: Vec<f64>,
    indep_scaling: f64,
}

impl ScaledSystem {
    /// `dep_scaling` holds one factor per variable, or a single factor for all of them.
    pub fn new(inner: Arc<dyn OdeModel>, dep_scaling: &[f64], indep_scaling: f64) -> Result<Self, SystemError> {
        let ny = inner.symbolic().ny();
        let dep_scaling = match dep_scaling {
            [s] => vec![*s; ny],
            s if s.len() == ny => s.to_vec(),
            s => return Err(SystemError::dimension("dependent scaling factors", ny, s.len())),
        };
        if let Some(bad) = dep_scaling
            .iter()
            .chain(std::iter::once(&indep_scaling))
            .find(|s| **s == 0.0 || !s.is_finite())
        {
            return Err(SystemError::config(format!("invalid scaling factor {bad}")));
        }
        let transforms = dep_scaling.iter().map(|&s| Transform::scaling(s)).collect();
        let transformed = TransformedSystem::with_transforms(inner, transforms, Transform::scaling(indep_scaling))?;
        Ok(Self {
            transformed,
            dep_scaling,
            indep_scaling,
        })
    }

    pub fn dep_scaling(&self) -> &[f64] {
        &self.dep_scaling
    }

    pub fn indep_scaling(&self) -> f64 {
        self.indep_scaling
    }

    pub fn transformed(&self) -> &TransformedSystem {
        &self.transformed
    }
}

impl OdeModel for ScaledSystem {
    fn symbolic(&self) -> &SymbolicSystem {
        self.transformed.symbolic()
    }

    fn ny(&self) -> usize {
        self.transformed.ny()
    }

    fn nparams(&self) -> usize {
        self.transformed.nparams()
    }

    fn names(&self) -> Option<&[String]> {
        self.transformed.names()
    }

    fn param_names(&self) -> Option<&[String]> {
        self.transformed.param_names()
    }

    fn lower_bounds(&self) -> Option<&[f64]> {
        self.transformed.lower_bounds()
    }

    fn upper_bounds(&self) -> Option<&[f64]> {
        self.transformed.upper_bounds()
    }

    fn pre_process(&self, x: &[f64], y0: &[f64], params: &[f64]) -> Result<Prepared, SystemError> {
        self.transformed.pre_process(x, y0, params)
    }

    fn post_process(
        &self,
        x: &[f64],
        y: &[Vec<f64>],
        params: &[f64],
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>), SystemError> {
        self.transformed.post_process(x, y, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        integrator::OdeSolvers,
        options::IntegrationOptions,
        problem::{Problem, Tout},
    };
    use approx::assert_relative_eq;

    fn decay_chain() -> Arc<dyn OdeModel> {
        Arc::new(
            SymbolicSystem::builder()
                .names(["a", "b"])
                .from_callback(
                    |_x, y, p| vec![-&p[0] * &y[0], &p[0] * &y[0] - &p[1] * &y[1]],
                    2,
                    2,
                )
                .unwrap(),
        )
    }

    #[test]
    fn test_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let transforms = [
            Transform::identity(),
            Transform::log_exp(),
            Transform::log_exp_scaled(2.0, 0.5),
            Transform::scaling(1e3),
        ];
        for t in transforms {
            let back = t.inverse(t.forward(Expr::var("v")));
            for v in [0.1, 1.0, 7.5] {
                let values = HashMap::from([("v".to_string(), v)]);
                assert_relative_eq!(back.eval(&values)?, v, max_relative = 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn test_log_rhs_by_chain_rule() -> Result<(), Box<dyn std::error::Error>> {
        let logsys = TransformedSystem::new(decay_chain(), Some(Transform::log_exp()), None)?;
        let (y, p) = ([2.0, 0.5], [3.0, 1.5]);
        let u: Vec<f64> = y.iter().map(|v: &f64| v.ln()).collect();
        let mut du = [0.0; 2];
        logsys.system().eval_rhs(0.0, &u, &p, &mut du)?;
        assert_relative_eq!(du[0], -3.0, max_relative = 1e-12);
        assert_relative_eq!(du[1], (3.0 * 2.0 - 1.5 * 0.5) / 0.5, max_relative = 1e-12);
        assert_eq!(logsys.names(), Some(&["a".to_string(), "b".to_string()][..]));
        Ok(())
    }

    #[test]
    fn test_log_of_zero_is_a_domain_error() -> Result<(), Box<dyn std::error::Error>> {
        let logsys = TransformedSystem::new(decay_chain(), Some(Transform::log_exp()), None)?;
        let err = logsys.pre_process(&[0.0, 1.0], &[1.0, 0.0], &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, SystemError::TransformDomainError { value, .. } if value == 0.0));
        assert!(err.is_retryable());
        Ok(())
    }

    #[test]
    fn test_scaled_integration_matches_unscaled() -> Result<(), Box<dyn std::error::Error>> {
        let inner = decay_chain();
        let scaled = ScaledSystem::new(inner.clone(), &[1e3, 1e-2], 10.0)?;
        assert_eq!(scaled.dep_scaling(), &[1e3, 1e-2]);

        let problem = Problem::new(Tout::Points(vec![0.0, 0.5, 1.0]), [1.0, 0.0], [2.0, 1.0]);
        let opts = IntegrationOptions::default().with_tolerances(1e-10, 1e-10);
        let reference = inner.integrate(&problem, &opts, &OdeSolvers)?;
        let result = scaled.integrate(&problem, &opts, &OdeSolvers)?;
        for (got, want) in result.xout.iter().zip(&reference.xout) {
            assert_relative_eq!(got, want, epsilon = 1e-12);
        }
        for (got, want) in result.yout.iter().zip(&reference.yout) {
            assert_relative_eq!(got[0], want[0], max_relative = 1e-6);
            assert_relative_eq!(got[1], want[1], max_relative = 1e-6);
        }
        assert_relative_eq!(result.info.internal_yout[0][0], 1e3, max_relative = 1e-12);
        Ok(())
    }

    #[test]
    fn test_invalid_scaling() {
        assert!(matches!(
            ScaledSystem::new(decay_chain(), &[1.0, 2.0, 3.0], 1.0),
            Err(SystemError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            ScaledSystem::new(decay_chain(), &[0.0], 1.0),
            Err(SystemError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_symmetric_factory() -> Result<(), Box<dyn std::error::Error>> {
        let factory = symmetricsys(Some(Transform::log_exp()), Some(Transform::log_exp()));
        let sys = factory.from_callback(|_x, y, p| vec![-&p[0] * &y[0]], 1, 1)?;
        // x̄ = ln x: du/dx̄ = x · (-k) = -k · exp(x̄)
        let mut du = [0.0];
        sys.system().eval_rhs(0.0, &[0.0], &[2.0], &mut du)?;
        assert_relative_eq!(du[0], -2.0, max_relative = 1e-12);
        Ok(())
    }
}
