//! Integration of a single problem through a model, and the result it produces.

use std::cell::{Cell, RefCell};
use std::time::Instant;

use serde::Serialize;

use crate::{
    errors::SystemError,
    integrator::{Integrator, NumericProblem, RawSolution},
    model::{OdeModel, Prepared},
    options::IntegrationOptions,
    problem::Problem,
    system::{pack_banded, SymbolicSystem},
};

/// Diagnostics of an integration call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub success: bool,
    /// Right-hand-side evaluations.
    pub nfev: usize,
    /// Jacobian evaluations.
    pub njev: usize,
    /// Wall-clock time spent in the call, in seconds. Not process CPU time.
    pub time_cpu: f64,
    /// Indices into `xout` of the samples where a root expression changed sign.
    pub root_indices: Vec<usize>,
    /// Samples in the integrated coordinates, before post-processing. A chained result
    /// carries those of the stage that produced it.
    pub internal_xout: Vec<f64>,
    pub internal_yout: Vec<Vec<f64>>,
    /// 1-based index of the chain stage that produced the result.
    pub nsys: usize,
    /// Number of integration attempts, restarts included.
    pub attempts: usize,
    pub message: Option<String>,
    pub integrator: String,
}

/// Samples of an integration, in caller coordinates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrationResult {
    pub xout: Vec<f64>,
    /// One row per sample, one column per dependent variable.
    pub yout: Vec<Vec<f64>>,
    /// Names of the columns, if the model declares them.
    pub names: Option<Vec<String>>,
    pub info: Diagnostics,
}

impl IntegrationResult {
    /// Trajectory of the `i`-th dependent variable.
    pub fn column(&self, i: usize) -> Vec<f64> {
        self.yout.iter().filter_map(|row| row.get(i).copied()).collect()
    }

    /// Trajectory of the dependent variable called `name`.
    pub fn column_by_name(&self, name: &str) -> Result<Vec<f64>, SystemError> {
        let names = self
            .names
            .as_ref()
            .ok_or_else(|| SystemError::config("result has no column names"))?;
        let i = names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| SystemError::config(format!("unknown column {name:?}")))?;
        Ok(self.column(i))
    }

    /// Last sample reached.
    pub fn last(&self) -> Option<(f64, &[f64])> {
        self.xout
            .last()
            .copied()
            .zip(self.yout.last().map(Vec::as_slice))
    }
}

#[derive(Default)]
struct Counters {
    nfev: Cell<usize>,
    njev: Cell<usize>,
}

/// Internal samples of one call, before post-processing.
struct Internal {
    x: Vec<f64>,
    y: Vec<Vec<f64>>,
    params: Vec<f64>,
    root_indices: Vec<usize>,
    success: bool,
    message: Option<String>,
}

/// Outcome of one attempt. `error` is set exactly when the attempt failed.
pub(crate) struct Attempt {
    pub(crate) result: IntegrationResult,
    pub(crate) error: Option<SystemError>,
}

pub(crate) fn run<M: OdeModel + ?Sized>(
    model: &M,
    problem: &Problem,
    options: &IntegrationOptions,
    integrator: &dyn Integrator,
) -> Result<IntegrationResult, SystemError> {
    let Attempt { result, error } = attempt(model, problem, options, integrator)?;
    match error {
        Some(e) if !options.return_on_error => Err(e),
        _ => Ok(result),
    }
}

/// Integrates one problem, capturing retryable failures instead of returning them.
///
/// Only construction-type errors come back as `Err`.
pub(crate) fn attempt<M: OdeModel + ?Sized>(
    model: &M,
    problem: &Problem,
    options: &IntegrationOptions,
    integrator: &dyn Integrator,
) -> Result<Attempt, SystemError> {
    let y0 = problem.y0.resolve(model.names(), model.ny(), "initial values")?;
    let params = problem
        .params
        .resolve(model.param_names(), model.nparams(), "parameters")?;
    let tout = problem.tout.points()?;
    if options.check_bounds {
        if let Some(i) = first_violation(model, &y0, 0.0) {
            return Err(SystemError::config(format!(
                "initial value {} of variable {i} is outside its bounds",
                y0[i]
            )));
        }
    }

    let started = Instant::now();
    let counters = Counters::default();
    let mut info = Diagnostics {
        nsys: 1,
        attempts: 1,
        integrator: integrator.name(options.method),
        ..Diagnostics::default()
    };

    let outcome = integrate_internal(
        model,
        &tout,
        problem.tout.is_adaptive(),
        &y0,
        &params,
        options,
        integrator,
        &counters,
    )
    .and_then(|internal| {
        let (xout, yout) = model.post_process(&internal.x, &internal.y, &internal.params)?;
        Ok((internal, xout, yout))
    });

    info.nfev = counters.nfev.get();
    info.njev = counters.njev.get();
    info.time_cpu = started.elapsed().as_secs_f64();

    let (internal, xout, yout) = match outcome {
        Ok(done) => done,
        Err(e) if e.is_retryable() => {
            log::debug!("integration failed: {e}");
            info.message = Some(e.to_string());
            return Ok(Attempt {
                result: IntegrationResult {
                    names: model.names().map(<[String]>::to_vec),
                    info,
                    ..IntegrationResult::default()
                },
                error: Some(e),
            });
        }
        Err(e) => return Err(e),
    };

    info.success = internal.success;
    info.message = internal.message;
    info.root_indices = internal.root_indices;
    info.internal_xout = internal.x;
    info.internal_yout = internal.y;

    if info.success && options.check_bounds {
        let violation = yout
            .iter()
            .zip(&xout)
            .find_map(|(row, x)| first_violation(model, row, options.atol).map(|i| (i, *x)));
        if let Some((i, x)) = violation {
            info.success = false;
            info.message = Some(format!("bounds violated by variable {i} at x = {x}"));
        }
    }

    let error = (!info.success).then(|| SystemError::Integration {
        message: info
            .message
            .clone()
            .unwrap_or_else(|| "integrator reported failure".to_string()),
        x: xout.last().copied().unwrap_or(f64::NAN),
    });

    Ok(Attempt {
        result: IntegrationResult {
            xout,
            yout,
            names: model.names().map(<[String]>::to_vec),
            info,
        },
        error,
    })
}

fn first_violation<M: OdeModel + ?Sized>(model: &M, y: &[f64], tol: f64) -> Option<usize> {
    let below = |i: usize, v: f64| model.lower_bounds().is_some_and(|lb| v < lb[i] - tol);
    let above = |i: usize, v: f64| model.upper_bounds().is_some_and(|ub| v > ub[i] + tol);
    y.iter()
        .enumerate()
        .position(|(i, &v)| below(i, v) || above(i, v))
}

#[allow(clippy::too_many_arguments)]
fn integrate_internal<M: OdeModel + ?Sized>(
    model: &M,
    tout: &[f64],
    adaptive: bool,
    y0: &[f64],
    params: &[f64],
    options: &IntegrationOptions,
    integrator: &dyn Integrator,
    counters: &Counters,
) -> Result<Internal, SystemError> {
    let Prepared { x, y0, params } = model.pre_process(tout, y0, params)?;
    let sys = model.symbolic();
    let ny = sys.ny();

    let rhs_fn = sys.rhs_function()?;
    let jac_fn = if integrator.uses_jacobian() {
        Some(sys.jacobian_function()?)
    } else {
        None
    };
    let input = RefCell::new(sys.input(x[0], &y0, &params)?);

    let rhs = |xi: f64, y: &[f64], dy: &mut [f64]| {
        counters.nfev.set(counters.nfev.get() + 1);
        let mut input = input.borrow_mut();
        input[0] = xi;
        input[1..=ny].copy_from_slice(y);
        rhs_fn(&input[..], dy);
    };
    let dense = RefCell::new(vec![0.0; ny * ny]);
    let jacobian = |xi: f64, y: &[f64], out: &mut [f64]| {
        let Some(jac_fn) = jac_fn else {
            return;
        };
        counters.njev.set(counters.njev.get() + 1);
        let mut input = input.borrow_mut();
        input[0] = xi;
        input[1..=ny].copy_from_slice(y);
        let mut dense = dense.borrow_mut();
        jac_fn(&input[..], &mut dense[..]);
        match options.band {
            None => out.copy_from_slice(&dense),
            Some((ml, mu)) => {
                let rows: Vec<Vec<f64>> = dense.chunks(ny.max(1)).map(<[f64]>::to_vec).collect();
                let packed = pack_banded(&rows, ml, mu, 0.0);
                for (dst, src) in out.chunks_mut(ny.max(1)).zip(&packed) {
                    dst.copy_from_slice(src);
                }
            }
        }
    };

    let first_step = if options.first_step > 0.0 {
        options.first_step
    } else {
        sys.first_step(x[0], &y0, &params)?.unwrap_or(0.0)
    };
    let segment = |x0: f64, x_end: f64, y0: &[f64], first_step: f64| {
        integrator.solve(&NumericProblem {
            rhs: &rhs,
            jacobian: jac_fn.map(|_| &jacobian as &dyn Fn(f64, &[f64], &mut [f64])),
            x0,
            x_end,
            y0,
            atol: options.atol,
            rtol: options.rtol,
            nsteps: options.nsteps,
            first_step,
            max_step: options.max_step,
            method: options.method,
            band: options.band,
        })
    };

    if adaptive {
        let RawSolution {
            mut x,
            mut y,
            success,
            message,
        } = segment(x[0], x[1], &y0, first_step)?;
        let root_indices = if sys.roots().is_empty() {
            Vec::new()
        } else {
            insert_roots(sys, &mut x, &mut y, &params, &rhs)?
        };
        return Ok(Internal {
            x,
            y,
            params,
            root_indices,
            success,
            message,
        });
    }

    if !sys.roots().is_empty() {
        log::warn!("root expressions are only tracked for adaptive output, ignoring them");
    }
    let mut xs = vec![x[0]];
    let mut ys = vec![y0.clone()];
    let mut message = None;
    for window in x.windows(2) {
        let state = ys.last().cloned().unwrap_or_default();
        // later segments start from the step size the integrator picks
        let step = if xs.len() == 1 { first_step } else { 0.0 };
        let sol = segment(window[0], window[1], &state, step)?;
        if !sol.success {
            if let (Some(&xl), Some(yl)) = (sol.x.last(), sol.y.last()) {
                if xl != window[0] {
                    xs.push(xl);
                    ys.push(yl.clone());
                }
            }
            message = sol.message.or_else(|| Some("integrator reported failure".into()));
            break;
        }
        let reached = sol.y.last().cloned().unwrap_or(state);
        xs.push(window[1]);
        ys.push(reached);
    }
    Ok(Internal {
        x: xs,
        y: ys,
        params,
        root_indices: Vec::new(),
        success: message.is_none(),
        message,
    })
}

/// Sign change from a nonzero `a` to `b`, landing exactly on zero included.
fn crosses(a: f64, b: f64) -> bool {
    a != 0.0 && (b == 0.0 || (a < 0.0) != (b < 0.0))
}

/// Cubic Hermite interpolant between two samples with slopes `f0` and `f1`.
fn hermite(x0: f64, y0: &[f64], f0: &[f64], x1: f64, y1: &[f64], f1: &[f64], x: f64) -> Vec<f64> {
    let h = x1 - x0;
    let t = (x - x0) / h;
    let (t2, t3) = (t * t, t * t * t);
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    (0..y0.len())
        .map(|i| h00 * y0[i] + h10 * h * f0[i] + h01 * y1[i] + h11 * h * f1[i])
        .collect()
}

/// Locates sign changes of the root expressions between accepted samples.
///
/// Each bracketed root is refined by bisection on the Hermite interpolant and inserted
/// as a new sample; at most one root (the earliest) is inserted per step.
fn insert_roots(
    sys: &SymbolicSystem,
    x: &mut Vec<f64>,
    y: &mut Vec<Vec<f64>>,
    params: &[f64],
    rhs: &dyn Fn(f64, &[f64], &mut [f64]),
) -> Result<Vec<usize>, SystemError> {
    let ny = sys.ny();
    let mut indices = Vec::new();
    let mut out_x = Vec::with_capacity(x.len());
    let mut out_y = Vec::with_capacity(y.len());

    let mut g_prev = match (x.first(), y.first()) {
        (Some(&x0), Some(y0)) => sys.eval_roots(x0, y0, params)?,
        _ => return Ok(indices),
    };
    for i in 0..x.len() {
        if i > 0 {
            let g_next = sys.eval_roots(x[i], &y[i], params)?;
            let bracketed = g_prev
                .iter()
                .zip(&g_next)
                .enumerate()
                .filter(|(_, (a, b))| crosses(**a, **b))
                .map(|(k, _)| k)
                .collect::<Vec<_>>();
            if !bracketed.is_empty() {
                let (mut f0, mut f1) = (vec![0.0; ny], vec![0.0; ny]);
                rhs(x[i - 1], &y[i - 1], &mut f0);
                rhs(x[i], &y[i], &mut f1);
                let interpolate = |xm: f64| hermite(x[i - 1], &y[i - 1], &f0, x[i], &y[i], &f1, xm);

                let mut earliest: Option<(f64, Vec<f64>)> = None;
                for k in bracketed {
                    let (mut lo, mut hi) = (x[i - 1], x[i]);
                    let g_lo = g_prev[k];
                    for _ in 0..100 {
                        let mid = 0.5 * (lo + hi);
                        if mid == lo || mid == hi {
                            break;
                        }
                        let g_mid = sys.eval_roots(mid, &interpolate(mid), params)?[k];
                        if g_mid == 0.0 {
                            lo = mid;
                            hi = mid;
                            break;
                        }
                        if g_mid.signum() == g_lo.signum() {
                            lo = mid;
                        } else {
                            hi = mid;
                        }
                    }
                    let root = 0.5 * (lo + hi);
                    let is_earlier = earliest
                        .as_ref()
                        .map_or(true, |(xr, _)| (root - x[i - 1]).abs() < (xr - x[i - 1]).abs());
                    if is_earlier {
                        earliest = Some((root, interpolate(root)));
                    }
                }
                if let Some((xr, yr)) = earliest {
                    if xr != x[i - 1] && xr != x[i] {
                        log::trace!("root located at x = {xr}");
                        indices.push(out_x.len());
                        out_x.push(xr);
                        out_y.push(yr);
                    } else {
                        let at = if xr == x[i] { out_x.len() } else { out_x.len() - 1 };
                        log::trace!("root located on sample x = {xr}");
                        indices.push(at);
                    }
                }
            }
            g_prev = g_next;
        }
        out_x.push(x[i]);
        out_y.push(y[i].clone());
    }
    *x = out_x;
    *y = out_y;
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expr::Expr,
        integrator::OdeSolvers,
        problem::{Tout, Values},
    };
    use crate::integrator::{Integrator, NumericProblem, RawSolution};
    use crate::options::Method;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    /// Evaluates the Jacobian once at the initial state, then steps with Dopri5.
    #[derive(Debug, Default)]
    struct JacobianRecorder {
        seen: Mutex<Vec<f64>>,
    }

    impl Integrator for JacobianRecorder {
        fn name(&self, _method: Method) -> String {
            "jacobian-recorder".into()
        }

        fn uses_jacobian(&self) -> bool {
            true
        }

        fn solve(&self, problem: &NumericProblem<'_>) -> Result<RawSolution, SystemError> {
            let rows = problem.band.map_or(problem.y0.len(), |(ml, mu)| ml + mu + 1);
            let mut out = vec![f64::NAN; rows * problem.y0.len()];
            if let Some(jacobian) = problem.jacobian {
                jacobian(problem.x0, problem.y0, &mut out);
            }
            if let Ok(mut seen) = self.seen.lock() {
                *seen = out;
            }
            OdeSolvers.solve(problem)
        }
    }

    fn open_chain() -> SymbolicSystem {
        SymbolicSystem::from_callback(
            |_x, y, p| {
                vec![
                    -&p[0] * &y[0],
                    &p[0] * &y[0] - &p[1] * &y[1],
                    &p[1] * &y[1],
                ]
            },
            3,
            2,
        )
        .unwrap()
    }

    fn decay() -> SymbolicSystem {
        SymbolicSystem::builder()
            .names(["A"])
            .param_names(["k"])
            .lower_bounds(vec![0.0])
            .from_callback(|_x, y, p| vec![-&p[0] * &y[0]], 1, 1)
            .unwrap()
    }

    #[test]
    fn test_integrate_by_name() -> Result<(), Box<dyn std::error::Error>> {
        let system = decay();
        let problem = Problem::new(
            Tout::End(1.0),
            Values::by_name([("A", 2.0)]),
            Values::by_name([("k", 0.5)]),
        );
        let result = system.integrate(&problem, &IntegrationOptions::default(), &OdeSolvers)?;
        assert!(result.info.success);
        assert!(result.info.nfev > 0);
        assert_eq!(result.info.njev, 0);
        let (x, y) = result.last().unwrap();
        assert_relative_eq!(x, 1.0);
        assert_relative_eq!(y[0], 2.0 * (-0.5f64).exp(), max_relative = 1e-6);
        assert_eq!(result.column_by_name("A")?.len(), result.xout.len());
        Ok(())
    }

    #[test]
    fn test_points_are_reported_exactly() -> Result<(), Box<dyn std::error::Error>> {
        let system = decay();
        let points = vec![0.0, 0.25, 0.5, 1.0];
        let problem = Problem::new(Tout::Points(points.clone()), [1.0], [1.0]);
        let result = system.integrate(&problem, &IntegrationOptions::default(), &OdeSolvers)?;
        assert_eq!(result.xout, points);
        for (x, row) in result.xout.iter().zip(&result.yout) {
            assert_relative_eq!(row[0], (-x).exp(), max_relative = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_failure_raised_or_returned() -> Result<(), Box<dyn std::error::Error>> {
        let system = decay();
        let problem = Problem::new(Tout::End(10.0), [1.0], [1.0]);
        let opts = IntegrationOptions::default().with_nsteps(1);
        let err = system.integrate(&problem, &opts, &OdeSolvers).unwrap_err();
        assert!(matches!(err, SystemError::Integration { .. }));

        let result = system.integrate(&problem, &opts.with_return_on_error(true), &OdeSolvers)?;
        assert!(!result.info.success);
        assert!(result.info.message.is_some());
        Ok(())
    }

    #[test]
    fn test_initial_bounds_checked() {
        let problem = Problem::new(Tout::End(1.0), [-1.0], [1.0]);
        let err = decay()
            .integrate(&problem, &IntegrationOptions::default(), &OdeSolvers)
            .unwrap_err();
        assert!(matches!(err, SystemError::ConfigurationError(_)));
    }

    #[test]
    fn test_root_of_exponential_growth() -> Result<(), Box<dyn std::error::Error>> {
        let system = SymbolicSystem::builder()
            .roots(vec![Expr::var("y_0") - std::f64::consts::E])
            .from_callback(|_x, y, _p| vec![y[0].clone()], 1, 0)?;
        let problem = Problem::new(Tout::End(2.0), [1.0], Vec::<f64>::new());
        let opts = IntegrationOptions::default()
            .with_tolerances(1e-10, 1e-10)
            .with_nsteps(20_000);
        let result = system.integrate(&problem, &opts, &OdeSolvers)?;
        assert!(result.info.success);
        assert_eq!(result.info.root_indices.len(), 1);
        let i = result.info.root_indices[0];
        assert_relative_eq!(result.xout[i], 1.0, epsilon = 1e-6);
        assert_relative_eq!(result.yout[i][0], std::f64::consts::E, epsilon = 1e-6);
        assert!(result.xout.windows(2).all(|w| w[1] > w[0]));
        Ok(())
    }

    #[test]
    fn test_banded_jacobian_reaches_integrator() -> Result<(), Box<dyn std::error::Error>> {
        let recorder = JacobianRecorder::default();
        let problem = Problem::new(Tout::End(0.5), [1.0, 1.0, 1.0], [4.0, 3.0]);
        let opts = IntegrationOptions::default().with_band(1, 0);
        let result = open_chain().integrate(&problem, &opts, &recorder)?;
        assert!(result.info.success);
        assert!(result.info.njev > 0);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![-4.0, -3.0, 0.0, 4.0, 3.0, 0.0]);

        let dense = open_chain().integrate(&problem, &IntegrationOptions::default(), &recorder)?;
        assert_eq!(dense.info.njev, 1);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![-4.0, 0.0, 0.0, 4.0, -3.0, 0.0, 0.0, 3.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn test_dop853_reports_accepted_steps() -> Result<(), Box<dyn std::error::Error>> {
        let problem = Problem::new(Tout::End(2.0), [1.0], [1.0]);
        let opts = IntegrationOptions::default().with_method(Method::Dop853);
        let result = decay().integrate(&problem, &opts, &OdeSolvers)?;
        assert!(result.info.success);
        assert!(result.xout.len() > 2);
        assert!(result.xout.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(result.xout.last(), Some(&2.0));
        for (x, row) in result.xout.iter().zip(&result.yout) {
            assert_relative_eq!(row[0], (-x).exp(), max_relative = 1e-6);
        }

        let points = Problem::new(Tout::Points(vec![0.0, 0.5, 1.0]), [1.0], [1.0]);
        let result = decay().integrate(&points, &opts, &OdeSolvers)?;
        assert_relative_eq!(result.yout[2][0], (-1.0f64).exp(), max_relative = 1e-6);
        Ok(())
    }

    #[test]
    fn test_rk4_first_step_longer_than_span() -> Result<(), Box<dyn std::error::Error>> {
        let opts = IntegrationOptions::default()
            .with_method(Method::Rk4)
            .with_first_step(0.5);
        let points = Problem::new(Tout::Points(vec![0.0, 0.1]), [1.0], [1.0]);
        let result = decay().integrate(&points, &opts, &OdeSolvers)?;
        assert_eq!(result.xout, vec![0.0, 0.1]);
        assert_relative_eq!(result.yout[1][0], (-0.1f64).exp(), max_relative = 1e-6);

        let adaptive = Problem::new(Tout::End(0.1), [1.0], [1.0]);
        let result = decay().integrate(&adaptive, &opts, &OdeSolvers)?;
        assert_eq!(result.xout, vec![0.0, 0.1]);
        Ok(())
    }

    #[test]
    fn test_hermite_is_exact_for_cubics() {
        // y = x^3, y' = 3x^2
        let y = hermite(1.0, &[1.0], &[3.0], 2.0, &[8.0], &[12.0], 1.5);
        assert_relative_eq!(y[0], 3.375, epsilon = 1e-12);
    }
}
