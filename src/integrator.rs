//! Boundary to the numeric step integrators.
//!
//! The orchestration layer never steps an ODE itself. It hands a [`NumericProblem`] in
//! internal coordinates to an [`Integrator`] and gets the accepted samples back as a
//! [`RawSolution`]. Evaluation counts are taken by the caller around the closures it
//! passes in, so adapters do not have to report them.
//!
//! [`OdeSolvers`] adapts the explicit Runge–Kutta methods of the `ode_solvers` crate.

use std::cell::RefCell;
use std::fmt;

use ode_solvers::dop_shared::OutputType;
use ode_solvers::{DVector, Dop853, Dopri5, Rk4};

use crate::{errors::SystemError, options::Method};

/// Signature of the right-hand side and Jacobian callbacks: `(x, y, out)`.
pub type NumericFn<'a> = &'a dyn Fn(f64, &[f64], &mut [f64]);

/// One integration segment in internal coordinates.
pub struct NumericProblem<'a> {
    pub rhs: NumericFn<'a>,
    /// Dense row-major `ny * ny` Jacobian, or banded `(ml + mu + 1) * ny` when `band` is
    /// set. Only provided to integrators that ask for it.
    pub jacobian: Option<NumericFn<'a>>,
    pub x0: f64,
    pub x_end: f64,
    pub y0: &'a [f64],
    pub atol: f64,
    pub rtol: f64,
    /// Step budget; exceeding it is reported as a failure.
    pub nsteps: usize,
    /// `0.0` lets the integrator choose.
    pub first_step: f64,
    /// `0.0` means unbounded.
    pub max_step: f64,
    pub method: Method,
    pub band: Option<(usize, usize)>,
}

/// Accepted samples of one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSolution {
    pub x: Vec<f64>,
    pub y: Vec<Vec<f64>>,
    pub success: bool,
    pub message: Option<String>,
}

/// A numeric step integrator.
///
/// Numeric failures (step budget, step size underflow, stiffness) are reported through
/// [`RawSolution::success`] with the samples reached so far. `Err` is reserved for
/// problems the integrator cannot attempt at all.
pub trait Integrator: Send + Sync + fmt::Debug {
    /// Identifier recorded in the diagnostics.
    fn name(&self, method: Method) -> String;

    /// Whether [`NumericProblem::jacobian`] should be provided.
    fn uses_jacobian(&self) -> bool {
        false
    }

    fn solve(&self, problem: &NumericProblem<'_>) -> Result<RawSolution, SystemError>;
}

/// Adapter over the `ode_solvers` crate (Dopri5, Dop853, Rk4).
#[derive(Debug, Clone, Copy, Default)]
pub struct OdeSolvers;

struct Rhs<'a> {
    f: NumericFn<'a>,
    /// Abscissae of accepted steps, for steppers whose sparse output does not carry them.
    accepted: Option<&'a RefCell<Vec<f64>>>,
}

impl ode_solvers::System<f64, DVector<f64>> for Rhs<'_> {
    fn system(&self, x: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        (self.f)(x, y.as_slice(), dy.as_mut_slice());
    }

    fn solout(&mut self, x: f64, _y: &DVector<f64>, _dy: &DVector<f64>) -> bool {
        if let Some(accepted) = self.accepted {
            accepted.borrow_mut().push(x);
        }
        false
    }
}

/// Whether `x` lands on `x_end` up to accumulated rounding of the step sum.
fn reached(x: f64, x_end: f64, x0: f64) -> bool {
    (x - x_end).abs() <= 1e-10 * (x_end - x0).abs().max(x_end.abs()).max(1.0)
}

impl OdeSolvers {
    fn collect(
        problem: &NumericProblem<'_>,
        outcome: Result<(), String>,
        x_out: &[f64],
        y_out: &[DVector<f64>],
    ) -> RawSolution {
        let mut x = Vec::with_capacity(x_out.len() + 1);
        let mut y: Vec<Vec<f64>> = Vec::with_capacity(y_out.len() + 1);
        if x_out.first() != Some(&problem.x0) {
            x.push(problem.x0);
            y.push(problem.y0.to_vec());
        }
        for (xi, yi) in x_out.iter().zip(y_out) {
            if x.last() == Some(xi) {
                continue;
            }
            x.push(*xi);
            y.push(yi.as_slice().to_vec());
        }

        let mut message = outcome.err();
        match x.last_mut() {
            Some(last) if reached(*last, problem.x_end, problem.x0) => *last = problem.x_end,
            Some(last) => {
                let stopped = *last;
                message.get_or_insert_with(|| {
                    format!("integration stopped at x = {stopped} before x = {}", problem.x_end)
                });
            }
            None => {}
        }
        if let Some(bad) = y.iter().position(|row| row.iter().any(|v| !v.is_finite())) {
            let at = x[bad];
            x.truncate(bad.max(1));
            y.truncate(bad.max(1));
            message.get_or_insert_with(|| format!("non-finite state at x = {at}"));
        }
        RawSolution {
            x,
            y,
            success: message.is_none(),
            message,
        }
    }

    fn rk4(problem: &NumericProblem<'_>) -> RawSolution {
        let span = problem.x_end - problem.x0;
        if span == 0.0 {
            return RawSolution {
                x: vec![problem.x0],
                y: vec![problem.y0.to_vec()],
                success: true,
                message: None,
            };
        }
        let magnitude = if problem.first_step > 0.0 {
            problem.first_step
        } else if problem.max_step > 0.0 {
            problem.max_step
        } else {
            span.abs() / problem.nsteps.max(1) as f64
        };
        let steps = ((span.abs() / magnitude).ceil() as usize).max(1);
        if steps > problem.nsteps {
            return RawSolution {
                x: vec![problem.x0],
                y: vec![problem.y0.to_vec()],
                success: false,
                message: Some(format!(
                    "step budget exceeded: {steps} fixed steps needed, {} allowed",
                    problem.nsteps
                )),
            };
        }
        // Rk4 takes ceil(span / h) steps, so h must not divide the span into more than `steps`
        let mut h = span / steps as f64;
        if (span / h).ceil() as usize > steps {
            h *= 1.0 + f64::EPSILON;
        }
        let mut stepper = Rk4::new(
            Rhs {
                f: problem.rhs,
                accepted: None,
            },
            problem.x0,
            DVector::from_column_slice(problem.y0),
            problem.x_end,
            h,
        );
        let outcome = stepper.integrate().map(|_| ()).map_err(|e| format!("{e:?}"));
        Self::collect(problem, outcome, stepper.x_out(), stepper.y_out())
    }
}

impl Integrator for OdeSolvers {
    fn name(&self, method: Method) -> String {
        format!("ode_solvers::{method}")
    }

    fn solve(&self, problem: &NumericProblem<'_>) -> Result<RawSolution, SystemError> {
        if problem.nsteps == 0 {
            return Err(SystemError::config("step budget must be positive"));
        }
        let span = problem.x_end - problem.x0;
        let h_max = if problem.max_step > 0.0 {
            problem.max_step
        } else {
            span.abs()
        };
        let n_max = u32::try_from(problem.nsteps).unwrap_or(u32::MAX);
        let y0 = DVector::from_column_slice(problem.y0);
        let accepted = RefCell::new(Vec::new());

        let solution = match problem.method {
            Method::Dopri5 => {
                let mut stepper = Dopri5::from_param(
                    Rhs {
                        f: problem.rhs,
                        accepted: None,
                    },
                    problem.x0,
                    problem.x_end,
                    0.0,
                    y0,
                    problem.rtol,
                    problem.atol,
                    0.9,
                    0.04,
                    0.2,
                    10.0,
                    h_max,
                    problem.first_step,
                    n_max,
                    1000,
                    OutputType::Sparse,
                );
                let outcome = stepper.integrate().map(|_| ()).map_err(|e| format!("{e:?}"));
                Self::collect(problem, outcome, stepper.x_out(), stepper.y_out())
            }
            Method::Dop853 => {
                let mut stepper = Dop853::from_param(
                    Rhs {
                        f: problem.rhs,
                        accepted: Some(&accepted),
                    },
                    problem.x0,
                    problem.x_end,
                    0.0,
                    y0,
                    problem.rtol,
                    problem.atol,
                    0.9,
                    0.0,
                    0.333,
                    6.0,
                    h_max,
                    problem.first_step,
                    n_max,
                    1000,
                    OutputType::Sparse,
                );
                let outcome = stepper.integrate().map(|_| ()).map_err(|e| format!("{e:?}"));
                // sparse Dop853 output repeats x0 for every step; rebuild it from `solout`
                let x_out: Vec<f64> = std::iter::once(problem.x0)
                    .chain(accepted.borrow().iter().copied())
                    .collect();
                Self::collect(problem, outcome, &x_out, stepper.y_out())
            }
            Method::Rk4 => Self::rk4(problem),
        };
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decay(_x: f64, y: &[f64], dy: &mut [f64]) {
        dy[0] = -y[0];
    }

    fn problem<'a>(y0: &'a [f64], method: Method, nsteps: usize) -> NumericProblem<'a> {
        NumericProblem {
            rhs: &decay,
            jacobian: None,
            x0: 0.0,
            x_end: 2.0,
            y0,
            atol: 1e-10,
            rtol: 1e-10,
            nsteps,
            first_step: 0.0,
            max_step: 0.0,
            method,
            band: None,
        }
    }

    #[test]
    fn test_adaptive_methods_reach_end() -> Result<(), Box<dyn std::error::Error>> {
        let y0 = [1.0];
        for method in [Method::Dopri5, Method::Dop853, Method::Rk4] {
            let sol = OdeSolvers.solve(&problem(&y0, method, 500))?;
            assert!(sol.success, "{method}: {:?}", sol.message);
            assert_eq!(sol.x[0], 0.0);
            assert_relative_eq!(*sol.x.last().unwrap(), 2.0, epsilon = 1e-12);
            assert_relative_eq!(sol.y.last().unwrap()[0], (-2.0f64).exp(), max_relative = 1e-6);
            assert_eq!(sol.x.len(), sol.y.len());
        }
        Ok(())
    }

    #[test]
    fn test_step_budget_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let y0 = [1.0];
        let sol = OdeSolvers.solve(&problem(&y0, Method::Dopri5, 1))?;
        assert!(!sol.success);
        assert!(sol.message.is_some());

        let mut rk4 = problem(&y0, Method::Rk4, 10);
        rk4.first_step = 0.01;
        let sol = OdeSolvers.solve(&rk4)?;
        assert!(!sol.success);
        assert_eq!(sol.x, vec![0.0]);
        Ok(())
    }
}
