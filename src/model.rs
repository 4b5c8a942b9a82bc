//! The capability set shared by systems and the wrappers around them.
//!
//! A [`SymbolicSystem`] is the innermost model. Wrappers such as
//! [`crate::transform::TransformedSystem`] and [`crate::partial::PartiallySolvedSystem`]
//! own an inner `Arc<dyn OdeModel>`, carry their own symbolic system for the coordinates
//! they integrate in, and translate values on the way in and out:
//!
//! ```text
//! caller values --pre_process--> internal values --integrator--> internal samples
//! caller samples <--post_process-- internal samples
//! ```
//!
//! Wrappers delegate to the inner model first on the way in and last on the way out, so
//! they nest in any order.

use std::fmt;

use crate::{
    errors::SystemError,
    integrate::{self, IntegrationResult},
    integrator::Integrator,
    options::IntegrationOptions,
    problem::Problem,
    system::SymbolicSystem,
};

/// Values in the coordinates a model integrates in.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    /// Output boundary points of the independent variable
    pub x: Vec<f64>,
    pub y0: Vec<f64>,
    pub params: Vec<f64>,
}

pub trait OdeModel: Send + Sync + fmt::Debug {
    /// The system actually handed to the integrator.
    fn symbolic(&self) -> &SymbolicSystem;

    /// Number of caller-facing dependent variables.
    fn ny(&self) -> usize;

    /// Number of caller-facing parameters.
    fn nparams(&self) -> usize;

    fn names(&self) -> Option<&[String]>;

    fn param_names(&self) -> Option<&[String]>;

    /// Caller-facing lower bounds.
    fn lower_bounds(&self) -> Option<&[f64]> {
        None
    }

    /// Caller-facing upper bounds.
    fn upper_bounds(&self) -> Option<&[f64]> {
        None
    }

    /// Maps caller values to internal values.
    fn pre_process(&self, x: &[f64], y0: &[f64], params: &[f64]) -> Result<Prepared, SystemError>;

    /// Maps internal samples back to caller values. `params` are internal parameters.
    fn post_process(
        &self,
        x: &[f64],
        y: &[Vec<f64>],
        params: &[f64],
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>), SystemError>;

    /// Integrates one problem: resolve, pre-process, integrate, post-process.
    ///
    /// # Errors
    /// Construction-type errors are always returned. Integration failures and transform
    /// domain errors are returned unless `options.return_on_error` is set, in which case
    /// they are reported with `success == false`.
    fn integrate(
        &self,
        problem: &Problem,
        options: &IntegrationOptions,
        integrator: &dyn Integrator,
    ) -> Result<IntegrationResult, SystemError> {
        integrate::run(self, problem, options, integrator)
    }
}

impl OdeModel for SymbolicSystem {
    fn symbolic(&self) -> &SymbolicSystem {
        self
    }

    fn ny(&self) -> usize {
        SymbolicSystem::ny(self)
    }

    fn nparams(&self) -> usize {
        SymbolicSystem::nparams(self)
    }

    fn names(&self) -> Option<&[String]> {
        SymbolicSystem::names(self)
    }

    fn param_names(&self) -> Option<&[String]> {
        SymbolicSystem::param_names(self)
    }

    fn lower_bounds(&self) -> Option<&[f64]> {
        SymbolicSystem::lower_bounds(self)
    }

    fn upper_bounds(&self) -> Option<&[f64]> {
        SymbolicSystem::upper_bounds(self)
    }

    fn pre_process(&self, x: &[f64], y0: &[f64], params: &[f64]) -> Result<Prepared, SystemError> {
        Ok(Prepared {
            x: x.to_vec(),
            y0: y0.to_vec(),
            params: params.to_vec(),
        })
    }

    fn post_process(
        &self,
        x: &[f64],
        y: &[Vec<f64>],
        _params: &[f64],
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>), SystemError> {
        Ok((x.to_vec(), y.to_vec()))
    }
}
