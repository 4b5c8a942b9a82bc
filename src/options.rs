//! Integration options.
//!
//! Options derive serde with `#[serde(default)]`, so a partial JSON or TOML document is
//! enough to configure a run:
//!
//! ```rust
//! use symode::options::{IntegrationOptions, Method};
//!
//! let opts: IntegrationOptions = serde_json::from_str(r#"{"nsteps": 50, "method": "dop853"}"#).unwrap();
//! assert_eq!(opts.nsteps, 50);
//! assert_eq!(opts.method, Method::Dop853);
//! assert_eq!(opts.atol, 1e-8);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Step algorithm used by the bundled [`crate::integrator::OdeSolvers`] adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Dormand–Prince 5(4), adaptive.
    #[default]
    Dopri5,
    /// Dormand–Prince 8(5,3), adaptive.
    Dop853,
    /// Classic fixed-step Runge–Kutta.
    Rk4,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Dopri5 => "dopri5",
            Method::Dop853 => "dop853",
            Method::Rk4 => "rk4",
        };
        f.write_str(name)
    }
}

/// Options of a single integration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationOptions {
    /// Absolute tolerance.
    pub atol: f64,
    /// Relative tolerance.
    pub rtol: f64,
    /// Maximum number of steps per integration segment.
    pub nsteps: usize,
    /// Initial step; `0.0` picks it automatically, or from the system's first-step hint.
    pub first_step: f64,
    /// Largest step allowed; `0.0` means unbounded.
    pub max_step: f64,
    /// Report failures in the diagnostics instead of returning an error.
    pub return_on_error: bool,
    pub method: Method,
    /// Lower and upper bandwidth of the Jacobian handed to the integrator.
    pub band: Option<(usize, usize)>,
    /// Check initial values and output against the system's bounds.
    pub check_bounds: bool,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        Self {
            atol: 1e-8,
            rtol: 1e-8,
            nsteps: 500,
            first_step: 0.0,
            max_step: 0.0,
            return_on_error: false,
            method: Method::default(),
            band: None,
            check_bounds: true,
        }
    }
}

impl IntegrationOptions {
    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    /// Sets both tolerances.
    pub fn with_tolerances(self, atol: f64, rtol: f64) -> Self {
        self.with_atol(atol).with_rtol(rtol)
    }

    pub fn with_nsteps(mut self, nsteps: usize) -> Self {
        self.nsteps = nsteps;
        self
    }

    pub fn with_first_step(mut self, first_step: f64) -> Self {
        self.first_step = first_step;
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_return_on_error(mut self, return_on_error: bool) -> Self {
        self.return_on_error = return_on_error;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_band(mut self, ml: usize, mu: usize) -> Self {
        self.band = Some((ml, mu));
        self
    }

    pub fn with_check_bounds(mut self, check_bounds: bool) -> Self {
        self.check_bounds = check_bounds;
        self
    }
}
