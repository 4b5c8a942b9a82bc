//! Symbolic ODE systems with derived Jacobians, variable transforms, partial analytic
//! reduction and chained integration.
//!
//! This crate describes systems of first-order ODEs `dy/dx = f(x, y, p)` as symbolic
//! expressions and prepares them for numeric integration. Expressions can be parsed with
//! [evalexpr](https://github.com/ISibboI/evalexpr), differentiated symbolically and
//! compiled with [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! or interpreted.
//!
//! # Features
//!
//! - Systems built from callbacks, `(symbol, rhs)` pairs or strings, with optional names
//! - Dense and banded Jacobians derived symbolically and cached
//! - Variable transforms (logarithmic, scaling, custom) derived with the chain rule
//! - Partially solved systems where some variables have closed forms
//! - Chained integration over fallback systems with restarts, in parallel for batches
//!
//! # Example
//!
//! ```rust
//! use symode::prelude::*;
//!
//! let system = SymbolicSystem::builder()
//!     .names(["A", "B"])
//!     .param_names(["k"])
//!     .from_callback(|_x, y, p| vec![-&p["k"] * &y["A"], &p["k"] * &y["A"]], 2, 1)
//!     .unwrap();
//!
//! let problem = Problem::new(Tout::End(1.0), Values::by_name([("A", 1.0)]), [2.0]);
//! let result = system
//!     .integrate(&problem, &IntegrationOptions::default(), &OdeSolvers)
//!     .unwrap();
//! let (_, y) = result.last().unwrap();
//! assert!((y[0] - (-2.0f64).exp()).abs() < 1e-6);
//! ```

pub mod prelude {
    pub use crate::backend::{CraneliftJit, Interpreter, SymbolicBackend};
    pub use crate::chained::{integrate_chained, integrate_chained_batch, ChainMode, ChainOptions, StageOverrides};
    pub use crate::errors::SystemError;
    pub use crate::expr::Expr;
    pub use crate::integrate::{Diagnostics, IntegrationResult};
    pub use crate::integrator::{Integrator, OdeSolvers};
    pub use crate::model::OdeModel;
    pub use crate::options::{IntegrationOptions, Method};
    pub use crate::partial::PartiallySolvedSystem;
    pub use crate::problem::{Problem, Tout, Values};
    pub use crate::system::SymbolicSystem;
    pub use crate::transform::{symmetricsys, ScaledSystem, Transform, TransformedSystem};
}

/// Symbolic backends: differentiation, substitution and compilation
pub mod backend;
/// JIT compilation functionality using Cranelift
pub mod builder;
/// Chained integration over fallback systems
pub mod chained;
/// Conversion from parsed expressions to internal AST
pub mod convert;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// Integration of a single problem and its diagnostics
pub mod integrate;
/// Boundary to numeric step integrators
pub mod integrator;
/// Capability trait shared by systems and wrappers
pub mod model;
/// Stack program optimisation
pub(crate) mod opt;
/// Integration options
pub mod options;
/// Partially solved systems
pub mod partial;
/// Problem instances: output request, initial values, parameters
pub mod problem;
/// Symbolic ODE systems
pub mod system;
/// Variable transforms
pub mod transform;
/// Shared type aliases
pub mod types;
