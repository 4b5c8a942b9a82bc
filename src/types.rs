use std::collections::HashMap;
use std::sync::Arc;

/// A compiled set of expressions evaluated in one call.
///
/// This represents a function that:
/// - Takes a slice of input values laid out as described by a [`Layout`]
/// - Writes one result per compiled expression into the output slice
/// - Is both Send and Sync, so systems can be shared between integration threads
pub type CompiledFunction = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;

/// Mapping from symbol name to slot in the input buffer of a [`CompiledFunction`].
pub type Layout = HashMap<String, u32>;

/// Numeric first-step heuristic, called with `(x0, y0, params)` in internal coordinates.
pub type FirstStepFactory = Arc<dyn Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync>;
