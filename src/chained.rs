//! Chained integration with fallback systems.
//!
//! A chain is an ordered list of models for the same problem, typically the same
//! equations in increasingly robust representations (log-transformed, partially solved,
//! with larger step budgets). Stages are tried in order until one succeeds. Each stage
//! may be restarted from the last point it reached, up to [`ChainOptions::autorestart`]
//! times, before the driver moves on.
//!
//! ```text
//! stage 1 ──fail──> restart ... ──fail──> stage 2 ──ok──> result (nsys = 2)
//! ```

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    errors::SystemError,
    integrate::{self, Attempt, IntegrationResult},
    integrator::Integrator,
    model::OdeModel,
    options::IntegrationOptions,
    problem::{Problem, Tout},
};

/// Per-stage replacements for the base options, matched by stage index.
///
/// Missing entries (short vectors or `None`) fall back to the base options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverrides {
    pub nsteps: Vec<Option<usize>>,
    pub first_step: Vec<Option<f64>>,
    pub return_on_error: Vec<Option<bool>>,
    pub atol: Vec<Option<f64>>,
    pub rtol: Vec<Option<f64>>,
}

impl StageOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nsteps(mut self, nsteps: impl IntoIterator<Item = usize>) -> Self {
        self.nsteps = nsteps.into_iter().map(Some).collect();
        self
    }

    pub fn with_first_step(mut self, first_step: impl IntoIterator<Item = f64>) -> Self {
        self.first_step = first_step.into_iter().map(Some).collect();
        self
    }

    pub fn with_return_on_error(mut self, return_on_error: impl IntoIterator<Item = bool>) -> Self {
        self.return_on_error = return_on_error.into_iter().map(Some).collect();
        self
    }

    pub fn with_atol(mut self, atol: impl IntoIterator<Item = f64>) -> Self {
        self.atol = atol.into_iter().map(Some).collect();
        self
    }

    pub fn with_rtol(mut self, rtol: impl IntoIterator<Item = f64>) -> Self {
        self.rtol = rtol.into_iter().map(Some).collect();
        self
    }

    /// Options of stage `stage` (0-based).
    pub fn options_for(&self, stage: usize, base: &IntegrationOptions) -> IntegrationOptions {
        fn pick<T: Copy>(values: &[Option<T>], stage: usize, fallback: T) -> T {
            values.get(stage).copied().flatten().unwrap_or(fallback)
        }
        IntegrationOptions {
            nsteps: pick(&self.nsteps, stage, base.nsteps),
            first_step: pick(&self.first_step, stage, base.first_step),
            return_on_error: pick(&self.return_on_error, stage, base.return_on_error),
            atol: pick(&self.atol, stage, base.atol),
            rtol: pick(&self.rtol, stage, base.rtol),
            ..base.clone()
        }
    }
}

/// Where the next stage of a chain starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// Every stage solves the original problem from its start.
    #[default]
    FromStart,
    /// A stage resumes from the last point the previous stage reached; output is
    /// concatenated.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainOptions {
    /// Restarts allowed per stage, each from the last point reached.
    pub autorestart: usize,
    pub mode: ChainMode,
}

impl ChainOptions {
    pub fn with_autorestart(mut self, autorestart: usize) -> Self {
        self.autorestart = autorestart;
        self
    }

    pub fn with_mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Default)]
struct Totals {
    nfev: usize,
    njev: usize,
    time_cpu: f64,
    attempts: usize,
}

impl Totals {
    fn add(&mut self, result: &IntegrationResult) {
        self.nfev += result.info.nfev;
        self.njev += result.info.njev;
        self.time_cpu += result.info.time_cpu;
        self.attempts += 1;
    }

    fn apply(&self, result: &mut IntegrationResult, nsys: usize) {
        result.info.nfev = self.nfev;
        result.info.njev = self.njev;
        result.info.time_cpu = self.time_cpu;
        result.info.attempts = self.attempts;
        result.info.nsys = nsys;
    }
}

/// Appends `next` to `base`, dropping the first sample of `next` where it repeats the
/// last sample of `base`.
///
/// Internal samples are only joined when both results were integrated by the same stage;
/// otherwise the internal samples of `next` replace those of `base`.
fn concatenate(
    base: Option<IntegrationResult>,
    mut next: IntegrationResult,
    same_stage: bool,
) -> IntegrationResult {
    let Some(mut base) = base else {
        return next;
    };
    if next.xout.is_empty() {
        base.info.success = next.info.success;
        base.info.message = next.info.message;
        return base;
    }
    let skip = usize::from(base.xout.last() == next.xout.first());
    let offset = base.xout.len();
    base.info.root_indices.extend(
        next.info
            .root_indices
            .iter()
            .map(|&i| (offset + i).saturating_sub(skip)),
    );
    base.xout.extend(next.xout.drain(..).skip(skip));
    base.yout.extend(next.yout.drain(..).skip(skip));
    if same_stage {
        let internal_skip =
            usize::from(base.info.internal_xout.last() == next.info.internal_xout.first());
        base.info
            .internal_xout
            .extend(next.info.internal_xout.drain(..).skip(internal_skip));
        base.info
            .internal_yout
            .extend(next.info.internal_yout.drain(..).skip(internal_skip));
    } else {
        base.info.internal_xout = next.info.internal_xout;
        base.info.internal_yout = next.info.internal_yout;
    }
    base.info.success = next.info.success;
    base.info.message = next.info.message;
    base.info.integrator = next.info.integrator;
    base
}

/// How far `result` got along the request, in the direction of integration.
fn progress(result: &IntegrationResult, start: f64, forward: bool) -> f64 {
    match result.xout.last() {
        Some(&x) if forward => x - start,
        Some(&x) => start - x,
        None => f64::NEG_INFINITY,
    }
}

/// Integrates `problem` with the first stage of `systems` that succeeds.
///
/// Counters in the diagnostics cover every attempt; `nsys` is the 1-based stage that
/// produced the result. When every stage fails, the attempt that got furthest is
/// returned with `success == false`, unless the last stage has `return_on_error`
/// unset, in which case its error is returned.
///
/// # Errors
/// Construction-type errors of any stage are returned immediately.
pub fn integrate_chained(
    systems: &[Arc<dyn OdeModel>],
    overrides: &StageOverrides,
    problem: &Problem,
    options: &IntegrationOptions,
    chain: &ChainOptions,
    integrator: &dyn Integrator,
) -> Result<IntegrationResult, SystemError> {
    if systems.is_empty() {
        return Err(SystemError::config("a chain needs at least one system"));
    }
    let points = problem.tout.points()?;
    let (start, end) = (points[0], points[points.len() - 1]);
    let forward = end > start;

    let mut totals = Totals::default();
    let mut deepest: Option<IntegrationResult> = None;
    let mut last_error = None;
    let mut request = problem.clone();
    let mut carried: Option<IntegrationResult> = None;

    for (stage, system) in systems.iter().enumerate() {
        let nsys = stage + 1;
        let opts = overrides.options_for(stage, options);
        let mut budget = chain.autorestart;
        let mut current = request.clone();
        let mut output = carried.clone();
        let mut restarted = false;

        let (result, error) = loop {
            log::debug!(
                "stage {nsys}/{}: attempt {} from {:?}",
                systems.len(),
                totals.attempts + 1,
                current.tout
            );
            let Attempt { result, error } = integrate::attempt(system.as_ref(), &current, &opts, integrator)?;
            totals.add(&result);
            let output_now = concatenate(output.take(), result, restarted);
            let Some(error) = error else {
                let mut done = output_now;
                totals.apply(&mut done, nsys);
                log::debug!("stage {nsys} succeeded after {} attempts", totals.attempts);
                return Ok(done);
            };

            let resumable = match (output_now.last(), budget) {
                (_, 0) | (None, _) => None,
                (Some((x, y)), _) => {
                    let remaining = if forward { end - x } else { x - end };
                    let moved = current_start(&current) != Some(x);
                    (remaining > 0.0 && moved).then(|| (x, y.to_vec()))
                }
            };
            match resumable {
                Some((x, y)) => {
                    budget -= 1;
                    let params = current
                        .params
                        .resolve(system.param_names(), system.nparams(), "parameters")?;
                    log::debug!("stage {nsys}: {error}; restarting from x = {x}, {budget} restarts left");
                    current = current.continued_from(x, y, params);
                    output = Some(output_now);
                    restarted = true;
                }
                None => break (output_now, error),
            }
        };

        log::warn!("stage {nsys}/{} failed: {error}", systems.len());
        let reached = result.last().map(|(x, y)| (x, y.to_vec()));
        if deepest
            .as_ref()
            .map_or(true, |d| progress(&result, start, forward) > progress(d, start, forward))
        {
            deepest = Some(result.clone());
        }
        last_error = Some((error, opts.return_on_error));

        if chain.mode == ChainMode::Continue {
            if let Some((x, y)) = reached.filter(|(x, _)| if forward { *x < end } else { *x > end }) {
                let params = request
                    .params
                    .resolve(system.param_names(), system.nparams(), "parameters")?;
                request = request.continued_from(x, y, params);
                carried = Some(result);
            }
        }
    }

    if let Some((error, false)) = last_error {
        log::warn!("all {} stages failed", systems.len());
        return Err(error);
    }
    log::warn!("all {} stages failed, returning the furthest attempt", systems.len());
    let mut result = deepest.unwrap_or_default();
    totals.apply(&mut result, systems.len());
    result.info.success = false;
    Ok(result)
}

fn current_start(problem: &Problem) -> Option<f64> {
    match &problem.tout {
        Tout::End(_) => Some(0.0),
        Tout::Span(start, _) => Some(*start),
        Tout::Points(points) => points.first().copied(),
    }
}

/// Runs [`integrate_chained`] for many problems in parallel.
///
/// `overrides` holds either one entry shared by all problems or one per problem.
/// Results are returned in the order of `problems`.
pub fn integrate_chained_batch(
    systems: &[Arc<dyn OdeModel>],
    overrides: &[StageOverrides],
    problems: &[Problem],
    options: &IntegrationOptions,
    chain: &ChainOptions,
    integrator: &dyn Integrator,
) -> Result<Vec<Result<IntegrationResult, SystemError>>, SystemError> {
    if overrides.len() > 1 && overrides.len() != problems.len() {
        return Err(SystemError::dimension("stage overrides", problems.len(), overrides.len()));
    }
    let shared = StageOverrides::default();
    log::debug!("integrating {} problems over {} stages", problems.len(), systems.len());
    Ok(problems
        .par_iter()
        .enumerate()
        .map(|(i, problem)| {
            let overrides = match overrides.len() {
                0 => &shared,
                1 => &overrides[0],
                _ => &overrides[i],
            };
            integrate_chained(systems, overrides, problem, options, chain, integrator)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{integrator::OdeSolvers, system::SymbolicSystem};
    use approx::assert_relative_eq;

    fn growth() -> Arc<dyn OdeModel> {
        Arc::new(SymbolicSystem::from_callback(|_x, y, p| vec![&p[0] * &y[0]], 1, 1).unwrap())
    }

    #[test]
    fn test_overrides_fill_gaps_from_base() {
        let base = IntegrationOptions::default().with_nsteps(100);
        let overrides = StageOverrides::new().with_nsteps([5]).with_atol([1e-3, 1e-4]);
        let first = overrides.options_for(0, &base);
        let second = overrides.options_for(1, &base);
        assert_eq!(first.nsteps, 5);
        assert_eq!(second.nsteps, 100);
        assert_eq!(second.atol, 1e-4);
        assert_eq!(second.rtol, base.rtol);
    }

    #[test]
    fn test_concatenate_drops_repeated_sample() {
        let mut first = IntegrationResult {
            xout: vec![0.0, 1.0],
            yout: vec![vec![1.0], vec![2.0]],
            ..IntegrationResult::default()
        };
        first.info.root_indices = vec![1];
        let mut second = IntegrationResult {
            xout: vec![1.0, 2.0, 3.0],
            yout: vec![vec![2.0], vec![3.0], vec![4.0]],
            ..IntegrationResult::default()
        };
        second.info.root_indices = vec![1];
        second.info.success = true;
        first.info.internal_xout = first.xout.clone();
        first.info.internal_yout = vec![vec![0.0], vec![2.0f64.ln()]];
        second.info.internal_xout = second.xout.clone();
        second.info.internal_yout = second.yout.clone();

        let joined = concatenate(Some(first.clone()), second.clone(), true);
        assert_eq!(joined.xout, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(joined.yout.len(), 4);
        assert_eq!(joined.info.root_indices, vec![1, 2]);
        assert_eq!(joined.info.internal_xout, vec![0.0, 1.0, 2.0, 3.0]);
        assert!(joined.info.success);

        // a later stage integrates in its own coordinates
        let handed_over = concatenate(Some(first), second.clone(), false);
        assert_eq!(handed_over.xout, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(handed_over.info.internal_xout, second.info.internal_xout);
        assert_eq!(handed_over.info.internal_yout, second.info.internal_yout);
    }

    #[test]
    fn test_autorestart_resumes_within_stage() -> Result<(), Box<dyn std::error::Error>> {
        let problem = Problem::new(Tout::End(2.0), [1.0], [1.0]);
        let opts = IntegrationOptions::default()
            .with_nsteps(20)
            .with_return_on_error(true);
        let systems = [growth()];

        let single = integrate_chained(&systems, &StageOverrides::new(), &problem, &opts, &ChainOptions::default(), &OdeSolvers)?;
        assert!(!single.info.success);

        let chain = ChainOptions::default().with_autorestart(50);
        let restarted = integrate_chained(&systems, &StageOverrides::new(), &problem, &opts, &chain, &OdeSolvers)?;
        assert!(restarted.info.success);
        assert!(restarted.info.attempts > 1);
        assert_eq!(restarted.info.nsys, 1);
        let (x, y) = restarted.last().unwrap();
        assert_relative_eq!(x, 2.0);
        assert_relative_eq!(y[0], 2.0f64.exp(), max_relative = 1e-5);
        assert!(restarted.xout.windows(2).all(|w| w[1] > w[0]));
        Ok(())
    }

    #[test]
    fn test_last_stage_error_propagates() {
        let problem = Problem::new(Tout::End(2.0), [1.0], [1.0]);
        let opts = IntegrationOptions::default().with_nsteps(1);
        let systems = [growth(), growth()];
        let err = integrate_chained(&systems, &StageOverrides::new(), &problem, &opts, &ChainOptions::default(), &OdeSolvers)
            .unwrap_err();
        assert!(matches!(err, SystemError::Integration { .. }));
    }

    #[test]
    fn test_construction_errors_are_not_retried() {
        let problem = Problem::new(Tout::End(1.0), [1.0, 2.0], [1.0]);
        let err = integrate_chained(
            &[growth()],
            &StageOverrides::new(),
            &problem,
            &IntegrationOptions::default().with_return_on_error(true),
            &ChainOptions::default().with_autorestart(3),
            &OdeSolvers,
        )
        .unwrap_err();
        assert!(matches!(err, SystemError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_chain_options_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let chain: ChainOptions = serde_json::from_str(r#"{"mode": "continue"}"#)?;
        assert_eq!(chain, ChainOptions::default().with_mode(ChainMode::Continue));
        let overrides: StageOverrides = serde_json::from_str(r#"{"nsteps": [10, null, 30]}"#)?;
        assert_eq!(overrides.nsteps, vec![Some(10), None, Some(30)]);
        Ok(())
    }
}
