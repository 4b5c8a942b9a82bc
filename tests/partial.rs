mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use common::{bateman, decay_dydt_factory, init_logging};
use symode::prelude::*;

fn chain() -> Result<Arc<dyn OdeModel>, SystemError> {
    Ok(Arc::new(SymbolicSystem::from_callback(decay_dydt_factory(3), 3, 3)?))
}

#[test]
fn test_conserved_total_is_reconstructed() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let reduced = PartiallySolvedSystem::new(chain()?, |s| {
        let total = &s.y0[0] + &s.y0[1] + &s.y0[2];
        [(s.dep[2].clone(), total - &s.dep[0] - &s.dep[1])]
    })?;
    assert_eq!(reduced.free_ny(), 2);
    assert_eq!(reduced.init_dep().len(), 3);

    let k = [3.5, 2.5, 0.0];
    let y0 = [3.0, 2.0, 1.0];
    let problem = Problem::new(Tout::End(3.0), y0, k);
    let opts = IntegrationOptions::default().with_tolerances(1e-10, 1e-10).with_nsteps(5000);
    let result = reduced.integrate(&problem, &opts, &OdeSolvers)?;
    assert!(result.info.success);
    for (x, row) in result.xout.iter().zip(&result.yout) {
        assert_eq!(row.len(), 3);
        assert_relative_eq!(row.iter().sum::<f64>(), 6.0, max_relative = 1e-12);
        let reference = bateman(*x, &k, &y0);
        for (got, want) in row.iter().zip(&reference) {
            assert_relative_eq!(got, want, max_relative = 1e-6, epsilon = 1e-9);
        }
    }
    Ok(())
}

#[test]
fn test_partial_over_log_transform() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    // the inner symbols are log-amounts here, so the closed form is written in them too
    let logsys = TransformedSystem::new(chain()?, Some(Transform::log_exp()), None)?;
    let reduced = PartiallySolvedSystem::new(Arc::new(logsys), |s| {
        [(s.dep[0].clone(), &s.y0[0] - &s.p[0] * (s.x - s.x0))]
    })?;

    let k = [2.0, 1.0, 0.5];
    let y0 = [1.0, 1.0, 1.0];
    let problem = Problem::new(Tout::Points(vec![0.0, 0.5, 1.0, 1.5]), y0, k);
    let opts = IntegrationOptions::default().with_tolerances(1e-12, 1e-10).with_nsteps(5000);
    let result = reduced.integrate(&problem, &opts, &OdeSolvers)?;
    assert_eq!(result.xout, vec![0.0, 0.5, 1.0, 1.5]);
    for (x, row) in result.xout.iter().zip(&result.yout) {
        let reference = bateman(*x, &k, &y0);
        for (got, want) in row.iter().zip(&reference) {
            assert_relative_eq!(got, want, max_relative = 1e-6);
        }
    }
    Ok(())
}

#[test]
fn test_named_closed_forms() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let inner = SymbolicSystem::builder()
        .names(["parent", "daughter"])
        .param_names(["lambda"])
        .from_callback(
            |_x, y, p| {
                vec![
                    -&p["lambda"] * &y["parent"],
                    &p["lambda"] * &y["parent"],
                ]
            },
            2,
            1,
        )?;
    let reduced = PartiallySolvedSystem::new(Arc::new(inner), |s| {
        [(
            s.dep["parent"].clone(),
            &s.y0["parent"] * (-&s.p["lambda"] * (s.x - s.x0)).exp(),
        )]
    })?;
    assert_eq!(reduced.free_names(), vec!["daughter".to_string()]);
    assert!(reduced.substitution("parent").is_some());

    let problem = Problem::new(
        Tout::End(1.0),
        Values::by_name([("parent", 4.0)]),
        Values::by_name([("lambda", 0.5)]),
    );
    let result = reduced.integrate(&problem, &IntegrationOptions::default(), &OdeSolvers)?;
    let parent = result.column_by_name("parent")?;
    let daughter = result.column_by_name("daughter")?;
    for ((x, a), b) in result.xout.iter().zip(&parent).zip(&daughter) {
        assert_relative_eq!(*a, 4.0 * (-0.5 * x).exp(), max_relative = 1e-12);
        assert_relative_eq!(a + b, 4.0, max_relative = 1e-7);
    }
    Ok(())
}
