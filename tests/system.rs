mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use common::{decay_dydt_factory, init_logging};
use symode::prelude::*;

#[test]
fn test_root_of_exponential_growth() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let system = SymbolicSystem::builder()
        .roots(vec![Expr::var("y_0") - std::f64::consts::E])
        .from_strings(&["y_0"], 0)?;
    let problem = Problem::new(Tout::End(2.0), [1.0], Vec::<f64>::new());
    let opts = IntegrationOptions::default().with_tolerances(1e-10, 1e-10).with_nsteps(20_000);
    let result = system.integrate(&problem, &opts, &OdeSolvers)?;

    assert_eq!(result.info.root_indices.len(), 1);
    let i = result.info.root_indices[0];
    assert_relative_eq!(result.xout[i], 1.0, epsilon = 1e-6);
    assert_relative_eq!(result.yout[i][0], std::f64::consts::E, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_name_based_construction_and_integration() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let system = SymbolicSystem::builder()
        .names(["prey", "predator"])
        .param_names(["a", "b", "c", "d"])
        .from_strings(&["a*prey - b*prey*predator", "d*prey*predator - c*predator"], 4)?;
    assert_eq!(system.dep_by_name("predator")?, &Expr::var("y_1"));
    assert_eq!(system.param_by_name("c")?, &Expr::var("p_2"));

    let problem = Problem::new(
        Tout::Points(vec![0.0, 1.0, 2.0]),
        Values::by_name([("prey", 10.0), ("predator", 5.0)]),
        Values::by_name([("a", 1.1), ("b", 0.4), ("c", 0.4), ("d", 0.1)]),
    );
    let result = system.integrate(&problem, &IntegrationOptions::default(), &OdeSolvers)?;
    assert_eq!(result.names.as_deref(), Some(&["prey".to_string(), "predator".to_string()][..]));

    // the Lotka-Volterra invariant d*x - c*ln(x) + b*y - a*ln(y) is conserved
    let invariant = |x: f64, y: f64| 0.1 * x - 0.4 * x.ln() + 0.4 * y - 1.1 * y.ln();
    let v0 = invariant(10.0, 5.0);
    for row in &result.yout {
        assert_relative_eq!(invariant(row[0], row[1]), v0, max_relative = 1e-6);
    }

    let unknown = Problem::new(Tout::End(1.0), Values::by_name([("wolf", 1.0)]), [1.0, 1.0, 1.0, 1.0]);
    let err = system
        .integrate(&unknown, &IntegrationOptions::default(), &OdeSolvers)
        .unwrap_err();
    assert!(matches!(err, SystemError::ConfigurationError(_)));
    Ok(())
}

#[test]
fn test_jit_and_interpreter_agree() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let build = |backend: Arc<dyn SymbolicBackend>| {
        SymbolicSystem::builder()
            .backend(backend)
            .from_callback(decay_dydt_factory(4), 4, 4)
    };
    let interpreted = build(Arc::new(Interpreter))?;
    let jitted = build(Arc::new(CraneliftJit))?;

    let problem = Problem::new(Tout::Points(vec![0.0, 0.5, 1.0]), [1.0, 0.5, 0.0, 0.0], [4.0, 3.0, 2.0, 1.0]);
    let opts = IntegrationOptions::default();
    let a = interpreted.integrate(&problem, &opts, &OdeSolvers)?;
    let b = jitted.integrate(&problem, &opts, &OdeSolvers)?;
    for (ra, rb) in a.yout.iter().zip(&b.yout) {
        for (va, vb) in ra.iter().zip(rb) {
            assert_relative_eq!(va, vb, max_relative = 1e-12, epsilon = 1e-15);
        }
    }

    let (y, p) = ([0.3, 0.2, 0.1, 0.4], [4.0, 3.0, 2.0, 1.0]);
    assert_eq!(interpreted.eval_jacobian(0.0, &y, &p)?, jitted.eval_jacobian(0.0, &y, &p)?);
    Ok(())
}

#[test]
fn test_open_chain_jacobian_is_singular() -> Result<(), Box<dyn std::error::Error>> {
    // the last species does not decay, so its column is zero
    let open = SymbolicSystem::from_callback(
        |_x, y, p| vec![-&p[0] * &y[0], &p[0] * &y[0]],
        2,
        1,
    )?;
    assert!(open.jacobian_singular()?);
    let closed = SymbolicSystem::from_callback(decay_dydt_factory(2), 2, 2)?;
    assert!(!closed.jacobian_singular()?);
    Ok(())
}

#[test]
fn test_banded_jacobian_of_decay_chain() -> Result<(), Box<dyn std::error::Error>> {
    let system = SymbolicSystem::from_callback(decay_dydt_factory(3), 3, 3)?;
    let banded = system.banded_jacobian_values(0.0, &[1.0, 1.0, 1.0], &[4.0, 3.0, 0.0], 1, 0)?;
    assert_eq!(banded, vec![vec![-4.0, -3.0, 0.0], vec![4.0, 3.0, 0.0]]);
    Ok(())
}
