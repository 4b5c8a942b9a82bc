//! # Chained Integration Benchmark
//!
//! Integrates a seven-species decay chain through a two-stage chain (log-transformed
//! system first, plain system as fallback) and compares the symbolic backends.
//!
//! ## Implementations Compared
//!
//! 1. **Interpreter**: executes the optimised stack program for every evaluation.
//! 2. **Cranelift JIT**: compiles the same program to native code once per system.
//!
//! System construction (Jacobian derivation, transforms, compilation) happens outside
//! the timed loop; only integration is measured.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use symode::prelude::*;

const N: usize = 7;

fn chain(backend: Arc<dyn SymbolicBackend>) -> Vec<Arc<dyn OdeModel>> {
    let plain: Arc<dyn OdeModel> = Arc::new(
        SymbolicSystem::builder()
            .backend(backend)
            .from_callback(
                |_x, y, p| {
                    (0..N)
                        .map(|i| {
                            let loss = -&p[i] * &y[i];
                            if i == 0 {
                                loss
                            } else {
                                &p[i - 1] * &y[i - 1] + loss
                            }
                        })
                        .collect::<Vec<_>>()
                },
                N,
                N,
            )
            .expect("Failed to build decay chain"),
    );
    let logsys = symmetricsys(Some(Transform::log_exp()), None)
        .from_other(plain.clone())
        .expect("Failed to transform decay chain");
    vec![Arc::new(logsys), plain]
}

fn benchmark_chained(c: &mut Criterion) {
    let rates: Vec<f64> = (0..N).map(|i| 1.0 / (i as f64 + 1.0)).collect();
    let problem = Problem::new(Tout::End(10.0), vec![1.0; N], rates);
    let options = IntegrationOptions::default().with_nsteps(5000);
    let overrides = StageOverrides::new();
    let chain_options = ChainOptions::default();

    let interpreted = chain(Arc::new(Interpreter));
    let jitted = chain(Arc::new(CraneliftJit));

    let mut group = c.benchmark_group("Chained Decay Integration");

    group.bench_function("Interpreter", |b| {
        b.iter(|| {
            integrate_chained(
                black_box(&interpreted),
                &overrides,
                &problem,
                &options,
                &chain_options,
                &OdeSolvers,
            )
        })
    });

    group.bench_function("Cranelift JIT", |b| {
        b.iter(|| {
            integrate_chained(
                black_box(&jitted),
                &overrides,
                &problem,
                &options,
                &chain_options,
                &OdeSolvers,
            )
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_chained);
criterion_main!(benches);
