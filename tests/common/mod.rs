//! Shared helpers for the integration tests.

#![allow(dead_code)]

use symode::expr::Expr;
use symode::system::SymbolView;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Right-hand side of the decay chain `y_0 -> y_1 -> ... -> y_{n-1}` with rates `p_i`.
pub fn decay_dydt_factory(n: usize) -> impl Fn(&Expr, &SymbolView<'_>, &SymbolView<'_>) -> Vec<Expr> {
    move |_x, y, p| {
        (0..n)
            .map(|i| {
                let loss = -&p[i] * &y[i];
                if i == 0 {
                    loss
                } else {
                    &p[i - 1] * &y[i - 1] + loss
                }
            })
            .collect()
    }
}

/// Analytic solution of the decay chain at `t`, for pairwise distinct rates `k`.
///
/// Every species may start with a nonzero amount; each initial amount decays along the
/// rest of the chain independently.
pub fn bateman(t: f64, k: &[f64], y0: &[f64]) -> Vec<f64> {
    let n = k.len();
    (0..n)
        .map(|j| {
            (0..=j)
                .map(|i| {
                    let rates: f64 = k[i..j].iter().product();
                    let sum: f64 = (i..=j)
                        .map(|l| {
                            let denom: f64 = (i..=j).filter(|&m| m != l).map(|m| k[m] - k[l]).product();
                            (-k[l] * t).exp() / denom
                        })
                        .sum();
                    y0[i] * rates * sum
                })
                .sum()
        })
        .collect()
}
