//! Symbolic backends.
//!
//! Everything above the expression layer talks to a [`SymbolicBackend`], never to a
//! concrete engine. A backend is chosen by the caller and injected when a system is
//! built; wrappers inherit the backend of the system they wrap.
//!
//! Two backends ship with the crate:
//! - [`Interpreter`]: executes the optimised stack program, no compilation cost
//! - [`CraneliftJit`]: compiles the same stack program to native code

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{
    builder,
    errors::SystemError,
    expr::{Expr, FlattenedExpr, LinearOp},
    opt,
    types::{CompiledFunction, Layout},
};

/// Capability interface of a symbolic engine.
///
/// The provided methods implement differentiation, substitution and evaluation with the
/// crate's own [`Expr`] algebra. Implementors only have to provide code generation.
pub trait SymbolicBackend: Send + Sync + fmt::Debug {
    /// Short identifier used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Derivative of `expr` with respect to the symbol `wrt`, simplified.
    fn differentiate(&self, expr: &Expr, wrt: &str) -> Expr {
        expr.derivative(wrt).simplify()
    }

    /// Simultaneous substitution of symbols, simplified.
    fn substitute(&self, expr: &Expr, subs: &HashMap<String, Expr>) -> Expr {
        expr.substitute(subs).simplify()
    }

    /// One-off numeric evaluation.
    fn evaluate(&self, expr: &Expr, values: &HashMap<String, f64>) -> Result<f64, SystemError> {
        expr.eval(values)
    }

    /// Compiles `exprs` into a single function reading its inputs through `layout`.
    fn compile(&self, exprs: &[Expr], layout: &Layout) -> Result<CompiledFunction, SystemError>;
}

/// Shared handle to the default backend.
pub fn default_backend() -> Arc<dyn SymbolicBackend> {
    Arc::new(Interpreter)
}

/// Flattens and optimises every expression against `layout`.
pub(crate) fn lower(exprs: &[Expr], layout: &Layout) -> Result<Vec<FlattenedExpr>, SystemError> {
    exprs
        .iter()
        .map(|e| Ok(opt::optimize(e.flatten(layout)?)))
        .collect()
}

/// Number of input slots a set of programs reads.
pub(crate) fn input_width(programs: &[FlattenedExpr]) -> usize {
    programs
        .iter()
        .filter_map(|p| p.max_var_index)
        .max()
        .map_or(0, |m| m as usize + 1)
}

/// Backend that interprets the flattened stack program.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl SymbolicBackend for Interpreter {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn compile(&self, exprs: &[Expr], layout: &Layout) -> Result<CompiledFunction, SystemError> {
        let programs = lower(exprs, layout)?;
        let width = input_width(&programs);
        Ok(Arc::new(move |input: &[f64], output: &mut [f64]| {
            assert!(
                input.len() >= width && output.len() >= programs.len(),
                "compiled function called with {} inputs and {} outputs, needs {} and {}",
                input.len(),
                output.len(),
                width,
                programs.len()
            );
            let mut stack = Vec::with_capacity(16);
            for (slot, program) in output.iter_mut().zip(&programs) {
                *slot = match program.constant_result {
                    Some(value) => value,
                    None => execute(&program.ops, input, &mut stack),
                };
            }
        }))
    }
}

/// Runs a stack program; a well-formed program leaves exactly one value.
pub(crate) fn execute(ops: &[LinearOp], input: &[f64], stack: &mut Vec<f64>) -> f64 {
    stack.clear();
    let pop = |stack: &mut Vec<f64>| stack.pop().unwrap_or(f64::NAN);
    for op in ops {
        let value = match op {
            LinearOp::LoadConst(c) => *c,
            LinearOp::LoadVar(i) => input[*i as usize],
            LinearOp::Abs => pop(stack).abs(),
            LinearOp::Neg => -pop(stack),
            LinearOp::PowConst(n) => pop(stack).powi(*n as i32),
            LinearOp::PowFloat(c) => pop(stack).powf(*c),
            LinearOp::Exp => pop(stack).exp(),
            LinearOp::Ln => pop(stack).ln(),
            LinearOp::Sqrt => pop(stack).sqrt(),
            LinearOp::Sin => pop(stack).sin(),
            LinearOp::Cos => pop(stack).cos(),
            LinearOp::Add | LinearOp::Sub | LinearOp::Mul | LinearOp::Div | LinearOp::PowExpr => {
                let r = pop(stack);
                let l = pop(stack);
                match op {
                    LinearOp::Add => l + r,
                    LinearOp::Sub => l - r,
                    LinearOp::Mul => l * r,
                    LinearOp::Div => l / r,
                    _ => l.powf(r),
                }
            }
            LinearOp::Fma | LinearOp::Fmsub => {
                let c = pop(stack);
                let b = pop(stack);
                let a = pop(stack);
                if matches!(op, LinearOp::Fma) {
                    a.mul_add(b, c)
                } else {
                    a.mul_add(b, -c)
                }
            }
        };
        stack.push(value);
    }
    pop(stack)
}

/// Backend that JIT-compiles expressions with Cranelift.
///
/// Compilation takes milliseconds per system, so this pays off for long integrations
/// or large batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct CraneliftJit;

impl SymbolicBackend for CraneliftJit {
    fn name(&self) -> &'static str {
        "cranelift-jit"
    }

    fn compile(&self, exprs: &[Expr], layout: &Layout) -> Result<CompiledFunction, SystemError> {
        let programs = lower(exprs, layout)?;
        log::debug!("jit compiling {} expressions", programs.len());
        Ok(builder::build_combined_function(&programs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        HashMap::from([("x".to_string(), 0), ("y".to_string(), 1), ("k".to_string(), 2)])
    }

    fn sample_exprs() -> Vec<Expr> {
        let x = Expr::var("x");
        let y = Expr::var("y");
        let k = Expr::var("k");
        vec![
            -(&k * &y) + 3.0,
            (&x * &y).exp() / (&y + 1.0).ln(),
            y.clone().powi(3) - x.clone().sqrt() * k.clone().cos(),
            y.clone().powf(1.5) + x.clone().pow(k.clone()).abs(),
            Expr::constant(2.0) * Expr::constant(4.0),
            x.sin() * 0.25 + y.powi(-2),
        ]
    }

    #[test]
    fn test_interpreter_matches_tree_walk() -> Result<(), Box<dyn std::error::Error>> {
        let exprs = sample_exprs();
        let f = Interpreter.compile(&exprs, &layout())?;
        let input = [0.7, 1.3, 2.5];
        let values = HashMap::from([
            ("x".to_string(), 0.7),
            ("y".to_string(), 1.3),
            ("k".to_string(), 2.5),
        ]);
        let mut out = vec![0.0; exprs.len()];
        f(&input, &mut out);
        for (expr, got) in exprs.iter().zip(&out) {
            let expected = expr.eval(&values)?;
            assert!((expected - got).abs() <= 1e-12 * expected.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn test_jit_matches_interpreter() -> Result<(), Box<dyn std::error::Error>> {
        let exprs = sample_exprs();
        let interpreted = Interpreter.compile(&exprs, &layout())?;
        let jitted = CraneliftJit.compile(&exprs, &layout())?;
        let input = [0.7, 1.3, 2.5];
        let mut a = vec![0.0; exprs.len()];
        let mut b = vec![0.0; exprs.len()];
        interpreted(&input, &mut a);
        jitted(&input, &mut b);
        for (l, r) in a.iter().zip(&b) {
            assert!((l - r).abs() <= 1e-12 * l.abs().max(1.0), "{l} != {r}");
        }
        Ok(())
    }

    #[test]
    fn test_backend_differentiate_simplifies() {
        let expr = Expr::var("k") * Expr::var("y");
        assert_eq!(Interpreter.differentiate(&expr, "y"), Expr::var("k"));
    }

    #[test]
    fn test_compile_reports_unknown_symbol() {
        let result = Interpreter.compile(&[Expr::var("q")], &layout());
        assert!(matches!(result, Err(SystemError::Convert(_))));
    }
}
