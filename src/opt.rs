//! Peephole optimiser for the flattened stack program.
//!
//! Pass pipeline
//! -------------
//!  1. **fold_consts** – evaluate operations whose operands are all constant loads.
//!  2. **fuse_fma**    – rewrite `a*b+c`, `c+a*b` and `a*b-c` load sequences into
//!                       the dedicated `Fma` / `Fmsub` opcodes.
//!
//! [`optimize`] repeats the pipeline until the program stops shrinking. Both backends
//! execute the optimised program, so interpreter and JIT see identical arithmetic.

use crate::expr::{FlattenedExpr, LinearOp};

/// Run all passes until nothing changes.
pub fn optimize(flattened: FlattenedExpr) -> FlattenedExpr {
    if flattened.constant_result.is_some() {
        return flattened;
    }
    let mut ops = flattened.ops;
    loop {
        let len_before = ops.len();
        ops = fuse_fma(fold_consts(ops));
        if ops.len() == len_before {
            break;
        }
    }
    let constant_result = match ops.as_slice() {
        [LinearOp::LoadConst(c)] => Some(*c),
        _ => None,
    };
    FlattenedExpr {
        ops,
        constant_result,
        ..flattened
    }
}

/// Applies a foldable operation to constant operands.
///
/// Returns `None` for results that are not finite, those are kept as runtime
/// operations so the failure surfaces where the value is used.
fn fold(op: &LinearOp, args: &[f64]) -> Option<f64> {
    use LinearOp::*;
    let value = match (op, args) {
        (Abs, [a]) => a.abs(),
        (Neg, [a]) => -a,
        (PowConst(n), [a]) => a.powi(*n as i32),
        (PowFloat(c), [a]) => a.powf(*c),
        (Exp, [a]) => a.exp(),
        (Ln, [a]) => a.ln(),
        (Sqrt, [a]) => a.sqrt(),
        (Sin, [a]) => a.sin(),
        (Cos, [a]) => a.cos(),
        (Add, [a, b]) => a + b,
        (Sub, [a, b]) => a - b,
        (Mul, [a, b]) => a * b,
        (Div, [a, b]) => a / b,
        (PowExpr, [a, b]) => a.powf(*b),
        (Fma, [a, b, c]) => a.mul_add(*b, *c),
        (Fmsub, [a, b, c]) => a.mul_add(*b, -c),
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn arity(op: &LinearOp) -> usize {
    use LinearOp::*;
    match op {
        LoadConst(_) | LoadVar(_) => 0,
        Abs | Neg | PowConst(_) | PowFloat(_) | Exp | Ln | Sqrt | Sin | Cos => 1,
        Add | Sub | Mul | Div | PowExpr => 2,
        Fma | Fmsub => 3,
    }
}

// ────────────────────────────────────────────────────────────────────────────
//  Pass 1 – constant folding
// ────────────────────────────────────────────────────────────────────────────
fn fold_consts(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    let mut out: Vec<LinearOp> = Vec::with_capacity(ops.len());
    // mirrors the runtime stack: Some(c) when the slot is a known constant
    let mut known: Vec<Option<f64>> = Vec::with_capacity(8);

    for op in ops {
        let n = arity(&op);
        match op {
            LinearOp::LoadConst(c) => {
                out.push(LinearOp::LoadConst(c));
                known.push(Some(c));
            }
            LinearOp::LoadVar(_) => {
                out.push(op);
                known.push(None);
            }
            _ => {
                let split = known.len().saturating_sub(n);
                let operands: Option<Vec<f64>> = known[split..].iter().copied().collect();
                let folded = operands.and_then(|args| fold(&op, &args));
                known.truncate(split);
                match folded {
                    // every constant operand was produced by the load right before it
                    Some(value) => {
                        out.truncate(out.len() - n);
                        out.push(LinearOp::LoadConst(value));
                        known.push(Some(value));
                    }
                    None => {
                        out.push(op);
                        known.push(None);
                    }
                }
            }
        }
    }
    out
}

// ────────────────────────────────────────────────────────────────────────────
//  Pass 2 – FMA / FMSUB fusion
// ────────────────────────────────────────────────────────────────────────────
fn is_load(op: &LinearOp) -> bool {
    matches!(op, LinearOp::LoadVar(_) | LinearOp::LoadConst(_))
}

fn fuse_fma(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    use LinearOp::*;
    let mut out = Vec::with_capacity(ops.len());
    let mut i = 0;

    while i < ops.len() {
        if let Some(window) = ops.get(i..i + 5) {
            if window[..2].iter().all(is_load) && window[2] == Mul && is_load(&window[3]) {
                // a*b + c  /  a*b - c
                let fused = match window[4] {
                    Add => Some(Fma),
                    Sub => Some(Fmsub),
                    _ => None,
                };
                if let Some(fused) = fused {
                    out.extend_from_slice(&window[..2]);
                    out.push(window[3].clone());
                    out.push(fused);
                    i += 5;
                    continue;
                }
            }
            if window[..3].iter().all(is_load) && window[3] == Mul && window[4] == Add {
                // c + a*b
                out.extend_from_slice(&window[1..3]);
                out.push(window[0].clone());
                out.push(Fma);
                i += 5;
                continue;
            }
        }
        out.push(ops[i].clone());
        i += 1;
    }
    out
}
