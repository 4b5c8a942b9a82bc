//! Expression module for representing symbolic right-hand sides.
//!
//! This module defines the expression tree used by every system in the crate. An
//! `Expr` can be:
//! - Symbolically differentiated to derive Jacobians and chain-rule factors
//! - Simplified using algebraic rules that are valid on the real domain
//! - Rewritten by simultaneous substitution of symbols
//! - Flattened into a linear stack program that the interpreter and the JIT consume
//! - Evaluated directly against a symbol table
//!
//! Variables are referenced by name. The position of a variable in an input buffer is
//! decided late, when an expression is flattened against a layout, so the same tree
//! can be compiled for different argument orders.
//!
//! # Symbolic Differentiation
//! The derivative method applies the usual calculus rules recursively:
//! - Product rule
//! - Quotient rule
//! - Chain rule
//! - Power rule
//! - Special function derivatives (exp, ln, sqrt, sin, cos)
//!
//! # Expression Simplification
//! The simplify method performs:
//! - Constant folding (e.g. 2 + 3 → 5)
//! - Identity rules (e.g. x + 0 → x, x * 1 → x)
//! - Exponent rules (e.g. x^0 → 1, x^1 → x)
//! - Inverse pairs (e.g. ln(exp(x)) → x)
//!
//! Rewrites such as ln(x*y) → ln(x) + ln(y) are not applied, they change the value
//! when both factors are negative.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops;

use crate::errors::{ConvertError, SystemError};

/// An expression tree node representing mathematical operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A symbol referenced by name
    Var(String),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation of an expression by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

/// Linear operation of the flattened stack program
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOp {
    /// Load constant value
    LoadConst(f64),
    /// Load input slot by index
    LoadVar(u32),
    Add,
    Sub,
    Mul,
    Div,
    Abs,
    Neg,
    /// Power with integer exponent
    PowConst(i64),
    /// Power with floating point exponent
    PowFloat(f64),
    /// Power with the exponent on top of the stack
    PowExpr,
    Exp,
    Ln,
    Sqrt,
    Sin,
    Cos,
    /// a × b + c  (fused)
    Fma,
    /// a × b − c  (fused)
    Fmsub,
}

/// Flattened expression, ready to be interpreted or compiled
#[derive(Debug, Clone)]
pub struct FlattenedExpr {
    /// Linear sequence of operations
    pub ops: Vec<LinearOp>,
    /// Maximum input slot accessed
    pub max_var_index: Option<u32>,
    /// Pre-computed result when the expression does not depend on any input
    pub constant_result: Option<f64>,
}

impl Expr {
    /// Creates a symbol.
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn constant(value: f64) -> Expr {
        Expr::Const(value)
    }

    pub fn exp(self) -> Expr {
        Expr::Exp(Box::new(self))
    }

    pub fn ln(self) -> Expr {
        Expr::Ln(Box::new(self))
    }

    pub fn sqrt(self) -> Expr {
        Expr::Sqrt(Box::new(self))
    }

    pub fn sin(self) -> Expr {
        Expr::Sin(Box::new(self))
    }

    pub fn cos(self) -> Expr {
        Expr::Cos(Box::new(self))
    }

    pub fn abs(self) -> Expr {
        Expr::Abs(Box::new(self))
    }

    pub fn powi(self, exponent: i64) -> Expr {
        Expr::Pow(Box::new(self), exponent)
    }

    pub fn powf(self, exponent: f64) -> Expr {
        Expr::PowFloat(Box::new(self), exponent)
    }

    pub fn pow(self, exponent: Expr) -> Expr {
        Expr::PowExpr(Box::new(self), Box::new(exponent))
    }

    /// Returns the value of a constant node.
    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the name of a symbol node.
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(value) if *value == 0.0)
    }

    /// Direct children of this node, left to right.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const(_) | Expr::Var(_) => Vec::new(),
            Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r)
            | Expr::Div(l, r)
            | Expr::PowExpr(l, r) => vec![l, r],
            Expr::Abs(e)
            | Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e)
            | Expr::Neg(e) => vec![e],
        }
    }

    /// Rebuilds this node with every child replaced by `f(child)`.
    fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        let mut g = |e: &Expr| Box::new(f(e));
        match self {
            Expr::Const(_) | Expr::Var(_) => self.clone(),
            Expr::Add(l, r) => Expr::Add(g(l), g(r)),
            Expr::Sub(l, r) => Expr::Sub(g(l), g(r)),
            Expr::Mul(l, r) => Expr::Mul(g(l), g(r)),
            Expr::Div(l, r) => Expr::Div(g(l), g(r)),
            Expr::PowExpr(l, r) => Expr::PowExpr(g(l), g(r)),
            Expr::Abs(e) => Expr::Abs(g(e)),
            Expr::Pow(e, n) => Expr::Pow(g(e), *n),
            Expr::PowFloat(e, n) => Expr::PowFloat(g(e), *n),
            Expr::Exp(e) => Expr::Exp(g(e)),
            Expr::Ln(e) => Expr::Ln(g(e)),
            Expr::Sqrt(e) => Expr::Sqrt(g(e)),
            Expr::Sin(e) => Expr::Sin(g(e)),
            Expr::Cos(e) => Expr::Cos(g(e)),
            Expr::Neg(e) => Expr::Neg(g(e)),
        }
    }

    /// Names of all symbols occurring in the expression, sorted.
    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    fn collect_symbols(&self, symbols: &mut BTreeSet<String>) {
        match self {
            Expr::Var(name) => {
                symbols.insert(name.clone());
            }
            _ => {
                for child in self.children() {
                    child.collect_symbols(symbols);
                }
            }
        }
    }

    /// Whether the symbol `name` occurs in the expression.
    pub fn contains_var(&self, name: &str) -> bool {
        match self {
            Expr::Var(v) => v == name,
            _ => self.children().iter().any(|c| c.contains_var(name)),
        }
    }

    /// Computes the symbolic derivative with respect to the symbol `with_respect_to`.
    ///
    /// The result is not simplified; call [`Expr::simplify`] on it.
    pub fn derivative(&self, with_respect_to: &str) -> Expr {
        let d = |e: &Expr| Box::new(e.derivative(with_respect_to));
        let bx = |e: &Expr| Box::new(e.clone());

        match self {
            Expr::Const(_) => Expr::Const(0.0),

            Expr::Var(name) => {
                if name == with_respect_to {
                    Expr::Const(1.0)
                } else {
                    Expr::Const(0.0)
                }
            }

            // d(f + g) = df + dg
            Expr::Add(l, r) => Expr::Add(d(l), d(r)),

            // d(f - g) = df - dg
            Expr::Sub(l, r) => Expr::Sub(d(l), d(r)),

            // d(f * g) = f * dg + g * df
            Expr::Mul(l, r) => Expr::Add(
                Box::new(Expr::Mul(bx(l), d(r))),
                Box::new(Expr::Mul(bx(r), d(l))),
            ),

            // d(f / g) = (g * df - f * dg) / g^2
            Expr::Div(l, r) => Expr::Div(
                Box::new(Expr::Sub(
                    Box::new(Expr::Mul(bx(r), d(l))),
                    Box::new(Expr::Mul(bx(l), d(r))),
                )),
                Box::new(Expr::Pow(bx(r), 2)),
            ),

            // d|f| = f / |f| * df
            Expr::Abs(e) => Expr::Mul(
                Box::new(Expr::Div(bx(e), Box::new(Expr::Abs(bx(e))))),
                d(e),
            ),

            // d(f^n) = n * f^(n-1) * df
            Expr::Pow(base, n) => Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*n as f64)),
                    Box::new(Expr::Pow(bx(base), n - 1)),
                )),
                d(base),
            ),

            // d(f^c) = c * f^(c-1) * df
            Expr::PowFloat(base, c) => Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*c)),
                    Box::new(Expr::PowFloat(bx(base), c - 1.0)),
                )),
                d(base),
            ),

            // d(f^g) = f^g * (dg * ln(f) + g * df / f)
            Expr::PowExpr(base, exponent) => Expr::Mul(
                Box::new(self.clone()),
                Box::new(Expr::Add(
                    Box::new(Expr::Mul(d(exponent), Box::new(Expr::Ln(bx(base))))),
                    Box::new(Expr::Mul(
                        bx(exponent),
                        Box::new(Expr::Div(d(base), bx(base))),
                    )),
                )),
            ),

            // d(e^f) = e^f * df
            Expr::Exp(e) => Expr::Mul(Box::new(self.clone()), d(e)),

            // d(ln f) = 1/f * df
            Expr::Ln(e) => Expr::Mul(
                Box::new(Expr::Div(Box::new(Expr::Const(1.0)), bx(e))),
                d(e),
            ),

            // d(sqrt f) = 1/(2 sqrt f) * df
            Expr::Sqrt(e) => Expr::Mul(
                Box::new(Expr::Div(
                    Box::new(Expr::Const(0.5)),
                    Box::new(Expr::Sqrt(bx(e))),
                )),
                d(e),
            ),

            // d(sin f) = cos f * df
            Expr::Sin(e) => Expr::Mul(Box::new(Expr::Cos(bx(e))), d(e)),

            // d(cos f) = -sin f * df
            Expr::Cos(e) => Expr::Mul(
                Box::new(Expr::Neg(Box::new(Expr::Sin(bx(e))))),
                d(e),
            ),

            Expr::Neg(e) => Expr::Neg(d(e)),
        }
    }

    /// Simplifies the expression by folding constants and applying algebraic rules.
    ///
    /// Children are simplified first, then the rules for the node itself are tried
    /// in order. Only rewrites that preserve the value for every real input where the
    /// original is defined are applied.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Var(_) => self.clone(),

            Expr::Add(left, right) => match (left.simplify(), right.simplify()) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(a + b),
                (e, Expr::Const(z)) | (Expr::Const(z), e) if z == 0.0 => e,
                // c1*x + c2*x -> (c1+c2)*x
                (Expr::Mul(a1, x1), Expr::Mul(a2, x2)) if x1 == x2 => {
                    Expr::Mul(Box::new(Expr::Add(a1, a2).simplify()), x1)
                }
                // x + (-y) -> x - y
                (l, Expr::Neg(r)) => Expr::Sub(Box::new(l), r),
                // (x + c1) + c2 -> x + (c1 + c2)
                (Expr::Add(x, c1), c2 @ Expr::Const(_)) if c1.as_const().is_some() => {
                    Expr::Add(x, Box::new(Expr::Add(c1, Box::new(c2)).simplify()))
                }
                (l, r) => Expr::Add(Box::new(l), Box::new(r)),
            },

            Expr::Sub(left, right) => match (left.simplify(), right.simplify()) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(a - b),
                (e, Expr::Const(z)) if z == 0.0 => e,
                (Expr::Const(z), e) if z == 0.0 => Expr::Neg(Box::new(e)).simplify(),
                (a, b) if a == b => Expr::Const(0.0),
                // c1*x - c2*x -> (c1-c2)*x
                (Expr::Mul(a1, x1), Expr::Mul(a2, x2)) if x1 == x2 => {
                    Expr::Mul(Box::new(Expr::Sub(a1, a2).simplify()), x1)
                }
                // x - (-y) -> x + y
                (l, Expr::Neg(r)) => Expr::Add(Box::new(l), r),
                // x - c -> x + (-c)
                (x, Expr::Const(c)) => Expr::Add(Box::new(x), Box::new(Expr::Const(-c))),
                (l, r) => Expr::Sub(Box::new(l), Box::new(r)),
            },

            Expr::Mul(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                if l == r && !matches!(l, Expr::Const(_)) {
                    return Expr::Pow(Box::new(l), 2);
                }
                match (l, r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a * b),
                    (Expr::Const(z), _) | (_, Expr::Const(z)) if z == 0.0 => Expr::Const(0.0),
                    (e, Expr::Const(one)) | (Expr::Const(one), e) if one == 1.0 => e,
                    (e, Expr::Const(m)) | (Expr::Const(m), e) if m == -1.0 => {
                        Expr::Neg(Box::new(e))
                    }
                    // x^a * x^b -> x^(a+b)
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1, e1 + e2).simplify()
                    }
                    // (-x) * (-y) -> x * y
                    (Expr::Neg(a), Expr::Neg(b)) => Expr::Mul(a, b).simplify(),
                    // c * (x + y) -> c*x + c*y for small constants
                    (Expr::Const(c), Expr::Add(x, y)) | (Expr::Add(x, y), Expr::Const(c))
                        if c.abs() < 10.0 =>
                    {
                        Expr::Add(
                            Box::new(Expr::Mul(Box::new(Expr::Const(c)), x)),
                            Box::new(Expr::Mul(Box::new(Expr::Const(c)), y)),
                        )
                        .simplify()
                    }
                    // (c1 * x) * c2 -> (c1 * c2) * x
                    (Expr::Mul(c1, x), c2 @ Expr::Const(_)) if c1.as_const().is_some() => {
                        Expr::Mul(Box::new(Expr::Mul(c1, Box::new(c2)).simplify()), x)
                    }
                    // constants to the left: x * c -> c * x
                    (x, c @ Expr::Const(_)) => Expr::Mul(Box::new(c), Box::new(x)),
                    (l, r) => Expr::Mul(Box::new(l), Box::new(r)),
                }
            }

            Expr::Div(left, right) => match (left.simplify(), right.simplify()) {
                (Expr::Const(a), Expr::Const(b)) if b != 0.0 => Expr::Const(a / b),
                (Expr::Const(z), _) if z == 0.0 => Expr::Const(0.0),
                (e, Expr::Const(one)) if one == 1.0 => e,
                (e, Expr::Const(m)) if m == -1.0 => Expr::Neg(Box::new(e)),
                (a, b) if a == b => Expr::Const(1.0),
                // x^a / x^b -> x^(a-b)
                (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                    Expr::Pow(b1, e1 - e2).simplify()
                }
                // x / c -> (1/c) * x
                (x, Expr::Const(c)) if c.abs() > 1e-300 => {
                    Expr::Mul(Box::new(Expr::Const(1.0 / c)), Box::new(x))
                }
                // (x/y)/z -> x/(y*z)
                (Expr::Div(x, y), z) => {
                    Expr::Div(x, Box::new(Expr::Mul(y, Box::new(z)).simplify()))
                }
                (l, r) => Expr::Div(Box::new(l), Box::new(r)),
            },

            Expr::Abs(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(a.abs()),
                Expr::Abs(e) => Expr::Abs(e),
                Expr::Neg(e) => Expr::Abs(e),
                // even powers are never negative
                Expr::Pow(b, n) if n % 2 == 0 => Expr::Pow(b, n),
                Expr::Exp(e) => Expr::Exp(e),
                e => Expr::Abs(Box::new(e)),
            },

            Expr::Pow(base, exp) => match (base.simplify(), *exp) {
                (_, 0) => Expr::Const(1.0),
                (Expr::Const(a), n) => Expr::Const(a.powi(n as i32)),
                (e, 1) => e,
                // x^(-n) -> 1/x^n
                (e, n) if n < 0 => Expr::Div(
                    Box::new(Expr::Const(1.0)),
                    Box::new(Expr::Pow(Box::new(e), -n)),
                ),
                // (x^a)^b -> x^(a*b)
                (Expr::Pow(inner, a), b) => Expr::Pow(inner, a * b),
                // (x*y)^n -> x^n * y^n for small n
                (Expr::Mul(x, y), n) if (2..=4).contains(&n) => {
                    Expr::Mul(Box::new(Expr::Pow(x, n)), Box::new(Expr::Pow(y, n)))
                }
                (e, n) => Expr::Pow(Box::new(e), n),
            },

            Expr::PowFloat(base, exp) => match (base.simplify(), *exp) {
                (_, c) if c.abs() < 1e-12 => Expr::Const(1.0),
                (Expr::Const(a), c) => Expr::Const(a.powf(c)),
                (e, c) if (c - 1.0).abs() < 1e-12 => e,
                (e, c) if c.fract().abs() < 1e-12 => Expr::Pow(Box::new(e), c as i64).simplify(),
                (e, c) if (c - 0.5).abs() < 1e-12 => Expr::Sqrt(Box::new(e)),
                (e, c) => Expr::PowFloat(Box::new(e), c),
            },

            Expr::PowExpr(base, exponent) => match (base.simplify(), exponent.simplify()) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(a.powf(b)),
                (e, Expr::Const(c)) => Expr::PowFloat(Box::new(e), c).simplify(),
                (b, e) => Expr::PowExpr(Box::new(b), Box::new(e)),
            },

            Expr::Exp(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(a.exp()),
                Expr::Ln(e) => *e,
                e => Expr::Exp(Box::new(e)),
            },

            Expr::Ln(inner) => match inner.simplify() {
                Expr::Const(a) if a > 0.0 => Expr::Const(a.ln()),
                Expr::Exp(e) => *e,
                e => Expr::Ln(Box::new(e)),
            },

            Expr::Sqrt(inner) => match inner.simplify() {
                Expr::Const(a) if a >= 0.0 => Expr::Const(a.sqrt()),
                Expr::Pow(x, 2) => Expr::Abs(x),
                e => Expr::Sqrt(Box::new(e)),
            },

            Expr::Sin(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(a.sin()),
                e => Expr::Sin(Box::new(e)),
            },

            Expr::Cos(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(a.cos()),
                e => Expr::Cos(Box::new(e)),
            },

            Expr::Neg(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(-a),
                Expr::Neg(e) => *e,
                // -(x - y) -> y - x
                Expr::Sub(x, y) => Expr::Sub(y, x),
                // -(c*x) -> (-c)*x
                Expr::Mul(c, x) if c.as_const().is_some() => {
                    Expr::Mul(Box::new(Expr::Neg(c).simplify()), x)
                }
                e => Expr::Neg(Box::new(e)),
            },
        }
    }

    /// Replaces every symbol found in `subs` by its mapped expression.
    ///
    /// All replacements happen simultaneously: symbols inside an inserted expression
    /// are not substituted again.
    pub fn substitute(&self, subs: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Var(name) => subs.get(name).cloned().unwrap_or_else(|| self.clone()),
            _ => self.map_children(|child| child.substitute(subs)),
        }
    }

    /// Evaluates the expression by walking the tree.
    ///
    /// This is meant for one-off evaluation, repeated evaluation should go through a
    /// compiled function from a [`SymbolicBackend`](crate::backend::SymbolicBackend).
    pub fn eval(&self, values: &HashMap<String, f64>) -> Result<f64, SystemError> {
        let ev = |e: &Expr| e.eval(values);
        Ok(match self {
            Expr::Const(value) => *value,
            Expr::Var(name) => *values
                .get(name)
                .ok_or_else(|| SystemError::VariableNotFound(name.clone()))?,
            Expr::Add(l, r) => ev(l)? + ev(r)?,
            Expr::Sub(l, r) => ev(l)? - ev(r)?,
            Expr::Mul(l, r) => ev(l)? * ev(r)?,
            Expr::Div(l, r) => ev(l)? / ev(r)?,
            Expr::Abs(e) => ev(e)?.abs(),
            Expr::Pow(e, n) => ev(e)?.powi(*n as i32),
            Expr::PowFloat(e, c) => ev(e)?.powf(*c),
            Expr::PowExpr(b, e) => ev(b)?.powf(ev(e)?),
            Expr::Exp(e) => ev(e)?.exp(),
            Expr::Ln(e) => ev(e)?.ln(),
            Expr::Sqrt(e) => ev(e)?.sqrt(),
            Expr::Sin(e) => ev(e)?.sin(),
            Expr::Cos(e) => ev(e)?.cos(),
            Expr::Neg(e) => -ev(e)?,
        })
    }

    /// Converts the tree into a linear stack program.
    ///
    /// `layout` maps every symbol to its slot in the input buffer. A symbol missing
    /// from the layout is reported as [`ConvertError::VariableNotFound`].
    pub fn flatten(&self, layout: &HashMap<String, u32>) -> Result<FlattenedExpr, ConvertError> {
        if let Some(constant) = self.try_evaluate_constant() {
            return Ok(FlattenedExpr {
                ops: vec![LinearOp::LoadConst(constant)],
                max_var_index: None,
                constant_result: Some(constant),
            });
        }

        let mut ops = Vec::new();
        let mut max_var_index = None;
        self.flatten_recursive(layout, &mut ops, &mut max_var_index)?;

        Ok(FlattenedExpr {
            ops,
            max_var_index,
            constant_result: None,
        })
    }

    /// Folds the whole tree to a constant when it references no symbol.
    fn try_evaluate_constant(&self) -> Option<f64> {
        if !self.free_symbols().is_empty() {
            return None;
        }
        self.eval(&HashMap::new()).ok().filter(|v| v.is_finite())
    }

    fn flatten_recursive(
        &self,
        layout: &HashMap<String, u32>,
        ops: &mut Vec<LinearOp>,
        max_var_index: &mut Option<u32>,
    ) -> Result<(), ConvertError> {
        let op = match self {
            Expr::Const(value) => LinearOp::LoadConst(*value),
            Expr::Var(name) => {
                let index = *layout
                    .get(name)
                    .ok_or_else(|| ConvertError::VariableNotFound(name.clone()))?;
                *max_var_index = Some(max_var_index.map_or(index, |m| m.max(index)));
                LinearOp::LoadVar(index)
            }
            Expr::Add(..) => LinearOp::Add,
            Expr::Sub(..) => LinearOp::Sub,
            Expr::Mul(..) => LinearOp::Mul,
            Expr::Div(..) => LinearOp::Div,
            Expr::PowExpr(..) => LinearOp::PowExpr,
            Expr::Abs(_) => LinearOp::Abs,
            Expr::Neg(_) => LinearOp::Neg,
            Expr::Pow(_, n) => LinearOp::PowConst(*n),
            Expr::PowFloat(_, c) => LinearOp::PowFloat(*c),
            Expr::Exp(_) => LinearOp::Exp,
            Expr::Ln(_) => LinearOp::Ln,
            Expr::Sqrt(_) => LinearOp::Sqrt,
            Expr::Sin(_) => LinearOp::Sin,
            Expr::Cos(_) => LinearOp::Cos,
        };
        // post-order: operands first
        for child in self.children() {
            child.flatten_recursive(layout, ops, max_var_index)?;
        }
        ops.push(op);
        Ok(())
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Var(name.to_string())
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl ops::$trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(self), Box::new(rhs))
            }
        }

        impl ops::$trait<&Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::$variant(Box::new(self), Box::new(rhs.clone()))
            }
        }

        impl ops::$trait<Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(self.clone()), Box::new(rhs))
            }
        }

        impl ops::$trait<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::$variant(Box::new(self.clone()), Box::new(rhs.clone()))
            }
        }

        impl ops::$trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::$variant(Box::new(self), Box::new(Expr::Const(rhs)))
            }
        }

        impl ops::$trait<f64> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::$variant(Box::new(self.clone()), Box::new(Expr::Const(rhs)))
            }
        }

        impl ops::$trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(Expr::Const(self)), Box::new(rhs))
            }
        }

        impl ops::$trait<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::$variant(Box::new(Expr::Const(self)), Box::new(rhs.clone()))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Sub);
impl_binary_op!(Mul, mul, Mul);
impl_binary_op!(Div, div, Div);

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl ops::Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self.clone()))
    }
}

/// Formats expressions in standard mathematical notation with explicit parentheses.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Add(left, right) => write!(f, "({left} + {right})"),
            Expr::Mul(left, right) => write!(f, "({left} * {right})"),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Abs(expr) => write!(f, "|{expr}|"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowExpr(base, exponent) => write!(f, "({base}^{exponent})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Sin(expr) => write!(f, "sin({expr})"),
            Expr::Cos(expr) => write!(f, "cos({expr})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::var(name)
    }

    fn c(value: f64) -> Expr {
        Expr::Const(value)
    }

    #[test]
    fn test_simplify() {
        // 2 + 3 → 5
        assert_eq!((c(2.0) + c(3.0)).simplify(), c(5.0));
        // x + 0 → x
        assert_eq!((var("x") + 0.0).simplify(), var("x"));
        // x * 1 → x
        assert_eq!((var("x") * 1.0).simplify(), var("x"));
        // x * 0 → 0
        assert_eq!((var("x") * 0.0).simplify(), c(0.0));
        // x / 1 → x
        assert_eq!((var("x") / 1.0).simplify(), var("x"));
        // x / x → 1
        assert_eq!((var("x") / var("x")).simplify(), c(1.0));
        // x^0 → 1, x^1 → x
        assert_eq!(var("x").powi(0).simplify(), c(1.0));
        assert_eq!(var("x").powi(1).simplify(), var("x"));
        // |-3| → 3, ||x|| → |x|
        assert_eq!(c(-3.0).abs().simplify(), c(3.0));
        assert_eq!(var("x").abs().abs().simplify(), var("x").abs());
        // x - x → 0
        assert_eq!((var("x") - var("x")).simplify(), c(0.0));
    }

    #[test]
    fn test_simplify_keeps_domain_sensitive_forms() {
        // ln(x*y) must stay intact, splitting it is wrong for x, y < 0
        let expr = (var("x") * var("y")).ln();
        assert_eq!(expr.simplify(), expr);
        let expr = (var("x") * var("y")).sqrt();
        assert_eq!(expr.simplify(), expr);
    }

    #[test]
    fn test_simplify_inverse_pairs() {
        assert_eq!(var("u").exp().ln().simplify(), var("u"));
        assert_eq!(var("u").ln().exp().simplify(), var("u"));
        assert_eq!(c(0.0).exp().simplify(), c(1.0));
        assert_eq!(c(1.0).ln().simplify(), c(0.0));
    }

    #[test]
    fn test_substitute() {
        // x + y with x := 2*z
        let expr = var("x") + var("y");
        let subs = HashMap::from([("x".to_string(), 2.0 * var("z"))]);
        assert_eq!(expr.substitute(&subs), (2.0 * var("z")) + var("y"));
    }

    #[test]
    fn test_substitute_is_simultaneous() {
        // swapping x and y must not chain
        let expr = var("x") - var("y");
        let subs = HashMap::from([("x".to_string(), var("y")), ("y".to_string(), var("x"))]);
        assert_eq!(expr.substitute(&subs), var("y") - var("x"));
    }

    #[test]
    fn test_derivative() {
        assert_eq!(c(5.0).derivative("x"), c(0.0));
        assert_eq!(var("x").derivative("x"), c(1.0));
        assert_eq!(var("y").derivative("x"), c(0.0));

        // (x + y)' = 1 + 0
        assert_eq!((var("x") + var("y")).derivative("x"), c(1.0) + c(0.0));

        // (x*y)' = x*0 + y*1 → y
        let product = var("x") * var("y");
        assert_eq!(
            product.derivative("x"),
            (var("x") * c(0.0)) + (var("y") * c(1.0))
        );
        assert_eq!(product.derivative("x").simplify(), var("y"));

        // (x^3)' = 3 * x^2 * 1
        assert_eq!(
            var("x").powi(3).derivative("x"),
            (c(3.0) * var("x").powi(2)) * c(1.0)
        );
    }

    #[test]
    fn test_derivative_matches_finite_difference() -> Result<(), Box<dyn std::error::Error>> {
        let expr = (var("x") * var("x").sin() + var("x").exp() / (var("x") + 2.0)).sqrt();
        let derivative = expr.derivative("x").simplify();
        let at = |x: f64| HashMap::from([("x".to_string(), x)]);
        let h = 1e-6;
        let numeric = (expr.eval(&at(1.3 + h))? - expr.eval(&at(1.3 - h))?) / (2.0 * h);
        let symbolic = derivative.eval(&at(1.3))?;
        assert!((numeric - symbolic).abs() < 1e-7);
        Ok(())
    }

    #[test]
    fn test_complex_simplifications() {
        // (x + 0) * (y + 0) → x * y
        let expr = (var("x") + 0.0) * (var("y") + 0.0);
        assert_eq!(expr.simplify(), var("x") * var("y"));

        // -(-x) → x
        assert_eq!((-(-var("x"))).simplify(), var("x"));

        // (1 * x) * (y * 1) → x * y
        let expr = (1.0 * var("x")) * (var("y") * 1.0);
        assert_eq!(expr.simplify(), var("x") * var("y"));

        // (x/y)/(x/y) → 1
        let div = var("x") / var("y");
        assert_eq!((&div / &div).simplify(), c(1.0));
    }

    #[test]
    fn test_special_functions() {
        // sqrt(x^2) → |x|
        assert_eq!(var("x").powi(2).sqrt().simplify(), var("x").abs());
        // x^0.5 → sqrt(x)
        assert_eq!(var("x").powf(0.5).simplify(), var("x").sqrt());
        // x^2.0 → x^2
        assert_eq!(var("x").powf(2.0).simplify(), var("x").powi(2));
    }

    #[test]
    fn test_free_symbols() {
        let expr = var("k") * var("y_0") - (var("x") + 1.0).exp() / var("k");
        let symbols: Vec<_> = expr.free_symbols().into_iter().collect();
        assert_eq!(symbols, vec!["k", "x", "y_0"]);
        assert!(expr.contains_var("x"));
        assert!(!expr.contains_var("y_1"));
    }

    #[test]
    fn test_eval_missing_symbol() {
        let err = var("q").eval(&HashMap::new()).unwrap_err();
        assert!(matches!(err, SystemError::VariableNotFound(name) if name == "q"));
    }

    #[test]
    fn test_flatten() -> Result<(), Box<dyn std::error::Error>> {
        let layout = HashMap::from([("x".to_string(), 0), ("y".to_string(), 2)]);
        let flat = (var("x") * var("y") + 1.0).flatten(&layout)?;
        assert_eq!(
            flat.ops,
            vec![
                LinearOp::LoadVar(0),
                LinearOp::LoadVar(2),
                LinearOp::Mul,
                LinearOp::LoadConst(1.0),
                LinearOp::Add,
            ]
        );
        assert_eq!(flat.max_var_index, Some(2));

        let constant = (c(2.0) * c(4.0)).flatten(&layout)?;
        assert_eq!(constant.constant_result, Some(8.0));

        let missing = var("z").flatten(&layout);
        assert!(matches!(missing, Err(ConvertError::VariableNotFound(_))));
        Ok(())
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", c(5.0)), "5");
        assert_eq!(format!("{}", var("x")), "x");
        assert_eq!(format!("{}", var("x") + var("y")), "(x + y)");
        assert_eq!(format!("{}", var("x").exp()), "exp(x)");
        assert_eq!(format!("{}", var("x").abs()), "|x|");
        let complex = (var("x").powi(2) + var("y")) / var("z");
        assert_eq!(format!("{complex}"), "(((x^2) + y) / z)");
    }
}
