//! Conversion of textual right-hand sides into expression trees.
//!
//! Strings are parsed with the [evalexpr](https://github.com/ISibboI/evalexpr) crate and
//! the resulting operator tree is mapped onto [`Expr`]. Identifiers are resolved through
//! a caller-supplied function, so that user-facing names such as `"Po-210"` or `"k1"`
//! can be bound to the canonical symbols of a system.
//!
//! Supported syntax:
//! * Basic arithmetic: +, -, *, /, unary minus
//! * Exponentiation `a ^ b`, with integer, float or expression exponents
//! * Functions: abs, ln (alias log), sqrt, exp, sin, cos

use evalexpr::{build_operator_tree, DefaultNumericTypes, Node, Operator, Value};

use crate::{
    errors::{ConvertError, SystemError},
    expr::Expr,
};

/// Parses `text` and resolves its identifiers with `resolve`.
///
/// # Examples
///
/// ```rust
/// use symode::convert::parse;
/// use symode::expr::Expr;
///
/// let expr = parse("k * y", &|name| Some(Expr::var(name))).unwrap();
/// assert_eq!(expr, Expr::var("k") * Expr::var("y"));
/// ```
pub fn parse<F>(text: &str, resolve: &F) -> Result<Expr, SystemError>
where
    F: Fn(&str) -> Option<Expr>,
{
    let node = build_operator_tree::<DefaultNumericTypes>(text)?;
    Ok(build_ast(&node, resolve)?)
}

fn single_child<'a>(node: &'a Node, what: &str) -> Result<&'a Node, ConvertError> {
    match &node.children()[..] {
        [child] => Ok(child),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{what} expects one argument, got {}",
            children.len()
        ))),
    }
}

fn binary<'a>(node: &'a Node, what: &str) -> Result<(&'a Node, &'a Node), ConvertError> {
    match &node.children()[..] {
        [left, right] => Ok((left, right)),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{what} expects two operands, got {}",
            children.len()
        ))),
    }
}

/// Converts an evalexpr AST node into an expression tree.
pub fn build_ast<F>(node: &Node, resolve: &F) -> Result<Expr, ConvertError>
where
    F: Fn(&str) -> Option<Expr>,
{
    let convert = |child: &Node| build_ast(child, resolve);

    match node.operator() {
        // n-ary in evalexpr, folded left to right
        Operator::Add | Operator::Mul => {
            let mut children = node.children().iter();
            let first = children
                .next()
                .ok_or_else(|| ConvertError::UnsupportedOperator("empty operand list".into()))?;
            let is_add = matches!(node.operator(), Operator::Add);
            children.try_fold(convert(first)?, |acc, child| -> Result<Expr, ConvertError> {
                let rhs = convert(child)?;
                Ok(if is_add { acc + rhs } else { acc * rhs })
            })
        }
        Operator::Sub => {
            let (l, r) = binary(node, "subtraction")?;
            Ok(convert(l)? - convert(r)?)
        }
        Operator::Div => {
            let (l, r) = binary(node, "division")?;
            Ok(convert(l)? / convert(r)?)
        }
        Operator::Neg => Ok(-convert(single_child(node, "negation")?)?),
        Operator::Const { value } => match value {
            Value::Float(f) => Ok(Expr::Const(*f)),
            Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => resolve(identifier.as_str())
            .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string())),
        Operator::FunctionIdentifier { identifier } => {
            let arg = convert(single_child(node, identifier)?)?;
            match identifier.as_str() {
                "abs" => Ok(arg.abs()),
                "ln" | "log" => Ok(arg.ln()),
                "sqrt" => Ok(arg.sqrt()),
                "exp" => Ok(arg.exp()),
                "sin" => Ok(arg.sin()),
                "cos" => Ok(arg.cos()),
                other => Err(ConvertError::UnsupportedFunction(other.to_string())),
            }
        }
        Operator::RootNode => match &node.children()[..] {
            [child] => convert(child),
            children => Err(ConvertError::RootNode(format!(
                "{} children",
                children.len()
            ))),
        },
        // a ^ b
        Operator::Exp => {
            let (base, exponent) = binary(node, "exponentiation")?;
            let base = convert(base)?;
            match exponent.operator() {
                Operator::Const {
                    value: Value::Int(n),
                } => Ok(base.powi(*n)),
                Operator::Const {
                    value: Value::Float(f),
                } => Ok(base.powf(*f)),
                Operator::Const { value } => Err(ConvertError::ExpOperator(format!("{value:?}"))),
                _ => Ok(base.pow(convert(exponent)?)),
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}
