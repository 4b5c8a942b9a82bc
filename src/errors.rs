//! Error types for the symode crate.
//!
//! This module defines the error types raised while parsing expressions, compiling them
//! and building or integrating ODE systems. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from the evalexpr AST to `Expr`
//! - `BuilderError`: Errors during JIT compilation with Cranelift
//! - `SystemError`: Errors raised by systems, wrappers and the integration drivers
//!
//! Construction errors (`DimensionMismatch`, `ConfigurationError`,
//! `CyclicSubstitutionError`) are always fatal. Runtime failures of a single problem
//! instance (`TransformDomainError`, `Integration`) are retryable, see
//! [`SystemError::is_retryable`].

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from evalexpr AST to our expression tree.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The exponent of a power could not be converted
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// An operator that has no counterpart in `Expr`
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// A function that has no counterpart in `Expr`
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// The root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// A constant that is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// An identifier that does not resolve to a known symbol
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
}

/// Errors that can occur during JIT compilation of expressions.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// The host architecture is not supported by Cranelift
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(#[from] CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(#[from] ModuleError),
    /// Error when configuring Cranelift settings
    #[error("invalid setting: {0}")]
    SettingError(String),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or an imported libcall
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// Errors raised while building, transforming, reducing or integrating ODE systems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A length disagrees with the declared dimensionality
    #[error("Dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// Invalid naming, substitution keys or options
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    /// A transform produced a non-finite value
    #[error("Transform undefined at {value} ({context})")]
    TransformDomainError { value: f64, context: String },
    /// Substitutions of a partially solved system reference each other in a cycle
    #[error("Cyclic substitution: {}", .0.join(" -> "))]
    CyclicSubstitutionError(Vec<String>),
    /// The numeric integrator reported a failure
    #[error("Integration failed at x = {x}: {message}")]
    Integration { message: String, x: f64 },
    /// Error when parsing an expression string with evalexpr
    #[error("Failed to build Evalexpr AST")]
    BuildEvalexprError(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting the evalexpr AST into an expression tree
    #[error("Failed to build expression")]
    Convert(#[from] ConvertError),
    /// Error when compiling expressions with the JIT backend
    #[error("Failed to build JIT function")]
    Builder(#[from] BuilderError),
    /// Error when a symbol cannot be evaluated because it has no value
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
}

impl SystemError {
    /// Whether the chained driver may move on to another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SystemError::TransformDomainError { .. } | SystemError::Integration { .. }
        )
    }

    pub(crate) fn dimension(what: &'static str, expected: usize, got: usize) -> Self {
        SystemError::DimensionMismatch {
            what,
            expected,
            got,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        SystemError::ConfigurationError(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        let domain = SystemError::TransformDomainError {
            value: 0.0,
            context: "ln".into(),
        };
        let failure = SystemError::Integration {
            message: "step budget exceeded".into(),
            x: 0.5,
        };
        assert!(domain.is_retryable());
        assert!(failure.is_retryable());
        assert!(!SystemError::dimension("rhs", 3, 2).is_retryable());
        assert!(!SystemError::config("duplicate name").is_retryable());
        assert!(!SystemError::CyclicSubstitutionError(vec!["a".into()]).is_retryable());
    }

    #[test]
    fn test_messages() {
        let err = SystemError::CyclicSubstitutionError(vec!["y_0".into(), "y_1".into(), "y_0".into()]);
        assert_eq!(err.to_string(), "Cyclic substitution: y_0 -> y_1 -> y_0");
        let err = SystemError::dimension("callback output", 3, 2);
        assert_eq!(
            err.to_string(),
            "Dimension mismatch in callback output: expected 3, got 2"
        );
    }
}
