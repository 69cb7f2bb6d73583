#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Evaluation failures raised while computing expression values.
///
/// Each variant maps onto a standard error code so callers can match on
/// failures without parsing messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Operands of an operator or comparison have incompatible types.
    #[error("type mismatch in {context}: {detail}")]
    TypeMismatch {
        context: &'static str,
        detail: String,
    },
    /// A singleton was required but the sequence held more items.
    #[error("{context} expects at most one item (got {len})")]
    NotSingleton { context: &'static str, len: usize },
    /// Integer or decimal division by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Integer arithmetic left the 64-bit range.
    #[error("integer overflow in {context}")]
    Overflow { context: &'static str },
    /// Effective boolean value is undefined for the operand.
    #[error("effective boolean value undefined for {detail}")]
    InvalidBooleanValue { detail: String },
    /// Function name and arity do not resolve in the registry.
    #[error("unknown function {name}#{arity}")]
    UnknownFunction { name: String, arity: usize },
    /// A variable reference has no binding in scope.
    #[error("undefined variable ${name}")]
    UndefinedVariable { name: String },
    /// A function rejected its arguments.
    #[error("{function}: {reason}")]
    InvalidArgument {
        function: &'static str,
        reason: String,
    },
}

impl EvalError {
    /// Builds an [`EvalError::TypeMismatch`] for a specific context.
    pub fn type_mismatch(context: &'static str, detail: impl Into<String>) -> Self {
        EvalError::TypeMismatch {
            context,
            detail: detail.into(),
        }
    }

    /// Builds an [`EvalError::InvalidArgument`] for a builtin.
    pub fn invalid_argument(function: &'static str, reason: impl Into<String>) -> Self {
        EvalError::InvalidArgument {
            function,
            reason: reason.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            EvalError::TypeMismatch { .. } => "XPTY0004",
            EvalError::NotSingleton { .. } => "XPTY0004",
            EvalError::DivisionByZero => "FOAR0001",
            EvalError::Overflow { .. } => "FOAR0002",
            EvalError::InvalidBooleanValue { .. } => "FORG0006",
            EvalError::UnknownFunction { .. } => "XPST0017",
            EvalError::UndefinedVariable { .. } => "XPST0008",
            EvalError::InvalidArgument { .. } => "FORG0006",
        }
    }
}

/// Convenience wrapper that formats evaluation errors with their codes.
pub struct EvalErrorWithCode<'a>(pub &'a EvalError);

impl fmt::Display for EvalErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SylvaError;

    #[test]
    fn codes_survive_conversion_into_crate_error() {
        let err: SylvaError = EvalError::DivisionByZero.into();
        assert_eq!(err.to_string(), "[FOAR0001] division by zero");
        let wrapped = EvalError::UnknownFunction {
            name: "nope".into(),
            arity: 2,
        };
        assert_eq!(
            EvalErrorWithCode(&wrapped).to_string(),
            "[XPST0017] unknown function nope#2"
        );
    }
}
