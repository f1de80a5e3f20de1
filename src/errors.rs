//! Error types for the spice-expr crate.
//!
//! This module defines the failure modes of expression conversion, differentiation,
//! evaluation and compilation. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from an evalexpr tree to a [`Node`](crate::expr::Node)
//! - `BuilderError`: Errors during native code generation with Cranelift
//! - `ExpressionError`: Errors raised by the evaluator, the compiler and the derivative rules
//!
//! Resolution failures are raised eagerly: the compiler and the differentiation engine report
//! them while building, never at invocation time. Only the interpreter reports them during
//! evaluation, since it has no separate build phase.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

use crate::expr::VariableKind;

/// Errors that can occur while converting an evalexpr operator tree into a [`Node`](crate::expr::Node).
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The source text could not be parsed by evalexpr
    #[error("failed to parse expression: {0}")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// An operator without a counterpart in the expression language
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// A constant that is not numeric or boolean
    #[error("expected numeric constant: {0}")]
    ConstOperator(String),
    /// A root node that does not have exactly one child
    #[error("expected single child for root node, found {0}")]
    RootNode(usize),
    /// `V(...)` or `I(...)` applied to something other than a single name
    #[error("{0}(...) expects a single node or branch name")]
    QuantityArgument(String),
}

/// Errors that can occur during native compilation of a program.
///
/// This enum represents the failure modes of lowering the instruction stream into
/// machine code with Cranelift.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(Box<ModuleError>),
    /// Error when configuring the code generator
    #[error("settings error: {0}")]
    SettingsError(String),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// Errors raised while differentiating, evaluating or compiling an expression.
#[derive(Debug, Error)]
pub enum ExpressionError {
    /// No function resolver claimed the function name
    #[error("unrecognized function: {0}")]
    UnrecognizedFunction(String),
    /// No variable resolver claimed the variable
    #[error("unrecognized {kind} variable: {name}")]
    UnrecognizedVariable { kind: VariableKind, name: String },
    /// No variable resolver claimed the property request
    #[error("unrecognized property: @{entity}[{property}]")]
    UnrecognizedProperty { entity: String, property: String },
    /// A built-in function was called with the wrong number of arguments
    #[error("{name}: expected {expected} argument(s), got {actual}")]
    ArgumentCountMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// Malformed internal state, e.g. an unbalanced instruction stream
    #[error("invalid operator: {0}")]
    InvalidOperator(String),
    /// Native code generation failed
    #[error("failed to build native function")]
    Build(#[from] BuilderError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExpressionError>;
