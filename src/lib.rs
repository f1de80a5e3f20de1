//! Behavioral expression core for circuit simulation.
//!
//! This crate turns SPICE-style behavioral expressions into immutable trees, differentiates
//! them symbolically with respect to circuit unknowns, and compiles the results into fast,
//! repeatedly callable functions. It builds on top of the [evalexpr](https://github.com/ISibboI/evalexpr)
//! crate for parsing and uses [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! for native compilation.
//!
//! # Features
//!
//! - Sparse symbolic differentiation with a pluggable rule registry
//! - A tree-walking evaluator and a compiler with stack and native backends
//! - Real and complex numeric domains
//! - Ordered, first-match-wins function and variable resolution
//!
//! # Example
//!
//! ```rust
//! use spice_expr::prelude::*;
//!
//! let mut variables = VariableTable::<f64>::default();
//! let vin = variables.define(&VariableNode::voltage("in"), 2.0);
//!
//! let mut compiler = Compiler::<RealDomain>::default();
//! compiler.resolution_mut().push_variable(variables);
//!
//! let expr = parse("V(in)^2 + 3*V(in)").unwrap();
//! let f = compiler.compile(&expr).unwrap();
//! assert_eq!(f.invoke(), 10.0);
//!
//! // The value is read on every invocation.
//! vin.set(1.0);
//! assert_eq!(f.invoke(), 4.0);
//!
//! // d/dV(in) = 2*V(in) + 3
//! let derivatives = derive(&expr, &[VariableNode::voltage("in")]).unwrap().unwrap();
//! let df = compiler.compile(derivatives.get(&VariableNode::voltage("in")).unwrap()).unwrap();
//! assert_eq!(df.invoke(), 5.0);
//! ```

pub mod prelude {
    pub use crate::compiler::Compiler;
    pub use crate::convert::parse;
    pub use crate::derivative::{derive, Deriver, Derivatives};
    pub use crate::domain::{CompilerOptions, ComplexDomain, NumericDomain, RealDomain};
    pub use crate::evaluator::Evaluator;
    pub use crate::expr::{Node, VariableNode};
    pub use crate::program::CompiledFunction;
    pub use crate::resolve::{FunctionTable, Resolution, VariableTable};
}

/// Native code generation using Cranelift
pub mod builder;
/// Expression compiler and emitter
pub mod compiler;
/// Conversion from parsed expressions to expression trees
pub mod convert;
/// Sparse symbolic differentiation
pub mod derivative;
/// Real and complex numeric domains
pub mod domain;
/// Error types for the various failure modes
pub mod errors;
/// Tree-walking evaluation
pub mod evaluator;
/// Expression tree representation
pub mod expr;
/// Built-in functions and their numeric primitives
pub mod functions;
/// Name comparison policies
pub mod names;
/// Constant folding
pub mod opt;
/// Instruction streams and compiled functions
pub mod program;
/// Function and variable resolution
pub mod resolve;
/// Per-function derivative rules
pub mod rules;
/// Shared value types
pub mod types;
/// Runtime functions called from native code
pub(crate) mod operators {
    pub(crate) mod link;
    pub(crate) mod runtime;
}
