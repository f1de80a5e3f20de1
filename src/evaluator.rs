//! Direct tree-walking evaluation.
//!
//! The evaluator resolves names on every call, so it suits one-off evaluations and serves as
//! the reference the compiled backends are checked against. Only the ternary operator is
//! lazy; `&&`, `||` and `^^` evaluate both operands.

use tracing::trace;

use crate::domain::NumericDomain;
use crate::errors::Result;
use crate::expr::{Expr, Node, UnaryOp};
use crate::resolve::{Binding, Resolution};
use crate::types::Tolerance;

/// Evaluates expression trees against a resolution.
#[derive(Debug, Clone)]
pub struct Evaluator<D: NumericDomain> {
    resolution: Resolution<D>,
    tolerance: Tolerance,
}

impl<D: NumericDomain> Default for Evaluator<D> {
    fn default() -> Self {
        Self::new(Resolution::standard())
    }
}

impl<D: NumericDomain> Evaluator<D> {
    pub fn new(resolution: Resolution<D>) -> Self {
        Self {
            resolution,
            tolerance: Tolerance::default(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    pub fn resolution(&self) -> &Resolution<D> {
        &self.resolution
    }

    pub fn resolution_mut(&mut self) -> &mut Resolution<D> {
        &mut self.resolution
    }

    pub fn evaluate(&self, node: &Node) -> Result<D::Value> {
        let value = match node.expr() {
            Expr::Constant(value) => D::from_real(*value),
            Expr::Variable(variable) => self.resolution.resolve_variable(variable)?.value(),
            Expr::Property(property) => self.resolution.resolve_property(property)?.value(),
            Expr::Unary(op, operand) => {
                let value = self.evaluate(operand)?;
                match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Minus => D::neg(value),
                    UnaryOp::Not => D::boolean(!D::truthy(value)),
                }
            }
            Expr::Binary(op, left, right) => {
                let a = self.evaluate(left)?;
                let b = self.evaluate(right)?;
                D::binary(*op, a, b, &self.tolerance)
            }
            Expr::Ternary(condition, if_true, if_false) => {
                if D::truthy(self.evaluate(condition)?) {
                    self.evaluate(if_true)?
                } else {
                    self.evaluate(if_false)?
                }
            }
            Expr::Function(call) => {
                let args = call
                    .args()
                    .iter()
                    .map(|arg| self.evaluate(arg))
                    .collect::<Result<Vec<_>>>()?;
                match self.resolution.resolve_function(call)? {
                    Binding::Builtin(builtin) => D::apply(builtin, &args),
                    Binding::External(function) => function(&args),
                }
            }
        };
        trace!(node = %node, value = ?value, "evaluated");
        Ok(value)
    }
}

/// Evaluates `node` with the standard resolution.
pub fn evaluate<D: NumericDomain>(node: &Node) -> Result<D::Value> {
    Evaluator::<D>::default().evaluate(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComplexDomain, RealDomain};
    use crate::errors::ExpressionError;
    use crate::expr::VariableNode;
    use crate::resolve::VariableTable;
    use num_complex::Complex64;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_arithmetic() {
        let expr = Node::constant(1.0) + Node::constant(5.0) * 5.0;
        assert_eq!(evaluate::<RealDomain>(&expr).unwrap(), 26.0);
        let expr = Node::pow(Node::constant(2.0), Node::constant(3.0));
        assert_eq!(evaluate::<RealDomain>(&expr).unwrap(), 8.0);
    }

    #[test]
    fn test_ternary_is_lazy() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut evaluator = Evaluator::<RealDomain>::default();
        evaluator.resolution_mut().push_function(move |call: &crate::expr::FunctionNode| {
            (call.name() == "tick").then(|| {
                let counter = counter.clone();
                Rc::new(move |_: &[f64]| {
                    counter.set(counter.get() + 1);
                    1.0
                }) as crate::types::ExternalFunction<f64>
            })
        });

        let tick = Node::function("tick", vec![]);
        let expr = Node::ternary(Node::one(), Node::constant(3.0), tick.clone());
        assert_eq!(evaluator.evaluate(&expr).unwrap(), 3.0);
        assert_eq!(calls.get(), 0);

        // Logical operators evaluate both sides.
        let expr = Node::or(Node::one(), tick);
        assert_eq!(evaluator.evaluate(&expr).unwrap(), 1.0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_live_variables() {
        let mut table = VariableTable::<f64>::default();
        let x = table.define(&VariableNode::voltage("in"), 2.0);
        let mut evaluator = Evaluator::<RealDomain>::default();
        evaluator.resolution_mut().push_variable(table);

        let expr = Node::voltage("IN") * 3.0;
        assert_eq!(evaluator.evaluate(&expr).unwrap(), 6.0);
        x.set(4.0);
        assert_eq!(evaluator.evaluate(&expr).unwrap(), 12.0);
    }

    #[test]
    fn test_unknown_names() {
        let evaluator = Evaluator::<RealDomain>::default();
        assert!(matches!(
            evaluator.evaluate(&Node::named("missing")),
            Err(ExpressionError::UnrecognizedVariable { .. })
        ));
        assert!(matches!(
            evaluator.evaluate(&Node::function("missing", vec![])),
            Err(ExpressionError::UnrecognizedFunction(_))
        ));
    }

    #[test]
    fn test_complex_evaluation() {
        let expr = Node::function("sqrt", vec![Node::constant(-4.0)]);
        let value = evaluate::<ComplexDomain>(&expr).unwrap();
        assert!((value - Complex64::new(0.0, 2.0)).norm() < 1e-12);
    }
}
