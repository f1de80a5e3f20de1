//! Resolution order, name policies, properties and resolver call counts as seen through the
//! evaluator and the compiler.

use std::cell::Cell;
use std::rc::Rc;

use num_complex::Complex64;
use spice_expr::compiler::Emitter;
use spice_expr::errors::{ExpressionError, Result};
use spice_expr::expr::{BinaryOp, FunctionNode, PropertyNode, Quantity, VariableNode};
use spice_expr::names::NameComparison;
use spice_expr::prelude::*;
use spice_expr::program::Instr;
use spice_expr::resolve::{Binding, FunctionResolver, VariableResolver};
use spice_expr::types::{ExternalFunction, VariableSource};

fn both(resolution: Resolution<RealDomain>, node: &Node) -> Result<(f64, f64)> {
    let evaluated = Evaluator::new(resolution.clone()).evaluate(node)?;
    let compiled = Compiler::new(resolution).compile(node)?.invoke();
    Ok((evaluated, compiled))
}

#[test]
fn test_prepended_functions_shadow_builtins() {
    let node = Node::function("sin", vec![Node::constant(1.0)]);

    let mut resolution = Resolution::<RealDomain>::standard();
    let (evaluated, compiled) = both(resolution.clone(), &node).unwrap();
    assert_eq!(evaluated, 1f64.sin());
    assert_eq!(compiled, 1f64.sin());

    let mut overrides = FunctionTable::<f64>::default();
    overrides.define("SIN", |args| args[0] + 41.0);
    resolution.prepend_function(overrides.clone());
    assert_eq!(both(resolution, &node).unwrap(), (42.0, 42.0));

    // Appended after the built-ins, the same table is never consulted for `sin`.
    let resolution = Resolution::<RealDomain>::standard().with_function(overrides);
    assert_eq!(both(resolution, &node).unwrap().1, 1f64.sin());
}

#[test]
fn test_arity_errors_are_raised_by_compile() {
    let mut functions = FunctionTable::<f64>::default();
    functions.define_fixed("twice", 1, |args| 2.0 * args[0]);
    let compiler = Compiler::new(Resolution::<RealDomain>::standard().with_function(functions));

    let node = Node::function("sqrt", vec![Node::one(), Node::one()]);
    assert!(matches!(
        compiler.compile(&node),
        Err(ExpressionError::ArgumentCountMismatch { expected: 1, actual: 2, .. })
    ));

    // The bad call is buried in a branch that would never be taken.
    let node = Node::ternary(
        Node::one(),
        Node::constant(3.0),
        Node::function("twice", vec![Node::one(), Node::one()]),
    );
    assert!(matches!(
        compiler.compile(&node),
        Err(ExpressionError::ArgumentCountMismatch { name, .. }) if name == "twice"
    ));
    assert_eq!(
        compiler
            .compile(&Node::function("twice", vec![Node::constant(4.0)]))
            .unwrap()
            .invoke(),
        8.0
    );
}

/// Branch currents of a tiny circuit, reachable only through `@entity[property]`.
struct DeviceCurrents {
    r1: VariableSource<f64>,
}

impl VariableResolver<RealDomain> for DeviceCurrents {
    fn resolve(&self, _variable: &VariableNode) -> Option<VariableSource<f64>> {
        None
    }

    fn resolve_property(&self, property: &PropertyNode) -> Option<VariableSource<f64>> {
        let matches = property.entity().eq_ignore_ascii_case("r1")
            && property.property().eq_ignore_ascii_case("i")
            && property.quantity() == Quantity::Value;
        matches.then(|| self.r1.clone())
    }
}

#[test]
fn test_properties() {
    let r1 = VariableSource::new(0.25);
    let resolution = Resolution::<RealDomain>::standard().with_variable(DeviceCurrents {
        r1: r1.clone(),
    });

    let node = Node::property("R1", "i", Quantity::Value) * 4.0;
    let f = Compiler::new(resolution.clone()).compile(&node).unwrap();
    assert_eq!(f.invoke(), 1.0);
    r1.set(2.0);
    assert_eq!(f.invoke(), 8.0);
    assert_eq!(Evaluator::new(resolution.clone()).evaluate(&node).unwrap(), 8.0);

    let missing = Node::property("R2", "i", Quantity::Value);
    assert!(matches!(
        Compiler::new(resolution.clone()).compile(&missing),
        Err(ExpressionError::UnrecognizedProperty { entity, .. }) if entity == "R2"
    ));

    // A property is not a plain variable, even with a matching name.
    assert!(matches!(
        both(resolution, &Node::named("R1")),
        Err(ExpressionError::UnrecognizedVariable { .. })
    ));
}

#[test]
fn test_name_comparison() {
    let upper = Node::function("SIN", vec![Node::named("PI")]);
    let lower = Node::function("sin", vec![Node::named("pi")]);

    let (value, _) = both(Resolution::standard(), &upper).unwrap();
    assert!(value.abs() < 1e-12);

    let ordinal = Resolution::<RealDomain>::standard_with(NameComparison::Ordinal);
    assert!(both(ordinal.clone(), &lower).is_ok());
    assert!(matches!(
        both(ordinal.clone(), &Node::function("SIN", vec![Node::named("pi")])),
        Err(ExpressionError::UnrecognizedFunction(name)) if name == "SIN"
    ));
    assert!(matches!(
        both(ordinal, &Node::function("sin", vec![Node::named("PI")])),
        Err(ExpressionError::UnrecognizedVariable { name, .. }) if name == "PI"
    ));
}

#[test]
fn test_compiler_resolves_each_variable_once() {
    let lookups = Rc::new(Cell::new(0));
    let counter = lookups.clone();
    let vin = VariableSource::new(3.0);
    let source = vin.clone();

    let mut compiler = Compiler::<RealDomain>::default();
    compiler
        .resolution_mut()
        .push_variable(move |variable: &VariableNode| {
            counter.set(counter.get() + 1);
            (variable.name() == "in").then(|| source.clone())
        });

    let a = Node::voltage("in");
    let node = a.clone() * a.clone() + a;
    let f = compiler.compile(&node).unwrap();
    assert_eq!(lookups.get(), 1);
    assert_eq!(f.program().references().len(), 1);

    for _ in 0..3 {
        assert_eq!(f.invoke(), 12.0);
    }
    vin.set(1.0);
    assert_eq!(f.invoke(), 2.0);
    assert_eq!(lookups.get(), 1);

    // The interpreter asks on every visit.
    let evaluator = Evaluator::new(compiler.resolution().clone());
    assert_eq!(evaluator.evaluate(&node).unwrap(), 2.0);
    assert_eq!(lookups.get(), 4);
}

#[test]
fn test_lifted_resolution() {
    let mut variables = VariableTable::<f64>::default();
    let x = variables.define(&VariableNode::named("x"), 1.5);
    let mut functions = FunctionTable::<f64>::default();
    functions.define("gain", |args| 10.0 * args[0]);
    let real = Resolution::<RealDomain>::standard()
        .with_variable(variables)
        .with_function(functions);

    let node = Node::function("gain", vec![Node::named("x")])
        + Node::function("sqrt", vec![Node::constant(-4.0)]);
    let f = Compiler::new(real.lift()).compile(&node).unwrap();
    assert!((f.invoke() - Complex64::new(15.0, 2.0)).norm() < 1e-12);
    x.set(0.5);
    assert!((f.invoke() - Complex64::new(5.0, 2.0)).norm() < 1e-12);
    assert!(!f.is_native());
}

#[test]
fn test_lifted_aliases_are_captured_once() {
    let mut variables = VariableTable::<f64>::default();
    let out = variables.define(&VariableNode::voltage("out"), 2.0);
    let real = Resolution::<RealDomain>::standard().with_variable(variables);

    let node = Node::voltage("out") + Node::voltage("OUT");
    let f = Compiler::new(real.lift()).compile(&node).unwrap();
    assert_eq!(f.program().references().len(), 1);
    assert_eq!(f.invoke(), Complex64::new(4.0, 0.0));
    out.set(-1.0);
    assert_eq!(f.invoke(), Complex64::new(-2.0, 0.0));

    let f = Compiler::new(real).compile(&node).unwrap();
    assert_eq!(f.program().references().len(), 1);
}

/// Emits `double(x)` inline as `x * 2` and interprets it through an external function.
struct Double;

impl FunctionResolver<RealDomain> for Double {
    fn resolve(&self, call: &FunctionNode) -> Result<Option<Binding<f64>>> {
        if call.name() != "double" {
            return Ok(None);
        }
        let function: ExternalFunction<f64> = Rc::new(|args: &[f64]| 2.0 * args[0]);
        Ok(Some(Binding::External(function)))
    }

    fn emit(&self, call: &FunctionNode, emitter: &mut Emitter<'_, RealDomain>) -> Result<bool> {
        if call.name() != "double" || call.args().len() != 1 {
            return Ok(false);
        }
        emitter.emit(&call.args()[0])?;
        emitter.constant(2.0);
        emitter.push(Instr::Binary(BinaryOp::Mul));
        Ok(true)
    }
}

#[test]
fn test_custom_emission() {
    let mut variables = VariableTable::<f64>::default();
    let x = variables.define(&VariableNode::named("x"), 3.0);
    let resolution = Resolution::<RealDomain>::standard()
        .with_function(Double)
        .with_variable(variables);

    let node = Node::function("double", vec![Node::named("x") + 1.0]);
    let f = Compiler::new(resolution.clone()).compile(&node).unwrap();
    assert_eq!(f.invoke(), 8.0);
    assert!(f
        .program()
        .code()
        .iter()
        .all(|instr| !matches!(instr, Instr::Call(..))));
    x.set(-1.0);
    assert_eq!(f.invoke(), 0.0);

    assert_eq!(Evaluator::new(resolution).evaluate(&node).unwrap(), 0.0);
}
