//! The evaluator, the stack executor, native code and the complex domain must agree.

use num_complex::Complex64;
use spice_expr::expr::VariableNode;
use spice_expr::prelude::*;
use spice_expr::resolve::FunctionTable;

fn close(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn real_resolution() -> Resolution<RealDomain> {
    let mut variables = VariableTable::<f64>::default();
    variables.define(&VariableNode::named("x"), 0.7);
    variables.define(&VariableNode::voltage("out"), -1.3);
    let mut functions = FunctionTable::<f64>::default();
    functions.define("mean", |args| args.iter().sum::<f64>() / args.len() as f64);
    Resolution::standard()
        .with_variable(variables)
        .with_function(functions)
}

/// Evaluates `node` with every backend and checks they agree, returning the common value.
fn all_backends(node: &Node) -> f64 {
    let resolution = real_resolution();
    let evaluated = Evaluator::new(resolution.clone()).evaluate(node).unwrap();

    let portable = CompilerOptions {
        native: false,
        ..CompilerOptions::default()
    };
    let unfolded = CompilerOptions {
        fold_constants: false,
        ..CompilerOptions::default()
    };
    for options in [CompilerOptions::default(), portable, unfolded] {
        let f = Compiler::new(resolution.clone())
            .with_options(options)
            .compile(node)
            .unwrap();
        let value = f.invoke();
        assert!(
            close(value, evaluated),
            "{node} with {options:?}: compiled {value}, evaluated {evaluated}"
        );
    }

    let complex = Compiler::new(resolution.lift()).compile(node).unwrap().invoke();
    assert!(
        close(complex.re, evaluated) && complex.im.abs() < 1e-9,
        "{node}: complex {complex}, real {evaluated}"
    );
    evaluated
}

fn c(value: f64) -> Node {
    Node::constant(value)
}

#[test]
fn test_operator_matrix() {
    assert_eq!(all_backends(&(c(2.0) * 3.0 + c(4.0) * 5.0)), 26.0);
    assert!(close(all_backends(&(c(4.0) * 5.0 / 3.0)), 20.0 / 3.0));
    assert_eq!(
        all_backends(&(c(5.0) + Node::minus(Node::minus(c(3.0))))),
        8.0
    );
    assert_eq!(all_backends(&Node::pow(c(3.0), c(2.0))), 9.0);
    assert_eq!(all_backends(&Node::ternary(c(1.0), c(0.25), c(0.75))), 0.25);
    assert_eq!(all_backends(&Node::ternary(c(0.0), c(0.25), c(0.75))), 0.75);
}

#[test]
fn test_operators_on_variables() {
    let x = Node::named("x");
    let out = Node::voltage("OUT");
    let cases = vec![
        x.clone() + out.clone(),
        x.clone() - out.clone(),
        x.clone() * out.clone(),
        x.clone() / out.clone(),
        x.clone() % 0.3,
        Node::pow(x.clone(), c(2.5)),
        Node::plus(out.clone()),
        Node::not(x.clone()),
        Node::and(x.clone(), out.clone()),
        Node::or(x.clone(), out.clone()),
        Node::xor(x.clone(), out.clone()),
        Node::eq(x.clone(), c(0.7)),
        Node::ne(x.clone(), c(0.7)),
        Node::lt(x.clone(), out.clone()),
        Node::gt(x.clone(), out.clone()),
        Node::le(x.clone(), c(0.7)),
        Node::ge(out.clone(), c(0.7)),
        Node::ternary(Node::gt(x.clone(), c(0.5)), out.clone(), x.clone()),
        Node::function("mean", vec![x.clone(), out.clone(), c(3.0)]),
        Node::named("PI") * x.clone(),
    ];
    for node in &cases {
        all_backends(node);
    }
}

#[test]
fn test_every_builtin() {
    let x = Node::named("x");
    let call = |name: &str, args: Vec<Node>| Node::function(name, args);
    let cases = vec![
        call("abs", vec![-x.clone()]),
        call("sgn", vec![-x.clone()]),
        call("sqrt", vec![x.clone()]),
        call("exp", vec![x.clone()]),
        call("log", vec![x.clone()]),
        call("ln", vec![c(2.0)]),
        call("log10", vec![x.clone() * 50.0]),
        call("pow", vec![x.clone(), c(0.5)]),
        call("pwr", vec![-x.clone(), c(0.5)]),
        call("pwrs", vec![x.clone(), c(3.0)]),
        call("square", vec![x.clone()]),
        call("sin", vec![x.clone()]),
        call("cos", vec![x.clone()]),
        call("tan", vec![x.clone()]),
        call("asin", vec![x.clone()]),
        call("acos", vec![x.clone()]),
        call("atan", vec![x.clone()]),
        call("atan2", vec![x.clone(), c(2.0)]),
        call("sinh", vec![x.clone()]),
        call("cosh", vec![x.clone()]),
        call("tanh", vec![x.clone()]),
        call("asinh", vec![x.clone()]),
        call("acosh", vec![x.clone() + 1.0]),
        call("atanh", vec![x.clone() * 0.5]),
        call("min", vec![x.clone(), c(0.2), c(3.0)]),
        call("max", vec![x.clone(), c(0.2), c(3.0)]),
        call("if", vec![x.clone(), c(1.0), c(2.0)]),
        call("limit", vec![x.clone() * 4.0, c(1.0), c(0.0)]),
        call("round", vec![x.clone() * 3.0]),
        call("ceil", vec![x.clone()]),
        call("floor", vec![x.clone() + 1.0]),
        call("nint", vec![x.clone() * 5.0]),
        call("u", vec![x.clone()]),
        call("u2", vec![x.clone()]),
        call("uramp", vec![x.clone() - 1.0]),
        call("hypot", vec![x.clone(), c(2.0)]),
        call("db", vec![x.clone()]),
        call("pwl", vec![x.clone(), c(0.0), c(0.0), c(1.0), c(2.0), c(3.0), c(2.5)]),
        call("table", vec![c(5.0), c(0.0), c(0.0), c(1.0), c(2.0)]),
        call("dpwl", vec![x.clone(), c(0.0), c(0.0), c(1.0), c(2.0)]),
    ];
    for node in &cases {
        all_backends(node);
    }
}

#[test]
fn test_division_near_zero() {
    let zero = Node::named("x") * 0.0;
    let value = all_backends(&(c(1.0) / zero.clone()));
    assert!(close(value, 1e20), "{value}");
    let value = all_backends(&(c(1.0) / Node::minus(zero.clone())));
    assert!(close(value, -1e20), "{value}");
    assert_eq!(all_backends(&(c(1.0) % zero)), 0.0);
}

#[test]
fn test_complex_values() {
    let mut variables = VariableTable::<Complex64>::default();
    let s = variables.define(&VariableNode::named("s"), Complex64::new(0.0, 2.0));
    let resolution = Resolution::<ComplexDomain>::standard().with_variable(variables);
    let compiler = Compiler::new(resolution.clone());
    let evaluator = Evaluator::new(resolution);

    // 1 / (1 + s*RC) with RC = 0.5
    let node = c(1.0) / (c(1.0) + Node::named("s") * 0.5);
    let f = compiler.compile(&node).unwrap();
    let expected = Complex64::new(0.5, -0.5);
    assert!((f.invoke() - expected).norm() < 1e-12);
    assert!((evaluator.evaluate(&node).unwrap() - expected).norm() < 1e-12);

    s.set(Complex64::new(0.0, 0.0));
    assert_eq!(f.invoke(), Complex64::new(1.0, 0.0));

    // min/max keep the whole selected operand.
    s.set(Complex64::new(1.0, 5.0));
    let max = compiler
        .compile(&Node::function("max", vec![Node::named("s"), c(0.5)]))
        .unwrap();
    assert_eq!(max.invoke(), Complex64::new(1.0, 5.0));
}

#[test]
fn test_parsed_expressions() {
    for (text, expected) in [
        ("2*3+4*5", 26.0),
        ("5 - -3", 8.0),
        ("3^2", 9.0),
        ("max(1, 2) + min(4, 3)", 5.0),
        ("V(out) < 0 && x > 0.5", 1.0),
    ] {
        let node = parse(text).unwrap();
        assert_eq!(all_backends(&node), expected, "{text}");
    }
}
