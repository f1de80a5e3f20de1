//! Conversion of evalexpr operator trees into expression [`Node`]s.
//!
//! evalexpr serves as the text front end. Its operator tree is mapped onto the node model:
//!
//! - `V(name)` and `I(name)` become voltage and current variables; the name may be an
//!   identifier or an integer node number
//! - other identifiers become named variables, other calls become function nodes
//! - `true` and `false` become 1 and 0
//! - `^` is the power operator
//!
//! evalexpr has no ternary, exclusive-or, unary plus or property syntax; trees using those
//! can only be built with the [`Node`] constructors.
//!
//! The main entry point is the `parse` function.

use evalexpr::{build_operator_tree, DefaultNumericTypes, Operator, Value};

use crate::errors::ConvertError;
use crate::expr::{BinaryOp, Node, VariableKind, VariableNode};

type Tree = evalexpr::Node<DefaultNumericTypes>;

/// Parses `text` into an expression tree.
pub fn parse(text: &str) -> Result<Node, ConvertError> {
    let tree = build_operator_tree::<DefaultNumericTypes>(text)?;
    build_node(&tree)
}

/// Converts an evalexpr operator tree into a [`Node`].
pub fn build_node(tree: &Tree) -> Result<Node, ConvertError> {
    let children = tree.children();
    match tree.operator() {
        Operator::RootNode => match children {
            [child] => build_node(child),
            _ => Err(ConvertError::RootNode(children.len())),
        },
        Operator::Add => fold(BinaryOp::Add, children),
        Operator::Mul => fold(BinaryOp::Mul, children),
        Operator::Sub => binary(BinaryOp::Sub, children),
        Operator::Div => binary(BinaryOp::Div, children),
        Operator::Mod => binary(BinaryOp::Mod, children),
        Operator::Exp => binary(BinaryOp::Pow, children),
        Operator::Eq => binary(BinaryOp::Eq, children),
        Operator::Neq => binary(BinaryOp::Ne, children),
        Operator::Lt => binary(BinaryOp::Lt, children),
        Operator::Gt => binary(BinaryOp::Gt, children),
        Operator::Leq => binary(BinaryOp::Le, children),
        Operator::Geq => binary(BinaryOp::Ge, children),
        Operator::And => fold(BinaryOp::And, children),
        Operator::Or => fold(BinaryOp::Or, children),
        Operator::Neg => negate(tree),
        Operator::Not => Ok(Node::not(single(tree)?)),
        Operator::Const { value } => constant(value).map(Node::constant),
        Operator::VariableIdentifierRead { identifier } => Ok(Node::named(identifier.as_str())),
        Operator::FunctionIdentifier { identifier } => {
            let args = arguments(children)?;
            match quantity(identifier) {
                Some(kind) => {
                    let name = match args.as_slice() {
                        [arg] => node_name(arg),
                        _ => None,
                    };
                    name.map(|name| Node::variable(VariableNode::new(name, kind)))
                        .ok_or_else(|| ConvertError::QuantityArgument(identifier.to_string()))
                }
                None => {
                    let args = args
                        .iter()
                        .map(|arg| build_node(arg))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Node::function(identifier.as_str(), args))
                }
            }
        }
        operator => Err(ConvertError::UnsupportedOperator(format!("{operator:?}"))),
    }
}

/// Left-folds operators evalexpr may flatten into more than two children.
fn fold(op: BinaryOp, children: &[Tree]) -> Result<Node, ConvertError> {
    let (first, rest) = children
        .split_first()
        .ok_or_else(|| ConvertError::UnsupportedOperator(format!("{op:?} without operands")))?;
    rest.iter().try_fold(build_node(first)?, |acc, child| {
        Ok(Node::binary(op, acc, build_node(child)?))
    })
}

fn binary(op: BinaryOp, children: &[Tree]) -> Result<Node, ConvertError> {
    match children {
        [left, right] => Ok(Node::binary(op, build_node(left)?, build_node(right)?)),
        _ => Err(ConvertError::UnsupportedOperator(format!(
            "{op:?} with {} operand(s)",
            children.len()
        ))),
    }
}

fn single(tree: &Tree) -> Result<Node, ConvertError> {
    match tree.children() {
        [child] => build_node(child),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operand(s)",
            tree.operator(),
            children.len()
        ))),
    }
}

/// A minus sign written directly before a number is part of the literal, while `-(2)` stays
/// a negation of the constant 2.
fn negate(tree: &Tree) -> Result<Node, ConvertError> {
    match tree.children() {
        [child] => match child.operator() {
            Operator::Const { value } => constant(value).map(|value| Node::constant(-value)),
            _ => Ok(Node::minus(build_node(child)?)),
        },
        _ => single(tree).map(Node::minus),
    }
}

fn constant(value: &Value<DefaultNumericTypes>) -> Result<f64, ConvertError> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
    }
}

/// Flattens the parenthesized argument list of a call.
fn arguments(children: &[Tree]) -> Result<Vec<&Tree>, ConvertError> {
    let mut args = Vec::new();
    for child in children {
        match child.operator() {
            Operator::RootNode if child.children().is_empty() => {}
            Operator::RootNode => args.extend(arguments(child.children())?),
            Operator::Tuple => args.extend(child.children()),
            Operator::Const {
                value: Value::Empty,
            } => {}
            _ => args.push(child),
        }
    }
    Ok(args)
}

fn quantity(identifier: &str) -> Option<VariableKind> {
    if identifier.eq_ignore_ascii_case("v") {
        Some(VariableKind::Voltage)
    } else if identifier.eq_ignore_ascii_case("i") {
        Some(VariableKind::Current)
    } else {
        None
    }
}

/// The node or branch name inside `V(...)`/`I(...)`.
fn node_name(tree: &Tree) -> Option<String> {
    match tree.operator() {
        Operator::VariableIdentifierRead { identifier } => Some(identifier.to_string()),
        Operator::Const {
            value: Value::Int(i),
        } => Some(i.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arithmetic() {
        let node = parse("1 + 5 * 5").unwrap();
        assert_eq!(node.to_string(), "(1 + (5 * 5))");
        assert!(node.is_constant());
    }

    #[test]
    fn test_parse_quantities() {
        let node = parse("V(out) * I(vsrc) + v(1)").unwrap();
        assert_eq!(node.to_string(), "((V(out) * I(vsrc)) + V(1))");
        assert!(matches!(
            parse("V(a + b)"),
            Err(ConvertError::QuantityArgument(_))
        ));
    }

    #[test]
    fn test_parse_functions() {
        let node = parse("max(x, 2, sin(y))").unwrap();
        assert_eq!(node.to_string(), "max(x, 2, sin(y))");
        let node = parse("random()").unwrap();
        assert_eq!(node.to_string(), "random()");
    }

    #[test]
    fn test_parse_logic() {
        let node = parse("!(x > 1) && true").unwrap();
        assert_eq!(node.to_string(), "(!((x > 1)) && 1)");
    }

    #[test]
    fn test_round_trip() {
        let x = Node::named("x");
        let original = Node::pow(
            Node::function("sqrt", vec![x.clone() * 2.5 - Node::voltage("in")]),
            Node::constant(2.0),
        ) / Node::minus(x.clone() % 3.0);
        let reparsed = parse(&original.to_string()).unwrap();
        assert_eq!(reparsed, original);
        assert_eq!(reparsed.to_string(), original.to_string());
    }

    #[test]
    fn test_negative_literals() {
        let literal = parse("x * -2").unwrap();
        assert_eq!(literal, Node::named("x") * Node::constant(-2.0));
        assert_eq!(literal.to_string(), "(x * (-2))");

        let negation = parse("-(2)").unwrap();
        assert_eq!(negation, Node::minus(Node::constant(2.0)));
        assert_eq!(negation.to_string(), "-(2)");

        let power = Node::pow(Node::constant(-2.0), Node::constant(2.0));
        assert_eq!(parse(&power.to_string()).unwrap(), power);
        let power = Node::minus(Node::pow(Node::constant(2.0), Node::constant(2.0)));
        assert_eq!(parse(&power.to_string()).unwrap(), power);
    }

    #[test]
    fn test_derivatives_round_trip() {
        let variables = [VariableNode::named("x"), VariableNode::voltage("in")];
        for text in [
            "1 - 3*x",
            "-2.5 * x^3 / V(in)",
            "sin(-x) * exp(-0.5 * x)",
            "sqrt(x) - log(V(in) * -4)",
            "x % -3 + pow(V(in), -2)",
        ] {
            let node = parse(text).unwrap();
            let derivatives = crate::derivative::derive(&node, &variables).unwrap().unwrap();
            for (_, derivative) in derivatives.iter() {
                let printed = derivative.to_string();
                let reparsed = parse(&printed).unwrap();
                assert_eq!(&reparsed, derivative, "{text}: {printed}");
                assert_eq!(reparsed.to_string(), printed);
            }
        }
    }

    #[test]
    fn test_unsupported() {
        assert!(matches!(parse("a = 1"), Err(ConvertError::UnsupportedOperator(_))));
        assert!(matches!(parse("\"text\""), Err(ConvertError::ConstOperator(_))));
        assert!(matches!(parse("1 +"), Err(ConvertError::Parse(_))));
    }
}
