//! Registry of per-function derivative rules.
//!
//! A rule receives the original (undifferentiated) call and one entry per argument holding that
//! argument's derivative with respect to a single variable, or `None` where it is zero. It
//! returns the derivative of the whole call, `None` meaning zero.
//!
//! Functions without a rule fall back to the generic partial-derivative expansion in
//! [`crate::derivative`], so callers only register rules for functions whose closed form they know.

use std::collections::HashMap;
use std::f64::consts::LN_10;
use std::fmt;
use std::rc::Rc;

use crate::derivative::{add, chain, div, mul, power, select, sub};
use crate::errors::{ExpressionError, Result};
use crate::expr::{FunctionNode, Node};
use crate::functions::Builtin;
use crate::names::NameComparison;

/// A derivative rule for one function name.
pub type DerivativeRule = Rc<dyn Fn(&FunctionNode, &[Option<Node>]) -> Result<Option<Node>>>;

/// Derivative rules keyed by function name.
#[derive(Clone)]
pub struct DerivativeRules {
    comparison: NameComparison,
    rules: HashMap<String, DerivativeRule>,
}

impl Default for DerivativeRules {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for DerivativeRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.rules.keys().collect();
        names.sort();
        f.debug_struct("DerivativeRules")
            .field("comparison", &self.comparison)
            .field("rules", &names)
            .finish()
    }
}

impl DerivativeRules {
    /// An empty registry: every function goes through the generic expansion.
    pub fn empty() -> Self {
        Self {
            comparison: NameComparison::default(),
            rules: HashMap::new(),
        }
    }

    /// Rules for every built-in function.
    pub fn standard() -> Self {
        let mut rules = Self::empty();
        for builtin in Builtin::ALL {
            let rule = builtin_rule(*builtin);
            for name in builtin.names() {
                rules.insert(name, rule.clone());
            }
        }
        rules
    }

    /// Adds or replaces the rule for `name`.
    pub fn register<F>(&mut self, name: &str, rule: F)
    where
        F: Fn(&FunctionNode, &[Option<Node>]) -> Result<Option<Node>> + 'static,
    {
        self.insert(name, Rc::new(rule));
    }

    fn insert(&mut self, name: &str, rule: DerivativeRule) {
        let key = self.comparison.normalize(name).into_owned();
        self.rules.insert(key, rule);
    }

    pub fn get(&self, name: &str) -> Option<&DerivativeRule> {
        self.rules.get(self.comparison.normalize(name).as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn name_comparison(&self) -> NameComparison {
        self.comparison
    }

    /// Copies this registry under a different name comparison.
    pub fn with_name_comparison(&self, comparison: NameComparison) -> Self {
        let mut copy = Self {
            comparison,
            rules: HashMap::with_capacity(self.rules.len()),
        };
        for (name, rule) in &self.rules {
            copy.insert(name, rule.clone());
        }
        copy
    }
}

fn rule<F>(f: F) -> DerivativeRule
where
    F: Fn(&FunctionNode, &[Option<Node>]) -> Result<Option<Node>> + 'static,
{
    Rc::new(f)
}

fn expect_args(call: &FunctionNode, expected: usize) -> Result<()> {
    if call.args().len() != expected {
        return Err(ExpressionError::ArgumentCountMismatch {
            name: call.name().to_string(),
            expected,
            actual: call.args().len(),
        });
    }
    Ok(())
}

fn call_node(call: &FunctionNode) -> Node {
    Node::function(call.name(), call.args().to_vec())
}

fn f(name: &str, x: &Node) -> Node {
    Node::function(name, vec![x.clone()])
}

fn sq(x: &Node) -> Node {
    Node::mul(x.clone(), x.clone())
}

/// Chain rule for a single-argument function with outer derivative `outer(x)`.
fn unary(outer: fn(&Node, &FunctionNode) -> Node) -> DerivativeRule {
    rule(move |call, d| {
        expect_args(call, 1)?;
        let x = &call.args()[0];
        Ok(d[0].as_ref().and_then(|dx| chain(&outer(x, call), dx)))
    })
}

fn zero() -> DerivativeRule {
    rule(|_, _| Ok(None))
}

/// Derivative of `min`/`max`: the derivative of whichever argument equals the result.
fn selection(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    if call.args().is_empty() {
        return Err(ExpressionError::ArgumentCountMismatch {
            name: call.name().to_string(),
            expected: 1,
            actual: 0,
        });
    }
    let result = call_node(call);
    let last = call.args().len() - 1;
    let mut acc = d[last].clone();
    for i in (0..last).rev() {
        let condition = Node::eq(call.args()[i].clone(), result.clone());
        acc = select(&condition, d[i].clone(), acc);
    }
    Ok(acc)
}

fn limit_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    expect_args(call, 3)?;
    let (x, a, b) = (&call.args()[0], &call.args()[1], &call.args()[2]);
    let ordered = Node::le(a.clone(), b.clone());
    let lower = select(&ordered, d[1].clone(), d[2].clone());
    let upper = select(&ordered, d[2].clone(), d[1].clone());
    let below = Node::lt(x.clone(), f2("min", a, b));
    let above = Node::gt(x.clone(), f2("max", a, b));
    Ok(select(&below, lower, select(&above, upper, d[0].clone())))
}

fn f2(name: &str, a: &Node, b: &Node) -> Node {
    Node::function(name, vec![a.clone(), b.clone()])
}

fn pwr_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    expect_args(call, 2)?;
    let (x, y) = (&call.args()[0], &call.args()[1]);
    let magnitude = f("abs", x);
    let by_base = d[0].as_ref().and_then(|dx| {
        let factor = mul(y, &Node::pow(magnitude.clone(), Node::sub(y.clone(), Node::one())))?;
        chain(&factor, dx)
    });
    let by_exponent = d[1]
        .as_ref()
        .and_then(|dy| chain(&Node::mul(call_node(call), f("log", &magnitude)), dy));
    Ok(add(by_base, by_exponent))
}

fn atan2_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    expect_args(call, 2)?;
    let (y, x) = (&call.args()[0], &call.args()[1]);
    let numerator = sub(
        d[0].as_ref().and_then(|dy| mul(x, dy)),
        d[1].as_ref().and_then(|dx| mul(y, dx)),
    );
    Ok(numerator.and_then(|n| div(&n, &Node::add(sq(x), sq(y)))))
}

fn hypot_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    expect_args(call, 2)?;
    let (a, b) = (&call.args()[0], &call.args()[1]);
    let numerator = add(
        d[0].as_ref().and_then(|da| mul(a, da)),
        d[1].as_ref().and_then(|db| mul(b, db)),
    );
    Ok(numerator.and_then(|n| div(&n, &call_node(call))))
}

fn if_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    expect_args(call, 3)?;
    Ok(select(&call.args()[0], d[1].clone(), d[2].clone()))
}

fn pow_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    expect_args(call, 2)?;
    Ok(power(&call.args()[0], &call.args()[1], d[0].as_ref(), d[1].as_ref()))
}

/// Only the dependence on `x` is differentiated; table points are treated as fixed.
fn pwl_rule(call: &FunctionNode, d: &[Option<Node>]) -> Result<Option<Node>> {
    Builtin::Pwl.check_arity(call.args().len())?;
    let slope = Node::function("dpwl", call.args().to_vec());
    Ok(d[0].as_ref().and_then(|dx| chain(&slope, dx)))
}

fn builtin_rule(builtin: Builtin) -> DerivativeRule {
    match builtin {
        Builtin::Abs => unary(|x, _| f("sgn", x)),
        Builtin::Sqrt => unary(|x, _| Node::div(Node::constant(0.5), f("sqrt", x))),
        Builtin::Exp => unary(|_, call| call_node(call)),
        Builtin::Log => rule(|call, d| {
            expect_args(call, 1)?;
            Ok(d[0].as_ref().and_then(|dx| div(dx, &call.args()[0])))
        }),
        Builtin::Log10 => rule(|call, d| {
            expect_args(call, 1)?;
            let scaled = Node::mul(call.args()[0].clone(), Node::constant(LN_10));
            Ok(d[0].as_ref().and_then(|dx| div(dx, &scaled)))
        }),
        Builtin::Db => rule(|call, d| {
            expect_args(call, 1)?;
            let scaled = Node::mul(call.args()[0].clone(), Node::constant(LN_10 / 20.0));
            Ok(d[0].as_ref().and_then(|dx| div(dx, &scaled)))
        }),
        Builtin::Pow => rule(pow_rule),
        Builtin::Pwr => rule(pwr_rule),
        Builtin::Square => unary(|x, _| Node::mul(Node::constant(2.0), x.clone())),
        Builtin::Sin => unary(|x, _| f("cos", x)),
        Builtin::Cos => unary(|x, _| Node::minus(f("sin", x))),
        Builtin::Tan => unary(|x, _| Node::div(Node::one(), sq(&f("cos", x)))),
        Builtin::Asin => unary(|x, _| {
            Node::div(Node::one(), f("sqrt", &Node::sub(Node::one(), sq(x))))
        }),
        Builtin::Acos => unary(|x, _| {
            Node::div(Node::constant(-1.0), f("sqrt", &Node::sub(Node::one(), sq(x))))
        }),
        Builtin::Atan => unary(|x, _| Node::div(Node::one(), Node::add(Node::one(), sq(x)))),
        Builtin::Atan2 => rule(atan2_rule),
        Builtin::Sinh => unary(|x, _| f("cosh", x)),
        Builtin::Cosh => unary(|x, _| f("sinh", x)),
        Builtin::Tanh => unary(|x, _| Node::sub(Node::one(), sq(&f("tanh", x)))),
        Builtin::Asinh => unary(|x, _| {
            Node::div(Node::one(), f("sqrt", &Node::add(sq(x), Node::one())))
        }),
        Builtin::Acosh => unary(|x, _| {
            Node::div(Node::one(), f("sqrt", &Node::sub(sq(x), Node::one())))
        }),
        Builtin::Atanh => unary(|x, _| Node::div(Node::one(), Node::sub(Node::one(), sq(x)))),
        Builtin::Min | Builtin::Max => rule(selection),
        Builtin::If => rule(if_rule),
        Builtin::Limit => rule(limit_rule),
        Builtin::Hypot => rule(hypot_rule),
        Builtin::Ramp => unary(|x, _| f("u", x)),
        Builtin::Step2 => unary(|x, _| {
            Node::mul(f("u", x), f("u", &Node::sub(Node::one(), x.clone())))
        }),
        Builtin::Pwl => rule(pwl_rule),
        Builtin::Sgn
        | Builtin::Step
        | Builtin::Round
        | Builtin::Ceil
        | Builtin::Floor
        | Builtin::Nint
        | Builtin::Random
        | Builtin::PwlDerivative => zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn call(name: &str, args: Vec<Node>) -> FunctionNode {
        match Node::function(name, args).expr() {
            Expr::Function(call) => call.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_lookup_ignores_case() {
        let rules = DerivativeRules::standard();
        assert!(rules.contains("SIN"));
        assert!(rules.contains("tbl"));
        assert!(!rules.contains("foo"));

        let ordinal = rules.with_name_comparison(NameComparison::Ordinal);
        assert!(ordinal.contains("sin"));
        assert!(!ordinal.contains("SIN"));
    }

    #[test]
    fn test_sin_rule() {
        let rules = DerivativeRules::standard();
        let x = Node::named("x");
        let rule = rules.get("sin").unwrap();
        let result = rule(&call("sin", vec![x.clone()]), &[Some(Node::one())]).unwrap();
        assert_eq!(result, Some(Node::function("cos", vec![x])));
    }

    #[test]
    fn test_step_has_zero_derivative() {
        let rules = DerivativeRules::standard();
        let rule = rules.get("u").unwrap();
        let result = rule(&call("u", vec![Node::named("x")]), &[Some(Node::one())]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_rule_checks_arity() {
        let rules = DerivativeRules::standard();
        let rule = rules.get("sqrt").unwrap();
        let args = vec![Node::named("x"), Node::named("y")];
        let result = rule(&call("sqrt", args), &[Some(Node::one()), None]);
        assert!(matches!(
            result,
            Err(ExpressionError::ArgumentCountMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_register_overrides() {
        let mut rules = DerivativeRules::standard();
        rules.register("SIN", |_, _| Ok(Some(Node::constant(42.0))));
        let rule = rules.get("sin").unwrap();
        let result = rule(&call("sin", vec![Node::named("x")]), &[Some(Node::one())]).unwrap();
        assert_eq!(result, Some(Node::constant(42.0)));
    }
}
