//! Symbolic differentiation with sparse derivative maps.
//!
//! [`Deriver::derive`] walks an expression tree and returns, for every variable of interest the
//! expression depends on, the partial derivative as a new tree. Variables with a zero derivative
//! never get an entry, and a subtree whose derivative is zero for every variable yields `None`
//! instead of an empty map. Constant subtrees are recognized from their constant flag and are
//! never descended into.
//!
//! The simplifying constructors in this module ([`add`], [`mul`], [`div`], ...) apply the usual
//! zero/one identities while derivatives are assembled, which keeps derivative trees from
//! growing combinatorially with expression depth. They are public so that derivative rules
//! registered from outside the crate can use them too.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, trace};

use crate::errors::Result;
use crate::expr::{BinaryOp, Expr, FunctionNode, Node, UnaryOp, VariableNode};
use crate::names::{VariableComparer, VariableKey};
use crate::rules::DerivativeRules;

/// Sparse map from variable to partial derivative.
///
/// A variable without an entry has a derivative of exactly zero.
#[derive(Clone)]
pub struct Derivatives {
    comparer: VariableComparer,
    entries: BTreeMap<VariableKey, (VariableNode, Node)>,
}

impl Derivatives {
    fn single(comparer: VariableComparer, key: VariableKey, variable: VariableNode) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(key, (variable, Node::one()));
        Self { comparer, entries }
    }

    fn from_entries(
        comparer: VariableComparer,
        entries: BTreeMap<VariableKey, (VariableNode, Node)>,
    ) -> Option<Self> {
        if entries.is_empty() {
            None
        } else {
            Some(Self { comparer, entries })
        }
    }

    /// Transforms every entry, dropping those mapped to zero.
    fn filter_map(self, f: impl Fn(Node) -> Option<Node>) -> Option<Self> {
        let entries = self
            .entries
            .into_iter()
            .filter_map(|(key, (variable, node))| f(node).map(|node| (key, (variable, node))))
            .collect();
        Self::from_entries(self.comparer, entries)
    }

    fn get_key(&self, key: &VariableKey) -> Option<&Node> {
        self.entries.get(key).map(|(_, node)| node)
    }

    /// The derivative with respect to `variable`, `None` if it is zero.
    pub fn get(&self, variable: &VariableNode) -> Option<&Node> {
        self.get_key(&self.comparer.key(variable))
    }

    pub fn contains(&self, variable: &VariableNode) -> bool {
        self.get(variable).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Variables with a nonzero derivative.
    pub fn variables(&self) -> impl Iterator<Item = &VariableNode> {
        self.entries.values().map(|(variable, _)| variable)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VariableNode, &Node)> {
        self.entries.values().map(|(variable, node)| (variable, node))
    }
}

impl IntoIterator for Derivatives {
    type Item = (VariableNode, Node);
    type IntoIter = std::collections::btree_map::IntoValues<VariableKey, (VariableNode, Node)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl fmt::Debug for Derivatives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Combines two sparse maps key by key.
///
/// Keys present in only one map go through `left_only`/`right_only`, keys present in both
/// through `both`. Results of `None` are dropped.
pub fn combine<L, R, B>(
    left: Option<Derivatives>,
    right: Option<Derivatives>,
    left_only: L,
    right_only: R,
    both: B,
) -> Option<Derivatives>
where
    L: Fn(Node) -> Option<Node>,
    R: Fn(Node) -> Option<Node>,
    B: Fn(Node, Node) -> Option<Node>,
{
    match (left, right) {
        (None, None) => None,
        (Some(left), None) => left.filter_map(left_only),
        (None, Some(right)) => right.filter_map(right_only),
        (Some(left), Some(right)) => {
            let comparer = left.comparer;
            let mut remaining = right.entries;
            let mut entries = BTreeMap::new();
            for (key, (variable, l)) in left.entries {
                let combined = match remaining.remove(&key) {
                    Some((_, r)) => both(l, r),
                    None => left_only(l),
                };
                if let Some(node) = combined {
                    entries.insert(key, (variable, node));
                }
            }
            for (key, (variable, r)) in remaining {
                if let Some(node) = right_only(r) {
                    entries.insert(key, (variable, node));
                }
            }
            Derivatives::from_entries(comparer, entries)
        }
    }
}

/// Sum of two optional terms, `None` standing for zero.
pub fn add(a: Option<Node>, b: Option<Node>) -> Option<Node> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(a), Some(b)) => match (a.as_constant(), b.as_constant()) {
            (Some(x), Some(y)) => nonzero(x + y),
            _ => Some(Node::add(a, b)),
        },
    }
}

/// Difference of two optional terms, `None` standing for zero. Equal terms cancel.
pub fn sub(a: Option<Node>, b: Option<Node>) -> Option<Node> {
    match (a, b) {
        (x, None) => x,
        (None, Some(b)) => Some(neg(&b)),
        (Some(a), Some(b)) => match (a.as_constant(), b.as_constant()) {
            (Some(x), Some(y)) => nonzero(x - y),
            _ if a == b => None,
            _ => Some(Node::sub(a, b)),
        },
    }
}

pub fn neg(a: &Node) -> Node {
    match a.expr() {
        Expr::Constant(value) => Node::constant(-value),
        Expr::Unary(UnaryOp::Minus, inner) => inner.clone(),
        _ => Node::minus(a.clone()),
    }
}

/// Product; zero if either factor is the zero literal.
pub fn mul(a: &Node, b: &Node) -> Option<Node> {
    if a.is_zero() || b.is_zero() {
        return None;
    }
    if a.is_one() {
        return Some(b.clone());
    }
    if b.is_one() {
        return Some(a.clone());
    }
    match (a.as_constant(), b.as_constant()) {
        (Some(x), Some(y)) => nonzero(x * y),
        _ => Some(Node::mul(a.clone(), b.clone())),
    }
}

/// Quotient; zero if the numerator is the zero literal.
pub fn div(a: &Node, b: &Node) -> Option<Node> {
    if a.is_zero() {
        return None;
    }
    if b.is_one() {
        return Some(a.clone());
    }
    match (a.as_constant(), b.as_constant()) {
        (Some(x), Some(y)) if y != 0.0 => nonzero(x / y),
        _ => Some(Node::div(a.clone(), b.clone())),
    }
}

/// Chain rule step: `outer * inner`.
pub fn chain(outer: &Node, inner: &Node) -> Option<Node> {
    mul(outer, inner)
}

/// `condition ? if_true : if_false` with zero standing in for a missing branch.
pub fn select(condition: &Node, if_true: Option<Node>, if_false: Option<Node>) -> Option<Node> {
    if if_true.is_none() && if_false.is_none() {
        return None;
    }
    Some(Node::ternary(
        condition.clone(),
        if_true.unwrap_or_else(Node::zero),
        if_false.unwrap_or_else(Node::zero),
    ))
}

fn raise(base: &Node, exponent: Node) -> Node {
    match exponent.as_constant() {
        Some(e) if e == 0.0 => Node::one(),
        Some(e) if e == 1.0 => base.clone(),
        _ => Node::pow(base.clone(), exponent),
    }
}

/// Generalized power rule for `base ^ exponent`.
///
/// `b * f^(b-1) * f'` for a varying base, `f^g * ln(f) * g'` for a varying exponent, and the
/// sum of both when both vary.
pub fn power(
    base: &Node,
    exponent: &Node,
    dbase: Option<&Node>,
    dexponent: Option<&Node>,
) -> Option<Node> {
    let by_base = dbase.and_then(|df| {
        let reduced = match exponent.as_constant() {
            Some(e) => Node::constant(e - 1.0),
            None => Node::sub(exponent.clone(), Node::one()),
        };
        let factor = mul(exponent, &raise(base, reduced))?;
        chain(&factor, df)
    });
    let by_exponent = dexponent.and_then(|dg| {
        let factor = Node::mul(
            Node::pow(base.clone(), exponent.clone()),
            Node::function("log", vec![base.clone()]),
        );
        chain(&factor, dg)
    });
    add(by_base, by_exponent)
}

fn nonzero(value: f64) -> Option<Node> {
    if value == 0.0 {
        None
    } else {
        Some(Node::constant(value))
    }
}

/// Name of the synthetic partial derivative of `function` with respect to argument `index`.
pub fn partial_name(function: &str, index: usize) -> String {
    format!("d{function}({index})")
}

/// Expansion used for functions without a registered rule: `sum_i d<f>(i)(args) * arg_i'`.
fn generic_rule(call: &FunctionNode, dargs: &[Option<Node>]) -> Option<Node> {
    let mut sum = None;
    for (index, darg) in dargs.iter().enumerate() {
        if let Some(darg) = darg {
            let partial = Node::function(partial_name(call.name(), index), call.args().to_vec());
            sum = add(sum, chain(&partial, darg));
        }
    }
    sum
}

/// Differentiates expressions with respect to a fixed set of variables.
#[derive(Debug, Clone)]
pub struct Deriver {
    comparer: VariableComparer,
    variables: BTreeMap<VariableKey, VariableNode>,
    rules: DerivativeRules,
}

impl Deriver {
    /// Creates a deriver for `variables` with case-insensitive names and the standard rules.
    pub fn new(variables: impl IntoIterator<Item = VariableNode>) -> Self {
        let comparer = VariableComparer::default();
        Self {
            variables: Self::index(&comparer, variables),
            comparer,
            rules: DerivativeRules::standard(),
        }
    }

    fn index(
        comparer: &VariableComparer,
        variables: impl IntoIterator<Item = VariableNode>,
    ) -> BTreeMap<VariableKey, VariableNode> {
        let mut index = BTreeMap::new();
        for variable in variables {
            index.entry(comparer.key(&variable)).or_insert(variable);
        }
        index
    }

    /// Switches the name comparison used to identify variables.
    pub fn with_comparer(self, comparer: VariableComparer) -> Self {
        Self {
            variables: Self::index(&comparer, self.variables.into_values()),
            comparer,
            rules: self.rules,
        }
    }

    pub fn with_rules(mut self, rules: DerivativeRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &DerivativeRules {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut DerivativeRules {
        &mut self.rules
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableNode> {
        self.variables.values()
    }

    /// Computes the sparse derivative of `node`.
    ///
    /// Returns `None` if the derivative is zero with respect to every variable of interest.
    pub fn derive(&self, node: &Node) -> Result<Option<Derivatives>> {
        let result = self.derive_node(node)?;
        debug!(
            expression = %node,
            variables = self.variables.len(),
            nonzero = result.as_ref().map_or(0, Derivatives::len),
            "derived expression"
        );
        Ok(result)
    }

    fn derive_node(&self, node: &Node) -> Result<Option<Derivatives>> {
        if node.is_constant() {
            trace!(%node, "constant subtree pruned");
            return Ok(None);
        }
        let result = match node.expr() {
            Expr::Constant(_) | Expr::Property(_) => None,
            Expr::Variable(variable) => {
                let key = self.comparer.key(variable);
                self.variables
                    .get(&key)
                    .map(|v| Derivatives::single(self.comparer, key, v.clone()))
            }
            Expr::Unary(UnaryOp::Plus, operand) => self.derive_node(operand)?,
            Expr::Unary(UnaryOp::Minus, operand) => self
                .derive_node(operand)?
                .and_then(|d| d.filter_map(|n| Some(neg(&n)))),
            Expr::Unary(UnaryOp::Not, _) => None,
            Expr::Binary(op, left, right) => self.derive_binary(*op, left, right)?,
            Expr::Ternary(condition, if_true, if_false) => combine(
                self.derive_node(if_true)?,
                self.derive_node(if_false)?,
                |t| select(condition, Some(t), None),
                |f| select(condition, None, Some(f)),
                |t, f| select(condition, Some(t), Some(f)),
            ),
            Expr::Function(call) => self.derive_function(call)?,
        };
        Ok(result)
    }

    fn derive_binary(&self, op: BinaryOp, left: &Node, right: &Node) -> Result<Option<Derivatives>> {
        let result = match op {
            BinaryOp::Add => combine(
                self.derive_node(left)?,
                self.derive_node(right)?,
                Some,
                Some,
                |a, b| add(Some(a), Some(b)),
            ),
            BinaryOp::Sub => combine(
                self.derive_node(left)?,
                self.derive_node(right)?,
                Some,
                |b| Some(neg(&b)),
                |a, b| sub(Some(a), Some(b)),
            ),
            BinaryOp::Mul => combine(
                self.derive_node(left)?,
                self.derive_node(right)?,
                |df| mul(&df, right),
                |dg| mul(left, &dg),
                |df, dg| add(mul(&df, right), mul(left, &dg)),
            ),
            BinaryOp::Div => {
                let squared = Node::mul(right.clone(), right.clone());
                combine(
                    self.derive_node(left)?,
                    self.derive_node(right)?,
                    |df| div(&df, right),
                    |dg| div(&neg(&mul(left, &dg)?), &squared),
                    |df, dg| {
                        let numerator = sub(mul(&df, right), mul(left, &dg))?;
                        div(&numerator, &squared)
                    },
                )
            }
            BinaryOp::Pow => combine(
                self.derive_node(left)?,
                self.derive_node(right)?,
                |df| power(left, right, Some(&df), None),
                |dg| power(left, right, None, Some(&dg)),
                |df, dg| power(left, right, Some(&df), Some(&dg)),
            ),
            BinaryOp::Mod => self.derive_node(left)?,
            BinaryOp::And
            | BinaryOp::Or
            | BinaryOp::Xor
            | BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::Le
            | BinaryOp::Ge => None,
        };
        Ok(result)
    }

    fn derive_function(&self, call: &FunctionNode) -> Result<Option<Derivatives>> {
        let mut derived = Vec::with_capacity(call.args().len());
        let mut touched: BTreeMap<VariableKey, VariableNode> = BTreeMap::new();
        for arg in call.args() {
            let d = self.derive_node(arg)?;
            if let Some(d) = &d {
                for (key, (variable, _)) in &d.entries {
                    touched
                        .entry(key.clone())
                        .or_insert_with(|| variable.clone());
                }
            }
            derived.push(d);
        }
        if touched.is_empty() {
            return Ok(None);
        }

        let rule = self.rules.get(call.name());
        if rule.is_none() {
            trace!(function = call.name(), "no derivative rule, using partial functions");
        }
        let mut entries = BTreeMap::new();
        for (key, variable) in touched {
            let dargs: Vec<Option<Node>> = derived
                .iter()
                .map(|d| d.as_ref().and_then(|d| d.get_key(&key).cloned()))
                .collect();
            let result = match rule {
                Some(rule) => rule(call, &dargs)?,
                None => generic_rule(call, &dargs),
            };
            if let Some(node) = result {
                entries.insert(key, (variable, node));
            }
        }
        Ok(Derivatives::from_entries(self.comparer, entries))
    }
}

/// Differentiates `node` with respect to `variables` using the default configuration.
pub fn derive(node: &Node, variables: &[VariableNode]) -> Result<Option<Derivatives>> {
    Deriver::new(variables.iter().cloned()).derive(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::NameComparison;

    fn x() -> Node {
        Node::named("x")
    }

    fn deriver() -> Deriver {
        Deriver::new([VariableNode::named("x"), VariableNode::named("y")])
    }

    #[test]
    fn test_constant_is_pruned() {
        let expr = Node::function("sin", vec![Node::constant(2.0)]) * 3.0;
        assert!(deriver().derive(&expr).unwrap().is_none());
    }

    #[test]
    fn test_variable() {
        let d = deriver().derive(&x()).unwrap().unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&VariableNode::named("x")), Some(&Node::one()));
        assert!(deriver().derive(&Node::named("z")).unwrap().is_none());
    }

    #[test]
    fn test_sum_is_sparse() {
        let expr = x() + Node::named("z") * 4.0;
        let d = deriver().derive(&expr).unwrap().unwrap();
        assert!(d.contains(&VariableNode::named("x")));
        assert!(!d.contains(&VariableNode::named("y")));
        assert!(!d.contains(&VariableNode::named("z")));
    }

    #[test]
    fn test_inline_simplification() {
        // d(3*x) = 3, not (0*x + 3*1)
        let d = deriver().derive(&(Node::constant(3.0) * x())).unwrap().unwrap();
        assert_eq!(d.get(&VariableNode::named("x")), Some(&Node::constant(3.0)));

        // d(x - y) with respect to y is the literal -1
        let d = deriver().derive(&(x() - Node::named("y"))).unwrap().unwrap();
        assert_eq!(d.get(&VariableNode::named("y")), Some(&Node::constant(-1.0)));
    }

    #[test]
    fn test_product_rule() {
        let y = Node::named("y");
        let d = deriver().derive(&(x() * y.clone())).unwrap().unwrap();
        assert_eq!(d.get(&VariableNode::named("x")), Some(&y));
        assert_eq!(d.get(&VariableNode::named("y")), Some(&x()));
    }

    #[test]
    fn test_equal_terms_cancel() {
        let y = Node::named("y");
        assert_eq!(sub(Some(y.clone()), Some(y.clone())), None);
        assert_eq!(
            sub(Some(y.clone()), Some(x())),
            Some(Node::sub(y.clone(), x()))
        );
        let term = Node::function("sin", vec![x()]) * y;
        let expr = term.clone() - term;
        assert!(deriver().derive(&expr).unwrap().is_none());
    }

    #[test]
    fn test_relational_is_not_differentiable() {
        let expr = Node::lt(x(), Node::named("y"));
        assert!(deriver().derive(&expr).unwrap().is_none());
        assert!(deriver().derive(&Node::not(x())).unwrap().is_none());
    }

    #[test]
    fn test_ternary_keeps_condition() {
        let condition = Node::gt(Node::named("t"), Node::one());
        let expr = Node::ternary(condition.clone(), x(), Node::named("y"));
        let d = deriver().derive(&expr).unwrap().unwrap();
        assert_eq!(
            d.get(&VariableNode::named("x")),
            Some(&Node::ternary(condition.clone(), Node::one(), Node::zero()))
        );
        assert_eq!(
            d.get(&VariableNode::named("y")),
            Some(&Node::ternary(condition, Node::zero(), Node::one()))
        );
    }

    #[test]
    fn test_modulo_follows_dividend() {
        let expr = Node::modulo(x() * 2.0, Node::named("y"));
        let d = deriver().derive(&expr).unwrap().unwrap();
        assert_eq!(d.get(&VariableNode::named("x")), Some(&Node::constant(2.0)));
        assert!(!d.contains(&VariableNode::named("y")));
    }

    #[test]
    fn test_generic_partial_functions() {
        let expr = Node::function("f", vec![x(), Node::constant(1.0), Node::named("y")]);
        let d = deriver().derive(&expr).unwrap().unwrap();
        let args = vec![x(), Node::constant(1.0), Node::named("y")];
        assert_eq!(
            d.get(&VariableNode::named("x")),
            Some(&Node::function("df(0)", args.clone()))
        );
        assert_eq!(
            d.get(&VariableNode::named("y")),
            Some(&Node::function("df(2)", args))
        );
    }

    #[test]
    fn test_power_with_constant_exponent() {
        let d = deriver().derive(&Node::pow(x(), Node::constant(3.0))).unwrap().unwrap();
        assert_eq!(
            d.get(&VariableNode::named("x")),
            Some(&(Node::constant(3.0) * Node::pow(x(), Node::constant(2.0))))
        );
        let d = deriver().derive(&Node::pow(x(), Node::constant(2.0))).unwrap().unwrap();
        assert_eq!(d.get(&VariableNode::named("x")), Some(&(Node::constant(2.0) * x())));
    }

    #[test]
    fn test_comparer_controls_identity() {
        let expr = Node::voltage("OUT") * 2.0;
        let insensitive = Deriver::new([VariableNode::voltage("out")]);
        assert!(insensitive.derive(&expr).unwrap().is_some());

        let ordinal = insensitive.with_comparer(VariableComparer::uniform(NameComparison::Ordinal));
        assert!(ordinal.derive(&expr).unwrap().is_none());
    }

    #[test]
    fn test_combine_both_absent() {
        let combined = combine(None, None, Some, Some, |a, _| Some(a));
        assert!(combined.is_none());
    }
}
