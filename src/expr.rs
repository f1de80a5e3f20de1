//! Expression module for representing behavioral expressions.
//!
//! This module defines the immutable abstract syntax tree shared by the differentiation
//! engine, the interpreter and the compiler. The main types are:
//!
//! - `Node`: A cheap-to-clone handle on an immutable tree node
//! - `Expr`: The tagged variant stored in each node
//! - `VariableNode`, `FunctionNode`, `PropertyNode`: Payloads of the leaf and call variants
//!
//! # Expression Tree Structure
//! The expression tree is built recursively with each node being one of:
//! - Leaf nodes: Constants, Variables (voltage/current/named) and Properties
//! - Unary operations: `+`, `-`, `!`
//! - Binary operations: arithmetic, modulo, power, logic and comparisons
//! - Ternary conditionals and function calls with ordered arguments
//!
//! Subtrees are shared through reference counting and are never mutated: every
//! transformation allocates new nodes. Each node records at construction whether its
//! subtree is constant, computed from the flags of its children.
//!
//! # Equality
//! Two nodes are equal if they have the same variant and structurally equal children.
//! Constants compare with a relative/absolute tolerance so that values differing only by
//! round-off merge. Hashing ignores constant values entirely, which keeps it consistent with
//! the tolerant equality. Tolerant equality is not transitive across chains of near-equal
//! constants, so be careful when using nodes as map keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops;
use std::rc::Rc;

use itertools::Itertools;

use crate::names::VariableComparer;
use crate::types::Tolerance;

/// The kind of quantity a variable refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableKind {
    /// A node voltage, written `V(name)`
    Voltage,
    /// A branch current, written `I(name)`
    Current,
    /// Any other named quantity (time, temperature, parameters)
    Named,
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableKind::Voltage => write!(f, "voltage"),
            VariableKind::Current => write!(f, "current"),
            VariableKind::Named => write!(f, "named"),
        }
    }
}

/// A reference to a variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableNode {
    name: String,
    kind: VariableKind,
}

impl VariableNode {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn voltage(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Voltage)
    }

    pub fn current(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Current)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Named)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }
}

impl fmt::Display for VariableNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VariableKind::Voltage => write!(f, "V({})", self.name),
            VariableKind::Current => write!(f, "I({})", self.name),
            VariableKind::Named => write!(f, "{}", self.name),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Pow,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Xor => "^^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Pow => "^",
        }
    }

    /// Ordering and equality operators.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }

    /// Operators on thresholded boolean operands.
    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }
}

/// A named function applied to ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionNode {
    name: String,
    args: Vec<Node>,
}

impl FunctionNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Node] {
        &self.args
    }
}

/// Which part of a (possibly complex) property value is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quantity {
    #[default]
    Value,
    Real,
    Imaginary,
    Magnitude,
    Phase,
    Decibels,
}

impl Quantity {
    fn suffix(&self) -> &'static str {
        match self {
            Quantity::Value => "",
            Quantity::Real => ".re",
            Quantity::Imaginary => ".im",
            Quantity::Magnitude => ".mag",
            Quantity::Phase => ".ph",
            Quantity::Decibels => ".db",
        }
    }
}

/// An opaque property request, resolved entirely by the circuit layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyNode {
    entity: String,
    property: String,
    quantity: Quantity,
}

impl PropertyNode {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }
}

/// An expression tree variant.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal value
    Constant(f64),
    /// A voltage, current or named variable
    Variable(VariableNode),
    /// A unary operator applied to an operand
    Unary(UnaryOp, Node),
    /// A binary operator applied to two operands
    Binary(BinaryOp, Node, Node),
    /// `condition ? if_true : if_false`
    Ternary(Node, Node, Node),
    /// A function call
    Function(FunctionNode),
    /// An entity property request
    Property(PropertyNode),
}

struct NodeData {
    expr: Expr,
    constant: bool,
}

/// An immutable, shareable expression node.
///
/// Cloning a node only bumps a reference count.
#[derive(Clone)]
pub struct Node(Rc<NodeData>);

impl Node {
    /// Wraps an expression, computing its constant flag from the already computed flags of
    /// its children.
    pub fn new(expr: Expr) -> Self {
        let constant = match &expr {
            Expr::Constant(_) => true,
            Expr::Variable(_) | Expr::Property(_) => false,
            Expr::Unary(_, operand) => operand.is_constant(),
            Expr::Binary(_, left, right) => left.is_constant() && right.is_constant(),
            Expr::Ternary(condition, if_true, if_false) => {
                condition.is_constant() && if_true.is_constant() && if_false.is_constant()
            }
            Expr::Function(call) => call.args.iter().all(Node::is_constant),
        };
        Node(Rc::new(NodeData { expr, constant }))
    }

    pub fn constant(value: f64) -> Self {
        Self::new(Expr::Constant(value))
    }

    pub fn zero() -> Self {
        Self::constant(0.0)
    }

    pub fn one() -> Self {
        Self::constant(1.0)
    }

    pub fn variable(variable: VariableNode) -> Self {
        Self::new(Expr::Variable(variable))
    }

    pub fn voltage(name: impl Into<String>) -> Self {
        Self::variable(VariableNode::voltage(name))
    }

    pub fn current(name: impl Into<String>) -> Self {
        Self::variable(VariableNode::current(name))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::variable(VariableNode::named(name))
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Self {
        Self::new(Expr::Unary(op, operand))
    }

    pub fn plus(operand: Node) -> Self {
        Self::unary(UnaryOp::Plus, operand)
    }

    pub fn minus(operand: Node) -> Self {
        Self::unary(UnaryOp::Minus, operand)
    }

    pub fn not(operand: Node) -> Self {
        Self::unary(UnaryOp::Not, operand)
    }

    pub fn binary(op: BinaryOp, left: Node, right: Node) -> Self {
        Self::new(Expr::Binary(op, left, right))
    }

    pub fn add(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Add, left, right)
    }

    pub fn sub(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Sub, left, right)
    }

    pub fn mul(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Mul, left, right)
    }

    pub fn div(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Div, left, right)
    }

    pub fn modulo(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Mod, left, right)
    }

    pub fn pow(base: Node, exponent: Node) -> Self {
        Self::binary(BinaryOp::Pow, base, exponent)
    }

    pub fn and(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    pub fn or(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Or, left, right)
    }

    pub fn xor(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Xor, left, right)
    }

    pub fn eq(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    pub fn ne(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Ne, left, right)
    }

    pub fn lt(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Lt, left, right)
    }

    pub fn gt(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Gt, left, right)
    }

    pub fn le(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Le, left, right)
    }

    pub fn ge(left: Node, right: Node) -> Self {
        Self::binary(BinaryOp::Ge, left, right)
    }

    pub fn ternary(condition: Node, if_true: Node, if_false: Node) -> Self {
        Self::new(Expr::Ternary(condition, if_true, if_false))
    }

    pub fn function(name: impl Into<String>, args: Vec<Node>) -> Self {
        Self::new(Expr::Function(FunctionNode {
            name: name.into(),
            args,
        }))
    }

    pub fn property(
        entity: impl Into<String>,
        property: impl Into<String>,
        quantity: Quantity,
    ) -> Self {
        Self::new(Expr::Property(PropertyNode {
            entity: entity.into(),
            property: property.into(),
            quantity,
        }))
    }

    pub fn expr(&self) -> &Expr {
        &self.0.expr
    }

    /// True if no variable or property occurs anywhere in this subtree.
    pub fn is_constant(&self) -> bool {
        self.0.constant
    }

    /// The literal value, if this node is a constant.
    pub fn as_constant(&self) -> Option<f64> {
        match self.expr() {
            Expr::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// True for a literal exactly equal to zero.
    pub fn is_zero(&self) -> bool {
        self.as_constant() == Some(0.0)
    }

    /// True for a literal exactly equal to one.
    pub fn is_one(&self) -> bool {
        self.as_constant() == Some(1.0)
    }

    /// True if both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The direct children of this node, in evaluation order.
    pub fn children(&self) -> Vec<&Node> {
        match self.expr() {
            Expr::Constant(_) | Expr::Variable(_) | Expr::Property(_) => Vec::new(),
            Expr::Unary(_, operand) => vec![operand],
            Expr::Binary(_, left, right) => vec![left, right],
            Expr::Ternary(condition, if_true, if_false) => vec![condition, if_true, if_false],
            Expr::Function(call) => call.args.iter().collect(),
        }
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Node::depth)
            .max()
            .unwrap_or(0)
    }

    /// Distinct variables of this tree in order of first occurrence, compared with `comparer`.
    pub fn variables(&self, comparer: &VariableComparer) -> Vec<VariableNode> {
        let mut seen = std::collections::HashSet::new();
        let mut found = Vec::new();
        self.collect_variables(comparer, &mut seen, &mut found);
        found
    }

    fn collect_variables(
        &self,
        comparer: &VariableComparer,
        seen: &mut std::collections::HashSet<crate::names::VariableKey>,
        found: &mut Vec<VariableNode>,
    ) {
        if let Expr::Variable(variable) = self.expr() {
            if seen.insert(comparer.key(variable)) {
                found.push(variable.clone());
            }
            return;
        }
        for child in self.children() {
            child.collect_variables(comparer, seen, found);
        }
    }

    /// Replaces every subtree matching `predicate` with `replacement`.
    ///
    /// Unchanged subtrees are shared with the original tree.
    pub fn substitute<F>(&self, predicate: &F, replacement: &Node) -> Node
    where
        F: Fn(&Node) -> bool,
    {
        if predicate(self) {
            return replacement.clone();
        }
        let children = self.children();
        if children.is_empty() {
            return self.clone();
        }
        let rebuilt: Vec<Node> = children
            .iter()
            .map(|child| child.substitute(predicate, replacement))
            .collect();
        if rebuilt.iter().zip(&children).all(|(new, old)| new.ptr_eq(old)) {
            return self.clone();
        }
        let mut it = rebuilt.into_iter();
        let mut next = || it.next().unwrap_or_else(Node::zero);
        match self.expr() {
            Expr::Unary(op, _) => Node::unary(*op, next()),
            Expr::Binary(op, _, _) => {
                let left = next();
                Node::binary(*op, left, next())
            }
            Expr::Ternary(..) => {
                let condition = next();
                let if_true = next();
                Node::ternary(condition, if_true, next())
            }
            Expr::Function(call) => {
                let args = (0..call.args.len()).map(|_| next()).collect();
                Node::function(call.name.clone(), args)
            }
            Expr::Constant(_) | Expr::Variable(_) | Expr::Property(_) => self.clone(),
        }
    }

    /// Structural equality with an explicit tolerance for constants.
    pub fn equals(&self, other: &Node, tolerance: &Tolerance) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self.expr(), other.expr()) {
            (Expr::Constant(a), Expr::Constant(b)) => tolerance.approx_eq(*a, *b),
            (Expr::Variable(a), Expr::Variable(b)) => a == b,
            (Expr::Property(a), Expr::Property(b)) => a == b,
            (Expr::Unary(op_a, a), Expr::Unary(op_b, b)) => op_a == op_b && a.equals(b, tolerance),
            (Expr::Binary(op_a, la, ra), Expr::Binary(op_b, lb, rb)) => {
                op_a == op_b && la.equals(lb, tolerance) && ra.equals(rb, tolerance)
            }
            (Expr::Ternary(ca, ta, fa), Expr::Ternary(cb, tb, fb)) => {
                ca.equals(cb, tolerance) && ta.equals(tb, tolerance) && fa.equals(fb, tolerance)
            }
            (Expr::Function(a), Expr::Function(b)) => {
                a.name == b.name
                    && a.args.len() == b.args.len()
                    && a.args.iter().zip(&b.args).all(|(x, y)| x.equals(y, tolerance))
            }
            _ => false,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other, &Tolerance::default())
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self.expr()).hash(state);
        match self.expr() {
            // Values are left out so that tolerant equality implies equal hashes.
            Expr::Constant(_) => {}
            Expr::Variable(variable) => variable.hash(state),
            Expr::Property(property) => property.hash(state),
            Expr::Unary(op, operand) => {
                op.hash(state);
                operand.hash(state);
            }
            Expr::Binary(op, left, right) => {
                op.hash(state);
                left.hash(state);
                right.hash(state);
            }
            Expr::Ternary(condition, if_true, if_false) => {
                condition.hash(state);
                if_true.hash(state);
                if_false.hash(state);
            }
            Expr::Function(call) => {
                call.name.hash(state);
                call.args.hash(state);
            }
        }
    }
}

/// Implements string formatting for expressions.
///
/// - Constants are formatted as numbers, negative ones in parentheses
/// - Voltages and currents use `V(name)` / `I(name)`, named variables their name
/// - Unary operators are written as prefix applied to a parenthesized operand
/// - Binary operators and ternaries are wrapped in parentheses
/// - Functions use call notation
/// - Properties use `@entity[property]`
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expr() {
            Expr::Constant(value) if value.is_sign_negative() => write!(f, "({value})"),
            Expr::Constant(value) => write!(f, "{value}"),
            Expr::Variable(variable) => write!(f, "{variable}"),
            Expr::Unary(op, operand) => write!(f, "{}({operand})", op.symbol()),
            Expr::Binary(op, left, right) => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Ternary(condition, if_true, if_false) => {
                write!(f, "({condition} ? {if_true} : {if_false})")
            }
            Expr::Function(call) => write!(f, "{}({})", call.name, call.args.iter().join(", ")),
            Expr::Property(property) => write!(
                f,
                "@{}[{}]{}",
                property.entity,
                property.property,
                property.quantity.suffix()
            ),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({self})")
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::constant(value)
    }
}

impl From<VariableNode> for Node {
    fn from(variable: VariableNode) -> Self {
        Node::variable(variable)
    }
}

macro_rules! node_operator {
    ($trait:ident, $method:ident, $ctor:ident) => {
        impl<R: Into<Node>> ops::$trait<R> for Node {
            type Output = Node;

            fn $method(self, rhs: R) -> Node {
                Node::$ctor(self, rhs.into())
            }
        }

        impl<R: Into<Node>> ops::$trait<R> for &Node {
            type Output = Node;

            fn $method(self, rhs: R) -> Node {
                Node::$ctor(self.clone(), rhs.into())
            }
        }
    };
}

node_operator!(Add, add, add);
node_operator!(Sub, sub, sub);
node_operator!(Mul, mul, mul);
node_operator!(Div, div, div);
node_operator!(Rem, rem, modulo);

impl ops::Neg for Node {
    type Output = Node;

    fn neg(self) -> Node {
        Node::minus(self)
    }
}

impl From<&Node> for Node {
    fn from(node: &Node) -> Self {
        node.clone()
    }
}
